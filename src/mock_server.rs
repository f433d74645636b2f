// In-memory stand-in for the upstream venue service.
// Speaks the same JSON shapes as the real endpoints so parsers and classifiers run unchanged.

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use crate::{
    error::ApiError,
    session::Credentials,
    upstream::{BookingForm, RawResponse, RoomQuery, VenueApi, INDEX_PATH},
};

pub const BOOKABLE_TEXT: &str = "可预约";
pub const DAILY_LIMIT_MSG: &str = "每人每天只能预订2次";
pub const TAKEN_MSG: &str = "该场地已被预约";

pub const INDEX_OK_BODY: &str = r#"<html><head><title>体育场馆预约</title>
<script>var pageMeta = {csrfToken: "mock-csrf-token"}; var app = "sportVenue";</script>
</head><body></body></html>"#;

pub const LOGIN_BODY: &str = "<html><title>统一身份认证 登录</title><form id=\"login\"></form></html>";

#[derive(Debug, Clone)]
pub struct MockRoom {
    pub wid: String,
    pub name: String,
    pub hall: String,
    pub bookable: bool,
}

impl MockRoom {
    pub fn open(wid: &str, name: &str) -> Self {
        Self {
            wid: wid.to_string(),
            name: name.to_string(),
            hall: "111".to_string(),
            bookable: true,
        }
    }

    pub fn taken(wid: &str, name: &str) -> Self {
        Self {
            bookable: false,
            ..Self::open(wid, name)
        }
    }
}

pub fn opening_rooms_json(rooms: &[MockRoom]) -> String {
    let rows: Vec<_> = rooms
        .iter()
        .map(|r| {
            json!({
                "WID": r.wid,
                "CDMC": r.name,
                "CGBM": r.hall,
                "disabled": !r.bookable,
                "text": if r.bookable { BOOKABLE_TEXT } else { "已预约" },
            })
        })
        .collect();
    json!({"code": "0", "datas": {"getOpeningRoom": {"rows": rows}}}).to_string()
}

pub fn booking_success_json(order_id: &str) -> String {
    json!({"code": "0", "msg": "成功", "data": {"DHID": order_id}}).to_string()
}

pub fn booking_failure_json(msg: &str) -> String {
    json!({"code": "1", "msg": msg}).to_string()
}

pub struct MockVenueServer {
    index: Mutex<RawResponse>,
    // window label -> rooms currently listed for it
    rooms: Mutex<HashMap<String, Vec<MockRoom>>>,
    // window label -> failure to return instead of rooms
    query_failures: Mutex<HashMap<String, ApiError>>,
    // window label -> raw page served verbatim instead of the JSON listing
    query_pages: Mutex<HashMap<String, RawResponse>>,
    // venue wid -> scripted replies, consumed in order; default is success
    booking_replies: Mutex<HashMap<String, VecDeque<Result<RawResponse, ApiError>>>>,
    booking_attempts: Mutex<Vec<BookingForm>>,
    seen_cookies: Mutex<Vec<String>>,
    query_count: AtomicUsize,
    index_count: AtomicUsize,
    order_seq: AtomicUsize,
    delay_ms: AtomicU64,
}

impl Default for MockVenueServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVenueServer {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(RawResponse::ok(INDEX_OK_BODY)),
            rooms: Mutex::new(HashMap::new()),
            query_failures: Mutex::new(HashMap::new()),
            query_pages: Mutex::new(HashMap::new()),
            booking_replies: Mutex::new(HashMap::new()),
            booking_attempts: Mutex::new(Vec::new()),
            seen_cookies: Mutex::new(Vec::new()),
            query_count: AtomicUsize::new(0),
            index_count: AtomicUsize::new(0),
            order_seq: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
        }
    }

    pub async fn set_index(&self, response: RawResponse) {
        *self.index.lock().await = response;
    }

    pub async fn set_rooms(&self, window: &str, rooms: Vec<MockRoom>) {
        self.rooms.lock().await.insert(window.to_string(), rooms);
    }

    pub async fn fail_window(&self, window: &str, err: ApiError) {
        self.query_failures
            .lock()
            .await
            .insert(window.to_string(), err);
    }

    pub async fn serve_page(&self, window: &str, page: RawResponse) {
        self.query_pages
            .lock()
            .await
            .insert(window.to_string(), page);
    }

    pub async fn heal_window(&self, window: &str) {
        self.query_failures.lock().await.remove(window);
        self.query_pages.lock().await.remove(window);
    }

    pub async fn script_booking(&self, wid: &str, reply: Result<RawResponse, ApiError>) {
        self.booking_replies
            .lock()
            .await
            .entry(wid.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn set_delay(&self, delay_ms: u64) {
        self.delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    pub async fn booking_attempts(&self) -> Vec<BookingForm> {
        self.booking_attempts.lock().await.clone()
    }

    pub async fn seen_cookies(&self) -> Vec<String> {
        self.seen_cookies.lock().await.clone()
    }

    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    pub fn index_count(&self) -> usize {
        self.index_count.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    async fn take_venue(&self, wid: &str) {
        let mut rooms = self.rooms.lock().await;
        for list in rooms.values_mut() {
            for room in list.iter_mut().filter(|r| r.wid == wid) {
                room.bookable = false;
            }
        }
    }
}

#[async_trait]
impl VenueApi for MockVenueServer {
    async fn index_page(&self, creds: &Credentials) -> Result<RawResponse, ApiError> {
        self.index_count.fetch_add(1, Ordering::SeqCst);
        self.seen_cookies.lock().await.push(creds.cookie_header());
        self.simulate_latency().await;
        Ok(self.index.lock().await.clone())
    }

    async fn query_rooms(
        &self,
        creds: &Credentials,
        query: &RoomQuery,
    ) -> Result<RawResponse, ApiError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        self.seen_cookies.lock().await.push(creds.cookie_header());
        self.simulate_latency().await;

        let label = format!("{}-{}", query.start, query.end);
        if let Some(err) = self.query_failures.lock().await.get(&label) {
            return Err(err.clone());
        }
        if let Some(page) = self.query_pages.lock().await.get(&label) {
            return Ok(page.clone());
        }

        let rooms = self.rooms.lock().await;
        let listed = rooms.get(&label).cloned().unwrap_or_default();
        Ok(RawResponse {
            final_url: INDEX_PATH.to_string(),
            ..RawResponse::ok(opening_rooms_json(&listed))
        })
    }

    async fn submit_booking(
        &self,
        creds: &Credentials,
        form: &BookingForm,
    ) -> Result<RawResponse, ApiError> {
        self.seen_cookies.lock().await.push(creds.cookie_header());
        self.booking_attempts.lock().await.push(form.clone());
        self.simulate_latency().await;

        let scripted = self
            .booking_replies
            .lock()
            .await
            .get_mut(&form.venue_wid)
            .and_then(|queue| queue.pop_front());

        match scripted {
            Some(reply) => reply,
            None => {
                let seq = self.order_seq.fetch_add(1, Ordering::SeqCst) + 1;
                self.take_venue(&form.venue_wid).await;
                Ok(RawResponse::ok(booking_success_json(&format!(
                    "ORDER{seq:04}"
                ))))
            }
        }
    }
}
