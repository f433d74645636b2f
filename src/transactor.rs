// Booking Transactor: turns one candidate Slot into a reservation and classifies the reply.
// This is the only place upstream booking messages are inspected.

use std::{fmt, sync::Arc};

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    catalog::Slot,
    config::BookingConfig,
    session::Credentials,
    upstream::{snippet, BookingForm, RawResponse, RoomQuery, VenueApi},
    window::TimeWindow,
};

const DEFAULT_HALL_CODE: &str = "111";

// Message fragments the upstream uses for its terminal booking failures
const DAILY_LIMIT_MARKERS: &[&str] = &["只能预订2次", "已预订2次", "超过限制"];
const ELAPSED_MARKERS: &[&str] = &["已过该预约时间"];
const TAKEN_MARKERS: &[&str] = &["已被预约", "已满员"];
const PERMISSION_MARKERS: &[&str] = &["权限"];
const HTML_SUCCESS_MARKERS: &[&str] = &["成功", "预约完成"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub window: TimeWindow,
    pub venue_name: String,
    pub label: String,
    pub confirmation_id: String,
    pub booked_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    WindowElapsed,
    AlreadyTaken,
    NoPermission,
    Forbidden,
    // Service-side per-requester daily cap. Ends the run as a success.
    DailyLimit,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::WindowElapsed => "booking time for this window has passed",
            RejectReason::AlreadyTaken => "venue already taken",
            RejectReason::NoPermission => "requester lacks booking permission",
            RejectReason::Forbidden => "request forbidden (HTTP 403)",
            RejectReason::DailyLimit => "daily reservation limit reached",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BookingOutcome {
    Confirmed(BookingRecord),
    Rejected { reason: RejectReason, message: String },
    Transient(String),
}

impl BookingOutcome {
    pub fn is_daily_limit(&self) -> bool {
        matches!(
            self,
            BookingOutcome::Rejected {
                reason: RejectReason::DailyLimit,
                ..
            }
        )
    }
}

// Classification of a raw submit reply, before it is tied to a slot
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitReply {
    Confirmed { order_id: String },
    Rejected { reason: RejectReason, message: String },
    Transient(String),
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    code: Value,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

fn code_str(code: &Value) -> String {
    match code {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn reject_reason(message: &str) -> Option<RejectReason> {
    let has = |markers: &[&str]| markers.iter().any(|m| message.contains(m));
    if has(DAILY_LIMIT_MARKERS) {
        Some(RejectReason::DailyLimit)
    } else if has(ELAPSED_MARKERS) {
        Some(RejectReason::WindowElapsed)
    } else if has(TAKEN_MARKERS) {
        Some(RejectReason::AlreadyTaken)
    } else if has(PERMISSION_MARKERS) {
        Some(RejectReason::NoPermission)
    } else {
        None
    }
}

pub fn classify_submit_reply(res: &RawResponse) -> SubmitReply {
    if res.status == 403 {
        return SubmitReply::Rejected {
            reason: RejectReason::Forbidden,
            message: snippet(&res.body, 200),
        };
    }
    if let Err(err) = res.ensure_json_ok() {
        return SubmitReply::Transient(err.to_string());
    }

    let parsed: SubmitResponse = match serde_json::from_str(&res.body) {
        Ok(parsed) => parsed,
        Err(e) => {
            // An HTML page that merely mentions success is not proof of a reservation
            if HTML_SUCCESS_MARKERS.iter().any(|m| res.body.contains(m))
                || res.body.to_lowercase().contains("success")
            {
                warn!(body = %snippet(&res.body, 200), "non-JSON booking reply looks successful, treating as unconfirmed");
                return SubmitReply::Transient("ambiguous non-JSON success page".into());
            }
            return SubmitReply::Transient(format!("unparseable booking reply: {e}"));
        }
    };

    let code = code_str(&parsed.code);
    let message = parsed.msg.unwrap_or_default();

    if code == "0" && message == "成功" {
        let order_id = parsed
            .data
            .as_ref()
            .and_then(|d| d.get("DHID"))
            .map(code_str)
            .unwrap_or_default();
        if order_id.is_empty() {
            return SubmitReply::Transient("success reply without confirmation id".into());
        }
        return SubmitReply::Confirmed { order_id };
    }

    match reject_reason(&message) {
        Some(reason) => SubmitReply::Rejected { reason, message },
        None => SubmitReply::Transient(format!("[{code}] {message}")),
    }
}

pub fn extract_csrf_token(body: &str) -> Option<String> {
    let re = Regex::new(r#"(?i)csrfToken["']?\s*[:=]\s*["']([^"']+)["']"#).ok()?;
    re.captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

// Hall code from the listing when present, otherwise inferred from the venue name
pub fn hall_code_for(slot: &Slot) -> String {
    if !slot.venue_id.trim().is_empty() {
        return slot.venue_id.clone();
    }
    if slot.venue_name.contains("至畅") {
        "104".to_string()
    } else if slot.venue_name.contains("至快") {
        "111".to_string()
    } else {
        DEFAULT_HALL_CODE.to_string()
    }
}

pub fn booking_form(slot: &Slot, config: &BookingConfig, csrf: Option<String>) -> BookingForm {
    let date = config.target_date_str();
    BookingForm {
        order_id: String::new(),
        requester_id: config.requester.id.clone(),
        participants: String::new(),
        requester_name: config.requester.name.clone(),
        hall_code: hall_code_for(slot),
        venue_wid: slot.wid.clone(),
        sport_code: config.sport_code.clone(),
        campus: config.campus.clone(),
        window: slot.window.to_string(),
        date: date.clone(),
        booking_kind: config.booking_kind.clone(),
        starts_at: format!("{date} {}", slot.window.start_str()),
        ends_at: format!("{date} {}", slot.window.end_str()),
        platform: "pc".to_string(),
        token_alias: csrf.clone(),
        csrf_token: csrf,
    }
}

pub struct BookingTransactor {
    api: Arc<dyn VenueApi>,
}

impl BookingTransactor {
    pub fn new(api: Arc<dyn VenueApi>) -> Self {
        Self { api }
    }

    // Visit the app, run a harmless query, then pick up the anti-forgery token.
    // Failures here are logged only; the submit decides the outcome.
    async fn establish_context(
        &self,
        config: &BookingConfig,
        creds: &Credentials,
    ) -> Option<String> {
        if let Err(err) = self.api.index_page(creds).await {
            debug!(error = %err, "context: index visit failed");
        }
        if let Some(first) = config.preferred_windows.first() {
            let query = RoomQuery::for_window(config, first);
            if let Err(err) = self.api.query_rooms(creds, &query).await {
                debug!(error = %err, "context: warm-up query failed");
            }
        }
        match self.api.index_page(creds).await {
            Ok(res) => {
                let token = extract_csrf_token(&res.body);
                debug!(found = token.is_some(), "context: csrf token lookup");
                token
            }
            Err(err) => {
                debug!(error = %err, "context: token page failed");
                None
            }
        }
    }

    pub async fn book(
        &self,
        slot: &Slot,
        config: &BookingConfig,
        creds: &Credentials,
        cancel: &CancellationToken,
        now: NaiveDateTime,
    ) -> BookingOutcome {
        let csrf = self.establish_context(config, creds).await;
        let form = booking_form(slot, config, csrf);

        info!(
            slot = %slot.label(),
            wid = %slot.wid,
            hall = %form.hall_code,
            "submitting reservation"
        );

        // brief pause before submitting; never submit after a stop request
        tokio::select! {
            _ = cancel.cancelled() => {
                return BookingOutcome::Transient("cancelled before submit".into());
            }
            _ = tokio::time::sleep(config.submit_delay()) => {}
        }

        let res = match self.api.submit_booking(creds, &form).await {
            Ok(res) => res,
            Err(err) => {
                error!(slot = %slot.label(), error = %err, "booking request failed");
                return BookingOutcome::Transient(err.to_string());
            }
        };

        match classify_submit_reply(&res) {
            SubmitReply::Confirmed { order_id } => {
                info!(slot = %slot.label(), order = %order_id, "reservation confirmed");
                BookingOutcome::Confirmed(BookingRecord {
                    window: slot.window.clone(),
                    venue_name: slot.venue_name.clone(),
                    label: slot.label(),
                    confirmation_id: order_id,
                    booked_at: now,
                })
            }
            SubmitReply::Rejected { reason, message } => {
                warn!(slot = %slot.label(), %reason, %message, "reservation rejected");
                BookingOutcome::Rejected { reason, message }
            }
            SubmitReply::Transient(msg) => {
                warn!(slot = %slot.label(), reason = %msg, "reservation not confirmed");
                BookingOutcome::Transient(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Requester,
        error::ApiError,
        mock_server::{
            booking_failure_json, booking_success_json, MockVenueServer, DAILY_LIMIT_MSG,
            TAKEN_MSG,
        },
    };
    use chrono::NaiveDate;

    fn reply(body: &str) -> RawResponse {
        RawResponse::ok(body)
    }

    fn slot(wid: &str, name: &str, hall: &str) -> Slot {
        Slot {
            venue_id: hall.into(),
            wid: wid.into(),
            window: "20:00-21:00".parse().unwrap(),
            venue_name: name.into(),
            rank: 0,
        }
    }

    fn config() -> BookingConfig {
        BookingConfig {
            target_date: NaiveDate::from_ymd_opt(2025, 6, 12).unwrap(),
            requester: Requester {
                id: "2300123009".into(),
                name: "Tester".into(),
            },
            submit_delay_ms: 0,
            ..Default::default()
        }
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 11)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_classify_success() {
        assert_eq!(
            classify_submit_reply(&reply(&booking_success_json("D42"))),
            SubmitReply::Confirmed {
                order_id: "D42".into()
            }
        );
        // success discriminant without an id is not trusted
        assert!(matches!(
            classify_submit_reply(&reply(r#"{"code":"0","msg":"成功"}"#)),
            SubmitReply::Transient(_)
        ));
    }

    #[test]
    fn test_classify_terminal_rejections() {
        let cases = [
            (DAILY_LIMIT_MSG, RejectReason::DailyLimit),
            ("预约次数超过限制", RejectReason::DailyLimit),
            ("已过该预约时间", RejectReason::WindowElapsed),
            (TAKEN_MSG, RejectReason::AlreadyTaken),
            ("场地已满员", RejectReason::AlreadyTaken),
            ("您没有预约权限", RejectReason::NoPermission),
        ];
        for (msg, expected) in cases {
            match classify_submit_reply(&reply(&booking_failure_json(msg))) {
                SubmitReply::Rejected { reason, .. } => assert_eq!(reason, expected, "{msg}"),
                other => panic!("{msg}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_classify_transient() {
        assert!(matches!(
            classify_submit_reply(&reply(&booking_failure_json("系统繁忙"))),
            SubmitReply::Transient(_)
        ));
        assert!(matches!(
            classify_submit_reply(&reply("<html>预约完成</html>")),
            SubmitReply::Transient(m) if m.contains("ambiguous")
        ));
        assert!(matches!(
            classify_submit_reply(&RawResponse {
                status: 500,
                ..reply("")
            }),
            SubmitReply::Transient(_)
        ));
        assert!(matches!(
            classify_submit_reply(&RawResponse {
                status: 403,
                ..reply("denied")
            }),
            SubmitReply::Rejected {
                reason: RejectReason::Forbidden,
                ..
            }
        ));
    }

    #[test]
    fn test_extract_csrf_token() {
        assert_eq!(
            extract_csrf_token(r#"var m = {csrfToken: "abc-123"};"#),
            Some("abc-123".into())
        );
        assert_eq!(
            extract_csrf_token(r#"<input name='CSRFTOKEN' value=''> csrftoken='x9'"#),
            Some("x9".into())
        );
        assert_eq!(extract_csrf_token("<html></html>"), None);
    }

    #[test]
    fn test_hall_code() {
        assert_eq!(hall_code_for(&slot("w", "Court", "104")), "104");
        assert_eq!(hall_code_for(&slot("w", "至畅体育馆 3号", "")), "104");
        assert_eq!(hall_code_for(&slot("w", "至快体育馆 1号", "")), "111");
        assert_eq!(hall_code_for(&slot("w", "Court", " ")), "111");
    }

    #[test]
    fn test_booking_form() {
        let form = booking_form(&slot("w1", "Court", "111"), &config(), Some("tok".into()));
        assert_eq!(form.venue_wid, "w1");
        assert_eq!(form.window, "20:00-21:00");
        assert_eq!(form.starts_at, "2025-06-12 20:00");
        assert_eq!(form.ends_at, "2025-06-12 21:00");
        assert_eq!(form.requester_id, "2300123009");

        let value = serde_json::to_value(&form).unwrap();
        assert_eq!(value["csrfToken"], "tok");
        assert_eq!(value["_token"], "tok");

        let bare = serde_json::to_value(booking_form(&slot("w1", "Court", ""), &config(), None)).unwrap();
        assert!(bare.get("csrfToken").is_none());
    }

    #[tokio::test]
    async fn test_book_confirms_and_sends_token() {
        let server = Arc::new(MockVenueServer::new());
        let transactor = BookingTransactor::new(server.clone());
        let cancel = CancellationToken::new();

        let outcome = transactor
            .book(&slot("w1", "Court 1", "111"), &config(), &Credentials::default(), &cancel, now())
            .await;

        match outcome {
            BookingOutcome::Confirmed(record) => {
                assert_eq!(record.window.to_string(), "20:00-21:00");
                assert_eq!(record.label, "20:00-21:00 - Court 1");
                assert_eq!(record.confirmation_id, "ORDER0001");
                assert_eq!(record.booked_at, now());
            }
            other => panic!("expected confirmation, got {other:?}"),
        }

        let attempts = server.booking_attempts().await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].csrf_token.as_deref(), Some("mock-csrf-token"));
        // two index visits plus one warm-up query
        assert_eq!(server.index_count(), 2);
        assert_eq!(server.query_count(), 1);
    }

    #[tokio::test]
    async fn test_book_daily_limit() {
        let server = Arc::new(MockVenueServer::new());
        server
            .script_booking("w1", Ok(RawResponse::ok(booking_failure_json(DAILY_LIMIT_MSG))))
            .await;
        let transactor = BookingTransactor::new(server);

        let outcome = transactor
            .book(
                &slot("w1", "Court 1", "111"),
                &config(),
                &Credentials::default(),
                &CancellationToken::new(),
                now(),
            )
            .await;
        assert!(outcome.is_daily_limit());
    }

    #[tokio::test]
    async fn test_book_network_error_is_transient() {
        let server = Arc::new(MockVenueServer::new());
        server
            .script_booking("w1", Err(ApiError::Network("connection reset".into())))
            .await;
        let transactor = BookingTransactor::new(server);

        let outcome = transactor
            .book(
                &slot("w1", "Court 1", "111"),
                &config(),
                &Credentials::default(),
                &CancellationToken::new(),
                now(),
            )
            .await;
        assert!(matches!(outcome, BookingOutcome::Transient(m) if m.contains("connection reset")));
    }

    #[tokio::test]
    async fn test_cancel_before_submit_skips_request() {
        let server = Arc::new(MockVenueServer::new());
        let transactor = BookingTransactor::new(server.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut cfg = config();
        cfg.submit_delay_ms = 500;
        let outcome = transactor
            .book(&slot("w1", "Court 1", "111"), &cfg, &Credentials::default(), &cancel, now())
            .await;

        assert!(matches!(outcome, BookingOutcome::Transient(_)));
        assert!(server.booking_attempts().await.is_empty());
    }
}
