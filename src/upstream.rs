// Upstream venue service boundary: the VenueApi seam and its reqwest implementation

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, COOKIE, ORIGIN, REFERER, USER_AGENT},
    Client, StatusCode,
};
use serde::Serialize;
use tracing::debug;

use crate::{config::BookingConfig, error::ApiError, session::Credentials, window::TimeWindow};

pub const INDEX_PATH: &str = "/qljfwapp/sys/lwSzuCgyy/index.do";
pub const OPENING_ROOM_PATH: &str = "/qljfwapp/sys/lwSzuCgyy/modules/sportVenue/getOpeningRoom.do";
pub const BOOKING_PATH: &str = "/qljfwapp/sys/lwSzuCgyy/sportVenue/insertVenueBookingInfo.do";

// Text that only the CAS login page carries
pub const LOGIN_MARKERS: &[&str] = &["登录", "统一身份认证"];

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36";

// Status, final URL (after redirects) and body of one upstream call
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

impl RawResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            final_url: INDEX_PATH.to_string(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn redirected_to_login(&self) -> bool {
        let url = self.final_url.to_ascii_lowercase();
        url.contains("/login") || url.contains("authserver") || url.contains("cas/login")
    }

    // An HTML page carrying the login markers, whatever the status and URL
    pub fn is_login_page(&self) -> bool {
        self.body.trim_start().starts_with('<')
            && LOGIN_MARKERS.iter().any(|m| self.body.contains(m))
    }

    // Shared status checks for the JSON endpoints.
    pub fn ensure_json_ok(&self) -> Result<(), ApiError> {
        if self.status == StatusCode::TOO_MANY_REQUESTS.as_u16() {
            return Err(ApiError::RateLimited);
        }
        if self.redirected_to_login() || self.status == 401 {
            return Err(ApiError::SessionExpired(format!(
                "redirected to {}",
                self.final_url
            )));
        }
        if self.is_login_page() {
            return Err(ApiError::SessionExpired("login page returned".to_string()));
        }
        if !self.is_success() {
            return Err(ApiError::HttpStatus {
                status_code: self.status,
                message: snippet(&self.body, 200),
            });
        }
        Ok(())
    }
}

pub fn snippet(body: &str, max_chars: usize) -> String {
    body.chars().take(max_chars).collect()
}

// Availability query form for one window (field names are the upstream's)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomQuery {
    #[serde(rename = "XMDM")]
    pub sport_code: String,
    #[serde(rename = "YYRQ")]
    pub date: String,
    #[serde(rename = "YYLX")]
    pub booking_kind: String,
    #[serde(rename = "KSSJ")]
    pub start: String,
    #[serde(rename = "JSSJ")]
    pub end: String,
    #[serde(rename = "XQDM")]
    pub campus: String,
}

impl RoomQuery {
    pub fn for_window(config: &BookingConfig, window: &TimeWindow) -> Self {
        Self {
            sport_code: config.sport_code.clone(),
            date: config.target_date_str(),
            booking_kind: config.booking_kind.clone(),
            start: window.start_str(),
            end: window.end_str(),
            campus: config.campus.clone(),
        }
    }
}

// Reservation submission form
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingForm {
    #[serde(rename = "DHID")]
    pub order_id: String,
    #[serde(rename = "YYRGH")]
    pub requester_id: String,
    #[serde(rename = "CYRS")]
    pub participants: String,
    #[serde(rename = "YYRXM")]
    pub requester_name: String,
    #[serde(rename = "CGDM")]
    pub hall_code: String,
    #[serde(rename = "CDWID")]
    pub venue_wid: String,
    #[serde(rename = "XMDM")]
    pub sport_code: String,
    #[serde(rename = "XQWID")]
    pub campus: String,
    #[serde(rename = "KYYSJD")]
    pub window: String,
    #[serde(rename = "YYRQ")]
    pub date: String,
    #[serde(rename = "YYLX")]
    pub booking_kind: String,
    #[serde(rename = "YYKS")]
    pub starts_at: String,
    #[serde(rename = "YYJS")]
    pub ends_at: String,
    #[serde(rename = "PC_OR_PHONE")]
    pub platform: String,
    #[serde(rename = "csrfToken", skip_serializing_if = "Option::is_none")]
    pub csrf_token: Option<String>,
    #[serde(rename = "_token", skip_serializing_if = "Option::is_none")]
    pub token_alias: Option<String>,
}

// The three upstream calls the core needs. Credentials are passed per call so a
// caller can pin one snapshot across a multi-request operation.
#[async_trait]
pub trait VenueApi: Send + Sync + 'static {
    async fn index_page(&self, creds: &Credentials) -> Result<RawResponse, ApiError>;

    async fn query_rooms(
        &self,
        creds: &Credentials,
        query: &RoomQuery,
    ) -> Result<RawResponse, ApiError>;

    async fn submit_booking(
        &self,
        creds: &Credentials,
        form: &BookingForm,
    ) -> Result<RawResponse, ApiError>;
}

pub struct HttpVenueApi {
    client: Client,
    base_url: String,
    timeout_secs: u64,
}

impl HttpVenueApi {
    pub fn new(config: &BookingConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .default_headers(Self::default_headers(&config.base_url))
            .build()
            .map_err(|e| ApiError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout_secs: config.request_timeout_secs,
        })
    }

    fn default_headers(base_url: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_UA));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9"));
        headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
        if let Ok(origin) = HeaderValue::from_str(base_url) {
            headers.insert(ORIGIN, origin);
        }
        if let Ok(referer) = HeaderValue::from_str(&format!("{base_url}{INDEX_PATH}")) {
            headers.insert(REFERER, referer);
        }
        headers
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn collect(&self, res: reqwest::Response) -> Result<RawResponse, ApiError> {
        let status = res.status().as_u16();
        let final_url = res.url().to_string();
        let body = res
            .text()
            .await
            .map_err(|e| ApiError::from_reqwest(e, self.timeout_secs))?;
        debug!(status, url = %final_url, len = body.len(), "upstream response");
        Ok(RawResponse {
            status,
            final_url,
            body,
        })
    }
}

#[async_trait]
impl VenueApi for HttpVenueApi {
    async fn index_page(&self, creds: &Credentials) -> Result<RawResponse, ApiError> {
        let res = self
            .client
            .get(self.url(INDEX_PATH))
            .header(COOKIE, creds.cookie_header())
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, self.timeout_secs))?;
        self.collect(res).await
    }

    async fn query_rooms(
        &self,
        creds: &Credentials,
        query: &RoomQuery,
    ) -> Result<RawResponse, ApiError> {
        let res = self
            .client
            .post(self.url(OPENING_ROOM_PATH))
            .header(COOKIE, creds.cookie_header())
            .form(query)
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, self.timeout_secs))?;
        self.collect(res).await
    }

    async fn submit_booking(
        &self,
        creds: &Credentials,
        form: &BookingForm,
    ) -> Result<RawResponse, ApiError> {
        let res = self
            .client
            .post(self.url(BOOKING_PATH))
            .header(COOKIE, creds.cookie_header())
            .header(ACCEPT, "*/*")
            .header("Cache-Control", "no-cache")
            .header("Sec-Fetch-Mode", "cors")
            .header("Sec-Fetch-Site", "same-origin")
            .form(form)
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, self.timeout_secs))?;
        self.collect(res).await
    }
}
