// Session/Auth Guard: advisory check that the current cookies still reach the booking app

use std::{fmt, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    session::Credentials,
    upstream::{snippet, RawResponse, VenueApi, LOGIN_MARKERS},
};

const APP_MARKERS: &[&str] = &["体育场馆", "sportVenue"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryReason {
    Forbidden,
    Unauthorized,
    LoginRedirect,
    LoginPage,
    UnexpectedPage,
    HttpStatus(u16),
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    Valid,
    Expired(ExpiryReason),
}

impl AuthStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, AuthStatus::Valid)
    }
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthStatus::Valid => write!(f, "session valid"),
            AuthStatus::Expired(reason) => match reason {
                ExpiryReason::Forbidden => write!(f, "access denied (HTTP 403)"),
                ExpiryReason::Unauthorized => write!(f, "not logged in (HTTP 401)"),
                ExpiryReason::LoginRedirect => write!(f, "redirected to login"),
                ExpiryReason::LoginPage => write!(f, "login page returned, log in again"),
                ExpiryReason::UnexpectedPage => write!(f, "unexpected page content"),
                ExpiryReason::HttpStatus(code) => write!(f, "HTTP error {code}"),
                ExpiryReason::Unreachable(err) => write!(f, "check failed: {err}"),
            },
        }
    }
}

// Pure classification of an index-page response
pub fn classify_index_page(res: &RawResponse) -> AuthStatus {
    if res.status == 403 {
        return AuthStatus::Expired(ExpiryReason::Forbidden);
    }
    if res.status == 401 {
        return AuthStatus::Expired(ExpiryReason::Unauthorized);
    }
    if res.redirected_to_login() {
        return AuthStatus::Expired(ExpiryReason::LoginRedirect);
    }
    if !res.is_success() {
        return AuthStatus::Expired(ExpiryReason::HttpStatus(res.status));
    }
    if LOGIN_MARKERS.iter().any(|m| res.body.contains(m)) {
        return AuthStatus::Expired(ExpiryReason::LoginPage);
    }
    if APP_MARKERS.iter().any(|m| res.body.contains(m)) {
        return AuthStatus::Valid;
    }
    AuthStatus::Expired(ExpiryReason::UnexpectedPage)
}

pub struct AuthGuard {
    api: Arc<dyn VenueApi>,
}

impl AuthGuard {
    pub fn new(api: Arc<dyn VenueApi>) -> Self {
        Self { api }
    }

    pub async fn check(&self, creds: &Credentials) -> AuthStatus {
        let status = match self.api.index_page(creds).await {
            Ok(res) => {
                debug!(status = res.status, len = res.body.len(), "login check response");
                let status = classify_index_page(&res);
                if !status.is_valid() {
                    debug!(body = %snippet(&res.body, 200), "login check page");
                }
                status
            }
            Err(err) => AuthStatus::Expired(ExpiryReason::Unreachable(err.to_string())),
        };

        match &status {
            AuthStatus::Valid => info!("login state verified"),
            AuthStatus::Expired(_) => warn!(reason = %status, "login state invalid"),
        }
        status
    }

    pub async fn is_authorized(&self, creds: &Credentials) -> bool {
        self.check(creds).await.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ApiError,
        mock_server::{MockVenueServer, INDEX_OK_BODY, LOGIN_BODY},
    };

    fn page(status: u16, url: &str, body: &str) -> RawResponse {
        RawResponse {
            status,
            final_url: url.to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_classify_index_page() {
        let app = "https://ehall.szu.edu.cn/qljfwapp/sys/lwSzuCgyy/index.do";

        assert_eq!(classify_index_page(&page(200, app, INDEX_OK_BODY)), AuthStatus::Valid);
        assert_eq!(
            classify_index_page(&page(403, app, "denied")),
            AuthStatus::Expired(ExpiryReason::Forbidden)
        );
        assert_eq!(
            classify_index_page(&page(
                200,
                "https://authserver.szu.edu.cn/authserver/login?service=x",
                "<html>"
            )),
            AuthStatus::Expired(ExpiryReason::LoginRedirect)
        );
        assert_eq!(
            classify_index_page(&page(200, app, LOGIN_BODY)),
            AuthStatus::Expired(ExpiryReason::LoginPage)
        );
        assert_eq!(
            classify_index_page(&page(200, app, "<html>maintenance</html>")),
            AuthStatus::Expired(ExpiryReason::UnexpectedPage)
        );
        assert_eq!(
            classify_index_page(&page(502, app, "")),
            AuthStatus::Expired(ExpiryReason::HttpStatus(502))
        );
    }

    #[tokio::test]
    async fn test_guard_against_mock() {
        let server = Arc::new(MockVenueServer::new());
        let guard = AuthGuard::new(server.clone());
        let creds = Credentials::parse("JSESSIONID=abc");

        assert!(guard.is_authorized(&creds).await);
        assert_eq!(server.seen_cookies().await, vec!["JSESSIONID=abc".to_string()]);

        server.set_index(RawResponse::ok(LOGIN_BODY)).await;
        assert!(!guard.is_authorized(&creds).await);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_not_authorized() {
        struct Down;

        #[async_trait::async_trait]
        impl VenueApi for Down {
            async fn index_page(&self, _: &Credentials) -> Result<RawResponse, ApiError> {
                Err(ApiError::Timeout(10))
            }
            async fn query_rooms(
                &self,
                _: &Credentials,
                _: &crate::upstream::RoomQuery,
            ) -> Result<RawResponse, ApiError> {
                Err(ApiError::Timeout(10))
            }
            async fn submit_booking(
                &self,
                _: &Credentials,
                _: &crate::upstream::BookingForm,
            ) -> Result<RawResponse, ApiError> {
                Err(ApiError::Timeout(10))
            }
        }

        let guard = AuthGuard::new(Arc::new(Down));
        let status = guard.check(&Credentials::default()).await;
        assert!(matches!(
            status,
            AuthStatus::Expired(ExpiryReason::Unreachable(_))
        ));
    }
}
