//! Client admission policy
//!
//! A server may be configured with a `verify_client` predicate that sees the
//! request's origin, whether the transport is encrypted, and the full request.
//! Predicates can be synchronous or return a future; the handshake stays
//! pending (socket open, nothing written) until the decision resolves.
//!
//! # Example
//!
//! ```ignore
//! use sockudo_ws_server::ServerOptions;
//!
//! let options = ServerOptions::builder()
//!     .port(8080)
//!     .verify_client(|info| info.secure() && info.origin() == Some("https://app.example"))
//!     .build()?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::warn;

use crate::error::{Error, Result};
use crate::request::Request;

/// Boxed error type returned by fallible predicates
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a predicate: admit, decline, or fail
pub type Verdict = std::result::Result<bool, BoxError>;

type VerifyFn = dyn Fn(ClientInfo) -> BoxFuture<'static, Verdict> + Send + Sync + 'static;

/// Request metadata handed to the admission predicate
#[derive(Debug, Clone)]
pub struct ClientInfo {
    origin: Option<String>,
    secure: bool,
    request: Arc<Request>,
}

impl ClientInfo {
    /// Derive admission metadata from a request
    ///
    /// `secure` comes from the transport the request arrived on.
    pub fn new(request: Arc<Request>) -> Self {
        Self {
            origin: request.origin().map(String::from),
            secure: request.is_secure(),
            request,
        }
    }

    /// Value of the `Origin` (or legacy `Sec-WebSocket-Origin`) header
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Whether the client connected over an encrypted transport
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// The raw upgrade request
    pub fn request(&self) -> &Request {
        &self.request
    }
}

/// Optional admission predicate
#[derive(Clone, Default)]
pub struct AdmissionPolicy {
    verify: Option<Arc<VerifyFn>>,
}

impl AdmissionPolicy {
    /// Policy that admits every client
    pub fn allow_all() -> Self {
        Self { verify: None }
    }

    /// Policy backed by a synchronous predicate
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&ClientInfo) -> bool + Send + Sync + 'static,
    {
        Self {
            verify: Some(Arc::new(
                move |info: ClientInfo| -> BoxFuture<'static, Verdict> {
                    let decision = f(&info);
                    Box::pin(async move { Ok(decision) })
                },
            )),
        }
    }

    /// Policy backed by an asynchronous, fallible predicate
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(ClientInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Verdict> + Send + 'static,
    {
        Self {
            verify: Some(Arc::new(
                move |info: ClientInfo| -> BoxFuture<'static, Verdict> {
                    Box::pin(f(info))
                },
            )),
        }
    }

    /// Returns true if a predicate is configured
    pub fn is_configured(&self) -> bool {
        self.verify.is_some()
    }

    /// Decide whether to admit a client
    ///
    /// A declined client or a failing predicate yields
    /// [`Error::AdmissionRejected`]; a predicate that does not answer within
    /// `timeout` yields [`Error::Timeout`]. Both are answered with 401.
    pub async fn decide(&self, info: ClientInfo, timeout: Duration) -> Result<()> {
        let Some(verify) = &self.verify else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, verify(info)).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(Error::AdmissionRejected),
            Ok(Err(e)) => {
                warn!("verify_client failed: {}", e);
                Err(Error::AdmissionRejected)
            }
            Err(_) => {
                warn!("verify_client did not answer within {:?}", timeout);
                Err(Error::Timeout("admission"))
            }
        }
    }
}

impl fmt::Debug for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPolicy")
            .field("configured", &self.is_configured())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn info(raw: &str) -> ClientInfo {
        let (req, _) = Request::parse(raw.as_bytes()).unwrap().unwrap();
        ClientInfo::new(Arc::new(req))
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_client_info() {
        let client = info("GET / HTTP/1.1\r\nOrigin: http://foobarbaz.com\r\n\r\n");
        assert_eq!(client.origin(), Some("http://foobarbaz.com"));
        assert!(!client.secure());
        assert_eq!(client.request().path(), "/");

        assert_eq!(info_without_origin().origin(), None);
    }

    fn info_without_origin() -> ClientInfo {
        info("GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
    }

    #[tokio::test]
    async fn test_no_predicate_admits() {
        let policy = AdmissionPolicy::allow_all();
        assert!(!policy.is_configured());
        assert!(policy.decide(info_without_origin(), TIMEOUT).await.is_ok());
    }

    #[tokio::test]
    async fn test_sync_predicate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let policy = AdmissionPolicy::from_fn(move |info| {
            counter.fetch_add(1, Ordering::SeqCst);
            info.origin() == Some("http://ok.com")
        });

        assert!(
            policy
                .decide(info("GET / HTTP/1.1\r\nOrigin: http://ok.com\r\n\r\n"), TIMEOUT)
                .await
                .is_ok()
        );
        assert!(matches!(
            policy.decide(info_without_origin(), TIMEOUT).await,
            Err(Error::AdmissionRejected)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_async_predicate_error_rejects() {
        let policy =
            AdmissionPolicy::from_async(|_info| async { Err::<bool, BoxError>("boom".into()) });
        assert!(matches!(
            policy.decide(info_without_origin(), TIMEOUT).await,
            Err(Error::AdmissionRejected)
        ));
    }

    #[tokio::test]
    async fn test_async_predicate_timeout_rejects() {
        let policy = AdmissionPolicy::from_async(|_info| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<bool, BoxError>(true)
        });
        let err = policy
            .decide(info_without_origin(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout("admission")));
        assert_eq!(err.status(), Some(http::StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_async_predicate_waits() {
        let policy = AdmissionPolicy::from_async(|info| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<bool, BoxError>(!info.secure())
        });
        assert!(policy.decide(info_without_origin(), TIMEOUT).await.is_ok());
    }
}
