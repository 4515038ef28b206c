use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::MeshError;

/// Byte stream returned by a dialer.
pub trait MeshIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> MeshIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type MeshStream = Box<dyn MeshIo>;

/// Deadline and cancellation for one dial.
#[derive(Debug, Clone)]
pub struct DialContext {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl DialContext {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancel(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }
}

/// Capability to open an authenticated stream to a named service.
#[async_trait]
pub trait MeshDialer: Send + Sync {
    /// Resolve one healthy instance of `service` and connect to it.
    ///
    /// Implementations may ignore `ctx`; callers that need the deadline
    /// honored go through [`dial_with_deadline`].
    ///
    /// # Errors
    /// Returns [`MeshError`] describing the failed stage.
    async fn dial(&self, service: &str, ctx: &DialContext) -> Result<MeshStream, MeshError>;
}

/// Dial `service`, bounded by the context deadline and cancellation token.
///
/// # Errors
/// Returns the dialer's error, [`MeshError::DialTimeout`] on expiry, or
/// [`MeshError::Cancelled`] when the token fires first.
pub async fn dial_with_deadline(
    dialer: &dyn MeshDialer,
    service: &str,
    ctx: &DialContext,
) -> Result<MeshStream, MeshError> {
    let span = tracing::debug_span!("mesh_dial", service, timeout = ?ctx.timeout);

    async {
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                tracing::warn!("dial cancelled");
                Err(MeshError::Cancelled { service: service.to_owned() })
            }
            res = tokio::time::timeout(ctx.timeout, dialer.dial(service, ctx)) => match res {
                Ok(Ok(stream)) => {
                    tracing::debug!("dial completed");
                    Ok(stream)
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "dial failed");
                    Err(e)
                }
                Err(_) => {
                    tracing::warn!("dial deadline exceeded");
                    Err(MeshError::DialTimeout {
                        service: service.to_owned(),
                        timeout: ctx.timeout,
                    })
                }
            },
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    struct Pending;

    #[async_trait]
    impl MeshDialer for Pending {
        async fn dial(&self, _service: &str, _ctx: &DialContext) -> Result<MeshStream, MeshError> {
            std::future::pending().await
        }
    }

    struct Duplex;

    #[async_trait]
    impl MeshDialer for Duplex {
        async fn dial(&self, _service: &str, _ctx: &DialContext) -> Result<MeshStream, MeshError> {
            let (client, _server) = tokio::io::duplex(64);
            Ok(Box::new(client))
        }
    }

    struct Refusing;

    #[async_trait]
    impl MeshDialer for Refusing {
        async fn dial(&self, service: &str, _ctx: &DialContext) -> Result<MeshStream, MeshError> {
            Err(MeshError::NoHealthyInstances {
                service: service.to_owned(),
            })
        }
    }

    #[tokio::test]
    async fn hanging_dialer_hits_deadline() {
        let ctx = DialContext::new(Duration::from_millis(50));
        let err = dial_with_deadline(&Pending, "redis", &ctx)
            .await
            .err()
            .unwrap();
        assert!(
            matches!(err, MeshError::DialTimeout { ref service, timeout } if service == "redis" && timeout == Duration::from_millis(50)),
            "{err}"
        );
    }

    #[tokio::test]
    async fn cancelled_token_wins() {
        let ctx = DialContext::new(Duration::from_secs(10));
        ctx.cancel.cancel();
        let err = dial_with_deadline(&Pending, "redis", &ctx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MeshError::Cancelled { .. }), "{err}");
    }

    #[tokio::test]
    async fn successful_dial_passes_through() {
        let ctx = DialContext::new(Duration::from_secs(1));
        assert!(dial_with_deadline(&Duplex, "redis", &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn dialer_error_is_preserved() {
        let ctx = DialContext::new(Duration::from_secs(1));
        let err = dial_with_deadline(&Refusing, "redis", &ctx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MeshError::NoHealthyInstances { .. }), "{err}");
    }
}
