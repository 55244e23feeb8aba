use std::future::Future;
use std::time::Duration;

use crate::error::{Result, VaultError};

/// Run a collaborator call under a deadline.
///
/// Expiry surfaces as `Transport`; nothing here retries.
pub(crate) async fn with_deadline<T, F>(timeout: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, timeout_ms = timeout.as_millis() as u64, "Call timed out");
            Err(VaultError::Transport(format!(
                "{operation} timed out after {}ms",
                timeout.as_millis()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let value = with_deadline(Duration::from_secs(1), "fast", async { Ok(7u8) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transport_error() {
        let err = with_deadline(Duration::from_millis(50), "slow unwrap", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, VaultError::Transport(_)));
        assert!(err.to_string().contains("slow unwrap timed out"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let err = with_deadline(Duration::from_secs(1), "denied", async {
            Err::<(), _>(VaultError::AccessDenied("403".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, VaultError::AccessDenied(_)));
    }
}
