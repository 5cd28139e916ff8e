//! External collaborator interfaces -- cloud, metrics, knowledge base,
//! reasoning service, and the IaC runner.
//!
//! Every call is async with an explicit timeout and a small number of
//! retries with exponential backoff. Exhausted retries surface as a typed
//! [`ClientError`], never a silent no-op.

pub mod cloud;
pub mod iac;
pub mod knowledge;
pub mod metrics;
pub mod reasoning;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("{what} failed after {attempts} attempts: {last}")]
    Exhausted {
        what: String,
        attempts: u32,
        last: String,
    },
}

impl ClientError {
    /// Transient failures are worth retrying; malformed payloads are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Timeout(_) | ClientError::Transport(_) => true,
            ClientError::Status(code) => *code >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout(Duration::from_secs(0))
        } else if let Some(status) = e.status() {
            ClientError::Status(status.as_u16())
        } else {
            ClientError::Transport(e.to_string())
        }
    }
}

/// Run `op` up to `attempts` times, backing off 500ms * 2^(n-1) capped at 5s
/// between tries. Non-transient errors short-circuit.
pub async fn with_retries<T, F, Fut>(
    what: &str,
    attempts: u32,
    op: F,
) -> Result<T, ClientError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut last: Option<ClientError> = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                let backoff_ms = (500u64 * 2u64.pow(attempt - 1)).min(5000);
                warn!(%what, attempt, backoff_ms, error = %e, "transient failure, retrying");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                last = Some(e);
            }
            Err(e) if e.is_transient() => {
                return Err(ClientError::Exhausted {
                    what: what.to_string(),
                    attempts,
                    last: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
    Err(ClientError::Exhausted {
        what: what.to_string(),
        attempts,
        last: last.map(|e| e.to_string()).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out = with_retries("test", 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ClientError::Transport("flaky".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_short_circuit() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = with_retries("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::Malformed("bad json".into())) }
        })
        .await;
        assert!(matches!(out, Err(ClientError::Malformed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_is_typed() {
        let out: Result<(), _> = with_retries("test", 2, || async {
            Err(ClientError::Status(503))
        })
        .await;
        match out {
            Err(ClientError::Exhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }
}
