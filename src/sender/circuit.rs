// ============================================================================
// Circuit Breaker
// ============================================================================
//
// Wraps any ChannelSender. Closed -> Open after a run of consecutive
// failures; Open fails fast (no network call) until the cooldown elapses;
// the first call after cooldown is the Half-Open probe - success closes
// the circuit, failure re-opens it.
//
// ============================================================================

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitConfig;
use crate::sender::{ChannelSender, SendOutcome, SendRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen,
}

pub struct CircuitBreaker {
    inner: Arc<dyn ChannelSender>,
    config: CircuitConfig,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(inner: Arc<dyn ChannelSender>, config: CircuitConfig) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(CircuitState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Decide whether this call may proceed; transitions Open -> HalfOpen
    /// when the cooldown has elapsed.
    fn check(&self) -> Result<(), SendOutcome> {
        let mut state = self.state.lock().expect("circuit state lock poisoned");
        match *state {
            CircuitState::Closed { .. } => Ok(()),
            CircuitState::HalfOpen => Err(SendOutcome::transient(
                "circuit half-open: probe in flight",
            )),
            CircuitState::Open { opened_at } => {
                let cooldown = std::time::Duration::from_millis(self.config.cooldown_ms);
                if opened_at.elapsed() >= cooldown {
                    *state = CircuitState::HalfOpen;
                    info!("Circuit cooldown elapsed, allowing half-open probe");
                    Ok(())
                } else {
                    Err(SendOutcome::transient("circuit open: failing fast"))
                }
            }
        }
    }

    fn record(&self, success: bool) {
        let mut state = self.state.lock().expect("circuit state lock poisoned");
        *state = match (*state, success) {
            (_, true) => CircuitState::Closed {
                consecutive_failures: 0,
            },
            (CircuitState::HalfOpen, false) => {
                warn!("Half-open probe failed, re-opening circuit");
                CircuitState::Open {
                    opened_at: Instant::now(),
                }
            }
            (CircuitState::Closed { consecutive_failures }, false) => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    warn!(
                        consecutive_failures = failures,
                        threshold = self.config.failure_threshold,
                        "Failure threshold reached, opening circuit"
                    );
                    CircuitState::Open {
                        opened_at: Instant::now(),
                    }
                } else {
                    CircuitState::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            (open @ CircuitState::Open { .. }, false) => open,
        };
    }
}

#[async_trait]
impl ChannelSender for CircuitBreaker {
    async fn send(&self, request: &SendRequest) -> SendOutcome {
        if let Err(fail_fast) = self.check() {
            return fail_fast;
        }

        let outcome = self.inner.send(request).await;
        self.record(outcome.success);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Integration, IntegrationStatus};
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    struct ScriptedSender {
        calls: AtomicU32,
        succeed: AtomicBool,
    }

    #[async_trait]
    impl ChannelSender for ScriptedSender {
        async fn send(&self, _request: &SendRequest) -> SendOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed.load(Ordering::SeqCst) {
                SendOutcome::sent(Some("wamid.1".to_string()), None)
            } else {
                SendOutcome::transient("connection refused")
            }
        }
    }

    fn request() -> SendRequest {
        SendRequest {
            integration: Integration {
                id: Uuid::new_v4(),
                company_id: Uuid::new_v4(),
                status: IntegrationStatus::Connected,
                variant: None,
                base_url: "http://localhost".to_string(),
                instance_key: "test".to_string(),
                api_token: "token".to_string(),
                created_at: Utc::now(),
            },
            phone: "5511999887766".to_string(),
            content: "hi".to_string(),
        }
    }

    fn breaker(sender: Arc<ScriptedSender>) -> CircuitBreaker {
        CircuitBreaker::new(
            sender,
            CircuitConfig {
                failure_threshold: 3,
                cooldown_ms: 1000,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures_and_fails_fast() {
        let sender = Arc::new(ScriptedSender {
            calls: AtomicU32::new(0),
            succeed: AtomicBool::new(false),
        });
        let circuit = breaker(sender.clone());
        let req = request();

        for _ in 0..3 {
            assert!(!circuit.send(&req).await.success);
        }
        assert_eq!(sender.calls.load(Ordering::SeqCst), 3);

        // Circuit is now open: further calls never reach the inner sender.
        for _ in 0..5 {
            assert!(!circuit.send(&req).await.success);
        }
        assert_eq!(sender.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_closes_on_success() {
        let sender = Arc::new(ScriptedSender {
            calls: AtomicU32::new(0),
            succeed: AtomicBool::new(false),
        });
        let circuit = breaker(sender.clone());
        let req = request();

        for _ in 0..3 {
            circuit.send(&req).await;
        }
        assert_eq!(sender.calls.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_millis(1001)).await;

        // Cooldown elapsed: the next call is the probe, and it succeeds.
        sender.succeed.store(true, Ordering::SeqCst);
        assert!(circuit.send(&req).await.success);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 4);

        // Closed again: calls flow through.
        assert!(circuit.send(&req).await.success);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let sender = Arc::new(ScriptedSender {
            calls: AtomicU32::new(0),
            succeed: AtomicBool::new(false),
        });
        let circuit = breaker(sender.clone());
        let req = request();

        for _ in 0..3 {
            circuit.send(&req).await;
        }

        tokio::time::advance(Duration::from_millis(1001)).await;

        // Probe fails: circuit re-opens, next call fails fast.
        assert!(!circuit.send(&req).await.success);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 4);
        assert!(!circuit.send(&req).await.success);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 4);
    }
}
