//! In-flight request tracking.
//!
//! Owned by the connection task; nothing here is shared across tasks. Each
//! entry resolves exactly once: on a matching reply, on its deadline, or in
//! the bulk rejection that follows a disconnect.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::frame::remote_error;

pub type CallReply = oneshot::Sender<GatewayResult<Value>>;

/// Deadline horizon for timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

struct Pending {
    method: String,
    timeout: Duration,
    deadline: Instant,
    reply: CallReply,
}

#[derive(Default)]
pub struct Correlator {
    pending: HashMap<String, Pending>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call and return its fresh correlation id.
    pub fn register(&mut self, method: &str, timeout: Duration, reply: CallReply) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.pending.insert(
            id.clone(),
            Pending {
                method: method.to_string(),
                timeout,
                deadline,
                reply,
            },
        );
        id
    }

    /// Settle the entry matching a `res` frame. Returns `false` when no call
    /// with that id is pending, so the frame can be offered elsewhere.
    pub fn resolve(
        &mut self,
        id: &str,
        ok: bool,
        payload: Option<Value>,
        error: Option<&Value>,
    ) -> bool {
        let Some(entry) = self.pending.remove(id) else {
            return false;
        };

        let outcome = if ok {
            Ok(payload.unwrap_or(Value::Null))
        } else {
            Err(remote_error(error))
        };
        if entry.reply.send(outcome).is_err() {
            debug!(method = %entry.method, "caller dropped before gateway reply");
        }
        true
    }

    /// Fail a single call, e.g. when its frame could not be written.
    pub fn fail(&mut self, id: &str, err: GatewayError) {
        if let Some(entry) = self.pending.remove(id) {
            let _ = entry.reply.send(Err(err));
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Reject every call whose deadline has passed. Entries whose caller has
    /// already gone away are dropped at the same time.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now || p.reply.is_closed())
            .map(|(id, _)| id.clone())
            .collect();

        let mut timed_out = 0;
        for id in expired {
            if let Some(entry) = self.pending.remove(&id) {
                if entry.reply.is_closed() {
                    continue;
                }
                timed_out += 1;
                debug!(method = %entry.method, id = %id, "gateway call timed out");
                let _ = entry.reply.send(Err(GatewayError::Timeout {
                    method: entry.method,
                    timeout: entry.timeout,
                }));
            }
        }
        timed_out
    }

    /// Reject everything still pending. Used on disconnect and stop.
    pub fn reject_all(&mut self, err: GatewayError) -> usize {
        let count = self.pending.len();
        for (_, entry) in self.pending.drain() {
            let _ = entry.reply.send(Err(err.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn reply_resolves_matching_call() {
        let mut correlator = Correlator::new();
        let (tx, rx) = oneshot::channel();
        let id = correlator.register("agent", Duration::from_secs(5), tx);

        assert!(!correlator.resolve("other", true, None, None));
        assert!(correlator.resolve(&id, true, Some(json!({"runId": "r1"})), None));
        assert!(correlator.is_empty());
        assert_eq!(rx.await.unwrap(), Ok(json!({"runId": "r1"})));

        // A second reply with the same id is not matched again.
        assert!(!correlator.resolve(&id, true, None, None));
    }

    #[tokio::test]
    async fn error_reply_rejects_with_remote_error() {
        let mut correlator = Correlator::new();
        let (tx, rx) = oneshot::channel();
        let id = correlator.register("agent", Duration::from_secs(5), tx);

        correlator.resolve(&id, false, None, Some(&json!({"code": "E", "message": "bad"})));
        assert_eq!(
            rx.await.unwrap(),
            Err(GatewayError::remote(Some("E".into()), "bad"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_calls_time_out_with_method_name() {
        let mut correlator = Correlator::new();
        let (fast_tx, fast_rx) = oneshot::channel();
        let (slow_tx, _slow_rx) = oneshot::channel();
        correlator.register("status", Duration::from_millis(100), fast_tx);
        correlator.register("agent", Duration::from_secs(10), slow_tx);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(correlator.expire(Instant::now()), 1);
        assert_eq!(correlator.len(), 1);
        assert_eq!(
            fast_rx.await.unwrap(),
            Err(GatewayError::Timeout {
                method: "status".into(),
                timeout: Duration::from_millis(100),
            })
        );
    }

    #[tokio::test]
    async fn unbounded_timeout_is_clamped_instead_of_overflowing() {
        let mut correlator = Correlator::new();
        let (tx, rx) = oneshot::channel();
        let id = correlator.register("agent", Duration::MAX, tx);

        let deadline = correlator.next_deadline().expect("deadline");
        assert!(deadline > Instant::now() + Duration::from_secs(86_400 * 365));
        assert_eq!(correlator.expire(Instant::now()), 0);
        assert_eq!(correlator.len(), 1);

        assert!(correlator.resolve(&id, true, Some(json!({"runId": "r1"})), None));
        assert_eq!(rx.await.unwrap(), Ok(json!({"runId": "r1"})));
    }

    #[tokio::test]
    async fn reject_all_settles_every_call_once() {
        let mut correlator = Correlator::new();
        let receivers: Vec<_> = (0..5)
            .map(|_| {
                let (tx, rx) = oneshot::channel();
                correlator.register("agent", Duration::from_secs(5), tx);
                rx
            })
            .collect();

        assert_eq!(correlator.reject_all(GatewayError::ConnectionLost), 5);
        assert_eq!(correlator.reject_all(GatewayError::ConnectionLost), 0);
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(GatewayError::ConnectionLost));
        }
    }
}
