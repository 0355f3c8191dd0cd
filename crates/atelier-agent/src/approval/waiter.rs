//! One-shot rendezvous between a background turn and the user's decision.
//!
//! Signals sent before a waiter registers are lost on purpose: the approval
//! route persists the tool-call status *before* signaling, so a waiter that
//! wakes (or times out) re-reads the row and trusts the database, not the
//! signal.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Approved,
    Rejected,
    Timeout,
}

impl WaitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitOutcome::Approved => "approved",
            WaitOutcome::Rejected => "rejected",
            WaitOutcome::Timeout => "timeout",
        }
    }
}

type Key = (String, String);

pub struct ApprovalWaiter {
    pending: Mutex<HashMap<Key, oneshot::Sender<WaitOutcome>>>,
}

impl ApprovalWaiter {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending approval and wait for the user to decide.
    /// A second registration for the same key replaces the first, which then
    /// resolves as `Timeout`.
    pub async fn register_and_wait(
        &self,
        chat_id: &str,
        tool_call_id: &str,
        timeout: Duration,
    ) -> WaitOutcome {
        let key = (chat_id.to_string(), tool_call_id.to_string());
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key.clone(), tx);

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => WaitOutcome::Timeout,
            Err(_) => {
                log::warn!(
                    "approval timeout for chat_id={} tool_call_id={}",
                    chat_id,
                    tool_call_id
                );
                WaitOutcome::Timeout
            }
        };
        self.pending.lock().remove(&key);
        outcome
    }

    pub fn signal_approved(&self, chat_id: &str, tool_call_id: &str) {
        self.signal(chat_id, tool_call_id, WaitOutcome::Approved);
    }

    pub fn signal_rejected(&self, chat_id: &str, tool_call_id: &str) {
        self.signal(chat_id, tool_call_id, WaitOutcome::Rejected);
    }

    fn signal(&self, chat_id: &str, tool_call_id: &str, outcome: WaitOutcome) {
        let key = (chat_id.to_string(), tool_call_id.to_string());
        if let Some(tx) = self.pending.lock().remove(&key) {
            let _ = tx.send(outcome);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for ApprovalWaiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn approve_signal_wakes_waiter() {
        let waiter = Arc::new(ApprovalWaiter::new());
        let waiter2 = waiter.clone();
        let handle = tokio::spawn(async move {
            waiter2
                .register_and_wait("chat-1", "tc-1", Duration::from_secs(5))
                .await
        });
        // Let the waiter register before signaling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.signal_approved("chat-1", "tc-1");
        assert_eq!(handle.await.unwrap(), WaitOutcome::Approved);
        assert_eq!(waiter.pending_count(), 0);
    }

    #[tokio::test]
    async fn reject_signal_wakes_waiter() {
        let waiter = Arc::new(ApprovalWaiter::new());
        let waiter2 = waiter.clone();
        let handle = tokio::spawn(async move {
            waiter2
                .register_and_wait("chat-1", "tc-2", Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.signal_rejected("chat-1", "tc-2");
        assert_eq!(handle.await.unwrap(), WaitOutcome::Rejected);
    }

    #[tokio::test]
    async fn wait_times_out_without_signal() {
        let waiter = ApprovalWaiter::new();
        let outcome = waiter
            .register_and_wait("chat-1", "tc-3", Duration::from_millis(30))
            .await;
        assert_eq!(outcome, WaitOutcome::Timeout);
        assert_eq!(waiter.pending_count(), 0);
    }

    #[tokio::test]
    async fn signal_before_register_is_lost() {
        let waiter = ApprovalWaiter::new();
        waiter.signal_approved("chat-1", "tc-4");
        let outcome = waiter
            .register_and_wait("chat-1", "tc-4", Duration::from_millis(30))
            .await;
        assert_eq!(outcome, WaitOutcome::Timeout);
    }

    #[tokio::test]
    async fn keys_are_scoped_per_chat_and_call() {
        let waiter = Arc::new(ApprovalWaiter::new());
        let waiter2 = waiter.clone();
        let handle = tokio::spawn(async move {
            waiter2
                .register_and_wait("chat-1", "tc-5", Duration::from_millis(100))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Signal for a different chat must not wake this waiter.
        waiter.signal_approved("chat-2", "tc-5");
        assert_eq!(handle.await.unwrap(), WaitOutcome::Timeout);
    }
}
