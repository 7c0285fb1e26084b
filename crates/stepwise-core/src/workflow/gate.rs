//! Scrutiny gates: blocking human approval between steps.
//!
//! The caller supplies an [`Approver`] when starting a run. While a gate is
//! outstanding the whole run is suspended.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Decides whether a gated step may proceed.
pub trait Approver: Send + Sync {
    /// `prompt` is the gate prompt with placeholders already resolved.
    fn approve(&self, step: &str, prompt: &str) -> impl Future<Output = bool> + Send;
}

/// Approves every gate. Used for `--yes` and unattended runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl Approver for AutoApprove {
    async fn approve(&self, _step: &str, _prompt: &str) -> bool {
        true
    }
}

/// Denies every gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDeny;

impl Approver for AutoDeny {
    async fn approve(&self, _step: &str, _prompt: &str) -> bool {
        false
    }
}

/// Adapts a synchronous closure `(step, prompt) -> bool`.
pub struct ApproveWith<F>(pub F);

impl<F> Approver for ApproveWith<F>
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    async fn approve(&self, step: &str, prompt: &str) -> bool {
        (self.0)(step, prompt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Approved,
    Denied,
    /// No answer within the configured gate timeout.
    Expired,
    /// The run was cancelled while waiting; the pending answer is discarded.
    Cancelled,
}

/// Wait for an approval decision, bounded by `timeout` and `cancel`.
pub async fn wait_for_gate<A: Approver>(
    approver: &A,
    step: &str,
    prompt: &str,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> GateOutcome {
    let decision = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, approver.approve(step, prompt))
                .await
                .ok(),
            None => Some(approver.approve(step, prompt).await),
        }
    };

    tokio::select! {
        decision = decision => match decision {
            Some(true) => GateOutcome::Approved,
            Some(false) => GateOutcome::Denied,
            None => GateOutcome::Expired,
        },
        _ = cancel.cancelled() => GateOutcome::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverAnswers;

    impl Approver for NeverAnswers {
        async fn approve(&self, _step: &str, _prompt: &str) -> bool {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn outcomes() {
        let cancel = CancellationToken::new();
        assert_eq!(
            wait_for_gate(&AutoApprove, "s", "ok?", None, &cancel).await,
            GateOutcome::Approved
        );
        assert_eq!(
            wait_for_gate(&AutoDeny, "s", "ok?", None, &cancel).await,
            GateOutcome::Denied
        );
        let picky = ApproveWith(|_: &str, prompt: &str| prompt.contains("yes"));
        assert_eq!(
            wait_for_gate(&picky, "s", "say yes", None, &cancel).await,
            GateOutcome::Approved
        );
        assert_eq!(
            wait_for_gate(&NeverAnswers, "s", "?", Some(Duration::from_millis(20)), &cancel).await,
            GateOutcome::Expired
        );
    }

    #[tokio::test]
    async fn cancellation_discards_a_pending_gate() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        assert_eq!(
            wait_for_gate(&NeverAnswers, "s", "?", None, &cancel).await,
            GateOutcome::Cancelled
        );
    }
}
