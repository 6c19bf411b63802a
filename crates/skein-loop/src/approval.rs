use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use skein_stream::{SkeinError, SkeinErrorCode};
use tokio::sync::oneshot;

/// Caller's answer to a `tool-approval-request` part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub reason: Option<String>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>>;

/// Owns the pending-approvals map for one run.
pub(crate) struct ApprovalBroker {
    pending: PendingMap,
}

impl ApprovalBroker {
    pub(crate) fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn register(&self, approval_id: &str) -> oneshot::Receiver<ApprovalDecision> {
        let (sender, receiver) = oneshot::channel();
        self.pending
            .lock()
            .expect("approvals mutex poisoned")
            .insert(approval_id.to_string(), sender);
        receiver
    }

    pub(crate) fn responder(&self) -> ApprovalResponder {
        ApprovalResponder {
            pending: Arc::clone(&self.pending),
        }
    }
}

/// Caller-side handle delivering approval decisions into a run.
#[derive(Clone)]
pub struct ApprovalResponder {
    pending: PendingMap,
}

impl ApprovalResponder {
    /// Fails fast on an approval id that was never issued or is no longer
    /// pending, rather than guessing an association.
    pub fn respond(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), SkeinError> {
        let sender = self
            .pending
            .lock()
            .expect("approvals mutex poisoned")
            .remove(approval_id)
            .ok_or_else(|| {
                SkeinError::new(
                    SkeinErrorCode::ApprovalUnknown,
                    format!("No pending approval with id '{approval_id}'"),
                )
            })?;

        sender.send(decision).map_err(|_| {
            SkeinError::new(
                SkeinErrorCode::ApprovalUnknown,
                format!("Tool call for approval '{approval_id}' no longer exists"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decisions_reach_the_registered_waiter() {
        let broker = ApprovalBroker::new();
        let receiver = broker.register("approval-1");
        let responder = broker.responder();

        responder
            .respond("approval-1", ApprovalDecision::approve())
            .unwrap();
        assert_eq!(receiver.await.unwrap(), ApprovalDecision::approve());
    }

    #[tokio::test]
    async fn unknown_approval_ids_fail_fast() {
        let broker = ApprovalBroker::new();
        let responder = broker.responder();

        let error = responder
            .respond("approval-9", ApprovalDecision::approve())
            .unwrap_err();
        assert_eq!(error.code, SkeinErrorCode::ApprovalUnknown);
    }

    #[tokio::test]
    async fn responding_twice_fails_the_second_time() {
        let broker = ApprovalBroker::new();
        let _receiver = broker.register("approval-1");
        let responder = broker.responder();

        responder
            .respond("approval-1", ApprovalDecision::deny("nope"))
            .unwrap();
        assert!(responder
            .respond("approval-1", ApprovalDecision::approve())
            .is_err());
    }
}
