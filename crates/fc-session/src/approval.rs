use fc_core::types::{ApprovalAction, ApprovalRequest};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval request not found: {0}")]
    NotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, ApprovalError>;

/// Append a new pending approval to a session's queue. Callers decide
/// separately whether this should also drive a state transition (only when
/// the session was RUNNING, per spec §4.1).
pub fn request(
    queue: &mut Vec<ApprovalRequest>,
    session_id: Uuid,
    action: ApprovalAction,
    description: String,
    context: Option<serde_json::Value>,
) -> ApprovalRequest {
    let req = ApprovalRequest::new(session_id, action, description, context);
    queue.push(req.clone());
    req
}

/// Remove a resolved approval from the queue. Returns whether the queue is
/// now empty, which the coordinator uses to decide whether to transition
/// back to RUNNING.
pub fn resolve(queue: &mut Vec<ApprovalRequest>, approval_id: Uuid) -> Result<bool> {
    let before = queue.len();
    queue.retain(|a| a.approval_id != approval_id);
    if queue.len() == before {
        return Err(ApprovalError::NotFound(approval_id));
    }
    Ok(queue.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_unknown_id_errors() {
        let mut q = Vec::new();
        let err = resolve(&mut q, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound(_)));
    }

    #[test]
    fn multiple_pending_only_empties_after_last_resolve() {
        let mut q = Vec::new();
        let sid = Uuid::new_v4();
        let a = request(&mut q, sid, ApprovalAction::Merge, "merge pr".into(), None);
        let b = request(&mut q, sid, ApprovalAction::Deploy, "deploy".into(), None);

        assert!(!resolve(&mut q, a.approval_id).unwrap());
        assert!(resolve(&mut q, b.approval_id).unwrap());
    }
}
