//! Approval coordinator.
//!
//! `check` is the gate the execution pipeline consults; `approve` and
//! `deny` are the mutations driven by the human-facing HTTP surface.

use std::sync::Arc;

use chrono::Utc;

use super::{ApprovalError, Request, Status, Store};

/// Coordinates approval state for executions.
pub struct Checker {
    store: Arc<dyn Store>,
    default_approvers: Vec<String>,
}

impl Checker {
    /// Creates a coordinator over a store.
    pub fn new(store: Arc<dyn Store>, default_approvers: Vec<String>) -> Self {
        Self {
            store,
            default_approvers,
        }
    }

    /// Returns the effective gate status for `(execution_id, step_name)`.
    ///
    /// An absent record and an expired record both read as pending — the
    /// caller creates (or re-creates) the record and reports the step
    /// pending.
    pub async fn check(
        &self,
        execution_id: &str,
        step_name: &str,
    ) -> Result<Status, ApprovalError> {
        match self.store.get(execution_id, step_name).await {
            Ok(record) => Ok(match record.status {
                Status::Approved => Status::Approved,
                Status::Denied => Status::Denied,
                Status::Pending | Status::Expired => Status::Pending,
            }),
            Err(ApprovalError::NotFound { .. }) => Ok(Status::Pending),
            Err(err) => Err(err),
        }
    }

    /// Creates a pending record for a step awaiting its first decision.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_request(
        &self,
        execution_id: &str,
        step_name: &str,
        runbook_id: &str,
        user: &str,
        script: &str,
        script_hash: &str,
        approvers: Vec<String>,
    ) -> Result<Request, ApprovalError> {
        let approvers = if approvers.is_empty() {
            self.default_approvers.clone()
        } else {
            approvers
        };
        let mut request = Request {
            id: String::new(),
            execution_id: execution_id.to_string(),
            step_name: step_name.to_string(),
            runbook_id: runbook_id.to_string(),
            user: user.to_string(),
            script: script.to_string(),
            script_hash: script_hash.to_string(),
            approvers,
            status: Status::Pending,
            approved_by: None,
            approved_at: None,
            denied_by: None,
            denied_at: None,
            denial_reason: None,
            created_at: Utc::now(),
            expires_at: Utc::now(),
        };
        self.store.create(&mut request).await?;
        Ok(request)
    }

    /// Lists records still awaiting a decision, oldest first.
    pub async fn list_pending(&self) -> Result<Vec<Request>, ApprovalError> {
        self.store.list_pending().await
    }

    /// Approves a pending request on behalf of `approver`.
    pub async fn approve(
        &self,
        execution_id: &str,
        step_name: &str,
        approver: &str,
    ) -> Result<Request, ApprovalError> {
        let mut request = self.decidable(execution_id, step_name, approver).await?;
        request.status = Status::Approved;
        request.approved_by = Some(approver.to_string());
        request.approved_at = Some(Utc::now());
        self.store.update(&request).await?;
        Ok(request)
    }

    /// Denies a pending request on behalf of `denier`.
    pub async fn deny(
        &self,
        execution_id: &str,
        step_name: &str,
        denier: &str,
        reason: &str,
    ) -> Result<Request, ApprovalError> {
        let mut request = self.decidable(execution_id, step_name, denier).await?;
        request.status = Status::Denied;
        request.denied_by = Some(denier.to_string());
        request.denied_at = Some(Utc::now());
        request.denial_reason = (!reason.is_empty()).then(|| reason.to_string());
        self.store.update(&request).await?;
        Ok(request)
    }

    /// Fetches a record and verifies it can be decided by `user`.
    async fn decidable(
        &self,
        execution_id: &str,
        step_name: &str,
        user: &str,
    ) -> Result<Request, ApprovalError> {
        let request = self.store.get(execution_id, step_name).await?;
        if request.status != Status::Pending {
            return Err(ApprovalError::NotPending(request.status));
        }
        let authorized = request
            .approvers
            .iter()
            .any(|approver| approver.eq_ignore_ascii_case(user));
        if !authorized {
            return Err(ApprovalError::Unauthorized(user.to_string()));
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use crate::approval::ConfigMapStore;
    use crate::cluster::FakeCluster;

    use super::*;

    const NS: &str = "opscontrolroom-system";

    fn checker() -> Checker {
        let store = ConfigMapStore::new(Arc::new(FakeCluster::new()), NS, "script-approvals");
        Checker::new(Arc::new(store), vec!["sre-leads".into()])
    }

    async fn pending_request(checker: &Checker) -> Request {
        checker
            .create_request(
                "exec-1",
                "step-a",
                "rb-1",
                "alice",
                "echo hi",
                "abc",
                vec!["bob".into(), "Carol".into()],
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn absent_record_reads_pending() {
        let checker = checker();
        assert_eq!(
            checker.check("exec-1", "step-a").await.unwrap(),
            Status::Pending
        );
    }

    #[tokio::test]
    async fn approve_flow() {
        let checker = checker();
        pending_request(&checker).await;

        let approved = checker.approve("exec-1", "step-a", "bob").await.unwrap();
        assert_eq!(approved.status, Status::Approved);
        assert_eq!(approved.approved_by.as_deref(), Some("bob"));
        assert_eq!(
            checker.check("exec-1", "step-a").await.unwrap(),
            Status::Approved
        );
    }

    #[tokio::test]
    async fn approver_membership_is_case_insensitive() {
        let checker = checker();
        pending_request(&checker).await;
        let approved = checker.approve("exec-1", "step-a", "carol").await.unwrap();
        assert_eq!(approved.approved_by.as_deref(), Some("carol"));
    }

    #[tokio::test]
    async fn unauthorized_user_rejected_and_record_stays_pending() {
        let checker = checker();
        pending_request(&checker).await;
        let err = checker
            .approve("exec-1", "step-a", "mallory")
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Unauthorized(_)));
        assert_eq!(
            checker.check("exec-1", "step-a").await.unwrap(),
            Status::Pending
        );
    }

    #[tokio::test]
    async fn second_approve_is_not_pending() {
        let checker = checker();
        pending_request(&checker).await;
        checker.approve("exec-1", "step-a", "bob").await.unwrap();
        let err = checker.approve("exec-1", "step-a", "bob").await.unwrap_err();
        assert!(matches!(err, ApprovalError::NotPending(Status::Approved)));
    }

    #[tokio::test]
    async fn deny_records_attribution_and_reason() {
        let checker = checker();
        pending_request(&checker).await;
        let denied = checker
            .deny("exec-1", "step-a", "bob", "touches prod data")
            .await
            .unwrap();
        assert_eq!(denied.status, Status::Denied);
        assert_eq!(denied.denied_by.as_deref(), Some("bob"));
        assert_eq!(denied.denial_reason.as_deref(), Some("touches prod data"));
        assert_eq!(
            checker.check("exec-1", "step-a").await.unwrap(),
            Status::Denied
        );
    }

    #[tokio::test]
    async fn list_pending_drops_records_once_decided() {
        let checker = checker();
        pending_request(&checker).await;
        checker
            .create_request("exec-2", "step-b", "rb-1", "alice", "echo", "h", vec![
                "bob".into(),
            ])
            .await
            .unwrap();

        let pending = checker.list_pending().await.unwrap();
        assert_eq!(pending.len(), 2);

        checker
            .deny("exec-1", "step-a", "bob", "out of window")
            .await
            .unwrap();
        let pending = checker.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].execution_id, "exec-2");
    }

    #[tokio::test]
    async fn empty_approvers_fall_back_to_defaults() {
        let checker = checker();
        let request = checker
            .create_request("exec-2", "step-b", "rb-1", "alice", "echo", "h", vec![])
            .await
            .unwrap();
        assert_eq!(request.approvers, vec!["sre-leads".to_string()]);
    }
}
