//! Transaction coordinator
//!
//! Applies a [`FilterSetSpec`] as one atomic batch against the engine:
//! begin, delete stale filters, create missing ones, commit. Any failure
//! aborts the session and the engine restores the last committed state, so a
//! failed apply never leaves a partially applied policy behind. A call that
//! times out is not followed by an abort; the session is reset instead and
//! the engine rolls back whatever it left open.
//!
//! The coordinator tracks the exception-tier filters it last committed and
//! diffs by stable identifier. Filters present in both the tracked and the
//! target set with identical content are not touched.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{EngineResult, FilterEngine};
use super::filter::{FilterSetSpec, FilterSpec};
use super::guids::Role;
use crate::error::{FirewallError, FirewallResult};

/// Run one engine call with a bounded wait.
///
/// A call that does not return within `limit` surfaces as `EngineTimeout`.
pub(crate) async fn engine_call<T, F>(
    limit: Duration,
    operation: &str,
    roles: &[Role],
    call: F,
) -> FirewallResult<T>
where
    F: Future<Output = EngineResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(FirewallError::from_engine_with_roles(e, operation, role_names(roles))),
        Err(_) => Err(FirewallError::EngineTimeout {
            operation: operation.to_string(),
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            roles: role_names(roles),
        }),
    }
}

fn role_names(roles: &[Role]) -> Vec<String> {
    roles.iter().map(|r| r.name().to_string()).collect()
}

/// Difference between the tracked and a target filter set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppliedDiff {
    /// Roles created
    pub added: Vec<Role>,
    /// Roles deleted
    pub removed: Vec<Role>,
    /// Roles whose content changed; deleted and re-created in the same transaction
    pub replaced: Vec<Role>,
    /// Roles left untouched
    pub unchanged: Vec<Role>,
}

impl AppliedDiff {
    /// True when applying would issue no engine calls
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.replaced.is_empty()
    }

    /// Every role a failed apply was working on
    pub fn touched(&self) -> Vec<Role> {
        self.removed
            .iter()
            .chain(&self.replaced)
            .chain(&self.added)
            .copied()
            .collect()
    }

    /// One line per changed role, for the diagnostic log
    pub fn detail_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.extend(self.removed.iter().map(|r| format!("removed: {}", r)));
        lines.extend(self.replaced.iter().map(|r| format!("replaced: {}", r)));
        lines.extend(self.added.iter().map(|r| format!("added: {}", r)));
        lines
    }
}

pub struct TransactionCoordinator {
    engine: Arc<dyn FilterEngine>,
    call_timeout: Duration,
    /// Exception-tier filters as last committed, by identifier
    applied: BTreeMap<Uuid, FilterSpec>,
}

impl TransactionCoordinator {
    pub fn new(engine: Arc<dyn FilterEngine>, call_timeout: Duration) -> Self {
        Self {
            engine,
            call_timeout,
            applied: BTreeMap::new(),
        }
    }

    pub fn engine(&self) -> &dyn FilterEngine {
        self.engine.as_ref()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    async fn call<T, F>(&self, operation: &str, roles: &[Role], call: F) -> FirewallResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        engine_call(self.call_timeout, operation, roles, call).await
    }

    /// Roles of the exception filters currently committed
    pub fn applied_roles(&self) -> BTreeSet<Role> {
        self.applied.values().map(|f| f.role).collect()
    }

    /// Compute what applying `target` would change. Pure.
    pub fn plan(&self, target: &FilterSetSpec) -> AppliedDiff {
        let wanted = target.by_id();
        let mut diff = AppliedDiff::default();

        for (id, current) in &self.applied {
            if !wanted.contains_key(id) {
                diff.removed.push(current.role);
            }
        }
        for filter in &target.filters {
            match self.applied.get(&filter.id) {
                None => diff.added.push(filter.role),
                Some(current) if current != filter => diff.replaced.push(filter.role),
                Some(_) => diff.unchanged.push(filter.role),
            }
        }
        diff
    }

    /// Open a transaction against the engine
    pub async fn begin(&self) -> FirewallResult<()> {
        let begun = self.call("begin transaction", &[], self.engine.begin_transaction()).await;
        if let Err(e @ FirewallError::EngineTimeout { .. }) = &begun {
            debug!("Begin did not return: {}", e);
            self.reset_session().await;
        }
        begun
    }

    /// Commit the open transaction if `result` is Ok, abort it otherwise.
    ///
    /// A failed commit is aborted too. Timeouts are never followed by an
    /// abort: the session is reset and the engine rolls it back.
    pub async fn finish<T>(&self, result: FirewallResult<T>) -> FirewallResult<T> {
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                self.abort_after(&e).await;
                return Err(e);
            }
        };

        let committed = self
            .call("commit transaction", &[], self.engine.commit_transaction())
            .await;
        if let Err(e) = committed {
            self.abort_after(&e).await;
            return Err(e);
        }
        Ok(value)
    }

    async fn abort_after(&self, error: &FirewallError) {
        if matches!(error, FirewallError::EngineTimeout { .. }) {
            self.reset_session().await;
            return;
        }
        let aborted = self.call("abort transaction", &[], self.engine.abort_transaction()).await;
        match aborted {
            Ok(()) => debug!("Transaction aborted after error: {}", error),
            Err(e) => warn!("Failed to abort transaction after '{}': {}", error, e),
        }
    }

    /// Give up on a session that stopped answering
    async fn reset_session(&self) {
        let reset = self.call("reset session", &[], self.engine.reset_session()).await;
        match reset {
            Ok(()) => warn!("Engine call timed out; session reset, open transaction rolled back"),
            Err(e) => warn!("Failed to reset engine session after a timeout: {}", e),
        }
    }

    /// Adopt the exception filters already present in the engine.
    ///
    /// Filters left by an earlier process become the tracked set, so the next
    /// apply removes or keeps them instead of colliding with them.
    pub async fn reconcile(
        &mut self,
        provider: Uuid,
        exception_sublayer: Uuid,
    ) -> FirewallResult<usize> {
        let filters = self
            .call("enumerate filters", &[], self.engine.enumerate_filters(provider))
            .await?;

        self.applied = filters
            .into_iter()
            .filter(|f| f.sublayer == exception_sublayer)
            .map(|f| (f.id, f))
            .collect();

        if !self.applied.is_empty() {
            info!("Adopted {} exception filters already present in the engine", self.applied.len());
        }
        Ok(self.applied.len())
    }

    /// Issue the deletes and creates for `diff` inside an open session.
    async fn stage(&self, diff: &AppliedDiff, target: &FilterSetSpec) -> FirewallResult<()> {
        let touched = diff.touched();
        let wanted = target.by_id();

        for role in diff.removed.iter().chain(&diff.replaced) {
            self.call("delete filter", &touched, self.engine.delete_filter(role.id())).await?;
        }

        for role in diff.added.iter().chain(&diff.replaced) {
            let filter = wanted.get(&role.id()).ok_or_else(|| FirewallError::TransactionAborted {
                reason: format!("filter for role {} vanished from the target set", role),
                roles: role_names(&touched),
            })?;
            self.call("add filter", &touched, self.engine.add_filter(filter)).await?;
        }
        Ok(())
    }

    /// Make `target` the complete exception-tier filter set, atomically.
    pub async fn apply(&mut self, target: &FilterSetSpec) -> FirewallResult<AppliedDiff> {
        let diff = self.plan(target);
        if diff.is_empty() {
            debug!("Filter set unchanged ({} filters), nothing to apply", diff.unchanged.len());
            return Ok(diff);
        }

        self.begin().await.map_err(|e| with_roles(e, &diff.touched()))?;
        let staged = self.stage(&diff, target).await;
        self.finish(staged).await.map_err(|e| with_roles(e, &diff.touched()))?;

        self.record(target);
        debug!(
            "Applied filter set: {} added, {} removed, {} replaced, {} unchanged",
            diff.added.len(),
            diff.removed.len(),
            diff.replaced.len(),
            diff.unchanged.len()
        );
        Ok(diff)
    }

    /// Track `target` as committed
    pub fn record(&mut self, target: &FilterSetSpec) {
        self.applied = target.filters.iter().map(|f| (f.id, f.clone())).collect();
    }

    /// Drop all tracking, after the provider's objects were torn down
    pub fn forget(&mut self) {
        self.applied.clear();
    }
}

/// Attach role names to an aborted transaction error that has none yet
fn with_roles(error: FirewallError, roles: &[Role]) -> FirewallError {
    match error {
        FirewallError::TransactionAborted { reason, roles: r } if r.is_empty() => {
            FirewallError::TransactionAborted { reason, roles: role_names(roles) }
        }
        FirewallError::EngineTimeout { operation, timeout_ms, roles: r } if r.is_empty() => {
            FirewallError::EngineTimeout { operation, timeout_ms, roles: role_names(roles) }
        }
        other => other,
    }
}
