//! State controller
//!
//! Owns the engine session for the life of the service and serializes every
//! mutating operation behind one async mutex. Readers never take that lock:
//! the last committed state is published on a watch channel after each
//! successful commit.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::backend::FilterEngine;
use super::guids::{check_registry, Role};
use super::rules::build_filter_set;
use super::state::{PolicyParams, VpnState};
use super::sublayer::{EnsureReport, SublayerManager};
use super::transaction::{AppliedDiff, TransactionCoordinator};
use crate::config::FirewallConfig;
use crate::error::{FirewallError, FirewallResult};
use crate::logger::Logger;

/// Committed view of the controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirewallSnapshot {
    pub state: VpnState,
    pub initialized: bool,
    /// Parameters of the last successful transition
    pub params: Option<PolicyParams>,
    /// Exception-tier roles currently installed
    pub roles: BTreeSet<Role>,
}

impl FirewallSnapshot {
    fn uninitialized() -> Self {
        Self {
            state: VpnState::Uninitialized,
            initialized: false,
            params: None,
            roles: BTreeSet::new(),
        }
    }
}

/// Outcome of a successful transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionReport {
    pub from: VpnState,
    pub to: VpnState,
    pub diff: AppliedDiff,
}

struct ControllerInner {
    coordinator: TransactionCoordinator,
    sublayers: SublayerManager,
    logger: Logger,
    initialized: bool,
    state: VpnState,
    params: Option<PolicyParams>,
}

impl ControllerInner {
    fn snapshot(&self) -> FirewallSnapshot {
        FirewallSnapshot {
            state: self.state,
            initialized: self.initialized,
            params: self.params.clone(),
            roles: self.coordinator.applied_roles(),
        }
    }

    /// Record a failure in both logs and hand the error back
    fn fail<T>(
        &mut self,
        message: &str,
        err: FirewallError,
        mut details: Vec<String>,
    ) -> FirewallResult<T> {
        error!("{}: {}", message, err);
        details.insert(0, format!("error: {}", err));
        if err.is_retryable() {
            details.push("the previous filter set is still in place".to_string());
        }
        self.logger.log_details(message, &details);
        Err(err)
    }

    async fn install_staged(&mut self) -> FirewallResult<(EnsureReport, usize)> {
        let report = self.sublayers.ensure(self.coordinator.engine()).await?;
        let adopted = self
            .coordinator
            .reconcile(Role::Provider.id(), Role::SublayerException.id())
            .await?;
        Ok((report, adopted))
    }

    async fn install(&mut self) -> FirewallResult<(EnsureReport, usize)> {
        self.coordinator.begin().await?;
        let staged = self.install_staged().await;
        self.coordinator.finish(staged).await
    }

    async fn uninstall(&mut self) -> FirewallResult<usize> {
        self.coordinator.begin().await?;
        let staged = self.sublayers.teardown(self.coordinator.engine()).await;
        self.coordinator.finish(staged).await
    }
}

pub struct FirewallController {
    inner: Mutex<ControllerInner>,
    snapshot: watch::Sender<FirewallSnapshot>,
}

impl FirewallController {
    /// Create a controller. Nothing touches the engine until `initialize`.
    pub fn new(engine: Arc<dyn FilterEngine>, logger: Logger, call_timeout: Duration) -> Self {
        let (snapshot, _) = watch::channel(FirewallSnapshot::uninitialized());
        Self {
            inner: Mutex::new(ControllerInner {
                coordinator: TransactionCoordinator::new(engine, call_timeout),
                sublayers: SublayerManager::new(call_timeout),
                logger,
                initialized: false,
                state: VpnState::Uninitialized,
                params: None,
            }),
            snapshot,
        }
    }

    /// Create a controller logging to the file described by `config`
    pub fn from_config(
        engine: Arc<dyn FilterEngine>,
        config: &FirewallConfig,
    ) -> FirewallResult<Self> {
        let logger = config.open_logger()?;
        Ok(Self::new(engine, logger, config.call_timeout()))
    }

    fn publish(&self, inner: &ControllerInner) {
        self.snapshot.send_replace(inner.snapshot());
    }

    /// Install the provider, both sublayers and the deny tier, and adopt any
    /// exception filters left by an earlier run. One transaction.
    ///
    /// Calling this again once it succeeded does nothing.
    pub async fn initialize(&self) -> FirewallResult<EnsureReport> {
        let mut inner = self.inner.lock().await;
        if inner.initialized {
            debug!("Firewall already initialized");
            return Ok(EnsureReport::default());
        }

        if let Err(e) = check_registry() {
            return inner.fail("Identity registry is inconsistent", e, Vec::new());
        }
        info!("Initializing firewall on {} engine", inner.coordinator.engine().name());
        let (report, adopted) = match inner.install().await {
            Ok(installed) => installed,
            Err(e) => return inner.fail("Failed to initialize firewall", e, Vec::new()),
        };

        let mut details = report.detail_lines();
        if adopted > 0 {
            details.push(format!("adopted {} exception filters from a previous run", adopted));
        }
        inner.logger.log_details("Firewall initialized", &details);
        info!("Firewall initialized, deny tier in place");

        inner.initialized = true;
        self.publish(&inner);
        Ok(report)
    }

    /// Replace the exception tier with the filter set for `state`.
    ///
    /// On failure the previously committed state stays current and the error
    /// is returned as is; nothing is retried.
    pub async fn transition_to(
        &self,
        state: VpnState,
        params: PolicyParams,
    ) -> FirewallResult<TransitionReport> {
        let mut inner = self.inner.lock().await;
        let from = inner.state;
        let message = format!("Failed transition from {} to {}", from, state);

        if state == VpnState::Uninitialized {
            let err = FirewallError::InvalidParams(
                "cannot transition to uninitialized, use shutdown".to_string(),
            );
            return inner.fail(&message, err, Vec::new());
        }
        if !inner.initialized {
            let err = FirewallError::InvalidParams("firewall is not initialized".to_string());
            return inner.fail(&message, err, Vec::new());
        }

        let target = match build_filter_set(state, &params) {
            Ok(target) => target,
            Err(e) => return inner.fail(&message, e, Vec::new()),
        };

        let planned = inner.coordinator.plan(&target);
        let diff = match inner.coordinator.apply(&target).await {
            Ok(diff) => diff,
            Err(e) => return inner.fail(&message, e, planned.detail_lines()),
        };

        if diff.is_empty() {
            inner
                .logger
                .log(&format!("Transitioned from {} to {}, filters unchanged", from, state));
        } else {
            let message = format!("Transitioned from {} to {}", from, state);
            inner.logger.log_details(&message, &diff.detail_lines());
        }
        info!(
            "Firewall state {} -> {} ({} added, {} removed, {} replaced)",
            from,
            state,
            diff.added.len(),
            diff.removed.len(),
            diff.replaced.len()
        );

        inner.state = state;
        inner.params = Some(params);
        self.publish(&inner);

        Ok(TransitionReport { from, to: state, diff })
    }

    /// Remove every filter, both sublayers and the provider. The controller
    /// returns to `Uninitialized` and may be initialized again.
    pub async fn shutdown(&self) -> FirewallResult<usize> {
        let mut inner = self.inner.lock().await;
        let from = inner.state;

        let removed = match inner.uninstall().await {
            Ok(removed) => removed,
            Err(e) => return inner.fail("Failed to remove firewall", e, Vec::new()),
        };

        let details = [format!("state was {}", from), format!("removed {} filters", removed)];
        inner.logger.log_details("Firewall removed", &details);
        info!("Firewall removed ({} filters)", removed);

        inner.coordinator.forget();
        inner.initialized = false;
        inner.state = VpnState::Uninitialized;
        inner.params = None;
        self.publish(&inner);
        Ok(removed)
    }

    /// Deny-tier roles missing from the engine. Empty when the deny tier is
    /// complete.
    pub async fn verify(&self) -> FirewallResult<Vec<Role>> {
        let mut inner = self.inner.lock().await;
        let missing = match inner.sublayers.verify(inner.coordinator.engine()).await {
            Ok(missing) => missing,
            Err(e) => return inner.fail("Failed to verify deny filters", e, Vec::new()),
        };

        if !missing.is_empty() {
            warn!("{} deny filters missing", missing.len());
            let details: Vec<String> = missing.iter().map(|r| format!("missing: {}", r)).collect();
            inner.logger.log_details("Deny tier incomplete", &details);
        }
        Ok(missing)
    }

    pub fn current_state(&self) -> VpnState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> FirewallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Change feed of committed snapshots
    pub fn subscribe(&self) -> watch::Receiver<FirewallSnapshot> {
        self.snapshot.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::memory::InMemoryEngine;
    use crate::logger::CaptureSink;
    use std::net::{IpAddr, Ipv4Addr};

    fn controller() -> (InMemoryEngine, CaptureSink, FirewallController) {
        let engine = InMemoryEngine::new();
        let capture = CaptureSink::new();
        let controller = FirewallController::new(
            Arc::new(engine.clone()),
            Logger::new(capture.clone()),
            Duration::from_secs(1),
        );
        (engine, capture, controller)
    }

    fn relay() -> PolicyParams {
        PolicyParams::new().with_relay(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)))
    }

    #[tokio::test]
    async fn test_transition_before_initialize_rejected() {
        let (engine, capture, controller) = controller();
        let err = controller.transition_to(VpnState::Connecting, relay()).await.unwrap_err();
        assert!(matches!(err, FirewallError::InvalidParams(_)));
        assert!(engine.calls().is_empty());
        assert!(capture.lines()[0].contains("Failed transition from uninitialized to connecting"));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (engine, _, controller) = controller();
        let report = controller.initialize().await.unwrap();
        assert!(report.provider_created);
        assert!(controller.snapshot().initialized);
        assert_eq!(controller.current_state(), VpnState::Uninitialized);

        engine.clear_calls();
        assert!(controller.initialize().await.unwrap().is_noop());
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_transition_to_uninitialized_rejected() {
        let (_, _, controller) = controller();
        controller.initialize().await.unwrap();
        let err = controller
            .transition_to(VpnState::Uninitialized, PolicyParams::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FirewallError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_transition_logged_with_details() {
        let (_, capture, controller) = controller();
        controller.initialize().await.unwrap();
        controller.transition_to(VpnState::Connecting, relay()).await.unwrap();

        let lines = capture.lines();
        let header = lines
            .iter()
            .position(|l| l.ends_with("Transitioned from uninitialized to connecting"))
            .unwrap();
        assert!(lines[header + 1..].iter().any(|l| l.ends_with("    added: permit-vpn-relay")));
    }

    #[tokio::test]
    async fn test_snapshot_published_after_commit() {
        let (_, _, controller) = controller();
        let mut feed = controller.subscribe();
        controller.initialize().await.unwrap();
        controller.transition_to(VpnState::Connecting, relay()).await.unwrap();

        assert!(feed.has_changed().unwrap());
        let seen = feed.borrow_and_update().clone();
        assert_eq!(seen.state, VpnState::Connecting);
        assert!(seen.roles.contains(&Role::PermitVpnRelay));
        assert_eq!(seen.params, Some(relay()));
    }

    #[tokio::test]
    async fn test_shutdown_resets() {
        let (engine, _, controller) = controller();
        controller.initialize().await.unwrap();
        controller.transition_to(VpnState::Connecting, relay()).await.unwrap();

        assert!(controller.shutdown().await.unwrap() > 4);
        assert_eq!(controller.snapshot(), FirewallSnapshot::uninitialized());
        assert!(engine.committed_filters().is_empty());
        assert!(!engine.has_provider(Role::Provider.id()));
    }

    #[tokio::test]
    async fn test_verify_reports_missing_deny_filter() {
        let (engine, capture, controller) = controller();
        controller.initialize().await.unwrap();
        assert!(controller.verify().await.unwrap().is_empty());

        engine.delete_filter(Role::BlockAllInboundIpv6.id()).await.unwrap();
        assert_eq!(controller.verify().await.unwrap(), vec![Role::BlockAllInboundIpv6]);
        assert!(capture.lines().iter().any(|l| l.ends_with("missing: block-all-inbound-ipv6")));
    }
}
