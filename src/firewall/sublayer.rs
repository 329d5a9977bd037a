//! Provider, sublayers and the deny tier
//!
//! Everything here lives for the whole life of the controller: the provider
//! that owns all fwctl objects, the deny and exception sublayers, and the four
//! block-all filters in the deny sublayer. All operations are idempotent and
//! expect the caller to hold an open engine session.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backend::{EngineResult, FilterEngine};
use super::conditions::{AddressFamily, Direction};
use super::filter::{FilterSetSpec, FilterSpec, ProviderSpec, SublayerKind, SublayerSpec};
use super::guids::Role;
use super::transaction::engine_call;
use crate::error::{FirewallError, FirewallResult};

/// The four block-all filters, one per direction and family
pub fn deny_filters() -> FilterSetSpec {
    let mut set = FilterSetSpec::new();
    for (role, direction, family) in [
        (Role::BlockAllOutboundIpv4, Direction::Outbound, AddressFamily::Ipv4),
        (Role::BlockAllInboundIpv4, Direction::Inbound, AddressFamily::Ipv4),
        (Role::BlockAllOutboundIpv6, Direction::Outbound, AddressFamily::Ipv6),
        (Role::BlockAllInboundIpv6, Direction::Inbound, AddressFamily::Ipv6),
    ] {
        set.push(FilterSpec::new(role, SublayerKind::Deny, direction, family));
    }
    set
}

/// What an `ensure` pass had to create
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnsureReport {
    pub provider_created: bool,
    pub sublayers_created: Vec<Role>,
    pub deny_filters_created: Vec<Role>,
    pub deny_filters_replaced: Vec<Role>,
}

impl EnsureReport {
    /// True when every object was already in place
    pub fn is_noop(&self) -> bool {
        !self.provider_created
            && self.sublayers_created.is_empty()
            && self.deny_filters_created.is_empty()
            && self.deny_filters_replaced.is_empty()
    }

    pub fn detail_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if self.provider_created {
            lines.push(format!("created provider {}", Role::Provider));
        }
        lines.extend(self.sublayers_created.iter().map(|r| format!("created sublayer {}", r)));
        lines.extend(self.deny_filters_created.iter().map(|r| format!("created filter {}", r)));
        lines.extend(self.deny_filters_replaced.iter().map(|r| format!("replaced filter {}", r)));
        lines
    }
}

pub struct SublayerManager {
    call_timeout: Duration,
}

impl SublayerManager {
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }

    async fn call<T, F>(&self, operation: &str, roles: &[Role], call: F) -> FirewallResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        engine_call(self.call_timeout, operation, roles, call).await
    }

    /// Create the provider, both sublayers and the deny filters where missing
    pub async fn ensure(&self, engine: &dyn FilterEngine) -> FirewallResult<EnsureReport> {
        let mut report = EnsureReport {
            provider_created: self.ensure_provider(engine).await?,
            ..Default::default()
        };
        report.sublayers_created = self.ensure_sublayers(engine).await?;
        let (created, replaced) = self.ensure_deny_filters(engine).await?;
        report.deny_filters_created = created;
        report.deny_filters_replaced = replaced;
        Ok(report)
    }

    /// Returns true if the provider had to be created
    pub async fn ensure_provider(&self, engine: &dyn FilterEngine) -> FirewallResult<bool> {
        let provider = ProviderSpec::fwctl();
        let existing = self.call("get provider", &[], engine.get_provider(provider.id)).await?;
        if existing.is_some() {
            debug!("Provider {} already present", provider.id);
            return Ok(false);
        }

        self.call("add provider", &[Role::Provider], engine.add_provider(&provider)).await?;
        info!("Created provider {}", provider.id);
        Ok(true)
    }

    /// Create missing sublayers. A present sublayer with a foreign weight is
    /// a conflict, not something to overwrite.
    pub async fn ensure_sublayers(&self, engine: &dyn FilterEngine) -> FirewallResult<Vec<Role>> {
        let mut created = Vec::new();
        for kind in [SublayerKind::Deny, SublayerKind::Exception] {
            let wanted = SublayerSpec::for_kind(kind);
            let role = kind.role();

            let existing = self.call("get sublayer", &[], engine.get_sublayer(wanted.id)).await?;
            match existing {
                Some(found) if found.weight != wanted.weight => {
                    return Err(FirewallError::WeightConflict {
                        role: role.name(),
                        id: wanted.id,
                        expected: wanted.weight,
                        found: found.weight,
                    });
                }
                Some(_) => debug!("Sublayer {} already present", role),
                None => {
                    self.call("add sublayer", &[role], engine.add_sublayer(&wanted)).await?;
                    info!("Created sublayer {} with weight {:#06x}", role, wanted.weight);
                    created.push(role);
                }
            }
        }
        Ok(created)
    }

    /// Create missing block-all filters and replace any whose content drifted.
    /// Returns the created and the replaced roles.
    pub async fn ensure_deny_filters(
        &self,
        engine: &dyn FilterEngine,
    ) -> FirewallResult<(Vec<Role>, Vec<Role>)> {
        let present = self.call(
            "enumerate filters",
            &[],
            engine.enumerate_filters(Role::Provider.id()),
        )
        .await?;

        let mut created = Vec::new();
        let mut replaced = Vec::new();
        for filter in deny_filters().filters {
            let roles = [filter.role];
            match present.iter().find(|f| f.id == filter.id) {
                Some(existing) if *existing == filter => continue,
                Some(_) => {
                    self.call("delete filter", &roles, engine.delete_filter(filter.id)).await?;
                    self.call("add filter", &roles, engine.add_filter(&filter)).await?;
                    warn!("Replaced drifted deny filter {}", filter.role);
                    replaced.push(filter.role);
                }
                None => {
                    self.call("add filter", &roles, engine.add_filter(&filter)).await?;
                    created.push(filter.role);
                }
            }
        }
        Ok((created, replaced))
    }

    /// Deny roles missing from the engine. Read-only.
    pub async fn verify(&self, engine: &dyn FilterEngine) -> FirewallResult<Vec<Role>> {
        let present = self.call(
            "enumerate filters",
            &[],
            engine.enumerate_filters(Role::Provider.id()),
        )
        .await?;

        let wanted = deny_filters();
        let missing: Vec<Role> = wanted
            .filters
            .iter()
            .filter(|w| !present.iter().any(|p| p == *w))
            .map(|w| w.role)
            .collect();
        if !missing.is_empty() {
            warn!("Deny tier incomplete, missing: {:?}", missing);
        }
        Ok(missing)
    }

    /// Delete every filter, sublayer and the provider. Returns the number of
    /// filters deleted.
    pub async fn teardown(&self, engine: &dyn FilterEngine) -> FirewallResult<usize> {
        let provider = Role::Provider.id();
        let filters = self
            .call("enumerate filters", &[], engine.enumerate_filters(provider))
            .await?;

        for filter in &filters {
            self.call("delete filter", &[filter.role], engine.delete_filter(filter.id)).await?;
        }

        for kind in [SublayerKind::Exception, SublayerKind::Deny] {
            let role = kind.role();
            let existing = self.call("get sublayer", &[], engine.get_sublayer(role.id())).await?;
            if existing.is_some() {
                self.call("delete sublayer", &[role], engine.delete_sublayer(role.id())).await?;
            }
        }

        let existing = self.call("get provider", &[], engine.get_provider(provider)).await?;
        if existing.is_some() {
            self.call("delete provider", &[Role::Provider], engine.delete_provider(provider))
                .await?;
        }

        info!("Removed {} filters and the fwctl provider", filters.len());
        Ok(filters.len())
    }
}
