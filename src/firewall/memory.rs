//! In-memory filtering engine
//!
//! Implements [`FilterEngine`] with real transaction semantics: `begin`
//! snapshots every object, `abort` restores the snapshot, `commit` publishes
//! the working set. Handles are cheap clones sharing one engine, so a test can
//! keep a handle for inspection after moving another into a controller.
//!
//! Faults can be injected to exercise error paths: an unreachable engine,
//! missing privileges, a busy transaction lock, a failing n-th filter add,
//! a failing commit, a stall on every call and a one-off stall on the next
//! filter add.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use super::backend::{EngineError, EngineResult, FilterEngine};
use super::conditions::PacketMeta;
use super::filter::{Action, FilterSpec, ProviderSpec, SublayerSpec};

/// Engine call, as recorded by [`InMemoryEngine::calls`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Begin,
    Commit,
    Abort,
    ResetSession,
    GetProvider(Uuid),
    AddProvider(Uuid),
    DeleteProvider(Uuid),
    GetSublayer(Uuid),
    AddSublayer(Uuid),
    DeleteSublayer(Uuid),
    AddFilter(Uuid),
    DeleteFilter(Uuid),
    Enumerate(Uuid),
}

impl EngineCall {
    /// Whether this call changes engine objects
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            EngineCall::AddProvider(_)
                | EngineCall::DeleteProvider(_)
                | EngineCall::AddSublayer(_)
                | EngineCall::DeleteSublayer(_)
                | EngineCall::AddFilter(_)
                | EngineCall::DeleteFilter(_)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Objects {
    providers: BTreeMap<Uuid, ProviderSpec>,
    sublayers: BTreeMap<Uuid, SublayerSpec>,
    filters: BTreeMap<Uuid, FilterSpec>,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    access_denied: bool,
    busy: bool,
    fail_commit: bool,
    /// Remaining successful filter adds before the next one fails
    fail_filter_add_in: Option<usize>,
    stall: Option<Duration>,
    /// One-off delay for the next filter add
    stall_filter_add: Option<Duration>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: Objects,
    /// Last committed objects while a transaction is open
    snapshot: Option<Objects>,
    calls: Vec<EngineCall>,
    faults: Faults,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryEngine {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock only happens in a failing test; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().faults.unavailable = unavailable;
    }

    pub fn set_access_denied(&self, denied: bool) {
        self.lock().faults.access_denied = denied;
    }

    pub fn set_busy(&self, busy: bool) {
        self.lock().faults.busy = busy;
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.lock().faults.fail_commit = fail;
    }

    /// Make the `n`-th filter add from now fail (1-based); `None` clears the fault.
    pub fn fail_nth_filter_add(&self, n: Option<usize>) {
        self.lock().faults.fail_filter_add_in = n.map(|n| n.saturating_sub(1));
    }

    /// Delay every call by `stall` before it is processed
    pub fn set_stall(&self, stall: Option<Duration>) {
        self.lock().faults.stall = stall;
    }

    /// Delay only the next filter add by `stall`
    pub fn stall_next_filter_add(&self, stall: Option<Duration>) {
        self.lock().faults.stall_filter_add = stall;
    }

    /// Every call issued so far
    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Number of create/delete calls issued so far
    pub fn mutation_count(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.is_mutation()).count()
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().snapshot.is_some()
    }

    /// Committed filters, as other processes would see them
    pub fn committed_filters(&self) -> Vec<FilterSpec> {
        let inner = self.lock();
        let view = inner.snapshot.as_ref().unwrap_or(&inner.objects);
        view.filters.values().cloned().collect()
    }

    pub fn committed_sublayers(&self) -> Vec<SublayerSpec> {
        let inner = self.lock();
        let view = inner.snapshot.as_ref().unwrap_or(&inner.objects);
        view.sublayers.values().cloned().collect()
    }

    pub fn has_provider(&self, id: Uuid) -> bool {
        let inner = self.lock();
        let view = inner.snapshot.as_ref().unwrap_or(&inner.objects);
        view.providers.contains_key(&id)
    }

    /// Install objects directly, bypassing faults and the call log.
    /// Used to simulate state left behind by an earlier process.
    pub fn seed_provider(&self, provider: ProviderSpec) {
        self.lock().objects.providers.insert(provider.id, provider);
    }

    pub fn seed_sublayer(&self, sublayer: SublayerSpec) {
        self.lock().objects.sublayers.insert(sublayer.id, sublayer);
    }

    pub fn seed_filter(&self, filter: FilterSpec) {
        self.lock().objects.filters.insert(filter.id, filter);
    }

    /// Decide a packet against the committed filters.
    ///
    /// The highest-weight sublayer holding a matching filter decides; inside
    /// it the highest filter weight wins and block wins a tie. A packet no
    /// filter matches is permitted.
    pub fn evaluate(&self, packet: &PacketMeta) -> Action {
        let inner = self.lock();
        let view = inner.snapshot.as_ref().unwrap_or(&inner.objects);

        let mut sublayers: Vec<&SublayerSpec> = view.sublayers.values().collect();
        sublayers.sort_by(|a, b| b.weight.cmp(&a.weight));

        for sublayer in sublayers {
            let decision = view
                .filters
                .values()
                .filter(|f| f.sublayer == sublayer.id && f.matches(packet))
                .max_by_key(|f| (f.weight, f.action == Action::Block))
                .map(|f| f.action);
            if let Some(action) = decision {
                return action;
            }
        }
        Action::Permit
    }

    /// Record a call and apply availability faults. Returns the stall to wait out.
    fn enter(&self, call: EngineCall) -> EngineResult<Option<Duration>> {
        let mut inner = self.lock();
        trace!("memory engine: {:?}", call);
        let mutation = call.is_mutation();
        inner.calls.push(call);

        if inner.faults.unavailable {
            return Err(EngineError::Unavailable("filtering engine is not running".to_string()));
        }
        if mutation && inner.faults.access_denied {
            return Err(EngineError::AccessDenied("caller is not an administrator".to_string()));
        }
        Ok(inner.faults.stall)
    }

    async fn call(&self, call: EngineCall) -> EngineResult<()> {
        if let Some(stall) = self.enter(call)? {
            tokio::time::sleep(stall).await;
        }
        Ok(())
    }
}

#[async_trait]
impl FilterEngine for InMemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    async fn begin_transaction(&self) -> EngineResult<()> {
        self.call(EngineCall::Begin).await?;
        let mut inner = self.lock();
        if inner.faults.busy {
            return Err(EngineError::Busy("transaction lock held by another session".to_string()));
        }
        if inner.snapshot.is_some() {
            return Err(EngineError::TransactionState("transaction already open".to_string()));
        }
        inner.snapshot = Some(inner.objects.clone());
        Ok(())
    }

    async fn commit_transaction(&self) -> EngineResult<()> {
        self.call(EngineCall::Commit).await?;
        let mut inner = self.lock();
        if inner.snapshot.is_none() {
            return Err(EngineError::TransactionState("no transaction open".to_string()));
        }
        if inner.faults.fail_commit {
            return Err(EngineError::Failed("commit rejected".to_string()));
        }
        inner.snapshot = None;
        Ok(())
    }

    async fn abort_transaction(&self) -> EngineResult<()> {
        self.call(EngineCall::Abort).await?;
        let mut inner = self.lock();
        match inner.snapshot.take() {
            Some(snapshot) => {
                inner.objects = snapshot;
                Ok(())
            }
            None => Err(EngineError::TransactionState("no transaction open".to_string())),
        }
    }

    async fn reset_session(&self) -> EngineResult<()> {
        let mut inner = self.lock();
        trace!("memory engine: {:?}", EngineCall::ResetSession);
        inner.calls.push(EngineCall::ResetSession);
        if let Some(snapshot) = inner.snapshot.take() {
            debug!("memory engine: session dropped with an open transaction, rolling back");
            inner.objects = snapshot;
        }
        Ok(())
    }

    async fn get_provider(&self, id: Uuid) -> EngineResult<Option<ProviderSpec>> {
        self.call(EngineCall::GetProvider(id)).await?;
        Ok(self.lock().objects.providers.get(&id).cloned())
    }

    async fn add_provider(&self, provider: &ProviderSpec) -> EngineResult<Uuid> {
        self.call(EngineCall::AddProvider(provider.id)).await?;
        let mut inner = self.lock();
        if inner.objects.providers.contains_key(&provider.id) {
            return Err(EngineError::AlreadyExists(provider.id));
        }
        inner.objects.providers.insert(provider.id, provider.clone());
        Ok(provider.id)
    }

    async fn delete_provider(&self, id: Uuid) -> EngineResult<()> {
        self.call(EngineCall::DeleteProvider(id)).await?;
        let mut inner = self.lock();
        if inner.objects.sublayers.values().any(|s| s.provider == id) {
            return Err(EngineError::Failed(format!("provider {} still owns sublayers", id)));
        }
        inner.objects.providers.remove(&id).map(|_| ()).ok_or(EngineError::NotFound(id))
    }

    async fn get_sublayer(&self, id: Uuid) -> EngineResult<Option<SublayerSpec>> {
        self.call(EngineCall::GetSublayer(id)).await?;
        Ok(self.lock().objects.sublayers.get(&id).cloned())
    }

    async fn add_sublayer(&self, sublayer: &SublayerSpec) -> EngineResult<Uuid> {
        self.call(EngineCall::AddSublayer(sublayer.id)).await?;
        let mut inner = self.lock();
        if !inner.objects.providers.contains_key(&sublayer.provider) {
            return Err(EngineError::NotFound(sublayer.provider));
        }
        if inner.objects.sublayers.contains_key(&sublayer.id) {
            return Err(EngineError::AlreadyExists(sublayer.id));
        }
        inner.objects.sublayers.insert(sublayer.id, sublayer.clone());
        Ok(sublayer.id)
    }

    async fn delete_sublayer(&self, id: Uuid) -> EngineResult<()> {
        self.call(EngineCall::DeleteSublayer(id)).await?;
        let mut inner = self.lock();
        if inner.objects.filters.values().any(|f| f.sublayer == id) {
            return Err(EngineError::Failed(format!("sublayer {} still holds filters", id)));
        }
        inner.objects.sublayers.remove(&id).map(|_| ()).ok_or(EngineError::NotFound(id))
    }

    async fn add_filter(&self, filter: &FilterSpec) -> EngineResult<Uuid> {
        self.call(EngineCall::AddFilter(filter.id)).await?;
        let stall = self.lock().faults.stall_filter_add.take();
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        let mut inner = self.lock();

        match inner.faults.fail_filter_add_in.take() {
            Some(0) => {
                let msg = format!("injected failure adding filter {}", filter.id);
                return Err(EngineError::Failed(msg));
            }
            Some(n) => inner.faults.fail_filter_add_in = Some(n - 1),
            None => {}
        }

        if !inner.objects.sublayers.contains_key(&filter.sublayer) {
            return Err(EngineError::NotFound(filter.sublayer));
        }
        if inner.objects.filters.contains_key(&filter.id) {
            return Err(EngineError::AlreadyExists(filter.id));
        }
        inner.objects.filters.insert(filter.id, filter.clone());
        Ok(filter.id)
    }

    async fn delete_filter(&self, id: Uuid) -> EngineResult<()> {
        self.call(EngineCall::DeleteFilter(id)).await?;
        self.lock().objects.filters.remove(&id).map(|_| ()).ok_or(EngineError::NotFound(id))
    }

    async fn enumerate_filters(&self, provider: Uuid) -> EngineResult<Vec<FilterSpec>> {
        self.call(EngineCall::Enumerate(provider)).await?;
        Ok(self
            .lock()
            .objects
            .filters
            .values()
            .filter(|f| f.provider == provider)
            .cloned()
            .collect())
    }
}
