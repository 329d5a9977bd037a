use async_trait::async_trait;
use std::fmt;
use uuid::Uuid;

use super::filter::{FilterSpec, ProviderSpec, SublayerSpec};

/// Failure reported by a filtering engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The facility cannot be reached (service stopped, no session)
    Unavailable(String),
    /// The caller may not register or remove filtering objects
    AccessDenied(String),
    /// Another session holds the transaction lock
    Busy(String),
    /// An object with this identifier already exists
    AlreadyExists(Uuid),
    /// No object with this identifier exists
    NotFound(Uuid),
    /// No transaction is open, or one is already open
    TransactionState(String),
    /// Any other engine-reported failure
    Failed(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Unavailable(msg) => write!(f, "engine unavailable: {}", msg),
            EngineError::AccessDenied(msg) => write!(f, "access denied: {}", msg),
            EngineError::Busy(msg) => write!(f, "engine busy: {}", msg),
            EngineError::AlreadyExists(id) => write!(f, "object {} already exists", id),
            EngineError::NotFound(id) => write!(f, "object {} not found", id),
            EngineError::TransactionState(msg) => write!(f, "transaction state: {}", msg),
            EngineError::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;

/// Narrow port onto an OS packet-filtering engine
///
/// Every native binding (WFP, nftables, pf) lives behind this trait so the
/// rule model, the transaction logic and the state machine can be exercised
/// against [`super::memory::InMemoryEngine`].
///
/// Calls are issued strictly one after another; the engine may block inside
/// any of them. Objects created or deleted between `begin_transaction` and
/// `commit_transaction` must become visible to the rest of the system only at
/// commit, and `abort_transaction` must restore the last committed state.
/// A session given up with `reset_session` must be rolled back the same way.
#[async_trait]
pub trait FilterEngine: Send + Sync {
    /// Name of this engine (e.g., "wfp", "memory")
    fn name(&self) -> &str;

    async fn begin_transaction(&self) -> EngineResult<()>;

    async fn commit_transaction(&self) -> EngineResult<()>;

    async fn abort_transaction(&self) -> EngineResult<()>;

    /// Close the current session handle and open a fresh one, without
    /// talking to the old session. Any transaction still open on the old
    /// handle is rolled back by the engine.
    async fn reset_session(&self) -> EngineResult<()>;

    /// Look up a provider by identifier
    async fn get_provider(&self, id: Uuid) -> EngineResult<Option<ProviderSpec>>;

    async fn add_provider(&self, provider: &ProviderSpec) -> EngineResult<Uuid>;

    async fn delete_provider(&self, id: Uuid) -> EngineResult<()>;

    /// Look up a sublayer by identifier
    async fn get_sublayer(&self, id: Uuid) -> EngineResult<Option<SublayerSpec>>;

    async fn add_sublayer(&self, sublayer: &SublayerSpec) -> EngineResult<Uuid>;

    async fn delete_sublayer(&self, id: Uuid) -> EngineResult<()>;

    async fn add_filter(&self, filter: &FilterSpec) -> EngineResult<Uuid>;

    async fn delete_filter(&self, id: Uuid) -> EngineResult<()>;

    /// All filters owned by `provider`, in any sublayer
    async fn enumerate_filters(&self, provider: Uuid) -> EngineResult<Vec<FilterSpec>>;
}
