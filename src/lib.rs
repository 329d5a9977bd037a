//! fwctl - VPN firewall policy library
//!
//! Default-deny packet filtering for a VPN client:
//! - Stable identity registry for every provider, sublayer and filter
//! - Filter sets per VPN lifecycle state (blocked, connecting, connected)
//! - Atomic, diff-based application against an async filtering engine port
//! - In-memory engine with fault injection for tests and simulation
//! - Diagnostic log file in a fixed line format
//!
//! Leak-free by construction: block-all filters sit in a low-weight sublayer
//! for as long as the firewall is installed, and every state only adds
//! narrowly scoped permits above them.

pub mod config;
pub mod error;
pub mod firewall;
pub mod logger;
pub mod validation;

// Re-export commonly used types
pub use config::FirewallConfig;
pub use error::{FirewallError, FirewallResult};
pub use firewall::{
    FilterEngine, FilterSetSpec, FirewallController, FirewallSnapshot, InMemoryEngine,
    PolicyParams, RelayEndpoint, Role, TransitionReport, VpnState,
};
pub use logger::{CaptureSink, FileSink, LogSink, Logger, NullSink};
