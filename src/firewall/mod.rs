//! Firewall module for fwctl
//!
//! Keeps the host's packet filter in a default-deny posture and punches the
//! minimum set of holes each VPN lifecycle state needs.
//!
//! # Architecture
//!
//! Two sublayers under one provider. The exception sublayer outranks the deny
//! sublayer, so a matching permit there wins over the block-all filters:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   FirewallController (single writer)│
//! └──────────────┬──────────────────────┘
//!                │
//!    ┌───────────┼───────────────┐
//!    │           │               │
//!    ▼           ▼               ▼
//! ┌───────┐  ┌─────────────┐  ┌──────────┐
//! │ rules │  │ transaction │  │ sublayer │
//! └───────┘  └──────┬──────┘  └────┬─────┘
//!                   │              │
//!                   ▼              ▼
//!            ┌──────────────────────────┐
//!            │   FilterEngine (port)    │  <- OS engine or InMemoryEngine
//!            └──────────────────────────┘
//!
//!   exception sublayer (0x0200): loopback, LAN, DHCP, relay | tunnel, DNS
//!   deny sublayer      (0x0100): block all, both directions, both families
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use libfwctl::firewall::{FirewallController, InMemoryEngine, PolicyParams, VpnState};
//! use libfwctl::logger::Logger;
//!
//! # async fn run() -> libfwctl::FirewallResult<()> {
//! let engine = Arc::new(InMemoryEngine::new());
//! let controller = FirewallController::new(engine, Logger::null(), Duration::from_secs(5));
//! controller.initialize().await?;
//!
//! let params = PolicyParams::new().with_relay("1.2.3.4".parse::<std::net::IpAddr>().unwrap());
//! controller.transition_to(VpnState::Connecting, params).await?;
//! controller.transition_to(VpnState::Connected, PolicyParams::new().with_tunnel("wg0")).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod conditions;
pub mod controller;
pub mod filter;
pub mod guids;
pub mod memory;
pub mod rules;
pub mod state;
pub mod sublayer;
pub mod transaction;

pub use backend::{EngineError, EngineResult, FilterEngine};
pub use conditions::{AddressFamily, Condition, Direction, PacketMeta, TransportProtocol};
pub use controller::{FirewallController, FirewallSnapshot, TransitionReport};
pub use filter::{Action, FilterSetSpec, FilterSpec, SublayerKind};
pub use guids::{check_registry, identifier_for, DnsVariant, Role, REGISTRY_VERSION};
pub use memory::{EngineCall, InMemoryEngine};
pub use rules::build_filter_set;
pub use state::{PolicyParams, RelayEndpoint, VpnState};
pub use sublayer::{deny_filters, EnsureReport, SublayerManager};
pub use transaction::{AppliedDiff, TransactionCoordinator};
