//! Bluetooth Module
//!
//! Command transaction engine for the two lenses of a pair of Even G1 glasses.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  DualPeerCoordinator                     │
//! │  (device-level API: ordered broadcasts, post-init,       │
//! │   configuration push, inbound routing)                   │
//! └──────────────┬─────────────────────────┬────────────────┘
//!                │                         │
//!                ▼                         ▼
//!      ┌──────────────────┐      ┌──────────────────┐
//!      │ PeerSession (L)  │      │ PeerSession (R)  │
//!      │ - sequence       │      │ - sequence       │
//!      │ - pending + retry│      │ - pending + retry│
//!      │ - heartbeat      │      │ - heartbeat      │
//!      │ - battery poll   │      │ - battery poll   │
//!      └────────┬─────────┘      └────────┬─────────┘
//!               │                         │
//!               └────────────┬────────────┘
//!                            ▼
//!                  ┌──────────────────┐
//!                  │    Transport     │
//!                  │ write / notify   │
//!                  └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`command`] - Command handlers, outcomes and chunked payloads
//! - [`commands`] - The G1 command set and response parsers
//! - [`protocol`] - UUIDs, opcodes and other wire constants
//! - [`profile`] - Keepalive, battery query and unsolicited frame decoding
//! - [`session`] - Per-lens transaction engine
//! - [`peers`] - Side/address binding and pairing
//! - [`service`] - Device coordinator
//! - [`transport`] - Transport boundary
//! - [`loopback`] - In-process transport with a simulated pair of glasses

pub mod command;
pub mod commands;
pub mod loopback;
pub mod peers;
pub mod profile;
pub mod protocol;
pub mod service;
pub mod session;
pub mod transport;

// Re-export the main entry points for convenience
pub use command::{Command, CommandHandler, Outcome};
pub use loopback::LoopbackTransport;
pub use peers::{DiscoveredDevice, PeerRegistry};
pub use service::DualPeerCoordinator;
pub use session::{PeerSession, SessionContext};
pub use transport::Transport;
