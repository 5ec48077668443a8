//! Bridge to Even Realities G1 glasses.
//!
//! Each lens is a separate BLE peripheral. [`DualPeerCoordinator`] drives both
//! of them as one device on top of any [`Transport`].

pub mod domain;
pub mod infrastructure;

pub use infrastructure::bluetooth::{DualPeerCoordinator, Transport};
