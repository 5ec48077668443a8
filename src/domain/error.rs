//! Error types shared by the transaction engine and the device layer.

use crate::domain::models::Side;
use thiserror::Error;

/// Failures reported by the BLE transport boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{side} side is not connected")]
    NotConnected { side: Side },

    #[error("write to {side} side failed: {reason}")]
    WriteFailed { side: Side, reason: String },

    #[error("could not subscribe to notifications on {side} side: {reason}")]
    NotifyFailed { side: Side, reason: String },

    #[error("MTU request of {mtu} on {side} side failed: {reason}")]
    MtuFailed { side: Side, mtu: u16, reason: String },
}

/// Why a command did not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Every attempt timed out without a matching response.
    #[error("command {name} timed out after {attempts} attempts")]
    Timeout { name: String, attempts: u32 },

    /// The link went down while the command was outstanding.
    #[error("command {name} aborted: side disconnected")]
    Disconnected { name: String },

    /// A chunked payload would need more chunks than the one-byte header can count.
    #[error("payload of {len} bytes is too large for {name}")]
    PayloadTooLarge { name: String, len: usize },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised while binding physical devices to lens sides.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("device name {0:?} does not identify a lens side")]
    UnrecognizedName(String),

    #[error("{side} side is already bound to {address}")]
    AlreadyBound { side: Side, address: String },

    #[error("no side is bound to address {0}")]
    UnknownAddress(String),
}
