//! Transport boundary.
//!
//! The GATT connection itself lives outside this crate. Sessions only need to
//! write a packet to one lens and receive the notifications it sends back.

use crate::domain::error::TransportError;
use crate::domain::models::Side;
use tokio::sync::mpsc;

/// Byte pipe to both lenses, addressed by [`Side`].
///
/// `write` must not deliver notifications synchronously: responses are
/// expected on the stream returned by `subscribe_notify`, after `write` has
/// returned.
pub trait Transport: Send + Sync + 'static {
    fn write(&self, side: Side, packet: &[u8]) -> Result<(), TransportError>;

    /// Stream of notification payloads from the UART RX characteristic.
    fn subscribe_notify(&self, side: Side)
        -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError>;

    fn is_connected(&self, side: Side) -> bool;

    fn request_mtu(&self, side: Side, mtu: u16) -> Result<(), TransportError>;
}
