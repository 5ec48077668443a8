//! In-process transport.
//!
//! Records every packet written to each lens and feeds replies back through
//! the notification stream, either scripted by a responder or injected by
//! hand. Backs the demo binary and the session tests.

use super::protocol::{command_status, opcode, system};
use super::transport::Transport;
use crate::domain::error::TransportError;
use crate::domain::models::Side;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::trace;

/// Produces the notifications a lens sends in reply to `packet`.
pub type Responder = Box<dyn Fn(Side, &[u8]) -> Vec<Vec<u8>> + Send + Sync>;

struct Lens {
    connected: bool,
    fail_writes: bool,
    mtu: Option<u16>,
    written: Vec<Vec<u8>>,
    notify: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl Default for Lens {
    fn default() -> Self {
        Self {
            connected: true,
            fail_writes: false,
            mtu: None,
            written: Vec::new(),
            notify: None,
        }
    }
}

pub struct LoopbackTransport {
    lenses: Mutex<[Lens; 2]>,
    responder: Mutex<Option<Responder>>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    /// Both lenses connected, nothing answers.
    pub fn new() -> Self {
        Self {
            lenses: Mutex::new([Lens::default(), Lens::default()]),
            responder: Mutex::new(None),
        }
    }

    pub fn with_responder(
        responder: impl Fn(Side, &[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        let transport = Self::new();
        transport.set_responder(responder);
        transport
    }

    /// Answers like a pair of G1 lenses on firmware 1.6.0.
    pub fn simulated_glasses() -> Self {
        Self::with_responder(simulated_g1_reply)
    }

    pub fn set_responder(
        &self,
        responder: impl Fn(Side, &[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    ) {
        *self.responder.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(responder));
    }

    pub fn clear_responder(&self) {
        *self.responder.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn lenses(&self) -> MutexGuard<'_, [Lens; 2]> {
        self.lenses.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_connected(&self, side: Side, connected: bool) {
        self.lenses()[side.device_index()].connected = connected;
    }

    pub fn set_fail_writes(&self, side: Side, fail: bool) {
        self.lenses()[side.device_index()].fail_writes = fail;
    }

    /// Push an unsolicited notification. Returns `false` when nobody subscribed.
    pub fn inject(&self, side: Side, payload: &[u8]) -> bool {
        match &self.lenses()[side.device_index()].notify {
            Some(notify) => notify.send(payload.to_vec()).is_ok(),
            None => false,
        }
    }

    /// Every packet written to `side`, oldest first.
    pub fn written(&self, side: Side) -> Vec<Vec<u8>> {
        self.lenses()[side.device_index()].written.clone()
    }

    /// Packets written to `side` whose first byte is `opcode`.
    pub fn written_with_opcode(&self, side: Side, opcode: u8) -> Vec<Vec<u8>> {
        self.lenses()[side.device_index()]
            .written
            .iter()
            .filter(|packet| packet.first() == Some(&opcode))
            .cloned()
            .collect()
    }

    pub fn clear_written(&self) {
        for lens in self.lenses().iter_mut() {
            lens.written.clear();
        }
    }

    pub fn mtu(&self, side: Side) -> Option<u16> {
        self.lenses()[side.device_index()].mtu
    }
}

impl Transport for LoopbackTransport {
    fn write(&self, side: Side, packet: &[u8]) -> Result<(), TransportError> {
        let notify = {
            let mut lenses = self.lenses();
            let lens = &mut lenses[side.device_index()];
            if !lens.connected {
                return Err(TransportError::NotConnected { side });
            }
            if lens.fail_writes {
                return Err(TransportError::WriteFailed {
                    side,
                    reason: "simulated write failure".to_string(),
                });
            }
            lens.written.push(packet.to_vec());
            lens.notify.clone()
        };

        let replies = match &*self.responder.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(responder) => responder(side, packet),
            None => Vec::new(),
        };

        if let Some(notify) = notify {
            for reply in replies {
                trace!("Loopback {} reply queued ({} bytes)", side, reply.len());
                let _ = notify.send(reply);
            }
        }
        Ok(())
    }

    fn subscribe_notify(
        &self,
        side: Side,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut lenses = self.lenses();
        let lens = &mut lenses[side.device_index()];
        if !lens.connected {
            return Err(TransportError::NotifyFailed {
                side,
                reason: "not connected".to_string(),
            });
        }
        lens.notify = Some(tx);
        Ok(rx)
    }

    fn is_connected(&self, side: Side) -> bool {
        self.lenses()[side.device_index()].connected
    }

    fn request_mtu(&self, side: Side, mtu: u16) -> Result<(), TransportError> {
        let mut lenses = self.lenses();
        let lens = &mut lenses[side.device_index()];
        if !lens.connected {
            return Err(TransportError::MtuFailed {
                side,
                mtu,
                reason: "not connected".to_string(),
            });
        }
        lens.mtu = Some(mtu);
        Ok(())
    }
}

/// Replies a G1 lens sends for `packet`.
pub fn simulated_g1_reply(side: Side, packet: &[u8]) -> Vec<Vec<u8>> {
    let Some(&op) = packet.first() else {
        return Vec::new();
    };
    let ok = command_status::SUCCESS;

    let reply = match op {
        opcode::INIT => vec![op, ok],
        opcode::SYSTEM if packet.get(1) == Some(&system::GET_FW_INFO) => {
            let mut info = vec![opcode::FW_INFO_RESPONSE];
            info.extend_from_slice(
                b"net build time: 2025-01-14 12:00:00, app build time 2025-01-14 11:59:00, ver 1.6.0, JBD DeviceID 4010",
            );
            info.push(0);
            info
        }
        opcode::SYSTEM => return Vec::new(),
        opcode::BATTERY_LEVEL => {
            let percent = match side {
                Side::Left => 85,
                Side::Right => 80,
            };
            vec![op, 0x66, percent]
        }
        opcode::HEARTBEAT => packet.to_vec(),
        opcode::GET_SILENT_MODE_SETTINGS => vec![op, ok, 0x0A, 0x06],
        opcode::GET_BRIGHTNESS_SETTINGS => vec![op, ok, 0x2A, 0x01],
        opcode::GET_HEAD_GESTURE_SETTINGS => vec![op, ok, 40, 0x01],
        opcode::GET_DISPLAY_SETTINGS => vec![op, ok, 2, 5],
        opcode::GET_WEAR_DETECTION_SETTINGS => vec![op, ok, 0x01, 0x00],
        opcode::GET_NOTIFICATION_DISPLAY_SETTINGS => vec![op, ok, 0x01, 0x05],
        opcode::GET_SERIAL_NUMBER => {
            let mut serial = vec![op, 0x33];
            serial.extend_from_slice(b"S110LAA0012345");
            serial
        }
        opcode::DASHBOARD_CONFIG if packet.len() >= 5 => {
            vec![op, 0x06, 0x00, packet[3], packet[4], ok]
        }
        opcode::SET_DISPLAY_SETTINGS if packet.len() >= 4 => {
            vec![op, 0x06, 0x00, packet[3], ok, 0x00]
        }
        opcode::SET_BRIGHTNESS_SETTINGS
        | opcode::SET_SILENT_MODE_SETTINGS
        | opcode::SET_NOTIFICATION_APP_SETTINGS
        | opcode::SET_HEAD_GESTURE_SETTINGS
        | opcode::SET_WEAR_DETECTION_SETTINGS
        | opcode::SET_NOTIFICATION_DISPLAY_SETTINGS
        | opcode::SEND_NOTIFICATION
        | opcode::SEND_CLEAR_NOTIFICATION => vec![op, ok],
        _ => return Vec::new(),
    };
    vec![reply]
}
