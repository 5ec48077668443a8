//! Peripheral profile.
//!
//! The few device-specific pieces a [`PeerSession`](super::session::PeerSession)
//! needs on its own: the keepalive packet, the battery query and the decoding
//! of frames nobody asked for.

use super::command::CommandHandler;
use super::commands::{parse, HeartBeat, Request};
use super::protocol::device_event;
use crate::domain::models::{
    BatteryIndex, BatteryState, DeviceEvent, Gesture, ReportedSetting, Side,
};

/// A frame that did not answer any pending command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unsolicited {
    Events(Vec<DeviceEvent>),
    DebugLog(String),
}

pub trait PeripheralProfile: Send + Sync + 'static {
    /// Sequence-scoped, fire-and-forget keepalive.
    fn heartbeat(&self) -> Box<dyn CommandHandler>;

    fn battery_request(&self) -> Box<dyn CommandHandler>;

    fn battery_percent(&self, payload: &[u8]) -> Option<u8>;

    /// `None` when the frame is not recognized.
    fn decode_unsolicited(&self, side: Side, payload: &[u8]) -> Option<Unsolicited>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct G1Profile;

impl PeripheralProfile for G1Profile {
    fn heartbeat(&self) -> Box<dyn CommandHandler> {
        Box::new(HeartBeat::default())
    }

    fn battery_request(&self) -> Box<dyn CommandHandler> {
        Box::new(Request::battery_info())
    }

    fn battery_percent(&self, payload: &[u8]) -> Option<u8> {
        parse::battery_percent(payload)
    }

    fn decode_unsolicited(&self, side: Side, payload: &[u8]) -> Option<Unsolicited> {
        if let Some((event_id, value)) = parse::device_event(payload) {
            return decode_device_event(side, event_id, value).map(Unsolicited::Events);
        }
        parse::debug_log_message(payload).map(Unsolicited::DebugLog)
    }
}

fn battery_state(charging: u8) -> BatteryState {
    if charging == 0x01 {
        BatteryState::Charging
    } else {
        BatteryState::Normal
    }
}

fn decode_device_event(side: Side, event_id: u8, value: u8) -> Option<Vec<DeviceEvent>> {
    let lens = BatteryIndex::Lens(side);
    let gesture = |gesture| DeviceEvent::Gesture { side, gesture };

    let events = match event_id {
        device_event::GLASSES_CHARGING => vec![DeviceEvent::BatteryState {
            index: lens,
            state: battery_state(value),
        }],
        device_event::GLASSES_SIDE_BATTERY_LEVEL => vec![DeviceEvent::BatteryLevel {
            index: lens,
            percent: value,
        }],
        device_event::CASE_CHARGING => vec![DeviceEvent::BatteryState {
            index: BatteryIndex::Case,
            state: battery_state(value),
        }],
        device_event::CASE_BATTERY_LEVEL => vec![DeviceEvent::BatteryLevel {
            index: BatteryIndex::Case,
            percent: value,
        }],
        // Off the head and out of the case: the case battery is unknown.
        device_event::GLASSES_NOT_WORN_NO_CASE => vec![
            DeviceEvent::WearState { side, worn: false },
            DeviceEvent::BatteryState {
                index: BatteryIndex::Case,
                state: BatteryState::NoBattery,
            },
        ],
        device_event::GLASSES_WORN => vec![DeviceEvent::WearState { side, worn: true }],
        device_event::SILENT_MODE_ENABLED => vec![DeviceEvent::Setting {
            side,
            setting: ReportedSetting::SilentMode(true),
        }],
        device_event::SILENT_MODE_DISABLED => vec![DeviceEvent::Setting {
            side,
            setting: ReportedSetting::SilentMode(false),
        }],
        device_event::HEAD_UP => vec![gesture(Gesture::HeadUp)],
        device_event::HEAD_DOWN => vec![gesture(Gesture::HeadDown)],
        device_event::DOUBLE_TAP_FOR_EXIT => vec![gesture(Gesture::DoubleTapForExit)],
        device_event::DOUBLE_TAP_FOR_ACTION => vec![gesture(Gesture::DoubleTapForAction)],
        device_event::DASHBOARD_SHOW => vec![gesture(Gesture::DashboardShown)],
        device_event::DASHBOARD_CLOSE => vec![gesture(Gesture::DashboardClosed)],
        device_event::CASE_LID_OPEN => vec![gesture(Gesture::CaseLidOpened)],
        device_event::CASE_LID_CLOSE => vec![gesture(Gesture::CaseLidClosed)],
        device_event::BINDING_SUCCESS => vec![gesture(Gesture::BindingSuccess)],
        _ => return None,
    };
    Some(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_events() {
        let profile = G1Profile;
        assert_eq!(
            profile.decode_unsolicited(Side::Left, &[0xF5, 0x0A, 0x42]),
            Some(Unsolicited::Events(vec![DeviceEvent::BatteryLevel {
                index: BatteryIndex::Lens(Side::Left),
                percent: 0x42,
            }]))
        );
        assert_eq!(
            profile.decode_unsolicited(Side::Right, &[0xF5, 0x0E, 0x01]),
            Some(Unsolicited::Events(vec![DeviceEvent::BatteryState {
                index: BatteryIndex::Case,
                state: BatteryState::Charging,
            }]))
        );
    }

    #[test]
    fn test_not_worn_reports_wear_and_case() {
        let Some(Unsolicited::Events(events)) =
            G1Profile.decode_unsolicited(Side::Right, &[0xF5, 0x07, 0x00])
        else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 2);
        assert!(events.contains(&DeviceEvent::WearState {
            side: Side::Right,
            worn: false
        }));
    }

    #[test]
    fn test_gestures_and_unknown_events() {
        assert_eq!(
            G1Profile.decode_unsolicited(Side::Left, &[0xF5, 0x02]),
            Some(Unsolicited::Events(vec![DeviceEvent::Gesture {
                side: Side::Left,
                gesture: Gesture::HeadUp,
            }]))
        );
        assert_eq!(G1Profile.decode_unsolicited(Side::Left, &[0xF5, 0x7F, 0x00]), None);
        assert_eq!(G1Profile.decode_unsolicited(Side::Left, &[0x99, 0x00]), None);
    }

    #[test]
    fn test_debug_log_frame() {
        assert_eq!(
            G1Profile.decode_unsolicited(Side::Left, b"\xF4hello\x00"),
            Some(Unsolicited::DebugLog("hello".to_string()))
        );
    }
}
