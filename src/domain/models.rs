use serde::{Deserialize, Serialize};
use std::fmt;

/// One lens of the glasses. Each lens is an independent BLE peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    /// Index used by the transport to address this peripheral.
    pub fn device_index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }

    pub fn from_device_index(index: usize) -> Option<Side> {
        match index {
            0 => Some(Side::Left),
            1 => Some(Side::Right),
            _ => None,
        }
    }

    pub fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Logical role of a peripheral together with its physical address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub side: Side,
    pub address: String,
    pub name: String,
}

/// Per-side link state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Initializing,
    Ready,
}

/// Device-level state as surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Both lenses are ready.
    Initialized,
    /// A session-critical command kept failing; the link should be re-established.
    WaitingForReconnect,
    Disconnected,
}

/// Which battery a level or state report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryIndex {
    Lens(Side),
    Case,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryState {
    Normal,
    Charging,
    NoBattery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameShape {
    Round,
    Square,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameColor {
    Grey,
    Brown,
    Green,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareInfo {
    pub serial_number: String,
    pub shape: FrameShape,
    pub color: FrameColor,
}

/// Settings values read back from a lens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportedSetting {
    /// Height 0-8, depth in slider space 0-8.
    Display { height: u8, depth: u8 },
    ActivationAngle(u8),
    Brightness { level: u8, auto: bool },
    WearDetection(bool),
    NotificationDisplay { enabled: bool, timeout_secs: u8 },
    DebugLogging(bool),
    SilentMode(bool),
}

/// Spontaneous gestures and sensor changes reported by a lens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    HeadUp,
    HeadDown,
    DoubleTapForExit,
    DoubleTapForAction,
    DashboardShown,
    DashboardClosed,
    CaseLidOpened,
    CaseLidClosed,
    BindingSuccess,
}

/// Typed events delivered upward to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    DeviceState(DeviceState),
    LinkState { side: Side, state: LinkState },
    BatteryLevel { index: BatteryIndex, percent: u8 },
    BatteryState { index: BatteryIndex, state: BatteryState },
    FirmwareVersion { side: Side, version: String },
    Hardware(HardwareInfo),
    Setting { side: Side, setting: ReportedSetting },
    WearState { side: Side, worn: bool },
    Gesture { side: Side, gesture: Gesture },
    DebugLog { side: Side, message: String },
}

/// Notification to display on the glasses.
#[derive(Debug, Clone, Default)]
pub struct NotificationSpec {
    pub id: u32,
    pub source_app_id: String,
    pub source_name: String,
    pub title: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    /// Unix milliseconds.
    pub when: i64,
}

/// Current weather as provided by the weather source.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeatherSpec {
    /// OpenWeatherMap condition code.
    pub condition_code: u16,
    /// Kelvin.
    pub current_temp: i32,
    /// Unix seconds.
    pub timestamp: i64,
    pub sunrise: i64,
    pub sunset: i64,
}

impl WeatherSpec {
    pub fn is_night(&self) -> bool {
        (self.timestamp >= self.sunset && self.timestamp >= self.sunrise)
            || (self.timestamp < self.sunrise && self.timestamp < self.sunset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_indices() {
        assert_eq!(Side::Left.to_string(), "left");
        assert_eq!(Side::Left.other(), Side::Right);
        assert_eq!(Side::from_device_index(1), Some(Side::Right));
        assert_eq!(Side::from_device_index(2), None);
    }

    #[test]
    fn test_night_detection() {
        let day = WeatherSpec {
            timestamp: 1_000,
            sunrise: 500,
            sunset: 2_000,
            ..Default::default()
        };
        assert!(!day.is_night());

        let evening = WeatherSpec {
            timestamp: 2_500,
            ..day
        };
        assert!(evening.is_night());
    }
}
