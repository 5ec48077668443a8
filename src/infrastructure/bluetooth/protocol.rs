//! Even G1 Protocol
//!
//! Constants and small helpers for talking to the Even Realities G1 lenses
//! over the Nordic UART service. Each lens is a separate peripheral that
//! speaks the same byte protocol.

use crate::domain::models::Side;

/// Nordic UART service exposed by both lenses.
pub const SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/// Characteristic the phone writes commands to.
pub const UART_TX_CHAR_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

/// Characteristic the lenses notify responses and events on.
pub const UART_RX_CHAR_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

pub const MTU: u16 = 251;

/// The MTU suggests larger packets, but the firmware never sends more than
/// 180 bytes of payload and is assumed to only accept that much.
pub const MAX_PACKET_SIZE_BYTES: usize = 180;

/// The glasses drop the link after ~30s without traffic.
pub const HEART_BEAT_DELAY_MS: u64 = 28_000;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;
pub const DISPLAY_SETTINGS_PREVIEW_DELAY_MS: u64 = 3_000;
pub const DEFAULT_RETRY_COUNT: u32 = 5;

/// Notifications from apps outside the firmware whitelist are dropped by the
/// glasses. Filtering happens on the phone, so every notification is sent
/// under this single whitelisted id.
pub const FIXED_NOTIFICATION_APP_ID: (&str, &str) = ("nodomain.freeyourgadget.gadget", "Name");

/// Command opcodes, always the first byte of a packet.
pub mod opcode {
    pub const SET_BRIGHTNESS_SETTINGS: u8 = 0x01;
    pub const SET_SILENT_MODE_SETTINGS: u8 = 0x03;
    pub const SET_NOTIFICATION_APP_SETTINGS: u8 = 0x04;
    pub const DASHBOARD_CONFIG: u8 = 0x06;
    pub const SET_HEAD_GESTURE_SETTINGS: u8 = 0x0B;
    pub const DASHBOARD_SHOWN: u8 = 0x22;
    pub const SYSTEM: u8 = 0x23;
    pub const HEARTBEAT: u8 = 0x25;
    pub const SET_DISPLAY_SETTINGS: u8 = 0x26;
    pub const SET_WEAR_DETECTION_SETTINGS: u8 = 0x27;
    pub const GET_BRIGHTNESS_SETTINGS: u8 = 0x29;
    pub const GET_SILENT_MODE_SETTINGS: u8 = 0x2B;
    pub const BATTERY_LEVEL: u8 = 0x2C;
    pub const GET_HEAD_GESTURE_SETTINGS: u8 = 0x32;
    pub const GET_SERIAL_NUMBER: u8 = 0x34;
    pub const GET_WEAR_DETECTION_SETTINGS: u8 = 0x3A;
    pub const GET_DISPLAY_SETTINGS: u8 = 0x3B;
    pub const GET_NOTIFICATION_DISPLAY_SETTINGS: u8 = 0x3C;
    pub const SEND_NOTIFICATION: u8 = 0x4B;
    pub const SEND_CLEAR_NOTIFICATION: u8 = 0x4C;
    pub const INIT: u8 = 0x4D;
    pub const SET_NOTIFICATION_DISPLAY_SETTINGS: u8 = 0x4F;
    pub const FW_INFO_RESPONSE: u8 = 0x6E;
    pub const DEBUG_LOG: u8 = 0xF4;
    pub const DEVICE_EVENT: u8 = 0xF5;
}

/// Sub-commands of [`opcode::SYSTEM`].
pub mod system {
    pub const RESET: u8 = 0x72;
    pub const GET_FW_INFO: u8 = 0x74;
    pub const SET_DEBUG_LOGGING: u8 = 0x6C;
}

pub mod command_status {
    pub const SUCCESS: u8 = 0xC9;
    pub const FAILED: u8 = 0xCA;
    pub const DATA_CONTINUES: u8 = 0xCA;
}

pub mod silent_status {
    pub const ENABLE: u8 = 0x0C;
    pub const DISABLE: u8 = 0x0A;
}

pub mod debug_logging_status {
    pub const ENABLE: u8 = 0x00;
    pub const DISABLE: u8 = 0x31;
}

pub mod dashboard {
    pub const SUB_COMMAND_SET_TIME_AND_WEATHER: u8 = 0x01;
    pub const SUB_COMMAND_SET_MODE: u8 = 0x06;

    pub const MODE_FULL: u8 = 0x00;
    pub const MODE_DUAL: u8 = 0x01;
    pub const MODE_MINIMAL: u8 = 0x02;

    pub const PANE_NOTES: u8 = 0x00;
    pub const PANE_STOCKS: u8 = 0x01;
    pub const PANE_NEWS: u8 = 0x02;
    pub const PANE_CALENDAR: u8 = 0x03;
    pub const PANE_NAVIGATION: u8 = 0x04;
    pub const PANE_EMPTY: u8 = 0x05;
}

/// Event ids carried by unsolicited [`opcode::DEVICE_EVENT`] frames.
pub mod device_event {
    pub const DOUBLE_TAP_FOR_EXIT: u8 = 0x00;
    pub const HEAD_UP: u8 = 0x02;
    pub const HEAD_DOWN: u8 = 0x03;
    pub const SILENT_MODE_ENABLED: u8 = 0x04;
    pub const SILENT_MODE_DISABLED: u8 = 0x05;
    pub const GLASSES_WORN: u8 = 0x06;
    pub const GLASSES_NOT_WORN_NO_CASE: u8 = 0x07;
    pub const CASE_LID_OPEN: u8 = 0x08;
    /// Payload 00 or 01.
    pub const GLASSES_CHARGING: u8 = 0x09;
    /// Payload 0-100.
    pub const GLASSES_SIDE_BATTERY_LEVEL: u8 = 0x0A;
    pub const CASE_LID_CLOSE: u8 = 0x0B;
    /// Payload 00 or 01.
    pub const CASE_CHARGING: u8 = 0x0E;
    /// Payload 0-100.
    pub const CASE_BATTERY_LEVEL: u8 = 0x0F;
    pub const BINDING_SUCCESS: u8 = 0x11;
    pub const DASHBOARD_SHOW: u8 = 0x1E;
    pub const DASHBOARD_CLOSE: u8 = 0x1F;
    pub const DOUBLE_TAP_FOR_ACTION: u8 = 0x20;
}

pub mod temperature_unit {
    pub const CELSIUS: u8 = 0x00;
    pub const FAHRENHEIT: u8 = 0x01;
}

pub mod time_format {
    pub const TWELVE_HOUR: u8 = 0x00;
    pub const TWENTY_FOUR_HOUR: u8 = 0x01;
}

pub mod weather_id {
    pub const NONE: u8 = 0x00;
    pub const NIGHT: u8 = 0x01;
    pub const CLOUDS: u8 = 0x02;
    pub const DRIZZLE: u8 = 0x03;
    pub const HEAVY_DRIZZLE: u8 = 0x04;
    pub const RAIN: u8 = 0x05;
    pub const HEAVY_RAIN: u8 = 0x06;
    pub const THUNDER: u8 = 0x07;
    pub const THUNDERSTORM: u8 = 0x08;
    pub const SNOW: u8 = 0x09;
    pub const MIST: u8 = 0x0A;
    pub const FOG: u8 = 0x0B;
    pub const SAND: u8 = 0x0C;
    pub const SQUALLS: u8 = 0x0D;
    pub const TORNADO: u8 = 0x0E;
    pub const FREEZING_RAIN: u8 = 0x0F;
    pub const SUNNY: u8 = 0x10;
}

/// Serial number fragments describing the frame.
pub mod hardware_key {
    pub const FRAME_ROUND: &str = "S100";
    pub const FRAME_SQUARE: &str = "S110";
    pub const COLOR_GREY: &str = "LAA";
    pub const COLOR_BROWN: &str = "LBB";
    pub const COLOR_GREEN: &str = "LCC";
}

const SIDE_PREFIX: &str = "Even G1_XX_X";
const NAME_PREFIX: &str = "Even G1_XX";

/// Extract the side from an advertised name such as `Even G1_42_L_1A2B3C`.
pub fn side_from_full_name(device_name: &str) -> Option<Side> {
    let prefix = device_name.get(..SIDE_PREFIX.len())?;
    match prefix.chars().last()? {
        'L' => Some(Side::Left),
        'R' => Some(Side::Right),
        _ => None,
    }
}

/// Name shared by both lenses, e.g. `Even G1_42`.
pub fn name_from_full_name(device_name: &str) -> Option<&str> {
    device_name.get(..NAME_PREFIX.len())
}

/// Map an OpenWeatherMap condition code to the glasses' weather icon.
pub fn weather_icon_from_condition(condition: u16) -> u8 {
    use weather_id::*;

    match condition {
        200..=202 | 210..=212 | 221 | 230..=232 => THUNDERSTORM,
        300 | 301 | 310 => DRIZZLE,
        302 | 311..=314 | 321 => HEAVY_DRIZZLE,
        500 | 501 => RAIN,
        502..=504 | 511 | 520..=522 | 531 => HEAVY_RAIN,
        600..=602 => SNOW,
        611 | 612 | 615 | 616 | 620..=622 => FREEZING_RAIN,
        701 | 721 => MIST,
        711 | 741 => FOG,
        731 | 751 | 761 | 762 => SAND,
        771 => SQUALLS,
        781 | 900 => TORNADO,
        800 => SUNNY,
        801..=804 => CLOUDS,
        903 => SNOW,
        904 => SUNNY,
        905 => NONE,
        906 => THUNDERSTORM,
        951 => SUNNY,
        952..=958 => SQUALLS,
        901 | 902 | 959..=962 => TORNADO,
        _ => SUNNY,
    }
}

/// Hex dump used in protocol logs.
pub fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
