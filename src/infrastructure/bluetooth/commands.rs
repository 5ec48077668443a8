//! G1 command set.
//!
//! Every packet the bridge sends to a lens and the parsers for the responses
//! the lenses send back. Packets are built from the constants in
//! [`protocol`](super::protocol).

use super::command::{ChunkCodec, ChunkedCommand, CommandHandler};
use super::protocol::{
    self, dashboard, debug_logging_status, hardware_key, opcode, silent_status, system,
    temperature_unit, time_format, weather_id,
};
use crate::domain::error::CommandError;
use crate::domain::models::{
    FrameColor, FrameShape, HardwareInfo, NotificationSpec, ReportedSetting, WeatherSpec,
};
use chrono::{Local, TimeZone};
use serde::Serialize;

/// A command whose packet is fixed at construction and whose response is
/// recognized by opcode and a minimum length.
#[derive(Debug, Clone)]
pub struct Request {
    name: String,
    packet: Vec<u8>,
    response_opcode: u8,
    min_response_len: usize,
    expects_response: bool,
}

impl Request {
    fn new(name: impl Into<String>, packet: Vec<u8>, min_response_len: usize) -> Self {
        let response_opcode = packet[0];
        Self {
            name: name.into(),
            packet,
            response_opcode,
            min_response_len,
            expects_response: true,
        }
    }

    fn fire_and_forget(name: impl Into<String>, packet: Vec<u8>) -> Self {
        Self {
            expects_response: false,
            ..Self::new(name, packet, usize::MAX)
        }
    }

    /// Handshake sent once per connection. The lens answers with its status.
    pub fn init() -> Self {
        Self::new("send_init", vec![opcode::INIT, 0xFB], 1)
    }

    /// Reboot the lens. No response is expected.
    pub fn reset() -> Self {
        Self::fire_and_forget("send_reset", vec![opcode::SYSTEM, system::RESET])
    }

    /// Firmware build string, answered with a separate info opcode.
    pub fn firmware_info() -> Self {
        Self {
            response_opcode: opcode::FW_INFO_RESPONSE,
            ..Self::new(
                "get_firmware_info",
                vec![opcode::SYSTEM, system::GET_FW_INFO],
                10,
            )
        }
    }

    pub fn battery_info() -> Self {
        Self::new("get_battery_info", vec![opcode::BATTERY_LEVEL, 0x01], 1)
    }

    /// Whether silent mode is on.
    pub fn silent_mode() -> Self {
        Self::new("get_silent_status", vec![opcode::GET_SILENT_MODE_SETTINGS], 4)
    }

    pub fn set_silent_mode(enable: bool) -> Self {
        let status = if enable {
            silent_status::ENABLE
        } else {
            silent_status::DISABLE
        };
        Self::new(
            format!("set_silent_mode_settings_{}", enabled_str(enable)),
            vec![opcode::SET_SILENT_MODE_SETTINGS, status],
            2,
        )
    }

    /// Screen height and depth.
    pub fn display_settings() -> Self {
        Self::new("get_display_settings", vec![opcode::GET_DISPLAY_SETTINGS], 4)
    }

    /// Head-up activation angle.
    pub fn head_gesture_settings() -> Self {
        Self::new(
            "get_head_gesture_settings",
            vec![opcode::GET_HEAD_GESTURE_SETTINGS],
            4,
        )
    }

    /// `angle` is 0-60 degrees.
    pub fn set_head_gesture_settings(angle: u8) -> Self {
        Self::new(
            format!("set_head_gesture_settings_{}", angle),
            vec![opcode::SET_HEAD_GESTURE_SETTINGS, angle, 0x01],
            1,
        )
    }

    /// Brightness level and auto-brightness flag.
    pub fn brightness_settings() -> Self {
        Self::new(
            "get_brightness_settings",
            vec![opcode::GET_BRIGHTNESS_SETTINGS],
            4,
        )
    }

    /// Manual `level` applies when `auto` is off.
    pub fn set_brightness_settings(auto: bool, level: u8) -> Self {
        Self::new(
            format!("set_brightness_settings_{}_{}", auto, level),
            vec![opcode::SET_BRIGHTNESS_SETTINGS, level, u8::from(auto)],
            2,
        )
    }

    pub fn wear_detection_settings() -> Self {
        Self::new(
            "get_wear_detection_settings",
            vec![opcode::GET_WEAR_DETECTION_SETTINGS],
            3,
        )
    }

    /// Turn the screen on and off as the glasses are put on or taken off.
    pub fn set_wear_detection_settings(enable: bool) -> Self {
        Self::new(
            format!("set_wear_detection_settings_{}", enabled_str(enable)),
            vec![opcode::SET_WEAR_DETECTION_SETTINGS, u8::from(enable)],
            2,
        )
    }

    /// Serial number of the frame, which also encodes its shape and color.
    pub fn serial_number() -> Self {
        Self::new("get_serial_number", vec![opcode::GET_SERIAL_NUMBER], 16)
    }

    pub fn notification_display_settings() -> Self {
        Self::new(
            "get_notification_display_settings",
            vec![opcode::GET_NOTIFICATION_DISPLAY_SETTINGS],
            4,
        )
    }

    /// Whether notifications wake the screen and for how many seconds.
    pub fn set_notification_display_settings(enable: bool, timeout_secs: u8) -> Self {
        Self::new(
            format!(
                "set_notification_display_settings_{}_{}",
                enabled_str(enable),
                timeout_secs
            ),
            vec![
                opcode::SET_NOTIFICATION_DISPLAY_SETTINGS,
                u8::from(enable),
                timeout_secs,
            ],
            2,
        )
    }

    /// Remove a notification from the lens by message id.
    pub fn clear_notification(message_id: u32) -> Self {
        let mut packet = vec![opcode::SEND_CLEAR_NOTIFICATION];
        packet.extend_from_slice(&message_id.to_be_bytes());
        Self::new(format!("send_clear_notification_{}", message_id), packet, 1)
    }

    /// Ask the lens to stream its debug log. Not acknowledged.
    pub fn set_debug_logging(enable: bool) -> Self {
        let status = if enable {
            debug_logging_status::ENABLE
        } else {
            debug_logging_status::DISABLE
        };
        Self::fire_and_forget(
            format!("set_debug_mode_settings_{}", enabled_str(enable)),
            vec![opcode::SYSTEM, system::SET_DEBUG_LOGGING, status],
        )
    }
}

impl CommandHandler for Request {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn serialize(&self) -> Vec<u8> {
        self.packet.clone()
    }

    fn response_matches(&self, payload: &[u8]) -> bool {
        self.expects_response
            && payload.len() >= self.min_response_len
            && payload.first() == Some(&self.response_opcode)
    }

    fn expects_response(&self) -> bool {
        self.expects_response
    }
}

fn enabled_str(enable: bool) -> &'static str {
    if enable {
        "enabled"
    } else {
        "disabled"
    }
}

/// Keepalive. The glasses drop the link after ~30s of silence.
#[derive(Debug, Clone, Default)]
pub struct HeartBeat {
    sequence: u8,
}

impl CommandHandler for HeartBeat {
    fn name(&self) -> String {
        "send_heart_beat".to_string()
    }

    fn serialize(&self) -> Vec<u8> {
        // The sequence is carried twice and checked by the firmware.
        vec![opcode::HEARTBEAT, 0x00, 0x06, self.sequence, 0x04, self.sequence]
    }

    fn response_matches(&self, _payload: &[u8]) -> bool {
        false
    }

    fn expects_response(&self) -> bool {
        false
    }

    fn needs_global_sequence(&self) -> bool {
        true
    }

    fn set_global_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }
}

fn dashboard_response_matches(payload: &[u8], sequence: u8, sub_command: u8) -> bool {
    payload.len() >= 5
        && payload[0] == opcode::DASHBOARD_CONFIG
        && payload[3] == sequence
        && payload[4] == sub_command
}

/// Wall clock and current weather shown on the dashboard.
#[derive(Debug, Clone)]
pub struct SetTimeAndWeather {
    /// Local wall-clock time in Unix milliseconds.
    time_ms: i64,
    use_12_hour_format: bool,
    weather_icon: u8,
    temp_celsius: i8,
    use_fahrenheit: bool,
    sequence: u8,
}

impl SetTimeAndWeather {
    /// `time_ms` is the local wall clock. Without `weather` no icon is shown.
    pub fn new(
        time_ms: i64,
        use_12_hour_format: bool,
        weather: Option<&WeatherSpec>,
        use_fahrenheit: bool,
    ) -> Self {
        let (weather_icon, temp_celsius) = match weather {
            Some(weather) => {
                let mut icon = protocol::weather_icon_from_condition(weather.condition_code);
                if icon == weather_id::SUNNY && weather.is_night() {
                    icon = weather_id::NIGHT;
                }
                (icon, (weather.current_temp - 273) as i8)
            }
            None => (weather_id::NONE, 0),
        };

        Self {
            time_ms,
            use_12_hour_format,
            weather_icon,
            temp_celsius,
            use_fahrenheit,
            sequence: 0,
        }
    }
}

impl CommandHandler for SetTimeAndWeather {
    fn name(&self) -> String {
        "set_time_and_weather".to_string()
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(21);
        packet.extend_from_slice(&[
            opcode::DASHBOARD_CONFIG,
            0x15,
            0x00,
            self.sequence,
            dashboard::SUB_COMMAND_SET_TIME_AND_WEATHER,
        ]);
        packet.extend_from_slice(&((self.time_ms / 1000) as u32).to_le_bytes());
        packet.extend_from_slice(&(self.time_ms as u64).to_le_bytes());
        packet.push(self.weather_icon);
        packet.push(self.temp_celsius as u8);
        packet.push(if self.use_fahrenheit {
            temperature_unit::FAHRENHEIT
        } else {
            temperature_unit::CELSIUS
        });
        packet.push(if self.use_12_hour_format {
            time_format::TWELVE_HOUR
        } else {
            time_format::TWENTY_FOUR_HOUR
        });
        packet
    }

    fn response_matches(&self, payload: &[u8]) -> bool {
        dashboard_response_matches(
            payload,
            self.sequence,
            dashboard::SUB_COMMAND_SET_TIME_AND_WEATHER,
        )
    }

    fn needs_global_sequence(&self) -> bool {
        true
    }

    fn set_global_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }
}

/// Firmware 1.6.0 flipped the meaning of the time format flag.
pub fn time_format_flag_inverted(firmware_version: &str) -> bool {
    let mut parts = firmware_version
        .split('.')
        .map(|part| part.trim().parse::<u32>().unwrap_or(0));
    let version = (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    );
    version >= (1, 6, 0)
}

#[derive(Debug, Clone)]
pub struct SetDashboardMode {
    mode: u8,
    secondary_pane: u8,
    sequence: u8,
}

impl SetDashboardMode {
    /// Dashboard layout and the pane shown next to it.
    pub fn new(mode: u8, secondary_pane: u8) -> Self {
        Self {
            mode,
            secondary_pane,
            sequence: 0,
        }
    }
}

impl CommandHandler for SetDashboardMode {
    fn name(&self) -> String {
        "set_dashboard_mode_settings".to_string()
    }

    fn serialize(&self) -> Vec<u8> {
        vec![
            opcode::DASHBOARD_CONFIG,
            0x07,
            0x00,
            self.sequence,
            dashboard::SUB_COMMAND_SET_MODE,
            self.mode,
            self.secondary_pane,
        ]
    }

    fn response_matches(&self, payload: &[u8]) -> bool {
        dashboard_response_matches(payload, self.sequence, dashboard::SUB_COMMAND_SET_MODE)
    }

    fn needs_global_sequence(&self) -> bool {
        true
    }

    fn set_global_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }
}

/// Screen position. With `preview` set the lens shows a placeholder until the
/// same values are sent again without it.
#[derive(Debug, Clone)]
pub struct SetDisplaySettings {
    preview: bool,
    height: u8,
    /// Device space 1-9.
    depth: u8,
    sequence: u8,
}

impl SetDisplaySettings {
    /// `depth` is in slider space 0-8.
    pub fn new(preview: bool, height: u8, depth: u8) -> Self {
        Self {
            preview,
            height,
            depth: depth.saturating_add(1),
            sequence: 0,
        }
    }
}

impl CommandHandler for SetDisplaySettings {
    fn name(&self) -> String {
        format!("set_display_settings_{}_{}", self.height, self.depth)
    }

    fn serialize(&self) -> Vec<u8> {
        vec![
            opcode::SET_DISPLAY_SETTINGS,
            0x08,
            0x00,
            self.sequence,
            0x02,
            u8::from(self.preview),
            self.height,
            self.depth,
        ]
    }

    fn response_matches(&self, payload: &[u8]) -> bool {
        payload.len() >= 6
            && payload[0] == opcode::SET_DISPLAY_SETTINGS
            && payload[1] == 0x06
            && payload[3] == self.sequence
    }

    fn needs_global_sequence(&self) -> bool {
        true
    }

    fn set_global_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }
}

/// JSON documents are sent as NUL-terminated ASCII.
fn ascii_payload(json: &str) -> Vec<u8> {
    let mut bytes: Vec<u8> = json
        .chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect();
    bytes.push(0);
    bytes
}

fn opcode_matches(payload: &[u8], expected: u8) -> bool {
    payload.first() == Some(&expected)
}

#[derive(Serialize)]
struct AppEntry<'a> {
    id: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct AppWhitelist<'a> {
    list: Vec<AppEntry<'a>>,
    enable: bool,
}

#[derive(Serialize)]
struct AppNotificationSettingsDocument<'a> {
    calendar_enable: bool,
    call_enable: bool,
    msg_enable: bool,
    ios_mail_enable: bool,
    app: AppWhitelist<'a>,
}

/// Header `[opcode, chunk_count, chunk_index]`.
#[derive(Debug, Clone, Default)]
pub struct AppNotificationSettingsCodec;

impl ChunkCodec for AppNotificationSettingsCodec {
    fn name(&self) -> String {
        "set_notification_app_settings".to_string()
    }

    fn header_size(&self) -> usize {
        3
    }

    fn write_header(&self, chunk_index: u8, chunk_count: u8, packet: &mut [u8]) {
        packet[0] = opcode::SET_NOTIFICATION_APP_SETTINGS;
        packet[1] = chunk_count;
        packet[2] = chunk_index;
    }

    fn chunk_matches(&self, _chunk_index: u8, payload: &[u8]) -> bool {
        opcode_matches(payload, opcode::SET_NOTIFICATION_APP_SETTINGS)
    }
}

/// Whitelist of apps whose notifications the lenses will display.
pub fn set_app_notification_settings(
    apps: &[(&str, &str)],
    enable_calendar: bool,
    enable_calls: bool,
    enable_sms: bool,
    max_packet_size: usize,
) -> Result<ChunkedCommand<AppNotificationSettingsCodec>, CommandError> {
    let document = AppNotificationSettingsDocument {
        calendar_enable: enable_calendar,
        call_enable: enable_calls,
        msg_enable: enable_sms,
        ios_mail_enable: false,
        app: AppWhitelist {
            list: apps
                .iter()
                .map(|&(id, name)| AppEntry { id, name })
                .collect(),
            enable: true,
        },
    };
    let json = serde_json::to_string(&document).unwrap_or_default();
    ChunkedCommand::new(
        AppNotificationSettingsCodec,
        ascii_payload(&json),
        max_packet_size,
    )
}

#[derive(Serialize)]
struct NotificationBody<'a> {
    msg_id: u32,
    action: u8,
    app_identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subtitle: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    time_s: i64,
    date: String,
    display_name: &'a str,
}

#[derive(Serialize)]
struct NotificationDocument<'a> {
    ncs_notification: NotificationBody<'a>,
}

/// Header `[opcode, 0x00, chunk_count, chunk_index]`.
#[derive(Debug, Clone)]
pub struct NotificationCodec {
    message_id: u32,
}

impl ChunkCodec for NotificationCodec {
    fn name(&self) -> String {
        format!("send_notification_{}", self.message_id)
    }

    fn header_size(&self) -> usize {
        4
    }

    fn write_header(&self, chunk_index: u8, chunk_count: u8, packet: &mut [u8]) {
        packet[0] = opcode::SEND_NOTIFICATION;
        packet[1] = 0x00;
        packet[2] = chunk_count;
        packet[3] = chunk_index;
    }

    fn chunk_matches(&self, _chunk_index: u8, payload: &[u8]) -> bool {
        opcode_matches(payload, opcode::SEND_NOTIFICATION)
    }
}

/// Notification document split into chunks of at most `max_packet_size` bytes.
pub fn send_notification(
    notification: &NotificationSpec,
    max_packet_size: usize,
) -> Result<ChunkedCommand<NotificationCodec>, CommandError> {
    let date = Local
        .timestamp_millis_opt(notification.when)
        .single()
        .map(|when| when.format("%a %b %d %H:%M:%S %Z %Y").to_string())
        .unwrap_or_default();

    let document = NotificationDocument {
        ncs_notification: NotificationBody {
            msg_id: notification.id,
            action: 0,
            app_identifier: notification.source_app_id.chars().take(31).collect(),
            title: notification.title.as_deref(),
            subtitle: notification.subject.as_deref(),
            message: notification.body.as_deref(),
            time_s: notification.when / 1000,
            date,
            display_name: &notification.source_name,
        },
    };
    let json = serde_json::to_string(&document).unwrap_or_default();
    ChunkedCommand::new(
        NotificationCodec {
            message_id: notification.id,
        },
        ascii_payload(&json),
        max_packet_size,
    )
}

/// Response parsers. Each returns `None` when the payload is too short.
pub mod parse {
    use super::*;

    /// Battery percentage of a battery response.
    pub fn battery_percent(payload: &[u8]) -> Option<u8> {
        payload.get(2).copied()
    }

    pub fn silent_mode_enabled(payload: &[u8]) -> Option<bool> {
        payload.get(2).map(|status| *status == silent_status::ENABLE)
    }

    /// Depth is converted back to slider space 0-8.
    pub fn display_settings(payload: &[u8]) -> Option<ReportedSetting> {
        Some(ReportedSetting::Display {
            height: *payload.get(2)?,
            depth: payload.get(3)?.saturating_sub(1),
        })
    }

    pub fn activation_angle(payload: &[u8]) -> Option<ReportedSetting> {
        payload.get(2).copied().map(ReportedSetting::ActivationAngle)
    }

    /// Auto-brightness flag and level.
    pub fn brightness(payload: &[u8]) -> Option<ReportedSetting> {
        Some(ReportedSetting::Brightness {
            level: *payload.get(2)?,
            auto: *payload.get(3)? == 0x01,
        })
    }

    pub fn wear_detection(payload: &[u8]) -> Option<ReportedSetting> {
        payload
            .get(2)
            .map(|enabled| ReportedSetting::WearDetection(*enabled == 0x01))
    }

    /// Screen-on flag and timeout in seconds.
    pub fn notification_display(payload: &[u8]) -> Option<ReportedSetting> {
        Some(ReportedSetting::NotificationDisplay {
            enabled: *payload.get(2)? == 0x01,
            timeout_secs: *payload.get(3)?,
        })
    }

    /// The 14 serial-number bytes after the response header.
    pub fn serial_number(payload: &[u8]) -> Option<String> {
        let bytes = payload.get(2..16)?;
        Some(bytes.iter().map(|b| *b as char).collect())
    }

    /// Frame shape and color decoded from a serial-number response.
    pub fn hardware_info(payload: &[u8]) -> Option<HardwareInfo> {
        let serial_number = serial_number(payload)?;
        let shape = match serial_number.get(0..4)? {
            hardware_key::FRAME_ROUND => FrameShape::Round,
            hardware_key::FRAME_SQUARE => FrameShape::Square,
            _ => return None,
        };
        let color = match serial_number.get(4..7)? {
            hardware_key::COLOR_GREY => FrameColor::Grey,
            hardware_key::COLOR_BROWN => FrameColor::Brown,
            hardware_key::COLOR_GREEN => FrameColor::Green,
            _ => return None,
        };
        Some(HardwareInfo {
            serial_number,
            shape,
            color,
        })
    }

    /// Extract `1.5.6` from an info string such as
    /// `"net build time: ... ver 1.5.6, JBD DeviceID 4010"`.
    pub fn firmware_version(payload: &[u8]) -> Option<String> {
        let info = String::from_utf8_lossy(payload);
        let info = info.trim_matches(|c: char| c <= ' ');
        let start = info.rfind(" ver ")? + " ver ".len();
        let end = start + info[start..].find(',')?;
        if end > start {
            Some(info[start..end].to_string())
        } else {
            None
        }
    }

    /// Text of a debug-log frame, without the opcode and trailing terminator.
    pub fn debug_log_message(payload: &[u8]) -> Option<String> {
        if payload.len() < 2 || payload[0] != opcode::DEBUG_LOG {
            return None;
        }
        let text = &payload[1..payload.len() - 1];
        Some(String::from_utf8_lossy(text).into_owned())
    }

    /// `(event_id, value)` of a device-event frame. The value is 0 when absent.
    pub fn device_event(payload: &[u8]) -> Option<(u8, u8)> {
        if payload.len() < 2 || payload[0] != opcode::DEVICE_EVENT {
            return None;
        }
        Some((payload[1], payload.get(2).copied().unwrap_or(0)))
    }
}
