use crate::domain::models::{PeerIdentity, Side};
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_true(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// Timing and retry policy for each lens session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Total transmissions per command, the first one included.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_true")]
    pub battery_polling_enabled: bool,
    #[serde(default = "default_battery_polling_interval_minutes")]
    pub battery_polling_interval_minutes: u64,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Consecutive failed battery polls before the device is marked as waiting for reconnect.
    #[serde(default = "default_critical_failure_threshold")]
    pub critical_failure_threshold: u32,
    #[serde(default = "default_display_preview_delay_ms")]
    pub display_preview_delay_ms: u64,
    #[serde(default = "default_post_initialize_delay_ms")]
    pub post_initialize_delay_ms: u64,
    #[serde(default = "default_true")]
    pub auto_post_initialize: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            retry_count: default_retry_count(),
            battery_polling_enabled: default_true(),
            battery_polling_interval_minutes: default_battery_polling_interval_minutes(),
            max_packet_size: default_max_packet_size(),
            mtu: default_mtu(),
            critical_failure_threshold: default_critical_failure_threshold(),
            display_preview_delay_ms: default_display_preview_delay_ms(),
            post_initialize_delay_ms: default_post_initialize_delay_ms(),
            auto_post_initialize: default_true(),
        }
    }
}

impl SessionSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// `None` when polling is disabled.
    pub fn battery_polling_interval(&self) -> Option<Duration> {
        if !self.battery_polling_enabled || self.battery_polling_interval_minutes == 0 {
            return None;
        }
        Some(Duration::from_secs(self.battery_polling_interval_minutes * 60))
    }

    pub fn display_preview_delay(&self) -> Duration {
        Duration::from_millis(self.display_preview_delay_ms)
    }

    pub fn post_initialize_delay(&self) -> Duration {
        Duration::from_millis(self.post_initialize_delay_ms)
    }
}

/// User preferences pushed to the glasses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePreferences {
    /// 0-8
    #[serde(default)]
    pub screen_height: u8,
    /// Slider space 0-8, the glasses use 1-9.
    #[serde(default)]
    pub screen_depth: u8,
    /// 0-60 degrees.
    #[serde(default = "default_activation_angle")]
    pub activation_angle: u8,
    #[serde(default = "default_true")]
    pub auto_brightness: bool,
    #[serde(default = "default_brightness")]
    pub brightness: u8,
    #[serde(default = "default_true")]
    pub wear_detection: bool,
    #[serde(default = "default_true")]
    pub screen_on_notifications: bool,
    #[serde(default = "default_notification_timeout")]
    pub notification_timeout_secs: u8,
    #[serde(default = "default_false")]
    pub use_12_hour_format: bool,
    #[serde(default = "default_false")]
    pub use_fahrenheit: bool,
    #[serde(default = "default_dashboard_mode")]
    pub dashboard_mode: u8,
    #[serde(default = "default_dashboard_pane")]
    pub dashboard_secondary_pane: u8,
    #[serde(default = "default_false")]
    pub device_logs: bool,
}

impl Default for DevicePreferences {
    fn default() -> Self {
        Self {
            screen_height: 0,
            screen_depth: 0,
            activation_angle: default_activation_angle(),
            auto_brightness: default_true(),
            brightness: default_brightness(),
            wear_detection: default_true(),
            screen_on_notifications: default_true(),
            notification_timeout_secs: default_notification_timeout(),
            use_12_hour_format: default_false(),
            use_fahrenheit: default_false(),
            dashboard_mode: default_dashboard_mode(),
            dashboard_secondary_pane: default_dashboard_pane(),
            device_logs: default_false(),
        }
    }
}

/// A preference that changed and has to be pushed to the glasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    BatteryPollingEnabled,
    BatteryPollingInterval,
    ScreenHeight,
    ScreenDepth,
    ActivationAngle,
    AutoBrightness,
    Brightness,
    WearDetection,
    DeviceLogs,
    ScreenOnNotifications,
    NotificationTimeout,
    TimeFormat,
    TemperatureUnit,
    DashboardMode,
}

/// Persisted pairing record: which physical device plays which side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairedDevice {
    pub name: String,
    pub left: Option<PeerIdentity>,
    pub right: Option<PeerIdentity>,
}

impl PairedDevice {
    pub fn peer(&self, side: Side) -> Option<&PeerIdentity> {
        match side {
            Side::Left => self.left.as_ref(),
            Side::Right => self.right.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub preferences: DevicePreferences,
    #[serde(default)]
    pub paired_device: Option<PairedDevice>,
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "even_g1_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_heartbeat_interval_ms() -> u64 {
    protocol::HEART_BEAT_DELAY_MS
}
fn default_command_timeout_ms() -> u64 {
    protocol::DEFAULT_COMMAND_TIMEOUT_MS
}
fn default_retry_count() -> u32 {
    protocol::DEFAULT_RETRY_COUNT
}
fn default_battery_polling_interval_minutes() -> u64 {
    15
}
fn default_max_packet_size() -> usize {
    protocol::MAX_PACKET_SIZE_BYTES
}
fn default_mtu() -> u16 {
    protocol::MTU
}
fn default_critical_failure_threshold() -> u32 {
    3
}
fn default_display_preview_delay_ms() -> u64 {
    protocol::DISPLAY_SETTINGS_PREVIEW_DELAY_MS
}
fn default_post_initialize_delay_ms() -> u64 {
    200
}
fn default_activation_angle() -> u8 {
    40
}
fn default_brightness() -> u8 {
    0x2A
}
fn default_notification_timeout() -> u8 {
    5
}
fn default_dashboard_mode() -> u8 {
    protocol::dashboard::MODE_MINIMAL
}
fn default_dashboard_pane() -> u8 {
    protocol::dashboard::PANE_EMPTY
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::open(settings_path))
    }

    /// Load settings from an explicit path, falling back to defaults.
    pub fn open(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Using default settings ({}): {}", settings_path.display(), e);
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("EvenG1Bridge");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Persist the side/address association discovered during pairing.
    pub fn remember_pairing(&mut self, peer: PeerIdentity) -> anyhow::Result<()> {
        let paired = self.settings.paired_device.get_or_insert_with(|| PairedDevice {
            name: protocol::name_from_full_name(&peer.name)
                .unwrap_or(&peer.name)
                .to_string(),
            ..Default::default()
        });
        match peer.side {
            Side::Left => paired.left = Some(peer),
            Side::Right => paired.right = Some(peer),
        }
        self.save()
    }
}
