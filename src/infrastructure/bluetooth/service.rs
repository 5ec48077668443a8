//! Dual Peer Coordinator Module
//!
//! Drives the two lens sessions of one pair of glasses as a single device:
//! connection steps per side, inbound routing, leader-first broadcasts and
//! the device-level ready/post-initialization sequence.

use crate::domain::error::{CommandError, PairingError, TransportError};
use crate::domain::models::{
    DeviceEvent, DeviceState, NotificationSpec, PeerIdentity, ReportedSetting, Side, WeatherSpec,
};
use crate::domain::settings::{ConfigKey, DevicePreferences, SessionSettings, Settings};
use crate::infrastructure::bluetooth::{
    command::{Command, CommandHandler},
    commands::{self, parse, Request, SetDashboardMode, SetDisplaySettings, SetTimeAndWeather},
    peers::{DiscoveredDevice, PeerRegistry},
    protocol,
    session::{PeerSession, SessionContext},
};
use chrono::Local;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Device-level state shared with response callbacks.
#[derive(Default)]
struct DeviceInfo {
    firmware: [Option<String>; 2],
}

/// Owns both lens sessions of one device.
pub struct DualPeerCoordinator {
    context: SessionContext,
    left: PeerSession,
    right: PeerSession,
    peers: Mutex<PeerRegistry>,
    preferences: Mutex<DevicePreferences>,
    weather: Mutex<Option<WeatherSpec>>,
    info: Arc<Mutex<DeviceInfo>>,
    /// Serializes leader-first broadcasts so two of them never interleave.
    lens_skew: tokio::sync::Mutex<()>,
    /// Set once both sides reached ready in the current connection cycle.
    both_ready: Mutex<bool>,
    pumps: Mutex<[Option<JoinHandle<()>>; 2]>,
    post_initialize: Mutex<Option<JoinHandle<()>>>,
}

impl DualPeerCoordinator {
    /// Both sessions start disconnected. A persisted pairing is loaded into the peer registry.
    pub fn new(context: SessionContext, settings: &Settings) -> Arc<Self> {
        let peers = settings
            .paired_device
            .as_ref()
            .map(PeerRegistry::from_paired)
            .unwrap_or_default();

        Arc::new(Self {
            left: PeerSession::new(Side::Left, context.clone(), settings.session.clone()),
            right: PeerSession::new(Side::Right, context.clone(), settings.session.clone()),
            context,
            peers: Mutex::new(peers),
            preferences: Mutex::new(settings.preferences.clone()),
            weather: Mutex::new(None),
            info: Arc::new(Mutex::new(DeviceInfo::default())),
            lens_skew: tokio::sync::Mutex::new(()),
            both_ready: Mutex::new(false),
            pumps: Mutex::new([None, None]),
            post_initialize: Mutex::new(None),
        })
    }

    pub fn session(&self, side: Side) -> &PeerSession {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn sessions(&self) -> [&PeerSession; 2] {
        [&self.left, &self.right]
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.context.events.send(event);
    }

    pub fn preferences(&self) -> DevicePreferences {
        lock(&self.preferences).clone()
    }

    /// Store new preferences. Nothing is sent until [`send_configuration`](Self::send_configuration).
    pub fn set_preferences(&self, preferences: DevicePreferences) {
        *lock(&self.preferences) = preferences;
    }

    /// Apply new session settings to both lenses.
    pub fn update_session_settings(&self, settings: SessionSettings) {
        for session in self.sessions() {
            session.update_settings(settings.clone());
        }
    }

    /// Firmware version reported by the left lens, falling back to the right.
    pub fn firmware_version(&self) -> Option<String> {
        let info = lock(&self.info);
        info.firmware.iter().flatten().next().cloned()
    }

    // ---- Peers ----

    /// Snapshot of the left/right address map.
    pub fn peers(&self) -> PeerRegistry {
        lock(&self.peers).clone()
    }

    /// Bind a discovered lens, typically the follower once it shows up.
    pub fn bind_peer(&self, device: &DiscoveredDevice) -> Result<PeerIdentity, PairingError> {
        lock(&self.peers).bind_discovered(device)
    }

    /// Reconnecting on our own is only safe once both lenses are known.
    pub fn use_auto_connect(&self) -> bool {
        lock(&self.peers).is_complete()
    }

    // ---- Connection lifecycle ----

    /// Bring one side up: MTU, notification stream, session initialization.
    pub fn connect_side(self: &Arc<Self>, side: Side) -> Result<(), TransportError> {
        let session = self.session(side);
        session.on_connecting();
        let mtu = session.settings().mtu;
        let transport = &self.context.transport;

        info!("Step 1: Requesting MTU {} on side {}", mtu, side);
        let subscribed = transport
            .request_mtu(side, mtu)
            .and_then(|()| {
                info!("Step 2: Subscribing to notifications on side {}", side);
                transport.subscribe_notify(side)
            });

        let notifications = match subscribed {
            Ok(notifications) => notifications,
            Err(e) => {
                warn!("Side {} could not be set up, will attempt to reconnect: {}", side, e);
                session.on_disconnected();
                self.emit(DeviceEvent::DeviceState(DeviceState::WaitingForReconnect));
                return Err(e);
            }
        };

        self.spawn_pump(side, notifications);
        info!("Step 3: Initializing side {}", side);
        session.initialize();
        self.check_both_ready();
        Ok(())
    }

    fn spawn_pump(
        self: &Arc<Self>,
        side: Side,
        mut notifications: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let coordinator = Arc::downgrade(self);
        let pump = self.context.runtime.spawn(async move {
            while let Some(payload) = notifications.recv().await {
                let Some(coordinator) = Weak::upgrade(&coordinator) else {
                    break;
                };
                coordinator.route_inbound(side, &payload);
            }
            debug!("Notification stream for side {} ended", side);
        });

        if let Some(previous) = lock(&self.pumps)[side.device_index()].replace(pump) {
            previous.abort();
        }
    }

    /// Tear one side down. The device as a whole is no longer initialized.
    pub fn disconnect_side(&self, side: Side) {
        info!("Side {} disconnected", side);
        self.session(side).on_disconnected();
        if let Some(pump) = lock(&self.pumps)[side.device_index()].take() {
            pump.abort();
        }

        let was_ready = std::mem::replace(&mut *lock(&self.both_ready), false);
        if was_ready {
            if let Some(task) = lock(&self.post_initialize).take() {
                task.abort();
            }
            self.emit(DeviceEvent::DeviceState(DeviceState::Disconnected));
        }
    }

    /// Fires the device-ready transition exactly once per connection cycle.
    fn check_both_ready(self: &Arc<Self>) {
        {
            let mut both_ready = lock(&self.both_ready);
            if *both_ready || !self.left.is_ready() || !self.right.is_ready() {
                return;
            }
            *both_ready = true;
        }
        self.on_both_ready();
    }

    fn on_both_ready(self: &Arc<Self>) {
        info!("Both lenses ready");
        self.emit(DeviceEvent::DeviceState(DeviceState::Initialized));

        let settings = self.left.settings();
        if !settings.auto_post_initialize {
            return;
        }

        let delay = settings.post_initialize_delay();
        let coordinator = Arc::downgrade(self);
        let task = self.context.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(coordinator) = Weak::upgrade(&coordinator) {
                coordinator.post_initialize().await;
            }
        });
        if let Some(previous) = lock(&self.post_initialize).replace(task) {
            previous.abort();
        }
    }

    // ---- Inbound routing ----

    /// Hand an inbound payload to the session of `side`.
    pub fn route_inbound(&self, side: Side, payload: &[u8]) -> bool {
        self.session(side).handle_inbound_payload(payload)
    }

    /// Route by BLE address. Payloads from an unknown address are dropped.
    pub fn route_inbound_from_address(&self, address: &str, payload: &[u8]) -> bool {
        let side = lock(&self.peers).require_side_of(address);
        match side {
            Ok(side) => self.route_inbound(side, payload),
            Err(_) => {
                debug!(
                    "Unhandled payload from {}: {}",
                    address,
                    protocol::format_bytes(payload)
                );
                false
            }
        }
    }

    // ---- Ordered broadcast ----

    /// Send to the left lens and wait for its answer, then to the right lens
    /// whatever the left one did. The right lens ignores some commands that
    /// reach it before the left. Returns whether the left lens answered.
    pub async fn broadcast_ordered<F>(&self, factory: F) -> bool
    where
        F: Fn(Side) -> Box<dyn CommandHandler> + Send,
    {
        let _skew = self.lens_skew.lock().await;

        let leader = Command::from_boxed(factory(Side::Left));
        let answered = self.left.send_and_wait(&leader).await;
        if !answered {
            error!("{} on left lens timed out", leader.name());
            self.emit(DeviceEvent::DeviceState(DeviceState::WaitingForReconnect));
        }

        self.right.send(&Command::from_boxed(factory(Side::Right)));
        answered
    }

    // ---- Post-initialization ----

    async fn post_initialize(&self) {
        info!("Post-initializing both lenses");
        self.post_initialize_left();
        self.post_initialize_right();
        self.set_dashboard_mode().await;
        self.set_time_and_weather().await;
    }

    fn post_initialize_common(&self, side: Side) {
        let session = self.session(side);
        session.send(&session.battery_command());

        let device_info = self.info.clone();
        let events = self.context.events.clone();
        session.send(&Command::with_callback(
            Request::firmware_info(),
            move |payload| match parse::firmware_version(payload) {
                Some(version) => {
                    info!("Side {} runs firmware {}", side, version);
                    lock(&device_info).firmware[side.device_index()] = Some(version.clone());
                    let _ = events.send(DeviceEvent::FirmwareVersion { side, version });
                    true
                }
                None => false,
            },
        ));

        let tracked = session.clone();
        let events = self.context.events.clone();
        session.send(&Command::with_callback(
            Request::silent_mode(),
            move |payload| match parse::silent_mode_enabled(payload) {
                Some(enabled) => {
                    tracked.set_silent_mode(enabled);
                    let _ = events.send(DeviceEvent::Setting {
                        side,
                        setting: ReportedSetting::SilentMode(enabled),
                    });
                    true
                }
                None => false,
            },
        ));
    }

    fn query_setting(
        &self,
        side: Side,
        request: Request,
        parser: fn(&[u8]) -> Option<ReportedSetting>,
    ) {
        let events = self.context.events.clone();
        self.session(side)
            .send(&Command::with_callback(request, move |payload| {
                match parser(payload) {
                    Some(setting) => {
                        let _ = events.send(DeviceEvent::Setting { side, setting });
                        true
                    }
                    None => false,
                }
            }));
    }

    fn post_initialize_left(&self) {
        self.post_initialize_common(Side::Left);
        // The left lens is the master for these.
        self.query_setting(Side::Left, Request::brightness_settings(), parse::brightness);

        let events = self.context.events.clone();
        self.left.send(&Command::with_callback(
            Request::serial_number(),
            move |payload| match parse::hardware_info(payload) {
                Some(hardware) => {
                    let _ = events.send(DeviceEvent::Hardware(hardware));
                    true
                }
                None => false,
            },
        ));

        let max_packet_size = self.left.settings().max_packet_size;
        match commands::set_app_notification_settings(
            &[protocol::FIXED_NOTIFICATION_APP_ID],
            false,
            false,
            false,
            max_packet_size,
        ) {
            Ok(whitelist) => {
                self.left.send_handler(whitelist);
            }
            Err(e) => warn!("Could not build the notification whitelist: {}", e),
        }
    }

    fn post_initialize_right(&self) {
        self.post_initialize_common(Side::Right);
        self.query_setting(
            Side::Right,
            Request::head_gesture_settings(),
            parse::activation_angle,
        );
        self.query_setting(Side::Right, Request::display_settings(), parse::display_settings);
        self.query_setting(
            Side::Right,
            Request::wear_detection_settings(),
            parse::wear_detection,
        );
        self.query_setting(
            Side::Right,
            Request::notification_display_settings(),
            parse::notification_display,
        );
    }

    // ---- Device operations ----

    /// Send the preferred dashboard layout to both lenses, left first.
    pub async fn set_dashboard_mode(&self) -> bool {
        let preferences = self.preferences();
        self.broadcast_ordered(move |_| {
            Box::new(SetDashboardMode::new(
                preferences.dashboard_mode,
                preferences.dashboard_secondary_pane,
            ))
        })
        .await
    }

    /// Remember `weather` and push it along with the current time.
    pub async fn set_weather(&self, weather: Option<WeatherSpec>) -> bool {
        *lock(&self.weather) = weather;
        self.set_time_and_weather().await
    }

    /// Push the local wall clock and the last known weather to both lenses.
    pub async fn set_time_and_weather(&self) -> bool {
        let preferences = self.preferences();
        // Both lenses get the same snapshot even if the weather changes meanwhile.
        let weather = *lock(&self.weather);
        let inverted = self
            .firmware_version()
            .is_some_and(|version| commands::time_format_flag_inverted(&version));
        let use_12_hour_format = preferences.use_12_hour_format != inverted;

        let now = Local::now();
        let time_ms = now.timestamp_millis() + i64::from(now.offset().local_minus_utc()) * 1000;

        self.broadcast_ordered(move |_| {
            Box::new(SetTimeAndWeather::new(
                time_ms,
                use_12_hour_format,
                weather.as_ref(),
                preferences.use_fahrenheit,
            ))
        })
        .await
    }

    /// If both lenses agree, toggle both. Otherwise only the right one, which
    /// brings them back in sync.
    pub fn toggle_silent_mode(&self) {
        let targets = if self.left.silent_mode() == self.right.silent_mode() {
            vec![&self.left, &self.right]
        } else {
            vec![&self.right]
        };
        for session in targets {
            let enabled = session.toggle_silent_mode();
            session.send_handler(Request::set_silent_mode(enabled));
        }
    }

    /// Shown by the left lens only.
    pub fn send_notification(
        &self,
        notification: &NotificationSpec,
    ) -> Result<Arc<Command>, CommandError> {
        let notification = NotificationSpec {
            source_app_id: protocol::FIXED_NOTIFICATION_APP_ID.0.to_string(),
            ..notification.clone()
        };
        let max_packet_size = self.left.settings().max_packet_size;
        let command = commands::send_notification(&notification, max_packet_size)?;
        Ok(self.left.send_handler(command))
    }

    /// Clear a notification previously shown on the left lens.
    pub fn clear_notification(&self, message_id: u32) -> Arc<Command> {
        self.left.send_handler(Request::clear_notification(message_id))
    }

    /// Reboot both lenses.
    pub fn reset(&self) {
        for session in self.sessions() {
            session.send_handler(Request::reset());
        }
    }

    /// Push a changed preference to whichever lenses care about it.
    pub async fn send_configuration(&self, key: ConfigKey) {
        let preferences = self.preferences();
        debug!("Sending configuration {:?}", key);

        match key {
            ConfigKey::ActivationAngle => {
                self.right
                    .send_handler(Request::set_head_gesture_settings(preferences.activation_angle));
            }
            ConfigKey::TimeFormat | ConfigKey::TemperatureUnit => {
                self.set_time_and_weather().await;
            }
            ConfigKey::DashboardMode => {
                self.set_dashboard_mode().await;
            }
            ConfigKey::BatteryPollingEnabled | ConfigKey::BatteryPollingInterval => {
                for session in self.sessions() {
                    session.reschedule_battery_polling();
                }
            }
            _ => {
                for session in self.sessions() {
                    self.send_side_configuration(session, key, &preferences);
                }
            }
        }
    }

    fn send_side_configuration(
        &self,
        session: &PeerSession,
        key: ConfigKey,
        preferences: &DevicePreferences,
    ) {
        match key {
            ConfigKey::ScreenHeight | ConfigKey::ScreenDepth => {
                let (height, depth) = (preferences.screen_height, preferences.screen_depth);
                session.send_handler(SetDisplaySettings::new(true, height, depth));
                // A newer change replaces the pending closer.
                session.send_deferred(
                    session.settings().display_preview_delay(),
                    Command::new(SetDisplaySettings::new(false, height, depth)),
                );
            }
            ConfigKey::AutoBrightness | ConfigKey::Brightness => {
                session.send_handler(Request::set_brightness_settings(
                    preferences.auto_brightness,
                    preferences.brightness,
                ));
            }
            ConfigKey::WearDetection => {
                session.send_handler(Request::set_wear_detection_settings(
                    preferences.wear_detection,
                ));
            }
            ConfigKey::DeviceLogs => {
                session.set_debug_enabled(preferences.device_logs);
                session.send_handler(Request::set_debug_logging(preferences.device_logs));
            }
            ConfigKey::ScreenOnNotifications | ConfigKey::NotificationTimeout => {
                session.send_handler(Request::set_notification_display_settings(
                    preferences.screen_on_notifications,
                    preferences.notification_timeout_secs,
                ));
            }
            _ => {}
        }
    }
}
