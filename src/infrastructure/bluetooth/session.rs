//! Peer Session Module
//!
//! One [`PeerSession`] per lens. It owns the sequence counter, the registry of
//! commands waiting for a response, their timeout timers and the keepalive
//! and battery tasks.
//!
//! Locking: `write_lock` is taken before `state`, and `state` before a
//! command's own lock. Every transmission holds `write_lock` from the pending
//! registration through the transport write, so teardown (which also takes it)
//! never interleaves with a half-finished send.

use super::command::{Command, CommandHandler, Transmitter};
use super::profile::{G1Profile, PeripheralProfile, Unsolicited};
use super::protocol::format_bytes;
use super::transport::Transport;
use crate::domain::error::CommandError;
use crate::domain::models::{
    BatteryIndex, DeviceEvent, DeviceState, LinkState, ReportedSetting, Side,
};
use crate::domain::settings::SessionSettings;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Collaborators shared by both sessions of a device.
#[derive(Clone)]
pub struct SessionContext {
    pub transport: Arc<dyn Transport>,
    pub profile: Arc<dyn PeripheralProfile>,
    pub events: mpsc::UnboundedSender<DeviceEvent>,
    /// Timers and background tasks are spawned here.
    pub runtime: Handle,
}

impl SessionContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<DeviceEvent>,
        runtime: Handle,
    ) -> Self {
        Self {
            transport,
            profile: Arc::new(G1Profile),
            events,
            runtime,
        }
    }

    pub fn with_profile(mut self, profile: Arc<dyn PeripheralProfile>) -> Self {
        self.profile = profile;
        self
    }
}

struct PendingResponse {
    command: Arc<Command>,
    /// Identifies the timer armed for the latest attempt.
    generation: u64,
    timer: JoinHandle<()>,
}

struct SessionState {
    link: LinkState,
    settings: SessionSettings,
    pending: Vec<PendingResponse>,
    next_generation: u64,
    heartbeat: Option<JoinHandle<()>>,
    battery: Option<JoinHandle<()>>,
    deferred: Option<(u64, JoinHandle<()>)>,
    silent_mode: bool,
    debug_enabled: bool,
    last_heartbeat: Instant,
    failed_battery_polls: u32,
    failed_heartbeats: u32,
}

impl SessionState {
    fn stop_tasks(&mut self) {
        for task in [
            self.heartbeat.take(),
            self.battery.take(),
            self.deferred.take().map(|(_, task)| task),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

struct SessionInner {
    side: Side,
    context: SessionContext,
    sequence: AtomicU8,
    write_lock: Mutex<()>,
    state: Mutex<SessionState>,
}

/// Command transaction engine for one lens.
#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<SessionInner>,
}

impl PeerSession {
    /// A new session is disconnected. Call [`initialize`](Self::initialize) once the link is up.
    pub fn new(side: Side, context: SessionContext, settings: SessionSettings) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                side,
                context,
                sequence: AtomicU8::new(0),
                write_lock: Mutex::new(()),
                state: Mutex::new(SessionState {
                    link: LinkState::Disconnected,
                    settings,
                    pending: Vec::new(),
                    next_generation: 0,
                    heartbeat: None,
                    battery: None,
                    deferred: None,
                    silent_mode: false,
                    debug_enabled: false,
                    last_heartbeat: Instant::now(),
                    failed_battery_polls: 0,
                    failed_heartbeats: 0,
                }),
            }),
        }
    }

    fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(inner: &Weak<SessionInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wire(&self) -> MutexGuard<'_, ()> {
        self.inner.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.inner.context.events.send(event);
    }

    fn set_link(&self, state: &mut SessionState, link: LinkState) {
        if state.link != link {
            debug!("Side {}: {:?} -> {:?}", self.inner.side, state.link, link);
            state.link = link;
            self.emit(DeviceEvent::LinkState {
                side: self.inner.side,
                state: link,
            });
        }
    }

    pub fn side(&self) -> Side {
        self.inner.side
    }

    pub fn link_state(&self) -> LinkState {
        self.state().link
    }

    pub fn is_ready(&self) -> bool {
        self.link_state() == LinkState::Ready
    }

    pub fn settings(&self) -> SessionSettings {
        self.state().settings.clone()
    }

    /// Number of commands waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// The physical link is being established.
    pub fn on_connecting(&self) {
        let mut state = self.state();
        self.set_link(&mut state, LinkState::Connecting);
    }

    /// Enter the ready state and start the keepalive and battery tasks.
    /// Call once per physical (re)connection; a second call restarts the tasks.
    pub fn initialize(&self) {
        let mut state = self.state();
        self.set_link(&mut state, LinkState::Initializing);

        // The device cannot be queried for this; a debug-log frame flips it back on.
        state.debug_enabled = false;
        self.emit(DeviceEvent::Setting {
            side: self.inner.side,
            setting: ReportedSetting::DebugLogging(false),
        });

        state.last_heartbeat = Instant::now();
        state.failed_battery_polls = 0;
        state.failed_heartbeats = 0;
        self.start_heartbeat(&mut state);
        self.start_battery_polling(&mut state);

        self.set_link(&mut state, LinkState::Ready);
        info!("Side {} initialized", self.inner.side);
    }

    /// Tear the session down. Every pending command fails before this returns
    /// and no timer acts afterwards.
    pub fn on_disconnected(&self) {
        let _wire = self.wire();
        let drained: Vec<PendingResponse> = {
            let mut state = self.state();
            state.stop_tasks();
            self.set_link(&mut state, LinkState::Disconnected);
            state.pending.drain(..).collect()
        };

        if !drained.is_empty() {
            info!(
                "Side {} disconnected, failing {} pending commands",
                self.inner.side,
                drained.len()
            );
        }
        for entry in drained {
            entry.timer.abort();
            entry.command.fail(CommandError::Disconnected {
                name: entry.command.name().to_string(),
            });
        }
    }

    fn next_sequence(&self) -> u8 {
        self.inner.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue `command` on this lens. Assigns a sequence number when the
    /// command asks for one; retries keep it.
    pub fn send(&self, command: &Arc<Command>) {
        if command.needs_global_sequence() {
            command.assign_sequence(self.next_sequence());
        }
        debug!("Send command {} on side {}", command.name(), self.inner.side);
        let wire = self.wire();
        self.transmit_locked(command, &wire);
    }

    /// Wrap `handler` in a [`Command`] and send it.
    pub fn send_handler(&self, handler: impl CommandHandler) -> Arc<Command> {
        let command = Command::new(handler);
        self.send(&command);
        command
    }

    /// Send and suspend until the command resolves or gives up.
    pub async fn send_and_wait(&self, command: &Arc<Command>) -> bool {
        self.send(command);
        command.wait_for_response().await
    }

    /// Must not be awaited from the task that feeds [`handle_inbound_payload`](Self::handle_inbound_payload).
    pub async fn wait_for_response(&self, command: &Arc<Command>) -> bool {
        command.wait_for_response().await
    }

    /// Write one attempt of `command`. The caller holds the write lock.
    fn transmit_locked(&self, command: &Arc<Command>, _wire: &MutexGuard<'_, ()>) {
        let side = self.inner.side;
        {
            let mut state = self.state();
            if state.link == LinkState::Disconnected {
                drop(state);
                debug!("Dropping command {} on side {}: disconnected", command.name(), side);
                command.fail(CommandError::Disconnected {
                    name: command.name().to_string(),
                });
                return;
            }

            if command.expects_response() {
                let generation = state.next_generation;
                state.next_generation += 1;
                let timeout = command.timeout_or(state.settings.command_timeout());
                let timer = self.arm_timeout(command.clone(), generation, timeout);

                match state
                    .pending
                    .iter_mut()
                    .find(|entry| entry.command.id() == command.id())
                {
                    Some(entry) => {
                        entry.timer.abort();
                        entry.generation = generation;
                        entry.timer = timer;
                    }
                    None => state.pending.push(PendingResponse {
                        command: command.clone(),
                        generation,
                        timer,
                    }),
                }
            }
        }

        let packet = command.serialize();
        let attempt = command.on_attempt();
        debug!(
            "Side {} -> {} (attempt {}): {}",
            side,
            command.name(),
            attempt,
            format_bytes(&packet)
        );

        match self.inner.context.transport.write(side, &packet) {
            Ok(()) => {
                if !command.expects_response() {
                    command.mark_sent();
                }
            }
            Err(e) => {
                warn!("Write of {} on side {} failed: {}", command.name(), side, e);
                if let Some(entry) = self.remove_pending(command.id()) {
                    entry.timer.abort();
                }
                command.fail(CommandError::Transport(e));
            }
        }
    }

    fn remove_pending(&self, id: u64) -> Option<PendingResponse> {
        let mut state = self.state();
        let index = state
            .pending
            .iter()
            .position(|entry| entry.command.id() == id)?;
        Some(state.pending.remove(index))
    }

    fn arm_timeout(
        &self,
        command: Arc<Command>,
        generation: u64,
        timeout: Duration,
    ) -> JoinHandle<()> {
        let session = self.downgrade();
        self.inner.context.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = Self::upgrade(&session) {
                session.on_timeout(&command, generation);
            }
        })
    }

    fn on_timeout(&self, command: &Arc<Command>, generation: u64) {
        let side = self.inner.side;
        let wire = self.wire();
        let mut state = self.state();
        if state.link == LinkState::Disconnected {
            return;
        }
        let Some(index) = state
            .pending
            .iter()
            .position(|entry| entry.command.id() == command.id() && entry.generation == generation)
        else {
            return;
        };

        let attempts = command.attempts();
        let max_attempts = command.max_attempts_or(state.settings.retry_count);
        if attempts < max_attempts {
            drop(state);
            debug!(
                "Retry {} command {} on side {}",
                attempts,
                command.name(),
                side
            );
            self.transmit_locked(command, &wire);
        } else {
            state.pending.remove(index);
            drop(state);
            warn!(
                "Command {} on side {} timed out after {} attempts",
                command.name(),
                side,
                attempts
            );
            command.fail(CommandError::Timeout {
                name: command.name().to_string(),
                attempts,
            });
        }
    }

    /// Offer an inbound notification to the pending commands, then to the
    /// unsolicited-frame decoder. Returns whether anything consumed it.
    pub fn handle_inbound_payload(&self, payload: &[u8]) -> bool {
        let side = self.inner.side;
        let matched = {
            let mut state = self.state();
            let index = state
                .pending
                .iter()
                .position(|entry| entry.command.response_matches(payload));
            index.map(|index| state.pending.remove(index))
        };

        if let Some(entry) = matched {
            entry.timer.abort();
            debug!(
                "Got response payload for command {} on side {}: {}",
                entry.command.name(),
                side,
                format_bytes(payload)
            );
            entry.command.deliver(payload, self);
            return true;
        }

        match self.inner.context.profile.decode_unsolicited(side, payload) {
            Some(Unsolicited::Events(events)) => {
                for event in events {
                    if let DeviceEvent::Setting {
                        setting: ReportedSetting::SilentMode(enabled),
                        ..
                    } = event
                    {
                        self.state().silent_mode = enabled;
                    }
                    self.emit(event);
                }
                true
            }
            Some(Unsolicited::DebugLog(message)) => {
                let first = {
                    let mut state = self.state();
                    !std::mem::replace(&mut state.debug_enabled, true)
                };
                if first {
                    self.emit(DeviceEvent::Setting {
                        side,
                        setting: ReportedSetting::DebugLogging(true),
                    });
                }
                info!("{}: {}", side, message);
                self.emit(DeviceEvent::DebugLog { side, message });
                true
            }
            None => {
                debug!("Unhandled payload on side {}: {}", side, format_bytes(payload));
                false
            }
        }
    }

    fn start_heartbeat(&self, state: &mut SessionState) {
        if let Some(task) = state.heartbeat.take() {
            task.abort();
        }
        let interval = state.settings.heartbeat_interval();
        debug!(
            "Starting heartbeat runner on side {} every {}ms",
            self.inner.side,
            interval.as_millis()
        );

        let session = self.downgrade();
        state.heartbeat = Some(self.inner.context.runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(session) = Self::upgrade(&session) else {
                    break;
                };
                if !session.heartbeat_tick() {
                    break;
                }
            }
        }));
    }

    /// Returns `false` once the heartbeat should stop.
    fn heartbeat_tick(&self) -> bool {
        let side = self.inner.side;
        let since_last = {
            let mut state = self.state();
            if state.link != LinkState::Ready {
                debug!("Stopping heartbeat runner since side {} is {:?}", side, state.link);
                return false;
            }
            let now = Instant::now();
            let since_last = now.duration_since(state.last_heartbeat);
            state.last_heartbeat = now;
            since_last
        };
        info!("Side {}: {}ms since the last heartbeat", side, since_last.as_millis());

        if !self.inner.context.transport.is_connected(side) {
            debug!("Stopping heartbeat runner since side {} is not connected", side);
            return false;
        }
        let command = Command::from_boxed(self.inner.context.profile.heartbeat());
        self.send(&command);
        self.record_heartbeat(command.outcome().is_success());
        true
    }

    /// The heartbeat is fire-and-forget, so its outcome is known once `send` returns.
    fn record_heartbeat(&self, written: bool) {
        let escalate = {
            let mut state = self.state();
            if written {
                state.failed_heartbeats = 0;
                false
            } else {
                state.failed_heartbeats += 1;
                if state.failed_heartbeats >= state.settings.critical_failure_threshold {
                    state.failed_heartbeats = 0;
                    true
                } else {
                    false
                }
            }
        };

        if escalate {
            warn!(
                "Heartbeats keep failing on side {}, waiting for reconnect",
                self.inner.side
            );
            self.emit(DeviceEvent::DeviceState(DeviceState::WaitingForReconnect));
        }
    }

    /// Battery query whose response is published as a battery-level event.
    pub fn battery_command(&self) -> Arc<Command> {
        let context = &self.inner.context;
        let profile = context.profile.clone();
        let events = context.events.clone();
        let side = self.inner.side;

        let handler = profile.battery_request();
        Command::with_callback(handler, move |payload| match profile.battery_percent(payload) {
            Some(percent) => {
                let _ = events.send(DeviceEvent::BatteryLevel {
                    index: BatteryIndex::Lens(side),
                    percent,
                });
                true
            }
            None => false,
        })
    }

    fn start_battery_polling(&self, state: &mut SessionState) {
        if let Some(task) = state.battery.take() {
            task.abort();
        }
        let Some(interval) = state.settings.battery_polling_interval() else {
            debug!("Battery polling disabled on side {}", self.inner.side);
            return;
        };
        debug!(
            "Starting battery runner on side {} every {} minutes",
            self.inner.side,
            state.settings.battery_polling_interval_minutes
        );

        let session = self.downgrade();
        state.battery = Some(self.inner.context.runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(session) = Self::upgrade(&session) else {
                    break;
                };
                if !session.is_ready() {
                    break;
                }
                let command = session.battery_command();
                let answered = session.send_and_wait(&command).await;
                session.record_battery_poll(answered);
            }
        }));
    }

    fn record_battery_poll(&self, answered: bool) {
        let escalate = {
            let mut state = self.state();
            if answered {
                state.failed_battery_polls = 0;
                false
            } else {
                state.failed_battery_polls += 1;
                if state.failed_battery_polls >= state.settings.critical_failure_threshold {
                    state.failed_battery_polls = 0;
                    true
                } else {
                    false
                }
            }
        };

        if escalate {
            warn!(
                "Battery polling keeps failing on side {}, waiting for reconnect",
                self.inner.side
            );
            self.emit(DeviceEvent::DeviceState(DeviceState::WaitingForReconnect));
        }
    }

    /// Re-read the polling interval; polling may now be disabled.
    pub fn reschedule_battery_polling(&self) {
        let mut state = self.state();
        if state.link == LinkState::Ready {
            self.start_battery_polling(&mut state);
        }
    }

    /// Replace the session settings. A ready session restarts its heartbeat
    /// and battery tasks so new intervals apply immediately.
    pub fn update_settings(&self, settings: SessionSettings) {
        let mut state = self.state();
        state.settings = settings;
        if state.link == LinkState::Ready {
            self.start_heartbeat(&mut state);
            self.start_battery_polling(&mut state);
        }
    }

    /// Send `command` after `delay`, replacing any earlier deferred send.
    pub fn send_deferred(&self, delay: Duration, command: Arc<Command>) {
        let mut state = self.state();
        if let Some((_, task)) = state.deferred.take() {
            task.abort();
        }
        if state.link == LinkState::Disconnected {
            return;
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let session = self.downgrade();
        let task = self.inner.context.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = Self::upgrade(&session) {
                {
                    let mut state = session.state();
                    // A newer deferred send owns the slot now.
                    if state.deferred.as_ref().map(|(current, _)| *current) == Some(generation) {
                        state.deferred = None;
                    }
                }
                session.send(&command);
            }
        });
        state.deferred = Some((generation, task));
    }

    /// Abort the deferred send, if one is scheduled.
    pub fn cancel_deferred(&self) {
        if let Some((_, task)) = self.state().deferred.take() {
            task.abort();
        }
    }

    /// Whether a deferred send is scheduled and not yet fired.
    pub fn has_deferred(&self) -> bool {
        self.state().deferred.is_some()
    }

    /// Silent mode as last reported by the lens or set locally.
    pub fn silent_mode(&self) -> bool {
        self.state().silent_mode
    }

    pub fn set_silent_mode(&self, enabled: bool) {
        self.state().silent_mode = enabled;
    }

    /// Flip the tracked silent-mode state and return the new value.
    pub fn toggle_silent_mode(&self) -> bool {
        let mut state = self.state();
        state.silent_mode = !state.silent_mode;
        state.silent_mode
    }

    pub fn debug_enabled(&self) -> bool {
        self.state().debug_enabled
    }

    pub fn set_debug_enabled(&self, enabled: bool) {
        self.state().debug_enabled = enabled;
    }
}

impl Transmitter for PeerSession {
    fn transmit(&self, command: &Arc<Command>) {
        debug!("Relay command {} on side {}", command.name(), self.inner.side);
        let wire = self.wire();
        self.transmit_locked(command, &wire);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::command::Outcome;
    use crate::infrastructure::bluetooth::commands::{self, HeartBeat, Request};
    use crate::infrastructure::bluetooth::loopback::LoopbackTransport;
    use crate::infrastructure::bluetooth::protocol::opcode;
    use std::sync::atomic::AtomicUsize;

    struct Silent {
        retries: u32,
        sequence: u8,
    }

    impl CommandHandler for Silent {
        fn name(&self) -> String {
            "silent".to_string()
        }

        fn serialize(&self) -> Vec<u8> {
            vec![0x77, self.sequence]
        }

        fn response_matches(&self, _payload: &[u8]) -> bool {
            false
        }

        fn needs_global_sequence(&self) -> bool {
            true
        }

        fn set_global_sequence(&mut self, sequence: u8) {
            self.sequence = sequence;
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(1))
        }

        fn max_retries(&self) -> Option<u32> {
            Some(self.retries)
        }
    }

    fn quiet_settings() -> SessionSettings {
        SessionSettings {
            battery_polling_enabled: false,
            ..Default::default()
        }
    }

    fn ready_session(
        transport: &Arc<LoopbackTransport>,
        settings: SessionSettings,
    ) -> (PeerSession, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = SessionContext::new(transport.clone(), tx, Handle::current());
        let session = PeerSession::new(Side::Left, context, settings);
        session.on_connecting();
        session.initialize();
        (session, rx)
    }

    fn pump(session: &PeerSession, transport: &LoopbackTransport) {
        let mut notifications = transport.subscribe_notify(session.side()).unwrap();
        let session = session.clone();
        tokio::spawn(async move {
            while let Some(payload) = notifications.recv().await {
                session.handle_inbound_payload(&payload);
            }
        });
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> Vec<DeviceEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_round_trip() {
        let transport = Arc::new(LoopbackTransport::new());
        let (session, mut events) = ready_session(&transport, quiet_settings());
        drain(&mut events);

        let command = session.battery_command();
        session.send(&command);
        assert_eq!(transport.written(Side::Left), vec![vec![0x2C, 0x01]]);
        assert_eq!(session.pending_count(), 1);

        assert!(session.handle_inbound_payload(&[0x2C, 0x00, 0x55]));
        assert_eq!(session.pending_count(), 0);
        assert!(session.wait_for_response(&command).await);
        assert_eq!(command.response(), Some(vec![0x2C, 0x00, 0x55]));
        assert_eq!(
            drain(&mut events),
            vec![DeviceEvent::BatteryLevel {
                index: BatteryIndex::Lens(Side::Left),
                percent: 85
            }]
        );

        // Already resolved: a duplicate is not consumed by the command.
        assert!(!session.handle_inbound_payload(&[0x2C, 0x00, 0x55]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_counts_total_transmissions() {
        let transport = Arc::new(LoopbackTransport::new());
        let (session, _events) = ready_session(&transport, quiet_settings());

        let command = Command::new(Silent {
            retries: 3,
            sequence: 0,
        });
        assert!(!session.send_and_wait(&command).await);

        let written = transport.written_with_opcode(Side::Left, 0x77);
        assert_eq!(written.len(), 3);
        assert!(written.iter().all(|packet| packet == &written[0]));
        assert_eq!(
            command.outcome(),
            Outcome::Failed(CommandError::Timeout {
                name: "silent".to_string(),
                attempts: 3
            })
        );
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_still_transmits_once() {
        let transport = Arc::new(LoopbackTransport::new());
        let (session, _events) = ready_session(&transport, quiet_settings());

        let command = Command::new(Silent {
            retries: 0,
            sequence: 0,
        });
        assert!(!session.send_and_wait(&command).await);
        assert_eq!(transport.written_with_opcode(Side::Left, 0x77).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_after_retry_resolves() {
        let transport = Arc::new(LoopbackTransport::new());
        let (session, _events) = ready_session(&transport, quiet_settings());

        let command = Command::new(Request::silent_mode());
        session.send(&command);
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(transport.written(Side::Left).len(), 2);
        assert_eq!(command.attempts(), 2);

        assert!(session.handle_inbound_payload(&[0x2B, 0xC9, 0x0C, 0x06]));
        assert!(command.wait_for_response().await);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.written_with_opcode(Side::Left, 0x2B).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_increments_and_wraps() {
        let transport = Arc::new(LoopbackTransport::new());
        let (session, _events) = ready_session(&transport, quiet_settings());

        for _ in 0..300 {
            session.send_handler(HeartBeat::default());
            // Not sequence-scoped, must not consume a number.
            session.send_handler(Request::reset());
        }

        let sequences: Vec<u8> = transport
            .written_with_opcode(Side::Left, opcode::HEARTBEAT)
            .iter()
            .map(|packet| packet[3])
            .collect();
        assert_eq!(sequences.len(), 300);
        for (index, sequence) in sequences.iter().enumerate() {
            assert_eq!(*sequence as usize, index % 256);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_do_not_share_sequence() {
        let transport = Arc::new(LoopbackTransport::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let context = SessionContext::new(transport.clone(), tx, Handle::current());
        let left = PeerSession::new(Side::Left, context.clone(), quiet_settings());
        let right = PeerSession::new(Side::Right, context, quiet_settings());
        left.initialize();
        right.initialize();

        left.send_handler(HeartBeat::default());
        left.send_handler(HeartBeat::default());
        right.send_handler(HeartBeat::default());

        assert_eq!(transport.written(Side::Left)[1][3], 1);
        assert_eq!(transport.written(Side::Right)[0][3], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_fails_all_pending() {
        let transport = Arc::new(LoopbackTransport::new());
        let (session, _events) = ready_session(&transport, quiet_settings());

        let commands: Vec<_> = [
            Request::silent_mode(),
            Request::display_settings(),
            Request::serial_number(),
        ]
        .into_iter()
        .map(|request| session.send_handler(request))
        .collect();
        assert_eq!(session.pending_count(), 3);

        session.on_disconnected();

        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.link_state(), LinkState::Disconnected);
        for command in &commands {
            assert!(matches!(
                command.outcome(),
                Outcome::Failed(CommandError::Disconnected { .. })
            ));
            assert!(!command.wait_for_response().await);
        }

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.written(Side::Left).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_fails_immediately() {
        let transport = Arc::new(LoopbackTransport::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let context = SessionContext::new(transport.clone(), tx, Handle::current());
        let session = PeerSession::new(Side::Right, context, quiet_settings());

        let command = session.send_handler(Request::battery_info());
        assert!(!command.wait_for_response().await);
        assert!(transport.written(Side::Right).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_fails_command() {
        let transport = Arc::new(LoopbackTransport::new());
        let (session, _events) = ready_session(&transport, quiet_settings());
        transport.set_fail_writes(Side::Left, true);

        let command = session.send_handler(Request::battery_info());
        assert!(matches!(
            command.outcome(),
            Outcome::Failed(CommandError::Transport(_))
        ));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_and_forget_resolves_on_write() {
        let transport = Arc::new(LoopbackTransport::new());
        let (session, _events) = ready_session(&transport, quiet_settings());

        let command = session.send_handler(Request::reset());
        assert_eq!(command.outcome(), Outcome::Sent);
        assert!(command.wait_for_response().await);
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunked_command_relays_through_session() {
        let transport = Arc::new(LoopbackTransport::simulated_glasses());
        let (session, _events) = ready_session(&transport, quiet_settings());
        pump(&session, &transport);

        let completed = Arc::new(AtomicUsize::new(0));
        let counter = completed.clone();
        let notification = crate::domain::models::NotificationSpec {
            id: 1,
            body: Some("y".repeat(200)),
            ..Default::default()
        };
        let chunked = commands::send_notification(&notification, 60).unwrap();
        let chunk_count = chunked.chunk_count();
        let command = Command::with_callback(chunked, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        assert!(session.send_and_wait(&command).await);
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        let packets = transport.written_with_opcode(Side::Left, opcode::SEND_NOTIFICATION);
        assert_eq!(packets.len(), chunk_count as usize);
        for (index, packet) in packets.iter().enumerate() {
            assert_eq!(packet[2], chunk_count);
            assert_eq!(packet[3] as usize, index);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_when_link_drops() {
        let transport = Arc::new(LoopbackTransport::new());
        let (_session, _events) = ready_session(&transport, quiet_settings());

        tokio::time::sleep(Duration::from_secs(29)).await;
        let beats = transport.written_with_opcode(Side::Left, opcode::HEARTBEAT);
        assert_eq!(beats.len(), 1);

        tokio::time::sleep(Duration::from_secs(28)).await;
        assert_eq!(
            transport.written_with_opcode(Side::Left, opcode::HEARTBEAT).len(),
            2
        );

        transport.set_connected(Side::Left, false);
        tokio::time::sleep(Duration::from_secs(28 * 3)).await;
        assert_eq!(
            transport.written_with_opcode(Side::Left, opcode::HEARTBEAT).len(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_heartbeat_after_teardown() {
        let transport = Arc::new(LoopbackTransport::new());
        let (session, _events) = ready_session(&transport, quiet_settings());

        session.on_disconnected();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(transport.written(Side::Left).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_polling_reports_level() {
        let transport = Arc::new(LoopbackTransport::simulated_glasses());
        let settings = SessionSettings {
            battery_polling_interval_minutes: 1,
            ..Default::default()
        };
        let (session, mut events) = ready_session(&transport, settings);
        pump(&session, &transport);
        drain(&mut events);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(drain(&mut events).contains(&DeviceEvent::BatteryLevel {
            index: BatteryIndex::Lens(Side::Left),
            percent: 85
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_polling_failures_escalate() {
        let transport = Arc::new(LoopbackTransport::new());
        let settings = SessionSettings {
            battery_polling_interval_minutes: 1,
            retry_count: 1,
            critical_failure_threshold: 2,
            ..Default::default()
        };
        let (_session, mut events) = ready_session(&transport, settings);
        drain(&mut events);

        tokio::time::sleep(Duration::from_secs(70)).await;
        assert!(!drain(&mut events)
            .contains(&DeviceEvent::DeviceState(DeviceState::WaitingForReconnect)));

        tokio::time::sleep(Duration::from_secs(70)).await;
        assert!(drain(&mut events)
            .contains(&DeviceEvent::DeviceState(DeviceState::WaitingForReconnect)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_frames() {
        let transport = Arc::new(LoopbackTransport::new());
        let (session, mut events) = ready_session(&transport, quiet_settings());
        drain(&mut events);

        assert!(session.handle_inbound_payload(&[0xF5, 0x04, 0x00]));
        assert!(session.silent_mode());

        assert!(!session.debug_enabled());
        assert!(session.handle_inbound_payload(b"\xF4booted\x00"));
        assert!(session.handle_inbound_payload(b"\xF4again\x00"));
        assert!(session.debug_enabled());

        assert!(!session.handle_inbound_payload(&[0x99, 0x01]));

        let events = drain(&mut events);
        let debug_toggles = events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    DeviceEvent::Setting {
                        setting: ReportedSetting::DebugLogging(true),
                        ..
                    }
                )
            })
            .count();
        assert_eq!(debug_toggles, 1);
        assert!(events.contains(&DeviceEvent::DebugLog {
            side: Side::Left,
            message: "booted".to_string()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_send_is_replaced() {
        let transport = Arc::new(LoopbackTransport::new());
        let (session, _events) = ready_session(&transport, quiet_settings());

        session.send_deferred(
            Duration::from_secs(3),
            Command::new(Request::set_wear_detection_settings(true)),
        );
        tokio::time::sleep(Duration::from_secs(2)).await;
        session.send_deferred(
            Duration::from_secs(3),
            Command::new(Request::set_wear_detection_settings(false)),
        );
        tokio::time::sleep(Duration::from_secs(4)).await;

        let writes = transport.written_with_opcode(Side::Left, opcode::SET_WEAR_DETECTION_SETTINGS);
        assert_eq!(writes, vec![vec![0x27, 0x00]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_timeout_resends_same_chunk() {
        let transport = Arc::new(LoopbackTransport::new());
        let (session, _events) = ready_session(&transport, quiet_settings());

        let notification = crate::domain::models::NotificationSpec {
            id: 1,
            body: Some("y".repeat(200)),
            ..Default::default()
        };
        let command = Command::new(commands::send_notification(&notification, 60).unwrap());
        session.send(&command);

        let chunk_indices = |transport: &LoopbackTransport| -> Vec<u8> {
            transport
                .written_with_opcode(Side::Left, opcode::SEND_NOTIFICATION)
                .iter()
                .map(|packet| packet[3])
                .collect()
        };

        // Without an ack the next chunk is held back and the first one is resent.
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(chunk_indices(&transport), vec![0, 0]);
        assert_eq!(session.pending_count(), 1);

        assert!(session.handle_inbound_payload(&[opcode::SEND_NOTIFICATION, 0xC9]));
        assert_eq!(chunk_indices(&transport), vec![0, 0, 1]);
        assert_eq!(session.pending_count(), 1);
        assert!(!command.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_write_failures_escalate() {
        let transport = Arc::new(LoopbackTransport::new());
        let (_session, mut events) = ready_session(&transport, quiet_settings());
        drain(&mut events);
        transport.set_fail_writes(Side::Left, true);

        let waiting = DeviceEvent::DeviceState(DeviceState::WaitingForReconnect);
        tokio::time::sleep(Duration::from_secs(28 * 2 + 1)).await;
        assert!(!drain(&mut events).contains(&waiting));

        tokio::time::sleep(Duration::from_secs(28)).await;
        assert_eq!(
            drain(&mut events)
                .iter()
                .filter(|event| **event == waiting)
                .count(),
            1
        );

        // A successful beat resets the count.
        transport.set_fail_writes(Side::Left, false);
        tokio::time::sleep(Duration::from_secs(28)).await;
        transport.set_fail_writes(Side::Left, true);
        tokio::time::sleep(Duration::from_secs(28 * 2)).await;
        assert!(!drain(&mut events).contains(&waiting));
        assert_eq!(
            transport.written_with_opcode(Side::Left, opcode::HEARTBEAT).len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_settings_restarts_heartbeat() {
        let transport = Arc::new(LoopbackTransport::new());
        let (session, _events) = ready_session(&transport, quiet_settings());

        session.update_settings(SessionSettings {
            heartbeat_interval_ms: 5_000,
            ..quiet_settings()
        });
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(
            transport.written_with_opcode(Side::Left, opcode::HEARTBEAT).len(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_deferred_send_can_be_cancelled() {
        let transport = Arc::new(LoopbackTransport::new());
        let (session, _events) = ready_session(&transport, quiet_settings());

        session.send_deferred(
            Duration::from_secs(3),
            Command::new(Request::set_wear_detection_settings(true)),
        );
        tokio::time::sleep(Duration::from_secs(2)).await;
        session.send_deferred(
            Duration::from_secs(3),
            Command::new(Request::set_wear_detection_settings(false)),
        );
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(session.has_deferred());

        session.cancel_deferred();
        assert!(!session.has_deferred());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(transport
            .written_with_opcode(Side::Left, opcode::SET_WEAR_DETECTION_SETTINGS)
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fired_deferred_send_clears_its_slot() {
        let transport = Arc::new(LoopbackTransport::new());
        let (session, _events) = ready_session(&transport, quiet_settings());

        session.send_deferred(
            Duration::from_secs(1),
            Command::new(Request::set_wear_detection_settings(true)),
        );
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!session.has_deferred());
        assert_eq!(
            transport.written_with_opcode(Side::Left, opcode::SET_WEAR_DETECTION_SETTINGS),
            vec![vec![0x27, 0x01]]
        );
    }
}
