use crate::api::{Credentials, ServerConfig, ServerProps};
use crate::client::config::ClientSettings;
use crate::client::gateway::Gateway;
use crate::client::listeners::EventMultiplexer;
use crate::client::machine::{transition, Phase, Trigger};
use crate::client::transport::{ClientSlot, Connector, SignalSender};
use crate::client::types::{
    CallError, ServerCommand, ServerEvent, ServerFault, ServerStatus, TransportSignal,
};

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;

/// Work queued by a transition handler, run once the current transition
/// has finished. Handlers never fire triggers directly.
#[derive(Debug)]
enum Deferred {
    Fire(Trigger),
    Teardown,
}

/// Side effects that need the async driver.
#[derive(Debug, PartialEq)]
pub(crate) enum Effect {
    /// (Re)start the persistence debounce
    ScheduleSave,
    /// (Re)start the phase-vs-config debounce
    ScheduleStaleCheck,
    /// Authenticate on the socket of `generation`
    Authenticate { generation: u64, credentials: Credentials },
}

/// Connection state machine for one server.
///
/// Owns the transport slot and is the only writer to it. All methods run to
/// completion: transitions they cause, and everything those transitions
/// defer, are processed before they return.
pub struct ServerConnection {
    config: ServerConfig,
    settings: ClientSettings,
    phase: Phase,
    initialized: bool,
    connected: bool,
    authenticated: bool,
    ready: bool,
    restarting: bool,
    error_count: u32,
    fault: Option<ServerFault>,
    /// Bumped for every socket opened; signals from older sockets are dropped
    generation: u64,
    slot: ClientSlot,
    listeners: Arc<EventMultiplexer>,
    connector: Arc<dyn Connector>,
    signal_tx: async_channel::Sender<(u64, TransportSignal)>,
    event_tx: async_channel::Sender<ServerEvent>,
    /// Republished before every event, so a snapshot never lags an event
    /// already sent
    status_tx: watch::Sender<ServerStatus>,
    deferred: VecDeque<Deferred>,
    effects: Vec<Effect>,
}

impl ServerConnection {
    /// Returns the machine and the receiver its sockets report to.
    pub fn new(
        config: ServerConfig,
        settings: ClientSettings,
        connector: Arc<dyn Connector>,
        event_tx: async_channel::Sender<ServerEvent>,
    ) -> (Self, async_channel::Receiver<(u64, TransportSignal)>) {
        let (signal_tx, signal_rx) = async_channel::unbounded();
        let slot = ClientSlot::new();
        let listeners = Arc::new(EventMultiplexer::new(slot.clone()));
        log::info!("Created server connection for {}", config.url);
        let (status_tx, _) = watch::channel(ServerStatus {
            phase: Phase::Created,
            url: config.url.clone(),
            is_active: config.is_active,
            is_initialized: false,
            is_connected: false,
            is_authenticated: false,
            is_ready: false,
            is_restarting: false,
            error_count: 0,
            fault: None,
            has_client: false,
            socket_generation: 0,
        });
        let conn = Self {
            config,
            settings,
            phase: Phase::Created,
            initialized: false,
            connected: false,
            authenticated: false,
            ready: false,
            restarting: false,
            error_count: 0,
            fault: None,
            generation: 0,
            slot,
            listeners,
            connector,
            signal_tx,
            event_tx,
            status_tx,
            deferred: VecDeque::new(),
            effects: Vec::new(),
        };
        (conn, signal_rx)
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn slot(&self) -> &ClientSlot {
        &self.slot
    }

    pub fn listeners(&self) -> &Arc<EventMultiplexer> {
        &self.listeners
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            phase: self.phase,
            url: self.config.url.clone(),
            is_active: self.config.is_active,
            is_initialized: self.initialized,
            is_connected: self.connected,
            is_authenticated: self.authenticated,
            is_ready: self.ready,
            is_restarting: self.restarting,
            error_count: self.error_count,
            fault: self.fault,
            has_client: self.slot.is_set(),
            socket_generation: self.generation,
        }
    }

    /// Receiver that sees every status change as it happens.
    pub fn watch_status(&self) -> watch::Receiver<ServerStatus> {
        self.status_tx.subscribe()
    }

    fn publish_status(&self) {
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    // ── Commands ────────────────────────────────────────────────────────────

    pub fn initialize(&mut self) {
        self.run(Trigger::Initialize);
    }

    pub fn connect(&mut self) {
        self.run(Trigger::Connect);
    }

    /// An explicit disconnect also cancels any pending restart.
    pub fn disconnect(&mut self) {
        self.restarting = false;
        self.run(Trigger::Disconnect);
    }

    pub fn restart(&mut self) {
        self.run(Trigger::Restart);
    }

    pub fn clear_error(&mut self) {
        self.error_count = 0;
        self.fault = None;
        self.emit_error();
    }

    pub fn toggle_active(&mut self) {
        self.set_active(!self.config.is_active);
    }

    pub fn set_active(&mut self, value: bool) {
        self.config.is_active = value;
        self.config_changed();
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.config.url = url.into();
        self.config_changed();
    }

    /// Replace every mutable field at once.
    pub fn update(&mut self, props: ServerProps) {
        self.config.url = props.url;
        self.config.is_active = props.is_active;
        self.config.authentication = props.authentication;
        self.config_changed();
    }

    /// Feed a signal raised by the socket of `generation`.
    pub fn handle_signal(&mut self, generation: u64, signal: TransportSignal) {
        if generation != self.generation || !self.slot.is_set() {
            log::debug!(
                "{}: dropping {:?} from retired socket {}",
                self.config.url,
                signal,
                generation
            );
            return;
        }
        match signal {
            TransportSignal::Connect => self.run(Trigger::ConnectOk),
            TransportSignal::Disconnect => self.run(Trigger::ConnectErr),
            TransportSignal::ConnectError(reason) => {
                log::warn!("{}: connect error: {}", self.config.url, reason);
                self.record_connect_error();
            }
            TransportSignal::ConnectTimeout => {
                log::warn!("{}: connect timeout", self.config.url);
                self.record_connect_error();
            }
        }
    }

    /// Debounced check that the phase still matches the config.
    pub fn check_stale(&mut self) {
        if self.config.is_active && self.slot.is_set() {
            self.restart();
        } else if self.config.is_active {
            self.connect();
        } else {
            self.disconnect();
        }
    }

    /// Debounced save: hand the current config upward.
    pub fn flush_save(&mut self) {
        self.emit(ServerEvent::ConfigChanged {
            config: self.config.clone(),
        });
    }

    pub(crate) fn handle_auth_result(&mut self, generation: u64, result: Result<(), CallError>) {
        if generation != self.generation || self.phase != Phase::Connected {
            log::debug!(
                "{}: ignoring authentication result for socket {}",
                self.config.url,
                generation
            );
            return;
        }
        match result {
            Ok(()) => {
                log::info!("{}: authenticated", self.config.url);
                self.set_authenticated(true);
            }
            Err(e) => {
                log::warn!("{}: authentication failed: {}", self.config.url, e);
                self.set_authenticated(false);
            }
        }
    }

    pub(crate) fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Close the socket without going through the machine. Used when the
    /// server is removed.
    pub fn shutdown(&mut self) {
        self.restarting = false;
        self.close_transport();
        self.set_connected(false);
        self.set_authenticated(false);
        log::info!("Shut down server connection for {}", self.config.url);
    }

    // ── Machine ─────────────────────────────────────────────────────────────

    fn run(&mut self, trigger: Trigger) {
        self.fire(trigger);
        while let Some(next) = self.deferred.pop_front() {
            match next {
                Deferred::Fire(trigger) => {
                    self.fire(trigger);
                }
                Deferred::Teardown => self.teardown(),
            }
        }
    }

    fn fire(&mut self, trigger: Trigger) -> bool {
        let Some(next) = transition(self.phase, trigger) else {
            log::debug!("{}: {:?} not valid in {}", self.config.url, trigger, self.phase);
            return false;
        };
        if trigger == Trigger::Restart {
            self.restarting = true;
        }
        log::debug!("{}: {} -> {} ({:?})", self.config.url, self.phase, next, trigger);
        self.phase = next;
        self.emit(ServerEvent::PhaseChanged {
            server_id: self.config.id.clone(),
            phase: next,
        });
        self.on_enter(next);
        true
    }

    fn on_enter(&mut self, phase: Phase) {
        match phase {
            Phase::Created => {}
            Phase::Initialized => {
                self.set_initialized(true);
                let next = if self.config.is_active {
                    Trigger::Connect
                } else {
                    Trigger::Disconnect
                };
                self.deferred.push_back(Deferred::Fire(next));
            }
            Phase::Connecting => self.open_transport(),
            Phase::Connected => {
                log::info!("{}: connected", self.config.url);
                self.restarting = false;
                if self.error_count != 0 || self.fault.is_some() {
                    self.error_count = 0;
                    self.fault = None;
                    self.emit_error();
                }
                self.set_connected(true);
                match self.config.authentication.clone() {
                    Some(credentials) => self.effects.push(Effect::Authenticate {
                        generation: self.generation,
                        credentials,
                    }),
                    None => self.set_authenticated(true),
                }
            }
            Phase::Disconnecting => self.deferred.push_back(Deferred::Teardown),
            Phase::Disconnected => {
                self.set_connected(false);
                self.set_authenticated(false);
                if self.restarting {
                    self.deferred.push_back(Deferred::Fire(Trigger::Connect));
                }
            }
            Phase::Recovered => {
                log::warn!("{}: connection dropped, restarting", self.config.url);
                self.deferred.push_back(Deferred::Fire(Trigger::Restart));
            }
        }
    }

    fn open_transport(&mut self) {
        // Never more than one live socket per server
        self.close_transport();
        self.generation += 1;
        log::info!("{}: opening socket {}", self.config.url, self.generation);
        let signals = SignalSender::new(self.generation, self.signal_tx.clone());
        let client = self.connector.open(&self.config.url, signals);
        self.slot.set(client.clone());
        self.listeners.attach_all(client.as_ref());
    }

    fn close_transport(&mut self) {
        if let Some(client) = self.slot.take() {
            self.listeners.detach_all(client.as_ref());
            client.close();
            log::debug!("{}: closed socket {}", self.config.url, self.generation);
        }
    }

    /// Runs after `disconnecting` is entered. The socket raises nothing once
    /// closed, so the `connectErr` that leaves `disconnecting` is fired here.
    fn teardown(&mut self) {
        self.close_transport();
        self.fire(Trigger::ConnectErr);
    }

    fn record_connect_error(&mut self) {
        self.error_count += 1;
        if self.error_count >= self.settings.error_threshold && self.config.is_active {
            log::error!(
                "{}: {} consecutive connect errors, deactivating",
                self.config.url,
                self.error_count
            );
            self.fault = Some(ServerFault::Timeout);
            self.restarting = false;
            self.set_active(false);
        }
        self.emit_error();
    }

    /// Writes before initialization are the restored config itself.
    fn config_changed(&mut self) {
        if self.initialized {
            self.effects.push(Effect::ScheduleSave);
            self.effects.push(Effect::ScheduleStaleCheck);
        }
    }

    // ── Flags & events ──────────────────────────────────────────────────────

    fn set_initialized(&mut self, value: bool) {
        if self.initialized != value {
            self.initialized = value;
            self.emit(ServerEvent::InitializedChanged {
                server_id: self.config.id.clone(),
                value,
            });
            self.update_ready();
        }
    }

    fn set_connected(&mut self, value: bool) {
        if self.connected != value {
            self.connected = value;
            self.emit(ServerEvent::ConnectedChanged {
                server_id: self.config.id.clone(),
                value,
            });
            self.update_ready();
        }
    }

    fn set_authenticated(&mut self, value: bool) {
        if self.authenticated != value {
            self.authenticated = value;
            self.emit(ServerEvent::AuthenticatedChanged {
                server_id: self.config.id.clone(),
                value,
            });
            self.update_ready();
        }
    }

    fn update_ready(&mut self) {
        let ready = self.initialized && self.connected && self.authenticated;
        if self.ready != ready {
            self.ready = ready;
            self.emit(ServerEvent::ReadyChanged {
                server_id: self.config.id.clone(),
                value: ready,
            });
        }
    }

    fn emit_error(&self) {
        self.emit(ServerEvent::ErrorChanged {
            server_id: self.config.id.clone(),
            error_count: self.error_count,
            fault: self.fault,
        });
    }

    fn emit(&self, event: ServerEvent) {
        self.publish_status();
        if self.event_tx.try_send(event).is_err() {
            log::debug!("{}: event receiver gone", self.config.url);
        }
    }
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// Handle to a server connection running on its own task.
pub struct ServerHandle {
    id: String,
    commands: async_channel::Sender<ServerCommand>,
    gateway: Gateway,
    listeners: Arc<EventMultiplexer>,
    status: watch::Receiver<ServerStatus>,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn listeners(&self) -> &Arc<EventMultiplexer> {
        &self.listeners
    }

    /// Latest status published by the driver.
    pub fn status(&self) -> ServerStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ServerStatus> {
        self.status.clone()
    }

    pub fn connect(&self) {
        self.send(ServerCommand::Connect);
    }

    pub fn disconnect(&self) {
        self.send(ServerCommand::Disconnect);
    }

    pub fn restart(&self) {
        self.send(ServerCommand::Restart);
    }

    pub fn clear_error(&self) {
        self.send(ServerCommand::ClearError);
    }

    pub fn toggle_active(&self) {
        self.send(ServerCommand::ToggleActive);
    }

    pub fn update(&self, props: ServerProps) {
        self.send(ServerCommand::Update(props));
    }

    /// Close the socket and stop the task.
    pub fn shutdown(&self) {
        self.send(ServerCommand::Shutdown);
    }

    /// Wait for the task to finish after [`ServerHandle::shutdown`].
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            log::warn!("Server task {} ended abnormally: {}", self.id, e);
        }
    }

    fn send(&self, command: ServerCommand) {
        if self.commands.try_send(command).is_err() {
            log::warn!("Server {} is no longer running", self.id);
        }
    }
}

/// Start the connection for `config` on `runtime`. The machine initializes
/// right away, and connects if the config is active.
pub fn spawn_server(
    config: ServerConfig,
    settings: ClientSettings,
    connector: Arc<dyn Connector>,
    event_tx: async_channel::Sender<ServerEvent>,
    runtime: &Handle,
) -> ServerHandle {
    let id = config.id.clone();
    let (conn, signal_rx) = ServerConnection::new(config, settings, connector, event_tx);
    let (command_tx, command_rx) = async_channel::unbounded();
    let gateway = Gateway::new(conn.slot().clone());
    let listeners = conn.listeners().clone();
    let status = conn.watch_status();

    let task = runtime.spawn(drive(conn, command_rx, signal_rx, gateway.clone()));

    ServerHandle {
        id,
        commands: command_tx,
        gateway,
        listeners,
        status,
        task,
    }
}

async fn drive(
    mut conn: ServerConnection,
    commands: async_channel::Receiver<ServerCommand>,
    signals: async_channel::Receiver<(u64, TransportSignal)>,
    gateway: Gateway,
) {
    let (auth_tx, auth_rx) = async_channel::unbounded::<(u64, Result<(), CallError>)>();
    let mut save_at: Option<Instant> = None;
    let mut stale_at: Option<Instant> = None;

    conn.initialize();

    loop {
        for effect in conn.take_effects() {
            match effect {
                Effect::ScheduleSave => {
                    save_at = Some(Instant::now() + conn.settings.save_debounce());
                }
                Effect::ScheduleStaleCheck => {
                    stale_at = Some(Instant::now() + conn.settings.stale_debounce());
                }
                Effect::Authenticate { generation, credentials } => {
                    let call = gateway.authenticate(&credentials);
                    let auth_tx = auth_tx.clone();
                    tokio::spawn(async move {
                        let result = call.await.map(|_| ());
                        let _ = auth_tx.send((generation, result)).await;
                    });
                }
            }
        }
        conn.publish_status();

        let save_deadline = save_at.unwrap_or_else(Instant::now);
        let stale_deadline = stale_at.unwrap_or_else(Instant::now);

        tokio::select! {
            command = commands.recv() => match command {
                Ok(ServerCommand::Connect) => conn.connect(),
                Ok(ServerCommand::Disconnect) => conn.disconnect(),
                Ok(ServerCommand::Restart) => conn.restart(),
                Ok(ServerCommand::ClearError) => conn.clear_error(),
                Ok(ServerCommand::ToggleActive) => conn.toggle_active(),
                Ok(ServerCommand::Update(props)) => conn.update(props),
                Ok(ServerCommand::Shutdown) | Err(_) => break,
            },
            Ok((generation, signal)) = signals.recv() => conn.handle_signal(generation, signal),
            Ok((generation, result)) = auth_rx.recv() => {
                conn.handle_auth_result(generation, result);
            }
            _ = tokio::time::sleep_until(save_deadline), if save_at.is_some() => {
                save_at = None;
                conn.flush_save();
            }
            _ = tokio::time::sleep_until(stale_deadline), if stale_at.is_some() => {
                stale_at = None;
                conn.check_stale();
            }
        }
    }

    if save_at.is_some() {
        conn.flush_save();
    }
    conn.shutdown();
    conn.publish_status();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{MockConnector, OpenedSocket};
    use std::time::Duration;

    struct Fixture {
        conn: ServerConnection,
        connector: Arc<MockConnector>,
        events: async_channel::Receiver<ServerEvent>,
    }

    fn fixture(is_active: bool) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let connector = Arc::new(MockConnector::new());
        let (event_tx, events) = async_channel::unbounded();
        let config = ServerConfig::new(ServerProps {
            url: "ws://host:1".into(),
            is_active,
            authentication: None,
        });
        let (conn, _signals) =
            ServerConnection::new(config, ClientSettings::default(), connector.clone(), event_tx);
        Fixture { conn, connector, events }
    }

    impl Fixture {
        fn socket(&self) -> OpenedSocket {
            self.connector.last().unwrap()
        }

        fn signal(&mut self, signal: TransportSignal) {
            let generation = self.socket().signals.generation();
            self.conn.handle_signal(generation, signal);
        }

        fn drain(&self) -> Vec<ServerEvent> {
            std::iter::from_fn(|| self.events.try_recv().ok()).collect()
        }

        fn phases(&self) -> Vec<Phase> {
            self.drain()
                .into_iter()
                .filter_map(|e| match e {
                    ServerEvent::PhaseChanged { phase, .. } => Some(phase),
                    _ => None,
                })
                .collect()
        }

        fn live_sockets(&self) -> usize {
            self.connector
                .opened()
                .iter()
                .filter(|s| !s.transport.is_closed())
                .count()
        }
    }

    #[test]
    fn active_server_connects_then_restarts_after_drop() {
        let mut f = fixture(true);
        f.conn.initialize();
        assert_eq!(f.phases(), vec![Phase::Initialized, Phase::Connecting]);
        assert_eq!(f.connector.open_count(), 1);
        assert_eq!(f.socket().url, "ws://host:1");

        f.signal(TransportSignal::Connect);
        assert_eq!(f.phases(), vec![Phase::Connected]);
        assert!(f.conn.status().is_ready);

        f.signal(TransportSignal::Disconnect);
        assert_eq!(
            f.phases(),
            vec![
                Phase::Recovered,
                Phase::Disconnecting,
                Phase::Disconnected,
                Phase::Connecting
            ]
        );
        let status = f.conn.status();
        assert!(status.is_active);
        assert!(status.is_restarting);
        assert_eq!(f.connector.open_count(), 2);
        assert_eq!(f.live_sockets(), 1);

        f.signal(TransportSignal::Connect);
        assert_eq!(f.phases(), vec![Phase::Connected]);
        assert!(!f.conn.status().is_restarting);
    }

    #[test]
    fn inactive_server_settles_disconnected() {
        let mut f = fixture(false);
        f.conn.initialize();
        assert_eq!(f.phases(), vec![Phase::Initialized, Phase::Disconnected]);
        assert_eq!(f.connector.open_count(), 0);
    }

    #[test]
    fn ready_follows_flags() {
        let mut f = fixture(true);
        f.conn.initialize();
        f.signal(TransportSignal::Connect);
        let ready: Vec<bool> = f
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::ReadyChanged { value, .. } => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(ready, vec![true]);

        f.conn.disconnect();
        let status = f.conn.status();
        assert_eq!(status.phase, Phase::Disconnected);
        assert!(!status.is_connected && !status.is_authenticated && !status.is_ready);
        assert!(f.socket().transport.is_closed());
    }

    #[test]
    fn error_threshold_deactivates() {
        let mut f = fixture(true);
        f.conn.initialize();
        // A restart while connecting leaves the restart flag set until connectOk.
        f.conn.restart();
        assert!(f.conn.status().is_restarting);
        assert_eq!(f.conn.phase(), Phase::Connecting);
        f.conn.take_effects();

        for _ in 0..4 {
            f.signal(TransportSignal::ConnectError("refused".into()));
        }
        assert!(f.conn.status().is_active);
        f.signal(TransportSignal::ConnectTimeout);

        let status = f.conn.status();
        assert!(!status.is_active);
        assert!(!status.is_restarting);
        assert_eq!(status.error_count, 5);
        assert_eq!(status.fault, Some(ServerFault::Timeout));
        assert_eq!(f.conn.take_effects(), vec![Effect::ScheduleSave, Effect::ScheduleStaleCheck]);

        f.conn.check_stale();
        assert_eq!(f.conn.phase(), Phase::Disconnected);
        assert_eq!(f.live_sockets(), 0);

        // Deactivation is not undone by further errors or by teardown.
        assert!(!f.conn.status().is_active);
    }

    #[test]
    fn connect_ok_resets_errors() {
        let mut f = fixture(true);
        f.conn.initialize();
        f.signal(TransportSignal::ConnectError("refused".into()));
        f.signal(TransportSignal::ConnectError("refused".into()));
        assert_eq!(f.conn.status().error_count, 2);

        f.signal(TransportSignal::Connect);
        let status = f.conn.status();
        assert_eq!(status.error_count, 0);
        assert_eq!(status.fault, None);
    }

    #[test]
    fn clear_error_resets_fault() {
        let mut f = fixture(true);
        f.conn.initialize();
        for _ in 0..5 {
            f.signal(TransportSignal::ConnectTimeout);
        }
        assert_eq!(f.conn.status().fault, Some(ServerFault::Timeout));
        f.conn.clear_error();
        assert_eq!(f.conn.status().error_count, 0);
        assert_eq!(f.conn.status().fault, None);
    }

    #[test]
    fn signals_from_retired_sockets_are_dropped() {
        let mut f = fixture(true);
        f.conn.initialize();
        let old = f.socket();
        f.conn.restart();
        assert_eq!(f.connector.open_count(), 2);
        f.drain();

        f.conn.handle_signal(old.signals.generation(), TransportSignal::Connect);
        assert_eq!(f.conn.phase(), Phase::Connecting);
        assert!(f.phases().is_empty());
    }

    #[test]
    fn stale_check_picks_action_from_config() {
        let mut f = fixture(false);
        f.conn.initialize();
        f.conn.set_active(true);
        f.conn.check_stale();
        assert_eq!(f.conn.phase(), Phase::Connecting);

        f.signal(TransportSignal::Connect);
        f.conn.set_url("ws://host:2");
        f.conn.check_stale();
        assert_eq!(f.conn.phase(), Phase::Connecting);
        assert_eq!(f.socket().url, "ws://host:2");
        assert_eq!(f.live_sockets(), 1);

        f.conn.set_active(false);
        f.conn.check_stale();
        assert_eq!(f.conn.phase(), Phase::Disconnected);
        assert_eq!(f.live_sockets(), 0);
    }

    #[test]
    fn config_writes_before_initialize_schedule_nothing() {
        let mut f = fixture(false);
        f.conn.set_url("ws://elsewhere");
        assert!(f.conn.take_effects().is_empty());
        f.conn.initialize();
        f.conn.toggle_active();
        assert_eq!(f.conn.take_effects(), vec![Effect::ScheduleSave, Effect::ScheduleStaleCheck]);
    }

    #[test]
    fn never_more_than_one_live_socket() {
        let mut f = fixture(true);
        f.conn.initialize();
        // Deterministic pseudo-random walk over commands and signals.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            match seed % 6 {
                0 => f.conn.connect(),
                1 => f.conn.disconnect(),
                2 => f.conn.restart(),
                3 => f.signal(TransportSignal::Connect),
                4 => f.signal(TransportSignal::Disconnect),
                _ => f.signal(TransportSignal::ConnectError("refused".into())),
            }
            assert!(f.live_sockets() <= 1);
            if f.live_sockets() == 1 {
                assert!(matches!(
                    f.conn.phase(),
                    Phase::Connecting | Phase::Connected | Phase::Recovered
                ));
            }
        }
    }

    #[test]
    fn authentication_gates_ready() {
        let _ = env_logger::builder().is_test(true).try_init();
        let connector = Arc::new(MockConnector::new());
        let (event_tx, _events) = async_channel::unbounded();
        let credentials: Credentials =
            serde_json::from_value(serde_json::json!({"strategy": "local", "email": "a@b"}))
                .unwrap();
        let config = ServerConfig::new(ServerProps {
            url: "ws://host:1".into(),
            is_active: true,
            authentication: Some(credentials.clone()),
        });
        let (mut conn, _signals) =
            ServerConnection::new(config, ClientSettings::default(), connector.clone(), event_tx);
        conn.initialize();
        let generation = connector.last().unwrap().signals.generation();
        conn.handle_signal(generation, TransportSignal::Connect);

        assert!(conn.status().is_connected);
        assert!(!conn.status().is_ready);
        assert_eq!(
            conn.take_effects(),
            vec![Effect::Authenticate {
                generation,
                credentials
            }]
        );

        conn.handle_auth_result(generation + 1, Ok(()));
        assert!(!conn.status().is_authenticated);
        conn.handle_auth_result(generation, Ok(()));
        assert!(conn.status().is_ready);
    }

    /// Records the published status every time a socket is opened.
    #[derive(Default)]
    struct WatchingConnector {
        inner: MockConnector,
        status: parking_lot::Mutex<Option<watch::Receiver<ServerStatus>>>,
        seen: parking_lot::Mutex<Vec<ServerStatus>>,
    }

    impl Connector for WatchingConnector {
        fn open(
            &self,
            url: &str,
            signals: SignalSender,
        ) -> Arc<dyn crate::client::transport::TransportClient> {
            if let Some(status) = self.status.lock().as_ref() {
                self.seen.lock().push(status.borrow().clone());
            }
            self.inner.open(url, signals)
        }
    }

    #[test]
    fn status_is_published_before_events() {
        let _ = env_logger::builder().is_test(true).try_init();
        let connector = Arc::new(WatchingConnector::default());
        let (event_tx, events) = async_channel::unbounded();
        let config = ServerConfig::new(ServerProps {
            url: "ws://host:1".into(),
            is_active: true,
            authentication: None,
        });
        let (mut conn, _signals) =
            ServerConnection::new(config, ClientSettings::default(), connector.clone(), event_tx);
        let status = conn.watch_status();
        *connector.status.lock() = Some(conn.watch_status());

        conn.initialize();
        let initialized = std::iter::from_fn(|| events.try_recv().ok())
            .any(|e| matches!(e, ServerEvent::InitializedChanged { value: true, .. }));
        assert!(initialized);
        // Opening the socket happens mid-transition, after initialized was sent
        let seen = connector.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_initialized);
        assert_eq!(seen[0].phase, Phase::Connecting);

        let generation = connector.inner.last().unwrap().signals.generation();
        conn.handle_signal(generation, TransportSignal::Connect);
        assert!(status.borrow().is_ready);

        conn.handle_signal(generation, TransportSignal::Disconnect);
        assert!(!status.borrow().is_ready);
        assert_eq!(status.borrow().phase, Phase::Connecting);
    }

    // ── Driver ──

    async fn next_matching(
        events: &async_channel::Receiver<ServerEvent>,
        pred: impl Fn(&ServerEvent) -> bool,
    ) -> ServerEvent {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn driver_connects_and_debounces_saves() {
        let _ = env_logger::builder().is_test(true).try_init();
        let connector = Arc::new(MockConnector::auto_connect());
        let (event_tx, events) = async_channel::unbounded();
        let config = ServerConfig::new(ServerProps {
            url: "ws://host:1".into(),
            is_active: true,
            authentication: None,
        });
        let handle = spawn_server(
            config.clone(),
            ClientSettings::default(),
            connector.clone(),
            event_tx,
            &Handle::current(),
        );

        next_matching(&events, |e| {
            matches!(e, ServerEvent::ReadyChanged { value: true, .. })
        })
        .await;
        assert!(handle.gateway().has_client());

        // A burst of edits collapses into one save, then the stale check
        // takes the server down.
        handle.toggle_active();
        handle.toggle_active();
        handle.toggle_active();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let events: Vec<ServerEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        let saves: Vec<&ServerConfig> = events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ConfigChanged { config } => Some(config),
                _ => None,
            })
            .collect();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].id, config.id);
        assert!(!saves[0].is_active);
        assert!(events.contains(&ServerEvent::PhaseChanged {
            server_id: config.id.clone(),
            phase: Phase::Disconnected,
        }));
        assert!(!handle.status().is_active);
        assert_eq!(handle.status().phase, Phase::Disconnected);

        handle.shutdown();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn driver_authenticates_through_gateway() {
        let connector = Arc::new(MockConnector::auto_connect());
        let (event_tx, events) = async_channel::unbounded();
        let credentials: Credentials =
            serde_json::from_value(serde_json::json!({"strategy": "local", "email": "a@b"}))
                .unwrap();
        let config = ServerConfig::new(ServerProps {
            url: "ws://host:1".into(),
            is_active: true,
            authentication: Some(credentials),
        });
        let handle = spawn_server(
            config,
            ClientSettings::default(),
            connector.clone(),
            event_tx,
            &Handle::current(),
        );

        next_matching(&events, |e| {
            matches!(e, ServerEvent::AuthenticatedChanged { value: true, .. })
        })
        .await;
        let calls = connector.last().unwrap().transport.calls();
        assert_eq!(calls[0].path, "authentication");

        handle.shutdown();
        handle.join().await;
        assert!(connector.last().unwrap().transport.is_closed());
    }
}
