use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::identity::IdentityResolver;
use crate::pairing::normalize_phone_number;
use crate::reconnect::ReconnectScheduler;
use crate::transport::{ConnectionPhase, Transport, TransportEvent, TransportFactory};
use crate::types::events::{
    CloseReason, ConnectionErrorEvent, ConnectionErrorKind, ConnectionEvent, ConnectionEventBus,
    PairingCode, StateChange,
};
use crate::types::instance::InstanceKey;
use crate::types::state::ConnectionState;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

struct ActiveSession {
    generation: u64,
    transport: Arc<dyn Transport>,
    pump: JoinHandle<()>,
}

/// Owns one instance's transport session and drives its state machine.
///
/// State only changes through [`ConnectionManager::transition`], which checks
/// the edge against [`ConnectionState::can_transition_to`] and notifies
/// observers in order. Events from a superseded transport session are
/// dropped by comparing session generations.
pub struct ConnectionManager {
    key: InstanceKey,
    factory: Arc<dyn TransportFactory>,
    resolver: Option<Arc<IdentityResolver>>,
    events: ConnectionEventBus,
    scheduler: ReconnectScheduler,
    self_ref: Weak<ConnectionManager>,

    state_tx: watch::Sender<ConnectionState>,
    transition_lock: Mutex<()>,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
    generation: AtomicU64,

    auto_reconnect: AtomicBool,
    /// Disconnect epoch the in-flight connect attempt started in, if any.
    in_flight: watch::Sender<Option<u64>>,
    disconnect_epoch: AtomicU64,
    expected_disconnect: AtomicBool,
    logged_out: AtomicBool,
    pairing_code: Mutex<Option<PairingCode>>,
    last_connected_at: Mutex<Option<DateTime<Utc>>>,
}

impl ConnectionManager {
    pub fn new(
        key: InstanceKey,
        config: ConnectionConfig,
        factory: Arc<dyn TransportFactory>,
        resolver: Option<Arc<IdentityResolver>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            key,
            factory,
            resolver,
            events: ConnectionEventBus::new(),
            scheduler: ReconnectScheduler::new(config.reconnect),
            self_ref: self_ref.clone(),
            state_tx: watch::channel(ConnectionState::Disconnected).0,
            transition_lock: Mutex::new(()),
            session: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            auto_reconnect: AtomicBool::new(config.auto_reconnect),
            in_flight: watch::channel(None).0,
            disconnect_epoch: AtomicU64::new(0),
            expected_disconnect: AtomicBool::new(false),
            logged_out: AtomicBool::new(false),
            pairing_code: Mutex::new(None),
            last_connected_at: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn events(&self) -> &ConnectionEventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.scheduler.attempts()
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.scheduler.is_pending()
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
    }

    /// Turning auto-reconnect off also cancels a pending retry.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.scheduler.cancel();
        }
    }

    pub fn current_pairing_code(&self) -> Option<PairingCode> {
        lock(&self.pairing_code).clone()
    }

    pub fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_connected_at)
    }

    /// Starts a session. Cancels a pending reconnect and clears a previous
    /// logout, since an explicit connect means the caller re-provisioned.
    ///
    /// Returns once the transport is up; the outcome of the handshake arrives
    /// as state changes. Calls made while an attempt is in flight or the
    /// instance is already connected collapse into that attempt. An attempt
    /// cancelled by [`ConnectionManager::disconnect`] is waited out instead,
    /// then a fresh one starts.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.scheduler.cancel();
        self.expected_disconnect.store(false, Ordering::SeqCst);
        if self.logged_out.swap(false, Ordering::SeqCst) {
            info!(
                target: "Instance/Connection",
                "Connecting {} after logout, expecting a new pairing",
                self.key.instance_id()
            );
        }
        self.connect_inner().await
    }

    async fn connect_inner(&self) -> Result<(), ConnectionError> {
        loop {
            let mut claimed = false;
            let mut cancelled = false;
            self.in_flight.send_if_modified(|slot| {
                let epoch = self.disconnect_epoch.load(Ordering::SeqCst);
                match *slot {
                    None => {
                        *slot = Some(epoch);
                        claimed = true;
                        true
                    }
                    Some(started) => {
                        cancelled = started != epoch;
                        false
                    }
                }
            });
            if claimed {
                break;
            }
            if !cancelled {
                debug!(
                    target: "Instance/Connection",
                    "Connect for {} already in flight",
                    self.key.instance_id()
                );
                return Ok(());
            }
            // The running attempt was cut off by a disconnect and will fail.
            debug!(
                target: "Instance/Connection",
                "Waiting for cancelled connect of {} to unwind",
                self.key.instance_id()
            );
            let mut rx = self.in_flight.subscribe();
            let _ = rx.wait_for(Option::is_none).await;
        }
        let guard = scopeguard::guard((), |_| {
            self.in_flight.send_replace(None);
        });

        let current = self.state();
        if current.is_active() {
            debug!(
                target: "Instance/Connection",
                "Ignoring connect for {}: already {}",
                self.key.instance_id(),
                current
            );
            return Ok(());
        }
        if !self.transition(ConnectionState::Connecting, None) {
            return Ok(());
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(stale) = self.session.lock().await.take() {
            warn!(
                target: "Instance/Connection",
                "Tearing down leftover session for {}",
                self.key.instance_id()
            );
            stale.pump.abort();
            stale.transport.disconnect().await;
        }

        info!(
            target: "Instance/Connection",
            "Opening transport for {}",
            self.key
        );
        let (transport, transport_events) = match self.factory.create_transport(&self.key).await {
            Ok(created) => created,
            Err(e) => {
                let message = e.to_string();
                error!(
                    target: "Instance/Connection",
                    "Failed to create transport for {}: {}",
                    self.key.instance_id(),
                    message
                );
                self.events.dispatch(ConnectionEvent::Error(ConnectionErrorEvent {
                    instance: self.key.clone(),
                    kind: ConnectionErrorKind::TransportInit,
                    message: message.clone(),
                    fatal: false,
                }));
                if self.generation.load(Ordering::SeqCst) == generation {
                    self.transition(ConnectionState::Disconnected, None);
                    drop(guard);
                    if self.auto_reconnect() && !self.expected_disconnect.load(Ordering::SeqCst) {
                        self.schedule_reconnect(None);
                    }
                }
                return Err(ConnectionError::TransportInit(message));
            }
        };

        let mut session = self.session.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            drop(session);
            info!(
                target: "Instance/Connection",
                "Connect for {} was superseded by a disconnect, closing new transport",
                self.key.instance_id()
            );
            transport.disconnect().await;
            return Err(ConnectionError::Transport(
                "connection attempt cancelled by disconnect".to_string(),
            ));
        }

        let pump = tokio::spawn(Self::pump_events(
            self.self_ref.clone(),
            generation,
            transport_events,
        ));
        *session = Some(ActiveSession {
            generation,
            transport,
            pump,
        });
        Ok(())
    }

    async fn pump_events(
        manager: Weak<ConnectionManager>,
        generation: u64,
        mut transport_events: mpsc::Receiver<TransportEvent>,
    ) {
        while let Some(event) = transport_events.recv().await {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if !manager.handle_transport_event(generation, event).await {
                return;
            }
        }
        if let Some(manager) = manager.upgrade()
            && manager.generation.load(Ordering::SeqCst) == generation
        {
            info!(
                target: "Instance/Connection",
                "Transport stream for {} ended without a close update",
                manager.key.instance_id()
            );
            manager
                .on_close(generation, CloseReason::ConnectionLost)
                .await;
        }
    }

    /// Returns false once the session is over and the pump should stop.
    async fn handle_transport_event(&self, generation: u64, event: TransportEvent) -> bool {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(
                target: "Instance/Connection",
                "Dropping event from superseded session of {}",
                self.key.instance_id()
            );
            return false;
        }

        match event {
            TransportEvent::PairingCode(payload) => {
                self.on_pairing_code(PairingCode::qr(payload));
            }
            TransportEvent::ConnectionUpdate(update) => match update.phase {
                ConnectionPhase::Connecting => {
                    // The code was scanned and the transport is re-handshaking.
                    if self.state() == ConnectionState::PairingRequired {
                        self.transition(ConnectionState::Connecting, None);
                    }
                }
                ConnectionPhase::Open => self.on_open(),
                ConnectionPhase::Close => {
                    let reason = update.close_reason.unwrap_or(CloseReason::Unknown(0));
                    self.on_close(generation, reason).await;
                    return false;
                }
            },
            TransportEvent::CredentialsChanged => {
                self.events.dispatch(ConnectionEvent::CredentialsUpdated {
                    instance: self.key.clone(),
                });
            }
            TransportEvent::ContactsChanged(_)
            | TransportEvent::ChatsChanged(_)
            | TransportEvent::MessageReceived(_) => {
                if let Some(resolver) = &self.resolver {
                    resolver.ingest(&event).await;
                }
            }
        }
        true
    }

    fn on_pairing_code(&self, code: PairingCode) {
        let state = self.state();
        if !matches!(
            state,
            ConnectionState::Connecting | ConnectionState::PairingRequired
        ) {
            warn!(
                target: "Instance/Connection",
                "Ignoring pairing code for {} in state {}",
                self.key.instance_id(),
                state
            );
            return;
        }
        *lock(&self.pairing_code) = Some(code.clone());
        self.transition(ConnectionState::PairingRequired, None);
        self.events.dispatch(ConnectionEvent::PairingCode {
            instance: self.key.clone(),
            code,
        });
    }

    fn on_open(&self) {
        let committed = self.transition_with(ConnectionState::Connected, None, || {
            self.scheduler.reset();
            *lock(&self.pairing_code) = None;
            *lock(&self.last_connected_at) = Some(Utc::now());
        });
        if committed {
            info!(
                target: "Instance/Connection",
                "Instance {} connected",
                self.key.instance_id()
            );
        }
    }

    async fn on_close(&self, generation: u64, reason: CloseReason) {
        let closed = {
            let mut session = self.session.lock().await;
            match session.as_ref() {
                Some(active) if active.generation == generation => session.take(),
                _ => None,
            }
        };
        // Called from the pump itself, so the pump handle is dropped, not aborted.
        if let Some(closed) = closed {
            closed.transport.disconnect().await;
        }
        *lock(&self.pairing_code) = None;
        self.transition(ConnectionState::Disconnected, Some(reason));

        if reason.is_terminal() {
            self.logged_out.store(true, Ordering::SeqCst);
            self.scheduler.cancel();
            info!(
                target: "Instance/Connection",
                "Instance {} logged out ({}), not reconnecting",
                self.key.instance_id(),
                reason
            );
            self.events.dispatch(ConnectionEvent::LoggedOut {
                instance: self.key.clone(),
            });
            return;
        }

        if self.expected_disconnect.load(Ordering::SeqCst) {
            debug!(
                target: "Instance/Connection",
                "Session of {} closed as expected",
                self.key.instance_id()
            );
            return;
        }

        if self.auto_reconnect() {
            self.schedule_reconnect(Some(reason));
        } else {
            info!(
                target: "Instance/Connection",
                "Instance {} closed ({}), auto-reconnect disabled",
                self.key.instance_id(),
                reason
            );
        }
    }

    fn schedule_reconnect(&self, reason: Option<CloseReason>) {
        let attempt = match self.scheduler.next_attempt() {
            Ok(attempt) => attempt,
            Err(e) => {
                error!(
                    target: "Instance/Reconnect",
                    "Instance {}: {}",
                    self.key.instance_id(),
                    e
                );
                self.events.dispatch(ConnectionEvent::Error(ConnectionErrorEvent {
                    instance: self.key.clone(),
                    kind: ConnectionErrorKind::ReconnectExhausted,
                    message: e.to_string(),
                    fatal: true,
                }));
                return;
            }
        };

        let delay = if reason.is_some_and(|r| r.is_restart()) {
            Duration::ZERO
        } else {
            self.scheduler.delay()
        };

        if !self.transition(ConnectionState::Reconnecting, reason) {
            return;
        }
        info!(
            target: "Instance/Reconnect",
            "Will attempt to reconnect {} in {:?} (attempt {})",
            self.key.instance_id(),
            delay,
            attempt
        );
        self.events.dispatch(ConnectionEvent::Reconnecting {
            instance: self.key.clone(),
            attempt,
            delay,
        });

        let manager = self.self_ref.clone();
        self.scheduler.arm(delay, move |token| async move {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            manager.scheduler.disarm(token);
            if manager.state() != ConnectionState::Reconnecting {
                debug!(
                    target: "Instance/Reconnect",
                    "Skipping reconnect of {}: state is {}",
                    manager.key.instance_id(),
                    manager.state()
                );
                return;
            }
            if let Err(e) = manager.connect_inner().await {
                debug!(
                    target: "Instance/Reconnect",
                    "Reconnect attempt {} for {} failed: {}",
                    attempt,
                    manager.key.instance_id(),
                    e
                );
            }
        });
    }

    /// Asks the transport for a phone-number link code and surfaces it as a
    /// pairing code. Only valid while a session is being established.
    pub async fn request_pairing_code(&self, phone_number: &str) -> Result<String, ConnectionError> {
        let phone_number = normalize_phone_number(phone_number)?;
        let state = self.state();
        if !matches!(
            state,
            ConnectionState::Connecting | ConnectionState::PairingRequired
        ) {
            return Err(ConnectionError::NotConnecting(state));
        }
        let transport = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|active| active.transport.clone())
            .ok_or(ConnectionError::NotConnecting(state))?;
        if !transport.supports_pairing_code() {
            return Err(ConnectionError::PairingCodeUnsupported);
        }

        info!(
            target: "Instance/Pairing",
            "Requesting pairing code for {}",
            self.key.instance_id()
        );
        let code = transport
            .request_pairing_code(&phone_number)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        self.on_pairing_code(PairingCode::link_code(code.clone()));
        Ok(code)
    }

    /// Tears the session down and moves to `Disconnected`. Any pending
    /// reconnect is cancelled before the transport is touched.
    pub async fn disconnect(&self) {
        info!(
            target: "Instance/Connection",
            "Disconnecting {} intentionally.",
            self.key.instance_id()
        );
        self.expected_disconnect.store(true, Ordering::SeqCst);
        self.scheduler.cancel();
        self.disconnect_epoch.fetch_add(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);

        let active = self.session.lock().await.take();
        if let Some(active) = active {
            active.pump.abort();
            active.transport.disconnect().await;
        }
        *lock(&self.pairing_code) = None;
        self.transition(ConnectionState::Disconnected, Some(CloseReason::Manual));
    }

    pub async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    fn transition(&self, next: ConnectionState, reason: Option<CloseReason>) -> bool {
        self.transition_with(next, reason, || {})
    }

    /// Applies `next` if the edge is legal. `on_commit` runs after the state
    /// is stored but before anyone is notified. Handlers run under the
    /// transition lock and must not call back into the manager.
    fn transition_with(
        &self,
        next: ConnectionState,
        reason: Option<CloseReason>,
        on_commit: impl FnOnce(),
    ) -> bool {
        let _guard = lock(&self.transition_lock);
        let previous = self.state();
        if previous == next {
            return false;
        }
        if !previous.can_transition_to(next) {
            warn!(
                target: "Instance/Connection",
                "Illegal transition for {}: {} -> {}",
                self.key.instance_id(),
                previous,
                next
            );
            return false;
        }

        self.state_tx.send_replace(next);
        on_commit();
        debug!(
            target: "Instance/Connection",
            "{}: {} -> {}",
            self.key.instance_id(),
            previous,
            next
        );
        self.events.dispatch(ConnectionEvent::StateChanged(StateChange {
            instance: self.key.clone(),
            previous,
            current: next,
            reason,
            at: Utc::now(),
        }));
        true
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(active) = self.session.get_mut().take() {
            active.pump.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
