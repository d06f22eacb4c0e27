//! Human-paced pairing on top of a [`ConnectionManager`].
//!
//! The user scans a QR code (or types a link code) on their phone and the
//! outcome arrives as a mix of events and state changes. Events can be
//! missed or arrive in racy order around the post-scan restart, so two
//! producers feed the result: a listener on the event stream and a poller on
//! the manager's state. Whichever settles first wins.
//!
//! ## Usage
//!
//! ```rust,no_run
//! # use whatsapp_instances::pairing::{PairingCoordinator, PairingMethod};
//! # async fn example(coordinator: PairingCoordinator) {
//! let result = coordinator
//!     .pair(PairingMethod::PhoneNumber("15551234567".into()), |code| {
//!         println!("Enter this code on your phone: {}", code.code);
//!     })
//!     .await;
//! # }
//! ```

use crate::config::PairingConfig;
use crate::connection::ConnectionManager;
use crate::error::{ConnectionError, PairingFailure, PhoneNumberError};
use crate::types::events::{CloseReason, ConnectionEvent, PairingCode};
use crate::types::state::ConnectionState;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;

/// Strips formatting from a phone number and checks it is a plausible
/// international number: digits only, at least 7 of them, no leading `0`.
pub fn normalize_phone_number(phone_number: &str) -> Result<String, PhoneNumberError> {
    let digits: String = phone_number
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return Err(PhoneNumberError::Required);
    }
    if digits.len() < 7 {
        return Err(PhoneNumberError::TooShort);
    }
    if digits.starts_with('0') {
        return Err(PhoneNumberError::NotInternational);
    }
    Ok(digits)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingMethod {
    Qr,
    /// Link with a phone number; the transport returns a short code.
    PhoneNumber(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingSuccess {
    /// The stored session was still valid and no code was needed.
    pub resumed: bool,
    pub elapsed: Duration,
}

pub type PairingResult = Result<PairingSuccess, PairingFailure>;

/// Single-assignment result cell. The first `settle` wins; later calls
/// are no-ops.
struct Settle<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Settle<T> {
    fn new() -> (Arc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn settle(&self, value: T) -> bool {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match tx {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    fn is_settled(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

/// Bookkeeping shared by the listener and the poller once a code is shown.
struct Watch {
    manager: Arc<ConnectionManager>,
    config: PairingConfig,
    started: Instant,
    shown_at: Mutex<Instant>,
    settle: Arc<Settle<PairingResult>>,
    expecting_reconnection: AtomicBool,
    deferred_close: Mutex<Option<CloseReason>>,
    last_code: Mutex<Option<PairingCode>>,
}

impl Watch {
    fn succeed(&self) {
        if self.settle.settle(Ok(PairingSuccess {
            resumed: false,
            elapsed: self.started.elapsed(),
        })) {
            info!(
                target: "Instance/Pairing",
                "Pairing of {} completed",
                self.manager.key().instance_id()
            );
        }
    }

    fn fail(&self, failure: PairingFailure) {
        if self.settle.settle(Err(failure.clone())) {
            warn!(
                target: "Instance/Pairing",
                "Pairing of {} failed: {}",
                self.manager.key().instance_id(),
                failure
            );
        }
    }

    fn shown_for(&self) -> Duration {
        self.shown_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    fn in_grace(&self) -> bool {
        self.shown_for() < self.config.disconnect_grace
    }

    /// The session came back asking for a code again, so nothing was
    /// scanned. The new code gets a full scan window.
    fn code_reissued(&self) {
        if !self.expecting_reconnection.swap(false, Ordering::SeqCst) {
            return;
        }
        *self
            .shown_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
        self.lock_deferred().take();
        debug!(
            target: "Instance/Pairing",
            "Code re-issued for {} after reconnect, restarting scan window",
            self.manager.key().instance_id()
        );
    }

    fn on_close(&self, reason: CloseReason) {
        if reason.is_terminal() {
            self.fail(PairingFailure::LoggedOut);
            return;
        }
        if reason.is_restart() {
            // The service restarts the stream right after a successful scan.
            self.expecting_reconnection.store(true, Ordering::SeqCst);
            debug!(
                target: "Instance/Pairing",
                "Restart requested for {}, expecting reconnection",
                self.manager.key().instance_id()
            );
            return;
        }
        if self.in_grace() {
            debug!(
                target: "Instance/Pairing",
                "Ignoring disconnect of {} inside grace window ({})",
                self.manager.key().instance_id(),
                reason
            );
            *self.lock_deferred() = Some(reason);
            return;
        }
        if self.expecting_reconnection.swap(false, Ordering::SeqCst) {
            debug!(
                target: "Instance/Pairing",
                "Tolerating disconnect of {} while expecting reconnection ({})",
                self.manager.key().instance_id(),
                reason
            );
            *self.lock_deferred() = Some(reason);
            return;
        }
        self.fail(PairingFailure::Disconnected { reason });
    }

    fn lock_deferred(&self) -> std::sync::MutexGuard<'_, Option<CloseReason>> {
        self.deferred_close
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn listen<F>(
        self: Arc<Self>,
        mut events: broadcast::Receiver<ConnectionEvent>,
        on_code: Arc<F>,
    ) where
        F: Fn(&PairingCode) + Send + Sync + 'static,
    {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(
                        target: "Instance/Pairing",
                        "Pairing listener lagged by {skipped} events"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            match event {
                ConnectionEvent::StateChanged(change) => match change.current {
                    ConnectionState::Connected => self.succeed(),
                    ConnectionState::Connecting | ConnectionState::Reconnecting => {
                        self.expecting_reconnection.store(true, Ordering::SeqCst);
                    }
                    ConnectionState::Disconnected => {
                        self.on_close(change.reason.unwrap_or(CloseReason::Unknown(0)));
                    }
                    ConnectionState::PairingRequired => {
                        if matches!(
                            change.previous,
                            ConnectionState::Connecting | ConnectionState::Reconnecting
                        ) {
                            self.code_reissued();
                        }
                    }
                },
                ConnectionEvent::PairingCode { code, .. } => {
                    let mut last_code = self
                        .last_code
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if last_code.as_ref() != Some(&code) {
                        debug!(
                            target: "Instance/Pairing",
                            "Refreshed pairing code for {}",
                            self.manager.key().instance_id()
                        );
                        (*on_code)(&code);
                        *last_code = Some(code);
                    }
                }
                ConnectionEvent::LoggedOut { .. } => self.fail(PairingFailure::LoggedOut),
                ConnectionEvent::Error(error) if error.fatal => {
                    self.fail(PairingFailure::ReconnectExhausted {
                        attempts: self.manager.reconnect_attempts(),
                    });
                }
                _ => {}
            }
            if self.settle.is_settled() {
                return;
            }
        }
    }

    async fn poll(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut stuck_polls = 0u32;
        let mut previous = ConnectionState::PairingRequired;

        loop {
            interval.tick().await;
            if self.settle.is_settled() {
                return;
            }
            let state = self.manager.state();
            let was_reconnecting = matches!(
                previous,
                ConnectionState::Connecting | ConnectionState::Reconnecting
            );
            previous = state;
            match state {
                ConnectionState::Connected => {
                    self.succeed();
                    return;
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    self.expecting_reconnection.store(true, Ordering::SeqCst);
                    stuck_polls += 1;
                    if stuck_polls >= self.config.stuck_threshold {
                        self.fail(PairingFailure::Stuck { state });
                        return;
                    }
                }
                ConnectionState::PairingRequired => {
                    stuck_polls = 0;
                    if was_reconnecting {
                        self.code_reissued();
                    }
                    if self.shown_for() >= self.config.scan_timeout
                        && !self.expecting_reconnection.load(Ordering::SeqCst)
                    {
                        self.fail(PairingFailure::ScanTimeout);
                        return;
                    }
                }
                ConnectionState::Disconnected => {
                    stuck_polls = 0;
                    if self.manager.is_logged_out() {
                        self.fail(PairingFailure::LoggedOut);
                        return;
                    }
                    // A disconnect was absorbed but nothing is bringing the
                    // session back.
                    if !self.in_grace() && !self.manager.has_pending_reconnect() {
                        let reason = self
                            .lock_deferred()
                            .take()
                            .unwrap_or(CloseReason::ConnectionClosed);
                        self.fail(PairingFailure::Disconnected { reason });
                        return;
                    }
                }
            }
        }
    }
}

/// Drives one pairing attempt for a manager.
pub struct PairingCoordinator {
    manager: Arc<ConnectionManager>,
    config: PairingConfig,
}

impl PairingCoordinator {
    pub fn new(manager: Arc<ConnectionManager>, config: PairingConfig) -> Self {
        Self { manager, config }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Connects and waits until the instance is paired, or fails with a
    /// readable reason. `on_code` is called for every code to display,
    /// including refreshed QR payloads.
    pub async fn pair<F>(&self, method: PairingMethod, on_code: F) -> PairingResult
    where
        F: Fn(&PairingCode) + Send + Sync + 'static,
    {
        let phone_number = match &method {
            PairingMethod::Qr => None,
            PairingMethod::PhoneNumber(raw) => Some(
                normalize_phone_number(raw)
                    .map_err(|e| PairingFailure::Transport(e.to_string()))?,
            ),
        };
        let key = self.manager.key().clone();
        let started = Instant::now();
        let deadline = started + self.config.overall_timeout;
        let on_code = Arc::new(on_code);

        // Subscribe before connecting so no event can slip past.
        let mut events = self.manager.subscribe();
        info!(
            target: "Instance/Pairing",
            "Starting pairing for {}",
            key
        );
        if let Err(e) = self.manager.connect().await
            && !self.manager.has_pending_reconnect()
        {
            return Err(PairingFailure::Transport(e.to_string()));
        }

        tokio::time::sleep(self.config.settle).await;
        if self.manager.is_connected() {
            info!(
                target: "Instance/Pairing",
                "Instance {} resumed without pairing",
                key.instance_id()
            );
            return Ok(PairingSuccess {
                resumed: true,
                elapsed: started.elapsed(),
            });
        }

        if let Some(phone_number) = phone_number {
            self.wait_until_ready(&mut events, deadline).await?;
            self.manager
                .request_pairing_code(&phone_number)
                .await
                .map_err(pairing_failure)?;
        }

        let code_deadline = deadline.min(Instant::now() + self.config.code_timeout);
        let shown = match self.wait_for_code(&mut events, code_deadline).await? {
            CodeWait::Connected => {
                return Ok(PairingSuccess {
                    resumed: false,
                    elapsed: started.elapsed(),
                });
            }
            CodeWait::Code(code) => code,
        };
        (*on_code)(&shown);

        let (settle, outcome) = Settle::new();
        let watch = Arc::new(Watch {
            manager: self.manager.clone(),
            config: self.config.clone(),
            started,
            shown_at: Mutex::new(Instant::now()),
            settle,
            expecting_reconnection: AtomicBool::new(false),
            deferred_close: Mutex::new(None),
            last_code: Mutex::new(Some(shown)),
        });
        let tasks = scopeguard::guard(
            [
                tokio::spawn(watch.clone().listen(events, on_code)),
                tokio::spawn(watch.clone().poll()),
            ],
            |tasks| {
                for task in tasks {
                    task.abort();
                }
            },
        );

        let result = match tokio::time::timeout_at(deadline, outcome).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PairingFailure::Transport(
                "pairing watchers stopped unexpectedly".to_string(),
            )),
            Err(_) => self.timeout_outcome(started),
        };
        drop(tasks);
        result
    }

    /// Waits for the session to reach a state where a link code may be
    /// requested.
    async fn wait_until_ready(
        &self,
        events: &mut broadcast::Receiver<ConnectionEvent>,
        deadline: Instant,
    ) -> Result<(), PairingFailure> {
        loop {
            match self.manager.state() {
                ConnectionState::Connecting | ConnectionState::PairingRequired => return Ok(()),
                ConnectionState::Disconnected if self.manager.is_logged_out() => {
                    return Err(PairingFailure::LoggedOut);
                }
                _ => {}
            }
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => return Err(PairingFailure::Timeout),
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(PairingFailure::Timeout);
                }
                Ok(_) => {}
            }
        }
    }

    async fn wait_for_code(
        &self,
        events: &mut broadcast::Receiver<ConnectionEvent>,
        deadline: Instant,
    ) -> Result<CodeWait, PairingFailure> {
        if let Some(code) = self.manager.current_pairing_code() {
            return Ok(CodeWait::Code(code));
        }
        loop {
            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(event)) => event,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    // The event may have raced the subscription; trust the state.
                    return match self.manager.state() {
                        ConnectionState::Connected => Ok(CodeWait::Connected),
                        _ => match self.manager.current_pairing_code() {
                            Some(code) => Ok(CodeWait::Code(code)),
                            None => Err(PairingFailure::Timeout),
                        },
                    };
                }
            };
            match event {
                ConnectionEvent::PairingCode { code, .. } => return Ok(CodeWait::Code(code)),
                ConnectionEvent::StateChanged(change) => match change.current {
                    ConnectionState::Connected => return Ok(CodeWait::Connected),
                    ConnectionState::Disconnected => {
                        let reason = change.reason.unwrap_or(CloseReason::Unknown(0));
                        if reason.is_terminal() {
                            return Err(PairingFailure::LoggedOut);
                        }
                        if !self.manager.auto_reconnect() {
                            return Err(PairingFailure::Disconnected { reason });
                        }
                    }
                    _ => {}
                },
                ConnectionEvent::Error(error) if error.fatal => {
                    return Err(PairingFailure::ReconnectExhausted {
                        attempts: self.manager.reconnect_attempts(),
                    });
                }
                _ => {}
            }
        }
    }

    fn timeout_outcome(&self, started: Instant) -> PairingResult {
        if self.manager.is_connected() {
            return Ok(PairingSuccess {
                resumed: false,
                elapsed: started.elapsed(),
            });
        }
        warn!(
            target: "Instance/Pairing",
            "Pairing of {} timed out in state {}",
            self.manager.key().instance_id(),
            self.manager.state()
        );
        Err(PairingFailure::Timeout)
    }
}

enum CodeWait {
    Code(PairingCode),
    Connected,
}

fn pairing_failure(error: ConnectionError) -> PairingFailure {
    match error {
        ConnectionError::ReconnectExhausted { attempts } => {
            PairingFailure::ReconnectExhausted { attempts }
        }
        other => PairingFailure::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, ReconnectConfig};
    use crate::transport::mock::MockTransportFactory;
    use crate::transport::{ConnectionUpdate, TransportEvent};
    use crate::types::instance::InstanceKey;

    fn pairing_config() -> PairingConfig {
        PairingConfig {
            settle: Duration::from_millis(100),
            code_timeout: Duration::from_secs(5),
            disconnect_grace: Duration::from_secs(3),
            scan_timeout: Duration::from_secs(10),
            overall_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            stuck_threshold: 6,
        }
    }

    fn setup(auto_reconnect: bool) -> (PairingCoordinator, Arc<MockTransportFactory>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let factory = Arc::new(MockTransportFactory::new());
        let manager = ConnectionManager::new(
            InstanceKey::new("a", "/s"),
            ConnectionConfig {
                auto_reconnect,
                reconnect: ReconnectConfig {
                    delay: Duration::from_millis(200),
                    max_attempts: None,
                },
            },
            factory.clone(),
            None,
        );
        (PairingCoordinator::new(manager, pairing_config()), factory)
    }

    fn code_sink() -> (Arc<Mutex<Vec<String>>>, impl Fn(&PairingCode) + Send + Sync + 'static) {
        let codes = Arc::new(Mutex::new(Vec::new()));
        let sink = codes.clone();
        (codes, move |code: &PairingCode| {
            sink.lock().unwrap().push(code.code.clone())
        })
    }

    #[test]
    fn test_normalize_phone_number() {
        assert_eq!(
            normalize_phone_number("+1 (555) 123-4567").unwrap(),
            "15551234567"
        );
        assert_eq!(normalize_phone_number(""), Err(PhoneNumberError::Required));
        assert_eq!(normalize_phone_number("+-"), Err(PhoneNumberError::Required));
        assert_eq!(normalize_phone_number("12345"), Err(PhoneNumberError::TooShort));
        assert_eq!(
            normalize_phone_number("05551234567"),
            Err(PhoneNumberError::NotInternational)
        );
    }

    #[test]
    fn test_settle_first_wins() {
        let (settle, mut rx) = Settle::new();
        assert!(!settle.is_settled());
        assert!(settle.settle(1));
        assert!(!settle.settle(2));
        assert!(settle.is_settled());
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_session_succeeds_without_code() {
        let (coordinator, factory) = setup(true);
        factory.script_on_create(vec![TransportEvent::ConnectionUpdate(
            ConnectionUpdate::open(),
        )]);
        let (codes, on_code) = code_sink();

        let success = coordinator.pair(PairingMethod::Qr, on_code).await.unwrap();
        assert!(success.resumed);
        assert!(codes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_qr_scan_then_open_succeeds() {
        let (coordinator, factory) = setup(true);
        factory.script_on_create(vec![TransportEvent::PairingCode("qr-1".into())]);
        let (codes, on_code) = code_sink();

        let driver = {
            let factory = factory.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                factory.emit(TransportEvent::PairingCode("qr-2".into())).await;
                tokio::time::sleep(Duration::from_secs(1)).await;
                factory
                    .emit(TransportEvent::ConnectionUpdate(ConnectionUpdate::open()))
                    .await;
            })
        };

        let success = coordinator.pair(PairingMethod::Qr, on_code).await.unwrap();
        driver.await.unwrap();
        assert!(!success.resumed);
        assert_eq!(*codes.lock().unwrap(), vec!["qr-1", "qr-2"]);
        assert!(coordinator.manager().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_scan_is_tolerated() {
        let (coordinator, factory) = setup(true);
        factory.script_on_create(vec![TransportEvent::PairingCode("qr-1".into())]);
        let (_codes, on_code) = code_sink();

        let driver = {
            let factory = factory.clone();
            tokio::spawn(async move {
                // Past the grace window, so only the restart rule applies.
                tokio::time::sleep(Duration::from_secs(5)).await;
                factory.script_on_create(vec![TransportEvent::ConnectionUpdate(
                    ConnectionUpdate::open(),
                )]);
                factory
                    .emit(TransportEvent::ConnectionUpdate(ConnectionUpdate::close(
                        CloseReason::RestartRequired,
                    )))
                    .await;
            })
        };

        let result = coordinator.pair(PairingMethod::Qr, on_code).await;
        driver.await.unwrap();
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_inside_grace_is_ignored() {
        let (coordinator, factory) = setup(true);
        factory.script_on_create(vec![TransportEvent::PairingCode("qr-1".into())]);
        let (_codes, on_code) = code_sink();

        let driver = {
            let factory = factory.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                factory.script_on_create(vec![
                    TransportEvent::PairingCode("qr-2".into()),
                    TransportEvent::ConnectionUpdate(ConnectionUpdate::open()),
                ]);
                factory
                    .emit(TransportEvent::ConnectionUpdate(ConnectionUpdate::close(
                        CloseReason::ConnectionLost,
                    )))
                    .await;
            })
        };

        let result = coordinator.pair(PairingMethod::Qr, on_code).await;
        driver.await.unwrap();
        assert!(result.is_ok(), "{result:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_after_grace_fails() {
        let (coordinator, factory) = setup(true);
        factory.script_on_create(vec![TransportEvent::PairingCode("qr-1".into())]);
        let (_codes, on_code) = code_sink();

        let driver = {
            let factory = factory.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                factory
                    .emit(TransportEvent::ConnectionUpdate(ConnectionUpdate::close(
                        CloseReason::ConnectionReplaced,
                    )))
                    .await;
            })
        };

        let result = coordinator.pair(PairingMethod::Qr, on_code).await;
        driver.await.unwrap();
        assert_eq!(
            result,
            Err(PairingFailure::Disconnected {
                reason: CloseReason::ConnectionReplaced
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_pairing_fails_immediately() {
        let (coordinator, factory) = setup(true);
        factory.script_on_create(vec![TransportEvent::PairingCode("qr-1".into())]);
        let (_codes, on_code) = code_sink();

        let driver = {
            let factory = factory.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                factory
                    .emit(TransportEvent::ConnectionUpdate(ConnectionUpdate::close(
                        CloseReason::LoggedOut,
                    )))
                    .await;
            })
        };

        let started = Instant::now();
        let result = coordinator.pair(PairingMethod::Qr, on_code).await;
        driver.await.unwrap();
        assert_eq!(result, Err(PairingFailure::LoggedOut));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unscanned_code_hits_scan_timeout() {
        let (coordinator, factory) = setup(true);
        factory.script_on_create(vec![TransportEvent::PairingCode("qr-1".into())]);
        let (_codes, on_code) = code_sink();

        let result = coordinator.pair(PairingMethod::Qr, on_code).await;
        assert_eq!(result, Err(PairingFailure::ScanTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_code_reissued_after_reconnect_still_hits_scan_timeout() {
        let (coordinator, factory) = setup(true);
        factory.script_on_create(vec![TransportEvent::PairingCode("qr-1".into())]);
        let (codes, on_code) = code_sink();

        let driver = {
            let factory = factory.clone();
            tokio::spawn(async move {
                // Inside the grace window; the reconnect asks for a new scan.
                tokio::time::sleep(Duration::from_secs(1)).await;
                factory.script_on_create(vec![TransportEvent::PairingCode("qr-2".into())]);
                factory
                    .emit(TransportEvent::ConnectionUpdate(ConnectionUpdate::close(
                        CloseReason::ConnectionLost,
                    )))
                    .await;
            })
        };

        let started = Instant::now();
        let result = coordinator.pair(PairingMethod::Qr, on_code).await;
        driver.await.unwrap();
        assert_eq!(result, Err(PairingFailure::ScanTimeout));
        // The window restarts when qr-2 is shown, about a second after qr-1.
        assert!(started.elapsed() > Duration::from_secs(11));
        assert!(started.elapsed() < Duration::from_secs(13));
        assert_eq!(*codes.lock().unwrap(), vec!["qr-1", "qr-2"]);
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_code_times_out() {
        let (coordinator, _factory) = setup(true);
        let (_codes, on_code) = code_sink();

        let result = coordinator.pair(PairingMethod::Qr, on_code).await;
        assert_eq!(result, Err(PairingFailure::Timeout));
        assert_eq!(result.unwrap_err().to_string(), "timeout waiting for pairing");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_connecting_fails_fast() {
        let (coordinator, factory) = setup(true);
        factory.script_on_create(vec![TransportEvent::PairingCode("qr-1".into())]);
        let (_codes, on_code) = code_sink();

        let driver = {
            let factory = factory.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                factory
                    .emit(TransportEvent::ConnectionUpdate(ConnectionUpdate::connecting()))
                    .await;
            })
        };

        let started = Instant::now();
        let result = coordinator.pair(PairingMethod::Qr, on_code).await;
        driver.await.unwrap();
        assert_eq!(
            result,
            Err(PairingFailure::Stuck {
                state: ConnectionState::Connecting
            })
        );
        assert_eq!(
            result.unwrap_err().to_string(),
            "stuck in connecting state"
        );
        assert!(started.elapsed() < pairing_config().overall_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phone_number_pairing() {
        let (coordinator, factory) = setup(true);
        factory.support_link_code("ABCD1234");
        let (codes, on_code) = code_sink();

        let driver = {
            let factory = factory.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(4)).await;
                factory
                    .emit(TransportEvent::ConnectionUpdate(ConnectionUpdate::open()))
                    .await;
            })
        };

        let result = coordinator
            .pair(PairingMethod::PhoneNumber("+1 555 123 4567".into()), on_code)
            .await;
        driver.await.unwrap();
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(*codes.lock().unwrap(), vec!["ABCD1234"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_phone_number_fails_before_connecting() {
        let (coordinator, factory) = setup(true);
        let (_codes, on_code) = code_sink();

        let result = coordinator
            .pair(PairingMethod::PhoneNumber("0123".into()), on_code)
            .await;
        assert!(matches!(result, Err(PairingFailure::Transport(_))));
        assert_eq!(factory.created(), 0);
    }
}
