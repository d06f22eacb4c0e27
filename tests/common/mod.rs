#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use whatsapp_instances::InstanceKey;
use whatsapp_instances::transport::{Transport, TransportEvent, TransportFactory};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct ScriptedTransport {
    disconnected: AtomicBool,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

struct Session {
    instance: InstanceKey,
    transport: Arc<ScriptedTransport>,
    events: mpsc::Sender<TransportEvent>,
}

/// In-memory transport factory; tests push events into the sessions it hands out.
#[derive(Default)]
pub struct ScriptedFactory {
    sessions: Mutex<Vec<Session>>,
    failures_remaining: AtomicU32,
    on_create: Mutex<Vec<TransportEvent>>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn script_on_create(&self, events: Vec<TransportEvent>) {
        *self.on_create.lock().unwrap() = events;
    }

    pub fn created_for(&self, instance_id: &str) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.instance.instance_id() == instance_id)
            .count()
    }

    pub fn live_sessions_for(&self, instance_id: &str) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| {
                s.instance.instance_id() == instance_id
                    && !s.transport.disconnected.load(Ordering::SeqCst)
            })
            .count()
    }

    /// Sends `event` into the newest session of `instance_id`.
    pub async fn emit(&self, instance_id: &str, event: TransportEvent) {
        let sender = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.instance.instance_id() == instance_id)
            .map(|s| s.events.clone())
            .expect("no session for instance");
        sender.send(event).await.expect("session event stream closed");
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn create_transport(
        &self,
        instance: &InstanceKey,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow::anyhow!("connection refused"));
        }

        let (tx, rx) = mpsc::channel(32);
        for event in self.on_create.lock().unwrap().iter().cloned() {
            tx.try_send(event).unwrap();
        }
        let transport = Arc::new(ScriptedTransport {
            disconnected: AtomicBool::new(false),
        });
        self.sessions.lock().unwrap().push(Session {
            instance: instance.clone(),
            transport: transport.clone(),
            events: tx,
        });
        Ok((transport, rx))
    }
}
