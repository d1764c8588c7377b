//! Shared handlers and helpers for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use notification_processor::command::{CommandFactory, CreateIncident};
use notification_processor::dispatch::CommandDispatcher;
use notification_processor::engine::Pipeline;
use notification_processor::handler::{Handler, HandlerRegistry};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Names of handlers in the order they ran.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<&'static str>>>);

impl CallLog {
    pub fn push(&self, name: &'static str) {
        self.0.lock().unwrap().push(name);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }
}

/// Records its invocation, then succeeds or fails as configured.
pub struct Recording {
    pub name: &'static str,
    pub log: CallLog,
    pub fail: bool,
}

impl Recording {
    pub fn ok(name: &'static str, log: &CallLog) -> Self {
        Self {
            name,
            log: log.clone(),
            fail: false,
        }
    }

    pub fn failing(name: &'static str, log: &CallLog) -> Self {
        Self {
            name,
            log: log.clone(),
            fail: true,
        }
    }
}

#[async_trait]
impl Handler<CreateIncident> for Recording {
    async fn handle(&self, _command: &CreateIncident) -> anyhow::Result<()> {
        self.log.push(self.name);
        if self.fail {
            anyhow::bail!("{} failed", self.name);
        }
        Ok(())
    }
}

/// Fails whenever the description is "fail"; panics on "panic".
pub struct Picky;

#[async_trait]
impl Handler<CreateIncident> for Picky {
    async fn handle(&self, command: &CreateIncident) -> anyhow::Result<()> {
        match command.description() {
            "fail" => anyhow::bail!("refused"),
            "panic" => panic!("handler blew up"),
            _ => Ok(()),
        }
    }
}

/// Tracks how many invocations overlap.
#[derive(Clone, Default)]
pub struct Overlap {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    pub hold: Duration,
}

impl Overlap {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            ..Self::default()
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler<CreateIncident> for Overlap {
    async fn handle(&self, _command: &CreateIncident) -> anyhow::Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Blocks inside the handler until released.
#[derive(Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
    finished: Arc<AtomicBool>,
}

impl Gate {
    /// Whether a handler call got past the gate and returned.
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler<CreateIncident> for Gate {
    async fn handle(&self, _command: &CreateIncident) -> anyhow::Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub fn pipeline(registry: HandlerRegistry) -> Pipeline {
    Pipeline::new(
        CommandFactory::new(),
        CommandDispatcher::new(Arc::new(registry)),
    )
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
