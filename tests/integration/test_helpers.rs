//! Shared fakes for manager-level integration tests.
//!
//! Provides in-memory stand-ins for the connection, client factory, agent
//! client, cleaner, clock, and id generator so individual test modules can
//! focus on lifecycle behaviour without spawning processes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use agent_conductor::acp::protocol::{AgentMessage, MessageContent};
use agent_conductor::connection::Connection;
use agent_conductor::driver::{AgentClient, BoxFuture, ClientFactory};
use agent_conductor::models::session::UserSessionSnapshot;
use agent_conductor::orchestrator::hooks::{Cleaner, Clock, IdGenerator};
use agent_conductor::{AppError, Manager, Result};

/// Connection that accepts everything and yields nothing.
pub struct NullConnection;

impl Connection for NullConnection {
    fn send(&self, _value: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn receive(&self) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

pub fn connection() -> Option<Arc<dyn Connection>> {
    Some(Arc::new(NullConnection))
}

/// In-memory agent client that echoes content and counts closes.
pub struct FakeClient {
    pub workspace: PathBuf,
    closes: AtomicUsize,
    close_delay: Option<Duration>,
    fail_close: bool,
    sent: Mutex<Vec<String>>,
}

impl FakeClient {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }
}

impl AgentClient for FakeClient {
    fn send_message<'a>(
        &'a self,
        content: &'a str,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<AgentMessage>> {
        Box::pin(async move {
            self.sent.lock().expect("sent lock").push(content.to_owned());
            Ok(AgentMessage {
                content: MessageContent::Text(format!("echo: {content}")),
                metadata: None,
            })
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.close_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_close {
                return Err(AppError::Io("fake close failure".into()));
            }
            Ok(())
        })
    }
}

/// Factory that hands out [`FakeClient`]s and can be told to fail or stall.
#[derive(Default)]
pub struct FakeFactory {
    clients: Mutex<Vec<Arc<FakeClient>>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    spawn_delay: Option<Duration>,
    close_delay: Option<Duration>,
    fail_close: bool,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `new_client` call sleeps for `delay` first.
    pub fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = Some(delay);
        self
    }

    /// Every client's `close` sleeps for `delay`.
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = Some(delay);
        self
    }

    /// Every client's `close` returns an error.
    pub fn with_failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Refuse workspaces whose last path component is `name`.
    pub fn fail_workspace(&self, name: &str) {
        self.failing.lock().expect("failing lock").insert(name.to_owned());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn clients(&self) -> Vec<Arc<FakeClient>> {
        self.clients.lock().expect("clients lock").clone()
    }

    pub fn client_for(&self, workspace: &Path) -> Option<Arc<FakeClient>> {
        self.clients()
            .into_iter()
            .find(|client| client.workspace == workspace)
    }
}

impl ClientFactory for FakeFactory {
    fn new_client<'a>(&'a self, workspace: &'a Path) -> BoxFuture<'a, Result<Arc<dyn AgentClient>>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.spawn_delay {
                tokio::time::sleep(delay).await;
            }

            let name = workspace
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if self.failing.lock().expect("failing lock").contains(&name) {
                return Err(AppError::Spawn(format!("factory refused {name}")));
            }

            let client = Arc::new(FakeClient {
                workspace: workspace.to_path_buf(),
                closes: AtomicUsize::new(0),
                close_delay: self.close_delay,
                fail_close: self.fail_close,
                sent: Mutex::new(Vec::new()),
            });
            self.clients
                .lock()
                .expect("clients lock")
                .push(Arc::clone(&client));
            Ok(client as Arc<dyn AgentClient>)
        })
    }
}

/// Cleaner that records every snapshot it is handed.
#[derive(Default)]
pub struct RecordingCleaner {
    seen: Mutex<Vec<UserSessionSnapshot>>,
    fail: bool,
}

impl RecordingCleaner {
    pub fn failing() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn seen(&self) -> Vec<UserSessionSnapshot> {
        self.seen.lock().expect("seen lock").clone()
    }
}

impl Cleaner for RecordingCleaner {
    fn cleanup<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        session: &'a UserSessionSnapshot,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.seen.lock().expect("seen lock").push(session.clone());
            if self.fail {
                return Err(AppError::Io("cleanup failed".into()));
            }
            Ok(())
        })
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(
                Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
                    .single()
                    .expect("valid time"),
            ),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

/// Ids `session-1`, `session-2`, ...
#[derive(Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> String {
        format!("session-{}", self.next.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Manager over `factory` with sequential ids and a short close timeout.
pub fn manager(factory: &Arc<FakeFactory>) -> Manager {
    Manager::builder()
        .client_factory(Arc::clone(factory) as Arc<dyn ClientFactory>)
        .id_generator(Arc::new(SequentialIds::default()))
        .agent_close_timeout(Duration::from_secs(2))
        .build()
        .expect("manager builds")
}

/// Manager over `factory` that reports teardown to `cleaner`.
pub fn manager_with_cleaner(factory: &Arc<FakeFactory>, cleaner: &Arc<RecordingCleaner>) -> Manager {
    Manager::builder()
        .client_factory(Arc::clone(factory) as Arc<dyn ClientFactory>)
        .cleaner(Arc::clone(cleaner) as Arc<dyn Cleaner>)
        .id_generator(Arc::new(SequentialIds::default()))
        .agent_close_timeout(Duration::from_secs(2))
        .build()
        .expect("manager builds")
}
