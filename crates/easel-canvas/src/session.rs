//! Lifecycle of the single active canvas session.
//!
//! The manager is either idle or holds exactly one [`Session`]. Switching
//! to another name always saves and stops the current session before the
//! next transport is started, so two canvases never listen at once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use easel_core::config::Config;
use easel_core::types::ImageData;

use crate::broker::{DEFAULT_EXPORT_TIMEOUT, DEFAULT_SNAPSHOT_TIMEOUT, PeerBroker};
use crate::error::SessionError;
use crate::relay::SyncRelay;
use crate::store::{FileWorkspaceStore, WorkspaceStore, validate_name};
use crate::transport::{Transport, TransportOptions, WsTransport};

/// Persists the state of one session.
#[async_trait]
pub trait SaveOperation: Send + Sync {
    async fn save(&self) -> anyhow::Result<()>;
}

/// Builds the broker, transport and save operation for a name.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, name: &str) -> Result<Session, SessionError>;
}

pub struct Session {
    name: String,
    broker: Arc<PeerBroker>,
    transport: Box<dyn Transport>,
    save: Arc<dyn SaveOperation>,
}

impl Session {
    pub fn new(
        name: impl Into<String>,
        broker: Arc<PeerBroker>,
        transport: Box<dyn Transport>,
        save: Arc<dyn SaveOperation>,
    ) -> Self {
        Self {
            name: name.into(),
            broker,
            transport,
            save,
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            name: self.name.clone(),
            address: self.transport.address().to_string(),
        }
    }
}

/// What the command layer shows about the active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CanvasTimeouts {
    pub snapshot: Duration,
    pub export: Duration,
}

impl Default for CanvasTimeouts {
    fn default() -> Self {
        Self {
            snapshot: DEFAULT_SNAPSHOT_TIMEOUT,
            export: DEFAULT_EXPORT_TIMEOUT,
        }
    }
}

pub struct SessionManager {
    factory: Arc<dyn SessionFactory>,
    store: Arc<dyn WorkspaceStore>,
    timeouts: CanvasTimeouts,
    active: Mutex<Option<Session>>,
}

impl SessionManager {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        store: Arc<dyn WorkspaceStore>,
        timeouts: CanvasTimeouts,
    ) -> Self {
        Self {
            factory,
            store,
            timeouts,
            active: Mutex::new(None),
        }
    }

    /// Manager backed by WebSocket transports and snapshot files from `config.canvas`.
    pub fn from_config(config: &Config) -> Self {
        let canvas = config.canvas();
        let store: Arc<dyn WorkspaceStore> = Arc::new(FileWorkspaceStore::new(config.canvas_dir()));
        let factory = Arc::new(CanvasSessionFactory {
            options: TransportOptions {
                bind: canvas.bind.unwrap_or_else(|| "0.0.0.0".into()),
                port: canvas.port,
                public_host: canvas.public_host,
            },
            store: store.clone(),
        });
        let timeouts = CanvasTimeouts {
            snapshot: Duration::from_secs(canvas.snapshot_timeout_secs),
            export: Duration::from_secs(canvas.export_timeout_secs),
        };
        Self::new(factory, store, timeouts)
    }

    pub fn timeouts(&self) -> CanvasTimeouts {
        self.timeouts
    }

    /// Make `name` the active session. Re-opening the active name is a no-op.
    pub async fn open(&self, name: &str) -> Result<SessionInfo, SessionError> {
        validate_name(name)?;
        let mut active = self.active.lock().await;

        if let Some(session) = active.as_ref() {
            if session.name == name {
                return Ok(session.info());
            }
        }

        if let Some(previous) = active.take() {
            teardown(previous).await;
        }

        let session = self.factory.create(name).await?;
        let info = session.info();
        info!(canvas = %info.name, address = %info.address, "Canvas session opened");
        *active = Some(session);
        Ok(info)
    }

    /// Save (best effort) and stop the active session, if any.
    /// The slot stays locked until teardown finishes, so a concurrent `open`
    /// cannot start a transport while this one still listens.
    pub async fn close(&self) {
        let mut active = self.active.lock().await;
        if let Some(session) = active.take() {
            teardown(session).await;
        }
    }

    pub async fn save(&self) -> Result<(), SessionError> {
        let (name, save) = {
            let active = self.active.lock().await;
            let session = active.as_ref().ok_or(SessionError::NoActiveSession)?;
            (session.name.clone(), session.save.clone())
        };
        save.save()
            .await
            .map_err(|source| SessionError::Save { name, source })
    }

    /// Export every page of the active canvas.
    pub async fn export_pages(&self, timeout: Duration) -> Result<Vec<ImageData>, SessionError> {
        let broker = self.broker().await.ok_or(SessionError::NoActiveSession)?;
        Ok(broker.issue_export(timeout).await?)
    }

    /// Names of saved canvases.
    pub async fn list(&self) -> Result<Vec<String>, SessionError> {
        self.store.list().await.map_err(SessionError::Store)
    }

    /// Broker of the active session. The lock is not held while the caller
    /// awaits a request, so `close` is never blocked by one.
    pub async fn broker(&self) -> Option<Arc<PeerBroker>> {
        self.active.lock().await.as_ref().map(|s| s.broker.clone())
    }

    pub async fn save_operation(&self) -> Option<Arc<dyn SaveOperation>> {
        self.active.lock().await.as_ref().map(|s| s.save.clone())
    }

    pub async fn is_connected(&self) -> bool {
        match self.broker().await {
            Some(broker) => broker.is_connected().await,
            None => false,
        }
    }

    pub async fn active_info(&self) -> Option<SessionInfo> {
        self.active.lock().await.as_ref().map(Session::info)
    }
}

async fn teardown(session: Session) {
    if let Err(e) = session.save.save().await {
        warn!(canvas = %session.name, %e, "Saving canvas failed; closing anyway");
    }
    session.transport.stop().await;
    info!(canvas = %session.name, "Canvas session closed");
}

/// Saves the relay log of one canvas through a [`WorkspaceStore`].
pub struct RelaySave {
    name: String,
    relay: Arc<SyncRelay>,
    store: Arc<dyn WorkspaceStore>,
}

#[async_trait]
impl SaveOperation for RelaySave {
    async fn save(&self) -> anyhow::Result<()> {
        let frames = self.relay.frames().await;
        self.store.save(&self.name, &frames).await
    }
}

/// Production factory: seeded relay, fresh broker, WebSocket transport.
pub struct CanvasSessionFactory {
    pub options: TransportOptions,
    pub store: Arc<dyn WorkspaceStore>,
}

#[async_trait]
impl SessionFactory for CanvasSessionFactory {
    async fn create(&self, name: &str) -> Result<Session, SessionError> {
        let seed = self
            .store
            .load(name)
            .await
            .map_err(SessionError::Store)?;
        let relay = Arc::new(SyncRelay::new(seed));
        let broker = Arc::new(PeerBroker::new());

        let transport = WsTransport::start(name, &self.options, broker.clone(), relay.clone())
            .await
            .map_err(SessionError::Transport)?;

        let save = Arc::new(RelaySave {
            name: name.to_string(),
            relay,
            store: self.store.clone(),
        });

        Ok(Session::new(name, broker, Box::new(transport), save))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    type EventLog = Arc<StdMutex<Vec<String>>>;

    struct FakeTransport {
        name: String,
        address: String,
        log: EventLog,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn address(&self) -> &str {
            &self.address
        }

        async fn stop(&self) {
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
        }
    }

    struct FakeSave {
        name: String,
        fail: bool,
        delay: Duration,
        log: EventLog,
    }

    #[async_trait]
    impl SaveOperation for FakeSave {
        async fn save(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("save:{}", self.name));
            tokio::time::sleep(self.delay).await;
            if self.fail {
                anyhow::bail!("disk full");
            }
            Ok(())
        }
    }

    struct FakeFactory {
        log: EventLog,
        failing_saves: bool,
        save_delay: Duration,
    }

    #[async_trait]
    impl SessionFactory for FakeFactory {
        async fn create(&self, name: &str) -> Result<Session, SessionError> {
            self.log.lock().unwrap().push(format!("start:{name}"));
            Ok(Session::new(
                name,
                Arc::new(PeerBroker::new()),
                Box::new(FakeTransport {
                    name: name.into(),
                    address: format!("ws://test/{name}"),
                    log: self.log.clone(),
                }),
                Arc::new(FakeSave {
                    name: name.into(),
                    fail: self.failing_saves,
                    delay: self.save_delay,
                    log: self.log.clone(),
                }),
            ))
        }
    }

    struct EmptyStore;

    #[async_trait]
    impl WorkspaceStore for EmptyStore {
        async fn load(&self, _name: &str) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn save(&self, _name: &str, _frames: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn list(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec!["a".into(), "b".into()])
        }
    }

    fn manager(failing_saves: bool) -> (SessionManager, EventLog) {
        manager_with_save_delay(failing_saves, Duration::ZERO)
    }

    fn manager_with_save_delay(
        failing_saves: bool,
        save_delay: Duration,
    ) -> (SessionManager, EventLog) {
        let log: EventLog = Arc::new(StdMutex::new(Vec::new()));
        let factory = Arc::new(FakeFactory {
            log: log.clone(),
            failing_saves,
            save_delay,
        });
        (
            SessionManager::new(factory, Arc::new(EmptyStore), CanvasTimeouts::default()),
            log,
        )
    }

    fn events(log: &EventLog) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_idle_operations() {
        let (sessions, log) = manager(false);
        assert!(sessions.active_info().await.is_none());
        assert!(sessions.broker().await.is_none());
        assert!(sessions.save_operation().await.is_none());
        assert!(!sessions.is_connected().await);
        assert!(matches!(sessions.save().await, Err(SessionError::NoActiveSession)));
        assert!(matches!(
            sessions.export_pages(Duration::from_secs(1)).await,
            Err(SessionError::NoActiveSession)
        ));
        sessions.close().await;
        assert!(events(&log).is_empty());
    }

    #[tokio::test]
    async fn test_reopen_same_name_is_idempotent() {
        let (sessions, log) = manager(false);
        let first = sessions.open("a").await.unwrap();
        let broker = sessions.broker().await.unwrap();

        let second = sessions.open("a").await.unwrap();
        assert_eq!(first, second);
        assert!(Arc::ptr_eq(&broker, &sessions.broker().await.unwrap()));
        assert_eq!(events(&log), vec!["start:a"]);
    }

    #[tokio::test]
    async fn test_switch_saves_and_stops_before_starting_next() {
        let (sessions, log) = manager(false);
        sessions.open("a").await.unwrap();
        let info = sessions.open("b").await.unwrap();
        assert_eq!(info.name, "b");
        assert_eq!(info.address, "ws://test/b");
        assert_eq!(events(&log), vec!["start:a", "save:a", "stop:a", "start:b"]);
    }

    #[tokio::test]
    async fn test_switch_proceeds_when_save_fails() {
        let (sessions, log) = manager(true);
        sessions.open("a").await.unwrap();
        sessions.open("b").await.unwrap();
        assert_eq!(events(&log), vec!["start:a", "save:a", "stop:a", "start:b"]);
        assert_eq!(sessions.active_info().await.unwrap().name, "b");
    }

    #[tokio::test]
    async fn test_open_during_slow_close_waits_for_stop() {
        let (sessions, log) = manager_with_save_delay(false, Duration::from_millis(100));
        let sessions = Arc::new(sessions);
        sessions.open("a").await.unwrap();

        let closing = tokio::spawn({
            let sessions = sessions.clone();
            async move { sessions.close().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        sessions.open("b").await.unwrap();
        closing.await.unwrap();

        assert_eq!(events(&log), vec!["start:a", "save:a", "stop:a", "start:b"]);
        assert_eq!(sessions.active_info().await.unwrap().name, "b");
    }

    #[tokio::test]
    async fn test_close_swallows_save_error() {
        let (sessions, log) = manager(true);
        sessions.open("a").await.unwrap();
        sessions.close().await;
        assert!(sessions.active_info().await.is_none());
        assert_eq!(events(&log), vec!["start:a", "save:a", "stop:a"]);
    }

    #[tokio::test]
    async fn test_explicit_save_surfaces_error() {
        let (sessions, _log) = manager(true);
        sessions.open("a").await.unwrap();
        let err = sessions.save().await.unwrap_err();
        assert!(matches!(err, SessionError::Save { ref name, .. } if name == "a"));
    }

    #[tokio::test]
    async fn test_export_without_peer_is_not_connected() {
        let (sessions, _log) = manager(false);
        sessions.open("a").await.unwrap();
        let err = sessions
            .export_pages(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Broker(crate::BrokerError::NotConnected)));
    }

    #[tokio::test]
    async fn test_invalid_name_rejected_without_teardown() {
        let (sessions, log) = manager(false);
        sessions.open("a").await.unwrap();
        assert!(matches!(
            sessions.open("../b").await,
            Err(SessionError::InvalidName(_))
        ));
        assert_eq!(sessions.active_info().await.unwrap().name, "a");
        assert_eq!(events(&log), vec!["start:a"]);
    }

    #[tokio::test]
    async fn test_list_delegates_to_store() {
        let (sessions, _log) = manager(false);
        assert_eq!(sessions.list().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_relay_save_writes_frames() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn WorkspaceStore> = Arc::new(FileWorkspaceStore::new(dir.path()));
        let relay = Arc::new(SyncRelay::new(vec!["one".into()]));
        relay.record("two").await;

        let save = RelaySave {
            name: "plan".into(),
            relay,
            store: store.clone(),
        };
        save.save().await.unwrap();
        assert_eq!(store.load("plan").await.unwrap(), vec!["one", "two"]);
    }
}
