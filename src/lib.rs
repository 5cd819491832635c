//! The Small POS - offline-first order sync engine.
//!
//! Orders taken at the till are written to a durable local queue whenever the
//! admin dashboard cannot be reached, then pushed in one batch when
//! connectivity returns. The dashboard's reference data (menu, tables,
//! settings) is pulled into a local snapshot so the till keeps working
//! offline.
//!
//! [`SyncEngine`] wires the pieces together for a terminal process; the
//! individual modules can also be assembled by hand (tests do this with an
//! in-process backend).

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod models;
pub mod orders;
pub mod queue;
pub mod storage;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{HttpBackend, PosBackend};
pub use config::SyncConfig;
pub use connectivity::ConnectivityMonitor;
pub use error::SyncError;
pub use orders::{CreatedOrder, OrderIntake};
pub use queue::LocalQueue;
pub use sync::{
    SyncIndicator, SyncOrchestrator, SyncReport, SyncStateContext, SyncStatus, SyncStatusEvent,
};

// ============================================================================
// Logging
// ============================================================================

/// Install console + daily rolling file logging under `log_dir`.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init_logging(log_dir: &Path) -> Result<WorkerGuard, SyncError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,the_small_pos_sync=debug"));

    std::fs::create_dir_all(log_dir)
        .map_err(|e| SyncError::storage(format!("log dir {}: {e}", log_dir.display())))?;

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| SyncError::storage(format!("logging already initialised: {e}")))?;

    info!("Starting The Small POS sync v{}", env!("CARGO_PKG_VERSION"));
    Ok(guard)
}

// ============================================================================
// Engine
// ============================================================================

/// Everything one terminal needs: queue, backend, connectivity, orchestrator
/// and order intake, sharing one database.
pub struct SyncEngine {
    config: SyncConfig,
    backend: Arc<dyn PosBackend>,
    connectivity: ConnectivityMonitor,
    orchestrator: Arc<SyncOrchestrator>,
    intake: OrderIntake,
}

impl SyncEngine {
    /// Open the queue database under `config.data_dir` and talk to the
    /// dashboard over HTTP.
    pub fn open(config: SyncConfig) -> Result<Self, SyncError> {
        let backend: Arc<dyn PosBackend> = Arc::new(HttpBackend::from_config(&config)?);
        Self::with_backend(config, backend)
    }

    pub fn with_backend(
        config: SyncConfig,
        backend: Arc<dyn PosBackend>,
    ) -> Result<Self, SyncError> {
        let db_state = Arc::new(db::init(&config.data_dir)?);
        let queue = LocalQueue::new(db_state);
        // Offline until a probe or the embedder reports otherwise.
        let connectivity = ConnectivityMonitor::new(false);
        let orchestrator = Arc::new(
            SyncOrchestrator::new(
                queue.clone(),
                backend.clone(),
                connectivity.clone(),
                SyncStateContext::new(),
            )
            .with_synced_retention(config.synced_retention),
        );
        let intake = OrderIntake::new(queue, backend.clone(), connectivity.clone());

        info!(
            terminal_id = %config.terminal_id,
            data_dir = %config.data_dir.display(),
            "Sync engine opened"
        );
        Ok(Self {
            config,
            backend,
            connectivity,
            orchestrator,
            intake,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &LocalQueue {
        self.orchestrator.queue()
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn intake(&self) -> &OrderIntake {
        &self.intake
    }

    /// One health check, fed into the connectivity monitor. Returns the new
    /// reachability.
    pub async fn probe_once(&self) -> bool {
        let online = self.backend.health().await;
        self.connectivity.set_online(online);
        online
    }

    /// Spawn the background sync loop and, when configured, the reachability
    /// probe. Must be called inside a tokio runtime.
    pub fn start(&self) -> SyncLoopHandle {
        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(2);

        if let Some(interval) = self.config.probe_interval {
            handles.push(connectivity::spawn_reachability_probe(
                self.connectivity.clone(),
                self.backend.clone(),
                interval,
                cancel.child_token(),
            ));
        }
        handles.push(sync::start_sync_loop(
            self.orchestrator.clone(),
            self.config.sync_interval,
            cancel.child_token(),
        ));

        SyncLoopHandle { cancel, handles }
    }
}

/// Background tasks started by [`SyncEngine::start`].
pub struct SyncLoopHandle {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl SyncLoopHandle {
    /// Cancel the background tasks and wait for them to finish. A sync cycle
    /// already in flight completes first.
    pub async fn stop(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Background sync task ended abnormally: {e}");
            }
        }
        info!("Background sync stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderItem, OrderRequest, QueueStatus, SalesChannel};
    use crate::testing::FakeBackend;
    use std::time::Duration;

    fn config(dir: &Path) -> SyncConfig {
        SyncConfig {
            admin_url: "http://localhost:3001".into(),
            api_key: "k".into(),
            terminal_id: "T-1".into(),
            data_dir: dir.to_path_buf(),
            request_timeout: Duration::from_secs(5),
            sync_interval: None,
            probe_interval: None,
            synced_retention: None,
        }
    }

    fn request() -> OrderRequest {
        OrderRequest {
            items: vec![OrderItem {
                product_id: 3,
                quantity: 1,
                notes: None,
                modifiers: vec![],
                removed_ingredients: vec![],
            }],
            channel: SalesChannel::Takeout,
            table_id: None,
            customer_id: None,
            shift_id: 1,
            payments: vec![],
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_engine_starts_offline_and_queues() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new());
        let engine = SyncEngine::with_backend(config(dir.path()), backend.clone()).unwrap();

        assert!(!engine.connectivity().is_online());
        let created = engine.intake().create(request()).await.unwrap();
        assert!(created.is_offline);
        assert_eq!(backend.create_calls(), 0);
        assert_eq!(engine.queue().count_pending().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_drains_queue_through_background_loop() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new());
        let engine = SyncEngine::with_backend(config(dir.path()), backend.clone()).unwrap();
        let created = engine.intake().create(request()).await.unwrap();

        let handle = engine.start();
        engine.connectivity().set_online(true);

        let queue = engine.queue().clone();
        wait_until(|| queue.count_pending().map(|n| n == 0).unwrap_or(false)).await;

        let stored = queue.find_order(&created.temp_id).unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Synced);
        assert_eq!(backend.push_calls(), 1);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_probe_once_updates_connectivity() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new());
        let engine = SyncEngine::with_backend(config(dir.path()), backend.clone()).unwrap();

        assert!(engine.probe_once().await);
        assert!(engine.connectivity().is_online());

        backend.set_healthy(false);
        assert!(!engine.probe_once().await);
        assert!(!engine.connectivity().is_online());
    }

    #[tokio::test]
    async fn test_stop_cancels_probe_and_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.probe_interval = Some(Duration::from_millis(20));
        cfg.sync_interval = Some(Duration::from_millis(20));
        let engine = SyncEngine::with_backend(cfg, Arc::new(FakeBackend::new())).unwrap();

        let handle = engine.start();
        let connectivity = engine.connectivity().clone();
        wait_until(|| connectivity.is_online()).await;

        assert!(!handle.is_stopped());
        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("tasks stop promptly");
    }

    #[test]
    fn test_reopening_keeps_queued_orders() {
        let dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let temp_id = {
            let engine =
                SyncEngine::with_backend(config(dir.path()), Arc::new(FakeBackend::new())).unwrap();
            rt.block_on(engine.intake().create(request())).unwrap().temp_id
        };

        let engine =
            SyncEngine::with_backend(config(dir.path()), Arc::new(FakeBackend::new())).unwrap();
        let order = engine.queue().find_order(&temp_id).unwrap().unwrap();
        assert_eq!(order.status, QueueStatus::Pending);
    }
}
