//! Database Controller
//!
//! This module wires the cache, the work queue and the reconciler together.
//! Change notifications are turned into queue keys; a fixed pool of workers
//! pulls keys and reconciles them. Deletions bypass the queue and are
//! handled as soon as the notification arrives.

use crate::cache::{Notification, ResourceCache};
use crate::crd::Database;
use crate::deletion::DeletionHandler;
use crate::error::{OperatorError, Result};
use crate::events::EventSink;
use crate::key::ObjectKey;
use crate::postgres::SqlExecutor;
use crate::rate_limiter::RateLimitConfig;
use crate::reconciler::{ErrorStatePolicy, Reconciler};
use crate::status::StatusWriter;
use crate::workqueue::WorkQueue;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Default number of concurrent workers
pub const DEFAULT_THREADINESS: usize = 2;

/// Name of the controller's work queue
pub const QUEUE_NAME: &str = "Databases";

/// Controller settings
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent workers
    pub threadiness: usize,
    /// Handling of resources whose last attempt failed
    pub error_policy: ErrorStatePolicy,
    /// Requeue backoff for failed reconciliations
    pub rate_limit: RateLimitConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            threadiness: DEFAULT_THREADINESS,
            error_policy: ErrorStatePolicy::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
    /// Counter for handled deletions
    pub deletions: metrics::Counter,
    /// Counter for deletions that left something behind
    pub deletion_errors: metrics::Counter,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("pgdb_operator_reconciliations_total"),
            errors: metrics::counter!("pgdb_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("pgdb_operator_reconciliation_duration_seconds"),
            deletions: metrics::counter!("pgdb_operator_deletions_total"),
            deletion_errors: metrics::counter!("pgdb_operator_deletion_errors_total"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the target PostgreSQL server in line with the Database resources
pub struct Controller {
    cache: Arc<dyn ResourceCache>,
    queue: Arc<WorkQueue<String>>,
    reconciler: Reconciler,
    deletion: DeletionHandler,
    metrics: ControllerMetrics,
    ready: Arc<AtomicBool>,
}

impl Controller {
    pub fn new(
        cache: Arc<dyn ResourceCache>,
        executor: Arc<dyn SqlExecutor>,
        status: Arc<dyn StatusWriter>,
        events: Arc<dyn EventSink>,
        config: &ControllerConfig,
    ) -> Arc<Self> {
        let queue = WorkQueue::new(QUEUE_NAME, config.rate_limit.build());
        let reconciler = Reconciler::new(cache.clone(), executor.clone(), status, events)
            .with_error_policy(config.error_policy);

        Arc::new(Self {
            cache,
            queue,
            reconciler,
            deletion: DeletionHandler::new(executor),
            metrics: ControllerMetrics::new(),
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn queue(&self) -> &Arc<WorkQueue<String>> {
        &self.queue
    }

    /// Flag that turns true once the cache has synced and workers are running
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// Queue the identity of `db` for reconciliation
    pub fn enqueue(&self, db: &Database) {
        match ObjectKey::for_object(db) {
            Ok(key) => self.queue.add(key.to_string()),
            Err(e) => error!(error = %e, "Cannot enqueue Database"),
        }
    }

    /// React to one change notification from the cache
    pub async fn handle_notification(&self, notification: Notification) {
        match notification {
            Notification::Added(db) => self.enqueue(&db),
            Notification::Updated { new, .. } => self.enqueue(&new),
            Notification::Deleted(db) => {
                self.metrics.deletions.increment(1);
                let report = self.deletion.handle(&db).await;
                if !report.is_success() {
                    self.metrics.deletion_errors.increment(1);
                }
            }
        }
    }

    /// Run until `stop` resolves
    ///
    /// Notifications are consumed from the start so that everything seen
    /// during the initial list is queued before the workers begin. Returns
    /// [`OperatorError::CacheSync`] if the cache does not sync before `stop`.
    pub async fn run(
        self: Arc<Self>,
        threadiness: usize,
        notifications: mpsc::UnboundedReceiver<Notification>,
        stop: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        tokio::pin!(stop);

        info!(queue = QUEUE_NAME, "Starting Database controller");

        let (pump_stop, pump_stopped) = oneshot::channel();
        let pump = tokio::spawn(self.clone().pump_notifications(notifications, pump_stopped));

        info!("Waiting for informer caches to sync");
        let synced = tokio::select! {
            synced = self.cache.wait_for_initial_sync() => synced,
            _ = &mut stop => false,
        };
        if !synced {
            self.queue.shutdown();
            let _ = pump_stop.send(());
            if let Err(e) = pump.await {
                warn!(error = %e, "Notification pump failed");
            }
            return Err(OperatorError::CacheSync);
        }

        let threadiness = threadiness.max(1);
        info!(threadiness, "Starting workers");
        let mut workers = JoinSet::new();
        for _ in 0..threadiness {
            workers.spawn(self.clone().run_worker());
        }
        self.ready.store(true, Ordering::SeqCst);
        info!("Started workers");

        stop.await;

        info!("Shutting down workers");
        self.ready.store(false, Ordering::SeqCst);
        self.queue.shutdown();
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Worker task failed");
            }
        }
        // A deletion in progress runs to completion; nothing after it is taken.
        let _ = pump_stop.send(());
        if let Err(e) = pump.await {
            warn!(error = %e, "Notification pump failed");
        }

        Ok(())
    }

    /// Feed notifications to [`Controller::handle_notification`] until told to stop
    ///
    /// The stop signal is only observed between notifications.
    async fn pump_notifications(
        self: Arc<Self>,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
        mut stopped: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = &mut stopped => break,
                notification = notifications.recv() => match notification {
                    Some(notification) => self.handle_notification(notification).await,
                    None => {
                        debug!("Notification stream closed");
                        break;
                    }
                },
            }
        }
    }

    async fn run_worker(self: Arc<Self>) {
        while self.process_next_work_item().await {}
    }

    /// Handle one key; `false` once the queue is shut down
    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match ObjectKey::parse(&key) {
            Err(e) => {
                // A malformed key will never parse; retrying cannot help.
                self.queue.forget(&key);
                error!(key = %key, error = %e, "Dropping invalid key");
            }
            Ok(obj_key) => {
                let start = Instant::now();
                self.metrics.reconciliations.increment(1);

                match self.reconciler.reconcile(&obj_key).await {
                    Ok(outcome) => {
                        self.queue.forget(&key);
                        info!(key = %key, ?outcome, "Successfully synced");
                    }
                    Err(e) => {
                        self.metrics.errors.increment(1);
                        self.queue.add_rate_limited(key.clone());
                        error!(
                            key = %key,
                            error = %e,
                            requeues = self.queue.num_requeues(&key),
                            "Error syncing; requeuing"
                        );
                    }
                }

                self.metrics.duration.record(start.elapsed().as_secs_f64());
            }
        }

        self.queue.done(&key);
        true
    }
}
