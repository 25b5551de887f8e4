use crate::error::EngineError;
use crate::initial::InitialSync;
use crate::reader::AuditReader;
use crate::transform::Transformer;
use checkpoint::CheckpointStore;
use engine_config::{NotifierRegistry, SyncConfig};
use futures::future::join_all;
use model::{ChangeEvent, Row, RowKey, SyncPosition, SyncState, SyncStatus};
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use targets::{create_writer, TargetWriter, WriteError};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pause after a failed audit read before polling again.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Rough lag estimate: each pending audit row counts as 0.1 s.
const LAG_PER_PENDING_ROW: f64 = 0.1;

/// Orchestrates the initial bulk copy and the streaming consume loop across
/// all configured targets.
///
/// States: idle -> running -> (paused | error); a paused or errored engine is
/// restarted by constructing a fresh one.
pub struct SyncEngine {
    config: SyncConfig,
    store: CheckpointStore,
    status: Arc<Mutex<SyncStatus>>,
    cancel: CancellationToken,
    writers: Vec<Arc<dyn TargetWriter>>,
    notifiers: NotifierRegistry,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        checkpoint_path: impl AsRef<Path>,
    ) -> Result<Self, EngineError> {
        let store = CheckpointStore::open(checkpoint_path)?;
        let targets = config.targets.iter().map(|t| t.name.clone()).collect();
        let status = SyncStatus::new(&config.source.db_path, targets);

        Ok(SyncEngine {
            config,
            store,
            status: Arc::new(Mutex::new(status)),
            cancel: CancellationToken::new(),
            writers: Vec::new(),
            notifiers: NotifierRegistry::new(),
        })
    }

    /// Inject pre-built writers instead of constructing them from the target
    /// configs. Used by tests and embedding callers.
    pub fn with_writers(mut self, writers: Vec<Arc<dyn TargetWriter>>) -> Self {
        self.writers = writers;
        self
    }

    pub fn with_notifiers(mut self, notifiers: NotifierRegistry) -> Self {
        self.notifiers = notifiers;
        self
    }

    /// Token that stops the engine: the consume loop exits at the next batch
    /// boundary after cancellation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn get_status(&self) -> SyncStatus {
        self.lock_status().clone()
    }

    /// Run the engine until cancelled. `tables` restricts the run to a subset
    /// of the mapped tables; `run_initial` bulk-copies them before streaming.
    pub async fn start(
        &mut self,
        tables: Option<Vec<String>>,
        run_initial: bool,
    ) -> Result<(), EngineError> {
        {
            let mut status = self.lock_status();
            if status.state == SyncState::Running {
                return Err(EngineError::AlreadyRunning);
            }
            status.state = SyncState::Running;
        }

        info!(
            source = %self.config.source.db_path,
            targets = ?self.config.targets.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            run_initial,
            "sync engine starting"
        );

        if self.writers.is_empty() {
            for target in &self.config.targets {
                let writer = create_writer(target, self.config.batch_size, &self.config.mappings)?;
                self.writers.push(writer);
            }
        }

        for writer in &self.writers {
            if let Err(err) = writer.connect().await {
                let message = format!("target {} failed to connect: {err}", writer.name());
                self.fail(&message).await;
                return Err(err.into());
            }
            info!(target = writer.name(), "target connected");
        }

        let started = Instant::now();
        let result = self.run(tables, run_initial, started).await;

        for writer in &self.writers {
            if let Err(err) = writer.disconnect().await {
                warn!(target = writer.name(), error = %err, "target disconnect failed");
            }
        }

        match result {
            Ok(()) => {
                self.lock_status().state = SyncState::Paused;
                info!("sync engine stopped");
                Ok(())
            }
            Err(err) => {
                self.fail(&err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Bulk-copy only: run the initial sync for the mapped tables and return
    /// without entering the streaming loop.
    pub async fn run_initial_only(
        &mut self,
        tables: Option<Vec<String>>,
    ) -> Result<(), EngineError> {
        {
            let mut status = self.lock_status();
            if status.state == SyncState::Running {
                return Err(EngineError::AlreadyRunning);
            }
            status.state = SyncState::Running;
        }

        if self.writers.is_empty() {
            for target in &self.config.targets {
                let writer = create_writer(target, self.config.batch_size, &self.config.mappings)?;
                self.writers.push(writer);
            }
        }
        for writer in &self.writers {
            if let Err(err) = writer.connect().await {
                let message = format!("target {} failed to connect: {err}", writer.name());
                self.fail(&message).await;
                return Err(err.into());
            }
        }

        let source_path = self.config.source.db_path.clone();
        let tables = tables.unwrap_or_else(|| self.config.mapped_tables());

        let result = async {
            let source = Connection::open(&source_path)?;
            source.busy_timeout(Duration::from_secs(5))?;
            let mut initial = InitialSync::new(
                source,
                &source_path,
                &self.writers,
                &self.config,
                &self.store,
            );
            initial.run_with_handover(&tables).await?;
            Ok::<(), EngineError>(())
        }
        .await;

        for writer in &self.writers {
            if let Err(err) = writer.disconnect().await {
                warn!(target = writer.name(), error = %err, "target disconnect failed");
            }
        }

        match result {
            Ok(()) => {
                self.lock_status().state = SyncState::Paused;
                Ok(())
            }
            Err(err) => {
                self.fail(&err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        tables: Option<Vec<String>>,
        run_initial: bool,
        started: Instant,
    ) -> Result<(), EngineError> {
        let source_path = self.config.source.db_path.clone();
        let tables = tables.unwrap_or_else(|| self.config.mapped_tables());

        let handover_id = if run_initial {
            let source = Connection::open(&source_path)?;
            source.busy_timeout(Duration::from_secs(5))?;
            let mut initial = InitialSync::new(
                source,
                &source_path,
                &self.writers,
                &self.config,
                &self.store,
            );
            Some(initial.run_with_handover(&tables).await?)
        } else {
            None
        };

        // Per-target cursors. A target with no saved progress starts at the
        // hand-over id when the snapshot just ran, otherwise at zero. The
        // reader starts at the minimum so no target is skipped.
        let mut positions: HashMap<String, SyncPosition> = HashMap::new();
        for writer in &self.writers {
            let mut position = self.store.load_position(&source_path, writer.name())?;
            if position.last_audit_id == 0 {
                if let Some(handover) = handover_id {
                    position.last_audit_id = handover;
                }
            }
            positions.insert(writer.name().to_string(), position);
        }
        let start_id = positions
            .values()
            .map(|p| p.last_audit_id)
            .min()
            .unwrap_or(0);

        let mut reader = AuditReader::open(
            &source_path,
            self.config.batch_size,
            AuditReader::DEFAULT_POLL_INTERVAL,
            start_id,
        )?;

        info!(start_id, "incremental sync starting");

        // Targets that failed a batch stay quarantined for the rest of the
        // run: advancing their cursor past unapplied ids would break the
        // at-least-once guarantee. A restart replays from their saved cursor.
        let mut failed_targets: HashSet<String> = HashSet::new();

        while !self.cancel.is_cancelled() {
            let events = match reader.fetch_batch() {
                Ok(events) => events,
                Err(err) => {
                    warn!(error = %err, "audit read failed, retrying");
                    self.lock_status().record_error(err.to_string());
                    if self.cancellable_sleep(READ_ERROR_BACKOFF).await {
                        break;
                    }
                    continue;
                }
            };

            if events.is_empty() {
                self.refresh_rates(&reader, started);
                if self.cancellable_sleep(reader.poll_interval()).await {
                    break;
                }
                continue;
            }

            self.process_batch(&events, &mut positions, &mut reader, &mut failed_targets)
                .await?;
            self.refresh_rates(&reader, started);
        }

        Ok(())
    }

    /// Apply one batch: group by table, transform, fan out to the healthy
    /// targets in parallel, then persist cursors and consume marks.
    async fn process_batch(
        &self,
        events: &[ChangeEvent],
        positions: &mut HashMap<String, SyncPosition>,
        reader: &mut AuditReader,
        failed_targets: &mut HashSet<String>,
    ) -> Result<(), EngineError> {
        let source_path = &self.config.source.db_path;
        let max_id = events.iter().map(|e| e.audit_id).max().unwrap_or(0);

        let mut by_table: BTreeMap<&str, Vec<&ChangeEvent>> = BTreeMap::new();
        for event in events {
            by_table
                .entry(event.table_name.as_str())
                .or_default()
                .push(event);
        }

        for (table, table_events) in &by_table {
            let Some(mapping) = self.config.table_mapping(table) else {
                warn!(table = %table, "no mapping configured, skipping events");
                continue;
            };

            let transformer = Transformer::new(mapping);
            let plan = build_apply_plan(&transformer, table_events);
            let target_table = transformer.target_table();

            let applies = self
                .writers
                .iter()
                .filter(|w| !failed_targets.contains(w.name()))
                .map(|writer| {
                    let plan = &plan;
                    async move {
                        (
                            writer.name().to_string(),
                            apply_plan(writer.as_ref(), target_table, plan).await,
                        )
                    }
                });

            for (name, result) in join_all(applies).await {
                if let Err(err) = result {
                    error!(target = %name, table = %table, error = %err, "target failed to apply batch");
                    if let Err(log_err) = self.store.log_error(
                        source_path,
                        &name,
                        None,
                        "WriteError",
                        &err.to_string(),
                    ) {
                        warn!(error = %log_err, "failed to record sync error");
                    }
                    self.lock_status()
                        .record_error(format!("target {name}: {err}"));
                    self.notifiers
                        .error(
                            "target_write_failed",
                            &format!("target {name} failed on table {table}: {err}"),
                        )
                        .await;
                    failed_targets.insert(name);
                }
            }
        }

        {
            let mut status = self.lock_status();
            for event in events {
                status.record_event(&event.table_name, event.operation);
            }
        }

        let mut op_counts: HashMap<(&str, &str), u64> = HashMap::new();
        for event in events {
            *op_counts
                .entry((event.table_name.as_str(), event.operation.as_str()))
                .or_default() += 1;
        }

        for writer in &self.writers {
            let name = writer.name();
            if failed_targets.contains(name) {
                continue;
            }
            if let Some(position) = positions.get_mut(name) {
                position.advance(max_id, events.len() as u64);
                self.store.save_position(position)?;
            }
            for ((table, operation), count) in &op_counts {
                if let Err(err) =
                    self.store
                        .update_stats(source_path, name, table, operation, *count)
                {
                    warn!(error = %err, "failed to update sync stats");
                }
            }
        }

        // Consumed marks are cleanup, not correctness: only issued once every
        // target's checkpoint covers these ids.
        if failed_targets.is_empty() {
            let ids: Vec<i64> = events.iter().map(|e| e.audit_id).collect();
            if let Err(err) = reader.mark_consumed(&ids) {
                warn!(error = %err, "failed to mark audit rows consumed");
            }
        }

        Ok(())
    }

    fn refresh_rates(&self, reader: &AuditReader, started: Instant) {
        let stats = reader.stats();
        let mut status = self.lock_status();
        status.lag_seconds = stats.pending as f64 * LAG_PER_PENDING_ROW;
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            status.events_per_second = status.total_events as f64 / elapsed;
        }
    }

    async fn fail(&self, message: &str) {
        {
            let mut status = self.lock_status();
            status.record_error(message);
            status.state = SyncState::Error;
        }
        error!("{message}");
        self.notifiers.error("sync_engine_error", message).await;
    }

    /// Sleep that wakes early on cancellation; true when cancelled.
    async fn cancellable_sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = sleep(duration) => false,
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, SyncStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Ordered application plan for one table's slice of a batch: consecutive
/// upserts coalesce into one batched write, deletes stay in place so the
/// per-table audit order is preserved.
enum ApplyStep {
    Upsert(Vec<Row>),
    Delete(RowKey),
}

fn build_apply_plan(transformer: &Transformer, events: &[&ChangeEvent]) -> Vec<ApplyStep> {
    let mut plan = Vec::new();
    let mut run: Vec<Row> = Vec::new();

    for event in events {
        if event.is_delete() {
            if !run.is_empty() {
                plan.push(ApplyStep::Upsert(std::mem::take(&mut run)));
            }
            plan.push(ApplyStep::Delete(event.row_id.clone()));
        } else {
            match &event.after {
                Some(after) if !after.is_empty() => run.push(transformer.transform(after)),
                _ => {
                    // NULL-image warning path from capture; nothing to apply.
                    warn!(event_id = %event.event_id(), "event has no after image, skipping");
                }
            }
        }
    }

    if !run.is_empty() {
        plan.push(ApplyStep::Upsert(run));
    }
    plan
}

async fn apply_plan(
    writer: &dyn TargetWriter,
    table: &str,
    plan: &[ApplyStep],
) -> Result<(), WriteError> {
    for step in plan {
        match step {
            ApplyStep::Upsert(rows) => writer.batch_upsert(table, rows).await?,
            ApplyStep::Delete(key) => writer.delete(table, key).await?,
        }
    }
    Ok(())
}
