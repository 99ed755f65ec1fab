//! Migration pipeline: moves and transforms data for the rules of a mapping.
//!
//! Rules are grouped into table pairs ([`TablePairJob`]); pairs always run one
//! after the other and a failing pair never stops the ones after it. Within a
//! pair the source is streamed in batches of `batch_size` rows:
//!
//! - with one worker, batch N+1 is not requested before batch N is inserted;
//! - with `N > 1` workers, batches are still pulled in order but up to `N`
//!   transform+insert steps run at once and complete in any order.
//!
//! Three entry points share this machinery:
//!
//! - [`MigrationPipeline::transform_data`]: unary fetch, transform, insert
//! - [`MigrationPipeline::transform_data_stream`]: per-batch totals per pair
//! - [`MigrationPipeline::copy_mapping_data`]: job-level progress with an
//!   operation id, dry runs and `completed_with_errors`

mod job;
mod progress;
mod transform;

pub use job::{group_table_pairs, TablePairJob, TableRef};
pub use progress::{
    CopyProgress, CopyStatus, PairSummary, PairTotals, StreamProgress, TransformSummary,
};
pub use transform::RowTransformer;

use std::collections::HashSet;
use std::fmt;
use std::pin::pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{future, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::CopyConfig;
use crate::core::{
    ExecutionEngine, FetchOptions, Mapping, MappingFilter, Rule, Scope, TransformationRegistry,
};
use crate::error::{MappingError, Result};
use crate::store::{self, MappingStore};

/// Buffered progress messages per stream.
const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// How rows land in the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformMode {
    /// Insert rows as-is.
    #[default]
    Append,
    /// Wipe the target table, then insert.
    Replace,
    /// Upsert. Rejected as unimplemented: no target unique-key contract exists.
    Update,
}

impl TransformMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformMode::Append => "append",
            TransformMode::Replace => "replace",
            TransformMode::Update => "update",
        }
    }

    fn ensure_supported(&self) -> Result<()> {
        if *self == TransformMode::Update {
            return Err(MappingError::Unimplemented(
                "update mode requires a target unique key; use append or replace".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for TransformMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransformMode {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "append" => Ok(TransformMode::Append),
            "replace" => Ok(TransformMode::Replace),
            "update" => Ok(TransformMode::Update),
            other => Err(MappingError::invalid(format!(
                "unknown transform mode '{}': expected append, replace or update",
                other
            ))),
        }
    }
}

/// Per-call overrides for `CopyMappingData`.
#[derive(Debug, Clone, Default)]
pub struct CopyRequest {
    pub batch_size: Option<usize>,
    pub parallel_workers: Option<usize>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy)]
struct RunOptions {
    batch_size: usize,
    workers: usize,
}

/// Receives running totals after every batch.
#[async_trait]
trait ProgressSink: Send + Sync {
    /// Returns `false` once nobody is listening any more.
    async fn batch_done(&self, totals: &PairTotals) -> bool;
}

struct StreamSink<'a> {
    tx: &'a mpsc::Sender<StreamProgress>,
    job: &'a TablePairJob,
}

#[async_trait]
impl ProgressSink for StreamSink<'_> {
    async fn batch_done(&self, totals: &PairTotals) -> bool {
        let message = StreamProgress {
            source_table: self.job.source.to_string(),
            target_table: self.job.target.to_string(),
            totals: *totals,
            is_complete: false,
            error: None,
        };
        self.tx.send(message).await.is_ok()
    }
}

struct CopySink<'a> {
    tx: &'a mpsc::Sender<CopyProgress>,
    operation_id: &'a str,
    current_table: &'a str,
    base_rows: u64,
    total_rows: u64,
}

#[async_trait]
impl ProgressSink for CopySink<'_> {
    async fn batch_done(&self, totals: &PairTotals) -> bool {
        let message = CopyProgress {
            status: CopyStatus::InProgress,
            message: format!(
                "{}: {} rows inserted",
                self.current_table, totals.rows_inserted
            ),
            rows_processed: self.base_rows + totals.rows_processed,
            total_rows: self.total_rows,
            current_table: self.current_table.to_string(),
            errors: Vec::new(),
            operation_id: self.operation_id.to_string(),
        };
        self.tx.send(message).await.is_ok()
    }
}

/// A mapping with everything needed to move its data.
struct PreparedMapping {
    mapping: Mapping,
    rules: Vec<Rule>,
    filters: Vec<MappingFilter>,
}

/// Executes data movement for mappings.
#[derive(Clone)]
pub struct MigrationPipeline {
    store: Arc<dyn MappingStore>,
    engine: Arc<dyn ExecutionEngine>,
    registry: Arc<dyn TransformationRegistry>,
    config: CopyConfig,
    shutdown: CancellationToken,
}

impl MigrationPipeline {
    pub fn new(
        store: Arc<dyn MappingStore>,
        engine: Arc<dyn ExecutionEngine>,
        registry: Arc<dyn TransformationRegistry>,
        config: CopyConfig,
    ) -> Self {
        Self {
            store,
            engine,
            registry,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Use an externally owned shutdown token. Cancelling it stops running
    /// pairs between batches.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// `TransformData`: fetch, transform and insert once per table pair.
    ///
    /// Each pair's insert is a single transaction. A failing pair is recorded
    /// in its [`PairSummary`] and the remaining pairs still run.
    pub async fn transform_data(
        &self,
        scope: &Scope,
        mapping_id: &str,
        mode: TransformMode,
    ) -> Result<TransformSummary> {
        mode.ensure_supported()?;
        let prepared = self.prepare(scope, mapping_id).await?;
        let pairs = group_table_pairs(&prepared.rules)?;
        self.check_connected(scope, &pairs).await?;

        info!(
            "Transforming mapping '{}': {} table pairs, mode {}",
            prepared.mapping.name,
            pairs.len(),
            mode
        );

        let mut summary = TransformSummary::default();
        let mut wiped = HashSet::new();
        for pair in &pairs {
            let name = pair.name();
            let wipe = mode == TransformMode::Replace && wiped.insert(pair.target.clone());
            let mut totals = PairTotals::default();

            match self
                .transform_pair_once(pair, &prepared.filters, wipe, &mut totals)
                .await
            {
                Ok(()) => {
                    info!("{}: completed ({} rows)", name, totals.rows_inserted);
                    summary.pairs.push(PairSummary::new(pair, totals, None));
                }
                Err(e) => {
                    error!("{}: failed - {}", name, e);
                    summary
                        .pairs
                        .push(PairSummary::new(pair, totals, Some(e.to_string())));
                }
            }
        }

        Ok(summary)
    }

    /// `TransformDataStream`: totals after every batch of every pair, then one
    /// message with `is_complete` set and the totals of all pairs.
    ///
    /// A pair failure is reported in-band through `error`; the stream goes on.
    pub async fn transform_data_stream(
        &self,
        scope: &Scope,
        mapping_id: &str,
        mode: TransformMode,
    ) -> Result<mpsc::Receiver<StreamProgress>> {
        mode.ensure_supported()?;
        let prepared = self.prepare(scope, mapping_id).await?;
        let pairs = group_table_pairs(&prepared.rules)?;
        self.check_connected(scope, &pairs).await?;

        let opts = RunOptions {
            batch_size: self.config.batch_size.max(1),
            workers: self.config.get_parallel_workers().max(1),
        };
        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.stream_pairs(prepared, pairs, mode, opts, tx).await;
        });
        Ok(rx)
    }

    /// `CopyMappingData`: stream every pair of a mapping into its target.
    ///
    /// Errors returned here happen before any data moves (unknown mapping, no
    /// rules, disconnected database). Everything after is reported through the
    /// returned channel, ending with `completed`, `completed_with_errors` or
    /// `cancelled`.
    pub async fn copy_mapping_data(
        &self,
        scope: &Scope,
        mapping_id: &str,
        request: CopyRequest,
    ) -> Result<mpsc::Receiver<CopyProgress>> {
        let operation_id = Uuid::new_v4().to_string();
        let prepared = self.prepare(scope, mapping_id).await?;
        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);

        if request.dry_run {
            info!(
                "Dry run of mapping '{}': {} rules",
                prepared.mapping.name,
                prepared.rules.len()
            );
            let message = CopyProgress {
                status: CopyStatus::DryRun,
                message: format!("Dry run: {} rules ready for copy", prepared.rules.len()),
                rows_processed: 0,
                total_rows: 0,
                current_table: String::new(),
                errors: Vec::new(),
                operation_id,
            };
            tx.send(message)
                .await
                .map_err(|_| MappingError::internal("progress receiver closed"))?;
            return Ok(rx);
        }

        let pairs = group_table_pairs(&prepared.rules)?;
        self.check_connected(scope, &pairs).await?;

        let opts = RunOptions {
            batch_size: request.batch_size.unwrap_or(self.config.batch_size).max(1),
            workers: request
                .parallel_workers
                .unwrap_or_else(|| self.config.get_parallel_workers())
                .max(1),
        };
        if opts.workers > 1 {
            info!(
                "Copy {} uses {} concurrent writers per table pair; batches may land out of order",
                operation_id, opts.workers
            );
        }

        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.copy_pairs(prepared, pairs, opts, operation_id, tx).await;
        });
        Ok(rx)
    }

    async fn prepare(&self, scope: &Scope, mapping_id: &str) -> Result<PreparedMapping> {
        let store = self.store.as_ref();
        let mapping = store::require_mapping(store, scope, mapping_id).await?;
        let rules: Vec<Rule> = store::attached_rules(store, scope, &mapping.id)
            .await?
            .into_iter()
            .map(|attached| attached.rule)
            .collect();
        if rules.is_empty() {
            return Err(MappingError::precondition(format!(
                "mapping '{}' has no rules",
                mapping.name
            )));
        }
        let filters = store.list_filters(&mapping.id).await?;

        Ok(PreparedMapping {
            mapping,
            rules,
            filters,
        })
    }

    /// Every database touched by `pairs` must exist and be connected.
    async fn check_connected(&self, scope: &Scope, pairs: &[TablePairJob]) -> Result<()> {
        let mut checked = HashSet::new();
        for pair in pairs {
            for (role, table) in [("source", &pair.source), ("target", &pair.target)] {
                if !checked.insert(table.database_id.as_str()) {
                    continue;
                }
                let database = self
                    .store
                    .get_database(scope, &table.database_id)
                    .await?
                    .ok_or_else(|| MappingError::not_found("database", &table.database_id))?;
                database.require_connected(role)?;
            }
        }
        Ok(())
    }

    /// Sum of source row counts. Tables whose count fails are left out.
    async fn estimate_rows(&self, pairs: &[TablePairJob]) -> u64 {
        let mut seen = HashSet::new();
        let mut total = 0u64;
        for pair in pairs {
            if !seen.insert(&pair.source) {
                continue;
            }
            match self
                .engine
                .row_count(&pair.source.database_id, &pair.source.table)
                .await
            {
                Ok(count) => total += count.max(0) as u64,
                Err(e) => warn!("{}: row count unavailable - {}", pair.source, e),
            }
        }
        total
    }

    /// Empty a target table, returning how many rows it held.
    async fn wipe_target(&self, target: &TableRef) -> Result<u64> {
        let existing = self
            .engine
            .row_count(&target.database_id, &target.table)
            .await?;
        self.engine
            .wipe_table(&target.database_id, &target.table)
            .await?;
        info!("{}: wiped {} rows before replace", target, existing);
        Ok(existing.max(0) as u64)
    }

    async fn transform_pair_once(
        &self,
        job: &TablePairJob,
        filters: &[MappingFilter],
        wipe: bool,
        totals: &mut PairTotals,
    ) -> Result<()> {
        if wipe {
            totals.rows_deleted = self.wipe_target(&job.target).await?;
        }

        let opts = FetchOptions {
            columns: job.source_columns(),
            batch_size: self.config.batch_size.max(1),
            filters: filters.to_vec(),
        };
        let rows = self
            .engine
            .fetch_rows(&job.source.database_id, &job.source.table, opts)
            .await?;
        totals.rows_processed = rows.len() as u64;

        let rows = RowTransformer::new(self.registry.as_ref(), &job.rules)
            .transform(rows)
            .await?;
        totals.rows_transformed = rows.len() as u64;

        if !rows.is_empty() {
            totals.rows_inserted = self
                .engine
                .insert_rows(&job.target.database_id, &job.target.table, rows, true)
                .await?;
        }
        Ok(())
    }

    /// Stream one pair from source to target, updating `totals` as batches land.
    ///
    /// `totals` keeps whatever was counted when an error ends the pair; batches
    /// already being written when the error surfaced are awaited and counted.
    async fn run_pair(
        &self,
        job: &TablePairJob,
        filters: &[MappingFilter],
        wipe: bool,
        opts: RunOptions,
        sink: &dyn ProgressSink,
        totals: &mut PairTotals,
    ) -> Result<()> {
        if wipe {
            totals.rows_deleted = self.wipe_target(&job.target).await?;
        }

        let fetch = FetchOptions {
            columns: job.source_columns(),
            batch_size: opts.batch_size,
            filters: filters.to_vec(),
        };
        let source = self
            .engine
            .stream_rows(&job.source.database_id, &job.source.table, fetch)
            .await?;

        let transformer = RowTransformer::new(self.registry.as_ref(), &job.rules);
        if transformer.is_passthrough() {
            debug!("{}: every rule copies columns as-is", job.name());
        }
        let transformer = &transformer;
        let engine = self.engine.as_ref();
        let target = &job.target;

        // Set on the first failed batch: no new batches are pulled, but writes
        // already in flight finish and are counted.
        let failed = AtomicBool::new(false);
        let failed = &failed;

        let mut writes = pin!(source
            .take_while(move |_| future::ready(!failed.load(Ordering::Acquire)))
            .map(|batch| async move {
                let batch = batch?;
                let read = batch.len() as u64;
                let rows = transformer.transform(batch.rows).await?;
                let transformed = rows.len() as u64;
                let inserted = if rows.is_empty() {
                    0
                } else {
                    engine
                        .insert_rows(&target.database_id, &target.table, rows, false)
                        .await?
                };
                Ok::<_, MappingError>((read, transformed, inserted))
            })
            .buffer_unordered(opts.workers));

        let mut first_error = None;
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(MappingError::Cancelled),
                next = writes.next() => next,
            };
            let Some(result) = next else {
                break;
            };
            let (read, transformed, inserted) = match result {
                Ok(counts) => counts,
                Err(e) => {
                    if first_error.is_none() {
                        failed.store(true, Ordering::Release);
                        first_error = Some(e);
                    } else {
                        debug!("{}: another in-flight batch failed - {}", job.name(), e);
                    }
                    continue;
                }
            };
            totals.rows_processed += read;
            totals.rows_transformed += transformed;
            totals.rows_inserted += inserted;

            debug!(
                "{}: batch of {} rows written (total {})",
                job.name(),
                inserted,
                totals.rows_inserted
            );

            if first_error.is_none() && !sink.batch_done(totals).await {
                debug!("{}: progress receiver dropped, stopping", job.name());
                return Err(MappingError::Cancelled);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(())
    }

    async fn stream_pairs(
        self,
        prepared: PreparedMapping,
        pairs: Vec<TablePairJob>,
        mode: TransformMode,
        opts: RunOptions,
        tx: mpsc::Sender<StreamProgress>,
    ) {
        let mut overall = PairTotals::default();
        let mut wiped = HashSet::new();

        for pair in &pairs {
            let name = pair.name();
            info!("{}: started", name);
            let wipe = mode == TransformMode::Replace && wiped.insert(pair.target.clone());
            let sink = StreamSink { tx: &tx, job: pair };
            let mut totals = PairTotals::default();

            let result = self
                .run_pair(pair, &prepared.filters, wipe, opts, &sink, &mut totals)
                .await;
            overall.add(&totals);

            match result {
                Ok(()) => info!("{}: completed ({} rows)", name, totals.rows_inserted),
                Err(MappingError::Cancelled) => {
                    warn!("{}: cancelled", name);
                    break;
                }
                Err(e) => {
                    error!("{}: failed - {}", name, e);
                    let message = StreamProgress {
                        source_table: pair.source.to_string(),
                        target_table: pair.target.to_string(),
                        totals,
                        is_complete: false,
                        error: Some(e.to_string()),
                    };
                    if tx.send(message).await.is_err() {
                        return;
                    }
                }
            }
        }

        let last = StreamProgress {
            source_table: prepared.mapping.source.to_string(),
            target_table: prepared.mapping.target.to_string(),
            totals: overall,
            is_complete: true,
            error: None,
        };
        if tx.send(last).await.is_err() {
            debug!("Transform stream receiver dropped before completion");
        }
    }

    async fn copy_pairs(
        self,
        prepared: PreparedMapping,
        pairs: Vec<TablePairJob>,
        opts: RunOptions,
        operation_id: String,
        tx: mpsc::Sender<CopyProgress>,
    ) {
        let total_rows = self.estimate_rows(&pairs).await;
        info!(
            "Copy {} of mapping '{}': {} table pairs, ~{} rows, batch size {}",
            operation_id,
            prepared.mapping.name,
            pairs.len(),
            total_rows,
            opts.batch_size
        );

        let started = CopyProgress {
            status: CopyStatus::Started,
            message: format!("Copying {} table pairs", pairs.len()),
            rows_processed: 0,
            total_rows,
            current_table: String::new(),
            errors: Vec::new(),
            operation_id: operation_id.clone(),
        };
        if tx.send(started).await.is_err() {
            return;
        }

        let mut rows_processed = 0u64;
        let mut errors = Vec::new();
        let mut cancelled = false;

        for pair in &pairs {
            if self.shutdown.is_cancelled() {
                cancelled = true;
                break;
            }

            let name = pair.name();
            info!("{}: started", name);
            let sink = CopySink {
                tx: &tx,
                operation_id: &operation_id,
                current_table: &name,
                base_rows: rows_processed,
                total_rows,
            };
            let mut totals = PairTotals::default();

            let result = self
                .run_pair(pair, &prepared.filters, false, opts, &sink, &mut totals)
                .await;
            rows_processed += totals.rows_processed;

            match result {
                Ok(()) => info!("{}: completed ({} rows)", name, totals.rows_inserted),
                Err(MappingError::Cancelled) => {
                    warn!("{}: cancelled", name);
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    error!("{}: failed - {}", name, e);
                    errors.push(format!("{}: {}", name, e));
                }
            }
        }

        let status = if cancelled {
            CopyStatus::Cancelled
        } else if errors.is_empty() {
            CopyStatus::Completed
        } else {
            CopyStatus::CompletedWithErrors
        };
        let message = match status {
            CopyStatus::Cancelled => format!("Copy cancelled after {} rows", rows_processed),
            CopyStatus::CompletedWithErrors => format!(
                "Copied {} rows; {} of {} table pairs failed",
                rows_processed,
                errors.len(),
                pairs.len()
            ),
            _ => format!(
                "Copied {} rows across {} table pairs",
                rows_processed,
                pairs.len()
            ),
        };
        info!("Copy {} {}: {}", operation_id, status.as_str(), message);

        let last = CopyProgress {
            status,
            message,
            rows_processed,
            total_rows,
            current_table: String::new(),
            errors,
            operation_id,
        };
        if tx.send(last).await.is_err() {
            debug!("Copy progress receiver dropped before completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FilterOperator, FilterType};
    use crate::error::StatusCode;
    use crate::store::MemoryStore;
    use crate::testing::{
        column_rule, database, row, sample_mapping, scope, MockEngine, UppercaseRegistry,
    };
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: Arc<MockEngine>,
        pipeline: MigrationPipeline,
    }

    /// Mapping `m1` with one rule per `(source table, target table)` pair.
    async fn fixture(pairs: &[(&str, &str)], workers: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.put_database(&database("src", true)).await.unwrap();
        store.put_database(&database("dst", true)).await.unwrap();
        store
            .insert_mapping(&sample_mapping("m1", "orders"))
            .await
            .unwrap();
        for (i, (source, target)) in pairs.iter().enumerate() {
            let rule_id = format!("r{}", i);
            let rule = column_rule(&rule_id, ("src", source, "id"), &[("dst", target, "id")]);
            store.insert_rule(&rule).await.unwrap();
            store.attach_rule("m1", &rule_id, None).await.unwrap();
        }

        let engine = Arc::new(MockEngine::default());
        let pipeline = MigrationPipeline::new(
            store.clone(),
            engine.clone(),
            Arc::new(UppercaseRegistry::default()),
            CopyConfig {
                batch_size: 4,
                parallel_workers: Some(workers),
            },
        );
        Fixture {
            store,
            engine,
            pipeline,
        }
    }

    fn rows(n: usize) -> Vec<crate::core::Row> {
        (0..n).map(|i| row(json!({"id": i, "noise": "x"}))).collect()
    }

    async fn drain_copy(mut rx: mpsc::Receiver<CopyProgress>) -> Vec<CopyProgress> {
        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_transform_mode_parse() {
        assert_eq!("".parse::<TransformMode>().unwrap(), TransformMode::Append);
        assert_eq!(
            "REPLACE".parse::<TransformMode>().unwrap(),
            TransformMode::Replace
        );
        assert!("merge".parse::<TransformMode>().is_err());
    }

    #[tokio::test]
    async fn test_dry_run_reports_rule_count_without_moving_data() {
        let fx = fixture(&[("users", "people"), ("orders", "orders")], 1).await;
        fx.engine.seed("src", "users", rows(500));

        let rx = fx
            .pipeline
            .copy_mapping_data(
                &scope(),
                "m1",
                CopyRequest {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let messages = drain_copy(rx).await;

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, CopyStatus::DryRun);
        assert_eq!(messages[0].rows_processed, 0);
        assert_eq!(messages[0].message, "Dry run: 2 rules ready for copy");
        assert!(fx.engine.inserted("dst", "people").is_empty());
    }

    #[tokio::test]
    async fn test_copy_continues_after_pair_failure() {
        let fx = fixture(&[("users", "people"), ("orders", "orders")], 1).await;
        fx.engine.seed("src", "users", rows(10));
        fx.engine.seed("src", "orders", rows(3));
        fx.engine.fail_inserts_into("dst", "orders");

        let rx = fx
            .pipeline
            .copy_mapping_data(&scope(), "m1", CopyRequest::default())
            .await
            .unwrap();
        let messages = drain_copy(rx).await;
        let last = messages.last().unwrap();

        assert_eq!(messages[0].status, CopyStatus::Started);
        assert_eq!(last.status, CopyStatus::CompletedWithErrors);
        assert_eq!(last.rows_processed, 10);
        assert_eq!(last.errors.len(), 1);
        assert!(last.errors[0].starts_with("src.orders -> dst.orders"));
        assert_eq!(fx.engine.inserted("dst", "people").len(), 10);
        assert!(messages
            .iter()
            .all(|m| m.operation_id == messages[0].operation_id));
    }

    #[tokio::test]
    async fn test_copy_failure_at_fetch_counts_only_successful_rows() {
        let fx = fixture(&[("users", "people"), ("orders", "orders")], 1).await;
        fx.engine.seed("src", "users", rows(10));
        // no "orders" source table: the fetch itself fails

        let rx = fx
            .pipeline
            .copy_mapping_data(&scope(), "m1", CopyRequest::default())
            .await
            .unwrap();
        let last = drain_copy(rx).await.pop().unwrap();

        assert_eq!(last.status, CopyStatus::CompletedWithErrors);
        assert_eq!(last.rows_processed, 10);
        assert_eq!(last.errors.len(), 1);
        assert!(last.errors[0].contains("src.orders -> dst.orders"));
    }

    #[tokio::test]
    async fn test_copy_reports_progress_per_batch() {
        let fx = fixture(&[("users", "people")], 1).await;
        fx.engine.seed("src", "users", rows(10));

        let rx = fx
            .pipeline
            .copy_mapping_data(&scope(), "m1", CopyRequest::default())
            .await
            .unwrap();
        let messages = drain_copy(rx).await;

        let progress: Vec<u64> = messages
            .iter()
            .filter(|m| m.status == CopyStatus::InProgress)
            .map(|m| m.rows_processed)
            .collect();
        assert_eq!(progress, vec![4, 8, 10]);
        let last = messages.last().unwrap();
        assert_eq!(last.status, CopyStatus::Completed);
        assert_eq!(last.total_rows, 10);
        assert!(last.errors.is_empty());

        let written = fx.engine.inserted("dst", "people");
        assert_eq!(written[0], row(json!({"id": 0})));
    }

    #[tokio::test]
    async fn test_parallel_workers_copy_every_row() {
        let fx = fixture(&[("users", "people")], 4).await;
        fx.engine.seed("src", "users", rows(37));

        let rx = fx
            .pipeline
            .copy_mapping_data(&scope(), "m1", CopyRequest::default())
            .await
            .unwrap();
        let last = drain_copy(rx).await.pop().unwrap();

        assert_eq!(last.status, CopyStatus::Completed);
        assert_eq!(last.rows_processed, 37);
        let mut ids: Vec<i64> = fx
            .engine
            .inserted("dst", "people")
            .iter()
            .map(|r| r["id"].as_i64().unwrap())
            .collect();
        ids.sort();
        assert_eq!(ids, (0..37).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_parallel_failure_counts_in_flight_writes() {
        let fx = fixture(&[("users", "people")], 4).await;
        fx.engine.seed("src", "users", rows(12));
        fx.engine.fail_insert_call("dst", "people", 2);

        let rx = fx
            .pipeline
            .copy_mapping_data(
                &scope(),
                "m1",
                CopyRequest {
                    batch_size: Some(1),
                    parallel_workers: Some(4),
                    dry_run: false,
                },
            )
            .await
            .unwrap();
        let last = drain_copy(rx).await.pop().unwrap();

        assert_eq!(last.status, CopyStatus::CompletedWithErrors);
        assert_eq!(last.errors.len(), 1);
        let written = fx.engine.inserted("dst", "people").len() as u64;
        assert_eq!(last.rows_processed, written);
        // Batches after the failure are not pulled from the source
        assert!(written < 11, "{} rows written", written);
    }

    #[tokio::test]
    async fn test_copy_without_rules_is_precondition() {
        let fx = fixture(&[], 1).await;
        let err = fx
            .pipeline
            .copy_mapping_data(&scope(), "m1", CopyRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_copy_requires_connected_databases() {
        let fx = fixture(&[("users", "people")], 1).await;
        let mut dst = fx.store.get_database(&scope(), "dst").await.unwrap().unwrap();
        dst.connected = false;
        fx.store.put_database(&dst).await.unwrap();

        let err = fx
            .pipeline
            .copy_mapping_data(&scope(), "m1", CopyRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
        assert!(err.to_string().contains("target"));
    }

    #[tokio::test]
    async fn test_unknown_mapping_is_not_found() {
        let fx = fixture(&[], 1).await;
        let err = fx
            .pipeline
            .copy_mapping_data(&scope(), "nope", CopyRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn test_cancelled_copy_stops_between_pairs() {
        let fx = fixture(&[("users", "people")], 1).await;
        fx.engine.seed("src", "users", rows(10));
        fx.pipeline.shutdown_token().cancel();

        let rx = fx
            .pipeline
            .copy_mapping_data(&scope(), "m1", CopyRequest::default())
            .await
            .unwrap();
        let last = drain_copy(rx).await.pop().unwrap();
        assert_eq!(last.status, CopyStatus::Cancelled);
        assert!(fx.engine.inserted("dst", "people").is_empty());
    }

    #[tokio::test]
    async fn test_transform_data_replace_wipes_target_once() {
        let fx = fixture(&[("users", "people"), ("accounts", "people")], 1).await;
        fx.engine.seed("src", "users", rows(3));
        fx.engine.seed("src", "accounts", rows(2));
        fx.engine.seed("dst", "people", rows(7));

        let summary = fx
            .pipeline
            .transform_data(&scope(), "m1", TransformMode::Replace)
            .await
            .unwrap();

        assert_eq!(summary.failed(), 0);
        assert_eq!(summary.pairs[0].totals.rows_deleted, 7);
        assert_eq!(summary.pairs[1].totals.rows_deleted, 0);
        assert_eq!(summary.totals().rows_inserted, 5);
        assert_eq!(fx.engine.table("dst", "people").len(), 5);
    }

    #[tokio::test]
    async fn test_transform_data_applies_filters() {
        let fx = fixture(&[("users", "people")], 1).await;
        fx.engine.seed("src", "users", rows(10));
        let filter = MappingFilter {
            id: "f1".into(),
            mapping_id: "m1".into(),
            filter_type: FilterType::Limit,
            expression: json!({"count": 3}).as_object().cloned().unwrap(),
            order: 0,
            operator: FilterOperator::And,
        };
        fx.store.add_filter(&filter).await.unwrap();

        let summary = fx
            .pipeline
            .transform_data(&scope(), "m1", TransformMode::Append)
            .await
            .unwrap();
        assert_eq!(summary.totals().rows_processed, 3);
        assert_eq!(fx.engine.fetch_filters("src", "users"), 1);
    }

    #[tokio::test]
    async fn test_update_mode_is_unimplemented() {
        let fx = fixture(&[("users", "people")], 1).await;
        fx.engine.seed("src", "users", rows(3));

        let err = fx
            .pipeline
            .transform_data(&scope(), "m1", TransformMode::Update)
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::Unimplemented);
        let err = fx
            .pipeline
            .transform_data_stream(&scope(), "m1", TransformMode::Update)
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::Unimplemented);
        assert!(fx.engine.inserted("dst", "people").is_empty());
    }

    #[tokio::test]
    async fn test_transform_stream_ends_with_complete_message() {
        let fx = fixture(&[("users", "people"), ("orders", "orders")], 1).await;
        fx.engine.seed("src", "users", rows(6));
        fx.engine.seed("src", "orders", rows(2));
        fx.engine.fail_inserts_into("dst", "orders");

        let mut rx = fx
            .pipeline
            .transform_data_stream(&scope(), "m1", TransformMode::Append)
            .await
            .unwrap();
        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message);
        }

        let last = messages.last().unwrap();
        assert!(last.is_complete);
        assert_eq!(last.totals.rows_inserted, 6);
        assert_eq!(messages.iter().filter(|m| m.is_complete).count(), 1);
        let failed: Vec<_> = messages.iter().filter(|m| m.error.is_some()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].target_table, "dst.orders");
    }
}
