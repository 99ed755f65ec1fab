//! Row counters and progress messages reported by the pipeline.

use serde::{Deserialize, Serialize};

use super::job::TablePairJob;

/// Running row counters for one table pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairTotals {
    /// Rows read from the source.
    pub rows_processed: u64,
    /// Rows produced by the rules.
    pub rows_transformed: u64,
    /// Rows the execution engine reported as inserted.
    pub rows_inserted: u64,
    /// Always zero until upserts exist.
    pub rows_updated: u64,
    /// Rows removed from the target before a replace.
    pub rows_deleted: u64,
}

impl PairTotals {
    pub fn add(&mut self, other: &PairTotals) {
        self.rows_processed += other.rows_processed;
        self.rows_transformed += other.rows_transformed;
        self.rows_inserted += other.rows_inserted;
        self.rows_updated += other.rows_updated;
        self.rows_deleted += other.rows_deleted;
    }
}

/// Outcome of one table pair in a unary transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairSummary {
    pub source_table: String,
    pub target_table: String,
    pub totals: PairTotals,
    pub error: Option<String>,
}

impl PairSummary {
    pub(crate) fn new(job: &TablePairJob, totals: PairTotals, error: Option<String>) -> Self {
        Self {
            source_table: job.source.to_string(),
            target_table: job.target.to_string(),
            totals,
            error,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a unary transform: one entry per table pair, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformSummary {
    pub pairs: Vec<PairSummary>,
}

impl TransformSummary {
    pub fn totals(&self) -> PairTotals {
        let mut totals = PairTotals::default();
        for pair in &self.pairs {
            totals.add(&pair.totals);
        }
        totals
    }

    pub fn failed(&self) -> usize {
        self.pairs.iter().filter(|p| !p.succeeded()).count()
    }
}

/// One message of a streamed transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamProgress {
    pub source_table: String,
    pub target_table: String,
    pub totals: PairTotals,
    /// Set only on the last message of the stream.
    pub is_complete: bool,
    pub error: Option<String>,
}

/// Status string of a copy progress message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStatus {
    Started,
    InProgress,
    Completed,
    CompletedWithErrors,
    Cancelled,
    DryRun,
}

impl CopyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStatus::Started => "started",
            CopyStatus::InProgress => "in_progress",
            CopyStatus::Completed => "completed",
            CopyStatus::CompletedWithErrors => "completed_with_errors",
            CopyStatus::Cancelled => "cancelled",
            CopyStatus::DryRun => "dry_run",
        }
    }

    /// Whether no further message follows this one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CopyStatus::Started | CopyStatus::InProgress)
    }
}

/// One message of a `CopyMappingData` stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyProgress {
    pub status: CopyStatus,
    pub message: String,
    /// Source rows read so far across all pairs.
    pub rows_processed: u64,
    /// Best-effort estimate from source row counts.
    pub total_rows: u64,
    pub current_table: String,
    /// `"{pair}: {error}"` for every failed pair.
    pub errors: Vec<String>,
    pub operation_id: String,
}
