//! Execution results and cross-shard merging

use super::stream::ShardRowStream;
use super::ProxyMode;
use crate::error::{Error, Result};
use crate::protocol::message::OkPacket;
use crate::types::{Column, Row, Value};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Sort direction of one merge key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    /// Smallest first
    #[default]
    Ascending,
    /// Largest first
    Descending,
}

/// Orders rows coming from different shards
#[derive(Clone)]
pub struct RowComparator(Arc<dyn Fn(&Row, &Row) -> Ordering + Send + Sync>);

impl RowComparator {
    /// Compare by column positions, each with a direction; missing values sort as NULL
    pub fn by_columns(keys: impl IntoIterator<Item = (usize, SortDirection)>) -> Self {
        let keys: Vec<(usize, SortDirection)> = keys.into_iter().collect();
        Self(Arc::new(move |a: &Row, b: &Row| {
            for &(idx, direction) in &keys {
                let left = a.get(idx).unwrap_or(&Value::Null);
                let right = b.get(idx).unwrap_or(&Value::Null);
                let ord = match direction {
                    SortDirection::Ascending => left.compare(right),
                    SortDirection::Descending => right.compare(left),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }))
    }

    /// Ascending by a single column
    pub fn by_column(idx: usize) -> Self {
        Self::by_columns([(idx, SortDirection::Ascending)])
    }

    /// Caller-supplied ordering
    pub fn custom(compare: impl Fn(&Row, &Row) -> Ordering + Send + Sync + 'static) -> Self {
        Self(Arc::new(compare))
    }

    /// Compare two rows
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        (self.0)(a, b)
    }
}

impl fmt::Debug for RowComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RowComparator(..)")
    }
}

/// How rows from several shards are combined
#[derive(Debug, Clone, Default)]
pub enum MergeOrder {
    /// Shard by shard, in target order
    #[default]
    Concatenate,
    /// Globally ordered; ties keep target order
    Sorted(RowComparator),
}

/// A fully buffered result set
#[derive(Debug, Clone)]
pub struct RowSet {
    /// Column metadata
    pub columns: Arc<[Column]>,
    /// Rows in backend order
    pub rows: Vec<Row>,
}

impl RowSet {
    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows were returned
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Outcome of a statement that returned no rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateCount {
    /// Rows changed
    pub affected_rows: u64,
    /// Last generated id
    pub last_insert_id: u64,
    /// Warning count
    pub warnings: u16,
}

impl From<OkPacket> for UpdateCount {
    fn from(ok: OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
        }
    }
}

/// What one shard produced
#[derive(Debug)]
pub enum ShardOutput {
    /// Buffered rows; the channel is already back in its pool
    Rows(RowSet),
    /// Lazily read rows; the channel is held until the stream ends
    Stream(ShardRowStream),
    /// Update count
    Update(UpdateCount),
}

impl ShardOutput {
    /// Column metadata, if this output carries rows
    pub fn columns(&self) -> Option<&Arc<[Column]>> {
        match self {
            Self::Rows(set) => Some(&set.columns),
            Self::Stream(stream) => Some(stream.columns()),
            Self::Update(_) => None,
        }
    }
}

/// One target's outcome, attributed to its datasource
#[derive(Debug)]
pub struct ShardResult {
    /// Datasource the statement ran on
    pub datasource: Arc<str>,
    /// Rows, update count, or the shard's error
    pub outcome: Result<ShardOutput>,
}

/// A row tagged with the shard it came from
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRow {
    /// Source datasource
    pub datasource: Arc<str>,
    /// Row values
    pub row: Row,
}

/// A failure attributed to one shard
#[derive(Debug)]
pub struct ShardError {
    /// Failing datasource
    pub datasource: Arc<str>,
    /// The error
    pub error: Error,
}

impl fmt::Display for ShardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.datasource, self.error)
    }
}

/// Rows of every shard merged, next to the shards that failed
#[derive(Debug, Default)]
pub struct MergedRows {
    /// Column metadata of the first shard that returned rows
    pub columns: Option<Arc<[Column]>>,
    /// Merged rows
    pub rows: Vec<ShardRow>,
    /// Per-shard update counts
    pub updates: Vec<(Arc<str>, UpdateCount)>,
    /// Shards that failed
    pub errors: Vec<ShardError>,
}

impl MergedRows {
    /// Sum of affected rows over all shards
    pub fn total_affected_rows(&self) -> u64 {
        self.updates.iter().map(|(_, u)| u.affected_rows).sum()
    }
}

/// Result of executing one request against all of its targets
#[derive(Debug)]
pub struct ExecutionResult {
    mode: ProxyMode,
    merge: MergeOrder,
    shards: Vec<ShardResult>,
}

impl ExecutionResult {
    pub(crate) fn new(mode: ProxyMode, merge: MergeOrder, shards: Vec<ShardResult>) -> Self {
        Self {
            mode,
            merge,
            shards,
        }
    }

    /// Mode of the engine that produced this result
    pub fn mode(&self) -> ProxyMode {
        self.mode
    }

    /// Requested merge order
    pub fn merge_order(&self) -> &MergeOrder {
        &self.merge
    }

    /// Per-shard outcomes in target order
    pub fn shards(&self) -> &[ShardResult] {
        &self.shards
    }

    /// Mutable per-shard outcomes
    pub fn shards_mut(&mut self) -> &mut [ShardResult] {
        &mut self.shards
    }

    /// Take the per-shard outcomes
    pub fn into_shards(self) -> Vec<ShardResult> {
        self.shards
    }

    /// Outcome of one datasource
    pub fn shard(&self, datasource: &str) -> Option<&ShardResult> {
        self.shards.iter().find(|s| &*s.datasource == datasource)
    }

    /// Shards that succeeded
    pub fn succeeded(&self) -> usize {
        self.shards.iter().filter(|s| s.outcome.is_ok()).count()
    }

    /// Failed shards with their errors
    pub fn errors(&self) -> Vec<(&str, &Error)> {
        self.shards
            .iter()
            .filter_map(|s| s.outcome.as_ref().err().map(|e| (&*s.datasource, e)))
            .collect()
    }

    /// Some shards succeeded and some failed
    pub fn is_partial_failure(&self) -> bool {
        let ok = self.succeeded();
        ok > 0 && ok < self.shards.len()
    }

    /// Every shard failed
    pub fn is_failure(&self) -> bool {
        self.succeeded() == 0
    }

    /// Sum of affected rows over shards that returned an update count
    pub fn total_affected_rows(&self) -> u64 {
        self.shards
            .iter()
            .filter_map(|s| match &s.outcome {
                Ok(ShardOutput::Update(update)) => Some(update.affected_rows),
                _ => None,
            })
            .sum()
    }

    /// Column metadata of the first shard that returned rows
    pub fn columns(&self) -> Option<Arc<[Column]>> {
        self.shards
            .iter()
            .find_map(|s| s.outcome.as_ref().ok().and_then(|o| o.columns()).cloned())
    }

    /// Merge every shard's rows in the requested order, reading streams to the end
    pub async fn merged_rows(self) -> MergedRows {
        let columns = self.columns();
        let mut stream = self.into_merged_stream();
        let mut rows = Vec::new();
        let mut failed = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(row) => rows.push(row),
                Err(e) => failed.push(e),
            }
        }
        let mut errors = std::mem::take(&mut stream.errors);
        errors.append(&mut failed);
        MergedRows {
            columns,
            rows,
            updates: std::mem::take(&mut stream.updates),
            errors,
        }
    }

    /// Merge every shard's rows lazily in the requested order
    pub fn into_merged_stream(self) -> MergedRowStream {
        let mut sources = Vec::new();
        let mut updates = Vec::new();
        let mut errors = Vec::new();
        for shard in self.shards {
            let rows = match shard.outcome {
                Ok(ShardOutput::Rows(mut set)) => {
                    // buffered shards are sorted in place so the merge is total
                    if let MergeOrder::Sorted(comparator) = &self.merge {
                        set.rows.sort_by(|a, b| comparator.compare(a, b));
                    }
                    SourceRows::Buffered(set.rows.into())
                }
                Ok(ShardOutput::Stream(stream)) => SourceRows::Streaming(stream),
                Ok(ShardOutput::Update(update)) => {
                    updates.push((shard.datasource, update));
                    continue;
                }
                Err(error) => {
                    errors.push(ShardError {
                        datasource: shard.datasource,
                        error,
                    });
                    continue;
                }
            };
            sources.push(Source {
                datasource: shard.datasource,
                rows,
                head: None,
                done: false,
            });
        }
        MergedRowStream {
            merge: self.merge,
            sources,
            current: 0,
            primed: false,
            pending: VecDeque::new(),
            updates,
            errors,
        }
    }
}

enum SourceRows {
    Buffered(VecDeque<Row>),
    Streaming(ShardRowStream),
}

struct Source {
    datasource: Arc<str>,
    rows: SourceRows,
    head: Option<Row>,
    done: bool,
}

impl Source {
    async fn pull(&mut self) -> Result<Option<Row>> {
        match &mut self.rows {
            SourceRows::Buffered(rows) => Ok(rows.pop_front()),
            SourceRows::Streaming(stream) => stream.next().await,
        }
    }
}

type MergeItem = std::result::Result<ShardRow, ShardError>;

/// Lazily merged rows of several shards
///
/// A shard that fails mid-read yields one attributed error and leaves the
/// merge; the other shards keep producing rows.
pub struct MergedRowStream {
    merge: MergeOrder,
    sources: Vec<Source>,
    current: usize,
    primed: bool,
    pending: VecDeque<ShardError>,
    updates: Vec<(Arc<str>, UpdateCount)>,
    errors: Vec<ShardError>,
}

impl fmt::Debug for MergedRowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedRowStream")
            .field("merge", &self.merge)
            .field("sources", &self.sources.len())
            .field("errors", &self.errors.len())
            .finish()
    }
}

impl MergedRowStream {
    /// Shards that failed before producing a result
    pub fn errors(&self) -> &[ShardError] {
        &self.errors
    }

    /// Shards that returned an update count
    pub fn updates(&self) -> &[(Arc<str>, UpdateCount)] {
        &self.updates
    }

    /// Next merged row, or the error of a shard that failed mid-read
    pub async fn next(&mut self) -> Option<MergeItem> {
        match self.merge.clone() {
            MergeOrder::Concatenate => self.next_concatenated().await,
            MergeOrder::Sorted(comparator) => self.next_sorted(&comparator).await,
        }
    }

    async fn next_concatenated(&mut self) -> Option<MergeItem> {
        while let Some(source) = self.sources.get_mut(self.current) {
            match source.pull().await {
                Ok(Some(row)) => {
                    return Some(Ok(ShardRow {
                        datasource: Arc::clone(&source.datasource),
                        row,
                    }));
                }
                Ok(None) => self.current += 1,
                Err(error) => {
                    let datasource = Arc::clone(&source.datasource);
                    self.current += 1;
                    return Some(Err(ShardError { datasource, error }));
                }
            }
        }
        None
    }

    async fn next_sorted(&mut self, comparator: &RowComparator) -> Option<MergeItem> {
        if !self.primed {
            self.primed = true;
            for idx in 0..self.sources.len() {
                self.refill(idx).await;
            }
        }
        if let Some(error) = self.pending.pop_front() {
            return Some(Err(error));
        }

        let mut best: Option<usize> = None;
        for (idx, source) in self.sources.iter().enumerate() {
            let Some(row) = &source.head else { continue };
            let better = match best.and_then(|b| self.sources[b].head.as_ref()) {
                Some(current) => comparator.compare(row, current) == Ordering::Less,
                None => true,
            };
            if better {
                best = Some(idx);
            }
        }

        let idx = best?;
        let source = &mut self.sources[idx];
        let row = source.head.take()?;
        let datasource = Arc::clone(&source.datasource);
        self.refill(idx).await;
        Some(Ok(ShardRow { datasource, row }))
    }

    async fn refill(&mut self, idx: usize) {
        let source = &mut self.sources[idx];
        if source.done || source.head.is_some() {
            return;
        }
        match source.pull().await {
            Ok(Some(row)) => source.head = Some(row),
            Ok(None) => source.done = true,
            Err(error) => {
                source.done = true;
                self.pending.push_back(ShardError {
                    datasource: Arc::clone(&source.datasource),
                    error,
                });
            }
        }
    }
}
