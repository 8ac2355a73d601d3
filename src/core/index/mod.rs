pub mod builder;
pub mod employee;
pub mod search;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array1;
use parking_lot::RwLock;

pub use builder::{build_records, IndexBuildStats};
pub use employee::{mean_embedding, EmployeeRecord};
pub use search::VectorSearch;

/// Immutable snapshot of every enrolled employee plus the embedding
/// search structure. Rebuilt or extended by constructing a fresh value
/// and swapping it in; readers only ever see complete snapshots.
#[derive(Debug, Clone)]
pub struct EmployeeIndex {
    records: Vec<EmployeeRecord>,
    search: VectorSearch,
}

impl EmployeeIndex {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            search: VectorSearch::new(),
        }
    }

    pub fn from_records(records: Vec<EmployeeRecord>) -> Self {
        let rows: Vec<Array1<f32>> = records.iter().map(|r| r.embedding.clone()).collect();
        Self {
            search: VectorSearch::from_rows(&rows),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[EmployeeRecord] {
        &self.records
    }

    pub fn record(&self, pos: usize) -> Option<&EmployeeRecord> {
        self.records.get(pos)
    }

    pub fn contains(&self, employee_id: i64) -> bool {
        self.records.iter().any(|r| r.employee_id == employee_id)
    }

    pub fn accelerator_available(&self) -> bool {
        self.search.accelerated()
    }

    /// Shortlist employees by embedding distance.
    pub fn top_k(&self, query: &Array1<f32>, k: usize) -> Vec<(usize, f32)> {
        self.search.top_k(query, k)
    }

    /// A copy of this index with one more employee appended.
    pub fn with_appended(&self, record: EmployeeRecord) -> Self {
        let mut records = self.records.clone();
        records.push(record);
        Self::from_records(records)
    }

    pub fn total_templates(&self) -> usize {
        self.records.iter().map(|r| r.template_count()).sum()
    }
}

/// Process-wide handle. Mutations build a complete index and swap the
/// inner `Arc`, so concurrent identification requests keep matching
/// against the snapshot they started with.
pub struct SharedIndex {
    inner: RwLock<Arc<EmployeeIndex>>,
    ready: AtomicBool,
}

impl SharedIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(EmployeeIndex::empty())),
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Arc<EmployeeIndex> {
        self.inner.read().clone()
    }

    pub fn install(&self, index: EmployeeIndex) {
        *self.inner.write() = Arc::new(index);
        self.ready.store(true, Ordering::Release);
    }
}

impl Default for SharedIndex {
    fn default() -> Self {
        Self::new()
    }
}
