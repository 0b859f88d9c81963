//! In-process run store.
//!
//! Every operation runs under one mutex, so a conditional patch is atomic in
//! the same way a single-statement `UPDATE ... WHERE` is on the real store.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{Run, RunEvent, RunFilter, RunPatch, RunQuery, RunStore};
use crate::errors::StoreError;

#[derive(Default)]
struct Tables {
    runs: BTreeMap<String, Run>,
    events: Vec<RunEvent>,
}

#[derive(Default)]
pub struct MemoryRunStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runs(runs: impl IntoIterator<Item = Run>) -> Self {
        let store = Self::new();
        for run in runs {
            store.upsert(run);
        }
        store
    }

    /// Insert or replace a run, as an upstream stage would.
    pub fn upsert(&self, run: Run) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.runs.insert(run.run_slug.clone(), run);
        }
    }

    pub fn run(&self, slug: &str) -> Option<Run> {
        self.tables
            .lock()
            .ok()
            .and_then(|tables| tables.runs.get(slug).cloned())
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.tables
            .lock()
            .map(|tables| tables.events.clone())
            .unwrap_or_default()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<RunEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        self.tables
            .lock()
            .map_err(|e| StoreError::Decode(format!("memory store lock poisoned: {}", e)))
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn get(&self, query: &RunQuery) -> Result<Vec<Run>, StoreError> {
        let tables = self.lock()?;
        let mut rows: Vec<Run> = tables
            .runs
            .values()
            .filter(|run| query.filter.matches(run))
            .cloned()
            .collect();
        if query.newest_first {
            rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn conditional_patch(
        &self,
        filter: &RunFilter,
        patch: &RunPatch,
    ) -> Result<Vec<Run>, StoreError> {
        let mut tables = self.lock()?;
        let mut updated = Vec::new();
        for run in tables.runs.values_mut().filter(|run| filter.matches(run)) {
            patch.apply(run);
            updated.push(run.clone());
        }
        Ok(updated)
    }

    async fn insert_event(&self, event: &RunEvent) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        if !tables
            .events
            .iter()
            .any(|e| e.event_hash == event.event_hash)
        {
            tables.events.push(event.clone());
        }
        Ok(())
    }
}
