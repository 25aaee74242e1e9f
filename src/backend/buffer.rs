use std::sync::{Arc, PoisonError, RwLock};

use super::wire::DataPoint;

/// Append-only store shared between connection handlers and readers.
#[derive(Debug, Clone, Default)]
pub struct BackendBuffer {
    points: Arc<RwLock<Vec<DataPoint>>>,
}

impl BackendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a decoded batch under a single write lock, so a snapshot sees
    /// either all of it or none of it.
    pub fn append(&self, batch: Vec<DataPoint>) {
        if batch.is_empty() {
            return;
        }
        let mut points = self.points.write().unwrap_or_else(PoisonError::into_inner);
        points.extend(batch);
    }

    pub fn snapshot(&self) -> Vec<DataPoint> {
        self.points
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs `f` against the current contents without copying them.
    pub fn with_points<T>(&self, f: impl FnOnce(&[DataPoint]) -> T) -> T {
        let points = self.points.read().unwrap_or_else(PoisonError::into_inner);
        f(&points)
    }

    pub fn len(&self) -> usize {
        self.points.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn discard(&self) {
        self.points
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
