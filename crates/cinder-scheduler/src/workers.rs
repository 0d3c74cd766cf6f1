//! Worker matching for task dispatch.

use cinder_core::ports::Worker;
use std::collections::HashMap;

/// One iteration's view of the idle worker set. Each worker is handed out
/// at most once; the pool is asked again next iteration.
pub struct WorkerAllocator {
    idle: Vec<Worker>,
}

impl WorkerAllocator {
    pub fn new(idle: Vec<Worker>) -> Self {
        Self { idle }
    }

    /// Remove and return the first idle worker whose capabilities cover
    /// every requested dimension.
    pub fn take_matching(&mut self, dimensions: &HashMap<String, String>) -> Option<Worker> {
        let pos = self
            .idle
            .iter()
            .position(|w| matches_dimensions(w, dimensions))?;
        Some(self.idle.remove(pos))
    }

    pub fn remaining(&self) -> usize {
        self.idle.len()
    }
}

/// A worker matches when its capability map is a superset of the requested
/// dimensions. Extra capabilities never disqualify it.
fn matches_dimensions(worker: &Worker, dimensions: &HashMap<String, String>) -> bool {
    dimensions
        .iter()
        .all(|(k, v)| worker.capabilities.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_worker(id: &str, caps: Vec<(&str, &str)>) -> Worker {
        Worker {
            id: id.to_string(),
            capabilities: caps
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn dims(pairs: Vec<(&str, &str)>) -> HashMap<String, String> {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn superset_capabilities_match() {
        let mut alloc = WorkerAllocator::new(vec![make_worker(
            "w1",
            vec![("pool", "Skia"), ("os", "Ubuntu"), ("gpu", "none")],
        )]);
        let worker = alloc.take_matching(&dims(vec![("pool", "Skia"), ("os", "Ubuntu")]));
        assert_eq!(worker.unwrap().id, "w1");
        assert_eq!(alloc.remaining(), 0);
    }

    #[test]
    fn mismatched_value_does_not_match() {
        let mut alloc =
            WorkerAllocator::new(vec![make_worker("w1", vec![("os", "Ubuntu")])]);
        assert!(alloc.take_matching(&dims(vec![("os", "Android")])).is_none());
        assert_eq!(alloc.remaining(), 1);
    }

    #[test]
    fn each_worker_is_used_once() {
        let mut alloc = WorkerAllocator::new(vec![
            make_worker("w1", vec![("pool", "Skia")]),
            make_worker("w2", vec![("pool", "Skia")]),
        ]);
        let want = dims(vec![("pool", "Skia")]);
        assert!(alloc.take_matching(&want).is_some());
        assert!(alloc.take_matching(&want).is_some());
        assert!(alloc.take_matching(&want).is_none());
    }

    #[test]
    fn empty_dimensions_match_any_worker() {
        let mut alloc = WorkerAllocator::new(vec![make_worker("w1", vec![])]);
        assert!(alloc.take_matching(&HashMap::new()).is_some());
    }
}
