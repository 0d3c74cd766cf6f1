//! Candidate generation and ranking.
//!
//! A candidate is one (repo, commit, spec name) triple eligible for a new
//! task attempt. Eligibility is decided against the cached task state for
//! that commit; ranking is deterministic so repeated iterations over the
//! same state dispatch in the same order.

use cinder_core::spec::TaskSpec;
use cinder_core::status::TaskStatus;
use cinder_core::task::Task;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub repo: String,
    pub revision: String,
    pub name: String,
    pub spec: TaskSpec,
    /// Commits between this one and the newest watched commit.
    pub commit_distance: usize,
    /// Retry ordinal: the number of prior failed or mishap attempts.
    pub attempt: u32,
}

/// Whether `spec` should get a new attempt given the tasks already at its
/// commit, and if so which attempt ordinal. `None` means the name has a
/// live or successful task, or its retries are exhausted.
pub fn next_attempt(name: &str, tasks_here: &[Task], retry_bound: u32) -> Option<u32> {
    let mut failed = 0;
    for task in tasks_here.iter().filter(|t| t.name == name) {
        match task.status {
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Success => return None,
            TaskStatus::Failure | TaskStatus::Mishap => failed += 1,
        }
    }
    (failed < retry_bound).then_some(failed)
}

/// Rank candidates for dispatch: newer commits first, then higher
/// priority, then name as the deterministic tie-break.
pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.commit_distance
            .cmp(&b.commit_distance)
            .then_with(|| b.spec.priority.total_cmp(&a.spec.priority))
            .then_with(|| a.name.cmp(&b.name))
    });
}
