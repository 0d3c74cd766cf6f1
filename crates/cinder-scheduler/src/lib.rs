//! Task scheduling and dispatch for Cinder.
//!
//! The scheduler walks watched repositories commit by commit, turns each
//! commit's task config into dispatch candidates, ranks them, matches them
//! against idle workers, and reconciles running work back into the store.

pub mod candidates;
pub mod config;
pub mod dag;
pub mod scheduler;
pub mod workers;

pub use config::SchedulerConfig;
pub use scheduler::Scheduler;
