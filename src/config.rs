use std::path::PathBuf;
use std::time::Duration;

use crate::store::SubmitOrder;

/// Scheduler and store configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Path to the jobs database.
    pub db_path: PathBuf,
    /// Directory holding one subdirectory per job (wrapper, markers, log).
    pub jobs_dir: PathBuf,
    /// Default submission queue/partition when a job names none.
    pub queue: Option<String>,
    /// Default billing account when a job names none.
    pub account: Option<String>,
    /// Order in which waiting jobs are considered for admission.
    pub submit_order: SubmitOrder,
    /// Upper bound on candidates examined per admission pass.
    pub max_candidates: usize,
    /// Seconds slept between consecutive submissions, to avoid storms.
    pub trickle: Option<f64>,
    /// Sleep between scheduler passes in `cycle_launch`.
    pub cycle_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let jobs_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("jobs");
        Self {
            db_path: jobs_dir.join("jdb.sql"),
            jobs_dir,
            queue: None,
            account: None,
            submit_order: SubmitOrder::default(),
            max_candidates: 100_000,
            trickle: None,
            cycle_interval: Duration::from_secs(15),
        }
    }
}

impl ManagerConfig {
    pub fn new(db_path: PathBuf, jobs_dir: PathBuf) -> Self {
        Self {
            db_path,
            jobs_dir,
            ..Self::default()
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_order(mut self, order: SubmitOrder) -> Self {
        self.submit_order = order;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_share_the_jobs_dir() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.db_path, cfg.jobs_dir.join("jdb.sql"));
        assert!(cfg.queue.is_none());
        assert!(cfg.account.is_none());
        assert_eq!(cfg.submit_order, SubmitOrder::Lifo);
        assert_eq!(cfg.cycle_interval, Duration::from_secs(15));
    }

    #[test]
    fn config_builders() {
        let cfg = ManagerConfig::new(PathBuf::from("/tmp/db.sql"), PathBuf::from("/tmp/jobs"))
            .with_queue("batch")
            .with_account("proj")
            .with_order(SubmitOrder::Fifo);
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/db.sql"));
        assert_eq!(cfg.jobs_dir, PathBuf::from("/tmp/jobs"));
        assert_eq!(cfg.queue.as_deref(), Some("batch"));
        assert_eq!(cfg.account.as_deref(), Some("proj"));
        assert_eq!(cfg.submit_order, SubmitOrder::Fifo);
    }
}
