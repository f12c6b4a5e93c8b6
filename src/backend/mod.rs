//! Backend abstraction: one submission/polling contract, with an adapter per
//! batch system normalizing vendor status vocabularies into the shared state
//! machine.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;
use crate::jobs::JobDir;
use crate::store::records::JobStatus;

pub mod local;
pub mod lsf;
pub mod slurm;

pub use local::LocalBackend;
pub use lsf::LsfBackend;
pub use slurm::SlurmBackend;

/// A submitted job the scheduler wants status for.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub job_id: i64,
    pub backend_id: Option<i64>,
    pub status: JobStatus,
    pub dir: JobDir,
}

/// Everything an adapter needs to hand one job to its batch system.
#[derive(Debug, Clone)]
pub struct SubmitPlan {
    pub job_id: i64,
    pub name: String,
    pub wrapper: PathBuf,
    pub log: PathBuf,
    pub queue: Option<String>,
    pub account: Option<String>,
    pub walltime_secs: u64,
    pub cores: u32,
}

impl SubmitPlan {
    /// Wall-time request rounded up to whole minutes, as batch systems want.
    pub fn walltime_minutes(&self) -> u64 {
        self.walltime_secs.div_ceil(60).max(1)
    }
}

/// Submission and polling contract the scheduler drives.
///
/// `submit` reports the expected submission-failure class as `Ok(None)` (the
/// job stays `waiting`); errors are reserved for I/O failures talking to the
/// system itself.
#[async_trait]
pub trait BatchSystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// One normalized status observation per backend-visible job, keyed by
    /// backend id. Jobs absent from the result are treated by the scheduler
    /// as having left the backend.
    async fn poll(&self, active: &[ActiveJob]) -> Result<Vec<(i64, JobStatus)>>;

    /// Submit one job; `Ok(Some(id))` carries the backend-native job id.
    async fn submit(&self, plan: &SubmitPlan) -> Result<Option<i64>>;

    /// Best-effort bulk cancellation of this user's jobs.
    async fn kill_jobs(&self, user: Option<&str>, account: Option<&str>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Slurm,
    Lsf,
    Local,
}

pub fn create_backend(kind: BackendKind) -> Box<dyn BatchSystem> {
    match kind {
        BackendKind::Slurm => Box::new(SlurmBackend::new()),
        BackendKind::Lsf => Box::new(LsfBackend::new()),
        BackendKind::Local => Box::new(LocalBackend::new()),
    }
}

/// Submitting user, for `-u` style filters.
pub(crate) fn current_user() -> Option<String> {
    std::env::var("USER").ok().filter(|u| !u.is_empty())
}
