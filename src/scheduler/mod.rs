//! Scheduler loop: poll backend status, reconcile completions, run admission
//! control, submit newly-admitted jobs.
//!
//! Single-threaded and cooperative: one full poll-admit-submit pass per
//! cycle, then sleep. Concurrency lives in the submitted processes, which
//! report back only through backend status and marker files.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backend::{ActiveJob, BatchSystem, SubmitPlan};
use crate::config::ManagerConfig;
use crate::error::{BatchqError, Result};
use crate::jobs::JobDir;
use crate::store::records::{Job, JobKind, JobStatus};
use crate::store::{JobStore, StatusUpdate};

pub mod reconcile;

/// States the backend is asked about each pass. `unknown` is re-polled so a
/// late-arriving exit marker can still settle the job.
const POLLED_STATES: &[JobStatus] = &[
    JobStatus::Submitted,
    JobStatus::Queued,
    JobStatus::Running,
    JobStatus::Unknown,
];

/// States that keep `cycle_launch` running.
const UNFINISHED_STATES: &[JobStatus] = &[
    JobStatus::Waiting,
    JobStatus::Submitted,
    JobStatus::Queued,
    JobStatus::Running,
];

pub struct Scheduler {
    store: JobStore,
    backend: Box<dyn BatchSystem>,
    config: ManagerConfig,
}

impl Scheduler {
    pub fn new(store: JobStore, backend: Box<dyn BatchSystem>, config: ManagerConfig) -> Self {
        Self {
            store,
            backend,
            config,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut JobStore {
        &mut self.store
    }

    /// Poll the backend and write normalized states back to the store in one
    /// transaction. Jobs that left the backend's view are settled from their
    /// marker files (`done`) or marked `unknown`; bundles that reached a
    /// terminal state are reconciled.
    pub async fn refresh_status(&mut self) -> Result<()> {
        let jobs = self.store.jobs_in(POLLED_STATES)?;
        if jobs.is_empty() {
            return Ok(());
        }

        let active: Vec<ActiveJob> = jobs
            .iter()
            .map(|j| ActiveJob {
                job_id: j.job_id,
                backend_id: j.backend_id,
                status: j.status,
                dir: JobDir::new(&self.config.jobs_dir, j.job_id),
            })
            .collect();
        let reported: HashMap<i64, JobStatus> =
            self.backend.poll(&active).await?.into_iter().collect();

        let mut updates = Vec::new();
        let mut finished_bundles = Vec::new();
        for job in &jobs {
            let dir = JobDir::new(&self.config.jobs_dir, job.job_id);
            let observed = job.backend_id.and_then(|bid| reported.get(&bid).copied());
            let status = match observed {
                Some(s) => s,
                // Gone from the backend without a terminal report: the exit
                // marker is the remaining evidence.
                None if dir.read_exit()?.is_some() => JobStatus::Done,
                None => JobStatus::Unknown,
            };

            let (return_code, walltime) = if status == JobStatus::Done {
                let exit = dir.read_exit()?;
                (
                    exit.as_ref().map(|e| e.return_code),
                    dir.measured_walltime()?,
                )
            } else {
                (None, None)
            };

            if status != job.status {
                tracing::info!(
                    job_id = job.job_id,
                    from = %job.status,
                    to = %status,
                    "Job status changed"
                );
                if job.kind == JobKind::Bundle && status.is_terminal() {
                    finished_bundles.push(job.job_id);
                }
            }
            if status != job.status || return_code.is_some() || walltime.is_some() {
                updates.push(StatusUpdate {
                    job_id: job.job_id,
                    status,
                    return_code,
                    walltime,
                });
            }
        }
        self.store.apply_status_updates(&updates)?;

        for bundle_id in finished_bundles {
            reconcile::reconcile_bundle(&mut self.store, &self.config.jobs_dir, bundle_id)?;
        }
        Ok(())
    }

    /// Run one admission pass and submit everything admitted, optionally
    /// sleeping `trickle` seconds between submissions. Returns the number of
    /// jobs actually handed to the backend.
    pub async fn launch_ready(&mut self, trickle: Option<f64>) -> Result<usize> {
        let admitted = self
            .store
            .possible_submissions(self.config.max_candidates, self.config.submit_order)?;
        if admitted.is_empty() {
            return Ok(0);
        }
        tracing::info!(count = admitted.len(), "Submitting admitted jobs");

        let mut submitted = 0;
        for (i, &job_id) in admitted.iter().enumerate() {
            if i > 0 {
                if let Some(secs) = trickle {
                    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                }
            }
            let job = self.store.get_job(job_id)?;
            let plan = self.prepare(&job)?;
            match self.backend.submit(&plan).await? {
                Some(backend_id) => {
                    if self.store.record_submission(job_id, backend_id)? {
                        tracing::info!(
                            job_id,
                            backend_id,
                            backend = self.backend.name(),
                            "Job submitted"
                        );
                        submitted += 1;
                    } else {
                        tracing::warn!(
                            job_id,
                            backend_id,
                            "Job left waiting state while being submitted"
                        );
                    }
                }
                // Expected failure class: stays waiting, retried by a later
                // admission pass, never escalated.
                None => tracing::warn!(job_id, "Submission failed; job stays waiting"),
            }
        }
        Ok(submitted)
    }

    /// Materialize the job's directory and build its submission plan.
    fn prepare(&mut self, job: &Job) -> Result<SubmitPlan> {
        let dir = JobDir::new(&self.config.jobs_dir, job.job_id);
        match job.kind {
            JobKind::Shell => {
                if !dir.is_materialized() {
                    let script = job.script().ok_or_else(|| {
                        BatchqError::MalformedRecord(job.job_id, "shell job without script".into())
                    })?;
                    dir.materialize_shell(script)?;
                }
            }
            JobKind::Bundle => {
                let members = job.runorder().unwrap_or(&[]);
                let mut wrappers = Vec::with_capacity(members.len());
                for &member in members {
                    let member_dir = JobDir::new(&self.config.jobs_dir, member);
                    if !member_dir.is_materialized() {
                        let member_job = self.store.get_job(member)?;
                        let script = member_job.script().ok_or_else(|| {
                            BatchqError::MalformedRecord(member, "bundle member without script".into())
                        })?;
                        member_dir.materialize_shell(script)?;
                    }
                    wrappers.push(member_dir.wrapper_path());
                }
                if !dir.is_materialized() {
                    dir.materialize_bundle(job.cores_request().ceil() as u32, &wrappers)?;
                }
            }
        }

        // Stale markers from an earlier run would read as instant completion.
        dir.clear_markers()?;

        Ok(SubmitPlan {
            job_id: job.job_id,
            name: job.name.clone(),
            wrapper: dir.wrapper_path(),
            log: dir.log_path(),
            queue: job.queue_name.clone().or_else(|| self.config.queue.clone()),
            account: job.account.clone().or_else(|| self.config.account.clone()),
            walltime_secs: job.walltime_request().ceil() as u64,
            cores: (job.cores_request().ceil() as u32).max(1),
        })
    }

    /// One full pass: refresh, admit, submit, log the queue summary.
    pub async fn update_and_launch(&mut self, trickle: Option<f64>) -> Result<usize> {
        self.refresh_status().await?;
        let submitted = self.launch_ready(trickle).await?;
        self.log_summary()?;
        Ok(submitted)
    }

    /// Repeat [`update_and_launch`](Self::update_and_launch) on a fixed
    /// interval until no job remains waiting or in flight, or until shutdown
    /// is requested.
    pub async fn cycle_launch(
        &mut self,
        trickle: Option<f64>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            let unfinished = self.store.count_in(UNFINISHED_STATES)?;
            if unfinished == 0 {
                tracing::info!("No jobs left waiting or in flight");
                return Ok(());
            }
            tracing::info!(unfinished, "Scheduler pass");
            self.update_and_launch(trickle).await?;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, leaving scheduler loop");
                    return Ok(());
                }
            }
        }
    }

    /// Best-effort cancellation: ask the backend to kill this user's jobs and
    /// mark everything still `waiting` as `removed`. Backend-side state
    /// settles on the next polling pass.
    pub async fn cancel_queued(&mut self) -> Result<()> {
        self.refresh_status().await?;
        self.backend
            .kill_jobs(None, self.config.account.as_deref())
            .await?;
        let removed = self.store.remove_waiting()?;
        tracing::info!(removed, "Cancelled waiting jobs");
        Ok(())
    }

    fn log_summary(&self) -> Result<()> {
        let counts = self.store.status_counts()?;
        if counts.is_empty() {
            return Ok(());
        }
        let summary = counts
            .iter()
            .map(|(status, n)| format!("{}: {}", status, n))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(%summary, "Job store status");
        Ok(())
    }
}
