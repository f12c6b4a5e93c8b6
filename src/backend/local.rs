//! Local-process adapter: jobs run as detached child processes on this host.
//!
//! There is no external queue to ask, so completion is detected from each
//! job's exit marker file; a vanished process that never wrote its marker
//! reports `unknown`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::backend::{ActiveJob, BatchSystem, SubmitPlan};
use crate::error::Result;
use crate::store::records::JobStatus;

pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

async fn pid_alive(pid: i64) -> bool {
    // Signal 0 probes for existence without delivering anything.
    match Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(_) => false,
    }
}

#[async_trait]
impl BatchSystem for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn poll(&self, active: &[ActiveJob]) -> Result<Vec<(i64, JobStatus)>> {
        let mut reports = Vec::new();
        for job in active {
            let Some(backend_id) = job.backend_id else {
                continue;
            };
            let status = if job.dir.read_exit()?.is_some() {
                JobStatus::Done
            } else if pid_alive(backend_id).await {
                JobStatus::Running
            } else {
                JobStatus::Unknown
            };
            reports.push((backend_id, status));
        }
        Ok(reports)
    }

    async fn submit(&self, plan: &SubmitPlan) -> Result<Option<i64>> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&plan.log)?;
        let err_log = log.try_clone()?;

        let mut child = match Command::new("/bin/sh")
            .arg(&plan.wrapper)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log))
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(job_id = plan.job_id, error = %e, "failed to spawn local job");
                return Ok(None);
            }
        };

        let Some(pid) = child.id() else {
            tracing::warn!(job_id = plan.job_id, "local job exited before a pid was seen");
            return Ok(None);
        };

        // Reap the child in the background; completion is observed through
        // the exit marker, not the process handle.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        Ok(Some(pid as i64))
    }

    async fn kill_jobs(&self, _user: Option<&str>, _account: Option<&str>) -> Result<()> {
        tracing::warn!("local backend has no queue-wide cancellation; kill jobs by pid");
        Ok(())
    }
}
