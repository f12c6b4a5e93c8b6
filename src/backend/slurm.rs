//! Slurm adapter: `sbatch` submission, `sacct` polling, `scancel` cleanup.

use async_trait::async_trait;
use tokio::process::Command;

use crate::backend::{current_user, ActiveJob, BatchSystem, SubmitPlan};
use crate::error::Result;
use crate::store::records::JobStatus;

pub struct SlurmBackend;

impl SlurmBackend {
    pub fn new() -> Self {
        Self
    }

    /// Map sacct's state vocabulary onto the shared state machine.
    fn normalize_state(state: &str) -> JobStatus {
        match state.trim_end_matches('+') {
            "PENDING" | "REQUEUED" | "SUSPENDED" => JobStatus::Queued,
            "RUNNING" | "COMPLETING" => JobStatus::Running,
            // FAILED means the payload exited nonzero; the return code is
            // recovered from the exit marker.
            "COMPLETED" | "FAILED" => JobStatus::Done,
            "CANCELLED" | "TIMEOUT" => JobStatus::Removed,
            _ => JobStatus::Unknown,
        }
    }
}

impl Default for SlurmBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchSystem for SlurmBackend {
    fn name(&self) -> &'static str {
        "slurm"
    }

    async fn poll(&self, _active: &[ActiveJob]) -> Result<Vec<(i64, JobStatus)>> {
        let mut cmd = Command::new("sacct");
        if let Some(user) = current_user() {
            cmd.arg("-u").arg(user);
        }
        cmd.args(["--format=JobID,State", "--noheader", "--parsable2"]);
        let output = cmd.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let mut reports = Vec::new();
        for line in stdout.lines() {
            let mut fields = line.split('|');
            let (Some(id), Some(state)) = (fields.next(), fields.next()) else {
                continue;
            };
            // Job steps show up as "1234.batch"; only whole allocations count.
            let Ok(backend_id) = id.trim().parse::<i64>() else {
                continue;
            };
            reports.push((backend_id, Self::normalize_state(state.trim())));
        }
        Ok(reports)
    }

    async fn submit(&self, plan: &SubmitPlan) -> Result<Option<i64>> {
        let mut cmd = Command::new("sbatch");
        cmd.args(["--parsable", "--export=ALL"])
            .arg("-n")
            .arg(plan.cores.to_string())
            .arg("-t")
            .arg(plan.walltime_minutes().to_string())
            .arg("-o")
            .arg(&plan.log)
            .arg("-J")
            .arg(format!("{}_{}", plan.name, plan.job_id));
        if let Some(q) = &plan.queue {
            cmd.arg("-p").arg(q);
        }
        if let Some(a) = &plan.account {
            cmd.arg("-A").arg(a);
        }
        cmd.arg(&plan.wrapper);

        let output = match cmd.output().await {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(job_id = plan.job_id, error = %e, "sbatch invocation failed");
                return Ok(None);
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        // --parsable prints "<jobid>" or "<jobid>;<cluster>".
        let backend_id = stdout.trim().split(';').next().and_then(|t| t.parse().ok());
        if backend_id.is_none() {
            tracing::warn!(
                job_id = plan.job_id,
                stdout = %stdout.trim(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "sbatch did not report a job id"
            );
        }
        Ok(backend_id)
    }

    async fn kill_jobs(&self, user: Option<&str>, account: Option<&str>) -> Result<()> {
        let user = user
            .map(str::to_string)
            .or_else(current_user)
            .unwrap_or_default();
        let mut cmd = Command::new("scancel");
        cmd.arg("-u").arg(user);
        if let Some(a) = account {
            cmd.arg("-A").arg(a);
        }
        cmd.status().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sacct_states_normalize_into_shared_machine() {
        assert_eq!(SlurmBackend::normalize_state("PENDING"), JobStatus::Queued);
        assert_eq!(SlurmBackend::normalize_state("RUNNING"), JobStatus::Running);
        assert_eq!(SlurmBackend::normalize_state("COMPLETED"), JobStatus::Done);
        assert_eq!(SlurmBackend::normalize_state("FAILED"), JobStatus::Done);
        assert_eq!(SlurmBackend::normalize_state("CANCELLED+"), JobStatus::Removed);
        assert_eq!(SlurmBackend::normalize_state("TIMEOUT"), JobStatus::Removed);
        assert_eq!(SlurmBackend::normalize_state("NODE_FAIL"), JobStatus::Unknown);
    }
}
