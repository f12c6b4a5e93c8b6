//! LSF adapter: `bsub` submission, `bjobs` polling, `bkill` cleanup.

use async_trait::async_trait;
use tokio::process::Command;

use crate::backend::{current_user, ActiveJob, BatchSystem, SubmitPlan};
use crate::error::Result;
use crate::store::records::JobStatus;

pub struct LsfBackend;

impl LsfBackend {
    pub fn new() -> Self {
        Self
    }

    fn normalize_state(state: &str) -> JobStatus {
        match state {
            "PEND" | "PSUSP" | "SSUSP" | "USUSP" => JobStatus::Queued,
            "RUN" => JobStatus::Running,
            // EXIT is a nonzero payload exit; the return code comes from the
            // exit marker.
            "DONE" | "EXIT" => JobStatus::Done,
            _ => JobStatus::Unknown,
        }
    }

    /// Pull the backend id out of "Job <689944> is submitted to queue <x>.".
    fn parse_submission(stdout: &str) -> Option<i64> {
        stdout
            .split_whitespace()
            .nth(1)?
            .trim_start_matches('<')
            .trim_end_matches('>')
            .parse()
            .ok()
    }
}

impl Default for LsfBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchSystem for LsfBackend {
    fn name(&self) -> &'static str {
        "lsf"
    }

    async fn poll(&self, _active: &[ActiveJob]) -> Result<Vec<(i64, JobStatus)>> {
        let output = Command::new("bjobs").arg("-noheader").output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let mut reports = Vec::new();
        for line in stdout.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                continue;
            }
            let Ok(backend_id) = fields[0].parse::<i64>() else {
                continue;
            };
            reports.push((backend_id, Self::normalize_state(fields[2])));
        }
        Ok(reports)
    }

    async fn submit(&self, plan: &SubmitPlan) -> Result<Option<i64>> {
        let mut cmd = Command::new("bsub");
        cmd.arg("-n")
            .arg(plan.cores.to_string())
            .arg("-W")
            .arg(plan.walltime_minutes().to_string())
            .arg("-o")
            .arg(&plan.log)
            .arg("-J")
            .arg(format!("{}_{}", plan.name, plan.job_id));
        if let Some(q) = &plan.queue {
            cmd.arg("-q").arg(q);
        }
        if let Some(a) = &plan.account {
            cmd.arg("-G").arg(a);
        }
        cmd.arg("/bin/sh").arg(&plan.wrapper);

        let output = match cmd.output().await {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(job_id = plan.job_id, error = %e, "bsub invocation failed");
                return Ok(None);
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        let backend_id = Self::parse_submission(&stdout);
        if backend_id.is_none() {
            tracing::warn!(
                job_id = plan.job_id,
                stdout = %stdout.trim(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "bsub did not report a job id"
            );
        }
        Ok(backend_id)
    }

    async fn kill_jobs(&self, user: Option<&str>, _account: Option<&str>) -> Result<()> {
        let user = user
            .map(str::to_string)
            .or_else(current_user)
            .unwrap_or_default();
        // "bkill -u <user> 0" cancels every job the user owns.
        Command::new("bkill")
            .arg("-u")
            .arg(user)
            .arg("0")
            .status()
            .await?;
        Ok(())
    }
}
