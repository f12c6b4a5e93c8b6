use serde::{Deserialize, Serialize};

/// Resource name under which a job's wall-time request is booked, in seconds.
pub const WALLTIME_RESOURCE: &str = "walltime";
/// Resource name under which a job's core-count request is booked.
pub const CORES_RESOURCE: &str = "cores";

/// Wall time assumed for jobs that never stated a request, in seconds.
pub const DEFAULT_WALLTIME: f64 = 1800.0;
/// Core count assumed for jobs that never stated a request.
pub const DEFAULT_CORES: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Hold,
    Waiting,
    Submitted,
    Queued,
    Running,
    Done,
    Unknown,
    Removed,
    Bundled,
    Unbundled,
}

impl JobStatus {
    /// Integer code persisted in the store.
    pub fn code(self) -> i64 {
        match self {
            JobStatus::Hold => -1,
            JobStatus::Waiting => 0,
            JobStatus::Submitted => 1,
            JobStatus::Queued => 2,
            JobStatus::Running => 3,
            JobStatus::Done => 4,
            JobStatus::Unknown => 5,
            JobStatus::Removed => 6,
            JobStatus::Bundled => 7,
            JobStatus::Unbundled => 8,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(JobStatus::Hold),
            0 => Some(JobStatus::Waiting),
            1 => Some(JobStatus::Submitted),
            2 => Some(JobStatus::Queued),
            3 => Some(JobStatus::Running),
            4 => Some(JobStatus::Done),
            5 => Some(JobStatus::Unknown),
            6 => Some(JobStatus::Removed),
            7 => Some(JobStatus::Bundled),
            8 => Some(JobStatus::Unbundled),
            _ => None,
        }
    }

    /// Active states charge their resource requests against the ledger.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Submitted | JobStatus::Queued | JobStatus::Running
        )
    }

    /// States a job can never leave without operator intervention.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Removed | JobStatus::Unknown
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Hold => "hold",
            JobStatus::Waiting => "waiting",
            JobStatus::Submitted => "submitted",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Unknown => "unknown",
            JobStatus::Removed => "removed",
            JobStatus::Bundled => "bundled",
            JobStatus::Unbundled => "unbundled",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Shell,
    Bundle,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Shell => "shell",
            JobKind::Bundle => "bundle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shell" => Some(JobKind::Shell),
            "bundle" => Some(JobKind::Bundle),
            _ => None,
        }
    }
}

/// Payload of a job: a literal script for shell jobs, an ordered list of
/// member job ids for bundles.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Script(String),
    RunOrder(Vec<i64>),
}

impl JobPayload {
    /// Encoding stored in the `script_or_runorder` column. Run orders are a
    /// comma-separated id list.
    pub fn encode(&self) -> String {
        match self {
            JobPayload::Script(s) => s.clone(),
            JobPayload::RunOrder(ids) => ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    pub fn decode(kind: JobKind, raw: &str) -> Option<Self> {
        match kind {
            JobKind::Shell => Some(JobPayload::Script(raw.to_string())),
            JobKind::Bundle => {
                if raw.is_empty() {
                    return Some(JobPayload::RunOrder(Vec::new()));
                }
                let ids: std::result::Result<Vec<i64>, _> =
                    raw.split(',').map(|t| t.trim().parse()).collect();
                ids.ok().map(JobPayload::RunOrder)
            }
        }
    }
}

/// A job row together with its resource-requirement map.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: i64,
    pub kind: JobKind,
    pub name: String,
    pub queue_name: Option<String>,
    pub account: Option<String>,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub backend_id: Option<i64>,
    pub t_submit: Option<f64>,
    pub use_walltime: Option<f64>,
    pub return_code: Option<i32>,
    pub bundle_id: Option<i64>,
    /// (resource name, requested quantity), ordered by resource id.
    pub resources: Vec<(String, f64)>,
}

impl Job {
    pub fn script(&self) -> Option<&str> {
        match &self.payload {
            JobPayload::Script(s) => Some(s),
            JobPayload::RunOrder(_) => None,
        }
    }

    pub fn runorder(&self) -> Option<&[i64]> {
        match &self.payload {
            JobPayload::Script(_) => None,
            JobPayload::RunOrder(ids) => Some(ids),
        }
    }

    fn requested(&self, resource: &str) -> Option<f64> {
        self.resources
            .iter()
            .find(|(name, _)| name == resource)
            .map(|(_, q)| *q)
    }

    /// Requested wall time in seconds, falling back to the default.
    pub fn walltime_request(&self) -> f64 {
        self.requested(WALLTIME_RESOURCE).unwrap_or(DEFAULT_WALLTIME)
    }

    /// Requested core count, falling back to the default.
    pub fn cores_request(&self) -> f64 {
        self.requested(CORES_RESOURCE).unwrap_or(DEFAULT_CORES)
    }
}

/// Everything needed to create a new job record.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub kind: JobKind,
    pub name: String,
    pub queue_name: Option<String>,
    pub account: Option<String>,
    pub payload: JobPayload,
    pub resources: Vec<(String, f64)>,
}

impl JobSpec {
    pub fn shell(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            kind: JobKind::Shell,
            name: name.into(),
            queue_name: None,
            account: None,
            payload: JobPayload::Script(script.into()),
            resources: Vec::new(),
        }
    }

    pub fn bundle(name: impl Into<String>, runorder: Vec<i64>) -> Self {
        Self {
            kind: JobKind::Bundle,
            name: name.into(),
            queue_name: None,
            account: None,
            payload: JobPayload::RunOrder(runorder),
            resources: Vec::new(),
        }
    }

    pub fn queue(mut self, q: impl Into<String>) -> Self {
        self.queue_name = Some(q.into());
        self
    }

    pub fn account(mut self, acct: impl Into<String>) -> Self {
        self.account = Some(acct.into());
        self
    }

    pub fn resource(mut self, name: impl Into<String>, quantity: f64) -> Self {
        self.resources.push((name.into(), quantity));
        self
    }
}

/// A named, quantity-limited capacity tracked by the ledger.
#[derive(Debug, Clone)]
pub struct Resource {
    pub resource_id: i64,
    pub name: String,
    pub descrip: String,
    pub available: f64,
}
