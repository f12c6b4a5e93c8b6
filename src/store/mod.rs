//! Durable record of jobs, resources and resource reservations.
//!
//! The store is the sole source of truth: the bundler and scheduler only ever
//! hold transient views fetched per cycle. Every multi-statement mutation runs
//! inside one transaction, so a failed write leaves prior state untouched.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{BatchqError, Result};

pub mod ledger;
pub mod records;

pub use ledger::SubmitOrder;

use records::{Job, JobKind, JobPayload, JobSpec, JobStatus, Resource, WALLTIME_RESOURCE};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    job_id               INTEGER PRIMARY KEY,
    jtype                TEXT NOT NULL DEFAULT 'shell',
    name                 TEXT NOT NULL,
    queue_name           TEXT,
    account              TEXT,
    script_or_runorder   TEXT NOT NULL,
    status               INTEGER NOT NULL DEFAULT 0,
    backend_id           INTEGER,
    t_submit             REAL,
    use_walltime         REAL,
    return_code          INTEGER,
    associated_bundle_id INTEGER REFERENCES jobs(job_id) ON DELETE SET NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_backend ON jobs(backend_id);

CREATE TABLE IF NOT EXISTS resources (
    resource_id INTEGER PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    descrip     TEXT NOT NULL DEFAULT '',
    available   REAL NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS resource_use (
    job_id      INTEGER NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
    resource_id INTEGER NOT NULL REFERENCES resources(resource_id),
    quantity    REAL NOT NULL,
    PRIMARY KEY (job_id, resource_id)
);
";

/// One normalized status observation to be written back after a polling pass.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub job_id: i64,
    pub status: JobStatus,
    pub return_code: Option<i32>,
    pub walltime: Option<f64>,
}

/// Outcome of bundle reconciliation for one member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemberOutcome {
    Done { return_code: i32, walltime: f64 },
    Unbundled,
}

pub struct JobStore {
    conn: Connection,
    // Resource ids by name, owned by this handle rather than process-global so
    // independent store connections never share stale entries.
    resource_ids: HashMap<String, i64>,
}

impl JobStore {
    /// Open (creating if necessary) the jobs database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        // journal_mode reports the resulting mode as a row, so query it.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        conn.busy_timeout(std::time::Duration::from_secs(60))?;
        Self::init(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        let mut store = Self {
            conn,
            resource_ids: HashMap::new(),
        };
        // The two well-known resources always exist; wall time is effectively
        // unlimited until an operator resizes it.
        store.get_or_create_resource(WALLTIME_RESOURCE, "run wall time [s]", 1e9)?;
        store.get_or_create_resource(records::CORES_RESOURCE, "number of cores", 1.0)?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // ------------------------------------------------------------------
    // jobs
    // ------------------------------------------------------------------

    /// Insert a new job record in `waiting` and book its resource requests.
    pub fn create_job(&mut self, spec: &JobSpec) -> Result<i64> {
        let tx = self.conn.transaction()?;
        let job_id = insert_job(&tx, &mut self.resource_ids, spec, JobStatus::Waiting)?;
        tx.commit()?;
        Ok(job_id)
    }

    /// Insert a bundle record and absorb `members` into it: each member moves
    /// to `bundled` and gains a back-reference, all in one transaction.
    pub fn create_bundle(&mut self, spec: &JobSpec, members: &[i64]) -> Result<i64> {
        let tx = self.conn.transaction()?;
        let bundle_id = insert_job(&tx, &mut self.resource_ids, spec, JobStatus::Waiting)?;
        for &member in members {
            let n = tx.execute(
                "UPDATE jobs SET status = ?1, associated_bundle_id = ?2
                 WHERE job_id = ?3 AND status IN (?4, ?5) AND associated_bundle_id IS NULL",
                params![
                    JobStatus::Bundled.code(),
                    bundle_id,
                    member,
                    JobStatus::Waiting.code(),
                    JobStatus::Unbundled.code()
                ],
            )?;
            if n == 0 {
                return Err(BatchqError::NotBundleable(member));
            }
        }
        tx.commit()?;
        Ok(bundle_id)
    }

    /// Fetch a job row with its resource-requirement map.
    pub fn get_job(&self, job_id: i64) -> Result<Job> {
        let row = self
            .conn
            .query_row(
                "SELECT jtype, name, queue_name, account, script_or_runorder, status,
                        backend_id, t_submit, use_walltime, return_code, associated_bundle_id
                 FROM jobs WHERE job_id = ?1",
                params![job_id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        r.get::<_, Option<String>>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, i64>(5)?,
                        r.get::<_, Option<i64>>(6)?,
                        r.get::<_, Option<f64>>(7)?,
                        r.get::<_, Option<f64>>(8)?,
                        r.get::<_, Option<i32>>(9)?,
                        r.get::<_, Option<i64>>(10)?,
                    ))
                },
            )
            .optional()?;

        let (jtype, name, queue_name, account, raw, code, backend_id, t_submit, use_walltime,
            return_code, bundle_id) = row.ok_or(BatchqError::JobNotFound(job_id))?;

        let kind = JobKind::parse(&jtype)
            .ok_or_else(|| BatchqError::MalformedRecord(job_id, format!("jtype '{}'", jtype)))?;
        let payload = JobPayload::decode(kind, &raw)
            .ok_or_else(|| BatchqError::MalformedRecord(job_id, "unreadable runorder".into()))?;
        let status = JobStatus::from_code(code)
            .ok_or_else(|| BatchqError::MalformedRecord(job_id, format!("status {}", code)))?;

        let mut stmt = self.conn.prepare(
            "SELECT r.name, ru.quantity FROM resource_use ru
             JOIN resources r ON r.resource_id = ru.resource_id
             WHERE ru.job_id = ?1 ORDER BY ru.resource_id",
        )?;
        let resources = stmt
            .query_map(params![job_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<std::result::Result<Vec<(String, f64)>, _>>()?;

        Ok(Job {
            job_id,
            kind,
            name,
            queue_name,
            account,
            payload,
            status,
            backend_id,
            t_submit,
            use_walltime,
            return_code,
            bundle_id,
            resources,
        })
    }

    /// Set job status information. Fields passed as `None` keep their stored
    /// values; repeating a call with identical arguments is a no-op.
    pub fn set_status(
        &mut self,
        job_id: i64,
        status: JobStatus,
        return_code: Option<i32>,
        walltime: Option<f64>,
    ) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE jobs SET status = ?2,
                    return_code = COALESCE(?3, return_code),
                    use_walltime = COALESCE(?4, use_walltime)
             WHERE job_id = ?1",
            params![job_id, status.code(), return_code, walltime],
        )?;
        if n == 0 {
            return Err(BatchqError::JobNotFound(job_id));
        }
        Ok(())
    }

    /// Record a successful backend submission. Guarded on the job still being
    /// `waiting` so a concurrent store user cannot be silently overwritten;
    /// returns whether the record was updated.
    pub fn record_submission(&mut self, job_id: i64, backend_id: i64) -> Result<bool> {
        let now = chrono::Utc::now().timestamp() as f64;
        let n = self.conn.execute(
            "UPDATE jobs SET status = ?2, backend_id = ?3, t_submit = ?4
             WHERE job_id = ?1 AND status = ?5",
            params![
                job_id,
                JobStatus::Submitted.code(),
                backend_id,
                now,
                JobStatus::Waiting.code()
            ],
        )?;
        Ok(n > 0)
    }

    pub fn delete_job(&mut self, job_id: i64) -> Result<()> {
        let n = self
            .conn
            .execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])?;
        if n == 0 {
            return Err(BatchqError::JobNotFound(job_id));
        }
        Ok(())
    }

    /// Ids of `waiting` jobs in arrival (FIFO) or reverse-arrival (LIFO) order.
    pub fn list_waiting(&self, limit: usize, order: SubmitOrder) -> Result<Vec<i64>> {
        let sql = match order {
            SubmitOrder::Fifo => {
                "SELECT job_id FROM jobs WHERE status = 0 ORDER BY job_id LIMIT ?1"
            }
            SubmitOrder::Lifo => {
                "SELECT job_id FROM jobs WHERE status = 0 ORDER BY job_id DESC LIMIT ?1"
            }
        };
        let mut stmt = self.conn.prepare(sql)?;
        let ids = stmt
            .query_map(params![limit as i64], |r| r.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// All jobs currently in any of `states`.
    pub fn jobs_in(&self, states: &[JobStatus]) -> Result<Vec<Job>> {
        let codes: Vec<String> = states.iter().map(|s| s.code().to_string()).collect();
        let sql = format!(
            "SELECT job_id FROM jobs WHERE status IN ({}) ORDER BY job_id",
            codes.join(",")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map([], |r| r.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        drop(stmt);
        ids.into_iter().map(|id| self.get_job(id)).collect()
    }

    pub fn count_in(&self, states: &[JobStatus]) -> Result<i64> {
        let codes: Vec<String> = states.iter().map(|s| s.code().to_string()).collect();
        let sql = format!(
            "SELECT COUNT(*) FROM jobs WHERE status IN ({})",
            codes.join(",")
        );
        Ok(self.conn.query_row(&sql, [], |r| r.get(0))?)
    }

    /// Job counts grouped by status, for the operator summary.
    pub fn status_counts(&self) -> Result<Vec<(JobStatus, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(code, n)| JobStatus::from_code(code).map(|s| (s, n)))
            .collect())
    }

    /// Apply one polling pass worth of status observations atomically.
    pub fn apply_status_updates(&mut self, updates: &[StatusUpdate]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for u in updates {
            tx.execute(
                "UPDATE jobs SET status = ?2,
                        return_code = COALESCE(?3, return_code),
                        use_walltime = COALESCE(?4, use_walltime)
                 WHERE job_id = ?1",
                params![u.job_id, u.status.code(), u.return_code, u.walltime],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Apply bundle reconciliation atomically: every member is detached from
    /// the bundle and moved to its outcome state; the bundle row is deleted
    /// only when every member was accounted for.
    pub fn apply_reconciliation(
        &mut self,
        bundle_id: i64,
        outcomes: &[(i64, MemberOutcome)],
        delete_bundle: bool,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        for &(member, outcome) in outcomes {
            match outcome {
                MemberOutcome::Done {
                    return_code,
                    walltime,
                } => {
                    tx.execute(
                        "UPDATE jobs SET status = ?2, return_code = ?3, use_walltime = ?4,
                                associated_bundle_id = NULL
                         WHERE job_id = ?1",
                        params![member, JobStatus::Done.code(), return_code, walltime],
                    )?;
                }
                MemberOutcome::Unbundled => {
                    tx.execute(
                        "UPDATE jobs SET status = ?2, associated_bundle_id = NULL
                         WHERE job_id = ?1",
                        params![member, JobStatus::Unbundled.code()],
                    )?;
                }
            }
        }
        if delete_bundle {
            tx.execute("DELETE FROM jobs WHERE job_id = ?1", params![bundle_id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop `done` and `removed` job records; returns the ids removed so the
    /// caller can clean up their job directories.
    pub fn clear_completed(&mut self) -> Result<Vec<i64>> {
        let tx = self.conn.transaction()?;
        let ids = {
            let mut stmt =
                tx.prepare("SELECT job_id FROM jobs WHERE status IN (?1, ?2) ORDER BY job_id")?;
            let rows = stmt
                .query_map(
                    params![JobStatus::Done.code(), JobStatus::Removed.code()],
                    |r| r.get(0),
                )?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            rows
        };
        tx.execute(
            "DELETE FROM jobs WHERE status IN (?1, ?2)",
            params![JobStatus::Done.code(), JobStatus::Removed.code()],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    /// Operator action: park all `waiting` jobs in `hold`.
    pub fn hold_waiting(&mut self) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE jobs SET status = ?1 WHERE status = ?2",
            params![JobStatus::Hold.code(), JobStatus::Waiting.code()],
        )?)
    }

    /// Operator action: return held jobs to `waiting`.
    pub fn release_held(&mut self) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE jobs SET status = ?1 WHERE status = ?2",
            params![JobStatus::Waiting.code(), JobStatus::Hold.code()],
        )?)
    }

    /// Mark everything still `waiting` as `removed` (bulk cancellation).
    pub fn remove_waiting(&mut self) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE jobs SET status = ?1 WHERE status = ?2",
            params![JobStatus::Removed.code(), JobStatus::Waiting.code()],
        )?)
    }

    /// Return `unbundled` jobs to `waiting` for individual resubmission.
    pub fn release_unbundled(&mut self) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE jobs SET status = ?1 WHERE status = ?2",
            params![JobStatus::Waiting.code(), JobStatus::Unbundled.code()],
        )?)
    }

    // ------------------------------------------------------------------
    // resources
    // ------------------------------------------------------------------

    /// Find a named resource, consulting this handle's cache first.
    pub fn find_resource(&mut self, name: &str) -> Result<Option<i64>> {
        if let Some(&id) = self.resource_ids.get(name) {
            return Ok(Some(id));
        }
        let id = self
            .conn
            .query_row(
                "SELECT resource_id FROM resources WHERE name = ?1",
                params![name],
                |r| r.get::<_, i64>(0),
            )
            .optional()?;
        if let Some(id) = id {
            self.resource_ids.insert(name.to_string(), id);
        }
        Ok(id)
    }

    pub fn get_or_create_resource(
        &mut self,
        name: &str,
        descrip: &str,
        available: f64,
    ) -> Result<i64> {
        get_or_create_resource_on(&self.conn, &mut self.resource_ids, name, descrip, available)
    }

    /// Administrative resize of a resource's total quantity.
    pub fn set_resource_limit(&mut self, resource_id: i64, available: f64) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE resources SET available = ?2 WHERE resource_id = ?1",
            params![resource_id, available],
        )?;
        if n == 0 {
            return Err(BatchqError::ResourceNotFound(format!("id {}", resource_id)));
        }
        Ok(())
    }

    pub fn resources(&self) -> Result<Vec<Resource>> {
        let mut stmt = self
            .conn
            .prepare("SELECT resource_id, name, descrip, available FROM resources ORDER BY resource_id")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(Resource {
                    resource_id: r.get(0)?,
                    name: r.get(1)?,
                    descrip: r.get(2)?,
                    available: r.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// (resource id, quantity) pairs requested by a job.
    pub fn job_resources(&self, job_id: i64) -> Result<Vec<(i64, f64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT resource_id, quantity FROM resource_use WHERE job_id = ?1 ORDER BY resource_id",
        )?;
        let rows = stmt
            .query_map(params![job_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Shell jobs eligible for bundling under the wall-time ceiling `tmax`:
    /// `waiting`/`unbundled`, not already in a bundle, requested wall time
    /// strictly below `tmax`. Sorted ascending by (duration, job id).
    pub fn bundle_candidates(&mut self, tmax: f64) -> Result<Vec<(f64, i64)>> {
        let walltime_id =
            self.get_or_create_resource(WALLTIME_RESOURCE, "run wall time [s]", 1e9)?;
        let mut stmt = self.conn.prepare(
            "SELECT ru.quantity, j.job_id FROM jobs j
             JOIN resource_use ru ON ru.job_id = j.job_id
             WHERE ru.resource_id = ?1 AND j.jtype = 'shell'
               AND j.status IN (?2, ?3) AND j.associated_bundle_id IS NULL
               AND ru.quantity < ?4
             ORDER BY ru.quantity, j.job_id",
        )?;
        let rows = stmt
            .query_map(
                params![
                    walltime_id,
                    JobStatus::Waiting.code(),
                    JobStatus::Unbundled.code(),
                    tmax
                ],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn get_or_create_resource_on(
    conn: &Connection,
    cache: &mut HashMap<String, i64>,
    name: &str,
    descrip: &str,
    available: f64,
) -> Result<i64> {
    if let Some(&id) = cache.get(name) {
        return Ok(id);
    }
    let found = conn
        .query_row(
            "SELECT resource_id FROM resources WHERE name = ?1",
            params![name],
            |r| r.get::<_, i64>(0),
        )
        .optional()?;
    let id = match found {
        Some(id) => id,
        None => {
            conn.execute(
                "INSERT INTO resources(name, descrip, available) VALUES (?1, ?2, ?3)",
                params![name, descrip, available],
            )?;
            conn.last_insert_rowid()
        }
    };
    cache.insert(name.to_string(), id);
    Ok(id)
}

fn insert_job(
    conn: &Connection,
    cache: &mut HashMap<String, i64>,
    spec: &JobSpec,
    status: JobStatus,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO jobs(jtype, name, queue_name, account, script_or_runorder, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            spec.kind.as_str(),
            spec.name,
            spec.queue_name,
            spec.account,
            spec.payload.encode(),
            status.code()
        ],
    )?;
    let job_id = conn.last_insert_rowid();
    for (name, quantity) in &spec.resources {
        let rid = get_or_create_resource_on(conn, cache, name, name, 1.0)?;
        conn.execute(
            "INSERT INTO resource_use(job_id, resource_id, quantity) VALUES (?1, ?2, ?3)",
            params![job_id, rid, quantity],
        )?;
    }
    Ok(job_id)
}
