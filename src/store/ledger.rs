//! Admission control against the resource ledger.
//!
//! Resources are charged only by jobs in the active states (`submitted`,
//! `queued`, `running`); `waiting`, `done` and `bundled` jobs hold nothing.
//! The admission pass is greedy and order-sensitive: each candidate sees the
//! headroom left by candidates admitted earlier in the same pass.

use std::collections::HashMap;

use rusqlite::params;

use crate::error::Result;
use crate::store::JobStore;

/// Order in which waiting jobs are considered for submission. A policy
/// choice, not a correctness property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmitOrder {
    /// Oldest first (arrival order).
    Fifo,
    /// Newest first (reverse arrival order).
    #[default]
    Lifo,
}

impl JobStore {
    /// Total quantity and the amount charged by active jobs for one resource.
    pub fn check_use(&self, resource_id: i64) -> Result<(f64, f64)> {
        let available: f64 = self.conn().query_row(
            "SELECT available FROM resources WHERE resource_id = ?1",
            params![resource_id],
            |r| r.get(0),
        )?;
        let used: f64 = self.conn().query_row(
            "SELECT TOTAL(ru.quantity) FROM resource_use ru
             JOIN jobs j ON j.job_id = ru.job_id
             WHERE ru.resource_id = ?1 AND j.status BETWEEN 1 AND 3",
            params![resource_id],
            |r| r.get(0),
        )?;
        Ok((available, used))
    }

    /// Greedy admission pass: up to `max_candidates` waiting jobs, considered
    /// in `order`, admitting each only if every resource it requires still has
    /// `available >= used + requested` once earlier admissions in this pass
    /// are counted. Non-admitted candidates stay `waiting` for the next cycle.
    pub fn possible_submissions(
        &mut self,
        max_candidates: usize,
        order: SubmitOrder,
    ) -> Result<Vec<i64>> {
        let candidates = self.list_waiting(max_candidates, order)?;
        let mut tally: HashMap<i64, (f64, f64)> = HashMap::new();
        let mut admitted = Vec::new();

        for job_id in candidates {
            let requests = self.job_resources(job_id)?;
            let mut fits = true;
            for &(rid, quantity) in &requests {
                let entry = match tally.get(&rid) {
                    Some(&e) => e,
                    None => {
                        let e = self.check_use(rid)?;
                        tally.insert(rid, e);
                        e
                    }
                };
                if entry.0 < entry.1 + quantity {
                    fits = false;
                    break;
                }
            }
            if !fits {
                continue;
            }
            for &(rid, quantity) in &requests {
                if let Some(entry) = tally.get_mut(&rid) {
                    entry.1 += quantity;
                }
            }
            admitted.push(job_id);
        }
        Ok(admitted)
    }
}
