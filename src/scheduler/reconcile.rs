//! Bundle completion reconciliation.
//!
//! A finished bundle's log holds one completion line per member that ran to
//! its exit marker. Members with a line are settled `done` with their logged
//! return code and elapsed time; members without become `unbundled` and are
//! detached so they can be re-bundled or resubmitted. The bundle record is
//! deleted only once every member is accounted for.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::jobs::dir::{JobDir, COMPLETION_TAG};
use crate::store::records::JobKind;
use crate::store::{JobStore, MemberOutcome};

/// One parsed completion line from a bundle log.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRecord {
    pub job_id: i64,
    pub return_code: i32,
    pub t_start: f64,
    pub elapsed: f64,
}

/// Parse a wrapper completion line:
/// `#batchq job <id> ret <code> start <epoch> elapsed <seconds>`.
pub fn parse_completion_line(line: &str) -> Option<CompletionRecord> {
    let rest = line.trim().strip_prefix(COMPLETION_TAG)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() != 8
        || fields[0] != "job"
        || fields[2] != "ret"
        || fields[4] != "start"
        || fields[6] != "elapsed"
    {
        return None;
    }
    Some(CompletionRecord {
        job_id: fields[1].parse().ok()?,
        return_code: fields[3].parse().ok()?,
        t_start: fields[5].parse().ok()?,
        elapsed: fields[7].parse().ok()?,
    })
}

/// Reconcile one terminal bundle, recursively reconciling members that are
/// themselves bundles.
pub fn reconcile_bundle(store: &mut JobStore, jobs_dir: &Path, bundle_id: i64) -> Result<()> {
    let bundle = store.get_job(bundle_id)?;
    let members: Vec<i64> = bundle.runorder().unwrap_or(&[]).to_vec();
    if members.is_empty() {
        store.apply_reconciliation(bundle_id, &[], true)?;
        return Ok(());
    }

    let dir = JobDir::new(jobs_dir, bundle_id);
    let mut records: HashMap<i64, CompletionRecord> = HashMap::new();
    match fs::read_to_string(dir.log_path()) {
        Ok(log) => {
            for line in log.lines() {
                if let Some(record) = parse_completion_line(line) {
                    records.insert(record.job_id, record);
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut outcomes = Vec::with_capacity(members.len());
    let mut matched = 0usize;
    for &member in &members {
        match records.get(&member) {
            Some(record) => {
                matched += 1;
                outcomes.push((
                    member,
                    MemberOutcome::Done {
                        return_code: record.return_code,
                        walltime: record.elapsed,
                    },
                ));
            }
            None => outcomes.push((member, MemberOutcome::Unbundled)),
        }
    }

    let fully_reconciled = matched == members.len();
    store.apply_reconciliation(bundle_id, &outcomes, fully_reconciled)?;
    tracing::info!(
        bundle_id,
        members = members.len(),
        reconciled = matched,
        deleted = fully_reconciled,
        "Bundle reconciled"
    );

    for &member in &members {
        if records.contains_key(&member) && store.get_job(member)?.kind == JobKind::Bundle {
            reconcile_bundle(store, jobs_dir, member)?;
        }
    }
    Ok(())
}
