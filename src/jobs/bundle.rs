//! Bin-packing bundler: groups many short shell jobs into one schedulable
//! bundle under a wall-time ceiling and a parallelism width.

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use crate::error::Result;
use crate::store::records::{JobSpec, CORES_RESOURCE, WALLTIME_RESOURCE};
use crate::store::JobStore;

/// Slot load ordered by value; f64 has no total order of its own.
#[derive(Debug, PartialEq)]
struct Slot(f64);

impl Eq for Slot {}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result of one packing pass: member ids in execution order plus the final
/// per-slot loads.
#[derive(Debug, Clone)]
pub struct LinearOrder {
    pub runorder: Vec<i64>,
    pub slot_loads: Vec<f64>,
}

impl LinearOrder {
    /// Wall time the bundle must request: the heaviest slot.
    pub fn max_load(&self) -> f64 {
        self.slot_loads.iter().cloned().fold(0.0, f64::max)
    }
}

/// Longest-fits-first packing over `candidates`, which must be sorted
/// ascending by duration. Maintains a min-heap of `slots` load values;
/// repeatedly fills the currently-emptiest slot with the largest remaining
/// duration that still fits under `tmax`, stopping when nothing fits.
///
/// Among equal durations the last entry of the sorted input is taken;
/// candidate lists sorted by (duration, job id) therefore pack highest id
/// first within a tie. Deterministic for identical input.
pub fn linear_order(candidates: &[(f64, i64)], slots: u32, tmax: f64) -> LinearOrder {
    let mut remaining: Vec<(f64, i64)> = candidates.to_vec();
    let mut heap: BinaryHeap<Reverse<Slot>> =
        (0..slots.max(1)).map(|_| Reverse(Slot(0.0))).collect();
    let mut runorder = Vec::new();

    while let Some(Reverse(Slot(load))) = heap.pop() {
        let budget = tmax - load;
        let idx = remaining.partition_point(|&(d, _)| d <= budget);
        if idx == 0 {
            heap.push(Reverse(Slot(load)));
            break;
        }
        let (duration, job_id) = remaining.remove(idx - 1);
        runorder.push(job_id);
        heap.push(Reverse(Slot(load + duration)));
    }

    let slot_loads = heap.into_iter().map(|Reverse(Slot(v))| v).collect();
    LinearOrder {
        runorder,
        slot_loads,
    }
}

/// Bundle every eligible short job: select `waiting`/`unbundled` shell jobs
/// with a wall-time request below `tmax`, pack them with [`linear_order`]
/// until no bundle of at least two members can be formed, and upload each
/// bundle with its members marked `bundled`.
///
/// Returns the created bundle ids.
pub fn rebundle(
    store: &mut JobStore,
    tmax: f64,
    slots: u32,
    queue: Option<&str>,
    account: Option<&str>,
) -> Result<Vec<i64>> {
    let mut remaining = store.bundle_candidates(tmax)?;
    let mut bundle_ids = Vec::new();

    loop {
        let packed = linear_order(&remaining, slots, tmax);
        if packed.runorder.len() < 2 {
            break;
        }

        let cores = packed.runorder.len().min(slots.max(1) as usize) as f64;
        let mut spec = JobSpec::bundle("bundle", packed.runorder.clone())
            .resource(WALLTIME_RESOURCE, packed.max_load())
            .resource(CORES_RESOURCE, cores);
        if let Some(q) = queue {
            spec = spec.queue(q);
        }
        if let Some(a) = account {
            spec = spec.account(a);
        }

        let bundle_id = store.create_bundle(&spec, &packed.runorder)?;
        tracing::info!(
            bundle_id,
            members = packed.runorder.len(),
            walltime = packed.max_load(),
            cores,
            "Bundled jobs"
        );

        let chosen: HashSet<i64> = packed.runorder.iter().copied().collect();
        remaining.retain(|(_, id)| !chosen.contains(id));
        bundle_ids.push(bundle_id);
    }

    Ok(bundle_ids)
}
