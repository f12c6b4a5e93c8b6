use batchq::store::records::{JobSpec, JobStatus, CORES_RESOURCE, WALLTIME_RESOURCE};
use batchq::store::{JobStore, SubmitOrder};

fn store_with_cores(limit: f64) -> JobStore {
    let mut store = JobStore::open_in_memory().unwrap();
    let rid = store
        .get_or_create_resource(CORES_RESOURCE, "number of cores", limit)
        .unwrap();
    store.set_resource_limit(rid, limit).unwrap();
    store
}

fn core_job(store: &mut JobStore, cores: f64) -> i64 {
    let spec = JobSpec::shell("t", "true")
        .resource(WALLTIME_RESOURCE, 300.0)
        .resource(CORES_RESOURCE, cores);
    store.create_job(&spec).unwrap()
}

#[test]
fn check_use_charges_only_active_jobs() {
    let mut store = store_with_cores(8.0);
    let rid = store.get_or_create_resource(CORES_RESOURCE, "", 8.0).unwrap();

    let waiting = core_job(&mut store, 1.0);
    let submitted = core_job(&mut store, 2.0);
    let queued = core_job(&mut store, 3.0);
    let running = core_job(&mut store, 1.0);
    let done = core_job(&mut store, 2.0);
    let bundled = core_job(&mut store, 2.0);

    store
        .set_status(submitted, JobStatus::Submitted, None, None)
        .unwrap();
    store.set_status(queued, JobStatus::Queued, None, None).unwrap();
    store
        .set_status(running, JobStatus::Running, None, None)
        .unwrap();
    store.set_status(done, JobStatus::Done, Some(0), None).unwrap();
    store
        .set_status(bundled, JobStatus::Bundled, None, None)
        .unwrap();

    let (available, used) = store.check_use(rid).unwrap();
    assert_eq!(available, 8.0);
    // submitted + queued + running; waiting/done/bundled charge nothing.
    assert_eq!(used, 6.0);
    let _ = waiting;
}

#[test]
fn admission_respects_the_cores_limit() {
    let mut store = store_with_cores(4.0);
    for _ in 0..10 {
        core_job(&mut store, 1.0);
    }

    let admitted = store
        .possible_submissions(1_000_000, SubmitOrder::Fifo)
        .unwrap();
    assert_eq!(admitted.len(), 4);

    for &id in &admitted {
        store
            .set_status(id, JobStatus::Submitted, None, None)
            .unwrap();
    }

    // Fully booked: nothing further is admitted.
    let second = store
        .possible_submissions(1_000_000, SubmitOrder::Fifo)
        .unwrap();
    assert!(second.is_empty());

    // Completions free the headroom again.
    for &id in &admitted {
        store.set_status(id, JobStatus::Done, Some(0), None).unwrap();
    }
    let third = store
        .possible_submissions(1_000_000, SubmitOrder::Fifo)
        .unwrap();
    assert_eq!(third.len(), 4);
}

#[test]
fn admission_sees_earlier_candidates_in_the_same_pass() {
    let mut store = store_with_cores(4.0);
    let big_a = core_job(&mut store, 3.0);
    let big_b = core_job(&mut store, 3.0);
    let small = core_job(&mut store, 1.0);

    // 3 fits, the second 3 would need 6, the trailing 1 still fits.
    let admitted = store
        .possible_submissions(1_000_000, SubmitOrder::Fifo)
        .unwrap();
    assert_eq!(admitted, vec![big_a, small]);
    assert_eq!(store.get_job(big_b).unwrap().status, JobStatus::Waiting);
}

#[test]
fn oversize_requests_are_never_admitted() {
    let mut store = store_with_cores(4.0);
    let big = core_job(&mut store, 8.0);

    let admitted = store
        .possible_submissions(1_000_000, SubmitOrder::Fifo)
        .unwrap();
    assert!(admitted.is_empty());
    assert_eq!(store.get_job(big).unwrap().status, JobStatus::Waiting);
}

#[test]
fn admission_order_is_a_policy_choice() {
    let mut store = store_with_cores(2.0);
    let ids: Vec<i64> = (0..4).map(|_| core_job(&mut store, 1.0)).collect();

    let fifo = store
        .possible_submissions(1_000_000, SubmitOrder::Fifo)
        .unwrap();
    assert_eq!(fifo, vec![ids[0], ids[1]]);

    let lifo = store
        .possible_submissions(1_000_000, SubmitOrder::Lifo)
        .unwrap();
    assert_eq!(lifo, vec![ids[3], ids[2]]);
}

#[test]
fn every_required_resource_must_fit() {
    let mut store = store_with_cores(4.0);
    let walltime_rid = store
        .get_or_create_resource(WALLTIME_RESOURCE, "", 1e9)
        .unwrap();
    store.set_resource_limit(walltime_rid, 500.0).unwrap();

    // Fits cores but not wall time.
    let spec = JobSpec::shell("t", "true")
        .resource(WALLTIME_RESOURCE, 600.0)
        .resource(CORES_RESOURCE, 1.0);
    let blocked = store.create_job(&spec).unwrap();
    let ok = core_job(&mut store, 1.0);

    let admitted = store
        .possible_submissions(1_000_000, SubmitOrder::Fifo)
        .unwrap();
    assert_eq!(admitted, vec![ok]);
    assert_eq!(store.get_job(blocked).unwrap().status, JobStatus::Waiting);
}

#[test]
fn active_use_never_exceeds_availability() {
    let mut store = store_with_cores(4.0);
    let rid = store.get_or_create_resource(CORES_RESOURCE, "", 4.0).unwrap();
    for _ in 0..7 {
        core_job(&mut store, 2.0);
    }

    // Drain the queue pass by pass, checking the invariant after each.
    loop {
        let admitted = store
            .possible_submissions(1_000_000, SubmitOrder::Lifo)
            .unwrap();
        if admitted.is_empty() {
            break;
        }
        for &id in &admitted {
            store
                .set_status(id, JobStatus::Running, None, None)
                .unwrap();
        }
        let (available, used) = store.check_use(rid).unwrap();
        assert!(used <= available, "used {} exceeds available {}", used, available);

        for &id in &admitted {
            store.set_status(id, JobStatus::Done, Some(0), None).unwrap();
        }
    }
    assert_eq!(store.count_in(&[JobStatus::Waiting]).unwrap(), 0);
}
