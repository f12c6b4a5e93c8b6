use batchq::error::BatchqError;
use batchq::store::records::{JobKind, JobSpec, JobStatus, CORES_RESOURCE, WALLTIME_RESOURCE};
use batchq::store::{JobStore, SubmitOrder};

fn spec(name: &str, script: &str) -> JobSpec {
    JobSpec::shell(name, script)
        .resource(WALLTIME_RESOURCE, 300.0)
        .resource(CORES_RESOURCE, 1.0)
}

#[test]
fn create_then_get_round_trips_the_spec() {
    let mut store = JobStore::open_in_memory().unwrap();

    let input = JobSpec::shell("analysis", "echo run\nsleep 1\n")
        .queue("batch")
        .account("physics")
        .resource(WALLTIME_RESOURCE, 600.0)
        .resource(CORES_RESOURCE, 2.0);
    let id = store.create_job(&input).unwrap();

    let job = store.get_job(id).unwrap();
    assert_eq!(job.job_id, id);
    assert_eq!(job.kind, JobKind::Shell);
    assert_eq!(job.name, "analysis");
    assert_eq!(job.queue_name.as_deref(), Some("batch"));
    assert_eq!(job.account.as_deref(), Some("physics"));
    assert_eq!(job.script(), Some("echo run\nsleep 1\n"));
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(
        job.resources,
        vec![
            (WALLTIME_RESOURCE.to_string(), 600.0),
            (CORES_RESOURCE.to_string(), 2.0)
        ]
    );
    assert!(job.backend_id.is_none());
    assert!(job.t_submit.is_none());
    assert!(job.return_code.is_none());
}

#[test]
fn set_status_is_idempotent() {
    let mut store = JobStore::open_in_memory().unwrap();
    let id = store.create_job(&spec("t", "true")).unwrap();

    store
        .set_status(id, JobStatus::Done, Some(3), Some(42.5))
        .unwrap();
    let first = store.get_job(id).unwrap();

    store
        .set_status(id, JobStatus::Done, Some(3), Some(42.5))
        .unwrap();
    let second = store.get_job(id).unwrap();

    assert_eq!(first.status, second.status);
    assert_eq!(first.return_code, second.return_code);
    assert_eq!(first.use_walltime, second.use_walltime);
    assert_eq!(second.return_code, Some(3));
    assert_eq!(second.use_walltime, Some(42.5));
}

#[test]
fn set_status_keeps_unspecified_fields() {
    let mut store = JobStore::open_in_memory().unwrap();
    let id = store.create_job(&spec("t", "true")).unwrap();

    store
        .set_status(id, JobStatus::Done, Some(2), Some(10.0))
        .unwrap();
    store.set_status(id, JobStatus::Removed, None, None).unwrap();

    let job = store.get_job(id).unwrap();
    assert_eq!(job.status, JobStatus::Removed);
    assert_eq!(job.return_code, Some(2));
    assert_eq!(job.use_walltime, Some(10.0));
}

#[test]
fn missing_jobs_report_not_found() {
    let mut store = JobStore::open_in_memory().unwrap();
    assert!(matches!(
        store.get_job(99),
        Err(BatchqError::JobNotFound(99))
    ));
    assert!(matches!(
        store.set_status(99, JobStatus::Done, None, None),
        Err(BatchqError::JobNotFound(99))
    ));
    assert!(matches!(
        store.delete_job(99),
        Err(BatchqError::JobNotFound(99))
    ));
}

#[test]
fn delete_job_cascades_resource_use() {
    let mut store = JobStore::open_in_memory().unwrap();
    let id = store.create_job(&spec("t", "true")).unwrap();
    assert_eq!(store.job_resources(id).unwrap().len(), 2);

    store.delete_job(id).unwrap();
    assert!(store.get_job(id).is_err());
    assert!(store.job_resources(id).unwrap().is_empty());
}

#[test]
fn list_waiting_orders_by_arrival() {
    let mut store = JobStore::open_in_memory().unwrap();
    let ids: Vec<i64> = (0..5)
        .map(|i| store.create_job(&spec("t", &format!("echo {}", i))).unwrap())
        .collect();

    let fifo = store.list_waiting(10, SubmitOrder::Fifo).unwrap();
    assert_eq!(fifo, ids);

    let lifo = store.list_waiting(10, SubmitOrder::Lifo).unwrap();
    let mut reversed = ids.clone();
    reversed.reverse();
    assert_eq!(lifo, reversed);

    let limited = store.list_waiting(2, SubmitOrder::Fifo).unwrap();
    assert_eq!(limited, &ids[..2]);
}

#[test]
fn record_submission_requires_waiting() {
    let mut store = JobStore::open_in_memory().unwrap();
    let id = store.create_job(&spec("t", "true")).unwrap();

    assert!(store.record_submission(id, 777).unwrap());
    let job = store.get_job(id).unwrap();
    assert_eq!(job.status, JobStatus::Submitted);
    assert_eq!(job.backend_id, Some(777));
    assert!(job.t_submit.is_some());

    // Second attempt finds the job no longer waiting.
    assert!(!store.record_submission(id, 888).unwrap());
    assert_eq!(store.get_job(id).unwrap().backend_id, Some(777));
}

#[test]
fn clear_completed_drops_done_and_removed_only() {
    let mut store = JobStore::open_in_memory().unwrap();
    let a = store.create_job(&spec("t", "a")).unwrap();
    let b = store.create_job(&spec("t", "b")).unwrap();
    let c = store.create_job(&spec("t", "c")).unwrap();
    let d = store.create_job(&spec("t", "d")).unwrap();

    store.set_status(a, JobStatus::Done, Some(0), None).unwrap();
    store.set_status(b, JobStatus::Removed, None, None).unwrap();
    store.set_status(c, JobStatus::Running, None, None).unwrap();

    let cleared = store.clear_completed().unwrap();
    assert_eq!(cleared, vec![a, b]);
    assert!(store.get_job(a).is_err());
    assert!(store.get_job(b).is_err());
    assert!(store.get_job(c).is_ok());
    assert!(store.get_job(d).is_ok());
}

#[test]
fn hold_and_release_cycle_waiting_jobs() {
    let mut store = JobStore::open_in_memory().unwrap();
    let a = store.create_job(&spec("t", "a")).unwrap();
    let b = store.create_job(&spec("t", "b")).unwrap();
    store.set_status(b, JobStatus::Running, None, None).unwrap();

    assert_eq!(store.hold_waiting().unwrap(), 1);
    assert_eq!(store.get_job(a).unwrap().status, JobStatus::Hold);
    assert_eq!(store.get_job(b).unwrap().status, JobStatus::Running);

    assert_eq!(store.release_held().unwrap(), 1);
    assert_eq!(store.get_job(a).unwrap().status, JobStatus::Waiting);
}

#[test]
fn release_unbundled_returns_jobs_to_waiting() {
    let mut store = JobStore::open_in_memory().unwrap();
    let a = store.create_job(&spec("t", "a")).unwrap();
    store
        .set_status(a, JobStatus::Unbundled, None, None)
        .unwrap();

    assert_eq!(store.release_unbundled().unwrap(), 1);
    assert_eq!(store.get_job(a).unwrap().status, JobStatus::Waiting);
}

#[test]
fn create_bundle_absorbs_members_once() {
    let mut store = JobStore::open_in_memory().unwrap();
    let a = store.create_job(&spec("t", "a")).unwrap();
    let b = store.create_job(&spec("t", "b")).unwrap();

    let bundle_spec = JobSpec::bundle("bundle", vec![a, b])
        .resource(WALLTIME_RESOURCE, 600.0)
        .resource(CORES_RESOURCE, 1.0);
    let bundle_id = store.create_bundle(&bundle_spec, &[a, b]).unwrap();

    let bundle = store.get_job(bundle_id).unwrap();
    assert_eq!(bundle.kind, JobKind::Bundle);
    assert_eq!(bundle.runorder(), Some(&[a, b][..]));
    assert_eq!(bundle.status, JobStatus::Waiting);

    for member in [a, b] {
        let job = store.get_job(member).unwrap();
        assert_eq!(job.status, JobStatus::Bundled);
        assert_eq!(job.bundle_id, Some(bundle_id));
    }

    // A bundled member cannot join a second bundle.
    let second = JobSpec::bundle("bundle", vec![a]);
    assert!(matches!(
        store.create_bundle(&second, &[a]),
        Err(BatchqError::NotBundleable(id)) if id == a
    ));
}

#[test]
fn status_counts_cover_all_jobs() {
    let mut store = JobStore::open_in_memory().unwrap();
    for _ in 0..3 {
        store.create_job(&spec("t", "true")).unwrap();
    }
    let id = store.create_job(&spec("t", "true")).unwrap();
    store.set_status(id, JobStatus::Done, Some(0), None).unwrap();

    let counts = store.status_counts().unwrap();
    assert_eq!(counts, vec![(JobStatus::Waiting, 3), (JobStatus::Done, 1)]);
}
