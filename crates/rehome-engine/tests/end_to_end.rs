mod common;

use std::collections::BTreeMap;

use common::{cleanup_enabled, Harness};
use rehome_engine::result::{CLEANUP_STAGE, REORGANIZE_STAGE};
use rehome_remote::memory::Fault;
use rehome_types::{ExecutionStatus, RecordId, ReorgStatus};

fn seed_three(h: &Harness) {
    h.seed("a1b2c3d4e5f6", "/legacy/2021/report.pdf", "report.pdf", b"quarterly numbers");
    h.seed("ffee00112233", "/legacy/2021/invoice.xml", "invoice.xml", b"<invoice/>");
    h.seed("0a0b0c0d0e0f", "/legacy/2022/scan.tif", "scan.tif", &[7u8; 300]);
}

#[tokio::test]
async fn three_files_are_reorganized_and_audited() {
    let h = Harness::new();
    seed_three(&h);
    h.origin.inject("/legacy/2021/invoice.xml", Fault::ConnectionReset, 2);

    let report = h
        .orchestrator(|_| {})
        .run(None, BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(
        h.destination.read_file("/organized/a1/b2/c3/report.pdf").unwrap(),
        b"quarterly numbers"
    );
    assert!(h.destination.contains("/organized/ff/ee/00/invoice.xml"));
    assert_eq!(h.destination.read_file("/organized/0a/0b/0c/scan.tif").unwrap().len(), 300);

    let retried = h.store.get_record(&RecordId::new("ffee00112233")).unwrap().unwrap();
    assert_eq!(retried.reorg.status, ReorgStatus::Success);
    assert_eq!(retried.reorg.attempts, 3);
    assert_eq!(retried.reorg.job_execution_id, Some(report.execution_id));
    assert_eq!(
        retried.reorg.destination_path.as_deref(),
        Some("/organized/ff/ee/00/invoice.xml")
    );

    let audit = h.store.find_audit(&report.execution_id).unwrap().unwrap();
    assert_eq!(audit.status, ExecutionStatus::Completed);
    assert_eq!(audit.exit_code.as_deref(), Some("COMPLETED"));
    assert_eq!(audit.counters.files_processed, 3);
    assert_eq!(audit.counters.files_reorganized, 3);
    assert_eq!(audit.counters.files_skipped, 0);
    assert!(audit.files_per_second.unwrap() > 0.0);
    assert!(audit.end_time.is_some());
    assert!(audit.error_description.is_none());

    let step = audit.step(REORGANIZE_STAGE).unwrap();
    assert_eq!(
        (step.read_count, step.write_count, step.skip_count),
        (3, 3, 0)
    );
    assert!(audit.step(CLEANUP_STAGE).is_none());
}

#[tokio::test]
async fn cleanup_deletes_reorganized_origin_files() {
    let h = Harness::new();
    seed_three(&h);

    let report = h
        .orchestrator(cleanup_enabled)
        .run(None, BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(h.origin.file_count(), 0);
    assert_eq!(h.destination.file_count(), 3);
    assert_eq!(report.audit.counters.files_deleted, 3);
    assert_eq!(report.audit.counters.files_deletion_failed, 0);
    assert_eq!(report.audit.steps.len(), 2);

    let record = h.store.get_record(&RecordId::new("a1b2c3d4e5f6")).unwrap().unwrap();
    assert!(record.cleanup.deleted_from_source);
    assert_eq!(record.cleanup.deleted_by.as_deref(), Some("cleanup-step"));
    assert!(record.cleanup.deleted_at.is_some());
}

#[tokio::test]
async fn relative_sources_resolve_under_origin_base_for_both_stages() {
    let h = Harness::new();
    h.seed("a1b2c3d4e5f6", "2021/report.pdf", "report.pdf", b"quarterly numbers");
    h.origin.insert_file("/legacy/2021/report.pdf", b"quarterly numbers".to_vec());

    let report = h
        .orchestrator(|ctx| {
            ctx.origin_base = Some("/legacy".into());
            cleanup_enabled(ctx);
        })
        .run(None, BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert!(h.destination.contains("/organized/a1/b2/c3/report.pdf"));
    assert!(!h.origin.contains("/legacy/2021/report.pdf"));
    assert!(h.origin.contains("2021/report.pdf"));
    let record = h.store.get_record(&RecordId::new("a1b2c3d4e5f6")).unwrap().unwrap();
    assert!(record.cleanup.deleted_from_source);
}

#[tokio::test]
async fn failed_reorganization_skips_cleanup() {
    let h = Harness::new();
    seed_three(&h);
    let orchestrator = h.orchestrator(cleanup_enabled);
    orchestrator.context().destination.close();

    let report = orchestrator.run(None, BTreeMap::new()).await.unwrap();

    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(report.audit.steps.len(), 1);
    assert_eq!(h.origin.file_count(), 3);
    assert_eq!(report.audit.counters.files_deleted, 0);
}

#[tokio::test]
async fn transient_exhaustion_completes_with_skips() {
    let h = Harness::new();
    seed_three(&h);
    h.origin.inject("/legacy/2022/scan.tif", Fault::Timeout, 10);

    let report = h
        .orchestrator(|_| {})
        .run(None, BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(report.status, ExecutionStatus::CompletedWithSkips);
    assert_eq!(report.audit.exit_code.as_deref(), Some("COMPLETED"));
    assert_eq!(report.audit.counters.files_skipped, 1);
    assert_eq!(report.audit.counters.files_reorganized, 2);

    let skipped = h.store.get_record(&RecordId::new("0a0b0c0d0e0f")).unwrap().unwrap();
    assert_eq!(skipped.reorg.status, ReorgStatus::Failed);
    assert_eq!(skipped.reorg.attempts, 3);
    assert!(skipped.reorg.last_error.is_some());
}
