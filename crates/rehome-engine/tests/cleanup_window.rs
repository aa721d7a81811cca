mod common;

use chrono::{Duration, Utc};
use common::Harness;
use rehome_engine::cleanup::{CleanupPipeline, CleanupSettings};
use rehome_remote::memory::Fault;
use rehome_types::{ExecutionId, ExecutionStatus, FileRecord, RecordId, ReorgStatus};

fn reorganized(h: &Harness, id: &str, age: Duration, destination: Option<&str>) {
    let source = format!("/legacy/{id}.pdf");
    h.origin.insert_file(&source, b"payload".to_vec());
    insert_reorganized(h, id, &source, age, destination);
}

fn insert_reorganized(h: &Harness, id: &str, source: &str, age: Duration, destination: Option<&str>) {
    let mut record = FileRecord::pending(id, source, format!("{id}.pdf"));
    record.reorg.status = ReorgStatus::Success;
    record.reorg.destination_path = destination.map(str::to_string);
    record.reorg.completed_at = Some(Utc::now() - age);
    record.reorg.job_execution_id = Some(ExecutionId::generate());
    record.reorg.attempts = 1;
    h.store.insert_records(&[record]).unwrap();
}

fn deleted(h: &Harness, id: &str) -> bool {
    h.store
        .get_record(&RecordId::new(id))
        .unwrap()
        .unwrap()
        .cleanup
        .deleted_from_source
}

fn pipeline(h: &Harness) -> CleanupPipeline {
    pipeline_under(h, None)
}

fn pipeline_under(h: &Harness, origin_base: Option<&str>) -> CleanupPipeline {
    CleanupPipeline::new(
        std::sync::Arc::clone(&h.store),
        h.origin_pool(),
        origin_base.map(str::to_string),
        CleanupSettings {
            chunk_size: 2,
            workers: 2,
            ..CleanupSettings::default()
        },
    )
}

#[tokio::test]
async fn only_records_inside_the_safety_window_are_deleted() {
    let h = Harness::new();
    reorganized(&h, "recent", Duration::days(89), Some("/organized/re/ce/nt/recent.pdf"));
    reorganized(&h, "stale", Duration::days(91), Some("/organized/st/al/e/stale.pdf"));
    reorganized(&h, "unmoved", Duration::days(1), None);

    let report = pipeline(&h).run(Utc::now()).await;

    assert_eq!(report.status(), ExecutionStatus::Completed);
    assert_eq!(report.counts.written, 1);
    assert!(deleted(&h, "recent"));
    assert!(!h.origin.contains("/legacy/recent.pdf"));
    assert!(!deleted(&h, "stale"));
    assert!(h.origin.contains("/legacy/stale.pdf"));
    assert!(!deleted(&h, "unmoved"));
    assert!(h.origin.contains("/legacy/unmoved.pdf"));
}

#[tokio::test]
async fn already_missing_origin_file_counts_as_deleted() {
    let h = Harness::new();
    reorganized(&h, "gone", Duration::days(2), Some("/organized/go/ne/gone.pdf"));
    h.origin_pool().remove("/legacy/gone.pdf").unwrap();

    let report = pipeline(&h).run(Utc::now()).await;
    assert_eq!(report.counts.written, 1);
    assert_eq!(report.counts.failed, 0);
    assert!(deleted(&h, "gone"));
}

#[tokio::test]
async fn failed_deletion_is_retried_by_the_next_run() {
    let h = Harness::new();
    for id in ["aa", "bb", "cc"] {
        reorganized(&h, id, Duration::days(3), Some(&format!("/organized/{id}/{id}.pdf")));
    }
    h.origin.inject("/legacy/bb.pdf", Fault::PermissionDenied, 1);

    let first = pipeline(&h).run(Utc::now()).await;
    assert_eq!(first.status(), ExecutionStatus::CompletedWithSkips);
    assert_eq!((first.counts.written, first.counts.failed), (2, 1));
    assert!(!deleted(&h, "bb"));
    assert!(h.origin.contains("/legacy/bb.pdf"));

    let second = pipeline(&h).run(Utc::now()).await;
    assert_eq!(second.counts.read, 1);
    assert_eq!(second.counts.written, 1);
    assert!(deleted(&h, "bb"));
}

#[tokio::test]
async fn pages_cover_every_candidate() {
    let h = Harness::new();
    for i in 0..7 {
        let id = format!("rec{i}");
        reorganized(&h, &id, Duration::days(10), Some(&format!("/organized/{id}.pdf")));
    }
    let report = pipeline(&h).run(Utc::now()).await;
    assert_eq!(report.counts.read, 7);
    assert_eq!(report.counts.written, 7);
    assert_eq!(h.origin.file_count(), 0);
}

#[tokio::test]
async fn relative_source_is_deleted_under_origin_base() {
    let h = Harness::new();
    h.origin.insert_file("/legacy/2021/rel.pdf", b"payload".to_vec());
    h.origin.insert_file("/elsewhere/2021/rel.pdf", b"keep me".to_vec());
    insert_reorganized(&h, "rel", "2021/rel.pdf", Duration::days(5), Some("/organized/re/l/rel.pdf"));
    h.origin.insert_file("/legacy/abs.pdf", b"payload".to_vec());
    insert_reorganized(&h, "abs", "/legacy/abs.pdf", Duration::days(5), Some("/organized/ab/s/abs.pdf"));

    let report = pipeline_under(&h, Some("/legacy/")).run(Utc::now()).await;

    assert_eq!(report.counts.written, 2);
    assert!(deleted(&h, "rel"));
    assert!(!h.origin.contains("/legacy/2021/rel.pdf"));
    assert!(h.origin.contains("/elsewhere/2021/rel.pdf"));
    assert!(deleted(&h, "abs"));
    assert!(!h.origin.contains("/legacy/abs.pdf"));
}
