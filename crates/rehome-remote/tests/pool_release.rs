use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rehome_remote::memory::{Fault, MemoryFileSystem};
use rehome_remote::{PoolConfig, RemoteError, SessionPool};

fn pool(fs: &MemoryFileSystem, max_size: usize) -> SessionPool {
    SessionPool::new(
        Arc::new(fs.factory("origin")),
        PoolConfig {
            max_size,
            acquire_timeout: Duration::from_millis(200),
            buffer_size: 8,
        },
    )
}

#[derive(Debug)]
struct BodyFailed;

impl From<RemoteError> for BodyFailed {
    fn from(_: RemoteError) -> Self {
        Self
    }
}

#[test]
fn failing_bodies_never_leak_sessions() {
    let fs = MemoryFileSystem::new();
    fs.insert_file("/in/report.pdf", vec![7; 64]);
    let pool = pool(&fs, 3);
    let before = pool.stats().available;

    for _ in 0..10 {
        let result: Result<(), BodyFailed> = pool.with_read_session("/in/report.pdf", |reader| {
            let mut half = [0u8; 16];
            reader.read_exact(&mut half).map_err(|_| BodyFailed)?;
            Err(BodyFailed)
        });
        assert!(result.is_err());
        assert_eq!(pool.stats().available, before);
        assert_eq!(pool.stats().in_use, 0);
    }
    assert_eq!(fs.finalize_count(), 10);
}

#[test]
fn panicking_body_still_releases() {
    let fs = MemoryFileSystem::new();
    fs.insert_file("/in/a", vec![1, 2, 3]);
    let pool = pool(&fs, 1);

    let worker = {
        let pool = pool.clone();
        thread::spawn(move || {
            let _: Result<(), RemoteError> = pool.with_read_session("/in/a", |_| panic!("boom"));
        })
    };
    assert!(worker.join().is_err());
    assert_eq!(pool.stats().in_use, 0);
    assert!(pool.open_read("/in/a").is_ok());
}

#[test]
fn missing_file_releases_session() {
    let fs = MemoryFileSystem::new();
    let pool = pool(&fs, 1);
    for _ in 0..3 {
        let err = pool.open_read("/nope").unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)));
    }
    assert_eq!(pool.stats().in_use, 0);
    assert_eq!(fs.connect_count(), 1);
}

#[test]
fn concurrent_transfers_stay_within_pool_bounds() {
    let origin = MemoryFileSystem::new();
    let dest = MemoryFileSystem::new();
    for i in 0..20 {
        origin.insert_file(&format!("/in/{i}.bin"), vec![i as u8; 100]);
    }
    origin.inject("/in/3.bin", Fault::ConnectionReset, 1);

    let origin_pool = pool(&origin, 2);
    let dest_pool = SessionPool::new(
        Arc::new(dest.factory("destination")),
        PoolConfig {
            max_size: 2,
            acquire_timeout: Duration::from_secs(5),
            buffer_size: 16,
        },
    );

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let origin_pool = origin_pool.clone();
            let dest_pool = dest_pool.clone();
            thread::spawn(move || -> Result<u64, RemoteError> {
                let src = format!("/in/{i}.bin");
                let dst = format!("/out/{:02}/{i}.bin", i % 4);
                let mut last = None;
                for _ in 0..20 {
                    match origin_pool.open_read(&src) {
                        Ok(mut reader) => {
                            let n = dest_pool.write_from(&dst, &mut reader)?;
                            reader.close()?;
                            return Ok(n);
                        }
                        Err(e) if e.is_transient() => {
                            last = Some(e);
                            thread::sleep(Duration::from_millis(5));
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(last.expect("loop ran at least once"))
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap().unwrap(), 100);
    }
    assert_eq!(dest.file_count(), 20);
    assert!(origin.connect_count() <= 3);
    assert_eq!(origin_pool.stats().in_use, 0);
    assert_eq!(dest_pool.stats().in_use, 0);
    assert_eq!(origin.live_sessions(), origin_pool.stats().idle);
}
