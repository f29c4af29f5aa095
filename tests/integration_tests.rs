//! End-to-end tests driving scans through the registry

use duplicate_scanner::{
    hash::HashEngine,
    models::*,
    progress::{DeliveryError, EventSink, ScanEvent},
    store::JsonFileStore,
    Config, HashAlgorithm, Result, ScanError, ScanRegistry,
};
use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::{timeout, Duration};

/// Helper function to create test directory structure
fn create_test_directory_structure(temp_dir: &TempDir, files: &[(&str, &[u8])]) -> std::io::Result<()> {
    for (path, content) in files {
        let full_path = temp_dir.path().join(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(full_path)?;
        file.write_all(content)?;
    }
    Ok(())
}

/// Start a scan and wait for it to settle
async fn run_scan(registry: &ScanRegistry, config: ScanConfig) -> Result<(ScanId, ScanState)> {
    let scan_id = registry.start(config).await?;
    let scan = registry.get(scan_id).await?;
    let state = timeout(Duration::from_secs(30), scan.join())
        .await
        .map_err(|_| ScanError::StructuralFailure("scan did not finish in time".into()))?;
    Ok((scan_id, state))
}

/// Sink that fails on every delivery
struct ClosedConnection {
    attempts: AtomicUsize,
}

impl EventSink for ClosedConnection {
    fn deliver(&self, _payload: &str) -> std::result::Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(DeliveryError("broken pipe".into()))
    }
}

#[tokio::test]
async fn test_end_to_end_duplicate_detection() {
    let temp_dir = TempDir::new().unwrap();
    create_test_directory_structure(
        &temp_dir,
        &[
            ("A.txt", b"Hello, World!"),
            ("nested/B.txt", b"Hello, World!"),
            ("C.txt", b"Different content"),
            (".hidden/D.txt", b"Hello, World!"),
            ("empty.txt", b""),
        ],
    )
    .unwrap();

    let registry = ScanRegistry::new(Config::default()).unwrap();
    let (scan_id, state) = run_scan(&registry, ScanConfig::new([temp_dir.path()]).name("e2e")).await.unwrap();
    assert_eq!(state, ScanState::Completed);

    let scan = registry.get(scan_id).await.unwrap();
    let groups = scan.duplicate_groups().unwrap();
    assert_eq!(groups.len(), 1);

    let group = &groups[0];
    assert_eq!(group.file_count, 2);
    assert_eq!(group.space_wasted, "Hello, World!".len() as u64);
    assert_eq!(group.confidence_score, 100);
    let mut names: Vec<&str> = group.files.iter().map(|f| f.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["A.txt", "B.txt"]);

    // Every member carries each default digest
    for file in &group.files {
        assert!(file.hashes.contains_key(&HashAlgorithm::Blake3));
        assert!(file.hashes.contains_key(&HashAlgorithm::Xxhash64));
    }

    let status = scan.status();
    assert_eq!(status.name, "e2e");
    assert_eq!(status.progress.files_discovered, 3);
    assert_eq!(status.progress.files_processed, 3);
    assert_eq!(status.progress.files_failed, 0);
}

#[tokio::test]
async fn test_scan_events_reach_subscribers_in_order() {
    let temp_dir = TempDir::new().unwrap();
    let files: Vec<(String, Vec<u8>)> = (0..25)
        .map(|i| (format!("file{}.bin", i), vec![(i % 5) as u8 + 1; 128]))
        .collect();
    let borrowed: Vec<(&str, &[u8])> = files.iter().map(|(p, c)| (p.as_str(), c.as_slice())).collect();
    create_test_directory_structure(&temp_dir, &borrowed).unwrap();

    let config = Config {
        progress_interval: 5,
        ..Config::default()
    };
    let registry = ScanRegistry::new(config).unwrap();
    let (_, mut events) = registry.hub().subscribe_channel();

    let (scan_id, state) = run_scan(&registry, ScanConfig::new([temp_dir.path()])).await.unwrap();
    assert_eq!(state, ScanState::Completed);

    let mut received = Vec::new();
    while let Ok(payload) = events.try_recv() {
        received.push(serde_json::from_str::<ScanEvent>(&payload).unwrap());
    }

    assert!(matches!(received.first(), Some(ScanEvent::Connected { .. })));
    assert!(matches!(received.get(1), Some(ScanEvent::ScanStarted { scan_id: id, .. }) if *id == scan_id));
    match received.last() {
        Some(ScanEvent::ScanCompleted {
            files_processed,
            duplicate_groups,
            space_wasted,
            ..
        }) => {
            assert_eq!(*files_processed, 25);
            assert_eq!(*duplicate_groups, 5);
            assert_eq!(*space_wasted, 5 * 4 * 128);
        }
        other => panic!("expected scan_completed last, got {:?}", other),
    }

    // Progress snapshots are monotonic
    let processed: Vec<u64> = received
        .iter()
        .filter_map(|event| match event {
            ScanEvent::ScanProgress { progress, .. } => Some(progress.files_processed),
            _ => None,
        })
        .collect();
    assert!(processed.windows(2).all(|w| w[0] <= w[1]));
    assert!(processed.contains(&25));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancellation_produces_no_groups() {
    let temp_dir = TempDir::new().unwrap();
    let content = vec![42u8; 512];
    let files: Vec<String> = (0..150).map(|i| format!("copy{:03}.dat", i)).collect();
    let borrowed: Vec<(&str, &[u8])> = files.iter().map(|p| (p.as_str(), content.as_slice())).collect();
    create_test_directory_structure(&temp_dir, &borrowed).unwrap();

    let config = Config {
        workers: 1,
        chunk_size: 1,
        progress_interval: 1,
        ..Config::default()
    };
    let registry = ScanRegistry::new(config).unwrap();
    let (_, mut events) = registry.hub().subscribe_channel();
    let scan_id = registry.start(ScanConfig::new([temp_dir.path()])).await.unwrap();

    // Cancel once some files have been hashed
    timeout(Duration::from_secs(30), async {
        while let Some(payload) = events.recv().await {
            if let Ok(ScanEvent::ScanProgress { progress, .. }) = serde_json::from_str(&payload) {
                if progress.files_processed >= 3 {
                    break;
                }
            }
        }
    })
    .await
    .unwrap();
    assert!(registry.cancel(scan_id).await.unwrap());

    let scan = registry.get(scan_id).await.unwrap();
    assert_eq!(scan.join().await, ScanState::Cancelled);

    let progress = scan.progress();
    assert!(progress.files_processed >= 3);
    assert!(progress.files_processed < 150);
    assert!(scan.duplicate_groups().is_none());
    assert!(!registry.cancel(scan_id).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_scans_share_a_small_pool() {
    let temp_dir = TempDir::new().unwrap();
    create_test_directory_structure(
        &temp_dir,
        &[
            ("x1", &[1u8; 4096]),
            ("x2", &[1u8; 4096]),
            ("y1", &[2u8; 4096]),
            ("y2", &[2u8; 4096]),
            ("z", &[3u8; 4096]),
        ],
    )
    .unwrap();

    // Eight scans compete for two permits
    let config = Config {
        workers: 2,
        chunk_size: 512,
        ..Config::default()
    };
    let registry = Arc::new(ScanRegistry::new(config).unwrap());

    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(registry.start(ScanConfig::new([temp_dir.path()])).await.unwrap());
    }

    for id in ids {
        let scan = registry.get(id).await.unwrap();
        let state = timeout(Duration::from_secs(60), scan.join()).await.unwrap();
        assert_eq!(state, ScanState::Completed);
        assert_eq!(scan.duplicate_groups().unwrap().len(), 2);
    }
}

#[tokio::test]
async fn test_broken_subscriber_is_dropped_after_one_failure() {
    let temp_dir = TempDir::new().unwrap();
    create_test_directory_structure(&temp_dir, &[("a", b"1"), ("b", b"1")]).unwrap();

    let registry = ScanRegistry::new(Config::default()).unwrap();
    let hub = registry.hub();
    let broken = Arc::new(ClosedConnection { attempts: AtomicUsize::new(0) });
    hub.subscribe(broken.clone());
    let (_, mut healthy) = hub.subscribe_channel();

    run_scan(&registry, ScanConfig::new([temp_dir.path()])).await.unwrap();

    assert_eq!(broken.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(hub.subscriber_count(), 1);

    let mut count = 0;
    while healthy.try_recv().is_ok() {
        count += 1;
    }
    // connected, scan_started, discovery progress, scan_completed
    assert!(count >= 4);
}

#[tokio::test]
async fn test_unresolvable_roots_fail_and_bad_config_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let registry = ScanRegistry::new(Config::default()).unwrap();

    let (scan_id, state) = run_scan(&registry, ScanConfig::new([temp_dir.path().join("nope")]))
        .await
        .unwrap();
    assert_eq!(state, ScanState::Failed);
    let status = registry.get(scan_id).await.unwrap().status();
    assert!(status.error.is_some());

    let err = registry
        .start(ScanConfig::new([temp_dir.path()]).chunk_size(0))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_fallback_algorithm_still_groups() {
    use duplicate_scanner::hash::AlgorithmCapabilities;

    let temp_dir = TempDir::new().unwrap();
    create_test_directory_structure(&temp_dir, &[("a", b"same bytes"), ("b", b"same bytes")]).unwrap();

    let capabilities = AlgorithmCapabilities::detect()
        .without(HashAlgorithm::Blake3)
        .without(HashAlgorithm::Xxhash64);
    let engine = Arc::new(HashEngine::with_capabilities(1024, 2, capabilities));
    let registry = ScanRegistry::with_engine(Config::default(), engine);

    let (scan_id, state) = run_scan(&registry, ScanConfig::new([temp_dir.path()])).await.unwrap();
    assert_eq!(state, ScanState::Completed);

    let groups = registry.get(scan_id).await.unwrap().duplicate_groups().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].algorithm, HashAlgorithm::Sha256);
}

#[tokio::test]
async fn test_shutdown_settles_scans_and_persists_results() {
    let temp_dir = TempDir::new().unwrap();
    create_test_directory_structure(&temp_dir, &[("a", b"dup"), ("b", b"dup")]).unwrap();
    let results_dir = TempDir::new().unwrap();
    let store = Arc::new(JsonFileStore::new(results_dir.path()).unwrap());

    let registry = ScanRegistry::new(Config::default()).unwrap().with_store(store.clone());
    let (completed_id, _) = run_scan(&registry, ScanConfig::new([temp_dir.path()])).await.unwrap();
    let pending_id = registry.start(ScanConfig::new([temp_dir.path()])).await.unwrap();

    timeout(Duration::from_secs(30), registry.shutdown()).await.unwrap();

    for id in [completed_id, pending_id] {
        assert!(registry.get(id).await.unwrap().state().is_terminal());
    }
    assert!(store.load(completed_id).is_ok());
    assert!(registry.engine().is_stopped());
    assert!(matches!(
        registry.engine().hash_file(&temp_dir.path().join("a"), &[HashAlgorithm::Md5]).await,
        Err(ScanError::EngineStopped)
    ));
}

#[tokio::test]
async fn test_files_modified_before_epoch_are_reported_and_persisted() {
    use duplicate_scanner::report::{OutputFormat, ReportGenerator};
    use std::time::{SystemTime, UNIX_EPOCH};

    let temp_dir = TempDir::new().unwrap();
    create_test_directory_structure(&temp_dir, &[("old1.bin", b"vintage"), ("old2.bin", b"vintage")]).unwrap();
    let before_epoch = UNIX_EPOCH - Duration::from_secs(86_400);
    for name in ["old1.bin", "old2.bin"] {
        let file = fs::File::options().write(true).open(temp_dir.path().join(name)).unwrap();
        file.set_modified(before_epoch).unwrap();
    }

    let results_dir = TempDir::new().unwrap();
    let store = Arc::new(JsonFileStore::new(results_dir.path()).unwrap());
    let registry = ScanRegistry::new(Config::default()).unwrap().with_store(store.clone());

    let (scan_id, state) = run_scan(&registry, ScanConfig::new([temp_dir.path()])).await.unwrap();
    assert_eq!(state, ScanState::Completed);

    let scan = registry.get(scan_id).await.unwrap();
    let groups = scan.duplicate_groups().unwrap();
    assert_eq!(groups.len(), 1);

    let value = serde_json::to_value(&groups).unwrap();
    assert_eq!(value[0]["files"][0]["modified_time"], -86_400);

    let stored = store.load(scan_id).unwrap();
    assert_eq!(stored.duplicate_groups.len(), 1);
    assert!(stored.duplicate_groups[0]
        .files
        .iter()
        .all(|file| file.modified_time < SystemTime::UNIX_EPOCH));

    let report = scan.report().unwrap();
    assert!(ReportGenerator::new().generate(&report, OutputFormat::Json).is_ok());
}
