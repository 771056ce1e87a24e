//! Integration tests: FlushEngine against real staging and data files.
//!
//! These tests run the full producer -> queue -> writer pool -> double-write
//! -> data file pipeline with the in-memory buffer pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;

use pageflush_core::page::{page_lsn, set_page_checksum, set_page_lsn, verify_page_checksum, PAGE_HEADER_SIZE};
use pageflush_core::staging::{read_staging_file, staging_path, APPLIED_BATCH};
use pageflush_core::{
    BlockNumber, BufferId, BufferPool, Collaborators, Config, FilePageStore, FlushEngine, FlushError, FlushResult,
    LogPosition, MemBufferPool, PageImage, PageStore, StagingBuffer,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PAGE: usize = 4096;

fn test_config() -> Config {
    let mut config = Config::small();
    config.writer_threads = 2;
    config.queue_capacity = 128;
    config.staging_pages = 4;
    config.round_interval = Duration::from_millis(20);
    config.poll_interval = Duration::from_millis(1);
    config
}

/// Config whose rounds never come due on their own.
fn idle_config() -> Config {
    let mut config = test_config();
    config.round_interval = Duration::from_secs(3600);
    config
}

/// Data file wrapper that records every block written.
struct RecordingStore {
    inner: FilePageStore,
    written: Mutex<Vec<BlockNumber>>,
}

impl RecordingStore {
    fn open(dir: &TempDir) -> Self {
        Self {
            inner: FilePageStore::open(dir.path().join("pages.db"), PAGE).unwrap(),
            written: Mutex::new(Vec::new()),
        }
    }

    fn written(&self) -> Vec<BlockNumber> {
        self.written.lock().clone()
    }
}

impl PageStore for RecordingStore {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn write_page(&self, block: BlockNumber, page: &[u8]) -> FlushResult<()> {
        self.written.lock().push(block);
        self.inner.write_page(block, page)
    }

    fn read_page(&self, block: BlockNumber, buf: &mut [u8]) -> FlushResult<bool> {
        self.inner.read_page(block, buf)
    }

    fn sync(&self) -> FlushResult<()> {
        self.inner.sync()
    }
}

/// Data file whose writes always fail.
struct FailingStore;

impl PageStore for FailingStore {
    fn page_size(&self) -> usize {
        PAGE
    }

    fn write_page(&self, _block: BlockNumber, _page: &[u8]) -> FlushResult<()> {
        Err(FlushError::Io {
            path: None,
            kind: std::io::ErrorKind::Other,
            message: "device went away".to_string(),
        })
    }

    fn read_page(&self, _block: BlockNumber, _buf: &mut [u8]) -> FlushResult<bool> {
        Ok(false)
    }

    fn sync(&self) -> FlushResult<()> {
        Ok(())
    }
}

/// Data file that checks, on every page write, that writer 0's staging
/// file already holds that page in an unapplied batch.
struct StagingCheckStore {
    inner: RecordingStore,
    staging_file: std::path::PathBuf,
    violations: Mutex<Vec<String>>,
}

impl PageStore for StagingCheckStore {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn write_page(&self, block: BlockNumber, page: &[u8]) -> FlushResult<()> {
        match read_staging_file(&self.staging_file) {
            Ok(Some(batch)) if batch.header.batch_index == APPLIED_BATCH => {
                self.violations.lock().push(format!("block {} written after its batch was applied", block));
            }
            Ok(Some(batch)) => {
                if !batch.pages.iter().any(|(b, data)| *b == block && data.as_slice() == page) {
                    self.violations.lock().push(format!("block {} missing from durable batch", block));
                }
            }
            Ok(None) => self.violations.lock().push(format!("block {} written before any batch", block)),
            Err(e) => self.violations.lock().push(format!("block {}: {}", block, e)),
        }
        self.inner.write_page(block, page)
    }

    fn read_page(&self, block: BlockNumber, buf: &mut [u8]) -> FlushResult<bool> {
        self.inner.read_page(block, buf)
    }

    fn sync(&self) -> FlushResult<()> {
        self.inner.sync()
    }
}

/// Buffer pool whose first `read_page` holds the writer after copying the
/// page until the test lets it go.
struct GatedPool {
    inner: Arc<MemBufferPool>,
    entered: AtomicBool,
    release: AtomicBool,
}

impl GatedPool {
    fn new(inner: Arc<MemBufferPool>) -> Self {
        Self { inner, entered: AtomicBool::new(false), release: AtomicBool::new(false) }
    }

    fn wait_entered(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.entered.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl BufferPool for GatedPool {
    fn is_dirty(&self, buffer: BufferId) -> bool {
        self.inner.is_dirty(buffer)
    }

    fn read_page(&self, buffer: BufferId) -> Option<PageImage> {
        let image = self.inner.read_page(buffer);
        if !self.entered.swap(true, Ordering::SeqCst) {
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        image
    }

    fn clear_dirty(&self, buffer: BufferId) {
        self.inner.clear_dirty(buffer)
    }
}

fn start(
    config: Config,
    dir: &TempDir,
    pool: &Arc<MemBufferPool>,
    store: Arc<dyn PageStore>,
) -> FlushEngine {
    let collaborators = Collaborators::new(pool.clone(), pool.clone(), store);
    FlushEngine::start(config, dir.path().join("staging"), collaborators).unwrap()
}

/// Modify `buffer` (holding `block`) and queue it on a clean to dirty
/// transition, the way a buffer pool would.
fn touch(engine: &FlushEngine, pool: &MemBufferPool, buffer: u32, block: u32, lsn: u64) {
    if pool.write(BufferId(buffer), BlockNumber(block), LogPosition(lsn), format!("page {}", block).as_bytes()) {
        assert!(engine.mark_dirty(BufferId(buffer)));
    }
}

fn read_block(store: &dyn PageStore, block: u32) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; PAGE];
    store.read_page(BlockNumber(block), &mut buf).unwrap().then_some(buf)
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[test]
fn test_shutdown_drains_pending_entries() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(MemBufferPool::new(PAGE));
    let store = Arc::new(RecordingStore::open(&dir));
    let engine = start(idle_config(), &dir, &pool, store.clone());

    for i in 0..10 {
        touch(&engine, &pool, i, 200 + i, 1000 + i as u64);
    }
    assert_eq!(engine.stats().queue_depth, 10);
    assert_eq!(engine.stats().total_flushed, 0);

    engine.shutdown_drain().unwrap();

    let stats = engine.stats();
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.running_writers, 0);
    assert_eq!(stats.total_flushed, 10);
    assert_eq!(stats.head, 10);
    assert_eq!(engine.min_required_log_position(), None);

    // closed for good
    pool.write(BufferId(50), BlockNumber(50), LogPosition(1), b"late");
    assert!(!engine.mark_dirty(BufferId(50)));
    assert_eq!(engine.stats().tail, 10);

    for i in 0..10u32 {
        let page = read_block(store.as_ref(), 200 + i).unwrap();
        verify_page_checksum(&page, BlockNumber(200 + i)).unwrap();
        assert_eq!(page_lsn(&page), LogPosition(1000 + i as u64));
    }
}

#[test]
fn test_drop_drains() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(MemBufferPool::new(PAGE));
    let store = Arc::new(RecordingStore::open(&dir));
    {
        let engine = start(idle_config(), &dir, &pool, store.clone());
        for i in 0..5 {
            touch(&engine, &pool, i, i, 1);
        }
    }
    assert_eq!(store.written().len(), 5);
    assert_eq!(pool.dirty_count(), 0);
}

// ---------------------------------------------------------------------------
// Invalidation
// ---------------------------------------------------------------------------

#[test]
fn test_externally_cleaned_buffer_never_written() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(MemBufferPool::new(PAGE));
    let store = Arc::new(RecordingStore::open(&dir));
    let engine = start(idle_config(), &dir, &pool, store.clone());

    touch(&engine, &pool, 1, 11, 5);
    touch(&engine, &pool, 2, 12, 6);
    touch(&engine, &pool, 3, 13, 7);

    // evicted by the buffer pool without telling the engine
    assert!(pool.mark_clean(BufferId(2)));

    engine.shutdown_drain().unwrap();

    let written = store.written();
    assert!(written.contains(&BlockNumber(11)));
    assert!(written.contains(&BlockNumber(13)));
    assert!(!written.contains(&BlockNumber(12)));

    let stats = engine.stats();
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.retired, 3);
    assert_eq!(stats.invalidated, 1);
    assert!(read_block(store.as_ref(), 12).map_or(true, |p| p.iter().all(|&b| b == 0)));
}

#[test]
fn test_buffer_cleaned_notification() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(MemBufferPool::new(PAGE));
    let store = Arc::new(RecordingStore::open(&dir));
    let engine = start(idle_config(), &dir, &pool, store.clone());

    touch(&engine, &pool, 1, 1, 1);
    touch(&engine, &pool, 2, 2, 2);
    pool.mark_clean(BufferId(1));
    assert_eq!(engine.buffer_cleaned(BufferId(1)), 1);

    // head moved past the cancelled entry right away
    let stats = engine.stats();
    assert_eq!(stats.head, 1);
    assert_eq!(stats.queue_depth, 1);
    assert_eq!(engine.min_required_log_position(), Some(LogPosition(2)));

    engine.shutdown_drain().unwrap();
    assert_eq!(store.written(), vec![BlockNumber(2)]);
}

#[test]
fn test_cleaned_while_copied_keeps_newer_page() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(MemBufferPool::new(PAGE));
    let gated = Arc::new(GatedPool::new(pool.clone()));
    let store = Arc::new(RecordingStore::open(&dir));
    let mut config = idle_config();
    config.writer_threads = 1;
    let collaborators = Collaborators::new(gated.clone(), pool.clone(), store.clone());
    let engine = FlushEngine::start(config, dir.path().join("staging"), collaborators).unwrap();

    // the writer copies the image at LSN 10 and stalls before staging it
    touch(&engine, &pool, 1, 1, 10);
    engine.request_drain(0);
    assert!(gated.wait_entered(Duration::from_secs(10)));

    // modified again, then written out by another path at LSN 20
    touch(&engine, &pool, 1, 1, 20);
    let mut newer = pool.page(BufferId(1)).unwrap();
    set_page_checksum(&mut newer, BlockNumber(1));
    store.write_page(BlockNumber(1), &newer).unwrap();
    assert!(pool.mark_clean(BufferId(1)));
    assert_eq!(engine.buffer_cleaned(BufferId(1)), 2);
    assert_eq!(engine.min_required_log_position(), None);

    gated.release.store(true, Ordering::SeqCst);
    assert!(engine.wait_for_depth(0, Duration::from_secs(10)));
    engine.shutdown_drain().unwrap();

    let page = read_block(store.as_ref(), 1).unwrap();
    assert_eq!(page_lsn(&page), LogPosition(20));
    assert_eq!(page, newer);
    assert_eq!(store.written(), vec![BlockNumber(1)]);
    let stats = engine.stats();
    assert_eq!(stats.total_flushed, 0);
    assert_eq!(stats.invalidated, 2);
}

// ---------------------------------------------------------------------------
// Double-write ordering
// ---------------------------------------------------------------------------

#[test]
fn test_data_write_follows_durable_staging() {
    let dir = TempDir::new().unwrap();
    let staging_dir = dir.path().join("staging");
    let pool = Arc::new(MemBufferPool::new(PAGE));
    let store = Arc::new(StagingCheckStore {
        inner: RecordingStore::open(&dir),
        staging_file: staging_path(&staging_dir, 0),
        violations: Mutex::new(Vec::new()),
    });
    let mut config = idle_config();
    config.writer_threads = 1;
    let engine = start(config, &dir, &pool, store.clone());

    // batches of 4, 4 and a final partial 2
    for i in 0..10 {
        touch(&engine, &pool, i, 40 + i, 1 + i as u64);
    }
    engine.shutdown_drain().unwrap();

    assert_eq!(*store.violations.lock(), Vec::<String>::new());
    assert_eq!(store.inner.written().len(), 10);
    assert_eq!(engine.stats().batches, 3);

    // every batch was marked applied once its pages were synced
    let batch = read_staging_file(&staging_path(&staging_dir, 0)).unwrap().unwrap();
    assert_eq!(batch.header.batch_index, APPLIED_BATCH);
}

#[cfg(target_os = "linux")]
#[test]
fn test_staging_flush_failure_halts_before_data_write() {
    let full = std::path::Path::new("/dev/full");
    if !full.exists() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let staging_dir = dir.path().join("staging");
    std::fs::create_dir_all(&staging_dir).unwrap();
    // every staging write fails with "no space left on device"
    std::os::unix::fs::symlink(full, staging_path(&staging_dir, 0)).unwrap();

    let pool = Arc::new(MemBufferPool::new(PAGE));
    let store = Arc::new(RecordingStore::open(&dir));
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let mut config = idle_config();
    config.writer_threads = 1;
    let collaborators = Collaborators::new(pool.clone(), pool.clone(), store.clone()).on_fatal({
        let hook_calls = Arc::clone(&hook_calls);
        move |_| {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        }
    });
    let engine = FlushEngine::start(config, staging_dir, collaborators).unwrap();

    for i in 0..3 {
        touch(&engine, &pool, i, i, 1);
    }
    assert!(matches!(engine.shutdown_drain(), Err(FlushError::Halted { .. })));
    assert!(matches!(engine.fatal_error(), Some(FlushError::Io { .. })));
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);

    // nothing reached the data file, and the log is still held back
    assert!(store.written().is_empty());
    assert_eq!(engine.stats().total_flushed, 0);
    assert_eq!(engine.min_required_log_position(), Some(LogPosition(1)));
}

// ---------------------------------------------------------------------------
// Checkpointing
// ---------------------------------------------------------------------------

#[test]
fn test_min_log_position_advances_with_flushes() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(MemBufferPool::new(PAGE));
    let store = Arc::new(RecordingStore::open(&dir));
    let engine = start(idle_config(), &dir, &pool, store);

    touch(&engine, &pool, 1, 1, 100);
    touch(&engine, &pool, 2, 2, 200);
    assert_eq!(engine.min_required_log_position(), Some(LogPosition(100)));

    engine.request_drain(0);
    assert!(engine.wait_for_depth(0, Duration::from_secs(10)));
    assert_eq!(engine.min_required_log_position(), None);

    // modified again after its flush: queued again, holds the log at 300
    touch(&engine, &pool, 1, 1, 300);
    assert_eq!(engine.min_required_log_position(), Some(LogPosition(300)));
    engine.shutdown_drain().unwrap();
}

#[test]
fn test_rewritten_page_reaches_disk() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(MemBufferPool::new(PAGE));
    let store = Arc::new(RecordingStore::open(&dir));
    let engine = start(test_config(), &dir, &pool, store.clone());

    for lsn in 1..=20u64 {
        let newly_dirty = pool.modify(BufferId(9), BlockNumber(9), LogPosition(lsn), |page| {
            page[PAGE_HEADER_SIZE] = lsn as u8;
        });
        if newly_dirty {
            assert!(engine.mark_dirty(BufferId(9)));
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    engine.shutdown_drain().unwrap();

    let page = read_block(store.as_ref(), 9).unwrap();
    assert_eq!(page_lsn(&page), LogPosition(20));
    assert_eq!(page[PAGE_HEADER_SIZE], 20);
    verify_page_checksum(&page, BlockNumber(9)).unwrap();
}

#[test]
fn test_concurrent_producers() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(MemBufferPool::new(PAGE));
    let store = Arc::new(RecordingStore::open(&dir));
    let mut config = test_config();
    config.queue_capacity = 32;
    config.writer_threads = 3;
    let engine = Arc::new(start(config, &dir, &pool, store.clone()));

    let mut handles = vec![];
    for t in 0..4u32 {
        let engine = Arc::clone(&engine);
        let pool = Arc::clone(&pool);
        handles.push(std::thread::spawn(move || {
            for i in 0..200u32 {
                let id = t * 1000 + i;
                assert!(pool.write(BufferId(id), BlockNumber(id), LogPosition(id as u64 + 1), b"data"));
                engine.push_with_backpressure(BufferId(id), Duration::from_secs(30)).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    engine.shutdown_drain().unwrap();
    let stats = engine.stats();
    assert_eq!(stats.total_flushed, 800);
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.flushed_per_writer.iter().sum::<u64>(), 800);
    assert_eq!(pool.dirty_count(), 0);

    for t in 0..4u32 {
        for i in (0..200u32).step_by(37) {
            let id = t * 1000 + i;
            let page = read_block(store.as_ref(), id).unwrap();
            verify_page_checksum(&page, BlockNumber(id)).unwrap();
        }
    }
}

// ---------------------------------------------------------------------------
// Fatal I/O
// ---------------------------------------------------------------------------

#[test]
fn test_write_failure_halts_engine() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(MemBufferPool::new(PAGE));
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let collaborators = Collaborators::new(pool.clone(), pool.clone(), Arc::new(FailingStore)).on_fatal({
        let hook_calls = Arc::clone(&hook_calls);
        move |err| {
            assert!(matches!(err, FlushError::Io { .. }));
            hook_calls.fetch_add(1, Ordering::SeqCst);
        }
    });
    let engine = FlushEngine::start(test_config(), dir.path().join("staging"), collaborators).unwrap();

    for i in 0..6 {
        touch(&engine, &pool, i, i, 1);
    }
    engine.request_drain(0);

    let deadline = Instant::now() + Duration::from_secs(10);
    while !engine.is_halted() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(engine.is_halted());
    assert!(matches!(engine.fatal_error(), Some(FlushError::Io { .. })));

    // the queue is closed once halted
    pool.write(BufferId(100), BlockNumber(100), LogPosition(1), b"x");
    assert!(!engine.mark_dirty(BufferId(100)));
    assert!(!engine.wait_for_depth(0, Duration::from_millis(50)));

    match engine.shutdown_drain() {
        Err(FlushError::Halted { reason }) => assert!(reason.contains("device went away")),
        other => panic!("expected Halted, got {:?}", other),
    }
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    assert!(engine.stats().halted);
}

// ---------------------------------------------------------------------------
// Crash recovery
// ---------------------------------------------------------------------------

#[test]
fn test_restart_repairs_torn_page() {
    let dir = TempDir::new().unwrap();
    let staging_dir = dir.path().join("staging");
    let pool = Arc::new(MemBufferPool::new(PAGE));
    let store = Arc::new(RecordingStore::open(&dir));

    let engine = start(idle_config(), &dir, &pool, store.clone());
    touch(&engine, &pool, 5, 5, 10);
    engine.shutdown_drain().unwrap();
    drop(engine);

    // Crash simulation: a newer image of block 5 made it into writer 0's
    // staging file, and the data file write was cut in half.
    let mut newer = pool.page(BufferId(5)).unwrap();
    set_page_lsn(&mut newer, LogPosition(11));
    newer[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 5].copy_from_slice(b"fresh");
    newer[PAGE - 10..].copy_from_slice(b"tail bytes");
    set_page_checksum(&mut newer, BlockNumber(5));
    {
        let mut stage = StagingBuffer::open(&staging_dir, 0, PAGE, 4).unwrap();
        stage.append(BlockNumber(5), &newer, false).unwrap();
        stage.flush_durable().unwrap();
    }
    let mut torn = read_block(store.as_ref(), 5).unwrap();
    torn[..PAGE / 2].copy_from_slice(&newer[..PAGE / 2]);
    store.write_page(BlockNumber(5), &torn).unwrap();
    assert!(verify_page_checksum(&torn, BlockNumber(5)).is_err());

    let pool = Arc::new(MemBufferPool::new(PAGE));
    let engine = start(idle_config(), &dir, &pool, store.clone());
    let report = engine.recovery_report().clone();
    assert_eq!(report.batches_replayed, 1);
    assert_eq!(report.pages_restored, 1);

    let page = read_block(store.as_ref(), 5).unwrap();
    assert_eq!(page, newer);
    verify_page_checksum(&page, BlockNumber(5)).unwrap();
    engine.shutdown_drain().unwrap();
}

#[test]
fn test_clean_restart_replays_nothing() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(MemBufferPool::new(PAGE));
    let store = Arc::new(RecordingStore::open(&dir));

    let engine = start(test_config(), &dir, &pool, store.clone());
    for i in 0..9 {
        touch(&engine, &pool, i, i, 1);
    }
    engine.shutdown_drain().unwrap();
    drop(engine);

    let engine = start(test_config(), &dir, &pool, store.clone());
    assert!(engine.recovery_report().is_clean());
    assert_eq!(engine.recovery_report().files_scanned, 2);
    assert!(!pool.is_dirty(BufferId(0)));
    engine.shutdown_drain().unwrap();
}
