//! Offloader End-to-End Smoke Test
//!
//! Exercises the full offload stack:
//!   Part A — Configuration: env overrides, validation, backend names
//!   Part B — POSIX AIO backend: round trips, layout, keys, release
//!   Part C — io_uring backend: same checks (skipped if io_uring is blocked)
//!
//! Run: OFFLOAD_DIR=/mnt/nvme ./target/release/offload-smoke
//! Backing files created by the run are removed at the end.

use offload_engine::{
    callback, BackendKind, ConfigError, OffloadBuffer, OffloadConfig, OffloadError, Offloader,
    Region, RequestKey,
};
use offload_module::host_buffer::HostBuffer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
    skipped: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0, skipped: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn skip(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.skipped += 1;
        println!("  [{:2}] {:<52} SKIP: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}  Skipped: {}",
            self.total, self.passed, self.failed, self.skipped
        );
        println!("{}", LINE);
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
}

// ════════════════════════════════════════════════════════════
// Part A: Configuration
// ════════════════════════════════════════════════════════════

fn test_config(t: &mut TestRunner) -> Option<OffloadConfig> {
    t.section("Part A: Configuration");

    let config = match OffloadConfig::from_env() {
        Ok(c) => { t.pass("OffloadConfig::from_env()"); c }
        Err(e) => {
            t.fail("OffloadConfig::from_env()", &e.to_string());
            return None;
        }
    };
    println!("       directory: {}", config.directory.display());
    println!("       n_entries: {}  backend: {}", config.n_entries, config.backend);

    let valid = config.validate();
    t.check("validate()", valid.is_ok(), &format!("{:?}", valid.as_ref().err()));

    let zero = config.clone().n_entries(0).validate();
    t.check("n_entries = 0 rejected", zero == Err(ConfigError::ZeroEntries), &format!("{:?}", zero));

    let missing = config.directory.join("offload-smoke-missing-dir");
    let err = config.clone().directory(&missing).validate();
    t.check(
        "missing directory rejected",
        matches!(err, Err(ConfigError::NotADirectory(_))),
        &format!("{:?}", err),
    );

    let bogus = "nvme-direct".parse::<BackendKind>();
    t.check(
        "unknown backend name rejected",
        matches!(bogus, Err(ConfigError::UnsupportedBackend(_))),
        &format!("{:?}", bogus),
    );

    if valid.is_ok() { Some(config) } else { None }
}

// ════════════════════════════════════════════════════════════
// Parts B/C: one backend end to end
// ════════════════════════════════════════════════════════════

fn test_backend(t: &mut TestRunner, base: &OffloadConfig, backend: BackendKind, part: &str) -> Option<PathBuf> {
    t.section(&format!("Part {}: {} backend", part, backend));

    let off = match Offloader::new(base.clone().backend(backend).n_entries(2)) {
        Ok(off) => { t.pass("Offloader::new (n_entries = 2)"); off }
        Err(OffloadError::Config(ConfigError::BackendSetup { errno, .. })) => {
            t.skip("Offloader::new (n_entries = 2)", &format!("backend unavailable, errno {}", errno));
            return None;
        }
        Err(e) => {
            t.fail("Offloader::new (n_entries = 2)", &e.to_string());
            return None;
        }
    };
    let path = off.backing_path().to_path_buf();
    t.check("backing file exists", path.exists(), &path.display().to_string());

    // ── three async writes, N = 2 ──
    let done = Arc::new(AtomicUsize::new(0));
    let bufs: Vec<_> = (0..3u8).map(|i| Arc::new(HostBuffer::from_bytes(pattern(4096, i)))).collect();
    let mut submit_ok = true;
    for buf in &bufs {
        let done = done.clone();
        let cb = callback(move |c| {
            if c.is_success() {
                done.fetch_add(1, Ordering::SeqCst);
            }
        });
        submit_ok &= off.async_write(buf.clone(), buf.key(), Some(cb)).is_ok();
    }
    t.check("3 × async_write submitted", submit_ok, "submit error");
    let synced = off.synchronize();
    t.check("synchronize()", synced.is_ok(), &format!("{:?}", synced.err()));
    t.check(
        "3 callbacks ran",
        done.load(Ordering::SeqCst) == 3,
        &format!("{} ran", done.load(Ordering::SeqCst)),
    );

    let offsets: Vec<Option<u64>> = bufs.iter().map(|b| off.region(b.key()).map(|r| r.offset)).collect();
    t.check(
        "regions at 0, 4096, 8192",
        offsets == vec![Some(0), Some(4096), Some(8192)],
        &format!("{:?}", offsets),
    );
    t.check(
        "storage released after write",
        bufs.iter().all(|b| b.storage_len() == 0),
        "storage still present",
    );
    t.check(
        "slot high water <= 2",
        off.stats().slots_high_water <= 2,
        &format!("{}", off.stats().slots_high_water),
    );

    // ── read back ──
    let mut read_ok = true;
    for (i, buf) in bufs.iter().enumerate() {
        read_ok &= off.sync_read(buf.clone(), buf.key()).is_ok()
            && buf.to_vec() == Some(pattern(4096, i as u8));
    }
    t.check("sync_read restores bytes", read_ok, "data mismatch");

    // ── keys ──
    let fresh = Arc::new(HostBuffer::new(64));
    let unknown = off.sync_read(fresh.clone(), fresh.key());
    t.check(
        "read of unwritten key → UnknownRegion",
        matches!(unknown, Err(OffloadError::UnknownRegion(_))),
        &format!("{:?}", unknown),
    );

    let empty = Arc::new(HostBuffer::unallocated(64));
    let rejected = off.async_write(empty, RequestKey(u64::MAX), None);
    t.check(
        "write of empty storage → EmptyBuffer",
        matches!(rejected, Err(OffloadError::EmptyBuffer(_))),
        &format!("{:?}", rejected),
    );

    // ── release + reuse ──
    let released = off.release_region(bufs[0].key());
    t.check(
        "release_region frees [0, 4096)",
        matches!(released, Ok(r) if r == Region::new(0, 4096)),
        &format!("{:?}", released),
    );
    let reuse = Arc::new(HostBuffer::new(4096));
    let _ = off.sync_write(reuse.clone(), reuse.key());
    t.check(
        "freed range reused",
        off.region(reuse.key()) == Some(Region::new(0, 4096)),
        &format!("{:?}", off.region(reuse.key())),
    );

    // ── throughput ──
    let big = Arc::new(HostBuffer::from_bytes(pattern(8 << 20, 3)));
    let start = Instant::now();
    let big_ok = off.sync_write(big.clone(), big.key()).is_ok() && off.sync_read(big.clone(), big.key()).is_ok();
    let elapsed = start.elapsed();
    t.check("8 MiB round trip", big_ok && big.to_vec() == Some(pattern(8 << 20, 3)), "mismatch");
    println!(
        "       8 MiB write+read in {:?} ({:.1} MiB/s)",
        elapsed,
        16.0 / elapsed.as_secs_f64().max(1e-9)
    );

    let stats = off.stats();
    t.check("no failed requests", stats.failures == 0, &format!("{} failures", stats.failures));
    tracing::info!(?stats, "backend {} done", backend);

    drop(off);
    t.check("backing file kept after drop", path.exists(), "file removed");
    Some(path)
}

fn main() {
    offload_engine::logging::ensure_initialized();

    println!("=== Offloader End-to-End Smoke Test ===");
    let kver = std::fs::read_to_string("/proc/version").unwrap_or_default();
    println!("    kernel: {}", kver.trim().split(' ').nth(2).unwrap_or("?"));

    let mut t = TestRunner::new();

    let Some(config) = test_config(&mut t) else {
        println!("\nFATAL: no usable configuration (set OFFLOAD_DIR to an existing directory)");
        t.summary();
        std::process::exit(1);
    };

    let mut files = Vec::new();
    files.extend(test_backend(&mut t, &config, BackendKind::Aio, "B"));
    files.extend(test_backend(&mut t, &config, BackendKind::Uring, "C"));

    for path in files {
        if let Err(e) = std::fs::remove_file(&path) {
            println!("    warning: could not remove {}: {}", path.display(), e);
        }
    }

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
