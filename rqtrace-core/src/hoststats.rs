//! Per-host counters (spec.md §4.H).
//!
//! Raw opcode/SQL counters are bumped with relaxed atomic `fetch_add` from
//! any number of request threads with no lock. A single periodic caller
//! rotates the ten-second sliding window; `snapshot` (also under the
//! calculation lock) folds the window into either a rate or a raw total.
//!
//! The block-op classifier here assigns each block-op to exactly one
//! family. The original has `BLOCK2_RECOM` fall through into `recom`,
//! `snapisol`, and `serial`, and `BLOCK2_SNAPISOL` fall through into
//! `snapisol` and `serial` — almost certainly a missing `break`. This
//! implementation does not reproduce that: each block-op increments
//! exactly one family.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::external::{BlockOpFamily, OpcodeFamily};
use crate::interner::Interner;

pub const NUM_BUCKETS: usize = 10;

/// Atomically-updated counters for one host, bumped from the hot path.
#[derive(Default)]
pub struct RawCounters {
    pub finds: AtomicU32,
    pub rngexts: AtomicU32,
    pub writes: AtomicU32,
    pub other_fstsnds: AtomicU32,
    pub adds: AtomicU32,
    pub upds: AtomicU32,
    pub dels: AtomicU32,
    pub bsql: AtomicU32,
    pub recom: AtomicU32,
    pub snapisol: AtomicU32,
    pub serial: AtomicU32,
    pub sql_queries: AtomicU32,
    pub sql_steps: AtomicU32,
    pub sql_rows: AtomicU32,
}

impl RawCounters {
    pub fn bump_opcode(&self, family: OpcodeFamily, n: u32) {
        let field = match family {
            OpcodeFamily::Find => &self.finds,
            OpcodeFamily::RngExt => &self.rngexts,
            OpcodeFamily::Write => &self.writes,
            OpcodeFamily::Other => &self.other_fstsnds,
        };
        field.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bump_block_op(&self, family: BlockOpFamily, n: u32) {
        let field = match family {
            BlockOpFamily::Add => &self.adds,
            BlockOpFamily::Upd => &self.upds,
            BlockOpFamily::Del => &self.dels,
            BlockOpFamily::Bsql => &self.bsql,
            BlockOpFamily::Recom => &self.recom,
            BlockOpFamily::SnapIsol => &self.snapisol,
            BlockOpFamily::Serial => &self.serial,
        };
        field.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bump_sql(&self, queries: u32, steps: u32, rows: u32) {
        self.sql_queries.fetch_add(queries, Ordering::Relaxed);
        self.sql_steps.fetch_add(steps, Ordering::Relaxed);
        self.sql_rows.fetch_add(rows, Ordering::Relaxed);
    }

    fn snapshot_totals(&self) -> Totals {
        macro_rules! load {
            ($f:ident) => {
                self.$f.load(Ordering::Relaxed)
            };
        }
        Totals {
            finds: load!(finds),
            rngexts: load!(rngexts),
            writes: load!(writes),
            other_fstsnds: load!(other_fstsnds),
            adds: load!(adds),
            upds: load!(upds),
            dels: load!(dels),
            bsql: load!(bsql),
            recom: load!(recom),
            snapisol: load!(snapisol),
            serial: load!(serial),
            sql_queries: load!(sql_queries),
            sql_steps: load!(sql_steps),
            sql_rows: load!(sql_rows),
        }
    }
}

/// A plain snapshot of [`RawCounters`], used for diffing and for the
/// bucket ring (which needs owned, not atomic, storage).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub finds: u32,
    pub rngexts: u32,
    pub writes: u32,
    pub other_fstsnds: u32,
    pub adds: u32,
    pub upds: u32,
    pub dels: u32,
    pub bsql: u32,
    pub recom: u32,
    pub snapisol: u32,
    pub serial: u32,
    pub sql_queries: u32,
    pub sql_steps: u32,
    pub sql_rows: u32,
}

impl Totals {
    fn wrapping_diff(current: u32, prev: u32) -> u32 {
        current.wrapping_sub(prev)
    }

    fn diff(current: &Totals, prev: &Totals) -> Totals {
        Totals {
            finds: Self::wrapping_diff(current.finds, prev.finds),
            rngexts: Self::wrapping_diff(current.rngexts, prev.rngexts),
            writes: Self::wrapping_diff(current.writes, prev.writes),
            other_fstsnds: Self::wrapping_diff(current.other_fstsnds, prev.other_fstsnds),
            adds: Self::wrapping_diff(current.adds, prev.adds),
            upds: Self::wrapping_diff(current.upds, prev.upds),
            dels: Self::wrapping_diff(current.dels, prev.dels),
            bsql: Self::wrapping_diff(current.bsql, prev.bsql),
            recom: Self::wrapping_diff(current.recom, prev.recom),
            snapisol: Self::wrapping_diff(current.snapisol, prev.snapisol),
            serial: Self::wrapping_diff(current.serial, prev.serial),
            sql_queries: Self::wrapping_diff(current.sql_queries, prev.sql_queries),
            sql_steps: Self::wrapping_diff(current.sql_steps, prev.sql_steps),
            sql_rows: Self::wrapping_diff(current.sql_rows, prev.sql_rows),
        }
    }

    fn add(&mut self, other: &Totals) {
        self.finds = self.finds.wrapping_add(other.finds);
        self.rngexts = self.rngexts.wrapping_add(other.rngexts);
        self.writes = self.writes.wrapping_add(other.writes);
        self.other_fstsnds = self.other_fstsnds.wrapping_add(other.other_fstsnds);
        self.adds = self.adds.wrapping_add(other.adds);
        self.upds = self.upds.wrapping_add(other.upds);
        self.dels = self.dels.wrapping_add(other.dels);
        self.bsql = self.bsql.wrapping_add(other.bsql);
        self.recom = self.recom.wrapping_add(other.recom);
        self.snapisol = self.snapisol.wrapping_add(other.snapisol);
        self.serial = self.serial.wrapping_add(other.serial);
        self.sql_queries = self.sql_queries.wrapping_add(other.sql_queries);
        self.sql_steps = self.sql_steps.wrapping_add(other.sql_steps);
        self.sql_rows = self.sql_rows.wrapping_add(other.sql_rows);
    }

    fn scale_to_rate(&self, total_span_ms: i64) -> Totals {
        let span = total_span_ms.max(1) as f64;
        let scale = |v: u32| -> u32 {
            (0.5 + (NUM_BUCKETS as f64 * 1000.0 * (v as f64 / span))) as u32
        };
        Totals {
            finds: scale(self.finds),
            rngexts: scale(self.rngexts),
            writes: scale(self.writes),
            other_fstsnds: scale(self.other_fstsnds),
            adds: scale(self.adds),
            upds: scale(self.upds),
            dels: scale(self.dels),
            bsql: scale(self.bsql),
            recom: scale(self.recom),
            snapisol: scale(self.snapisol),
            serial: scale(self.serial),
            sql_queries: scale(self.sql_queries),
            sql_steps: scale(self.sql_steps),
            sql_rows: scale(self.sql_rows),
        }
    }
}

struct HostStats {
    host_interned: u64,
    host_name: String,
    raw: RawCounters,
    prev: Mutex<Totals>,
    buckets: Mutex<RingState>,
}

struct RingState {
    raw_buckets: [Totals; NUM_BUCKETS],
    bucket_span_ms: [i64; NUM_BUCKETS],
    cur_bucket: usize,
}

impl Default for RingState {
    fn default() -> Self {
        RingState {
            raw_buckets: [Totals::default(); NUM_BUCKETS],
            bucket_span_ms: [0; NUM_BUCKETS],
            cur_bucket: 0,
        }
    }
}

/// Process-wide table of per-host stats, keyed by interned host id.
/// First observer for a host installs it under `install_mutex`, with a
/// full barrier before the slot becomes visible; steady-state readers
/// never take that lock.
pub struct HostTable {
    interner: Mutex<Interner>,
    install_mutex: Mutex<()>,
    hosts: Mutex<HashMap<u64, std::sync::Arc<HostStats>>>,
    calc_mutex: Mutex<()>,
    last_rotation_ms: Mutex<Option<i64>>,
}

impl HostTable {
    pub fn new() -> Self {
        HostTable {
            interner: Mutex::new(Interner::new()),
            install_mutex: Mutex::new(()),
            hosts: Mutex::new(HashMap::new()),
            calc_mutex: Mutex::new(()),
            last_rotation_ms: Mutex::new(None),
        }
    }

    /// Interns `host` and returns a reference-counted handle to its
    /// counters, installing the record on first use.
    pub fn get_raw_counters(&self, host: &str) -> std::sync::Arc<RawCountersHandle> {
        let id = self
            .interner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .intern(host);

        {
            let hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(stats) = hosts.get(&id) {
                return std::sync::Arc::new(RawCountersHandle { stats: stats.clone() });
            }
        }

        let _guard = self.install_mutex.lock().unwrap_or_else(|e| e.into_inner());
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        let stats = hosts
            .entry(id)
            .or_insert_with(|| {
                std::sync::Arc::new(HostStats {
                    host_interned: id,
                    host_name: host.to_string(),
                    raw: RawCounters::default(),
                    prev: Mutex::new(Totals::default()),
                    buckets: Mutex::new(RingState::default()),
                })
            })
            .clone();
        std::sync::Arc::new(RawCountersHandle { stats })
    }

    /// Rotates the sliding window for every installed host. Intended to
    /// be called by a single periodic caller roughly once a second;
    /// `now_ms` drives the elapsed-span computation.
    pub fn rotate(&self, now_ms: i64) {
        let _calc = self.calc_mutex.lock().unwrap_or_else(|e| e.into_inner());
        let mut last = self.last_rotation_ms.lock().unwrap_or_else(|e| e.into_inner());
        let span_ms = match *last {
            Some(prev) => now_ms - prev,
            None => 0,
        };
        *last = Some(now_ms);

        let hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        for stats in hosts.values() {
            let current = stats.raw.snapshot_totals();
            let mut prev = stats.prev.lock().unwrap_or_else(|e| e.into_inner());
            let diff = Totals::diff(&current, &prev);
            *prev = current;

            let mut ring = stats.buckets.lock().unwrap_or_else(|e| e.into_inner());
            let bucket = ring.cur_bucket;
            ring.raw_buckets[bucket] = diff;
            ring.bucket_span_ms[bucket] = span_ms;
            ring.cur_bucket = (bucket + 1) % NUM_BUCKETS;
        }
    }

    /// `snapshot(host, as_rates)` per spec.md §4.H. Returns `None` if the
    /// host was never observed.
    pub fn snapshot(&self, host: &str, as_rates: bool) -> Option<Totals> {
        let id = {
            let mut interner = self.interner.lock().unwrap_or_else(|e| e.into_inner());
            interner.intern(host)
        };
        let hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        let stats = hosts.get(&id)?;

        let _calc = self.calc_mutex.lock().unwrap_or_else(|e| e.into_inner());
        if as_rates {
            let ring = stats.buckets.lock().unwrap_or_else(|e| e.into_inner());
            let mut sum = Totals::default();
            let mut total_span = 0i64;
            for i in 0..NUM_BUCKETS {
                sum.add(&ring.raw_buckets[i]);
                total_span += ring.bucket_span_ms[i];
            }
            Some(sum.scale_to_rate(total_span))
        } else {
            Some(*stats.prev.lock().unwrap_or_else(|e| e.into_inner()))
        }
    }

    /// One fixed-width report line per host (reqlog.c:2489-2560's
    /// `nodestats_report`). `as_rates` controls whether the figures are
    /// per-second rates or raw totals.
    pub fn report_lines(&self, as_rates: bool) -> Vec<String> {
        let hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<&str> = hosts.values().map(|s| s.host_name.as_str()).collect();
        names.sort_unstable();
        names
            .into_iter()
            .filter_map(|name| {
                let snap = self.snapshot(name, as_rates)?;
                Some(format!(
                    "{name:>16} | {:>7} {:>7} {:>7} {:>7} | {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} | {:>7} {:>7} {:>7}",
                    snap.finds,
                    snap.rngexts,
                    snap.writes,
                    snap.other_fstsnds,
                    snap.adds,
                    snap.upds,
                    snap.dels,
                    snap.bsql,
                    snap.recom,
                    snap.snapisol,
                    snap.serial,
                    snap.sql_queries,
                    snap.sql_steps,
                    snap.sql_rows,
                ))
            })
            .collect()
    }
}

impl Default for HostTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-facing handle returned by [`HostTable::get_raw_counters`]; hot
/// path code holds onto this and bumps counters without revisiting the
/// table or interner.
pub struct RawCountersHandle {
    stats: std::sync::Arc<HostStats>,
}

impl RawCountersHandle {
    pub fn host_id(&self) -> u64 {
        self.stats.host_interned
    }

    pub fn bump_opcode(&self, family: OpcodeFamily, n: u32) {
        self.stats.raw.bump_opcode(family, n);
    }

    pub fn bump_block_op(&self, family: BlockOpFamily, n: u32) {
        self.stats.raw.bump_block_op(family, n);
    }

    pub fn bump_sql(&self, queries: u32, steps: u32, rows: u32) {
        self.stats.raw.bump_sql(queries, steps, rows);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotone_and_shared_by_host() {
        let table = HostTable::new();
        let h1 = table.get_raw_counters("10.0.0.1");
        let h2 = table.get_raw_counters("10.0.0.1");
        h1.bump_opcode(OpcodeFamily::Find, 5);
        h2.bump_opcode(OpcodeFamily::Find, 5);
        table.rotate(1000);
        let snap = table.snapshot("10.0.0.1", false).unwrap();
        assert_eq!(snap.finds, 10);
    }

    #[test]
    fn rate_snapshot_after_one_rotation() {
        let table = HostTable::new();
        let h = table.get_raw_counters("H1");
        table.rotate(0);
        for _ in 0..100 {
            h.bump_opcode(OpcodeFamily::Find, 1);
        }
        for _ in 0..50 {
            h.bump_opcode(OpcodeFamily::Write, 1);
        }
        table.rotate(1000);
        let snap = table.snapshot("H1", true).unwrap();
        assert_eq!(snap.finds, 10);
        assert_eq!(snap.writes, 5);
    }

    #[test]
    fn rate_decays_to_zero_after_idle_rotations() {
        let table = HostTable::new();
        let h = table.get_raw_counters("H1");
        let mut now = 0i64;
        table.rotate(now);
        for _ in 0..100 {
            h.bump_opcode(OpcodeFamily::Find, 1);
        }
        now += 1000;
        table.rotate(now);
        for _ in 0..10 {
            now += 1000;
            table.rotate(now);
        }
        let snap = table.snapshot("H1", true).unwrap();
        assert_eq!(snap.finds, 0);
    }

    #[test]
    fn empty_span_sum_uses_one_not_zero() {
        let table = HostTable::new();
        let h = table.get_raw_counters("H1");
        h.bump_opcode(OpcodeFamily::Find, 1);
        // No rotation ever called: all bucket spans are zero.
        let snap = table.snapshot("H1", true).unwrap();
        assert_eq!(snap.finds, 0);
    }

    #[test]
    fn block_op_families_do_not_double_count() {
        let raw = RawCounters::default();
        raw.bump_block_op(BlockOpFamily::Recom, 1);
        let totals = raw.snapshot_totals();
        assert_eq!(totals.recom, 1);
        assert_eq!(totals.snapisol, 0);
        assert_eq!(totals.serial, 0);
    }

    #[test]
    fn unknown_host_snapshot_is_none() {
        let table = HostTable::new();
        assert!(table.snapshot("never-seen", false).is_none());
    }
}
