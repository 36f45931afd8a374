//! Capabilities this engine consumes from the host process (spec.md §6).
//!
//! These are external collaborators: the command parser that maps
//! operator input to rule mutations, bit-exact request opcodes, row/tag
//! decoding, transaction commit accounting, and the general logging sink
//! are all owned by the host. The engine only needs the narrow interfaces
//! below; it never reaches further into the host than this.

/// A single in-flight request as the host process represents it.
///
/// Implemented by the host; the engine only ever reads from it.
pub trait RequestHandle {
    fn debug(&self) -> bool;
    fn opcode(&self) -> i32;
    fn retries(&self) -> i32;
    fn reply_time_ms(&self) -> i64;
    fn txn_size(&self) -> i64;
    fn reply_len(&self) -> usize;
    fn origin(&self) -> &str;
    /// A free-form "transaction summary" string, if the host can produce
    /// one for this request (e.g. a replicated-transaction digest).
    fn transaction_summary(&self) -> Option<String> {
        None
    }
}

/// Monotonic and wall-clock time, provided so tests can fake the clock.
pub trait Clock {
    fn now_ms(&self) -> i64;
    fn now_epoch_s(&self) -> i64;
}

/// Real-time clock backed by `std::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        now.as_millis() as i64
    }

    fn now_epoch_s(&self) -> i64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        now.as_secs() as i64
    }
}

/// Line-oriented sink for the distinguished default output and for the
/// engine's own diagnostics (distinct from `tracing`, which is used only
/// to observe the engine itself — see SPEC_FULL.md's "internal
/// diagnostics" section).
pub trait HostLogger: Send + Sync {
    fn log_line(&self, line: &str);
}

/// Formats lines to stderr; a reasonable default outside a real host.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrLogger;

impl HostLogger for StderrLogger {
    fn log_line(&self, line: &str) {
        eprintln!("{line}");
    }
}

/// Storage-engine telemetry the header writer folds into the request
/// header: bytes written, replication time, rate, and anything else the
/// storage layer wants to surface for this request.
pub trait StoreTelemetry {
    /// Formatted `"key value"` lines for the request that just ended.
    fn stats_lines(&self) -> Vec<String>;
    fn commit_bytes(&self) -> u64 {
        0
    }
    fn commit_time_ms(&self) -> i64 {
        0
    }
    fn commit_rate_bytes_per_sec(&self) -> f64 {
        0.0
    }
}

/// No-op telemetry source for tests and the demo binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetry;

impl StoreTelemetry for NullTelemetry {
    fn stats_lines(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Families of block-operation opcodes used by the per-host report
/// classifier (§4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockOpFamily {
    Add,
    Upd,
    Del,
    Bsql,
    Recom,
    SnapIsol,
    Serial,
}

/// Families of plain request opcodes used by the same classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeFamily {
    Find,
    RngExt,
    Write,
    Other,
}

/// Opcode name lookups and the families the per-host report classifier
/// needs. The engine treats opcode numbering as entirely opaque beyond
/// this.
pub trait OpcodeTaxonomy {
    fn name_of(&self, opcode: i32) -> &str;
    fn opcode_of(&self, name: &str) -> Option<i32>;
    fn family_of(&self, opcode: i32) -> OpcodeFamily;
    fn block_family_of(&self, opcode: i32) -> Option<BlockOpFamily>;
}
