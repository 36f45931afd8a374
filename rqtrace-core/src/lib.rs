//! rqtrace-core — the per-request structured logging and statistics
//! engine embedded inside a database server.
//!
//! Provides:
//! - `arena`, `prefix`, `eventlog` — per-request capture primitives
//! - `recorder` — the per-thread request recorder built on top of them
//! - `rules`, `admin` — the reconfigurable rule set and its command surface
//! - `sink` — named, reference-counted output destinations
//! - `dispatch` — end-of-request rule evaluation and sink fan-out
//! - `hoststats` — per-host opcode/SQL counters and rate reporting
//! - `external` — the narrow set of capabilities this engine consumes
//!   from its host process

pub mod admin;
pub mod arena;
pub mod dispatch;
pub mod event_class;
pub mod eventlog;
pub mod external;
pub mod hoststats;
pub mod interner;
pub mod prefix;
pub mod recorder;
pub mod rules;
pub mod sink;

use std::sync::Arc;

/// Short git SHA this crate was built from, embedded by `build.rs`.
pub const GIT_SHA: &str = env!("GIT_SHA");

use admin::{AdminConfig, AdminOutcome};
use dispatch::Dispatcher;
use external::HostLogger;
use hoststats::HostTable;
use recorder::Recorder;
use rules::RuleSet;
use sink::SinkRegistry;

/// Owns every piece of shared, process-wide state: the rule set, the
/// sink registry, the per-host counter table, and the dispatcher that
/// ties them together at end-of-request. Replaces the original's
/// file-scope statics with one struct a host process constructs once
/// and shares across worker threads.
pub struct Engine {
    pub rules: Arc<RuleSet>,
    pub sinks: Arc<SinkRegistry>,
    pub hosts: Arc<HostTable>,
    pub config: Arc<AdminConfig>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Engine {
    pub fn new(host_logger: Arc<dyn HostLogger>) -> Self {
        let rules = Arc::new(RuleSet::new());
        let sinks = Arc::new(SinkRegistry::new(host_logger));
        let hosts = Arc::new(HostTable::new());
        let config = Arc::new(AdminConfig::default());
        let dispatcher = Arc::new(Dispatcher::new(rules.clone(), sinks.clone(), config.clone()));
        Engine {
            rules,
            sinks,
            hosts,
            config,
            dispatcher,
        }
    }

    /// Allocates a fresh per-thread recorder. Callers keep this around
    /// and call `reset`/`begin_*` on it for every subsequent request
    /// rather than allocating a new one each time.
    pub fn new_recorder(&self) -> Recorder {
        Recorder::new()
    }

    /// Dispatches one pre-tokenized admin command line (spec.md §4.I).
    pub fn admin(&self, tokens: &[&str]) -> AdminOutcome {
        let outcome = admin::process_line(tokens, &self.rules, &self.sinks, &self.config);
        if tokens.first() == Some(&"longreqfile") {
            if let Some(&file) = tokens.get(1) {
                self.dispatcher.set_long_request_file(file);
            }
        }
        outcome
    }

    /// Renders the `stat` verb's output: current rules, thresholds, and
    /// request counters.
    pub fn format_stat(&self) -> String {
        use std::sync::atomic::Ordering;
        let mut out = self.rules.format_stat();
        out.push_str(&format!(
            "long_request_ms={} long_sql_request_ms={} diffstat_interval_s={} truncate={}\n",
            self.config.long_request_ms.load(Ordering::Relaxed),
            self.config.long_sql_request_ms.load(Ordering::Relaxed),
            self.config.diffstat_interval_s.load(Ordering::Relaxed),
            self.config.truncate_stmt_bytes.load(Ordering::Relaxed),
        ));
        out.push_str(&format!(
            "norm_reqs={} long_reqs={}\n",
            self.dispatcher.norm_reqs(),
            self.dispatcher.long_reqs(),
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use external::{NullTelemetry, StderrLogger, SystemClock};

    #[test]
    fn engine_end_to_end_admin_and_request() {
        let engine = Engine::new(Arc::new(StderrLogger));
        assert_eq!(engine.admin(&["0", "go", "trace"]), AdminOutcome::Ok);

        let mut recorder = engine.new_recorder();
        recorder.set_origin("thread-1");
        recorder.begin_regular(0, 1, false);
        engine.dispatcher.begin(&mut recorder, None, false);
        engine.dispatcher.end_request(&mut recorder, 0, &SystemClock, None, &NullTelemetry);

        assert_eq!(engine.dispatcher.norm_reqs() + engine.dispatcher.long_reqs(), 1);
        assert!(engine.format_stat().contains("norm_reqs"));
    }
}
