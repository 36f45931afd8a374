//! rqtraced - demo driver for the request logging and statistics engine.
//!
//! Generates synthetic requests at a configurable rate and pumps them
//! through `rqtrace_core::Engine`, so the engine's rule matching, sink
//! fan-out, and per-host rate reporting can be observed end to end
//! without a real database server attached.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use rqtrace_core::external::{Clock, NullTelemetry, StderrLogger, SystemClock};
use rqtrace_core::Engine;

/// Synthetic request generator driving the logging engine.
#[derive(Parser)]
#[command(name = "rqtraced", about = "Request logging engine demo driver", version)]
struct Args {
    /// Requests generated per second.
    #[arg(short, long, default_value = "20")]
    rate: u64,

    /// Per-host rotation tick interval, in milliseconds.
    #[arg(long, default_value = "1000")]
    rotation_interval_ms: u64,

    /// Initial rule: log requests slower than this many milliseconds to
    /// the given file (disabled if omitted).
    #[arg(long)]
    slow_log_file: Option<String>,

    /// Threshold (ms) for `--slow-log-file`.
    #[arg(long, default_value = "50")]
    slow_log_threshold_ms: i64,

    /// Interval, in seconds, between per-host diffstat dumps (0 disables).
    #[arg(long, default_value = "5")]
    diffstat_interval_s: i64,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("rqtraced={}", level).parse().unwrap())
        .add_directive(format!("rqtrace_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Deterministic, allocation-free pseudo-randomness for the demo loop —
/// a request counter is all the variety this driver needs.
fn synthetic_host(n: u64) -> &'static str {
    const HOSTS: &[&str] = &["10.0.0.1", "10.0.0.2", "10.0.0.3"];
    HOSTS[(n % HOSTS.len() as u64) as usize]
}

fn synthetic_opcode(n: u64) -> i32 {
    (n % 4) as i32
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!(
        "rqtraced {} ({}) starting",
        env!("CARGO_PKG_VERSION"),
        rqtrace_core::GIT_SHA
    );
    info!("Config: rate={}/s, rotation={}ms", args.rate, args.rotation_interval_ms);

    let engine = Engine::new(Arc::new(StderrLogger));

    if let Some(file) = &args.slow_log_file {
        let threshold_tok = format!("{}+", args.slow_log_threshold_ms);
        engine.admin(&["0", "go", "ms", threshold_tok.as_str(), "file", file.as_str()]);
        info!("Slow-request rule active: ms >= {} -> {}", args.slow_log_threshold_ms, file);
    }

    let diffstat_interval_tok = args.diffstat_interval_s.to_string();
    engine.admin(&["diffstat", diffstat_interval_tok.as_str()]);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let clock = SystemClock;
    let mut recorder = engine.new_recorder();
    recorder.set_origin("rqtraced-demo");
    let default_sink = engine.sinks.default_sink();

    let mut diffstat_recorder = engine.new_recorder();
    diffstat_recorder.set_origin("rqtraced-diffstat");
    diffstat_recorder.begin_diffstat(clock.now_ms());

    let period = Duration::from_secs_f64(1.0 / args.rate.max(1) as f64);
    let rotation_period = Duration::from_millis(args.rotation_interval_ms);
    let mut last_rotation = clock.now_ms();
    let mut request_count: u64 = 0;

    info!("Starting request generation loop");

    while running.load(Ordering::SeqCst) {
        let host = synthetic_host(request_count);
        let opcode = synthetic_opcode(request_count);
        let handle = engine.hosts.get_raw_counters(host);

        recorder.begin_regular(clock.now_ms(), opcode, false);
        engine.dispatcher.begin(&mut recorder, None, false);
        recorder.push_prefix("demo ", &default_sink, clock.now_epoch_s(), clock.now_ms());
        recorder.log(
            rqtrace_core::event_class::TRACE,
            &format!("synthetic request #{request_count} from {host}"),
            &default_sink,
            clock.now_epoch_s(),
            clock.now_ms(),
        );
        recorder.pop_prefix();

        let family = match opcode {
            0 => rqtrace_core::external::OpcodeFamily::Find,
            1 => rqtrace_core::external::OpcodeFamily::RngExt,
            2 => rqtrace_core::external::OpcodeFamily::Write,
            _ => rqtrace_core::external::OpcodeFamily::Other,
        };
        handle.bump_opcode(family, 1);

        std::thread::sleep(period / 10);
        engine
            .dispatcher
            .end_request(&mut recorder, 0, &clock, None, &NullTelemetry);

        request_count += 1;

        let now = clock.now_ms();
        if now - last_rotation >= rotation_period.as_millis() as i64 {
            last_rotation = now;
            engine.hosts.rotate(now);
        }

        if request_count.is_multiple_of(200) {
            info!("{} requests processed so far", request_count);
            info!("{}", engine.format_stat().trim_end());
        }

        let now_epoch_s = clock.now_epoch_s();
        if engine.dispatcher.diffstat_due(now_epoch_s) {
            engine.dispatcher.dump_diffstat(
                &mut diffstat_recorder,
                &engine.hosts,
                &default_sink,
                now_epoch_s,
                clock.now_ms(),
            );
        }

        std::thread::sleep(period.saturating_sub(period / 10));
    }

    info!("Shutting down after {} requests", request_count);
    for line in engine.hosts.report_lines(true) {
        info!("{line}");
    }
}
