// Demo binary: drives the dispatch engine with a simulated heartbeat link.
//
// A feeder thread plays the remote vehicle and pushes HEARTBEAT envelopes into an in-memory
// transport. The engine routes them to a handler, a status timer logs throughput once per
// second, and the run ends on Ctrl+C or after `--duration-secs`. Final statistics are
// printed as JSON.

use mavdispatch::{channel_transport, DispatchEngine, EngineConfig, Envelope};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Command-line options parsed from program arguments.
struct CliOptions {
    /// Worker threads in the handler pool
    workers: Option<usize>,
    /// Interval between simulated heartbeats
    heartbeat: Duration,
    /// Stop after this long; `None` runs until Ctrl+C
    duration: Option<Duration>,
}

/// Parse `--name=value` or `--name value` flags. Unknown flags and bad values are ignored.
fn parse_cli_options() -> CliOptions {
    let mut options = CliOptions {
        workers: None,
        heartbeat: Duration::from_millis(100),
        duration: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let (key, value) = match arg.split_once('=') {
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (arg.clone(), args.next()),
        };
        let Some(value) = value.and_then(|v| v.parse::<u64>().ok()) else {
            log::warn!("ignoring argument {arg}");
            continue;
        };
        match key.as_str() {
            "--workers" => options.workers = usize::try_from(value).ok(),
            "--heartbeat-ms" => options.heartbeat = Duration::from_millis(value.max(1)),
            "--duration-secs" if value > 0 => options.duration = Some(Duration::from_secs(value)),
            "--duration-secs" => options.duration = None,
            _ => log::warn!("unknown flag {key}"),
        }
    }
    options
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let options = parse_cli_options();

    let mut config = EngineConfig::default();
    if let Some(workers) = options.workers {
        config = config.with_workers(workers);
    }

    let (feeder_tx, transport) = channel_transport::<Envelope>();
    let engine: DispatchEngine<Envelope> = DispatchEngine::builder()
        .config(config)
        .transport(transport)
        .on_handler_failure(|failure| eprintln!("handler failure: {failure}"))
        .build();

    let heartbeats = Arc::new(AtomicU64::new(0));
    let heartbeat_count = heartbeats.clone();
    engine.push_handler("HEARTBEAT", move |message: &Envelope| {
        heartbeat_count.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "heartbeat {} after {:?} in flight",
            message.id,
            message.received_at.elapsed()
        );
        Ok(())
    });

    let status_count = heartbeats.clone();
    engine.add_timer(Duration::from_secs(1), move |ctx| {
        log::info!(
            "status #{}: {} heartbeats handled, {:?} late",
            ctx.firing(),
            status_count.load(Ordering::Relaxed),
            ctx.lateness()
        );
        Ok(())
    })?;

    // Ctrl+C only flips the lifecycle; the main thread does the joining.
    let stopper = engine.clone();
    ctrlc::set_handler(move || stopper.stop())?;

    engine.start()?;

    // The feeder drops its sender when done, which closes the transport and stops the engine.
    let feeder_engine = engine.clone();
    let heartbeat = options.heartbeat;
    let deadline = options.duration.map(|d| Instant::now() + d);
    let feeder = thread::Builder::new()
        .name("heartbeat-feeder".to_string())
        .spawn(move || {
            let mut sequence: u8 = 0;
            while feeder_engine.is_running() && deadline.map_or(true, |d| Instant::now() < d) {
                let payload = vec![6, 8, 81, 4, sequence];
                if feeder_tx.send(Envelope::new("HEARTBEAT", payload)).is_err() {
                    break;
                }
                sequence = sequence.wrapping_add(1);
                thread::sleep(heartbeat);
            }
        })?;

    engine.join();
    if feeder.join().is_err() {
        log::error!("feeder thread panicked");
    }

    println!("{}", serde_json::to_string_pretty(&engine.stats())?);
    Ok(())
}
