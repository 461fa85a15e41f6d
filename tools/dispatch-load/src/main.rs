//! Load generator for the asynchronous dispatch engine.
//!
//! Starts a bus from an optional configuration file, schedules synthetic publications from a
//! number of producer threads and reports how long it took until every handler ran.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use postbus_config::Config;
use postbus_dispatch::{
    AsyncBus, Delivery, HandlerError, HandlerInvocation, MessagePublication, PublicationError,
    handler_fn,
};

#[derive(Parser, Debug)]
struct Args {
    /// Path to a YAML or JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of publications scheduled by each producer.
    #[arg(long, default_value_t = 10_000)]
    publications: usize,
    /// Number of threads scheduling publications concurrently.
    #[arg(long, default_value_t = 1)]
    producers: usize,
    /// Number of handlers per publication.
    #[arg(long, default_value_t = 2)]
    handlers: usize,
    /// Delivers every other handler through the handler executor.
    #[arg(long)]
    mixed_delivery: bool,
    /// Every n-th handler invocation fails, 0 disables failures.
    #[arg(long, default_value_t = 0)]
    fail_every: usize,
    /// Simulated work per handler invocation in microseconds.
    #[arg(long, default_value_t = 0)]
    work_micros: u64,
    /// Gives up waiting for handlers after this many seconds.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

struct Stats {
    invoked: AtomicUsize,
    failed: AtomicUsize,
}

fn load_config(args: &Args) -> Result<Config> {
    match &args.config {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn invocations(args: &Args, stats: &Arc<Stats>) -> Vec<HandlerInvocation> {
    let work = Duration::from_micros(args.work_micros);
    let fail_every = args.fail_every;

    let handler = {
        let stats = stats.clone();
        Arc::new(handler_fn(move |_| {
            if !work.is_zero() {
                std::thread::sleep(work);
            }

            let invocation = stats.invoked.fetch_add(1, Ordering::Relaxed) + 1;
            if fail_every > 0 && invocation % fail_every == 0 {
                return Err(HandlerError::new("synthetic handler failure"));
            }
            Ok(())
        }))
    };

    (0..args.handlers)
        .map(|index| {
            let delivery = if args.mixed_delivery && index % 2 == 1 {
                Delivery::Asynchronous
            } else {
                Delivery::Synchronous
            };
            HandlerInvocation::new(handler.clone(), delivery)
        })
        .collect()
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    postbus_log::init(&config.logging);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let stats = Arc::new(Stats {
        invoked: AtomicUsize::new(0),
        failed: AtomicUsize::new(0),
    });

    let bus = {
        let stats = stats.clone();
        postbus_dispatch::AsyncBusBuilder::from_config(&config, Some(runtime.handle().clone()))?
            .error_handler(move |_: &PublicationError| {
                stats.failed.fetch_add(1, Ordering::Relaxed);
            })
            .build()?
    };

    let invocations = invocations(&args, &stats);
    let expected = args.publications * args.producers * args.handlers;
    let start = Instant::now();

    bus.scoped(|bus| {
        std::thread::scope(|scope| {
            for _ in 0..args.producers {
                scope.spawn(|| {
                    for i in 0..args.publications {
                        bus.schedule_async(MessagePublication::new(i, invocations.clone()));
                    }
                });
            }
        });
        let scheduled = start.elapsed();

        let deadline = start + Duration::from_secs(args.timeout_secs);
        while stats.invoked.load(Ordering::Relaxed) < expected && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        postbus_log::info!(
            scheduled_ms = scheduled.as_millis() as u64,
            total_ms = start.elapsed().as_millis() as u64,
            pending = bus.pending_messages(),
            "load finished"
        );
    });

    let invoked = stats.invoked.load(Ordering::Relaxed);
    let elapsed = start.elapsed().as_secs_f64();
    postbus_log::info!(
        invoked,
        expected,
        failed = stats.failed.load(Ordering::Relaxed),
        per_second = (invoked as f64 / elapsed) as u64,
        "handler invocations"
    );

    if invoked < expected {
        anyhow::bail!("only {invoked} of {expected} handler invocations completed in time");
    }

    Ok(())
}

fn main() {
    let exit_code = match run(Args::parse()) {
        Ok(()) => 0,
        Err(error) => {
            postbus_log::ensure_error(&*error);
            1
        }
    };

    process::exit(exit_code);
}
