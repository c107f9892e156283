use anyhow::Context;
use clap::Parser;
use gossip::cli::{init_logging, Cli};
use gossip::config::{self, Config};
use gossip::director::{Director, Retransmitter, SWEEP_INTERVAL};
use gossip::error::GossipError;
use gossip::runtime::{wait_for_shutdown, Runtime};
use gossip::scenario::Catalog;
use gossip::stats::StatsCollector;
use gossip::tester::Tester;
use gossip::transport::Providers;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Exit status when a scenario hit a configuration defect
const EXIT_FATAL: i32 = 2;
/// Exit status when the run could not start
const EXIT_STARTUP: i32 = 1;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_file.as_deref()) {
        eprintln!("Error: {}", e);
        std::process::exit(EXIT_STARTUP);
    }

    let code = match run(cli).await {
        Ok(None) => 0,
        Ok(Some(fatal)) => {
            error!(error = %fatal, "aborted on scenario error");
            eprintln!("Error: {}", fatal);
            EXIT_FATAL
        }
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            EXIT_STARTUP
        }
    };
    std::process::exit(code);
}

/// Run every scheduled scenario. `Ok(Some(_))` carries the fatal scenario
/// error that stopped the run.
async fn run(cli: Cli) -> anyhow::Result<Option<GossipError>> {
    let cfg = match &cli.config {
        Some(path) => config::load_from_file(path)?,
        None => Config::default(),
    };
    let catalog = Arc::new(Catalog::load_paths(&cli.paths)?);
    info!(
        suites = catalog.suites().len(),
        scenarios = catalog.scenario_count(),
        "scenarios loaded"
    );

    let director = Arc::new(Director::new(
        cfg.route_queue_capacity,
        Arc::new(Retransmitter::new(cfg.retransmit_policy())),
        Arc::new(StatsCollector::new()),
    ));
    let sweeper = director.spawn_sweeper(SWEEP_INTERVAL);
    let providers = Providers::start(&cfg.local_endpoints()?, director.clone())
        .await
        .context("starting transport providers")?;
    let runtime = Runtime::new(
        &cfg,
        director.clone(),
        providers.clone(),
        providers.local_endpoints(),
    )?;

    let flag = runtime.shutdown_flag();
    ctrlc::set_handler(move || {
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .context("installing signal handler")?;

    let fatal: Arc<Mutex<Option<GossipError>>> = Arc::new(Mutex::new(None));
    let flag = runtime.shutdown_flag();
    for id in catalog.schedule(cfg.loops, cfg.continuous) {
        if runtime.is_shutdown_requested() {
            break;
        }
        let created = tokio::select! {
            t = Tester::create(runtime.clone(), catalog.clone(), id) => t,
            _ = wait_for_shutdown(&flag) => break,
        };
        let tester = match created {
            Ok(t) => t,
            Err(e) => {
                record_failure(&runtime, &fatal, e);
                break;
            }
        };
        let runtime = runtime.clone();
        let fatal = fatal.clone();
        tokio::spawn(async move {
            if let Err(e) = tester.run().await {
                record_failure(&runtime, &fatal, e);
            }
        });
    }

    if runtime.is_shutdown_requested() {
        info!("shutdown requested, waiting for running scenarios");
    }
    runtime.limiter().wait().await;
    providers.close().await;
    sweeper.abort();

    let snapshot = runtime.stats().snapshot();
    info!(summary = %snapshot, "run finished");
    println!("{}", snapshot);

    let fatal = fatal.lock().take();
    Ok(fatal)
}

/// Fatal errors stop the whole run; anything else only fails its scenario.
fn record_failure(runtime: &Runtime, fatal: &Mutex<Option<GossipError>>, e: GossipError) {
    if e.is_fatal() {
        error!(error = %e, "fatal scenario error, stopping");
        fatal.lock().get_or_insert(e);
        runtime.request_shutdown();
    } else {
        warn!(error = %e, "scenario failed");
    }
}
