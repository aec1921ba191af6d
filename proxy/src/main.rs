// cnproxy — Cryptonote Stratum mining proxy
//
// Miners connect downstream over TCP or TLS; the proxy multiplexes them
// onto shared upstream pool sessions, giving each miner a disjoint slice
// of the nonce space.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use colored::Colorize;
use tracing::info;

use cnproxy::config::{self, Config, VERSION};
use cnproxy::dashboard::{self, DashboardState};
use cnproxy::proxy;
use cnproxy::stats::{self, Stats};
use cnproxy::stratum::server::StratumServer;
use cnproxy::upstream::Registry;

fn main() -> Result<()> {
    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            println!("Failed to read config.json ({:#}), running configurator", err);
            config::configurator()?
        }
    };
    cfg.validate()?;

    init_logging(&cfg);

    let threads = num_cpus::get().min(cfg.max_concurrency);

    if cfg.title {
        print_title(&cfg, threads);
    }

    info!("Using pool {}", cfg.pools[0].url);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()?;
    runtime.block_on(run(cfg))
}

fn init_logging(cfg: &Config) {
    colored::control::set_override(cfg.colors);

    let filter = if cfg.verbose { "cnproxy=debug" } else { "cnproxy=info" };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_ansi(cfg.colors)
        .with_target(false);

    if cfg.log_date {
        builder.init();
    } else {
        builder.without_time().init();
    }
}

fn print_title(cfg: &Config, threads: usize) {
    let star = " * ".green().bold();

    println!("{}{}{}", star, "VERSION      ", format!("cnproxy v{}", VERSION).cyan());
    println!(
        "{}{}{}",
        star,
        "PLATFORM     ",
        format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)
    );

    let threads_str = threads.to_string();
    let threads_col = match threads {
        1 => threads_str.red(),
        2 => threads_str.yellow(),
        _ => threads_str.green(),
    };
    println!("{}{}{} threads", star, "CONCURRENCY  ", threads_col);

    for (i, pool) in cfg.pools.iter().enumerate() {
        let url = if pool.tls { pool.url.green() } else { pool.url.cyan() };
        println!("{}POOL #{}      {}", star, i, url);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let (server, incoming) = StratumServer::new();
    let registry = Registry::new(cfg.pools[0].clone(), Arc::clone(&server));
    let stats = Stats::new();

    tokio::spawn(stats::run(
        stats.clone(),
        Arc::clone(&server),
        Arc::clone(&registry),
        Duration::from_secs(cfg.print_interval as u64),
    ));

    if let Some(entry) = cfg.dashboard.clone() {
        let state = DashboardState {
            stats: stats.clone(),
            server: Arc::clone(&server),
            registry: Arc::clone(&registry),
            config: cfg.clone(),
        };
        tokio::spawn(async move {
            if let Err(err) = dashboard::run(entry, state).await {
                tracing::error!("dashboard failed: {:#}", err);
            }
        });
    }

    tokio::spawn(proxy::dispatch_connections(
        Arc::clone(&server),
        Arc::clone(&registry),
        stats,
        incoming,
    ));

    // Bind every listener up front so a bad endpoint is a startup error,
    // then serve them all; the task never returns in normal operation.
    let mut bound = Vec::with_capacity(cfg.bind.len());
    for entry in &cfg.bind {
        bound.push(server.bind(entry).await?);
    }

    let mut accept_loops = Vec::with_capacity(bound.len());
    for listener in bound {
        accept_loops.push(tokio::spawn(Arc::clone(&server).serve(listener)));
    }
    for accept_loop in accept_loops {
        accept_loop.await?;
    }
    Ok(())
}
