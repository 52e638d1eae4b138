// ===============================
// src/main.rs
// ===============================
/*
 cd /home/kukuhtw/rust/order_monitor

 # submit + cek status
curl -s -XPOST localhost:8080/orders -H 'content-type: application/json' -d '{"item":"widget","amount":9.99}'
curl -s localhost:8080/orders/1
curl -s localhost:8080/orders/stats

# metrics pipeline
curl -s localhost:8080/metrics | egrep '^orders_|^order_processing_duration'

*/
/*
=============================================================================
Project : order_monitor — async order intake & simulated processing service
Module  : <module_name>.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Accepts orders over REST, persists them as RECEIVED, processes
          them on a bounded worker pool (random latency, random failure),
          records status transitions and exposes Prometheus metrics.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::{select, sync::oneshot, time::interval};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use order_monitor::config::{self, Cli};
use order_monitor::dispatcher::Dispatcher;
use order_monitor::http::{self, AppState};
use order_monitor::metrics::Metrics;
use order_monitor::processor::Processor;
use order_monitor::rng::{Randomness, SeededRandom, ThreadRandom};
use order_monitor::service::OrderService;
use order_monitor::store::MemoryStore;

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let cli = Cli::parse();
    let settings = match config::load(&cli) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(
        http = %format!("{}:{}", settings.http_addr, settings.http_port),
        core = settings.pool.core_concurrency,
        max = settings.pool.max_concurrency,
        queue_capacity = settings.pool.queue_capacity,
        min_delay_ms = settings.processor.min_delay.as_millis() as u64,
        max_delay_ms = settings.processor.max_delay.as_millis() as u64,
        failure_probability = settings.processor.failure_probability,
        seeded = settings.processor.rng_seed.is_some(),
        "startup config"
    );

    // ---- Wiring (eksplisit, tanpa container global) ----
    let metrics = Arc::new(Metrics::new(settings.duration_window));
    let store = Arc::new(MemoryStore::new());
    let rng: Arc<dyn Randomness> = match settings.processor.rng_seed {
        Some(seed) => Arc::new(SeededRandom::new(seed)),
        None => Arc::new(ThreadRandom),
    };
    let processor = Processor::new(store.clone(), metrics.clone(), rng, settings.processor.clone());
    let dispatcher = Arc::new(Dispatcher::new(settings.pool.clone(), Arc::new(processor), metrics.clone()));
    if let Err(e) = dispatcher.start() {
        error!(error = %e, "dispatcher failed to start");
        return ExitCode::FAILURE;
    }
    let service = OrderService::new(store.clone(), metrics.clone(), dispatcher.clone());

    let addr: SocketAddr = match format!("{}:{}", settings.http_addr, settings.http_port).parse() {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, addr = %settings.http_addr, "bad HTTP_ADDR");
            return ExitCode::FAILURE;
        }
    };

    // ---- HTTP ----
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let state = AppState { service, metrics: metrics.clone() };
    let mut server = tokio::spawn(http::serve(
        addr,
        state,
        async move {
            let _ = stop_rx.await;
        },
        |_| {},
    ));

    // ---- Heartbeat sampai Ctrl-C (atau server mati) ----
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut tick = interval(settings.heartbeat);
    let mut server_done = false;
    loop {
        select! {
            _ = &mut ctrl_c => {
                info!("ctrl-c received, shutting down");
                break;
            }
            res = &mut server => {
                server_done = true;
                match res {
                    Ok(Ok(())) => warn!("http server stopped"),
                    Ok(Err(e)) => error!(error = %e, "http server error"),
                    Err(e) => error!(error = %e, "http task join error"),
                }
                break;
            }
            _ = tick.tick() => {
                let s = dispatcher.stats();
                info!(
                    workers = s.workers,
                    idle = s.idle,
                    in_flight = s.in_flight,
                    queued = s.queued,
                    completed = s.completed,
                    rejected = s.rejected,
                    store_size = store.len(),
                    "heartbeat"
                );
            }
        }
    }

    // ---- Shutdown: stop HTTP dulu, lalu habiskan backlog ----
    let _ = stop_tx.send(());
    if !server_done {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "http server error"),
            Err(e) => error!(error = %e, "http task join error"),
        }
    }
    if !dispatcher.shutdown(settings.shutdown_grace).await {
        warn!("dispatcher did not terminate within grace period");
    }
    info!("bye");
    ExitCode::SUCCESS
}
