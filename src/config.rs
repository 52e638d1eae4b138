// ===============================
// src/config.rs
// ===============================
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
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing::warn;

/// CLI override (semua nilai lain dibaca dari ENV / .env)
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "order_monitor", version, about = "Order intake + async processing service")]
pub struct Cli {
    /// Path ke file .env (default: ./.env kalau ada)
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Override HTTP_PORT
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("POOL_MAX_CONCURRENCY must be >= 1")]
    ZeroMaxConcurrency,
    #[error("POOL_CORE_CONCURRENCY ({core}) must not exceed POOL_MAX_CONCURRENCY ({max})")]
    CoreAboveMax { core: usize, max: usize },
    #[error("PROCESS_MIN_DELAY_MS ({min}) must not exceed PROCESS_MAX_DELAY_MS ({max})")]
    DelayRange { min: u64, max: u64 },
    #[error("PROCESS_FAILURE_PROBABILITY must be within [0, 1], got {0}")]
    Probability(f64),
}

#[derive(Clone, Debug)]
pub struct PoolCfg {
    pub core_concurrency: usize,
    pub max_concurrency: usize,
    pub queue_capacity: usize,
    /// Berapa lama burst worker boleh idle sebelum keluar
    pub keep_alive: Duration,
}

impl Default for PoolCfg {
    fn default() -> Self {
        Self {
            core_concurrency: 4,
            max_concurrency: 10,
            queue_capacity: 50,
            keep_alive: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProcessorCfg {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub failure_probability: f64,
    pub rng_seed: Option<u64>,
}

impl Default for ProcessorCfg {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(2000),
            failure_probability: 0.1,
            rng_seed: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub http_addr: String,
    pub http_port: u16,
    pub pool: PoolCfg,
    pub processor: ProcessorCfg,
    pub shutdown_grace: Duration,
    pub heartbeat: Duration,
    pub duration_window: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0".to_string(),
            http_port: 8080,
            pool: PoolCfg::default(),
            processor: ProcessorCfg::default(),
            shutdown_grace: Duration::from_millis(5000),
            heartbeat: Duration::from_secs(10),
            duration_window: 1024,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.pool;
        if p.max_concurrency == 0 {
            return Err(ConfigError::ZeroMaxConcurrency);
        }
        if p.core_concurrency > p.max_concurrency {
            return Err(ConfigError::CoreAboveMax { core: p.core_concurrency, max: p.max_concurrency });
        }
        let pr = &self.processor;
        if pr.min_delay > pr.max_delay {
            return Err(ConfigError::DelayRange {
                min: pr.min_delay.as_millis() as u64,
                max: pr.max_delay.as_millis() as u64,
            });
        }
        if !(0.0..=1.0).contains(&pr.failure_probability) {
            return Err(ConfigError::Probability(pr.failure_probability));
        }
        Ok(())
    }
}

/// Baca ENV `key`; kalau kosong pakai default, kalau tidak bisa di-parse warn lalu default.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(%key, value = %raw, "config: cannot parse, using default");
                default
            }
        },
        _ => default,
    }
}

fn env_ms(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}

pub fn load(cli: &Cli) -> Result<Settings, ConfigError> {
    // Pastikan .env dibaca (agar POOL_*, PROCESS_*, dll ter-load)
    match &cli.env_file {
        Some(path) => {
            if let Err(e) = dotenvy::from_path(path) {
                warn!(?e, path = %path.display(), "config: env file not loaded");
            }
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    let d = Settings::default();

    // ===== HTTP =====
    let http_addr = env::var("HTTP_ADDR").unwrap_or(d.http_addr);
    let http_port = cli.port.unwrap_or_else(|| env_or("HTTP_PORT", d.http_port));

    // ===== Worker pool =====
    let pool = PoolCfg {
        core_concurrency: env_or("POOL_CORE_CONCURRENCY", d.pool.core_concurrency),
        max_concurrency: env_or("POOL_MAX_CONCURRENCY", d.pool.max_concurrency),
        queue_capacity: env_or("POOL_QUEUE_CAPACITY", d.pool.queue_capacity),
        keep_alive: env_ms("POOL_KEEP_ALIVE_MS", d.pool.keep_alive),
    };

    // ===== Processor =====
    //   PROCESS_MIN_DELAY_MS=500
    //   PROCESS_MAX_DELAY_MS=2000
    //   PROCESS_FAILURE_PROBABILITY=0.1
    //   PROCESS_RNG_SEED=42        (opsional, untuk run yang bisa diulang)
    let processor = ProcessorCfg {
        min_delay: env_ms("PROCESS_MIN_DELAY_MS", d.processor.min_delay),
        max_delay: env_ms("PROCESS_MAX_DELAY_MS", d.processor.max_delay),
        failure_probability: env_or("PROCESS_FAILURE_PROBABILITY", d.processor.failure_probability),
        rng_seed: env::var("PROCESS_RNG_SEED").ok().and_then(|s| s.trim().parse().ok()),
    };

    let settings = Settings {
        http_addr,
        http_port,
        pool,
        processor,
        shutdown_grace: env_ms("SHUTDOWN_GRACE_MS", d.shutdown_grace),
        heartbeat: Duration::from_secs(env_or("HEARTBEAT_SECS", d.heartbeat.as_secs()).max(1)),
        duration_window: env_or("DURATION_WINDOW", d.duration_window).max(1),
    };
    settings.validate()?;
    Ok(settings)
}
