// ===============================
// src/lib.rs
// ===============================
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod http;
pub mod metrics;
pub mod processor;
pub mod rng;
pub mod service;
pub mod store;
