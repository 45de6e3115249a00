pub mod clock;
pub mod config;
pub mod context;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod kv_store;
pub mod models;
pub mod program_store;
pub mod repetition;
pub mod scheduler;
pub mod telemetry;
