//! pulsebee: reading sample for the `pulsebee-client` lifecycle engine
//!
//! The binary follows one topic with a reader, logs every message and every
//! reader state change, and reports readiness derived from the reader state.
//! A demo heartbeat producer keeps the topic busy. Everything runs on the
//! in-process loopback broker, so the sample needs no external service.
//!
//! ## Modules
//!
//! * `config`: Configuration structures, loading and validation. TOML files
//!   are located through `PULSEBEE_CONFIG` or `/etc/pulsebee/config.toml` and
//!   validated with the `validator` crate.
//!
//! * `core`: Runtime components:
//!   - Reading loop, state-change logging and the heartbeat producer
//!   - Readiness tracking derived from the reader state
//!
//! * `logger`: Centralized logging initialization using `tracing`.
//!   Supports console output in multiple formats (compact, pretty, JSON)
//!   and optional systemd journald integration.

pub mod config;
pub mod core;
pub mod logger;
