//! # beacon-core
//!
//! A client-side diagnostic recording agent for long-running applications.
//!
//! Producer threads push log records and metric samples into a [`Publisher`],
//! which runs them through a [`filter::FilterChain`], fans them out to a
//! [`notifier::Notifier`] for in-process alerting, and writes them durably to
//! rolling session files on a dedicated consumer thread. Closed sessions are
//! handed to `beacon-repository` for on-disk indexing and to `beacon-upload`
//! for resumable delivery to a remote hub.
//!
//! ## Pipeline
//!
//! 1. [`publisher::Publisher::start`] spawns the single consumer thread and
//!    returns a cloneable [`publisher::PublisherHandle`] for producers.
//! 2. Each record passes through the [`filter::FilterChain`] before being
//!    written; a filter may suppress it outright.
//! 3. Surviving records are published to [`notifier::Notifier`] subscribers
//!    and appended to the active [`messenger::SessionFileMessenger`].
//! 4. [`publisher::Publisher::stop`] drains the queue, closes the session
//!    file, and returns its [`beacon_framing::SessionSummary`].
//!
//! ## Modules
//!
//! - [`config`] — Configuration option groups and their serde forms
//! - [`environment`] — Host fingerprint collection (OS, arch, memory, pid)
//! - [`errors`] — The typed error taxonomy and process exit codes
//! - [`filter`] — The publisher's serial, suppression-capable filter chain
//! - [`metrics`] — Metric definition registry and per-instance materialization
//! - [`messenger`] — Durable, rolling session file writer
//! - [`notifier`] — Coalescing in-process alert subscriptions
//! - [`publisher`] — The single-consumer, multi-producer orchestrator

pub mod config;
pub mod environment;
pub mod errors;
pub mod filter;
pub mod messenger;
pub mod metrics;
pub mod notifier;
pub mod publisher;

pub use errors::{AgentError, ExitCode, Result};
