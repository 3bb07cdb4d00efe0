//! A pluggable agent that scrapes typed samples from text metrics endpoints.
//!
//! A source is described by a JSON configuration and loaded as one of three
//! kinds. REST and Generic sources locate each metric with its own regular
//! expression; Prometheus sources speak the text exposition format and can
//! describe the metrics they expose. The caller owns scheduling: every poll
//! reports when the source is next due.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

pub mod collector;
pub mod config;
pub mod exposition;
pub mod metric;
pub mod rest;
mod telemetry;
pub mod transport;
