//! Latency rates from two samples of a Prometheus endpoint.
//!
//! This library supports the `latency-top` binary. A [`Snapshot`] is parsed
//! from each scrape of the endpoint, and [`compute_delta`] turns a pair of
//! them into per-table event counts and average latencies for the `_sum` /
//! `_count` latency families.

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
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod delta;
pub mod report;
pub mod scrape;

pub use delta::{Rate, Rates, aggregate_by_tag, compute_delta};
pub use scrape::parser::{Sample, Snapshot, parse_snapshot};
