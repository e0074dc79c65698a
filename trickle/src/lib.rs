//! Bandwidth throttling wrappers for byte-stream I/O.
//!
//! Wrap a socket, file or any other byte stream and get the same read/write
//! interface back, with transfers paced to a configured rate and a bounded
//! burst allowance. The transfer logic on either side does not change; the
//! wrapper consults a capacity source before each operation and reports the
//! amount that actually moved afterwards.
//!
//! Two execution models are supported. [`blocking::Throttled`] blocks the
//! calling thread while capacity accrues and suits `std::io` streams;
//! [`aio::Throttled`] suspends only the calling task and implements the
//! tokio I/O traits. One throttle governs one direction of one stream; a
//! direction without a configured limit passes through untouched, with the
//! same accounting.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
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
#![allow(clippy::multiple_crate_versions)]

pub mod aio;
pub mod blocking;
pub mod config;

pub use trickle_throttle as throttle;
