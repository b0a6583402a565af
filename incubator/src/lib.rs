//! Multi-model startup incubator pipeline.
//!
//! Several model providers act as founders, advisors and investors across
//! three stages (ideate and select, build and iterate, seed pitch). The
//! crate is organized around three guarantees:
//!
//! - **Resumability**: every stage result is written durably before the
//!   [`io::checkpoint`] claims it, and claims are verified against the
//!   files before they are trusted.
//! - **Fault isolation**: one participant's failure becomes a ledger entry
//!   ([`stage_exec`]) instead of aborting its siblings.
//! - **Tolerant parsing**: model output is extracted, normalized and then
//!   validated against a strict schema ([`core`], [`call`]).
//!
//! - **[`core`]**: Pure, deterministic logic (schemas, normalization,
//!   validation, JSON extraction). No I/O.
//! - **[`io`]**: Side-effecting operations (files, checkpoint, providers,
//!   child processes).
//!
//! [`pipeline`] coordinates both to implement the CLI commands.

pub mod call;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod limiter;
pub mod logging;
pub mod pipeline;
pub mod pool;
pub mod report;
pub mod stage_exec;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
