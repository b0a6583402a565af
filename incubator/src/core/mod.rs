//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules are free of I/O side effects. They turn raw model text into
//! validated JSON and describe the on-disk record types; everything that
//! touches the filesystem or a provider lives in [`crate::io`].

pub mod extract;
pub mod normalize;
pub mod schema;
pub mod types;
pub mod validate;
