//! I/O helpers: run directory layout, durable files, providers, prompts.

pub mod checkpoint;
pub mod config;
pub mod events;
pub mod fsutil;
pub mod jsonl;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod run_paths;
