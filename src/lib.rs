//! # session-sync
//!
//! Reconciles AI coding-agent transcripts from three asynchronous sources:
//! the agent's live push stream, its append-only JSONL log, and (for Claude
//! and Pi) the branch structure inside that log.
//!
//! ```text
//! raw log ─▶ dag ─▶ normalizer ─▶ Session ─▶ index (summaries)
//!                                    │
//!   pushes ─▶ events ─▶ follow ─▶ merge ─▶ pagination
//! ```

pub mod claude;
pub mod codex;
pub mod config;
pub mod dag;
pub mod error;
pub mod events;
pub mod follow;
pub mod index;
pub mod merge;
pub mod normalizer;
pub mod pagination;
pub mod pi;
pub mod sessions;
pub mod shell;
pub mod watcher;

pub use error::{Result, SyncError};
