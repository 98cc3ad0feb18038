//! Job orchestration and domain logic for crawlbatch.
//!
//! This crate ties together row normalization, the resumable job runner,
//! per-group result persistence, progress reporting and export formatting.

pub mod export;
pub mod normalize;
pub mod persistence;
pub mod progress;
pub mod runner;

pub use export::{EXPORT_HEADER, ExportRow, NO_RESULT, export_rows};
pub use normalize::normalize_rows;
pub use persistence::{LoadedState, MemoryStore, PersistentStore, load, merge, reset};
pub use progress::{Pacer, ProgressObserver, ProgressSnapshot, SilentProgress, WatchProgress, percent};
pub use runner::{JobContext, JobRunner, RunReport, StopSignal};
