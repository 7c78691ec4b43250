//! Structured logging to JSONL files.
//!
//! Every process embedding the engine (the CLI, a mobile shell, a test
//! harness) names itself a *source* and appends to its own file, so several
//! processes sharing a data directory never interleave partial lines.
//!
//! ## Layout
//!
//! ```text
//! <data_dir>/logs/
//! └── raw/                         # one file per source per day
//!     ├── 2026-10-18_cli.jsonl
//!     └── 2026-10-18_app.jsonl
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use clearmind_sync::logging::LoggingBuilder;
//!
//! let _guard = LoggingBuilder::new(data_dir.join("logs"), "cli")
//!     .with_filter("clearmind_sync=debug")
//!     .init()?;
//! ```
//!
//! ### Querying logs with jq
//!
//! ```bash
//! # Every dropped outbox entry
//! jq 'select(.msg == "Remote rejected entry, dropping it")' logs/raw/*.jsonl
//!
//! # Drains, oldest first
//! cat logs/raw/*.jsonl | jq -s 'sort_by(.ts) | .[] | select(.msg | startswith("Drain"))'
//! ```

mod entry;
mod layer;
mod writer;

pub use entry::JsonLogEntry;
pub use layer::{JsonlLayer, LoggingBuilder};
pub use writer::{read_entries, SourceLogWriter};
