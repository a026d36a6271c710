//! # Content Stream Store Module
//!
//! Per-page spatial cache of delivered sections plus the transient state that
//! accompanies a load cycle (progress entries, widget content, table rows).
//!
//! - **`page_stream`**: The `PageStream` value: sections keyed by `SectionKey`,
//!   completion flag and layout totals.
//! - **`progress`**: `(operation, id)` progress entries.
//! - **`content_store`**: The shared, lock-protected `ContentStore` and its
//!   change notifications.

/// Shared store and its events.
pub mod content_store;
/// Sections and per-page accumulation.
pub mod page_stream;
/// Progress entry types.
pub mod progress;

pub use content_store::{ContentStore, StoreEvent, TableSnapshot};
pub use page_stream::{PageStream, Section, ViewportContent};
pub use progress::{ProgressEntry, ProgressKey};
