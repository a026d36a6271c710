//! # Viewport Module
//!
//! - **`element`**: The `TrackedElement` contract and `VirtualElement`.
//! - **`tracker`**: The debounced, deduplicating `ViewportTracker`.

/// Tracked-element contract.
pub mod element;
/// Viewport tracker.
pub mod tracker;

pub use element::{ElementEvent, ElementMetrics, ListenerId, TrackedElement, VirtualElement, WatchOptions};
pub use tracker::{TrackerConfig, ViewportEvent, ViewportTracker};
