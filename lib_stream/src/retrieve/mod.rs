//! # Data Retrieval Module
//!
//! HTTP access to widget assets. The widget registry stays network-agnostic;
//! this module plugs into it through a loader factory.
//!
//! - **`asset_http`**: `AssetClient` built on `reqwest` and
//!   `reqwest-middleware` with automatic retries and exponential backoff, and
//!   the `AssetLoader` that fetches component assets through it.

/// Widget asset client and loader.
pub mod asset_http;

pub use asset_http::{asset_loader_factory, AssetClient, AssetLoader};
