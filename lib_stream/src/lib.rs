//! # lib_stream
//!
//! Client-side core for incremental, viewport-driven page delivery.
//!
//! A large page is never fetched whole. The [`viewport::ViewportTracker`]
//! watches which region of a scroll container is (nearly) visible, rounds it
//! to a grid-aligned [`core::SectionKey`], and asks the server for that section
//! once. Responses arrive over the [`transport::Transport`], are routed by the
//! [`pipeline::InboundPipeline`] to the [`core::DispatchRouter`] or the
//! [`store::ContentStore`], and the presentation layer resolves widget
//! references through the [`core::WidgetRegistry`], which always yields a
//! renderable unit (loading, ready, error or missing).
//!
//! ## Features
//!
//! - `transport` (default): WebSocket transport and [`client::StreamClient`].
//! - `assets` (default): HTTP widget asset loader with retries.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

// Router, registry and transport contain panics with `catch_unwind`.
#[cfg(panic = "abort")]
compile_error!("lib_stream must be built with panic = \"unwind\"");

pub mod core;
pub mod pipeline;
pub mod store;
pub mod viewport;

#[cfg(feature = "transport")]
pub mod client;
#[cfg(feature = "transport")]
pub mod transport;

#[cfg(feature = "assets")]
pub mod retrieve;

// --- Public API Re-exports ---
pub use crate::core::{
    DispatchRouter, ErrorSink, InboundMessage, OutboundEnvelope, RenderUnit, SectionKey, StreamError,
    ViewportBounds, WidgetRegistry,
};
pub use crate::pipeline::InboundPipeline;
pub use crate::store::{ContentStore, StoreEvent};
pub use crate::viewport::{TrackedElement, TrackerConfig, ViewportTracker, VirtualElement};

#[cfg(feature = "transport")]
pub use crate::client::{StreamClient, StreamClientConfig};
#[cfg(feature = "transport")]
pub use crate::transport::{ConnectionState, Transport, TransportConfig, TransportEvent};
