//! # Core Module
//!
//! The transport-independent building blocks of the page-streaming client.
//! Nothing in here opens a socket or spawns a task; the stateful components
//! (`store`, `viewport`, `transport`) are built on top of these.
//!
//! ## Core Components:
//!
//! - **`bounds`**: Viewport rectangles, scroll direction and the grid-rounded
//!   `SectionKey` used for request deduplication and caching.
//!
//! - **`envelope`**: The wire vocabulary. Outbound `{a, p}` envelopes, the
//!   `page.stream` request, and classification of every inbound frame into an
//!   `InboundMessage`.
//!
//! - **`errors`**: The five non-fatal error kinds and the `ErrorSink`
//!   collaborator they are reported to.
//!
//! - **`dispatcher`**: The longest-prefix action router.
//!
//! - **`registry`**: The widget registry with loading, error and missing
//!   placeholders.

/// Viewport bounds, scroll direction and section keys.
pub mod bounds;
/// Longest-prefix action router.
pub mod dispatcher;
/// Inbound classification and outbound envelopes.
pub mod envelope;
/// Error taxonomy and error sinks.
pub mod errors;
/// Widget packs and lazy render units.
pub mod registry;

// --- Public API Re-exports ---
pub use bounds::{ScrollDirection, SectionKey, ViewportBounds, SECTION_GRID};
pub use dispatcher::{DispatchOutcome, DispatchRouter, Handler, WILDCARD};
pub use envelope::{
    InboundMessage, OutboundEnvelope, OutboundSink, PageStreamPayload, PageStreamRequest,
    ProgressUpdate, StreamChunk, TableStreamChunk, WidgetContent, PAGE_STREAM_ACTION,
};
pub use errors::{
    CollectingErrorSink, DispatchError, ErrorSink, LogErrorSink, MissingReferenceError,
    ParseError, ResolutionError, StreamError, TransportError,
};
pub use registry::{
    descriptor_loader_factory, loader_fn, static_loader, ComponentManifest, LazyWidget,
    LoaderFactory, RenderUnit, WidgetComponent, WidgetLoader, WidgetPackManifest, WidgetRef,
    WidgetRegistry,
};
