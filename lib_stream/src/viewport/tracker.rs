//! # Viewport Tracker
//!
//! Turns scroll and visibility activity of tracked containers into
//! `page.stream` requests, at most one per page per section key.
//!
//! ## How a request is decided
//!
//! 1.  Each tracked page owns a watch task fed by its element's listener
//!     channel. Visibility crossings are evaluated immediately; scroll events
//!     re-arm a debounce timer and are evaluated once the container has been
//!     quiet for `debounce`.
//! 2.  An evaluation reads the element's bounds, tags them with the dominant
//!     scroll direction, and rounds them into a `SectionKey`.
//! 3.  If the key is already requested for the page, or the store already
//!     holds it, nothing is sent. Otherwise the key is marked and the request
//!     goes out. A refused send unmarks the key so the next event retries.
//!
//! Evaluation and `stop_tracking` both run under the page table lock, and each
//! watch task carries the generation it was started with. Once `stop_tracking`
//! returns, no further request for that tracker can be issued.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::bounds::{ScrollDirection, SectionKey, ViewportBounds, SECTION_GRID};
use crate::core::envelope::{OutboundEnvelope, OutboundSink, PageStreamRequest, PAGE_STREAM_ACTION};
use crate::core::errors::TransportError;
use crate::store::content_store::ContentStore;
use crate::store::page_stream::ViewportContent;
use crate::viewport::element::{ElementEvent, ListenerId, TrackedElement, WatchOptions};

const EVENT_CAPACITY: usize = 256;

/// Tracker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Cell size used to round bounds into section keys.
    pub grid_size: f64,
    /// Quiet period required after a scroll before bounds are evaluated.
    pub debounce: Duration,
    /// Visibility pre-expansion, also sent as the request's `preload_buffer`.
    pub preload_margin: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            grid_size: SECTION_GRID,
            debounce: Duration::from_millis(100),
            preload_margin: 200.0,
        }
    }
}

/// One evaluation of a tracked page's viewport.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportEvent {
    /// Page id.
    pub page_id: String,
    /// Bounds that were evaluated, with direction.
    pub bounds: ViewportBounds,
    /// Section the bounds round to.
    pub section: SectionKey,
    /// Whether a request was sent for `section`.
    pub requested: bool,
}

struct PageTracker {
    element: Arc<dyn TrackedElement>,
    listener: ListenerId,
    token: CancellationToken,
    generation: u64,
    last_bounds: Option<ViewportBounds>,
    requested: HashSet<SectionKey>,
}

struct TrackerShared {
    config: TrackerConfig,
    outbound: Arc<dyn OutboundSink>,
    store: Arc<ContentStore>,
    pages: Mutex<HashMap<String, PageTracker>>,
    generation: AtomicU64,
    events: broadcast::Sender<ViewportEvent>,
}

/// # Viewport Tracker
///
/// Cheap to clone; clones share the same page table.
#[derive(Clone)]
pub struct ViewportTracker {
    shared: Arc<TrackerShared>,
}

impl ViewportTracker {
    /// Creates a tracker sending through `outbound` and consulting `store`.
    pub fn new(config: TrackerConfig, outbound: Arc<dyn OutboundSink>, store: Arc<ContentStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(TrackerShared {
                config,
                outbound,
                store,
                pages: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Tuning in effect.
    pub fn config(&self) -> &TrackerConfig {
        &self.shared.config
    }

    /// Subscribes to evaluation events. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<ViewportEvent> {
        self.shared.events.subscribe()
    }

    /// Starts watching `element` for `page_id`, replacing any existing tracker
    /// for the page, and evaluates the current viewport right away.
    ///
    /// Request state for the page survives a replacement. Must be called from
    /// within a tokio runtime.
    pub fn start_tracking(&self, page_id: &str, element: Arc<dyn TrackedElement>) {
        let shared = &self.shared;
        let previous = shared.detach(page_id);

        shared.store.ensure_page(page_id);
        if !shared.store.is_complete(page_id) && shared.store.progress(PAGE_STREAM_ACTION, page_id).is_none() {
            shared
                .store
                .start_progress(PAGE_STREAM_ACTION, page_id, &format!("Loading {page_id}"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let listener = element.subscribe(
            WatchOptions {
                root_margin: shared.config.preload_margin,
            },
            tx,
        );
        let token = CancellationToken::new();
        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (last_bounds, requested) = previous
            .map(|p| (p.last_bounds, p.requested))
            .unwrap_or_default();

        shared.lock_pages().insert(
            page_id.to_string(),
            PageTracker {
                element,
                listener,
                token: token.clone(),
                generation,
                last_bounds,
                requested,
            },
        );

        tokio::spawn(watch(
            Arc::clone(shared),
            page_id.to_string(),
            generation,
            rx,
            token,
        ));
        log::info!("Tracking viewport of page '{}'", page_id);

        shared.evaluate(page_id, Some(generation));
    }

    /// Detaches the watcher for `page_id` and cancels its pending debounce.
    ///
    /// Returns whether the page was tracked. No request for it is issued after
    /// this returns.
    pub fn stop_tracking(&self, page_id: &str) -> bool {
        let stopped = self.shared.detach(page_id).is_some();
        if stopped {
            log::info!("Stopped tracking page '{}'", page_id);
        }
        stopped
    }

    /// Cached modules and widgets intersecting the last known viewport.
    pub fn get_viewport_content(&self, page_id: &str) -> ViewportContent {
        match self.last_bounds(page_id) {
            Some(bounds) => self.shared.store.content_in_bounds(page_id, &bounds),
            None => ViewportContent::default(),
        }
    }

    /// Last evaluated bounds of `page_id`.
    pub fn last_bounds(&self, page_id: &str) -> Option<ViewportBounds> {
        self.shared
            .lock_pages()
            .get(page_id)
            .and_then(|t| t.last_bounds)
    }

    /// `true` while `page_id` has a tracker.
    pub fn is_tracking(&self, page_id: &str) -> bool {
        self.shared.lock_pages().contains_key(page_id)
    }

    /// Tracked page ids, sorted.
    pub fn tracked_pages(&self) -> Vec<String> {
        let mut pages: Vec<String> = self.shared.lock_pages().keys().cloned().collect();
        pages.sort();
        pages
    }

    /// Discards the page's cached content and request state, then requests
    /// the current viewport again.
    pub fn refresh(&self, page_id: &str) -> Option<ViewportEvent> {
        self.shared.store.clear_page_stream(page_id);
        {
            let mut pages = self.shared.lock_pages();
            let tracker = pages.get_mut(page_id)?;
            tracker.requested.clear();
        }
        log::debug!("Refreshing page '{}'", page_id);
        self.shared.evaluate(page_id, None)
    }

    /// Forgets requested-but-unanswered sections on every tracked page and
    /// re-evaluates each viewport. Used after a reconnect.
    pub fn resync(&self) -> Vec<ViewportEvent> {
        let pages: Vec<String> = {
            let mut pages = self.shared.lock_pages();
            for (page_id, tracker) in pages.iter_mut() {
                let store = &self.shared.store;
                tracker.requested.retain(|key| store.has_section(page_id, key));
            }
            pages.keys().cloned().collect()
        };

        pages
            .iter()
            .filter_map(|page_id| self.shared.evaluate(page_id, None))
            .collect()
    }

    /// Re-evaluates `page_id` now, outside the event path.
    pub fn evaluate_now(&self, page_id: &str) -> Option<ViewportEvent> {
        self.shared.evaluate(page_id, None)
    }
}

impl TrackerShared {
    fn lock_pages(&self) -> std::sync::MutexGuard<'_, HashMap<String, PageTracker>> {
        self.pages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn detach(&self, page_id: &str) -> Option<PageTracker> {
        let tracker = self.lock_pages().remove(page_id)?;
        tracker.token.cancel();
        tracker.element.unsubscribe(tracker.listener);
        Some(tracker)
    }

    /// Evaluates `page_id`. With `Some(generation)`, only the watcher of that
    /// generation may evaluate.
    fn evaluate(&self, page_id: &str, generation: Option<u64>) -> Option<ViewportEvent> {
        let event = {
            let mut pages = self.lock_pages();
            let tracker = pages.get_mut(page_id)?;
            if generation.is_some_and(|g| g != tracker.generation) {
                return None;
            }
            self.evaluate_locked(page_id, tracker)
        };

        self.events.send(event.clone()).ok();
        Some(event)
    }

    fn evaluate_locked(&self, page_id: &str, tracker: &mut PageTracker) -> ViewportEvent {
        let raw = tracker.element.metrics().bounds();
        let direction = tracker
            .last_bounds
            .and_then(|prev| ScrollDirection::between(&prev, &raw).or(prev.scroll_direction));
        let bounds = raw.with_direction(direction);
        tracker.last_bounds = Some(bounds);

        let section = SectionKey::from_bounds(&bounds, self.config.grid_size);
        let requested = if tracker.requested.contains(&section) || self.store.has_section(page_id, &section) {
            log::trace!("Section {} of '{}' already satisfied", section, page_id);
            false
        } else {
            tracker.requested.insert(section);
            match self.request(page_id, &bounds) {
                Ok(()) => {
                    log::debug!("Requested section {} of '{}'", section, page_id);
                    true
                }
                Err(e) => {
                    tracker.requested.remove(&section);
                    log::warn!("Request for section {} of '{}' not sent: {}", section, page_id, e);
                    false
                }
            }
        };

        ViewportEvent {
            page_id: page_id.to_string(),
            bounds,
            section,
            requested,
        }
    }

    fn request(&self, page_id: &str, bounds: &ViewportBounds) -> Result<(), TransportError> {
        let request = PageStreamRequest::new(page_id, bounds, self.config.preload_margin);
        self.outbound.send(OutboundEnvelope::page_stream(&request)?)
    }
}

async fn watch(
    shared: Arc<TrackerShared>,
    page_id: String,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ElementEvent>,
    token: CancellationToken,
) {
    let quiet = shared.config.debounce;
    let debounce = tokio::time::sleep(quiet);
    tokio::pin!(debounce);
    let mut armed = false;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Some(ElementEvent::Scroll) => {
                    debounce.as_mut().reset(Instant::now() + quiet);
                    armed = true;
                }
                Some(ElementEvent::Intersection { visible: true }) => {
                    shared.evaluate(&page_id, Some(generation));
                }
                Some(ElementEvent::Intersection { visible: false }) => {}
                None => break,
            },
            () = &mut debounce, if armed => {
                armed = false;
                shared.evaluate(&page_id, Some(generation));
            }
        }
    }
    log::debug!("Viewport watcher for '{}' (gen {}) exited", page_id, generation);
}
