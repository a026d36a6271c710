//! The tracked-element contract and a headless implementation of it.
//!
//! A tracked element is anything with a scroll position and a visible size
//! that can notify listeners about visibility crossings and scrolls. Listeners
//! are plain channels: subscribing hands the element a sender, unsubscribing
//! takes it back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc::UnboundedSender;

use crate::core::bounds::ViewportBounds;

/// Handle returned by [`TrackedElement::subscribe`].
pub type ListenerId = u64;

/// Scroll position and visible size of a container.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ElementMetrics {
    /// Vertical scroll offset.
    pub scroll_top: f64,
    /// Horizontal scroll offset.
    pub scroll_left: f64,
    /// Visible width.
    pub client_width: f64,
    /// Visible height.
    pub client_height: f64,
}

impl ElementMetrics {
    /// The visible rectangle.
    pub fn bounds(&self) -> ViewportBounds {
        ViewportBounds::new(
            self.scroll_top,
            self.scroll_top + self.client_height,
            self.scroll_left,
            self.scroll_left + self.client_width,
        )
    }
}

/// Notifications delivered to a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementEvent {
    /// The element crossed a visibility threshold (margin included).
    Intersection {
        /// Whether it is now (nearly) visible.
        visible: bool,
    },
    /// The scroll position or size changed.
    Scroll,
}

/// How a listener wants to watch.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WatchOptions {
    /// Pre-expansion of the visibility region, in container units.
    pub root_margin: f64,
}

/// Contract every tracked container satisfies.
pub trait TrackedElement: Send + Sync {
    /// Current scroll position and size.
    fn metrics(&self) -> ElementMetrics;

    /// Starts delivering events to `listener`.
    fn subscribe(&self, options: WatchOptions, listener: UnboundedSender<ElementEvent>) -> ListenerId;

    /// Stops delivering events to `id`. Unknown ids are ignored.
    fn unsubscribe(&self, id: ListenerId);
}

/// # Virtual Element
///
/// Scroll container without a screen. Used by the console client, the live
/// diagnostics binary and tests.
#[derive(Debug)]
pub struct VirtualElement {
    metrics: Mutex<ElementMetrics>,
    listeners: Mutex<HashMap<ListenerId, (WatchOptions, UnboundedSender<ElementEvent>)>>,
    next_id: AtomicU64,
}

impl VirtualElement {
    /// Element of `width` × `height`, scrolled to the origin.
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            metrics: Mutex::new(ElementMetrics {
                client_width: width,
                client_height: height,
                ..ElementMetrics::default()
            }),
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn broadcast(&self, event: ElementEvent) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|_, (_, tx)| tx.send(event).is_ok());
    }

    /// Moves the scroll position and emits a scroll event.
    pub fn scroll_to(&self, top: f64, left: f64) {
        {
            let mut m = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
            m.scroll_top = top;
            m.scroll_left = left;
        }
        self.broadcast(ElementEvent::Scroll);
    }

    /// Changes the visible size and emits a scroll event.
    pub fn resize(&self, width: f64, height: f64) {
        {
            let mut m = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
            m.client_width = width;
            m.client_height = height;
        }
        self.broadcast(ElementEvent::Scroll);
    }

    /// Emits a visibility crossing.
    pub fn notify_intersection(&self, visible: bool) {
        self.broadcast(ElementEvent::Intersection { visible });
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Largest root margin requested by any listener.
    pub fn root_margin(&self) -> f64 {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|(options, _)| options.root_margin)
            .fold(0.0, f64::max)
    }
}

impl TrackedElement for VirtualElement {
    fn metrics(&self) -> ElementMetrics {
        *self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self, options: WatchOptions, listener: UnboundedSender<ElementEvent>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (options, listener));
        id
    }

    fn unsubscribe(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_bounds_follow_scroll_and_size() {
        let element = VirtualElement::new(300.0, 500.0);
        assert_eq!(element.metrics().bounds(), ViewportBounds::new(0.0, 500.0, 0.0, 300.0));

        element.scroll_to(600.0, 20.0);
        assert_eq!(element.metrics().bounds(), ViewportBounds::new(600.0, 1100.0, 20.0, 320.0));
    }

    #[test]
    fn test_listeners_receive_and_detach() {
        let element = VirtualElement::new(10.0, 10.0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = element.subscribe(WatchOptions { root_margin: 200.0 }, tx);
        assert_eq!(element.root_margin(), 200.0);

        element.notify_intersection(true);
        element.scroll_to(5.0, 0.0);
        assert_eq!(rx.try_recv().unwrap(), ElementEvent::Intersection { visible: true });
        assert_eq!(rx.try_recv().unwrap(), ElementEvent::Scroll);

        element.unsubscribe(id);
        element.scroll_to(6.0, 0.0);
        assert!(rx.try_recv().is_err());
        assert_eq!(element.listener_count(), 0);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let element = VirtualElement::new(10.0, 10.0);
        let (tx, rx) = mpsc::unbounded_channel();
        element.subscribe(WatchOptions::default(), tx);
        drop(rx);
        element.scroll_to(1.0, 1.0);
        assert_eq!(element.listener_count(), 0);
    }
}
