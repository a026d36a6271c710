//! # Content Stream Store
//!
//! Single owner of everything the server has delivered: per-page sections,
//! widget contents, table rows, generic stream chunks and progress entries.
//!
//! All merges are idempotent and keyed by content identity (section key,
//! widget id, table offset) rather than by arrival order, so duplicated or
//! reordered responses converge on the same state. Observers subscribe to
//! [`StoreEvent`]s and pull fresh state from the store when notified.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::core::bounds::{SectionKey, ViewportBounds};
use crate::core::envelope::{PageStreamPayload, ProgressUpdate, StreamChunk, TableStreamChunk, WidgetContent};
use crate::core::errors::ParseError;
use crate::store::page_stream::{PageStream, Section, ViewportContent};
use crate::store::progress::{clamp_percent, ProgressEntry, ProgressKey};

const EVENT_CAPACITY: usize = 256;

/// Largest run of undelivered rows a table chunk may skip past the current end.
pub const MAX_TABLE_GAP: usize = 10_000;

/// Change notifications. Receivers re-read the store; events carry identities only.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A section was inserted (`fresh`) or overwritten.
    SectionMerged {
        /// Page id.
        page_id: String,
        /// Section key.
        key: SectionKey,
        /// `false` when an existing section was replaced.
        fresh: bool,
    },
    /// The page layout totals changed.
    LayoutUpdated {
        /// Page id.
        page_id: String,
    },
    /// The server signalled the page is complete.
    PageCompleted {
        /// Page id.
        page_id: String,
    },
    /// All sections of the page were discarded.
    PageCleared {
        /// Page id.
        page_id: String,
    },
    /// A progress entry was created or changed.
    ProgressChanged(ProgressEntry),
    /// A progress entry finished and was removed.
    ProgressCompleted(ProgressEntry),
    /// A generic stream received a chunk.
    StreamUpdated {
        /// Stream identity.
        key: ProgressKey,
        /// Last chunk received.
        complete: bool,
    },
    /// Widget content was replaced.
    WidgetContentUpdated {
        /// Widget instance id.
        widget_id: String,
    },
    /// Table rows were written.
    TableUpdated {
        /// Table id.
        table_id: String,
        /// Row count after the write.
        rows: usize,
        /// Last chunk received.
        complete: bool,
    },
}

#[derive(Debug, Default)]
struct TableBuffer {
    rows: Vec<Value>,
    total: Option<usize>,
    complete: bool,
}

#[derive(Debug, Default)]
struct StreamBuffer {
    chunks: Vec<Value>,
    complete: bool,
}

/// Snapshot of a table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableSnapshot {
    /// Rows, `Null` where a gap has not been delivered yet.
    pub rows: Vec<Value>,
    /// Announced total, when known.
    pub total: Option<usize>,
    /// Last chunk received.
    pub complete: bool,
}

/// # Content Store
pub struct ContentStore {
    pages: RwLock<HashMap<String, PageStream>>,
    progress: Mutex<BTreeMap<ProgressKey, ProgressEntry>>,
    streams: Mutex<HashMap<ProgressKey, StreamBuffer>>,
    widget_contents: RwLock<HashMap<String, WidgetContent>>,
    tables: Mutex<HashMap<String, TableBuffer>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for ContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pages: RwLock::new(HashMap::new()),
            progress: Mutex::new(BTreeMap::new()),
            streams: Mutex::new(HashMap::new()),
            widget_contents: RwLock::new(HashMap::new()),
            tables: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribes to change notifications. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is the normal headless case.
        self.events.send(event).ok();
    }

    // --- Page streams ---

    /// Creates an empty stream for `page_id` if none exists.
    pub fn ensure_page(&self, page_id: &str) {
        self.pages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(page_id.to_string())
            .or_insert_with(|| PageStream::new(page_id));
    }

    /// Copy of the accumulated stream, `None` if the page is unknown.
    pub fn get_page_stream(&self, page_id: &str) -> Option<PageStream> {
        self.pages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(page_id)
            .cloned()
    }

    /// `true` when `key` has been delivered for `page_id`.
    pub fn has_section(&self, page_id: &str, key: &SectionKey) -> bool {
        self.pages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(page_id)
            .is_some_and(|page| page.sections.contains_key(key))
    }

    /// Inserts or overwrites one section. Last write wins.
    pub fn merge_section(&self, page_id: &str, key: SectionKey, section: Section) {
        let fresh = self
            .pages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(page_id.to_string())
            .or_insert_with(|| PageStream::new(page_id))
            .merge(key, section);

        log::trace!("Section {} merged into '{}' (fresh: {})", key, page_id, fresh);
        self.emit(StoreEvent::SectionMerged {
            page_id: page_id.to_string(),
            key,
            fresh,
        });
    }

    /// Marks `page_id` fully delivered.
    pub fn mark_complete(&self, page_id: &str) {
        self.pages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(page_id.to_string())
            .or_insert_with(|| PageStream::new(page_id))
            .complete = true;

        log::info!("Page '{}' stream complete", page_id);
        self.emit(StoreEvent::PageCompleted {
            page_id: page_id.to_string(),
        });
    }

    /// `true` once the server signalled completion.
    pub fn is_complete(&self, page_id: &str) -> bool {
        self.pages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(page_id)
            .is_some_and(|page| page.complete)
    }

    /// Discards every section of `page_id` and its completion flag.
    /// The page itself stays known.
    pub fn clear_page_stream(&self, page_id: &str) {
        let cleared = match self
            .pages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(page_id)
        {
            Some(page) => {
                *page = PageStream::new(page_id);
                true
            }
            None => false,
        };

        if cleared {
            log::debug!("Page '{}' stream cleared", page_id);
            self.emit(StoreEvent::PageCleared {
                page_id: page_id.to_string(),
            });
        }
    }

    /// Forgets `page_id` entirely (page teardown).
    pub fn remove_page(&self, page_id: &str) -> Option<PageStream> {
        self.pages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(page_id)
    }

    /// Content of every section of `page_id` intersecting `bounds`.
    pub fn content_in_bounds(&self, page_id: &str, bounds: &ViewportBounds) -> ViewportContent {
        self.pages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(page_id)
            .map(|page| page.content_in(bounds))
            .unwrap_or_default()
    }

    /// Every module delivered for `page_id` so far.
    pub fn all_modules(&self, page_id: &str) -> Vec<Value> {
        self.get_page_stream(page_id)
            .map(|page| page.all_modules())
            .unwrap_or_default()
    }

    /// Every widget delivered for `page_id` so far.
    pub fn all_widgets(&self, page_id: &str) -> Vec<Value> {
        self.get_page_stream(page_id)
            .map(|page| page.all_widgets())
            .unwrap_or_default()
    }

    /// Applies one `page_stream` response.
    ///
    /// The section key is validated before anything is mutated. Returns the
    /// merged key, or `None` for completion/layout-only messages.
    pub fn apply_page_stream(&self, payload: PageStreamPayload) -> Result<Option<SectionKey>, ParseError> {
        let key = payload
            .viewport_section
            .as_deref()
            .map(str::parse::<SectionKey>)
            .transpose()?;

        self.ensure_page(&payload.page_id);

        if let Some(layout) = &payload.layout {
            let changed = {
                let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
                match pages.get_mut(&payload.page_id) {
                    Some(page) => {
                        let before = (page.total_width, page.total_height);
                        page.apply_layout(layout);
                        before != (page.total_width, page.total_height)
                    }
                    None => false,
                }
            };
            if changed {
                self.emit(StoreEvent::LayoutUpdated {
                    page_id: payload.page_id.clone(),
                });
            }
        }

        if let Some(key) = key {
            let bounds = payload.bounds.unwrap_or_else(|| key.bounds());
            self.merge_section(
                &payload.page_id,
                key,
                Section::new(bounds, payload.modules, payload.widgets),
            );
        }

        if payload.complete {
            self.mark_complete(&payload.page_id);
        }
        Ok(key)
    }

    // --- Widget content, tables, generic streams ---

    /// Stores content for a widget instance. Last write wins.
    pub fn set_widget_content(&self, content: WidgetContent) {
        let widget_id = content.widget_id.clone();
        self.widget_contents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(widget_id.clone(), content);
        self.emit(StoreEvent::WidgetContentUpdated { widget_id });
    }

    /// Content delivered for `widget_id`.
    pub fn widget_content(&self, widget_id: &str) -> Option<WidgetContent> {
        self.widget_contents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(widget_id)
            .cloned()
    }

    /// Writes rows at their offset (appending when none is given).
    /// Returns the row count afterwards.
    ///
    /// A chunk may leave a gap of at most [`MAX_TABLE_GAP`] rows past the
    /// current end, and may not start beyond the total it declares. Rejected
    /// chunks leave the table untouched.
    pub fn merge_table_rows(&self, chunk: TableStreamChunk) -> Result<usize, ParseError> {
        let (rows, complete) = {
            let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            let len = tables.get(&chunk.table_id).map_or(0, |t| t.rows.len());
            let (offset, end) = table_range(&chunk, len)?;

            let table = tables.entry(chunk.table_id.clone()).or_default();
            if table.rows.len() < end {
                table.rows.resize(end, Value::Null);
            }
            for (slot, row) in table.rows[offset..end].iter_mut().zip(chunk.rows) {
                *slot = row;
            }
            if chunk.total.is_some() {
                table.total = chunk.total;
            }
            table.complete |= chunk.complete;
            (table.rows.len(), table.complete)
        };

        self.emit(StoreEvent::TableUpdated {
            table_id: chunk.table_id,
            rows,
            complete,
        });
        Ok(rows)
    }

    /// Snapshot of `table_id`.
    pub fn table_rows(&self, table_id: &str) -> Option<TableSnapshot> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table_id)
            .map(|t| TableSnapshot {
                rows: t.rows.clone(),
                total: t.total,
                complete: t.complete,
            })
    }

    /// Appends a generic stream chunk. The final chunk completes the matching
    /// progress entry.
    pub fn append_stream_chunk(&self, chunk: StreamChunk) {
        let key = ProgressKey::from_wire(chunk.operation.as_deref(), chunk.id.as_deref());
        {
            let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
            let buffer = streams.entry(key.clone()).or_default();
            if !chunk.data.is_null() {
                buffer.chunks.push(chunk.data);
            }
            buffer.complete |= chunk.complete;
        }

        self.emit(StoreEvent::StreamUpdated {
            key: key.clone(),
            complete: chunk.complete,
        });
        if chunk.complete {
            self.complete_progress(&key.operation, &key.id);
        }
    }

    /// Chunks received so far for `(operation, id)` and whether the stream ended.
    pub fn stream_chunks(&self, operation: &str, id: &str) -> Option<(Vec<Value>, bool)> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ProgressKey::new(operation, id))
            .map(|b| (b.chunks.clone(), b.complete))
    }

    // --- Progress ---

    /// Creates (or restarts) the entry for `(operation, id)` at 0%.
    pub fn start_progress(&self, operation: &str, id: &str, label: &str) {
        let key = ProgressKey::new(operation, id);
        let entry = ProgressEntry::new(&key, label);
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, entry.clone());
        self.emit(StoreEvent::ProgressChanged(entry));
    }

    /// Sets the percentage (clamped to 0–100). Creates the entry when a
    /// progress message arrives before its start.
    pub fn update_progress(&self, operation: &str, id: &str, percent: f64, label: Option<&str>) {
        let key = ProgressKey::new(operation, id);
        let entry = {
            let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = progress
                .entry(key.clone())
                .or_insert_with(|| ProgressEntry::new(&key, operation));
            entry.percent = clamp_percent(percent);
            if let Some(label) = label {
                entry.label = label.to_string();
            }
            entry.clone()
        };
        self.emit(StoreEvent::ProgressChanged(entry));
    }

    /// Removes the entry for `(operation, id)`, returning it.
    pub fn complete_progress(&self, operation: &str, id: &str) -> Option<ProgressEntry> {
        let removed = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ProgressKey::new(operation, id));

        if let Some(entry) = &removed {
            let mut done = entry.clone();
            done.percent = 100.0;
            self.emit(StoreEvent::ProgressCompleted(done));
        }
        removed
    }

    /// Applies a wire progress message. 100% or more completes the entry.
    pub fn apply_progress(&self, update: &ProgressUpdate) {
        let key = ProgressKey::from_wire(update.operation.as_deref(), update.id.as_deref());
        if update.percent >= 100.0 {
            if self.complete_progress(&key.operation, &key.id).is_none() {
                log::debug!("Progress {}/{} completed without an entry", key.operation, key.id);
            }
        } else {
            self.update_progress(&key.operation, &key.id, update.percent, update.label.as_deref());
        }
    }

    /// Current entry for `(operation, id)`.
    pub fn progress(&self, operation: &str, id: &str) -> Option<ProgressEntry> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ProgressKey::new(operation, id))
            .cloned()
    }

    /// All running entries, ordered by key.
    pub fn progress_entries(&self) -> Vec<ProgressEntry> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// Validated `[offset, end)` row range of `chunk` for a table holding `len` rows.
fn table_range(chunk: &TableStreamChunk, len: usize) -> Result<(usize, usize), ParseError> {
    let offset = chunk.offset.unwrap_or(len);
    let reject = |reason: String| ParseError::TableRange {
        table_id: chunk.table_id.clone(),
        offset,
        reason,
    };

    if offset.saturating_sub(len) > MAX_TABLE_GAP {
        return Err(reject(format!("more than {MAX_TABLE_GAP} rows past the current end ({len})")));
    }
    if let Some(total) = chunk.total.filter(|&total| offset > total) {
        return Err(reject(format!("beyond the declared total of {total}")));
    }
    let end = offset
        .checked_add(chunk.rows.len())
        .ok_or_else(|| reject("row range overflows".to_string()))?;
    Ok((offset, end))
}
