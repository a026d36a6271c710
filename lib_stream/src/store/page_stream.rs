//! Accumulated content of one page, keyed by section.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use crate::core::bounds::{SectionKey, ViewportBounds};

/// One delivered spatial cell.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Section {
    /// Region the section covers.
    pub bounds: ViewportBounds,
    /// Modules laid out in the region.
    pub modules: Vec<Value>,
    /// Widgets laid out in the region.
    pub widgets: Vec<Value>,
}

impl Section {
    /// Creates a section.
    pub fn new(bounds: ViewportBounds, modules: Vec<Value>, widgets: Vec<Value>) -> Self {
        Self { bounds, modules, widgets }
    }
}

/// Modules and widgets visible in some region.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ViewportContent {
    /// Modules, deduplicated by `id`.
    pub modules: Vec<Value>,
    /// Widgets, deduplicated by `id`.
    pub widgets: Vec<Value>,
}

impl ViewportContent {
    /// `true` when nothing was found.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty() && self.widgets.is_empty()
    }
}

/// # Page Stream
///
/// Possibly-partial content for one page. Sections merge last-write-wins.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PageStream {
    /// Page identifier.
    pub page_id: String,
    /// Delivered sections.
    pub sections: BTreeMap<SectionKey, Section>,
    /// Server signalled that the page is fully delivered.
    pub complete: bool,
    /// Largest total width announced by the page layout.
    pub total_width: f64,
    /// Largest total height announced by the page layout.
    pub total_height: f64,
}

impl PageStream {
    /// Empty stream for `page_id`.
    pub fn new(page_id: impl Into<String>) -> Self {
        Self {
            page_id: page_id.into(),
            ..Self::default()
        }
    }

    /// Inserts or overwrites `key`. Returns `true` when the key is new.
    pub fn merge(&mut self, key: SectionKey, section: Section) -> bool {
        self.sections.insert(key, section).is_none()
    }

    /// Number of delivered sections.
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// `true` when nothing has been delivered.
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Union of the content of every section intersecting `bounds`.
    pub fn content_in(&self, bounds: &ViewportBounds) -> ViewportContent {
        collect(self.sections.values().filter(|s| s.bounds.intersects(bounds)))
    }

    /// Every module delivered so far. Partial until `complete`.
    pub fn all_modules(&self) -> Vec<Value> {
        collect(self.sections.values()).modules
    }

    /// Every widget delivered so far. Partial until `complete`.
    pub fn all_widgets(&self) -> Vec<Value> {
        collect(self.sections.values()).widgets
    }

    /// Folds `layout.totalWidth/totalHeight` (or snake_case) into the aggregate.
    pub fn apply_layout(&mut self, layout: &Value) {
        let read = |camel: &str, snake: &str| {
            layout
                .get(camel)
                .or_else(|| layout.get(snake))
                .and_then(Value::as_f64)
        };
        if let Some(w) = read("totalWidth", "total_width") {
            self.total_width = self.total_width.max(w);
        }
        if let Some(h) = read("totalHeight", "total_height") {
            self.total_height = self.total_height.max(h);
        }
    }
}

fn collect<'a>(sections: impl Iterator<Item = &'a Section>) -> ViewportContent {
    let mut content = ViewportContent::default();
    let mut seen_modules = HashSet::new();
    let mut seen_widgets = HashSet::new();
    for section in sections {
        push_unique(&mut content.modules, &mut seen_modules, &section.modules);
        push_unique(&mut content.widgets, &mut seen_widgets, &section.widgets);
    }
    content
}

/// Items without an `id` are never considered duplicates.
fn push_unique(out: &mut Vec<Value>, seen: &mut HashSet<String>, items: &[Value]) {
    for item in items {
        let id = match item.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let fresh = match id {
            Some(id) => seen.insert(id),
            None => true,
        };
        if fresh {
            out.push(item.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn section(top: f64, bottom: f64, modules: Vec<Value>) -> (SectionKey, Section) {
        let bounds = ViewportBounds::new(top, bottom, 0.0, 300.0);
        (bounds.section_key(), Section::new(bounds, modules, vec![]))
    }

    #[test]
    fn test_merge_same_key_last_write_wins() {
        let mut page = PageStream::new("home");
        let (key, first) = section(0.0, 500.0, vec![json!({"id": "m1", "v": 1})]);
        let (_, second) = section(0.0, 500.0, vec![json!({"id": "m1", "v": 2})]);

        assert!(page.merge(key, first));
        assert!(!page.merge(key, second));

        assert_eq!(page.len(), 1);
        assert_eq!(page.all_modules(), vec![json!({"id": "m1", "v": 2})]);
    }

    #[test]
    fn test_content_in_unions_intersecting_sections() {
        let mut page = PageStream::new("home");
        for (key, s) in [
            section(0.0, 500.0, vec![json!({"id": "hero"}), json!({"id": "shared"})]),
            section(600.0, 1100.0, vec![json!({"id": "shared"}), json!({"id": "list"})]),
            section(3000.0, 3500.0, vec![json!({"id": "footer"})]),
        ] {
            page.merge(key, s);
        }

        let visible = page.content_in(&ViewportBounds::new(400.0, 900.0, 0.0, 300.0));
        let ids: Vec<_> = visible.modules.iter().map(|m| m["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["hero", "shared", "list"]);

        assert!(page.content_in(&ViewportBounds::new(5000.0, 5100.0, 0.0, 10.0)).is_empty());
    }

    #[test]
    fn test_items_without_id_are_kept() {
        let mut page = PageStream::new("p");
        let (key, s) = section(0.0, 100.0, vec![json!({"kind": "spacer"}), json!({"kind": "spacer"})]);
        page.merge(key, s);
        assert_eq!(page.all_modules().len(), 2);
    }

    #[test]
    fn test_layout_totals_keep_maximum() {
        let mut page = PageStream::new("p");
        page.apply_layout(&json!({"totalHeight": 4000, "totalWidth": 1200}));
        page.apply_layout(&json!({"total_height": 3000.5}));
        page.apply_layout(&json!({"unrelated": true}));

        assert_eq!(page.total_height, 4000.0);
        assert_eq!(page.total_width, 1200.0);
    }
}
