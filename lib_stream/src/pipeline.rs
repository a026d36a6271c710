//! Routes classified inbound messages to the component that owns them.
//!
//! `{a, p}` actions go through the dispatch router; typed stream payloads and
//! progress updates go straight to the content store. Nothing here interprets
//! payload contents beyond what the store needs.

use std::sync::Arc;

use crate::core::dispatcher::DispatchRouter;
use crate::core::envelope::{InboundMessage, PAGE_STREAM_ACTION};
use crate::core::errors::{ErrorSink, ParseError};
use crate::store::content_store::ContentStore;

/// Inbound message fan-out.
#[derive(Clone)]
pub struct InboundPipeline {
    router: Arc<DispatchRouter>,
    store: Arc<ContentStore>,
    errors: Arc<dyn ErrorSink>,
}

impl InboundPipeline {
    /// Creates a pipeline over `router` and `store`.
    pub fn new(router: Arc<DispatchRouter>, store: Arc<ContentStore>, errors: Arc<dyn ErrorSink>) -> Self {
        Self { router, store, errors }
    }

    /// Applies one classified message.
    pub fn handle(&self, message: InboundMessage) {
        match message {
            InboundMessage::Action { action, payload } => {
                self.router.dispatch(&action, &payload);
            }
            InboundMessage::Progress(update) => self.store.apply_progress(&update),
            InboundMessage::Stream(chunk) => self.store.append_stream_chunk(chunk),
            InboundMessage::WidgetContent(content) => self.store.set_widget_content(content),
            InboundMessage::TableStream(chunk) => {
                if let Err(e) = self.store.merge_table_rows(chunk) {
                    log::warn!("Dropping table_stream chunk: {}", e);
                    self.errors.report(e.into());
                }
            }
            InboundMessage::PageStream(payload) => {
                let page_id = payload.page_id.clone();
                let complete = payload.complete;
                match self.store.apply_page_stream(payload) {
                    Ok(_) if complete => {
                        self.store.complete_progress(PAGE_STREAM_ACTION, &page_id);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Dropping page_stream for '{}': {}", page_id, e);
                        self.errors.report(e.into());
                    }
                }
            }
            InboundMessage::Pong => {}
        }
    }

    /// Parses and applies one text frame. Parse failures are reported and returned.
    pub fn handle_text(&self, text: &str) -> Result<(), ParseError> {
        match InboundMessage::parse(text) {
            Ok(message) => {
                self.handle(message);
                Ok(())
            }
            Err(e) => {
                log::warn!("Dropping inbound frame: {}", e);
                self.errors.report(e.clone().into());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{CollectingErrorSink, StreamError};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    fn pipeline() -> (InboundPipeline, Arc<DispatchRouter>, Arc<ContentStore>, Arc<CollectingErrorSink>) {
        let sink = Arc::new(CollectingErrorSink::new());
        let router = Arc::new(DispatchRouter::new(sink.clone()));
        let store = Arc::new(ContentStore::new());
        let pipeline = InboundPipeline::new(Arc::clone(&router), Arc::clone(&store), sink.clone());
        (pipeline, router, store, sink)
    }

    #[test]
    fn test_actions_reach_the_router() {
        let (pipeline, router, _, _) = pipeline();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_h = Arc::clone(&seen);
        router.register_handler("discovery", move |suffix, payload| {
            seen_h.lock().unwrap().push((suffix.to_string(), payload.clone()));
            Ok(())
        });

        pipeline
            .handle_text(r#"{"a":"discovery.page.list","p":{"pages":[]}}"#)
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![("page.list".to_string(), json!({"pages": []}))]);
    }

    #[test]
    fn test_page_stream_completion_closes_progress() {
        let (pipeline, _, store, _) = pipeline();
        store.start_progress(PAGE_STREAM_ACTION, "home", "Loading home");

        pipeline
            .handle_text(r#"{"type":"page_stream","page_id":"home","viewport_section":"0-500_0-300","modules":[{"id":"m"}],"widgets":[],"complete":false}"#)
            .unwrap();
        assert!(store.progress(PAGE_STREAM_ACTION, "home").is_some());

        pipeline
            .handle_text(r#"{"type":"page_stream","page_id":"home","complete":true}"#)
            .unwrap();
        assert!(store.is_complete("home"));
        assert!(store.progress(PAGE_STREAM_ACTION, "home").is_none());
        assert_eq!(store.all_modules("home"), vec![json!({"id": "m"})]);
    }

    #[test]
    fn test_progress_and_payload_kinds_reach_the_store() {
        let (pipeline, _, store, _) = pipeline();
        pipeline.handle_text(r#"{"percent":55,"operation":"analyze","id":"p1"}"#).unwrap();
        pipeline.handle_text(r#"{"type":"widget_content","widget_id":"w1","content":{"html":"<b>x</b>"}}"#).unwrap();
        pipeline.handle_text(r#"{"type":"table_stream","table_id":"t","rows":[1,2]}"#).unwrap();
        pipeline.handle_text(r#"{"type":"stream","operation":"analyze","id":"p1","data":"done","complete":true}"#).unwrap();

        assert!(store.progress("analyze", "p1").is_none());
        assert_eq!(store.widget_content("w1").unwrap().content["html"], json!("<b>x</b>"));
        assert_eq!(store.table_rows("t").unwrap().rows, vec![json!(1), json!(2)]);
        assert_eq!(store.stream_chunks("analyze", "p1").unwrap().0, vec![Value::from("done")]);
    }

    #[test]
    fn test_bad_frames_are_reported() {
        let (pipeline, _, store, sink) = pipeline();
        assert!(pipeline.handle_text("nope").is_err());
        pipeline
            .handle_text(r#"{"type":"page_stream","page_id":"home","viewport_section":"??"}"#)
            .unwrap();

        pipeline
            .handle_text(r#"{"type":"table_stream","table_id":"t","rows":[1],"offset":18446744073709551615}"#)
            .unwrap();
        pipeline
            .handle_text(r#"{"type":"table_stream","table_id":"t","rows":[1],"offset":10000000000000}"#)
            .unwrap();

        assert!(store.get_page_stream("home").is_none());
        assert!(store.table_rows("t").is_none());
        let errors = sink.errors();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().all(|e| matches!(e, StreamError::Parse(_))));
    }
}
