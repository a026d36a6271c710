//! # Stream Client
//!
//! Composition root wiring one `Transport`, `DispatchRouter`, `ContentStore`,
//! `WidgetRegistry` and `ViewportTracker` together:
//!
//! - inbound frames flow Transport → `InboundPipeline` → router or store,
//! - the tracker sends `page.stream` requests through the transport,
//! - `discovery.widget.list.response` replies register widget packs,
//! - every transport `Open` re-issues requests lost while disconnected.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::DispatchRouter;
use crate::core::envelope::OutboundEnvelope;
use crate::core::errors::{ErrorSink, TransportError};
use crate::core::registry::{descriptor_loader_factory, LoaderFactory, WidgetPackManifest, WidgetRegistry};
use crate::pipeline::InboundPipeline;
use crate::store::content_store::ContentStore;
use crate::transport::ws_transport::{CredentialProvider, Transport, TransportConfig, TransportEvent};
use crate::viewport::tracker::{TrackerConfig, ViewportTracker};

/// Prefix of the built-in widget discovery handler.
pub const WIDGET_DISCOVERY_PREFIX: &str = "discovery.widget";
/// Action requesting the widget pack list.
pub const WIDGET_LIST_ACTION: &str = "discovery.widget.list";

/// Settings for every component of the client.
#[derive(Debug, Clone, Default)]
pub struct StreamClientConfig {
    /// Connection settings.
    pub transport: TransportConfig,
    /// Viewport tracking settings.
    pub tracker: TrackerConfig,
    /// Widget loads slower than this resolve to the error placeholder.
    pub widget_load_timeout: Option<Duration>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WidgetPackList {
    #[serde(default)]
    widget_packs: Vec<WidgetPackManifest>,
}

/// Reads `{widgetPacks: [...]}` or a bare array of packs.
pub fn parse_widget_packs(payload: &Value) -> anyhow::Result<Vec<WidgetPackManifest>> {
    if payload.is_array() {
        return Ok(serde_json::from_value(payload.clone())?);
    }
    let list: WidgetPackList = serde_json::from_value(payload.clone())?;
    Ok(list.widget_packs)
}

/// # Stream Client
pub struct StreamClient {
    transport: Transport,
    router: Arc<DispatchRouter>,
    store: Arc<ContentStore>,
    widgets: Arc<WidgetRegistry>,
    tracker: ViewportTracker,
    pipeline: InboundPipeline,
    errors: Arc<dyn ErrorSink>,
    loader_factory: Arc<RwLock<LoaderFactory>>,
    watcher: Mutex<Option<CancellationToken>>,
}

impl StreamClient {
    /// Builds and wires every component. Nothing connects until [`connect`](Self::connect).
    pub fn new(
        config: StreamClientConfig,
        credentials: Arc<dyn CredentialProvider>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        let router = Arc::new(DispatchRouter::new(Arc::clone(&errors)));
        let store = Arc::new(ContentStore::new());
        let mut registry = WidgetRegistry::new(Arc::clone(&errors));
        if let Some(timeout) = config.widget_load_timeout {
            registry = registry.with_load_timeout(timeout);
        }
        let widgets = Arc::new(registry);

        let transport = Transport::new(config.transport, credentials, Arc::clone(&errors));
        let tracker = ViewportTracker::new(config.tracker, Arc::new(transport.clone()), Arc::clone(&store));
        let pipeline = InboundPipeline::new(Arc::clone(&router), Arc::clone(&store), Arc::clone(&errors));

        let inbound = pipeline.clone();
        transport.set_message_handler(move |message| inbound.handle(message));

        let loader_factory = Arc::new(RwLock::new(descriptor_loader_factory()));
        register_discovery_handler(&router, Arc::clone(&widgets), Arc::clone(&loader_factory));

        Self {
            transport,
            router,
            store,
            widgets,
            tracker,
            pipeline,
            errors,
            loader_factory,
            watcher: Mutex::new(None),
        }
    }

    /// Opens the connection and starts re-syncing the tracker on every open.
    pub fn connect(&self) -> Result<(), TransportError> {
        {
            let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
            if watcher.is_none() {
                let token = CancellationToken::new();
                tokio::spawn(resync_on_open(
                    self.transport.subscribe(),
                    self.tracker.clone(),
                    token.clone(),
                ));
                *watcher = Some(token);
            }
        }
        self.transport.connect()
    }

    /// Closes the connection and stops the re-sync watcher.
    pub fn disconnect(&self) {
        if let Some(token) = self.watcher.lock().unwrap_or_else(PoisonError::into_inner).take() {
            token.cancel();
        }
        self.transport.disconnect();
    }

    /// Sends an arbitrary action.
    pub fn request(&self, action: &str, payload: Value) -> Result<(), TransportError> {
        self.transport.send(OutboundEnvelope::new(action, payload))
    }

    /// Asks the server for its widget packs. The reply registers them.
    pub fn request_widget_packs(&self) -> Result<(), TransportError> {
        self.request(WIDGET_LIST_ACTION, json!({}))
    }

    /// Replaces how discovered manifests become loaders.
    pub fn set_loader_factory(&self, factory: LoaderFactory) {
        *self.loader_factory.write().unwrap_or_else(PoisonError::into_inner) = factory;
    }

    /// The transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The dispatch router, for registering application handlers.
    pub fn router(&self) -> &Arc<DispatchRouter> {
        &self.router
    }

    /// The content store.
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// The widget registry.
    pub fn widgets(&self) -> &Arc<WidgetRegistry> {
        &self.widgets
    }

    /// The viewport tracker.
    pub fn tracker(&self) -> &ViewportTracker {
        &self.tracker
    }

    /// The inbound pipeline, for feeding frames from another source.
    pub fn pipeline(&self) -> &InboundPipeline {
        &self.pipeline
    }

    /// The error sink every component reports to.
    pub fn errors(&self) -> &Arc<dyn ErrorSink> {
        &self.errors
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn register_discovery_handler(
    router: &DispatchRouter,
    widgets: Arc<WidgetRegistry>,
    factory: Arc<RwLock<LoaderFactory>>,
) {
    router.register_handler(WIDGET_DISCOVERY_PREFIX, move |suffix, payload| match suffix {
        "list.response" => {
            let packs = parse_widget_packs(payload)?;
            let factory = factory.read().unwrap_or_else(PoisonError::into_inner).clone();
            let components: usize = packs
                .iter()
                .map(|pack| widgets.register_manifest(pack, &factory))
                .sum();
            log::info!("Registered {} widget packs ({} components)", packs.len(), components);
            Ok(())
        }
        "list.error" => {
            let reason = payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            anyhow::bail!("widget discovery failed: {reason}")
        }
        other => {
            log::debug!("Ignoring discovery.widget.{}", other);
            Ok(())
        }
    });
}

async fn resync_on_open(
    mut events: tokio::sync::broadcast::Receiver<TransportEvent>,
    tracker: ViewportTracker,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(TransportEvent::Open) => {
                let sent = tracker.resync().iter().filter(|e| e.requested).count();
                log::info!("Connection open, re-requested {} sections", sent);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => log::warn!("Missed {} transport events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{CollectingErrorSink, StreamError};
    use crate::transport::ws_transport::StaticCredential;

    fn client() -> (StreamClient, Arc<CollectingErrorSink>) {
        let sink = Arc::new(CollectingErrorSink::new());
        let client = StreamClient::new(
            StreamClientConfig::default(),
            Arc::new(StaticCredential::default()),
            sink.clone(),
        );
        (client, sink)
    }

    #[test]
    fn test_parse_widget_packs_shapes() {
        let wrapped = json!({"widgetPacks": [{"id": "auth", "components": {"LoginForm": {}}}]});
        assert_eq!(parse_widget_packs(&wrapped).unwrap().len(), 1);
        let bare = json!([{"id": "a"}, {"id": "b"}]);
        assert_eq!(parse_widget_packs(&bare).unwrap().len(), 2);
        assert!(parse_widget_packs(&json!({})).unwrap().is_empty());
        assert!(parse_widget_packs(&json!({"widgetPacks": 3})).is_err());
    }

    #[tokio::test]
    async fn test_discovery_reply_registers_packs() {
        let (client, sink) = client();
        client
            .pipeline()
            .handle_text(
                r#"{"a":"discovery.widget.list.response","p":{"widgetPacks":[
                    {"id":"widget-pack/auth/ui/1234/1.0.0","components":{"LoginForm":{"path":"./LoginForm.vue"}}}
                ]}}"#,
            )
            .unwrap();

        assert!(client.widgets().has_widget("auth@LoginForm"));
        let unit = client.widgets().resolve_widget("auth@LoginForm").resolve().await;
        assert_eq!(unit.component().unwrap().path.as_deref(), Some("./LoginForm.vue"));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_discovery_error_reply_is_reported() {
        let (client, sink) = client();
        client
            .pipeline()
            .handle_text(r#"{"a":"discovery.widget.list.error","p":{"error":"forbidden"}}"#)
            .unwrap();

        match &sink.errors()[..] {
            [StreamError::Dispatch(e)] => assert!(e.reason.contains("forbidden")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_requests_fail_while_disconnected() {
        let (client, _) = client();
        assert_eq!(client.request_widget_packs(), Err(TransportError::NotOpen));
    }
}
