//! # Widget Registry
//!
//! Maps `pack@component` references to lazily-loaded renderable units.
//!
//! Resolution is total: whatever string comes in, a [`LazyWidget`] comes out.
//! Its [`RenderUnit`] is one of four states, so the presentation layer can
//! lay out a stable tree before any widget has finished loading:
//!
//! - `Loading` until the loader completes,
//! - `Ready` with the loaded component,
//! - `Error` when the loader failed, panicked or timed out,
//! - `Missing` when the reference has no registration (or is malformed).
//!
//! Packs are process-lifetime. Registering a pack again merges its entries,
//! overwriting components with the same name.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::core::dispatcher::panic_message;
use crate::core::errors::{ErrorSink, MissingReferenceError, ParseError, ResolutionError};

/// Future returned by a [`WidgetLoader`].
pub type LoadFuture = BoxFuture<'static, anyhow::Result<WidgetComponent>>;

/// Turns one manifest entry into a loader: `(pack, component, manifest)`.
pub type LoaderFactory =
    Arc<dyn Fn(&str, &str, &ComponentManifest) -> Arc<dyn WidgetLoader> + Send + Sync>;

/// Something that can produce a widget component on demand.
pub trait WidgetLoader: Send + Sync {
    /// Starts loading. Called at most once per shared [`LazyWidget`].
    fn load(&self) -> LoadFuture;
}

struct FnLoader<F>(F);

impl<F, Fut> WidgetLoader for FnLoader<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<WidgetComponent>> + Send + 'static,
{
    fn load(&self) -> LoadFuture {
        (self.0)().boxed()
    }
}

/// Wraps an async closure as a loader.
pub fn loader_fn<F, Fut>(f: F) -> Arc<dyn WidgetLoader>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<WidgetComponent>> + Send + 'static,
{
    Arc::new(FnLoader(f))
}

struct StaticLoader(WidgetComponent);

impl WidgetLoader for StaticLoader {
    fn load(&self) -> LoadFuture {
        let component = self.0.clone();
        async move { Ok(component) }.boxed()
    }
}

/// Loader that immediately yields `component` (descriptor-only widgets).
pub fn static_loader(component: WidgetComponent) -> Arc<dyn WidgetLoader> {
    Arc::new(StaticLoader(component))
}

/// Default manifest factory: a descriptor-only loader per component.
pub fn descriptor_loader_factory() -> LoaderFactory {
    Arc::new(|pack: &str, name: &str, manifest: &ComponentManifest| {
        static_loader(WidgetComponent::from_manifest(pack, name, manifest))
    })
}

/// A loaded, renderable component.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WidgetComponent {
    /// Pack the component belongs to.
    pub pack: String,
    /// Component name inside the pack.
    pub name: String,
    /// Asset path, as announced by the pack manifest.
    pub path: Option<String>,
    /// Props schema.
    pub props: Value,
    /// Default configuration.
    pub config: Value,
    /// Fetched asset body, for loaders that fetch one.
    pub source: Option<String>,
}

impl WidgetComponent {
    /// Component carrying only identity.
    pub fn new(pack: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pack: pack.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builds the descriptor from a manifest entry.
    pub fn from_manifest(pack: &str, name: &str, manifest: &ComponentManifest) -> Self {
        Self {
            pack: pack.to_string(),
            name: name.to_string(),
            path: manifest.path.clone(),
            props: manifest.props.clone(),
            config: manifest.config.clone(),
            source: None,
        }
    }

    /// `pack@name`.
    pub fn reference(&self) -> String {
        format!("{}@{}", self.pack, self.name)
    }
}

/// Parsed `pack@component` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WidgetRef {
    /// Pack identifier.
    pub pack: String,
    /// Component name.
    pub component: String,
}

impl FromStr for WidgetRef {
    type Err = ParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (pack, component) = raw
            .split_once('@')
            .ok_or_else(|| ParseError::WidgetRef(raw.to_string()))?;
        let (pack, component) = (pack.trim(), component.trim());
        if pack.is_empty() || component.is_empty() {
            return Err(ParseError::WidgetRef(raw.to_string()));
        }
        Ok(Self {
            pack: pack.to_string(),
            component: component.to_string(),
        })
    }
}

impl fmt::Display for WidgetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pack, self.component)
    }
}

/// What the presentation layer renders for one widget slot.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderUnit {
    /// Loader still running.
    Loading {
        /// Requested reference.
        reference: String,
    },
    /// Loaded component.
    Ready(Arc<WidgetComponent>),
    /// Loader failed.
    Error {
        /// Requested reference.
        reference: String,
        /// Failure reason, shown in place.
        reason: String,
    },
    /// No registration for the reference.
    Missing {
        /// Requested reference, kept for diagnostics.
        reference: String,
    },
}

impl RenderUnit {
    /// State name: `loading`, `ready`, `error` or `missing`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Loading { .. } => "loading",
            Self::Ready(_) => "ready",
            Self::Error { .. } => "error",
            Self::Missing { .. } => "missing",
        }
    }

    /// `true` for `Ready`.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// The loaded component, if any.
    pub fn component(&self) -> Option<&WidgetComponent> {
        match self {
            Self::Ready(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Clone)]
enum LazySource {
    Missing,
    Pending {
        loader: Arc<dyn WidgetLoader>,
        cell: Arc<OnceCell<RenderUnit>>,
        timeout: Option<Duration>,
        errors: Arc<dyn ErrorSink>,
    },
}

/// # Lazy Widget
///
/// Handle returned by [`WidgetRegistry::resolve_widget`]. Cheap to clone; all
/// clones share one load.
#[derive(Clone)]
pub struct LazyWidget {
    reference: String,
    source: LazySource,
}

impl fmt::Debug for LazyWidget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyWidget")
            .field("reference", &self.reference)
            .field("state", &self.current().kind())
            .finish()
    }
}

impl LazyWidget {
    fn missing(reference: &str) -> Self {
        Self {
            reference: reference.to_string(),
            source: LazySource::Missing,
        }
    }

    /// Reference this unit was resolved from.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// `true` for the missing placeholder.
    pub fn is_missing(&self) -> bool {
        matches!(self.source, LazySource::Missing)
    }

    /// Current state without driving the load.
    pub fn current(&self) -> RenderUnit {
        match &self.source {
            LazySource::Missing => RenderUnit::Missing {
                reference: self.reference.clone(),
            },
            LazySource::Pending { cell, .. } => cell.get().cloned().unwrap_or_else(|| RenderUnit::Loading {
                reference: self.reference.clone(),
            }),
        }
    }

    /// Drives the load (once across clones) and returns the settled state.
    pub async fn resolve(&self) -> RenderUnit {
        match &self.source {
            LazySource::Missing => self.current(),
            LazySource::Pending { loader, cell, timeout, errors } => cell
                .get_or_init(|| load_unit(&self.reference, loader, *timeout, errors))
                .await
                .clone(),
        }
    }
}

async fn load_unit(
    reference: &str,
    loader: &Arc<dyn WidgetLoader>,
    timeout: Option<Duration>,
    errors: &Arc<dyn ErrorSink>,
) -> RenderUnit {
    // load() runs inside the guarded future so a panic while building it is caught too.
    let guarded = AssertUnwindSafe(async { loader.load().await }).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => Ok(Err(anyhow::anyhow!("timed out after {}ms", limit.as_millis()))),
        },
        None => guarded.await,
    };

    let reason = match outcome {
        Ok(Ok(component)) => {
            log::debug!("Widget '{}' loaded", reference);
            return RenderUnit::Ready(Arc::new(component));
        }
        Ok(Err(e)) => format!("{e:#}"),
        Err(panic) => panic_message(panic.as_ref()),
    };

    let error = ResolutionError {
        reference: reference.to_string(),
        reason: reason.clone(),
    };
    log::warn!("{}", error);
    errors.report(error.into());
    RenderUnit::Error {
        reference: reference.to_string(),
        reason,
    }
}

/// One pack as announced by `discovery.widget.list.response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetPackManifest {
    /// Pack id, e.g. `widget-pack/<module>/ui/<uuid>/<version>` or a short name.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Owning module; preferred as the reference prefix.
    #[serde(default)]
    pub module: Option<String>,
    /// Pack version.
    #[serde(default)]
    pub version: Option<String>,
    /// Pack kind (`ui`, ...).
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Owning project.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Component name → entry.
    #[serde(default)]
    pub components: BTreeMap<String, ComponentManifest>,
}

impl WidgetPackManifest {
    /// Prefix used in `pack@component` references for this pack.
    pub fn pack_key(&self) -> String {
        if let Some(module) = self.module.as_deref().filter(|m| !m.is_empty()) {
            return module.to_string();
        }
        let mut parts = self.id.split('/');
        match (parts.next(), parts.next()) {
            (Some("widget-pack"), Some(module)) if !module.is_empty() => module.to_string(),
            _ => self.id.clone(),
        }
    }
}

/// One component entry of a pack manifest.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ComponentManifest {
    /// Asset path.
    #[serde(default)]
    pub path: Option<String>,
    /// Props schema.
    #[serde(default)]
    pub props: Value,
    /// Default configuration.
    #[serde(default)]
    pub config: Value,
}

/// # Widget Registry
///
/// Process-scoped table of widget packs. Construct one and inject it.
pub struct WidgetRegistry {
    packs: RwLock<HashMap<String, HashMap<String, Arc<dyn WidgetLoader>>>>,
    resolved: Mutex<HashMap<WidgetRef, LazyWidget>>,
    load_timeout: Option<Duration>,
    errors: Arc<dyn ErrorSink>,
}

impl WidgetRegistry {
    /// Creates an empty registry.
    pub fn new(errors: Arc<dyn ErrorSink>) -> Self {
        Self {
            packs: RwLock::new(HashMap::new()),
            resolved: Mutex::new(HashMap::new()),
            load_timeout: None,
            errors,
        }
    }

    /// Loads that take longer than `timeout` resolve to the error placeholder.
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = Some(timeout);
        self
    }

    /// Installs or merges `entries` into pack `pack_id`.
    ///
    /// Returns the number of entries written.
    pub fn register_widget_pack<I>(&self, pack_id: &str, entries: I) -> usize
    where
        I: IntoIterator<Item = (String, Arc<dyn WidgetLoader>)>,
    {
        let mut written = Vec::new();
        {
            let mut packs = self.packs.write().unwrap_or_else(PoisonError::into_inner);
            let pack = packs.entry(pack_id.to_string()).or_default();
            for (name, loader) in entries {
                pack.insert(name.clone(), loader);
                written.push(name);
            }
        }

        // Overwritten components must load again through their new loader.
        let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        resolved.retain(|r, _| !(r.pack == pack_id && written.contains(&r.component)));

        log::info!("Widget pack '{}' registered ({} entries)", pack_id, written.len());
        written.len()
    }

    /// Registers a pack manifest, building loaders with `factory`.
    pub fn register_manifest(&self, manifest: &WidgetPackManifest, factory: &LoaderFactory) -> usize {
        let pack = manifest.pack_key();
        let entries: Vec<(String, Arc<dyn WidgetLoader>)> = manifest
            .components
            .iter()
            .map(|(name, entry)| (name.clone(), factory(&pack, name, entry)))
            .collect();
        self.register_widget_pack(&pack, entries)
    }

    fn loader_for(&self, reference: &WidgetRef) -> Option<Arc<dyn WidgetLoader>> {
        self.packs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&reference.pack)
            .and_then(|pack| pack.get(&reference.component))
            .cloned()
    }

    /// `true` when `reference` names a registered component.
    pub fn has_widget(&self, reference: &str) -> bool {
        reference
            .parse::<WidgetRef>()
            .map(|r| self.loader_for(&r).is_some())
            .unwrap_or(false)
    }

    /// Resolves `reference` into a lazy renderable unit. Never fails.
    pub fn resolve_widget(&self, reference: &str) -> LazyWidget {
        let parsed = match reference.parse::<WidgetRef>() {
            Ok(parsed) => parsed,
            Err(e) => {
                log::debug!("{}", e);
                self.report_missing(reference);
                return LazyWidget::missing(reference);
            }
        };

        let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = resolved.get(&parsed) {
            return existing.clone();
        }

        let Some(loader) = self.loader_for(&parsed) else {
            drop(resolved);
            self.report_missing(reference);
            return LazyWidget::missing(reference);
        };

        let widget = LazyWidget {
            reference: parsed.to_string(),
            source: LazySource::Pending {
                loader,
                cell: Arc::new(OnceCell::new()),
                timeout: self.load_timeout,
                errors: Arc::clone(&self.errors),
            },
        };
        resolved.insert(parsed, widget.clone());
        widget
    }

    fn report_missing(&self, reference: &str) {
        self.errors.report(
            MissingReferenceError {
                reference: reference.to_string(),
            }
            .into(),
        );
    }

    /// Registered pack ids, sorted.
    pub fn pack_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .packs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Component names of `pack_id`, sorted.
    pub fn components(&self, pack_id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .packs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pack_id)
            .map(|pack| pack.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
