//! # Longest-Prefix Action Dispatcher
//!
//! The `DispatchRouter` is the single entry point for every inbound `{a, p}`
//! message. Handlers are registered against dotted prefixes (`"discovery"`,
//! `"discovery.widget"`, ...) and an action is delivered to exactly one of them.
//!
//! ## Core Design Principles:
//!
//! 1.  **Longest Prefix Wins**: for `"a.b.c"` the router tries `"a.b.c"`, then
//!     `"a.b"`, then `"a"`, and invokes the first registered handler with the
//!     remaining suffix (`"c"`, `"b.c"`, ...). A handler registered at `"*"` is
//!     the fallback when nothing matches.
//!
//! 2.  **Failure Isolation**: each invocation runs behind `catch_unwind`. An
//!     `Err` or a panic becomes a `DispatchError` that is logged and handed to
//!     the `ErrorSink`; the router itself keeps working for the next message.
//!
//! 3.  **No Lock Across Calls**: the handler `Arc` is cloned out of the table
//!     before it runs, so handlers may register or remove other handlers.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::core::errors::{DispatchError, ErrorSink};

/// Prefix of the fallback handler.
pub const WILDCARD: &str = "*";

/// A registered handler: `(suffix, payload)`.
pub type Handler = Arc<dyn Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync>;

/// What happened to one dispatched action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A prefix handler ran successfully.
    Handled {
        /// Prefix that matched.
        prefix: String,
        /// Remainder of the action passed to the handler.
        suffix: String,
    },
    /// Only the wildcard handler matched, and it succeeded.
    Wildcard,
    /// No handler matched; the action was logged and dropped.
    Unhandled,
    /// The matched handler returned an error or panicked.
    Failed(DispatchError),
}

/// # Dispatch Router
///
/// Process-scoped handler table. Construct one and inject it into whoever
/// needs to register or dispatch.
pub struct DispatchRouter {
    handlers: RwLock<HashMap<String, Handler>>,
    errors: Arc<dyn ErrorSink>,
}

impl DispatchRouter {
    /// Creates an empty router reporting failures to `errors`.
    pub fn new(errors: Arc<dyn ErrorSink>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            errors,
        }
    }

    /// Associates `prefix` with `handler`, replacing any previous handler.
    pub fn register_handler<F>(&self, prefix: &str, handler: F)
    where
        F: Fn(&str, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(prefix.to_string(), Arc::new(handler))
            .is_some();
        if replaced {
            log::debug!("Handler for '{}' replaced", prefix);
        } else {
            log::debug!("Handler for '{}' registered", prefix);
        }
    }

    /// Removes the handler at `prefix`. Returns whether one existed.
    pub fn unregister_handler(&self, prefix: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(prefix)
            .is_some()
    }

    /// `true` when a handler is registered at exactly `prefix`.
    pub fn has_handler(&self, prefix: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(prefix)
    }

    /// Finds the longest registered dot-delimited prefix of `action`.
    ///
    /// Returns `(prefix, suffix, handler)`.
    fn lookup(&self, action: &str) -> Option<(String, String, Handler)> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let segments: Vec<&str> = action.split('.').collect();

        for len in (1..=segments.len()).rev() {
            let prefix = segments[..len].join(".");
            if let Some(handler) = handlers.get(&prefix) {
                let suffix = segments[len..].join(".");
                return Some((prefix, suffix, Arc::clone(handler)));
            }
        }
        None
    }

    fn wildcard(&self) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(WILDCARD)
            .cloned()
    }

    /// Delivers `payload` to the most specific handler for `action`.
    ///
    /// Never panics and never returns an error: failures are reported to the
    /// error sink and described by the returned [`DispatchOutcome`].
    pub fn dispatch(&self, action: &str, payload: &Value) -> DispatchOutcome {
        let (prefix, suffix, handler, is_wildcard) = match self.lookup(action) {
            Some((prefix, suffix, handler)) => (prefix, suffix, handler, false),
            None => match self.wildcard() {
                Some(handler) => (WILDCARD.to_string(), action.to_string(), handler, true),
                None => {
                    log::warn!("Unhandled action '{}'", action);
                    return DispatchOutcome::Unhandled;
                }
            },
        };

        log::trace!("Dispatching '{}' to '{}' (suffix '{}')", action, prefix, suffix);

        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&suffix, payload)));
        let reason = match result {
            Ok(Ok(())) if is_wildcard => return DispatchOutcome::Wildcard,
            Ok(Ok(())) => return DispatchOutcome::Handled { prefix, suffix },
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => panic_message(panic.as_ref()),
        };

        let error = DispatchError {
            action: action.to_string(),
            prefix,
            reason,
        };
        log::error!("{}", error);
        self.errors.report(error.clone().into());
        DispatchOutcome::Failed(error)
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
