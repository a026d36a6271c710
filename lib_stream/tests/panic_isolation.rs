//! Handler panics must stay contained in every build profile the workspace ships.

use std::sync::Arc;

use serde_json::json;

use lib_stream::core::errors::{CollectingErrorSink, StreamError};
use lib_stream::DispatchRouter;

/// `[profile.<name>]` table of the workspace manifest, as raw lines.
fn profile_lines(manifest: &str, name: &str) -> Vec<String> {
    let header = format!("[profile.{name}]");
    manifest
        .lines()
        .skip_while(|line| line.trim() != header)
        .skip(1)
        .take_while(|line| !line.trim_start().starts_with('['))
        .map(|line| line.split('#').next().unwrap_or_default().trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

#[test]
fn release_profile_keeps_unwinding() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../Cargo.toml");
    let manifest = std::fs::read_to_string(path).unwrap();
    let release = profile_lines(&manifest, "release");

    assert!(!release.is_empty(), "workspace manifest has no release profile");
    for line in &release {
        let (key, value) = line.split_once('=').unwrap();
        if key.trim() == "panic" {
            assert_eq!(value.trim(), "\"unwind\"", "release profile sets {line}");
        }
    }
}

#[test]
fn panicking_handler_does_not_stop_later_dispatches() {
    let sink = Arc::new(CollectingErrorSink::new());
    let router = DispatchRouter::new(sink.clone());
    router.register_handler("boom", |_, _| panic!("handler exploded"));
    router.register_handler("user", |_, _| Ok(()));

    router.dispatch("boom", &json!({}));
    router.dispatch("user.profile.response", &json!({"name": "x"}));

    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], StreamError::Dispatch(e) if e.reason.contains("handler exploded")));
}
