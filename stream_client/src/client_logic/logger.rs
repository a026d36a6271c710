use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

const LOG_PREFIX: &str = "page_streamer_";

/// Targets that follow the configured level. Socket, TLS and HTTP internals
/// stay at `warn` unless the level is stricter.
const OWN_TARGETS: [&str; 2] = ["page_streamer", "lib_stream"];

pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir).with_context(|| format!("cannot create log dir {}", log_dir.display()))?;
    }

    // Only the newest session log is kept
    cleanup_old_logs(log_dir)?;

    let log_path = log_dir.join(format!("{}{}.log", LOG_PREFIX, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")));
    let file = fern::log_file(&log_path).with_context(|| format!("cannot open {}", log_path.display()))?;

    client_dispatch(parse_level(log_level))
        .chain(std::io::stdout())
        .chain(file)
        .apply()?;

    log::debug!("Logging to {}", log_path.display());
    Ok(())
}

/// Format and per-target levels shared by every output.
fn client_dispatch(level: log::LevelFilter) -> fern::Dispatch {
    let foreign = level.min(log::LevelFilter::Warn);
    OWN_TARGETS
        .iter()
        .fold(fern::Dispatch::new().level(foreign), |dispatch, target| dispatch.level_for(*target, level))
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{:<5}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S%.3f]"),
                record.level(),
                short_target(record.target()),
                message
            ))
        })
}

/// `lib_stream::transport::ws_transport` reads as `transport::ws_transport`.
fn short_target(target: &str) -> &str {
    OWN_TARGETS
        .iter()
        .find_map(|own| target.strip_prefix(own).and_then(|rest| rest.strip_prefix("::")))
        .unwrap_or(target)
}

pub fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

fn cleanup_old_logs(log_dir: &Path) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| {
            let path = e.path();
            path.extension().is_some_and(|ext| ext == "log")
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(LOG_PREFIX))
        })
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e))
        })
        .collect();

    // Sort by modification time, newest first
    entries.sort_by_key(|(modified, _)| std::cmp::Reverse(*modified));

    // Keep the most recent one (index 0), delete the rest
    for (_, entry) in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(entry.path()) {
            eprintln!("Failed to delete old log file {}: {}", entry.path().display(), e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("TRACE"), log::LevelFilter::Trace);
        assert_eq!(parse_level("warn"), log::LevelFilter::Warn);
        assert_eq!(parse_level("fatal"), log::LevelFilter::Info);
    }

    #[test]
    fn test_short_target() {
        assert_eq!(short_target("lib_stream::transport::ws_transport"), "transport::ws_transport");
        assert_eq!(short_target("page_streamer::client_logic::console"), "client_logic::console");
        assert_eq!(short_target("page_streamer"), "page_streamer");
        assert_eq!(short_target("tokio_tungstenite::handshake"), "tokio_tungstenite::handshake");
    }

    #[test]
    fn test_foreign_targets_held_at_warn() {
        use log::{Level, Log, Metadata};
        let enabled = |log: &dyn Log, target: &str, level: Level| {
            log.enabled(&Metadata::builder().target(target).level(level).build())
        };

        let sink = || fern::Output::call(|_| {});
        let (max, log) = client_dispatch(log::LevelFilter::Debug).chain(sink()).into_log();
        assert_eq!(max, log::LevelFilter::Debug);
        assert!(enabled(log.as_ref(), "lib_stream::viewport::tracker", Level::Debug));
        assert!(enabled(log.as_ref(), "page_streamer", Level::Debug));
        assert!(!enabled(log.as_ref(), "tokio_tungstenite::protocol", Level::Info));
        assert!(enabled(log.as_ref(), "reqwest::connect", Level::Warn));

        let (_, quiet) = client_dispatch(log::LevelFilter::Error).chain(sink()).into_log();
        assert!(!enabled(quiet.as_ref(), "reqwest::connect", Level::Warn));
        assert!(!enabled(quiet.as_ref(), "lib_stream", Level::Warn));
    }

    #[test]
    fn test_cleanup_keeps_one_log_and_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["page_streamer_a.log", "page_streamer_b.log", "page_streamer_c.log"] {
            fs::write(dir.path().join(name), "x").unwrap();
        }
        fs::write(dir.path().join("other.log"), "x").unwrap();
        fs::write(dir.path().join("page_streamer.conf"), "{}").unwrap();

        cleanup_old_logs(dir.path()).unwrap();

        let remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        let ours = remaining.iter().filter(|n| n.starts_with(LOG_PREFIX) && n.ends_with(".log")).count();
        assert_eq!(ours, 1);
        assert!(remaining.contains(&"other.log".to_string()));
        assert!(remaining.contains(&"page_streamer.conf".to_string()));
    }
}
