use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_stream::{StreamClientConfig, TrackerConfig, TransportConfig};

const DEFAULT_CONFIG_FILE: &str = "page_streamer.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Viewport-driven page streaming client", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "PAGESTREAM_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "PAGESTREAM_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PAGESTREAM_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "PAGESTREAM_URL", help = "Content server WebSocket URL.")]
    pub url: Option<String>,

    #[clap(long, env = "PAGESTREAM_TOKEN", help = "Bearer credential appended to the connection URL.")]
    pub token: Option<String>,

    #[clap(long, env = "PAGESTREAM_TOKEN_PARAM", help = "Query parameter carrying the credential.")]
    pub token_param: Option<String>,

    #[clap(long, env = "PAGESTREAM_HEARTBEAT_SECONDS", help = "Seconds between keep-alive pings.")]
    pub heartbeat_seconds: Option<u64>,

    #[clap(long, env = "PAGESTREAM_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "PAGESTREAM_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "PAGESTREAM_GRID_SIZE", help = "Section grid size in pixels.")]
    pub grid_size: Option<f64>,

    #[clap(long, env = "PAGESTREAM_DEBOUNCE_MS", help = "Quiet period in milliseconds before a scroll is evaluated.")]
    pub debounce_ms: Option<u64>,

    #[clap(long, env = "PAGESTREAM_PRELOAD_MARGIN", help = "Pixels requested beyond the visible viewport.")]
    pub preload_margin: Option<f64>,

    #[clap(long, env = "PAGESTREAM_PAGE_ID", help = "Page to track on startup.")]
    pub page_id: Option<String>,

    #[clap(long, env = "PAGESTREAM_VIEWPORT_WIDTH", help = "Width of the headless viewport.")]
    pub viewport_width: Option<f64>,

    #[clap(long, env = "PAGESTREAM_VIEWPORT_HEIGHT", help = "Height of the headless viewport.")]
    pub viewport_height: Option<f64>,

    #[clap(long, env = "PAGESTREAM_ASSET_BASE_URL", help = "Base URL widget component assets are fetched from.")]
    pub asset_base_url: Option<String>,

    #[clap(long, env = "PAGESTREAM_ASSET_MAX_RETRIES", help = "Retries for a failed widget asset fetch.")]
    pub asset_max_retries: Option<u32>,

    #[clap(long, env = "PAGESTREAM_WIDGET_LOAD_TIMEOUT_MS", help = "Milliseconds before a widget load resolves to an error.")]
    pub widget_load_timeout_ms: Option<u64>,
}

impl Config {
    /// Built-in values, the lowest layer.
    pub fn defaults() -> Config {
        let transport = TransportConfig::default();
        let tracker = TrackerConfig::default();
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            url: Some(transport.url),
            token_param: Some(transport.token_param),
            heartbeat_seconds: Some(transport.heartbeat_interval.as_secs()),
            reconnect_base_delay_ms: Some(transport.reconnect_base_delay.as_millis() as u64),
            reconnect_max_delay_ms: Some(transport.reconnect_max_delay.as_millis() as u64),
            grid_size: Some(tracker.grid_size),
            debounce_ms: Some(tracker.debounce.as_millis() as u64),
            preload_margin: Some(tracker.preload_margin),
            page_id: Some("home".to_string()),
            viewport_width: Some(1280.0),
            viewport_height: Some(800.0),
            asset_max_retries: Some(3),
            ..Default::default()
        }
    }

    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            url: other.url.or(self.url),
            token: other.token.or(self.token),
            token_param: other.token_param.or(self.token_param),
            heartbeat_seconds: other.heartbeat_seconds.or(self.heartbeat_seconds),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            grid_size: other.grid_size.or(self.grid_size),
            debounce_ms: other.debounce_ms.or(self.debounce_ms),
            preload_margin: other.preload_margin.or(self.preload_margin),
            page_id: other.page_id.or(self.page_id),
            viewport_width: other.viewport_width.or(self.viewport_width),
            viewport_height: other.viewport_height.or(self.viewport_height),
            asset_base_url: other.asset_base_url.or(self.asset_base_url),
            asset_max_retries: other.asset_max_retries.or(self.asset_max_retries),
            widget_load_timeout_ms: other.widget_load_timeout_ms.or(self.widget_load_timeout_ms),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn page_id(&self) -> &str {
        self.page_id.as_deref().unwrap_or("home")
    }

    pub fn viewport_size(&self) -> (f64, f64) {
        (self.viewport_width.unwrap_or(1280.0), self.viewport_height.unwrap_or(800.0))
    }

    /// Library settings; unset fields keep the library defaults.
    pub fn client_config(&self) -> StreamClientConfig {
        let mut client = StreamClientConfig::default();

        let transport = &mut client.transport;
        if let Some(url) = &self.url {
            transport.url = url.clone();
        }
        if let Some(param) = &self.token_param {
            transport.token_param = param.clone();
        }
        if let Some(secs) = self.heartbeat_seconds {
            transport.heartbeat_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = self.reconnect_base_delay_ms {
            transport.reconnect_base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.reconnect_max_delay_ms {
            transport.reconnect_max_delay = Duration::from_millis(ms);
        }

        let tracker = &mut client.tracker;
        if let Some(grid) = self.grid_size.filter(|g| *g > 0.0) {
            tracker.grid_size = grid;
        }
        if let Some(ms) = self.debounce_ms {
            tracker.debounce = Duration::from_millis(ms);
        }
        if let Some(margin) = self.preload_margin {
            tracker.preload_margin = margin;
        }

        client.widget_load_timeout = self.widget_load_timeout_ms.map(Duration::from_millis);
        client
    }
}

/// Layers defaults, the config file and `cli` (which already carries env vars).
pub fn resolve_config(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    let config_str = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Config>(&config_str) {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

pub fn load_config() -> Config {
    resolve_config(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli(args: &[&str]) -> Config {
        let mut argv = vec!["page_streamer"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_mirror_library_defaults() {
        let config = Config::defaults();
        let client = config.client_config();
        assert_eq!(client.transport, TransportConfig::default());
        assert_eq!(client.tracker, TrackerConfig::default());
        assert_eq!(client.widget_load_timeout, None);
        assert_eq!(config.page_id(), "home");
    }

    #[test]
    fn test_file_overrides_defaults_and_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"url":"wss://content.example/ws","debounceMs":250,"pageId":"docs","logLevel":"debug"}}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = resolve_config(cli(&["--config-path", &path, "--page-id", "pricing"]));

        assert_eq!(config.url.as_deref(), Some("wss://content.example/ws"));
        assert_eq!(config.debounce_ms, Some(250));
        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.page_id(), "pricing");
        assert_eq!(config.client_config().tracker.debounce, Duration::from_millis(250));
        assert_eq!(config.preload_margin, Some(200.0));
    }

    #[test]
    fn test_unreadable_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = resolve_config(cli(&["--config-path", &path]));
        assert_eq!(config.url, Config::defaults().url);
        assert_eq!(config.config_path, Some(PathBuf::from(path)));
    }

    #[test]
    fn test_client_config_applies_overrides() {
        let config = Config {
            url: Some("ws://10.0.0.2:9000/ws".into()),
            heartbeat_seconds: Some(0),
            reconnect_base_delay_ms: Some(250),
            grid_size: Some(-5.0),
            widget_load_timeout_ms: Some(1500),
            ..Config::defaults()
        };
        let client = config.client_config();
        assert_eq!(client.transport.url, "ws://10.0.0.2:9000/ws");
        assert_eq!(client.transport.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(client.transport.reconnect_base_delay, Duration::from_millis(250));
        assert_eq!(client.tracker.grid_size, TrackerConfig::default().grid_size);
        assert_eq!(client.widget_load_timeout, Some(Duration::from_millis(1500)));
    }
}
