/// Configuration management
use crate::error::{ChatError, Result};
use crate::feed::ReconnectPolicy;
use crate::thread::{DEFAULT_PAGE_SIZE, DEFAULT_SCROLL_THRESHOLD_PX};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_VIEW_PORT: u16 = 17180;

/// Client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend REST base URL
    pub api_url: String,

    /// Push-feed base URL (derived from `api_url` when unset)
    pub ws_url: Option<String>,

    /// Bearer token; falls back to the stored session when unset
    pub token: Option<String>,

    /// Directory holding the session file
    pub data_dir: PathBuf,

    /// Messages per page
    pub page_size: u32,

    /// Distance from the top (px) under which older messages are fetched
    pub scroll_threshold_px: f64,

    /// Per-request timeout; none by default
    pub request_timeout: Option<Duration>,

    /// Feed reconnect behaviour
    pub reconnect: ReconnectPolicy,

    /// Local view API address
    pub view_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: None,
            token: None,
            data_dir: PathBuf::from(".chatline"),
            page_size: DEFAULT_PAGE_SIZE,
            scroll_threshold_px: DEFAULT_SCROLL_THRESHOLD_PX,
            request_timeout: None,
            reconnect: ReconnectPolicy::default(),
            view_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_VIEW_PORT)),
        }
    }
}

impl Config {
    /// Create config from command line arguments, then apply environment overrides
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::parse_args(args)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn parse_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();
        let mut api_url: Option<String> = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--token" => {
                    config.token = Some(flag_value(args, i, "--token")?.to_string());
                    i += 2;
                }
                "--ws-url" => {
                    config.ws_url = Some(flag_value(args, i, "--ws-url")?.to_string());
                    i += 2;
                }
                "--data-dir" => {
                    config.data_dir = PathBuf::from(flag_value(args, i, "--data-dir")?);
                    i += 2;
                }
                "--page-size" => {
                    let v = flag_value(args, i, "--page-size")?;
                    config.page_size = v
                        .parse::<u32>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| {
                            ChatError::Config("--page-size must be a positive number".to_string())
                        })?;
                    i += 2;
                }
                "--view-port" => {
                    config.view_addr.set_port(parse_port(flag_value(args, i, "--view-port")?)?);
                    i += 2;
                }
                "--request-timeout" => {
                    let v = flag_value(args, i, "--request-timeout")?;
                    let secs = v.parse::<u64>().map_err(|_| {
                        ChatError::Config("--request-timeout must be seconds".to_string())
                    })?;
                    config.request_timeout = Some(Duration::from_secs(secs));
                    i += 2;
                }
                "--no-reconnect" => {
                    config.reconnect = ReconnectPolicy::disabled();
                    i += 1;
                }
                other if other.starts_with("--") => {
                    return Err(ChatError::Config(format!("Unknown flag: {}", other)));
                }
                other => {
                    if api_url.is_some() {
                        return Err(ChatError::Config(format!(
                            "Unexpected argument: {}",
                            other
                        )));
                    }
                    api_url = Some(other.to_string());
                    i += 1;
                }
            }
        }

        if let Some(url) = api_url {
            config.api_url = url;
        }
        Ok(config)
    }

    /// Environment overrides (nice for scripts)
    pub fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("CHATLINE_API_URL") {
            self.api_url = url;
        }
        if let Some(url) = var("CHATLINE_WS_URL") {
            self.ws_url = Some(url);
        }
        if let Some(token) = var("CHATLINE_TOKEN").filter(|t| !t.is_empty()) {
            self.token = Some(token);
        }
        if let Some(dir) = var("CHATLINE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = var("CHATLINE_VIEW_PORT") {
            self.view_addr.set_port(parse_port(&port)?);
        }
        if var("CHATLINE_NO_RECONNECT").is_some() {
            self.reconnect = ReconnectPolicy::disabled();
        }
        Ok(())
    }

    pub fn usage(bin: &str) -> String {
        format!(
            "Usage: {} [api_url] [--token <token>] [--ws-url <url>] [--data-dir <path>] \
             [--page-size <n>] [--view-port <port>] [--request-timeout <secs>] [--no-reconnect]",
            bin
        )
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| ChatError::Config(format!("{} requires an argument", flag)))
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse::<u16>()
        .map_err(|_| ChatError::Config("Port must be a valid number (0-65535)".to_string()))
}
