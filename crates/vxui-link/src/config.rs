use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Strategy used to pick the delay before a reconnect attempt.
#[derive(Clone)]
pub enum ReconnectDelay {
    /// Uniform draw from `[0, 1000ms * 2^min(retry, 6)]`.
    FullJitter,
    /// Caller-supplied function of the retry count.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl fmt::Debug for ReconnectDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectDelay::FullJitter => write!(f, "FullJitter"),
            ReconnectDelay::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Link configuration. Every field has a working default; `from_env`
/// overlays the `VXUI_*` environment variables the launcher sets when it
/// spawns the display client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Full endpoint URL. When unset, derived from `port` as
    /// `ws://localhost:{port}/echo`.
    pub endpoint: Option<String>,
    /// WebSocket port used for the derived endpoint (default 8080).
    pub port: u16,
    /// Credential token; `None` puts the session in no-auth mode.
    pub token: Option<String>,
    pub reconnect_delay: ReconnectDelay,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Silence window after which the connection is considered stale.
    pub pong_timeout: Duration,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            port: 8080,
            token: None,
            reconnect_delay: ReconnectDelay::FullJitter,
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            debug: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(endpoint) = env::var("VXUI_ENDPOINT") {
            if !endpoint.is_empty() {
                config.endpoint = Some(endpoint);
            }
        }
        if let Some(port) = env::var("VXUI_WS_PORT").ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        if let Ok(token) = env::var("VXUI_TOKEN") {
            if !token.is_empty() {
                config.token = Some(token);
            }
        }
        config.debug = matches!(env::var("VXUI_DEBUG").ok().as_deref(), Some("1") | Some("true"));
        config
    }

    /// The WebSocket URL this session dials.
    pub fn ws_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("ws://localhost:{}/echo", self.port),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}
