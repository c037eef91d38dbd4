use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::snapshot::Field;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub portal: PortalConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    #[serde(default = "default_login_url")]
    pub login_url: String,
    /// Page fetched after login. Empty means the login response is the dashboard.
    #[serde(default = "default_dashboard_url")]
    pub dashboard_url: String,
    /// Substring of the post-login URL that marks a successful login.
    #[serde(default = "default_success_marker")]
    pub success_marker: String,
    #[serde(default = "default_csrf_field")]
    pub csrf_field: String,
    #[serde(default = "default_username_field")]
    pub username_field: String,
    #[serde(default = "default_password_field")]
    pub password_field: String,
    #[serde(default = "default_portal_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Element id overrides keyed by field slug.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub initial_delay_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Send one notice per streak of rejected logins or unreadable pages.
    #[serde(default)]
    pub notify_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default, skip_serializing)]
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Public URL Telegram should post updates to. Empty selects long polling.
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default, skip_serializing)]
    pub webhook_secret: String,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bot_token: Option<String>,
    pub webhook_url: Option<String>,
    pub port: Option<u16>,
    pub interval_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Reads `BOT_TOKEN`, `WEBHOOK_URL` and `PORT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Self {
            bot_token: non_empty("BOT_TOKEN"),
            webhook_url: non_empty("WEBHOOK_URL"),
            port: non_empty("PORT").and_then(|raw| raw.trim().parse().ok()),
            interval_secs: None,
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".config/portal-watch/config.toml")
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(|p| p.to_path_buf())
            .unwrap_or_else(Self::default_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("failed reading config: {}", path.display()))?;
        Self::parse(&data)
            .with_context(|| format!("failed parsing TOML config: {}", path.display()))
    }

    /// Parses TOML and canonicalizes `[portal.fields]` keys to field slugs.
    pub fn parse(data: &str) -> Result<Self> {
        let mut parsed: Self = toml::from_str(data)?;
        parsed.portal.fields = canonical_field_ids(&parsed.portal.fields)?;
        Ok(parsed)
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(bot_token) = overrides.bot_token {
            self.telegram.bot_token = bot_token;
        }
        if let Some(webhook_url) = overrides.webhook_url {
            self.telegram.webhook_url = webhook_url;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(interval_secs) = overrides.interval_secs {
            self.watch.interval_secs = interval_secs;
        }
    }

    pub fn write_template(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed creating config directory: {}", parent.display())
            })?;
        }
        fs::write(path, Self::default_template())
            .with_context(|| format!("failed writing config template: {}", path.display()))
    }

    pub fn default_template() -> String {
        let template = r#"[portal]
login_url = "https://cuportal.covenantuniversity.edu.ng/login.php"
dashboard_url = "https://cuportal.covenantuniversity.edu.ng/dashboard.php"
success_marker = "dashboard"
csrf_field = "csrf_token"
username_field = "username"
password_field = "password"
timeout_secs = 20
connect_timeout_secs = 8

[portal.fields]
# attendance = "attendance"

[watch]
interval_secs = 300
initial_delay_secs = 0
fetch_timeout_secs = 60
notify_on_failure = false

[telegram]
# Prefer the BOT_TOKEN environment variable.
bot_token = ""
api_base = "https://api.telegram.org"
webhook_url = ""
webhook_secret = ""
poll_timeout_secs = 30

[server]
host = "0.0.0.0"
port = 5000
"#;
        template.to_string()
    }
}

fn canonical_field_ids(fields: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    let mut canonical = BTreeMap::new();
    for (key, element_id) in fields {
        let field: Field = key
            .parse()
            .with_context(|| format!("invalid key in [portal.fields]: {key}"))?;
        if canonical
            .insert(field.as_slug().to_string(), element_id.clone())
            .is_some()
        {
            bail!("[portal.fields] sets {} more than once", field.as_slug());
        }
    }
    Ok(canonical)
}

impl PortalConfig {
    pub fn element_id(&self, field: Field) -> &str {
        self.fields
            .get(field.as_slug())
            .map(String::as_str)
            .unwrap_or_else(|| field.default_element_id())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

impl WatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }
}

impl TelegramConfig {
    pub fn uses_webhook(&self) -> bool {
        !self.webhook_url.trim().is_empty()
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            dashboard_url: default_dashboard_url(),
            success_marker: default_success_marker(),
            csrf_field: default_csrf_field(),
            username_field: default_username_field(),
            password_field: default_password_field(),
            timeout_secs: default_portal_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            fields: BTreeMap::new(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            initial_delay_secs: 0,
            fetch_timeout_secs: default_fetch_timeout_secs(),
            notify_on_failure: false,
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_api_base(),
            webhook_url: String::new(),
            webhook_secret: String::new(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_login_url() -> String {
    "https://cuportal.covenantuniversity.edu.ng/login.php".to_string()
}

fn default_dashboard_url() -> String {
    "https://cuportal.covenantuniversity.edu.ng/dashboard.php".to_string()
}

fn default_success_marker() -> String {
    "dashboard".to_string()
}

fn default_csrf_field() -> String {
    "csrf_token".to_string()
}

fn default_username_field() -> String {
    "username".to_string()
}

fn default_password_field() -> String {
    "password".to_string()
}

fn default_portal_timeout_secs() -> u64 {
    20
}

fn default_connect_timeout_secs() -> u64 {
    8
}

fn default_interval_secs() -> u64 {
    300
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}
