use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

/// Environment variables read by the service.  Names match the config keys
/// case-insensitively.
const ENV_KEYS: &[&str] = &[
    "NPM_API_URL",
    "NPM_API_EMAIL",
    "NPM_API_PASSWORD",
    "DOCKER_SOCKET",
    "LOG_LEVEL",
    "MAX_RETRIES",
    "RETRY_DELAY",
    "REQUEST_TIMEOUT",
    "SYNC_INTERVAL",
    "HEALTH_PORT",
];

#[derive(Clone, Deserialize, Serialize)]
pub struct Config {
    pub npm_api_url: String,
    pub npm_api_email: String,
    pub npm_api_password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_socket: Option<String>,
    pub log_level: String,
    pub max_retries: u32,
    /// Base backoff in seconds.
    pub retry_delay: u64,
    /// Per-request timeout in seconds.
    pub request_timeout: u64,
    /// Seconds between full syncs.
    pub sync_interval: u64,
    pub health_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            npm_api_url: String::new(),
            npm_api_email: String::new(),
            npm_api_password: String::new(),
            docker_socket: None,
            log_level: "info".into(),
            max_retries: 3,
            retry_delay: 5,
            request_timeout: 30,
            sync_interval: 60,
            health_port: 8080,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("npm_api_url", &self.npm_api_url)
            .field("npm_api_email", &self.npm_api_email)
            .field("npm_api_password", &"[REDACTED]")
            .field("docker_socket", &self.docker_socket)
            .field("log_level", &self.log_level)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("request_timeout", &self.request_timeout)
            .field("sync_interval", &self.sync_interval)
            .field("health_port", &self.health_port)
            .finish()
    }
}

impl Config {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("envoy-npm.toml"))
            .merge(Json::file("envoy-npm.json"))
            .merge(Env::raw().only(ENV_KEYS))
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("NPM_API_PASSWORD_FILE") {
            config.npm_api_password = std::fs::read_to_string(secret_file)?
                .trim()
                .to_string();
        }

        config.npm_api_url = config.npm_api_url.trim_end_matches('/').to_string();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let missing: Vec<&str> = [
            ("NPM_API_URL", &self.npm_api_url),
            ("NPM_API_EMAIL", &self.npm_api_email),
            ("NPM_API_PASSWORD", &self.npm_api_password),
        ]
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();

        if !missing.is_empty() {
            anyhow::bail!(
                "Missing required configuration: {}",
                missing.join(", ")
            );
        }
        if self.sync_interval == 0 {
            anyhow::bail!("SYNC_INTERVAL must be greater than zero");
        }
        Ok(())
    }

    pub fn health_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.health_port))
    }
}
