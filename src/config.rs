use envconfig::Envconfig;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL; empty keeps the cache in process memory
    #[envconfig(from = "REDIS_URL", default = "")]
    pub redis_url: String,

    /// Bound on opening the Redis connection; store calls degrade past it
    #[envconfig(from = "REDIS_CONNECT_TIMEOUT_MS", default = "2000")]
    pub redis_connect_timeout_ms: u64,

    /// Discord REST base URL, including the API version segment
    #[envconfig(from = "DISCORD_API_BASE", default = "https://discord.com/api/v10")]
    pub discord_api_base: String,

    /// Ceiling for any stored rate-limit penalty
    #[envconfig(from = "MAX_PENALTY_SECS", default = "60")]
    pub max_penalty_secs: u64,

    /// Wait suggested to callers while a flag is present
    #[envconfig(from = "SUGGESTED_WAIT_SECS", default = "30")]
    pub suggested_wait_secs: u64,

    /// Penalty used when a 429 carries no wait duration
    #[envconfig(from = "DEFAULT_RETRY_AFTER_SECS", default = "60")]
    pub default_retry_after_secs: u64,

    #[envconfig(from = "USER_GUILDS_TTL", default = "300")]
    pub user_guilds_ttl: u64,

    #[envconfig(from = "GUILD_TTL", default = "600")]
    pub guild_ttl: u64,

    #[envconfig(from = "CHANNELS_TTL", default = "300")]
    pub channels_ttl: u64,

    #[envconfig(from = "CURRENT_USER_TTL", default = "600")]
    pub current_user_ttl: u64,

    /// Lifetime of the shadow copy served when Discord is unreachable
    #[envconfig(from = "STALE_TTL", default = "86400")]
    pub stale_ttl: u64,

    /// Transport-level retries per outbound call
    #[envconfig(from = "MAX_RETRIES", default = "2")]
    pub max_retries: u32,

    #[envconfig(from = "RETRY_BACKOFF_MS", default = "250")]
    pub retry_backoff_ms: u64,

    #[envconfig(from = "HTTP_TIMEOUT_SECS", default = "10")]
    pub http_timeout_secs: u64,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn uses_redis(&self) -> bool {
        !self.redis_url.trim().is_empty()
    }

    pub fn redis_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_connect_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn cache_ttls(&self) -> CacheTtls {
        CacheTtls {
            user_guilds: self.user_guilds_ttl,
            guild: self.guild_ttl,
            channels: self.channels_ttl,
            current_user: self.current_user_ttl,
            stale: self.stale_ttl,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            redis_url: String::new(),
            redis_connect_timeout_ms: 2000,
            discord_api_base: "https://discord.com/api/v10".to_string(),
            max_penalty_secs: 60,
            suggested_wait_secs: 30,
            default_retry_after_secs: 60,
            user_guilds_ttl: 300,
            guild_ttl: 600,
            channels_ttl: 300,
            current_user_ttl: 600,
            stale_ttl: 86_400,
            max_retries: 2,
            retry_backoff_ms: 250,
            http_timeout_secs: 10,
            log_level: "info".to_string(),
        }
    }
}

/// Per-operation cache lifetimes, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub user_guilds: u64,
    pub guild: u64,
    pub channels: u64,
    pub current_user: u64,
    pub stale: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Config::default().cache_ttls()
    }
}
