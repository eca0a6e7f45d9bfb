pub mod config;
pub mod discord;
pub mod error;
pub mod executor;
pub mod gate;
pub mod handlers;
pub mod health;
pub mod keys;
pub mod metrics;
pub mod middleware;
pub mod permissions;
pub mod server;
pub mod settings;
pub mod store;
pub mod transport;
pub mod validation;

pub use config::Config;
pub use discord::DiscordClient;
pub use error::{ApiError, Error, Result};
pub use executor::CachedFetcher;
pub use gate::{RateLimitGate, RateLimitStatus};
pub use server::create_app;
pub use store::CacheStore;
