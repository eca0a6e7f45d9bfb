//! Typed Discord REST operations on top of [`CachedFetcher`].
//!
//! This is where failures turn into fallbacks: each operation decides whether
//! an error propagates, falls back to a stale copy, or becomes an empty value.

use crate::config::{CacheTtls, Config};
use crate::error::{Error, Result};
use crate::executor::CachedFetcher;
use crate::keys;
use crate::store::CacheStore;
use crate::transport::{HttpTransport, OutboundRequest, ReqwestTransport};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Entry of `GET /users/@me/guilds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialGuild {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub owner: bool,
    #[serde(default, with = "permission_bits")]
    pub permissions: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guild {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: u8,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Discord sends permission integers as decimal strings; older payloads use numbers.
mod permission_bits {
    use serde::de::{self, Deserializer};
    use serde::{Deserialize, Serializer};

    pub fn serialize<S: Serializer>(bits: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&bits.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(bits) => Ok(bits),
            Raw::Text(text) => text.trim().parse().map_err(de::Error::custom),
        }
    }
}

#[derive(Clone)]
pub struct DiscordClient {
    fetcher: CachedFetcher,
    base_url: Url,
    ttls: CacheTtls,
    max_retries: u32,
}

impl DiscordClient {
    pub fn new(fetcher: CachedFetcher, base_url: &str, ttls: CacheTtls, max_retries: u32) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| Error::Connection(format!("Invalid Discord API base '{}': {}", base_url, e)))?;
        if parsed.cannot_be_a_base() {
            return Err(Error::Connection(format!(
                "Discord API base '{}' is not a base URL",
                base_url
            )));
        }

        Ok(Self {
            fetcher,
            base_url: parsed,
            ttls,
            max_retries,
        })
    }

    /// Production wiring: reqwest transport over the given store.
    pub fn from_config(config: &Config, store: CacheStore) -> Result<Self> {
        let transport: Arc<dyn HttpTransport> = Arc::new(
            ReqwestTransport::new(config.http_timeout()).map_err(|e| Error::Connection(e.0))?,
        );
        let fetcher = CachedFetcher::from_config(transport, store, config);
        Self::new(
            fetcher,
            &config.discord_api_base,
            config.cache_ttls(),
            config.max_retries,
        )
    }

    pub fn fetcher(&self) -> &CachedFetcher {
        &self.fetcher
    }

    fn store(&self) -> &CacheStore {
        self.fetcher.store()
    }

    /// Each segment is percent-encoded on its own, so an id can never add
    /// path components of its own.
    fn url(&self, segments: &[&str]) -> String {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.to_string()
    }

    fn request(&self, segments: &[&str], access_token: &str) -> OutboundRequest {
        OutboundRequest::get(self.url(segments))
            .bearer(access_token)
            .max_retries(self.max_retries)
    }

    /// Guilds the user belongs to. On failure, falls back to any cached copy,
    /// however old, before giving up.
    pub async fn get_user_guilds(
        &self,
        access_token: &str,
        user_id: &str,
        force_fresh: bool,
    ) -> Result<Vec<PartialGuild>> {
        let key = keys::user_guilds(user_id);
        let stale_key = keys::user_guilds_stale(user_id);
        let request = self
            .request(&["users", "@me", "guilds"], access_token)
            .cached(key.clone(), self.ttls.user_guilds)
            .skip_cache_read(force_fresh);

        match self.fetcher.fetch_with_policy::<Vec<PartialGuild>>(&request).await {
            Ok(guilds) => {
                self.store().put(&stale_key, &guilds, self.ttls.stale).await;
                Ok(guilds)
            }
            Err(err) => {
                for fallback in [&key, &stale_key] {
                    if let Some(guilds) = self.store().get::<Vec<PartialGuild>>(fallback).await {
                        warn!(user_id, cache_key = %fallback, error = %err, "Serving cached guild list after fetch failure");
                        return Ok(guilds);
                    }
                }
                Err(err)
            }
        }
    }

    /// `None` when the guild cannot be fetched for any reason.
    pub async fn get_guild(&self, guild_id: &str, access_token: &str) -> Option<Guild> {
        let request = self
            .request(&["guilds", guild_id], access_token)
            .cached(keys::guild(guild_id), self.ttls.guild);

        match self.fetcher.fetch_with_policy::<Guild>(&request).await {
            Ok(guild) => Some(guild),
            Err(err) => {
                warn!(guild_id, error = %err, "Failed to fetch guild");
                None
            }
        }
    }

    /// Never fails; an unreachable guild has no channels.
    pub async fn get_guild_channels(&self, guild_id: &str, access_token: &str) -> Vec<Channel> {
        let request = self
            .request(&["guilds", guild_id, "channels"], access_token)
            .cached(keys::guild_channels(guild_id), self.ttls.channels);

        match self.fetcher.fetch_with_policy::<Vec<Channel>>(&request).await {
            Ok(channels) => channels,
            Err(err) => {
                warn!(guild_id, error = %err, "Failed to fetch guild channels");
                Vec::new()
            }
        }
    }

    pub async fn get_current_user(&self, access_token: &str) -> Option<User> {
        let request = self
            .request(&["users", "@me"], access_token)
            .cached(keys::current_user(access_token), self.ttls.current_user);

        match self.fetcher.fetch_with_policy::<User>(&request).await {
            Ok(user) => Some(user),
            Err(err) => {
                warn!(error = %err, "Failed to fetch current user");
                None
            }
        }
    }

    pub async fn clear_user_cache(&self, user_id: &str) -> u64 {
        let mut deleted = 0;
        for pattern in keys::user_patterns(user_id) {
            deleted += self.store().delete(&pattern).await;
        }
        info!(user_id, deleted, "Cleared user cache");
        deleted
    }

    pub async fn clear_guild_cache(&self, guild_id: &str) -> u64 {
        let mut deleted = 0;
        for pattern in keys::guild_patterns(guild_id) {
            deleted += self.store().delete(&pattern).await;
        }
        info!(guild_id, deleted, "Cleared guild cache");
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_guild_accepts_string_and_number_permissions() {
        let from_string: PartialGuild = serde_json::from_value(json!({
            "id": "1", "name": "a", "owner": false, "permissions": "2147483647", "features": []
        }))
        .unwrap();
        assert_eq!(from_string.permissions, 2_147_483_647);
        assert!(from_string.extra.contains_key("features"));

        let from_number: PartialGuild =
            serde_json::from_value(json!({"id": "2", "permissions": 32})).unwrap();
        assert_eq!(from_number.permissions, 32);
        assert!(!from_number.owner);
    }

    #[test]
    fn test_partial_guild_round_trips_through_cache_shape() {
        let guild: PartialGuild =
            serde_json::from_value(json!({"id": "1", "permissions": "32", "banner": null})).unwrap();
        let stored = serde_json::to_value(&guild).unwrap();
        assert_eq!(stored["permissions"], "32");
        assert_eq!(serde_json::from_value::<PartialGuild>(stored).unwrap(), guild);
    }

    #[test]
    fn test_channel_type_field() {
        let channel: Channel =
            serde_json::from_value(json!({"id": "5", "type": 4, "name": "Tickets"})).unwrap();
        assert_eq!(channel.kind, 4);
        assert_eq!(channel.name.as_deref(), Some("Tickets"));
    }

    fn client(base: &str) -> DiscordClient {
        let store = CacheStore::in_memory();
        DiscordClient::from_config(
            &Config {
                discord_api_base: base.into(),
                ..Config::default()
            },
            store,
        )
        .unwrap()
    }

    #[test]
    fn test_url_joins_segments_onto_base() {
        let client = client("https://discord.com/api/v10/");
        assert_eq!(
            client.url(&["guilds", "42", "channels"]),
            "https://discord.com/api/v10/guilds/42/channels"
        );
        assert_eq!(client.url(&["users", "@me"]), "https://discord.com/api/v10/users/@me");
    }

    #[test]
    fn test_url_keeps_ids_inside_one_segment() {
        let client = client("https://discord.com/api/v10");
        let url = client.url(&["guilds", "1/../../users/@me"]);
        assert_eq!(url, "https://discord.com/api/v10/guilds/1%2F..%2F..%2Fusers%2F@me");
        assert_eq!(
            keys::endpoint_id(&url),
            "/api/v10/guilds/1%2F..%2F..%2Fusers%2F@me"
        );

        let url = client.url(&["guilds", "7?with_counts=true#x"]);
        assert_eq!(url, "https://discord.com/api/v10/guilds/7%3Fwith_counts=true%23x");
    }

    #[test]
    fn test_rejects_bad_base_url() {
        let store = CacheStore::in_memory();
        let err = DiscordClient::from_config(
            &Config {
                discord_api_base: "not a url".into(),
                ..Config::default()
            },
            store,
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Connection(_)));
    }
}
