//! Cache-key and endpoint-id derivation.
//!
//! Cache keys name a cached result (`guilds:<user>`); endpoint ids name the
//! upstream route a rate limit applies to (`/users/@me/guilds`). The two never
//! share a namespace in the store.

use reqwest::Url;
use sha2::{Digest, Sha256};

const RATE_LIMIT_PREFIX: &str = "ratelimit";

/// Key under which the user's guild list is cached.
pub fn user_guilds(user_id: &str) -> String {
    format!("guilds:{}", sanitize_key(user_id))
}

/// Longer-lived copy of the guild list used for stale fallback.
pub fn user_guilds_stale(user_id: &str) -> String {
    format!("{}:stale", user_guilds(user_id))
}

pub fn guild(guild_id: &str) -> String {
    format!("guild:{}", sanitize_key(guild_id))
}

pub fn guild_channels(guild_id: &str) -> String {
    format!("channels:{}", sanitize_key(guild_id))
}

/// Per-token scope for `/users/@me`. Only a digest of the token is stored.
pub fn current_user(access_token: &str) -> String {
    format!("me:{}", token_fingerprint(access_token))
}

/// Key of the rate-limit flag for an endpoint.
pub fn rate_limit_flag(endpoint_id: &str) -> String {
    format!("{}:{}", RATE_LIMIT_PREFIX, endpoint_id)
}

/// Patterns that cover everything cached for a user.
pub fn user_patterns(user_id: &str) -> Vec<String> {
    let base = user_guilds(user_id);
    vec![base.clone(), format!("{}:*", base)]
}

/// Patterns that cover everything cached for a guild.
pub fn guild_patterns(guild_id: &str) -> Vec<String> {
    let guild = guild(guild_id);
    let channels = guild_channels(guild_id);
    vec![
        guild.clone(),
        format!("{}:*", guild),
        channels.clone(),
        format!("{}:*", channels),
    ]
}

/// Endpoint id for a request URL: its path, without query or fragment.
pub fn endpoint_id(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .to_string(),
    }
}

/// Hex sha256 prefix identifying a token without revealing it.
pub fn token_fingerprint(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .take(12)
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// Replace anything that could act as a glob or separator with `_`.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
