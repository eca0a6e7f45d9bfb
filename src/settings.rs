//! Per-guild ticket configuration.
//!
//! The dashboard reads and upserts these through [`SettingsRepository`]; the
//! durable store lives behind that trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use validator::Validate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct GuildSettings {
    #[serde(default)]
    pub ticket_category_id: Option<String>,
    #[serde(default)]
    pub log_channel_id: Option<String>,
    #[serde(default)]
    #[validate(length(max = 25))]
    pub support_role_ids: Vec<String>,
    #[serde(default)]
    #[validate(length(max = 2000))]
    pub welcome_message: Option<String>,
    #[serde(default = "default_max_open_tickets")]
    #[validate(range(min = 1, max = 50))]
    pub max_open_tickets: u32,
}

fn default_max_open_tickets() -> u32 {
    3
}

impl Default for GuildSettings {
    fn default() -> Self {
        Self {
            ticket_category_id: None,
            log_channel_id: None,
            support_role_ids: Vec::new(),
            welcome_message: None,
            max_open_tickets: default_max_open_tickets(),
        }
    }
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get(&self, guild_id: &str) -> Option<GuildSettings>;

    async fn upsert(&self, guild_id: &str, settings: GuildSettings) -> GuildSettings;
}

#[derive(Debug, Clone, Default)]
pub struct MemorySettingsRepository {
    settings: Arc<RwLock<HashMap<String, GuildSettings>>>,
}

impl MemorySettingsRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsRepository for MemorySettingsRepository {
    async fn get(&self, guild_id: &str) -> Option<GuildSettings> {
        self.settings.read().await.get(guild_id).cloned()
    }

    async fn upsert(&self, guild_id: &str, settings: GuildSettings) -> GuildSettings {
        self.settings
            .write()
            .await
            .insert(guild_id.to_string(), settings.clone());
        settings
    }
}
