use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::discord::{Channel, DiscordClient, Guild, PartialGuild, User};
use crate::error::ApiError;
use crate::health::HealthChecker;
use crate::permissions::{filter_by_permission, has_permission, Permission};
use crate::settings::{GuildSettings, SettingsRepository};
use crate::validation::RequestValidator;

/// Shared application state
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub discord: DiscordClient,
    pub settings: Arc<dyn SettingsRepository>,
    pub health: HealthChecker,
}

#[derive(Debug, Default, Deserialize)]
pub struct GuildListQuery {
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    pub guild_id: String,
    pub settings: GuildSettings,
}

/// Dashboard caller resolved from the bearer token
struct Session {
    token: String,
    user: User,
}

async fn session(state: &AppState, headers: &HeaderMap) -> Result<Session, ApiError> {
    let token = RequestValidator::bearer_token(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok()),
    )?;

    let user = state
        .discord
        .get_current_user(&token)
        .await
        .ok_or_else(|| ApiError::Unauthorized("Could not resolve Discord user".into()))?;

    Ok(Session { token, user })
}

/// The caller must manage `guild_id` to see or change anything about it
async fn managed_guild(
    state: &AppState,
    session: &Session,
    guild_id: &str,
) -> Result<PartialGuild, ApiError> {
    RequestValidator::validate_snowflake("guild_id", guild_id)?;

    let guilds = state
        .discord
        .get_user_guilds(&session.token, &session.user.id, false)
        .await?;

    guilds
        .into_iter()
        .find(|guild| guild.id == guild_id)
        .filter(|guild| has_permission(guild, Permission::ManageGuild))
        .ok_or_else(|| ApiError::Forbidden("You do not manage this guild".into()))
}

pub async fn current_user(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<User>, ApiError> {
    let session = session(&state, &headers).await?;
    Ok(Json(session.user))
}

/// Guilds the caller can configure
pub async fn list_guilds(
    State(state): State<SharedState>,
    Query(query): Query<GuildListQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<PartialGuild>>, ApiError> {
    let session = session(&state, &headers).await?;
    let guilds = state
        .discord
        .get_user_guilds(&session.token, &session.user.id, query.refresh)
        .await?;

    Ok(Json(filter_by_permission(&guilds, Permission::ManageGuild)))
}

pub async fn refresh_guilds(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Vec<PartialGuild>>, ApiError> {
    let session = session(&state, &headers).await?;
    state.discord.clear_user_cache(&session.user.id).await;

    let guilds = state
        .discord
        .get_user_guilds(&session.token, &session.user.id, true)
        .await?;

    Ok(Json(filter_by_permission(&guilds, Permission::ManageGuild)))
}

pub async fn get_guild(
    State(state): State<SharedState>,
    Path(guild_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Guild>, ApiError> {
    let session = session(&state, &headers).await?;
    managed_guild(&state, &session, &guild_id).await?;

    state
        .discord
        .get_guild(&guild_id, &session.token)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Guild {} is unavailable", guild_id)))
}

pub async fn get_guild_channels(
    State(state): State<SharedState>,
    Path(guild_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Channel>>, ApiError> {
    let session = session(&state, &headers).await?;
    managed_guild(&state, &session, &guild_id).await?;

    Ok(Json(
        state
            .discord
            .get_guild_channels(&guild_id, &session.token)
            .await,
    ))
}

pub async fn get_settings(
    State(state): State<SharedState>,
    Path(guild_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SettingsResponse>, ApiError> {
    let session = session(&state, &headers).await?;
    managed_guild(&state, &session, &guild_id).await?;

    let settings = state.settings.get(&guild_id).await.unwrap_or_default();
    Ok(Json(SettingsResponse { guild_id, settings }))
}

/// Saving settings invalidates everything cached for the guild
pub async fn put_settings(
    State(state): State<SharedState>,
    Path(guild_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<GuildSettings>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let session = session(&state, &headers).await?;
    managed_guild(&state, &session, &guild_id).await?;
    RequestValidator::validate_settings(&payload)?;

    let settings = state.settings.upsert(&guild_id, payload).await;
    state.discord.clear_guild_cache(&guild_id).await;

    Ok(Json(SettingsResponse { guild_id, settings }))
}

pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.discord.fetcher().metrics().snapshot().await)
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.health.check_health().await)
}

/// Readiness check endpoint; the cache is optional so this never fails
pub async fn readiness_check(State(state): State<SharedState>) -> impl IntoResponse {
    let health = state.health.check_health().await;
    let cache = if health.dependencies.cache.status == "healthy" {
        "connected"
    } else {
        "disconnected"
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ready",
            "cache": cache,
            "backend": health.dependencies.cache.backend,
        })),
    )
}
