use crate::error::ApiError;
use regex::Regex;
use std::sync::LazyLock;
use validator::Validate;

static SNOWFLAKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]{17,20}$").expect("snowflake pattern is valid")
});

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Discord ids are 17-20 digit snowflakes
    pub fn validate_snowflake(field: &str, value: &str) -> Result<(), ApiError> {
        if SNOWFLAKE.is_match(value.trim()) {
            Ok(())
        } else {
            Err(ApiError::ValidationError(format!(
                "'{}' is not a valid Discord id",
                field
            )))
        }
    }

    /// Run derive-based validation and every id field through the snowflake check
    pub fn validate_settings(
        settings: &crate::settings::GuildSettings,
    ) -> Result<(), ApiError> {
        settings
            .validate()
            .map_err(|e| ApiError::ValidationError(e.to_string()))?;

        if let Some(id) = &settings.ticket_category_id {
            Self::validate_snowflake("ticket_category_id", id)?;
        }
        if let Some(id) = &settings.log_channel_id {
            Self::validate_snowflake("log_channel_id", id)?;
        }
        for id in &settings.support_role_ids {
            Self::validate_snowflake("support_role_ids", id)?;
        }

        Ok(())
    }

    /// Extract the token from an `Authorization: Bearer ...` header value
    pub fn bearer_token(header: Option<&str>) -> Result<String, ApiError> {
        let header =
            header.ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".into()))?;

        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("Expected a bearer token".into()))?;

        Ok(token.to_string())
    }
}
