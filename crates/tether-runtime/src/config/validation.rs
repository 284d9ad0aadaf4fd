//! Configuration validation utilities.

use super::error::{ConfigError, ConfigResult};
use super::schema::{DefinitionConfig, LoggingConfig, ScopeConfig, TetherConfig};

/// Longest accepted timeout: 30 days.
pub const MAX_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

/// Validates the entire configuration.
pub fn validate_config(config: &TetherConfig) -> ConfigResult<()> {
    validate_scope_config(&config.scope)?;
    validate_logging_config(&config.logging)?;
    Ok(())
}

/// Validates the global policy defaults and every definition override.
fn validate_scope_config(scope: &ScopeConfig) -> ConfigResult<()> {
    validate_timeouts(
        "scope",
        scope.idle_timeout_secs,
        scope.autocomplete_timeout_secs,
    )?;

    for (name, definition) in &scope.definitions {
        validate_definition_config(scope, name, definition)?;
    }

    Ok(())
}

/// Validates one definition override against the defaults it inherits.
fn validate_definition_config(
    scope: &ScopeConfig,
    name: &str,
    definition: &DefinitionConfig,
) -> ConfigResult<()> {
    if name.trim().is_empty() {
        return Err(ConfigError::validation(
            "Definition names under [scope.definitions] cannot be empty",
        ));
    }

    validate_timeouts(
        &format!("scope.definitions.{name}"),
        definition.idle_timeout_secs.unwrap_or(scope.idle_timeout_secs),
        definition
            .autocomplete_timeout_secs
            .unwrap_or(scope.autocomplete_timeout_secs),
    )
}

fn validate_timeouts(section: &str, idle_secs: u64, autocomplete_secs: u64) -> ConfigResult<()> {
    if idle_secs == 0 {
        return Err(ConfigError::validation(format!(
            "{section}: idle timeout must be greater than 0"
        )));
    }

    if autocomplete_secs == 0 {
        return Err(ConfigError::validation(format!(
            "{section}: autocomplete timeout must be greater than 0"
        )));
    }

    if idle_secs > MAX_TIMEOUT_SECS {
        return Err(ConfigError::validation(format!(
            "{section}: idle timeout ({idle_secs}s) exceeds the maximum of {MAX_TIMEOUT_SECS}s"
        )));
    }

    if autocomplete_secs > idle_secs {
        return Err(ConfigError::validation(format!(
            "{section}: autocomplete timeout ({autocomplete_secs}s) \
             cannot exceed the idle timeout ({idle_secs}s)"
        )));
    }

    Ok(())
}

/// Validates logging configuration.
fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.filters.keys().any(|target| target.trim().is_empty()) {
        return Err(ConfigError::validation(
            "Log filter targets cannot be empty",
        ));
    }

    if let Some(path) = &logging.file_path
        && path.file_name().is_none()
    {
        return Err(ConfigError::validation(format!(
            "Log file path '{}' does not name a file",
            path.display()
        )));
    }

    Ok(())
}
