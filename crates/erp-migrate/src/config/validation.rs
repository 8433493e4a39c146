//! Configuration validation.

use std::collections::HashSet;

use super::Config;
use crate::core::identifier::validate_identifier;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.source.path.as_os_str().is_empty() {
        return Err(MigrateError::Config("source.path is required".into()));
    }
    if config.target.path.as_os_str().is_empty() {
        return Err(MigrateError::Config("target.path is required".into()));
    }
    if config.state.path.as_os_str().is_empty() {
        return Err(MigrateError::Config("state.path is required".into()));
    }
    if config.state.hmac_key.is_empty() {
        return Err(MigrateError::Config("state.hmac_key is required".into()));
    }
    if config.state.path == config.target.path {
        return Err(MigrateError::Config(
            "state.path and target.path cannot be the same file".into(),
        ));
    }
    if let Some(key) = &config.audit.signing_key {
        if key.is_empty() {
            return Err(MigrateError::Config(
                "audit.signing_key cannot be empty".into(),
            ));
        }
    }

    // Migration config validation - only check if explicitly set
    let migration = &config.migration;
    if let Some(0) = migration.batch_size {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.max_concurrent_jobs {
        return Err(MigrateError::Config(
            "migration.max_concurrent_jobs must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.pages_per_second {
        return Err(MigrateError::Config(
            "migration.pages_per_second must be at least 1".into(),
        ));
    }
    if migration.max_record_attempts == 0 {
        return Err(MigrateError::Config(
            "migration.max_record_attempts must be at least 1".into(),
        ));
    }
    if migration.retry.max_attempts == 0 {
        return Err(MigrateError::Config(
            "migration.retry.max_attempts must be at least 1".into(),
        ));
    }
    if migration.retry.base_delay_ms > migration.retry.max_delay_ms {
        return Err(MigrateError::Config(
            "migration.retry.base_delay_ms cannot exceed max_delay_ms".into(),
        ));
    }
    for (name, rate) in [
        ("max_null_rate", migration.max_null_rate),
        ("max_transform_error_rate", migration.max_transform_error_rate),
    ] {
        if !(0.0..=1.0).contains(&rate) {
            return Err(MigrateError::Config(format!(
                "migration.{} must be between 0 and 1, got {}",
                name, rate
            )));
        }
    }
    migration.thresholds.validate()?;

    let mut seen = HashSet::new();
    for entity in &config.entities {
        if entity.entity_type.is_empty() {
            return Err(MigrateError::Config(
                "entities[].entity_type is required".into(),
            ));
        }
        if !seen.insert(entity.entity_type.as_str()) {
            return Err(MigrateError::Config(format!(
                "entity type '{}' is configured more than once",
                entity.entity_type
            )));
        }
        validate_identifier(&entity.table)?;
        validate_identifier(&entity.id_column)?;
        let mut targets = HashSet::new();
        for field in &entity.fields {
            validate_identifier(&field.source)?;
            if !targets.insert(field.target.as_str()) {
                return Err(MigrateError::Config(format!(
                    "entity '{}' maps target field '{}' more than once",
                    entity.entity_type, field.target
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AuditConfig, MigrationConfig, SourceConfig, StateConfig, TargetConfig,
    };
    use crate::core::schema::EntityMapping;
    use crate::core::value::DataType;

    fn valid_config() -> Config {
        Config {
            source: SourceConfig {
                path: "legacy.json".into(),
            },
            target: TargetConfig {
                path: "target.json".into(),
            },
            state: StateConfig {
                path: "state.json".into(),
                hmac_key: "secret".to_string(),
            },
            migration: MigrationConfig::default(),
            audit: AuditConfig::default(),
            entities: vec![EntityMapping::new("contacts", "legacy_contacts")
                .map("email_addr", "email", DataType::Email)],
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_hmac_key() {
        let mut config = valid_config();
        config.state.hmac_key = String::new();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_state_and_target_same_file() {
        let mut config = valid_config();
        config.state.path = "target.json".into();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = valid_config();
        config.migration.batch_size = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_inverted_thresholds() {
        let mut config = valid_config();
        config.migration.thresholds.auto_merge = 50.0;
        config.migration.thresholds.manual_review = 70.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rate_out_of_range() {
        let mut config = valid_config();
        config.migration.max_null_rate = 1.5;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_entity_type() {
        let mut config = valid_config();
        config
            .entities
            .push(EntityMapping::new("contacts", "other_table"));
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_duplicate_target_field() {
        let mut config = valid_config();
        config.entities[0] = EntityMapping::new("contacts", "legacy_contacts")
            .map("email_addr", "email", DataType::Email)
            .map("email2", "email", DataType::Email);
        assert!(validate(&config).is_err());
    }
}
