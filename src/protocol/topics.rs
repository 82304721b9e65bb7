//! Topic canonicalization and topic-level validation
//!
//! Broker topics are built from a configurable root plus identifiers that end
//! up as single topic levels, so identifiers are restricted to a character set
//! that can never introduce wildcards or extra levels.

use thiserror::Error;

/// Canonicalize an MQTT topic.
///
/// Rules:
/// 1. No leading or trailing slash
/// 2. Consecutive slashes collapse into one level separator
pub fn canonicalize_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|level| !level.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Validate a single topic level (sensor id, daemon id) against `[A-Za-z0-9._-]+`
pub fn validate_topic_level(level: &str) -> Result<(), ValidationError> {
    if level.is_empty() {
        return Err(ValidationError::EmptyLevel);
    }

    for ch in level.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidChar(ch));
        }
    }

    Ok(())
}

/// Topic validation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("identifier cannot be empty")]
    EmptyLevel,
    #[error("identifier contains invalid character: '{0}'")]
    InvalidChar(char),
}
