//! Allow-list validation for everything that ends up in a subprocess argument
//! vector or a remote filesystem call.
//!
//! Identifiers arriving from the resource listing layer are treated as opaque
//! tokens and re-validated here before they reach the tunnel helper.

pub mod path;

pub use path::*;

use crate::error::{AppError, AppResult};
use once_cell::sync::Lazy;
use regex::Regex;

/// Project id: 6-30 chars, lowercase letters/digits/hyphens, starts with a letter,
/// ends with a letter or digit.
static PROJECT_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z]([a-z0-9-]{4,28}[a-z0-9])?$").unwrap());

/// Zone: `{region}-{location}{number}-{letter}`, e.g. `us-central1-a`.
static ZONE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z]+-[a-z]+[0-9]+-[a-z]$").unwrap());

/// Instance name: 1-63 chars, starts with a letter, ends with a letter or digit.
static INSTANCE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z]([a-z0-9-]{0,61}[a-z0-9])?$").unwrap());

/// POSIX username, 1-32 chars.
static USERNAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").unwrap());

/// Validate a cloud project id
pub fn validate_project_id(project_id: &str) -> AppResult<()> {
    if project_id.is_empty() {
        return Err(AppError::InvalidIdentifier("Project ID cannot be empty".to_string()));
    }

    if !PROJECT_ID_REGEX.is_match(project_id) {
        return Err(AppError::InvalidIdentifier(format!(
            "Invalid project ID '{}'. Must be 6-30 chars, lowercase letters/digits/hyphens, \
             start with letter, end with letter or digit",
            project_id
        )));
    }

    Ok(())
}

/// Validate a zone name such as `europe-west1-b`
pub fn validate_zone(zone: &str) -> AppResult<()> {
    if zone.is_empty() {
        return Err(AppError::InvalidIdentifier("Zone cannot be empty".to_string()));
    }

    if !ZONE_REGEX.is_match(zone) {
        return Err(AppError::InvalidIdentifier(format!(
            "Invalid zone '{}'. Expected format: region-location#-letter (e.g., us-central1-a)",
            zone
        )));
    }

    Ok(())
}

/// Validate an instance (tunnel target) name
pub fn validate_instance_name(instance_name: &str) -> AppResult<()> {
    if instance_name.is_empty() {
        return Err(AppError::InvalidIdentifier("Instance name cannot be empty".to_string()));
    }

    if instance_name.len() > 63 {
        return Err(AppError::InvalidIdentifier(format!(
            "Instance name too long ({} chars). Maximum is 63 characters",
            instance_name.len()
        )));
    }

    if !INSTANCE_NAME_REGEX.is_match(instance_name) {
        return Err(AppError::InvalidIdentifier(format!(
            "Invalid instance name '{}'. Must start with lowercase letter, \
             contain only lowercase letters/digits/hyphens, and end with letter or digit",
            instance_name
        )));
    }

    Ok(())
}

/// Validate a remote Linux username for file operations
pub fn validate_username(username: &str) -> AppResult<()> {
    if username.is_empty() {
        return Err(AppError::InvalidIdentifier("Username cannot be empty".to_string()));
    }

    if username.len() > 32 {
        return Err(AppError::InvalidIdentifier(format!(
            "Username too long ({} chars). Maximum is 32 characters",
            username.len()
        )));
    }

    if !USERNAME_REGEX.is_match(username) {
        return Err(AppError::InvalidIdentifier(format!(
            "Invalid username '{}'. Must start with lowercase letter or underscore, \
             contain only lowercase letters/digits/underscores/hyphens",
            username
        )));
    }

    Ok(())
}

/// Validate a remote service port
pub fn validate_remote_port(port: u16) -> AppResult<()> {
    if port == 0 {
        return Err(AppError::InvalidIdentifier("Remote port cannot be 0".to_string()));
    }
    Ok(())
}

/// Extract the zone name from a compute API zone URL
/// (`https://.../projects/p/zones/us-central1-a`) and validate it.
pub fn sanitize_zone_from_url(zone_url: &str) -> AppResult<String> {
    let zone_name = zone_url
        .rsplit('/')
        .next()
        .filter(|z| !z.is_empty())
        .ok_or_else(|| AppError::InvalidIdentifier(format!("Invalid zone URL format: {}", zone_url)))?;

    validate_zone(zone_name)?;

    Ok(zone_name.to_string())
}
