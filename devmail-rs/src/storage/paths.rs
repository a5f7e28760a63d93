//! Path-traversal guards for everything that touches the mail directory

use crate::error::{MailError, Result};
use std::path::{Component, Path, PathBuf};

/// Accept only non-empty ids made of `[A-Za-z0-9_-]`
pub fn validate_email_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(MailError::Validation("email ID cannot be empty".to_string()));
    }
    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(MailError::Validation(
            "invalid email ID: contains path traversal characters".to_string(),
        ));
    }
    if id.contains('\0') {
        return Err(MailError::Validation(
            "invalid email ID: contains null byte".to_string(),
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(MailError::Validation(
            "invalid email ID: contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty()
        || filename.contains("..")
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains('\0')
    {
        return Err(MailError::Validation(
            "invalid filename: contains path traversal characters".to_string(),
        ));
    }
    Ok(())
}

/// Fail unless `resolved` stays inside `base` once both are absolute
pub fn ensure_within(base: &Path, resolved: &Path) -> Result<()> {
    let base = absolute(base)?;
    let resolved = absolute(resolved)?;

    match resolved.strip_prefix(&base) {
        Ok(rel) if !rel.components().any(|c| matches!(c, Component::ParentDir)) => Ok(()),
        _ => Err(MailError::Validation(
            "path traversal detected: path is outside base directory".to_string(),
        )),
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
