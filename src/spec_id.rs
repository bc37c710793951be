//! Spec identity: slug derivation and content hashing
//!
//! A run is identified by `(spec_slug, spec_hash)`. The slug is derived from
//! the spec filename; the hash is the first five hex characters of the BLAKE3
//! digest of the spec file content, so the same spec always maps to the same
//! workspace while edited copies get fresh ones.

use camino::Utf8Path;
use thiserror::Error;

/// Minimum spec size accepted by the initializer. Anything smaller is almost
/// certainly a placeholder file, and refusing early avoids creating a
/// milestone for it.
pub const MIN_SPEC_BYTES: u64 = 50;

#[derive(Error, Debug)]
pub enum SpecIdError {
    #[error("Spec file not found: {path}")]
    NotFound { path: String },

    #[error("Spec file too small ({size} bytes, minimum {MIN_SPEC_BYTES}): {path}")]
    TooSmall { path: String, size: u64 },

    #[error("Failed to read spec file {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid spec slug '{slug}': must be lowercase alphanumeric segments joined by single hyphens")]
    InvalidSlug { slug: String },

    #[error("Invalid spec hash '{hash}': must be exactly 5 lowercase hex characters")]
    InvalidHash { hash: String },
}

/// Convert a spec filename to a workspace slug.
///
/// Lowercases the file stem, maps runs of non-alphanumerics to single
/// hyphens, and strips leading/trailing hyphens. Falls back to `"default"`
/// when nothing survives.
#[must_use]
pub fn slug_from_filename(spec_file: &Utf8Path) -> String {
    let stem = spec_file.file_stem().unwrap_or("default");
    let mut slug = String::with_capacity(stem.len());
    let mut last_hyphen = true; // suppress leading hyphen
    for ch in stem.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "default".to_string()
    } else {
        slug
    }
}

/// Generate the deterministic 5-hex-character hash for a spec file.
///
/// Hashes the file content, so a byte-identical spec always lands in the same
/// workspace. Also enforces the minimum-size precondition.
pub fn hash_from_content(spec_file: &Utf8Path) -> Result<String, SpecIdError> {
    let meta = std::fs::metadata(spec_file).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SpecIdError::NotFound {
                path: spec_file.to_string(),
            }
        } else {
            SpecIdError::Unreadable {
                path: spec_file.to_string(),
                source: e,
            }
        }
    })?;
    if meta.len() < MIN_SPEC_BYTES {
        return Err(SpecIdError::TooSmall {
            path: spec_file.to_string(),
            size: meta.len(),
        });
    }

    let content = std::fs::read(spec_file).map_err(|e| SpecIdError::Unreadable {
        path: spec_file.to_string(),
        source: e,
    })?;
    let digest = blake3::hash(&content);
    Ok(digest.to_hex()[..5].to_string())
}

/// Validate a slug against the workspace naming rules.
pub fn validate_slug(slug: &str) -> Result<(), SpecIdError> {
    let valid = !slug.is_empty()
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && !slug.contains("--")
        && slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(SpecIdError::InvalidSlug {
            slug: slug.to_string(),
        })
    }
}

/// Validate a spec hash (5 lowercase hex characters).
pub fn validate_hash(hash: &str) -> Result<(), SpecIdError> {
    let valid = hash.len() == 5 && hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
    if valid {
        Ok(())
    } else {
        Err(SpecIdError::InvalidHash {
            hash: hash.to_string(),
        })
    }
}
