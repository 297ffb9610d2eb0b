//! Extension manifest parsing.
//!
//! Each extension directory carries a `manifest.json` that defines:
//! - Identity (id, display name)
//! - Keyword triggers, in declaration order
//! - The executable to launch, plus optional arguments
//! - Declared permissions

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::{ExtensionError, ExtensionResult};
use super::ExtensionId;

/// File name of the manifest inside an extension directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Complete extension manifest parsed from `manifest.json`.
///
/// Immutable once loaded; a reload replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionManifest {
    /// Unique identifier (lowercase, alphanumeric, hyphens, underscores, dots).
    pub id: ExtensionId,

    /// Human-readable display name.
    pub name: String,

    /// Keyword triggers. Order matters for dispatch.
    #[serde(default)]
    pub triggers: Vec<String>,

    /// Program to launch. Relative paths resolve against the extension directory.
    pub executable: PathBuf,

    /// Extra command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Declared permissions, passed through to the extension untouched.
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl ExtensionManifest {
    /// Load manifest from a directory containing `manifest.json`.
    pub fn load(extension_dir: &Path) -> ExtensionResult<Self> {
        let manifest_path = extension_dir.join(MANIFEST_FILE);

        if !manifest_path.exists() {
            return Err(ExtensionError::ManifestNotFound(
                extension_dir.to_path_buf(),
            ));
        }

        let content = std::fs::read_to_string(&manifest_path)?;

        let mut manifest: Self =
            serde_json::from_str(&content).map_err(|e| ExtensionError::ManifestInvalid {
                path: manifest_path.clone(),
                message: e.to_string(),
            })?;

        manifest.executable = resolve_executable(extension_dir, &manifest.executable);
        manifest
            .validate()
            .map_err(|e| match e {
                ExtensionError::ManifestInvalid { message, .. } => ExtensionError::ManifestInvalid {
                    path: manifest_path,
                    message,
                },
                other => other,
            })?;

        Ok(manifest)
    }

    /// Validate the manifest for required fields and constraints.
    pub fn validate(&self) -> ExtensionResult<()> {
        let invalid = |message: String| ExtensionError::ManifestInvalid {
            path: MANIFEST_FILE.into(),
            message,
        };

        if self.id.is_empty() {
            return Err(invalid("id is required".to_string()));
        }

        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid(format!(
                "id '{}' may only contain lowercase letters, digits, '-', '_' and '.'",
                self.id
            )));
        }

        if self.name.trim().is_empty() {
            return Err(invalid("name is required".to_string()));
        }

        if self.executable.as_os_str().is_empty() {
            return Err(invalid("executable is required".to_string()));
        }

        validate_triggers(&self.triggers).map_err(invalid)
    }

    /// Replace name and triggers with values announced by the running
    /// extension. Launch settings and permissions stay as loaded.
    pub fn with_announced(&self, name: Option<String>, triggers: Vec<String>) -> ExtensionResult<Self> {
        let updated = Self {
            name: name.unwrap_or_else(|| self.name.clone()),
            triggers,
            ..self.clone()
        };
        updated.validate()?;
        Ok(updated)
    }
}

pub(crate) fn validate_triggers(triggers: &[String]) -> Result<(), String> {
    for (idx, trigger) in triggers.iter().enumerate() {
        if trigger.is_empty() {
            return Err("triggers must not be empty".to_string());
        }
        if trigger.chars().any(char::is_whitespace) {
            return Err(format!("trigger '{}' must not contain whitespace", trigger));
        }
        if triggers[..idx].contains(trigger) {
            return Err(format!("trigger '{}' is declared twice", trigger));
        }
    }
    Ok(())
}

/// Bare program names are looked up on PATH at spawn time; anything that
/// looks like a path is expanded and anchored to the extension directory.
fn resolve_executable(extension_dir: &Path, executable: &Path) -> PathBuf {
    let raw = executable.to_string_lossy();
    if !raw.contains('/') && !raw.contains('\\') && !raw.starts_with('~') {
        return executable.to_path_buf();
    }

    let expanded = PathBuf::from(shellexpand::tilde(&raw).as_ref());
    if expanded.is_absolute() {
        expanded
    } else {
        extension_dir.join(expanded)
    }
}

/// Load every extension manifest below `extensions_dir`, paired with the
/// directory it came from.
///
/// Directories are visited in name order, which becomes the declaration
/// order used for dispatch. Broken manifests are logged and skipped.
pub fn load_all(extensions_dir: &Path) -> ExtensionResult<Vec<(PathBuf, ExtensionManifest)>> {
    if !extensions_dir.exists() {
        return Ok(Vec::new());
    }
    if !extensions_dir.is_dir() {
        return Err(ExtensionError::DirectoryNotFound(
            extensions_dir.to_path_buf(),
        ));
    }

    let mut dirs: Vec<PathBuf> = std::fs::read_dir(extensions_dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    let mut manifests: Vec<(PathBuf, ExtensionManifest)> = Vec::new();
    for path in dirs {
        match ExtensionManifest::load(&path) {
            Ok(manifest) => {
                if manifests.iter().any(|(_, m)| m.id == manifest.id) {
                    tracing::warn!(
                        extension = %manifest.id,
                        path = %path.display(),
                        "Skipping extension with duplicate id"
                    );
                    continue;
                }
                manifests.push((path, manifest));
            }
            Err(ExtensionError::ManifestNotFound(_)) => {
                // Not an extension directory, skip
                continue;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to load extension: {}", e);
                continue;
            }
        }
    }

    tracing::info!("Loaded {} extension manifests", manifests.len());
    Ok(manifests)
}
