//! Extension manifest parsing and validation
//!
//! Each extension ships an `extension.toml` (or `extension.json`) declaring:
//! - Metadata (id, version, name, entry point)
//! - Requested permissions
//! - Contributions (settings, tools, providers, actions, panels, storage collections)

use super::error::ManifestError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;

/// Manifest file names probed in an extension directory, in order
pub const MANIFEST_FILES: &[&str] = &["extension.toml", "extension.json"];

/// Permissions that carry no parameter
pub const KNOWN_PERMISSIONS: &[&str] = &[
    "storage.local",
    "database.own",
    "settings.register",
    "user.profile.read",
    "providers.register",
    "tools.register",
    "actions.register",
    "scheduler.register",
    "secrets.manage",
    "chat.message.write",
    "background.workers",
];

/// Permission prefixes that take a parameter (`network:api.example.com`)
const PARAMETERIZED_PREFIXES: &[&str] = &["network:", "storage:"];

static EXTENSION_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("valid regex"));

static COLLECTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,62}$").expect("valid regex"));

static FIELD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid regex"));

/// A declared storage collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDeclaration {
    pub name: String,
    /// Top-level JSON fields to index
    #[serde(default)]
    pub indexes: Vec<String>,
}

/// A user-configurable setting with its default
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingContribution {
    pub key: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub setting_type: Option<String>,
    #[serde(default)]
    pub default: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContribution {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool arguments
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderContribution {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionContribution {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelContribution {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub entry: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandContribution {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptContribution {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub template: String,
}

/// Everything an extension adds to the host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Contributions {
    pub settings: Vec<SettingContribution>,
    pub tools: Vec<ToolContribution>,
    pub providers: Vec<ProviderContribution>,
    pub actions: Vec<ActionContribution>,
    pub panels: Vec<PanelContribution>,
    pub commands: Vec<CommandContribution>,
    pub prompts: Vec<PromptContribution>,
    pub collections: Vec<CollectionDeclaration>,
}

/// Extension manifest (extension.toml / extension.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionManifest {
    /// Unique extension identifier (e.g., "todo-sync")
    pub id: String,

    /// Extension version (semver)
    pub version: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Entry point, relative to the extension directory
    #[serde(default)]
    pub main: String,

    /// Interpreter used to launch `main` (e.g. "node"); executed directly when absent
    #[serde(default)]
    pub runtime: Option<String>,

    #[serde(default)]
    pub permissions: Vec<String>,

    #[serde(default)]
    pub contributes: Contributions,
}

impl ExtensionManifest {
    /// Parse a manifest file. Validation is a separate step.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: display.clone(),
            source,
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            serde_json::from_str(&content).map_err(|e| ManifestError::Parse {
                path: display,
                message: e.to_string(),
            })
        } else {
            toml::from_str(&content).map_err(|e| ManifestError::Parse {
                path: display,
                message: e.to_string(),
            })
        }
    }

    /// Find and parse the manifest inside an extension directory
    pub fn load_from_dir(dir: &Path) -> Result<Self, ManifestError> {
        let path = MANIFEST_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.exists())
            .ok_or(ManifestError::MissingField("extension.toml"))?;
        Self::load(&path)
    }

    /// Schema and semantic checks
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.id.is_empty() {
            return Err(ManifestError::MissingField("id"));
        }
        if !is_valid_id(&self.id) {
            return Err(ManifestError::Invalid(format!(
                "Extension id must be alphanumeric with hyphens/underscores (max 64 chars): {}",
                self.id
            )));
        }

        if self.version.is_empty() {
            return Err(ManifestError::MissingField("version"));
        }
        if semver::Version::parse(&self.version).is_err() {
            return Err(ManifestError::Invalid(format!(
                "Extension version must be valid semver: {}",
                self.version
            )));
        }

        if self.main.trim().is_empty() {
            return Err(ManifestError::MissingField("main"));
        }
        let main = Path::new(&self.main);
        if main.is_absolute() || self.main.split(&['/', '\\'][..]).any(|part| part == "..") {
            return Err(ManifestError::Invalid(format!(
                "Entry point must stay inside the extension directory: {}",
                self.main
            )));
        }

        for permission in &self.permissions {
            if permission.trim().is_empty() {
                return Err(ManifestError::Invalid("Empty permission string".into()));
            }
            if !is_known_permission(permission) {
                tracing::warn!(
                    "Extension '{}' declares unknown permission '{}' - it grants nothing",
                    self.id,
                    permission
                );
            }
        }

        let mut seen = HashSet::new();
        for collection in &self.contributes.collections {
            if !COLLECTION_RE.is_match(&collection.name) {
                return Err(ManifestError::Invalid(format!(
                    "Collection name must be lowercase snake_case: {}",
                    collection.name
                )));
            }
            if !seen.insert(collection.name.as_str()) {
                return Err(ManifestError::Invalid(format!(
                    "Duplicate collection: {}",
                    collection.name
                )));
            }
            for field in &collection.indexes {
                if !FIELD_RE.is_match(field) {
                    return Err(ManifestError::Invalid(format!(
                        "Invalid index field '{}' in collection '{}'",
                        field, collection.name
                    )));
                }
            }
        }

        check_unique("setting", self.contributes.settings.iter().map(|s| &s.key))?;
        check_unique("tool", self.contributes.tools.iter().map(|t| &t.id))?;
        check_unique("provider", self.contributes.providers.iter().map(|p| &p.id))?;
        check_unique("action", self.contributes.actions.iter().map(|a| &a.id))?;

        Ok(())
    }

    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Settings map seeded from declared defaults
    pub fn default_settings(&self) -> Map<String, Value> {
        self.contributes
            .settings
            .iter()
            .map(|s| (s.key.clone(), s.default.clone()))
            .collect()
    }

    pub fn declares_setting(&self, key: &str) -> bool {
        self.contributes.settings.iter().any(|s| s.key == key)
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionDeclaration> {
        self.contributes.collections.iter().find(|c| c.name == name)
    }
}

fn check_unique<'a>(
    kind: &str,
    ids: impl Iterator<Item = &'a String>,
) -> Result<(), ManifestError> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.is_empty() {
            return Err(ManifestError::Invalid(format!("Empty {} id", kind)));
        }
        if !seen.insert(id) {
            return Err(ManifestError::Invalid(format!("Duplicate {} id: {}", kind, id)));
        }
    }
    Ok(())
}

/// Whether `id` is a well-formed extension id (also safe as a path segment)
pub fn is_valid_id(id: &str) -> bool {
    EXTENSION_ID_RE.is_match(id)
}

/// Whether a permission string belongs to the known vocabulary
pub fn is_known_permission(permission: &str) -> bool {
    if KNOWN_PERMISSIONS.contains(&permission) {
        return true;
    }
    if permission.ends_with(":*") {
        return true;
    }
    PARAMETERIZED_PREFIXES
        .iter()
        .any(|prefix| permission.len() > prefix.len() && permission.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOML: &str = r#"
id = "todo-sync"
version = "1.2.0"
name = "Todo Sync"
main = "dist/index.js"
runtime = "node"
permissions = ["storage.local", "network:api.todo.dev", "secrets.manage"]

[[contributes.settings]]
key = "syncInterval"
default = 300

[[contributes.tools]]
id = "list_todos"
name = "List todos"
description = "Lists todos"
parameters = { type = "object" }

[[contributes.collections]]
name = "todos"
indexes = ["due", "done"]
"#;

    #[test]
    fn test_parse_toml_manifest() {
        let manifest: ExtensionManifest = toml::from_str(TOML).unwrap();
        assert_eq!(manifest.id, "todo-sync");
        assert_eq!(manifest.runtime.as_deref(), Some("node"));
        assert_eq!(manifest.contributes.tools.len(), 1);
        assert_eq!(
            manifest.collection("todos").unwrap().indexes,
            vec!["due".to_string(), "done".to_string()]
        );
        assert_eq!(manifest.default_settings()["syncInterval"], 300);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_parse_json_manifest() {
        let json = r#"{
            "id": "weather",
            "version": "0.1.0",
            "main": "index.js",
            "permissions": ["network:*"],
            "contributes": { "providers": [{ "id": "wx", "name": "Weather" }] }
        }"#;
        let manifest: ExtensionManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.contributes.providers[0].name, "Weather");
        assert_eq!(manifest.display_name(), "weather");
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let base: ExtensionManifest = toml::from_str(TOML).unwrap();

        let mut m = base.clone();
        m.version = "one".into();
        assert!(m.validate().is_err());

        let mut m = base.clone();
        m.id = "has spaces".into();
        assert!(m.validate().is_err());

        let mut m = base.clone();
        m.main = "../escape.js".into();
        assert!(m.validate().is_err());

        let mut m = base.clone();
        m.main = String::new();
        assert!(matches!(
            m.validate(),
            Err(ManifestError::MissingField("main"))
        ));

        let mut m = base.clone();
        m.contributes.collections[0].name = "Todos; DROP".into();
        assert!(m.validate().is_err());

        let mut m = base;
        m.contributes.collections[0].indexes.push("a-b".into());
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_known_permissions() {
        assert!(is_known_permission("network:api.example.com:8443"));
        assert!(is_known_permission("storage:*"));
        assert!(is_known_permission("secrets.manage"));
        assert!(!is_known_permission("network:"));
        assert!(!is_known_permission("shell.exec"));
    }
}
