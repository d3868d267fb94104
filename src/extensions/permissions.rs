//! Capability checks for extension requests
//!
//! A `PermissionChecker` is built once per loaded extension from the
//! manifest's permission strings and declared collections. It holds no
//! shared state and every check is a pure function of the grant set.

use super::error::Denial;
use super::manifest::{CollectionDeclaration, ExtensionManifest};
use std::collections::HashSet;

pub const STORAGE_LOCAL: &str = "storage.local";
pub const DATABASE_OWN: &str = "database.own";
pub const SETTINGS_REGISTER: &str = "settings.register";
pub const USER_PROFILE_READ: &str = "user.profile.read";
pub const PROVIDERS_REGISTER: &str = "providers.register";
pub const TOOLS_REGISTER: &str = "tools.register";
pub const ACTIONS_REGISTER: &str = "actions.register";
pub const SCHEDULER_REGISTER: &str = "scheduler.register";
pub const SECRETS_MANAGE: &str = "secrets.manage";
pub const CHAT_MESSAGE_WRITE: &str = "chat.message.write";
pub const BACKGROUND_WORKERS: &str = "background.workers";
pub const NETWORK_ANY: &str = "network:*";
pub const NETWORK_LOCALHOST: &str = "network:localhost";

const LOCALHOST_NAMES: &[&str] = &["localhost", "127.0.0.1", "::1", "[::1]"];

/// Outcome of a permission check
pub type Decision = Result<(), Denial>;

/// Evaluates an extension's declared capabilities
#[derive(Debug, Clone, Default)]
pub struct PermissionChecker {
    granted: HashSet<String>,
    /// `prefix:` parts of every `prefix:*` grant
    wildcard_prefixes: Vec<String>,
    collections: Vec<CollectionDeclaration>,
}

impl PermissionChecker {
    pub fn new(permissions: &[String], collections: &[CollectionDeclaration]) -> Self {
        let wildcard_prefixes = permissions
            .iter()
            .filter_map(|p| p.strip_suffix('*'))
            .filter(|prefix| prefix.ends_with(':'))
            .map(str::to_string)
            .collect();

        Self {
            granted: permissions.iter().cloned().collect(),
            wildcard_prefixes,
            collections: collections.to_vec(),
        }
    }

    pub fn from_manifest(manifest: &ExtensionManifest) -> Self {
        Self::new(&manifest.permissions, &manifest.contributes.collections)
    }

    /// Exact grant, or a `prefix:*` grant whose prefix starts `permission`
    pub fn has_permission(&self, permission: &str) -> bool {
        self.granted.contains(permission)
            || self
                .wildcard_prefixes
                .iter()
                .any(|prefix| permission.starts_with(prefix.as_str()))
    }

    pub fn permissions(&self) -> Vec<String> {
        let mut list: Vec<String> = self.granted.iter().cloned().collect();
        list.sort();
        list
    }

    fn require(&self, permission: &str, what: &str) -> Decision {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(Denial::new(
                permission,
                format!("extension is not allowed to {}", what),
            ))
        }
    }

    /// Network access to a URL.
    ///
    /// Accepts `network:*`, `network:localhost` for loopback hosts on any port,
    /// `network:<host>` for any port, or `network:<host>:<port>` exactly.
    pub fn check_network(&self, raw_url: &str) -> Decision {
        let url = url::Url::parse(raw_url).map_err(|e| {
            Denial::new(NETWORK_ANY, format!("invalid URL '{}': {}", raw_url, e))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(Denial::new(
                NETWORK_ANY,
                format!("unsupported URL scheme '{}'", url.scheme()),
            ));
        }

        let host = url
            .host_str()
            .ok_or_else(|| Denial::new(NETWORK_ANY, format!("URL has no host: {}", raw_url)))?
            .to_ascii_lowercase();
        let port = url.port_or_known_default();
        let with_port = match port {
            Some(p) => format!("network:{}:{}", host, p),
            None => format!("network:{}", host),
        };

        if self.has_permission(NETWORK_ANY) {
            return Ok(());
        }
        if LOCALHOST_NAMES.contains(&host.as_str()) && self.has_permission(NETWORK_LOCALHOST) {
            return Ok(());
        }
        if self.granted.contains(&format!("network:{}", host)) || self.granted.contains(&with_port)
        {
            return Ok(());
        }

        Err(Denial::new(
            with_port,
            format!("network access to '{}' was not declared", host),
        ))
    }

    /// Legacy single-flag key/value storage
    pub fn check_storage(&self) -> Decision {
        self.require(STORAGE_LOCAL, "use local storage")
    }

    /// Legacy single-flag database access
    pub fn check_database(&self) -> Decision {
        self.require(DATABASE_OWN, "use its database")
    }

    pub fn check_settings(&self) -> Decision {
        self.require(SETTINGS_REGISTER, "change settings")
    }

    pub fn check_user_profile(&self) -> Decision {
        self.require(USER_PROFILE_READ, "read user profiles")
    }

    pub fn check_provider_registration(&self) -> Decision {
        self.require(PROVIDERS_REGISTER, "register providers")
    }

    pub fn check_tool_registration(&self) -> Decision {
        self.require(TOOLS_REGISTER, "register tools")
    }

    pub fn check_action_registration(&self) -> Decision {
        self.require(ACTIONS_REGISTER, "register actions")
    }

    pub fn check_scheduler(&self) -> Decision {
        self.require(SCHEDULER_REGISTER, "schedule jobs")
    }

    pub fn check_secrets(&self) -> Decision {
        self.require(SECRETS_MANAGE, "manage secrets")
    }

    pub fn check_chat_write(&self) -> Decision {
        self.require(CHAT_MESSAGE_WRITE, "write chat messages")
    }

    pub fn check_background_workers(&self) -> Decision {
        self.require(BACKGROUND_WORKERS, "run background workers")
    }

    /// Collection-scoped storage.
    ///
    /// Stricter than `check_storage`: the collection must be declared in the
    /// manifest, and an extension with no declared collections gets nothing.
    /// Access additionally needs `storage.local` or `storage:<collection>`.
    pub fn validate_collection_access(&self, collection: &str) -> Decision {
        let scoped = format!("storage:{}", collection);

        if self.collections.is_empty() {
            return Err(Denial::new(
                scoped,
                "extension declares no storage collections",
            ));
        }
        if !self.collections.iter().any(|c| c.name == collection) {
            return Err(Denial::new(
                scoped,
                format!("collection '{}' is not declared in the manifest", collection),
            ));
        }
        if self.has_permission(&scoped) || self.has_permission(STORAGE_LOCAL) {
            return Ok(());
        }
        Err(Denial::new(
            scoped,
            format!("extension holds no storage permission for '{}'", collection),
        ))
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionDeclaration> {
        self.collections.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(perms: &[&str]) -> PermissionChecker {
        let perms: Vec<String> = perms.iter().map(|s| s.to_string()).collect();
        PermissionChecker::new(&perms, &[])
    }

    fn with_collections(perms: &[&str], names: &[&str]) -> PermissionChecker {
        let perms: Vec<String> = perms.iter().map(|s| s.to_string()).collect();
        let collections: Vec<CollectionDeclaration> = names
            .iter()
            .map(|n| CollectionDeclaration {
                name: n.to_string(),
                indexes: vec![],
            })
            .collect();
        PermissionChecker::new(&perms, &collections)
    }

    #[test]
    fn test_exact_and_wildcard() {
        let c = checker(&["secrets.manage", "network:*"]);
        assert!(c.has_permission("secrets.manage"));
        assert!(c.has_permission("network:api.example.com"));
        assert!(!c.has_permission("secrets"));
        assert!(!c.has_permission("storage.local"));
    }

    #[test]
    fn test_bare_star_is_not_a_wildcard() {
        let c = checker(&["storage*"]);
        assert!(!c.has_permission("storage.local"));
        assert!(c.has_permission("storage*"));
    }

    #[test]
    fn test_network_host_and_port() {
        let c = checker(&["network:api.example.com", "network:internal.dev:8443"]);
        assert!(c.check_network("https://api.example.com/v1").is_ok());
        assert!(c.check_network("http://api.example.com:9000/").is_ok());
        assert!(c.check_network("https://internal.dev:8443/x").is_ok());
        assert!(c.check_network("https://internal.dev/x").is_err());
        assert!(c.check_network("https://evil.com").is_err());
        assert!(c.check_network("ftp://api.example.com").is_err());
        assert!(c.check_network("not a url").is_err());
    }

    #[test]
    fn test_network_localhost() {
        let c = checker(&["network:localhost"]);
        assert!(c.check_network("http://localhost:3000/").is_ok());
        assert!(c.check_network("http://127.0.0.1:8080/").is_ok());
        assert!(c.check_network("http://[::1]:8080/").is_ok());
        assert!(c.check_network("http://example.com/").is_err());
    }

    #[test]
    fn test_network_denial_names_permission() {
        let c = checker(&[]);
        let denial = c.check_network("https://api.example.com/x").unwrap_err();
        assert_eq!(denial.required, "network:api.example.com:443");
    }

    #[test]
    fn test_flag_checks() {
        let c = checker(&["settings.register", "chat.message.write"]);
        assert!(c.check_settings().is_ok());
        assert!(c.check_chat_write().is_ok());
        let denial = c.check_secrets().unwrap_err();
        assert_eq!(denial.required, SECRETS_MANAGE);
        assert!(c.check_scheduler().is_err());
        assert!(c.check_background_workers().is_err());
    }

    #[test]
    fn test_collection_access() {
        let c = with_collections(&["storage.local"], &["notes"]);
        assert!(c.validate_collection_access("notes").is_ok());
        assert!(c.validate_collection_access("other").is_err());

        let scoped = with_collections(&["storage:notes"], &["notes", "tags"]);
        assert!(scoped.validate_collection_access("notes").is_ok());
        assert!(scoped.validate_collection_access("tags").is_err());

        let none = with_collections(&["storage.local"], &[]);
        assert!(none.validate_collection_access("notes").is_err());

        let no_perms = with_collections(&[], &["notes"]);
        assert!(no_perms.validate_collection_access("notes").is_err());
    }
}
