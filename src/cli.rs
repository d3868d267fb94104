//! CLI commands for extension management

use crate::config::RuntimeConfig;
use crate::extensions::{
    ExtensionManifest, ExtensionRegistry, ExtensionRuntime, ExtensionStatus, LoadedExtension,
    ProcessLauncher, RuntimeEvent, SecretsStore, TaskEvent,
};
use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};

fn open_registry(config: &RuntimeConfig) -> Result<ExtensionRegistry> {
    ExtensionRegistry::open(config.extensions_dir()?)
}

/// Open the secrets store if a master secret is configured
fn open_secrets(config: &RuntimeConfig) -> Result<Option<SecretsStore>> {
    let Some(master) = config.master_secret() else {
        return Ok(None);
    };
    let db_path = config.secrets_db_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = SecretsStore::open(&db_path, &master)
        .with_context(|| format!("Failed to open secrets store {}", db_path.display()))?;
    Ok(Some(store))
}

fn status_label(status: ExtensionStatus) -> String {
    match status {
        ExtensionStatus::Active => "✓ active".green().to_string(),
        ExtensionStatus::Loading => "… loading".yellow().to_string(),
        ExtensionStatus::Disabled => "✗ disabled".dimmed().to_string(),
        ExtensionStatus::Error => "✗ error".red().to_string(),
    }
}

/// List installed extensions
pub fn run_list(config: &RuntimeConfig) -> Result<()> {
    let registry = open_registry(config)?;

    println!("{}", "=== Installed Extensions ===".bold().cyan());
    println!();

    #[derive(Tabled)]
    struct ExtensionRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Version")]
        version: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Permissions")]
        permissions: usize,
        #[tabled(rename = "Description")]
        description: String,
    }

    let rows: Vec<ExtensionRow> = registry
        .all()
        .into_iter()
        .map(|e| ExtensionRow {
            id: e.id().to_string(),
            version: e.manifest.version.clone(),
            status: if e.enabled {
                "✓ enabled".green().to_string()
            } else {
                "✗ disabled".red().to_string()
            },
            permissions: e.manifest.permissions.len(),
            description: e.manifest.description.chars().take(40).collect::<String>(),
        })
        .collect();

    if rows.is_empty() {
        println!("No extensions installed.");
    } else {
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{}", table);
    }

    println!();
    println!(
        "Extensions directory: {}",
        registry.extensions_dir().display()
    );

    Ok(())
}

fn print_manifest(manifest: &ExtensionManifest) {
    println!("{}:    {}", "Name".bold(), manifest.display_name());
    println!("{}:  {}", "Version".bold(), manifest.version);
    println!("{}:    {}", "Main".bold(), manifest.main);
    if let Some(runtime) = &manifest.runtime {
        println!("{}: {}", "Runtime".bold(), runtime);
    }
    if !manifest.description.is_empty() {
        println!("{}: {}", "Description".bold(), manifest.description);
    }

    println!();
    println!("{}:", "Permissions".bold());
    if manifest.permissions.is_empty() {
        println!("  (none)");
    }
    for permission in &manifest.permissions {
        if crate::extensions::manifest::is_known_permission(permission) {
            println!("  • {}", permission);
        } else {
            println!("  • {} {}", permission, "(unknown, grants nothing)".yellow());
        }
    }

    let contributes = &manifest.contributes;
    if !contributes.collections.is_empty() {
        println!();
        println!("{}:", "Collections".bold());
        for collection in &contributes.collections {
            if collection.indexes.is_empty() {
                println!("  • {}", collection.name);
            } else {
                println!(
                    "  • {} (indexed: {})",
                    collection.name,
                    collection.indexes.join(", ")
                );
            }
        }
    }

    println!();
    println!("{}:", "Contributes".bold());
    println!("  Settings:  {}", contributes.settings.len());
    println!("  Providers: {}", contributes.providers.len());
    println!("  Tools:     {}", contributes.tools.len());
    println!("  Actions:   {}", contributes.actions.len());
}

/// Show extension details
pub fn run_info(config: &RuntimeConfig, extension_id: &str) -> Result<()> {
    let registry = open_registry(config)?;

    let extension = registry
        .get(extension_id)
        .ok_or_else(|| anyhow::anyhow!("Extension '{}' not found", extension_id))?;

    println!(
        "{}",
        format!("=== Extension: {} ===", extension_id).bold().cyan()
    );
    println!();
    println!(
        "{}:  {}",
        "Status".bold(),
        if extension.enabled {
            "enabled".green()
        } else {
            "disabled".red()
        }
    );
    print_manifest(&extension.manifest);

    println!();
    println!("{}:", "Paths".bold());
    println!("  Install: {}", extension.path.display());
    println!("  Data:    {}", config.storage_dir()?.join(extension_id).display());

    Ok(())
}

/// Enable an extension
pub fn run_enable(config: &RuntimeConfig, extension_id: &str) -> Result<()> {
    let mut registry = open_registry(config)?;
    registry.enable(extension_id)?;
    println!("✅ Enabled extension: {}", extension_id.green());
    Ok(())
}

/// Disable an extension
pub fn run_disable(config: &RuntimeConfig, extension_id: &str) -> Result<()> {
    let mut registry = open_registry(config)?;
    registry.disable(extension_id)?;
    println!("✅ Disabled extension: {}", extension_id.yellow());
    Ok(())
}

/// Check a manifest file or extension directory
pub fn run_validate(path: &Path) -> Result<()> {
    let manifest = if path.is_dir() {
        ExtensionManifest::load_from_dir(path)?
    } else {
        ExtensionManifest::load(path)?
    };

    println!(
        "{}",
        format!("=== Validating: {} ===", manifest.id).bold().cyan()
    );
    println!();

    manifest
        .validate()
        .with_context(|| format!("Manifest for '{}' is invalid", manifest.id))?;

    print_manifest(&manifest);
    println!();
    println!("✅ Manifest is valid: {}", manifest.id.green());
    Ok(())
}

fn print_loaded(loaded: &[LoadedExtension]) {
    #[derive(Tabled)]
    struct LoadedRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Version")]
        version: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Providers")]
        providers: usize,
        #[tabled(rename = "Tools")]
        tools: usize,
        #[tabled(rename = "Error")]
        error: String,
    }

    if loaded.is_empty() {
        println!("No extensions to load.");
        return;
    }

    let rows: Vec<LoadedRow> = loaded
        .iter()
        .map(|e| LoadedRow {
            id: e.id.clone(),
            version: e.version.clone(),
            status: status_label(e.status),
            providers: e.providers.len(),
            tools: e.tools.len(),
            error: e.error.clone().unwrap_or_default(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);
}

/// Load every enabled extension and keep them running until Ctrl-C
pub async fn run_extensions(config: RuntimeConfig, once: bool) -> Result<()> {
    let registry = open_registry(&config)?;

    let mut builder = ExtensionRuntime::builder()
        .config(config.clone())
        .launcher(Arc::new(ProcessLauncher::new()));
    match open_secrets(&config)? {
        Some(store) => builder = builder.secrets(Arc::new(store)),
        None => tracing::warn!(
            "{} is not set; secrets requests will fail",
            config.secrets.master_secret_env
        ),
    }
    let runtime = builder.build()?;

    let mut events = runtime.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                RuntimeEvent::ExtensionError { extension_id, error } => {
                    tracing::error!(extension = %extension_id, "{}", error)
                }
                other => tracing::info!("{:?}", other),
            }
        }
    });
    let mut task_events = runtime.subscribe_tasks();
    let task_log = tokio::spawn(async move {
        while let Ok(event) = task_events.recv().await {
            match &event {
                TaskEvent::Exhausted { .. } | TaskEvent::Failed { .. } => {
                    tracing::warn!("{:?}", event)
                }
                _ => tracing::debug!("{:?}", event),
            }
        }
    });

    println!("{}", "=== Extension Runtime ===".bold().cyan());
    println!();
    let loaded = runtime.load_enabled(&registry).await;
    print_loaded(&loaded);

    if !once {
        println!();
        println!("Running. Press Ctrl-C to stop.");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        println!();
    }

    runtime.shutdown().await;
    event_log.abort();
    task_log.abort();
    println!("✅ All extensions unloaded");
    Ok(())
}

/// Delete every secret and all storage of an extension
pub fn run_secrets_purge(config: &RuntimeConfig, extension_id: &str) -> Result<()> {
    let store = open_secrets(config)?.ok_or_else(|| {
        anyhow::anyhow!(
            "{} must be set to open the secrets store",
            config.secrets.master_secret_env
        )
    })?;

    println!(
        "{}",
        format!("=== Purging: {} ===", extension_id).bold().cyan()
    );
    println!();

    let storage = crate::extensions::storage::StorageManager::new(config.storage_dir()?);
    let storage_dir = storage
        .extension_dir(extension_id)
        .with_context(|| format!("Refusing to purge '{}'", extension_id))?;

    let removed = store.delete_all_for_extension(extension_id)?;
    storage.purge_extension(extension_id)?;

    println!("Secrets removed: {}", removed);
    println!("Storage removed: {}", storage_dir.display());
    println!();
    println!("✅ Purged extension data: {}", extension_id.green());
    Ok(())
}
