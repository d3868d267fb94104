//! Providers, tools and actions registered by running units.
//!
//! Every descriptor is tagged with its owning extension so an unload can
//! remove all of them at once.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub extension_id: String,
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub extension_id: String,
    pub id: String,
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescriptor {
    pub extension_id: String,
    pub id: String,
    pub name: String,
}

/// What an unload removed
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RemovedContributions {
    pub providers: Vec<String>,
    pub tools: Vec<String>,
    pub actions: Vec<String>,
}

#[derive(Default)]
pub struct ContributionRegistry {
    /// Provider and tool ids are global; first registrant owns the id
    providers: DashMap<String, ProviderDescriptor>,
    tools: DashMap<String, ToolDescriptor>,
    /// Actions are addressed per extension
    actions: DashMap<(String, String), ActionDescriptor>,
}

impl ContributionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update a provider. Fails if another extension owns the id.
    pub fn register_provider(&self, provider: ProviderDescriptor) -> Result<(), String> {
        match self.providers.entry(provider.id.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().extension_id != provider.extension_id {
                    return Err(format!(
                        "provider '{}' is already registered by {}",
                        provider.id,
                        existing.get().extension_id
                    ));
                }
                existing.insert(provider);
            }
            Entry::Vacant(slot) => {
                slot.insert(provider);
            }
        }
        Ok(())
    }

    pub fn unregister_provider(&self, extension_id: &str, id: &str) -> bool {
        self.providers
            .remove_if(id, |_, p| p.extension_id == extension_id)
            .is_some()
    }

    pub fn register_tool(&self, tool: ToolDescriptor) -> Result<(), String> {
        match self.tools.entry(tool.id.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().extension_id != tool.extension_id {
                    return Err(format!(
                        "tool '{}' is already registered by {}",
                        tool.id,
                        existing.get().extension_id
                    ));
                }
                existing.insert(tool);
            }
            Entry::Vacant(slot) => {
                slot.insert(tool);
            }
        }
        Ok(())
    }

    pub fn unregister_tool(&self, extension_id: &str, id: &str) -> bool {
        self.tools
            .remove_if(id, |_, t| t.extension_id == extension_id)
            .is_some()
    }

    pub fn register_action(&self, action: ActionDescriptor) {
        self.actions
            .insert((action.extension_id.clone(), action.id.clone()), action);
    }

    pub fn provider(&self, id: &str) -> Option<ProviderDescriptor> {
        self.providers.get(id).map(|p| p.value().clone())
    }

    pub fn tool(&self, id: &str) -> Option<ToolDescriptor> {
        self.tools.get(id).map(|t| t.value().clone())
    }

    pub fn action(&self, extension_id: &str, id: &str) -> Option<ActionDescriptor> {
        self.actions
            .get(&(extension_id.to_string(), id.to_string()))
            .map(|a| a.value().clone())
    }

    /// Remove everything an extension registered
    pub fn unregister_extension(&self, extension_id: &str) -> RemovedContributions {
        let mut removed = RemovedContributions::default();

        self.providers.retain(|id, p| {
            let keep = p.extension_id != extension_id;
            if !keep {
                removed.providers.push(id.clone());
            }
            keep
        });
        self.tools.retain(|id, t| {
            let keep = t.extension_id != extension_id;
            if !keep {
                removed.tools.push(id.clone());
            }
            keep
        });
        self.actions.retain(|(ext, id), _| {
            let keep = ext != extension_id;
            if !keep {
                removed.actions.push(id.clone());
            }
            keep
        });

        removed.providers.sort();
        removed.tools.sort();
        removed.actions.sort();
        removed
    }

    pub fn providers(&self) -> Vec<ProviderDescriptor> {
        let mut list: Vec<_> = self.providers.iter().map(|p| p.value().clone()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        let mut list: Vec<_> = self.tools.iter().map(|t| t.value().clone()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn actions(&self) -> Vec<ActionDescriptor> {
        let mut list: Vec<_> = self.actions.iter().map(|a| a.value().clone()).collect();
        list.sort_by(|a, b| (&a.extension_id, &a.id).cmp(&(&b.extension_id, &b.id)));
        list
    }

    /// Ids of providers and tools owned by one extension
    pub fn owned_by(&self, extension_id: &str) -> (Vec<String>, Vec<String>) {
        let providers = self
            .providers()
            .into_iter()
            .filter(|p| p.extension_id == extension_id)
            .map(|p| p.id)
            .collect();
        let tools = self
            .tools()
            .into_iter()
            .filter(|t| t.extension_id == extension_id)
            .map(|t| t.id)
            .collect();
        (providers, tools)
    }
}
