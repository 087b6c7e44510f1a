//! Plugin registry collaborator.

use crate::error::{MigrationError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An installed plugin as the registry reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    /// Plugin id; also the table-name prefix of plugin-owned tables.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Installed version, if the registry tracks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Whether the plugin is enabled.
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl PluginInfo {
    /// Enabled plugin without a known version.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: None,
            enabled: true,
        }
    }

    /// Set the installed version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Enumerates installed plugins.
#[async_trait]
pub trait PluginRegistry: Send + Sync {
    /// Every installed plugin.
    async fn list_plugins(&self) -> Result<Vec<PluginInfo>>;

    /// One plugin by id.
    async fn get_plugin(&self, id: &str) -> Result<PluginInfo>;
}

/// Registry over a fixed list.
#[derive(Debug, Clone, Default)]
pub struct StaticPluginRegistry {
    plugins: Vec<PluginInfo>,
}

impl StaticPluginRegistry {
    /// Registry reporting `plugins`.
    #[must_use]
    pub fn new(plugins: Vec<PluginInfo>) -> Self {
        Self { plugins }
    }
}

#[async_trait]
impl PluginRegistry for StaticPluginRegistry {
    async fn list_plugins(&self) -> Result<Vec<PluginInfo>> {
        Ok(self.plugins.clone())
    }

    async fn get_plugin(&self, id: &str) -> Result<PluginInfo> {
        self.plugins
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| MigrationError::NotFound {
                id: format!("plugin {id}"),
            })
    }
}
