//! Plugins - loadable units owning services
//!
//! A plugin is a compile-time unit implementing [`PluginModule`]; its
//! `init` attaches services through the plugin handle it receives.
//! Loading dispatches `ServiceLoaded`/`PluginLoaded` meta events through
//! the engine; unloading dispatches the unload events first (handlers run
//! their cleanup, services unsubscribe their terminals), then drops every
//! registry entry. Reload is unload followed by load.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use courier_model::{MetaEvent, MetaEventKind};

use crate::error::{PluginError, ServiceError};
use crate::runtime::Runtime;
use crate::service::{Privilege, Service};

/// Plugin manifest, `plugin.json` in a plugin directory.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub author: String,
    pub version: String,
    pub usage: String,
}

impl PluginInfo {
    /// Read and validate the manifest from a plugin directory.
    pub fn from_dir(dir: impl AsRef<Path>, manifest_name: &str) -> Result<Self, PluginError> {
        let path = dir.as_ref().join(manifest_name);
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| PluginError::Manifest(format!("{}: {e}", path.display())))?;
        let info: PluginInfo = serde_json::from_str(&raw)?;
        if info.name.is_empty() {
            return Err(PluginError::Manifest("plugin name must not be empty".into()));
        }
        Ok(info)
    }
}

/// A unit of plugin code. `init` runs at load time and registers the
/// plugin's services through the handle it receives.
#[async_trait]
pub trait PluginModule: Send + Sync {
    fn info(&self) -> PluginInfo;

    async fn init(&self, plugin: &Arc<Plugin>) -> Result<(), PluginError>;
}

/// A loaded plugin: manifest data plus the ordered services it owns.
pub struct Plugin {
    info: PluginInfo,
    path: Option<PathBuf>,
    runtime: Runtime,
    services: Mutex<Vec<Arc<Service>>>,
}

impl Plugin {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn services(&self) -> Vec<Arc<Service>> {
        self.services.lock().clone()
    }

    pub fn get_service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.lock().iter().find(|s| s.name() == name).cloned()
    }

    /// Begin building a service owned by this plugin.
    pub fn service(self: &Arc<Self>, name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            plugin: self.clone(),
            name: name.into(),
            use_priv: Privilege::DEFAULT,
            manage_priv: Privilege::ADMIN,
            enable_on_default: true,
            visible: true,
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.info.name)
            .field("version", &self.info.version)
            .field("services", &self.services.lock().len())
            .finish()
    }
}

/// Builder for a [`Service`]; finished by [`ServiceBuilder::register`].
pub struct ServiceBuilder {
    plugin: Arc<Plugin>,
    name: String,
    use_priv: i32,
    manage_priv: i32,
    enable_on_default: bool,
    visible: bool,
}

impl ServiceBuilder {
    pub fn use_priv(mut self, priv_: i32) -> Self {
        self.use_priv = priv_;
        self
    }

    pub fn manage_priv(mut self, priv_: i32) -> Self {
        self.manage_priv = priv_;
        self
    }

    pub fn enable_on_default(mut self, enable: bool) -> Self {
        self.enable_on_default = enable;
        self
    }

    pub fn visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    /// Create the service, attach it to the plugin and the runtime
    /// registry. Its persisted config, when present, overrides the
    /// builder arguments.
    pub fn register(self) -> Result<Arc<Service>, ServiceError> {
        let runtime = self.plugin.runtime.clone();
        let service = Service::build(
            runtime.clone(),
            self.plugin.name().to_string(),
            self.name,
            self.use_priv,
            self.manage_priv,
            self.enable_on_default,
            self.visible,
        )?;
        runtime.register_service(service.clone())?;
        self.plugin.services.lock().push(service.clone());
        tracing::info!(service = %service.key(), "service registered");
        Ok(service)
    }
}

impl Runtime {
    /// Load a plugin module: create its record, run `init`, and dispatch
    /// the `ServiceLoaded`/`PluginLoaded` meta events.
    pub async fn load_plugin(
        &self,
        module: Arc<dyn PluginModule>,
    ) -> Result<Arc<Plugin>, PluginError> {
        self.load_plugin_inner(module.info(), None, module).await
    }

    /// Load a plugin whose manifest lives in `dir`; the manifest file
    /// takes precedence over the module's built-in info.
    pub async fn load_plugin_from_dir(
        &self,
        dir: impl AsRef<Path>,
        module: Arc<dyn PluginModule>,
    ) -> Result<Arc<Plugin>, PluginError> {
        let info = PluginInfo::from_dir(&dir, self.plugin_manifest_name())?;
        self.load_plugin_inner(info, Some(dir.as_ref().to_path_buf()), module).await
    }

    async fn load_plugin_inner(
        &self,
        info: PluginInfo,
        path: Option<PathBuf>,
        module: Arc<dyn PluginModule>,
    ) -> Result<Arc<Plugin>, PluginError> {
        let name = info.name.clone();
        tracing::info!(plugin = %name, "loading plugin");

        let plugin = Arc::new(Plugin {
            info,
            path,
            runtime: self.clone(),
            services: Mutex::new(Vec::new()),
        });
        self.insert_plugin(plugin.clone())?;

        if let Err(error) = module.init(&plugin).await {
            tracing::error!(plugin = %name, %error, "plugin init failed, rolling back");
            let _ = self.unload_plugin(&name).await;
            return Err(error);
        }

        for service in plugin.services() {
            self.dispatch_meta(MetaEvent::service(MetaEventKind::ServiceLoaded, service.key()))
                .await;
        }
        self.dispatch_meta(MetaEvent::plugin(MetaEventKind::PluginLoaded, name.clone())).await;

        tracing::info!(plugin = %name, "plugin loaded");
        Ok(plugin)
    }

    /// Unload a plugin: dispatch the unload meta events (running handler
    /// cleanup), unsubscribe every terminal its services contributed, and
    /// drop all registry entries.
    pub async fn unload_plugin(&self, name: &str) -> Result<(), PluginError> {
        let Some(plugin) = self.get_plugin(name) else {
            return Err(PluginError::NotLoaded(name.to_string()));
        };

        self.dispatch_meta(MetaEvent::plugin(MetaEventKind::PluginUnload, name)).await;

        for service in plugin.services() {
            self.dispatch_meta(MetaEvent::service(MetaEventKind::ServiceUnload, service.key()))
                .await;
            // The service's own unload hook normally unsubscribes its
            // terminals; sweep up whatever is left.
            self.engine().unsubscribe_terminals(&service.terminals());
            self.remove_service(&service.key());
        }

        self.remove_plugin(name);
        tracing::info!(plugin = %name, "plugin unloaded");
        Ok(())
    }

    /// Reload: unload, then load the given module again.
    pub async fn reload_plugin(
        &self,
        module: Arc<dyn PluginModule>,
    ) -> Result<Arc<Plugin>, PluginError> {
        let name = module.info().name;
        self.unload_plugin(&name).await?;
        self.load_plugin(module).await
    }
}
