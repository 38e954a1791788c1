//! Runtime - the owned top level of a courier deployment
//!
//! The runtime ties the engine to the outside world: it keeps the session
//! registry (one per logged-in bot account), the service and plugin
//! registries, the shared blacklists, and the event entry point
//! [`Runtime::handle_event`] that protocol adapters push typed events
//! through. Everything is owned - there is no process-global state, and
//! several runtimes can coexist in one process.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;

use courier_model::{BotSession, ContactId, Event, HandlerError, MetaEvent};
use courier_router::{Engine, ForwardItem};

use crate::error::ServiceError;
use crate::plugin::Plugin;
use crate::service::Service;

/// Static configuration of a runtime.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Accounts that always rank `Privilege::SUPERUSER`.
    pub superusers: HashSet<ContactId>,
    /// Directory holding per-service JSON config files.
    pub service_config_dir: PathBuf,
    /// File name of the plugin manifest inside a plugin directory.
    pub plugin_manifest: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            superusers: HashSet::new(),
            service_config_dir: PathBuf::from("./service_config"),
            plugin_manifest: "plugin.json".to_string(),
        }
    }
}

struct RuntimeShared {
    engine: Engine,
    config: RuntimeConfig,
    sessions: Mutex<HashMap<ContactId, Arc<dyn BotSession>>>,
    services: Mutex<HashMap<String, Arc<Service>>>,
    plugins: Mutex<HashMap<String, Arc<Plugin>>>,
    block_groups: Mutex<HashMap<ContactId, DateTime<Utc>>>,
    block_users: Mutex<HashMap<ContactId, DateTime<Utc>>>,
}

/// Cloneable handle to one courier deployment.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<RuntimeShared>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Runtime {
            shared: Arc::new(RuntimeShared {
                engine: Engine::new(),
                config,
                sessions: Mutex::new(HashMap::new()),
                services: Mutex::new(HashMap::new()),
                plugins: Mutex::new(HashMap::new()),
                block_groups: Mutex::new(HashMap::new()),
                block_users: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.shared.engine
    }

    pub fn service_config_dir(&self) -> &Path {
        &self.shared.config.service_config_dir
    }

    pub(crate) fn plugin_manifest_name(&self) -> &str {
        &self.shared.config.plugin_manifest
    }

    pub fn is_superuser(&self, qq: ContactId) -> bool {
        self.shared.config.superusers.contains(&qq)
    }

    // --- event entry point ---------------------------------------------

    /// Handle one event from a protocol adapter, collecting every
    /// dispatch result. A handler returning
    /// [`HandlerError::Switched`] restarts dispatch with the rewritten
    /// message; [`HandlerError::Canceled`] aborts the event silently.
    pub async fn handle_event(
        &self,
        session: Option<Arc<dyn BotSession>>,
        event: Event,
    ) -> Vec<ForwardItem> {
        let mut event = event;
        let mut collected = Vec::new();
        loop {
            let mut switched = None;
            {
                let stream = self.shared.engine.forward(event.clone(), session.clone());
                pin_mut!(stream);
                while let Some(item) = stream.next().await {
                    match &item {
                        ForwardItem::Route(error) => {
                            tracing::warn!(%error, "route error");
                        }
                        ForwardItem::Task(result) => match &result.result {
                            Err(HandlerError::Switched { message }) => {
                                if let Some(next) = event.with_message(message.clone()) {
                                    switched = Some(next);
                                    break;
                                }
                                tracing::warn!("switched dispatch on a non-message event ignored");
                            }
                            Err(HandlerError::Canceled { reason }) => {
                                tracing::debug!(%reason, "event handling canceled");
                                return collected;
                            }
                            Err(HandlerError::Finished { success }) => {
                                tracing::debug!(
                                    terminal = result.terminal,
                                    success = *success,
                                    "handler chain finished"
                                );
                            }
                            Err(error) => {
                                tracing::error!(
                                    terminal = result.terminal,
                                    %error,
                                    "handler failed"
                                );
                            }
                            Ok(_) => {}
                        },
                    }
                    collected.push(item);
                }
            }
            match switched {
                Some(next) => {
                    tracing::debug!("dispatch switched to rewritten message");
                    event = next;
                }
                None => return collected,
            }
        }
    }

    /// Dispatch a lifecycle meta event through the engine.
    pub async fn dispatch_meta(&self, meta: MetaEvent) {
        self.handle_event(None, Event::Meta(meta)).await;
    }

    // --- sessions ------------------------------------------------------

    pub fn register_session(&self, session: Arc<dyn BotSession>) {
        let qq = session.qq();
        let mut sessions = self.shared.sessions.lock();
        if sessions.contains_key(&qq) {
            tracing::warn!(qq, "a session is already registered for this account");
        }
        sessions.insert(qq, session);
    }

    pub fn unregister_session(&self, qq: ContactId) -> bool {
        self.shared.sessions.lock().remove(&qq).is_some()
    }

    pub fn get_session(&self, qq: ContactId) -> Option<Arc<dyn BotSession>> {
        self.shared.sessions.lock().get(&qq).cloned()
    }

    pub fn sessions(&self) -> Vec<(ContactId, Arc<dyn BotSession>)> {
        self.shared.sessions.lock().iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    // --- service & plugin registries -----------------------------------

    pub(crate) fn register_service(&self, service: Arc<Service>) -> Result<(), ServiceError> {
        let mut services = self.shared.services.lock();
        let key = service.key();
        if services.contains_key(&key) {
            return Err(ServiceError::AlreadyExists(key));
        }
        services.insert(key, service);
        Ok(())
    }

    pub(crate) fn remove_service(&self, key: &str) -> bool {
        self.shared.services.lock().remove(key).is_some()
    }

    pub fn get_service(&self, key: &str) -> Option<Arc<Service>> {
        self.shared.services.lock().get(key).cloned()
    }

    pub fn services(&self) -> Vec<Arc<Service>> {
        self.shared.services.lock().values().cloned().collect()
    }

    pub(crate) fn insert_plugin(&self, plugin: Arc<Plugin>) -> Result<(), crate::error::PluginError> {
        let mut plugins = self.shared.plugins.lock();
        let name = plugin.name().to_string();
        if plugins.contains_key(&name) {
            return Err(crate::error::PluginError::AlreadyLoaded(name));
        }
        plugins.insert(name, plugin);
        Ok(())
    }

    pub(crate) fn remove_plugin(&self, name: &str) -> bool {
        self.shared.plugins.lock().remove(name).is_some()
    }

    pub fn get_plugin(&self, name: &str) -> Option<Arc<Plugin>> {
        self.shared.plugins.lock().get(name).cloned()
    }

    pub fn plugins(&self) -> Vec<Arc<Plugin>> {
        self.shared.plugins.lock().values().cloned().collect()
    }

    // --- blacklists ----------------------------------------------------

    /// Blacklist a group until the given instant.
    pub fn set_block_group(&self, group: ContactId, until: DateTime<Utc>) {
        self.shared.block_groups.lock().insert(group, until);
    }

    /// Blacklist a user until the given instant. Superusers cannot be
    /// blacklisted.
    pub fn set_block_user(&self, qq: ContactId, until: DateTime<Utc>) {
        if self.is_superuser(qq) {
            return;
        }
        self.shared.block_users.lock().insert(qq, until);
    }

    pub fn check_block_group(&self, group: ContactId) -> bool {
        check_block(&self.shared.block_groups, group)
    }

    pub fn check_block_user(&self, qq: ContactId) -> bool {
        check_block(&self.shared.block_users, qq)
    }
}

fn check_block(map: &Mutex<HashMap<ContactId, DateTime<Utc>>>, id: ContactId) -> bool {
    let mut map = map.lock();
    match map.get(&id) {
        Some(until) if *until <= Utc::now() => {
            map.remove(&id);
            false
        }
        Some(_) => true,
        None => false,
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("sessions", &self.shared.sessions.lock().len())
            .field("services", &self.shared.services.lock().len())
            .field("plugins", &self.shared.plugins.lock().len())
            .finish()
    }
}
