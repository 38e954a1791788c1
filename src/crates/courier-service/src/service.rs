//! Services - managed bundles of handlers
//!
//! A [`Service`] groups the terminals one feature contributes, gates them
//! behind a privilege check and per-group enablement, persists its
//! configuration as JSON, and owns a private job scheduler. Services
//! belong to a [`Plugin`](crate::plugin::Plugin) and are torn down
//! atomically when it unloads: the service's own unload hook unsubscribes
//! every terminal it ever registered.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use courier_model::{
    Api, ContactId, Event, GroupPermission, HandlerResult, MessageChain, MetaEventKind,
};
use courier_router::{message, Graph, HandlerContext, Key, KeyFn, Priority, Terminal, TerminalId};

use crate::error::ServiceError;
use crate::runtime::Runtime;
use crate::schedule::{Schedule, Scheduler};

/// The privilege of a user described as an `int` ladder. `0` is the
/// default; `BLACK` marks blacklisted users and dominates everything.
pub struct Privilege;

impl Privilege {
    pub const EVERYBODY: i32 = -1000;
    pub const BLACK: i32 = -999;
    pub const DEFAULT: i32 = 0;
    pub const PRIVATE: i32 = 20;
    pub const GROUP: i32 = 20;
    pub const PRIVATE_OTHER: i32 = 30;
    pub const PRIVATE_DISCUSS: i32 = 40;
    pub const PRIVATE_GROUP: i32 = 50;
    pub const PRIVATE_FRIEND: i32 = 60;
    pub const ADMIN: i32 = 100;
    pub const OWNER: i32 = 150;
    pub const WHITE: i32 = 200;
    pub const SUPERUSER: i32 = 990;
    pub const NOBODY: i32 = 1000;
}

/// Required privilege for a subscription: a ladder floor or an arbitrary
/// predicate over the computed user privilege.
#[derive(Clone)]
pub enum PrivRequirement {
    AtLeast(i32),
    Custom(Arc<dyn Fn(i32) -> bool + Send + Sync>),
}

impl PrivRequirement {
    fn check(&self, user_priv: i32) -> bool {
        match self {
            PrivRequirement::AtLeast(min) => user_priv >= *min,
            PrivRequirement::Custom(f) => f(user_priv),
        }
    }
}

impl From<i32> for PrivRequirement {
    fn from(min: i32) -> Self {
        PrivRequirement::AtLeast(min)
    }
}

/// Persisted service configuration, one JSON file per service at
/// `<config-dir>/{plugin}.{service}.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub use_priv: i32,
    pub manage_priv: i32,
    pub enable_on_default: bool,
    pub visible: bool,
    pub enable_group: Vec<ContactId>,
    pub disable_group: Vec<ContactId>,
    pub user_privs: Vec<(ContactId, i32)>,
}

struct ServiceState {
    use_priv: i32,
    manage_priv: i32,
    enable_on_default: bool,
    visible: bool,
    enable_group: HashSet<ContactId>,
    disable_group: HashSet<ContactId>,
    user_privs: HashMap<ContactId, i32>,
}

/// A namespaced bundle of terminals with per-group enablement and
/// per-user privileges.
pub struct Service {
    name: String,
    plugin: String,
    runtime: Runtime,
    state: Mutex<ServiceState>,
    scheduler: Scheduler,
    terminals: Mutex<HashSet<TerminalId>>,
}

impl Service {
    pub(crate) fn build(
        runtime: Runtime,
        plugin: String,
        name: String,
        use_priv: i32,
        manage_priv: i32,
        enable_on_default: bool,
        visible: bool,
    ) -> Result<Arc<Service>, ServiceError> {
        if name.is_empty() || name.contains(['\\', '/', ':', '*', '?', '"', '<', '>', '|', '.']) {
            return Err(ServiceError::InvalidName(name));
        }

        let service = Arc::new(Service {
            state: Mutex::new(ServiceState {
                use_priv,
                manage_priv,
                enable_on_default,
                visible,
                enable_group: HashSet::new(),
                disable_group: HashSet::new(),
                user_privs: HashMap::new(),
            }),
            name,
            plugin,
            runtime,
            scheduler: Scheduler::new(),
            terminals: Mutex::new(HashSet::new()),
        });

        // Persisted configuration wins over construction arguments.
        match service.load_config() {
            Ok(Some(config)) => service.apply_config(config),
            Ok(None) => {}
            Err(error) => {
                tracing::error!(service = %service.key(), %error, "failed to read service config")
            }
        }

        {
            let sv = service.clone();
            service.on_loaded().handle(move |_ctx| {
                let sv = sv.clone();
                async move {
                    if sv.scheduler.job_count() > 0 && !sv.scheduler.is_running() {
                        sv.scheduler.start();
                        tracing::debug!(service = %sv.key(), "scheduler started");
                    }
                    Ok(serde_json::Value::Null)
                }
            });
        }
        {
            let sv = service.clone();
            service.on_unload().handle(move |ctx| {
                let sv = sv.clone();
                async move {
                    let terminals: Vec<TerminalId> = sv.terminals.lock().iter().copied().collect();
                    tracing::info!(
                        service = %sv.key(),
                        subscribers = terminals.len(),
                        "unloading service, unsubscribing all handlers"
                    );
                    ctx.engine().unsubscribe_terminals(&terminals);
                    sv.scheduler.stop();
                    Ok(serde_json::Value::Null)
                }
            });
        }

        Ok(service)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin
    }

    /// `{plugin}.{service}`, the namespace used for config files and
    /// lifecycle meta events.
    pub fn key(&self) -> String {
        format!("{}.{}", self.plugin, self.name)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn visible(&self) -> bool {
        self.state.lock().visible
    }

    pub fn use_priv(&self) -> i32 {
        self.state.lock().use_priv
    }

    pub fn manage_priv(&self) -> i32 {
        self.state.lock().manage_priv
    }

    /// Terminals this service has subscribed.
    pub fn terminals(&self) -> Vec<TerminalId> {
        self.terminals.lock().iter().copied().collect()
    }

    // --- subscriptions -------------------------------------------------

    /// Subscribe handlers behind this service's privilege gate.
    pub fn on(self: &Arc<Self>, graph: Graph) -> ServiceSubscription {
        ServiceSubscription { service: self.clone(), graph, required: None }
    }

    /// Subscribe message handlers: sequences the graph behind
    /// `is_message()`.
    pub fn on_message(self: &Arc<Self>, graph: Graph) -> ServiceSubscription {
        self.on(message::is_message() & graph)
    }

    /// This service's `ServiceLoaded` lifecycle event.
    pub fn on_loaded(self: &Arc<Self>) -> ServiceSubscription {
        ServiceSubscription {
            service: self.clone(),
            graph: message::meta_kind_is(MetaEventKind::ServiceLoaded)
                & message::service_is(self.key()),
            required: None,
        }
    }

    /// This service's `ServiceUnload` lifecycle event.
    pub fn on_unload(self: &Arc<Self>) -> ServiceSubscription {
        ServiceSubscription {
            service: self.clone(),
            graph: message::meta_kind_is(MetaEventKind::ServiceUnload)
                & message::service_is(self.key()),
            required: None,
        }
    }

    /// Register a named scheduled job with the service's scheduler. The
    /// scheduler starts once the service finishes loading.
    pub fn scheduled_job<F, Fut>(&self, name: impl Into<String>, schedule: Schedule, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.scheduler.add_job(name, schedule, f);
    }

    pub(crate) fn record_terminal(&self, terminal: TerminalId) {
        self.terminals.lock().insert(terminal);
    }

    // --- privileges ----------------------------------------------------

    /// Role-derived privilege of the event's sender. Superusers always
    /// rank `SUPERUSER`; blacklisted users always rank `BLACK`.
    pub fn priv_from_event(&self, event: &Event) -> i32 {
        let Some(sender) = event.sender() else {
            return Privilege::DEFAULT;
        };
        if self.runtime.is_superuser(sender.qq) {
            return Privilege::SUPERUSER;
        }
        if self.runtime.check_block_user(sender.qq) {
            return Privilege::BLACK;
        }
        match event {
            Event::GroupMessage(_) => match sender.permission {
                GroupPermission::Owner => Privilege::OWNER,
                GroupPermission::Admin => Privilege::ADMIN,
                _ => Privilege::GROUP,
            },
            Event::FriendMessage(_) => Privilege::PRIVATE_FRIEND,
            Event::TempMessage(_) => Privilege::PRIVATE_GROUP,
            _ => Privilege::DEFAULT,
        }
    }

    /// Per-service configured privilege of a user.
    pub fn user_priv(&self, qq: ContactId) -> i32 {
        if self.runtime.is_superuser(qq) {
            return Privilege::SUPERUSER;
        }
        self.state.lock().user_privs.get(&qq).copied().unwrap_or(Privilege::DEFAULT)
    }

    /// Effective privilege for an event: the maximum of the configured
    /// and role-derived privileges, except `BLACK` dominates.
    pub fn event_priv(&self, event: &Event) -> i32 {
        let Some(sender) = event.sender() else {
            return Privilege::DEFAULT;
        };
        if self.runtime.is_superuser(sender.qq) {
            return Privilege::SUPERUSER;
        }
        let role_priv = self.priv_from_event(event);
        let configured = self.user_priv(sender.qq);
        if role_priv == Privilege::BLACK || configured == Privilege::BLACK {
            Privilege::BLACK
        } else {
            role_priv.max(configured)
        }
    }

    pub fn set_user_priv(&self, qq: ContactId, priv_: i32) {
        self.state.lock().user_privs.insert(qq, priv_);
        self.save_config();
    }

    /// Effective privilege inside a group, consulting the live member
    /// role through the Api.
    pub async fn user_priv_in_group(
        &self,
        qq: ContactId,
        group: ContactId,
        api: &dyn Api,
    ) -> i32 {
        let configured = self.user_priv(qq);
        if configured == Privilege::BLACK {
            return configured;
        }
        let info = api.get_group_member_info(group, qq).await;
        match info.into_data() {
            Some(member) => {
                let role = match member.permission {
                    GroupPermission::Owner => Privilege::OWNER,
                    GroupPermission::Admin => Privilege::ADMIN,
                    _ => Privilege::GROUP,
                };
                configured.max(role)
            }
            None => configured,
        }
    }

    /// Whether the event passes the service gate: message events need the
    /// group enabled (for group-scoped messages) and the user privilege
    /// over the requirement; other events always pass.
    pub fn check_priv(&self, event: &Event, required: Option<&PrivRequirement>) -> bool {
        if !event.is_message() {
            return true;
        }
        if let Some(group) = event.group() {
            if !self.check_enabled(group) {
                return false;
            }
        }
        let fallback = PrivRequirement::AtLeast(self.use_priv());
        let required = required.unwrap_or(&fallback);
        required.check(self.event_priv(event))
    }

    // --- enablement ----------------------------------------------------

    pub fn set_enable(&self, group: ContactId) {
        {
            let mut state = self.state.lock();
            state.enable_group.insert(group);
            state.disable_group.remove(&group);
        }
        self.save_config();
        tracing::info!(service = %self.key(), group, "service enabled");
    }

    pub fn set_disable(&self, group: ContactId) {
        {
            let mut state = self.state.lock();
            state.enable_group.remove(&group);
            state.disable_group.insert(group);
        }
        self.save_config();
        tracing::info!(service = %self.key(), group, "service disabled");
    }

    pub fn check_enabled(&self, group: ContactId) -> bool {
        let state = self.state.lock();
        state.enable_group.contains(&group)
            || (state.enable_on_default && !state.disable_group.contains(&group))
    }

    /// Groups the service is enabled in, per registered session.
    pub async fn enabled_groups(&self) -> HashMap<ContactId, ContactId> {
        let mut enabled = HashMap::new();
        for (qq, session) in self.runtime.sessions() {
            let groups = session.api().get_group_list().await;
            if let Some(groups) = groups.into_data() {
                for group in groups {
                    if self.check_enabled(group.id) {
                        enabled.insert(group.id, qq);
                    }
                }
            }
        }
        enabled
    }

    /// Fan a set of messages out to every enabled group, throttled.
    pub async fn broadcast(&self, messages: &[MessageChain], interval: std::time::Duration) {
        let groups = self.enabled_groups().await;
        for (group, qq) in groups {
            let Some(session) = self.runtime.get_session(qq) else {
                continue;
            };
            let mut delivered = 0usize;
            for message in messages {
                let result = session.api().send_group_message(group, message.clone()).await;
                if result.is_ok() {
                    delivered += 1;
                } else {
                    tracing::error!(
                        service = %self.key(),
                        group,
                        code = result.code(),
                        "broadcast delivery failed"
                    );
                }
                tokio::time::sleep(interval).await;
            }
            if delivered > 0 {
                tracing::info!(service = %self.key(), group, delivered, "broadcast delivered");
            }
        }
    }

    // --- configuration -------------------------------------------------

    fn config_path(&self) -> PathBuf {
        self.runtime.service_config_dir().join(format!("{}.json", self.key()))
    }

    pub fn snapshot_config(&self) -> ServiceConfig {
        let state = self.state.lock();
        let mut enable_group: Vec<_> = state.enable_group.iter().copied().collect();
        let mut disable_group: Vec<_> = state.disable_group.iter().copied().collect();
        let mut user_privs: Vec<_> = state.user_privs.iter().map(|(k, v)| (*k, *v)).collect();
        enable_group.sort_unstable();
        disable_group.sort_unstable();
        user_privs.sort_unstable();
        ServiceConfig {
            name: self.name.clone(),
            use_priv: state.use_priv,
            manage_priv: state.manage_priv,
            enable_on_default: state.enable_on_default,
            visible: state.visible,
            enable_group,
            disable_group,
            user_privs,
        }
    }

    fn apply_config(&self, config: ServiceConfig) {
        let mut state = self.state.lock();
        state.use_priv = config.use_priv;
        state.manage_priv = config.manage_priv;
        state.enable_on_default = config.enable_on_default;
        state.visible = config.visible;
        state.enable_group = config.enable_group.into_iter().collect();
        state.disable_group = config.disable_group.into_iter().collect();
        state.user_privs = config.user_privs.into_iter().collect();
    }

    fn load_config(&self) -> Result<Option<ServiceConfig>, ServiceError> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Atomic persistence: write a sibling temp file, then rename over
    /// the config.
    fn save_config(&self) {
        let path = self.config_path();
        let config = self.snapshot_config();
        let result = (|| -> Result<(), ServiceError> {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_string_pretty(&config)?)?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        })();
        if let Err(error) = result {
            tracing::error!(service = %self.key(), %error, "failed to persist service config");
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("key", &self.key())
            .field("terminals", &self.terminals.lock().len())
            .finish()
    }
}

/// Subscription builder returned by [`Service::on`]: closes the graph
/// onto a handler behind the service's privilege predicate and records
/// the terminal for unload.
pub struct ServiceSubscription {
    service: Arc<Service>,
    graph: Graph,
    required: Option<PrivRequirement>,
}

impl ServiceSubscription {
    /// Override the required privilege for this handler.
    pub fn with_priv(mut self, required: impl Into<PrivRequirement>) -> Self {
        self.required = Some(required.into());
        self
    }

    pub fn handle<F, Fut>(self, f: F) -> Arc<Terminal>
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.handle_with_priority(Priority::DEFAULT, f)
    }

    pub fn handle_with_priority<F, Fut>(self, priority: i32, f: F) -> Arc<Terminal>
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let service = self.service.clone();
        let required = self.required.clone();
        let gate = KeyFn::new(move |args: courier_router::RouteArgs| {
            let service = service.clone();
            let required = required.clone();
            async move { Ok(Key::Bool(service.check_priv(&args.event, required.as_ref()))) }
        });
        // The gate predicate sits after the user graph, so it only runs
        // for events the subscription already matches.
        let graph = self.graph & courier_router::combinators::when(gate);

        let terminal = self
            .service
            .runtime
            .engine()
            .on(graph)
            .handle_with_priority(priority, f);
        self.service.record_terminal(terminal.id());
        terminal
    }
}
