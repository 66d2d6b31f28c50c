use std::collections::{
    BTreeMap,
    HashMap,
    HashSet,
};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{
    error,
    info,
    warn,
};

use kubeportal_commons::{
    ConfigStore,
    ForwardDefinition,
};
use kubeportal_portforward::{
    ForwardError,
    Forwarder,
    KubeCache,
};

#[derive(Debug)]
pub enum ManagerError {
    Validation(String),
    NotFound(String),
    GroupNotFound(String),
    NotRunning(String),
    Forward(ForwardError),
    Config(String),
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerError::Validation(msg) => write!(f, "{msg}"),
            ManagerError::NotFound(name) => write!(f, "forward '{name}' not found"),
            ManagerError::GroupNotFound(group) => write!(f, "group '{group}' not found"),
            ManagerError::NotRunning(name) => write!(f, "forward '{name}' is not running"),
            ManagerError::Forward(err) => write!(f, "{err}"),
            ManagerError::Config(msg) => write!(f, "{msg}"),
        }
    }
}

impl Error for ManagerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ManagerError::Forward(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ForwardError> for ManagerError {
    fn from(err: ForwardError) -> Self {
        ManagerError::Forward(err)
    }
}

/// A definition projected together with its live runtime state.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStatus {
    #[serde(flatten)]
    pub definition: ForwardDefinition,
    pub active: bool,
    pub bytes_transferred: u64,
    pub connection_count: usize,
    pub start_time: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStatus {
    pub name: String,
    pub enabled: bool,
    pub total_forward_count: usize,
    pub active_forward_count: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ApplyOutcome {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// The authoritative registry of forward definitions and owner of their
/// runtime lifecycles.
///
/// Mutating operations are serialized through one coarse lock; the two
/// maps themselves are concurrent so status projections never wait
/// behind a slow start or stop.
pub struct ForwardManager {
    store: ConfigStore,
    kube_cache: Arc<KubeCache>,
    op_lock: Mutex<()>,
    definitions: DashMap<String, ForwardDefinition>,
    forwarders: DashMap<String, Arc<Forwarder>>,
    cancel: CancellationToken,
    watch_suppress: Arc<AtomicBool>,
}

impl ForwardManager {
    pub fn new(store: ConfigStore, kube_cache: Arc<KubeCache>, cancel: CancellationToken) -> Self {
        Self {
            store,
            kube_cache,
            op_lock: Mutex::new(()),
            definitions: DashMap::new(),
            forwarders: DashMap::new(),
            cancel,
            watch_suppress: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag the config watcher consults to skip events caused by
    /// the manager's own saves.
    pub fn watch_suppress(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.watch_suppress)
    }

    /// Loads the config file (if present) and starts every enabled
    /// forward. Per-forward start failures leave the definition present
    /// but disabled.
    pub async fn initialize(&self) {
        let _guard = self.op_lock.lock().await;

        let loaded = match self.store.load().await {
            Ok(definitions) => definitions,
            Err(e) => {
                error!(error = %e, "failed to load configuration, starting with empty registry");
                HashMap::new()
            }
        };

        self.definitions.clear();
        for (name, definition) in loaded {
            self.definitions.insert(name, definition);
        }
        info!(forwards = self.definitions.len(), "configuration loaded");

        self.start_enabled().await;
        self.persist().await;
    }

    pub fn get_all(&self) -> Vec<ForwardDefinition> {
        let mut all: Vec<ForwardDefinition> = self
            .definitions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn get_by_name(&self, name: &str) -> Option<ForwardDefinition> {
        self.definitions.get(name).map(|entry| entry.value().clone())
    }

    /// `(active forwarders, total definitions)`.
    pub fn counts(&self) -> (usize, usize) {
        (self.forwarders.len(), self.definitions.len())
    }

    /// Validates, stores and persists the definition, then reconciles
    /// the running forwarder. Only a routing-parameter change restarts a
    /// running forwarder; an `enabled` or `group` flip leaves it (and
    /// its open connections) alone.
    pub async fn add_or_update(&self, definition: ForwardDefinition) -> Result<(), ManagerError> {
        definition
            .validate()
            .map_err(|e| ManagerError::Validation(e.to_string()))?;

        let _guard = self.op_lock.lock().await;
        let name = definition.name().to_string();
        let prev = self.definitions.insert(name.clone(), definition.clone());
        self.persist().await;

        let result = self.reconcile(&name, prev.as_ref(), &definition).await;
        if let Err(ManagerError::Forward(ForwardError::AddressInUse(_))) = &result {
            // The reconcile step flipped the definition to disabled.
            self.persist().await;
        }
        result
    }

    pub async fn delete(&self, name: &str) -> Result<(), ManagerError> {
        let _guard = self.op_lock.lock().await;

        if !self.definitions.contains_key(name) {
            return Err(ManagerError::NotFound(name.to_string()));
        }
        if let Some((_, forwarder)) = self.forwarders.remove(name) {
            forwarder.stop().await;
        }
        self.definitions.remove(name);
        self.persist().await;
        info!(forward = %name, "forward deleted");
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<(), ManagerError> {
        let _guard = self.op_lock.lock().await;

        let definition = {
            let Some(mut entry) = self.definitions.get_mut(name) else {
                return Err(ManagerError::NotFound(name.to_string()));
            };
            entry.set_enabled(true);
            entry.value().clone()
        };
        self.persist().await;

        if !self.forwarders.contains_key(name) {
            match self.spawn_forwarder(&definition).await {
                Ok(forwarder) => {
                    self.forwarders.insert(name.to_string(), forwarder);
                }
                Err(ForwardError::AddressInUse(port)) => {
                    warn!(forward = %name, port, "local port already in use, disabling forward");
                    if let Some(mut entry) = self.definitions.get_mut(name) {
                        entry.set_enabled(false);
                    }
                    self.persist().await;
                    return Err(ManagerError::Forward(ForwardError::AddressInUse(port)));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<(), ManagerError> {
        let _guard = self.op_lock.lock().await;

        if !self.definitions.contains_key(name) {
            return Err(ManagerError::NotFound(name.to_string()));
        }
        let Some((_, forwarder)) = self.forwarders.remove(name) else {
            return Err(ManagerError::NotRunning(name.to_string()));
        };
        forwarder.stop().await;

        if let Some(mut entry) = self.definitions.get_mut(name) {
            entry.set_enabled(false);
        }
        self.persist().await;
        Ok(())
    }

    /// Enables and starts every member of the group. Per-member start
    /// failures are logged and swallowed; the operation succeeds for any
    /// non-empty group.
    pub async fn enable_group(&self, group: &str) -> Result<(), ManagerError> {
        let _guard = self.op_lock.lock().await;

        let members = self.group_members(group);
        if members.is_empty() {
            return Err(ManagerError::GroupNotFound(group.to_string()));
        }

        for name in members {
            if let Some(mut entry) = self.definitions.get_mut(&name) {
                entry.set_enabled(true);
            }
            if self.forwarders.contains_key(&name) {
                continue;
            }
            let Some(definition) = self.definitions.get(&name).map(|e| e.value().clone()) else {
                continue;
            };
            match self.spawn_forwarder(&definition).await {
                Ok(forwarder) => {
                    self.forwarders.insert(name.clone(), forwarder);
                }
                Err(e) => {
                    warn!(forward = %name, error = %e, "failed to start forward during group enable");
                    if matches!(e, ForwardError::AddressInUse(_)) {
                        if let Some(mut entry) = self.definitions.get_mut(&name) {
                            entry.set_enabled(false);
                        }
                    }
                }
            }
        }

        self.persist().await;
        Ok(())
    }

    /// Stops and disables every member of the group. Group disable is an
    /// active stop, unlike an `enabled=false` upsert.
    pub async fn disable_group(&self, group: &str) -> Result<(), ManagerError> {
        let _guard = self.op_lock.lock().await;

        let members = self.group_members(group);
        if members.is_empty() {
            return Err(ManagerError::GroupNotFound(group.to_string()));
        }

        for name in members {
            if let Some((_, forwarder)) = self.forwarders.remove(&name) {
                forwarder.stop().await;
            }
            if let Some(mut entry) = self.definitions.get_mut(&name) {
                entry.set_enabled(false);
            }
        }

        self.persist().await;
        Ok(())
    }

    /// Deletes every member of the group; returns how many were removed.
    pub async fn delete_group(&self, group: &str) -> Result<usize, ManagerError> {
        let _guard = self.op_lock.lock().await;

        let members = self.group_members(group);
        for name in &members {
            if let Some((_, forwarder)) = self.forwarders.remove(name) {
                forwarder.stop().await;
            }
            self.definitions.remove(name);
        }

        if !members.is_empty() {
            self.persist().await;
        }
        Ok(members.len())
    }

    /// Merges a `{"forwards": {...}}` document into the registry.
    ///
    /// Each entry is upserted (with `group` forced to `target_group`
    /// when given); with `remove_missing`, definitions in the target
    /// scope that are absent from the document are deleted. Malformed
    /// entries are logged and skipped.
    pub async fn apply_config(
        &self, config_json: &str, target_group: Option<&str>, remove_missing: bool,
    ) -> Result<ApplyOutcome, ManagerError> {
        let document: Value = serde_json::from_str(config_json)
            .map_err(|e| ManagerError::Config(format!("config parse error: {e}")))?;
        let Some(entries) = document.get("forwards").and_then(Value::as_object) else {
            return Err(ManagerError::Config(
                "expected a top-level \"forwards\" object".to_string(),
            ));
        };

        let mut incoming = Vec::with_capacity(entries.len());
        for (name, value) in entries {
            match serde_json::from_value::<ForwardDefinition>(value.clone()) {
                Ok(mut definition) => {
                    definition.set_name(name.clone());
                    if let Some(group) = target_group {
                        definition.set_group(group);
                    }
                    match definition.validate() {
                        Ok(()) => incoming.push(definition),
                        Err(e) => {
                            warn!(forward = %name, error = %e, "skipping invalid forward entry")
                        }
                    }
                }
                Err(e) => warn!(forward = %name, error = %e, "skipping malformed forward entry"),
            }
        }

        let _guard = self.op_lock.lock().await;
        let mut outcome = ApplyOutcome::default();

        if remove_missing {
            let incoming_names: HashSet<&str> = incoming.iter().map(|d| d.name()).collect();
            let stale: Vec<String> = self
                .definitions
                .iter()
                .filter(|entry| {
                    target_group.map_or(true, |group| entry.value().group() == group)
                })
                .map(|entry| entry.key().clone())
                .filter(|name| !incoming_names.contains(name.as_str()))
                .collect();
            for name in stale {
                if let Some((_, forwarder)) = self.forwarders.remove(&name) {
                    forwarder.stop().await;
                }
                self.definitions.remove(&name);
                outcome.removed += 1;
            }
        }

        for definition in incoming {
            let name = definition.name().to_string();
            let prev = self.definitions.insert(name.clone(), definition.clone());
            if prev.is_some() {
                outcome.updated += 1;
            } else {
                outcome.added += 1;
            }
            if let Err(e) = self.reconcile(&name, prev.as_ref(), &definition).await {
                warn!(forward = %name, error = %e, "failed to reconcile forward during apply");
            }
        }

        self.persist().await;
        info!(
            added = outcome.added,
            updated = outcome.updated,
            removed = outcome.removed,
            "applied configuration"
        );
        Ok(outcome)
    }

    /// Serializes the registry in the config-file shape, filtered by
    /// enablement and group.
    pub async fn export_config(
        &self, include_disabled: bool, group_filter: Option<&str>,
    ) -> Result<String, ManagerError> {
        let filtered: BTreeMap<String, ForwardDefinition> = self
            .definitions
            .iter()
            .filter(|entry| include_disabled || entry.value().enabled())
            .filter(|entry| group_filter.map_or(true, |group| entry.value().group() == group))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let document = serde_json::json!({ "forwards": filtered });
        serde_json::to_string_pretty(&document).map_err(|e| ManagerError::Config(e.to_string()))
    }

    /// Stops everything, reloads definitions from disk and restarts the
    /// enabled ones.
    pub async fn reload_config(&self) {
        let _guard = self.op_lock.lock().await;
        info!("reloading configuration from disk");

        self.stop_all_unlocked().await;

        let loaded = match self.store.load().await {
            Ok(definitions) => definitions,
            Err(e) => {
                error!(error = %e, "failed to reload configuration, starting with empty registry");
                HashMap::new()
            }
        };
        self.definitions.clear();
        for (name, definition) in loaded {
            self.definitions.insert(name, definition);
        }

        self.start_enabled().await;
        self.persist().await;
    }

    pub async fn stop_all(&self) {
        let _guard = self.op_lock.lock().await;
        self.stop_all_unlocked().await;
    }

    /// Live snapshot of every definition with its runtime counters.
    pub fn statuses(&self, group_filter: Option<&str>) -> Vec<ForwardStatus> {
        let mut list: Vec<ForwardStatus> = self
            .definitions
            .iter()
            .filter(|entry| group_filter.map_or(true, |group| entry.value().group() == group))
            .map(|entry| self.status_of(entry.value()))
            .collect();
        list.sort_by(|a, b| a.definition.name().cmp(b.definition.name()));
        list
    }

    pub fn get_status(&self, name: &str) -> Option<ForwardStatus> {
        self.definitions
            .get(name)
            .map(|entry| self.status_of(entry.value()))
    }

    /// Snapshot of the currently active forwarders only.
    pub fn get_active(&self) -> Vec<ForwardStatus> {
        let names: Vec<String> = self
            .forwarders
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut list: Vec<ForwardStatus> = names
            .iter()
            .filter_map(|name| self.get_status(name))
            .collect();
        list.sort_by(|a, b| a.definition.name().cmp(b.definition.name()));
        list
    }

    /// Derived group view: a group is enabled iff any member is enabled.
    pub fn get_group_statuses(&self) -> Vec<GroupStatus> {
        let mut groups: BTreeMap<String, GroupStatus> = BTreeMap::new();
        for entry in self.definitions.iter() {
            let definition = entry.value();
            let status = groups
                .entry(definition.group().to_string())
                .or_insert_with(|| GroupStatus {
                    name: definition.group().to_string(),
                    enabled: false,
                    total_forward_count: 0,
                    active_forward_count: 0,
                });
            status.total_forward_count += 1;
            if definition.enabled() {
                status.enabled = true;
            }
            if self.forwarders.contains_key(definition.name()) {
                status.active_forward_count += 1;
            }
        }
        groups.into_values().collect()
    }

    fn status_of(&self, definition: &ForwardDefinition) -> ForwardStatus {
        match self.forwarders.get(definition.name()) {
            Some(forwarder) => ForwardStatus {
                definition: definition.clone(),
                active: forwarder.is_active(),
                bytes_transferred: forwarder.bytes_transferred(),
                connection_count: forwarder.connection_count(),
                start_time: forwarder.started_at().map(|t| t.to_rfc3339()),
            },
            None => ForwardStatus {
                definition: definition.clone(),
                active: false,
                bytes_transferred: 0,
                connection_count: 0,
                start_time: None,
            },
        }
    }

    fn group_members(&self, group: &str) -> Vec<String> {
        self.definitions
            .iter()
            .filter(|entry| entry.value().group() == group)
            .map(|entry| entry.key().clone())
            .collect()
    }

    async fn reconcile(
        &self, name: &str, prev: Option<&ForwardDefinition>, definition: &ForwardDefinition,
    ) -> Result<(), ManagerError> {
        let restart = prev
            .map(|previous| previous.routing_changed(definition))
            .unwrap_or(false);
        if restart {
            if let Some((_, forwarder)) = self.forwarders.remove(name) {
                info!(forward = %name, "routing parameters changed, restarting forward");
                forwarder.stop().await;
            }
        }

        if definition.enabled() && !self.forwarders.contains_key(name) {
            match self.spawn_forwarder(definition).await {
                Ok(forwarder) => {
                    self.forwarders.insert(name.to_string(), forwarder);
                }
                Err(ForwardError::AddressInUse(port)) => {
                    warn!(forward = %name, port, "local port already in use, disabling forward");
                    if let Some(mut entry) = self.definitions.get_mut(name) {
                        entry.set_enabled(false);
                    }
                    return Err(ManagerError::Forward(ForwardError::AddressInUse(port)));
                }
                Err(e) => return Err(ManagerError::Forward(e)),
            }
        }

        Ok(())
    }

    async fn spawn_forwarder(
        &self, definition: &ForwardDefinition,
    ) -> Result<Arc<Forwarder>, ForwardError> {
        let forwarder = Forwarder::new(definition.clone(), Arc::clone(&self.kube_cache));
        forwarder.clone().start(&self.cancel).await?;
        Ok(forwarder)
    }

    async fn start_enabled(&self) {
        let enabled: Vec<ForwardDefinition> = self
            .definitions
            .iter()
            .filter(|entry| entry.value().enabled())
            .map(|entry| entry.value().clone())
            .collect();

        for definition in enabled {
            let name = definition.name().to_string();
            if self.forwarders.contains_key(&name) {
                continue;
            }
            match self.spawn_forwarder(&definition).await {
                Ok(forwarder) => {
                    self.forwarders.insert(name, forwarder);
                }
                Err(e) => {
                    warn!(forward = %name, error = %e, "failed to start forward, disabling");
                    if let Some(mut entry) = self.definitions.get_mut(&name) {
                        entry.set_enabled(false);
                    }
                }
            }
        }
    }

    async fn stop_all_unlocked(&self) {
        let names: Vec<String> = self
            .forwarders
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            if let Some((_, forwarder)) = self.forwarders.remove(&name) {
                forwarder.stop().await;
            }
        }
    }

    async fn persist(&self) {
        let snapshot: HashMap<String, ForwardDefinition> = self
            .definitions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        self.watch_suppress.store(true, Ordering::Relaxed);
        if let Err(e) = self.store.save(&snapshot).await {
            error!(error = %e, "failed to persist configuration");
        }
    }
}
