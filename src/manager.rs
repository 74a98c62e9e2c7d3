//! The module manager: single source of truth for the module table and the
//! only component allowed to mutate module state.
//!
//! The table is built eagerly from the validated configuration, so locator
//! resolution problems surface once, deterministically, as broken rows.
//! Activation resolves the transitive connector closure in topological order
//! (cycles rejected), deactivation takes dependents down first, and every
//! state change is published on the event stream.
//!
//! Locking discipline: the table mutex is held only for short read/update
//! windows; hooks and cross-module calls never run under it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use indexmap::IndexMap;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Config, LocalModuleConfig, ModuleConfig, RemoteModuleConfig};
use crate::error::{CoreError, HookPhase, Result};
use crate::meta::{ConnectorStore, OptionStore, StatusStore};
use crate::module::{
    module_thread_name, ModuleContext, ModuleKind, ModuleState, StateCell,
};
use crate::paths;
use crate::proxy::{ConnectorProxy, ModulePort};
use crate::registry::ModuleRegistry;
use crate::remote::client::{RemoteModuleClient, RemotePort};
use crate::threads::{ThreadManager, WorkerHandle};
use crate::yaml::Value;

/// Waiting time for an in-flight call to finish before a deactivation is
/// forced through.
const DEACTIVATE_TIMEOUT: Duration = Duration::from_secs(30);
/// Connect timeout towards peer instances.
const REMOTE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Structured events published by the manager, suitable for driving a table
/// view or mirroring errors into a UI surface.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    ModuleStateChanged { name: String, state: ModuleState },
    ModulesChanged,
    ModuleError { module: String, message: String },
    RemoteSessionOpened { peer: String },
    RemoteSessionClosed { peer: String },
}

/// One row of the manager snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleInfo {
    pub name: String,
    pub kind: ModuleKind,
    /// Stable per process lifetime, surviving reload cycles.
    pub uuid: Uuid,
    pub state: ModuleState,
    pub has_appdata: bool,
    pub thread: Option<String>,
    pub is_remote: bool,
    pub broken: bool,
}

/// A module instance together with its materialized context. Owned by the
/// manager, executed only on the module's worker.
pub(crate) struct ModuleShell {
    pub(crate) module: Box<dyn crate::module::Module>,
    pub(crate) ctx: ModuleContext,
}

pub(crate) type SharedShell = Arc<Mutex<ModuleShell>>;

/// Locks a shell, recovering from poisoning left behind by a panicking hook.
pub(crate) fn lock_shell(shell: &SharedShell) -> MutexGuard<'_, ModuleShell> {
    shell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

struct LocalRuntime {
    shell: SharedShell,
    worker: WorkerHandle,
    state: Arc<StateCell>,
    /// Set when the module owns a dedicated worker to release on teardown.
    owned_thread: Option<String>,
}

struct RemoteRuntime {
    client: Arc<RemoteModuleClient>,
    port: Arc<RemotePort>,
    state: Arc<StateCell>,
}

enum Runtime {
    Local(LocalRuntime),
    Remote(RemoteRuntime),
}

impl Runtime {
    fn state(&self) -> ModuleState {
        match self {
            Runtime::Local(local) => local.state.current(),
            Runtime::Remote(remote) => remote.state.current(),
        }
    }
}

enum Source {
    Local {
        cfg: LocalModuleConfig,
        /// Resolution failure message; the row is broken while set.
        broken: Option<String>,
        /// Interfaces of the resolved class, for connector checks.
        interfaces: Vec<String>,
    },
    Remote { cfg: RemoteModuleConfig },
}

struct ManagedModule {
    name: String,
    kind: ModuleKind,
    uuid: Uuid,
    source: Source,
    runtime: Option<Runtime>,
    /// Activated by direct user request (incl. startup modules), as opposed
    /// to on behalf of a dependent or a remote peer.
    explicit: bool,
    /// Count of remote acquirers currently holding this module.
    remote_refs: usize,
    /// Bumped on every deactivation; stale remote handles are detected by
    /// comparing against this.
    generation: u64,
}

impl ManagedModule {
    fn state(&self) -> ModuleState {
        self.runtime
            .as_ref()
            .map(Runtime::state)
            .unwrap_or(ModuleState::Deactivated)
    }

    fn is_active(&self) -> bool {
        self.state().is_active()
    }

    fn connect_targets(&self) -> Vec<String> {
        match &self.source {
            Source::Local { cfg, .. } => cfg.connect.values().cloned().collect(),
            Source::Remote { .. } => Vec::new(),
        }
    }
}

pub(crate) struct ManagerInner {
    registry: Arc<ModuleRegistry>,
    threads: Arc<ThreadManager>,
    main_worker: WorkerHandle,
    state_dir: PathBuf,
    data_dir: PathBuf,
    table: Mutex<IndexMap<String, ManagedModule>>,
    subscribers: Mutex<Vec<Sender<ManagerEvent>>>,
    weak_self: Mutex<Weak<ManagerInner>>,
}

/// Handle to the module manager. Cloning shares the same table.
#[derive(Clone)]
pub struct ModuleManager {
    inner: Arc<ManagerInner>,
}

impl ModuleManager {
    /// Builds the manager from a validated configuration. Every declared
    /// module is constructed as a table entry immediately; locators that do
    /// not resolve become broken rows rather than errors.
    pub fn from_config(
        config: &Config,
        registry: Arc<ModuleRegistry>,
        threads: Arc<ThreadManager>,
        state_dir: PathBuf,
        data_dir: PathBuf,
    ) -> Result<Self> {
        let main_worker = threads.get_or_create("main")?;
        let mut table = IndexMap::new();
        for (kind, name, module) in config.declared() {
            let source = match module {
                ModuleConfig::Local(cfg) => {
                    let (broken, interfaces) = match registry.resolve(&cfg.class) {
                        Ok(class) => (None, class.decl.interfaces.clone()),
                        Err(err) => {
                            warn!(module = name.as_str(), %err, "module class did not resolve");
                            (Some(err.to_string()), Vec::new())
                        }
                    };
                    Source::Local {
                        cfg: cfg.clone(),
                        broken,
                        interfaces,
                    }
                }
                ModuleConfig::Remote(cfg) => Source::Remote { cfg: cfg.clone() },
            };
            table.insert(
                name.clone(),
                ManagedModule {
                    name: name.clone(),
                    kind,
                    uuid: Uuid::new_v4(),
                    source,
                    runtime: None,
                    explicit: false,
                    remote_refs: 0,
                    generation: 0,
                },
            );
        }
        let inner = Arc::new(ManagerInner {
            registry,
            threads,
            main_worker,
            state_dir,
            data_dir,
            table: Mutex::new(table),
            subscribers: Mutex::new(Vec::new()),
            weak_self: Mutex::new(Weak::new()),
        });
        *inner.weak_self.lock().expect("manager lock poisoned") = Arc::downgrade(&inner);
        Ok(Self { inner })
    }

    /// Subscribes to the structured event stream.
    pub fn subscribe(&self) -> Receiver<ManagerEvent> {
        let (tx, rx) = unbounded();
        self.inner
            .subscribers
            .lock()
            .expect("manager lock poisoned")
            .push(tx);
        rx
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.table.lock().expect("manager lock poisoned").contains_key(name)
    }

    pub fn module_names(&self) -> Vec<String> {
        let table = self.inner.table.lock().expect("manager lock poisoned");
        table.keys().cloned().collect()
    }

    /// Ordered read-only view of the module table.
    pub fn snapshot(&self) -> Vec<ModuleInfo> {
        let table = self.inner.table.lock().expect("manager lock poisoned");
        table
            .values()
            .map(|entry| {
                let (is_remote, broken) = match &entry.source {
                    Source::Local { broken, .. } => (false, broken.is_some()),
                    Source::Remote { .. } => (true, false),
                };
                let thread = match &entry.runtime {
                    Some(Runtime::Local(local)) => Some(local.worker.name().to_string()),
                    _ => None,
                };
                ModuleInfo {
                    name: entry.name.clone(),
                    kind: entry.kind,
                    uuid: entry.uuid,
                    state: entry.state(),
                    has_appdata: paths::status_file(&self.inner.state_dir, &entry.name).is_file(),
                    thread,
                    is_remote,
                    broken,
                }
            })
            .collect()
    }

    pub fn state_of(&self, name: &str) -> Result<ModuleState> {
        let table = self.inner.table.lock().expect("manager lock poisoned");
        table
            .get(name)
            .map(ManagedModule::state)
            .ok_or_else(|| CoreError::UnknownModule { name: name.to_string() })
    }

    /// Activates a module and, bottom-up, every dependency reachable through
    /// its configured connectors. Idempotent for already-active modules.
    pub fn activate(&self, name: &str) -> Result<()> {
        let order = self.inner.activation_order(name)?;
        for member in &order {
            self.inner.activate_single(member, member == name)?;
        }
        Ok(())
    }

    /// Deactivates a module, taking its active dependents down first.
    /// Status variables are persisted regardless of hook outcome.
    pub fn deactivate(&self, name: &str) -> Result<()> {
        let order = self.inner.deactivation_order(name)?;
        for member in &order {
            self.inner.deactivate_single(member);
        }
        Ok(())
    }

    /// Deactivate + activate. With `reload_code` the implementation locator
    /// is resolved afresh, picking up a changed registry. Remote handles
    /// held by peers become stale; clients must re-acquire.
    pub fn reload(&self, name: &str, reload_code: bool) -> Result<()> {
        let (was_active, was_explicit) = {
            let table = self.inner.table.lock().expect("manager lock poisoned");
            let entry = table
                .get(name)
                .ok_or_else(|| CoreError::UnknownModule { name: name.to_string() })?;
            (entry.is_active(), entry.explicit)
        };

        let order = self.inner.deactivation_order(name)?;
        // Remember which dependents were explicitly activated so the reload
        // can restore them faithfully.
        let dependents: Vec<(String, bool)> = {
            let table = self.inner.table.lock().expect("manager lock poisoned");
            order
                .iter()
                .filter(|member| member.as_str() != name)
                .filter_map(|member| table.get(member).map(|e| (member.clone(), e.explicit)))
                .collect()
        };
        for member in &order {
            self.inner.deactivate_single(member);
        }

        if reload_code {
            let mut table = self.inner.table.lock().expect("manager lock poisoned");
            if let Some(entry) = table.get_mut(name) {
                if let Source::Local { cfg, broken, interfaces } = &mut entry.source {
                    match self.inner.registry.resolve(&cfg.class) {
                        Ok(class) => {
                            *broken = None;
                            *interfaces = class.decl.interfaces.clone();
                        }
                        Err(err) => *broken = Some(err.to_string()),
                    }
                }
            }
        }

        if was_active {
            let order = self.inner.activation_order(name)?;
            for member in &order {
                self.inner.activate_single(member, member == name && was_explicit)?;
            }
            for (dependent, explicit) in dependents.iter().rev() {
                let order = self.inner.activation_order(dependent)?;
                for member in &order {
                    self.inner
                        .activate_single(member, member == dependent && *explicit)?;
                }
            }
        }
        self.inner.emit(ManagerEvent::ModulesChanged);
        Ok(())
    }

    /// Removes the persisted status file of a module.
    pub fn clear_appdata(&self, name: &str) -> Result<()> {
        if !self.contains(name) {
            return Err(CoreError::UnknownModule { name: name.to_string() });
        }
        let file = paths::status_file(&self.inner.state_dir, name);
        if file.is_file() {
            std::fs::remove_file(&file)?;
        }
        Ok(())
    }

    /// Deactivates every active module, dependents first. Used on shutdown.
    pub fn deactivate_all(&self) {
        let names: Vec<String> = {
            let table = self.inner.table.lock().expect("manager lock poisoned");
            table
                .values()
                .filter(|entry| entry.is_active())
                .map(|entry| entry.name.clone())
                .collect()
        };
        for name in names.iter().rev() {
            if let Ok(order) = self.inner.deactivation_order(name) {
                for member in &order {
                    self.inner.deactivate_single(member);
                }
            }
        }
    }

    /// Dispatch surface used by script kernels and the remote server: the
    /// port resolves through the manager on every use and never prolongs the
    /// module's life.
    pub fn port(&self, name: &str) -> Result<Arc<dyn ModulePort>> {
        let table = self.inner.table.lock().expect("manager lock poisoned");
        let entry = table
            .get(name)
            .ok_or_else(|| CoreError::UnknownModule { name: name.to_string() })?;
        match (&entry.source, &entry.runtime) {
            (Source::Remote { .. }, Some(Runtime::Remote(remote))) => {
                let port: Arc<dyn ModulePort> = remote.port.clone();
                Ok(port)
            }
            (Source::Remote { .. }, _) => Err(CoreError::NotActive {
                module: name.to_string(),
            }),
            _ => Ok(Arc::new(LocalPort {
                manager: self.inner.weak(),
                target: name.to_string(),
            })),
        }
    }

    // ----- remote server support ---------------------------------------

    /// Module names a peer may acquire.
    pub fn list_remotable(&self) -> Vec<String> {
        let table = self.inner.table.lock().expect("manager lock poisoned");
        table
            .values()
            .filter(|entry| matches!(&entry.source, Source::Local { cfg, .. } if cfg.allow_remote))
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Serves an acquire request: refuses modules without `allow_remote`
    /// (leaving the table untouched), activates on demand and counts the
    /// acquirer. Returns the activation generation and the interface set.
    pub fn acquire_remote(&self, name: &str) -> Result<(u64, Vec<String>)> {
        {
            let table = self.inner.table.lock().expect("manager lock poisoned");
            let entry = table
                .get(name)
                .ok_or_else(|| CoreError::UnknownModule { name: name.to_string() })?;
            match &entry.source {
                Source::Local { cfg, .. } if cfg.allow_remote => {}
                _ => return Err(CoreError::NotRemotable { module: name.to_string() }),
            }
        }
        let order = self.inner.activation_order(name)?;
        for member in &order {
            self.inner.activate_single(member, false)?;
        }
        let mut table = self.inner.table.lock().expect("manager lock poisoned");
        let entry = table
            .get_mut(name)
            .ok_or_else(|| CoreError::UnknownModule { name: name.to_string() })?;
        entry.remote_refs += 1;
        let interfaces = match &entry.source {
            Source::Local { interfaces, .. } => interfaces.clone(),
            Source::Remote { .. } => Vec::new(),
        };
        Ok((entry.generation, interfaces))
    }

    /// Drops one remote acquirer. The module deactivates when no acquirer
    /// and no local user is left (shared-exporter policy).
    pub fn release_remote(&self, name: &str) {
        let should_deactivate = {
            let mut table = self.inner.table.lock().expect("manager lock poisoned");
            let (refs, explicit, active) = match table.get_mut(name) {
                Some(entry) => {
                    entry.remote_refs = entry.remote_refs.saturating_sub(1);
                    (entry.remote_refs, entry.explicit, entry.is_active())
                }
                None => return,
            };
            refs == 0
                && !explicit
                && active
                && self.inner.active_dependents_locked(&table, name).is_empty()
        };
        if should_deactivate {
            info!(module = name, "last remote user gone, deactivating shared module");
            self.inner.deactivate_single(name);
        }
    }

    /// Validates a remote handle against the module's current activation.
    pub fn check_generation(&self, name: &str, generation: u64, handle: u64) -> Result<()> {
        let table = self.inner.table.lock().expect("manager lock poisoned");
        let entry = table
            .get(name)
            .ok_or_else(|| CoreError::UnknownModule { name: name.to_string() })?;
        if !entry.is_active() || entry.generation != generation {
            return Err(CoreError::StaleHandle { handle });
        }
        Ok(())
    }

    pub(crate) fn emit(&self, event: ManagerEvent) {
        self.inner.emit(event);
    }
}

impl ManagerInner {
    fn weak(&self) -> Weak<ManagerInner> {
        self.weak_self.lock().expect("manager lock poisoned").clone()
    }

    fn emit(&self, event: ManagerEvent) {
        let mut subscribers = self.subscribers.lock().expect("manager lock poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Transitive connector closure of `name` in activation order:
    /// dependencies first, ties broken by declaration order (hardware before
    /// logic before gui). Rejects cycles with a deterministic diagnostic.
    fn activation_order(&self, name: &str) -> Result<Vec<String>> {
        let table = self.table.lock().expect("manager lock poisoned");
        if !table.contains_key(name) {
            return Err(CoreError::UnknownModule { name: name.to_string() });
        }

        // Collect the closure. Connect targets that are not declared at all
        // are left to connector binding, which tolerates them for optional
        // connectors.
        let mut closure: Vec<String> = Vec::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if closure.contains(&current) {
                continue;
            }
            let Some(entry) = table.get(&current) else {
                continue;
            };
            closure.push(current.clone());
            for target in entry.connect_targets() {
                if table.contains_key(&target) && !closure.contains(&target) {
                    stack.push(target);
                }
            }
        }

        // Kahn's algorithm, picking ready members by table position.
        let mut remaining: Vec<String> = table
            .keys()
            .filter(|key| closure.contains(*key))
            .cloned()
            .collect();
        let mut order = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let ready = remaining.iter().position(|member| {
                table[member.as_str()]
                    .connect_targets()
                    .iter()
                    .all(|dep| !remaining.contains(dep))
            });
            match ready {
                Some(index) => order.push(remaining.remove(index)),
                None => {
                    return Err(CoreError::DependencyCycle {
                        cycle: Self::cycle_diagnostic(&table, &remaining),
                    })
                }
            }
        }
        Ok(order)
    }

    /// Walks dependency edges from the first unresolved member until a
    /// repeat, producing `a -> b -> a` style diagnostics.
    fn cycle_diagnostic(table: &IndexMap<String, ManagedModule>, remaining: &[String]) -> String {
        let mut path: Vec<String> = Vec::new();
        let mut current = remaining[0].clone();
        loop {
            if let Some(start) = path.iter().position(|step| *step == current) {
                path.push(current);
                return path[start..].join(" -> ");
            }
            path.push(current.clone());
            let next = table[current.as_str()]
                .connect_targets()
                .into_iter()
                .find(|target| remaining.contains(target));
            match next {
                Some(next) => current = next,
                None => return path.join(" -> "),
            }
        }
    }

    /// `name` plus its transitive active dependents, ordered dependents
    /// first (reverse topological).
    fn deactivation_order(&self, name: &str) -> Result<Vec<String>> {
        let table = self.table.lock().expect("manager lock poisoned");
        if !table.contains_key(name) {
            return Err(CoreError::UnknownModule { name: name.to_string() });
        }
        let mut closure: Vec<String> = Vec::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if closure.contains(&current) {
                continue;
            }
            closure.push(current.clone());
            for dependent in self.active_dependents_locked(&table, &current) {
                if !closure.contains(&dependent) {
                    stack.push(dependent);
                }
            }
        }
        // Dependencies-first order of the closure, reversed.
        let mut remaining: Vec<String> = table
            .keys()
            .filter(|key| closure.contains(*key))
            .cloned()
            .collect();
        let mut order = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let ready = remaining
                .iter()
                .position(|member| {
                    table[member.as_str()]
                        .connect_targets()
                        .iter()
                        .all(|dep| !remaining.contains(dep))
                })
                .unwrap_or(0);
            order.push(remaining.remove(ready));
        }
        order.reverse();
        Ok(order)
    }

    fn active_dependents_locked(
        &self,
        table: &IndexMap<String, ManagedModule>,
        name: &str,
    ) -> Vec<String> {
        table
            .values()
            .filter(|entry| entry.is_active())
            .filter(|entry| entry.connect_targets().iter().any(|target| target == name))
            .map(|entry| entry.name.clone())
            .collect()
    }

    fn activate_single(&self, name: &str, explicit: bool) -> Result<()> {
        enum Plan {
            AlreadyActive,
            Local {
                cfg: LocalModuleConfig,
                kind: ModuleKind,
                uuid: Uuid,
            },
            Remote {
                cfg: RemoteModuleConfig,
            },
        }

        let plan = {
            let mut table = self.table.lock().expect("manager lock poisoned");
            let entry = table
                .get_mut(name)
                .ok_or_else(|| CoreError::UnknownModule { name: name.to_string() })?;
            if entry.is_active() {
                if explicit {
                    entry.explicit = true;
                }
                Plan::AlreadyActive
            } else {
                match &entry.source {
                    Source::Local { cfg, broken, .. } => {
                        if let Some(reason) = broken {
                            return Err(CoreError::Resolution {
                                locator: cfg.class.clone(),
                                reason: reason.clone(),
                            });
                        }
                        Plan::Local {
                            cfg: cfg.clone(),
                            kind: entry.kind,
                            uuid: entry.uuid,
                        }
                    }
                    Source::Remote { cfg } => Plan::Remote { cfg: cfg.clone() },
                }
            }
        };

        match plan {
            Plan::AlreadyActive => Ok(()),
            Plan::Local { cfg, kind, uuid } => self.activate_local(name, explicit, cfg, kind, uuid),
            Plan::Remote { cfg } => self.activate_remote(name, explicit, cfg),
        }
    }

    fn activate_local(
        &self,
        name: &str,
        explicit: bool,
        cfg: LocalModuleConfig,
        kind: ModuleKind,
        uuid: Uuid,
    ) -> Result<()> {
        info!(module = name, kind = %kind, uuid = %uuid, "activating module");
        let class = self.registry.resolve(&cfg.class)?.clone();

        // Instance construction on the calling (manager) thread: options
        // materialize and freeze here.
        let module = (class.construct)();
        let options = OptionStore::materialize(name, &class.decl.options, &cfg.options)?;
        let connectors = self.bind_connectors(name, &class, &cfg)?;
        let status = StatusStore::load(
            name,
            &class.decl.status_vars,
            &paths::status_file(&self.state_dir, name),
        );

        let threaded = class.decl.threaded.unwrap_or_else(|| kind.default_threaded());
        let (worker, owned_thread) = if threaded {
            let thread_name = module_thread_name(kind, name);
            (self.threads.get_or_create(&thread_name)?, Some(thread_name))
        } else {
            (self.main_worker.clone(), None)
        };

        let state = StateCell::new(name);
        self.observe_state(&state);
        let ctx = ModuleContext::new(
            name.to_string(),
            kind,
            uuid,
            threaded,
            state.clone(),
            self.data_dir.join(name),
            options,
            status,
            connectors,
        );
        let shell: SharedShell = Arc::new(Mutex::new(ModuleShell { module, ctx }));

        {
            let mut table = self.table.lock().expect("manager lock poisoned");
            let entry = table
                .get_mut(name)
                .ok_or_else(|| CoreError::UnknownModule { name: name.to_string() })?;
            entry.runtime = Some(Runtime::Local(LocalRuntime {
                shell: shell.clone(),
                worker: worker.clone(),
                state: state.clone(),
                owned_thread: owned_thread.clone(),
            }));
        }

        state.transition("activate", &[ModuleState::Deactivated], ModuleState::Activating)?;

        let hook_shell = shell.clone();
        let hook_result = worker.run(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let mut guard = lock_shell(&hook_shell);
                let ModuleShell { module, ctx } = &mut *guard;
                module.on_activate(ctx)
            }));
            match outcome {
                Ok(result) => result,
                Err(payload) => Err(CoreError::Hook {
                    module: String::new(),
                    phase: HookPhase::Activate,
                    reason: panic_reason(payload),
                }),
            }
        });

        match hook_result {
            Ok(Ok(())) => {
                state.transition("activate", &[ModuleState::Activating], ModuleState::Idle)?;
                {
                    let mut table = self.table.lock().expect("manager lock poisoned");
                    if let Some(entry) = table.get_mut(name) {
                        if explicit {
                            entry.explicit = true;
                        }
                    }
                }
                info!(module = name, "module activated");
                Ok(())
            }
            Ok(Err(err)) | Err(err) => {
                // Dependencies activated on behalf of this module stay up as
                // roots awaiting explicit deactivation.
                state.force(ModuleState::Deactivated);
                self.teardown_runtime(name);
                let wrapped = CoreError::Hook {
                    module: name.to_string(),
                    phase: HookPhase::Activate,
                    reason: err.to_string(),
                };
                error!(module = name, %wrapped, "module activation failed");
                self.emit(ManagerEvent::ModuleError {
                    module: name.to_string(),
                    message: wrapped.to_string(),
                });
                Err(wrapped)
            }
        }
    }

    fn activate_remote(&self, name: &str, explicit: bool, cfg: RemoteModuleConfig) -> Result<()> {
        info!(
            module = name,
            peer = %format!("{}:{}", cfg.address, cfg.port),
            native = %cfg.native_module_name,
            "activating remote module"
        );
        let state = StateCell::new(name);
        self.observe_state(&state);
        state.transition("activate", &[ModuleState::Deactivated], ModuleState::Activating)?;

        let connected = RemoteModuleClient::connect(
            &cfg.address,
            cfg.port,
            cfg.certfile.as_deref(),
            REMOTE_CONNECT_TIMEOUT,
        )
        .and_then(|client| {
            let port = client.acquire(&cfg.native_module_name)?;
            Ok((client, port))
        });

        match connected {
            Ok((client, port)) => {
                {
                    let mut table = self.table.lock().expect("manager lock poisoned");
                    let entry = table
                        .get_mut(name)
                        .ok_or_else(|| CoreError::UnknownModule { name: name.to_string() })?;
                    entry.runtime = Some(Runtime::Remote(RemoteRuntime {
                        client,
                        port,
                        state: state.clone(),
                    }));
                    if explicit {
                        entry.explicit = true;
                    }
                }
                state.transition("activate", &[ModuleState::Activating], ModuleState::Idle)?;
                info!(module = name, "remote module activated");
                Ok(())
            }
            Err(err) => {
                state.force(ModuleState::Deactivated);
                error!(module = name, %err, "remote module activation failed");
                self.emit(ManagerEvent::ModuleError {
                    module: name.to_string(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Binds every declared connector to a capability proxy. Targets are
    /// expected to be active already (the activation order guarantees it).
    fn bind_connectors(
        &self,
        name: &str,
        class: &crate::registry::ModuleClass,
        cfg: &LocalModuleConfig,
    ) -> Result<ConnectorStore> {
        let table = self.table.lock().expect("manager lock poisoned");
        let mut bindings = IndexMap::new();
        for connector in &class.decl.connectors {
            let target_name = cfg.connect.get(&connector.name);
            let proxy = match target_name {
                None => {
                    if connector.optional {
                        ConnectorProxy::unbound(&connector.name, &connector.interface)
                    } else {
                        return Err(CoreError::Descriptor {
                            module: name.to_string(),
                            problem: format!(
                                "required connector '{}' has no entry in 'connect'",
                                connector.name
                            ),
                        });
                    }
                }
                Some(target_name) => match table.get(target_name) {
                    None => {
                        if connector.optional {
                            warn!(
                                module = name,
                                connector = %connector.name,
                                target = %target_name,
                                "optional connector target not declared, leaving unbound"
                            );
                            ConnectorProxy::unbound(&connector.name, &connector.interface)
                        } else {
                            return Err(CoreError::Descriptor {
                                module: name.to_string(),
                                problem: format!(
                                    "connector '{}' targets unknown module '{target_name}'",
                                    connector.name
                                ),
                            });
                        }
                    }
                    Some(target) => {
                        let interfaces = match (&target.source, &target.runtime) {
                            (Source::Local { interfaces, .. }, _) => interfaces.clone(),
                            (Source::Remote { .. }, Some(Runtime::Remote(remote))) => {
                                remote.port.interface_names()
                            }
                            (Source::Remote { .. }, _) => Vec::new(),
                        };
                        if !interfaces.iter().any(|i| i == &connector.interface) {
                            return Err(CoreError::Descriptor {
                                module: name.to_string(),
                                problem: format!(
                                    "module '{target_name}' does not provide interface '{}' \
                                     required by connector '{}'",
                                    connector.interface, connector.name
                                ),
                            });
                        }
                        let port: Arc<dyn ModulePort> = match &target.runtime {
                            Some(Runtime::Remote(remote)) => remote.port.clone(),
                            _ => Arc::new(LocalPort {
                                manager: self.weak(),
                                target: target_name.clone(),
                            }),
                        };
                        ConnectorProxy::bound(&connector.name, &connector.interface, port)
                    }
                },
            };
            bindings.insert(connector.name.clone(), proxy);
        }
        Ok(ConnectorStore::new(name, bindings))
    }

    /// Runs the deactivation sequence for one module. Hook failures are
    /// logged and published, never propagated; the module always ends up
    /// `deactivated` with its status dumped.
    fn deactivate_single(&self, name: &str) {
        let runtime = {
            let mut table = self.table.lock().expect("manager lock poisoned");
            let Some(entry) = table.get_mut(name) else {
                return;
            };
            if !entry.is_active() {
                return;
            }
            entry.runtime.take()
        };
        let Some(runtime) = runtime else {
            return;
        };

        info!(module = name, "deactivating module");
        match runtime {
            Runtime::Remote(remote) => {
                if let Err(err) = remote.client.release(remote.port.handle()) {
                    warn!(module = name, %err, "releasing remote handle failed");
                }
                remote.state.force(ModuleState::Deactivated);
            }
            Runtime::Local(local) => {
                if local
                    .state
                    .transition(
                        "deactivate",
                        &[ModuleState::Idle, ModuleState::Locked],
                        ModuleState::Deactivating,
                    )
                    .is_err()
                {
                    local.state.force(ModuleState::Deactivating);
                }

                let shell = local.shell.clone();
                let status_file = paths::status_file(&self.state_dir, name);
                let outcome = local.worker.run_timeout(
                    move || {
                        let hook = match catch_unwind(AssertUnwindSafe(|| {
                            let mut guard = lock_shell(&shell);
                            let ModuleShell { module, ctx } = &mut *guard;
                            module.on_deactivate(ctx)
                        })) {
                            Ok(result) => result,
                            Err(payload) => Err(CoreError::Hook {
                                module: String::new(),
                                phase: HookPhase::Deactivate,
                                reason: panic_reason(payload),
                            }),
                        };
                        // Status variables are saved even when the hook failed.
                        let dump = {
                            let guard = lock_shell(&shell);
                            guard.ctx.status.dump(&status_file)
                        };
                        (hook, dump)
                    },
                    DEACTIVATE_TIMEOUT,
                );

                match outcome {
                    Ok((hook, dump)) => {
                        if let Err(err) = hook {
                            error!(module = name, %err, "on_deactivate failed");
                            self.emit(ManagerEvent::ModuleError {
                                module: name.to_string(),
                                message: err.to_string(),
                            });
                        }
                        if let Err(err) = dump {
                            error!(module = name, %err, "status dump failed");
                        }
                    }
                    Err(err) => {
                        // Worker gone or drained too slowly. Dump from here;
                        // the instance is no longer dispatched to.
                        warn!(module = name, %err, "deactivation dispatch failed, dumping status directly");
                        let guard = lock_shell(&local.shell);
                        if let Err(err) = guard.ctx.status.dump(&paths::status_file(&self.state_dir, name)) {
                            error!(module = name, %err, "status dump failed");
                        }
                    }
                }
                local.state.force(ModuleState::Deactivated);
                if let Some(thread_name) = &local.owned_thread {
                    self.threads.release(thread_name);
                }
            }
        }

        let mut table = self.table.lock().expect("manager lock poisoned");
        if let Some(entry) = table.get_mut(name) {
            entry.explicit = false;
            // Outstanding remote handles are stale from here on; their
            // references die with the activation.
            entry.remote_refs = 0;
            entry.generation += 1;
        }
        info!(module = name, "module deactivated");
    }

    /// Drops a half-built runtime after a failed activation.
    fn teardown_runtime(&self, name: &str) {
        let runtime = {
            let mut table = self.table.lock().expect("manager lock poisoned");
            table.get_mut(name).and_then(|entry| entry.runtime.take())
        };
        if let Some(Runtime::Local(local)) = runtime {
            if let Some(thread_name) = &local.owned_thread {
                self.threads.release(thread_name);
            }
        }
    }

    fn observe_state(&self, state: &Arc<StateCell>) {
        let weak = self.weak();
        state.set_observer(Box::new(move |module, new_state| {
            if let Some(inner) = weak.upgrade() {
                inner.emit(ManagerEvent::ModuleStateChanged {
                    name: module.to_string(),
                    state: new_state,
                });
            }
        }));
    }

    /// Resolves the live runtime pieces of an active local module.
    fn local_runtime(&self, name: &str) -> Result<(SharedShell, WorkerHandle)> {
        let table = self.table.lock().expect("manager lock poisoned");
        let entry = table
            .get(name)
            .ok_or_else(|| CoreError::UnknownModule { name: name.to_string() })?;
        match &entry.runtime {
            Some(Runtime::Local(local)) if local.state.current().is_ready() => {
                Ok((local.shell.clone(), local.worker.clone()))
            }
            _ => Err(CoreError::NotActive { module: name.to_string() }),
        }
    }

    fn local_interfaces(&self, name: &str) -> Result<Vec<String>> {
        let table = self.table.lock().expect("manager lock poisoned");
        let entry = table
            .get(name)
            .ok_or_else(|| CoreError::UnknownModule { name: name.to_string() })?;
        match &entry.source {
            Source::Local { interfaces, .. } => Ok(interfaces.clone()),
            Source::Remote { .. } => Ok(Vec::new()),
        }
    }

    fn local_state(&self, name: &str) -> Result<ModuleState> {
        let table = self.table.lock().expect("manager lock poisoned");
        table
            .get(name)
            .map(ManagedModule::state)
            .ok_or_else(|| CoreError::UnknownModule { name: name.to_string() })
    }
}

/// Port to a module in this process. Resolves the target through the manager
/// on each use and dispatches to the target's owning worker, so the proxy
/// stays valid across reloads and never keeps a dead module alive.
pub(crate) struct LocalPort {
    manager: Weak<ManagerInner>,
    target: String,
}

impl LocalPort {
    fn inner(&self) -> Result<Arc<ManagerInner>> {
        self.manager.upgrade().ok_or_else(|| CoreError::NotActive {
            module: self.target.clone(),
        })
    }
}

impl ModulePort for LocalPort {
    fn target(&self) -> &str {
        &self.target
    }

    fn interfaces(&self) -> Result<Vec<String>> {
        self.inner()?.local_interfaces(&self.target)
    }

    fn state(&self) -> Result<ModuleState> {
        self.inner()?.local_state(&self.target)
    }

    fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let inner = self.inner()?;
        let (shell, worker) = inner.local_runtime(&self.target)?;
        let method = method.to_string();
        worker.run(move || {
            let mut guard = lock_shell(&shell);
            let ModuleShell { module, ctx } = &mut *guard;
            module.call(ctx, &method, &args)
        })?
    }

    fn read_attr(&self, name: &str) -> Result<Value> {
        let inner = self.inner()?;
        let (shell, worker) = inner.local_runtime(&self.target)?;
        let name = name.to_string();
        worker.run(move || {
            let mut guard = lock_shell(&shell);
            let ModuleShell { module, ctx } = &mut *guard;
            module.read_attr(ctx, &name)
        })?
    }

    fn write_attr(&self, name: &str, value: Value) -> Result<()> {
        let inner = self.inner()?;
        let (shell, worker) = inner.local_runtime(&self.target)?;
        let name = name.to_string();
        worker.run(move || {
            let mut guard = lock_shell(&shell);
            let ModuleShell { module, ctx } = &mut *guard;
            module.write_attr(ctx, &name, value)
        })?
    }
}
