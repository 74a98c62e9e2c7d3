//! Module base: kinds, the lifecycle state machine, the per-instance context
//! handed to user code and the [`Module`] trait every implementation fills in.
//!
//! State transitions are only ever performed by the module manager and, for
//! the idle/locked pair, by the module itself through its context. External
//! code can read the state but has no way to write it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::meta::{ConnectorStore, OptionStore, StatusStore};
use crate::proxy::ConnectorProxy;
use crate::yaml::Value;

/// The three module layers. The order here is the activation tie-break
/// order: hardware before logic before gui.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Hardware,
    Logic,
    Gui,
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Hardware => "hardware",
            ModuleKind::Logic => "logic",
            ModuleKind::Gui => "gui",
        }
    }

    /// Logic modules get their own worker thread by default; gui and
    /// hardware modules run on the shared main worker.
    pub fn default_threaded(&self) -> bool {
        matches!(self, ModuleKind::Logic)
    }
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states.
///
/// ```text
///                          ------<------
///                          |           ^
///                          v           |
/// [*] -> deactivated -> activating -> idle <-> locked
///             ^                        |        |
///             |                        v        v
///             --------<-- deactivating <--------
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Deactivated,
    Activating,
    Idle,
    Locked,
    Deactivating,
}

impl ModuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Deactivated => "deactivated",
            ModuleState::Activating => "activating",
            ModuleState::Idle => "idle",
            ModuleState::Locked => "locked",
            ModuleState::Deactivating => "deactivating",
        }
    }

    /// Anything but the terminal `deactivated` state.
    pub fn is_active(&self) -> bool {
        !matches!(self, ModuleState::Deactivated)
    }

    /// Settled active states a dependent may bind to.
    pub fn is_ready(&self) -> bool {
        matches!(self, ModuleState::Idle | ModuleState::Locked)
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type StateObserver = Box<dyn Fn(&str, ModuleState) + Send + Sync>;

/// Shared state cell for one module instance. The manager holds the writing
/// side; proxies and snapshots read through clones of the `Arc`.
pub struct StateCell {
    module: String,
    state: Mutex<ModuleState>,
    observer: Mutex<Option<StateObserver>>,
}

impl StateCell {
    pub fn new(module: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            module: module.into(),
            state: Mutex::new(ModuleState::Deactivated),
            observer: Mutex::new(None),
        })
    }

    pub fn current(&self) -> ModuleState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Installs the manager-side observer notified after every transition.
    pub(crate) fn set_observer(&self, observer: StateObserver) {
        *self.observer.lock().expect("state lock poisoned") = Some(observer);
    }

    /// Moves to `to` if the current state is one of `from`. The observer
    /// fires outside the state lock.
    pub(crate) fn transition(
        &self,
        operation: &'static str,
        from: &[ModuleState],
        to: ModuleState,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if !from.contains(&state) {
                return Err(CoreError::InvalidTransition {
                    module: self.module.clone(),
                    operation,
                    state: state.as_str(),
                });
            }
            *state = to;
        }
        self.notify(to);
        Ok(())
    }

    /// Unconditional transition used when deactivation must terminate.
    pub(crate) fn force(&self, to: ModuleState) {
        *self.state.lock().expect("state lock poisoned") = to;
        self.notify(to);
    }

    pub(crate) fn lock_module(&self) -> Result<()> {
        self.transition("lock", &[ModuleState::Idle], ModuleState::Locked)
    }

    pub(crate) fn unlock_module(&self) -> Result<()> {
        self.transition("unlock", &[ModuleState::Locked], ModuleState::Idle)
    }

    fn notify(&self, state: ModuleState) {
        let observer = self.observer.lock().expect("state lock poisoned");
        if let Some(observer) = observer.as_ref() {
            observer(&self.module, state);
        }
    }
}

/// Per-instance context: identity, materialized descriptors and the handles
/// a module implementation needs inside its hooks and calls.
pub struct ModuleContext {
    name: String,
    kind: ModuleKind,
    uuid: Uuid,
    threaded: bool,
    state: Arc<StateCell>,
    data_dir: PathBuf,
    pub(crate) options: OptionStore,
    pub(crate) status: StatusStore,
    pub(crate) connectors: ConnectorStore,
}

impl ModuleContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        kind: ModuleKind,
        uuid: Uuid,
        threaded: bool,
        state: Arc<StateCell>,
        data_dir: PathBuf,
        options: OptionStore,
        status: StatusStore,
        connectors: ConnectorStore,
    ) -> Self {
        Self {
            name,
            kind,
            uuid,
            threaded,
            state,
            data_dir,
            options,
            status,
            connectors,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    /// Stable for the process lifetime; reused across reload cycles.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn threaded(&self) -> bool {
        self.threaded
    }

    pub fn state(&self) -> ModuleState {
        self.state.current()
    }

    /// Directory in which this module should save user data.
    pub fn default_data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn option(&self, name: &str) -> Result<&Value> {
        self.options.get(name)
    }

    pub fn option_f64(&self, name: &str) -> Result<f64> {
        self.options.get(name)?.as_f64().ok_or_else(|| CoreError::Descriptor {
            module: self.name.clone(),
            problem: format!("option '{name}' is not a number"),
        })
    }

    pub fn option_i64(&self, name: &str) -> Result<i64> {
        self.options.get(name)?.as_i64().ok_or_else(|| CoreError::Descriptor {
            module: self.name.clone(),
            problem: format!("option '{name}' is not an integer"),
        })
    }

    pub fn option_str(&self, name: &str) -> Result<&str> {
        self.options.get(name)?.as_str().ok_or_else(|| CoreError::Descriptor {
            module: self.name.clone(),
            problem: format!("option '{name}' is not a string"),
        })
    }

    pub fn status(&self, name: &str) -> Result<Value> {
        self.status.get(name)
    }

    pub fn set_status(&mut self, name: &str, value: Value) -> Result<()> {
        self.status.set(name, value)
    }

    pub fn connector(&self, name: &str) -> Result<&ConnectorProxy> {
        self.connectors.get(name)
    }

    /// Marks this module busy. Only the module itself may do this, from its
    /// own hooks or dispatched calls.
    pub fn lock(&self) -> Result<()> {
        self.state.lock_module()
    }

    /// Returns the module from `locked` back to `idle`.
    pub fn unlock(&self) -> Result<()> {
        self.state.unlock_module()
    }
}

/// Behaviour every module implementation provides.
///
/// Hooks and dispatched calls all run on the module's owning worker, so a
/// `&mut self` receiver is safe: no two threads ever execute the same
/// instance concurrently.
pub trait Module: Send {
    /// Called when the module is activated. Connectors are bound and status
    /// variables are loaded before this runs.
    fn on_activate(&mut self, ctx: &mut ModuleContext) -> Result<()>;

    /// Called when the module is deactivated. Status variables are dumped
    /// after this returns, even if it fails.
    fn on_deactivate(&mut self, ctx: &mut ModuleContext) -> Result<()>;

    /// Dynamic method dispatch used by connectors, the script surface and
    /// remote peers.
    fn call(&mut self, ctx: &mut ModuleContext, method: &str, _args: &[Value]) -> Result<Value> {
        Err(CoreError::UnknownMember {
            module: ctx.name().to_string(),
            kind: "method",
            name: method.to_string(),
        })
    }

    /// Attribute read. The default resolves status variables, then options.
    fn read_attr(&mut self, ctx: &mut ModuleContext, name: &str) -> Result<Value> {
        if ctx.status.contains(name) {
            return ctx.status.get(name);
        }
        if ctx.options.contains(name) {
            return ctx.options.get(name).cloned();
        }
        Err(CoreError::UnknownMember {
            module: ctx.name().to_string(),
            kind: "attribute",
            name: name.to_string(),
        })
    }

    /// Attribute write. The default writes status variables and rejects
    /// writes to (frozen) options.
    fn write_attr(&mut self, ctx: &mut ModuleContext, name: &str, value: Value) -> Result<()> {
        if ctx.status.contains(name) {
            return ctx.status.set(name, value);
        }
        if ctx.options.contains(name) {
            return ctx.options.set(name, value);
        }
        Err(CoreError::UnknownMember {
            module: ctx.name().to_string(),
            kind: "attribute",
            name: name.to_string(),
        })
    }
}

/// Name of the worker thread owning a threaded module, e.g.
/// `mod-logic-counter`.
pub fn module_thread_name(kind: ModuleKind, name: &str) -> String {
    format!("mod-{kind}-{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_cell_transitions() {
        let cell = StateCell::new("cam");
        assert_eq!(cell.current(), ModuleState::Deactivated);
        cell.transition("activate", &[ModuleState::Deactivated], ModuleState::Activating)
            .unwrap();
        cell.transition("activate", &[ModuleState::Activating], ModuleState::Idle)
            .unwrap();
        assert!(cell.current().is_ready());

        let err = cell
            .transition("activate", &[ModuleState::Deactivated], ModuleState::Activating)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[test]
    fn lock_only_from_idle() {
        let cell = StateCell::new("scan");
        assert!(cell.lock_module().is_err());
        cell.force(ModuleState::Idle);
        cell.lock_module().unwrap();
        assert_eq!(cell.current(), ModuleState::Locked);
        assert!(cell.lock_module().is_err());
        cell.unlock_module().unwrap();
        assert_eq!(cell.current(), ModuleState::Idle);
    }

    #[test]
    fn observer_sees_every_transition() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let seen = Arc::new(AtomicUsize::new(0));
        let cell = StateCell::new("cam");
        let counter = seen.clone();
        cell.set_observer(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        cell.force(ModuleState::Idle);
        cell.lock_module().unwrap();
        cell.unlock_module().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn thread_names_follow_kind_and_name() {
        assert_eq!(module_thread_name(ModuleKind::Logic, "counter"), "mod-logic-counter");
        assert_eq!(module_thread_name(ModuleKind::Hardware, "cam"), "mod-hardware-cam");
    }
}
