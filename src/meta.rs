//! Meta descriptors: class-level declarations that become per-instance data.
//!
//! A module class declares its configuration options, persisted status
//! variables and connectors once, in a [`ModuleDecl`]. The manager
//! introspects the declaration and materializes it on each instance:
//! options are resolved from the configuration and frozen, status variables
//! are loaded from the module's app-state file, connectors are bound to
//! capability proxies.

use std::path::Path;

use indexmap::IndexMap;
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::proxy::ConnectorProxy;
use crate::yaml::{self, Value};

/// Log behaviour when an option is missing from the configuration and the
/// default value is used instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingPolicy {
    #[default]
    Silent,
    Info,
    Warn,
    /// No default exists; a missing value fails construction.
    Error,
}

/// Checker callback: `false` rejects the value and fails construction.
pub type ValueChecker = fn(&Value) -> bool;
/// Mapping callback applied to raw values before use.
pub type ValueMapper = fn(Value) -> Result<Value, String>;

/// Declaration of a single configuration option.
#[derive(Debug, Clone)]
pub struct ConfigOption {
    pub name: String,
    pub default: Option<Value>,
    pub missing: MissingPolicy,
    pub checker: Option<ValueChecker>,
    pub constructor: Option<ValueMapper>,
}

impl ConfigOption {
    /// An option without a default: construction fails if the configuration
    /// does not provide a value.
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            missing: MissingPolicy::Error,
            checker: None,
            constructor: None,
        }
    }

    /// An option with a default value, used silently when missing.
    pub fn with_default(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
            missing: MissingPolicy::Silent,
            checker: None,
            constructor: None,
        }
    }

    /// Overrides the log level used when the default kicks in.
    pub fn missing(mut self, policy: MissingPolicy) -> Self {
        self.missing = policy;
        self
    }

    pub fn checker(mut self, checker: ValueChecker) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn constructor(mut self, constructor: ValueMapper) -> Self {
        self.constructor = Some(constructor);
        self
    }
}

/// Declaration of a persisted status variable.
#[derive(Debug, Clone)]
pub struct StatusVar {
    pub name: String,
    pub default: Value,
    pub representer: Option<ValueMapper>,
    pub constructor: Option<ValueMapper>,
}

impl StatusVar {
    pub fn new(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            default: default.into(),
            representer: None,
            constructor: None,
        }
    }

    /// Converts the runtime value into its on-disk representation.
    pub fn representer(mut self, representer: ValueMapper) -> Self {
        self.representer = Some(representer);
        self
    }

    /// Converts the loaded (or default) value into the runtime value.
    pub fn constructor(mut self, constructor: ValueMapper) -> Self {
        self.constructor = Some(constructor);
        self
    }
}

/// Declaration of a typed inter-module connector.
#[derive(Debug, Clone)]
pub struct Connector {
    pub name: String,
    pub interface: String,
    pub optional: bool,
}

impl Connector {
    pub fn new(name: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interface: interface.into(),
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Complete class-level declaration of a module implementation.
#[derive(Debug, Clone, Default)]
pub struct ModuleDecl {
    pub options: Vec<ConfigOption>,
    pub status_vars: Vec<StatusVar>,
    pub connectors: Vec<Connector>,
    /// Interface identifiers this class satisfies, checked by connectors.
    pub interfaces: Vec<String>,
    /// Overrides the kind-derived threading default.
    pub threaded: Option<bool>,
}

impl ModuleDecl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn option(mut self, option: ConfigOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn status_var(mut self, var: StatusVar) -> Self {
        self.status_vars.push(var);
        self
    }

    pub fn connector(mut self, connector: Connector) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn interface(mut self, name: impl Into<String>) -> Self {
        self.interfaces.push(name.into());
        self
    }

    pub fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = Some(threaded);
        self
    }

    pub fn find_connector(&self, name: &str) -> Option<&Connector> {
        self.connectors.iter().find(|c| c.name == name)
    }
}

/// Materialized configuration options. Values are set exactly once, at
/// construction, and frozen afterwards.
#[derive(Debug)]
pub struct OptionStore {
    module: String,
    values: IndexMap<String, Value>,
}

impl OptionStore {
    /// Resolves each declared option against the configured `options`
    /// mapping: configured value, else the declared default (logged at the
    /// declared level), else a descriptor error.
    pub fn materialize(
        module: &str,
        declared: &[ConfigOption],
        configured: &IndexMap<String, Value>,
    ) -> Result<Self> {
        let mut values = IndexMap::with_capacity(declared.len());
        for option in declared {
            let raw = match configured.get(&option.name) {
                Some(value) => value.clone(),
                None => match &option.default {
                    Some(default) => {
                        match option.missing {
                            MissingPolicy::Silent => {}
                            MissingPolicy::Info => info!(
                                module,
                                option = %option.name,
                                "option not configured, using default"
                            ),
                            MissingPolicy::Warn | MissingPolicy::Error => warn!(
                                module,
                                option = %option.name,
                                "option not configured, using default"
                            ),
                        }
                        default.clone()
                    }
                    None => {
                        return Err(CoreError::Descriptor {
                            module: module.to_string(),
                            problem: format!(
                                "required option '{}' missing from configuration",
                                option.name
                            ),
                        })
                    }
                },
            };
            let value = match option.constructor {
                Some(constructor) => constructor(raw).map_err(|reason| CoreError::Descriptor {
                    module: module.to_string(),
                    problem: format!("constructor for option '{}' failed: {reason}", option.name),
                })?,
                None => raw,
            };
            if let Some(checker) = option.checker {
                if !checker(&value) {
                    return Err(CoreError::Descriptor {
                        module: module.to_string(),
                        problem: format!("value for option '{}' rejected by checker", option.name),
                    });
                }
            }
            values.insert(option.name.clone(), value);
        }
        Ok(Self {
            module: module.to_string(),
            values,
        })
    }

    pub fn get(&self, name: &str) -> Result<&Value> {
        self.values.get(name).ok_or_else(|| CoreError::UnknownMember {
            module: self.module.clone(),
            kind: "option",
            name: name.to_string(),
        })
    }

    /// Options are immutable for the lifetime of the instance; every write
    /// attempt fails.
    pub fn set(&mut self, name: &str, _value: Value) -> Result<()> {
        Err(CoreError::OptionFrozen {
            module: self.module.clone(),
            option: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }
}

struct StatusEntry {
    value: Value,
    representer: Option<ValueMapper>,
}

/// Materialized status variables: normal mutable state at runtime, persisted
/// to the module's app-state file on every deactivation.
pub struct StatusStore {
    module: String,
    entries: IndexMap<String, StatusEntry>,
}

impl StatusStore {
    /// Loads declared variables from `file`. A missing or unreadable file
    /// falls back to the declared defaults with a warning; individual
    /// variables absent from the document fall back silently.
    pub fn load(module: &str, declared: &[StatusVar], file: &Path) -> Self {
        let stored: IndexMap<String, Value> = if file.is_file() {
            match yaml::load(file) {
                Ok(values) => values,
                Err(err) => {
                    warn!(module, file = %file.display(), %err, "app status unreadable, using defaults");
                    IndexMap::new()
                }
            }
        } else {
            warn!(module, file = %file.display(), "no app status found, using defaults");
            IndexMap::new()
        };

        let mut entries = IndexMap::with_capacity(declared.len());
        for var in declared {
            let raw = stored.get(&var.name).cloned().unwrap_or_else(|| var.default.clone());
            let value = match var.constructor {
                Some(constructor) => match constructor(raw) {
                    Ok(value) => value,
                    Err(reason) => {
                        warn!(
                            module,
                            status_var = %var.name,
                            reason = %reason,
                            "status constructor failed, using default"
                        );
                        var.default.clone()
                    }
                },
                None => raw,
            };
            entries.insert(
                var.name.clone(),
                StatusEntry {
                    value,
                    representer: var.representer,
                },
            );
        }
        Self {
            module: module.to_string(),
            entries,
        }
    }

    /// Serializes all variables to `file` atomically. A failing representer
    /// drops the affected variable with a warning; the dump proceeds.
    pub fn dump(&self, file: &Path) -> Result<()> {
        let mut document = IndexMap::with_capacity(self.entries.len());
        for (name, entry) in &self.entries {
            let value = match entry.representer {
                Some(representer) => match representer(entry.value.clone()) {
                    Ok(value) => value,
                    Err(reason) => {
                        warn!(
                            module = %self.module,
                            status_var = %name,
                            reason = %reason,
                            "status representer failed, dropping variable from dump"
                        );
                        continue;
                    }
                },
                None => entry.value.clone(),
            };
            document.insert(name.clone(), value);
        }
        yaml::atomic_dump(&document, file)
    }

    pub fn get(&self, name: &str) -> Result<Value> {
        self.entries
            .get(name)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| CoreError::UnknownMember {
                module: self.module.clone(),
                kind: "status variable",
                name: name.to_string(),
            })
    }

    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        match self.entries.get_mut(name) {
            Some(entry) => {
                entry.value = value;
                Ok(())
            }
            None => Err(CoreError::UnknownMember {
                module: self.module.clone(),
                kind: "status variable",
                name: name.to_string(),
            }),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

/// Materialized connectors: declaration plus the proxy bound at activation.
pub struct ConnectorStore {
    module: String,
    bindings: IndexMap<String, ConnectorProxy>,
}

impl ConnectorStore {
    pub fn new(module: &str, bindings: IndexMap<String, ConnectorProxy>) -> Self {
        Self {
            module: module.to_string(),
            bindings,
        }
    }

    pub fn get(&self, name: &str) -> Result<&ConnectorProxy> {
        self.bindings.get(name).ok_or_else(|| CoreError::UnknownMember {
            module: self.module.clone(),
            kind: "connector",
            name: name.to_string(),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.bindings.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn positive(value: &Value) -> bool {
        value.as_f64().map(|v| v > 0.0) == Some(true)
    }

    fn doubled(value: Value) -> Result<Value, String> {
        let v = value.as_f64().ok_or("not a number")?;
        Ok(Value::from(v * 2.0))
    }

    #[test]
    fn configured_option_wins_over_default() {
        let declared = vec![ConfigOption::with_default("exposure_ms", 10.0)];
        let mut configured = IndexMap::new();
        configured.insert("exposure_ms".to_string(), Value::from(25.0));
        let store = OptionStore::materialize("cam", &declared, &configured).unwrap();
        assert_eq!(store.get("exposure_ms").unwrap(), &Value::from(25.0));
    }

    #[test]
    fn missing_required_option_fails_construction() {
        let declared = vec![ConfigOption::required("serial_port")];
        let err = OptionStore::materialize("stage", &declared, &IndexMap::new()).unwrap_err();
        assert!(matches!(err, CoreError::Descriptor { .. }));
        assert!(err.to_string().contains("serial_port"));
    }

    #[test]
    fn checker_rejects_bad_value() {
        let declared = vec![ConfigOption::with_default("exposure_ms", 10.0).checker(positive)];
        let mut configured = IndexMap::new();
        configured.insert("exposure_ms".to_string(), Value::from(-4.0));
        assert!(OptionStore::materialize("cam", &declared, &configured).is_err());
    }

    #[test]
    fn constructor_transforms_raw_value() {
        let declared = vec![ConfigOption::with_default("gain", 2.0).constructor(doubled)];
        let store = OptionStore::materialize("cam", &declared, &IndexMap::new()).unwrap();
        assert_eq!(store.get("gain").unwrap(), &Value::from(4.0));
    }

    #[test]
    fn options_are_frozen_after_construction() {
        let declared = vec![ConfigOption::with_default("gain", 1.0)];
        let mut store = OptionStore::materialize("cam", &declared, &IndexMap::new()).unwrap();
        let err = store.set("gain", Value::from(3.0)).unwrap_err();
        assert!(matches!(err, CoreError::OptionFrozen { .. }));
        assert_eq!(store.get("gain").unwrap(), &Value::from(1.0));
    }

    #[test]
    fn status_roundtrip_through_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("counter.status.yml");
        let declared = vec![StatusVar::new("count", 0)];

        let mut store = StatusStore::load("counter", &declared, &file);
        assert_eq!(store.get("count").unwrap(), Value::from(0));
        store.set("count", Value::from(7)).unwrap();
        store.dump(&file).unwrap();

        let reloaded = StatusStore::load("counter", &declared, &file);
        assert_eq!(reloaded.get("count").unwrap(), Value::from(7));
    }

    #[test]
    fn deleted_status_file_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("counter.status.yml");
        let declared = vec![StatusVar::new("count", 0)];

        let mut store = StatusStore::load("counter", &declared, &file);
        store.set("count", Value::from(7)).unwrap();
        store.dump(&file).unwrap();
        std::fs::remove_file(&file).unwrap();

        let reloaded = StatusStore::load("counter", &declared, &file);
        assert_eq!(reloaded.get("count").unwrap(), Value::from(0));
    }

    #[test]
    fn failing_representer_drops_only_that_variable() {
        fn always_fails(_: Value) -> Result<Value, String> {
            Err("unrepresentable".into())
        }
        let dir = tempdir().unwrap();
        let file = dir.path().join("scan.status.yml");
        let declared = vec![
            StatusVar::new("points", 100).representer(always_fails),
            StatusVar::new("label", "idle"),
        ];
        let store = StatusStore::load("scan", &declared, &file);
        store.dump(&file).unwrap();

        let document: IndexMap<String, Value> = yaml::load(&file).unwrap();
        assert!(!document.contains_key("points"));
        assert_eq!(document["label"], Value::from("idle"));
    }

    #[test]
    fn representer_and_constructor_roundtrip() {
        fn halve(value: Value) -> Result<Value, String> {
            Ok(Value::from(value.as_f64().ok_or("not a number")? / 2.0))
        }
        let dir = tempdir().unwrap();
        let file = dir.path().join("cam.status.yml");
        let declared = vec![StatusVar::new("gain", 8.0).representer(halve).constructor(doubled)];

        // First load applies the constructor to the default.
        let store = StatusStore::load("cam", &declared, &file);
        assert_eq!(store.get("gain").unwrap(), Value::from(16.0));
        store.dump(&file).unwrap();

        // constructor(representer(v)) is value-equal to v
        let reloaded = StatusStore::load("cam", &declared, &file);
        assert_eq!(reloaded.get("gain").unwrap(), Value::from(16.0));
    }
}
