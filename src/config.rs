//! Configuration loading, validation and round-tripping.
//!
//! The host reads a single YAML document (conventionally `*.cfg`) with a
//! `global` section and one mapping per module kind (`gui`, `logic`,
//! `hardware`). Validation is strict about required fields and structural
//! rules but permissive about additive user keys, which are preserved across
//! a load/dump cycle.
//!
//! Every entry point round-trips through [`Config::validate_value`]; a
//! rejected document produces a structured list of `{path, reason}` issues
//! instead of the first serde error encountered.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigIssues, CoreError, Result};
use crate::module::ModuleKind;
use crate::validation::{is_valid_address, is_valid_identifier, is_valid_port};
use crate::yaml::{self, Value};

/// Listener settings for the remote module server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certfile: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<PathBuf>,
}

/// The `global` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub startup_modules: Vec<String>,
    pub remote_modules_server: Option<RemoteServerConfig>,
    pub namespace_server_port: u16,
    pub force_remote_calls_by_value: bool,
    pub hide_manager_window: bool,
    pub stylesheet: String,
    pub default_data_dir: Option<PathBuf>,
    pub daily_data_dirs: bool,
    pub extension_paths: Vec<PathBuf>,
    /// Additive user keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            startup_modules: Vec::new(),
            remote_modules_server: None,
            namespace_server_port: 18861,
            force_remote_calls_by_value: true,
            hide_manager_window: false,
            stylesheet: "qdark.qss".to_string(),
            default_data_dir: None,
            daily_data_dirs: true,
            extension_paths: Vec::new(),
            extra: IndexMap::new(),
        }
    }
}

/// Declaration of a module hosted by this instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalModuleConfig {
    /// Opaque dotted locator resolved by the module registry.
    #[serde(rename = "module.Class")]
    pub class: String,
    #[serde(default)]
    pub allow_remote: bool,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub options: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub connect: IndexMap<String, String>,
    /// Additive user keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

/// Declaration of a module served by a peer instance. `options` and
/// `connect` belong to the serving side and are rejected here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteModuleConfig {
    pub native_module_name: String,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certfile: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<PathBuf>,
}

/// A module entry under `gui`/`logic`/`hardware`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModuleConfig {
    Remote(RemoteModuleConfig),
    Local(LocalModuleConfig),
}

impl ModuleConfig {
    pub fn is_remote(&self) -> bool {
        matches!(self, ModuleConfig::Remote(_))
    }

    pub fn as_local(&self) -> Option<&LocalModuleConfig> {
        match self {
            ModuleConfig::Local(local) => Some(local),
            ModuleConfig::Remote(_) => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteModuleConfig> {
        match self {
            ModuleConfig::Remote(remote) => Some(remote),
            ModuleConfig::Local(_) => None,
        }
    }
}

/// Validated host configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: GlobalConfig,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub gui: IndexMap<String, ModuleConfig>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub logic: IndexMap<String, ModuleConfig>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub hardware: IndexMap<String, ModuleConfig>,
    /// Unknown top-level sections, preserved verbatim.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            let mut issues = ConfigIssues::default();
            issues.push(path.display().to_string(), format!("cannot read file: {err}"));
            CoreError::Validation(issues)
        })?;
        let raw: Value = serde_yaml::from_str(&text).map_err(|err| {
            let mut issues = ConfigIssues::default();
            issues.push(path.display().to_string(), format!("invalid YAML: {err}"));
            CoreError::Validation(issues)
        })?;
        Self::validate_value(raw)
    }

    /// Validates and dumps the configuration to a file, atomically.
    pub fn dump(&self, path: &Path) -> Result<()> {
        // Round-trip through validation so a programmatically built config
        // cannot write a document that would be rejected on the next load.
        let revalidated = Self::validate_value(serde_yaml::to_value(self)?)?;
        yaml::atomic_dump(&revalidated, path)
    }

    /// Validates a raw YAML document into a [`Config`], reporting all
    /// problems found instead of stopping at the first.
    pub fn validate_value(raw: Value) -> Result<Self> {
        let config: Config = serde_yaml::from_value(raw).map_err(|err| {
            let mut issues = ConfigIssues::default();
            issues.push("<document>", err.to_string());
            CoreError::Validation(issues)
        })?;
        let issues = config.check();
        if issues.is_empty() {
            Ok(config)
        } else {
            Err(CoreError::Validation(issues))
        }
    }

    fn check(&self) -> ConfigIssues {
        let mut issues = ConfigIssues::default();

        if let Some(server) = &self.global.remote_modules_server {
            let prefix = "global.remote_modules_server";
            if let Err(reason) = is_valid_address(&server.address) {
                issues.push(format!("{prefix}.address"), reason);
            }
            if let Err(reason) = is_valid_port(server.port) {
                issues.push(format!("{prefix}.port"), reason);
            }
            match (&server.certfile, &server.keyfile) {
                (Some(_), None) => issues.push(
                    format!("{prefix}.keyfile"),
                    "certfile given without matching keyfile",
                ),
                (None, Some(_)) => issues.push(
                    format!("{prefix}.certfile"),
                    "keyfile given without matching certfile",
                ),
                _ => {}
            }
        }
        if let Err(reason) = is_valid_port(self.global.namespace_server_port) {
            issues.push("global.namespace_server_port", reason);
        }

        // Names are process-wide unique across kinds. Sections are scanned in
        // declaration order so the issue points at the later occurrence.
        let mut seen: IndexMap<&str, ModuleKind> = IndexMap::new();
        for (kind, section) in self.sections() {
            for (name, module) in section {
                let path = format!("{kind}.{name}");
                if let Err(reason) = is_valid_identifier(name) {
                    issues.push(&path, reason);
                }
                if let Some(first_kind) = seen.get(name.as_str()) {
                    issues.push(&path, format!("name '{name}' already defined under {first_kind}"));
                } else {
                    seen.insert(name.as_str(), kind);
                }
                match module {
                    ModuleConfig::Local(local) => {
                        if local.class.is_empty() {
                            issues.push(format!("{path}.module.Class"), "locator cannot be empty");
                        }
                    }
                    ModuleConfig::Remote(remote) => {
                        if let Err(reason) = is_valid_address(&remote.address) {
                            issues.push(format!("{path}.address"), reason);
                        }
                        if let Err(reason) = is_valid_port(remote.port) {
                            issues.push(format!("{path}.port"), reason);
                        }
                        if let Err(reason) = is_valid_identifier(&remote.native_module_name) {
                            issues.push(format!("{path}.native_module_name"), reason);
                        }
                    }
                }
            }
        }

        for (idx, name) in self.global.startup_modules.iter().enumerate() {
            if !seen.contains_key(name.as_str()) {
                issues.push(
                    format!("global.startup_modules[{idx}]"),
                    format!("unknown module '{name}'"),
                );
            }
        }

        issues
    }

    /// Sections in the order duplicates are reported: gui, logic, hardware.
    fn sections(&self) -> [(ModuleKind, &IndexMap<String, ModuleConfig>); 3] {
        [
            (ModuleKind::Gui, &self.gui),
            (ModuleKind::Logic, &self.logic),
            (ModuleKind::Hardware, &self.hardware),
        ]
    }

    /// Declared modules in activation tie-break order: hardware first, then
    /// logic, then gui, declaration order within each kind.
    pub fn declared(&self) -> impl Iterator<Item = (ModuleKind, &String, &ModuleConfig)> {
        self.hardware
            .iter()
            .map(|(name, module)| (ModuleKind::Hardware, name, module))
            .chain(
                self.logic
                    .iter()
                    .map(|(name, module)| (ModuleKind::Logic, name, module)),
            )
            .chain(
                self.gui
                    .iter()
                    .map(|(name, module)| (ModuleKind::Gui, name, module)),
            )
    }

    /// Looks up a module declaration by name across all kinds.
    pub fn module(&self, name: &str) -> Option<(ModuleKind, &ModuleConfig)> {
        self.declared()
            .find(|(_, declared, _)| declared.as_str() == name)
            .map(|(kind, _, module)| (kind, module))
    }

    fn section_mut(&mut self, kind: ModuleKind) -> &mut IndexMap<String, ModuleConfig> {
        match kind {
            ModuleKind::Gui => &mut self.gui,
            ModuleKind::Logic => &mut self.logic,
            ModuleKind::Hardware => &mut self.hardware,
        }
    }

    /// Inserts or replaces a module declaration. Used by programmatic
    /// construction, mostly in tests and the config editor surface.
    pub fn set_module(&mut self, kind: ModuleKind, name: impl Into<String>, module: ModuleConfig) {
        self.section_mut(kind).insert(name.into(), module);
    }

    /// Removes a module declaration by name, whichever kind it lives under.
    pub fn remove_module(&mut self, name: &str) -> Option<(ModuleKind, ModuleConfig)> {
        for kind in [ModuleKind::Gui, ModuleKind::Logic, ModuleKind::Hardware] {
            if let Some(module) = self.section_mut(kind).shift_remove(name) {
                return Some((kind, module));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"
global:
  startup_modules: [counter]
  remote_modules_server:
    address: 127.0.0.1
    port: 12345

hardware:
  switchboard:
    module.Class: labhost.hardware.switchboard.SwitchBoard
    allow_remote: true
    options:
      channels: 4

logic:
  counter:
    module.Class: labhost.logic.counter.CounterLogic
    connect:
      switch: switchboard
"#
    }

    #[test]
    fn parses_and_validates_sample() {
        let raw: Value = serde_yaml::from_str(sample()).unwrap();
        let config = Config::validate_value(raw).unwrap();
        assert_eq!(config.global.startup_modules, vec!["counter"]);
        assert_eq!(config.global.namespace_server_port, 18861);
        assert!(config.global.force_remote_calls_by_value);
        let (kind, module) = config.module("switchboard").unwrap();
        assert_eq!(kind, ModuleKind::Hardware);
        assert!(module.as_local().unwrap().allow_remote);
    }

    #[test]
    fn duplicate_name_across_kinds_is_rejected() {
        let raw: Value = serde_yaml::from_str(
            r#"
logic:
  foo:
    module.Class: a.b.C
hardware:
  foo:
    module.Class: d.e.F
"#,
        )
        .unwrap();
        let err = Config::validate_value(raw).unwrap_err();
        let CoreError::Validation(issues) = err else {
            panic!("expected validation error");
        };
        let issue = issues.iter().find(|i| i.path == "hardware.foo").unwrap();
        assert!(issue.reason.contains("'foo' already defined under logic"));
    }

    #[test]
    fn remote_entry_with_options_is_rejected() {
        // `options` forces the entry down the local branch, which then lacks
        // a class locator.
        let raw: Value = serde_yaml::from_str(
            r#"
hardware:
  remote_cam:
    native_module_name: camera
    address: 10.0.0.5
    port: 12345
    options:
      exposure: 1.0
"#,
        )
        .unwrap();
        assert!(Config::validate_value(raw).is_err());
    }

    #[test]
    fn bad_identifier_is_rejected() {
        let raw: Value = serde_yaml::from_str(
            r#"
hardware:
  9lives:
    module.Class: a.b.C
"#,
        )
        .unwrap();
        let err = Config::validate_value(raw).unwrap_err();
        assert!(err.to_string().contains("9lives"));
    }

    #[test]
    fn unknown_startup_module_is_rejected() {
        let raw: Value = serde_yaml::from_str(
            r#"
global:
  startup_modules: [ghost]
"#,
        )
        .unwrap();
        let err = Config::validate_value(raw).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn unknown_keys_round_trip() {
        let raw: Value = serde_yaml::from_str(
            r#"
global:
  my_custom_flag: true
lab_notes:
  operator: R. Feynman
hardware:
  switchboard:
    module.Class: labhost.hardware.switchboard.SwitchBoard
    rack_position: B3
"#,
        )
        .unwrap();
        let config = Config::validate_value(raw).unwrap();
        assert_eq!(config.global.extra["my_custom_flag"], Value::from(true));
        assert_eq!(
            config.extra["lab_notes"]["operator"],
            Value::from("R. Feynman")
        );
        let local = config.module("switchboard").unwrap().1.as_local().unwrap().clone();
        assert_eq!(local.extra["rack_position"], Value::from("B3"));

        // load(dump(cfg)) == cfg including the additive keys
        let dumped = serde_yaml::to_value(&config).unwrap();
        let reparsed = Config::validate_value(dumped).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn dump_and_reload_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.cfg");
        let raw: Value = serde_yaml::from_str(sample()).unwrap();
        let config = Config::validate_value(raw).unwrap();
        config.dump(&path).unwrap();
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn declared_order_is_hardware_logic_gui() {
        let raw: Value = serde_yaml::from_str(sample()).unwrap();
        let config = Config::validate_value(raw).unwrap();
        let names: Vec<_> = config.declared().map(|(_, name, _)| name.clone()).collect();
        assert_eq!(names, vec!["switchboard", "counter"]);
    }

    #[test]
    fn set_and_remove_module() {
        let mut config = Config::default();
        config.set_module(
            ModuleKind::Hardware,
            "cam",
            ModuleConfig::Local(LocalModuleConfig {
                class: "labhost.hardware.dummy_camera.DummyCamera".into(),
                allow_remote: false,
                options: IndexMap::new(),
                connect: IndexMap::new(),
                extra: IndexMap::new(),
            }),
        );
        assert!(config.module("cam").is_some());
        let (kind, _) = config.remove_module("cam").unwrap();
        assert_eq!(kind, ModuleKind::Hardware);
        assert!(config.module("cam").is_none());
    }
}
