//! Module class registry.
//!
//! Configuration entries refer to their implementation through an opaque
//! dotted locator (`module.Class`). The registry maps locators to a
//! [`ModuleClass`]: the class-level declaration plus a factory producing
//! fresh instances. A locator that resolves to nothing turns the module into
//! a broken row in the manager snapshot instead of crashing the host.

use std::collections::HashMap;

use crate::error::{CoreError, Result};
use crate::meta::ModuleDecl;
use crate::module::Module;

/// Factory producing a fresh, unconfigured module instance.
pub type ModuleFactory = fn() -> Box<dyn Module>;

/// A constructible module class: declaration plus factory.
#[derive(Debug, Clone)]
pub struct ModuleClass {
    pub decl: ModuleDecl,
    pub construct: ModuleFactory,
}

impl ModuleClass {
    pub fn new(decl: ModuleDecl, construct: ModuleFactory) -> Self {
        Self { decl, construct }
    }
}

/// Locator → class table. Populated once at startup; the manager resolves
/// through a shared reference.
#[derive(Default)]
pub struct ModuleRegistry {
    classes: HashMap<String, ModuleClass>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class under its locator, replacing any previous entry.
    pub fn register(&mut self, locator: impl Into<String>, class: ModuleClass) {
        self.classes.insert(locator.into(), class);
    }

    pub fn resolve(&self, locator: &str) -> Result<&ModuleClass> {
        self.classes.get(locator).ok_or_else(|| CoreError::Resolution {
            locator: locator.to_string(),
            reason: "no such class registered".to_string(),
        })
    }

    pub fn contains(&self, locator: &str) -> bool {
        self.classes.contains_key(locator)
    }

    pub fn locators(&self) -> impl Iterator<Item = &String> {
        self.classes.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleContext;

    struct Noop;

    impl Module for Noop {
        fn on_activate(&mut self, _ctx: &mut ModuleContext) -> Result<()> {
            Ok(())
        }

        fn on_deactivate(&mut self, _ctx: &mut ModuleContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn resolves_registered_class() {
        let mut registry = ModuleRegistry::new();
        registry.register(
            "labhost.hardware.noop.Noop",
            ModuleClass::new(ModuleDecl::new().interface("noop"), || Box::new(Noop)),
        );
        let class = registry.resolve("labhost.hardware.noop.Noop").unwrap();
        assert_eq!(class.decl.interfaces, vec!["noop"]);
    }

    #[test]
    fn unknown_locator_is_a_resolution_error() {
        let registry = ModuleRegistry::new();
        let err = registry.resolve("labhost.gui.missing.Widget").unwrap_err();
        assert!(matches!(err, CoreError::Resolution { .. }));
    }
}
