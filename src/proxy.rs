//! Capability proxies handed out through bound connectors.
//!
//! A [`ModulePort`] is the uniform surface over a module living in this
//! process (dispatched to its worker through the manager) or on a peer
//! instance (round-tripped over the remote protocol). Connector code cannot
//! tell the two apart. Ports never own their target; the target is resolved
//! on each use, so a module can be swapped or deactivated without dangling
//! references.

use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::module::ModuleState;
use crate::yaml::Value;

/// Uniform dispatch surface over a target module.
pub trait ModulePort: Send + Sync {
    /// Configured name of the target module.
    fn target(&self) -> &str;

    /// Interface identifiers declared by the target's class.
    fn interfaces(&self) -> Result<Vec<String>>;

    /// Current lifecycle state of the target.
    fn state(&self) -> Result<ModuleState>;

    /// Invokes a method on the target, on the target's owning worker.
    fn call(&self, method: &str, args: Vec<Value>) -> Result<Value>;

    /// Reads an attribute of the target.
    fn read_attr(&self, name: &str) -> Result<Value>;

    /// Writes an attribute of the target.
    fn write_attr(&self, name: &str, value: Value) -> Result<()>;
}

/// The object a module sees when it accesses one of its connectors.
///
/// Bound proxies forward to the port; an optional connector without a
/// configured target yields an unbound proxy whose every use fails with
/// [`CoreError::UnboundConnector`].
pub struct ConnectorProxy {
    connector: String,
    interface: String,
    port: Option<Arc<dyn ModulePort>>,
}

impl ConnectorProxy {
    pub fn bound(
        connector: impl Into<String>,
        interface: impl Into<String>,
        port: Arc<dyn ModulePort>,
    ) -> Self {
        Self {
            connector: connector.into(),
            interface: interface.into(),
            port: Some(port),
        }
    }

    pub fn unbound(connector: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            interface: interface.into(),
            port: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.port.is_some()
    }

    pub fn connector_name(&self) -> &str {
        &self.connector
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn port(&self) -> Result<&Arc<dyn ModulePort>> {
        self.port.as_ref().ok_or_else(|| CoreError::UnboundConnector {
            connector: self.connector.clone(),
            interface: self.interface.clone(),
        })
    }

    /// Name of the connected module.
    pub fn target(&self) -> Result<&str> {
        Ok(self.port()?.target())
    }

    pub fn state(&self) -> Result<ModuleState> {
        self.port()?.state()
    }

    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.port()?.call(method, args)
    }

    pub fn read_attr(&self, name: &str) -> Result<Value> {
        self.port()?.read_attr(name)
    }

    pub fn write_attr(&self, name: &str, value: Value) -> Result<()> {
        self.port()?.write_attr(name, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct EchoPort {
        log: Mutex<Vec<String>>,
    }

    impl ModulePort for EchoPort {
        fn target(&self) -> &str {
            "echo"
        }

        fn interfaces(&self) -> Result<Vec<String>> {
            Ok(vec!["echo".into()])
        }

        fn state(&self) -> Result<ModuleState> {
            Ok(ModuleState::Idle)
        }

        fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
            self.log.lock().unwrap().push(method.to_string());
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        }

        fn read_attr(&self, name: &str) -> Result<Value> {
            Ok(Value::from(name))
        }

        fn write_attr(&self, _name: &str, _value: Value) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn bound_proxy_forwards() {
        let port = Arc::new(EchoPort {
            log: Mutex::new(Vec::new()),
        });
        let proxy = ConnectorProxy::bound("camera", "camera", port.clone());
        assert!(proxy.is_bound());
        assert_eq!(proxy.target().unwrap(), "echo");
        let result = proxy.call("ping", vec![Value::from(1)]).unwrap();
        assert_eq!(result, Value::from(1));
        assert_eq!(port.log.lock().unwrap().as_slice(), ["ping"]);
    }

    #[test]
    fn unbound_proxy_fails_every_use() {
        let proxy = ConnectorProxy::unbound("camera", "camera");
        assert!(!proxy.is_bound());
        for err in [
            proxy.call("ping", Vec::new()).unwrap_err(),
            proxy.read_attr("exposure").unwrap_err(),
            proxy.write_attr("exposure", Value::from(1)).unwrap_err(),
            proxy.state().unwrap_err(),
        ] {
            assert!(matches!(err, CoreError::UnboundConnector { .. }));
        }
    }
}
