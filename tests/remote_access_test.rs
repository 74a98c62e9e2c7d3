//! Remote module channel: acquire/release semantics, the shared-exporter
//! policy, call-by-value behaviour and handle invalidation.

mod common;

use std::time::Duration;

use common::TestHost;
use labhost::config::{Config, RemoteServerConfig};
use labhost::error::CoreError;
use labhost::meta::ModuleDecl;
use labhost::module::{Module, ModuleContext, ModuleKind, ModuleState};
use labhost::modules::default_registry;
use labhost::proxy::ModulePort;
use labhost::registry::ModuleClass;
use labhost::remote::client::RemoteModuleClient;
use labhost::remote::server::RemoteModuleServer;
use labhost::yaml::{as_f64_array, f64_array, Value};
use labhost::Result;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Server host with the lab layout, listening on an ephemeral port.
fn lab_server() -> (TestHost, RemoteModuleServer, u16) {
    let host = TestHost::from_yaml(common::LAB_CONFIG);
    let server = RemoteModuleServer::new(
        host.manager.clone(),
        &RemoteServerConfig {
            address: "127.0.0.1".to_string(),
            port: 0,
            certfile: None,
            keyfile: None,
        },
    )
    .unwrap();
    server.start().unwrap();
    let port = server.local_addr().unwrap().port();
    (host, server, port)
}

#[test]
fn list_remotable_only_names_shared_modules() {
    let (_host, _server, port) = lab_server();
    let client = RemoteModuleClient::connect("127.0.0.1", port, None, CLIENT_TIMEOUT).unwrap();
    assert_eq!(client.list_remotable().unwrap(), vec!["switchboard"]);
}

#[test]
fn acquire_activates_module_and_release_deactivates_it() {
    let (host, _server, port) = lab_server();
    let client = RemoteModuleClient::connect("127.0.0.1", port, None, CLIENT_TIMEOUT).unwrap();

    let port_handle = client.acquire("switchboard").unwrap();
    assert_eq!(host.manager.state_of("switchboard").unwrap(), ModuleState::Idle);

    port_handle
        .call("set_state", vec![Value::from("shutter"), Value::Bool(true)])
        .unwrap();
    assert_eq!(
        port_handle.call("get_state", vec![Value::from("shutter")]).unwrap(),
        Value::Bool(true)
    );

    client.release(port_handle.handle()).unwrap();
    // No local user held the module: the last remote user takes it down.
    assert_eq!(
        host.manager.state_of("switchboard").unwrap(),
        ModuleState::Deactivated
    );
}

#[test]
fn module_held_locally_survives_remote_release() {
    let (host, _server, port) = lab_server();
    host.manager.activate("switchboard").unwrap();

    let client = RemoteModuleClient::connect("127.0.0.1", port, None, CLIENT_TIMEOUT).unwrap();
    let port_handle = client.acquire("switchboard").unwrap();
    client.release(port_handle.handle()).unwrap();

    assert_eq!(host.manager.state_of("switchboard").unwrap(), ModuleState::Idle);
}

#[test]
fn disconnect_releases_every_acquired_handle() {
    let (host, _server, port) = lab_server();
    {
        let client = RemoteModuleClient::connect("127.0.0.1", port, None, CLIENT_TIMEOUT).unwrap();
        let _handle = client.acquire("switchboard").unwrap();
        assert_eq!(host.manager.state_of("switchboard").unwrap(), ModuleState::Idle);
        // Client dropped without releasing: the connection close cleans up.
    }
    // Server-side cleanup runs on the connection thread; give it a moment.
    for _ in 0..50 {
        if host.manager.state_of("switchboard").unwrap() == ModuleState::Deactivated {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(
        host.manager.state_of("switchboard").unwrap(),
        ModuleState::Deactivated
    );
}

#[test]
fn acquire_refuses_unshared_module_and_leaves_table_alone() {
    let (host, _server, port) = lab_server();
    let client = RemoteModuleClient::connect("127.0.0.1", port, None, CLIENT_TIMEOUT).unwrap();

    let err = client.acquire("cam").unwrap_err();
    match err {
        CoreError::Remote { class, message, .. } => {
            assert_eq!(class, "remote.NotRemotable");
            assert!(message.contains("cam"));
        }
        other => panic!("expected remote error, got {other}"),
    }
    assert_eq!(host.manager.state_of("cam").unwrap(), ModuleState::Deactivated);
}

#[test]
fn reload_invalidates_outstanding_handles() {
    let (host, _server, port) = lab_server();
    let client = RemoteModuleClient::connect("127.0.0.1", port, None, CLIENT_TIMEOUT).unwrap();
    let handle = client.acquire("switchboard").unwrap();

    host.manager.reload("switchboard", false).unwrap();

    let err = handle.call("get_state", vec![Value::from("shutter")]).unwrap_err();
    match err {
        CoreError::Remote { class, .. } => assert_eq!(class, "remote.StaleHandle"),
        other => panic!("expected stale handle, got {other}"),
    }
    // Re-acquire works and the module is back in service.
    let fresh = client.acquire("switchboard").unwrap();
    assert_eq!(
        fresh.call("get_state", vec![Value::from("shutter")]).unwrap(),
        Value::Bool(false)
    );
}

// --- call-by-value ---------------------------------------------------------

/// Doubles every sample in place on the server side and returns the result.
struct Doubler;

impl Module for Doubler {
    fn on_activate(&mut self, _ctx: &mut ModuleContext) -> Result<()> {
        Ok(())
    }

    fn on_deactivate(&mut self, _ctx: &mut ModuleContext) -> Result<()> {
        Ok(())
    }

    fn call(&mut self, ctx: &mut ModuleContext, method: &str, args: &[Value]) -> Result<Value> {
        match method {
            "double" => {
                let mut samples = args
                    .first()
                    .and_then(as_f64_array)
                    .ok_or_else(|| CoreError::Descriptor {
                        module: ctx.name().to_string(),
                        problem: "double expects a numeric array".to_string(),
                    })?;
                for sample in &mut samples {
                    *sample *= 2.0;
                }
                Ok(f64_array(&samples))
            }
            other => Err(CoreError::UnknownMember {
                module: ctx.name().to_string(),
                kind: "method",
                name: other.to_string(),
            }),
        }
    }
}

#[test]
fn remote_calls_pass_dense_arrays_by_value() {
    let mut registry = default_registry();
    registry.register(
        "labhost.logic.doubler.Doubler",
        ModuleClass::new(ModuleDecl::new().interface("doubler"), || Box::new(Doubler)),
    );
    let mut config = Config::default();
    config.set_module(
        ModuleKind::Logic,
        "doubler",
        serde_yaml::from_str("module.Class: labhost.logic.doubler.Doubler\nallow_remote: true\n")
            .unwrap(),
    );
    let host = TestHost::build(&config, registry);
    let server = RemoteModuleServer::new(
        host.manager.clone(),
        &RemoteServerConfig {
            address: "127.0.0.1".to_string(),
            port: 0,
            certfile: None,
            keyfile: None,
        },
    )
    .unwrap();
    server.start().unwrap();
    let port = server.local_addr().unwrap().port();

    let client = RemoteModuleClient::connect("127.0.0.1", port, None, CLIENT_TIMEOUT).unwrap();
    let handle = client.acquire("doubler").unwrap();

    // Large enough to take the binary fast path on both directions.
    let samples: Vec<f64> = (0..2048).map(f64::from).collect();
    let sent = f64_array(&samples);
    let result = handle.call("double", vec![sent.clone()]).unwrap();

    let doubled = as_f64_array(&result).unwrap();
    assert_eq!(doubled.len(), samples.len());
    assert_eq!(doubled[3], 6.0);
    // The server mutated its copy; the argument we hold is untouched.
    assert_eq!(as_f64_array(&sent).unwrap(), samples);
}

#[test]
fn transport_failure_breaks_the_proxy_until_reacquired() {
    // A listener that accepts one connection and hangs up immediately.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let accept = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        drop(stream);
    });

    let client = RemoteModuleClient::connect("127.0.0.1", port, None, CLIENT_TIMEOUT).unwrap();
    accept.join().unwrap();

    let first = client.list_remotable().unwrap_err();
    assert!(matches!(first, CoreError::Transport { .. }), "got {first}");
    assert!(client.is_broken());
    // Every later exchange is refused outright.
    let second = client.list_remotable().unwrap_err();
    assert!(matches!(second, CoreError::Transport { .. }), "got {second}");
}
