//! Orderly teardown: everything deactivates top-down, workers join, status
//! files land on disk.

mod common;

use common::{TestHost, LAB_CONFIG};
use labhost::manager::ManagerEvent;
use labhost::module::ModuleState;
use labhost::proxy::ModulePort;
use labhost::yaml::Value;

#[test]
fn deactivate_all_reaches_every_module_dependents_first() {
    let host = TestHost::from_yaml(LAB_CONFIG);
    host.manager.activate("counter").unwrap();
    host.manager.activate("scan").unwrap();

    let events = host.manager.subscribe();
    host.manager.deactivate_all();

    for row in host.manager.snapshot() {
        assert_eq!(row.state, ModuleState::Deactivated, "{} still up", row.name);
    }

    let order: Vec<String> = events
        .try_iter()
        .filter_map(|event| match event {
            ManagerEvent::ModuleStateChanged {
                name,
                state: ModuleState::Deactivated,
            } => Some(name),
            _ => None,
        })
        .collect();
    let position = |name: &str| order.iter().position(|n| n == name).unwrap();
    assert!(position("counter") < position("switchboard"));
    assert!(position("scan") < position("cam"));
}

#[test]
fn workers_are_joined_after_shutdown() {
    let host = TestHost::from_yaml(LAB_CONFIG);
    host.manager.activate("counter").unwrap();
    host.manager.activate("scan").unwrap();
    assert!(host.threads.contains("mod-logic-counter"));
    assert!(host.threads.contains("mod-logic-scan"));

    host.manager.deactivate_all();
    assert!(!host.threads.contains("mod-logic-counter"));
    assert!(!host.threads.contains("mod-logic-scan"));

    host.threads.shutdown();
    assert!(host.threads.names().is_empty());
}

#[test]
fn shutdown_persists_pending_status() {
    let host = TestHost::from_yaml(LAB_CONFIG);
    host.manager.activate("counter").unwrap();
    host.manager
        .port("counter")
        .unwrap()
        .call("increment", vec![Value::from(41)])
        .unwrap();

    host.manager.deactivate_all();

    // A fresh activation sees the value written before shutdown.
    host.manager.activate("counter").unwrap();
    let count = host
        .manager
        .port("counter")
        .unwrap()
        .call("count", Vec::new())
        .unwrap();
    assert_eq!(count, Value::from(41));
}

#[test]
fn deactivate_all_is_safe_with_nothing_active() {
    let host = TestHost::from_yaml(LAB_CONFIG);
    host.manager.deactivate_all();
    for row in host.manager.snapshot() {
        assert_eq!(row.state, ModuleState::Deactivated);
    }
}
