//! Registry lifecycle tests
//!
//! Start-up against an unreachable engine, a disabled repository and broken
//! scripts, plus the registry's reaction to later configuration changes.

use std::fs;
use std::sync::Arc;

use wpsr::config_store::{ConfigStore, JsonConfigStore};
use wpsr::engine::scripted::ScriptedConnector;
use wpsr::error::ErrorKind;
use wpsr::registry::RegistryState;
use wpsr::runtime::RuntimeContext;
use wpsr::types::{Inputs, Value};

const DEMO_ID: &str = "org.n52.wps.server.r.demo";

fn demo_script(title: &str) -> String {
    format!("# wps.des: demo, title = {};\n# wps.out: y, integer;\n", title)
}

fn setup() -> (tempfile::TempDir, Arc<JsonConfigStore>, Arc<ScriptedConnector>) {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("scripts")).unwrap();
    fs::write(dir.path().join("scripts/demo.R"), demo_script("First")).unwrap();
    let store = Arc::new(JsonConfigStore::new(dir.path().join("wpsr.json")));
    let connector = Arc::new(ScriptedConnector::new().with_script("demo.R", |ws| {
        ws.set("y", 7i64);
        true
    }));
    (dir, store, connector)
}

fn runtime(store: &Arc<JsonConfigStore>, connector: &Arc<ScriptedConnector>) -> RuntimeContext {
    RuntimeContext::builder()
        .store(store.clone())
        .connector(connector.clone())
        .build()
        .unwrap()
}

// =============================================================================
// Start-up
// =============================================================================

#[test]
fn test_unreachable_engine_starts_empty_without_reconciling() {
    let (_dir, store, connector) = setup();
    connector.set_reachable(false);
    let runtime = runtime(&store, &connector);

    assert_eq!(runtime.init().unwrap(), RegistryState::Inactive);
    assert!(runtime.algorithm_names().is_empty());
    assert!(!store.path().exists());

    let failure = runtime.invoke_report(DEMO_ID, &Inputs::new()).unwrap_err();
    assert_eq!(failure.kind, ErrorKind::NotFound);
}

#[test]
fn test_inactive_registry_ignores_later_changes() {
    let (_dir, store, connector) = setup();
    connector.set_reachable(false);
    let runtime = runtime(&store, &connector);
    runtime.init().unwrap();

    connector.set_reachable(true);
    store.notify_changed();
    runtime.handle_pending_events().unwrap();

    // The file is reconciled but nothing is registered until a restart
    assert!(store.path().exists());
    assert_eq!(runtime.state(), RegistryState::Inactive);
    assert!(runtime.algorithm_names().is_empty());
}

#[test]
fn test_disabled_repository_starts_inactive() {
    let (_dir, store, connector) = setup();
    let runtime = runtime(&store, &connector);
    runtime.reconcile().unwrap();

    let mut config = store.read_all().unwrap();
    config.active = false;
    store.write_all(&config).unwrap();

    let runtime = self::runtime(&store, &connector);
    assert_eq!(runtime.init().unwrap(), RegistryState::Inactive);
    assert!(runtime.algorithm_names().is_empty());
}

#[test]
fn test_broken_script_does_not_block_others() {
    let (dir, store, connector) = setup();
    // Parses, but declares an output without a type
    fs::write(dir.path().join("scripts/broken.R"), "# wps.des: broken;\n# wps.out: y;\n").unwrap();
    let runtime = runtime(&store, &connector);

    assert_eq!(runtime.init().unwrap(), RegistryState::Ready);
    assert_eq!(runtime.algorithm_names(), vec![DEMO_ID.to_string()]);
    let failure = runtime
        .invoke_report("org.n52.wps.server.r.broken", &Inputs::new())
        .unwrap_err();
    assert_eq!(failure.kind, ErrorKind::NotFound);
}

#[test]
fn test_init_twice_is_a_no_op() {
    let (_dir, store, connector) = setup();
    let runtime = runtime(&store, &connector);
    runtime.init().unwrap();
    let opened = connector.stats().opened;

    assert_eq!(runtime.init().unwrap(), RegistryState::Ready);
    assert_eq!(connector.stats().opened, opened);
}

// =============================================================================
// Configuration changes
// =============================================================================

#[test]
fn test_deactivated_entry_is_unregistered() {
    let (_dir, store, connector) = setup();
    let runtime = runtime(&store, &connector);
    runtime.init().unwrap();
    assert!(runtime.registry().contains(DEMO_ID));

    let mut config = store.read_all().unwrap();
    for entry in &mut config.entries {
        if entry.value == DEMO_ID {
            entry.active = false;
        }
    }
    store.write_all(&config).unwrap();
    store.notify_changed();
    runtime.handle_pending_events().unwrap();

    assert!(!runtime.registry().contains(DEMO_ID));
    let failure = runtime.invoke_report(DEMO_ID, &Inputs::new()).unwrap_err();
    assert_eq!(failure.kind, ErrorKind::NotFound);
}

#[test]
fn test_cached_mode_keeps_loaded_description() {
    let (dir, store, connector) = setup();
    let runtime = runtime(&store, &connector);
    runtime.init().unwrap();

    fs::write(dir.path().join("scripts/demo.R"), demo_script("Second")).unwrap();
    let description = runtime.describe(DEMO_ID).unwrap();
    assert_eq!(description.title.as_deref(), Some("First"));

    // Reconciliation reloads every active algorithm
    runtime.reconcile().unwrap();
    let description = runtime.describe(DEMO_ID).unwrap();
    assert_eq!(description.title.as_deref(), Some("Second"));
}

#[test]
fn test_uncached_mode_reloads_on_every_lookup() {
    let (dir, store, connector) = setup();
    let runtime = runtime(&store, &connector);
    runtime.reconcile().unwrap();

    let mut config = store.read_all().unwrap();
    for entry in &mut config.entries {
        if entry.name == "Cache_Processes" {
            entry.value = "false".to_string();
        }
    }
    store.write_all(&config).unwrap();

    let runtime = self::runtime(&store, &connector);
    runtime.init().unwrap();
    fs::write(dir.path().join("scripts/demo.R"), demo_script("Second")).unwrap();
    let description = runtime.describe(DEMO_ID).unwrap();
    assert_eq!(description.title.as_deref(), Some("Second"));

    let outputs = runtime.invoke(DEMO_ID, &Inputs::new()).unwrap();
    assert_eq!(outputs["y"], Value::Integer(7));
}

#[test]
fn test_remove_then_add_algorithm() {
    let (_dir, store, connector) = setup();
    let runtime = runtime(&store, &connector);
    runtime.init().unwrap();
    let registry = runtime.registry();

    assert!(!registry.remove_algorithm("  "));
    assert!(registry.remove_algorithm(DEMO_ID));
    assert!(registry.remove_algorithm(DEMO_ID));
    assert!(registry.is_empty());

    assert!(registry.add_algorithm(DEMO_ID).unwrap());
    assert_eq!(registry.len(), 1);
    let err = registry
        .add_algorithm("org.n52.wps.server.r.missing")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// =============================================================================
// Shutdown
// =============================================================================

#[test]
fn test_shutdown_is_terminal() {
    let (_dir, store, connector) = setup();
    let runtime = runtime(&store, &connector);
    runtime.init().unwrap();

    runtime.shutdown();
    assert_eq!(runtime.state(), RegistryState::Shutdown);
    assert_eq!(runtime.init().unwrap(), RegistryState::Shutdown);
    assert!(!runtime.registry().add_algorithm(DEMO_ID).unwrap());
    assert!(runtime.algorithm_names().is_empty());
    assert_eq!(connector.stats().open_sessions(), 0);
}
