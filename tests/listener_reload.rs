//! Exercises the Listener Supervisor's reload reconciliation purely through
//! its public API: adding, removing, and leaving listeners untouched across
//! a `reload` call.

use std::sync::Arc;

use lis_ingest::events::EventBus;
use lis_ingest::listener::Supervisor;
use lis_ingest::mapper::FieldMapRegistry;
use lis_ingest::model::{ListenerSpec, Protocol};
use lis_ingest::persistence::Store;
use tokio::net::TcpListener;

async fn temp_store() -> Arc<Store> {
    let path = std::env::temp_dir().join(format!("lis-ingest-reload-{}.sqlite3", uuid::Uuid::new_v4()));
    Arc::new(Store::connect(path.to_str().unwrap()).await.unwrap())
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn spec(port: u16, analyzer_type: &str, protocol: Protocol) -> ListenerSpec {
    ListenerSpec {
        port,
        analyzer_type: analyzer_type.to_string(),
        protocol,
        field_map_id: None,
        idle_timeout_secs: None,
    }
}

#[tokio::test]
async fn reload_adds_and_removes_listeners() {
    let store = temp_store().await;
    let events = EventBus::new(16);
    let registry = Arc::new(FieldMapRegistry::new());
    let mut supervisor = Supervisor::new(store, events, registry, None);

    let port_a = free_port().await;
    let port_b = free_port().await;

    supervisor
        .start_all(vec![spec(port_a, "SYSMEX-XN", Protocol::Astm)])
        .await;
    let running = supervisor.active_listener_ports();
    assert_eq!(running, vec![port_a]);

    // reload to: drop port_a, add port_b
    supervisor
        .reload(vec![spec(port_b, "MINDRAY-BS430", Protocol::Hl7)])
        .await;
    let mut running = supervisor.active_listener_ports();
    running.sort();
    assert_eq!(running, vec![port_b]);

    supervisor.stop_all().await;
    assert!(supervisor.active_listener_ports().is_empty());
}

#[tokio::test]
async fn reload_restarts_listener_whose_spec_changed() {
    let store = temp_store().await;
    let events = EventBus::new(16);
    let registry = Arc::new(FieldMapRegistry::new());
    let mut supervisor = Supervisor::new(store, events, registry, None);

    let port = free_port().await;
    supervisor
        .start_all(vec![spec(port, "SYSMEX-XN", Protocol::Astm)])
        .await;
    assert_eq!(supervisor.active_listener_ports(), vec![port]);

    // Same port, different protocol: must still be listening afterwards.
    supervisor
        .reload(vec![spec(port, "SYSMEX-XN", Protocol::Hl7)])
        .await;
    assert_eq!(supervisor.active_listener_ports(), vec![port]);

    supervisor.stop_all().await;
}
