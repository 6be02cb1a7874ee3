//! Listener and Listener Supervisor: one bound TCP port per configured
//! [`ListenerSpec`], each accepting connections into its own task; the
//! Supervisor owns the set of running listeners and reconciles it against a
//! fresh `Vec<ListenerSpec>` on config reload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use crate::events::{Event, EventBus};
use crate::mapper::FieldMapRegistry;
use crate::model::{ListenerSpec, Protocol};
use crate::persistence::Store;

/// How long a listener waits for in-flight connections to finish after a
/// shutdown signal before it stops tracking them.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

struct ListenerHandle {
    spec: ListenerSpec,
    shutdown: watch::Sender<bool>,
    active_connections: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

/// Owns every currently-bound port and reconciles them against reloaded
/// configuration. One Supervisor is built per process in `main`.
pub struct Supervisor {
    store: Arc<Store>,
    events: EventBus,
    registry: Arc<FieldMapRegistry>,
    realtime_wake: Option<mpsc::UnboundedSender<()>>,
    listeners: HashMap<u16, ListenerHandle>,
}

impl Supervisor {
    pub fn new(
        store: Arc<Store>,
        events: EventBus,
        registry: Arc<FieldMapRegistry>,
        realtime_wake: Option<mpsc::UnboundedSender<()>>,
    ) -> Self {
        Self {
            store,
            events,
            registry,
            realtime_wake,
            listeners: HashMap::new(),
        }
    }

    /// Binds and starts accepting on every listener in `specs`. Intended as
    /// the initial startup call; use [`Supervisor::reload`] afterwards.
    pub async fn start_all(&mut self, specs: Vec<ListenerSpec>) {
        for spec in specs {
            self.start_one(spec).await;
        }
    }

    async fn start_one(&mut self, spec: ListenerSpec) {
        let port = spec.port;
        let bind_addr = format!("0.0.0.0:{port}");
        let tcp_listener = match TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                log::error!("failed to bind listener on {bind_addr}: {e}");
                self.events.publish(Event::Warning {
                    kind: "listener_bind_failed".into(),
                    detail: format!("{bind_addr}: {e}"),
                });
                return;
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn(accept_loop(
            tcp_listener,
            spec.clone(),
            shutdown_rx,
            active_connections.clone(),
            self.store.clone(),
            self.events.clone(),
            self.registry.clone(),
            self.realtime_wake.clone(),
        ));

        log::info!("listener started: port={port} analyzer_type={} protocol={:?}", spec.analyzer_type, spec.protocol);
        self.events.publish(Event::ListenerStateChanged {
            port,
            online: true,
            client_count: 0,
        });

        self.listeners.insert(
            port,
            ListenerHandle {
                spec,
                shutdown: shutdown_tx,
                active_connections,
                task,
            },
        );
    }

    /// Signals shutdown, waits up to [`DRAIN_GRACE`] for active connections
    /// to finish on their own, then abandons the accept task regardless: the
    /// grace period is a courtesy, not a guarantee.
    async fn stop_one(&mut self, port: u16) {
        let Some(handle) = self.listeners.remove(&port) else {
            return;
        };
        let _ = handle.shutdown.send(true);

        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        while handle.active_connections.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        handle.task.abort();

        log::info!("listener stopped: port={port}");
        self.events.publish(Event::ListenerStateChanged {
            port,
            online: false,
            client_count: handle.active_connections.load(Ordering::SeqCst),
        });
    }

    /// Reconciles the running set against `new_specs` by port: ports no
    /// longer present are stopped, new ports are started, and ports
    /// whose spec changed are restarted so the new `analyzer_type`/
    /// `protocol`/`field_map_id` take effect. Unchanged ports are left alone,
    /// so reload never drops an idle connection that didn't need to move.
    pub async fn reload(&mut self, new_specs: Vec<ListenerSpec>) {
        let new_ports: HashMap<u16, ListenerSpec> =
            new_specs.into_iter().map(|s| (s.port, s)).collect();

        let stale_ports: Vec<u16> = self
            .listeners
            .keys()
            .copied()
            .filter(|p| !new_ports.contains_key(p))
            .collect();
        for port in stale_ports {
            self.stop_one(port).await;
        }

        for (port, spec) in new_ports {
            let changed = self
                .listeners
                .get(&port)
                .is_some_and(|existing| !specs_equivalent(&existing.spec, &spec));
            if changed {
                self.stop_one(port).await;
            }
            if !self.listeners.contains_key(&port) {
                self.start_one(spec).await;
            }
        }
    }

    /// Stops every listener, used on process shutdown.
    pub async fn stop_all(&mut self) {
        let ports: Vec<u16> = self.listeners.keys().copied().collect();
        for port in ports {
            self.stop_one(port).await;
        }
    }

    pub fn active_listener_ports(&self) -> Vec<u16> {
        self.listeners.keys().copied().collect()
    }
}

fn specs_equivalent(a: &ListenerSpec, b: &ListenerSpec) -> bool {
    a.analyzer_type == b.analyzer_type
        && a.protocol == b.protocol
        && a.field_map_id == b.field_map_id
        && a.idle_timeout_secs == b.idle_timeout_secs
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    tcp_listener: TcpListener,
    spec: ListenerSpec,
    mut shutdown: watch::Receiver<bool>,
    active_connections: Arc<AtomicUsize>,
    store: Arc<Store>,
    events: EventBus,
    registry: Arc<FieldMapRegistry>,
    realtime_wake: Option<mpsc::UnboundedSender<()>>,
) {
    loop {
        tokio::select! {
            accepted = tcp_listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("accept failed on port {}: {e}", spec.port);
                        continue;
                    }
                };

                let field_map = match spec.protocol {
                    Protocol::Astm => registry.astm_for(spec.field_map_key()),
                    Protocol::Hl7 => registry.hl7_for(spec.field_map_key()),
                    Protocol::Poct1a => registry.astm_for(spec.field_map_key()),
                };

                let connection = crate::connection::Connection::new(
                    stream,
                    peer,
                    spec.port,
                    spec.analyzer_type.clone(),
                    spec.protocol,
                    field_map,
                    spec.idle_timeout(),
                    store.clone(),
                    events.clone(),
                    realtime_wake.clone(),
                );

                active_connections.fetch_add(1, Ordering::SeqCst);
                let counter = active_connections.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection.run().await {
                        log::warn!("connection error on port {}: {e}", spec.port);
                    }
                    counter.fetch_sub(1, Ordering::SeqCst);
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Protocol;

    fn spec(port: u16) -> ListenerSpec {
        ListenerSpec {
            port,
            analyzer_type: "SYSMEX-XN".into(),
            protocol: Protocol::Astm,
            field_map_id: None,
            idle_timeout_secs: None,
        }
    }

    #[tokio::test]
    async fn start_all_binds_an_ephemeral_port() {
        let store = Arc::new(Store::connect_in_memory().await.unwrap());
        let events = EventBus::new(16);
        let registry = Arc::new(FieldMapRegistry::new());
        let mut supervisor = Supervisor::new(store, events, registry, None);

        supervisor.start_all(vec![spec(0)]).await;
        assert_eq!(supervisor.active_listener_ports().len(), 1);
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn reload_leaves_unchanged_listener_running() {
        let store = Arc::new(Store::connect_in_memory().await.unwrap());
        let events = EventBus::new(16);
        let registry = Arc::new(FieldMapRegistry::new());
        let mut supervisor = Supervisor::new(store, events, registry, None);

        // Use an OS-assigned ephemeral port by binding once up front and
        // reusing its number, since ListenerSpec requires a concrete port.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        supervisor.start_all(vec![spec(port)]).await;
        assert!(supervisor.listeners.contains_key(&port));

        supervisor.reload(vec![spec(port)]).await;
        assert!(supervisor.listeners.contains_key(&port));

        supervisor.stop_all().await;
        assert!(supervisor.listeners.is_empty());
    }
}
