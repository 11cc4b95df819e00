//! Node bring-up
//!
//! Wires one process together according to its role. The head registers
//! its own shards, opens the discovery listener, seals the cluster and only
//! then binds the serving endpoint. A child opens its control listener,
//! announces, and waits for the sealed table.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::config::{NodeConfig, NodeRole};
use crate::coordinator::leader::{DrainReport, HeadCoordinator};
use crate::coordinator::rank_table::RankRange;
use crate::discovery::protocol::{AnnounceRequest, DrainResponse};
use crate::discovery::{discovery_routes, DiscoveryClient};
use crate::error::{ClusterError, Result};
use crate::router::{HeartbeatMonitor, HttpShardTransport, RequestRouter, SplitTransport};
use crate::runtime::ShutdownSignal;
use crate::worker::{control_routes, InferenceEngine, WorkerGroup, WorkerPhase};

/// Time allowed for listeners to close after a drain
const LISTENER_SHUTDOWN: Duration = Duration::from_secs(5);

/// Pre-bound sockets. Anything left `None` is bound from the config.
#[derive(Default)]
pub struct Listeners {
    /// Discovery listener on the head, control listener on a child
    pub internal: Option<TcpListener>,
    pub serving: Option<TcpListener>,
}

async fn bind(host: &str, port: u16, provided: Option<TcpListener>) -> Result<TcpListener> {
    if let Some(listener) = provided {
        return Ok(listener);
    }
    let addr = format!("{}:{}", host, port);
    TcpListener::bind(&addr)
        .await
        .map_err(|e| ClusterError::ConnectionFailed {
            endpoint: addr,
            reason: format!("bind failed: {}", e),
        })
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr> {
    listener.local_addr().map_err(|e| ClusterError::Internal {
        message: format!("listener has no local address: {}", e),
    })
}

fn serve(listener: TcpListener, app: Router, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = async move { stop.cancelled().await };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            error!("Listener failed: {}", e);
        }
    })
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if tokio::time::timeout(LISTENER_SHUTDOWN, task).await.is_err() {
            warn!("Listener did not close in time");
        }
    }
}

/// A running head node
pub struct HeadNode {
    coordinator: Arc<HeadCoordinator>,
    group: Arc<WorkerGroup>,
    router: Arc<RequestRouter>,
    internal_addr: SocketAddr,
    serving_addr: Option<SocketAddr>,
    stop_listeners: CancellationToken,
    stop_monitor: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl HeadNode {
    /// Bring the cluster up. Returns once the table is sealed, acknowledged
    /// by every child, and the serving endpoint (if any) is bound.
    pub async fn start(config: &NodeConfig, engine: Arc<dyn InferenceEngine>, listeners: Listeners) -> Result<Self> {
        if config.validate()? != NodeRole::Head {
            return Err(ClusterError::InvalidConfiguration {
                reason: "head node started with a discovery address".into(),
            });
        }

        let descriptor = config.descriptor(&NodeRole::Head);
        let coordinator = Arc::new(HeadCoordinator::new(config.coordinator_config(), descriptor.clone())?);
        let group = Arc::new(WorkerGroup::new(descriptor, engine, config.worker_group_config()));

        let range = coordinator.register_local().await?;
        group.state().set_assigned(range).await;

        let stop_listeners = CancellationToken::new();
        let internal = bind(&config.host, config.data_parallel_rpc_port, listeners.internal).await?;
        let internal_addr = local_addr(&internal)?;
        let internal_app = discovery_routes(coordinator.clone())
            .merge(control_routes(group.clone()))
            .layer(TraceLayer::new_for_http());
        let mut tasks = vec![serve(internal, internal_app, stop_listeners.clone())];
        info!(addr = %internal_addr, range = %range, "Discovery listener started, waiting for registrations");

        let sealed = async {
            let table = coordinator.await_sealed(config.startup_timeout()).await?;
            group.install_table(table.clone()).await?;
            Ok::<_, ClusterError>(table)
        }
        .await;
        let table = match sealed {
            Ok(table) => table,
            Err(e) => {
                group.state().set_phase(WorkerPhase::Failed);
                stop_listeners.cancel();
                join_all(tasks).await;
                return Err(e);
            }
        };

        let remote = Arc::new(HttpShardTransport::new(table.clone(), coordinator.config().connect_timeout)?);
        let transport = Arc::new(SplitTransport::new(group.ranks(), group.clone(), remote));
        let router = Arc::new(RequestRouter::new(table, transport));

        let stop_monitor = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(router.clone(), Some(group.clone()), config.heartbeat_config())?;
        tasks.push(tokio::spawn(monitor.run(stop_monitor.clone())));

        let serving_addr = if config.headless {
            info!("Headless head node, serving endpoint disabled");
            None
        } else {
            let listener = bind(&config.host, config.port, listeners.serving).await?;
            let addr = local_addr(&listener)?;
            let app = api::create_router(AppState {
                router: router.clone(),
                head: Some(coordinator.clone()),
                api_key: config.api_key.as_deref().map(Arc::from),
            });
            tasks.push(serve(listener, app, stop_listeners.clone()));
            info!(addr = %addr, "Serving endpoint ready");
            Some(addr)
        };

        Ok(Self {
            coordinator,
            group,
            router,
            internal_addr,
            serving_addr,
            stop_listeners,
            stop_monitor,
            tasks,
        })
    }

    pub fn coordinator(&self) -> &Arc<HeadCoordinator> {
        &self.coordinator
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    pub fn group(&self) -> &Arc<WorkerGroup> {
        &self.group
    }

    pub fn internal_addr(&self) -> SocketAddr {
        self.internal_addr
    }

    pub fn serving_addr(&self) -> Option<SocketAddr> {
        self.serving_addr
    }

    /// Drain the cluster and close every listener
    pub async fn shutdown(self) -> DrainReport {
        self.stop_monitor.cancel();
        let report = self.coordinator.drain(&self.router, Some(&self.group)).await;
        self.stop_listeners.cancel();
        join_all(self.tasks).await;
        report
    }
}

/// A running child node
pub struct ChildNode {
    group: Arc<WorkerGroup>,
    range: RankRange,
    control_addr: SocketAddr,
    stop_listeners: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ChildNode {
    /// Announce to the head and wait for the sealed table
    pub async fn start(config: &NodeConfig, engine: Arc<dyn InferenceEngine>, listeners: Listeners) -> Result<Self> {
        let role = config.validate()?;
        let NodeRole::Child { discovery_url } = &role else {
            return Err(ClusterError::InvalidConfiguration {
                reason: "child node started without a discovery address".into(),
            });
        };

        let descriptor = config.descriptor(&role);
        let group = Arc::new(WorkerGroup::new(descriptor.clone(), engine, config.worker_group_config()));

        let stop_listeners = CancellationToken::new();
        let control = bind(&config.host, config.control_port, listeners.internal).await?;
        let control_addr = local_addr(&control)?;
        let app = control_routes(group.clone()).layer(TraceLayer::new_for_http());
        let tasks = vec![serve(control, app, stop_listeners.clone())];
        info!(addr = %control_addr, discovery = %discovery_url, "Control listener started, announcing");

        let started = Instant::now();
        let bring_up = async {
            let client = DiscoveryClient::new(config.client_config(discovery_url))?;
            let req = AnnounceRequest {
                protocol_version: crate::PROTOCOL_VERSION,
                node: descriptor,
                requested_local_rank_count: config.data_parallel_size_local,
                start_rank_hint: config.data_parallel_start_rank,
                declared_total: config.data_parallel_size,
                tensor_parallel_size: config.tensor_parallel_size,
            };

            group.state().set_phase(WorkerPhase::Announcing);
            let range = client.announce(&req).await?;
            group.state().set_assigned(range).await;

            let remaining = config.startup_timeout().saturating_sub(started.elapsed());
            if group.state().wait_for_table(remaining).await.is_none() {
                return Err(ClusterError::ClusterStartupTimeout {
                    registered: range.len(),
                    expected: config.data_parallel_size,
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            Ok(range)
        }
        .await;

        match bring_up {
            Ok(range) => {
                info!(range = %range, elapsed_ms = started.elapsed().as_millis() as u64, "Child node ready");
                Ok(Self {
                    group,
                    range,
                    control_addr,
                    stop_listeners,
                    tasks,
                })
            }
            Err(e) => {
                group.state().set_phase(WorkerPhase::Failed);
                stop_listeners.cancel();
                join_all(tasks).await;
                Err(e)
            }
        }
    }

    pub fn group(&self) -> &Arc<WorkerGroup> {
        &self.group
    }

    pub fn range(&self) -> RankRange {
        self.range
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Resolves once the head has drained this node
    pub async fn wait_stopped(&self) {
        let mut phase = self.group.state().subscribe_phase();
        let _ = phase.wait_for(|p| *p == WorkerPhase::Stopped).await;
    }

    /// Drain locally if the head has not already, then close the listener
    pub async fn shutdown(self, deadline: Duration) -> DrainResponse {
        let response = if self.group.state().phase() == WorkerPhase::Stopped {
            DrainResponse {
                drained: self.group.in_flight() == 0,
                in_flight: self.group.in_flight(),
            }
        } else {
            self.group.drain(deadline).await
        };

        let cancelled = self.group.cancel_all();
        if cancelled > 0 {
            warn!(cancelled, "Cancelled requests still running at shutdown");
        }
        self.stop_listeners.cancel();
        join_all(self.tasks).await;
        response
    }
}

/// Run a node until `shutdown` fires (or, on a child, until the head drains it)
pub async fn run(config: NodeConfig, engine: Arc<dyn InferenceEngine>, shutdown: ShutdownSignal) -> Result<()> {
    match config.validate()? {
        NodeRole::Head => {
            let node = HeadNode::start(&config, engine, Listeners::default()).await?;
            shutdown.wait().await;

            let report = node.shutdown().await;
            info!(
                confirmed = report.confirmed.len(),
                force_closed = report.force_closed.len(),
                "Head node stopped"
            );
        }
        NodeRole::Child { .. } => {
            let node = ChildNode::start(&config, engine, Listeners::default()).await?;
            let drained_by_head = tokio::select! {
                _ = shutdown.wait() => false,
                _ = node.wait_stopped() => true,
            };
            if drained_by_head {
                info!("Drained by head coordinator");
            }

            let response = node.shutdown(config.drain_timeout()).await;
            info!(drained = response.drained, in_flight = response.in_flight, "Child node stopped");
        }
    }
    Ok(())
}
