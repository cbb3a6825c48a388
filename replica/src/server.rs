use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use prometheus::{Encoder, TextEncoder};

use crate::config::RuntimeConfig;
use crate::metrics;
use crate::raft::Node;
use crate::rpc::pb::raft_service_server::RaftServiceServer;
use crate::rpc::{GrpcTransport, RaftServiceSVC};

/// One replica process: the consensus node plus its gRPC and metrics
/// endpoints.
pub struct Server {
    config: RuntimeConfig,
    node: Arc<Node>,
}

impl Server {
    pub fn new(config: RuntimeConfig) -> anyhow::Result<Self> {
        let members = config.members();
        let transport = Arc::new(GrpcTransport::new(&members, config.raft.rpc_timeout()));
        let node = Node::open(
            config.host.clone(),
            &members,
            &config.data_dir,
            config.raft.clone(),
            transport,
        )
        .with_context(|| format!("failed to open node in {:?}", config.data_dir))?;
        Ok(Server { config, node })
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.start_grpc_server()?;
        self.start_metrics_server()?;
        self.node.start();
        Ok(())
    }

    pub fn stop(&mut self) {
        self.node.stop();
        log::info!("server stop");
    }

    fn start_grpc_server(&mut self) -> anyhow::Result<()> {
        let addr: SocketAddr = self
            .config
            .addr
            .parse()
            .with_context(|| format!("invalid listen address {}", self.config.addr))?;
        let raft_service = RaftServiceSVC::new(self.node.clone());
        let grpc_server = tonic::transport::Server::builder()
            .add_service(RaftServiceServer::new(raft_service))
            .serve(addr);
        tokio::spawn(async move {
            if let Err(e) = grpc_server.await {
                log::error!("grpc server failed: {}", e);
            }
        });
        log::info!("grpc server started on {}", addr);
        Ok(())
    }

    fn start_metrics_server(&mut self) -> anyhow::Result<()> {
        let addr: SocketAddr = self
            .config
            .metrics_addr
            .parse()
            .with_context(|| format!("invalid metrics address {}", self.config.metrics_addr))?;
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        let response = match encoder.encode(&metric_families, &mut buffer) {
                            Ok(()) => Response::new(Body::from(buffer)),
                            Err(e) => {
                                let mut response = Response::new(Body::from(e.to_string()));
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                response
                            }
                        };
                        Ok::<_, hyper::Error>(response)
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::try_bind(&addr)
            .with_context(|| format!("failed to bind metrics server on {}", addr))?
            .serve(make_svc);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server failed: {}", e);
            }
        });
        log::info!("metrics server started on {}", addr);
        Ok(())
    }
}
