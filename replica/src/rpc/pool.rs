//! Connection pool for peer clients
//!
//! Hands out gRPC clients per member host, creating them on first use and
//! recycling healthy ones after a call completes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tonic::transport::Channel;

use super::pb::raft_service_client::RaftServiceClient;
use crate::config::NodeConfig;
use crate::error::{Error, Result};

const MAX_IDLE_PER_HOST: usize = 8;

pub struct ConnectionPool {
    /// Member host -> dialable address
    addrs: HashMap<String, String>,
    idle: Mutex<HashMap<String, Vec<RaftServiceClient<Channel>>>>,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(nodes: &[NodeConfig], connect_timeout: Duration) -> Self {
        ConnectionPool {
            addrs: nodes
                .iter()
                .map(|n| (n.host.clone(), n.addr.clone()))
                .collect(),
            idle: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    fn endpoint(&self, host: &str) -> Result<String> {
        let addr = self
            .addrs
            .get(host)
            .ok_or_else(|| Error::UnknownMember(host.to_string()))?;
        if addr.starts_with("http://") || addr.starts_with("https://") {
            Ok(addr.clone())
        } else {
            Ok(format!("http://{}", addr))
        }
    }

    /// Takes an idle client for `host` or dials a new one.
    pub async fn get_connection(&self, host: &str) -> Result<RaftServiceClient<Channel>> {
        let pooled = self
            .idle
            .lock()
            .unwrap()
            .get_mut(host)
            .and_then(|clients| clients.pop());
        if let Some(client) = pooled {
            return Ok(client);
        }

        let endpoint = self.endpoint(host)?;
        match tokio::time::timeout(self.connect_timeout, RaftServiceClient::connect(endpoint)).await
        {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(e)) => {
                log::error!("Failed to connect to {}: {}", host, e);
                Err(e.into())
            }
            Err(_) => Err(Error::Timeout(host.to_string())),
        }
    }

    /// Returns a client after a successful call.
    pub fn put_connection(&self, host: &str, client: RaftServiceClient<Channel>) {
        let mut idle = self.idle.lock().unwrap();
        let clients = idle.entry(host.to_string()).or_default();
        if clients.len() < MAX_IDLE_PER_HOST {
            clients.push(client);
        }
    }

    pub fn close_connections(&self, host: &str) {
        if self.idle.lock().unwrap().remove(host).is_some() {
            log::info!("closed pooled connections to {}", host);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ConnectionPool {
        ConnectionPool::new(
            &[
                NodeConfig {
                    host: "node1".to_string(),
                    addr: "127.0.0.1:4001".to_string(),
                },
                NodeConfig {
                    host: "node2".to_string(),
                    addr: "http://10.0.0.2:4002".to_string(),
                },
            ],
            Duration::from_millis(50),
        )
    }

    #[test]
    fn endpoint_gets_scheme() {
        let pool = pool();
        assert_eq!(pool.endpoint("node1").unwrap(), "http://127.0.0.1:4001");
        assert_eq!(pool.endpoint("node2").unwrap(), "http://10.0.0.2:4002");
        assert!(matches!(pool.endpoint("node9"), Err(Error::UnknownMember(_))));
    }

    #[tokio::test]
    async fn unknown_host_is_rejected() {
        let pool = pool();
        assert!(matches!(
            pool.get_connection("node9").await,
            Err(Error::UnknownMember(_))
        ));
    }
}
