use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use replica::config::{NodeConfig, RaftConfig};
use replica::rpc::{LocalTransport, RpcTrace};
use replica::{Command, Node};
use tempfile::TempDir;

struct Cluster {
    transport: Arc<LocalTransport>,
    nodes: Vec<Arc<Node>>,
    _dirs: Vec<TempDir>,
}

impl Cluster {
    fn start(n: usize, config: RaftConfig) -> Cluster {
        let _ = env_logger::builder().is_test(true).try_init();
        let members: Vec<NodeConfig> = (1..=n)
            .map(|i| NodeConfig {
                host: format!("node{}", i),
                addr: format!("127.0.0.1:{}", 5000 + i),
            })
            .collect();
        let transport = LocalTransport::new();
        let mut nodes = Vec::new();
        let mut dirs = Vec::new();
        for member in &members {
            let dir = tempfile::tempdir().unwrap();
            let node = Node::open(
                member.host.clone(),
                &members,
                dir.path(),
                config.clone(),
                transport.clone(),
            )
            .unwrap();
            transport.register(&node);
            nodes.push(node);
            dirs.push(dir);
        }
        for node in &nodes {
            node.start();
        }
        Cluster {
            transport,
            nodes,
            _dirs: dirs,
        }
    }

    fn leaders(&self) -> Vec<Arc<Node>> {
        self.nodes.iter().filter(|n| n.is_leader()).cloned().collect()
    }

    /// Waits for a leader that every other listed node follows.
    async fn stable_leader(&self, among: &[Arc<Node>]) -> Arc<Node> {
        for _ in 0..500 {
            let leaders: Vec<&Arc<Node>> = among.iter().filter(|n| n.is_leader()).collect();
            if leaders.len() == 1 {
                let leader = leaders[0].clone();
                let mut agreed = true;
                for node in among {
                    if node.leader_id().await.as_deref() != Some(leader.host()) {
                        agreed = false;
                        break;
                    }
                }
                if agreed {
                    return leader;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no stable leader");
    }

    fn stop(&self) {
        for node in &self.nodes {
            node.stop();
        }
    }
}

fn fast_config() -> RaftConfig {
    RaftConfig {
        election_timeout_min_ms: 150,
        election_timeout_max_ms: 300,
        heartbeat_interval_ms: 20,
        rpc_timeout_ms: 50,
        client_timeout_ms: 5_000,
        ..Default::default()
    }
}

async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn put(key: &str, value: &str) -> Command {
    Command::Put {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn elects_exactly_one_leader() {
    let cluster = Cluster::start(3, fast_config());
    let leader = cluster.stable_leader(&cluster.nodes).await;

    assert!(leader.current_term() >= 1);
    assert_eq!(cluster.leaders().len(), 1);
    cluster.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_submission_is_relayed_and_answered() {
    let cluster = Cluster::start(3, fast_config());
    let leader = cluster.stable_leader(&cluster.nodes).await;
    let follower = cluster
        .nodes
        .iter()
        .find(|n| n.host() != leader.host())
        .unwrap()
        .clone();

    let response = follower.submit(put("x", "1")).await.unwrap();
    assert!(response.success);
    assert_eq!(response.value.as_deref(), Some("1"));
    assert_eq!(response.request_origin, follower.host());

    let trace = cluster.transport.trace();
    assert!(trace.contains(&RpcTrace::Relay {
        to: leader.host().to_string(),
        from: follower.host().to_string(),
    }));
    assert!(trace.contains(&RpcTrace::ForwardResp {
        to: follower.host().to_string(),
        from: leader.host().to_string(),
    }));

    for node in &cluster.nodes {
        let node = node.clone();
        assert!(wait_for(move || {
            let node = node.clone();
            async move { node.read_local("x").await.as_deref() == Some("1") }
        })
        .await);
    }
    cluster.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn isolated_leader_is_replaced() {
    let cluster = Cluster::start(3, fast_config());
    let old = cluster.stable_leader(&cluster.nodes).await;
    let old_term = old.current_term();

    cluster.transport.isolate(old.host());
    let rest: Vec<Arc<Node>> = cluster
        .nodes
        .iter()
        .filter(|n| n.host() != old.host())
        .cloned()
        .collect();
    let new = cluster.stable_leader(&rest).await;
    assert_ne!(new.host(), old.host());
    assert!(new.current_term() > old_term);

    let response = rest[0].submit(put("after", "failover")).await.unwrap();
    assert!(response.success);

    cluster.transport.heal(old.host());
    let old_node = old.clone();
    assert!(wait_for(move || {
        let node = old_node.clone();
        async move { node.read_local("after").await.as_deref() == Some("failover") }
    })
    .await);
    let old_node = old.clone();
    assert!(wait_for(move || {
        let node = old_node.clone();
        async move { !node.is_leader() }
    })
    .await);
    cluster.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn healed_leader_rejoins_without_deposing_successor() {
    let config = RaftConfig {
        election_timeout_min_ms: 1_000,
        election_timeout_max_ms: 2_000,
        ..fast_config()
    };
    let cluster = Cluster::start(3, config);
    let old = cluster.stable_leader(&cluster.nodes).await;

    cluster.transport.isolate(old.host());
    let rest: Vec<Arc<Node>> = cluster
        .nodes
        .iter()
        .filter(|n| n.host() != old.host())
        .cloned()
        .collect();
    let new = cluster.stable_leader(&rest).await;
    let term = new.current_term();

    cluster.transport.heal(old.host());
    let old_node = old.clone();
    assert!(wait_for(move || {
        let node = old_node.clone();
        async move { !node.is_leader() }
    })
    .await);
    // well inside the shortest election timeout
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(new.is_leader());
    assert_eq!(new.leader_id().await.as_deref(), Some(new.host()));
    for node in &cluster.nodes {
        assert_eq!(node.current_term(), term, "{} changed term", node.host());
    }
    cluster.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_follower_catches_up_through_snapshot() {
    let config = RaftConfig {
        snapshot_threshold: 20,
        wal_retain: 5,
        ..fast_config()
    };
    let cluster = Cluster::start(3, config);
    let leader = cluster.stable_leader(&cluster.nodes).await;
    let lagging = cluster
        .nodes
        .iter()
        .find(|n| n.host() != leader.host())
        .unwrap()
        .clone();

    cluster.transport.isolate(lagging.host());
    let writer = cluster
        .nodes
        .iter()
        .find(|n| n.host() != lagging.host())
        .unwrap()
        .clone();
    for i in 0..60 {
        let response = writer
            .submit(put(&format!("k{}", i), &i.to_string()))
            .await
            .unwrap();
        assert!(response.success);
    }

    let compacted = cluster
        .nodes
        .iter()
        .filter(|n| n.host() != lagging.host())
        .cloned()
        .collect::<Vec<_>>();
    for node in compacted {
        let host = node.host().to_string();
        let done = wait_for(move || {
            let node = node.clone();
            async move { node.wal_bounds().await.0 > 1 }
        })
        .await;
        assert!(done, "{} did not compact", host);
    }

    cluster.transport.heal(lagging.host());
    let node = lagging.clone();
    assert!(wait_for(move || {
        let node = node.clone();
        async move { node.read_local("k59").await.as_deref() == Some("59") }
    })
    .await);
    assert_eq!(lagging.read_local("k0").await.as_deref(), Some("0"));
    assert!(cluster.transport.trace().iter().any(|call| matches!(
        call,
        RpcTrace::InstallSnapshot { to, .. } if to == lagging.host()
    )));
    cluster.stop();
}
