#![allow(dead_code)]

use std::sync::{Arc, Once};

use gridcache_core::{Address, CacheTopology, ConsistentHash};
use gridcache_server::cluster::LocalCluster;
use gridcache_server::{CacheConfig, CacheMode, CacheNode, CacheStore, InMemoryStore};

static TRACING: Once = Once::new();

/// Installs a test subscriber once per binary. `RUST_LOG` selects output.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn addr(name: &str) -> Address {
    Address::new(name)
}

/// Synchronous distributed configuration with a short remote timeout.
pub fn dist_config() -> CacheConfig {
    let mut config = CacheConfig::default();
    config.clustering.mode = CacheMode::DistSync;
    config.clustering.num_owners = 2;
    config.clustering.remote_timeout_ms = 300;
    config
}

/// One segment owned by `n1` (primary) and `n2` (backup). Every other member
/// owns nothing.
pub fn fixed_topology(members: &[Address], id: i32) -> CacheTopology {
    let hash = ConsistentHash::from_segment_owners(
        members.to_vec(),
        2,
        vec![vec![addr("n1"), addr("n2")]],
    )
    .expect("valid layout");
    CacheTopology::new(id, hash)
}

pub struct TestCluster {
    pub cluster: Arc<LocalCluster>,
    pub nodes: Vec<CacheNode>,
}

impl TestCluster {
    pub fn node(&self, name: &str) -> &CacheNode {
        self.nodes
            .iter()
            .find(|n| n.address().as_str() == name)
            .expect("node exists")
    }

    pub async fn stop_all(&self) {
        for node in &self.nodes {
            node.stop().await;
        }
    }
}

/// Starts `n1..=nN` on one in-process cluster with [`fixed_topology`].
/// `stores[i]` backs node `i`, when given.
pub async fn start_cluster(config: &CacheConfig, stores: &[Option<Arc<InMemoryStore>>]) -> TestCluster {
    let stores: Vec<Option<Arc<dyn CacheStore>>> = stores
        .iter()
        .map(|s| s.clone().map(|s| s as Arc<dyn CacheStore>))
        .collect();
    start_cluster_with(config, stores).await
}

/// Like [`start_cluster`], for any store implementation.
pub async fn start_cluster_with(config: &CacheConfig, stores: Vec<Option<Arc<dyn CacheStore>>>) -> TestCluster {
    init_tracing();
    let cluster = LocalCluster::new();
    let members: Vec<Address> = (1..=stores.len()).map(|i| addr(&format!("n{i}"))).collect();
    let mut nodes = Vec::new();
    for (member, store) in members.iter().zip(stores) {
        let mut builder = CacheNode::builder(config.clone())
            .join(&cluster, member.as_str())
            .topology(fixed_topology(&members, 1));
        if let Some(store) = store {
            builder = builder.store(store);
        }
        nodes.push(builder.build().expect("node builds"));
    }
    for node in &nodes {
        node.start().await.expect("node starts");
    }
    TestCluster { cluster, nodes }
}

/// A single standalone node in local mode.
pub async fn start_local(config: CacheConfig, store: Option<Arc<InMemoryStore>>) -> CacheNode {
    init_tracing();
    let mut builder = CacheNode::builder(config).address("solo");
    if let Some(store) = store {
        builder = builder.store(store as Arc<dyn CacheStore>);
    }
    let node = builder.build().expect("node builds");
    node.start().await.expect("node starts");
    node
}
