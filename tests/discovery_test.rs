//! Cluster network discovery against an in-memory cluster

mod common;

use common::*;
use kubebridge::config::Config;
use kubebridge::network::{calculate_minimal_ip_range, NetworkDiscovery};

#[tokio::test]
async fn test_node_cidrs_take_precedence() {
    let cluster = FakeCluster::new();
    cluster.add_node(node(Some("10.244.0.0/24")));
    cluster.add_node(node(Some("10.244.1.0/24")));
    cluster.add_pod(running_pod("web-1", "172.16.5.5", false));

    let config = Config::default();
    let discovery = NetworkDiscovery::new(&cluster, &config);
    let cidrs = discovery.get_pod_cidrs(NAMESPACE, None).await.unwrap();
    assert_eq!(cidrs, vec!["10.244.0.0/24", "10.244.1.0/24"]);
}

#[tokio::test]
async fn test_pod_sampling_when_nodes_hide_cidr() {
    let cluster = FakeCluster::new();
    cluster.add_node(node(None));
    cluster.add_pod(running_pod("web-1", "172.168.1.2", false));
    cluster.add_pod(running_pod("web-2", "172.168.9.40", false));
    cluster.add_pod(running_pod("agent", "192.168.0.4", true));

    let config = Config::default();
    let discovery = NetworkDiscovery::new(&cluster, &config);
    let cidrs = discovery.get_pod_cidrs(NAMESPACE, None).await.unwrap();
    assert_eq!(cidrs, vec!["172.168.0.0/16"]);
}

#[tokio::test]
async fn test_empty_cluster() {
    let cluster = FakeCluster::new();
    let config = Config::default();
    let discovery = NetworkDiscovery::new(&cluster, &config);
    assert!(discovery.get_pod_cidrs(NAMESPACE, None).await.unwrap().is_empty());
    assert!(discovery.get_service_cidr(NAMESPACE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_connect_routes() {
    let cluster = FakeCluster::new();
    cluster.add_node(node(Some("10.244.0.0/24")));
    cluster.add_service(user_service("web", &[("app", "web")], &[]));

    let config = Config::default();
    let discovery = NetworkDiscovery::new(&cluster, &config);
    let cidrs = discovery
        .cluster_cidrs(NAMESPACE, None, &["192.168.1.0/24".to_string()], &[])
        .await
        .unwrap();
    assert_eq!(cidrs, vec!["10.244.0.0/24", "10.96.0.0/16", "192.168.1.0/24"]);
}

#[test]
fn test_reduced_set_covers_every_input() {
    let ips = ["10.0.1.1", "10.0.1.200", "10.0.2.3", "192.168.7.7"];
    let ranges = calculate_minimal_ip_range(&ips, 24);
    assert_eq!(ranges.len(), 3);
    for ip in ips {
        let addr: std::net::Ipv4Addr = ip.parse().unwrap();
        assert!(ranges.iter().any(|r| {
            let net: ipnet::Ipv4Net = r.parse().unwrap();
            net.contains(&addr)
        }));
    }
}
