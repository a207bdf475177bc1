//! Tunnel manager tests against an in-process transport

use super::*;
use crate::models::PodSummary;
use crate::testing::{FakeBehaviour, FakeCluster, FakeTransport};

fn fast_config() -> TunnelConfig {
    TunnelConfig {
        probe_interval: Duration::from_millis(10),
        ready_timeout: Duration::from_millis(150),
        ..TunnelConfig::default()
    }
}

fn manager(cluster: FakeCluster, transport: &FakeTransport) -> TunnelManager {
    TunnelManager::new(
        Arc::new(cluster),
        Arc::new(transport.clone()),
        fast_config(),
        StructuredLogger::new("test-cluster"),
    )
}

mod discovery_tests {
    use super::*;

    #[tokio::test]
    async fn test_only_running_pods_targeted() {
        let cluster = FakeCluster {
            pods: vec![
                PodSummary {
                    name: "cadvisor-a".to_string(),
                    phase: "Running".to_string(),
                },
                PodSummary {
                    name: "cadvisor-b".to_string(),
                    phase: "Pending".to_string(),
                },
                PodSummary {
                    name: "cadvisor-c".to_string(),
                    phase: "Succeeded".to_string(),
                },
            ],
            ..Default::default()
        };
        let manager = manager(cluster, &FakeTransport::new());

        let targets = manager.discover().await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].pod, "cadvisor-a");
        assert_eq!(targets[0].namespace, "kube-system");
        assert_eq!(targets[0].remote_port, 8080);
    }

    #[tokio::test]
    async fn test_discovery_failure_is_error() {
        let manager = manager(FakeCluster::failing(), &FakeTransport::new());
        assert!(manager.open().await.is_err());
    }

    #[tokio::test]
    async fn test_no_targets_is_empty_set() {
        let manager = manager(FakeCluster::default(), &FakeTransport::new());
        let set = manager.open().await.unwrap();

        assert!(set.is_empty());
        assert!(set.ready_endpoints().is_empty());
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_partial_readiness() {
        let transport = FakeTransport::new()
            .with("cadvisor-b", FakeBehaviour::NeverReady)
            .with("cadvisor-c", FakeBehaviour::ExitsEarly)
            .with("cadvisor-d", FakeBehaviour::SpawnFails);
        let cluster = FakeCluster::running(&["cadvisor-a", "cadvisor-b", "cadvisor-c", "cadvisor-d"]);
        let manager = manager(cluster, &transport);

        let mut set = manager.open().await.unwrap();

        let states: Vec<(String, TunnelState)> = set
            .handles()
            .iter()
            .map(|h| (h.target().pod.clone(), h.state()))
            .collect();
        assert_eq!(
            states,
            vec![
                ("cadvisor-a".to_string(), TunnelState::Ready),
                ("cadvisor-b".to_string(), TunnelState::Failed),
                ("cadvisor-c".to_string(), TunnelState::Failed),
                ("cadvisor-d".to_string(), TunnelState::Failed),
            ]
        );
        assert_eq!(set.ready_count(), 1);
        assert_eq!(set.failed_count(), 3);

        let endpoints = set.ready_endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].name, "cadvisor-a");

        set.close().await;
    }

    #[tokio::test]
    async fn test_ports_unique_within_cycle() {
        let names: Vec<String> = (0..8).map(|i| format!("cadvisor-{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let transport = FakeTransport::new();
        let manager = manager(FakeCluster::running(&refs), &transport);

        let mut set = manager.open().await.unwrap();

        let mut ports: Vec<u16> = set.handles().iter().map(|h| h.local_port()).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 8);
        assert!(ports.iter().all(|p| *p != 0));

        set.close().await;
    }

    #[tokio::test]
    async fn test_close_terminates_each_tunnel_once() {
        let transport = FakeTransport::new().with("cadvisor-b", FakeBehaviour::NeverReady);
        let manager = manager(FakeCluster::running(&["cadvisor-a", "cadvisor-b"]), &transport);

        let mut set = manager.open().await.unwrap();
        set.close().await;
        set.close().await;

        assert!(set
            .handles()
            .iter()
            .all(|h| h.state() == TunnelState::Terminated));

        let ports: Vec<u16> = set.handles().iter().map(|h| h.local_port()).collect();
        drop(set);

        let ledger = transport.ledger();
        let ledger = ledger.lock().unwrap();
        for port in ports {
            assert_eq!(ledger.terminated.get(&port), Some(&1));
            assert_eq!(ledger.killed.get(&port), None);
        }
    }

    #[tokio::test]
    async fn test_drop_kills_unclosed_tunnels() {
        let transport = FakeTransport::new();
        let manager = manager(FakeCluster::running(&["cadvisor-a", "cadvisor-b"]), &transport);

        let set = manager.open().await.unwrap();
        let ports: Vec<u16> = set.handles().iter().map(|h| h.local_port()).collect();
        drop(set);

        let ledger = transport.ledger();
        let ledger = ledger.lock().unwrap();
        for port in ports {
            assert_eq!(ledger.killed.get(&port), Some(&1));
            assert_eq!(ledger.terminated.get(&port), None);
        }
    }

    #[tokio::test]
    async fn test_cancelled_open_kills_started_tunnels() {
        let transport = FakeTransport::new().with("cadvisor-a", FakeBehaviour::NeverReady);
        let manager = TunnelManager::new(
            Arc::new(FakeCluster::running(&["cadvisor-a"])),
            Arc::new(transport.clone()),
            TunnelConfig {
                probe_interval: Duration::from_millis(10),
                ready_timeout: Duration::from_secs(30),
                ..TunnelConfig::default()
            },
            StructuredLogger::new("test-cluster"),
        );

        let outcome = tokio::time::timeout(Duration::from_millis(100), manager.open()).await;
        assert!(outcome.is_err());

        let ledger = transport.ledger();
        let ledger = ledger.lock().unwrap();
        assert_eq!(ledger.started.len(), 1);
        let port = ledger.started[0].1;
        assert_eq!(ledger.killed.get(&port), Some(&1));
    }
}

mod port_tests {
    use super::*;

    #[test]
    fn test_allocator_never_repeats() {
        let mut allocator = PortAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let port = allocator.allocate().unwrap();
            assert!(seen.insert(port));
        }
    }
}
