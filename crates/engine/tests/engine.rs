use std::sync::Arc;
use std::time::Duration;

use keel_core::memory::{MemoryCluster, Op};
use keel_core::{BackoffConfig, ClusterApi, ClusterError, ConvergenceStatus, DesiredSpec, Health, ResourceDescriptor, WatchFilter};
use keel_engine::{AgentConfig, EngineError, EngineStats, ReconciliationEngine};
use keel_transport::{ChannelConnector, ChannelPeer, Inbound, Outbound, PeerSession, ResourceEntry};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

fn cm(name: &str) -> ResourceDescriptor { ResourceDescriptor::namespaced("v1/ConfigMap", "default", name) }

fn entry(d: ResourceDescriptor, generation: u64, value: &str) -> ResourceEntry {
    ResourceEntry { descriptor: d, generation, spec: serde_json::json!({"data": {"value": value}}), order_hint: None }
}

fn config(kinds: &[&str]) -> AgentConfig {
    let mut cfg = AgentConfig { cluster_id: Some("edge-test".into()), ..Default::default() };
    cfg.control_plane.backoff = BackoffConfig { base_ms: 5, multiplier: 2.0, cap_ms: 20, jitter: 0.0 };
    cfg.control_plane.initial_connect_attempts = 3;
    cfg.watch.kinds = kinds.iter().map(|k| WatchFilter::kind(*k)).collect();
    cfg.watch.backoff = BackoffConfig { base_ms: 5, multiplier: 2.0, cap_ms: 300, jitter: 0.0 };
    cfg.scheduler.workers = 4;
    cfg.scheduler.retry = BackoffConfig { base_ms: 10, multiplier: 2.0, cap_ms: 50, jitter: 0.0 };
    cfg.apply.timeout_ms = 2_000;
    cfg.reporter.coalesce_ms = 10;
    cfg.engine.debounce_ms = 10;
    cfg.validate().unwrap();
    cfg
}

struct Harness {
    cluster: Arc<MemoryCluster>,
    peer: ChannelPeer,
    stats: watch::Receiver<EngineStats>,
    stop: Option<oneshot::Sender<()>>,
    run: JoinHandle<Result<(), EngineError>>,
}

impl Harness {
    fn start(cluster: Arc<MemoryCluster>, cfg: AgentConfig, prepare: impl FnOnce(&ChannelPeer)) -> Self {
        let (conn, peer) = ChannelConnector::pair();
        prepare(&peer);
        let engine = ReconciliationEngine::from_config(cluster.clone() as Arc<dyn ClusterApi>, Arc::new(conn), &cfg);
        let stats = engine.stats();
        let (tx, rx) = oneshot::channel::<()>();
        let run = tokio::spawn(engine.run(async move {
            let _ = rx.await;
        }));
        Self { cluster, peer, stats, stop: Some(tx), run }
    }

    async fn stop(mut self) -> Result<(), EngineError> {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.run).await.unwrap().unwrap()
    }
}

/// Read frames until one satisfies `done`; returns everything read, the match included.
async fn until(s: &mut PeerSession, mut done: impl FnMut(&Outbound) -> bool) -> Vec<Outbound> {
    let mut seen = Vec::new();
    let read = async {
        while let Some(f) = s.recv().await {
            let hit = done(&f);
            seen.push(f);
            if hit {
                return;
            }
        }
        panic!("session closed; frames so far: {:?}", seen);
    };
    if tokio::time::timeout(Duration::from_secs(5), read).await.is_err() {
        panic!("no matching frame within 5s");
    }
    seen
}

fn status_of<'a>(f: &'a Outbound, name: &str) -> Option<&'a ConvergenceStatus> {
    match f {
        Outbound::Status { status, .. } if status.descriptor.name == name => Some(status),
        _ => None,
    }
}

fn converged(name: &'static str, generation: Option<u64>) -> impl FnMut(&Outbound) -> bool {
    move |f| {
        status_of(f, name).is_some_and(|s| s.health == Health::Converged && s.desired_generation == generation)
    }
}

fn resyncs(frames: &[Outbound], reason: &str) -> usize {
    frames.iter().filter(|f| matches!(f, Outbound::ResyncRequest { reason: r } if r == reason)).count()
}

#[tokio::test]
async fn create_then_update_through_a_version_conflict() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut session = None;
    let h = Harness::start(cluster.clone(), config(&["v1/ConfigMap"]), |p| session = Some(p.accept()));
    let mut s = session.unwrap();

    s.send(Inbound::Full { generation: 1, resources: vec![entry(cm("a"), 1, "x")] });
    until(&mut s, converged("a", Some(1))).await;
    assert_eq!(h.cluster.object(&cm("a")).unwrap().applied_generation, Some(1));
    assert_eq!(h.cluster.calls(Op::Create), 1);

    h.cluster.inject(Op::Update, Some(cm("a")), ClusterError::VersionConflict("stale".into()));
    s.send(Inbound::Full { generation: 2, resources: vec![entry(cm("a"), 2, "y")] });
    until(&mut s, converged("a", Some(2))).await;

    let obj = h.cluster.object(&cm("a")).unwrap();
    assert_eq!(obj.applied_generation, Some(2));
    assert_eq!(obj.spec["data"]["value"], "y");
    assert_eq!(h.cluster.calls(Op::Update), 2);
    assert_eq!(h.cluster.calls(Op::Create), 1);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn reconnect_waits_for_a_full_snapshot() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut first = None;
    let h = Harness::start(cluster.clone(), config(&["v1/ConfigMap"]), |p| first = Some(p.accept()));
    let mut s1 = first.unwrap();
    s1.send(Inbound::Full { generation: 1, resources: vec![entry(cm("a"), 1, "x")] });
    until(&mut s1, converged("a", Some(1))).await;

    let mut s2 = h.peer.accept();
    s1.close();
    // The handshake on the new session carries exactly one resync request.
    let mut frames = until(&mut s2, |f| matches!(f, Outbound::ResyncRequest { .. })).await;

    // A delta before the full snapshot cannot be trusted and is dropped.
    s2.send(Inbound::Delta {
        generation: 2,
        base_generation: 1,
        resources: vec![entry(cm("b"), 2, "b")],
        removals: vec![],
    });
    s2.send(Inbound::Full { generation: 3, resources: vec![entry(cm("a"), 1, "x"), entry(cm("c"), 3, "c")] });
    frames.extend(until(&mut s2, converged("c", Some(3))).await);

    assert_eq!(resyncs(&frames, "reconnect"), 1);
    assert_eq!(frames.iter().filter(|f| matches!(f, Outbound::ResyncRequest { .. })).count(), 1);
    assert!(h.cluster.object(&cm("b")).is_none());
    assert!(h.cluster.object(&cm("a")).is_some());
    h.stop().await.unwrap();
}

#[tokio::test]
async fn stale_delta_requests_one_resync() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut session = None;
    let h = Harness::start(cluster.clone(), config(&["v1/ConfigMap"]), |p| session = Some(p.accept()));
    let mut s = session.unwrap();
    s.send(Inbound::Full { generation: 1, resources: vec![entry(cm("a"), 1, "x")] });
    until(&mut s, converged("a", Some(1))).await;

    s.send(Inbound::Delta { generation: 5, base_generation: 3, resources: vec![entry(cm("b"), 5, "b")], removals: vec![] });
    s.send(Inbound::Delta { generation: 6, base_generation: 5, resources: vec![entry(cm("c"), 6, "c")], removals: vec![] });
    let mut frames = until(&mut s, |f| matches!(f, Outbound::ResyncRequest { .. })).await;

    s.send(Inbound::Full { generation: 6, resources: vec![entry(cm("a"), 1, "x"), entry(cm("b"), 5, "b")] });
    frames.extend(until(&mut s, converged("b", Some(5))).await);

    assert_eq!(resyncs(&frames, "stale-generation"), 1);
    assert!(h.cluster.object(&cm("c")).is_none());
    {
        let stats = h.stats.borrow();
        assert_eq!((stats.resync_requests, stats.desired_generation, stats.awaiting_full), (1, 6, false));
        assert!(stats.passes >= 2);
    }
    h.stop().await.unwrap();
}

#[tokio::test]
async fn removal_deletes_managed_objects_only() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.put_external(&cm("foreign"), serde_json::json!({"data": {"owner": "someone-else"}}));
    let mut session = None;
    let h = Harness::start(cluster.clone(), config(&["v1/ConfigMap"]), |p| session = Some(p.accept()));
    let mut s = session.unwrap();

    s.send(Inbound::Full { generation: 1, resources: vec![entry(cm("a"), 1, "a"), entry(cm("b"), 1, "b")] });
    until(&mut s, converged("a", Some(1))).await;
    until(&mut s, converged("b", Some(1))).await;

    s.send(Inbound::Delta { generation: 2, base_generation: 1, resources: vec![], removals: vec![cm("b")] });
    until(&mut s, converged("b", None)).await;

    assert!(h.cluster.object(&cm("b")).is_none());
    assert!(h.cluster.object(&cm("a")).is_some());
    assert!(h.cluster.object(&cm("foreign")).is_some());
    assert_eq!(h.cluster.calls(Op::Delete), 1);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn halted_kind_is_degraded_until_its_watch_recovers() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.inject_for_kind(Op::List, "v1/Secret", ClusterError::PermissionDenied("secrets are off limits".into()));
    let secret = ResourceDescriptor::namespaced("v1/Secret", "default", "token");
    let deploy = ResourceDescriptor::namespaced("apps/v1/Deployment", "default", "web");
    let mut session = None;
    let h = Harness::start(cluster.clone(), config(&["v1/ConfigMap", "v1/Secret"]), |p| session = Some(p.accept()));
    let mut s = session.unwrap();

    s.send(Inbound::Full {
        generation: 1,
        resources: vec![entry(cm("a"), 1, "a"), entry(secret.clone(), 1, "s"), entry(deploy, 1, "d")],
    });
    let mut frames = until(&mut s, |f| status_of(f, "token").is_some_and(|st| st.health == Health::Degraded)).await;
    let held = frames.iter().rev().find_map(|f| status_of(f, "token")).unwrap();
    assert!(held.reason.as_deref().unwrap().contains("off limits"), "{:?}", held.reason);

    frames.extend(until(&mut s, converged("token", Some(1))).await);
    let web = frames.iter().rev().find_map(|f| status_of(f, "web")).unwrap();
    assert_eq!(web.health, Health::Degraded);
    assert!(web.reason.as_deref().unwrap().contains("not watched"));

    assert!(h.cluster.object(&secret).is_some());
    assert!(h.cluster.object(&cm("a")).is_some());
    assert!(h.cluster.object(&ResourceDescriptor::namespaced("apps/v1/Deployment", "default", "web")).is_none());
    h.stop().await.unwrap();
}

#[tokio::test]
async fn unreachable_control_plane_ends_the_run() {
    let cluster = Arc::new(MemoryCluster::new());
    let h = Harness::start(cluster, config(&["v1/ConfigMap"]), |p| {
        for _ in 0..3 {
            p.refuse("connection refused");
        }
    });
    let res = tokio::time::timeout(Duration::from_secs(5), h.run).await.unwrap().unwrap();
    assert!(matches!(res, Err(EngineError::TransportExhausted { attempts: 3, .. })), "{:?}", res);
}

#[tokio::test]
async fn shutdown_closes_the_session() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut session = None;
    let h = Harness::start(cluster.clone(), config(&["v1/ConfigMap"]), |p| session = Some(p.accept()));
    let mut s = session.unwrap();
    s.send(Inbound::Full { generation: 1, resources: vec![entry(cm("a"), 1, "x")] });
    until(&mut s, converged("a", Some(1))).await;

    h.stop().await.unwrap();
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while s.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "session still open after shutdown");
    assert!(cluster.object(&cm("a")).is_some());
}

#[tokio::test]
async fn stale_full_snapshot_requests_one_more_resync() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut first = None;
    let h = Harness::start(cluster.clone(), config(&["v1/ConfigMap"]), |p| first = Some(p.accept()));
    let mut s1 = first.unwrap();
    s1.send(Inbound::Full { generation: 5, resources: vec![entry(cm("a"), 5, "x")] });
    until(&mut s1, converged("a", Some(5))).await;

    let mut s2 = h.peer.accept();
    s1.close();
    let mut frames = until(&mut s2, |f| matches!(f, Outbound::ResyncRequest { .. })).await;

    // The control plane answers from an older generation, twice.
    s2.send(Inbound::Full { generation: 3, resources: vec![entry(cm("a"), 3, "old")] });
    s2.send(Inbound::Full { generation: 3, resources: vec![entry(cm("a"), 3, "old")] });
    frames.extend(until(&mut s2, |f| matches!(f, Outbound::ResyncRequest { reason } if reason == "stale-full")).await);

    s2.send(Inbound::Full { generation: 6, resources: vec![entry(cm("a"), 5, "x"), entry(cm("c"), 6, "c")] });
    frames.extend(until(&mut s2, converged("c", Some(6))).await);

    assert_eq!(resyncs(&frames, "stale-full"), 1);
    assert_eq!(h.cluster.object(&cm("a")).unwrap().spec["data"]["value"], "x");
    {
        let stats = h.stats.borrow();
        assert_eq!((stats.resync_requests, stats.desired_generation, stats.awaiting_full), (1, 6, false));
    }
    h.stop().await.unwrap();
}

#[tokio::test]
async fn descriptors_outside_the_watched_namespace_are_held() {
    let cluster = Arc::new(MemoryCluster::new());
    let leftover = cm("leftover");
    cluster.create(&leftover, &DesiredSpec::new(1, serde_json::json!({}))).await.unwrap();
    let prod = |name: &str| ResourceDescriptor::namespaced("v1/ConfigMap", "prod", name);

    let mut cfg = config(&["v1/ConfigMap"]);
    cfg.watch.kinds = vec![WatchFilter::kind("v1/ConfigMap").in_namespace("prod")];
    let mut session = None;
    let h = Harness::start(cluster.clone(), cfg, |p| session = Some(p.accept()));
    let mut s = session.unwrap();

    s.send(Inbound::Full { generation: 1, resources: vec![entry(cm("a"), 1, "a"), entry(prod("b"), 1, "b")] });
    let mut frames = until(&mut s, converged("b", Some(1))).await;
    if !frames.iter().any(|f| status_of(f, "a").is_some()) {
        frames.extend(until(&mut s, |f| status_of(f, "a").is_some()).await);
    }
    let held = frames.iter().rev().find_map(|f| status_of(f, "a")).unwrap();
    assert_eq!(held.health, Health::Degraded);
    assert!(held.reason.as_deref().unwrap().contains("outside watched namespace prod"), "{:?}", held.reason);

    h.stop().await.unwrap();
    assert!(cluster.object(&cm("a")).is_none());
    assert!(cluster.object(&prod("b")).is_some());
    assert!(cluster.object(&leftover).is_some_and(|o| o.is_managed()));
    assert_eq!(cluster.calls(Op::Delete), 0);
}

#[tokio::test]
async fn cluster_events_reach_the_control_plane() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut session = None;
    let h = Harness::start(cluster.clone(), config(&["v1/ConfigMap"]), |p| session = Some(p.accept()));
    let mut s = session.unwrap();
    s.send(Inbound::Full { generation: 1, resources: vec![entry(cm("a"), 1, "x")] });
    until(&mut s, converged("a", Some(1))).await;

    let ev = ResourceDescriptor::namespaced("v1/Event", "default", "a.1");
    let mut count = 0u32;
    let forwarded = loop {
        count += 1;
        assert!(count < 50, "no event forwarded");
        h.cluster.put_external(&ev, serde_json::json!({
            "involvedObject": {"kind": "ConfigMap", "name": "a"},
            "reason": "Updated",
            "type": "Normal",
            "count": count,
        }));
        match tokio::time::timeout(Duration::from_millis(100), s.recv()).await {
            Ok(Some(Outbound::Event { event })) => break event,
            Ok(Some(_)) | Err(_) => {}
            Ok(None) => panic!("session closed"),
        }
    };
    assert_eq!((forwarded.name.as_str(), forwarded.namespace.as_str()), ("a.1", "default"));
    assert_eq!((forwarded.involved_kind.as_str(), forwarded.reason.as_str()), ("ConfigMap", "Updated"));
    h.stop().await.unwrap();
}
