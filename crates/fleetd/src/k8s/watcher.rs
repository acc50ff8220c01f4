//! Per-cluster watch sessions over nodes and pods.
//!
//! Each registered cluster gets one session task per resource kind. A session
//! owns the watch stream, keeps the previously seen state for its cluster and
//! turns raw watch traffic into de-duplicated [`NodeEvent`]s / [`PodEvent`]s.
//! Full lists (the initial one and every forced resync) are reconciled
//! against the retained state, so redelivered objects that did not change
//! produce nothing and objects that vanished while the stream was down
//! produce deletes.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::PodStatus;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::k8s::diff;
use crate::k8s::error::WatchError;
use crate::k8s::event::EventKind;
use crate::k8s::event::NodeEvent;
use crate::k8s::event::NodeEventHandler;
use crate::k8s::event::PodEvent;
use crate::k8s::event::PodEventHandler;
use crate::k8s::event::PodRef;
use crate::k8s::event::ALL_FIELDS;

type NodeStateMap = Arc<DashMap<String, HashMap<String, Arc<Node>>>>;
type PodStateMap = Arc<DashMap<String, HashMap<String, PodRef>>>;

const SESSION_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Watch session tuning.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Initial node list deadline for `start_node_watch`.
    pub node_sync_timeout: Duration,
    /// Initial pod list deadline for `start_pod_watch`.
    pub pod_sync_timeout: Duration,
    /// Forced stream restart period; each restart re-lists and repairs drift.
    pub resync_interval: Duration,
    /// Pause before recreating a failed watch stream.
    pub retry_delay: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            node_sync_timeout: Duration::from_secs(30),
            pod_sync_timeout: Duration::from_secs(120),
            resync_interval: Duration::from_secs(30 * 60),
            retry_delay: Duration::from_secs(5),
        }
    }
}

struct ClusterSession {
    client: Client,
    token: CancellationToken,
    node_task: JoinHandle<()>,
    pod_task: Option<JoinHandle<()>>,
}

/// Watch sessions for every registered cluster, plus the handler fan-out.
///
/// Handlers are registered while the daemon wires itself up, before any
/// session starts; running sessions capture the handler list at spawn time.
pub struct FleetWatcher {
    config: WatchConfig,
    sessions: DashMap<String, ClusterSession>,
    known_nodes: NodeStateMap,
    known_pods: PodStateMap,
    node_handlers: Vec<Arc<dyn NodeEventHandler>>,
    pod_handlers: Vec<Arc<dyn PodEventHandler>>,
}

impl FleetWatcher {
    pub fn new(config: WatchConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            known_nodes: Arc::new(DashMap::new()),
            known_pods: Arc::new(DashMap::new()),
            node_handlers: Vec::new(),
            pod_handlers: Vec::new(),
        }
    }

    pub fn register_node_handler(&mut self, handler: Arc<dyn NodeEventHandler>) {
        self.node_handlers.push(handler);
    }

    pub fn register_pod_handler(&mut self, handler: Arc<dyn PodEventHandler>) {
        self.pod_handlers.push(handler);
    }

    /// Start watching nodes on a cluster and wait for the initial list.
    ///
    /// Returns the initial node inventory so callers can seed caches without
    /// a second LIST. Idempotent: a duplicate start logs a warning and
    /// returns the currently retained inventory. A timeout tears the session
    /// back down so no half-started state remains.
    ///
    /// # Errors
    ///
    /// - [`WatchError::SyncTimeout`] if the initial list does not land in time
    /// - [`WatchError::WatchFailed`] if the session dies before the first list
    pub async fn start_node_watch(
        &self,
        cluster: &str,
        client: Client,
    ) -> Result<Vec<Arc<Node>>, Report<WatchError>> {
        let ready_rx = match self.sessions.entry(cluster.to_string()) {
            Entry::Occupied(_) => {
                warn!(cluster = %cluster, "Node watch already running, ignoring duplicate start");
                return Ok(self.cluster_nodes(cluster));
            }
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                let (ready_tx, ready_rx) = oneshot::channel();
                let task = tokio::spawn(run_node_session(NodeSessionParams {
                    cluster: cluster.to_string(),
                    client: client.clone(),
                    token: token.clone(),
                    known: self.known_nodes.clone(),
                    handlers: self.node_handlers.clone(),
                    config: self.config.clone(),
                    ready: ready_tx,
                }));
                slot.insert(ClusterSession {
                    client,
                    token,
                    node_task: task,
                    pod_task: None,
                });
                ready_rx
            }
        };

        match timeout(self.config.node_sync_timeout, ready_rx).await {
            Ok(Ok(inventory)) => {
                info!(cluster = %cluster, nodes = inventory.len(), "Node watch synchronized");
                Ok(inventory)
            }
            Ok(Err(_)) => {
                self.drop_session(cluster).await;
                Err(Report::new(WatchError::WatchFailed {
                    cluster: cluster.to_string(),
                    message: "watch session ended before the initial list completed".to_string(),
                }))
            }
            Err(_) => {
                self.drop_session(cluster).await;
                Err(Report::new(WatchError::SyncTimeout {
                    cluster: cluster.to_string(),
                    resource: "node",
                    timeout_secs: self.config.node_sync_timeout.as_secs(),
                }))
            }
        }
    }

    /// Start watching pods on a cluster whose node watch is already active.
    ///
    /// Pod discovery is optional per cluster and strictly layered on top of
    /// the node watch. A timeout rolls back only the pod side; the node
    /// session keeps running.
    ///
    /// # Errors
    ///
    /// - [`WatchError::NodeWatchNotStarted`] without an active node session
    /// - [`WatchError::SyncTimeout`] if the initial pod list does not land
    pub async fn start_pod_watch(&self, cluster: &str) -> Result<(), Report<WatchError>> {
        let (client, pod_token) = {
            let Some(session) = self.sessions.get(cluster) else {
                return Err(Report::new(WatchError::NodeWatchNotStarted {
                    cluster: cluster.to_string(),
                }));
            };
            if session
                .pod_task
                .as_ref()
                .is_some_and(|task| !task.is_finished())
            {
                warn!(cluster = %cluster, "Pod watch already running, ignoring duplicate start");
                return Ok(());
            }
            (session.client.clone(), session.token.child_token())
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(run_pod_session(PodSessionParams {
            cluster: cluster.to_string(),
            client,
            token: pod_token.clone(),
            known: self.known_pods.clone(),
            handlers: self.pod_handlers.clone(),
            config: self.config.clone(),
            ready: ready_tx,
        }));

        match timeout(self.config.pod_sync_timeout, ready_rx).await {
            Ok(Ok(count)) => {
                match self.sessions.get_mut(cluster) {
                    Some(mut session) => session.pod_task = Some(task),
                    // the cluster was stopped while the list was in flight
                    None => pod_token.cancel(),
                }
                info!(cluster = %cluster, pods = count, "Pod watch synchronized");
                Ok(())
            }
            Ok(Err(_)) => {
                pod_token.cancel();
                self.known_pods.remove(cluster);
                Err(Report::new(WatchError::WatchFailed {
                    cluster: cluster.to_string(),
                    message: "pod watch session ended before the initial list completed"
                        .to_string(),
                }))
            }
            Err(_) => {
                pod_token.cancel();
                self.known_pods.remove(cluster);
                Err(Report::new(WatchError::SyncTimeout {
                    cluster: cluster.to_string(),
                    resource: "pod",
                    timeout_secs: self.config.pod_sync_timeout.as_secs(),
                }))
            }
        }
    }

    /// Stop a cluster's watch session and drop its retained state.
    pub async fn stop(&self, cluster: &str) {
        if !self.sessions.contains_key(cluster) {
            warn!(cluster = %cluster, "Stop requested for a cluster with no watch session");
            return;
        }
        self.drop_session(cluster).await;
        info!(cluster = %cluster, "Watch session stopped");
    }

    /// Stop every session; used on daemon shutdown.
    pub async fn stop_all(&self) {
        let clusters: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for cluster in clusters {
            self.drop_session(&cluster).await;
        }
        info!("All watch sessions stopped");
    }

    /// Cluster name to whether its node session task is still alive.
    pub fn watch_status(&self) -> HashMap<String, bool> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), !entry.value().node_task.is_finished()))
            .collect()
    }

    /// Currently retained node snapshots for one cluster.
    pub fn cluster_nodes(&self, cluster: &str) -> Vec<Arc<Node>> {
        self.known_nodes
            .get(cluster)
            .map(|nodes| nodes.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn drop_session(&self, cluster: &str) {
        let Some((_, session)) = self.sessions.remove(cluster) else {
            return;
        };
        session.token.cancel();
        join_session_task(cluster, "node", session.node_task).await;
        if let Some(task) = session.pod_task {
            join_session_task(cluster, "pod", task).await;
        }
        self.known_nodes.remove(cluster);
        self.known_pods.remove(cluster);
    }
}

async fn join_session_task(cluster: &str, kind: &str, task: JoinHandle<()>) {
    match timeout(SESSION_STOP_TIMEOUT, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(cluster = %cluster, task = kind, "Watch task ended abnormally: {e}"),
        Err(_) => {
            warn!(cluster = %cluster, task = kind, "Watch task did not stop within {SESSION_STOP_TIMEOUT:?}")
        }
    }
}

struct NodeSessionParams {
    cluster: String,
    client: Client,
    token: CancellationToken,
    known: NodeStateMap,
    handlers: Vec<Arc<dyn NodeEventHandler>>,
    config: WatchConfig,
    ready: oneshot::Sender<Vec<Arc<Node>>>,
}

#[tracing::instrument(skip_all, fields(cluster = %params.cluster))]
async fn run_node_session(params: NodeSessionParams) {
    let NodeSessionParams {
        cluster,
        client,
        token,
        known,
        handlers,
        config,
        ready,
    } = params;
    info!("Starting node watch session");
    let mut ready = Some(ready);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Node watch shutdown requested");
                break;
            }
            result = watch_nodes_once(&cluster, &client, &known, &handlers, &config, &mut ready) => {
                match result {
                    Ok(()) => {
                        debug!("Restarting node watch stream for a scheduled resync");
                    }
                    Err(e) => {
                        error!("Node watch failed: {e:?}");
                        tokio::time::sleep(config.retry_delay).await;
                    }
                }
            }
        }
    }
}

async fn watch_nodes_once(
    cluster: &str,
    client: &Client,
    known: &DashMap<String, HashMap<String, Arc<Node>>>,
    handlers: &[Arc<dyn NodeEventHandler>],
    config: &WatchConfig,
    ready: &mut Option<oneshot::Sender<Vec<Arc<Node>>>>,
) -> Result<(), Report<WatchError>> {
    let api: Api<Node> = Api::all(client.clone());
    let mut stream = watcher(api, WatcherConfig::default()).boxed();
    let resync = tokio::time::sleep(config.resync_interval);
    tokio::pin!(resync);

    loop {
        tokio::select! {
            _ = &mut resync => {
                return Ok(());
            }
            event = stream.next() => {
                match event {
                    Some(Ok(Event::Restarted(nodes))) => {
                        let (events, inventory) = reconcile_nodes(cluster, known, nodes);
                        if let Some(sender) = ready.take() {
                            let _ = sender.send(inventory);
                        }
                        dispatch_node_events(handlers, events);
                    }
                    Some(Ok(Event::Applied(node))) => {
                        dispatch_node_events(handlers, apply_node(cluster, known, node));
                    }
                    Some(Ok(Event::Deleted(node))) => {
                        dispatch_node_events(handlers, remove_node(cluster, known, &node));
                    }
                    Some(Err(e)) => {
                        return Err(Report::new(WatchError::WatchFailed {
                            cluster: cluster.to_string(),
                            message: format!("watch stream error: {e}"),
                        }));
                    }
                    None => {
                        return Err(Report::new(WatchError::WatchFailed {
                            cluster: cluster.to_string(),
                            message: "watch stream ended".to_string(),
                        }));
                    }
                }
            }
        }
    }
}

struct PodSessionParams {
    cluster: String,
    client: Client,
    token: CancellationToken,
    known: PodStateMap,
    handlers: Vec<Arc<dyn PodEventHandler>>,
    config: WatchConfig,
    ready: oneshot::Sender<usize>,
}

#[tracing::instrument(skip_all, fields(cluster = %params.cluster))]
async fn run_pod_session(params: PodSessionParams) {
    let PodSessionParams {
        cluster,
        client,
        token,
        known,
        handlers,
        config,
        ready,
    } = params;
    info!("Starting pod watch session");
    let mut ready = Some(ready);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Pod watch shutdown requested");
                break;
            }
            result = watch_pods_once(&cluster, &client, &known, &handlers, &config, &mut ready) => {
                match result {
                    Ok(()) => {
                        debug!("Restarting pod watch stream for a scheduled resync");
                    }
                    Err(e) => {
                        error!("Pod watch failed: {e:?}");
                        tokio::time::sleep(config.retry_delay).await;
                    }
                }
            }
        }
    }
}

async fn watch_pods_once(
    cluster: &str,
    client: &Client,
    known: &DashMap<String, HashMap<String, PodRef>>,
    handlers: &[Arc<dyn PodEventHandler>],
    config: &WatchConfig,
    ready: &mut Option<oneshot::Sender<usize>>,
) -> Result<(), Report<WatchError>> {
    let api: Api<Pod> = Api::all(client.clone());
    let mut stream = watcher(api, WatcherConfig::default()).boxed();
    let resync = tokio::time::sleep(config.resync_interval);
    tokio::pin!(resync);

    loop {
        tokio::select! {
            _ = &mut resync => {
                return Ok(());
            }
            event = stream.next() => {
                match event {
                    Some(Ok(Event::Restarted(pods))) => {
                        let (events, count) = reconcile_pods(cluster, known, pods);
                        if let Some(sender) = ready.take() {
                            let _ = sender.send(count);
                        }
                        dispatch_pod_events(handlers, events);
                    }
                    Some(Ok(Event::Applied(pod))) => {
                        dispatch_pod_events(handlers, apply_pod(cluster, known, pod));
                    }
                    Some(Ok(Event::Deleted(pod))) => {
                        dispatch_pod_events(handlers, remove_pod(cluster, known, pod));
                    }
                    Some(Err(e)) => {
                        return Err(Report::new(WatchError::WatchFailed {
                            cluster: cluster.to_string(),
                            message: format!("watch stream error: {e}"),
                        }));
                    }
                    None => {
                        return Err(Report::new(WatchError::WatchFailed {
                            cluster: cluster.to_string(),
                            message: "watch stream ended".to_string(),
                        }));
                    }
                }
            }
        }
    }
}

/// Reconcile a full node list against the retained state: unknown objects
/// become adds, changed ones updates, vanished ones deletes. Unchanged
/// objects produce nothing, so a forced re-list of a quiet cluster is silent.
fn reconcile_nodes(
    cluster: &str,
    known: &DashMap<String, HashMap<String, Arc<Node>>>,
    nodes: Vec<Node>,
) -> (Vec<NodeEvent>, Vec<Arc<Node>>) {
    let occurred_at = Utc::now();
    let mut events = Vec::new();
    let mut inventory = Vec::with_capacity(nodes.len());
    let mut fresh: HashMap<String, Arc<Node>> = HashMap::with_capacity(nodes.len());
    let mut retained = known.entry(cluster.to_string()).or_default();

    for node in nodes {
        let Some(name) = node.metadata.name.clone() else {
            continue;
        };
        let node = Arc::new(node);
        inventory.push(node.clone());
        match retained.get(&name) {
            Some(previous) => {
                let changes = diff::detect_changes(previous, &node);
                if !changes.is_empty() {
                    events.push(NodeEvent {
                        kind: EventKind::Updated,
                        cluster: cluster.to_string(),
                        node: node.clone(),
                        previous: Some(previous.clone()),
                        changes,
                        occurred_at,
                    });
                }
            }
            None => {
                events.push(NodeEvent {
                    kind: EventKind::Added,
                    cluster: cluster.to_string(),
                    node: node.clone(),
                    previous: None,
                    changes: vec![ALL_FIELDS.to_string()],
                    occurred_at,
                });
            }
        }
        fresh.insert(name, node);
    }

    for (name, previous) in retained.iter() {
        if !fresh.contains_key(name) {
            events.push(NodeEvent {
                kind: EventKind::Deleted,
                cluster: cluster.to_string(),
                node: previous.clone(),
                previous: None,
                changes: vec![ALL_FIELDS.to_string()],
                occurred_at,
            });
        }
    }

    *retained = fresh;
    (events, inventory)
}

fn apply_node(
    cluster: &str,
    known: &DashMap<String, HashMap<String, Arc<Node>>>,
    node: Node,
) -> Option<NodeEvent> {
    let name = node.metadata.name.clone()?;
    let node = Arc::new(node);
    let mut retained = known.entry(cluster.to_string()).or_default();
    let event = match retained.get(&name) {
        Some(previous) => {
            let changes = diff::detect_changes(previous, &node);
            if changes.is_empty() {
                None
            } else {
                Some(NodeEvent {
                    kind: EventKind::Updated,
                    cluster: cluster.to_string(),
                    node: node.clone(),
                    previous: Some(previous.clone()),
                    changes,
                    occurred_at: Utc::now(),
                })
            }
        }
        None => Some(NodeEvent {
            kind: EventKind::Added,
            cluster: cluster.to_string(),
            node: node.clone(),
            previous: None,
            changes: vec![ALL_FIELDS.to_string()],
            occurred_at: Utc::now(),
        }),
    };
    retained.insert(name, node);
    event
}

fn remove_node(
    cluster: &str,
    known: &DashMap<String, HashMap<String, Arc<Node>>>,
    node: &Node,
) -> Option<NodeEvent> {
    let name = node.metadata.name.as_deref()?;
    let removed = known
        .get_mut(cluster)
        .and_then(|mut retained| retained.remove(name));
    Some(NodeEvent {
        kind: EventKind::Deleted,
        cluster: cluster.to_string(),
        node: removed.unwrap_or_else(|| Arc::new(node.clone())),
        previous: None,
        changes: vec![ALL_FIELDS.to_string()],
        occurred_at: Utc::now(),
    })
}

/// Reconcile a full pod list, returning the events plus the fresh pod count.
/// Updates are emitted only when placement or phase moved; pods that vanished
/// between lists become deletes carrying a rebuilt identifying body.
fn reconcile_pods(
    cluster: &str,
    known: &DashMap<String, HashMap<String, PodRef>>,
    pods: Vec<Pod>,
) -> (Vec<PodEvent>, usize) {
    let occurred_at = Utc::now();
    let mut events = Vec::new();
    let mut fresh: HashMap<String, PodRef> = HashMap::with_capacity(pods.len());
    let mut retained = known.entry(cluster.to_string()).or_default();

    for pod in pods {
        let record = PodRef::from_pod(&pod);
        if record.uid.is_empty() {
            continue;
        }
        match retained.get(&record.uid) {
            Some(previous) => {
                if previous.node_name != record.node_name || previous.phase != record.phase {
                    events.push(PodEvent {
                        kind: EventKind::Updated,
                        cluster: cluster.to_string(),
                        pod: Arc::new(pod),
                        previous: Some(previous.clone()),
                        occurred_at,
                    });
                }
            }
            None => {
                events.push(PodEvent {
                    kind: EventKind::Added,
                    cluster: cluster.to_string(),
                    pod: Arc::new(pod),
                    previous: None,
                    occurred_at,
                });
            }
        }
        fresh.insert(record.uid.clone(), record);
    }

    for (uid, previous) in retained.iter() {
        if !fresh.contains_key(uid) {
            events.push(PodEvent {
                kind: EventKind::Deleted,
                cluster: cluster.to_string(),
                pod: Arc::new(pod_tombstone(previous)),
                previous: None,
                occurred_at,
            });
        }
    }

    let count = fresh.len();
    *retained = fresh;
    (events, count)
}

fn apply_pod(
    cluster: &str,
    known: &DashMap<String, HashMap<String, PodRef>>,
    pod: Pod,
) -> Option<PodEvent> {
    let record = PodRef::from_pod(&pod);
    if record.uid.is_empty() {
        return None;
    }
    let previous = known
        .entry(cluster.to_string())
        .or_default()
        .insert(record.uid.clone(), record.clone());
    match previous {
        Some(previous) => {
            if previous.node_name == record.node_name && previous.phase == record.phase {
                // neither placement nor lifecycle moved
                None
            } else {
                Some(PodEvent {
                    kind: EventKind::Updated,
                    cluster: cluster.to_string(),
                    pod: Arc::new(pod),
                    previous: Some(previous),
                    occurred_at: Utc::now(),
                })
            }
        }
        None => Some(PodEvent {
            kind: EventKind::Added,
            cluster: cluster.to_string(),
            pod: Arc::new(pod),
            previous: None,
            occurred_at: Utc::now(),
        }),
    }
}

fn remove_pod(
    cluster: &str,
    known: &DashMap<String, HashMap<String, PodRef>>,
    pod: Pod,
) -> Option<PodEvent> {
    let record = PodRef::from_pod(&pod);
    if record.uid.is_empty() {
        return None;
    }
    if let Some(mut retained) = known.get_mut(cluster) {
        retained.remove(&record.uid);
    }
    Some(PodEvent {
        kind: EventKind::Deleted,
        cluster: cluster.to_string(),
        pod: Arc::new(pod),
        previous: None,
        occurred_at: Utc::now(),
    })
}

/// Rebuild the identifying fields of a pod that vanished between lists.
fn pod_tombstone(record: &PodRef) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(record.name.clone()),
            uid: Some(record.uid.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: (!record.node_name.is_empty()).then(|| record.node_name.clone()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: (!record.phase.is_empty()).then(|| record.phase.clone()),
            ..Default::default()
        }),
    }
}

/// Hand one event to every handler, each on its own task with panics caught
/// and logged. A misbehaving handler never disturbs its neighbors or the
/// watch loop that produced the event.
fn dispatch_node_events(
    handlers: &[Arc<dyn NodeEventHandler>],
    events: impl IntoIterator<Item = NodeEvent>,
) {
    for event in events {
        log_node_event(&event);
        for (index, handler) in handlers.iter().enumerate() {
            let handler = handler.clone();
            let event = event.clone();
            tokio::spawn(async move {
                let call = AssertUnwindSafe(|| handler.on_node_event(event));
                if let Err(panic) = std::panic::catch_unwind(call) {
                    error!(
                        handler = index,
                        "Node event handler panicked: {}",
                        panic_message(panic.as_ref())
                    );
                }
            });
        }
    }
}

fn dispatch_pod_events(
    handlers: &[Arc<dyn PodEventHandler>],
    events: impl IntoIterator<Item = PodEvent>,
) {
    for event in events {
        debug!(
            cluster = %event.cluster,
            pod = %event.pod_name(),
            kind = ?event.kind,
            "Pod event"
        );
        for (index, handler) in handlers.iter().enumerate() {
            let handler = handler.clone();
            let event = event.clone();
            tokio::spawn(async move {
                let call = AssertUnwindSafe(|| handler.on_pod_event(event));
                if let Err(panic) = std::panic::catch_unwind(call) {
                    error!(
                        handler = index,
                        "Pod event handler panicked: {}",
                        panic_message(panic.as_ref())
                    );
                }
            });
        }
    }
}

fn log_node_event(event: &NodeEvent) {
    match event.kind {
        EventKind::Added => {
            info!(cluster = %event.cluster, node = %event.node_name(), "Node added");
        }
        EventKind::Deleted => {
            info!(cluster = %event.cluster, node = %event.node_name(), "Node deleted");
        }
        EventKind::Updated => {
            if diff::is_important_change(&event.changes) {
                info!(
                    cluster = %event.cluster,
                    node = %event.node_name(),
                    changes = ?event.changes,
                    "Node changed"
                );
            } else {
                debug!(
                    cluster = %event.cluster,
                    node = %event.node_name(),
                    changes = ?event.changes,
                    "Node metadata changed"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "opaque panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::NodeSpec;
    use test_log::test;

    use super::*;

    fn test_node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: None,
        }
    }

    fn cordoned(name: &str) -> Node {
        let mut node = test_node(name);
        node.spec = Some(NodeSpec {
            unschedulable: Some(true),
            ..Default::default()
        });
        node
    }

    fn test_pod(uid: &str, name: &str, node: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: (!node.is_empty()).then(|| node.to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn initial_list_produces_adds_and_fills_state() {
        let known = DashMap::new();
        let (events, inventory) = reconcile_nodes(
            "prod-eu",
            &known,
            vec![test_node("worker-1"), test_node("worker-2")],
        );

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.kind == EventKind::Added));
        assert!(events
            .iter()
            .all(|event| event.changes == vec![ALL_FIELDS.to_string()]));
        assert_eq!(inventory.len(), 2);
        assert_eq!(known.get("prod-eu").map(|nodes| nodes.len()), Some(2));
    }

    #[test]
    fn unchanged_relist_is_silent() {
        let known = DashMap::new();
        reconcile_nodes("prod-eu", &known, vec![test_node("worker-1")]);

        let (events, inventory) = reconcile_nodes("prod-eu", &known, vec![test_node("worker-1")]);
        assert!(events.is_empty(), "quiet resync must produce no events");
        assert_eq!(inventory.len(), 1);
    }

    #[test]
    fn relist_detects_update_and_delete() {
        let known = DashMap::new();
        reconcile_nodes(
            "prod-eu",
            &known,
            vec![test_node("worker-1"), test_node("worker-2")],
        );

        let (events, _) = reconcile_nodes("prod-eu", &known, vec![cordoned("worker-1")]);

        let update = events
            .iter()
            .find(|event| event.kind == EventKind::Updated)
            .expect("update for worker-1");
        assert_eq!(update.changes, vec!["schedulable".to_string()]);
        assert!(update.previous.is_some(), "updates carry the prior snapshot");

        let delete = events
            .iter()
            .find(|event| event.kind == EventKind::Deleted)
            .expect("delete for vanished worker-2");
        assert_eq!(delete.node_name(), "worker-2");
        assert_eq!(known.get("prod-eu").map(|nodes| nodes.len()), Some(1));
    }

    #[test]
    fn apply_node_suppresses_no_op_updates() {
        let known = DashMap::new();
        assert!(apply_node("prod-eu", &known, test_node("worker-1")).is_some());
        assert!(
            apply_node("prod-eu", &known, test_node("worker-1")).is_none(),
            "identical redelivery must be suppressed"
        );

        let update =
            apply_node("prod-eu", &known, cordoned("worker-1")).expect("cordon is a change");
        assert_eq!(update.kind, EventKind::Updated);
        assert_eq!(update.changes, vec!["schedulable".to_string()]);
    }

    #[test]
    fn remove_node_prefers_retained_snapshot() {
        let known = DashMap::new();
        apply_node("prod-eu", &known, cordoned("worker-1"));

        let event = remove_node("prod-eu", &known, &test_node("worker-1")).expect("delete event");
        assert_eq!(event.kind, EventKind::Deleted);
        assert_eq!(
            event.node.spec.as_ref().and_then(|spec| spec.unschedulable),
            Some(true),
            "delete should carry the last retained body"
        );
        assert_eq!(known.get("prod-eu").map(|nodes| nodes.len()), Some(0));
    }

    #[test]
    fn apply_pod_emits_only_placement_or_phase_moves() {
        let known = DashMap::new();
        let added = apply_pod("prod-eu", &known, test_pod("uid-1", "web-0", "worker-1", "Pending"))
            .expect("first sighting");
        assert_eq!(added.kind, EventKind::Added);

        assert!(
            apply_pod("prod-eu", &known, test_pod("uid-1", "web-0", "worker-1", "Pending"))
                .is_none(),
            "same node and phase must be suppressed"
        );

        let update = apply_pod("prod-eu", &known, test_pod("uid-1", "web-0", "worker-1", "Running"))
            .expect("phase move");
        assert_eq!(update.kind, EventKind::Updated);
        assert_eq!(
            update.previous.as_ref().map(|previous| previous.phase.as_str()),
            Some("Pending")
        );
    }

    #[test]
    fn pod_relist_synthesizes_deletes_for_vanished_pods() {
        let known = DashMap::new();
        reconcile_pods(
            "prod-eu",
            &known,
            vec![
                test_pod("uid-1", "web-0", "worker-1", "Running"),
                test_pod("uid-2", "web-1", "worker-2", "Running"),
            ],
        );

        let (events, count) = reconcile_pods(
            "prod-eu",
            &known,
            vec![test_pod("uid-1", "web-0", "worker-1", "Running")],
        );

        assert_eq!(count, 1);
        assert_eq!(events.len(), 1);
        let delete = &events[0];
        assert_eq!(delete.kind, EventKind::Deleted);
        assert_eq!(delete.pod.metadata.uid.as_deref(), Some("uid-2"));
        assert_eq!(
            delete
                .pod
                .spec
                .as_ref()
                .and_then(|spec| spec.node_name.as_deref()),
            Some("worker-2"),
            "tombstone must carry the recorded placement"
        );
    }

    #[test]
    fn pods_without_uid_are_ignored() {
        let known = DashMap::new();
        let mut pod = test_pod("", "web-0", "worker-1", "Running");
        pod.metadata.uid = None;
        assert!(apply_pod("prod-eu", &known, pod).is_none());
    }

    struct CountingHandler {
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl NodeEventHandler for CountingHandler {
        fn on_node_event(&self, event: NodeEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .expect("poisoned")
                .push(event.node_name().to_string());
        }
    }

    struct PanickingHandler;

    impl NodeEventHandler for PanickingHandler {
        fn on_node_event(&self, _event: NodeEvent) {
            panic!("handler exploded");
        }
    }

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn handler_panic_does_not_starve_neighbors() {
        let counting = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let handlers: Vec<Arc<dyn NodeEventHandler>> =
            vec![Arc::new(PanickingHandler), counting.clone()];

        let event = NodeEvent {
            kind: EventKind::Added,
            cluster: "prod-eu".to_string(),
            node: Arc::new(test_node("worker-1")),
            previous: None,
            changes: vec![ALL_FIELDS.to_string()],
            occurred_at: Utc::now(),
        };
        dispatch_node_events(&handlers, vec![event.clone(), event]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            counting.calls.load(Ordering::SeqCst),
            2,
            "surviving handler must see every event despite its panicking neighbor"
        );
        assert_eq!(
            counting.seen.lock().expect("poisoned").as_slice(),
            ["worker-1", "worker-1"]
        );
    }
}
