//! WebSocket notification hub.
//!
//! One task owns the whole client registry; connection handlers and event
//! producers talk to it through commands on bounded channels, so every
//! mutation is serialized without a lock. Delivery to clients never blocks:
//! a client whose outbound queue is full gets disconnected instead of
//! stalling the hub loop or buffering without bound.

mod projector;

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;
use std::time::Instant;

use api_types::HubStats;
use api_types::StreamMessage;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use projector::NodeEventProjector;

/// Hub tuning.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Heartbeat period.
    pub ping_interval: Duration,
    /// Cutoff after which a silent client is dropped.
    pub client_timeout: Duration,
    /// Per-client outbound queue depth.
    pub client_queue_depth: usize,
    /// Shared broadcast queue depth between event producers and the hub.
    pub broadcast_queue_depth: usize,
    /// Control command queue depth.
    pub command_queue_depth: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(60),
            client_queue_depth: 256,
            broadcast_queue_depth: 1024,
            command_queue_depth: 256,
        }
    }
}

enum HubCommand {
    Register {
        client_id: String,
        outbound: mpsc::Sender<StreamMessage>,
        clusters: Vec<String>,
    },
    Unregister {
        client_id: String,
    },
    Subscribe {
        client_id: String,
        cluster: String,
    },
    Unsubscribe {
        client_id: String,
        cluster: String,
    },
    Pong {
        client_id: String,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Producer-side handle to the hub task. Cheap to clone.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    events: mpsc::Sender<StreamMessage>,
    client_queue_depth: usize,
}

impl HubHandle {
    /// Bounded outbound queue pair for a new client connection.
    pub fn client_queue(&self) -> (mpsc::Sender<StreamMessage>, mpsc::Receiver<StreamMessage>) {
        mpsc::channel(self.client_queue_depth)
    }

    pub async fn register(
        &self,
        client_id: &str,
        outbound: mpsc::Sender<StreamMessage>,
        clusters: Vec<String>,
    ) {
        self.send(HubCommand::Register {
            client_id: client_id.to_string(),
            outbound,
            clusters,
        })
        .await;
    }

    pub async fn unregister(&self, client_id: &str) {
        self.send(HubCommand::Unregister {
            client_id: client_id.to_string(),
        })
        .await;
    }

    pub async fn subscribe(&self, client_id: &str, cluster: &str) {
        self.send(HubCommand::Subscribe {
            client_id: client_id.to_string(),
            cluster: cluster.to_string(),
        })
        .await;
    }

    pub async fn unsubscribe(&self, client_id: &str, cluster: &str) {
        self.send(HubCommand::Unsubscribe {
            client_id: client_id.to_string(),
            cluster: cluster.to_string(),
        })
        .await;
    }

    pub async fn pong(&self, client_id: &str) {
        self.send(HubCommand::Pong {
            client_id: client_id.to_string(),
        })
        .await;
    }

    /// Non-blocking enqueue onto the broadcast queue. When even that queue
    /// is full the message is dropped with a warning; event producers must
    /// never wait on the hub.
    pub fn broadcast(&self, message: StreamMessage) {
        if let Err(e) = self.events.try_send(message) {
            warn!("Dropping stream message, hub broadcast queue unavailable: {e}");
        }
    }

    pub async fn stats(&self) -> HubStats {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply: reply_tx }).await;
        reply_rx.await.unwrap_or_default()
    }

    async fn send(&self, command: HubCommand) {
        if self.commands.send(command).await.is_err() {
            warn!("Hub task is gone, command dropped");
        }
    }
}

struct HubClient {
    outbound: mpsc::Sender<StreamMessage>,
    subscriptions: HashSet<String>,
    last_seen: Instant,
}

/// The hub task state. Built with [`NotificationHub::new`] and consumed by
/// [`NotificationHub::run`].
pub struct NotificationHub {
    config: HubConfig,
    commands: mpsc::Receiver<HubCommand>,
    events: mpsc::Receiver<StreamMessage>,
    clients: HashMap<String, HubClient>,
    // cluster name to subscribed client ids
    subscriptions: HashMap<String, HashSet<String>>,
}

impl NotificationHub {
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (command_tx, command_rx) = mpsc::channel(config.command_queue_depth);
        let (event_tx, event_rx) = mpsc::channel(config.broadcast_queue_depth);
        let handle = HubHandle {
            commands: command_tx,
            events: event_tx,
            client_queue_depth: config.client_queue_depth,
        };
        let hub = Self {
            config,
            commands: command_rx,
            events: event_rx,
            clients: HashMap::new(),
            subscriptions: HashMap::new(),
        };
        (hub, handle)
    }

    pub async fn run(mut self, token: CancellationToken) {
        info!("Notification hub started");
        let mut heartbeat = tokio::time::interval(self.config.ping_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Notification hub shutting down");
                    break;
                }
                _ = heartbeat.tick() => self.sweep_clients(),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                message = self.events.recv() => match message {
                    Some(message) => self.broadcast(message),
                    None => break,
                },
            }
        }

        // dropping the registry closes every client queue and with it the
        // per-connection write pumps
        self.clients.clear();
    }

    fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register {
                client_id,
                outbound,
                clusters,
            } => self.register_client(client_id, outbound, clusters),
            HubCommand::Unregister { client_id } => {
                self.unregister_client(&client_id, "client disconnected");
            }
            HubCommand::Subscribe { client_id, cluster } => self.subscribe(&client_id, cluster),
            HubCommand::Unsubscribe { client_id, cluster } => {
                self.unsubscribe(&client_id, &cluster);
            }
            HubCommand::Pong { client_id } => self.touch(&client_id),
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn register_client(
        &mut self,
        client_id: String,
        outbound: mpsc::Sender<StreamMessage>,
        clusters: Vec<String>,
    ) {
        if outbound.try_send(StreamMessage::connected()).is_err() {
            warn!(client = %client_id, "Client queue rejected the greeting, dropping registration");
            return;
        }
        let mut subscriptions = HashSet::new();
        for cluster in clusters {
            self.subscriptions
                .entry(cluster.clone())
                .or_default()
                .insert(client_id.clone());
            subscriptions.insert(cluster);
        }
        info!(
            client = %client_id,
            subscriptions = subscriptions.len(),
            "Stream client registered"
        );
        self.clients.insert(
            client_id,
            HubClient {
                outbound,
                subscriptions,
                last_seen: Instant::now(),
            },
        );
    }

    fn unregister_client(&mut self, client_id: &str, reason: &str) {
        let Some(client) = self.clients.remove(client_id) else {
            return;
        };
        for cluster in &client.subscriptions {
            let now_empty = match self.subscriptions.get_mut(cluster) {
                Some(subscribers) => {
                    subscribers.remove(client_id);
                    subscribers.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.subscriptions.remove(cluster);
            }
        }
        info!(client = %client_id, reason = reason, "Stream client unregistered");
    }

    fn subscribe(&mut self, client_id: &str, cluster: String) {
        let Some(client) = self.clients.get_mut(client_id) else {
            warn!(client = %client_id, "Subscribe from an unregistered client");
            return;
        };
        client.last_seen = Instant::now();
        client.subscriptions.insert(cluster.clone());
        self.subscriptions
            .entry(cluster.clone())
            .or_default()
            .insert(client_id.to_string());
        debug!(client = %client_id, cluster = %cluster, "Client subscribed");
    }

    fn unsubscribe(&mut self, client_id: &str, cluster: &str) {
        if let Some(client) = self.clients.get_mut(client_id) {
            client.last_seen = Instant::now();
            client.subscriptions.remove(cluster);
        }
        let now_empty = match self.subscriptions.get_mut(cluster) {
            Some(subscribers) => {
                subscribers.remove(client_id);
                subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.subscriptions.remove(cluster);
        }
        debug!(client = %client_id, cluster = %cluster, "Client unsubscribed");
    }

    fn touch(&mut self, client_id: &str) {
        if let Some(client) = self.clients.get_mut(client_id) {
            client.last_seen = Instant::now();
        }
    }

    /// Deliver one message: cluster-tagged messages go to that cluster's
    /// subscribers, untagged ones to every client.
    fn broadcast(&mut self, message: StreamMessage) {
        let targets: Vec<String> = match message.cluster_name.as_deref() {
            Some(cluster) => self
                .subscriptions
                .get(cluster)
                .map(|subscribers| subscribers.iter().cloned().collect())
                .unwrap_or_default(),
            None => self.clients.keys().cloned().collect(),
        };

        let mut stalled = Vec::new();
        for client_id in targets {
            let Some(client) = self.clients.get(&client_id) else {
                continue;
            };
            if let Err(e) = client.outbound.try_send(message.clone()) {
                warn!(client = %client_id, "Disconnecting slow stream consumer: {e}");
                stalled.push(client_id);
            }
        }
        for client_id in stalled {
            self.unregister_client(&client_id, "outbound queue overflow");
        }
    }

    /// Drop clients silent past the timeout, then ping the survivors.
    fn sweep_clients(&mut self) {
        let stale: Vec<String> = self
            .clients
            .iter()
            .filter(|(_, client)| client.last_seen.elapsed() > self.config.client_timeout)
            .map(|(client_id, _)| client_id.clone())
            .collect();
        for client_id in stale {
            warn!(client = %client_id, "Dropping unresponsive stream client");
            self.unregister_client(&client_id, "heartbeat timeout");
        }

        let ping = StreamMessage::ping();
        let mut unreachable = Vec::new();
        for (client_id, client) in &self.clients {
            if client.outbound.try_send(ping.clone()).is_err() {
                unreachable.push(client_id.clone());
            }
        }
        for client_id in unreachable {
            self.unregister_client(&client_id, "ping enqueue failed");
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            client_count: self.clients.len(),
            subscription_count: self
                .subscriptions
                .values()
                .map(|subscribers| subscribers.len())
                .sum(),
        }
    }
}
