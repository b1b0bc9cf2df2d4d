//! Node runtime
//!
//! `Node::start` moves a `Router` into its own task and hands back a
//! cloneable `NodeHandle`. The task is the only writer of routing state; it
//! multiplexes handle commands, transport events and the two timers.

use std::sync::Arc;
use std::time::Duration;

use relaymesh_network::{Transport, TransportEvent};
use relaymesh_protocol::{NodeId, PacketId, Priority};
use relaymesh_routing::events::{MeshEvent, NetworkStatus};
use relaymesh_routing::router::{MessageHandle, Router, RouterConfig, RouterStats};
use relaymesh_routing::{
    Chat, Group, LoadedIdentity, Message, Peer, Persistence, PowerMode, QueuedMessage, RouteEntry,
};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::{NodeError, Result};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<T>;
type RoutingResult<T> = relaymesh_routing::Result<T>;

enum Command {
    SendMessage {
        destination: NodeId,
        content: String,
        priority: Priority,
        reply: Reply<RoutingResult<MessageHandle>>,
    },
    SendToChat {
        chat_id: String,
        content: String,
        reply: Reply<RoutingResult<MessageHandle>>,
    },
    CreateChat {
        peer: NodeId,
        reply: Reply<RoutingResult<Chat>>,
    },
    CreateGroup {
        name: String,
        participants: Vec<NodeId>,
        reply: Reply<RoutingResult<Group>>,
    },
    BroadcastEmergency {
        content: String,
        reply: Reply<RoutingResult<MessageHandle>>,
    },
    RetryMessage {
        chat_id: String,
        id: PacketId,
        reply: Reply<RoutingResult<MessageHandle>>,
    },
    SetPowerMode {
        mode: PowerMode,
        reply: Reply<()>,
    },
    SetBattery {
        level: Option<u8>,
        reply: Reply<()>,
    },
    GetPeers {
        reply: Reply<Vec<Peer>>,
    },
    GetRoute {
        destination: NodeId,
        reply: Reply<RoutingResult<Option<RouteEntry>>>,
    },
    RouteTable {
        reply: Reply<Vec<RouteEntry>>,
    },
    GetMessages {
        chat_id: String,
        reply: Reply<Vec<Message>>,
    },
    GetChats {
        reply: Reply<Vec<Chat>>,
    },
    GetGroups {
        reply: Reply<Vec<Group>>,
    },
    MarkRead {
        chat_id: String,
        reply: Reply<()>,
    },
    NetworkStatus {
        reply: Reply<NetworkStatus>,
    },
    Stats {
        reply: Reply<RouterStats>,
    },
    Queued {
        reply: Reply<Vec<QueuedMessage>>,
    },
    RunMaintenance {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

pub struct Node;

impl Node {
    /// Start a node on `transport`, restoring whatever `store` holds from
    /// a previous run
    pub async fn start(
        loaded: LoadedIdentity,
        config: RouterConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Persistence>,
    ) -> Result<NodeHandle> {
        relaymesh_crypto::init()?;

        let (sink, inbound) = mpsc::unbounded_channel();
        transport.register(sink).await?;

        let local_id = loaded.identity.node_id;
        let mut router = Router::new(loaded.identity, config, transport, store);
        router.restore().await;

        let events = router.event_sender();
        if loaded.regenerated {
            let _ = events.send(MeshEvent::IdentityRegenerated { node_id: local_id });
        }

        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let task = tokio::spawn(run(router, command_rx, inbound));

        info!("Node {} started", local_id);

        Ok(NodeHandle {
            local_id,
            identity_regenerated: loaded.regenerated,
            commands,
            events,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }
}

fn timers(router: &Router) -> (Interval, Interval) {
    let retry_every = router.retry_interval().max(Duration::from_millis(1));
    let mut retry = interval_at(Instant::now() + retry_every, retry_every);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut heartbeat = interval(router.heartbeat_interval().max(Duration::from_millis(1)));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    (retry, heartbeat)
}

async fn run(
    mut router: Router,
    mut commands: mpsc::Receiver<Command>,
    mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let (mut retry, mut heartbeat) = timers(&router);
    let mut mode = router.power_mode();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown { reply }) => {
                    router.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                Some(command) => handle_command(&mut router, command).await,
                None => {
                    router.shutdown().await;
                    break;
                }
            },
            Some(event) = inbound.recv() => router.handle_event(event).await,
            _ = retry.tick() => router.tick().await,
            _ = heartbeat.tick() => router.send_heartbeats().await,
        }

        // Power mode changes rescale both timers
        if router.power_mode() != mode {
            mode = router.power_mode();
            (retry, heartbeat) = timers(&router);
            debug!(
                "Timers now retry={:?} heartbeat={:?}",
                router.retry_interval(),
                router.heartbeat_interval()
            );
        }
    }

    info!("Node {} stopped", router.local_id());
}

async fn handle_command(router: &mut Router, command: Command) {
    // A dropped reply receiver only means the caller gave up waiting
    match command {
        Command::SendMessage {
            destination,
            content,
            priority,
            reply,
        } => {
            let _ = reply.send(router.send_message(destination, content, priority).await);
        }
        Command::SendToChat {
            chat_id,
            content,
            reply,
        } => {
            let _ = reply.send(router.send_to_chat(&chat_id, content).await);
        }
        Command::CreateChat { peer, reply } => {
            let _ = reply.send(router.create_chat(peer));
        }
        Command::CreateGroup {
            name,
            participants,
            reply,
        } => {
            let _ = reply.send(router.create_group(name, participants));
        }
        Command::BroadcastEmergency { content, reply } => {
            let _ = reply.send(router.broadcast_emergency(content).await);
        }
        Command::RetryMessage { chat_id, id, reply } => {
            let _ = reply.send(router.retry_message(&chat_id, id).await);
        }
        Command::SetPowerMode { mode, reply } => {
            router.set_power_mode(mode);
            let _ = reply.send(());
        }
        Command::SetBattery { level, reply } => {
            router.set_battery(level);
            let _ = reply.send(());
        }
        Command::GetPeers { reply } => {
            let _ = reply.send(router.get_peers());
        }
        Command::GetRoute { destination, reply } => {
            let _ = reply.send(router.get_route(destination).await);
        }
        Command::RouteTable { reply } => {
            let _ = reply.send(router.route_table());
        }
        Command::GetMessages { chat_id, reply } => {
            let _ = reply.send(router.get_messages(&chat_id));
        }
        Command::GetChats { reply } => {
            let _ = reply.send(router.get_chats());
        }
        Command::GetGroups { reply } => {
            let _ = reply.send(router.get_groups());
        }
        Command::MarkRead { chat_id, reply } => {
            router.mark_read(&chat_id);
            let _ = reply.send(());
        }
        Command::NetworkStatus { reply } => {
            let _ = reply.send(router.network_status());
        }
        Command::Stats { reply } => {
            let _ = reply.send(router.stats());
        }
        Command::Queued { reply } => {
            let _ = reply.send(router.queued());
        }
        Command::RunMaintenance { reply } => {
            router.tick().await;
            let _ = reply.send(());
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}

/// Cloneable front end of a running node
#[derive(Clone)]
pub struct NodeHandle {
    local_id: NodeId,
    identity_regenerated: bool,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<MeshEvent>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl NodeHandle {
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Whether start-up replaced a corrupt stored identity
    pub fn identity_regenerated(&self) -> bool {
        self.identity_regenerated
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| NodeError::Stopped)?;
        response.await.map_err(|_| NodeError::Stopped)
    }

    pub async fn send_message(
        &self,
        destination: NodeId,
        content: impl Into<String>,
        priority: Priority,
    ) -> Result<MessageHandle> {
        let content = content.into();
        Ok(self
            .request(|reply| Command::SendMessage {
                destination,
                content,
                priority,
                reply,
            })
            .await??)
    }

    pub async fn send_to_chat(
        &self,
        chat_id: &str,
        content: impl Into<String>,
    ) -> Result<MessageHandle> {
        let chat_id = chat_id.to_string();
        let content = content.into();
        Ok(self
            .request(|reply| Command::SendToChat {
                chat_id,
                content,
                reply,
            })
            .await??)
    }

    pub async fn create_chat(&self, peer: NodeId) -> Result<Chat> {
        Ok(self
            .request(|reply| Command::CreateChat { peer, reply })
            .await??)
    }

    pub async fn create_group(
        &self,
        name: impl Into<String>,
        participants: Vec<NodeId>,
    ) -> Result<Group> {
        let name = name.into();
        Ok(self
            .request(|reply| Command::CreateGroup {
                name,
                participants,
                reply,
            })
            .await??)
    }

    pub async fn broadcast_emergency(&self, content: impl Into<String>) -> Result<MessageHandle> {
        let content = content.into();
        Ok(self
            .request(|reply| Command::BroadcastEmergency { content, reply })
            .await??)
    }

    pub async fn retry_message(&self, chat_id: &str, id: PacketId) -> Result<MessageHandle> {
        let chat_id = chat_id.to_string();
        Ok(self
            .request(|reply| Command::RetryMessage { chat_id, id, reply })
            .await??)
    }

    pub async fn set_power_mode(&self, mode: PowerMode) -> Result<()> {
        self.request(|reply| Command::SetPowerMode { mode, reply })
            .await
    }

    pub async fn set_battery(&self, level: Option<u8>) -> Result<()> {
        self.request(|reply| Command::SetBattery { level, reply })
            .await
    }

    pub async fn get_peers(&self) -> Result<Vec<Peer>> {
        self.request(|reply| Command::GetPeers { reply }).await
    }

    /// A usable route, or `None` after a route request has been sent
    pub async fn get_route(&self, destination: NodeId) -> Result<Option<RouteEntry>> {
        Ok(self
            .request(|reply| Command::GetRoute { destination, reply })
            .await??)
    }

    pub async fn route_table(&self) -> Result<Vec<RouteEntry>> {
        self.request(|reply| Command::RouteTable { reply }).await
    }

    pub async fn get_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        let chat_id = chat_id.to_string();
        self.request(|reply| Command::GetMessages { chat_id, reply })
            .await
    }

    pub async fn get_chats(&self) -> Result<Vec<Chat>> {
        self.request(|reply| Command::GetChats { reply }).await
    }

    pub async fn get_groups(&self) -> Result<Vec<Group>> {
        self.request(|reply| Command::GetGroups { reply }).await
    }

    pub async fn mark_read(&self, chat_id: &str) -> Result<()> {
        let chat_id = chat_id.to_string();
        self.request(|reply| Command::MarkRead { chat_id, reply })
            .await
    }

    pub async fn network_status(&self) -> Result<NetworkStatus> {
        self.request(|reply| Command::NetworkStatus { reply }).await
    }

    pub async fn stats(&self) -> Result<RouterStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn queued(&self) -> Result<Vec<QueuedMessage>> {
        self.request(|reply| Command::Queued { reply }).await
    }

    /// Run a maintenance pass now instead of waiting for the retry timer
    pub async fn run_maintenance(&self) -> Result<()> {
        self.request(|reply| Command::RunMaintenance { reply })
            .await
    }

    /// Save state, release the transport and wait for the node task to end
    pub async fn shutdown(&self) -> Result<()> {
        let stopped = self.request(|reply| Command::Shutdown { reply }).await;

        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }

        match stopped {
            Ok(()) | Err(NodeError::Stopped) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
