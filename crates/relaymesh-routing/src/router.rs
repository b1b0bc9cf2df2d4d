//! Packet router
//!
//! The protocol engine of a node. It owns every piece of routing state
//! (peer registry, route table, delivery queue, chats) and is driven by a
//! single task: inbound frames and link changes from the transport, user
//! operations, and the periodic maintenance and heartbeat ticks.
//!
//! Relay is a flood: a forwardable packet that still has hops left goes to
//! every direct link except the one it came from. Loops are cut by the TTL,
//! the dedup window, and the visited list carried by route requests.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use relaymesh_crypto::{CryptoError, KeyStore, NodeIdentity};
use relaymesh_network::{Transport, TransportEvent};
use relaymesh_protocol::payload::{
    decode_payload, encode_payload, AckPayload, DiscoveryPayload, HeartbeatPayload, MessageKind,
    MessagePayload, RouteReplyPayload, RouteRequestPayload,
};
use relaymesh_protocol::{
    decode, encode, now_millis, NodeId, Packet, PacketId, PacketKind, PeerRole, Priority,
};
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chat::{
    Chat, ChatKind, ChatLog, ChatSnapshot, Group, Message, MessageStatus, UNREADABLE_PLACEHOLDER,
};
use crate::dedup::DeduplicationCache;
use crate::delivery_queue::{DeliveryQueue, QueuedMessage};
use crate::error::{Result, RoutingError};
use crate::events::{MeshEvent, NetworkStatus, EVENT_CHANNEL_CAPACITY};
use crate::peer_registry::{Peer, PeerRegistry, PeerUpdate, UpsertOutcome};
use crate::policy::{PowerMode, EMERGENCY_MODE_DURATION};
use crate::route_table::{RouteEntry, RouteTable};
use crate::store::{
    load_record, save_record, Persistence, KEY_CHATS, KEY_PEERS, KEY_QUEUE, KEY_ROUTES,
};

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Name announced to peers
    pub display_name: Option<String>,
    /// Role announced to peers; `None` lets them classify us by signal
    pub role: Option<PeerRole>,
    pub dedup_capacity: usize,
    pub dedup_window: Duration,
    pub max_attempts: u32,
    pub max_age: Duration,
    pub route_staleness: Duration,
    pub peer_timeout: Duration,
    /// Delay before redialling a lost peer that is not an edge device
    pub reconnect_delay: Duration,
    /// Base queue retry interval, scaled by the power mode
    pub retry_interval: Duration,
    /// Base heartbeat interval, scaled by the power mode
    pub heartbeat_interval: Duration,
    pub power_mode: PowerMode,
    pub emergency_duration: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            display_name: None,
            role: None,
            dedup_capacity: crate::dedup::DEFAULT_CAPACITY,
            dedup_window: Duration::from_secs(3600),
            max_attempts: crate::delivery_queue::DEFAULT_MAX_ATTEMPTS,
            max_age: Duration::from_millis(crate::delivery_queue::DEFAULT_MAX_AGE_MS),
            route_staleness: Duration::from_secs(10 * 60),
            peer_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(5),
            retry_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            power_mode: PowerMode::Balanced,
            emergency_duration: EMERGENCY_MODE_DURATION,
        }
    }
}

/// Router statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouterStats {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub packets_relayed: u64,
    pub duplicates_dropped: u64,
    pub decode_errors: u64,
    pub protocol_violations: u64,
    pub decrypt_failures: u64,
    pub messages_delivered: u64,
    pub messages_queued: u64,
    pub messages_failed: u64,
    pub route_requests_sent: u64,
    pub route_replies_sent: u64,
    pub transport_failures: u64,
    pub reconnect_attempts: u64,
    pub reconnect_failures: u64,
    pub persistence_failures: u64,
}

/// Caller's view of an outgoing message
#[derive(Debug, Clone)]
pub struct MessageHandle {
    pub id: PacketId,
    pub chat_id: String,
    pub status: watch::Receiver<MessageStatus>,
}

impl MessageHandle {
    pub fn current(&self) -> MessageStatus {
        *self.status.borrow()
    }

    /// Wait until the message has progressed at least to `target`.
    /// `Failed` sorts last, so a failure also ends the wait.
    pub async fn wait_for(&mut self, target: MessageStatus) -> Option<MessageStatus> {
        let status = self
            .status
            .wait_for(|s| *s >= target)
            .await
            .ok()?;
        Some(*status)
    }
}

pub struct Router {
    keys: KeyStore,
    config: RouterConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn Persistence>,
    events: broadcast::Sender<MeshEvent>,

    dedup: DeduplicationCache,
    peers: PeerRegistry,
    routes: RouteTable,
    queue: DeliveryQueue,
    chats: ChatLog,

    /// Peers with a live direct link
    links: BTreeSet<NodeId>,
    /// Lost peers to redial, with when
    reconnects: HashMap<NodeId, Instant>,
    watchers: HashMap<PacketId, watch::Sender<MessageStatus>>,

    power_mode: PowerMode,
    mode_before_emergency: Option<PowerMode>,
    emergency_until: Option<Instant>,
    battery: Option<u8>,

    stats: RouterStats,
}

impl Router {
    pub fn new(
        identity: NodeIdentity,
        config: RouterConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Persistence>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let staleness_ms = config.route_staleness.as_millis() as u64;

        Router {
            keys: KeyStore::new(identity),
            dedup: DeduplicationCache::new(config.dedup_capacity, config.dedup_window),
            peers: PeerRegistry::new(),
            routes: RouteTable::new(staleness_ms),
            queue: DeliveryQueue::new(),
            chats: ChatLog::new(),
            links: BTreeSet::new(),
            reconnects: HashMap::new(),
            watchers: HashMap::new(),
            power_mode: config.power_mode,
            mode_before_emergency: None,
            emergency_until: None,
            battery: None,
            stats: RouterStats::default(),
            config,
            transport,
            store,
            events,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.keys.local_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<MeshEvent> {
        self.events.clone()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats.clone()
    }

    pub fn power_mode(&self) -> PowerMode {
        self.power_mode
    }

    pub fn retry_interval(&self) -> Duration {
        self.power_mode.retry_interval(self.config.retry_interval)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.power_mode.heartbeat_interval(self.config.heartbeat_interval)
    }

    pub fn set_battery(&mut self, level: Option<u8>) {
        self.battery = level.map(|l| l.min(100));
    }

    pub fn links(&self) -> Vec<NodeId> {
        self.links.iter().copied().collect()
    }

    /// All route entries, including invalidated ones
    pub fn route_table(&self) -> Vec<RouteEntry> {
        self.routes.entries()
    }

    pub fn queued(&self) -> Vec<QueuedMessage> {
        self.queue.entries()
    }

    pub fn network_status(&self) -> NetworkStatus {
        NetworkStatus::new(
            self.peers.len(),
            self.peers.online_count(),
            self.power_mode,
        )
    }

    fn emit(&self, event: MeshEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_network_status(&self) {
        self.emit(MeshEvent::NetworkStatusChanged(self.network_status()));
    }

    // ---------------------------------------------------------------
    // Transport plumbing
    // ---------------------------------------------------------------

    pub async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Received { from, bytes } => self.handle_inbound(from, &bytes).await,
            TransportEvent::PeerConnected { peer } => self.on_peer_connected(peer).await,
            TransportEvent::PeerDisconnected { peer } => self.on_peer_disconnected(peer).await,
        }
    }

    async fn transmit(&mut self, peer: &NodeId, packet: &Packet) -> Result<()> {
        let bytes = encode(packet)?;
        match self.transport.send(peer, &bytes).await {
            Ok(()) => {
                self.stats.packets_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.transport_failures += 1;
                debug!("Send of {:?} {} to {} failed: {}", packet.kind, packet.id, peer, e);
                Err(e.into())
            }
        }
    }

    /// A link counts as live until its peer goes silent
    fn is_live(&self, peer: &NodeId) -> bool {
        self.links.contains(peer) && self.peers.get(peer).map_or(true, |p| p.is_online)
    }

    fn live_links(&self, exclude: &[NodeId]) -> Vec<NodeId> {
        self.links
            .iter()
            .copied()
            .filter(|peer| !exclude.contains(peer) && self.is_live(peer))
            .collect()
    }

    /// Send to every live link not in `exclude`; returns how many sends
    /// succeeded
    async fn flood(&mut self, packet: &Packet, exclude: &[NodeId]) -> usize {
        let targets = self.live_links(exclude);
        self.send_to_each(packet, targets).await
    }

    async fn send_to_each(&mut self, packet: &Packet, targets: Vec<NodeId>) -> usize {
        let mut reached = 0;
        for peer in targets {
            if self.transmit(&peer, packet).await.is_ok() {
                reached += 1;
            }
        }
        reached
    }

    fn next_hop(&self, destination: &NodeId, now: u64) -> Option<NodeId> {
        if self.is_live(destination) {
            return Some(*destination);
        }
        let hop = self.routes.lookup(destination, now)?.next_hop()?;
        self.is_live(&hop).then_some(hop)
    }

    // ---------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------

    /// Decode and process a frame received from direct neighbour `from`
    pub async fn handle_inbound(&mut self, from: NodeId, bytes: &[u8]) {
        self.stats.packets_received += 1;
        match decode(bytes) {
            Ok(packet) => self.handle_packet(from, packet).await,
            Err(e) => {
                self.stats.decode_errors += 1;
                debug!("Dropping undecodable frame from {}: {}", from, e);
            }
        }
    }

    pub async fn handle_packet(&mut self, from: NodeId, packet: Packet) {
        if packet.ttl == 0 {
            self.stats.protocol_violations += 1;
            debug!("Dropping packet {} with ttl 0 from {}", packet.id, from);
            return;
        }

        if !self.dedup.check_and_mark(packet.id) {
            self.stats.duplicates_dropped += 1;
            return;
        }

        if packet.source == self.local_id() {
            return;
        }

        debug!(
            "{:?} {} from {} (src {}, dst {}, ttl {}, hops {})",
            packet.kind,
            packet.id,
            from,
            packet.source,
            packet.destination,
            packet.ttl,
            packet.hops
        );

        let result = match packet.kind {
            PacketKind::Message => self.on_message(&packet).await,
            PacketKind::Discovery => self.on_discovery(from, &packet).await,
            PacketKind::Heartbeat => self.on_heartbeat(from, &packet).await,
            PacketKind::RouteRequest => self.on_route_request(from, &packet).await,
            PacketKind::RouteReply => self.on_route_reply(&packet).await,
            PacketKind::Ack => self.on_ack(&packet),
        };

        if let Err(e) = result {
            match e {
                RoutingError::Protocol(_) => self.stats.decode_errors += 1,
                _ => self.stats.protocol_violations += 1,
            }
            debug!("Dropping {:?} {} from {}: {}", packet.kind, packet.id, from, e);
            return;
        }

        // Heartbeats stay put; route requests forward themselves
        if matches!(packet.kind, PacketKind::Heartbeat | PacketKind::RouteRequest) {
            return;
        }
        if packet.destination == self.local_id() || !packet.can_relay() {
            return;
        }
        self.relay(&packet, from).await;
    }

    async fn relay(&mut self, packet: &Packet, from: NodeId) {
        let exclude = [from, packet.source];
        if self.live_links(&exclude).is_empty() {
            return;
        }
        let relayed = packet.relayed();
        let reached = self.flood(&relayed, &exclude).await;
        if reached > 0 {
            self.stats.packets_relayed += 1;
        }
    }

    async fn on_message(&mut self, packet: &Packet) -> Result<()> {
        let local = self.local_id();
        if packet.destination != local && !packet.is_broadcast() {
            return Ok(());
        }

        let payload: MessagePayload = decode_payload(&packet.payload)?;

        let chat = if let Some(group) = &payload.group {
            if !group.participants.contains(&local) {
                return Ok(());
            }
            let (chat, created) = self.chats.ensure_group(Group {
                id: group.id.clone(),
                name: group.name.clone(),
                participants: group.participants.clone(),
                admins: vec![packet.source],
                created_at: Utc::now(),
            });
            if created {
                if let Some(group) = self.chats.group(&chat.id) {
                    self.emit(MeshEvent::GroupCreated(group.clone()));
                }
            }
            chat
        } else if payload.kind == MessageKind::Emergency {
            let (chat, created) = self.chats.ensure_emergency();
            if created {
                self.emit(MeshEvent::ChatCreated(chat.clone()));
            }
            chat
        } else {
            let name = payload.sender_name.clone().or_else(|| {
                self.peers
                    .get(&packet.source)
                    .and_then(|p| p.display_name.clone())
            });
            let (chat, created) = self.chats.ensure_private(packet.source, name.as_deref());
            if created {
                self.emit(MeshEvent::ChatCreated(chat.clone()));
            }
            chat
        };

        let (content, encrypted) = self.open_content(&packet.source, &payload);
        let message = Message {
            id: packet.id,
            chat_id: chat.id.clone(),
            sender: packet.source,
            content,
            status: MessageStatus::Delivered,
            hops: packet.hops,
            encrypted,
            priority: payload.priority,
            kind: payload.kind,
            sent_at: timestamp(packet.created_at),
        };

        info!(
            "Message {} from {} delivered to chat {} ({} hops)",
            packet.id, packet.source, chat.id, packet.hops
        );
        self.chats.append(message.clone(), true);
        self.stats.messages_delivered += 1;
        self.emit(MeshEvent::MessageReceived {
            chat_id: chat.id,
            message,
        });

        if packet.destination == local {
            self.send_ack(packet).await?;
        }
        Ok(())
    }

    /// Plaintext of a message body; falls back to a placeholder when an
    /// encrypted body cannot be opened
    fn open_content(&mut self, sender: &NodeId, payload: &MessagePayload) -> (String, bool) {
        if !payload.encrypted {
            return (String::from_utf8_lossy(&payload.content).into_owned(), false);
        }

        if let Some(key) = payload.sender_public_key {
            if NodeId::from_public_key(&key) == *sender {
                let _ = self.keys.learn(*sender, &key);
            }
        }

        let opened = payload
            .nonce
            .ok_or(CryptoError::InvalidNonce)
            .and_then(|nonce| self.keys.open_from(sender, &payload.content, &nonce));

        match opened {
            Ok(plain) => (String::from_utf8_lossy(&plain).into_owned(), true),
            Err(e) => {
                self.stats.decrypt_failures += 1;
                warn!("Could not decrypt message from {}: {}", sender, e);
                (UNREADABLE_PLACEHOLDER.to_string(), false)
            }
        }
    }

    async fn send_ack(&mut self, packet: &Packet) -> Result<()> {
        let payload = encode_payload(&AckPayload {
            message_id: packet.id,
        })?;
        let ack = Packet::new(
            PacketKind::Ack,
            self.local_id(),
            packet.source,
            payload,
            packet.hops.saturating_add(2),
        );
        self.dedup.mark_seen(ack.id);
        self.flood(&ack, &[]).await;
        Ok(())
    }

    fn on_ack(&mut self, packet: &Packet) -> Result<()> {
        if packet.destination != self.local_id() {
            return Ok(());
        }
        let payload: AckPayload = decode_payload(&packet.payload)?;
        let chat_id = self
            .chats
            .find(&payload.message_id)
            .filter(|m| m.sender == self.local_id())
            .map(|m| m.chat_id.clone());

        if let Some(chat_id) = chat_id {
            debug!("Message {} acknowledged by {}", payload.message_id, packet.source);
            self.set_status(&chat_id, &payload.message_id, MessageStatus::Delivered);
        }
        Ok(())
    }

    async fn on_discovery(&mut self, from: NodeId, packet: &Packet) -> Result<()> {
        let payload: DiscoveryPayload = decode_payload(&packet.payload)?;

        if NodeId::from_public_key(&payload.public_key) != packet.source {
            return Err(RoutingError::ProtocolViolation(format!(
                "discovery key does not belong to {}",
                packet.source
            )));
        }
        self.keys.learn(packet.source, &payload.public_key)?;

        let signal_quality = if packet.source == from {
            Some(self.transport.signal_quality(&from).await)
        } else {
            None
        };

        let revived = self.apply_peer_update(PeerUpdate {
            id: Some(packet.source),
            display_name: payload.display_name,
            public_key: Some(payload.public_key),
            last_seen_at: Some(Utc::now()),
            is_online: Some(true),
            signal_quality,
            role: payload.role,
            battery_hint: payload.battery,
        });
        if revived {
            self.drain_all(false).await;
        }
        Ok(())
    }

    async fn on_heartbeat(&mut self, from: NodeId, packet: &Packet) -> Result<()> {
        let payload: HeartbeatPayload = decode_payload(&packet.payload)?;
        let signal_quality = if packet.source == from {
            Some(self.transport.signal_quality(&from).await)
        } else {
            None
        };

        let revived = self.apply_peer_update(PeerUpdate {
            id: Some(packet.source),
            last_seen_at: Some(Utc::now()),
            is_online: Some(true),
            signal_quality,
            battery_hint: payload.battery,
            ..Default::default()
        });
        if revived {
            debug!("Peer {} is back", packet.source);
            self.drain_all(false).await;
        }
        Ok(())
    }

    async fn on_route_request(&mut self, from: NodeId, packet: &Packet) -> Result<()> {
        let mut payload: RouteRequestPayload = decode_payload(&packet.payload)?;
        let local = self.local_id();

        if let Some(key) = payload.origin_public_key {
            if NodeId::from_public_key(&key) == packet.source {
                self.keys.learn(packet.source, &key)?;
            }
        }

        if payload.path.contains(&local) {
            return Ok(());
        }

        let target = packet.destination;
        let now = now_millis();
        let answer = if target == local {
            Some(payload.path.clone())
        } else if self.is_live(&target) {
            let mut path = payload.path.clone();
            path.push(local);
            Some(path)
        } else if let Some(entry) = self.routes.lookup(&target, now) {
            let mut path = payload.path.clone();
            path.push(local);
            path.extend(entry.path.iter().copied());
            Some(path)
        } else {
            None
        };

        if let Some(path) = answer {
            let target_public_key = if target == local {
                Some(self.keys.identity().public_key_bytes())
            } else {
                self.keys.public_key(&target)
            };
            let reply = Packet::new(
                PacketKind::RouteReply,
                local,
                packet.source,
                encode_payload(&RouteReplyPayload {
                    target,
                    path,
                    request_id: packet.id,
                    target_public_key,
                })?,
                packet.hops.saturating_add(2),
            );
            self.dedup.mark_seen(reply.id);
            self.flood(&reply, &[]).await;
            self.stats.route_replies_sent += 1;
            debug!("Answered route request {} for {}", packet.id, target);
            return Ok(());
        }

        if !packet.can_relay() {
            return Ok(());
        }

        let exclude = [from, packet.source];
        if self.live_links(&exclude).is_empty() {
            return Ok(());
        }

        payload.path.push(local);
        let forwarded = Packet {
            payload: encode_payload(&payload)?,
            ..packet.relayed()
        };
        if self.flood(&forwarded, &exclude).await > 0 {
            self.stats.packets_relayed += 1;
        }
        Ok(())
    }

    async fn on_route_reply(&mut self, packet: &Packet) -> Result<()> {
        let local = self.local_id();
        if packet.destination != local {
            return Ok(());
        }

        let payload: RouteReplyPayload = decode_payload(&packet.payload)?;
        if payload.target == local || payload.path.contains(&local) {
            return Err(RoutingError::ProtocolViolation(
                "route reply loops through this node".to_string(),
            ));
        }

        if let Some(key) = payload.target_public_key {
            if NodeId::from_public_key(&key) == payload.target {
                self.keys.learn(payload.target, &key)?;
            }
        }

        let installed = self.routes.install(RouteEntry {
            destination: payload.target,
            path: payload.path.clone(),
            discovered_at: now_millis(),
            ttl_remaining_at_discovery: packet.ttl,
            epoch: payload.request_id,
            valid: true,
        });

        if installed {
            info!(
                "Route to {} via [{}]",
                payload.target,
                payload
                    .path
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            );
            self.emit(MeshEvent::RouteDiscovered {
                destination: payload.target,
                path: payload.path,
            });
            self.drain(payload.target, false).await;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Link changes
    // ---------------------------------------------------------------

    pub async fn on_peer_connected(&mut self, peer: NodeId) {
        self.links.insert(peer);
        self.reconnects.remove(&peer);
        let signal_quality = self.transport.signal_quality(&peer).await;
        info!("Link up: {} (signal {})", peer, signal_quality);

        self.apply_peer_update(PeerUpdate {
            id: Some(peer),
            last_seen_at: Some(Utc::now()),
            is_online: Some(true),
            signal_quality: Some(signal_quality),
            ..Default::default()
        });

        if let Err(e) = self.send_discovery(peer).await {
            warn!("Failed to announce to {}: {}", peer, e);
        }

        self.drain_all(false).await;
    }

    pub async fn on_peer_disconnected(&mut self, peer: NodeId) {
        self.links.remove(&peer);
        info!("Link down: {}", peer);

        if let Some(updated) = self.peers.mark_offline(&peer, Utc::now()) {
            self.emit(MeshEvent::PeerUpdated(updated));
        }
        let affected = self.routes.invalidate_via(&peer);
        if !affected.is_empty() {
            debug!("Invalidated {} routes through {}", affected.len(), peer);
        }
        self.emit_network_status();

        let redial = self
            .peers
            .get(&peer)
            .is_some_and(|p| p.role != PeerRole::Edge);
        if redial {
            debug!("Redialling {} in {:?}", peer, self.config.reconnect_delay);
            self.reconnects
                .insert(peer, Instant::now() + self.config.reconnect_delay);
        }
    }

    /// Dial lost peers whose reconnect delay has passed
    async fn redial_lost_peers(&mut self) {
        let now = Instant::now();
        let due: Vec<NodeId> = self
            .reconnects
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(peer, _)| *peer)
            .collect();

        for peer in due {
            self.reconnects.remove(&peer);
            if self.links.contains(&peer) {
                continue;
            }
            info!("Reconnecting to {}", peer);
            self.stats.reconnect_attempts += 1;
            if let Err(e) = self.transport.connect(&peer).await {
                self.stats.reconnect_failures += 1;
                warn!("Reconnect to {} failed: {}", peer, e);
            }
        }
    }

    async fn send_discovery(&mut self, peer: NodeId) -> Result<()> {
        let payload = encode_payload(&DiscoveryPayload {
            public_key: self.keys.identity().public_key_bytes(),
            display_name: self.config.display_name.clone(),
            role: self.config.role,
            battery: self.battery,
        })?;
        let packet = Packet::new(PacketKind::Discovery, self.local_id(), peer, payload, 1);
        self.dedup.mark_seen(packet.id);
        self.transmit(&peer, &packet).await
    }

    /// Merge a peer update and publish it; returns `true` when a known
    /// offline peer came back
    fn apply_peer_update(&mut self, update: PeerUpdate) -> bool {
        let online_before = self.peers.online_count();
        let was_online = update
            .id
            .and_then(|id| self.peers.get(&id))
            .map(|p| p.is_online);
        let Some(outcome) = self.peers.upsert(update, Utc::now()) else {
            return false;
        };

        let revived = was_online == Some(false) && outcome.peer().is_online;
        let status_changed = matches!(outcome, UpsertOutcome::Discovered(_))
            || online_before != self.peers.online_count();

        match outcome {
            UpsertOutcome::Discovered(peer) => {
                info!("Discovered peer {} ({})", peer.id, peer.role);
                self.emit(MeshEvent::PeerDiscovered(peer));
            }
            UpsertOutcome::Updated(peer) => self.emit(MeshEvent::PeerUpdated(peer)),
        }

        if status_changed {
            self.emit_network_status();
        }
        revived
    }

    // ---------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------

    fn set_status(&mut self, chat_id: &str, id: &PacketId, status: MessageStatus) {
        let Some(message) = self.chats.update_status(chat_id, id, status) else {
            return;
        };
        if let Some(watcher) = self.watchers.get(id) {
            let _ = watcher.send(status);
        }
        // Relayed is as far as a broadcast ever gets
        if matches!(
            status,
            MessageStatus::Relayed | MessageStatus::Delivered | MessageStatus::Failed
        ) {
            self.watchers.remove(id);
        }
        self.emit(MeshEvent::MessageStatusUpdated {
            chat_id: chat_id.to_string(),
            message,
        });
    }

    fn watch(&mut self, message: &Message) -> MessageHandle {
        let (tx, rx) = watch::channel(message.status);
        self.watchers.insert(message.id, tx);
        MessageHandle {
            id: message.id,
            chat_id: message.chat_id.clone(),
            status: rx,
        }
    }

    fn new_outgoing(
        &mut self,
        chat_id: String,
        content: String,
        priority: Priority,
        kind: MessageKind,
        encrypted: bool,
    ) -> (Message, MessageHandle) {
        let message = Message {
            id: PacketId::generate(),
            chat_id,
            sender: self.local_id(),
            content,
            status: MessageStatus::Queued,
            hops: 0,
            encrypted,
            priority,
            kind,
            sent_at: Utc::now(),
        };
        self.chats.append(message.clone(), false);
        let handle = self.watch(&message);
        (message, handle)
    }

    fn message_packet(&self, destination: NodeId, message: &Message) -> Result<Packet> {
        let group = self.chats.group(&message.chat_id).map(Group::info);

        let (content, nonce, encrypted) =
            if !destination.is_broadcast() && self.keys.knows(&destination) {
                let sealed = self.keys.seal_for(&destination, message.content.as_bytes())?;
                (sealed.ciphertext, Some(sealed.nonce), true)
            } else {
                (message.content.as_bytes().to_vec(), None, false)
            };
        let sender_public_key = encrypted.then(|| self.keys.identity().public_key_bytes());

        let payload = encode_payload(&MessagePayload {
            content,
            nonce,
            encrypted,
            sender_public_key,
            priority: message.priority,
            kind: message.kind,
            group,
            sender_name: self.config.display_name.clone(),
        })?;

        Ok(Packet::with_id(
            message.id,
            PacketKind::Message,
            self.local_id(),
            destination,
            payload,
            self.power_mode.ttl_for(message.priority),
        ))
    }

    fn enqueue(&mut self, destination: NodeId, message: Message) {
        let (chat_id, id) = (message.chat_id.clone(), message.id);
        if self.queue.enqueue(destination, message, now_millis()) {
            self.stats.messages_queued += 1;
            debug!("Queued message {} for {}", id, destination);
        }
        self.set_status(&chat_id, &id, MessageStatus::Queued);
    }

    /// Flood a route request for `destination`
    async fn request_route(&mut self, destination: NodeId, priority: Priority) -> Result<()> {
        let payload = encode_payload(&RouteRequestPayload {
            path: Vec::new(),
            origin_public_key: Some(self.keys.identity().public_key_bytes()),
        })?;
        let packet = Packet::new(
            PacketKind::RouteRequest,
            self.local_id(),
            destination,
            payload,
            self.power_mode.ttl_for(priority),
        );
        self.dedup.mark_seen(packet.id);
        let reached = self.flood(&packet, &[]).await;
        self.stats.route_requests_sent += 1;
        debug!(
            "Route request {} for {} sent to {} peers",
            packet.id, destination, reached
        );
        Ok(())
    }

    /// Send a private message
    ///
    /// Never fails because the destination is unreachable right now: the
    /// message is queued and a route request goes out instead.
    pub async fn send_message(
        &mut self,
        destination: NodeId,
        content: String,
        priority: Priority,
    ) -> Result<MessageHandle> {
        if destination == self.local_id() || destination.is_broadcast() {
            return Err(RoutingError::InvalidDestination(destination.to_hex()));
        }

        let name = self
            .peers
            .get(&destination)
            .and_then(|p| p.display_name.clone());
        let (chat, created) = self.chats.ensure_private(destination, name.as_deref());
        if created {
            self.emit(MeshEvent::ChatCreated(chat.clone()));
        }

        let encrypted = self.keys.knows(&destination);
        let (message, handle) =
            self.new_outgoing(chat.id, content, priority, MessageKind::Text, encrypted);

        if let Err(e) = self.deliver_or_queue(destination, message.clone()).await {
            self.set_status(&message.chat_id, &message.id, MessageStatus::Failed);
            return Err(e);
        }
        Ok(handle)
    }

    async fn deliver_or_queue(&mut self, destination: NodeId, message: Message) -> Result<()> {
        // Never overtake older queued messages
        if self.queue.front(&destination).is_some() {
            self.enqueue(destination, message);
            self.drain(destination, false).await;
            return Ok(());
        }

        let now = now_millis();
        if let Some(hop) = self.next_hop(&destination, now) {
            let packet = self.message_packet(destination, &message)?;
            self.dedup.mark_seen(packet.id);
            if self.transmit(&hop, &packet).await.is_ok() {
                self.set_status(&message.chat_id, &message.id, MessageStatus::Sent);
                return Ok(());
            }
            self.enqueue(destination, message);
            return Ok(());
        }

        let priority = message.priority;
        self.enqueue(destination, message);
        self.request_route(destination, priority).await
    }

    /// Flood a group or emergency message, queueing it when no link is up
    async fn send_broadcast(&mut self, message: Message) -> Result<()> {
        if self.live_links(&[]).is_empty() {
            self.enqueue(NodeId::BROADCAST, message);
            return Ok(());
        }
        let packet = self.message_packet(NodeId::BROADCAST, &message)?;
        self.dedup.mark_seen(packet.id);
        if self.flood(&packet, &[]).await > 0 {
            self.set_status(&message.chat_id, &message.id, MessageStatus::Relayed);
        } else {
            self.enqueue(NodeId::BROADCAST, message);
        }
        Ok(())
    }

    /// Retry queued messages for one destination, oldest first, stopping
    /// at the first failure. A `scheduled` drain with no route counts as a
    /// failed attempt and re-floods a route request.
    async fn drain(&mut self, destination: NodeId, scheduled: bool) {
        let now = now_millis();
        while let Some(entry) = self.queue.front(&destination).cloned() {
            let message = entry.message;

            if destination.is_broadcast() {
                if self.live_links(&[]).is_empty() {
                    break;
                }
                let reached = match self.message_packet(destination, &message) {
                    Ok(packet) => {
                        self.dedup.mark_seen(packet.id);
                        self.flood(&packet, &[]).await
                    }
                    Err(e) => {
                        warn!("Cannot build broadcast {}: {}", message.id, e);
                        0
                    }
                };
                if reached == 0 {
                    self.queue.record_failure(&destination);
                    break;
                }
                self.queue.pop_front(&destination);
                self.set_status(&message.chat_id, &message.id, MessageStatus::Relayed);
                continue;
            }

            let Some(hop) = self.next_hop(&destination, now) else {
                if scheduled {
                    self.queue.record_failure(&destination);
                    if let Err(e) = self.request_route(destination, message.priority).await {
                        warn!("Route request for {} failed: {}", destination, e);
                    }
                }
                break;
            };

            let packet = match self.message_packet(destination, &message) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Dropping unsendable message {}: {}", message.id, e);
                    self.queue.pop_front(&destination);
                    self.stats.messages_failed += 1;
                    self.set_status(&message.chat_id, &message.id, MessageStatus::Failed);
                    continue;
                }
            };
            self.dedup.mark_seen(packet.id);

            match self.transmit(&hop, &packet).await {
                Ok(()) => {
                    self.queue.pop_front(&destination);
                    self.set_status(&message.chat_id, &message.id, MessageStatus::Sent);
                }
                Err(_) => {
                    self.queue.record_failure(&destination);
                    break;
                }
            }
        }
    }

    async fn drain_all(&mut self, scheduled: bool) {
        for destination in self.queue.destinations() {
            self.drain(destination, scheduled).await;
        }
    }

    // ---------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------

    /// Open (or return) the private chat with a known peer
    pub fn create_chat(&mut self, peer: NodeId) -> Result<Chat> {
        let known = self.peers.get(&peer);
        if known.is_none() && self.routes.get(&peer).is_none() {
            return Err(RoutingError::UnknownPeer(peer.to_hex()));
        }
        let name = known.and_then(|p| p.display_name.clone());
        let (chat, created) = self.chats.ensure_private(peer, name.as_deref());
        if created {
            self.emit(MeshEvent::ChatCreated(chat.clone()));
        }
        Ok(chat)
    }

    pub fn create_group(&mut self, name: String, participants: Vec<NodeId>) -> Result<Group> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(RoutingError::InvalidGroup("group name is empty".to_string()));
        }

        let local = self.local_id();
        let mut members = vec![local];
        for peer in participants {
            if peer.is_broadcast() {
                return Err(RoutingError::InvalidGroup(
                    "broadcast id cannot be a participant".to_string(),
                ));
            }
            if !members.contains(&peer) {
                members.push(peer);
            }
        }

        let group = Group {
            id: Uuid::new_v4().to_string(),
            name,
            participants: members,
            admins: vec![local],
            created_at: Utc::now(),
        };
        self.chats.ensure_group(group.clone());
        info!(
            "Created group {} '{}' with {} participants",
            group.id,
            group.name,
            group.participants.len()
        );
        self.emit(MeshEvent::GroupCreated(group.clone()));
        Ok(group)
    }

    /// Send into any chat: private, group or emergency
    pub async fn send_to_chat(&mut self, chat_id: &str, content: String) -> Result<MessageHandle> {
        let chat = self
            .chats
            .chat(chat_id)
            .cloned()
            .ok_or_else(|| RoutingError::UnknownChat(chat_id.to_string()))?;

        match chat.kind {
            ChatKind::Private => {
                let peer = chat
                    .participants
                    .first()
                    .copied()
                    .ok_or_else(|| RoutingError::UnknownChat(chat_id.to_string()))?;
                self.send_message(peer, content, Priority::Normal).await
            }
            ChatKind::Group => {
                let (message, handle) =
                    self.new_outgoing(chat.id, content, Priority::Normal, MessageKind::Text, false);
                self.send_broadcast(message).await?;
                Ok(handle)
            }
            ChatKind::Emergency => self.broadcast_emergency(content).await,
        }
    }

    /// Flood an emergency message to everyone and switch to emergency
    /// power mode for a while
    pub async fn broadcast_emergency(&mut self, content: String) -> Result<MessageHandle> {
        self.enter_emergency_mode();

        let (chat, created) = self.chats.ensure_emergency();
        if created {
            self.emit(MeshEvent::ChatCreated(chat.clone()));
        }

        let (message, handle) = self.new_outgoing(
            chat.id,
            content,
            Priority::Emergency,
            MessageKind::Emergency,
            false,
        );
        warn!("Emergency broadcast {}", message.id);
        self.send_broadcast(message).await?;
        Ok(handle)
    }

    /// Requeue a failed message
    pub async fn retry_message(&mut self, chat_id: &str, id: PacketId) -> Result<MessageHandle> {
        let message = self
            .chats
            .message(chat_id, &id)
            .cloned()
            .ok_or_else(|| RoutingError::UnknownMessage(id.to_hex()))?;
        if message.status != MessageStatus::Failed {
            return Err(RoutingError::NotRetryable(message.status));
        }

        let chat = self.chats.chat(chat_id);
        let destination = match chat.map(|c| (c.kind, c.participants.first().copied())) {
            Some((ChatKind::Private, Some(peer))) => peer,
            Some((ChatKind::Group, _)) | Some((ChatKind::Emergency, _)) => NodeId::BROADCAST,
            _ => return Err(RoutingError::UnknownChat(chat_id.to_string())),
        };

        let mut message = message;
        message.status = MessageStatus::Queued;
        let priority = message.priority;
        let (tx, rx) = watch::channel(MessageStatus::Failed);
        self.watchers.insert(id, tx);
        let handle = MessageHandle {
            id,
            chat_id: chat_id.to_string(),
            status: rx,
        };
        self.enqueue(destination, message);

        if destination.is_broadcast() || self.next_hop(&destination, now_millis()).is_some() {
            self.drain(destination, false).await;
        } else {
            self.request_route(destination, priority).await?;
        }
        Ok(handle)
    }

    pub fn set_power_mode(&mut self, mode: PowerMode) {
        self.emergency_until = None;
        self.mode_before_emergency = None;
        self.change_power_mode(mode);
    }

    fn change_power_mode(&mut self, mode: PowerMode) {
        if mode == self.power_mode {
            return;
        }
        info!("Power mode {} -> {}", self.power_mode, mode);
        self.power_mode = mode;
        self.emit(MeshEvent::PowerModeChanged(mode));
        self.emit_network_status();
    }

    fn enter_emergency_mode(&mut self) {
        if self.power_mode != PowerMode::Emergency {
            self.mode_before_emergency = Some(self.power_mode);
            self.change_power_mode(PowerMode::Emergency);
        }
        self.emergency_until = Some(Instant::now() + self.config.emergency_duration);
    }

    /// Leave emergency mode once its time is up
    fn check_power_mode(&mut self) {
        if let Some(until) = self.emergency_until {
            if Instant::now() >= until {
                self.emergency_until = None;
                let restore = self
                    .mode_before_emergency
                    .take()
                    .unwrap_or(PowerMode::Balanced);
                self.change_power_mode(restore);
            }
        }
    }

    pub fn get_peers(&self) -> Vec<Peer> {
        self.peers.all()
    }

    /// A usable route to `destination`; when there is none a route request
    /// is flooded and `None` returned
    pub async fn get_route(&mut self, destination: NodeId) -> Result<Option<RouteEntry>> {
        if let Some(entry) = self.routes.lookup(&destination, now_millis()) {
            return Ok(Some(entry.clone()));
        }
        self.request_route(destination, Priority::Normal).await?;
        Ok(None)
    }

    pub fn get_messages(&self, chat_id: &str) -> Vec<Message> {
        self.chats.messages(chat_id)
    }

    pub fn get_chats(&self) -> Vec<Chat> {
        self.chats.chats()
    }

    pub fn get_groups(&self) -> Vec<Group> {
        self.chats.groups()
    }

    pub fn mark_read(&mut self, chat_id: &str) {
        self.chats.mark_read(chat_id);
    }

    // ---------------------------------------------------------------
    // Periodic work
    // ---------------------------------------------------------------

    /// Maintenance pass: evict, retry, expire silent peers, persist
    pub async fn tick(&mut self) {
        self.check_power_mode();

        let evicted = self.queue.evict(
            now_millis(),
            self.config.max_age.as_millis() as u64,
            self.config.max_attempts,
        );
        for entry in evicted {
            warn!(
                "Giving up on message {} to {} after {} attempts",
                entry.message.id, entry.destination, entry.attempts
            );
            self.stats.messages_failed += 1;
            self.set_status(&entry.message.chat_id, &entry.message.id, MessageStatus::Failed);
        }

        self.drain_all(true).await;

        let timeout = chrono::Duration::from_std(self.config.peer_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let expired = self.peers.expire_silent(timeout, Utc::now());
        for peer in &expired {
            debug!("Peer {} went silent", peer.id);
            self.routes.invalidate_via(&peer.id);
            self.emit(MeshEvent::PeerUpdated(peer.clone()));
        }
        if !expired.is_empty() {
            self.emit_network_status();
        }

        self.redial_lost_peers().await;

        // Handles the caller dropped, or unicast sends whose ack never came
        self.watchers.retain(|_, watcher| !watcher.is_closed());

        self.dedup.cleanup_expired();
        self.save_cache().await;
    }

    /// Tell direct neighbours we are alive
    pub async fn send_heartbeats(&mut self) {
        self.check_power_mode();
        let payload = match encode_payload(&HeartbeatPayload {
            battery: self.battery,
            node_count: self.peers.len() as u32,
        }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot encode heartbeat: {}", e);
                return;
            }
        };
        let packet = Packet::new(
            PacketKind::Heartbeat,
            self.local_id(),
            NodeId::BROADCAST,
            payload,
            1,
        );
        self.dedup.mark_seen(packet.id);
        // Silent peers too, so a link both sides gave up on can recover
        let targets = self.links.iter().copied().collect();
        self.send_to_each(&packet, targets).await;
    }

    // ---------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------

    /// Write peers, routes, queue and chats to the store. Failures are
    /// logged; the next save tries again.
    pub async fn save_cache(&mut self) {
        let store = self.store.clone();
        let results = [
            save_record(store.as_ref(), KEY_PEERS, &self.peers.all()).await,
            save_record(store.as_ref(), KEY_ROUTES, &self.routes.entries()).await,
            save_record(store.as_ref(), KEY_QUEUE, &self.queue.entries()).await,
            save_record(store.as_ref(), KEY_CHATS, &self.chats.snapshot()).await,
        ];
        for error in results.into_iter().filter_map(|r| r.err()) {
            self.stats.persistence_failures += 1;
            warn!("Failed to save cache: {}", error);
        }
    }

    async fn load_or_warn<T: DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        match load_record(self.store.as_ref(), key).await {
            Ok(value) => value,
            Err(e) => {
                self.stats.persistence_failures += 1;
                warn!("Ignoring unreadable cache entry '{}': {}", key, e);
                None
            }
        }
    }

    /// Load the cache written by a previous run
    pub async fn restore(&mut self) {
        if let Some(peers) = self.load_or_warn::<Vec<Peer>>(KEY_PEERS).await {
            for peer in &peers {
                if let Some(key) = peer.public_key {
                    if NodeId::from_public_key(&key) == peer.id {
                        let _ = self.keys.learn(peer.id, &key);
                    }
                }
            }
            self.peers.restore(peers);
        }
        if let Some(routes) = self.load_or_warn::<Vec<RouteEntry>>(KEY_ROUTES).await {
            self.routes.restore(routes);
        }
        if let Some(queue) = self.load_or_warn::<Vec<QueuedMessage>>(KEY_QUEUE).await {
            self.queue.restore(queue);
        }
        if let Some(chats) = self.load_or_warn::<ChatSnapshot>(KEY_CHATS).await {
            self.chats.restore(chats);
        }
        info!(
            "Restored {} peers, {} routes, {} queued messages",
            self.peers.len(),
            self.routes.len(),
            self.queue.len()
        );
    }

    /// Persist everything and release the transport
    pub async fn shutdown(&mut self) {
        self.save_cache().await;
        if let Err(e) = self.transport.shutdown().await {
            warn!("Transport shutdown failed: {}", e);
        }
        self.links.clear();
        self.reconnects.clear();
    }
}

fn timestamp(millis: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{private_chat_id, EMERGENCY_CHAT_ID};
    use crate::store::MemoryStore;
    use relaymesh_network::MemoryHub;
    use tokio::sync::mpsc;

    struct TestNode {
        id: NodeId,
        router: Router,
        inbox: mpsc::UnboundedReceiver<TransportEvent>,
    }

    async fn spawn_node(hub: &MemoryHub, config: RouterConfig, store: MemoryStore) -> TestNode {
        relaymesh_crypto::init().unwrap();
        spawn_with_identity(hub, NodeIdentity::generate(), config, store).await
    }

    async fn spawn_with_identity(
        hub: &MemoryHub,
        identity: NodeIdentity,
        config: RouterConfig,
        store: MemoryStore,
    ) -> TestNode {
        let id = identity.node_id;
        let transport = Arc::new(hub.transport(id).await);
        let (tx, inbox) = mpsc::unbounded_channel();
        transport.register(tx).await.unwrap();
        let router = Router::new(identity, config, transport, Arc::new(store));
        TestNode { id, router, inbox }
    }

    async fn mesh(hub: &MemoryHub, count: usize) -> Vec<TestNode> {
        let mut nodes = Vec::new();
        for _ in 0..count {
            nodes.push(spawn_node(hub, RouterConfig::default(), MemoryStore::new()).await);
        }
        nodes
    }

    /// Deliver transport events until every node is idle
    async fn pump(nodes: &mut [TestNode]) {
        loop {
            let mut idle = true;
            for node in nodes.iter_mut() {
                while let Ok(event) = node.inbox.try_recv() {
                    node.router.handle_event(event).await;
                    idle = false;
                }
            }
            if idle {
                break;
            }
        }
    }

    fn status_of(node: &TestNode, chat_id: &str, id: PacketId) -> MessageStatus {
        node.router.chats.message(chat_id, &id).unwrap().status
    }

    #[tokio::test]
    async fn test_direct_message_is_encrypted_and_acked() {
        let hub = MemoryHub::new();
        let mut nodes = mesh(&hub, 2).await;
        let (a, b) = (nodes[0].id, nodes[1].id);
        hub.link(a, b, 5).await;
        pump(&mut nodes).await;

        assert_eq!(nodes[0].router.get_peers()[0].id, b);
        assert_eq!(nodes[0].router.get_peers()[0].role, PeerRole::Relay);

        let handle = nodes[0]
            .router
            .send_message(b, "hello".to_string(), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(handle.current(), MessageStatus::Sent);
        pump(&mut nodes).await;

        let received = nodes[1].router.get_messages(&private_chat_id(&a));
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].content, "hello");
        assert!(received[0].encrypted);
        assert_eq!(received[0].hops, 0);
        assert_eq!(received[0].id, handle.id);

        assert_eq!(handle.current(), MessageStatus::Delivered);
        assert_eq!(nodes[1].router.stats().messages_delivered, 1);
    }

    #[tokio::test]
    async fn test_multi_hop_discovers_route() {
        let hub = MemoryHub::new();
        let mut nodes = mesh(&hub, 3).await;
        let (a, b, c) = (nodes[0].id, nodes[1].id, nodes[2].id);
        hub.link(a, b, 4).await;
        hub.link(b, c, 4).await;
        pump(&mut nodes).await;

        let handle = nodes[0]
            .router
            .send_message(c, "over the hill".to_string(), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(handle.current(), MessageStatus::Queued);
        assert_eq!(nodes[0].router.stats().route_requests_sent, 1);

        pump(&mut nodes).await;

        let route = nodes[0].router.get_route(c).await.unwrap().unwrap();
        assert_eq!(route.path, vec![b]);
        assert_eq!(route.next_hop(), Some(b));

        let received = nodes[2].router.get_messages(&private_chat_id(&a));
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].content, "over the hill");
        assert_eq!(received[0].hops, 1);
        assert!(received[0].encrypted);

        assert_eq!(handle.current(), MessageStatus::Delivered);
        assert!(nodes[0].router.queued().is_empty());
    }

    #[tokio::test]
    async fn test_relay_decrements_ttl() {
        let hub = MemoryHub::new();
        let mut nodes = mesh(&hub, 3).await;
        let (a, b, c) = (nodes[0].id, nodes[1].id, nodes[2].id);
        hub.link(a, b, 3).await;
        hub.link(b, c, 3).await;
        pump(&mut nodes).await;
        hub.clear_records().await;

        nodes[0]
            .router
            .broadcast_emergency("help".to_string())
            .await
            .unwrap();
        pump(&mut nodes).await;

        let sent = decode(&hub.delivered(a, b).await[0]).unwrap();
        let relayed = decode(&hub.delivered(b, c).await[0]).unwrap();
        assert_eq!(relayed.id, sent.id);
        assert_eq!(relayed.ttl, sent.ttl - 1);
        assert_eq!(relayed.hops, sent.hops + 1);

        // Not echoed back towards the sender
        assert!(hub.delivered(b, a).await.is_empty());

        let at_c = nodes[2].router.get_messages(EMERGENCY_CHAT_ID);
        assert_eq!(at_c.len(), 1);
        assert_eq!(at_c[0].kind, MessageKind::Emergency);
        assert_eq!(at_c[0].hops, 1);
    }

    #[tokio::test]
    async fn test_duplicate_frame_is_ignored() {
        let hub = MemoryHub::new();
        let mut nodes = mesh(&hub, 2).await;
        let (a, b) = (nodes[0].id, nodes[1].id);

        let payload = encode_payload(&MessagePayload {
            content: b"twice".to_vec(),
            nonce: None,
            encrypted: false,
            sender_public_key: None,
            priority: Priority::Normal,
            kind: MessageKind::Text,
            group: None,
            sender_name: None,
        })
        .unwrap();
        let frame = encode(&Packet::new(PacketKind::Message, a, b, payload, 5)).unwrap();

        nodes[1].router.handle_inbound(a, &frame).await;
        nodes[1].router.handle_inbound(a, &frame).await;

        assert_eq!(nodes[1].router.get_messages(&private_chat_id(&a)).len(), 1);
        assert_eq!(nodes[1].router.stats().duplicates_dropped, 1);
        assert_eq!(nodes[1].router.get_chats()[0].unread, 1);
        pump(&mut nodes).await;
    }

    #[tokio::test]
    async fn test_bad_frames_are_counted() {
        let hub = MemoryHub::new();
        let mut nodes = mesh(&hub, 2).await;
        let (a, b) = (nodes[0].id, nodes[1].id);

        nodes[1].router.handle_inbound(a, b"not a frame").await;
        assert_eq!(nodes[1].router.stats().decode_errors, 1);

        let mut dead = Packet::new(PacketKind::Heartbeat, a, b, Vec::new(), 1);
        dead.ttl = 0;
        nodes[1].router.handle_packet(a, dead).await;
        assert_eq!(nodes[1].router.stats().protocol_violations, 1);

        // Discovery claiming somebody else's key
        let payload = encode_payload(&DiscoveryPayload {
            public_key: [7; 32],
            display_name: None,
            role: None,
            battery: None,
        })
        .unwrap();
        let forged = Packet::new(PacketKind::Discovery, a, b, payload, 1);
        nodes[1].router.handle_packet(a, forged).await;
        assert_eq!(nodes[1].router.stats().protocol_violations, 2);
        assert!(nodes[1].router.get_peers().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_message_gets_placeholder() {
        let hub = MemoryHub::new();
        let mut nodes = mesh(&hub, 2).await;
        let (a, b) = (nodes[0].id, nodes[1].id);

        let payload = encode_payload(&MessagePayload {
            content: vec![1; 40],
            nonce: Some([0; 24]),
            encrypted: true,
            sender_public_key: None,
            priority: Priority::Normal,
            kind: MessageKind::Text,
            group: None,
            sender_name: None,
        })
        .unwrap();
        let packet = Packet::new(PacketKind::Message, a, b, payload, 5);
        nodes[1].router.handle_packet(a, packet).await;

        let messages = nodes[1].router.get_messages(&private_chat_id(&a));
        assert_eq!(messages[0].content, UNREADABLE_PLACEHOLDER);
        assert!(!messages[0].encrypted);
        assert_eq!(nodes[1].router.stats().decrypt_failures, 1);
        pump(&mut nodes).await;
    }

    #[tokio::test]
    async fn test_queue_preserves_order() {
        let hub = MemoryHub::new();
        let mut nodes = mesh(&hub, 2).await;
        let (a, b) = (nodes[0].id, nodes[1].id);
        hub.link(a, b, 5).await;
        pump(&mut nodes).await;

        hub.set_failing(a, b, true).await;
        let mut ids = Vec::new();
        for text in ["one", "two", "three"] {
            let handle = nodes[0]
                .router
                .send_message(b, text.to_string(), Priority::Normal)
                .await
                .unwrap();
            assert_eq!(handle.current(), MessageStatus::Queued);
            ids.push(handle.id);
        }
        assert_eq!(nodes[0].router.queued().len(), 3);

        // A failing head blocks the rest of the pass
        hub.clear_records().await;
        nodes[0].router.tick().await;
        assert_eq!(hub.attempts(a, b).await, 1);
        assert_eq!(nodes[0].router.queued().len(), 3);

        hub.set_failing(a, b, false).await;
        nodes[0].router.tick().await;
        pump(&mut nodes).await;

        let received: Vec<String> = nodes[1]
            .router
            .get_messages(&private_chat_id(&a))
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(received, vec!["one", "two", "three"]);

        let chat = private_chat_id(&b);
        for id in ids {
            assert_eq!(status_of(&nodes[0], &chat, id), MessageStatus::Delivered);
        }
    }

    #[tokio::test]
    async fn test_messages_fail_after_max_attempts() {
        let hub = MemoryHub::new();
        let config = RouterConfig {
            max_attempts: 2,
            ..Default::default()
        };
        let mut node = spawn_node(&hub, config, MemoryStore::new()).await;
        relaymesh_crypto::init().unwrap();
        let stranger = NodeIdentity::generate().node_id;

        let handle = node
            .router
            .send_message(stranger, "anyone?".to_string(), Priority::Low)
            .await
            .unwrap();

        node.router.tick().await;
        node.router.tick().await;
        assert_eq!(handle.current(), MessageStatus::Queued);
        node.router.tick().await;
        assert_eq!(handle.current(), MessageStatus::Failed);
        assert_eq!(node.router.stats().messages_failed, 1);
        assert!(node.router.queued().is_empty());

        let chat = private_chat_id(&stranger);
        let retried = node.router.retry_message(&chat, handle.id).await.unwrap();
        assert_eq!(retried.current(), MessageStatus::Queued);
        assert_eq!(node.router.queued().len(), 1);

        assert!(matches!(
            node.router.retry_message(&chat, handle.id).await,
            Err(RoutingError::NotRetryable(MessageStatus::Queued))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_invalidates_routes() {
        let hub = MemoryHub::new();
        let mut nodes = mesh(&hub, 3).await;
        let (a, b, c) = (nodes[0].id, nodes[1].id, nodes[2].id);
        hub.link(a, b, 4).await;
        hub.link(b, c, 4).await;
        pump(&mut nodes).await;

        nodes[0]
            .router
            .send_message(c, "first".to_string(), Priority::Normal)
            .await
            .unwrap();
        pump(&mut nodes).await;
        assert!(nodes[0].router.route_table()[0].valid);

        hub.unlink(a, b).await;
        pump(&mut nodes).await;
        assert!(!nodes[0].router.route_table()[0].valid);
        assert!(!nodes[0].router.get_peers()[0].is_online);

        let handle = nodes[0]
            .router
            .send_message(c, "second".to_string(), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(handle.current(), MessageStatus::Queued);

        // Link comes back; the queued message flows once the route is
        // rediscovered
        hub.link(a, b, 4).await;
        pump(&mut nodes).await;
        nodes[0].router.tick().await;
        pump(&mut nodes).await;
        assert_eq!(handle.current(), MessageStatus::Delivered);
        assert_eq!(nodes[2].router.get_messages(&private_chat_id(&a)).len(), 2);
    }

    #[tokio::test]
    async fn test_group_reaches_participants_only() {
        let hub = MemoryHub::new();
        let mut nodes = mesh(&hub, 3).await;
        let (a, b, c) = (nodes[0].id, nodes[1].id, nodes[2].id);
        hub.link(a, b, 3).await;
        hub.link(a, c, 3).await;
        pump(&mut nodes).await;

        let group = nodes[0]
            .router
            .create_group("Hikers".to_string(), vec![b])
            .unwrap();
        assert_eq!(group.participants, vec![a, b]);
        assert_eq!(group.admins, vec![a]);

        let handle = nodes[0]
            .router
            .send_to_chat(&group.id, "trailhead at 9".to_string())
            .await
            .unwrap();
        assert_eq!(handle.current(), MessageStatus::Relayed);
        pump(&mut nodes).await;

        let at_b = nodes[1].router.get_messages(&group.id);
        assert_eq!(at_b.len(), 1);
        assert_eq!(at_b[0].content, "trailhead at 9");
        assert_eq!(nodes[1].router.chats.group(&group.id).unwrap().name, "Hikers");

        assert!(nodes[2].router.get_chats().is_empty());
        assert!(nodes[0]
            .router
            .create_group("  ".to_string(), vec![b])
            .is_err());
    }

    #[tokio::test]
    async fn test_emergency_mode_reverts() {
        let hub = MemoryHub::new();
        let config = RouterConfig {
            power_mode: PowerMode::BatterySaver,
            emergency_duration: Duration::ZERO,
            ..Default::default()
        };
        let mut node = spawn_node(&hub, config, MemoryStore::new()).await;
        let mut events = node.router.subscribe();

        let handle = node
            .router
            .broadcast_emergency("fire".to_string())
            .await
            .unwrap();
        assert_eq!(node.router.power_mode(), PowerMode::Emergency);
        // No links yet: held for later
        assert_eq!(handle.current(), MessageStatus::Queued);

        node.router.tick().await;
        assert_eq!(node.router.power_mode(), PowerMode::BatterySaver);

        let mut modes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let MeshEvent::PowerModeChanged(mode) = event {
                modes.push(mode);
            }
        }
        assert_eq!(modes, vec![PowerMode::Emergency, PowerMode::BatterySaver]);
    }

    #[tokio::test]
    async fn test_create_chat_requires_known_peer() {
        let hub = MemoryHub::new();
        let mut nodes = mesh(&hub, 2).await;
        let (a, b) = (nodes[0].id, nodes[1].id);

        assert!(matches!(
            nodes[0].router.create_chat(b),
            Err(RoutingError::UnknownPeer(_))
        ));
        assert!(matches!(
            nodes[0]
                .router
                .send_message(a, "me".to_string(), Priority::Normal)
                .await,
            Err(RoutingError::InvalidDestination(_))
        ));

        hub.link(a, b, 2).await;
        pump(&mut nodes).await;
        let chat = nodes[0].router.create_chat(b).unwrap();
        assert_eq!(chat.id, private_chat_id(&b));
        assert_eq!(chat.kind, ChatKind::Private);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        relaymesh_crypto::init().unwrap();
        let hub = MemoryHub::new();
        let store = MemoryStore::new();
        let identity = NodeIdentity::generate();
        let stranger = NodeIdentity::generate().node_id;

        let mut node =
            spawn_with_identity(&hub, identity.clone(), RouterConfig::default(), store.clone())
                .await;
        node.router
            .send_message(stranger, "later".to_string(), Priority::Normal)
            .await
            .unwrap();
        node.router.shutdown().await;
        assert_eq!(
            store.keys().await,
            vec!["chats", "peers", "queue", "routes"]
        );

        let hub = MemoryHub::new();
        let mut restarted =
            spawn_with_identity(&hub, identity, RouterConfig::default(), store).await;
        restarted.router.restore().await;

        assert_eq!(restarted.router.queued().len(), 1);
        let messages = restarted.router.get_messages(&private_chat_id(&stranger));
        assert_eq!(messages[0].content, "later");
        assert_eq!(messages[0].status, MessageStatus::Queued);
    }

    #[tokio::test]
    async fn test_save_failures_are_counted() {
        let hub = MemoryHub::new();
        let store = MemoryStore::new();
        let mut node = spawn_node(&hub, RouterConfig::default(), store.clone()).await;
        store.set_fail_writes(true);
        node.router.save_cache().await;
        assert_eq!(node.router.stats().persistence_failures, 4);
    }

    #[tokio::test]
    async fn test_finished_sends_release_watchers() {
        let hub = MemoryHub::new();
        let mut nodes = mesh(&hub, 2).await;
        let (a, b) = (nodes[0].id, nodes[1].id);
        hub.link(a, b, 5).await;
        pump(&mut nodes).await;

        let group = nodes[0]
            .router
            .create_group("Crew".to_string(), vec![b])
            .unwrap();
        for i in 0..5 {
            nodes[0]
                .router
                .send_to_chat(&group.id, format!("group {}", i))
                .await
                .unwrap();
            nodes[0]
                .router
                .broadcast_emergency(format!("alert {}", i))
                .await
                .unwrap();
        }
        assert!(nodes[0].router.watchers.is_empty());

        // b is not pumped, so no ack arrives; the dropped handle goes on
        // the next tick
        nodes[0]
            .router
            .send_message(b, "unacked".to_string(), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(nodes[0].router.watchers.len(), 1);
        nodes[0].router.tick().await;
        assert!(nodes[0].router.watchers.is_empty());
        pump(&mut nodes).await;
    }

    #[tokio::test]
    async fn test_lost_relay_is_redialled() {
        let hub = MemoryHub::new();
        let config = RouterConfig {
            reconnect_delay: Duration::ZERO,
            ..Default::default()
        };
        let mut nodes = vec![
            spawn_node(&hub, config, MemoryStore::new()).await,
            spawn_node(&hub, RouterConfig::default(), MemoryStore::new()).await,
            spawn_node(&hub, RouterConfig::default(), MemoryStore::new()).await,
        ];
        let (a, b, c) = (nodes[0].id, nodes[1].id, nodes[2].id);
        hub.link(a, b, 4).await;
        hub.link(a, c, 1).await;
        pump(&mut nodes).await;

        hub.unlink(a, b).await;
        hub.unlink(a, c).await;
        pump(&mut nodes).await;

        // b is back at the hub before a has heard about it
        hub.link(a, b, 4).await;
        nodes[0].router.tick().await;
        assert_eq!(hub.connects(a, b).await, 1);
        assert_eq!(hub.connects(a, c).await, 0);
        assert_eq!(nodes[0].router.stats().reconnect_attempts, 1);
        assert_eq!(nodes[0].router.stats().reconnect_failures, 0);

        pump(&mut nodes).await;
        assert!(nodes[0].router.links().contains(&b));
        nodes[0].router.tick().await;
        assert_eq!(hub.connects(a, b).await, 1);
    }

    #[tokio::test]
    async fn test_failed_redial_is_counted() {
        let hub = MemoryHub::new();
        let config = RouterConfig {
            reconnect_delay: Duration::ZERO,
            ..Default::default()
        };
        let mut nodes = vec![
            spawn_node(&hub, config, MemoryStore::new()).await,
            spawn_node(&hub, RouterConfig::default(), MemoryStore::new()).await,
        ];
        let (a, b) = (nodes[0].id, nodes[1].id);
        hub.link(a, b, 3).await;
        pump(&mut nodes).await;
        hub.unlink(a, b).await;
        pump(&mut nodes).await;

        nodes[0].router.tick().await;
        assert_eq!(hub.connects(a, b).await, 1);
        assert_eq!(nodes[0].router.stats().reconnect_failures, 1);
    }

    #[tokio::test]
    async fn test_silent_peer_gets_store_and_forward() {
        let hub = MemoryHub::new();
        let config = RouterConfig {
            peer_timeout: Duration::ZERO,
            ..Default::default()
        };
        let mut nodes = vec![
            spawn_node(&hub, config, MemoryStore::new()).await,
            spawn_node(&hub, RouterConfig::default(), MemoryStore::new()).await,
        ];
        let (a, b) = (nodes[0].id, nodes[1].id);
        hub.link(a, b, 5).await;
        pump(&mut nodes).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        nodes[0].router.tick().await;
        assert!(!nodes[0].router.get_peers()[0].is_online);
        hub.clear_records().await;

        let handle = nodes[0]
            .router
            .send_message(b, "are you there?".to_string(), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(handle.current(), MessageStatus::Queued);
        assert_eq!(nodes[0].router.queued().len(), 1);
        assert!(hub.delivered(a, b).await.is_empty());

        // b speaks up again and the queue drains
        nodes[1].router.send_heartbeats().await;
        pump(&mut nodes).await;
        assert!(nodes[0].router.get_peers()[0].is_online);
        assert_eq!(handle.current(), MessageStatus::Delivered);
        assert!(nodes[0].router.queued().is_empty());
    }

    #[tokio::test]
    async fn test_discovery_is_relayed_while_hops_remain() {
        let hub = MemoryHub::new();
        let mut nodes = mesh(&hub, 3).await;
        let (a, b, c) = (nodes[0].id, nodes[1].id, nodes[2].id);
        hub.link(b, c, 4).await;
        pump(&mut nodes).await;
        hub.clear_records().await;

        let announce = |ttl| {
            let payload = encode_payload(&DiscoveryPayload {
                public_key: nodes[0].router.keys.identity().public_key_bytes(),
                display_name: Some("far".to_string()),
                role: None,
                battery: None,
            })
            .unwrap();
            Packet::new(PacketKind::Discovery, a, c, payload, ttl)
        };
        let far = announce(3);
        let near = announce(1);

        nodes[1].router.handle_packet(a, far).await;
        let frames = hub.delivered(b, c).await;
        assert_eq!(frames.len(), 1);
        let forwarded = decode(&frames[0]).unwrap();
        assert_eq!(forwarded.kind, PacketKind::Discovery);
        assert_eq!(forwarded.ttl, 2);

        // Out of hops
        nodes[1].router.handle_packet(a, near).await;
        assert_eq!(hub.delivered(b, c).await.len(), 1);

        pump(&mut nodes).await;
        assert!(nodes[2]
            .router
            .get_peers()
            .iter()
            .any(|p| p.id == a && p.display_name.as_deref() == Some("far")));
    }

    #[tokio::test]
    async fn test_groups_are_listed() {
        let hub = MemoryHub::new();
        let mut nodes = mesh(&hub, 2).await;
        let b = nodes[1].id;

        let trail = nodes[0]
            .router
            .create_group("Trail".to_string(), vec![b])
            .unwrap();
        let base = nodes[0]
            .router
            .create_group("Base camp".to_string(), vec![b])
            .unwrap();
        assert_eq!(nodes[0].router.get_groups(), vec![base, trail]);
        assert!(!nodes[0].router.network_status().emergency_mode);
        pump(&mut nodes).await;
    }
}
