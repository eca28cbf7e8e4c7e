//! Mesh client
//!
//! Joins rooms through the rendezvous server, keeps a cached roster per
//! room, and sends chat text directly to every peer in that roster.
//!
//! Per room: `Disconnected -> Joining -> InRoom -> Disconnected`. A room is
//! `Joining` from `join_room` until its first ROSTER arrives; the whole
//! client drops back to `Disconnected` when its socket dies or on shutdown.
//!
//! The receive loop is the only writer of cached rosters; `send_chat` reads
//! them through the same concurrent map. Delivered events go to a bounded
//! queue and are dropped (newest first) when the consumer falls behind, so
//! packet intake, and with it PING handling, never stalls.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::{ClientConfig, Validate};
use crate::error::{is_transient, AppError, ProtocolViolation};
use crate::message::{Chat, JoinRoom, Message, Payload, Roster, MAX_DATAGRAM};
use crate::types::RoomName;

/// How long the final `Disconnected` event may wait for queue space
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Local state of one room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Not joined, or the client lost its socket
    Disconnected,
    /// JOIN_ROOM sent, no roster yet
    Joining,
    /// At least one roster applied
    InRoom,
}

/// Chat text delivered from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub room: RoomName,
    pub sender: SocketAddr,
    pub text: String,
}

/// Events for the UI layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Chat text from a peer
    Chat(ChatEvent),
    /// A newer roster was applied for a room
    Roster {
        room: RoomName,
        members: Vec<SocketAddr>,
    },
    /// The receive loop ended; no further events follow
    Disconnected,
}

/// Outcome of one mesh send
#[derive(Debug, Default)]
pub struct SendReport {
    /// Peers the datagram was handed to the socket for
    pub delivered: Vec<SocketAddr>,
    /// Peers whose send failed, with the socket error
    pub failed: Vec<(SocketAddr, std::io::Error)>,
}

impl SendReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Cached view of a joined room
#[derive(Debug, Clone)]
struct RoomView {
    state: RoomState,
    /// Version of the applied roster, None before the first one
    version: Option<u64>,
    members: Vec<SocketAddr>,
}

impl RoomView {
    fn joining() -> Self {
        Self {
            state: RoomState::Joining,
            version: None,
            members: Vec::new(),
        }
    }
}

struct Inner {
    socket: UdpSocket,
    rendezvous: SocketAddr,
    display_name: String,
    rooms: DashMap<RoomName, RoomView>,
    events: mpsc::Sender<ClientEvent>,
    dropped: AtomicU64,
    connected: AtomicBool,
}

/// Handle to a running mesh client
///
/// Cheap operations only: every method is a non-blocking UDP send or a map
/// lookup. Dropping the handle stops the background tasks and releases
/// the socket.
pub struct MeshClient {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshClient {
    /// Validate the config, bind its local address and start the client
    ///
    /// Returns the client handle and the receiving end of its event queue.
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), AppError> {
        config.validate()?;
        let socket = UdpSocket::bind(config.bind_addr()?).await?;
        Self::from_socket(socket, &config)
    }

    /// Start a client on an already bound socket
    pub fn from_socket(
        socket: UdpSocket,
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), AppError> {
        let span = match socket.local_addr() {
            Ok(addr) => info_span!("mesh_client", %addr),
            Err(_) => info_span!("mesh_client"),
        };
        Self::from_socket_in(socket, config, span)
    }

    /// Start a client whose tasks log under `span`
    pub fn from_socket_in(
        socket: UdpSocket,
        config: &ClientConfig,
        span: Span,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), AppError> {
        if config.event_capacity == 0 {
            return Err(AppError::Config("event_capacity must be at least 1".into()));
        }
        let (events, rx) = mpsc::channel(config.event_capacity);
        let inner = Arc::new(Inner {
            socket,
            rendezvous: config.rendezvous_addr()?,
            display_name: config.display_name.clone(),
            rooms: DashMap::new(),
            events,
            dropped: AtomicU64::new(0),
            connected: AtomicBool::new(true),
        });

        let (shutdown, stop) = watch::channel(false);
        let receive = tokio::spawn(
            Arc::clone(&inner)
                .receive_loop(stop.clone())
                .instrument(span.clone()),
        );
        let retry = tokio::spawn(
            Arc::clone(&inner)
                .join_retry_loop(config.join_retry(), stop)
                .instrument(span),
        );

        Ok((
            Self {
                inner,
                shutdown,
                tasks: vec![receive, retry],
            },
            rx,
        ))
    }

    /// Ask the rendezvous server to add this client to `room`
    ///
    /// Does not wait for the roster: the room stays `Joining` (with an empty
    /// member list) until one arrives, and JOIN_ROOM is re-sent meanwhile.
    pub async fn join_room(&self, room: &str) -> Result<(), AppError> {
        let room = RoomName::new(room).ok_or(AppError::InvalidRoomName)?;
        self.ensure_connected()?;

        let data = self.inner.join_datagram(&room)?;
        self.inner
            .rooms
            .entry(room.clone())
            .or_insert_with(RoomView::joining);

        info!(room = %room, rendezvous = %self.inner.rendezvous, "Joining room");
        self.inner.socket.send_to(&data, self.inner.rendezvous).await?;
        Ok(())
    }

    /// Forget a room locally
    ///
    /// The protocol has no leave message: the server keeps this endpoint in
    /// the room's roster for as long as the client answers pings, so peers
    /// may keep sending to it. Their CHATs are still delivered, like any
    /// CHAT regardless of room. Returns false if the room was not joined.
    pub fn leave_room(&self, room: &str) -> bool {
        let Some(room) = RoomName::new(room) else {
            return false;
        };
        let left = self.inner.rooms.remove(&room).is_some();
        if left {
            info!(room = %room, "Left room");
        }
        left
    }

    /// Send `text` directly to every peer in the cached roster of `room`
    ///
    /// The datagram is encoded once; oversized text fails before anything
    /// is sent. Each peer is sent to independently, so one failing
    /// destination does not affect the rest.
    pub async fn send_chat(&self, room: &str, text: &str) -> Result<SendReport, AppError> {
        let room = RoomName::new(room).ok_or(AppError::InvalidRoomName)?;
        self.ensure_connected()?;

        let members = self
            .inner
            .rooms
            .get(&room)
            .map(|view| view.members.clone())
            .ok_or_else(|| AppError::NotInRoom(room.to_string()))?;

        let data = Chat {
            room: room.clone(),
            text: text.to_string(),
        }
        .to_envelope()?
        .encode()?;

        let sends = members.iter().map(|&to| {
            let data = data.clone();
            async move { (to, self.inner.socket.send_to(&data, to).await) }
        });

        let mut report = SendReport::default();
        for (to, result) in join_all(sends).await {
            match result {
                Ok(_) => report.delivered.push(to),
                Err(e) => {
                    warn!(room = %room, to = %to, "Chat send failed: {}", e);
                    report.failed.push((to, e));
                }
            }
        }
        debug!(
            room = %room,
            "Chat sent to {}/{} peer(s)",
            report.delivered.len(),
            members.len()
        );
        Ok(report)
    }

    /// State of `room`
    pub fn room_state(&self, room: &str) -> RoomState {
        if !self.is_connected() {
            return RoomState::Disconnected;
        }
        RoomName::new(room)
            .and_then(|room| self.inner.rooms.get(&room).map(|view| view.state))
            .unwrap_or(RoomState::Disconnected)
    }

    /// Cached roster of `room`, empty if unknown or still joining
    pub fn members(&self, room: &str) -> Vec<SocketAddr> {
        RoomName::new(room)
            .and_then(|room| self.inner.rooms.get(&room).map(|view| view.members.clone()))
            .unwrap_or_default()
    }

    /// Rooms currently joined or joining
    pub fn rooms(&self) -> Vec<RoomName> {
        let mut rooms: Vec<RoomName> = self.inner.rooms.iter().map(|e| e.key().clone()).collect();
        rooms.sort();
        rooms
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Events dropped because the consumer was not keeping up
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AppError> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub fn rendezvous(&self) -> SocketAddr {
        self.inner.rendezvous
    }

    /// Stop the background tasks and wait for them to finish
    ///
    /// A final `ClientEvent::Disconnected` is queued for the consumer.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    fn ensure_connected(&self) -> Result<(), AppError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(AppError::Disconnected)
        }
    }
}

impl Drop for MeshClient {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl Inner {
    fn join_datagram(&self, room: &RoomName) -> Result<Bytes, AppError> {
        let join = JoinRoom {
            room: room.clone(),
            display_name: self.display_name.clone(),
        };
        Ok(join.to_envelope()?.encode()?)
    }

    async fn receive_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!(rendezvous = %self.rendezvous, "Client started");
        let mut buf = vec![0u8; MAX_DATAGRAM + 1];

        loop {
            let received = tokio::select! {
                res = self.socket.recv_from(&mut buf) => res,
                _ = stop.changed() => {
                    debug!("Shutdown requested");
                    break;
                }
            };

            match received {
                Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                Err(e) if is_transient(&e) => {
                    debug!("Transient receive error: {}", e);
                }
                Err(e) => {
                    error!("Receive loop terminated: {}", e);
                    break;
                }
            }
        }

        self.connected.store(false, Ordering::Release);
        // Unlike other events this one waits for room in the queue, bounded
        // so a stalled consumer cannot wedge shutdown
        if self
            .events
            .send_timeout(ClientEvent::Disconnected, DISCONNECT_GRACE)
            .await
            .is_err()
        {
            warn!("Consumer did not take the disconnect event");
        }
        info!("Client disconnected");
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let message = match Message::decode(data, from) {
            Ok(message) => message,
            Err(e) => {
                debug!(%from, "Dropping malformed datagram: {}", e);
                return;
            }
        };

        match message {
            Message::Ping => self.pong(from).await,
            // Delivered whatever the local room view says
            Message::Chat(chat) => self.emit(ClientEvent::Chat(ChatEvent {
                room: chat.room,
                sender: from,
                text: chat.text,
            })),
            Message::Roster(roster) => match self.apply_roster(from, roster) {
                Ok(Some(event)) => self.emit(event),
                Ok(None) => {}
                Err(violation) => debug!("Dropping roster: {}", violation),
            },
            other => {
                let violation = ProtocolViolation::UnexpectedKind {
                    kind: other.kind(),
                    from,
                };
                debug!("Dropping datagram: {}", violation);
            }
        }
    }

    /// Answer a keepalive right away, ahead of any other work
    async fn pong(&self, to: SocketAddr) {
        let data = match Message::Pong.encode() {
            Ok(data) => data,
            Err(e) => {
                error!("Cannot encode pong: {}", e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&data, to).await {
            warn!(%to, "Pong send failed: {}", e);
        }
    }

    /// Replace the cached member list wholesale, unless the roster is stale
    ///
    /// Returns the event to emit when the roster was applied.
    fn apply_roster(
        &self,
        from: SocketAddr,
        roster: Roster,
    ) -> Result<Option<ClientEvent>, ProtocolViolation> {
        if from != self.rendezvous {
            return Err(ProtocolViolation::UntrustedRoster(from));
        }
        let Some(mut view) = self.rooms.get_mut(&roster.room) else {
            return Err(ProtocolViolation::UnjoinedRoom(roster.room.into_string()));
        };

        if let Some(applied) = view.version {
            if roster.version < applied {
                debug!(
                    room = %roster.room,
                    "Ignoring stale roster v{} (have v{})",
                    roster.version,
                    applied
                );
                return Ok(None);
            }
        }

        if view.state == RoomState::Joining {
            info!(room = %roster.room, "Joined room");
        }
        view.state = RoomState::InRoom;
        view.version = Some(roster.version);
        view.members = roster.members.clone();
        debug!(
            room = %roster.room,
            version = roster.version,
            "Roster applied: {} member(s)",
            roster.members.len()
        );

        Ok(Some(ClientEvent::Roster {
            room: roster.room,
            members: roster.members,
        }))
    }

    /// Queue an event without waiting; drops it if the queue is full
    fn emit(&self, event: ClientEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "Event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event consumer gone, dropping event");
            }
        }
    }

    /// Re-send JOIN_ROOM for every room still waiting on its first roster
    async fn join_retry_loop(self: Arc<Self>, every: Duration, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }

            let pending: Vec<RoomName> = self
                .rooms
                .iter()
                .filter(|view| view.state == RoomState::Joining)
                .map(|view| view.key().clone())
                .collect();

            for room in pending {
                let data = match self.join_datagram(&room) {
                    Ok(data) => data,
                    Err(e) => {
                        error!(room = %room, "Cannot encode join: {}", e);
                        continue;
                    }
                };
                debug!(room = %room, "Re-sending join");
                if let Err(e) = self.socket.send_to(&data, self.rendezvous).await {
                    warn!(room = %room, "Join send failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::RendezvousServer;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(3);

    fn room(name: &str) -> RoomName {
        RoomName::new(name).unwrap()
    }

    async fn socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    fn config(rendezvous: SocketAddr) -> ClientConfig {
        ClientConfig {
            bind: "127.0.0.1:0".into(),
            rendezvous: rendezvous.to_string(),
            ..ClientConfig::default()
        }
    }

    async fn client(rendezvous: &UdpSocket) -> (MeshClient, mpsc::Receiver<ClientEvent>) {
        MeshClient::connect(config(rendezvous.local_addr().unwrap()))
            .await
            .unwrap()
    }

    async fn recv(sock: &UdpSocket) -> (Message, SocketAddr) {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = timeout(WAIT, sock.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .unwrap();
        (Message::decode(&buf[..len], from).unwrap(), from)
    }

    async fn send(sock: &UdpSocket, to: SocketAddr, msg: Message) {
        sock.send_to(&msg.encode().unwrap(), to).await.unwrap();
    }

    fn roster(name: &str, version: u64, members: Vec<SocketAddr>) -> Message {
        Message::Roster(Roster {
            room: room(name),
            version,
            members,
        })
    }

    /// Round-trip a ping so every datagram sent before it has been handled
    async fn sync(rendezvous: &UdpSocket, client: &MeshClient) {
        let to = client.local_addr().unwrap();
        send(rendezvous, to, Message::Ping).await;
        loop {
            let (msg, from) = recv(rendezvous).await;
            if msg == Message::Pong && from == to {
                return;
            }
        }
    }

    async fn next_chat(rx: &mut mpsc::Receiver<ClientEvent>) -> ChatEvent {
        loop {
            match timeout(WAIT, rx.recv()).await.expect("no event") {
                Some(ClientEvent::Chat(chat)) => return chat,
                Some(_) => continue,
                None => panic!("event queue closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_join_sends_join_room_and_does_not_block() {
        let rendezvous = socket().await;
        let (client, _rx) = client(&rendezvous).await;

        client.join_room("lobby").await.unwrap();
        assert_eq!(client.room_state("lobby"), RoomState::Joining);
        assert!(client.members("lobby").is_empty());

        let (msg, from) = recv(&rendezvous).await;
        assert_eq!(msg, Message::JoinRoom(JoinRoom::new(room("lobby"))));
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_roster_moves_room_in_and_replaces_members() {
        let rendezvous = socket().await;
        let (client, mut rx) = client(&rendezvous).await;
        let to = client.local_addr().unwrap();
        let b: SocketAddr = "10.0.0.2:2000".parse().unwrap();
        let c: SocketAddr = "10.0.0.3:3000".parse().unwrap();

        client.join_room("lobby").await.unwrap();
        send(&rendezvous, to, roster("lobby", 1, vec![b, c])).await;
        sync(&rendezvous, &client).await;
        assert_eq!(client.room_state("lobby"), RoomState::InRoom);
        assert_eq!(client.members("lobby"), vec![b, c]);

        send(&rendezvous, to, roster("lobby", 2, vec![c])).await;
        sync(&rendezvous, &client).await;
        assert_eq!(client.members("lobby"), vec![c]);

        let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            event,
            ClientEvent::Roster {
                room: room("lobby"),
                members: vec![b, c]
            }
        );
    }

    #[tokio::test]
    async fn test_stale_roster_is_ignored() {
        let rendezvous = socket().await;
        let (client, _rx) = client(&rendezvous).await;
        let to = client.local_addr().unwrap();
        let b: SocketAddr = "10.0.0.2:2000".parse().unwrap();
        let c: SocketAddr = "10.0.0.3:3000".parse().unwrap();

        client.join_room("lobby").await.unwrap();
        send(&rendezvous, to, roster("lobby", 2, vec![b])).await;
        send(&rendezvous, to, roster("lobby", 1, vec![b, c])).await;
        sync(&rendezvous, &client).await;

        assert_eq!(client.members("lobby"), vec![b]);
    }

    #[tokio::test]
    async fn test_roster_from_untrusted_source_or_unjoined_room_is_ignored() {
        let rendezvous = socket().await;
        let intruder = socket().await;
        let (client, _rx) = client(&rendezvous).await;
        let to = client.local_addr().unwrap();
        let b: SocketAddr = "10.0.0.2:2000".parse().unwrap();

        client.join_room("lobby").await.unwrap();
        send(&intruder, to, roster("lobby", 9, vec![b])).await;
        send(&rendezvous, to, roster("elsewhere", 9, vec![b])).await;
        sync(&rendezvous, &client).await;

        assert_eq!(client.room_state("lobby"), RoomState::Joining);
        assert!(client.members("lobby").is_empty());
        assert_eq!(client.rooms(), vec![room("lobby")]);
    }

    #[tokio::test]
    async fn test_send_chat_fans_out_to_every_member() {
        let rendezvous = socket().await;
        let (client, _rx) = client(&rendezvous).await;
        let b = socket().await;
        let c = socket().await;
        let b_addr = b.local_addr().unwrap();
        let c_addr = c.local_addr().unwrap();

        client.join_room("lobby").await.unwrap();
        send(
            &rendezvous,
            client.local_addr().unwrap(),
            roster("lobby", 1, vec![b_addr, c_addr]),
        )
        .await;
        sync(&rendezvous, &client).await;

        let report = client.send_chat("lobby", "hi").await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.delivered.len(), 2);

        let expected = Message::Chat(Chat {
            room: room("lobby"),
            text: "hi".into(),
        });
        assert_eq!(recv(&b).await.0, expected);
        assert_eq!(recv(&c).await.0, expected);
    }

    #[tokio::test]
    async fn test_send_chat_failure_does_not_stop_other_sends() {
        let rendezvous = socket().await;
        let (client, _rx) = client(&rendezvous).await;
        let unreachable: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let b = socket().await;
        let b_addr = b.local_addr().unwrap();

        client.join_room("lobby").await.unwrap();
        send(
            &rendezvous,
            client.local_addr().unwrap(),
            roster("lobby", 1, vec![unreachable, b_addr]),
        )
        .await;
        sync(&rendezvous, &client).await;

        let report = client.send_chat("lobby", "hi").await.unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, unreachable);
        assert_eq!(report.delivered, vec![b_addr]);

        let (msg, from) = recv(&b).await;
        assert_eq!(
            msg,
            Message::Chat(Chat {
                room: room("lobby"),
                text: "hi".into(),
            })
        );
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_send_chat_errors() {
        let rendezvous = socket().await;
        let (client, _rx) = client(&rendezvous).await;

        assert!(matches!(
            client.send_chat("nowhere", "hi").await,
            Err(AppError::NotInRoom(_))
        ));
        assert!(matches!(
            client.send_chat("", "hi").await,
            Err(AppError::InvalidRoomName)
        ));

        client.join_room("lobby").await.unwrap();
        // Joining with an empty roster: nothing to send to
        let report = client.send_chat("lobby", "hi").await.unwrap();
        assert!(report.delivered.is_empty());

        let oversized = "x".repeat(MAX_DATAGRAM);
        assert!(matches!(
            client.send_chat("lobby", &oversized).await,
            Err(AppError::Encode(_))
        ));
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let rendezvous = socket().await;
        let (client, _rx) = client(&rendezvous).await;
        let to = client.local_addr().unwrap();

        send(&rendezvous, to, Message::Ping).await;
        let (msg, from) = recv(&rendezvous).await;
        assert_eq!(msg, Message::Pong);
        assert_eq!(from, to);
    }

    #[tokio::test]
    async fn test_chat_is_delivered_with_sender() {
        let rendezvous = socket().await;
        let peer = socket().await;
        let (client, mut rx) = client(&rendezvous).await;

        send(
            &peer,
            client.local_addr().unwrap(),
            Message::Chat(Chat {
                room: room("lobby"),
                text: "hello".into(),
            }),
        )
        .await;

        let chat = next_chat(&mut rx).await;
        assert_eq!(chat.room, room("lobby"));
        assert_eq!(chat.text, "hello");
        assert_eq!(chat.sender, peer.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest_without_stalling() {
        let rendezvous = socket().await;
        let peer = socket().await;
        let (client, mut rx) = MeshClient::connect(ClientConfig {
            event_capacity: 1,
            ..config(rendezvous.local_addr().unwrap())
        })
        .await
        .unwrap();
        let to = client.local_addr().unwrap();

        for text in ["one", "two", "three"] {
            send(
                &peer,
                to,
                Message::Chat(Chat {
                    room: room("lobby"),
                    text: text.into(),
                }),
            )
            .await;
        }
        // Intake keeps going: the ping is still answered
        sync(&rendezvous, &client).await;

        assert_eq!(client.dropped_events(), 2);
        assert_eq!(next_chat(&mut rx).await.text, "one");
    }

    #[tokio::test]
    async fn test_join_is_retried_until_roster() {
        let rendezvous = socket().await;
        let (client, _rx) = MeshClient::connect(ClientConfig {
            join_retry_ms: 50,
            ..config(rendezvous.local_addr().unwrap())
        })
        .await
        .unwrap();

        client.join_room("lobby").await.unwrap();
        for _ in 0..3 {
            let (msg, _) = recv(&rendezvous).await;
            assert!(matches!(msg, Message::JoinRoom(_)));
        }

        send(
            &rendezvous,
            client.local_addr().unwrap(),
            roster("lobby", 1, vec![]),
        )
        .await;
        sync(&rendezvous, &client).await;
        assert_eq!(client.room_state("lobby"), RoomState::InRoom);
    }

    #[tokio::test]
    async fn test_leave_room_forgets_view() {
        let rendezvous = socket().await;
        let (client, _rx) = client(&rendezvous).await;

        client.join_room("lobby").await.unwrap();
        assert!(client.leave_room("lobby"));
        assert!(!client.leave_room("lobby"));
        assert_eq!(client.room_state("lobby"), RoomState::Disconnected);
        assert!(client.rooms().is_empty());
    }

    #[tokio::test]
    async fn test_chat_after_leave_is_still_delivered() {
        let rendezvous = socket().await;
        let peer = socket().await;
        let (client, mut rx) = client(&rendezvous).await;

        client.join_room("lobby").await.unwrap();
        assert!(client.leave_room("lobby"));
        send(
            &peer,
            client.local_addr().unwrap(),
            Message::Chat(Chat {
                room: room("lobby"),
                text: "still here?".into(),
            }),
        )
        .await;

        let chat = next_chat(&mut rx).await;
        assert_eq!(chat.room, room("lobby"));
        assert_eq!(chat.sender, peer.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_emits_disconnected() {
        let rendezvous = socket().await;
        let (client, mut rx) = client(&rendezvous).await;

        client.shutdown().await;
        let event = timeout(WAIT, rx.recv()).await.unwrap();
        assert_eq!(event, Some(ClientEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_two_clients_chat_through_rendezvous() {
        let server = RendezvousServer::bind(ServerConfig {
            listen: "127.0.0.1:0".into(),
            ..ServerConfig::default()
        })
        .await
        .unwrap();
        let server_addr = server.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(server.run(async move {
            let _ = stopped.await;
        }));

        let (alice, _alice_rx) = MeshClient::connect(ClientConfig {
            display_name: "alice".into(),
            ..config(server_addr)
        })
        .await
        .unwrap();
        let (bob, mut bob_rx) = MeshClient::connect(config(server_addr)).await.unwrap();

        alice.join_room("lobby").await.unwrap();
        bob.join_room("lobby").await.unwrap();

        timeout(WAIT, async {
            while alice.members("lobby").len() < 2 || bob.members("lobby").len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("rosters never converged");

        let report = alice.send_chat("lobby", "hi bob").await.unwrap();
        assert_eq!(report.delivered.len(), 2);

        let chat = next_chat(&mut bob_rx).await;
        assert_eq!(chat.text, "hi bob");
        assert_eq!(chat.sender, alice.local_addr().unwrap());

        let _ = stop.send(());
    }
}
