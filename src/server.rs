//! Rendezvous server
//!
//! One receive loop owns the UDP socket's intake. Each datagram is decoded
//! and dispatched inline; registry updates are the only synchronization and
//! roster pushes run on their own task, so a slow send never stalls intake.
//! A second task runs the liveness sweep.
//!
//! The server learns each peer's public endpoint purely from the source
//! address of its JOIN_ROOM datagram. Nothing in a payload is trusted as an
//! address.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::{ServerConfig, Validate};
use crate::error::{is_transient, AppError, ProtocolViolation};
use crate::message::{JoinRoom, Message, Payload, MAX_DATAGRAM};
use crate::registry::{Registry, RosterSnapshot};
use crate::types::{Peer, RoomName};

/// State shared by the receive loop, roster pushes and the sweep
struct Inner {
    socket: UdpSocket,
    registry: Arc<Registry>,
}

/// The rendezvous server
///
/// Build with [`RendezvousServer::bind`] (or [`RendezvousServer::from_socket`]
/// for an already bound socket), then drive it with [`RendezvousServer::run`].
pub struct RendezvousServer {
    inner: Arc<Inner>,
    config: ServerConfig,
    span: Span,
}

impl RendezvousServer {
    /// Validate the config and bind its listen address
    pub async fn bind(config: ServerConfig) -> Result<Self, AppError> {
        config.validate()?;
        let socket = UdpSocket::bind(config.listen_addr()?).await?;
        Ok(Self::from_socket(socket, config))
    }

    /// Wrap an already bound socket
    pub fn from_socket(socket: UdpSocket, config: ServerConfig) -> Self {
        let span = match socket.local_addr() {
            Ok(addr) => info_span!("rendezvous", %addr),
            Err(_) => info_span!("rendezvous"),
        };
        Self {
            inner: Arc::new(Inner {
                socket,
                registry: Arc::new(Registry::new()),
            }),
            config,
            span,
        }
    }

    /// Log under the given span instead of the default one
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AppError> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Shared handle to the room registry
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.inner.registry)
    }

    /// Run until `shutdown` resolves or the socket fails fatally
    ///
    /// Dropping the server afterwards closes the socket.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), AppError> {
        let span = self.span.clone();
        async move {
            info!("Rendezvous server started");

            let sweep = tokio::spawn(
                sweep_loop(Arc::clone(&self.inner), self.config.clone()).in_current_span(),
            );

            let result = tokio::select! {
                res = self.inner.receive_loop() => res,
                _ = shutdown => {
                    info!("Shutdown requested");
                    Ok(())
                }
            };

            sweep.abort();
            info!("Rendezvous server stopped");
            result
        }
        .instrument(span)
        .await
    }
}

impl Inner {
    async fn receive_loop(self: &Arc<Self>) -> Result<(), AppError> {
        // One spare byte so oversized datagrams are detected instead of
        // silently truncated to a valid-looking size
        let mut buf = vec![0u8; MAX_DATAGRAM + 1];

        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) if is_transient(&e) => {
                    warn!("Transient receive error: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("Receive loop terminated: {}", e);
                    return Err(AppError::Transport(e));
                }
            };
            self.handle_datagram(&buf[..len], from);
        }
    }

    /// Process one datagram; never fails, never blocks on the network
    fn handle_datagram(self: &Arc<Self>, data: &[u8], from: SocketAddr) {
        // Dual-stack sockets report IPv4 peers as mapped addresses; the
        // registry only ever holds the plain IPv4 form
        let from = match observed_endpoint(from) {
            Ok(endpoint) => endpoint,
            Err(violation) => {
                debug!("Dropping datagram: {}", violation);
                return;
            }
        };
        let message = match Message::decode(data, from) {
            Ok(message) => message,
            Err(e) => {
                debug!(%from, "Dropping malformed datagram: {}", e);
                return;
            }
        };

        // Any well-formed packet counts as a sign of life
        self.registry.touch_all(from);

        match message {
            Message::JoinRoom(join) => {
                if let Err(e) = self.handle_join(from, join) {
                    warn!("Dropping join: {}", e);
                }
            }
            Message::Pong => {
                debug!(%from, "Pong");
            }
            other => {
                let violation = ProtocolViolation::UnexpectedKind {
                    kind: other.kind(),
                    from,
                };
                debug!("Dropping datagram: {}", violation);
            }
        }
    }

    fn handle_join(self: &Arc<Self>, endpoint: SocketAddr, join: JoinRoom) -> Result<(), AppError> {
        let peer = Peer::named(endpoint, join.display_name);
        let snapshot = self.registry.join(&join.room, peer.clone())?;
        info!(room = %join.room, peer = %peer, "Peer joined");
        debug!(
            room = %snapshot.room,
            version = snapshot.version,
            "Room has {} member(s)",
            snapshot.members.len()
        );

        let inner = Arc::clone(self);
        tokio::spawn(
            async move {
                inner.push_roster(&snapshot).await;
            }
            .in_current_span(),
        );
        Ok(())
    }

    /// Send the snapshot's roster to every member in it
    ///
    /// A failed send to one member is logged and does not affect the others.
    async fn push_roster(&self, snapshot: &RosterSnapshot) {
        if snapshot.members.is_empty() {
            return;
        }
        let data = match snapshot.to_roster().to_envelope().and_then(|e| e.encode()) {
            Ok(data) => data,
            Err(e) => {
                error!(room = %snapshot.room, "Cannot encode roster: {}", e);
                return;
            }
        };

        for member in &snapshot.members {
            if let Err(e) = self.socket.send_to(&data, member.endpoint).await {
                warn!(room = %snapshot.room, to = %member.endpoint, "Roster send failed: {}", e);
            }
        }
    }

    /// One liveness pass: ping idle peers, evict dead ones, re-push rosters
    ///
    /// Registry locks are only held while planning and evicting; every send
    /// happens afterwards.
    async fn sweep(&self, ping_after: Duration, evict_after: Duration) {
        let now = Instant::now();
        let plan = self.registry.plan_sweep(now, ping_after, evict_after);
        let evicted = self.registry.evict_idle(&plan, now, evict_after);

        // Latest snapshot per room
        let mut rosters: HashMap<RoomName, RosterSnapshot> = HashMap::new();
        for snapshot in evicted {
            match rosters.get(&snapshot.room) {
                Some(existing) if existing.version > snapshot.version => {}
                _ => {
                    rosters.insert(snapshot.room.clone(), snapshot);
                }
            }
        }
        for (room, endpoint) in &plan.evict {
            info!(room = %room, peer = %endpoint, "Peer idle past eviction timeout");
        }

        if !plan.ping.is_empty() {
            match Message::Ping.encode() {
                Ok(ping) => {
                    for endpoint in &plan.ping {
                        debug!(to = %endpoint, "Ping");
                        if let Err(e) = self.socket.send_to(&ping, *endpoint).await {
                            warn!(to = %endpoint, "Ping send failed: {}", e);
                        }
                    }
                }
                Err(e) => error!("Cannot encode ping: {}", e),
            }
        }

        for snapshot in rosters.values() {
            if snapshot.members.is_empty() {
                debug!(room = %snapshot.room, "Room deleted (empty)");
            }
            self.push_roster(snapshot).await;
        }
    }
}

async fn sweep_loop(inner: Arc<Inner>, config: ServerConfig) {
    let mut ticker = tokio::time::interval(config.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        inner.sweep(config.ping_after(), config.evict_after()).await;
    }
}

/// The endpoint a datagram is attributed to
///
/// IPv4-mapped IPv6 sources are unwrapped; genuine IPv6 sources cannot be
/// carried in a roster and are rejected.
fn observed_endpoint(from: SocketAddr) -> Result<SocketAddr, ProtocolViolation> {
    match from {
        SocketAddr::V4(_) => Ok(from),
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(ip) => Ok(SocketAddr::from((ip, v6.port()))),
            None => Err(ProtocolViolation::UnsupportedSource(from)),
        },
    }
}
