//! Session management module
//!
//! A connection is split in two halves joined by unbounded channels:
//! - `SessionHandle` lives on the transport task and pushes decoded frames in
//!   and pulls outbound packets out
//! - `Session` lives in the world and drains inbound frames once per tick
//!
//! The `SessionManager` indexes world-side sessions by the player they control.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info};

use crate::error::NetworkError;
use crate::game::creature::CreatureId;

/// Unique session identifier
pub type SessionId = u64;

/// Session state in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Connected, not yet controlling a player
    Connected,
    /// Controlling a player in the world
    InGame,
    /// Closing after a protocol error or logout
    Disconnecting,
    /// The transport is gone
    Disconnected,
}

impl SessionState {
    /// Check if the session is still active (not disconnecting/disconnected)
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Disconnecting | SessionState::Disconnected)
    }

    /// Get a human-readable name for the state
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Connected => "Connected",
            SessionState::InGame => "InGame",
            SessionState::Disconnecting => "Disconnecting",
            SessionState::Disconnected => "Disconnected",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Transport half of a session
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub address: SocketAddr,
    inbound: mpsc::UnboundedSender<Bytes>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
}

impl SessionHandle {
    /// Hand a received frame to the world
    pub fn push_frame(&self, frame: Bytes) -> Result<(), NetworkError> {
        self.inbound
            .send(frame)
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    /// Next packet the world queued for this client; `None` once the world
    /// dropped the session
    pub async fn next_outbound(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }

    /// Next queued packet without waiting
    pub fn try_outbound(&mut self) -> Option<Bytes> {
        self.outbound.try_recv().ok()
    }

    /// Split into the inbound sender and outbound receiver
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<Bytes>,
        mpsc::UnboundedReceiver<Bytes>,
    ) {
        (self.inbound, self.outbound)
    }
}

/// World half of a session
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub address: SocketAddr,
    state: SessionState,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    outbound: mpsc::UnboundedSender<Bytes>,
    /// Time of session creation
    pub created_at: Instant,
    /// Time of the last received frame
    last_activity: Instant,
}

impl Session {
    /// Create both halves of a session
    pub fn pair(id: SessionId, address: SocketAddr) -> (Session, SessionHandle) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        let session = Session {
            id,
            address,
            state: SessionState::Connected,
            inbound: inbound_rx,
            outbound: outbound_tx,
            created_at: now,
            last_activity: now,
        };

        let handle = SessionHandle {
            id,
            address,
            inbound: inbound_tx,
            outbound: outbound_rx,
        };

        (session, handle)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Set the session state
    pub fn set_state(&mut self, new_state: SessionState) {
        let old_state = self.state;
        self.state = new_state;
        debug!(
            session_id = self.id,
            old_state = %old_state,
            new_state = %new_state,
            "Session state changed"
        );
    }

    /// Check if session is active
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Queue a packet for the client; false when the transport is gone
    pub fn send(&self, packet: Bytes) -> bool {
        self.outbound.send(packet).is_ok()
    }

    /// Take up to `max` buffered frames
    ///
    /// Marks the session disconnected once the transport has hung up and every
    /// buffered frame has been taken.
    pub fn drain(&mut self, max: usize) -> Vec<Bytes> {
        let mut frames = Vec::new();

        while frames.len() < max {
            match self.inbound.try_recv() {
                Ok(frame) => frames.push(frame),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.state != SessionState::Disconnected {
                        self.set_state(SessionState::Disconnected);
                    }
                    break;
                }
            }
        }

        if !frames.is_empty() {
            self.touch();
        }

        frames
    }

    /// Update the last activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Get the duration since last activity
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Check if the session has been idle too long
    pub fn is_idle(&self, max_idle: Duration) -> bool {
        self.idle_duration() > max_idle
    }
}

/// Sessions indexed by the player they control
#[derive(Debug)]
pub struct SessionManager {
    sessions: HashMap<CreatureId, Session>,
    /// Maximum idle time before disconnect
    max_idle_time: Duration,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    /// Create a new session manager
    pub fn new() -> Self {
        Self::with_idle_limit(Duration::from_secs(300))
    }

    /// Create a session manager with a custom idle limit
    pub fn with_idle_limit(max_idle_time: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            max_idle_time,
        }
    }

    /// Attach a session to a player
    pub fn insert(&mut self, player: CreatureId, mut session: Session) {
        session.set_state(SessionState::InGame);
        info!(
            session_id = session.id,
            player,
            address = %session.address,
            "Session attached to player"
        );
        self.sessions.insert(player, session);
    }

    pub fn get(&self, player: CreatureId) -> Option<&Session> {
        self.sessions.get(&player)
    }

    pub fn get_mut(&mut self, player: CreatureId) -> Option<&mut Session> {
        self.sessions.get_mut(&player)
    }

    /// Detach and return a player's session
    pub fn remove(&mut self, player: CreatureId) -> Option<Session> {
        let session = self.sessions.remove(&player)?;
        info!(session_id = session.id, player, "Session removed");
        Some(session)
    }

    /// Queue a packet for a player; false when there is no live session
    pub fn send_to(&self, player: CreatureId, packet: &Bytes) -> bool {
        self.sessions
            .get(&player)
            .is_some_and(|session| session.send(packet.clone()))
    }

    /// Players with an attached session, in no particular order
    pub fn players(&self) -> impl Iterator<Item = CreatureId> + '_ {
        self.sessions.keys().copied()
    }

    /// Players whose sessions are closed or idle past the limit
    pub fn expired(&self) -> Vec<CreatureId> {
        self.sessions
            .iter()
            .filter(|(_, s)| !s.is_active() || s.is_idle(self.max_idle_time))
            .map(|(player, _)| *player)
            .collect()
    }

    /// Drop every session
    pub fn disconnect_all(&mut self) {
        let count = self.sessions.len();
        self.sessions.clear();
        info!(count, "All sessions disconnected");
    }

    /// Number of attached sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no sessions are attached
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> SocketAddr {
        "127.0.0.1:43594".parse().unwrap()
    }

    #[test]
    fn test_session_state() {
        assert!(SessionState::Connected.is_active());
        assert!(SessionState::InGame.is_active());
        assert!(!SessionState::Disconnecting.is_active());
        assert_eq!(SessionState::InGame.to_string(), "InGame");
    }

    #[test]
    fn test_frames_flow_both_ways() {
        let (mut session, mut handle) = Session::pair(1, address());

        handle.push_frame(Bytes::from_static(&[0])).unwrap();
        handle.push_frame(Bytes::from_static(&[4])).unwrap();

        let frames = session.drain(1);
        assert_eq!(frames, vec![Bytes::from_static(&[0])]);
        assert_eq!(session.drain(16), vec![Bytes::from_static(&[4])]);
        assert!(session.drain(16).is_empty());

        assert!(session.send(Bytes::from_static(&[1, 2])));
        let outbound = tokio_test::block_on(handle.next_outbound());
        assert_eq!(outbound, Some(Bytes::from_static(&[1, 2])));
    }

    #[test]
    fn test_transport_hangup() {
        let (mut session, handle) = Session::pair(1, address());
        handle.push_frame(Bytes::from_static(&[0])).unwrap();
        drop(handle);

        // Buffered frames are still delivered
        assert_eq!(session.drain(16).len(), 1);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.send(Bytes::from_static(&[1])));
    }

    #[test]
    fn test_world_hangup() {
        let (session, handle) = Session::pair(1, address());
        drop(session);
        assert_eq!(
            handle.push_frame(Bytes::from_static(&[0])),
            Err(NetworkError::ConnectionClosed)
        );
    }

    #[test]
    fn test_manager() {
        let mut manager = SessionManager::new();
        let (session, _handle) = Session::pair(7, address());

        manager.insert(42, session);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.get(42).unwrap().state(), SessionState::InGame);
        assert!(manager.send_to(42, &Bytes::from_static(&[3])));
        assert!(!manager.send_to(43, &Bytes::from_static(&[3])));
        assert!(manager.expired().is_empty());

        manager.get_mut(42).unwrap().set_state(SessionState::Disconnecting);
        assert_eq!(manager.expired(), vec![42]);

        assert_eq!(manager.remove(42).map(|s| s.id), Some(7));
        assert!(manager.is_empty());
    }
}
