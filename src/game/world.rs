//! World module
//!
//! Composition root of the simulation. Owns the scheduler, the lattice, the
//! pathfinder, every creature and every session, and runs one tick in a fixed
//! order:
//! 1. advance the clock and fire due events
//! 2. work out the active chunks (those around players)
//! 3. players process buffered input
//! 4. NPCs, then monsters in active chunks think
//!
//! Anything scheduled during a tick fires on a later one.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::chunk::{Audience, ChunkDimensions, ChunkId};
use super::creature::{Creature, CreatureId, CreatureKind, Occupancy};
use super::lattice::{Lattice, WorldSize};
use super::pathfinder::{PathMode, PathStats, Pathfinder, AVERAGE_FRICTION, DEFAULT_WINDOW};
use super::position::{Direction, Position};
use super::tile::Item;
use crate::error::{GameError, LatticeError, ProtocolError, Result, ScheduleError};
use crate::event::queue::fire;
use crate::event::{EventHandle, EventQueue, Tick};
use crate::net::session::{Session, SessionManager, SessionState};
use crate::protocol::game::{ClientPacket, MoveTarget, ResolvedTarget, TargetResolver, MAX_MESSAGE_LENGTH};
use crate::protocol::packets::{
    CancelMessagePacket, ContainerItemAddPacket, ContainerItemRemovePacket, CreatureForgetPacket,
    CreatureMovePacket, CreatureSayPacket, CreatureStatePacket, MagicEffectPacket, OutgoingPacket,
    ServerStatePacket, TileItemAddPacket, TileItemRemovePacket,
};

/// Effect shown where a player enters the world
pub const LOGIN_EFFECT: u8 = 3;

/// World settings
#[derive(Debug, Clone)]
pub struct WorldSettings {
    /// World name
    pub name: String,
    /// Duration of one tick
    pub tick_interval: Duration,
    /// World extent in tiles
    pub size: WorldSize,
    /// Chunk extent in tiles
    pub chunk: ChunkDimensions,
    /// Pathfinder search window
    pub path_window: (u16, u16),
    /// Pathfinder heuristic friction
    pub path_friction: u32,
    /// Idle time before a session is dropped
    pub max_idle: Duration,
    /// Frames processed per session per tick
    pub frames_per_tick: usize,
    /// Whether this world is in development mode
    pub dev_mode: bool,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            name: "Lattice".to_string(),
            tick_interval: Duration::from_millis(50),
            size: WorldSize::new(256, 256, 16),
            chunk: ChunkDimensions::default(),
            path_window: DEFAULT_WINDOW,
            path_friction: AVERAGE_FRICTION,
            max_idle: Duration::from_secs(300),
            frames_per_tick: 16,
            dev_mode: false,
        }
    }
}

impl WorldSettings {
    /// Where new players appear
    pub fn spawn(&self) -> Position {
        Position::new(self.size.width / 2, self.size.height / 2, 0)
    }

    fn tick_ms(&self) -> u64 {
        (self.tick_interval.as_millis() as u64).max(1)
    }
}

/// Counters reported by `World::stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldStats {
    pub tick: Tick,
    pub creatures: usize,
    pub players: usize,
    pub chunks: usize,
    pub pending_events: usize,
    /// Events fired since the previous call
    pub events_handled: u64,
    /// Pathfinder counters since the previous call
    pub path: PathStats,
}

/// Delivers broadcasts through player sessions
struct Recipients<'a> {
    sessions: &'a SessionManager,
    creatures: &'a HashMap<CreatureId, Creature>,
}

impl<'a> Recipients<'a> {
    fn new(sessions: &'a SessionManager, creatures: &'a HashMap<CreatureId, Creature>) -> Self {
        Self { sessions, creatures }
    }
}

impl Audience for Recipients<'_> {
    fn deliver(&mut self, player: CreatureId, packet: &Bytes) {
        self.sessions.send_to(player, packet);
    }

    fn floor(&self, player: CreatureId) -> Option<u16> {
        self.creatures.get(&player).map(|c| c.position.z)
    }
}

/// Resolves drag-and-drop targets for one player
struct PlayerTargets<'a> {
    player: &'a Creature,
    lattice: &'a Lattice,
}

impl TargetResolver for PlayerTargets<'_> {
    fn has_container(&self, id: u32) -> bool {
        self.player.container(id).is_some()
    }

    fn has_tile(&self, position: &Position) -> bool {
        self.lattice.tile(position).is_some()
    }
}

/// Game world - runs the simulation tick
pub struct World {
    settings: WorldSettings,
    events: EventQueue<World>,
    lattice: Lattice,
    pathfinder: Pathfinder,
    creatures: HashMap<CreatureId, Creature>,
    sessions: SessionManager,
    /// Movement locks; a creature with a pending lock cannot step
    locks: HashMap<CreatureId, EventHandle<World>>,
    /// New connections from the transport
    connections: Option<mpsc::UnboundedReceiver<Session>>,
    next_id: CreatureId,
    tick: Tick,
}

impl World {
    /// Create an empty world
    pub fn new(settings: WorldSettings) -> Self {
        info!(
            name = %settings.name,
            width = settings.size.width,
            height = settings.size.height,
            depth = settings.size.depth,
            tick_ms = settings.tick_ms(),
            "Creating world"
        );

        Self {
            events: EventQueue::new(settings.tick_interval),
            lattice: Lattice::new(settings.size, settings.chunk),
            pathfinder: Pathfinder::new(settings.path_window, settings.path_friction),
            creatures: HashMap::new(),
            sessions: SessionManager::with_idle_limit(settings.max_idle),
            locks: HashMap::new(),
            connections: None,
            next_id: 1,
            tick: 0,
            settings,
        }
    }

    /// Receive new sessions from a transport
    pub fn with_connections(mut self, connections: mpsc::UnboundedReceiver<Session>) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Fill the ground floor with walkable tiles
    pub fn generate_dev_map(&mut self) {
        let size = self.settings.size;
        self.lattice
            .generate_flat(Position::new(0, 0, 0), size.width, size.height, 100);
    }

    pub fn settings(&self) -> &WorldSettings {
        &self.settings
    }

    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    pub fn lattice_mut(&mut self) -> &mut Lattice {
        &mut self.lattice
    }

    pub fn creature(&self, id: CreatureId) -> Option<&Creature> {
        self.creatures.get(&id)
    }

    pub fn creature_mut(&mut self, id: CreatureId) -> Option<&mut Creature> {
        self.creatures.get_mut(&id)
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Tick currently being (or last) processed
    pub fn current_tick(&self) -> Tick {
        self.tick
    }

    /// Check if a creature is still moving
    pub fn is_locked(&self, id: CreatureId) -> bool {
        self.locks.contains_key(&id)
    }

    /// Schedule a callback against the world
    pub fn schedule<F>(&mut self, delay: i64, callback: F) -> std::result::Result<EventHandle<World>, ScheduleError>
    where
        F: FnOnce(&mut World) + 'static,
    {
        self.events.schedule(delay, callback)
    }

    /// Cancel a scheduled callback
    pub fn cancel(&self, handle: &EventHandle<World>) -> bool {
        self.events.cancel(handle)
    }

    /// Counters for diagnostics; event and path counters reset on each call
    pub fn stats(&mut self) -> WorldStats {
        WorldStats {
            tick: self.tick,
            creatures: self.creatures.len(),
            players: self.creatures.values().filter(|c| c.is_player()).count(),
            chunks: self.lattice.chunk_count(),
            pending_events: self.events.len(),
            events_handled: self.events.events_handled(),
            path: self.pathfinder.stats(),
        }
    }

    // ============ Tick ============

    /// Run one tick
    pub fn tick(&mut self, tick: Tick) {
        self.tick = tick;
        self.events.advance_to(tick);

        while let Some(callback) = self.events.pop_due(tick) {
            fire(callback, self, tick);
        }

        let active = self.active_chunks();

        self.accept_connections();
        self.process_players();

        let npcs = self.thinking(&active, CreatureKind::Npc);
        for id in npcs {
            self.think(id);
        }

        let monsters = self.thinking(&active, CreatureKind::Monster);
        for id in monsters {
            self.think(id);
        }

        trace!(tick, active_chunks = active.len(), "Tick complete");
    }

    /// Chunks around any player
    fn active_chunks(&self) -> BTreeSet<ChunkId> {
        self.lattice.active_chunks(
            self.creatures
                .values()
                .filter(|c| c.is_player())
                .map(|c| c.position),
        )
    }

    /// Creatures of `kind` inside the active chunks
    fn thinking(&self, active: &BTreeSet<ChunkId>, kind: CreatureKind) -> Vec<CreatureId> {
        let chunks = active.iter().filter_map(|id| self.lattice.chunk(*id));

        match kind {
            CreatureKind::Npc => chunks.flat_map(|c| c.npcs()).collect(),
            CreatureKind::Monster => chunks.flat_map(|c| c.monsters()).collect(),
            CreatureKind::Player => chunks.flat_map(|c| c.players()).collect(),
        }
    }

    // ============ Sessions ============

    fn accept_connections(&mut self) {
        let Some(connections) = self.connections.as_mut() else {
            return;
        };

        let mut pending = Vec::new();
        while let Ok(session) = connections.try_recv() {
            pending.push(session);
        }

        for session in pending {
            let session_id = session.id;
            if let Err(e) = self.login(session) {
                warn!(session_id, error = %e, "Login failed");
            }
        }
    }

    /// Create a player for a new session and bring it into the world
    pub fn login(&mut self, session: Session) -> Result<CreatureId> {
        let id = self.next_creature_id();
        let player = Creature::player(id, format!("Player {id}"), self.settings.spawn());

        self.sessions.insert(id, session);

        let state = ServerStatePacket {
            width: self.settings.size.width,
            height: self.settings.size.height,
            depth: u8::try_from(self.settings.size.depth).unwrap_or(u8::MAX),
            chunk_width: u8::try_from(self.settings.chunk.width).unwrap_or(u8::MAX),
            chunk_height: u8::try_from(self.settings.chunk.height).unwrap_or(u8::MAX),
            chunk_depth: u8::try_from(self.settings.chunk.depth).unwrap_or(u8::MAX),
            tick_ms: u8::try_from(self.settings.tick_ms()).unwrap_or(u8::MAX),
            version: crate::VERSION.to_string(),
        };
        self.send_to(id, &state);

        if let Err(e) = self.spawn_creature(player) {
            self.sessions.remove(id);
            return Err(e);
        }

        Ok(id)
    }

    fn next_creature_id(&mut self) -> CreatureId {
        while self.creatures.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1).max(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    fn process_players(&mut self) {
        let players: Vec<CreatureId> = self.sessions.players().collect();
        let limit = self.settings.frames_per_tick;

        for player in players {
            let frames = match self.sessions.get_mut(player) {
                Some(session) => session.drain(limit),
                None => continue,
            };

            for frame in frames {
                let result = ClientPacket::decode(frame)
                    .map_err(LatticeError::from)
                    .and_then(|packet| self.handle_packet(player, packet));

                match result {
                    Ok(()) => {}
                    Err(LatticeError::Protocol(e)) => {
                        self.disconnect(player, &e);
                        break;
                    }
                    Err(e) => debug!(player, error = %e, "Packet rejected"),
                }

                if !self.creatures.contains_key(&player) {
                    break;
                }
            }
        }

        for player in self.sessions.expired() {
            info!(player, "Session closed or idle, removing player");
            self.remove_creature(player);
        }
    }

    /// Close a player's session after a protocol error
    fn disconnect(&mut self, player: CreatureId, reason: &ProtocolError) {
        warn!(player, error = %reason, "Protocol error, closing session");
        if let Some(session) = self.sessions.get_mut(player) {
            session.set_state(SessionState::Disconnecting);
        }
        self.remove_creature(player);
    }

    fn handle_packet(&mut self, player: CreatureId, packet: ClientPacket) -> Result<()> {
        trace!(player, packet = packet.name(), "Handling packet");

        match packet {
            ClientPacket::KeepAlive => Ok(()),
            ClientPacket::Walk(direction) => self.move_creature(player, direction).map(|_| ()),
            ClientPacket::MoveItem {
                from,
                from_index,
                to,
                to_index,
                count,
            } => self.move_item(player, from, from_index, to, to_index, count),
            ClientPacket::Say {
                kind,
                loudness,
                message,
            } => self.say(player, kind, loudness, &message),
            ClientPacket::Logout => self.logout(player),
        }
    }

    fn logout(&mut self, player: CreatureId) -> Result<()> {
        let creature = self
            .creatures
            .get(&player)
            .ok_or(GameError::CreatureNotFound(player))?;

        let no_logout = self
            .lattice
            .tile(&creature.position)
            .is_some_and(|t| t.is_no_logout_zone());
        if no_logout {
            self.send_cancel(player, "You may not logout here.");
            return Ok(());
        }

        info!(player, "Player logged out");
        self.remove_creature(player);
        Ok(())
    }

    fn say(&mut self, player: CreatureId, color: u8, loudness: u8, message: &str) -> Result<()> {
        let creature = self
            .creatures
            .get(&player)
            .ok_or(GameError::CreatureNotFound(player))?;

        let packet = CreatureSayPacket {
            id: player,
            kind: creature.kind,
            message: message.chars().take(MAX_MESSAGE_LENGTH).collect(),
            color,
        };
        let position = creature.position;

        // Loud messages carry across floors
        if loudness == 0 {
            self.broadcast_floor_from(&position, position.z, &packet);
        } else {
            self.broadcast_from(&position, &packet);
        }
        Ok(())
    }

    // ============ Broadcasting ============

    fn encode<P: OutgoingPacket>(packet: &P) -> Option<Bytes> {
        match packet.encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(opcode = ?P::OPCODE, error = %e, "Failed to encode packet");
                None
            }
        }
    }

    /// Send to every player that can see `position`
    fn broadcast_from<P: OutgoingPacket>(&self, position: &Position, packet: &P) {
        let (Some(chunk), Some(bytes)) = (self.lattice.chunk_at(position), Self::encode(packet)) else {
            return;
        };
        let mut audience = Recipients::new(&self.sessions, &self.creatures);
        chunk.broadcast(&self.lattice, &bytes, &mut audience);
    }

    fn broadcast_floor_from<P: OutgoingPacket>(&self, position: &Position, floor: u16, packet: &P) {
        let (Some(chunk), Some(bytes)) = (self.lattice.chunk_at(position), Self::encode(packet)) else {
            return;
        };
        let mut audience = Recipients::new(&self.sessions, &self.creatures);
        chunk.broadcast_floor(&self.lattice, floor, &bytes, &mut audience);
    }

    fn send_to<P: OutgoingPacket>(&self, player: CreatureId, packet: &P) -> bool {
        Self::encode(packet).is_some_and(|bytes| self.sessions.send_to(player, &bytes))
    }

    fn send_cancel(&self, player: CreatureId, message: &str) {
        self.send_to(player, &CancelMessagePacket::new(message));
    }

    /// Introduce every chunk around a player to that player
    fn send_surroundings(&self, player: CreatureId) -> std::result::Result<(), ProtocolError> {
        let Some(creature) = self.creatures.get(&player) else {
            return Ok(());
        };

        let mut audience = Recipients::new(&self.sessions, &self.creatures);
        for id in self.lattice.spectating_chunks(&creature.position) {
            if let Some(chunk) = self.lattice.chunk(*id) {
                chunk.serialize(player, &self.creatures, &mut audience)?;
            }
        }
        Ok(())
    }

    // ============ Creatures ============

    /// Bring a creature into the world on the nearest free tile
    pub fn spawn_creature(&mut self, mut creature: Creature) -> Result<CreatureId> {
        let id = creature.id;
        if self.creatures.contains_key(&id) {
            return Err(GameError::CreatureExists(id).into());
        }

        let requested = creature.position;
        let position = self
            .lattice
            .find_available_tile(&creature, &requested)
            .ok_or(GameError::InvalidLocation {
                x: requested.x,
                y: requested.y,
                z: requested.z,
            })?;

        creature.position = position;
        self.lattice.place_creature(id, creature.kind, &position)?;

        let is_player = creature.is_player();
        debug!(creature = id, kind = creature.kind.name(), position = %position, "Creature spawned");
        self.creatures.insert(id, creature);

        if is_player {
            self.send_surroundings(id)?;
            self.broadcast_from(
                &position,
                &MagicEffectPacket {
                    position,
                    effect: LOGIN_EFFECT,
                },
            );
        }

        if let Some(creature) = self.creatures.get(&id) {
            self.broadcast_from(&position, &CreatureStatePacket::new(creature));
        }

        Ok(id)
    }

    /// Take a creature out of the world
    ///
    /// Cancels its movement lock, tells spectators to forget it and, for
    /// players, drops the session.
    pub fn remove_creature(&mut self, id: CreatureId) -> Option<Creature> {
        let creature = self.creatures.remove(&id)?;
        self.lattice
            .remove_creature(id, creature.kind, &creature.position);

        if let Some(lock) = self.locks.remove(&id) {
            self.events.cancel(&lock);
        }

        for other in self.creatures.values_mut() {
            if other.target == Some(id) {
                other.target = None;
            }
        }

        self.broadcast_from(&creature.position, &CreatureForgetPacket { id });
        self.sessions.remove(id);

        debug!(creature = id, "Creature removed");
        Some(creature)
    }

    /// Set or clear the creature a monster or NPC walks toward
    pub fn set_target(&mut self, id: CreatureId, target: Option<CreatureId>) -> Result<()> {
        if let Some(target) = target {
            if !self.creatures.contains_key(&target) {
                return Err(GameError::CreatureNotFound(target).into());
            }
        }

        let creature = self
            .creatures
            .get_mut(&id)
            .ok_or(GameError::CreatureNotFound(id))?;
        creature.target = target;
        Ok(())
    }

    /// Step a creature one tile
    ///
    /// Returns false when the creature is still moving or the way is blocked.
    pub fn move_creature(&mut self, id: CreatureId, direction: Direction) -> Result<bool> {
        let creature = self
            .creatures
            .get(&id)
            .ok_or(GameError::CreatureNotFound(id))?;

        if self.locks.contains_key(&id) {
            return Ok(false);
        }

        let from = creature.position;
        let target = from
            .step(direction)
            .and_then(|to| self.lattice.tile(&to))
            .filter(|tile| !creature.is_tile_occupied(tile));

        let Some(tile) = target else {
            if creature.is_player() {
                self.send_cancel(id, "There is no way.");
            }
            return Ok(false);
        };

        let to = tile.position();
        let kind = creature.kind;
        let mut ticks = creature.step_duration(tile.friction(), self.settings.tick_ms());
        if kind == CreatureKind::Monster && direction.is_diagonal() {
            ticks *= 2;
        }

        let old_chunk = self.lattice.chunk_at(&from).map(|c| c.id());
        let new_chunk = self.lattice.chunk_at(&to).map(|c| c.id());

        self.lattice.remove_creature(id, kind, &from);
        self.lattice.place_creature(id, kind, &to)?;
        if let Some(creature) = self.creatures.get_mut(&id) {
            creature.position = to;
            creature.direction = direction;
        }

        self.lock(id, ticks)?;

        let duration = u16::try_from(ticks * self.settings.tick_ms()).unwrap_or(u16::MAX);
        self.broadcast_from(
            &from,
            &CreatureMovePacket {
                id,
                position: to,
                duration,
            },
        );

        if let (Some(old), Some(new)) = (old_chunk, new_chunk) {
            if old != new {
                self.change_chunk(id, old, new)?;
            }
        }

        trace!(creature = id, from = %from, to = %to, ticks, "Creature moved");
        Ok(true)
    }

    /// Lock a creature's movement for `ticks`
    fn lock(&mut self, id: CreatureId, ticks: u64) -> std::result::Result<(), ScheduleError> {
        let delay = i64::try_from(ticks).unwrap_or(i64::MAX);
        let handle = self.events.schedule(delay, move |world: &mut World| {
            world.locks.remove(&id);
        })?;
        self.locks.insert(id, handle);
        Ok(())
    }

    /// Update who sees whom after a creature crossed into another chunk
    fn change_chunk(&self, id: CreatureId, old: ChunkId, new: ChunkId) -> std::result::Result<(), ProtocolError> {
        let (Some(old), Some(new), Some(creature)) =
            (self.lattice.chunk(old), self.lattice.chunk(new), self.creatures.get(&id))
        else {
            return Ok(());
        };

        let entered = old.difference(new);
        let left = new.difference(old);
        let is_player = creature.is_player();

        let state = CreatureStatePacket::new(creature).encode()?;
        let forget = CreatureForgetPacket { id }.encode()?;
        let mut audience = Recipients::new(&self.sessions, &self.creatures);

        for chunk in entered.iter().filter_map(|c| self.lattice.chunk(*c)) {
            chunk.internal_broadcast(&state, &mut audience);
            if is_player {
                chunk.serialize(id, &self.creatures, &mut audience)?;
            }
        }

        for chunk in left.iter().filter_map(|c| self.lattice.chunk(*c)) {
            chunk.internal_broadcast(&forget, &mut audience);
            if is_player {
                let others = chunk.players().chain(chunk.npcs()).chain(chunk.monsters());
                for other in others {
                    audience.deliver(id, &CreatureForgetPacket { id: other }.encode()?);
                }
            }
        }

        Ok(())
    }

    /// One decision for a monster or NPC
    ///
    /// Monsters pick the nearest visible player when they have no target; NPCs
    /// only walk when given one.
    fn think(&mut self, id: CreatureId) {
        if self.locks.contains_key(&id) {
            return;
        }

        let Some(target) = self.resolve_target(id) else {
            return;
        };

        let Some(creature) = self.creatures.get(&id) else {
            return;
        };
        let from = creature.position;

        let path = self
            .lattice
            .find_path(&mut self.pathfinder, creature, &from, &target, PathMode::Adjacent);

        let Some(direction) = path.last().and_then(|next| from.step_direction(next)) else {
            return;
        };

        if let Err(e) = self.move_creature(id, direction) {
            debug!(creature = id, error = %e, "Step failed");
        }
    }

    /// Position of the creature `id` is walking toward, refreshing the target
    fn resolve_target(&mut self, id: CreatureId) -> Option<Position> {
        let (window_x, window_y) = self.settings.path_window;
        let creature = self.creatures.get(&id)?;
        let position = creature.position;
        let in_range = |p: &Position| position.is_same_floor(p) && position.is_visible(p, window_x, window_y);

        let current = creature
            .target
            .and_then(|t| self.creatures.get(&t))
            .map(|t| t.position)
            .filter(|p| in_range(p));

        let target = match (current, creature.kind) {
            (Some(position), _) => return Some(position),
            (None, CreatureKind::Monster) => self
                .lattice
                .spectating_chunks(&position)
                .iter()
                .filter_map(|c| self.lattice.chunk(*c))
                .flat_map(|c| c.players())
                .filter_map(|p| self.creatures.get(&p))
                .filter(|p| in_range(&p.position))
                .min_by_key(|p| (position.chebyshev_distance(&p.position), p.id))
                .map(|p| (p.id, p.position)),
            (None, _) => None,
        };

        if let Some(creature) = self.creatures.get_mut(&id) {
            creature.target = target.map(|(t, _)| t);
        }
        target.map(|(_, p)| p)
    }

    // ============ Items ============

    /// Move `count` items of a stack; 0 or the full count moves the whole stack
    fn move_item(
        &mut self,
        player: CreatureId,
        from: Option<MoveTarget>,
        from_index: u8,
        to: Option<MoveTarget>,
        to_index: u8,
        count: u8,
    ) -> Result<()> {
        let creature = self
            .creatures
            .get(&player)
            .ok_or(GameError::CreatureNotFound(player))?;

        let resolver = PlayerTargets {
            player: creature,
            lattice: &self.lattice,
        };
        let source = from.and_then(|t| t.resolve(&resolver));
        let destination = to.and_then(|t| t.resolve(&resolver));

        let (Some(source), Some(destination)) = (source, destination) else {
            self.send_cancel(player, "Sorry, not possible.");
            return Ok(());
        };

        let position = creature.position;
        let (window_x, window_y) = self.settings.path_window;

        if let ResolvedTarget::Tile(p) = source {
            if !position.besides(&p) {
                self.send_cancel(player, "You are too far away.");
                return Ok(());
            }
        }

        if let ResolvedTarget::Tile(p) = destination {
            let reachable = position.is_same_floor(&p)
                && position.is_visible(&p, window_x, window_y)
                && self.lattice.tile(&p).is_some_and(|t| !t.is_block_solid());
            if !reachable {
                self.send_cancel(player, "You cannot throw there.");
                return Ok(());
            }
        }

        // Moving within one container or tile frees the slot it fills
        if source != destination && !self.has_room(player, destination, to_index) {
            self.send_cancel(player, "There is not enough room.");
            return Ok(());
        }

        let Some(item) = self.take_item(player, source, from_index, count) else {
            self.send_cancel(player, "Sorry, not possible.");
            return Ok(());
        };

        if let Err(item) = self.put_item(player, destination, to_index, item) {
            if let Err(lost) = self.put_item(player, source, from_index, item) {
                error!(
                    player,
                    item = lost.id,
                    count = lost.count,
                    source = ?source,
                    "Item lost restoring a failed move"
                );
            }
            self.send_cancel(player, "There is not enough room.");
        }

        Ok(())
    }

    fn has_room(&self, player: CreatureId, destination: ResolvedTarget, index: u8) -> bool {
        match destination {
            ResolvedTarget::Container(container) => self
                .creatures
                .get(&player)
                .and_then(|c| c.container(container))
                .is_some_and(|open| {
                    let wanted = usize::from(index);
                    (wanted < open.size() && open.get(wanted).is_none()) || open.free_slot().is_some()
                }),
            ResolvedTarget::Tile(position) => self.lattice.tile(&position).is_some_and(|t| t.has_room()),
        }
    }

    /// Take `count` items from a stack, splitting it when fewer than all are wanted
    fn take_item(
        &mut self,
        player: CreatureId,
        source: ResolvedTarget,
        index: u8,
        count: u8,
    ) -> Option<Item> {
        match source {
            ResolvedTarget::Container(container) => {
                let open = self.creatures.get_mut(&player)?.container_mut(container)?;
                let slot = usize::from(index);
                let part = open.get_mut(slot)?.split(count);
                let item = match part {
                    Some(part) => part,
                    None => open.take(slot)?,
                };
                self.send_to(
                    player,
                    &ContainerItemRemovePacket {
                        container,
                        index,
                        count: item.count,
                    },
                );
                Some(item)
            }
            ResolvedTarget::Tile(position) => {
                let tile = self.lattice.tile_mut(&position)?;
                let slot = usize::from(index);
                let part = tile.item_mut(slot)?.split(count);
                let item = match part {
                    Some(part) => part,
                    None => tile.remove_item(slot)?,
                };
                self.broadcast_from(
                    &position,
                    &TileItemRemovePacket {
                        position,
                        index,
                        count: item.count,
                    },
                );
                Some(item)
            }
        }
    }

    fn put_item(
        &mut self,
        player: CreatureId,
        destination: ResolvedTarget,
        index: u8,
        item: Item,
    ) -> std::result::Result<(), Item> {
        match destination {
            ResolvedTarget::Container(container) => {
                let Some(open) = self
                    .creatures
                    .get_mut(&player)
                    .and_then(|c| c.container_mut(container))
                else {
                    return Err(item);
                };

                let wanted = usize::from(index);
                let slot = if wanted < open.size() && open.get(wanted).is_none() {
                    Some(wanted)
                } else {
                    open.free_slot()
                };

                let Some(slot) = slot.filter(|s| open.put(*s, item)) else {
                    return Err(item);
                };

                self.send_to(
                    player,
                    &ContainerItemAddPacket {
                        container,
                        index: u8::try_from(slot).unwrap_or(u8::MAX),
                        item,
                    },
                );
                Ok(())
            }
            ResolvedTarget::Tile(position) => {
                let Some(tile) = self.lattice.tile_mut(&position) else {
                    return Err(item);
                };
                if !tile.add_item(item) {
                    return Err(item);
                }

                let index = u8::try_from(tile.items().len() - 1).unwrap_or(u8::MAX);
                self.broadcast_from(
                    &position,
                    &TileItemAddPacket {
                        position,
                        item,
                        index,
                    },
                );
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("name", &self.settings.name)
            .field("tick", &self.tick)
            .field("creatures", &self.creatures.len())
            .field("sessions", &self.sessions.len())
            .field("pending_events", &self.events.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::creature::Container;
    use crate::game::tile::{TileFlags, MAX_TILE_ITEMS};
    use crate::net::buffer::PacketReader;
    use crate::net::session::SessionHandle;
    use crate::protocol::packets::{ClientOpcode, ServerOpcode};
    use std::cell::Cell;
    use std::rc::Rc;

    fn world() -> World {
        let settings = WorldSettings {
            size: WorldSize::new(64, 64, 8),
            ..WorldSettings::default()
        };
        let mut world = World::new(settings);
        world.generate_dev_map();
        world
    }

    fn connect(world: &mut World) -> (CreatureId, SessionHandle) {
        let (session, handle) = Session::pair(1, "127.0.0.1:7171".parse().unwrap());
        let id = world.login(session).unwrap();
        (id, handle)
    }

    fn opcodes(handle: &mut SessionHandle) -> Vec<u8> {
        std::iter::from_fn(|| handle.try_outbound())
            .map(|packet| packet[0])
            .collect()
    }

    fn frame(bytes: &[u8]) -> Bytes {
        Bytes::copy_from_slice(bytes)
    }

    fn run(world: &mut World, ticks: u64) {
        let start = world.current_tick();
        for tick in start + 1..=start + ticks {
            world.tick(tick);
        }
    }

    #[test]
    fn test_login_sequence() {
        let mut world = world();
        let (id, mut handle) = connect(&mut world);

        let creature = world.creature(id).unwrap();
        assert_eq!(creature.position, Position::new(32, 32, 0));

        let sent = opcodes(&mut handle);
        assert_eq!(sent[0], ServerOpcode::ServerState.as_u8());
        // Nine chunks around the spawn, then the effect and own state
        assert_eq!(sent[1..10], [ServerOpcode::Chunk.as_u8(); 9]);
        assert_eq!(
            sent[10..],
            [
                ServerOpcode::MagicEffect.as_u8(),
                ServerOpcode::CreatureState.as_u8()
            ]
        );
    }

    #[test]
    fn test_walk_locks_movement() {
        let mut world = world();
        let (id, mut handle) = connect(&mut world);
        opcodes(&mut handle);

        handle.push_frame(frame(&[ClientOpcode::Walk as u8, Direction::East.as_u8()])).unwrap();
        handle.push_frame(frame(&[ClientOpcode::Walk as u8, Direction::East.as_u8()])).unwrap();
        run(&mut world, 1);

        // Second step is refused while the first is in progress
        assert_eq!(world.creature(id).unwrap().position, Position::new(33, 32, 0));
        assert!(world.is_locked(id));
        assert_eq!(opcodes(&mut handle), vec![ServerOpcode::CreatureMove.as_u8()]);

        // Six ticks for a default-speed step on default ground
        run(&mut world, 5);
        assert!(world.is_locked(id));
        run(&mut world, 1);
        assert!(!world.is_locked(id));
    }

    #[test]
    fn test_walk_into_wall_is_cancelled() {
        let mut world = world();
        let (id, mut handle) = connect(&mut world);
        opcodes(&mut handle);

        world
            .lattice_mut()
            .tile_mut(&Position::new(32, 31, 0))
            .unwrap()
            .set_flags(TileFlags::BLOCK_SOLID);

        assert!(!world.move_creature(id, Direction::North).unwrap());
        assert_eq!(opcodes(&mut handle), vec![ServerOpcode::CancelMessage.as_u8()]);
    }

    #[test]
    fn test_crossing_chunk_border() {
        let mut world = world();
        let (id, mut handle) = connect(&mut world);

        // Stand on the last column of chunk (3, 4)
        world.lattice.remove_creature(id, CreatureKind::Player, &Position::new(32, 32, 0));
        world.lattice.place_creature(id, CreatureKind::Player, &Position::new(31, 36, 0)).unwrap();
        world.creature_mut(id).unwrap().position = Position::new(31, 36, 0);
        opcodes(&mut handle);

        assert!(world.move_creature(id, Direction::East).unwrap());

        let sent = opcodes(&mut handle);
        assert_eq!(sent[0], ServerOpcode::CreatureMove.as_u8());
        // Column x = 5 comes into view: three chunks
        let chunks = sent.iter().filter(|o| **o == ServerOpcode::Chunk.as_u8()).count();
        assert_eq!(chunks, 3);
    }

    #[test]
    fn test_protocol_error_disconnects() {
        let mut world = world();
        let (id, handle) = connect(&mut world);

        handle.push_frame(frame(&[0xEE])).unwrap();
        run(&mut world, 1);

        assert!(world.creature(id).is_none());
        assert!(world.sessions().is_empty());
        assert!(world.lattice().tile(&Position::new(32, 32, 0)).unwrap().creatures().is_empty());
    }

    #[test]
    fn test_transport_hangup_removes_player() {
        let mut world = world();
        let (id, handle) = connect(&mut world);
        drop(handle);

        run(&mut world, 1);
        assert!(world.creature(id).is_none());
    }

    #[test]
    fn test_logout() {
        let mut world = world();
        let (id, mut handle) = connect(&mut world);
        opcodes(&mut handle);

        world
            .lattice_mut()
            .tile_mut(&Position::new(32, 32, 0))
            .unwrap()
            .set_flags(TileFlags::NO_LOGOUT);
        handle.push_frame(frame(&[ClientOpcode::Logout as u8])).unwrap();
        run(&mut world, 1);
        assert!(world.creature(id).is_some());
        assert_eq!(opcodes(&mut handle), vec![ServerOpcode::CancelMessage.as_u8()]);

        world
            .lattice_mut()
            .tile_mut(&Position::new(32, 32, 0))
            .unwrap()
            .set_flags(TileFlags::empty());
        handle.push_frame(frame(&[ClientOpcode::Logout as u8])).unwrap();
        run(&mut world, 1);
        assert!(world.creature(id).is_none());
    }

    #[test]
    fn test_say_reaches_neighbours() {
        let mut world = world();
        let (speaker, mut speaker_handle) = connect(&mut world);
        let (_, mut listener_handle) = connect(&mut world);
        opcodes(&mut speaker_handle);
        opcodes(&mut listener_handle);

        world.say(speaker, 1, 0, "hello").unwrap();

        let packet = listener_handle.try_outbound().unwrap();
        let mut reader = PacketReader::new(packet);
        assert_eq!(reader.read_u8().unwrap(), ServerOpcode::CreatureSay.as_u8());
        assert_eq!(reader.read_u32().unwrap(), speaker);
    }

    #[test]
    fn test_monster_chases_player() {
        let mut world = world();
        let (player, _handle) = connect(&mut world);
        let monster = world
            .spawn_creature(Creature::monster(500, "Rat", Position::new(38, 32, 0)))
            .unwrap();

        let mut caught = false;
        for _ in 0..100 {
            run(&mut world, 1);
            let target = world.creature(player).unwrap().position;
            if world.creature(monster).unwrap().position.besides(&target) {
                caught = true;
                break;
            }
        }

        assert!(caught);
        assert_eq!(world.creature(monster).unwrap().target, Some(player));
    }

    #[test]
    fn test_idle_monster_without_players() {
        let mut world = world();
        let monster = world
            .spawn_creature(Creature::monster(500, "Rat", Position::new(10, 10, 0)))
            .unwrap();

        run(&mut world, 20);
        assert_eq!(world.creature(monster).unwrap().position, Position::new(10, 10, 0));
    }

    #[test]
    fn test_removing_creature_cancels_lock() {
        let mut world = world();
        let (id, _handle) = connect(&mut world);

        assert!(world.move_creature(id, Direction::South).unwrap());
        assert_eq!(world.stats().pending_events, 1);

        world.remove_creature(id);
        assert!(!world.is_locked(id));

        run(&mut world, 10);
        assert_eq!(world.stats().events_handled, 0);
    }

    #[test]
    fn test_scheduled_callback_fires_next_tick() {
        let mut world = world();
        let fired = Rc::new(Cell::new(0));
        let seen = fired.clone();

        world
            .schedule(0, move |w: &mut World| seen.set(w.current_tick()))
            .unwrap();
        assert_eq!(fired.get(), 0);

        run(&mut world, 1);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_move_item_container_to_tile() {
        let mut world = world();
        let (id, mut handle) = connect(&mut world);

        let mut backpack = Container::new(64, 8);
        backpack.put(0, Item::new(2160, 5));
        world.creature_mut(id).unwrap().open_container(backpack);
        opcodes(&mut handle);

        let mut writer = crate::net::buffer::PacketWriter::new(ClientOpcode::MoveItem as u8, 32);
        writer.write_u8(0);
        writer.write_u16(0);
        writer.write_u32(64);
        writer.write_u8(0);
        writer.write_u8(1);
        writer.write_position(&Position::new(33, 32, 0));
        writer.write_u8(0);
        writer.write_u8(5);
        handle.push_frame(writer.finish().unwrap()).unwrap();

        run(&mut world, 1);

        let tile = world.lattice().tile(&Position::new(33, 32, 0)).unwrap();
        assert_eq!(tile.items(), &[Item::new(2160, 5)]);
        assert!(world.creature(id).unwrap().container(64).unwrap().get(0).is_none());
        assert_eq!(
            opcodes(&mut handle),
            vec![
                ServerOpcode::ContainerItemRemove.as_u8(),
                ServerOpcode::TileItemAdd.as_u8()
            ]
        );
    }

    #[test]
    fn test_move_item_out_of_reach() {
        let mut world = world();
        let (id, mut handle) = connect(&mut world);
        world
            .lattice_mut()
            .tile_mut(&Position::new(40, 32, 0))
            .unwrap()
            .add_item(Item::new(100, 1));
        world.creature_mut(id).unwrap().open_container(Container::new(64, 8));
        opcodes(&mut handle);

        world
            .move_item(
                id,
                Some(MoveTarget::Tile(Position::new(40, 32, 0))),
                0,
                Some(MoveTarget::Container(64)),
                0,
                1,
            )
            .unwrap();

        assert_eq!(opcodes(&mut handle), vec![ServerOpcode::CancelMessage.as_u8()]);
        assert_eq!(
            world.lattice().tile(&Position::new(40, 32, 0)).unwrap().items().len(),
            1
        );
    }

    #[test]
    fn test_move_item_splits_stack() {
        let mut world = world();
        let (id, mut handle) = connect(&mut world);

        let mut backpack = Container::new(64, 8);
        backpack.put(0, Item::new(2160, 5));
        world.creature_mut(id).unwrap().open_container(backpack);
        opcodes(&mut handle);

        world
            .move_item(
                id,
                Some(MoveTarget::Container(64)),
                0,
                Some(MoveTarget::Tile(Position::new(33, 32, 0))),
                0,
                2,
            )
            .unwrap();

        let tile = world.lattice().tile(&Position::new(33, 32, 0)).unwrap();
        assert_eq!(tile.items(), &[Item::new(2160, 2)]);
        assert_eq!(
            world.creature(id).unwrap().container(64).unwrap().get(0),
            Some(&Item::new(2160, 3))
        );
        assert_eq!(
            opcodes(&mut handle),
            vec![
                ServerOpcode::ContainerItemRemove.as_u8(),
                ServerOpcode::TileItemAdd.as_u8()
            ]
        );
    }

    #[test]
    fn test_move_item_to_full_tile_keeps_source() {
        let mut world = world();
        let (id, mut handle) = connect(&mut world);

        let full = Position::new(33, 32, 0);
        for i in 0..MAX_TILE_ITEMS {
            world
                .lattice_mut()
                .tile_mut(&full)
                .unwrap()
                .add_item(Item::new(3000 + i as u16, 1));
        }
        let mut backpack = Container::new(64, 8);
        backpack.put(0, Item::new(2160, 5));
        world.creature_mut(id).unwrap().open_container(backpack);
        opcodes(&mut handle);

        world
            .move_item(id, Some(MoveTarget::Container(64)), 0, Some(MoveTarget::Tile(full)), 0, 0)
            .unwrap();

        assert_eq!(opcodes(&mut handle), vec![ServerOpcode::CancelMessage.as_u8()]);
        assert_eq!(
            world.creature(id).unwrap().container(64).unwrap().get(0),
            Some(&Item::new(2160, 5))
        );
        assert_eq!(world.lattice().tile(&full).unwrap().items().len(), MAX_TILE_ITEMS);
    }
}
