//! In-game session
//!
//! After the encrypted login the world drives the session: it feeds packets
//! to the [`GameBackend`] and pushes creature and map updates back through
//! the `send_*` methods. Every creature update is checked against the
//! client's [`KnownCreatures`] record before it goes out.

use crate::connection::Connection;
use crate::output::OutputMessage;
use crate::protocol::{self, Protocol, ProtocolCore};
use crate::service::Service;
use crate::tasks::Task;
use crate::visibility::{
    KnownCreatures, Recorded, Validation, OP_ADD_THING, OP_MOVE_CREATURE, OP_REMOVE_THING,
};
use crate::world::{CreatureId, GameBackend, GameLogin};
use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::{InputMessage, OutputBuffer, Position, StackPosition, WireError, PROTOCOL_GAME};
use std::sync::Arc;
use std::time::Duration;

pub const OP_DISCONNECT: u8 = 0x14;
pub const OP_PING: u8 = 0x1E;
pub const OP_LOGOUT: u8 = 0x14;

/// Packets waiting longer than this on the dispatcher are dropped
const PACKET_TASK_EXPIRY: Duration = Duration::from_secs(2);

struct Session {
    player: CreatureId,
    known: KnownCreatures,
}

pub struct ProtocolGame {
    core: ProtocolCore,
    backend: Arc<dyn GameBackend>,
    session: Mutex<Option<Session>>,
}

impl ProtocolGame {
    pub fn new(connection: &Arc<Connection>, backend: Arc<dyn GameBackend>) -> Arc<Self> {
        Arc::new(Self {
            core: ProtocolCore::new(connection),
            backend,
            session: Mutex::new(None),
        })
    }

    pub fn player(&self) -> Option<CreatureId> {
        self.session.lock().as_ref().map(|session| session.player)
    }

    /// Whether the client has the creature in its cache
    pub fn knows_creature(&self, creature: CreatureId) -> bool {
        self.session
            .lock()
            .as_ref()
            .map_or(false, |session| session.known.is_known(creature))
    }

    fn as_protocol(self: &Arc<Self>) -> Arc<dyn Protocol> {
        self.clone()
    }

    fn parse_login(&self, msg: &mut InputMessage) -> Result<GameLogin, WireError> {
        let os = msg.get_u16()?;
        let version = msg.get_u16()?;

        msg.rsa_decrypt(&self.core.context().rsa)?;
        let key = msg.get_xtea_key()?;
        self.core.set_xtea_key(key);
        self.core.enable_xtea();

        let gamemaster = msg.get_u8()? != 0;
        let account = msg.get_string()?;
        let character = msg.get_string()?;
        let password = msg.get_string()?;
        Ok(GameLogin {
            ip: self.core.ip(),
            os,
            version,
            gamemaster,
            account,
            character,
            password,
        })
    }

    fn disconnect(self: &Arc<Self>, reason: &str) {
        protocol::disconnect_client(&self.as_protocol(), OP_DISCONNECT, reason);
    }

    /// Runs on the dispatcher
    fn login(self: Arc<Self>, request: GameLogin) {
        let context = Arc::clone(self.core.context());
        let ip = request.ip;
        let character = request.character.clone();

        match self.backend.login(Arc::clone(&self), request) {
            Ok(player) => {
                context.connections.add_attempt(ip, PROTOCOL_GAME, true);
                *self.session.lock() = Some(Session {
                    player,
                    known: KnownCreatures::new(player),
                });
                info!("{} entered the game from {}", character, ip);
            }
            Err(reason) => {
                context.connections.add_attempt(ip, PROTOCOL_GAME, false);
                debug!("Game login for {} from {} refused: {}", character, ip, reason);
                self.disconnect(&reason);
            }
        }
    }

    /// Writes into the current auto-send message under the session lock
    ///
    /// A write that fails leaves neither bytes nor visibility changes behind.
    /// One that overflows a partly filled message is retried once in a fresh
    /// message.
    fn write<F>(self: &Arc<Self>, site: &'static str, f: F)
    where
        F: Fn(&dyn GameBackend, &mut KnownCreatures, &mut OutputBuffer) -> Result<(), WireError>,
    {
        let Some(player) = self.player() else {
            return;
        };
        let protocol = self.as_protocol();
        let Some(message) = protocol::output_buffer(&protocol) else {
            return;
        };

        let result = match self.try_write(&message, &f) {
            Err(WireError::BufferOverflow { .. }) if !message.is_empty() => {
                drop(message);
                match protocol::fresh_output_buffer(&protocol) {
                    Some(message) => self.try_write(&message, &f),
                    None => return,
                }
            }
            result => result,
        };
        if let Err(e) = result {
            warn!("{} for player {} failed: {}", site, player, e);
        }
    }

    fn try_write<F>(&self, message: &OutputMessage, f: &F) -> Result<(), WireError>
    where
        F: Fn(&dyn GameBackend, &mut KnownCreatures, &mut OutputBuffer) -> Result<(), WireError>,
    {
        let mut out = message.buffer();
        let mut session = self.session.lock();
        let Some(session) = session.as_mut() else {
            return Ok(());
        };

        let mark = out.len();
        let snapshot = session.known.clone();
        let result = f(self.backend.as_ref(), &mut session.known, &mut out);
        if result.is_err() {
            out.truncate(mark);
            session.known = snapshot;
        }
        result
    }

    /// `0x64` full map around `center`
    pub fn send_map_description(self: &Arc<Self>, center: Position) {
        self.write("send_map_description", |world, known, out| {
            known.write_full_area(world, &center, out)
        });
    }

    /// `0x69` resend of one tile
    pub fn send_update_tile(self: &Arc<Self>, pos: Position) {
        self.write("send_update_tile", |world, known, out| {
            known.write_tile_update(world, &pos, out)
        });
    }

    /// A creature appeared on the viewer's screen
    pub fn send_add_creature(self: &Arc<Self>, creature: CreatureId, at: StackPosition) {
        self.write("send_add_creature", |world, known, out| {
            match known.validate_registered_creature(creature, None) {
                Validation::Wrong { recorded } => {
                    known.correct_registered_creature(
                        world,
                        creature,
                        recorded,
                        None,
                        Some(at),
                        "send_add_creature",
                        out,
                    )?;
                    Ok(())
                }
                Validation::Valid | Validation::Fresh => {
                    out.add_u8(OP_ADD_THING)?;
                    out.add_position(&at.pos)?;
                    out.add_u8(at.index)?;
                    known.shift_before_insert(&at);
                    known.write_creature(world, creature, at, out)
                }
            }
        });
    }

    /// A creature left the viewer's screen
    pub fn send_remove_creature(self: &Arc<Self>, creature: CreatureId, at: StackPosition) {
        self.write("send_remove_creature", |world, known, out| {
            match known.validate_registered_creature(creature, Some(at)) {
                Validation::Valid => {
                    out.add_u8(OP_REMOVE_THING)?;
                    out.add_position(&at.pos)?;
                    out.add_u8(at.index)?;
                    known.update_registered_creature(creature, None);
                    known.shift_after_remove(&at);
                    Ok(())
                }
                Validation::Fresh => Ok(()),
                Validation::Wrong { recorded } => {
                    known.correct_registered_creature(
                        world,
                        creature,
                        recorded,
                        Some(at),
                        None,
                        "send_remove_creature",
                        out,
                    )?;
                    Ok(())
                }
            }
        });
    }

    /// A creature walked or was moved between tiles
    ///
    /// The viewer's own steps also carry the newly revealed map slices; its
    /// teleports and floor changes resend the whole map.
    pub fn send_move_creature(self: &Arc<Self>, creature: CreatureId, from: StackPosition, to: StackPosition) {
        self.write("send_move_creature", |world, known, out| {
            let recorded = match known.validate_registered_creature(creature, Some(from)) {
                Validation::Valid => None,
                Validation::Fresh => Some(Recorded::Unregistered),
                Validation::Wrong { recorded } => Some(recorded),
            };
            if let Some(recorded) = recorded {
                known.correct_registered_creature(
                    world,
                    creature,
                    recorded,
                    Some(from),
                    Some(to),
                    "send_move_creature",
                    out,
                )?;
                return Ok(());
            }

            let is_viewer = creature == known.viewer();
            if is_viewer && (from.pos.z != to.pos.z || !from.pos.is_adjacent(&to.pos)) {
                out.add_u8(OP_REMOVE_THING)?;
                out.add_position(&from.pos)?;
                out.add_u8(from.index)?;
                known.shift_after_remove(&from);
                return known.write_full_area(world, &to.pos, out);
            }

            out.add_u8(OP_MOVE_CREATURE)?;
            out.add_position(&from.pos)?;
            out.add_u8(from.index)?;
            out.add_position(&to.pos)?;
            known.shift_after_remove(&from);
            known.shift_before_insert(&to);
            known.update_registered_creature(creature, Some(to));

            if is_viewer {
                known.write_step_slices(world, &from.pos, &to.pos, out)?;
            }
            Ok(())
        });
    }

    fn send_ping(self: &Arc<Self>) {
        self.write("send_ping", |_, _, out| out.add_u8(OP_PING));
    }
}

impl Protocol for ProtocolGame {
    fn core(&self) -> &ProtocolCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        "game"
    }

    fn on_recv_first_message(self: Arc<Self>, mut msg: InputMessage) {
        let request = match self.parse_login(&mut msg) {
            Ok(request) => request,
            Err(e) => {
                debug!("Malformed game login from {}: {}", self.core.ip(), e);
                self.core.close_connection();
                return;
            }
        };

        let context = Arc::clone(self.core.context());
        if !context.config.accepts_version(request.version) {
            self.disconnect(&format!(
                "Only clients with protocol {} allowed!",
                context.config.client_version_min
            ));
            return;
        }
        if context.connections.is_disabled(request.ip, PROTOCOL_GAME) {
            self.disconnect("Too many connections attempts from this IP. Try again later.");
            return;
        }

        let protocol = Arc::clone(&self);
        if !context
            .dispatcher
            .add_task(Task::new(move || protocol.login(request)))
        {
            self.core.close_connection();
        }
    }

    fn parse_packet(self: Arc<Self>, mut msg: InputMessage) {
        let Some(player) = self.player() else {
            debug!("Packet from {} before login completed", self.core.ip());
            return;
        };
        let Ok(opcode) = msg.get_u8() else {
            return;
        };

        let dispatcher = Arc::clone(&self.core.context().dispatcher);
        let protocol = Arc::clone(&self);
        let task = match opcode {
            OP_LOGOUT => Task::new(move || {
                protocol.backend.logout(player);
                protocol.core.close_connection();
            }),
            OP_PING => Task::with_expiration(PACKET_TASK_EXPIRY, move || protocol.send_ping()),
            _ => Task::with_expiration(PACKET_TASK_EXPIRY, move || {
                protocol.backend.handle_packet(&protocol, player, opcode, msg);
            }),
        };
        dispatcher.add_task(task);
    }

    fn on_release(&self) {
        if let Some(session) = self.session.lock().take() {
            let backend = Arc::clone(&self.backend);
            let player = session.player;
            let task = Task::new(move || backend.client_detached(player));
            if let Err(task) = self.core.context().dispatcher.try_add_task(task, false) {
                task.execute();
            }
        }
    }
}

pub struct GameService {
    backend: Arc<dyn GameBackend>,
}

impl GameService {
    pub fn new(backend: Arc<dyn GameBackend>) -> Self {
        Self { backend }
    }
}

impl Service for GameService {
    fn protocol_identifier(&self) -> u8 {
        PROTOCOL_GAME
    }

    fn is_checksummed(&self) -> bool {
        true
    }

    fn server_sends_first(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "game protocol"
    }

    fn make_protocol(&self, connection: &Arc<Connection>) -> Arc<dyn Protocol> {
        ProtocolGame::new(connection, Arc::clone(&self.backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::testing;
    use crate::world::TileThing;
    use std::collections::HashMap;

    const PLAYER: CreatureId = 1;

    #[derive(Default)]
    struct TestGame {
        positions: Mutex<HashMap<CreatureId, StackPosition>>,
        refuse: bool,
        detached: Mutex<Vec<CreatureId>>,
        packets: Mutex<Vec<u8>>,
    }

    impl crate::world::WorldView for TestGame {
        fn tile_things(&self, _viewer: CreatureId, pos: &Position) -> Option<Vec<TileThing>> {
            let mut things = vec![TileThing::Item(vec![0x66, 0x00])];
            let mut here: Vec<_> = self
                .positions
                .lock()
                .iter()
                .filter(|(_, at)| at.pos == *pos)
                .map(|(&id, at)| (at.index, id))
                .collect();
            here.sort();
            things.extend(here.into_iter().map(|(_, id)| TileThing::Creature(id)));
            Some(things)
        }

        fn creature_position(&self, creature: CreatureId) -> Option<Position> {
            self.positions.lock().get(&creature).map(|at| at.pos)
        }

        fn can_see_creature(&self, _viewer: CreatureId, _creature: CreatureId) -> bool {
            true
        }

        fn write_creature(
            &self,
            _viewer: CreatureId,
            creature: CreatureId,
            _known: bool,
            out: &mut OutputBuffer,
        ) -> Result<(), WireError> {
            out.add_u32(creature)
        }
    }

    impl GameBackend for TestGame {
        fn login(&self, _client: Arc<ProtocolGame>, _request: GameLogin) -> Result<CreatureId, String> {
            if self.refuse {
                Err("Character not found.".to_string())
            } else {
                Ok(PLAYER)
            }
        }

        fn logout(&self, _player: CreatureId) {}

        fn handle_packet(
            &self,
            _client: &Arc<ProtocolGame>,
            _player: CreatureId,
            opcode: u8,
            _msg: InputMessage,
        ) {
            self.packets.lock().push(opcode);
        }

        fn client_detached(&self, player: CreatureId) {
            self.detached.lock().push(player);
        }
    }

    fn request() -> GameLogin {
        GameLogin {
            ip: testing::peer().ip(),
            os: 2,
            version: 860,
            gamemaster: false,
            account: "1".to_string(),
            character: "Knight".to_string(),
            password: "secret".to_string(),
        }
    }

    fn stack(x: u16, y: u16, index: u8) -> StackPosition {
        StackPosition::new(Position::new(x, y, 7), index)
    }

    fn logged_in(
        game: Arc<TestGame>,
    ) -> (Arc<crate::context::ServerContext>, Arc<Connection>, Arc<ProtocolGame>) {
        let context = testing::context();
        let connection = testing::connection(&context);
        let protocol = ProtocolGame::new(&connection, game);
        connection.attach_protocol(protocol.clone());
        Arc::clone(&protocol).login(request());
        (context, connection, protocol)
    }

    #[test]
    fn test_login_starts_session() {
        let game = Arc::new(TestGame::default());
        let (_context, connection, protocol) = logged_in(game);

        assert_eq!(protocol.player(), Some(PLAYER));
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[test]
    fn test_refused_login_disconnects() {
        let game = Arc::new(TestGame {
            refuse: true,
            ..TestGame::default()
        });
        let (_context, connection, protocol) = logged_in(game);

        assert_eq!(protocol.player(), None);
        assert_ne!(connection.state(), ConnectionState::Open);

        let written = connection.take_written();
        assert_eq!(written.len(), 1);
        assert!(written[0].is_sealed());
    }

    #[test]
    fn test_add_creature_registers_it() {
        let game = Arc::new(TestGame::default());
        let at = stack(100, 100, 1);
        game.positions.lock().insert(7, at);
        let (_context, _connection, protocol) = logged_in(game);

        protocol.send_add_creature(7, at);

        assert!(protocol.knows_creature(7));
        let dyn_protocol: Arc<dyn Protocol> = protocol.clone();
        let output = protocol::output_buffer(&dyn_protocol).unwrap();
        let mut msg = InputMessage::from_slice(output.buffer().body());
        assert_eq!(msg.get_u8().unwrap(), OP_ADD_THING);
        assert_eq!(msg.get_position().unwrap(), at.pos);
        assert_eq!(msg.get_u8().unwrap(), 1);
    }

    #[test]
    fn test_remove_at_wrong_index_is_corrected() {
        let game = Arc::new(TestGame::default());
        let drawn = stack(100, 100, 1);
        game.positions.lock().insert(PLAYER, stack(101, 100, 1));
        game.positions.lock().insert(7, drawn);
        let (_context, _connection, protocol) = logged_in(game);
        protocol.send_add_creature(7, drawn);

        let dyn_protocol: Arc<dyn Protocol> = protocol.clone();
        let before = protocol::output_buffer(&dyn_protocol).unwrap().len();

        protocol.send_remove_creature(7, stack(100, 100, 3));

        let output = protocol::output_buffer(&dyn_protocol).unwrap();
        let body = output.buffer().body()[before..].to_vec();
        assert_eq!(body.first(), Some(&crate::visibility::OP_TILE_UPDATE));
        assert!(protocol.knows_creature(7));
    }

    #[test]
    fn test_map_that_does_not_fit_moves_to_fresh_message() {
        let game = Arc::new(TestGame::default());
        let center = Position::new(100, 100, 7);
        let (context, _connection, protocol) = logged_in(game);
        let dyn_protocol: Arc<dyn Protocol> = protocol.clone();

        protocol.send_map_description(center);
        let first = protocol::output_buffer(&dyn_protocol).unwrap();
        let one_map = first.buffer().body().to_vec();
        assert_eq!(one_map.first(), Some(&crate::visibility::OP_MAP_DESCRIPTION));

        protocol.send_map_description(center);

        assert_eq!(first.buffer().body(), &one_map[..]);
        let second = protocol::output_buffer(&dyn_protocol).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.buffer().body(), &one_map[..]);
        assert!(context.pool.stats().is_consistent());
    }

    #[test]
    fn test_failed_write_leaves_nothing_behind() {
        let game = Arc::new(TestGame::default());
        let (_context, _connection, protocol) = logged_in(game);
        let dyn_protocol: Arc<dyn Protocol> = protocol.clone();

        protocol.send_update_tile(Position::new(100, 100, 7));
        let message = protocol::output_buffer(&dyn_protocol).unwrap();
        let before = message.buffer().body().to_vec();

        protocol.write("oversized", |world, known, out| {
            known.register_creature(world, 9);
            out.add_bytes(&[0; 2048])?;
            out.add_bytes(&[0; shared::MAX_PAYLOAD_LENGTH])
        });

        assert!(!protocol.knows_creature(9));
        assert_eq!(message.buffer().body(), &before[..]);
        let current = protocol::output_buffer(&dyn_protocol).unwrap();
        assert!(current.buffer().is_empty());
    }

    #[test]
    fn test_nothing_is_written_before_login() {
        let context = testing::context();
        let connection = testing::connection(&context);
        let protocol = ProtocolGame::new(&connection, Arc::new(TestGame::default()));

        protocol.send_add_creature(7, stack(100, 100, 1));

        assert!(!protocol.knows_creature(7));
        assert_eq!(context.pool.stats().checked_out, 0);
    }

    #[test]
    fn test_close_reports_detached_player() {
        let game = Arc::new(TestGame::default());
        let (_context, connection, protocol) = logged_in(Arc::clone(&game));
        drop(protocol);

        connection.close();

        assert_eq!(*game.detached.lock(), vec![PLAYER]);
    }
}
