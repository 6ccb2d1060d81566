//! Remote administration
//!
//! A small request/response protocol for operator tools. The session walks
//! through `NotConnected -> EncryptionNotSet -> NotLoggedIn -> LoggedIn`;
//! encryption and the password step can each be switched off in the config.
//! Commands themselves run as dispatcher tasks through the [`AdminBackend`].

use crate::connection::Connection;
use crate::protocol::{Protocol, ProtocolCore};
use crate::service::Service;
use crate::tasks::Task;
use crate::world::{AdminBackend, AdminCommand};
use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::{InputMessage, OutputBuffer, WireError, PROTOCOL_ADMIN, RSA_BLOCK_SIZE};
use std::sync::Arc;
use std::time::{Duration, Instant};

// Requests
pub const AP_MSG_LOGIN: u8 = 1;
pub const AP_MSG_ENCRYPTION: u8 = 2;
pub const AP_MSG_KEY_EXCHANGE: u8 = 3;
pub const AP_MSG_COMMAND: u8 = 4;
pub const AP_MSG_PING: u8 = 5;
pub const AP_MSG_KEEP_ALIVE: u8 = 6;

// Replies
pub const AP_MSG_HELLO: u8 = 1;
pub const AP_MSG_KEY_EXCHANGE_OK: u8 = 0x10;
pub const AP_MSG_KEY_EXCHANGE_FAILED: u8 = 0x11;
pub const AP_MSG_LOGIN_OK: u8 = 0x20;
pub const AP_MSG_LOGIN_FAILED: u8 = 0x21;
pub const AP_MSG_COMMAND_OK: u8 = 0x30;
pub const AP_MSG_COMMAND_FAILED: u8 = 0x31;
pub const AP_MSG_ENCRYPTION_OK: u8 = 0x40;
pub const AP_MSG_ENCRYPTION_FAILED: u8 = 0x41;
pub const AP_MSG_PING_OK: u8 = 0x50;
pub const AP_MSG_MESSAGE: u8 = 0x60;
pub const AP_MSG_ERROR: u8 = 0x80;

// Commands
pub const CMD_BROADCAST: u8 = 1;
pub const CMD_CLOSE_SERVER: u8 = 2;
pub const CMD_PAY_HOUSES: u8 = 3;
pub const CMD_OPEN_SERVER: u8 = 4;
pub const CMD_SHUTDOWN_SERVER: u8 = 5;
pub const CMD_KICK: u8 = 9;
pub const CMD_SAVE_SERVER: u8 = 13;

pub const ENCRYPTION_RSA1024XTEA: u8 = 1;

/// Flags announced in the hello banner
pub const REQUIRE_LOGIN: u32 = 1;
pub const REQUIRE_ENCRYPTION: u32 = 2;

pub const ADMIN_PROTOCOL_VERSION: u16 = 1;
/// Failed passwords tolerated before the session is dropped
pub const MAX_LOGIN_TRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminState {
    NotConnected,
    EncryptionNotSet,
    NotLoggedIn,
    LoggedIn,
}

#[derive(Debug)]
struct Session {
    state: AdminState,
    login_tries: u32,
    started: Instant,
    last_command: Instant,
}

pub struct ProtocolAdmin {
    core: ProtocolCore,
    backend: Arc<dyn AdminBackend>,
    session: Mutex<Session>,
}

impl ProtocolAdmin {
    pub fn new(connection: &Arc<Connection>, backend: Arc<dyn AdminBackend>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            core: ProtocolCore::new(connection),
            backend,
            session: Mutex::new(Session {
                state: AdminState::NotConnected,
                login_tries: 0,
                started: now,
                last_command: now,
            }),
        })
    }

    pub fn state(&self) -> AdminState {
        self.session.lock().state
    }

    /// Time since the last accepted request
    pub fn idle_for(&self) -> Duration {
        self.session.lock().last_command.elapsed()
    }

    fn reply<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(&mut OutputBuffer) -> Result<(), WireError>,
    {
        let protocol: Arc<dyn Protocol> = self.clone();
        let pool = &self.core.context().pool;
        let Some(message) = pool.get_output_message(&protocol, false) else {
            return;
        };
        let written = f(&mut message.buffer());
        match written {
            Ok(()) => pool.send(message),
            Err(e) => warn!("Admin reply to {} failed: {}", self.core.ip(), e),
        }
    }

    fn reply_text(self: &Arc<Self>, opcode: u8, text: &str) {
        self.reply(|out| {
            out.add_u8(opcode)?;
            out.add_string(text)
        });
    }

    fn fail(self: &Arc<Self>, text: &str) {
        self.reply_text(AP_MSG_ERROR, text);
        self.core.close_connection();
    }

    /// Enforces the state machine before a request is handled.
    /// Returns false when the session was closed.
    fn check_state(self: &Arc<Self>, request: u8) -> bool {
        let config = &self.core.context().config;
        let mut session = self.session.lock();
        let handshake_expired = session.started.elapsed() > config.handshake_timeout();

        match session.state {
            AdminState::EncryptionNotSet if config.admin_require_encryption => {
                if handshake_expired {
                    drop(session);
                    info!("Admin session from {} timed out during encryption setup", self.core.ip());
                    self.core.close_connection();
                    return false;
                }
                if request != AP_MSG_ENCRYPTION && request != AP_MSG_KEY_EXCHANGE {
                    drop(session);
                    self.fail("encryption needed");
                    return false;
                }
            }
            AdminState::EncryptionNotSet => session.state = AdminState::NotLoggedIn,
            AdminState::NotConnected => {
                drop(session);
                self.core.close_connection();
                return false;
            }
            _ => {}
        }

        if session.state == AdminState::NotLoggedIn {
            if config.admin_require_login {
                if handshake_expired {
                    drop(session);
                    info!("Admin session from {} timed out before login", self.core.ip());
                    self.core.close_connection();
                    return false;
                }
                if session.login_tries >= MAX_LOGIN_TRIES {
                    drop(session);
                    self.fail("too many login tries");
                    return false;
                }
                if request != AP_MSG_LOGIN
                    && request != AP_MSG_ENCRYPTION
                    && request != AP_MSG_KEY_EXCHANGE
                {
                    drop(session);
                    self.fail("you are not logged in");
                    return false;
                }
            } else {
                session.state = AdminState::LoggedIn;
            }
        }

        session.last_command = Instant::now();
        true
    }

    fn handle(self: &Arc<Self>, request: u8, msg: &mut InputMessage) -> Result<(), WireError> {
        match request {
            AP_MSG_LOGIN => self.handle_login(msg)?,
            AP_MSG_ENCRYPTION => self.handle_encryption(msg)?,
            AP_MSG_KEY_EXCHANGE => self.handle_key_exchange(msg)?,
            AP_MSG_COMMAND => self.handle_command(msg)?,
            AP_MSG_PING => self.reply(|out| out.add_u8(AP_MSG_PING_OK)),
            AP_MSG_KEEP_ALIVE => {}
            other => {
                debug!("Unknown admin request 0x{:02X} from {}", other, self.core.ip());
                self.fail("not known command byte");
            }
        }
        Ok(())
    }

    fn handle_login(self: &Arc<Self>, msg: &mut InputMessage) -> Result<(), WireError> {
        let config = &self.core.context().config;
        let state = self.state();
        if state != AdminState::NotLoggedIn || !config.admin_require_login {
            self.reply_text(AP_MSG_LOGIN_FAILED, "can not login");
            return Ok(());
        }

        let password = msg.get_string()?;
        if !config.admin_password.is_empty() && password == config.admin_password {
            self.session.lock().state = AdminState::LoggedIn;
            info!("Admin logged in from {}", self.core.ip());
            self.reply(|out| out.add_u8(AP_MSG_LOGIN_OK));
        } else {
            self.session.lock().login_tries += 1;
            warn!("Wrong admin password from {}", self.core.ip());
            self.reply_text(AP_MSG_LOGIN_FAILED, "wrong password");
        }
        Ok(())
    }

    fn handle_encryption(self: &Arc<Self>, msg: &mut InputMessage) -> Result<(), WireError> {
        if self.state() != AdminState::EncryptionNotSet {
            self.reply_text(AP_MSG_ENCRYPTION_FAILED, "can not set encryption");
            return Ok(());
        }

        let kind = msg.get_u8()?;
        if kind != ENCRYPTION_RSA1024XTEA {
            self.reply_text(AP_MSG_ENCRYPTION_FAILED, "not supported encryption type");
            return Ok(());
        }

        if msg.remaining() < RSA_BLOCK_SIZE || msg.rsa_decrypt(&self.core.context().rsa).is_err() {
            self.reply_text(AP_MSG_ENCRYPTION_FAILED, "wrong encrypted packet");
            self.core.close_connection();
            return Ok(());
        }

        let key = msg.get_xtea_key()?;
        self.core.set_xtea_key(key);
        self.core.enable_xtea();
        self.session.lock().state = AdminState::NotLoggedIn;
        self.reply(|out| out.add_u8(AP_MSG_ENCRYPTION_OK));
        Ok(())
    }

    fn handle_key_exchange(self: &Arc<Self>, msg: &mut InputMessage) -> Result<(), WireError> {
        if self.state() != AdminState::EncryptionNotSet {
            self.reply_text(AP_MSG_KEY_EXCHANGE_FAILED, "can not get public key");
            return Ok(());
        }

        let kind = msg.get_u8()?;
        if kind != ENCRYPTION_RSA1024XTEA {
            self.reply_text(AP_MSG_KEY_EXCHANGE_FAILED, "not supported key exchange type");
            return Ok(());
        }

        let modulus = self.core.context().rsa.modulus_bytes();
        self.reply(|out| {
            out.add_u8(AP_MSG_KEY_EXCHANGE_OK)?;
            out.add_u8(ENCRYPTION_RSA1024XTEA)?;
            out.add_bytes(&modulus)
        });
        Ok(())
    }

    fn handle_command(self: &Arc<Self>, msg: &mut InputMessage) -> Result<(), WireError> {
        if self.state() != AdminState::LoggedIn {
            warn!("Admin command from {} without login", self.core.ip());
            return Ok(());
        }

        let command = match msg.get_u8()? {
            CMD_BROADCAST => AdminCommand::Broadcast(msg.get_string()?),
            CMD_CLOSE_SERVER => AdminCommand::CloseServer,
            CMD_PAY_HOUSES => AdminCommand::PayHouses,
            CMD_OPEN_SERVER => AdminCommand::OpenServer,
            CMD_SHUTDOWN_SERVER => AdminCommand::Shutdown,
            CMD_KICK => AdminCommand::Kick(msg.get_string()?),
            CMD_SAVE_SERVER => AdminCommand::Save,
            other => {
                self.reply(|out| {
                    out.add_u8(AP_MSG_COMMAND_FAILED)?;
                    out.add_u8(other)?;
                    out.add_string("not known server command")
                });
                return Ok(());
            }
        };

        info!("Admin command {:?} from {}", command, self.core.ip());
        let protocol = Arc::clone(self);
        let task = Task::new(move || protocol.execute(command));
        if !self.core.context().dispatcher.add_task(task) {
            self.reply_text(AP_MSG_COMMAND_FAILED, "server is shutting down");
        }
        Ok(())
    }

    /// Runs on the dispatcher
    fn execute(self: Arc<Self>, command: AdminCommand) {
        let code = command_code(&command);
        match self.backend.execute(command) {
            Ok(()) => self.reply(|out| {
                out.add_u8(AP_MSG_COMMAND_OK)?;
                out.add_u8(code)
            }),
            Err(reason) => self.reply(|out| {
                out.add_u8(AP_MSG_COMMAND_FAILED)?;
                out.add_u8(code)?;
                out.add_string(&reason)
            }),
        }
    }
}

fn command_code(command: &AdminCommand) -> u8 {
    match command {
        AdminCommand::Broadcast(_) => CMD_BROADCAST,
        AdminCommand::CloseServer => CMD_CLOSE_SERVER,
        AdminCommand::PayHouses => CMD_PAY_HOUSES,
        AdminCommand::OpenServer => CMD_OPEN_SERVER,
        AdminCommand::Shutdown => CMD_SHUTDOWN_SERVER,
        AdminCommand::Kick(_) => CMD_KICK,
        AdminCommand::Save => CMD_SAVE_SERVER,
    }
}

impl Protocol for ProtocolAdmin {
    fn core(&self) -> &ProtocolCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        "admin"
    }

    fn on_recv_first_message(self: Arc<Self>, _msg: InputMessage) {
        let config = &self.core.context().config;
        let ip = self.core.ip();
        if !config.admin_enabled || (config.admin_allow_local_only && !ip.is_loopback()) {
            warn!("Refused admin connection from {}", ip);
            self.core.close_connection();
            return;
        }

        let mut flags = 0;
        if config.admin_require_login {
            flags |= REQUIRE_LOGIN;
        }
        if config.admin_require_encryption {
            flags |= REQUIRE_ENCRYPTION;
        }

        self.session.lock().state = AdminState::EncryptionNotSet;
        self.reply(|out| {
            out.add_u8(AP_MSG_HELLO)?;
            out.add_u32(1)?;
            out.add_string("OTADMIN")?;
            out.add_u16(ADMIN_PROTOCOL_VERSION)?;
            out.add_u32(flags)
        });
        debug!("Admin session opened from {}", ip);
    }

    fn parse_packet(self: Arc<Self>, mut msg: InputMessage) {
        let Ok(request) = msg.get_u8() else {
            return;
        };
        if !self.check_state(request) {
            return;
        }
        if let Err(e) = self.handle(request, &mut msg) {
            debug!("Malformed admin request from {}: {}", self.core.ip(), e);
            self.core.close_connection();
        }
    }
}

pub struct AdminService {
    backend: Arc<dyn AdminBackend>,
}

impl AdminService {
    pub fn new(backend: Arc<dyn AdminBackend>) -> Self {
        Self { backend }
    }
}

impl Service for AdminService {
    fn protocol_identifier(&self) -> u8 {
        PROTOCOL_ADMIN
    }

    fn is_checksummed(&self) -> bool {
        false
    }

    fn server_sends_first(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "admin protocol"
    }

    fn make_protocol(&self, connection: &Arc<Connection>) -> Arc<dyn Protocol> {
        ProtocolAdmin::new(connection, Arc::clone(&self.backend))
    }
}
