//! Account login: validates credentials and answers with the character list.

use crate::connection::Connection;
use crate::protocol::{self, Protocol, ProtocolCore};
use crate::service::Service;
use crate::tasks::Task;
use crate::world::{CharacterList, LoginBackend, LoginRequest};
use log::{debug, info, warn};
use shared::{InputMessage, OutputBuffer, WireError, PROTOCOL_LOGIN};
use std::sync::Arc;

pub const OP_ERROR: u8 = 0x0A;
pub const OP_MOTD: u8 = 0x14;
pub const OP_CHARACTER_LIST: u8 = 0x64;

pub struct ProtocolLogin {
    core: ProtocolCore,
    backend: Arc<dyn LoginBackend>,
}

impl ProtocolLogin {
    pub fn new(connection: &Arc<Connection>, backend: Arc<dyn LoginBackend>) -> Arc<Self> {
        Arc::new(Self {
            core: ProtocolCore::new(connection),
            backend,
        })
    }

    fn parse_login(self: &Arc<Self>, msg: &mut InputMessage) -> Result<LoginRequest, WireError> {
        let os = msg.get_u16()?;
        let version = msg.get_u16()?;
        // dat, spr and pic signatures
        msg.skip(12)?;

        msg.rsa_decrypt(&self.core.context().rsa)?;
        let key = msg.get_xtea_key()?;
        self.core.set_xtea_key(key);
        self.core.enable_xtea();

        let account = msg.get_string()?;
        let password = msg.get_string()?;
        Ok(LoginRequest {
            ip: self.core.ip(),
            os,
            version,
            account,
            password,
        })
    }

    fn disconnect(self: &Arc<Self>, reason: &str) {
        let protocol: Arc<dyn Protocol> = self.clone();
        protocol::disconnect_client(&protocol, OP_ERROR, reason);
    }

    /// Runs on the dispatcher
    fn authenticate(self: Arc<Self>, request: LoginRequest) {
        let context = self.core.context();
        match self.backend.authenticate(&request) {
            Ok(characters) => {
                context
                    .connections
                    .add_attempt(request.ip, PROTOCOL_LOGIN, true);
                info!(
                    "Account {} logged in from {} ({} character(s))",
                    request.account,
                    request.ip,
                    characters.characters.len()
                );
                self.send_character_list(&characters);
            }
            Err(reason) => {
                context
                    .connections
                    .add_attempt(request.ip, PROTOCOL_LOGIN, false);
                debug!("Login for {} from {} refused: {}", request.account, request.ip, reason);
                self.disconnect(&reason);
            }
        }
    }

    fn send_character_list(self: &Arc<Self>, characters: &CharacterList) {
        let protocol: Arc<dyn Protocol> = self.clone();
        let pool = &self.core.context().pool;
        if let Some(message) = pool.get_output_message(&protocol, false) {
            let motd = self.backend.motd();
            let written = write_character_list(&mut message.buffer(), motd, characters);
            match written {
                Ok(()) => pool.send(message),
                Err(e) => warn!("Character list for {} does not fit: {}", self.core.ip(), e),
            }
        }
        self.core.close_connection();
    }
}

fn write_character_list(
    out: &mut OutputBuffer,
    motd: Option<(u32, String)>,
    list: &CharacterList,
) -> Result<(), WireError> {
    if let Some((id, text)) = motd {
        out.add_u8(OP_MOTD)?;
        out.add_string(&format!("{}\n{}", id, text))?;
    }

    out.add_u8(OP_CHARACTER_LIST)?;
    let count = list.characters.len().min(u8::MAX as usize);
    out.add_u8(count as u8)?;
    for character in list.characters.iter().take(count) {
        out.add_string(&character.name)?;
        out.add_string(&character.world)?;
        out.add_u32(u32::from_le_bytes(character.ip.octets()))?;
        out.add_u16(character.port)?;
    }
    out.add_u16(list.premium_days)
}

impl Protocol for ProtocolLogin {
    fn core(&self) -> &ProtocolCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        "login"
    }

    fn on_recv_first_message(self: Arc<Self>, mut msg: InputMessage) {
        let request = match self.parse_login(&mut msg) {
            Ok(request) => request,
            Err(e) => {
                debug!("Malformed login from {}: {}", self.core.ip(), e);
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
        if context.connections.is_disabled(request.ip, PROTOCOL_LOGIN) {
            self.disconnect("Too many connections attempts from this IP. Try again later.");
            return;
        }
        if request.account.is_empty() {
            self.disconnect("Invalid account name.");
            return;
        }

        let protocol = Arc::clone(&self);
        if !context
            .dispatcher
            .add_task(Task::new(move || protocol.authenticate(request)))
        {
            self.core.close_connection();
        }
    }

    fn parse_packet(self: Arc<Self>, _msg: InputMessage) {
        // The login exchange is a single request.
        self.core.close_connection();
    }
}

pub struct LoginService {
    backend: Arc<dyn LoginBackend>,
}

impl LoginService {
    pub fn new(backend: Arc<dyn LoginBackend>) -> Self {
        Self { backend }
    }
}

impl Service for LoginService {
    fn protocol_identifier(&self) -> u8 {
        PROTOCOL_LOGIN
    }

    fn is_checksummed(&self) -> bool {
        true
    }

    fn server_sends_first(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "login protocol"
    }

    fn make_protocol(&self, connection: &Arc<Connection>) -> Arc<dyn Protocol> {
        ProtocolLogin::new(connection, Arc::clone(&self.backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::CharacterEntry;
    use shared::InputMessage;
    use std::net::Ipv4Addr;

    #[test]
    fn test_character_list_layout() {
        let list = CharacterList {
            characters: vec![CharacterEntry {
                name: "Knight".to_string(),
                world: "Antica".to_string(),
                ip: Ipv4Addr::new(127, 0, 0, 1),
                port: 7172,
            }],
            premium_days: 3,
        };

        let mut out = OutputBuffer::new();
        write_character_list(&mut out, Some((1, "Welcome".to_string())), &list).unwrap();

        let mut msg = InputMessage::from_slice(out.body());
        assert_eq!(msg.get_u8().unwrap(), OP_MOTD);
        assert_eq!(msg.get_string().unwrap(), "1\nWelcome");
        assert_eq!(msg.get_u8().unwrap(), OP_CHARACTER_LIST);
        assert_eq!(msg.get_u8().unwrap(), 1);
        assert_eq!(msg.get_string().unwrap(), "Knight");
        assert_eq!(msg.get_string().unwrap(), "Antica");
        assert_eq!(msg.get_u32().unwrap().to_le_bytes(), [127, 0, 0, 1]);
        assert_eq!(msg.get_u16().unwrap(), 7172);
        assert_eq!(msg.get_u16().unwrap(), 3);
        assert_eq!(msg.remaining(), 0);
    }
}
