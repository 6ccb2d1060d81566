//! Client side of the framed protocol over any async byte stream.

use crate::error::{ClientError, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use shared::frame::{self, FrameOptions};
use shared::rsa::{RsaKey, DEFAULT_MODULUS};
use shared::{
    FrameCodec, FrameError, InputMessage, OutputBuffer, XteaKey, PROTOCOL_ADMIN, PROTOCOL_GAME,
    PROTOCOL_LOGIN, RSA_BLOCK_SIZE,
};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tokio_util::codec::Framed;

pub const DEFAULT_OS: u16 = 2;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

// Login replies
const OP_LOGIN_ERROR: u8 = 0x0A;
const OP_MOTD: u8 = 0x14;
const OP_CHARACTER_LIST: u8 = 0x64;

// Admin requests and replies
pub const AP_MSG_LOGIN: u8 = 1;
pub const AP_MSG_ENCRYPTION: u8 = 2;
pub const AP_MSG_KEY_EXCHANGE: u8 = 3;
pub const AP_MSG_COMMAND: u8 = 4;
pub const AP_MSG_PING: u8 = 5;
pub const AP_MSG_KEEP_ALIVE: u8 = 6;

const AP_MSG_HELLO: u8 = 1;
const AP_MSG_KEY_EXCHANGE_OK: u8 = 0x10;
const AP_MSG_KEY_EXCHANGE_FAILED: u8 = 0x11;
const AP_MSG_LOGIN_OK: u8 = 0x20;
const AP_MSG_LOGIN_FAILED: u8 = 0x21;
const AP_MSG_COMMAND_OK: u8 = 0x30;
const AP_MSG_COMMAND_FAILED: u8 = 0x31;
const AP_MSG_ENCRYPTION_OK: u8 = 0x40;
const AP_MSG_ENCRYPTION_FAILED: u8 = 0x41;
const AP_MSG_PING_OK: u8 = 0x50;
const AP_MSG_ERROR: u8 = 0x80;

pub const CMD_BROADCAST: u8 = 1;
pub const CMD_CLOSE_SERVER: u8 = 2;
pub const CMD_PAY_HOUSES: u8 = 3;
pub const CMD_OPEN_SERVER: u8 = 4;
pub const CMD_SHUTDOWN_SERVER: u8 = 5;
pub const CMD_KICK: u8 = 9;
pub const CMD_SAVE_SERVER: u8 = 13;

const ENCRYPTION_RSA1024XTEA: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterInfo {
    pub name: String,
    pub world: String,
    pub addr: SocketAddrV4,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginReply {
    pub motd: Option<String>,
    pub characters: Vec<CharacterInfo>,
    pub premium_days: u16,
}

/// Banner the admin protocol greets with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminHello {
    pub name: String,
    pub version: u16,
    pub flags: u32,
}

impl AdminHello {
    pub fn requires_login(&self) -> bool {
        self.flags & 1 != 0
    }

    pub fn requires_encryption(&self) -> bool {
        self.flags & 2 != 0
    }
}

pub struct ProtocolClient<S> {
    framed: Framed<S, FrameCodec>,
    options: FrameOptions,
    rsa: RsaKey,
    reply_timeout: Duration,
}

impl ProtocolClient<TcpStream> {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!("Connected to {}", stream.peer_addr()?);
        Self::new(stream)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ProtocolClient<S> {
    pub fn new(stream: S) -> Result<Self> {
        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new()),
            options: FrameOptions::default(),
            rsa: RsaKey::public_from_decimal(DEFAULT_MODULUS)?,
            reply_timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// Uses a server key other than the stock one
    pub fn with_rsa_key(mut self, rsa: RsaKey) -> Self {
        self.rsa = rsa;
        self
    }

    pub fn options(&self) -> FrameOptions {
        self.options
    }

    pub fn set_checksum(&mut self, checksum: bool) {
        self.options.checksum = checksum;
    }

    pub fn set_xtea_key(&mut self, key: Option<XteaKey>) {
        self.options.xtea_key = key;
    }

    /// Seals `payload` with the current options and writes it
    pub async fn send(&mut self, mut payload: OutputBuffer) -> Result<()> {
        frame::seal(&mut payload, &self.options)?;
        self.send_raw(payload.body()).await
    }

    /// Writes bytes as they are, length prefix included
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.framed.send(Bytes::copy_from_slice(bytes)).await?;
        Ok(())
    }

    /// Reads one frame and opens it with the current options
    pub async fn recv(&mut self) -> Result<InputMessage> {
        match timeout(self.reply_timeout, self.read_frame()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(self.reply_timeout)),
        }
    }

    async fn read_frame(&mut self) -> Result<InputMessage> {
        let body = match self.framed.next().await {
            Some(Ok(body)) => body,
            Some(Err(FrameError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ClientError::Closed)
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ClientError::Closed),
        };

        let mut msg = InputMessage::new(body);
        if self.options.checksum && !msg.strip_checksum() {
            return Err(ClientError::Checksum);
        }
        if let Some(key) = &self.options.xtea_key {
            msg.xtea_decrypt(key)?;
        }
        Ok(msg)
    }

    /// Waits for the server to close the connection, discarding frames
    pub async fn wait_closed(&mut self) -> Result<()> {
        loop {
            match self.recv().await {
                Ok(_) => continue,
                Err(ClientError::Closed) => return Ok(()),
                Err(ClientError::Io(e))
                    if e.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    return Ok(())
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fills a handshake block: zero marker, session key, `fill`, random padding
    fn rsa_block<F>(&self, key: &XteaKey, fill: F) -> Result<[u8; RSA_BLOCK_SIZE]>
    where
        F: FnOnce(&mut OutputBuffer) -> shared::error::Result<()>,
    {
        let mut plain = OutputBuffer::new();
        plain.add_u8(0)?;
        for word in key {
            plain.add_u32(*word)?;
        }
        fill(&mut plain)?;
        if plain.len() > RSA_BLOCK_SIZE {
            return Err(shared::WireError::RsaBlockSize {
                expected: RSA_BLOCK_SIZE,
                got: plain.len(),
            }
            .into());
        }

        let mut block = [0u8; RSA_BLOCK_SIZE];
        block[..plain.len()].copy_from_slice(plain.body());
        rand::thread_rng().fill(&mut block[plain.len()..]);
        self.rsa.encrypt(&mut block)?;
        Ok(block)
    }

    /// Account login; returns the character list or the server's refusal
    pub async fn login(&mut self, version: u16, account: &str, password: &str) -> Result<LoginReply> {
        let key: XteaKey = rand::random();
        let block = self.rsa_block(&key, |out| {
            out.add_string(account)?;
            out.add_string(password)
        })?;

        let mut out = OutputBuffer::new();
        out.add_u8(PROTOCOL_LOGIN)?;
        out.add_u16(DEFAULT_OS)?;
        out.add_u16(version)?;
        out.add_bytes(&[0; 12])?;
        out.add_bytes(&block)?;

        self.set_checksum(true);
        self.send(out).await?;
        self.set_xtea_key(Some(key));

        let mut msg = self.recv().await?;
        parse_login_reply(&mut msg)
    }

    /// Sends the game login; the world's first reply follows on [`Self::recv`]
    pub async fn enter_game(
        &mut self,
        version: u16,
        account: &str,
        character: &str,
        password: &str,
    ) -> Result<()> {
        let key: XteaKey = rand::random();
        let block = self.rsa_block(&key, |out| {
            out.add_u8(0)?;
            out.add_string(account)?;
            out.add_string(character)?;
            out.add_string(password)
        })?;

        let mut out = OutputBuffer::new();
        out.add_u8(PROTOCOL_GAME)?;
        out.add_u16(DEFAULT_OS)?;
        out.add_u16(version)?;
        out.add_bytes(&block)?;

        self.set_checksum(true);
        self.send(out).await?;
        self.set_xtea_key(Some(key));
        Ok(())
    }

    /// Opens an admin session and reads the banner
    pub async fn admin_hello(&mut self) -> Result<AdminHello> {
        let mut out = OutputBuffer::new();
        out.add_u8(PROTOCOL_ADMIN)?;
        self.send(out).await?;

        let mut msg = self.recv().await?;
        match msg.get_u8()? {
            AP_MSG_HELLO => {
                msg.get_u32()?;
                let hello = AdminHello {
                    name: msg.get_string()?,
                    version: msg.get_u16()?,
                    flags: msg.get_u32()?,
                };
                debug!("Admin banner {:?}", hello);
                Ok(hello)
            }
            other => Err(admin_failure(other, &mut msg)),
        }
    }

    /// Asks for the server's public modulus
    pub async fn admin_key_exchange(&mut self) -> Result<Vec<u8>> {
        let mut out = OutputBuffer::new();
        out.add_u8(AP_MSG_KEY_EXCHANGE)?;
        out.add_u8(ENCRYPTION_RSA1024XTEA)?;
        self.send(out).await?;

        let mut msg = self.recv().await?;
        match msg.get_u8()? {
            AP_MSG_KEY_EXCHANGE_OK => {
                msg.get_u8()?;
                Ok(msg.get_bytes(RSA_BLOCK_SIZE)?)
            }
            other => Err(admin_failure(other, &mut msg)),
        }
    }

    /// Switches the admin session to XTEA with a fresh key
    pub async fn admin_encrypt(&mut self) -> Result<()> {
        let key: XteaKey = rand::random();
        let block = self.rsa_block(&key, |_| Ok(()))?;

        let mut out = OutputBuffer::new();
        out.add_u8(AP_MSG_ENCRYPTION)?;
        out.add_u8(ENCRYPTION_RSA1024XTEA)?;
        out.add_bytes(&block)?;
        self.send(out).await?;
        self.set_xtea_key(Some(key));

        let mut msg = self.recv().await?;
        match msg.get_u8()? {
            AP_MSG_ENCRYPTION_OK => Ok(()),
            other => {
                self.set_xtea_key(None);
                Err(admin_failure(other, &mut msg))
            }
        }
    }

    pub async fn admin_login(&mut self, password: &str) -> Result<()> {
        let mut out = OutputBuffer::new();
        out.add_u8(AP_MSG_LOGIN)?;
        out.add_string(password)?;
        self.send(out).await?;

        let mut msg = self.recv().await?;
        match msg.get_u8()? {
            AP_MSG_LOGIN_OK => Ok(()),
            other => Err(admin_failure(other, &mut msg)),
        }
    }

    pub async fn admin_ping(&mut self) -> Result<()> {
        let mut out = OutputBuffer::new();
        out.add_u8(AP_MSG_PING)?;
        self.send(out).await?;

        let mut msg = self.recv().await?;
        match msg.get_u8()? {
            AP_MSG_PING_OK => Ok(()),
            other => Err(admin_failure(other, &mut msg)),
        }
    }

    /// Runs a server command; `argument` is sent for broadcast and kick
    pub async fn admin_command(&mut self, command: u8, argument: Option<&str>) -> Result<()> {
        let mut out = OutputBuffer::new();
        out.add_u8(AP_MSG_COMMAND)?;
        out.add_u8(command)?;
        if let Some(argument) = argument {
            out.add_string(argument)?;
        }
        self.send(out).await?;

        let mut msg = self.recv().await?;
        match msg.get_u8()? {
            AP_MSG_COMMAND_OK => {
                let code = msg.get_u8()?;
                if code != command {
                    warn!("Command 0x{:02X} acknowledged as 0x{:02X}", command, code);
                }
                Ok(())
            }
            other => Err(admin_failure(other, &mut msg)),
        }
    }

    /// Full admin handshake as the banner demands it
    pub async fn admin(&mut self, password: &str) -> Result<AdminHello> {
        let hello = self.admin_hello().await?;
        if hello.requires_encryption() {
            self.admin_encrypt().await?;
        }
        if hello.requires_login() {
            self.admin_login(password).await?;
        }
        Ok(hello)
    }

    pub fn into_inner(self) -> S {
        self.framed.into_inner()
    }
}

fn parse_login_reply(msg: &mut InputMessage) -> Result<LoginReply> {
    let mut reply = LoginReply::default();
    while msg.remaining() > 0 {
        match msg.get_u8()? {
            OP_LOGIN_ERROR => return Err(ClientError::Refused(msg.get_string()?)),
            OP_MOTD => reply.motd = Some(msg.get_string()?),
            OP_CHARACTER_LIST => {
                let count = msg.get_u8()?;
                for _ in 0..count {
                    let name = msg.get_string()?;
                    let world = msg.get_string()?;
                    let ip = Ipv4Addr::from(msg.get_u32()?.to_le_bytes());
                    let port = msg.get_u16()?;
                    reply.characters.push(CharacterInfo {
                        name,
                        world,
                        addr: SocketAddrV4::new(ip, port),
                    });
                }
                reply.premium_days = msg.get_u16()?;
            }
            other => return Err(ClientError::Unexpected(other)),
        }
    }
    Ok(reply)
}

/// Maps an admin failure reply to an error, reading its reason text
fn admin_failure(opcode: u8, msg: &mut InputMessage) -> ClientError {
    let reason = match opcode {
        AP_MSG_COMMAND_FAILED => {
            let _ = msg.get_u8();
            msg.get_string()
        }
        AP_MSG_LOGIN_FAILED
        | AP_MSG_ENCRYPTION_FAILED
        | AP_MSG_KEY_EXCHANGE_FAILED
        | AP_MSG_ERROR => msg.get_string(),
        other => return ClientError::Unexpected(other),
    };
    match reason {
        Ok(reason) => ClientError::Refused(reason),
        Err(e) => ClientError::Wire(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut bytes = (payload.len() as u16).to_le_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    fn string(text: &str) -> Vec<u8> {
        let mut bytes = (text.len() as u16).to_le_bytes().to_vec();
        bytes.extend_from_slice(text.as_bytes());
        bytes
    }

    #[tokio::test]
    async fn test_admin_hello() {
        let mut banner = vec![AP_MSG_HELLO, 1, 0, 0, 0];
        banner.extend(string("OTADMIN"));
        banner.extend([1, 0, 3, 0, 0, 0]);

        let stream = Builder::new()
            .write(&frame(&[PROTOCOL_ADMIN]))
            .read(&frame(&banner))
            .build();
        let mut client = ProtocolClient::new(stream).unwrap();

        let hello = client.admin_hello().await.unwrap();
        assert_eq!(hello.name, "OTADMIN");
        assert_eq!(hello.version, 1);
        assert!(hello.requires_login());
        assert!(hello.requires_encryption());
    }

    #[tokio::test]
    async fn test_admin_login_refused() {
        let mut request = vec![AP_MSG_LOGIN];
        request.extend(string("pw"));
        let mut reply = vec![AP_MSG_LOGIN_FAILED];
        reply.extend(string("wrong password"));

        let stream = Builder::new()
            .write(&frame(&request))
            .read(&frame(&reply))
            .build();
        let mut client = ProtocolClient::new(stream).unwrap();

        match client.admin_login("pw").await {
            Err(ClientError::Refused(reason)) => assert_eq!(reason, "wrong password"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_checksummed_frame() {
        let payload = [AP_MSG_PING_OK];
        let mut body = shared::adler32(&payload).to_le_bytes().to_vec();
        body.extend_from_slice(&payload);

        let stream = Builder::new().read(&frame(&body)).build();
        let mut client = ProtocolClient::new(stream).unwrap();
        client.set_checksum(true);

        let mut msg = client.recv().await.unwrap();
        assert_eq!(msg.get_u8().unwrap(), AP_MSG_PING_OK);
    }

    #[tokio::test]
    async fn test_forged_checksum_rejected() {
        let stream = Builder::new()
            .read(&frame(&[1, 2, 3, 4, AP_MSG_PING_OK]))
            .build();
        let mut client = ProtocolClient::new(stream).unwrap();
        client.set_checksum(true);

        assert!(matches!(client.recv().await, Err(ClientError::Checksum)));
    }

    #[tokio::test]
    async fn test_closed_stream() {
        let stream = Builder::new().build();
        let mut client = ProtocolClient::new(stream).unwrap();

        assert!(matches!(client.recv().await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let stream = Builder::new()
            .read(&[1, 0])
            .read(&[AP_MSG_PING_OK])
            .build();
        let mut client = ProtocolClient::new(stream).unwrap();

        let mut msg = client.recv().await.unwrap();
        assert_eq!(msg.get_u8().unwrap(), AP_MSG_PING_OK);
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let stream = Builder::new().read(&[0, 0]).build();
        let mut client = ProtocolClient::new(stream).unwrap();

        assert!(matches!(
            client.recv().await,
            Err(ClientError::Wire(shared::WireError::InvalidLength(0)))
        ));
    }

    #[test]
    fn test_login_reply_parsing() {
        let mut body = vec![OP_MOTD];
        body.extend(string("1\nHello"));
        body.push(OP_CHARACTER_LIST);
        body.push(1);
        body.extend(string("Knight"));
        body.extend(string("Antica"));
        body.extend([127, 0, 0, 1, 0x1C, 0x1C]);
        body.extend([5, 0]);

        let reply = parse_login_reply(&mut InputMessage::from_slice(&body)).unwrap();
        assert_eq!(reply.motd.as_deref(), Some("1\nHello"));
        assert_eq!(reply.characters.len(), 1);
        assert_eq!(
            reply.characters[0].addr,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7196)
        );
        assert_eq!(reply.premium_days, 5);
    }

    #[test]
    fn test_login_error_reply() {
        let mut body = vec![OP_LOGIN_ERROR];
        body.extend(string("Account name or password is not correct."));

        match parse_login_reply(&mut InputMessage::from_slice(&body)) {
            Err(ClientError::Refused(reason)) => assert!(reason.starts_with("Account")),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
