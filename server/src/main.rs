use clap::Parser;
use log::{info, warn};
use server::protocol::admin::AdminService;
use server::protocol::game::{GameService, ProtocolGame};
use server::protocol::login::LoginService;
use server::world::{
    AdminBackend, AdminCommand, CharacterEntry, CharacterList, CreatureId, GameBackend, GameLogin,
    LoginBackend, LoginRequest, TileThing, WorldView,
};
use server::{Server, ServerConfig};
use shared::{InputMessage, OutputBuffer, Position, WireError};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// IP address to bind to
    #[arg(short = 'H', long)]
    host: Option<IpAddr>,

    /// Port for the login protocol
    #[arg(long)]
    login_port: Option<u16>,

    /// Port for the game protocol
    #[arg(long)]
    game_port: Option<u16>,

    /// Port for the admin protocol
    #[arg(long)]
    admin_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.ip = host;
    }
    if let Some(port) = args.login_port {
        config.login_port = port;
    }
    if let Some(port) = args.game_port {
        config.game_port = port;
    }
    if let Some(port) = args.admin_port {
        config.admin_port = port;
    }

    let world_ip = match config.ip {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => Ipv4Addr::LOCALHOST,
    };
    let (login_port, game_port, admin_port) =
        (config.login_port, config.game_port, config.admin_port);
    let admin_enabled = config.admin_enabled;

    let server = Server::new(config)?;
    let shutdown = server.shutdown_token();

    server.add_service(
        login_port,
        LoginService::new(Arc::new(OfflineLogin {
            ip: world_ip,
            port: game_port,
        })),
    )?;
    server.add_service(game_port, GameService::new(Arc::new(OfflineWorld)))?;
    if admin_enabled {
        server.add_service(admin_port, AdminService::new(Arc::new(OfflineAdmin { shutdown })))?;
    }

    info!("Starting server without a game world attached");
    server.run().await?;

    Ok(())
}

/// Lists one character named after the account on this server's game port
struct OfflineLogin {
    ip: Ipv4Addr,
    port: u16,
}

impl LoginBackend for OfflineLogin {
    fn authenticate(&self, request: &LoginRequest) -> Result<CharacterList, String> {
        if request.password.is_empty() {
            return Err("Please enter a password.".to_string());
        }
        Ok(CharacterList {
            characters: vec![CharacterEntry {
                name: request.account.clone(),
                world: "Offline".to_string(),
                ip: self.ip,
                port: self.port,
            }],
            premium_days: 0,
        })
    }

    fn motd(&self) -> Option<(u32, String)> {
        Some((1, "No game world is loaded on this server.".to_string()))
    }
}

/// Refuses every game login since no map is loaded
struct OfflineWorld;

impl WorldView for OfflineWorld {
    fn tile_things(&self, _viewer: CreatureId, _pos: &Position) -> Option<Vec<TileThing>> {
        None
    }

    fn creature_position(&self, _creature: CreatureId) -> Option<Position> {
        None
    }

    fn can_see_creature(&self, _viewer: CreatureId, _creature: CreatureId) -> bool {
        false
    }

    fn write_creature(
        &self,
        _viewer: CreatureId,
        _creature: CreatureId,
        _known: bool,
        _out: &mut OutputBuffer,
    ) -> Result<(), WireError> {
        Ok(())
    }
}

impl GameBackend for OfflineWorld {
    fn login(&self, _client: Arc<ProtocolGame>, request: GameLogin) -> Result<CreatureId, String> {
        info!("Refusing game login for {} from {}", request.character, request.ip);
        Err("The game world is offline.".to_string())
    }

    fn logout(&self, _player: CreatureId) {}

    fn handle_packet(
        &self,
        _client: &Arc<ProtocolGame>,
        _player: CreatureId,
        _opcode: u8,
        _msg: InputMessage,
    ) {
    }

    fn client_detached(&self, _player: CreatureId) {}
}

struct OfflineAdmin {
    shutdown: CancellationToken,
}

impl AdminBackend for OfflineAdmin {
    fn execute(&self, command: AdminCommand) -> Result<(), String> {
        match command {
            AdminCommand::Broadcast(text) => {
                info!("Broadcast: {}", text);
                Ok(())
            }
            AdminCommand::Shutdown => {
                warn!("Shutdown requested through the admin protocol");
                self.shutdown.cancel();
                Ok(())
            }
            other => Err(format!("{:?} needs a game world", other)),
        }
    }
}
