use clap::{Parser, Subcommand};
use client::network::{self, ProtocolClient};
use log::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:7171")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in to an account and print its characters
    Login {
        account: String,
        password: String,
        /// Client protocol version to announce
        #[arg(long, default_value = "860")]
        version: u16,
    },
    /// Run one admin command
    Admin {
        /// Admin password, if the server requires one
        #[arg(short, long, default_value = "")]
        password: String,

        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand, Debug)]
enum AdminAction {
    Ping,
    Broadcast { text: String },
    Kick { name: String },
    Close,
    Open,
    PayHouses,
    Save,
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    info!("Connecting to: {}", args.server);
    let mut client = ProtocolClient::connect(&args.server).await?;

    match args.command {
        Command::Login {
            account,
            password,
            version,
        } => {
            let reply = client.login(version, &account, &password).await?;
            if let Some(motd) = &reply.motd {
                println!("{}", motd);
            }
            for character in &reply.characters {
                println!("{:<30} {:<20} {}", character.name, character.world, character.addr);
            }
            println!("Premium days: {}", reply.premium_days);
        }
        Command::Admin { password, action } => {
            let hello = client.admin(&password).await?;
            info!("Admin session with {} v{}", hello.name, hello.version);

            match action {
                AdminAction::Ping => client.admin_ping().await?,
                AdminAction::Broadcast { text } => {
                    client
                        .admin_command(network::CMD_BROADCAST, Some(&text))
                        .await?
                }
                AdminAction::Kick { name } => {
                    client.admin_command(network::CMD_KICK, Some(&name)).await?
                }
                AdminAction::Close => client.admin_command(network::CMD_CLOSE_SERVER, None).await?,
                AdminAction::Open => client.admin_command(network::CMD_OPEN_SERVER, None).await?,
                AdminAction::PayHouses => {
                    client.admin_command(network::CMD_PAY_HOUSES, None).await?
                }
                AdminAction::Save => client.admin_command(network::CMD_SAVE_SERVER, None).await?,
                AdminAction::Shutdown => {
                    client
                        .admin_command(network::CMD_SHUTDOWN_SERVER, None)
                        .await?
                }
            }
            println!("OK");
        }
    }

    Ok(())
}
