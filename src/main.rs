use clap::{Parser, Subcommand};

use cua_bridge::client::{self, ChatArgs};
use cua_bridge::config::ServerConfig;
use cua_bridge::logging::{DEFAULT_FILTER, init_tracing};
use cua_bridge::server;

#[derive(Parser)]
#[command(name = "cua-bridge", version, about = "Streams a computer-use agent over server-sent events")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server
    Serve(ServerConfig),
    /// Send one prompt to a running server and print the event stream
    Chat(ChatArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(DEFAULT_FILTER, cli.log_json);

    match cli.command {
        Command::Serve(config) => server::run(config).await?,
        Command::Chat(args) => {
            client::stream_chat(&args, |frame| async move {
                println!("{}", client::describe(&frame));
            })
            .await?
        }
    }

    Ok(())
}
