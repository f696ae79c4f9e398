use clap::{Parser, Subcommand};
use client::network::ControlClient;
use log::info;
use shared::{CommandName, Params, Response, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct ClientArgs {
    /// Command center address
    #[arg(
        short = 's',
        long,
        env = "VR_SERVER_URL",
        default_value_t = format!("ws://127.0.0.1:{}", DEFAULT_PORT)
    )]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the aggregate status
    Status,
    /// List the game catalog
    Games,
    /// Launch a game for a session of the given length
    Launch { game_id: String, seconds: u32 },
    /// End the running session
    End,
    /// Pause the session countdown
    Pause,
    /// Resume a paused countdown
    Resume,
    Heartbeat,
    /// Rate a game from 1 to 5 stars
    Rate { game_id: String, rating: u8 },
    /// Print status broadcasts until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = ClientArgs::parse();
    let mut client = ControlClient::connect(&args.server).await?;

    let (command, params) = match args.command {
        Command::Watch => return watch(client).await,
        Command::Status => (CommandName::GetStatus, Params::new()),
        Command::Games => (CommandName::GetGames, Params::new()),
        Command::Launch { game_id, seconds } => {
            let mut params = Params::new();
            params.insert("gameId", game_id);
            params.insert("sessionDuration", seconds);
            (CommandName::LaunchGame, params)
        }
        Command::End => (CommandName::EndSession, Params::new()),
        Command::Pause => (CommandName::PauseSession, Params::new()),
        Command::Resume => (CommandName::ResumeSession, Params::new()),
        Command::Heartbeat => (CommandName::Heartbeat, Params::new()),
        Command::Rate { game_id, rating } => {
            let mut params = Params::new();
            params.insert("gameId", game_id);
            params.insert("rating", rating);
            (CommandName::SubmitRating, params)
        }
    };

    let response = client.request(command.as_str(), params).await?;
    client.close().await?;

    match response.error {
        Some(message) => Err(message.into()),
        None => {
            let data = response.data.unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&data)?);
            Ok(())
        }
    }
}

async fn watch(mut client: ControlClient) -> Result<(), Box<dyn std::error::Error>> {
    info!("Watching status broadcasts, Ctrl+C to stop");

    loop {
        let message = tokio::select! {
            message = client.next_message() => message?,
            _ = tokio::signal::ctrl_c() => break,
        };

        match message {
            Some(response) => print_update(&response),
            None => {
                info!("Server closed the connection");
                return Ok(());
            }
        }
    }

    client.close().await?;
    Ok(())
}

fn print_update(response: &Response) {
    match response.aggregate_status() {
        Some(status) => println!(
            "game={} running={} paused={} remaining={}s cpu={:.1}% mem={:.1}% disk={:.0}MB",
            status.active_game.as_deref().unwrap_or("-"),
            status.game_running,
            status.is_paused,
            status.time_remaining,
            status.cpu_usage,
            status.memory_usage,
            status.disk_space,
        ),
        None => println!("{}", serde_json::to_string(response).unwrap_or_default()),
    }
}
