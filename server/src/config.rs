//! Command line options and the game catalog file

use crate::command_center::CenterOptions;
use crate::error::ConfigError;
use clap::Parser;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use shared::{GameDescriptor, DEFAULT_PORT};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// VR kiosk command center
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct ServerArgs {
    /// Address to bind to
    #[arg(short = 'H', long, env = "VR_SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "VR_SERVER_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Game catalog file, created with defaults when missing
    #[arg(short, long, env = "VR_GAMES_CONFIG", default_value = "config/games.json")]
    pub config: PathBuf,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Resource sampling period in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub poll_interval_ms: u64,

    /// Unsolicited status broadcast period in seconds (0 disables)
    #[arg(long, default_value_t = 5)]
    pub status_interval_secs: u64,

    /// Close connections silent for this many seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    pub idle_timeout_secs: u64,

    /// Maximum concurrent client connections
    #[arg(long, default_value_t = 32)]
    pub max_connections: usize,

    /// Time a game gets to exit before it is killed, in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub termination_grace_ms: u64,
}

/// Runtime settings, independent of how they were supplied.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub catalog_path: PathBuf,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
    pub max_connections: usize,
    pub idle_timeout: Option<Duration>,
    pub center: CenterOptions,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));

        Self {
            bind_address: format!("{}:{}", args.host, args.port),
            catalog_path: args.config,
            log_file: args.log_file,
            verbose: args.verbose,
            max_connections: args.max_connections.max(1),
            idle_timeout: secs(args.idle_timeout_secs),
            center: CenterOptions {
                status_interval: secs(args.status_interval_secs),
                poll_interval: Duration::from_millis(args.poll_interval_ms.max(100)),
                termination_grace: Duration::from_millis(args.termination_grace_ms),
                ..CenterOptions::default()
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    games: Vec<GameDescriptor>,
}

/// Reads and validates the catalog at `path`, writing the default catalog
/// there first if the file does not exist.
pub fn load_catalog(path: &Path) -> Result<Vec<GameDescriptor>, ConfigError> {
    if !path.exists() {
        warn!(
            "Catalog {} not found, writing default catalog",
            path.display()
        );
        write_catalog(path, &default_catalog())?;
    }

    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let catalog: CatalogFile = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    validate(&catalog.games)?;
    info!("Loaded {} games from {}", catalog.games.len(), path.display());
    Ok(catalog.games)
}

pub fn write_catalog(path: &Path, games: &[GameDescriptor]) -> Result<(), ConfigError> {
    let io_error = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    let catalog = CatalogFile {
        games: games.to_vec(),
    };
    let text = serde_json::to_string_pretty(&catalog).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, text).map_err(io_error)
}

fn validate(games: &[GameDescriptor]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();

    for game in games {
        if game.id.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "game \"{}\" has an empty id",
                game.title
            )));
        }
        if !seen.insert(game.id.as_str()) {
            return Err(ConfigError::Invalid(format!("duplicate game id {}", game.id)));
        }
        if game.executable_path.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "game {} has no executable_path",
                game.id
            )));
        }
        if game.min_duration_seconds > game.max_duration_seconds {
            return Err(ConfigError::Invalid(format!(
                "game {}: min_duration_seconds {} exceeds max_duration_seconds {}",
                game.id, game.min_duration_seconds, game.max_duration_seconds
            )));
        }
    }

    Ok(())
}

const STEAM_LIBRARY: &str = "C:\\Program Files (x86)\\Steam\\steamapps\\common";

pub fn default_catalog() -> Vec<GameDescriptor> {
    let alyx_dir = format!("{}\\Half-Life Alyx", STEAM_LIBRARY);
    let vrchat_dir = format!("{}\\VRChat", STEAM_LIBRARY);

    vec![
        GameDescriptor {
            id: "1".into(),
            title: "Beat Saber".into(),
            executable_path: "C:\\VRGames\\BeatSaber\\Beat Saber.exe".into(),
            working_directory: "C:\\VRGames\\BeatSaber".into(),
            arguments: "--vrmode openvr".into(),
            description: "Rhythm game where you slash blocks with lightsabers".into(),
            image_url: "/games/beatsaber.jpg".into(),
            min_duration_seconds: 300,
            max_duration_seconds: 1800,
        },
        GameDescriptor {
            id: "2".into(),
            title: "Half-Life: Alyx".into(),
            executable_path: format!("{}\\bin\\win64\\hlvr.exe", alyx_dir),
            working_directory: alyx_dir,
            arguments: "-novid -console".into(),
            description: "Return to Half-Life in this VR masterpiece by Valve".into(),
            image_url: "/games/alyx.jpg".into(),
            min_duration_seconds: 600,
            max_duration_seconds: 3600,
        },
        GameDescriptor {
            id: "3".into(),
            title: "VRChat".into(),
            executable_path: format!("{}\\VRChat.exe", vrchat_dir),
            working_directory: vrchat_dir,
            arguments: String::new(),
            description: "Social VR platform to meet and interact with friends".into(),
            image_url: "/games/vrchat.jpg".into(),
            min_duration_seconds: 300,
            max_duration_seconds: 7200,
        },
    ]
}
