//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::game::chunk::ChunkDimensions;
use crate::game::lattice::WorldSize;
use crate::game::world::WorldSettings;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Server name sent to clients
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Game tick rate in milliseconds
    #[serde(default = "default_tick_rate")]
    pub tick_rate_ms: u64,

    /// Ticks between game loop diagnostics (0 to disable)
    #[serde(default = "default_log_interval")]
    pub log_interval_ticks: u64,

    /// World and chunk geometry
    #[serde(default)]
    pub world: WorldConfig,

    /// Pathfinding limits
    #[serde(default)]
    pub pathfinder: PathfinderConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Development mode flag (generates a flat test map)
    #[serde(default)]
    pub dev_mode: bool,

    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,

    /// Log output format: "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// World and chunk geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    /// World width in tiles
    #[serde(default = "default_world_width")]
    pub width: u16,

    /// World height in tiles
    #[serde(default = "default_world_height")]
    pub height: u16,

    /// Number of floors
    #[serde(default = "default_world_depth")]
    pub depth: u16,

    /// Chunk width in tiles
    #[serde(default = "default_chunk_size")]
    pub chunk_width: u16,

    /// Chunk height in tiles
    #[serde(default = "default_chunk_size")]
    pub chunk_height: u16,

    /// Chunk depth in floors
    #[serde(default = "default_chunk_size")]
    pub chunk_depth: u16,
}

/// Pathfinding limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathfinderConfig {
    /// Horizontal search half-window around start and goal
    #[serde(default = "default_window_x")]
    pub window_x: u16,

    /// Vertical search half-window around start and goal
    #[serde(default = "default_window_y")]
    pub window_y: u16,

    /// Per-tile friction assumed by the heuristic
    #[serde(default = "default_friction")]
    pub friction: u32,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address to bind the game listener to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Game port (TCP)
    #[serde(default = "default_game_port")]
    pub game_port: u16,

    /// Seconds without a frame before a session is dropped
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,

    /// Frames processed per session per tick
    #[serde(default = "default_frames_per_tick")]
    pub frames_per_tick: usize,
}

// Default value functions
fn default_server_name() -> String {
    "Lattice".to_string()
}

fn default_tick_rate() -> u64 {
    50
}

fn default_log_interval() -> u64 {
    1200 // one minute at 50ms
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_world_width() -> u16 {
    256
}

fn default_world_height() -> u16 {
    256
}

fn default_world_depth() -> u16 {
    16
}

fn default_chunk_size() -> u16 {
    8
}

fn default_window_x() -> u16 {
    11
}

fn default_window_y() -> u16 {
    8
}

fn default_friction() -> u32 {
    130
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_game_port() -> u16 {
    7171
}

fn default_max_idle() -> u64 {
    300
}

fn default_frames_per_tick() -> usize {
    16
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            width: default_world_width(),
            height: default_world_height(),
            depth: default_world_depth(),
            chunk_width: default_chunk_size(),
            chunk_height: default_chunk_size(),
            chunk_depth: default_chunk_size(),
        }
    }
}

impl Default for PathfinderConfig {
    fn default() -> Self {
        Self {
            window_x: default_window_x(),
            window_y: default_window_y(),
            friction: default_friction(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            game_port: default_game_port(),
            max_idle_secs: default_max_idle(),
            frames_per_tick: default_frames_per_tick(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/server.toml"),
            server_name: default_server_name(),
            tick_rate_ms: default_tick_rate(),
            log_interval_ticks: default_log_interval(),
            world: WorldConfig::default(),
            pathfinder: PathfinderConfig::default(),
            network: NetworkConfig::default(),
            dev_mode: false,
            debug: false,
            log_format: default_log_format(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        // Determine config path from environment or use default
        let config_path = env::var("LATTICE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/server.toml"));

        // Try to load from file
        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            Self::from_toml(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
            Self::default()
        };

        config.config_path = config_path;

        // Override with environment variables
        config.apply_env_overrides();

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("LATTICE_SERVER_NAME") {
            self.server_name = val;
        }
        if let Ok(val) = env::var("LATTICE_TICK_RATE_MS") {
            if let Ok(rate) = val.parse() {
                self.tick_rate_ms = rate;
            }
        }
        if let Ok(val) = env::var("LATTICE_BIND_ADDRESS") {
            self.network.bind_address = val;
        }
        if let Ok(val) = env::var("LATTICE_GAME_PORT") {
            if let Ok(port) = val.parse() {
                self.network.game_port = port;
            }
        }
        if let Ok(val) = env::var("LATTICE_DEV_MODE") {
            self.dev_mode = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("LATTICE_DEBUG") {
            self.debug = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("LATTICE_LOG_FORMAT") {
            self.log_format = val;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        // Tick rate is sent to clients as a single byte
        if self.tick_rate_ms < 10 || self.tick_rate_ms > 255 {
            anyhow::bail!("Tick rate must be between 10ms and 255ms");
        }

        let world = &self.world;
        if world.width == 0 || world.height == 0 || world.depth == 0 {
            anyhow::bail!("World dimensions must be non-zero");
        }
        if world.depth > 255 {
            anyhow::bail!("World depth must be at most 255 floors");
        }

        let chunk_dims = [world.chunk_width, world.chunk_height, world.chunk_depth];
        if chunk_dims.iter().any(|d| *d == 0 || *d > 255) {
            anyhow::bail!("Chunk dimensions must be between 1 and 255");
        }
        // Layer tile counts are sent as a single byte
        if u32::from(world.chunk_width) * u32::from(world.chunk_height) > 255 {
            anyhow::bail!("Chunk width times height must not exceed 255 tiles");
        }

        if self.pathfinder.window_x == 0 || self.pathfinder.window_y == 0 {
            anyhow::bail!("Pathfinder window must be non-zero");
        }

        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!("Log format must be \"pretty\" or \"json\"");
        }

        self.game_address()?;

        Ok(())
    }

    /// Socket address of the game listener
    pub fn game_address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.network.bind_address, self.network.game_port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.network.bind_address))
    }

    /// Game tick interval
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_rate_ms)
    }

    /// Settings the world is built from
    pub fn world_settings(&self) -> WorldSettings {
        WorldSettings {
            name: self.server_name.clone(),
            tick_interval: self.tick_interval(),
            size: WorldSize::new(self.world.width, self.world.height, self.world.depth),
            chunk: ChunkDimensions::new(
                self.world.chunk_width,
                self.world.chunk_height,
                self.world.chunk_depth,
            ),
            path_window: (self.pathfinder.window_x, self.pathfinder.window_y),
            path_friction: self.pathfinder.friction,
            max_idle: Duration::from_secs(self.network.max_idle_secs),
            frames_per_tick: self.network.frames_per_tick,
            dev_mode: self.dev_mode,
        }
    }
}
