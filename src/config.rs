use crate::errors::{JournalError, JournalResult};
use crate::journal::sessions::DEFAULT_LIVE_HISTORY_CAP;
use crate::simulation::runner::DEFAULT_SIMULATION_HISTORY_CAP;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub server_port: u16,
    pub live_history_cap: usize,
    pub simulation_history_cap: usize,
    pub sim_default_speed: Duration,
    /// Fixed seed for simulation draws. `None` seeds from entropy.
    pub sim_seed: Option<u64>,
}

impl AppConfig {
    pub fn from_env() -> JournalResult<Self> {
        dotenvy::dotenv().ok();

        let server_port = env_var_or("SERVER_PORT", "3001")
            .parse::<u16>()
            .map_err(|e| JournalError::Config(format!("SERVER_PORT: {e}")))?;

        let live_history_cap = env_var_or("LIVE_HISTORY_CAP", "100")
            .parse::<usize>()
            .map_err(|e| JournalError::Config(format!("LIVE_HISTORY_CAP: {e}")))?;

        let simulation_history_cap = env_var_or("SIMULATION_HISTORY_CAP", "50")
            .parse::<usize>()
            .map_err(|e| JournalError::Config(format!("SIMULATION_HISTORY_CAP: {e}")))?;

        let speed_ms = env_var_or("SIM_DEFAULT_SPEED_MS", "200")
            .parse::<u64>()
            .map_err(|e| JournalError::Config(format!("SIM_DEFAULT_SPEED_MS: {e}")))?;

        let sim_seed = match env_var_opt("SIM_SEED") {
            Some(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|e| JournalError::Config(format!("SIM_SEED: {e}")))?,
            ),
            None => None,
        };

        if live_history_cap == 0 || simulation_history_cap == 0 {
            return Err(JournalError::Config("history caps must be at least 1".into()));
        }

        Ok(Self {
            data_dir: PathBuf::from(env_var_or("DATA_DIR", "data")),
            bind_addr: env_var_or("BIND_ADDR", "127.0.0.1"),
            server_port,
            live_history_cap,
            simulation_history_cap,
            sim_default_speed: Duration::from_millis(speed_ms.max(1)),
            sim_seed,
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            bind_addr: "127.0.0.1".into(),
            server_port: 3001,
            live_history_cap: DEFAULT_LIVE_HISTORY_CAP,
            simulation_history_cap: DEFAULT_SIMULATION_HISTORY_CAP,
            sim_default_speed: Duration::from_millis(200),
            sim_seed: None,
        }
    }
}

fn env_var_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
