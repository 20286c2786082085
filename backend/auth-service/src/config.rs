/// Configuration management
use serde::Deserialize;
use std::fmt;

fn default_max_connections() -> u32 {
    5
}

#[derive(Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub access_secret: String,
    pub refresh_secret: String,
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[REDACTED]")
            .field("access_secret", &"[REDACTED]")
            .field("refresh_secret", &"[REDACTED]")
            .field("database_max_connections", &self.database_max_connections)
            .finish()
    }
}
