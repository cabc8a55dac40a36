use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::library_repository::PostgresLibraryRepositoryConfig;

/// Service settings, read from environment variables with the same (upper case) names
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub use_in_memory_db: bool,
    pub db_host: String,
    pub db_username: String,
    pub db_password: String,
    pub http_port: u16,
    /// How many books are listed in the most borrowed part of the report
    pub report_top_books: usize,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("use_in_memory_db", false)?
            .set_default("db_host", "127.0.0.1")?
            .set_default("db_username", "postgres")?
            .set_default("db_password", "postgres")?
            .set_default("http_port", 8080)?
            .set_default("report_top_books", 5)?
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn postgres_config(&self) -> PostgresLibraryRepositoryConfig {
        PostgresLibraryRepositoryConfig {
            hostname: self.db_host.clone(),
            username: self.db_username.clone(),
            password: self.db_password.clone(),
        }
    }
}
