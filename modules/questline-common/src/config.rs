use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_url: String,

    // Web server
    pub web_host: String,
    pub web_port: u16,

    // Signing secrets
    pub session_secret: String,
    pub scan_token_secret: String,
    pub token_issuer: String,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            web_host: env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_port: env::var("WEB_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .expect("WEB_PORT must be a number"),
            session_secret: required_env("SESSION_SECRET"),
            scan_token_secret: env::var("SCAN_TOKEN_SECRET")
                .unwrap_or_else(|_| required_env("SESSION_SECRET")),
            token_issuer: env::var("TOKEN_ISSUER").unwrap_or_else(|_| "questline".to_string()),
        }
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}
