use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Verification key for admin bearer tokens; issuance lives elsewhere
    pub jwt_secret: String,
    /// Deployment environment the served snapshots belong to
    pub environment: String,
    /// Cadence at which each stream connection polls the version oracle
    pub stream_poll_interval: Duration,
    /// How often an idle connection gets a keep-alive event
    pub stream_heartbeat_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let port = env::var("PORT")
            .expect("PORT missing, it is required")
            .parse()
            .expect("PORT must be a valid u16 number");

        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL missing, it is required");

        let jwt_secret = env::var("JWT_SECRET").expect("JWT_SECRET missing, it is required");

        let environment = env::var("CONTROL_PLANE_ENVIRONMENT")
            .unwrap_or_else(|_| "production".to_string());

        let stream_poll_interval = Duration::from_millis(
            env::var("STREAM_POLL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(500),
        );

        let stream_heartbeat_interval = Duration::from_secs(
            env::var("STREAM_HEARTBEAT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        );

        Self {
            port,
            database_url,
            jwt_secret,
            environment,
            stream_poll_interval,
            stream_heartbeat_interval,
        }
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}
