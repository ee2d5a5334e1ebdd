// Application configuration, loaded from environment variables and CLI flags.

use std::path::PathBuf;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Whether to run in local mode (single implicit admin, no rate limiting).
    pub local_mode: bool,
    /// Directory containing a pre-built frontend to serve.
    pub static_dir: Option<PathBuf>,
    /// How often the deadline worker sweeps live sessions.
    pub deadline_poll: Duration,
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - SQLite connection string (default: `sqlite:trivia.db?mode=rwc`)
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `TRIVIA_LOCAL_MODE` - Set to `true` to enable local mode
    /// - `STATIC_DIR` - Path to frontend dist directory for static file serving
    /// - `DEADLINE_POLL_MS` - Deadline sweep interval (default: 1000)
    ///
    /// CLI flags:
    /// - `--local` - Enable local mode (same as `TRIVIA_LOCAL_MODE=true`)
    /// - `--port <PORT>` - Override the port
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:trivia.db?mode=rwc".to_string());

        // Port: CLI flag --port takes precedence, then env var, then default
        let port = Self::parse_cli_value(&args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(3000);

        let local_mode = args.contains(&"--local".to_string())
            || std::env::var("TRIVIA_LOCAL_MODE")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false);

        let static_dir = std::env::var("STATIC_DIR").ok().map(PathBuf::from);

        let deadline_poll = std::env::var("DEADLINE_POLL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(1));

        Config {
            database_url,
            port,
            local_mode,
            static_dir,
            deadline_poll,
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

/// Global flag indicating local mode is active.
/// This is set once at startup and read by auth extractors.
static LOCAL_MODE: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

/// Set the local mode flag (called once at startup).
pub fn set_local_mode(enabled: bool) {
    LOCAL_MODE.store(enabled, std::sync::atomic::Ordering::Relaxed);
}

/// Check if local mode is active.
pub fn is_local_mode() -> bool {
    LOCAL_MODE.load(std::sync::atomic::Ordering::Relaxed)
}

/// The admin account used for every request in local mode.
pub const LOCAL_USER_ID: i64 = 1;
pub const LOCAL_USERNAME: &str = "local";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli_value() {
        let args: Vec<String> = ["trivia", "--port", "8080", "--local"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(Config::parse_cli_value(&args, "--port").as_deref(), Some("8080"));
        assert_eq!(Config::parse_cli_value(&args, "--missing"), None);
    }

    #[test]
    fn test_default_deadline_poll() {
        let config = Config::load();
        assert!(config.deadline_poll > Duration::ZERO);
    }
}
