/// Configuration management for Vigil
use crate::error::{AuthError, AuthResult};
use chrono::Duration;
use std::env;
use std::path::PathBuf;

/// Main server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub authentication: AuthConfig,
    pub lockout: LockoutConfig,
    pub password: PasswordConfig,
    pub email: Option<EmailConfig>,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    /// Base URL used in password reset links
    pub public_url: String,
    /// Upper bound for a single login/refresh/password operation
    pub request_timeout: std::time::Duration,
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database: PathBuf,
}

/// Token signing configuration
#[derive(Clone)]
pub struct AuthConfig {
    pub access_token_secret: String,
    pub refresh_token_secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    /// Clock skew tolerated when checking `exp`
    pub token_leeway: Duration,
}

/// Brute-force lockout options
#[derive(Debug, Clone)]
pub struct LockoutConfig {
    pub max_attempts: u32,
    pub lock_duration: Duration,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lock_duration: Duration::minutes(15),
        }
    }
}

/// Password policy and hashing cost
#[derive(Debug, Clone)]
pub struct PasswordConfig {
    pub min_length: usize,
    pub history_size: u32,
    pub reset_token_ttl: Duration,
    /// Argon2 memory cost in KiB
    pub hash_memory_kib: u32,
    /// Argon2 iteration count
    pub hash_iterations: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            min_length: 8,
            history_size: 5,
            reset_token_ttl: Duration::hours(1),
            hash_memory_kib: 19 * 1024,
            hash_iterations: 2,
        }
    }
}

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_url: String,
    pub from_address: String,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

/// Longest duration any setting may take
pub const MAX_DURATION_DAYS: i64 = 3650;

/// Parse a duration such as `30s`, `15m`, `2h` or `7d`.
///
/// A bare integer is read as seconds.
pub fn parse_duration(input: &str) -> AuthResult<Duration> {
    let s = input.trim();
    let invalid = || AuthError::Configuration(format!("Invalid duration: {:?}", input));

    if s.is_empty() {
        return Err(invalid());
    }

    let (digits, unit) = match s.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&s[..idx], c),
        _ => (s, 's'),
    };

    let amount: i64 = digits.trim().parse().map_err(|_| invalid())?;
    if amount < 0 {
        return Err(invalid());
    }

    let duration = match unit.to_ascii_lowercase() {
        's' => Duration::try_seconds(amount),
        'm' => Duration::try_minutes(amount),
        'h' => Duration::try_hours(amount),
        'd' => Duration::try_days(amount),
        _ => None,
    };
    duration.ok_or_else(invalid)
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("access_token_secret", &"<redacted>")
            .field("refresh_token_secret", &"<redacted>")
            .field("access_token_ttl", &self.access_token_ttl)
            .field("refresh_token_ttl", &self.refresh_token_ttl)
            .field("token_leeway", &self.token_leeway)
            .finish()
    }
}

fn duration_var(name: &str, default: &str) -> AuthResult<Duration> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    parse_duration(&raw).map_err(|_| AuthError::Configuration(format!("{} is not a valid duration", name)))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> AuthResult<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AuthError::Configuration(format!("{} has an invalid value", name))),
        Err(_) => Ok(default),
    }
}

fn required_secret(name: &str) -> AuthResult<String> {
    env::var(name)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AuthError::Configuration(format!("{} is required", name)))
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> AuthResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("VIGIL_HOSTNAME").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = parsed_var("VIGIL_PORT", 8080)?;
        let public_url = env::var("VIGIL_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", hostname, port));
        let request_timeout = duration_var("REQUEST_TIMEOUT", "10s")?
            .to_std()
            .map_err(|_| AuthError::Configuration("REQUEST_TIMEOUT out of range".to_string()))?;

        let database = env::var("VIGIL_DATABASE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/vigil.sqlite"));

        // Both secrets are mandatory; the process refuses to start without them
        let access_token_secret = required_secret("ACCESS_TOKEN_SECRET")?;
        let refresh_token_secret = required_secret("REFRESH_TOKEN_SECRET")?;

        let authentication = AuthConfig {
            access_token_secret,
            refresh_token_secret,
            access_token_ttl: duration_var("ACCESS_TOKEN_TTL", "2h")?,
            refresh_token_ttl: duration_var("REFRESH_TOKEN_TTL", "7d")?,
            token_leeway: duration_var("TOKEN_LEEWAY", "0s")?,
        };

        let lockout = LockoutConfig {
            max_attempts: parsed_var("MAX_LOGIN_ATTEMPTS", 5)?,
            lock_duration: duration_var("LOCK_DURATION", "15m")?,
        };

        let defaults = PasswordConfig::default();
        let password = PasswordConfig {
            min_length: parsed_var("MIN_PASSWORD_LENGTH", defaults.min_length)?,
            history_size: parsed_var("PASSWORD_HISTORY_SIZE", defaults.history_size)?,
            reset_token_ttl: duration_var("PASSWORD_RESET_TTL", "1h")?,
            hash_memory_kib: parsed_var("PASSWORD_HASH_MEMORY_KIB", defaults.hash_memory_kib)?,
            hash_iterations: parsed_var("PASSWORD_HASH_ITERATIONS", defaults.hash_iterations)?,
        };

        let email = if let Ok(smtp_url) = env::var("VIGIL_SMTP_URL") {
            Some(EmailConfig {
                smtp_url,
                from_address: env::var("VIGIL_SMTP_FROM")
                    .unwrap_or_else(|_| format!("noreply@{}", hostname)),
            })
        } else {
            None
        };

        let level = env::var("RUST_LOG").unwrap_or_else(|_| "vigil=info,tower_http=info".to_string());
        let json = env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                public_url,
                request_timeout,
            },
            storage: StorageConfig { database },
            authentication,
            lockout,
            password,
            email,
            logging: LoggingConfig { level, json },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> AuthResult<()> {
        let auth = &self.authentication;

        if auth.access_token_secret.len() < 32 || auth.refresh_token_secret.len() < 32 {
            return Err(AuthError::Configuration(
                "Token secrets must be at least 32 characters".to_string(),
            ));
        }

        if auth.access_token_secret == auth.refresh_token_secret {
            return Err(AuthError::Configuration(
                "Access and refresh tokens must use distinct secrets".to_string(),
            ));
        }

        if auth.access_token_ttl <= Duration::zero() || auth.refresh_token_ttl <= Duration::zero() {
            return Err(AuthError::Configuration("Token TTLs must be positive".to_string()));
        }

        let max = Duration::days(MAX_DURATION_DAYS);
        let durations = [
            ("ACCESS_TOKEN_TTL", auth.access_token_ttl),
            ("REFRESH_TOKEN_TTL", auth.refresh_token_ttl),
            ("TOKEN_LEEWAY", auth.token_leeway),
            ("LOCK_DURATION", self.lockout.lock_duration),
            ("PASSWORD_RESET_TTL", self.password.reset_token_ttl),
        ];
        for (name, value) in durations {
            if value > max {
                return Err(AuthError::Configuration(format!(
                    "{} must not exceed {} days",
                    name, MAX_DURATION_DAYS
                )));
            }
        }
        if self.service.request_timeout > std::time::Duration::from_secs(MAX_DURATION_DAYS as u64 * 86_400) {
            return Err(AuthError::Configuration(format!(
                "REQUEST_TIMEOUT must not exceed {} days",
                MAX_DURATION_DAYS
            )));
        }

        if self.lockout.max_attempts == 0 {
            return Err(AuthError::Configuration(
                "MAX_LOGIN_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        if self.password.min_length == 0 {
            return Err(AuthError::Configuration(
                "MIN_PASSWORD_LENGTH must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
