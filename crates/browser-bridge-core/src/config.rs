//! Bridge configuration.

use std::{fmt, net::IpAddr, net::Ipv4Addr, net::SocketAddr, time::Duration};

use crate::{error::ConfigError, protocol::CommandFormat};

/// Default agent listening port.
pub const DEFAULT_PORT: u16 = 9009;
/// Window in which a new socket must authenticate.
pub const DEFAULT_AUTH_WINDOW: Duration = Duration::from_secs(5);
/// Default bound on a single remote tool call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Hard deadline for shutting down once the caller goes away.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(15);
/// Longest accepted authentication token, in characters.
pub const MAX_TOKEN_CHARS: usize = 64;

/// Shared secret an agent must present. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Validate and wrap a token.
    ///
    /// # Errors
    /// Returns error if the token is empty or longer than 64 characters.
    pub fn new(token: impl Into<String>) -> Result<Self, ConfigError> {
        let token = token.into();
        let chars = token.chars().count();
        if chars == 0 {
            return Err(ConfigError::MissingToken);
        }
        if chars > MAX_TOKEN_CHARS {
            return Err(ConfigError::TokenTooLong(chars));
        }
        Ok(Self(token))
    }

    /// Strict equality against a presented token.
    #[must_use]
    pub fn matches(&self, presented: &str) -> bool {
        self.0 == presented
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Runtime configuration of the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: IpAddr,
    pub port: u16,
    pub token: AuthToken,
    pub auth_window: Duration,
    pub call_timeout: Duration,
    pub command_format: CommandFormat,
    /// Kill whatever already listens on `port` before binding.
    pub evict_existing: bool,
    pub shutdown_grace: Duration,
}

impl BridgeConfig {
    /// Configuration with defaults for everything but the token.
    #[must_use]
    pub const fn new(token: AuthToken) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            token,
            auth_window: DEFAULT_AUTH_WINDOW,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            command_format: CommandFormat::Legacy,
            evict_existing: true,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Check the durations are usable.
    ///
    /// # Errors
    /// Returns error for a zero auth window or call timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth_window.is_zero() {
            return Err(ConfigError::ZeroDuration("auth window"));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("call timeout"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_length_bounds() {
        assert!(matches!(AuthToken::new(""), Err(ConfigError::MissingToken)));
        assert!(AuthToken::new("a".repeat(64)).is_ok());
        assert!(matches!(
            AuthToken::new("a".repeat(65)),
            Err(ConfigError::TokenTooLong(65))
        ));
    }

    #[test]
    fn test_token_is_redacted_and_strict() {
        let token = AuthToken::new("hunter2").unwrap();
        assert!(!format!("{token:?}").contains("hunter2"));
        assert!(token.matches("hunter2"));
        assert!(!token.matches("hunter2 "));
        assert!(!token.matches("HUNTER2"));
    }

    #[test]
    fn test_defaults_and_validation() {
        let mut config = BridgeConfig::new(AuthToken::new("t").unwrap());
        assert_eq!(config.listen_addr().to_string(), "127.0.0.1:9009");
        assert!(config.validate().is_ok());

        config.call_timeout = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration("call timeout"))
        ));
    }
}
