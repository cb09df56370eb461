//! Command-line and environment configuration.

use std::{net::IpAddr, time::Duration};

use browser_bridge_core::{
    AuthToken, BridgeConfig, CommandFormat, ConfigError,
    config::{DEFAULT_AUTH_WINDOW, DEFAULT_CALL_TIMEOUT, DEFAULT_PORT},
};
use clap::{Parser, ValueEnum};

/// Envelope shape used for commands sent to the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    /// `{type: "CallToolRequest", id, payload: {name, arguments}}`
    Legacy,
    /// `{type: <tool>, id, payload}`
    Direct,
}

impl From<FormatArg> for CommandFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Legacy => Self::Legacy,
            FormatArg::Direct => Self::Direct,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "browser-bridge", version, about = "Bridge MCP tool calls to a browser extension")]
pub struct Cli {
    /// Authentication token (up to 64 characters)
    #[arg(short, long, env = "BROWSER_MCP_AUTH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Port the browser extension connects to
    #[arg(short, long, env = "BROWSER_MCP_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Seconds to wait for the extension to answer a tool call
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_CALL_TIMEOUT.as_secs())]
    pub timeout: u64,

    /// Seconds a new connection has to authenticate
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_AUTH_WINDOW.as_secs())]
    pub auth_window: u64,

    /// Command envelope shape sent to the extension
    #[arg(long, value_enum, default_value_t = FormatArg::Legacy)]
    pub command_format: FormatArg,

    /// Fail instead of killing a process already bound to the port
    #[arg(long)]
    pub no_evict: bool,
}

impl Cli {
    /// Validate into a [`BridgeConfig`].
    ///
    /// # Errors
    /// Returns error if the token is missing or too long, or a duration is zero.
    pub fn into_config(self) -> Result<BridgeConfig, ConfigError> {
        let token = AuthToken::new(self.token.unwrap_or_default())?;
        let mut config = BridgeConfig::new(token);
        config.host = self.host;
        config.port = self.port;
        config.call_timeout = Duration::from_secs(self.timeout);
        config.auth_window = Duration::from_secs(self.auth_window);
        config.command_format = self.command_format.into();
        config.evict_existing = !self.no_evict;
        config.validate()?;
        Ok(config)
    }
}
