//! Connection and session configuration.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use jid::BareJid;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::transport::dns::{self, ParsedServer, XmppEndpoint};
use crate::transport::SecurityMode;

/// TCP connect timeout per endpoint.
///
/// Without it the OS default applies, which can be minutes for an
/// unreachable host.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Per-read deadline while negotiating (features, SASL, bind).
const DEFAULT_NEGOTIATION_TIMEOUT_SECS: u64 = 10;

/// Idle time after which the session pings the server.
const DEFAULT_KEEPALIVE_SECS: u64 = 60;

/// Idle time after which the connection is considered dead.
///
/// Five minutes of silence despite keepalive pings means the peer is gone,
/// not just quiet.
const DEFAULT_READ_TIMEOUT_SECS: u64 = 300;

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_negotiation_timeout() -> u64 {
    DEFAULT_NEGOTIATION_TIMEOUT_SECS
}

fn default_keepalive() -> u64 {
    DEFAULT_KEEPALIVE_SECS
}

fn default_read_timeout() -> u64 {
    DEFAULT_READ_TIMEOUT_SECS
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Host to dial, or the bare domain when `port` is unset.
    pub host: String,
    /// Explicit port. When unset, the domain is resolved through SRV.
    #[serde(default)]
    pub port: Option<u16>,
    /// XMPP domain for the account, SNI and the stream `to=`. Defaults to `host`.
    #[serde(default)]
    pub domain: Option<String>,
    /// Local part of the account JID.
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub security: SecurityMode,
    /// Resource to request at bind time; the server picks one when unset.
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Skip certificate verification. Never for production servers.
    #[serde(default)]
    pub insecure_tls: bool,
    /// Ask the server to flush stored offline messages (XEP-0013) once
    /// logged in. Most servers push them after initial presence anyway.
    #[serde(default)]
    pub fetch_offline_messages: bool,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("security", &self.security)
            .field("resource", &self.resource)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("negotiation_timeout_secs", &self.negotiation_timeout_secs)
            .field("keepalive_interval_secs", &self.keepalive_interval_secs)
            .field("read_timeout_secs", &self.read_timeout_secs)
            .field("insecure_tls", &self.insecure_tls)
            .field("fetch_offline_messages", &self.fetch_offline_messages)
            .finish()
    }
}

impl SessionConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        security: SecurityMode,
    ) -> Self {
        SessionConfig {
            host: host.into(),
            port: Some(port),
            domain: None,
            username: username.into(),
            password: password.into(),
            security,
            resource: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            negotiation_timeout_secs: DEFAULT_NEGOTIATION_TIMEOUT_SECS,
            keepalive_interval_secs: DEFAULT_KEEPALIVE_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            insecure_tls: false,
            fetch_offline_messages: false,
        }
    }

    /// Build from a server input string: `tls://host:port`, `tcp://host:port`,
    /// `plain://host:port`, `host:port`, any of them with `?domain=`, or a
    /// bare domain for SRV resolution.
    pub fn from_server_input(
        input: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        match dns::parse_server_input(input) {
            ParsedServer::Direct {
                host,
                port,
                mode,
                domain,
            } => SessionConfig {
                domain,
                ..SessionConfig::new(host, port, username, password, mode)
            },
            ParsedServer::Domain(domain) => SessionConfig {
                port: None,
                ..SessionConfig::new(domain, 0, username, password, SecurityMode::StartTls)
            },
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: SessionConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".to_string()));
        }
        if self.username.is_empty() || self.username.contains('@') {
            return Err(Error::Config(
                "username must be a non-empty local part without '@'".to_string(),
            ));
        }
        if self.port == Some(0) {
            return Err(Error::Config("port must not be 0".to_string()));
        }
        let timeouts = [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("negotiation_timeout_secs", self.negotiation_timeout_secs),
            ("keepalive_interval_secs", self.keepalive_interval_secs),
            ("read_timeout_secs", self.read_timeout_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(Error::Config(format!("{name} must not be 0")));
        }
        self.account_jid()?;
        Ok(())
    }

    pub fn xmpp_domain(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }

    pub fn account_jid(&self) -> Result<BareJid> {
        Ok(BareJid::new(&format!("{}@{}", self.username, self.xmpp_domain()))?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Endpoints to try, in order.
    ///
    /// An explicit port gives exactly one. Otherwise TLS-capable modes go
    /// through SRV resolution and plain mode dials `host:5222`.
    pub async fn endpoints(&self) -> Vec<XmppEndpoint> {
        match (self.port, self.security) {
            (Some(port), mode) => vec![XmppEndpoint {
                host: self.host.clone(),
                port,
                mode,
            }],
            (None, SecurityMode::Plain) => vec![XmppEndpoint {
                host: self.host.clone(),
                port: 5222,
                mode: SecurityMode::Plain,
            }],
            (None, _) => {
                info!(domain = self.xmpp_domain(), "Resolving XMPP server via SRV");
                dns::resolve_xmpp_server(self.xmpp_domain()).await
            }
        }
    }
}
