//! Connection target models.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Database engine family.
///
/// Serialized with the textual tags `mysql`, `postgresql` and `sqlite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EngineKind {
    MySql,
    Postgres,
    Sqlite,
}

impl EngineKind {
    /// Canonical tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgresql",
            Self::Sqlite => "sqlite",
        }
    }

    /// Parse a tag; anything outside the supported set is an error.
    pub fn parse(tag: &str) -> CoreResult<Self> {
        match tag.trim().to_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgresql" | "postgres" => Ok(Self::Postgres),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            _ => Err(CoreError::unsupported_engine(tag)),
        }
    }

    /// Whether the engine is reached over the network (and so worth retrying).
    pub fn is_networked(&self) -> bool {
        !matches!(self, Self::Sqlite)
    }

    /// Default server port.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::MySql => 3306,
            Self::Postgres => 5432,
            Self::Sqlite => 0,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EngineKind {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EngineKind> for String {
    fn from(kind: EngineKind) -> Self {
        kind.as_str().to_string()
    }
}

/// SSH authentication for a tunnel.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SshAuth {
    /// Password authentication.
    Password {
        password: String,
    },
    /// Private key authentication. `key` holds PEM/OpenSSH key text or a
    /// path to a key file.
    PrivateKey {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { .. } => f.write_str("Password { .. }"),
            Self::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("has_passphrase", &passphrase.is_some())
                .finish(),
        }
    }
}

/// SSH tunnel settings embedded in a [`ConnectionSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTunnelSpec {
    /// Whether the tunnel is used at all.
    pub enabled: bool,
    /// Jump host.
    pub host: String,
    /// Jump host SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH username.
    pub username: String,
    /// Authentication method.
    pub auth: SshAuth,
    /// Pinned SHA-256 host key fingerprint (base64, with or without the
    /// `SHA256:` prefix). Unpinned hosts are accepted with a warning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl SshTunnelSpec {
    /// Create an enabled tunnel spec using password authentication.
    pub fn with_password(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            enabled: true,
            host: host.into(),
            port: default_ssh_port(),
            username: username.into(),
            auth: SshAuth::Password { password: password.into() },
            host_key_fingerprint: None,
        }
    }

    /// Create an enabled tunnel spec using a private key.
    pub fn with_private_key(host: impl Into<String>, username: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            enabled: true,
            host: host.into(),
            port: default_ssh_port(),
            username: username.into(),
            auth: SshAuth::PrivateKey { key: key.into(), passphrase: None },
            host_key_fingerprint: None,
        }
    }

    /// Set the SSH port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Pin the expected host key fingerprint.
    pub fn pin_host_key(mut self, fingerprint: impl Into<String>) -> Self {
        self.host_key_fingerprint = Some(fingerprint.into());
        self
    }

    /// Validate the tunnel settings.
    pub fn validate(&self) -> CoreResult<()> {
        if self.host.trim().is_empty() {
            return Err(CoreError::invalid_input("SSH host cannot be empty"));
        }
        if self.username.trim().is_empty() {
            return Err(CoreError::invalid_input("SSH username cannot be empty"));
        }
        match &self.auth {
            SshAuth::Password { password } if password.is_empty() => Err(CoreError::invalid_input(
                "SSH password cannot be empty when using password authentication",
            )),
            SshAuth::PrivateKey { key, .. } if key.trim().is_empty() => {
                Err(CoreError::invalid_input("SSH private key cannot be empty"))
            }
            _ => Ok(()),
        }
    }
}

/// A saved connection profile as handed to the core by the UI layer.
///
/// The core never mutates or persists it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    /// Id assigned by the profile store.
    pub id: String,
    /// Engine family.
    pub engine: EngineKind,
    /// Server host (unused for SQLite).
    #[serde(default)]
    pub host: String,
    /// Server port; 0 means the engine default.
    #[serde(default)]
    pub port: u16,
    /// Login user.
    #[serde(default)]
    pub username: String,
    /// Login password.
    #[serde(default)]
    pub password: String,
    /// Database name, or the database file path for SQLite.
    #[serde(default)]
    pub database: String,
    /// Optional SSH tunnel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_tunnel: Option<SshTunnelSpec>,
}

impl fmt::Debug for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSpec")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("database", &self.database)
            .field("ssh_tunnel", &self.ssh_tunnel)
            .finish_non_exhaustive()
    }
}

impl ConnectionSpec {
    /// Create a spec for a networked engine.
    pub fn network(
        id: impl Into<String>,
        engine: EngineKind,
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            engine,
            host: host.into(),
            port: engine.default_port(),
            username: username.into(),
            password: password.into(),
            database: database.into(),
            ssh_tunnel: None,
        }
    }

    /// Create a spec for a SQLite database file.
    pub fn sqlite(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            engine: EngineKind::Sqlite,
            host: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
            database: path.into(),
            ssh_tunnel: None,
        }
    }

    /// Set the server port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Attach an SSH tunnel.
    pub fn with_ssh_tunnel(mut self, tunnel: SshTunnelSpec) -> Self {
        self.ssh_tunnel = Some(tunnel);
        self
    }

    /// Port to dial, falling back to the engine default.
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            self.engine.default_port()
        } else {
            self.port
        }
    }

    /// The enabled tunnel, if any.
    pub fn active_tunnel(&self) -> Option<&SshTunnelSpec> {
        self.ssh_tunnel.as_ref().filter(|t| t.enabled)
    }

    /// Validate the fields required to open this connection.
    pub fn validate(&self) -> CoreResult<()> {
        if self.id.trim().is_empty() {
            return Err(CoreError::invalid_input("Connection id is required"));
        }
        match self.engine {
            EngineKind::Sqlite => {
                if self.database.trim().is_empty() {
                    return Err(CoreError::invalid_input("SQLite database path is required"));
                }
            }
            EngineKind::MySql | EngineKind::Postgres => {
                if self.host.trim().is_empty() {
                    return Err(CoreError::invalid_input("Host is required"));
                }
                if self.username.trim().is_empty() {
                    return Err(CoreError::invalid_input("Username is required"));
                }
            }
        }
        if let Some(tunnel) = self.active_tunnel() {
            tunnel.validate()?;
        }
        Ok(())
    }

    /// Display form of the target (never includes the password).
    pub fn display_url(&self) -> String {
        match self.engine {
            EngineKind::Sqlite => format!("sqlite:{}", self.database),
            _ => format!(
                "{}://{}@{}:{}/{}",
                self.engine,
                self.username,
                self.host,
                self.effective_port(),
                self.database
            ),
        }
    }
}
