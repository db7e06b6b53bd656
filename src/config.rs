use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::collab::{ProcedureCode, SessionCode};
use crate::error::{Code, Error, Result};
use crate::model::TerminalKind;
use crate::net::TlsSettings;
use crate::terminal::RunnerSettings;

/// Prefix of environment variables overriding the configuration file.
pub const ENV_PREFIX: &str = "EVOTE_";

/// Terminal configuration, derived from a TOML file (`Terminal.toml` by
/// default) and `EVOTE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    kind: TerminalKind,
    address: SocketAddr,
    urn_address: Option<SocketAddr>,
    #[serde(default = "default_workers")]
    workers: usize,
    #[serde(default = "default_grace_period")]
    grace_period: u64,
    #[serde(default = "default_poll_interval")]
    poll_interval: u64,
    #[serde(default = "default_io_timeout")]
    io_timeout: u64,
    // secrets
    session_key: Option<String>,
    key_path: Option<PathBuf>,
    tls: Option<TlsSettings>,
    // urn only
    store_path: Option<PathBuf>,
    procedure: Option<ProcedureCode>,
    session: Option<SessionCode>,
}

fn default_workers() -> usize {
    16
}

fn default_grace_period() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    10
}

fn default_io_timeout() -> u64 {
    5000
}

fn missing(kind: TerminalKind, name: &str) -> Error {
    Error::new(
        Code::UnexpectedValue,
        format!("`{name}` must be configured for a {kind}"),
    )
}

impl Config {
    /// Load the configuration from `path` and the environment, optionally
    /// forcing the terminal kind.
    pub fn load(path: impl AsRef<Path>, kind: Option<TerminalKind>) -> Result<Self> {
        let mut figment = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX));
        if let Some(kind) = kind {
            figment = figment.merge(Serialized::global("kind", kind));
        }
        Self::from_figment(&figment)
    }

    /// Extract and check a configuration.
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| Error::new(Code::UnexpectedValue, format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Fail if something the configured kind needs is absent.
    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::new(Code::UnexpectedValue, "`workers` must be at least 1"));
        }
        match self.kind {
            TerminalKind::Urn => {
                self.key_path()?;
                self.store_path()?;
                self.procedure()?;
                self.session()?;
            }
            TerminalKind::Post => {
                self.urn_address()?;
                self.session_key()?;
                self.key_path()?;
            }
            TerminalKind::Station | TerminalKind::SubStation => {
                self.urn_address()?;
                self.session_key()?;
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> TerminalKind {
        self.kind
    }

    /// Where this terminal listens.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn urn_address(&self) -> Result<SocketAddr> {
        self.urn_address.ok_or_else(|| missing(self.kind, "urn_address"))
    }

    /// Worker pool size, shutdown grace period and liveness interval.
    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            workers: self.workers,
            grace_period: Duration::from_secs(self.grace_period),
            poll_interval: Duration::from_secs(self.poll_interval),
        }
    }

    /// Bound on every read from a link.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout)
    }

    /// Secret shared with the Urn.
    pub fn session_key(&self) -> Result<&str> {
        self.session_key
            .as_deref()
            .ok_or_else(|| missing(self.kind, "session_key"))
    }

    /// PEM private key: the booth key of a Post, the counting key of the Urn.
    pub fn key_path(&self) -> Result<&Path> {
        self.key_path
            .as_deref()
            .ok_or_else(|| missing(self.kind, "key_path"))
    }

    pub fn tls(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }

    /// JSON seed of the Urn's store.
    pub fn store_path(&self) -> Result<&Path> {
        self.store_path
            .as_deref()
            .ok_or_else(|| missing(self.kind, "store_path"))
    }

    pub fn procedure(&self) -> Result<ProcedureCode> {
        self.procedure.ok_or_else(|| missing(self.kind, "procedure"))
    }

    pub fn session(&self) -> Result<SessionCode> {
        self.session.ok_or_else(|| missing(self.kind, "session"))
    }
}
