//! Connection defaults and the error policy.
//!
//! Read from the `[pmta]` table of a TOML file:
//!
//! ```toml
//! [pmta]
//! server = "mta.example.com"
//! port = 2525
//! username = "submitter"
//! password = "secret"
//! always_throw_exceptions = true
//! library = "/opt/pmta/lib/libpmta.so"
//! ```

use core::fmt::{self, Debug};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    connection::{Credentials, Endpoint, Target},
    error::Policy,
    internal,
};

pub const DEFAULT_SERVER: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 25;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "PMTA_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    #[error("PMTA_CONFIG points to a non-existent file: {}", .0.display())]
    Missing(PathBuf),
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub always_throw_exceptions: bool,
    /// Shared library providing the submission engine.
    pub library: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: None,
            port: DEFAULT_PORT,
            username: None,
            password: None,
            always_throw_exceptions: false,
            library: None,
        }
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("always_throw_exceptions", &self.always_throw_exceptions)
            .field("library", &self.library)
            .finish()
    }
}

#[derive(Default, Deserialize)]
struct Document {
    #[serde(default)]
    pmta: Config,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}

impl Config {
    /// Parse the `[pmta]` table of a TOML document. A document without the
    /// table yields the defaults.
    ///
    /// # Errors
    /// If the document is malformed or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let document: Document = toml::from_str(content)?;
        document.pmta.validate()?;
        Ok(document.pmta)
    }

    /// # Errors
    /// If the file cannot be read or does not hold a valid configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_toml(&content)?;
        internal!(level = DEBUG, "loaded configuration from {}", path.display());

        Ok(config)
    }

    /// Find the configuration file using the following precedence:
    /// 1. `PMTA_CONFIG` environment variable
    /// 2. ./pmta.toml
    /// 3. /etc/pmta/pmta.toml
    ///
    /// # Errors
    /// If `PMTA_CONFIG` names a file that does not exist.
    pub fn locate() -> Result<Option<PathBuf>, ConfigError> {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(env_path);
            if path.exists() {
                return Ok(Some(path));
            }

            return Err(ConfigError::Missing(path));
        }

        Ok(["./pmta.toml", "/etc/pmta/pmta.toml"]
            .into_iter()
            .map(PathBuf::from)
            .find(|path| path.exists()))
    }

    /// # Errors
    /// If the port is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid {
                field: "port",
                reason: "must be between 1 and 65535",
            });
        }

        Ok(())
    }

    #[must_use]
    pub const fn policy(&self) -> Policy {
        Policy::from_flag(self.always_throw_exceptions)
    }

    /// Fill the gaps in `target` from the configured defaults.
    ///
    /// Empty strings and a zero port count as omitted. Credentials are only
    /// used when both a username and a password remain; a lone username or
    /// password is dropped and the connection is anonymous.
    #[must_use]
    pub fn resolve(&self, target: &Target) -> Endpoint {
        let server = non_empty(target.server.as_deref())
            .or_else(|| non_empty(self.server.as_deref()))
            .unwrap_or(DEFAULT_SERVER);

        let port = target
            .port
            .filter(|port| *port != 0)
            .or(Some(self.port).filter(|port| *port != 0))
            .unwrap_or(DEFAULT_PORT);

        let username = non_empty(target.username.as_deref())
            .or_else(|| non_empty(self.username.as_deref()));
        let password = non_empty(target.password.as_deref())
            .or_else(|| non_empty(self.password.as_deref()));

        Endpoint {
            server: server.to_owned(),
            port,
            credentials: username
                .zip(password)
                .map(|(username, password)| Credentials::new(username, password)),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{Config, ConfigError, DEFAULT_PORT};
    use crate::{
        connection::{Credentials, Target},
        error::Policy,
    };

    #[test]
    fn defaults() {
        let config = Config::from_toml("").unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.policy(), Policy::ReturnSentinel);

        let endpoint = config.resolve(&Target::default());
        assert_eq!(endpoint.server, "127.0.0.1");
        assert_eq!(endpoint.port, 25);
        assert_eq!(endpoint.credentials, None);
    }

    #[test]
    fn parse() {
        let config = Config::from_toml(
            r#"
            [pmta]
            server = "mta.example.com"
            port = 2525
            username = "submitter"
            password = "secret"
            always_throw_exceptions = true
            library = "/opt/pmta/lib/libpmta.so"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.as_deref(), Some("mta.example.com"));
        assert_eq!(config.port, 2525);
        assert_eq!(config.policy(), Policy::Raise);
        assert_eq!(
            config.library.as_deref().and_then(|path| path.to_str()),
            Some("/opt/pmta/lib/libpmta.so")
        );
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn invalid() {
        assert!(matches!(
            Config::from_toml("[pmta]\nport = 0"),
            Err(ConfigError::Invalid { field: "port", .. })
        ));
        assert!(matches!(
            Config::from_toml("[pmta]\nport = 70000"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_toml("[pmta]\nhost = \"x\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn target_overrides_configuration() {
        let config = Config {
            server: Some("mta.example.com".to_owned()),
            port: 2525,
            username: Some("config-user".to_owned()),
            password: Some("config-pass".to_owned()),
            ..Config::default()
        };

        let endpoint = config.resolve(
            &Target::default()
                .server("relay.example.com")
                .port(0)
                .username(""),
        );
        assert_eq!(endpoint.server, "relay.example.com");
        assert_eq!(endpoint.port, 2525);
        assert_eq!(
            endpoint.credentials,
            Some(Credentials::new("config-user", "config-pass"))
        );
    }

    #[test]
    fn lone_credential_is_dropped() {
        let config = Config::default();

        let endpoint = config.resolve(&Target::default().username("user"));
        assert_eq!(endpoint.credentials, None);

        let endpoint = config.resolve(&Target::default().password("pass"));
        assert_eq!(endpoint.credentials, None);

        let config = Config {
            password: Some("pass".to_owned()),
            ..Config::default()
        };
        let endpoint = config.resolve(&Target::default().username("user"));
        assert_eq!(endpoint.credentials, Some(Credentials::new("user", "pass")));
    }
}
