use core::fmt::{self, Debug};
use std::sync::Arc;

use crate::{
    config::Config,
    engine::Engine,
    error::{check_text, Error, ErrorKind, Result, Subject},
    incoming, internal,
    message::Message,
    outgoing,
};

/// Where to connect, as requested by the caller. Anything left unset (or set
/// to an empty string or port `0`) is taken from the [`Config`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    pub(crate) server: Option<String>,
    pub(crate) port: Option<u16>,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
}

impl Target {
    #[must_use]
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username(username).password(password)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A fully resolved connect target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub server: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

/// A session with a submission server.
///
/// The connect attempt happens once, in [`Connection::open`]. A connection
/// whose attempt failed is still returned so the failure can be inspected, but
/// it rejects every submission without contacting the engine.
pub struct Connection<E: Engine> {
    engine: Arc<E>,
    native: E::Session,
    server: String,
    port: u16,
    credentials: Option<Credentials>,
    connected: bool,
    connect_error: Option<Error>,
    local_error: Option<Error>,
}

impl<E: Engine> Connection<E> {
    /// Allocate a session and connect it to `target`, filling gaps from
    /// `config`.
    ///
    /// Both a username and a password select an authenticated connect; with
    /// either missing the connect is anonymous.
    ///
    /// # Errors
    /// Only if the engine cannot allocate a session. A failed connect is
    /// reported through [`Self::connect_error`].
    pub fn open(engine: &Arc<E>, config: &Config, target: &Target) -> Result<Self> {
        let native = engine
            .session_alloc()
            .ok_or_else(|| Error::allocation(Subject::Connection))?;

        let Endpoint {
            server,
            port,
            credentials,
        } = config.resolve(target);

        let mut connection = Self {
            engine: Arc::clone(engine),
            native,
            server,
            port,
            credentials: None,
            connected: false,
            connect_error: None,
            local_error: None,
        };

        connection.connect(credentials);
        Ok(connection)
    }

    fn connect(&mut self, credentials: Option<Credentials>) {
        let checked = check_text(Subject::Connection, "server", &self.server).and_then(|()| {
            credentials.as_ref().map_or(Ok(()), |credentials| {
                check_text(Subject::Connection, "username", &credentials.username).and_then(
                    |()| check_text(Subject::Connection, "password", &credentials.password),
                )
            })
        });

        if let Err(err) = checked {
            self.local_error = Some(err.clone());
            self.connect_error = Some(err);
            return;
        }

        self.connected = match &credentials {
            Some(Credentials { username, password }) => {
                outgoing!("connect to {}:{} as {username}", self.server, self.port);
                self.engine.session_connect_auth(
                    &mut self.native,
                    &self.server,
                    self.port,
                    username,
                    password,
                )
            }
            None => {
                outgoing!("connect to {}:{}", self.server, self.port);
                self.engine
                    .session_connect(&mut self.native, &self.server, self.port)
            }
        };

        if self.connected {
            internal!(
                level = INFO,
                "connected to {}:{}{}",
                self.server,
                self.port,
                if credentials.is_some() { " (authenticated)" } else { "" }
            );
            self.credentials = credentials;
        } else {
            let err = self.engine_error();
            incoming!(
                level = WARN,
                "unable to connect to {}:{}: {err}",
                self.server,
                self.port
            );
            self.connect_error = Some(err);
        }
    }

    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The username of a successful authenticated connect.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.credentials
            .as_ref()
            .map(|credentials| credentials.username.as_str())
    }

    /// The password of a successful authenticated connect.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.credentials
            .as_ref()
            .map(|credentials| credentials.password.as_str())
    }

    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Why the connect attempt failed, if it did.
    #[must_use]
    pub const fn connect_error(&self) -> Option<&Error> {
        self.connect_error.as_ref()
    }

    /// Hand a message to the server.
    ///
    /// # Errors
    /// [`ErrorKind::IllegalState`] without contacting the engine if this
    /// connection is not live or the message was never initialised,
    /// [`ErrorKind::IllegalArgument`] for a message built on another engine
    /// instance, otherwise the engine's error.
    pub fn submit(&mut self, message: &Message<E>) -> Result<()> {
        if !self.connected {
            let reason = self
                .connect_error
                .as_ref()
                .map_or_else(String::new, |err| format!(": {}", err.message()));
            return Err(self.local(Error::illegal_state(
                Subject::Connection,
                format!("not connected to {}:{}{reason}", self.server, self.port),
            )));
        }

        if !message.is_ready() {
            return Err(self.local(Error::illegal_state(
                Subject::Connection,
                format!("message from {} is not ready", message.originator()),
            )));
        }

        if !Arc::ptr_eq(&self.engine, message.engine()) {
            return Err(self.local(Error::new(
                Subject::Connection,
                ErrorKind::IllegalArgument,
                "message belongs to a different engine",
            )));
        }

        self.local_error = None;
        outgoing!(
            "submit message from {} with {} recipient(s) to {}:{}",
            message.originator(),
            message.recipients().len(),
            self.server,
            self.port
        );

        if self.engine.session_submit(&mut self.native, message.native()) {
            internal!(
                level = DEBUG,
                "message from {} accepted by {}",
                message.originator(),
                self.server
            );
            return Ok(());
        }

        let err = self.engine_error();
        incoming!(
            level = WARN,
            "message from {} rejected by {}: {err}",
            message.originator(),
            self.server
        );

        Err(err)
    }

    /// The most recent failure on this connection, if any. A failed connect
    /// stays visible once nothing newer is pending.
    #[must_use]
    pub fn last_error(&self) -> Option<Error> {
        if let Some(err) = &self.local_error {
            return Some(err.clone());
        }

        let raw = self.engine.session_last_error(&self.native);
        (!raw.is_empty())
            .then(|| Error::from_engine(Subject::Connection, raw.code, raw.message))
            .or_else(|| self.connect_error.clone())
    }

    fn local(&mut self, err: Error) -> Error {
        internal!(level = DEBUG, "{err}");
        self.local_error = Some(err.clone());
        err
    }

    fn engine_error(&self) -> Error {
        let raw = self.engine.session_last_error(&self.native);
        Error::from_engine(Subject::Connection, raw.code, raw.message)
    }
}

impl<E: Engine> Drop for Connection<E> {
    fn drop(&mut self) {
        internal!("closing session with {}:{}", self.server, self.port);
        self.engine.session_free(&mut self.native);
    }
}

impl<E: Engine> Debug for Connection<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("credentials", &self.credentials)
            .field("connected", &self.connected)
            .field("connect_error", &self.connect_error)
            .finish_non_exhaustive()
    }
}
