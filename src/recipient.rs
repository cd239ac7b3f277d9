use core::fmt::{self, Debug, Display};
use std::{
    collections::HashMap,
    ops::{BitOr, Deref},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    engine::Engine,
    error::{check_text, Error, Result, Subject},
    incoming, internal, outgoing,
};

/// Delivery status notification events for a recipient.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Notify(u32);

impl Notify {
    pub const NEVER: Self = Self(0);
    pub const SUCCESS: Self = Self(1);
    pub const FAILURE: Self = Self(2);
    pub const DELAY: Self = Self(4);
    pub const ALWAYS: Self = Self(1 | 2 | 4);

    /// Wrap a raw mask as received from a host, without validating it.
    /// The engine decides whether unknown bits are acceptable.
    #[must_use]
    pub const fn from_bits_retain(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_never(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Notify {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl Debug for Notify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Notify({self})")
    }
}

impl Display for Notify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            return f.write_str("NEVER");
        }

        let names = [
            (Self::SUCCESS, "SUCCESS"),
            (Self::FAILURE, "FAILURE"),
            (Self::DELAY, "DELAY"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect::<Vec<_>>();

        let unknown = self.0 & !Self::ALWAYS.0;
        if unknown == 0 {
            f.write_str(&names.join(","))
        } else if names.is_empty() {
            write!(f, "{unknown:#x}")
        } else {
            write!(f, "{},{unknown:#x}", names.join(","))
        }
    }
}

/// One intended recipient of a message.
///
/// A recipient is mutable until it is moved into a message with
/// [`Message::add_recipient`](crate::Message::add_recipient). From then on it
/// no longer holds a native object, and every mutator fails with
/// [`ErrorKind::LockedObject`](crate::ErrorKind::LockedObject).
pub struct Recipient<E: Engine> {
    pub(crate) engine: Arc<E>,
    native: Option<E::Recipient>,
    address: String,
    notify: Notify,
    variables: HashMap<String, String>,
    ready: bool,
    init_error: Option<Error>,
    local_error: Option<Error>,
}

impl<E: Engine> Recipient<E> {
    /// Allocate and initialise a recipient.
    ///
    /// A rejected address still yields a recipient; [`Self::is_ready`] is
    /// `false` and [`Self::last_error`] holds the reason.
    ///
    /// # Errors
    /// Only if the engine cannot allocate a native recipient.
    pub fn new(engine: &Arc<E>, address: &str) -> Result<Self> {
        let native = engine
            .recipient_alloc()
            .ok_or_else(|| Error::allocation(Subject::Recipient))?;

        let mut recipient = Self {
            engine: Arc::clone(engine),
            native: Some(native),
            address: address.to_owned(),
            notify: Notify::NEVER,
            variables: HashMap::default(),
            ready: false,
            init_error: None,
            local_error: None,
        };

        let init = check_text(Subject::Recipient, "address", address)
            .inspect_err(|err| recipient.local_error = Some(err.clone()))
            .and_then(|()| {
                recipient.call("init", |engine, native| engine.recipient_init(native, address))
            });

        match init {
            Ok(()) => recipient.ready = true,
            Err(err) => recipient.init_error = Some(err),
        }

        Ok(recipient)
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub const fn notify(&self) -> Notify {
        self.notify
    }

    #[must_use]
    pub const fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// Returns `true` if the engine accepted the address.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    /// Returns `true` once the recipient is bound to a message.
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.native.is_none()
    }

    /// # Errors
    /// [`ErrorKind::LockedObject`](crate::ErrorKind::LockedObject) once bound,
    /// or the engine's error if it rejects the mask.
    pub fn set_notify(&mut self, notify: Notify) -> Result<()> {
        self.call("set notify", |engine, native| {
            engine.recipient_set_notify(native, notify)
        })?;

        self.notify = notify;
        Ok(())
    }

    /// Define (or overwrite) a template variable for this recipient.
    ///
    /// # Errors
    /// [`ErrorKind::LockedObject`](crate::ErrorKind::LockedObject) once bound,
    /// [`ErrorKind::IllegalArgument`](crate::ErrorKind::IllegalArgument) for
    /// names or values containing NUL bytes, or the engine's error.
    pub fn define_variable(&mut self, name: &str, value: &str) -> Result<()> {
        if self.is_frozen() {
            return Err(self.locked());
        }

        if let Err(err) = check_text(Subject::Recipient, "variable name", name)
            .and_then(|()| check_text(Subject::Recipient, "variable value", value))
        {
            self.local_error = Some(err.clone());
            return Err(err);
        }

        self.call("define variable", |engine, native| {
            engine.recipient_define_variable(native, name, value)
        })?;

        self.variables.insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    /// The most recent failure on this recipient, if any.
    ///
    /// Failures raised locally take precedence over what the engine last
    /// reported, until the next call reaches the engine. A recipient that
    /// never initialised keeps reporting why once nothing newer is pending.
    #[must_use]
    pub fn last_error(&self) -> Option<Error> {
        if let Some(err) = &self.local_error {
            return Some(err.clone());
        }

        self.native
            .as_ref()
            .map(|native| self.engine.recipient_last_error(native))
            .filter(|raw| !raw.is_empty())
            .map(|raw| Error::from_engine(Subject::Recipient, raw.code, raw.message))
            .or_else(|| self.init_error.clone())
    }

    /// Hand the native object over for binding. Called by
    /// [`Message::add_recipient`](crate::Message::add_recipient) only.
    pub(crate) fn take_native(&mut self) -> Result<E::Recipient> {
        match self.native.take() {
            Some(native) => Ok(native),
            None => Err(self.locked()),
        }
    }

    /// Put the native object back after the engine refused to bind it.
    pub(crate) fn restore_native(&mut self, native: E::Recipient) {
        self.native = Some(native);
    }

    pub(crate) fn freeze(&mut self) {
        self.local_error = None;
        internal!("recipient {} frozen", self.address);
    }

    fn locked(&mut self) -> Error {
        let err = Error::locked(Subject::Recipient);
        internal!(level = WARN, "recipient {}: {err}", self.address);
        self.local_error = Some(err.clone());
        err
    }

    fn call(
        &mut self,
        operation: &str,
        f: impl FnOnce(&E, &mut E::Recipient) -> bool,
    ) -> Result<()> {
        let Some(native) = self.native.as_mut() else {
            return Err(self.locked());
        };

        self.local_error = None;
        outgoing!("recipient {}: {operation}", self.address);

        if f(self.engine.as_ref(), native) {
            return Ok(());
        }

        let raw = self.engine.recipient_last_error(native);
        let err = Error::from_engine(Subject::Recipient, raw.code, raw.message);
        incoming!(level = DEBUG, "recipient {}: {operation} rejected: {err}", self.address);

        Err(err)
    }
}

impl<E: Engine> Drop for Recipient<E> {
    fn drop(&mut self) {
        if let Some(native) = self.native.as_mut() {
            self.engine.recipient_free(native);
        }
    }
}

/// A recipient bound to a message, borrowed from it.
///
/// Reads go through to the [`Recipient`]. The mutators are still offered and
/// fail with [`ErrorKind::LockedObject`](crate::ErrorKind::LockedObject), but
/// the recipient itself can never be moved out of its message or replaced.
pub struct Bound<'a, E: Engine>(&'a mut Recipient<E>);

impl<'a, E: Engine> Bound<'a, E> {
    pub(crate) fn new(recipient: &'a mut Recipient<E>) -> Self {
        Self(recipient)
    }

    /// # Errors
    /// Always [`ErrorKind::LockedObject`](crate::ErrorKind::LockedObject).
    pub fn set_notify(&mut self, notify: Notify) -> Result<()> {
        self.0.set_notify(notify)
    }

    /// # Errors
    /// Always [`ErrorKind::LockedObject`](crate::ErrorKind::LockedObject).
    pub fn define_variable(&mut self, name: &str, value: &str) -> Result<()> {
        self.0.define_variable(name, value)
    }
}

impl<E: Engine> Deref for Bound<'_, E> {
    type Target = Recipient<E>;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl<E: Engine> Debug for Bound<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Bound").field(&self.0).finish()
    }
}

impl<E: Engine> Debug for Recipient<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipient")
            .field("address", &self.address)
            .field("notify", &self.notify)
            .field("variables", &self.variables)
            .field("ready", &self.ready)
            .field("frozen", &self.is_frozen())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::{Notify, Recipient};
    use crate::{
        engine::memory::{MemoryEngine, Op},
        error::ErrorKind,
    };

    #[test]
    fn notify_display() {
        assert_eq!(Notify::NEVER.to_string(), "NEVER");
        assert_eq!(Notify::ALWAYS.to_string(), "SUCCESS,FAILURE,DELAY");
        assert_eq!(
            (Notify::FAILURE | Notify::DELAY).to_string(),
            "FAILURE,DELAY"
        );
        assert_eq!(Notify::from_bits_retain(0x9).to_string(), "SUCCESS,0x8");
    }

    #[test]
    fn notify_contains() {
        assert!(Notify::ALWAYS.contains(Notify::DELAY));
        assert!(!Notify::SUCCESS.contains(Notify::FAILURE));
        assert_eq!(Notify::default(), Notify::NEVER);
    }

    #[test]
    fn defaults() {
        let engine = Arc::new(MemoryEngine::new());
        let recipient = Recipient::new(&engine, "c@d.com").unwrap();

        assert!(recipient.is_ready());
        assert!(!recipient.is_frozen());
        assert_eq!(recipient.address(), "c@d.com");
        assert_eq!(recipient.notify(), Notify::NEVER);
        assert!(recipient.variables().is_empty());
        assert_eq!(recipient.last_error(), None);
    }

    #[test]
    fn rejected_address_keeps_a_usable_handle() {
        let engine = Arc::new(MemoryEngine::new());
        let recipient = Recipient::new(&engine, "not-an-address").unwrap();

        assert!(!recipient.is_ready());
        assert_eq!(
            recipient.last_error().map(|err| err.kind()),
            Some(ErrorKind::EmailAddress)
        );
    }

    #[test]
    fn nul_in_address_never_reaches_the_engine() {
        let engine = Arc::new(MemoryEngine::new());
        let mut recipient = Recipient::new(&engine, "c@d\0.com").unwrap();

        assert!(!recipient.is_ready());
        assert_eq!(engine.count(Op::RecipientInit), 0);
        let init = recipient.last_error().unwrap();
        assert_eq!(init.kind(), ErrorKind::IllegalArgument);

        recipient.set_notify(Notify::FAILURE).unwrap();
        assert_eq!(recipient.last_error(), Some(init));
    }

    #[test]
    fn init_failure_outlives_later_successes() {
        let engine = Arc::new(MemoryEngine::new());
        let mut recipient = Recipient::new(&engine, "not-an-address").unwrap();

        recipient.define_variable("name", "Bob").unwrap();
        assert_eq!(
            recipient.last_error().map(|err| err.kind()),
            Some(ErrorKind::EmailAddress)
        );

        let err = recipient
            .set_notify(Notify::from_bits_retain(0x40))
            .unwrap_err();
        assert_eq!(recipient.last_error(), Some(err));
    }

    #[test]
    fn engine_rejection_leaves_cache_unchanged() {
        let engine = Arc::new(MemoryEngine::new());
        let mut recipient = Recipient::new(&engine, "c@d.com").unwrap();

        recipient.set_notify(Notify::FAILURE).unwrap();
        let err = recipient
            .set_notify(Notify::from_bits_retain(0x40))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
        assert_eq!(recipient.notify(), Notify::FAILURE);

        engine.fail_next(Op::DefineVariable, ErrorKind::Service, "variable store full");
        let err = recipient.define_variable("name", "Bob").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Service);
        assert_eq!(recipient.variable("name"), None);
    }

    #[test]
    fn variables_overwrite() {
        let engine = Arc::new(MemoryEngine::new());
        let mut recipient = Recipient::new(&engine, "c@d.com").unwrap();

        recipient.define_variable("name", "Bob").unwrap();
        recipient.define_variable("name", "Zoë").unwrap();

        assert_eq!(recipient.variable("name"), Some("Zoë"));
        assert_eq!(recipient.variables().len(), 1);
    }

    #[test]
    fn nul_in_variable_never_reaches_the_engine() {
        let engine = Arc::new(MemoryEngine::new());
        let mut recipient = Recipient::new(&engine, "c@d.com").unwrap();

        let err = recipient.define_variable("na\0me", "Bob").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
        assert_eq!(engine.count(Op::DefineVariable), 0);
        assert_eq!(recipient.last_error(), Some(err));
    }

    #[test]
    fn drop_releases_the_native_recipient() {
        let engine = Arc::new(MemoryEngine::new());
        let recipient = Recipient::new(&engine, "c@d.com").unwrap();
        assert_eq!(engine.outstanding(), 1);

        drop(recipient);
        assert_eq!(engine.outstanding(), 0);
        assert_eq!(engine.count(Op::RecipientFree), 1);
    }
}
