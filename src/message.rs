use core::fmt::{self, Debug, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    engine::Engine,
    error::{check_text, Error, ErrorKind, Result, Subject},
    incoming, internal, outgoing,
    recipient::{Bound, Recipient},
};

/// What a bounce for this message carries back to the originator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnType {
    Headers,
    Full,
}

impl ReturnType {
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Headers),
            1 => Some(Self::Full),
            _ => None,
        }
    }

    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Headers => 0,
            Self::Full => 1,
        }
    }
}

/// Content transfer encoding the engine applies to the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    #[serde(rename = "7bit")]
    SevenBit,
    #[serde(rename = "8bit")]
    EightBit,
    #[serde(rename = "base64")]
    Base64,
}

impl Encoding {
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::SevenBit),
            1 => Some(Self::EightBit),
            2 => Some(Self::Base64),
            _ => None,
        }
    }

    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::SevenBit => 0,
            Self::EightBit => 1,
            Self::Base64 => 2,
        }
    }
}

impl Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SevenBit => "7bit",
            Self::EightBit => "8bit",
            Self::Base64 => "base64",
        })
    }
}

/// A piece of body content, in the order it was handed to the engine.
#[derive(Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Vec<u8>),
    Merge(Vec<u8>),
    DateHeader,
}

impl Chunk {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Data(data) | Self::Merge(data) => data.len(),
            Self::DateHeader => 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(data) => write!(f, "Data({} bytes)", data.len()),
            Self::Merge(data) => write!(f, "Merge({} bytes)", data.len()),
            Self::DateHeader => f.write_str("DateHeader"),
        }
    }
}

/// A body part. Content added before the first
/// [`Message::begin_part`] lands in part `0`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    pub number: u32,
    pub chunks: Vec<Chunk>,
}

/// A recipient the engine refused to bind, handed back still mutable.
#[derive(thiserror::Error)]
#[error("{error}")]
pub struct Rejected<E: Engine> {
    pub recipient: Recipient<E>,
    #[source]
    pub error: Error,
}

impl<E: Engine> Debug for Rejected<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("recipient", &self.recipient)
            .field("error", &self.error)
            .finish()
    }
}

impl<E: Engine> From<Rejected<E>> for Error {
    fn from(rejected: Rejected<E>) -> Self {
        rejected.error
    }
}

/// An outbound message under construction.
pub struct Message<E: Engine> {
    engine: Arc<E>,
    native: E::Message,
    originator: String,
    ready: bool,
    verp: Option<bool>,
    return_type: Option<ReturnType>,
    envelope_id: Option<String>,
    virtual_mta: Option<String>,
    job_id: Option<String>,
    encoding: Option<Encoding>,
    parts: Vec<Part>,
    recipients: Vec<Recipient<E>>,
    init_error: Option<Error>,
    local_error: Option<Error>,
}

impl<E: Engine> Message<E> {
    /// Allocate a message and initialise it with its originator.
    ///
    /// If the engine rejects the originator the message is still returned,
    /// but [`Self::is_ready`] is `false` and it cannot be submitted.
    ///
    /// # Errors
    /// Only if the engine cannot allocate a native message.
    pub fn new(engine: &Arc<E>, originator: &str) -> Result<Self> {
        let native = engine
            .message_alloc()
            .ok_or_else(|| Error::allocation(Subject::Message))?;

        let mut message = Self {
            engine: Arc::clone(engine),
            native,
            originator: originator.to_owned(),
            ready: false,
            verp: None,
            return_type: None,
            envelope_id: None,
            virtual_mta: None,
            job_id: None,
            encoding: None,
            parts: Vec::default(),
            recipients: Vec::default(),
            init_error: None,
            local_error: None,
        };

        let init = message.text("originator", originator).and_then(|()| {
            message.call("init", |engine, native| engine.message_init(native, originator))
        });

        match init {
            Ok(()) => message.ready = true,
            Err(err) => message.init_error = Some(err),
        }

        internal!("message from {originator} created (ready = {})", message.ready);

        Ok(message)
    }

    #[must_use]
    pub fn originator(&self) -> &str {
        &self.originator
    }

    /// Returns `true` if the engine accepted the originator.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    #[must_use]
    pub const fn verp(&self) -> Option<bool> {
        self.verp
    }

    #[must_use]
    pub const fn return_type(&self) -> Option<ReturnType> {
        self.return_type
    }

    #[must_use]
    pub fn envelope_id(&self) -> Option<&str> {
        self.envelope_id.as_deref()
    }

    #[must_use]
    pub fn virtual_mta(&self) -> Option<&str> {
        self.virtual_mta.as_deref()
    }

    #[must_use]
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    #[must_use]
    pub const fn encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    #[must_use]
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Total number of body bytes handed to the engine.
    #[must_use]
    pub fn body_len(&self) -> usize {
        self.parts
            .iter()
            .flat_map(|part| &part.chunks)
            .map(Chunk::len)
            .sum()
    }

    /// Recipients bound to this message, in binding order. All are frozen.
    #[must_use]
    pub fn recipients(&self) -> &[Recipient<E>] {
        &self.recipients
    }

    /// A bound recipient. It can be inspected, but every mutator fails with
    /// [`ErrorKind::LockedObject`].
    pub fn recipient_mut(&mut self, index: usize) -> Option<Bound<'_, E>> {
        self.recipients.get_mut(index).map(Bound::new)
    }

    /// # Errors
    /// The engine's error if it rejects the flag.
    pub fn set_verp(&mut self, verp: bool) -> Result<()> {
        self.call("set verp", |engine, native| engine.message_set_verp(native, verp))?;
        self.verp = Some(verp);
        Ok(())
    }

    /// # Errors
    /// The engine's error if it rejects the return type.
    pub fn set_return_type(&mut self, return_type: ReturnType) -> Result<()> {
        self.call("set return type", |engine, native| {
            engine.message_set_return_type(native, return_type)
        })?;
        self.return_type = Some(return_type);
        Ok(())
    }

    /// # Errors
    /// [`ErrorKind::IllegalArgument`] for values containing NUL bytes, or the
    /// engine's error.
    pub fn set_envelope_id(&mut self, envelope_id: &str) -> Result<()> {
        self.text("envelope id", envelope_id)?;
        self.call("set envelope id", |engine, native| {
            engine.message_set_envelope_id(native, envelope_id)
        })?;
        self.envelope_id = Some(envelope_id.to_owned());
        Ok(())
    }

    /// # Errors
    /// [`ErrorKind::IllegalArgument`] for values containing NUL bytes, or the
    /// engine's error.
    pub fn set_virtual_mta(&mut self, virtual_mta: &str) -> Result<()> {
        self.text("virtual mta", virtual_mta)?;
        self.call("set virtual mta", |engine, native| {
            engine.message_set_virtual_mta(native, virtual_mta)
        })?;
        self.virtual_mta = Some(virtual_mta.to_owned());
        Ok(())
    }

    /// # Errors
    /// [`ErrorKind::IllegalArgument`] for values containing NUL bytes, or the
    /// engine's error.
    pub fn set_job_id(&mut self, job_id: &str) -> Result<()> {
        self.text("job id", job_id)?;
        self.call("set job id", |engine, native| {
            engine.message_set_job_id(native, job_id)
        })?;
        self.job_id = Some(job_id.to_owned());
        Ok(())
    }

    /// # Errors
    /// The engine's error if it rejects the encoding.
    pub fn set_encoding(&mut self, encoding: Encoding) -> Result<()> {
        self.call("set encoding", |engine, native| {
            engine.message_set_encoding(native, encoding)
        })?;
        self.encoding = Some(encoding);
        Ok(())
    }

    /// Start a new MIME part.
    ///
    /// # Errors
    /// The engine's error if it rejects the part number.
    pub fn begin_part(&mut self, number: u32) -> Result<()> {
        self.call("begin part", |engine, native| {
            engine.message_begin_part(native, number)
        })?;
        self.parts.push(Part {
            number,
            chunks: Vec::default(),
        });
        Ok(())
    }

    /// Append literal body bytes to the current part. Any byte value is
    /// valid, NUL included.
    ///
    /// # Errors
    /// The engine's error if it rejects the data.
    pub fn add_data(&mut self, data: &[u8]) -> Result<()> {
        self.call("add data", |engine, native| engine.message_add_data(native, data))?;
        self.push(Chunk::Data(data.to_vec()));
        Ok(())
    }

    /// Append merge template bytes to the current part.
    ///
    /// # Errors
    /// The engine's error if it rejects the data.
    pub fn add_merge_data(&mut self, data: &[u8]) -> Result<()> {
        self.call("add merge data", |engine, native| {
            engine.message_add_merge_data(native, data)
        })?;
        self.push(Chunk::Merge(data.to_vec()));
        Ok(())
    }

    /// Have the engine stamp a `Date:` header.
    ///
    /// # Errors
    /// The engine's error if it refuses.
    pub fn add_date_header(&mut self) -> Result<()> {
        self.call("add date header", |engine, native| {
            engine.message_add_date_header(native)
        })?;
        self.push(Chunk::DateHeader);
        Ok(())
    }

    /// Bind a recipient to this message.
    ///
    /// The recipient moves into the message. On success its native object is
    /// handed to the engine, the recipient is frozen and a [`Bound`] view of it
    /// is returned. On failure it is handed back, unchanged and still mutable,
    /// inside [`Rejected`].
    ///
    /// # Errors
    /// The engine's error, [`ErrorKind::IllegalArgument`] for a recipient
    /// created through a different engine instance, or
    /// [`ErrorKind::LockedObject`] for a recipient that is already bound.
    pub fn add_recipient(
        &mut self,
        mut recipient: Recipient<E>,
    ) -> Result<Bound<'_, E>, Rejected<E>> {
        if !Arc::ptr_eq(&self.engine, &recipient.engine) {
            let error = Error::new(
                Subject::Message,
                ErrorKind::IllegalArgument,
                "recipient belongs to a different engine",
            );
            self.local_error = Some(error.clone());
            return Err(Rejected { recipient, error });
        }

        let native = match recipient.take_native() {
            Ok(native) => native,
            Err(error) => {
                self.local_error = Some(error.clone());
                return Err(Rejected { recipient, error });
            }
        };

        self.local_error = None;
        outgoing!(
            "message from {}: add recipient {}",
            self.originator,
            recipient.address()
        );

        match self.engine.message_add_recipient(&mut self.native, native) {
            Ok(()) => {
                recipient.freeze();
                let index = self.recipients.len();
                self.recipients.push(recipient);
                Ok(Bound::new(&mut self.recipients[index]))
            }
            Err(native) => {
                recipient.restore_native(native);
                let error = self.engine_error();
                incoming!(
                    level = DEBUG,
                    "message from {}: recipient {} rejected: {error}",
                    self.originator,
                    recipient.address()
                );
                Err(Rejected { recipient, error })
            }
        }
    }

    /// The most recent failure on this message, if any. A message that never
    /// initialised keeps reporting why once nothing newer is pending.
    #[must_use]
    pub fn last_error(&self) -> Option<Error> {
        if let Some(err) = &self.local_error {
            return Some(err.clone());
        }

        let raw = self.engine.message_last_error(&self.native);
        (!raw.is_empty())
            .then(|| Error::from_engine(Subject::Message, raw.code, raw.message))
            .or_else(|| self.init_error.clone())
    }

    pub(crate) const fn native(&self) -> &E::Message {
        &self.native
    }

    pub(crate) const fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    fn push(&mut self, chunk: Chunk) {
        if self.parts.is_empty() {
            self.parts.push(Part::default());
        }

        if let Some(part) = self.parts.last_mut() {
            part.chunks.push(chunk);
        }
    }

    fn text(&mut self, field: &str, value: &str) -> Result<()> {
        check_text(Subject::Message, field, value).inspect_err(|err| {
            self.local_error = Some(err.clone());
        })
    }

    fn engine_error(&self) -> Error {
        let raw = self.engine.message_last_error(&self.native);
        Error::from_engine(Subject::Message, raw.code, raw.message)
    }

    fn call(
        &mut self,
        operation: &str,
        f: impl FnOnce(&E, &mut E::Message) -> bool,
    ) -> Result<()> {
        self.local_error = None;
        outgoing!("message from {}: {operation}", self.originator);

        if f(self.engine.as_ref(), &mut self.native) {
            return Ok(());
        }

        let err = self.engine_error();
        incoming!(
            level = DEBUG,
            "message from {}: {operation} rejected: {err}",
            self.originator
        );

        Err(err)
    }
}

impl<E: Engine> Drop for Message<E> {
    fn drop(&mut self) {
        internal!(
            "releasing message from {} with {} recipient(s)",
            self.originator,
            self.recipients.len()
        );
        self.engine.message_free(&mut self.native);
    }
}

impl<E: Engine> Debug for Message<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("originator", &self.originator)
            .field("ready", &self.ready)
            .field("verp", &self.verp)
            .field("return_type", &self.return_type)
            .field("envelope_id", &self.envelope_id)
            .field("virtual_mta", &self.virtual_mta)
            .field("job_id", &self.job_id)
            .field("encoding", &self.encoding)
            .field("parts", &self.parts)
            .field("recipients", &self.recipients)
            .finish_non_exhaustive()
    }
}
