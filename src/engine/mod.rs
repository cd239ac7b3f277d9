//! The submission engine the handles delegate to.
//!
//! [`Engine`] is the engine's C API expressed as a trait: every native object
//! kind is an associated type, every entry point reports success as a `bool`,
//! and failure detail is fetched separately through the `*_last_error`
//! functions. The handles in this crate are the only callers; they translate
//! the `bool`s into [`Result`](crate::Result)s and release every object
//! exactly once.

use crate::{
    message::{Encoding, ReturnType},
    recipient::Notify,
};

pub mod memory;
pub mod native;

/// Failure detail as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawError {
    pub code: i32,
    pub message: String,
}

impl RawError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Returns `true` if the engine has nothing to report.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code == 0 && self.message.is_empty()
    }
}

pub trait Engine {
    type Session;
    type Message;
    type Recipient;

    fn session_alloc(&self) -> Option<Self::Session>;
    fn session_connect(&self, session: &mut Self::Session, server: &str, port: u16) -> bool;
    fn session_connect_auth(
        &self,
        session: &mut Self::Session,
        server: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> bool;
    fn session_submit(&self, session: &mut Self::Session, message: &Self::Message) -> bool;
    fn session_last_error(&self, session: &Self::Session) -> RawError;
    fn session_free(&self, session: &mut Self::Session);

    fn message_alloc(&self) -> Option<Self::Message>;
    fn message_init(&self, message: &mut Self::Message, originator: &str) -> bool;
    fn message_set_verp(&self, message: &mut Self::Message, verp: bool) -> bool;
    fn message_set_return_type(&self, message: &mut Self::Message, return_type: ReturnType)
        -> bool;
    fn message_set_envelope_id(&self, message: &mut Self::Message, envelope_id: &str) -> bool;
    fn message_set_virtual_mta(&self, message: &mut Self::Message, virtual_mta: &str) -> bool;
    fn message_set_job_id(&self, message: &mut Self::Message, job_id: &str) -> bool;
    fn message_set_encoding(&self, message: &mut Self::Message, encoding: Encoding) -> bool;
    fn message_begin_part(&self, message: &mut Self::Message, part: u32) -> bool;
    fn message_add_data(&self, message: &mut Self::Message, data: &[u8]) -> bool;
    fn message_add_merge_data(&self, message: &mut Self::Message, data: &[u8]) -> bool;
    fn message_add_date_header(&self, message: &mut Self::Message) -> bool;

    /// Attach a recipient.
    ///
    /// On success the engine owns the recipient object from here on and
    /// releases it together with the message. On failure the object is handed
    /// back untouched.
    fn message_add_recipient(
        &self,
        message: &mut Self::Message,
        recipient: Self::Recipient,
    ) -> Result<(), Self::Recipient>;
    fn message_last_error(&self, message: &Self::Message) -> RawError;
    fn message_free(&self, message: &mut Self::Message);

    fn recipient_alloc(&self) -> Option<Self::Recipient>;
    fn recipient_init(&self, recipient: &mut Self::Recipient, address: &str) -> bool;
    fn recipient_set_notify(&self, recipient: &mut Self::Recipient, notify: Notify) -> bool;
    fn recipient_define_variable(
        &self,
        recipient: &mut Self::Recipient,
        name: &str,
        value: &str,
    ) -> bool;
    fn recipient_last_error(&self, recipient: &Self::Recipient) -> RawError;
    fn recipient_free(&self, recipient: &mut Self::Recipient);
}
