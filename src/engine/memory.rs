//! An in-process engine that records everything it is asked to do.
//!
//! [`MemoryEngine`] validates its inputs the way the vendor engine does
//! (addresses, notification masks, connect and submit preconditions), keeps a
//! journal of every call that reached it, and tracks every object it handed
//! out so that leaks and double frees are visible. Individual calls can be
//! scripted to fail with [`MemoryEngine::fail_next`].

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use super::{Engine, RawError};
use crate::{
    error::ErrorKind,
    message::{Encoding, ReturnType},
    recipient::Notify,
};

/// Every entry point of the engine, as recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    SessionAlloc,
    Connect,
    ConnectAuth,
    Submit,
    SessionFree,
    MessageAlloc,
    MessageInit,
    SetVerp,
    SetReturnType,
    SetEnvelopeId,
    SetVirtualMta,
    SetJobId,
    SetEncoding,
    BeginPart,
    AddData,
    AddMergeData,
    AddDateHeader,
    AddRecipient,
    MessageFree,
    RecipientAlloc,
    RecipientInit,
    SetNotify,
    DefineVariable,
    RecipientFree,
}

/// A journaled call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    /// Id of the object the call was made on, `0` for allocations that failed.
    pub target: u64,
    pub argument: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct MemorySession(u64);

#[derive(Debug, PartialEq, Eq)]
pub struct MemoryMessage(u64);

#[derive(Debug, PartialEq, Eq)]
pub struct MemoryRecipient(u64);

macro_rules! impl_id {
    ($($handle:ident),*) => {
        $(
            impl $handle {
                #[must_use]
                pub const fn id(&self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

impl_id!(MemorySession, MemoryMessage, MemoryRecipient);

/// A recipient as it was bound at submission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub address: String,
    pub notify: Notify,
    pub variables: HashMap<String, String>,
}

/// A message accepted by [`Engine::session_submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub originator: String,
    pub envelope_id: Option<String>,
    pub virtual_mta: Option<String>,
    pub job_id: Option<String>,
    pub verp: bool,
    pub return_type: Option<ReturnType>,
    pub encoding: Option<Encoding>,
    pub date_header: bool,
    /// Part numbers started with `begin_part`, in order.
    pub parts: Vec<u32>,
    /// Literal and merge data, concatenated in the order it was added.
    pub body: Vec<u8>,
    pub recipients: Vec<Delivery>,
}

#[derive(Debug, Default)]
struct SessionState {
    endpoint: Option<(String, u16, Option<String>)>,
    last_error: RawError,
}

#[derive(Debug, Default)]
struct MessageState {
    originator: Option<String>,
    envelope_id: Option<String>,
    virtual_mta: Option<String>,
    job_id: Option<String>,
    verp: bool,
    return_type: Option<ReturnType>,
    encoding: Option<Encoding>,
    date_header: bool,
    parts: Vec<u32>,
    body: Vec<u8>,
    recipients: Vec<u64>,
    submitted: bool,
    last_error: RawError,
}

#[derive(Debug, Default)]
struct RecipientState {
    address: Option<String>,
    notify: Notify,
    variables: HashMap<String, String>,
    last_error: RawError,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    sessions: HashMap<u64, SessionState>,
    messages: HashMap<u64, MessageState>,
    recipients: HashMap<u64, RecipientState>,
    journal: Vec<Call>,
    scripted: HashMap<Op, RawError>,
    unreachable: HashSet<String>,
    accounts: HashMap<String, String>,
    submissions: Vec<Submission>,
}

impl State {
    fn record(&mut self, op: Op, target: u64, argument: Option<String>) {
        self.journal.push(Call {
            op,
            target,
            argument,
        });
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn scripted(&mut self, op: Op) -> Option<RawError> {
        self.scripted.remove(&op)
    }

    fn session(&mut self, id: u64) -> &mut SessionState {
        self.sessions
            .get_mut(&id)
            .unwrap_or_else(|| panic!("session {id} used after it was freed"))
    }

    fn message(&mut self, id: u64) -> &mut MessageState {
        self.messages
            .get_mut(&id)
            .unwrap_or_else(|| panic!("message {id} used after it was freed"))
    }

    fn recipient(&mut self, id: u64) -> &mut RecipientState {
        self.recipients
            .get_mut(&id)
            .unwrap_or_else(|| panic!("recipient {id} used after it was freed"))
    }
}

fn error(kind: ErrorKind, message: impl Into<String>) -> RawError {
    RawError::new(kind.code(), message)
}

fn is_address(address: &str) -> bool {
    address
        .split_once('@')
        .is_some_and(|(local, domain)| {
            !local.is_empty() && !domain.is_empty() && !domain.contains('@')
        })
}

/// Settle a call: store the outcome as the object's last error.
fn settle(last_error: &mut RawError, outcome: Result<(), RawError>) -> bool {
    match outcome {
        Ok(()) => {
            *last_error = RawError::default();
            true
        }
        Err(err) => {
            *last_error = err;
            false
        }
    }
}

/// A scriptable, recording [`Engine`].
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Mutex<State>,
}

impl MemoryEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections to `host` with an I/O error.
    #[must_use]
    pub fn with_unreachable_host(self, host: &str) -> Self {
        self.lock().unreachable.insert(host.to_owned());
        self
    }

    /// Register an account for authenticated connects. Once any account is
    /// registered, unknown users and wrong passwords fail with a security
    /// error; without accounts every login is accepted.
    #[must_use]
    pub fn with_account(self, username: &str, password: &str) -> Self {
        self.lock()
            .accounts
            .insert(username.to_owned(), password.to_owned());
        self
    }

    /// Make the next call to `op` fail with `kind` and `message`.
    ///
    /// For the allocation ops the call returns no object instead.
    pub fn fail_next(&self, op: Op, kind: ErrorKind, message: &str) {
        self.lock().scripted.insert(op, error(kind, message));
    }

    /// The full call journal.
    #[must_use]
    pub fn journal(&self) -> Vec<Call> {
        self.lock().journal.clone()
    }

    /// Number of calls to `op` that reached the engine.
    #[must_use]
    pub fn count(&self, op: Op) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|call| call.op == op)
            .count()
    }

    /// Number of objects allocated and not yet freed.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        let state = self.lock();
        state.sessions.len() + state.messages.len() + state.recipients.len()
    }

    /// Messages accepted so far, in submission order.
    #[must_use]
    pub fn submissions(&self) -> Vec<Submission> {
        self.lock().submissions.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn alloc(&self, op: Op, insert: impl FnOnce(&mut State, u64)) -> Option<u64> {
        let mut state = self.lock();
        if state.scripted(op).is_some() {
            state.record(op, 0, None);
            return None;
        }

        let id = state.next_id();
        insert(&mut *state, id);
        state.record(op, id, None);
        Some(id)
    }

    fn on_message(
        &self,
        op: Op,
        message: &MemoryMessage,
        argument: Option<String>,
        f: impl FnOnce(&mut MessageState) -> Result<(), RawError>,
    ) -> bool {
        let mut state = self.lock();
        state.record(op, message.0, argument);
        let scripted = state.scripted(op);

        let target = state.message(message.0);
        let outcome = match scripted {
            Some(err) => Err(err),
            None if target.submitted => Err(error(
                ErrorKind::IllegalState,
                "message has already been submitted",
            )),
            None => f(target),
        };

        settle(&mut target.last_error, outcome)
    }

    fn on_recipient(
        &self,
        op: Op,
        recipient: &MemoryRecipient,
        argument: Option<String>,
        f: impl FnOnce(&mut RecipientState) -> Result<(), RawError>,
    ) -> bool {
        let mut state = self.lock();
        state.record(op, recipient.0, argument);
        let scripted = state.scripted(op);

        let target = state.recipient(recipient.0);
        let outcome = match scripted {
            Some(err) => Err(err),
            None => f(target),
        };

        settle(&mut target.last_error, outcome)
    }

    fn connect(
        &self,
        op: Op,
        session: &MemorySession,
        server: &str,
        port: u16,
        credentials: Option<(&str, &str)>,
    ) -> bool {
        let mut state = self.lock();
        state.record(
            op,
            session.0,
            Some(match credentials {
                Some((username, _)) => format!("{username}@{server}:{port}"),
                None => format!("{server}:{port}"),
            }),
        );

        let scripted = state.scripted(op);
        let unreachable = state.unreachable.contains(server);
        let login = credentials.map(|(username, password)| {
            state.accounts.is_empty()
                || state
                    .accounts
                    .get(username)
                    .is_some_and(|expected| expected == password)
        });

        let target = state.session(session.0);
        let outcome = if let Some(err) = scripted {
            Err(err)
        } else if target.endpoint.is_some() {
            Err(error(ErrorKind::IllegalState, "session is already connected"))
        } else if server.is_empty() || port == 0 || unreachable {
            Err(error(
                ErrorKind::Io,
                format!("unable to connect to {server}:{port}"),
            ))
        } else if login == Some(false) {
            Err(error(ErrorKind::Security, "authentication failed"))
        } else {
            target.endpoint = Some((
                server.to_owned(),
                port,
                credentials.map(|(username, _)| username.to_owned()),
            ));
            Ok(())
        };

        settle(&mut target.last_error, outcome)
    }
}

impl Engine for MemoryEngine {
    type Session = MemorySession;
    type Message = MemoryMessage;
    type Recipient = MemoryRecipient;

    fn session_alloc(&self) -> Option<Self::Session> {
        self.alloc(Op::SessionAlloc, |state, id| {
            state.sessions.insert(id, SessionState::default());
        })
        .map(MemorySession)
    }

    fn session_connect(&self, session: &mut Self::Session, server: &str, port: u16) -> bool {
        self.connect(Op::Connect, session, server, port, None)
    }

    fn session_connect_auth(
        &self,
        session: &mut Self::Session,
        server: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> bool {
        self.connect(
            Op::ConnectAuth,
            session,
            server,
            port,
            Some((username, password)),
        )
    }

    fn session_submit(&self, session: &mut Self::Session, message: &Self::Message) -> bool {
        let mut state = self.lock();
        state.record(Op::Submit, session.0, Some(message.0.to_string()));
        let scripted = state.scripted(Op::Submit);

        let endpoint = state.session(session.0).endpoint.clone();
        let outcome = match (scripted, endpoint) {
            (Some(err), _) => Err(err),
            (None, None) => Err(error(ErrorKind::IllegalState, "session is not connected")),
            (None, Some(endpoint)) => accept(&mut *state, endpoint, message.0),
        };

        settle(&mut state.session(session.0).last_error, outcome)
    }

    fn session_last_error(&self, session: &Self::Session) -> RawError {
        self.lock().session(session.0).last_error.clone()
    }

    fn session_free(&self, session: &mut Self::Session) {
        let mut state = self.lock();
        state.record(Op::SessionFree, session.0, None);
        assert!(
            state.sessions.remove(&session.0).is_some(),
            "session {} freed twice",
            session.0
        );
    }

    fn message_alloc(&self) -> Option<Self::Message> {
        self.alloc(Op::MessageAlloc, |state, id| {
            state.messages.insert(id, MessageState::default());
        })
        .map(MemoryMessage)
    }

    fn message_init(&self, message: &mut Self::Message, originator: &str) -> bool {
        self.on_message(
            Op::MessageInit,
            message,
            Some(originator.to_owned()),
            |target| {
                if target.originator.is_some() {
                    Err(error(ErrorKind::IllegalState, "message already initialised"))
                } else if is_address(originator) {
                    target.originator = Some(originator.to_owned());
                    Ok(())
                } else {
                    Err(error(
                        ErrorKind::EmailAddress,
                        format!("invalid originator address '{originator}'"),
                    ))
                }
            },
        )
    }

    fn message_set_verp(&self, message: &mut Self::Message, verp: bool) -> bool {
        self.on_message(Op::SetVerp, message, Some(verp.to_string()), |target| {
            target.verp = verp;
            Ok(())
        })
    }

    fn message_set_return_type(
        &self,
        message: &mut Self::Message,
        return_type: ReturnType,
    ) -> bool {
        self.on_message(
            Op::SetReturnType,
            message,
            Some(format!("{return_type:?}")),
            |target| {
                target.return_type = Some(return_type);
                Ok(())
            },
        )
    }

    fn message_set_envelope_id(&self, message: &mut Self::Message, envelope_id: &str) -> bool {
        self.on_message(
            Op::SetEnvelopeId,
            message,
            Some(envelope_id.to_owned()),
            |target| {
                target.envelope_id = Some(envelope_id.to_owned());
                Ok(())
            },
        )
    }

    fn message_set_virtual_mta(&self, message: &mut Self::Message, virtual_mta: &str) -> bool {
        self.on_message(
            Op::SetVirtualMta,
            message,
            Some(virtual_mta.to_owned()),
            |target| {
                target.virtual_mta = Some(virtual_mta.to_owned());
                Ok(())
            },
        )
    }

    fn message_set_job_id(&self, message: &mut Self::Message, job_id: &str) -> bool {
        self.on_message(Op::SetJobId, message, Some(job_id.to_owned()), |target| {
            target.job_id = Some(job_id.to_owned());
            Ok(())
        })
    }

    fn message_set_encoding(&self, message: &mut Self::Message, encoding: Encoding) -> bool {
        self.on_message(
            Op::SetEncoding,
            message,
            Some(encoding.to_string()),
            |target| {
                target.encoding = Some(encoding);
                Ok(())
            },
        )
    }

    fn message_begin_part(&self, message: &mut Self::Message, part: u32) -> bool {
        self.on_message(Op::BeginPart, message, Some(part.to_string()), |target| {
            if part == 0 {
                return Err(error(
                    ErrorKind::IllegalArgument,
                    "part numbers start at 1",
                ));
            }

            target.parts.push(part);
            Ok(())
        })
    }

    fn message_add_data(&self, message: &mut Self::Message, data: &[u8]) -> bool {
        self.on_message(Op::AddData, message, Some(data.len().to_string()), |target| {
            target.body.extend_from_slice(data);
            Ok(())
        })
    }

    fn message_add_merge_data(&self, message: &mut Self::Message, data: &[u8]) -> bool {
        self.on_message(
            Op::AddMergeData,
            message,
            Some(data.len().to_string()),
            |target| {
                target.body.extend_from_slice(data);
                Ok(())
            },
        )
    }

    fn message_add_date_header(&self, message: &mut Self::Message) -> bool {
        self.on_message(Op::AddDateHeader, message, None, |target| {
            target.date_header = true;
            Ok(())
        })
    }

    fn message_add_recipient(
        &self,
        message: &mut Self::Message,
        recipient: Self::Recipient,
    ) -> Result<(), Self::Recipient> {
        let mut state = self.lock();
        state.record(Op::AddRecipient, message.0, Some(recipient.0.to_string()));
        let scripted = state.scripted(Op::AddRecipient);
        let initialised = state.recipient(recipient.0).address.is_some();

        let target = state.message(message.0);
        let outcome = if let Some(err) = scripted {
            Err(err)
        } else if target.submitted {
            Err(error(
                ErrorKind::IllegalState,
                "message has already been submitted",
            ))
        } else if !initialised {
            Err(error(
                ErrorKind::IllegalState,
                "recipient has not been initialised",
            ))
        } else {
            target.recipients.push(recipient.0);
            Ok(())
        };

        if settle(&mut target.last_error, outcome) {
            Ok(())
        } else {
            Err(recipient)
        }
    }

    fn message_last_error(&self, message: &Self::Message) -> RawError {
        self.lock().message(message.0).last_error.clone()
    }

    fn message_free(&self, message: &mut Self::Message) {
        let mut state = self.lock();
        state.record(Op::MessageFree, message.0, None);

        let Some(freed) = state.messages.remove(&message.0) else {
            panic!("message {} freed twice", message.0);
        };

        for id in freed.recipients {
            state.recipients.remove(&id);
        }
    }

    fn recipient_alloc(&self) -> Option<Self::Recipient> {
        self.alloc(Op::RecipientAlloc, |state, id| {
            state.recipients.insert(id, RecipientState::default());
        })
        .map(MemoryRecipient)
    }

    fn recipient_init(&self, recipient: &mut Self::Recipient, address: &str) -> bool {
        self.on_recipient(
            Op::RecipientInit,
            recipient,
            Some(address.to_owned()),
            |target| {
                if target.address.is_some() {
                    Err(error(
                        ErrorKind::IllegalState,
                        "recipient already initialised",
                    ))
                } else if is_address(address) {
                    target.address = Some(address.to_owned());
                    Ok(())
                } else {
                    Err(error(
                        ErrorKind::EmailAddress,
                        format!("invalid recipient address '{address}'"),
                    ))
                }
            },
        )
    }

    fn recipient_set_notify(&self, recipient: &mut Self::Recipient, notify: Notify) -> bool {
        self.on_recipient(
            Op::SetNotify,
            recipient,
            Some(notify.to_string()),
            |target| {
                if notify.bits() & !Notify::ALWAYS.bits() != 0 {
                    return Err(error(
                        ErrorKind::IllegalArgument,
                        format!("invalid notification mask {:#x}", notify.bits()),
                    ));
                }

                target.notify = notify;
                Ok(())
            },
        )
    }

    fn recipient_define_variable(
        &self,
        recipient: &mut Self::Recipient,
        name: &str,
        value: &str,
    ) -> bool {
        self.on_recipient(
            Op::DefineVariable,
            recipient,
            Some(format!("{name}={value}")),
            |target| {
                if name.is_empty() {
                    return Err(error(
                        ErrorKind::IllegalArgument,
                        "variable name must not be empty",
                    ));
                }

                target.variables.insert(name.to_owned(), value.to_owned());
                Ok(())
            },
        )
    }

    fn recipient_last_error(&self, recipient: &Self::Recipient) -> RawError {
        self.lock().recipient(recipient.0).last_error.clone()
    }

    fn recipient_free(&self, recipient: &mut Self::Recipient) {
        let mut state = self.lock();
        state.record(Op::RecipientFree, recipient.0, None);
        assert!(
            state.recipients.remove(&recipient.0).is_some(),
            "recipient {} freed twice",
            recipient.0
        );
    }
}

/// Validate a message for submission and record it.
fn accept(
    state: &mut State,
    (server, port, username): (String, u16, Option<String>),
    message: u64,
) -> Result<(), RawError> {
    let target = state.message(message);
    if target.submitted {
        return Err(error(
            ErrorKind::IllegalState,
            "message has already been submitted",
        ));
    }

    let Some(originator) = target.originator.clone() else {
        return Err(error(ErrorKind::IllegalState, "message has no originator"));
    };

    if target.recipients.is_empty() {
        return Err(error(ErrorKind::IllegalState, "message has no recipients"));
    }

    target.submitted = true;
    let ids = target.recipients.clone();
    let mut submission = Submission {
        server,
        port,
        username,
        originator,
        envelope_id: target.envelope_id.clone(),
        virtual_mta: target.virtual_mta.clone(),
        job_id: target.job_id.clone(),
        verp: target.verp,
        return_type: target.return_type,
        encoding: target.encoding,
        date_header: target.date_header,
        parts: target.parts.clone(),
        body: target.body.clone(),
        recipients: Vec::with_capacity(ids.len()),
    };

    for id in ids {
        let recipient = state.recipient(id);
        submission.recipients.push(Delivery {
            address: recipient.address.clone().unwrap_or_default(),
            notify: recipient.notify,
            variables: recipient.variables.clone(),
        });
    }

    state.submissions.push(submission);
    Ok(())
}
