//! The vendor submission engine, loaded from its shared library at runtime.

mod string;

use std::{
    ffi::{c_char, c_int, c_void, CString},
    path::{Path, PathBuf},
    ptr::NonNull,
};

use libc::size_t;
use libloading::Library;
use thiserror::Error;

use self::string::{c_string, from_c};
use super::{Engine, RawError};
use crate::{
    internal,
    message::{Encoding, ReturnType},
    recipient::Notify,
};

type Handle = *mut c_void;
type Bool = c_int;

#[derive(Debug, Error)]
#[error("unable to load submission engine from {}: {source}", path.display())]
pub struct LoadError {
    pub path: PathBuf,
    #[source]
    pub source: libloading::Error,
}

macro_rules! symbols {
    ($($field:ident = $name:literal: fn($($arg:ty),*) $(-> $ret:ty)?;)*) => {
        struct Symbols {
            $($field: unsafe extern "C" fn($($arg),*) $(-> $ret)?,)*
        }

        impl Symbols {
            unsafe fn load(library: &Library) -> Result<Self, libloading::Error> {
                Ok(Self {
                    $(
                        $field: *library.get::<unsafe extern "C" fn($($arg),*) $(-> $ret)?>(
                            concat!($name, "\0").as_bytes(),
                        )?,
                    )*
                })
            }
        }
    };
}

symbols! {
    conn_alloc = "PmtaConnAlloc": fn() -> Handle;
    conn_free = "PmtaConnFree": fn(Handle);
    conn_connect = "PmtaConnConnectRemote": fn(Handle, *const c_char, c_int) -> Bool;
    conn_connect_auth = "PmtaConnConnectRemoteAuth":
        fn(Handle, *const c_char, c_int, *const c_char, *const c_char) -> Bool;
    conn_submit = "PmtaConnSubmit": fn(Handle, Handle) -> Bool;
    conn_last_error = "PmtaConnGetLastError": fn(Handle) -> *const c_char;
    conn_last_error_type = "PmtaConnGetLastErrorType": fn(Handle) -> c_int;

    msg_alloc = "PmtaMsgAlloc": fn() -> Handle;
    msg_free = "PmtaMsgFree": fn(Handle);
    msg_init = "PmtaMsgInit": fn(Handle, *const c_char) -> Bool;
    msg_set_verp = "PmtaMsgSetVerp": fn(Handle, Bool) -> Bool;
    msg_set_return_type = "PmtaMsgSetReturnType": fn(Handle, c_int) -> Bool;
    msg_set_envelope_id = "PmtaMsgSetEnvelopeId": fn(Handle, *const c_char) -> Bool;
    msg_set_virtual_mta = "PmtaMsgSetVirtualMta": fn(Handle, *const c_char) -> Bool;
    msg_set_job_id = "PmtaMsgSetJobId": fn(Handle, *const c_char) -> Bool;
    msg_set_encoding = "PmtaMsgSetEncoding": fn(Handle, c_int) -> Bool;
    msg_begin_part = "PmtaMsgBeginPart": fn(Handle, c_int) -> Bool;
    msg_add_data = "PmtaMsgAddData": fn(Handle, *const c_char, size_t) -> Bool;
    msg_add_merge_data = "PmtaMsgAddMergeData": fn(Handle, *const c_char, size_t) -> Bool;
    msg_add_date_header = "PmtaMsgAddDateHeader": fn(Handle) -> Bool;
    msg_add_recipient = "PmtaMsgAddRecipient": fn(Handle, Handle) -> Bool;
    msg_last_error = "PmtaMsgGetLastError": fn(Handle) -> *const c_char;
    msg_last_error_type = "PmtaMsgGetLastErrorType": fn(Handle) -> c_int;

    rcpt_alloc = "PmtaRcptAlloc": fn() -> Handle;
    rcpt_free = "PmtaRcptFree": fn(Handle);
    rcpt_init = "PmtaRcptInit": fn(Handle, *const c_char) -> Bool;
    rcpt_set_notify = "PmtaRcptSetNotify": fn(Handle, c_int) -> Bool;
    rcpt_define_variable = "PmtaRcptDefineVariable":
        fn(Handle, *const c_char, *const c_char) -> Bool;
    rcpt_last_error = "PmtaRcptGetLastError": fn(Handle) -> *const c_char;
    rcpt_last_error_type = "PmtaRcptGetLastErrorType": fn(Handle) -> c_int;
}

/// An engine connection object. Not `Send`: the vendor objects are bound to
/// the thread that uses them.
#[derive(Debug)]
pub struct NativeSession(NonNull<c_void>);

#[derive(Debug)]
pub struct NativeMessage(NonNull<c_void>);

#[derive(Debug)]
pub struct NativeRecipient(NonNull<c_void>);

/// Text arguments with an interior NUL are refused before reaching the engine.
fn with_text<const N: usize>(values: [&str; N], f: impl FnOnce([&CString; N]) -> Bool) -> bool {
    let Some(strings) = values
        .into_iter()
        .map(c_string)
        .collect::<Option<Vec<_>>>()
    else {
        return false;
    };

    let refs: [&CString; N] = core::array::from_fn(|i| &strings[i]);
    f(refs) != 0
}

pub struct NativeEngine {
    symbols: Symbols,
    path: PathBuf,
    _library: Library,
}

impl NativeEngine {
    /// Load the engine from the shared library at `path`.
    ///
    /// # Errors
    /// If the library cannot be opened or lacks one of the entry points.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref().to_path_buf();
        let error = |source| LoadError {
            path: path.clone(),
            source,
        };

        // SAFETY: loading runs the library's initialisers; the symbol types
        // match the vendor's published prototypes.
        let (library, symbols) = unsafe {
            let library = Library::new(&path).map_err(error)?;
            let symbols = Symbols::load(&library).map_err(error)?;
            (library, symbols)
        };

        internal!(level = INFO, "loaded submission engine from {}", path.display());

        Ok(Self {
            symbols,
            path,
            _library: library,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl core::fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NativeEngine")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

// SAFETY (all blocks below): every handle wraps a non-null pointer obtained
// from the matching allocator and not yet freed, and every string outlives the
// call it is passed to.
impl Engine for NativeEngine {
    type Session = NativeSession;
    type Message = NativeMessage;
    type Recipient = NativeRecipient;

    fn session_alloc(&self) -> Option<Self::Session> {
        NonNull::new(unsafe { (self.symbols.conn_alloc)() }).map(NativeSession)
    }

    fn session_connect(&self, session: &mut Self::Session, server: &str, port: u16) -> bool {
        with_text([server], |[server]| unsafe {
            (self.symbols.conn_connect)(session.0.as_ptr(), server.as_ptr(), c_int::from(port))
        })
    }

    fn session_connect_auth(
        &self,
        session: &mut Self::Session,
        server: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> bool {
        with_text([server, username, password], |[server, username, password]| unsafe {
            (self.symbols.conn_connect_auth)(
                session.0.as_ptr(),
                server.as_ptr(),
                c_int::from(port),
                username.as_ptr(),
                password.as_ptr(),
            )
        })
    }

    fn session_submit(&self, session: &mut Self::Session, message: &Self::Message) -> bool {
        unsafe { (self.symbols.conn_submit)(session.0.as_ptr(), message.0.as_ptr()) != 0 }
    }

    fn session_last_error(&self, session: &Self::Session) -> RawError {
        unsafe {
            RawError::new(
                (self.symbols.conn_last_error_type)(session.0.as_ptr()),
                from_c((self.symbols.conn_last_error)(session.0.as_ptr())),
            )
        }
    }

    fn session_free(&self, session: &mut Self::Session) {
        unsafe { (self.symbols.conn_free)(session.0.as_ptr()) }
    }

    fn message_alloc(&self) -> Option<Self::Message> {
        NonNull::new(unsafe { (self.symbols.msg_alloc)() }).map(NativeMessage)
    }

    fn message_init(&self, message: &mut Self::Message, originator: &str) -> bool {
        with_text([originator], |[originator]| unsafe {
            (self.symbols.msg_init)(message.0.as_ptr(), originator.as_ptr())
        })
    }

    fn message_set_verp(&self, message: &mut Self::Message, verp: bool) -> bool {
        unsafe { (self.symbols.msg_set_verp)(message.0.as_ptr(), Bool::from(verp)) != 0 }
    }

    fn message_set_return_type(
        &self,
        message: &mut Self::Message,
        return_type: ReturnType,
    ) -> bool {
        let code = match return_type {
            ReturnType::Headers => 0,
            ReturnType::Full => 1,
        };

        unsafe { (self.symbols.msg_set_return_type)(message.0.as_ptr(), code) != 0 }
    }

    fn message_set_envelope_id(&self, message: &mut Self::Message, envelope_id: &str) -> bool {
        with_text([envelope_id], |[envelope_id]| unsafe {
            (self.symbols.msg_set_envelope_id)(message.0.as_ptr(), envelope_id.as_ptr())
        })
    }

    fn message_set_virtual_mta(&self, message: &mut Self::Message, virtual_mta: &str) -> bool {
        with_text([virtual_mta], |[virtual_mta]| unsafe {
            (self.symbols.msg_set_virtual_mta)(message.0.as_ptr(), virtual_mta.as_ptr())
        })
    }

    fn message_set_job_id(&self, message: &mut Self::Message, job_id: &str) -> bool {
        with_text([job_id], |[job_id]| unsafe {
            (self.symbols.msg_set_job_id)(message.0.as_ptr(), job_id.as_ptr())
        })
    }

    fn message_set_encoding(&self, message: &mut Self::Message, encoding: Encoding) -> bool {
        let code = match encoding {
            Encoding::SevenBit => 0,
            Encoding::EightBit => 1,
            Encoding::Base64 => 2,
        };

        unsafe { (self.symbols.msg_set_encoding)(message.0.as_ptr(), code) != 0 }
    }

    fn message_begin_part(&self, message: &mut Self::Message, part: u32) -> bool {
        let Ok(part) = c_int::try_from(part) else {
            return false;
        };

        unsafe { (self.symbols.msg_begin_part)(message.0.as_ptr(), part) != 0 }
    }

    fn message_add_data(&self, message: &mut Self::Message, data: &[u8]) -> bool {
        unsafe {
            (self.symbols.msg_add_data)(message.0.as_ptr(), data.as_ptr().cast(), data.len()) != 0
        }
    }

    fn message_add_merge_data(&self, message: &mut Self::Message, data: &[u8]) -> bool {
        unsafe {
            (self.symbols.msg_add_merge_data)(message.0.as_ptr(), data.as_ptr().cast(), data.len())
                != 0
        }
    }

    fn message_add_date_header(&self, message: &mut Self::Message) -> bool {
        unsafe { (self.symbols.msg_add_date_header)(message.0.as_ptr()) != 0 }
    }

    fn message_add_recipient(
        &self,
        message: &mut Self::Message,
        mut recipient: Self::Recipient,
    ) -> Result<(), Self::Recipient> {
        if unsafe { (self.symbols.msg_add_recipient)(message.0.as_ptr(), recipient.0.as_ptr()) }
            == 0
        {
            return Err(recipient);
        }

        // The engine keeps its own copy of a bound recipient.
        self.recipient_free(&mut recipient);
        Ok(())
    }

    fn message_last_error(&self, message: &Self::Message) -> RawError {
        unsafe {
            RawError::new(
                (self.symbols.msg_last_error_type)(message.0.as_ptr()),
                from_c((self.symbols.msg_last_error)(message.0.as_ptr())),
            )
        }
    }

    fn message_free(&self, message: &mut Self::Message) {
        unsafe { (self.symbols.msg_free)(message.0.as_ptr()) }
    }

    fn recipient_alloc(&self) -> Option<Self::Recipient> {
        NonNull::new(unsafe { (self.symbols.rcpt_alloc)() }).map(NativeRecipient)
    }

    fn recipient_init(&self, recipient: &mut Self::Recipient, address: &str) -> bool {
        with_text([address], |[address]| unsafe {
            (self.symbols.rcpt_init)(recipient.0.as_ptr(), address.as_ptr())
        })
    }

    fn recipient_set_notify(&self, recipient: &mut Self::Recipient, notify: Notify) -> bool {
        let Ok(mask) = c_int::try_from(notify.bits()) else {
            return false;
        };

        unsafe { (self.symbols.rcpt_set_notify)(recipient.0.as_ptr(), mask) != 0 }
    }

    fn recipient_define_variable(
        &self,
        recipient: &mut Self::Recipient,
        name: &str,
        value: &str,
    ) -> bool {
        with_text([name, value], |[name, value]| unsafe {
            (self.symbols.rcpt_define_variable)(recipient.0.as_ptr(), name.as_ptr(), value.as_ptr())
        })
    }

    fn recipient_last_error(&self, recipient: &Self::Recipient) -> RawError {
        unsafe {
            RawError::new(
                (self.symbols.rcpt_last_error_type)(recipient.0.as_ptr()),
                from_c((self.symbols.rcpt_last_error)(recipient.0.as_ptr())),
            )
        }
    }

    fn recipient_free(&self, recipient: &mut Self::Recipient) {
        unsafe { (self.symbols.rcpt_free)(recipient.0.as_ptr()) }
    }
}

#[cfg(test)]
mod tests {
    use super::NativeEngine;

    #[test]
    fn missing_library() {
        let err = NativeEngine::load("/nonexistent/libpmta.so").unwrap_err();

        assert_eq!(err.path.to_str(), Some("/nonexistent/libpmta.so"));
        assert!(err
            .to_string()
            .starts_with("unable to load submission engine from /nonexistent/libpmta.so"));
    }
}
