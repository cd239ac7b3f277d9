use std::ffi::{c_char, CStr, CString};

/// Convert text for the engine. `None` if it contains a NUL byte.
pub(super) fn c_string(value: &str) -> Option<CString> {
    CString::new(value).ok()
}

/// Copy a string returned by the engine. A null pointer reads as empty, and
/// invalid UTF-8 is replaced rather than rejected.
///
/// # Safety
/// `ptr` must be null or point to a NUL terminated string that stays valid for
/// the duration of the call.
pub(super) unsafe fn from_c(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::default();
    }

    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}
