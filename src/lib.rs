#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::must_use_candidate)]

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod logging;
pub mod message;
pub mod property;
pub mod recipient;

pub use tracing;

pub use crate::{
    config::{Config, ConfigError},
    connection::{Connection, Credentials, Endpoint, Target},
    engine::{memory::MemoryEngine, native::NativeEngine, Engine, RawError},
    error::{Error, ErrorKind, Policy, Result, Subject},
    message::{Chunk, Encoding, Message, Part, Rejected, ReturnType},
    property::{Properties, PropertyError, Value},
    recipient::{Bound, Notify, Recipient},
};
