//! Access to handle fields by name, for hosts that address properties as
//! strings.
//!
//! Each handle has a fixed set of properties, listed by its property enum.
//! Reads come from the handle's cache; writes go through the typed setters and
//! so reach the engine.

use core::{
    fmt::{self, Display},
    str::FromStr,
};
use std::collections::BTreeMap;

use crate::{
    connection::Connection,
    engine::Engine,
    error::Error,
    internal,
    message::{Encoding, Message, ReturnType},
    recipient::{Notify, Recipient},
};

/// A property value as seen by a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, String>),
}

impl Value {
    /// Returns `true` for values a host would consider empty: null, `false`,
    /// zero, and empty strings or collections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Bool(value) => !value,
            Self::Int(value) => *value == 0,
            Self::Str(value) => value.is_empty(),
            Self::List(values) => values.is_empty(),
            Self::Map(values) => values.is_empty(),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PropertyError {
    #[error("Undefined property {class}::{name}")]
    Unknown { class: &'static str, name: String },
    #[error("Cannot set property {class}::{name}")]
    ReadOnly { class: &'static str, name: String },
    #[error("Invalid value for {class}::{name}, expected {expected}")]
    InvalidValue {
        class: &'static str,
        name: &'static str,
        expected: &'static str,
    },
    #[error(transparent)]
    Engine(#[from] Error),
}

macro_rules! properties {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident { $($variant:ident => $text:literal),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant),*
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant),*];

            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),*
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)*
                    _ => Err(s.to_owned()),
                }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

properties! {
    pub enum ConnectionProperty {
        Server => "server",
        Port => "port",
        Username => "username",
        Password => "password",
    }
}

properties! {
    pub enum MessageProperty {
        Originator => "originator",
        Verp => "verp",
        ReturnType => "return_type",
        EnvelopeId => "envelope_id",
        VirtualMta => "vmta",
        JobId => "jobid",
        Encoding => "encoding",
        Recipients => "recipients",
    }
}

properties! {
    pub enum RecipientProperty {
        Address => "address",
        Notify => "notify",
        Variables => "variables",
    }
}

/// Name based access to a handle's properties.
pub trait Properties {
    type Property: FromStr<Err = String> + Display + Copy;

    /// Class name used in diagnostics.
    const CLASS: &'static str;

    fn property(&self, property: Self::Property) -> Value;

    /// # Errors
    /// [`PropertyError::ReadOnly`], [`PropertyError::InvalidValue`], or the
    /// engine's error from the underlying setter.
    fn set_property(&mut self, property: Self::Property, value: Value) -> Result<(), PropertyError>;

    /// # Errors
    /// [`PropertyError::Unknown`] for names outside the property set.
    fn get(&self, name: &str) -> Result<Value, PropertyError> {
        let property = lookup::<Self>(name)?;
        Ok(self.property(property))
    }

    /// # Errors
    /// [`PropertyError::Unknown`] for names outside the property set, or any
    /// error from [`Self::set_property`].
    fn set(&mut self, name: &str, value: Value) -> Result<(), PropertyError> {
        let property = lookup::<Self>(name)?;
        self.set_property(property, value)
    }

    /// Returns `true` if `name` is a known property, whatever its value.
    fn has(&self, name: &str) -> bool {
        name.parse::<Self::Property>().is_ok()
    }
}

fn lookup<P: Properties + ?Sized>(name: &str) -> Result<P::Property, PropertyError> {
    name.parse().map_err(|name| {
        let err = PropertyError::Unknown {
            class: P::CLASS,
            name,
        };
        internal!(level = WARN, "{err}");
        err
    })
}

fn read_only<P: Properties + ?Sized>(property: P::Property) -> PropertyError {
    let err = PropertyError::ReadOnly {
        class: P::CLASS,
        name: property.to_string(),
    };
    internal!(level = WARN, "{err}");
    err
}

fn text(value: Value, class: &'static str, name: &'static str) -> Result<String, PropertyError> {
    match value {
        Value::Str(value) => Ok(value),
        _ => Err(PropertyError::InvalidValue {
            class,
            name,
            expected: "a string",
        }),
    }
}

fn code(value: &Value, class: &'static str, name: &'static str) -> Result<i64, PropertyError> {
    match value {
        Value::Int(value) => Ok(*value),
        _ => Err(PropertyError::InvalidValue {
            class,
            name,
            expected: "an integer",
        }),
    }
}

impl<E: Engine> Properties for Connection<E> {
    type Property = ConnectionProperty;

    const CLASS: &'static str = "PmtaConnection";

    fn property(&self, property: Self::Property) -> Value {
        match property {
            ConnectionProperty::Server => self.server().into(),
            ConnectionProperty::Port => Value::Int(i64::from(self.port())),
            ConnectionProperty::Username => self.username().into(),
            ConnectionProperty::Password => self.password().into(),
        }
    }

    fn set_property(&mut self, property: Self::Property, _: Value) -> Result<(), PropertyError> {
        Err(read_only::<Self>(property))
    }
}

impl<E: Engine> Properties for Message<E> {
    type Property = MessageProperty;

    const CLASS: &'static str = "PmtaMessage";

    fn property(&self, property: Self::Property) -> Value {
        match property {
            MessageProperty::Originator => self.originator().into(),
            MessageProperty::Verp => self.verp().into(),
            MessageProperty::ReturnType => self.return_type().map(ReturnType::code).into(),
            MessageProperty::EnvelopeId => self.envelope_id().into(),
            MessageProperty::VirtualMta => self.virtual_mta().into(),
            MessageProperty::JobId => self.job_id().into(),
            MessageProperty::Encoding => self.encoding().map(Encoding::code).into(),
            MessageProperty::Recipients => Value::List(
                self.recipients()
                    .iter()
                    .map(|recipient| recipient.address().into())
                    .collect(),
            ),
        }
    }

    /// `return_type` and `encoding` take the engine's integer codes. A code
    /// outside the known constants is refused here with
    /// [`PropertyError::InvalidValue`], since the engine only ever receives a
    /// [`ReturnType`] or an [`Encoding`].
    fn set_property(
        &mut self,
        property: Self::Property,
        value: Value,
    ) -> Result<(), PropertyError> {
        let name = property.as_str();
        match property {
            MessageProperty::Verp => match value {
                Value::Bool(verp) => Ok(self.set_verp(verp)?),
                Value::Int(verp) => Ok(self.set_verp(verp != 0)?),
                _ => Err(PropertyError::InvalidValue {
                    class: Self::CLASS,
                    name,
                    expected: "a boolean",
                }),
            },
            MessageProperty::ReturnType => {
                let return_type = ReturnType::from_code(code(&value, Self::CLASS, name)?).ok_or(
                    PropertyError::InvalidValue {
                        class: Self::CLASS,
                        name,
                        expected: "RETURN_HEADERS or RETURN_FULL",
                    },
                )?;
                Ok(self.set_return_type(return_type)?)
            }
            MessageProperty::Encoding => {
                let encoding = Encoding::from_code(code(&value, Self::CLASS, name)?).ok_or(
                    PropertyError::InvalidValue {
                        class: Self::CLASS,
                        name,
                        expected: "ENCODING_7BIT, ENCODING_8BIT or ENCODING_BASE64",
                    },
                )?;
                Ok(self.set_encoding(encoding)?)
            }
            MessageProperty::EnvelopeId => {
                Ok(self.set_envelope_id(&text(value, Self::CLASS, name)?)?)
            }
            MessageProperty::VirtualMta => {
                Ok(self.set_virtual_mta(&text(value, Self::CLASS, name)?)?)
            }
            MessageProperty::JobId => Ok(self.set_job_id(&text(value, Self::CLASS, name)?)?),
            MessageProperty::Originator | MessageProperty::Recipients => {
                Err(read_only::<Self>(property))
            }
        }
    }
}

impl<E: Engine> Properties for Recipient<E> {
    type Property = RecipientProperty;

    const CLASS: &'static str = "PmtaRecipient";

    /// A recipient property only counts as set once it holds a value.
    fn has(&self, name: &str) -> bool {
        name.parse::<Self::Property>()
            .is_ok_and(|property| !self.property(property).is_empty())
    }

    fn property(&self, property: Self::Property) -> Value {
        match property {
            RecipientProperty::Address => self.address().into(),
            RecipientProperty::Notify => Value::Int(i64::from(self.notify().bits())),
            RecipientProperty::Variables => Value::Map(
                self.variables()
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            ),
        }
    }

    fn set_property(
        &mut self,
        property: Self::Property,
        value: Value,
    ) -> Result<(), PropertyError> {
        match property {
            RecipientProperty::Notify => {
                let mask = u32::try_from(code(&value, Self::CLASS, property.as_str())?)
                    .map_err(|_| PropertyError::InvalidValue {
                        class: Self::CLASS,
                        name: property.as_str(),
                        expected: "a notification mask",
                    })?;
                Ok(self.set_notify(Notify::from_bits_retain(mask))?)
            }
            RecipientProperty::Address | RecipientProperty::Variables => {
                Err(read_only::<Self>(property))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use pretty_assertions::assert_eq;

    use super::{MessageProperty, Properties, PropertyError, Value};
    use crate::{
        config::Config,
        connection::{Connection, Target},
        engine::memory::{MemoryEngine, Op},
        error::ErrorKind,
        message::Message,
        recipient::Recipient,
    };

    #[test]
    fn names() {
        assert_eq!(
            "vmta".parse::<MessageProperty>(),
            Ok(MessageProperty::VirtualMta)
        );
        assert_eq!("jobid".parse::<MessageProperty>(), Ok(MessageProperty::JobId));
        assert_eq!(
            "job_id".parse::<MessageProperty>(),
            Err("job_id".to_owned())
        );

        for property in MessageProperty::ALL {
            assert_eq!(property.as_str().parse::<MessageProperty>(), Ok(*property));
        }
    }

    #[test]
    fn message_properties() {
        let engine = Arc::new(MemoryEngine::new());
        let mut message = Message::new(&engine, "a@b.com").unwrap();

        assert_eq!(message.get("originator"), Ok(Value::from("a@b.com")));
        assert_eq!(message.get("jobid"), Ok(Value::Null));
        assert!(message.has("jobid"));

        message.set("jobid", Value::from("job-7")).unwrap();
        message.set("verp", Value::Int(1)).unwrap();
        message.set("encoding", Value::Int(2)).unwrap();

        assert_eq!(message.get("jobid"), Ok(Value::from("job-7")));
        assert_eq!(message.get("verp"), Ok(Value::Bool(true)));
        assert_eq!(message.get("encoding"), Ok(Value::Int(2)));
        assert!(message.has("jobid"));

        message
            .add_recipient(Recipient::new(&engine, "c@d.com").unwrap())
            .unwrap();
        assert_eq!(
            message.get("recipients"),
            Ok(Value::List(vec![Value::from("c@d.com")]))
        );
    }

    #[test]
    fn message_errors() {
        let engine = Arc::new(MemoryEngine::new());
        let mut message = Message::new(&engine, "a@b.com").unwrap();

        assert_eq!(
            message.get("subject").unwrap_err().to_string(),
            "Undefined property PmtaMessage::subject"
        );
        assert_eq!(
            message
                .set("originator", Value::from("x@y.com"))
                .unwrap_err()
                .to_string(),
            "Cannot set property PmtaMessage::originator"
        );
        assert!(matches!(
            message.set("return_type", Value::Int(9)),
            Err(PropertyError::InvalidValue { .. })
        ));
        assert!(matches!(
            message.set("jobid", Value::Int(9)),
            Err(PropertyError::InvalidValue { .. })
        ));
        assert!(matches!(
            message.set("encoding", Value::Int(-1)),
            Err(PropertyError::InvalidValue { .. })
        ));
        assert!(!message.has("subject"));
        assert_eq!(message.return_type(), None);
        assert_eq!(message.encoding(), None);
        assert_eq!(engine.count(Op::SetReturnType), 0);
        assert_eq!(engine.count(Op::SetEncoding), 0);
    }

    #[test]
    fn recipient_properties() {
        let engine = Arc::new(MemoryEngine::new());
        let mut recipient = Recipient::new(&engine, "c@d.com").unwrap();

        assert!(!recipient.has("notify"));
        recipient.set("notify", Value::Int(6)).unwrap();
        recipient.define_variable("name", "Bob").unwrap();

        assert_eq!(recipient.get("notify"), Ok(Value::Int(6)));
        assert_eq!(
            recipient.get("variables"),
            Ok(Value::Map(BTreeMap::from([(
                "name".to_owned(),
                "Bob".to_owned()
            )])))
        );

        match recipient.set("notify", Value::Int(0x40)) {
            Err(PropertyError::Engine(err)) => assert_eq!(err.kind(), ErrorKind::IllegalArgument),
            other => panic!("expected an engine error, got {other:?}"),
        }
        assert_eq!(recipient.get("notify"), Ok(Value::Int(6)));

        assert!(matches!(
            recipient.set("address", Value::from("e@f.com")),
            Err(PropertyError::ReadOnly { .. })
        ));
    }

    #[test]
    fn connection_properties_are_read_only() {
        let engine = Arc::new(MemoryEngine::new());
        let mut connection = Connection::open(
            &engine,
            &Config::default(),
            &Target::default().server("mta.example").port(2525),
        )
        .unwrap();

        assert_eq!(connection.get("server"), Ok(Value::from("mta.example")));
        assert_eq!(connection.get("port"), Ok(Value::Int(2525)));
        assert!(connection.has("username"));
        assert!(!connection.has("connection"));
        assert!(matches!(
            connection.set("port", Value::Int(25)),
            Err(PropertyError::ReadOnly { .. })
        ));
    }
}
