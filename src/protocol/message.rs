use std::fmt::{Debug, Display, Formatter};
use std::marker::PhantomData;

use data_encoding::BASE64;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Code, Error, Result};
use crate::model::encoding::base64_bytes;

/// Kind of the message carrying a remote failure.
pub const ERROR_KIND: &str = "error";
/// Kind of a bare acknowledgement.
pub const ACK_KIND: &str = "ack";

/// A typed field payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    List(Vec<Value>),
    /// A nested domain object, in its serde representation.
    Object(serde_json::Value),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Bool(_) => FieldType::Bool,
            Self::Int(_) => FieldType::Int,
            Self::Text(_) => FieldType::Text,
            Self::Bytes(_) => FieldType::Bytes,
            Self::List(_) => FieldType::List,
            Self::Object(_) => FieldType::Object,
        }
    }

    pub fn object<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Object(serde_json::to_value(value)?))
    }
}

/// The declared type of a required field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Int,
    Text,
    Bytes,
    List,
    Object,
}

/// Marker trait for whether a message's shape has been checked.
pub trait MessageState: Copy + Debug {}

/// Marker type for messages whose fields may not be read yet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Unverified;

impl MessageState for Unverified {}

/// Marker type for messages that passed [`Message::verify`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Verified;

impl MessageState for Verified {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Field {
    name: String,
    value: Value,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    kind: String,
    fields: Vec<Field>,
}

/// A self-describing request or response: a kind tag plus insertion-ordered, typed fields.
///
/// Fields can only be read once the message has been verified against the
/// expected kind and field types.
#[derive(Clone, PartialEq)]
pub struct Message<S: MessageState = Unverified> {
    kind: String,
    fields: Vec<Field>,
    state: PhantomData<S>,
}

impl<S: MessageState> Message<S> {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| &field.value)
    }

    /// Serialise into a single wire line (no trailing newline).
    pub fn to_wire(&self) -> Result<String> {
        let envelope = Envelope {
            kind: self.kind.clone(),
            fields: self.fields.clone(),
        };
        Ok(BASE64.encode(&serde_json::to_vec(&envelope)?))
    }
}

impl Message<Unverified> {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Vec::new(),
            state: PhantomData,
        }
    }

    pub fn ack() -> Self {
        Self::new(ACK_KIND)
    }

    /// Encode a failure so the peer can rebuild it with the same code.
    pub fn error(err: &Error) -> Self {
        Self::new(ERROR_KIND)
            .with("code", Value::Int(err.code() as i64))
            .with("detail", Value::Text(err.specific_message().to_string()))
    }

    /// Add a field, replacing any previous field of the same name in place.
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        let name = name.into();
        match self.fields.iter_mut().find(|field| field.name == name) {
            Some(field) => field.value = value,
            None => self.fields.push(Field { name, value }),
        }
        self
    }

    pub fn with_bool(self, name: impl Into<String>, value: bool) -> Self {
        self.with(name, Value::Bool(value))
    }

    pub fn with_int(self, name: impl Into<String>, value: i64) -> Self {
        self.with(name, Value::Int(value))
    }

    pub fn with_text(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(name, Value::Text(value.into()))
    }

    pub fn with_bytes(self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.with(name, Value::Bytes(value.into()))
    }

    pub fn with_object<T: Serialize>(self, name: impl Into<String>, value: &T) -> Result<Self> {
        Ok(self.with(name, Value::object(value)?))
    }

    pub fn from_wire(line: &str) -> Result<Self> {
        let json = BASE64.decode(line.trim_end().as_bytes())?;
        let envelope: Envelope = serde_json::from_slice(&json)?;
        Ok(Self {
            kind: envelope.kind,
            fields: envelope.fields,
            state: PhantomData,
        })
    }

    /// If this message carries a remote failure, rebuild it.
    pub fn remote_error(&self) -> Option<Error> {
        if self.kind != ERROR_KIND {
            return None;
        }
        let code = match self.get("code") {
            Some(Value::Int(code)) => serde_json::from_value::<Code>((*code).into()).ok(),
            _ => None,
        };
        let detail = match self.get("detail") {
            Some(Value::Text(detail)) => detail.clone(),
            _ => "peer reported an error without details".to_string(),
        };
        Some(Error::new(code.unwrap_or(Code::UnexpectedValue), detail))
    }

    /// Check the kind and the presence and type of every required field.
    ///
    /// A remote error message is returned as that error instead.
    pub fn verify(self, kind: &str, required: &[(&str, FieldType)]) -> Result<Message<Verified>> {
        if let Some(err) = self.remote_error() {
            return Err(err);
        }
        if self.kind != kind {
            return Err(Error::malformed(format!(
                "expected a `{kind}` message, got `{}`",
                self.kind
            )));
        }
        for (name, expected) in required {
            match self.get(name) {
                None => {
                    return Err(Error::malformed(format!(
                        "`{kind}` message is missing field `{name}`"
                    )))
                }
                Some(value) if value.field_type() != *expected => {
                    return Err(Error::malformed(format!(
                        "field `{name}` of `{kind}` should be {expected:?}, got {:?}",
                        value.field_type()
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(Message {
            kind: self.kind,
            fields: self.fields,
            state: PhantomData,
        })
    }

    /// Accept an acknowledgement with no further content.
    pub fn verify_ack(self) -> Result<()> {
        self.verify(ACK_KIND, &[]).map(|_| ())
    }
}

impl Message<Verified> {
    fn field(&self, name: &str) -> Result<&Value> {
        self.get(name)
            .ok_or_else(|| Error::malformed(format!("`{}` message has no field `{name}`", self.kind)))
    }

    fn mismatch(&self, name: &str, expected: FieldType) -> Error {
        Error::malformed(format!(
            "field `{name}` of `{}` is not {expected:?}",
            self.kind
        ))
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        match self.field(name)? {
            Value::Bool(value) => Ok(*value),
            _ => Err(self.mismatch(name, FieldType::Bool)),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        match self.field(name)? {
            Value::Int(value) => Ok(*value),
            _ => Err(self.mismatch(name, FieldType::Int)),
        }
    }

    pub fn text(&self, name: &str) -> Result<&str> {
        match self.field(name)? {
            Value::Text(value) => Ok(value),
            _ => Err(self.mismatch(name, FieldType::Text)),
        }
    }

    pub fn bytes(&self, name: &str) -> Result<&[u8]> {
        match self.field(name)? {
            Value::Bytes(value) => Ok(value),
            _ => Err(self.mismatch(name, FieldType::Bytes)),
        }
    }

    pub fn list(&self, name: &str) -> Result<&[Value]> {
        match self.field(name)? {
            Value::List(values) => Ok(values),
            _ => Err(self.mismatch(name, FieldType::List)),
        }
    }

    pub fn object<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        match self.field(name)? {
            Value::Object(value) => Ok(serde_json::from_value(value.clone())?),
            _ => Err(self.mismatch(name, FieldType::Object)),
        }
    }
}

impl<S: MessageState> Debug for Message<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // Field values may be secrets; only show the shape.
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("fields", &self.field_names().collect::<Vec<_>>())
            .finish()
    }
}

impl<S: MessageState> Display for Message<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({} fields)", self.kind, self.fields.len())
    }
}
