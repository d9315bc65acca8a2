//! Command and value tags, type descriptors

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel carrying requests and their responses
pub const COMMANDS_CHANNEL: &str = "Commands";

/// Channel carrying callback invocations
pub const EVENTS_CHANNEL: &str = "Events";

/// Well-known type names
pub mod names {
    /// Opaque placeholder for an object whose type is unknown locally
    pub const REMOTE_OBJECT: &str = "remoting::RemoteObject";
    /// Function reference type
    pub const CALLBACK: &str = "remoting::Callback";
    /// Generic remote failure
    pub const EXCEPTION: &str = "remoting::Exception";
    /// Failure to locate an object or method
    pub const DISPATCH_ERROR: &str = "remoting::DispatchError";
    /// Failure raised by an access policy
    pub const ACCESS_DENIED: &str = "remoting::AccessDenied";
    /// UTF-8 string
    pub const STRING: &str = "string";
    /// Byte buffer
    pub const BUFFER: &str = "[u8]";
    /// Absent value
    pub const NULL: &str = "null";

    /// Primitive value types encoded as text
    pub const PRIMITIVES: &[&str] = &[
        "bool", "char", "i8", "i16", "i32", "i64", "u8", "u16", "u32", "u64", "f32", "f64",
    ];

    /// Whether a type name denotes a primitive value type
    pub fn is_primitive(name: &str) -> bool {
        PRIMITIVES.contains(&name)
    }

    /// Build the array type name for an element type
    pub fn array_of(element: &str) -> String {
        format!("[{}]", element)
    }

    /// Element type name of an array type name, if it is one
    pub fn element_of(name: &str) -> Option<&str> {
        name.strip_prefix('[').and_then(|rest| rest.strip_suffix(']'))
    }
}

/// Command tag leading every message on the command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Resolve a published object by name
    Get = 0,
    /// Invoke a method
    Call = 1,
    /// Successful response
    Result = 2,
    /// Failed response
    Exception = 3,
    /// Callback invocation on the event channel
    Event = 4,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Get),
            1 => Ok(Self::Call),
            2 => Ok(Self::Result),
            3 => Ok(Self::Exception),
            4 => Ok(Self::Event),
            _ => Err(ProtocolError::InvalidTag { kind: "command", tag }),
        }
    }
}

/// Tag leading every serialized value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueTag {
    /// Absent value
    Null = 0,
    /// Primitive encoded as descriptor plus text
    Value = 1,
    /// UTF-8 string
    String = 2,
    /// Reference to an exposed object
    RemoteObject = 3,
    /// Failure description
    Exception = 4,
    /// Raw bytes
    Buffer = 5,
    /// Homogeneous sequence
    Array = 6,
    /// Function reference
    Callback = 7,
    /// Named fields
    Struct = 8,
}

impl TryFrom<u8> for ValueTag {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => Self::Null,
            1 => Self::Value,
            2 => Self::String,
            3 => Self::RemoteObject,
            4 => Self::Exception,
            5 => Self::Buffer,
            6 => Self::Array,
            7 => Self::Callback,
            8 => Self::Struct,
            _ => return Err(ProtocolError::InvalidTag { kind: "value", tag }),
        })
    }
}

/// Ordered type names, most-derived first
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TypeDescriptor {
    names: Vec<String>,
}

impl TypeDescriptor {
    /// Build a descriptor from a chain of names
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Descriptor naming a single type
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
        }
    }

    /// The opaque object placeholder
    pub fn remote_object() -> Self {
        Self::named(names::REMOTE_OBJECT)
    }

    /// Most-derived name, or the placeholder for an empty chain
    pub fn name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(names::REMOTE_OBJECT)
    }

    /// Every name in the chain
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Ancestor chain without the most-derived name
    pub fn parents(&self) -> &[String] {
        self.names.get(1..).unwrap_or(&[])
    }

    /// Whether the chain names `name` anywhere
    pub fn is(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Whether the chain is empty
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&str> for TypeDescriptor {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}
