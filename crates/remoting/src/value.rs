//! Dynamic values crossing the wire

use crate::callback::Callback;
use crate::client::Proxy;
use crate::object::ObjectRef;
use crate::RemotingError;
use bytes::Bytes;
use remoting_proto::{names, ProtocolError, TypeDescriptor};
use std::fmt;

/// Failure description carried across the wire.
///
/// Only the type name, message and stack text survive the trip, plus the
/// nested inner and aggregated failures.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteException {
    /// Fully qualified type name of the failure
    pub type_name: String,
    /// Human readable message
    pub message: String,
    /// Stack text, empty when unknown
    pub stack_trace: String,
    /// Failure that caused this one
    pub inner: Option<Box<RemoteException>>,
    /// Sibling failures collected together
    pub aggregated: Vec<RemoteException>,
}

impl RemoteException {
    /// Create a failure with a type name and message
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Generic failure with only a message
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(names::EXCEPTION, message)
    }

    /// Attach stack text
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = stack_trace.into();
        self
    }

    /// Attach the causing failure
    pub fn with_inner(mut self, inner: RemoteException) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// Attach sibling failures
    pub fn with_aggregated(mut self, aggregated: Vec<RemoteException>) -> Self {
        self.aggregated = aggregated;
        self
    }

    /// Whether this failure or any nested one mentions `text`
    pub fn mentions(&self, text: &str) -> bool {
        self.message.contains(text)
            || self.inner.as_ref().is_some_and(|inner| inner.mentions(text))
            || self.aggregated.iter().any(|e| e.mentions(text))
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for RemoteException {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Value with named fields, copied by value across the wire
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructValue {
    /// Type chain of the struct
    pub descriptor: TypeDescriptor,
    /// Fields in declaration order
    pub fields: Vec<(String, Value)>,
}

impl StructValue {
    /// Create an empty struct of the given type
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            descriptor: TypeDescriptor::named(type_name),
            fields: Vec::new(),
        }
    }

    /// Append a field
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Look a field up by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Any value that can be passed to or returned from a remote method
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent value
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Unicode scalar
    Char(char),
    /// Signed 8-bit integer
    I8(i8),
    /// Signed 16-bit integer
    I16(i16),
    /// Signed 32-bit integer
    I32(i32),
    /// Signed 64-bit integer
    I64(i64),
    /// Unsigned 8-bit integer
    U8(u8),
    /// Unsigned 16-bit integer
    U16(u16),
    /// Unsigned 32-bit integer
    U32(u32),
    /// Unsigned 64-bit integer
    U64(u64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// UTF-8 string
    String(String),
    /// Raw bytes
    Buffer(Bytes),
    /// Homogeneous sequence
    Array {
        /// Element type name
        element: String,
        /// Elements
        items: Vec<Value>,
    },
    /// Named fields
    Struct(StructValue),
    /// Live object, passed by reference
    Object(ObjectRef),
    /// Function reference
    Callback(Callback),
    /// Failure description
    Exception(RemoteException),
}

impl Value {
    /// Build an array value
    pub fn array<T: Into<Value>>(element: impl Into<String>, items: impl IntoIterator<Item = T>) -> Self {
        Self::Array {
            element: element.into(),
            items: items.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the value is `Null`
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Type chain describing this value on the wire
    pub fn descriptor(&self) -> TypeDescriptor {
        match self {
            Self::Null => TypeDescriptor::named(names::NULL),
            Self::String(_) => TypeDescriptor::named(names::STRING),
            Self::Buffer(_) => TypeDescriptor::named(names::BUFFER),
            Self::Array { element, .. } => TypeDescriptor::named(names::array_of(element)),
            Self::Struct(s) => s.descriptor.clone(),
            Self::Object(object) => object.descriptor(),
            Self::Callback(callback) => callback.descriptor().clone(),
            Self::Exception(e) => TypeDescriptor::named(e.type_name.clone()),
            primitive => TypeDescriptor::named(primitive.primitive_name().unwrap_or(names::NULL)),
        }
    }

    /// Most-derived type name of this value
    pub fn type_name(&self) -> String {
        self.descriptor().name().to_string()
    }

    /// Name of the primitive type, if this is a primitive
    pub fn primitive_name(&self) -> Option<&'static str> {
        Some(match self {
            Self::Bool(_) => "bool",
            Self::Char(_) => "char",
            Self::I8(_) => "i8",
            Self::I16(_) => "i16",
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::U8(_) => "u8",
            Self::U16(_) => "u16",
            Self::U32(_) => "u32",
            Self::U64(_) => "u64",
            Self::F32(_) => "f32",
            Self::F64(_) => "f64",
            _ => return None,
        })
    }

    /// Text form of a primitive, if this is a primitive
    pub fn primitive_text(&self) -> Option<String> {
        Some(match self {
            Self::Bool(v) => v.to_string(),
            Self::Char(v) => v.to_string(),
            Self::I8(v) => v.to_string(),
            Self::I16(v) => v.to_string(),
            Self::I32(v) => v.to_string(),
            Self::I64(v) => v.to_string(),
            Self::U8(v) => v.to_string(),
            Self::U16(v) => v.to_string(),
            Self::U32(v) => v.to_string(),
            Self::U64(v) => v.to_string(),
            Self::F32(v) => v.to_string(),
            Self::F64(v) => v.to_string(),
            _ => return None,
        })
    }

    /// Parse the text form of a primitive
    pub fn parse_primitive(type_name: &str, text: &str) -> Result<Self, ProtocolError> {
        fn parse<T: std::str::FromStr>(type_name: &str, text: &str) -> Result<T, ProtocolError> {
            text.parse().map_err(|_| {
                ProtocolError::InvalidFrame(format!("cannot parse {:?} as {}", text, type_name))
            })
        }

        Ok(match type_name {
            "bool" => Self::Bool(parse(type_name, text)?),
            "char" => Self::Char(parse(type_name, text)?),
            "i8" => Self::I8(parse(type_name, text)?),
            "i16" => Self::I16(parse(type_name, text)?),
            "i32" => Self::I32(parse(type_name, text)?),
            "i64" => Self::I64(parse(type_name, text)?),
            "u8" => Self::U8(parse(type_name, text)?),
            "u16" => Self::U16(parse(type_name, text)?),
            "u32" => Self::U32(parse(type_name, text)?),
            "u64" => Self::U64(parse(type_name, text)?),
            "f32" => Self::F32(parse(type_name, text)?),
            "f64" => Self::F64(parse(type_name, text)?),
            other => {
                return Err(ProtocolError::Unsupported(format!(
                    "{} is not a primitive type",
                    other
                )))
            }
        })
    }

    /// Convert into a concrete Rust type
    pub fn into_typed<T: FromValue>(self) -> crate::Result<T> {
        T::from_value(self)
    }
}

macro_rules! primitive_conversions {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }

            impl FromValue for $ty {
                fn from_value(value: Value) -> crate::Result<Self> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(mismatch(stringify!($ty), &other)),
                    }
                }
            }
        )*
    };
}

/// Conversion out of a [`Value`]
pub trait FromValue: Sized {
    /// Convert, failing with a type mismatch
    fn from_value(value: Value) -> crate::Result<Self>;
}

fn mismatch(expected: &str, found: &Value) -> RemotingError {
    RemotingError::TypeMismatch {
        expected: expected.to_string(),
        found: found.type_name(),
    }
}

primitive_conversions! {
    bool => Bool,
    char => Char,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    String => String,
    Bytes => Buffer,
    StructValue => Struct,
    ObjectRef => Object,
    Callback => Callback,
    RemoteException => Exception,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Buffer(Bytes::from(value))
    }
}

impl From<Proxy> for Value {
    fn from(value: Proxy) -> Self {
        Self::Object(ObjectRef::Proxy(value))
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Self::Null
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> crate::Result<Self> {
        Ok(value)
    }
}

impl FromValue for () {
    fn from_value(value: Value) -> crate::Result<Self> {
        match value {
            Value::Null => Ok(()),
            other => Err(mismatch("null", &other)),
        }
    }
}

impl FromValue for Proxy {
    fn from_value(value: Value) -> crate::Result<Self> {
        match value {
            Value::Object(ObjectRef::Proxy(proxy)) => Ok(proxy),
            other => Err(mismatch(names::REMOTE_OBJECT, &other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> crate::Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> crate::Result<Self> {
        match value {
            Value::Array { items, .. } => items.into_iter().map(T::from_value).collect(),
            other => Err(mismatch("array", &other)),
        }
    }
}

/// Positional method arguments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    /// Create an empty argument list
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no arguments
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append an argument
    pub fn push(&mut self, value: impl Into<Value>) {
        self.0.push(value.into());
    }

    /// Borrow an argument
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Convert a copy of an argument into a concrete type
    pub fn get<T: FromValue>(&self, index: usize) -> crate::Result<T> {
        let value = self
            .0
            .get(index)
            .cloned()
            .ok_or_else(|| RemotingError::dispatch(format!("missing argument {}", index)))?;
        T::from_value(value)
    }

    /// Replace an argument, used for by-reference parameters
    pub fn set(&mut self, index: usize, value: impl Into<Value>) -> crate::Result<()> {
        let slot = self
            .0
            .get_mut(index)
            .ok_or_else(|| RemotingError::dispatch(format!("missing argument {}", index)))?;
        *slot = value.into();
        Ok(())
    }

    /// Type chains of every argument
    pub fn descriptors(&self) -> Vec<TypeDescriptor> {
        self.0.iter().map(Value::descriptor).collect()
    }

    /// Iterate the arguments
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }

    /// Borrow the arguments as a slice
    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    /// Take the arguments
    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl IntoIterator for Args {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl std::ops::Index<usize> for Args {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.0[index]
    }
}
