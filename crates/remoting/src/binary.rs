//! Binary value serializer
//!
//! Layouts, all integers little-endian `i32`, strings 7-bit length + UTF-8:
//!
//! ```text
//! type       := i32 count, string name*             most-derived first
//! value      := u8 tag, body
//! Null       := -
//! Value      := type, string text
//! String     := string
//! RemoteObject := i32 id, type
//! Exception  := string type, string message, string stack,
//!               i32 count, Exception*, u8 has_inner, Exception?
//! Buffer     := i32 len, bytes
//! Array      := type, i32 len, value*
//! Callback   := i32 id, type
//! Struct     := type, i32 count, (string name, value)*
//! ```
//!
//! Command messages on the `Commands` channel:
//!
//! ```text
//! Get        := [0] string name
//! Call       := [1] i32 target, string method, i32 count, (type, value)*
//! Result     := [2] value                                  reply to Get
//! Result     := [2] i32 out_count, (i32 index, value)*, value   reply to Call
//! Exception  := [3] Exception
//! Event      := [4] i32 id, i32 count, value*              on `Events`
//! ```

use crate::marshal::Marshal;
use crate::object::Reply;
use crate::value::{Args, RemoteException, StructValue, Value};
use crate::{RemotingError, Result};
use futures::future::BoxFuture;
use remoting_proto::{names, ByteSource, Command, ProtocolError, TypeDescriptor, ValueTag, WireWriter};

/// Decoded `Call` request
#[derive(Debug, Clone, PartialEq)]
pub struct CallMessage {
    /// Lease id of the target object
    pub target: i32,
    /// Method name
    pub method: String,
    /// Declared argument types
    pub signature: Vec<TypeDescriptor>,
    /// Argument values
    pub args: Args,
}

/// Record a dispatch failure and stand in `Null` so reading can go on
fn defer_unresolved(result: Result<Value>, unresolved: &mut Option<RemotingError>) -> Result<Value> {
    match result {
        Err(e @ RemotingError::Dispatch(_)) => {
            unresolved.get_or_insert(e);
            Ok(Value::Null)
        }
        other => other,
    }
}

/// Binary serializer bound to one end's [`Marshal`]
#[derive(Clone, Copy)]
pub struct BinarySerializer<'a> {
    marshal: &'a dyn Marshal,
}

impl<'a> BinarySerializer<'a> {
    /// Create a serializer resolving objects through `marshal`
    pub fn new(marshal: &'a dyn Marshal) -> Self {
        Self { marshal }
    }

    /// Write a type chain
    pub fn write_type(&self, w: &mut WireWriter, descriptor: &TypeDescriptor) -> Result<()> {
        w.put_len(descriptor.names().len())?;
        for name in descriptor.names() {
            w.put_string(name);
        }
        Ok(())
    }

    /// Read a type chain as sent
    pub async fn read_type(&self, r: &mut dyn ByteSource) -> Result<TypeDescriptor> {
        let count = r.read_len().await?;
        let mut chain = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            chain.push(r.read_string().await?);
        }
        Ok(TypeDescriptor::new(chain))
    }

    /// Write one value
    pub fn write_value(&self, w: &mut WireWriter, value: &Value) -> Result<()> {
        match value {
            Value::Null => {
                w.put_u8(ValueTag::Null as u8);
            }
            Value::String(s) => {
                w.put_u8(ValueTag::String as u8).put_string(s);
            }
            Value::Buffer(bytes) => {
                w.put_u8(ValueTag::Buffer as u8).put_len(bytes.len())?.put_slice(bytes);
            }
            Value::Array { element, items } => {
                w.put_u8(ValueTag::Array as u8);
                self.write_type(w, &TypeDescriptor::named(names::array_of(element)))?;
                w.put_len(items.len())?;
                for item in items {
                    self.write_value(w, item)?;
                }
            }
            Value::Struct(s) => {
                w.put_u8(ValueTag::Struct as u8);
                self.write_type(w, &s.descriptor)?;
                w.put_len(s.fields.len())?;
                for (name, field) in &s.fields {
                    w.put_string(name);
                    self.write_value(w, field)?;
                }
            }
            Value::Object(object) => {
                let (id, descriptor) = self.marshal.export_object(object)?;
                w.put_u8(ValueTag::RemoteObject as u8).put_i32(id);
                self.write_type(w, &descriptor)?;
            }
            Value::Callback(callback) => {
                let id = self.marshal.export_callback(callback)?;
                w.put_u8(ValueTag::Callback as u8).put_i32(id);
                self.write_type(w, callback.descriptor())?;
            }
            Value::Exception(exception) => {
                w.put_u8(ValueTag::Exception as u8);
                self.write_exception(w, exception)?;
            }
            primitive => {
                let (name, text) = primitive
                    .primitive_name()
                    .zip(primitive.primitive_text())
                    .ok_or_else(|| ProtocolError::Unsupported(format!("{:?}", primitive)))?;
                w.put_u8(ValueTag::Value as u8);
                self.write_type(w, &TypeDescriptor::named(name))?;
                w.put_string(&text);
            }
        }
        Ok(())
    }

    /// Read one value.
    ///
    /// An object or callback the marshal cannot resolve fails the read with
    /// a dispatch error, but only after the whole value has been consumed.
    pub fn read_value<'s>(&'s self, r: &'s mut dyn ByteSource) -> BoxFuture<'s, Result<Value>> {
        Box::pin(async move {
            let mut unresolved = None;
            let value = self.read_nested(r, &mut unresolved).await?;
            match unresolved {
                Some(e) => Err(e),
                None => Ok(value),
            }
        })
    }

    fn read_nested<'s>(
        &'s self,
        r: &'s mut dyn ByteSource,
        unresolved: &'s mut Option<RemotingError>,
    ) -> BoxFuture<'s, Result<Value>> {
        Box::pin(async move {
            let tag = ValueTag::try_from(r.read_u8().await?)?;

            Ok(match tag {
                ValueTag::Null => Value::Null,
                ValueTag::Value => {
                    let descriptor = self.read_type(r).await?;
                    let text = r.read_string().await?;
                    Value::parse_primitive(descriptor.name(), &text)?
                }
                ValueTag::String => Value::String(r.read_string().await?),
                ValueTag::Buffer => {
                    let len = r.read_len().await?;
                    Value::Buffer(r.read_bytes(len).await?)
                }
                ValueTag::Array => {
                    let descriptor = self.read_type(r).await?;
                    let element = names::element_of(descriptor.name())
                        .ok_or_else(|| {
                            ProtocolError::InvalidFrame(format!("{} is not an array type", descriptor.name()))
                        })?
                        .to_string();
                    let len = r.read_len().await?;
                    let mut items = Vec::with_capacity(len.min(1024));
                    for _ in 0..len {
                        items.push(self.read_nested(&mut *r, &mut *unresolved).await?);
                    }
                    Value::Array { element, items }
                }
                ValueTag::Struct => {
                    let descriptor = self.read_type(r).await?;
                    let count = r.read_len().await?;
                    let mut fields = Vec::with_capacity(count.min(256));
                    for _ in 0..count {
                        let name = r.read_string().await?;
                        let field = self.read_nested(&mut *r, &mut *unresolved).await?;
                        fields.push((name, field));
                    }
                    Value::Struct(StructValue { descriptor, fields })
                }
                ValueTag::RemoteObject => {
                    let id = r.read_i32().await?;
                    let descriptor = self.read_type(r).await?;
                    let imported = self.marshal.import_object(id, descriptor).map(Value::Object);
                    defer_unresolved(imported, unresolved)?
                }
                ValueTag::Callback => {
                    let id = r.read_i32().await?;
                    let descriptor = self.read_type(r).await?;
                    let imported = self.marshal.import_callback(id, descriptor).map(Value::Callback);
                    defer_unresolved(imported, unresolved)?
                }
                ValueTag::Exception => Value::Exception(self.read_exception(r).await?),
            })
        })
    }

    /// Write an exception body
    pub fn write_exception(&self, w: &mut WireWriter, exception: &RemoteException) -> Result<()> {
        w.put_string(&exception.type_name)
            .put_string(&exception.message)
            .put_string(&exception.stack_trace);
        w.put_len(exception.aggregated.len())?;
        for aggregated in &exception.aggregated {
            self.write_exception(w, aggregated)?;
        }
        match &exception.inner {
            Some(inner) => {
                w.put_u8(1);
                self.write_exception(w, inner)?;
            }
            None => {
                w.put_u8(0);
            }
        }
        Ok(())
    }

    /// Read an exception body
    pub fn read_exception<'s>(
        &'s self,
        r: &'s mut dyn ByteSource,
    ) -> BoxFuture<'s, Result<RemoteException>> {
        Box::pin(async move {
            let type_name = r.read_string().await?;
            let message = r.read_string().await?;
            let stack_trace = r.read_string().await?;

            let count = r.read_len().await?;
            let mut aggregated = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                aggregated.push(self.read_exception(&mut *r).await?);
            }

            let inner = match r.read_u8().await? {
                0 => None,
                _ => Some(Box::new(self.read_exception(&mut *r).await?)),
            };

            Ok(RemoteException {
                type_name,
                message,
                stack_trace,
                inner,
                aggregated,
            })
        })
    }

    /// Encode a `Get` request
    pub fn encode_get(&self, name: &str) -> WireWriter {
        let mut w = WireWriter::new();
        w.put_u8(Command::Get as u8).put_string(name);
        w
    }

    /// Encode a `Call` request, sending each argument's own type chain
    pub fn encode_call(&self, target: i32, method: &str, args: &Args) -> Result<WireWriter> {
        let mut w = WireWriter::new();
        w.put_u8(Command::Call as u8).put_i32(target).put_string(method);
        w.put_len(args.len())?;
        for arg in args.iter() {
            self.write_type(&mut w, &arg.descriptor())?;
            self.write_value(&mut w, arg)?;
        }
        Ok(w)
    }

    /// Decode a `Call` request after its command byte
    pub async fn decode_call(&self, r: &mut dyn ByteSource) -> Result<CallMessage> {
        let target = r.read_i32().await?;
        let method = r.read_string().await?;
        let count = r.read_len().await?;

        let mut signature = Vec::with_capacity(count.min(64));
        let mut args = Args::new();
        let mut unresolved = None;
        for _ in 0..count {
            signature.push(self.read_type(r).await?);
            // An argument naming an unknown object is fully consumed, keep
            // reading so the next command starts at a message boundary
            match self.read_value(&mut *r).await {
                Ok(value) => args.push(value),
                Err(e @ RemotingError::Dispatch(_)) => {
                    unresolved.get_or_insert(e);
                    args.push(Value::Null);
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(e) = unresolved {
            return Err(e);
        }

        Ok(CallMessage {
            target,
            method,
            signature,
            args,
        })
    }

    /// Encode the reply to a `Get`
    pub fn encode_get_result(&self, value: &Value) -> Result<WireWriter> {
        let mut w = WireWriter::new();
        w.put_u8(Command::Result as u8);
        self.write_value(&mut w, value)?;
        Ok(w)
    }

    /// Encode the reply to a `Call`
    pub fn encode_call_result(&self, reply: &Reply) -> Result<WireWriter> {
        let mut w = WireWriter::new();
        w.put_u8(Command::Result as u8);
        w.put_len(reply.out.len())?;
        for (index, value) in &reply.out {
            w.put_len(*index)?;
            self.write_value(&mut w, value)?;
        }
        self.write_value(&mut w, &reply.value)?;
        Ok(w)
    }

    /// Encode a failure reply
    pub fn encode_exception(&self, exception: &RemoteException) -> Result<WireWriter> {
        let mut w = WireWriter::new();
        w.put_u8(Command::Exception as u8);
        self.write_exception(&mut w, exception)?;
        Ok(w)
    }

    /// Read the reply to a `Get`
    pub async fn decode_get_result(&self, r: &mut dyn ByteSource) -> Result<Value> {
        match self.read_response_tag(r).await? {
            Command::Result => self.read_value(r).await,
            _ => Err(RemotingError::from_exception(self.read_exception(r).await?)),
        }
    }

    /// Read the reply to a `Call`
    pub async fn decode_call_result(&self, r: &mut dyn ByteSource) -> Result<Reply> {
        match self.read_response_tag(r).await? {
            Command::Result => {
                let count = r.read_len().await?;
                let mut out = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let index = r.read_len().await?;
                    out.push((index, self.read_value(&mut *r).await?));
                }
                let value = self.read_value(r).await?;
                Ok(Reply { value, out })
            }
            _ => Err(RemotingError::from_exception(self.read_exception(r).await?)),
        }
    }

    async fn read_response_tag(&self, r: &mut dyn ByteSource) -> Result<Command> {
        match Command::try_from(r.read_u8().await?)? {
            command @ (Command::Result | Command::Exception) => Ok(command),
            other => Err(ProtocolError::InvalidFrame(format!("unexpected {:?} in response", other)).into()),
        }
    }

    /// Encode a callback invocation
    pub fn encode_event(&self, id: i32, args: &Args) -> Result<WireWriter> {
        let mut w = WireWriter::new();
        w.put_u8(Command::Event as u8).put_i32(id);
        w.put_len(args.len())?;
        for arg in args.iter() {
            self.write_value(&mut w, arg)?;
        }
        Ok(w)
    }

    /// Decode a callback invocation after its command byte
    pub async fn decode_event(&self, r: &mut dyn ByteSource) -> Result<(i32, Args)> {
        let id = r.read_i32().await?;
        let count = r.read_len().await?;
        let mut args = Args::new();
        for _ in 0..count {
            args.push(self.read_value(&mut *r).await?);
        }
        Ok((id, args))
    }
}

#[cfg(test)]
mod tests;
