//! XML value serializer used by the HTTP transport
//!
//! Element shapes:
//!
//! ```text
//! <Null/>
//! <Value Type="i32">5</Value>                     primitives and strings
//! <Buffer>base64</Buffer>
//! <Array Type="element" Length="n">value*</Array>
//! <Struct><Type .../><Field Name="x">value</Field>*</Struct>
//! <RemoteObject Id="n"><Type FullName="..."><Parent FullName="..."/>*</Type></RemoteObject>
//! <Callback Id="n"><Type .../></Callback>
//! <Exception Type="..."><Message/><StackTrace/>
//!     <InnerException>exception</InnerException>?
//!     <AggregatedExceptions>exception*</AggregatedExceptions>?</Exception>
//! ```
//!
//! Documents:
//!
//! ```text
//! <Call Method="name"><Parameter Type="...">value</Parameter>*</Call>
//! <Result>value</Result>                                       get reply
//! <Response><Result>value</Result><Parameter Index="i">value</Parameter>*</Response>
//! <Result><Invocation><Parameter Index="i">value</Parameter>*</Invocation>*</Result>
//! ```

pub mod dom;

use crate::marshal::Marshal;
use crate::object::Reply;
use crate::value::{Args, RemoteException, StructValue, Value};
use crate::{RemotingError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use dom::{xml_error, Element};
use remoting_proto::{names, TypeDescriptor};

/// Decoded `Call` document
#[derive(Debug, Clone, PartialEq)]
pub struct XmlCall {
    /// Method name
    pub method: String,
    /// Declared parameter types
    pub signature: Vec<TypeDescriptor>,
    /// Argument values
    pub args: Args,
}

/// XML serializer bound to one end's [`Marshal`]
#[derive(Clone, Copy)]
pub struct XmlSerializer<'a> {
    marshal: &'a dyn Marshal,
}

impl<'a> XmlSerializer<'a> {
    /// Create a serializer resolving objects through `marshal`
    pub fn new(marshal: &'a dyn Marshal) -> Self {
        Self { marshal }
    }

    /// `<Type>` element for a chain
    pub fn write_type(&self, descriptor: &TypeDescriptor) -> Element {
        descriptor.parents().iter().fold(
            Element::new("Type").attr("FullName", descriptor.name()),
            |ty, parent| ty.child(Element::new("Parent").attr("FullName", parent)),
        )
    }

    /// Chain from a `<Type>` element
    pub fn read_type(&self, element: &Element) -> Result<TypeDescriptor> {
        let mut chain = vec![element.require_attr("FullName")?.to_string()];
        for parent in element.find_all("Parent") {
            chain.push(parent.require_attr("FullName")?.to_string());
        }
        Ok(TypeDescriptor::new(chain))
    }

    /// Element for one value
    pub fn write_value(&self, value: &Value) -> Result<Element> {
        Ok(match value {
            Value::Null => Element::new("Null"),
            Value::String(s) => Element::new("Value")
                .attr("Type", names::STRING)
                .with_text(s.as_str()),
            Value::Buffer(bytes) => Element::new("Buffer").with_text(STANDARD.encode(bytes)),
            Value::Array { element, items } => {
                let mut array = Element::new("Array")
                    .attr("Type", element)
                    .attr("Length", items.len());
                for item in items {
                    array.push(self.write_value(item)?);
                }
                array
            }
            Value::Struct(s) => {
                let mut out = Element::new("Struct").child(self.write_type(&s.descriptor));
                for (name, field) in &s.fields {
                    out.push(Element::new("Field").attr("Name", name).child(self.write_value(field)?));
                }
                out
            }
            Value::Object(object) => {
                let (id, descriptor) = self.marshal.export_object(object)?;
                Element::new("RemoteObject")
                    .attr("Id", id)
                    .child(self.write_type(&descriptor))
            }
            Value::Callback(callback) => {
                let id = self.marshal.export_callback(callback)?;
                Element::new("Callback")
                    .attr("Id", id)
                    .child(self.write_type(callback.descriptor()))
            }
            Value::Exception(exception) => self.write_exception(exception),
            primitive => {
                let (name, text) = primitive
                    .primitive_name()
                    .zip(primitive.primitive_text())
                    .ok_or_else(|| xml_error(format!("cannot encode {:?}", primitive)))?;
                Element::new("Value").attr("Type", name).with_text(text)
            }
        })
    }

    /// Value from its element
    pub fn read_value(&self, element: &Element) -> Result<Value> {
        Ok(match element.name.as_str() {
            "Null" => Value::Null,
            "Value" => match element.require_attr("Type")? {
                names::STRING => Value::String(element.text.clone()),
                // A whitespace char is its own text
                ty @ "char" => Value::parse_primitive(ty, &element.text)?,
                ty => Value::parse_primitive(ty, element.text.trim())?,
            },
            "Buffer" => {
                let bytes = STANDARD
                    .decode(element.text.trim())
                    .map_err(|e| xml_error(format!("invalid base64 buffer: {}", e)))?;
                Value::Buffer(Bytes::from(bytes))
            }
            "Array" => {
                let length: usize = element.parse_attr("Length")?;
                if length != element.children.len() {
                    return Err(xml_error(format!(
                        "array declares {} items but has {}",
                        length,
                        element.children.len()
                    )));
                }
                let items = element
                    .children
                    .iter()
                    .map(|item| self.read_value(item))
                    .collect::<Result<Vec<_>>>()?;
                Value::Array {
                    element: element.require_attr("Type")?.to_string(),
                    items,
                }
            }
            "Struct" => {
                let descriptor = self.read_type(self.required(element, "Type")?)?;
                let mut fields = Vec::new();
                for field in element.find_all("Field") {
                    let name = field.require_attr("Name")?.to_string();
                    fields.push((name, self.read_value(field.single_child()?)?));
                }
                Value::Struct(StructValue { descriptor, fields })
            }
            "RemoteObject" => {
                let id = element.parse_attr("Id")?;
                let descriptor = self.read_type(self.required(element, "Type")?)?;
                Value::Object(self.marshal.import_object(id, descriptor)?)
            }
            "Callback" => {
                let id = element.parse_attr("Id")?;
                let descriptor = self.read_type(self.required(element, "Type")?)?;
                Value::Callback(self.marshal.import_callback(id, descriptor)?)
            }
            "Exception" => Value::Exception(self.read_exception(element)?),
            other => return Err(xml_error(format!("unknown value element <{}>", other))),
        })
    }

    /// `<Exception>` element
    pub fn write_exception(&self, exception: &RemoteException) -> Element {
        let mut out = Element::new("Exception")
            .attr("Type", &exception.type_name)
            .child(Element::new("Message").with_text(exception.message.as_str()))
            .child(Element::new("StackTrace").with_text(exception.stack_trace.as_str()));

        if let Some(inner) = &exception.inner {
            out.push(Element::new("InnerException").child(self.write_exception(inner)));
        }
        if !exception.aggregated.is_empty() {
            out.push(
                exception
                    .aggregated
                    .iter()
                    .fold(Element::new("AggregatedExceptions"), |list, e| {
                        list.child(self.write_exception(e))
                    }),
            );
        }
        out
    }

    /// Failure from an `<Exception>` element
    pub fn read_exception(&self, element: &Element) -> Result<RemoteException> {
        let text = |name: &str| element.find(name).map(|e| e.text.clone()).unwrap_or_default();

        let inner = match element.find("InnerException") {
            Some(wrapper) => Some(Box::new(self.read_exception(wrapper.single_child()?)?)),
            None => None,
        };
        let aggregated = match element.find("AggregatedExceptions") {
            Some(list) => list
                .children
                .iter()
                .map(|e| self.read_exception(e))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(RemoteException {
            type_name: element.require_attr("Type")?.to_string(),
            message: text("Message"),
            stack_trace: text("StackTrace"),
            inner,
            aggregated,
        })
    }

    fn required<'e>(&self, element: &'e Element, name: &str) -> Result<&'e Element> {
        element
            .find(name)
            .ok_or_else(|| xml_error(format!("<{}> is missing <{}>", element.name, name)))
    }

    /// `Call` document
    pub fn encode_call(&self, method: &str, args: &Args) -> Result<String> {
        let mut call = Element::new("Call").attr("Method", method);
        for arg in args.iter() {
            call.push(
                Element::new("Parameter")
                    .attr("Type", arg.type_name())
                    .child(self.write_value(arg)?),
            );
        }
        Ok(call.to_xml())
    }

    /// Parse a `Call` document
    pub fn decode_call(&self, body: &str) -> Result<XmlCall> {
        let root = Element::parse(body)?;
        expect_root(&root, "Call")?;

        let mut signature = Vec::new();
        let mut args = Args::new();
        for parameter in root.find_all("Parameter") {
            let value = self.read_value(parameter.single_child()?)?;
            signature.push(match parameter.get_attr("Type") {
                Some(ty) if !value.is_null() => value_chain(ty, &value),
                Some(ty) => TypeDescriptor::named(ty),
                None => value.descriptor(),
            });
            args.push(value);
        }

        Ok(XmlCall {
            method: root.require_attr("Method")?.to_string(),
            signature,
            args,
        })
    }

    /// Reply to a `Get`
    pub fn encode_get_result(&self, value: &Value) -> Result<String> {
        Ok(Element::new("Result").child(self.write_value(value)?).to_xml())
    }

    /// Parse the reply to a `Get`
    pub fn decode_get_result(&self, body: &str) -> Result<Value> {
        let root = Element::parse(body)?;
        if root.name == "Exception" {
            return Err(RemotingError::from_exception(self.read_exception(&root)?));
        }
        expect_root(&root, "Result")?;
        self.read_value(root.single_child()?)
    }

    /// Reply to a `Call`
    pub fn encode_response(&self, reply: &Reply) -> Result<String> {
        let mut response = Element::new("Response")
            .child(Element::new("Result").child(self.write_value(&reply.value)?));
        for (index, value) in &reply.out {
            response.push(parameter(*index, self.write_value(value)?));
        }
        Ok(response.to_xml())
    }

    /// Failure reply
    pub fn encode_exception(&self, exception: &RemoteException) -> String {
        self.write_exception(exception).to_xml()
    }

    /// Parse the reply to a `Call`
    pub fn decode_response(&self, body: &str) -> Result<Reply> {
        let root = Element::parse(body)?;
        if root.name == "Exception" {
            return Err(RemotingError::from_exception(self.read_exception(&root)?));
        }
        expect_root(&root, "Response")?;

        let result = root
            .find("Result")
            .ok_or_else(|| xml_error("<Response> is missing <Result>"))?;
        let value = self.read_value(result.single_child()?)?;
        let out = self.read_parameters(&root)?;
        Ok(Reply { value, out })
    }

    /// Pending callback invocations
    pub fn encode_invocations(&self, invocations: &[Args]) -> Result<String> {
        let mut result = Element::new("Result");
        for args in invocations {
            let mut invocation = Element::new("Invocation");
            for (index, value) in args.iter().enumerate() {
                invocation.push(parameter(index, self.write_value(value)?));
            }
            result.push(invocation);
        }
        Ok(result.to_xml())
    }

    /// Parse pending callback invocations
    pub fn decode_invocations(&self, body: &str) -> Result<Vec<Args>> {
        let root = Element::parse(body)?;
        expect_root(&root, "Result")?;

        root.find_all("Invocation")
            .map(|invocation| {
                let mut parameters = self.read_parameters(invocation)?;
                parameters.sort_by_key(|(index, _)| *index);
                Ok(Args::from(parameters.into_iter().map(|(_, v)| v).collect::<Vec<_>>()))
            })
            .collect()
    }

    fn read_parameters(&self, parent: &Element) -> Result<Vec<(usize, Value)>> {
        parent
            .find_all("Parameter")
            .map(|p| Ok((p.parse_attr("Index")?, self.read_value(p.single_child()?)?)))
            .collect()
    }
}

fn parameter(index: usize, value: Element) -> Element {
    Element::new("Parameter").attr("Index", index).child(value)
}

fn expect_root(root: &Element, name: &str) -> Result<()> {
    if root.name == name {
        Ok(())
    } else {
        Err(xml_error(format!("expected <{}>, found <{}>", name, root.name)))
    }
}

/// Declared parameter type, widened with the value's own chain when they agree
fn value_chain(declared: &str, value: &Value) -> TypeDescriptor {
    let own = value.descriptor();
    if own.is(declared) {
        own
    } else {
        TypeDescriptor::named(declared)
    }
}

#[cfg(test)]
mod tests;
