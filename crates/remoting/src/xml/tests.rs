use super::*;
use crate::args;
use crate::callback::Callback;
use crate::marshal::testing::LoopbackMarshal;
use crate::object::{Exposed, ObjectRef, RemoteClass};

fn roundtrip(marshal: &LoopbackMarshal, value: &Value) -> Value {
    let serializer = XmlSerializer::new(marshal);
    let xml = serializer.write_value(value).unwrap().to_xml();
    serializer.read_value(&Element::parse(&xml).unwrap()).unwrap()
}

#[test]
fn test_value_shapes() {
    let marshal = LoopbackMarshal::default();
    let serializer = XmlSerializer::new(&marshal);

    let xml = |v: Value| serializer.write_value(&v).unwrap().to_xml();
    assert_eq!(xml(Value::Null), "<Null/>");
    assert_eq!(xml(Value::I32(5)), "<Value Type=\"i32\">5</Value>");
    assert_eq!(xml(Value::from("hi")), "<Value Type=\"string\">hi</Value>");
    assert_eq!(xml(Value::from(vec![1u8, 2, 3])), "<Buffer>AQID</Buffer>");
    assert_eq!(
        xml(Value::array("i32", [1, 2])),
        "<Array Type=\"i32\" Length=\"2\"><Value Type=\"i32\">1</Value><Value Type=\"i32\">2</Value></Array>"
    );
}

#[test]
fn test_composite_roundtrip() {
    let marshal = LoopbackMarshal::default();
    let values = [
        Value::from(" spaced <&> "),
        Value::from(String::new()),
        Value::Bool(false),
        Value::F64(2.25),
        Value::array("string", ["a", "b"]),
        Value::Struct(
            StructValue {
                descriptor: TypeDescriptor::new(["demo::Point3", "demo::Point"]),
                fields: Vec::new(),
            }
            .field("x", 1)
            .field("tags", Value::array("string", ["t"]))
            .field("none", Value::Null),
        ),
        Value::Exception(
            RemoteException::new("demo::Outer", "outer")
                .with_stack_trace("at main")
                .with_inner(RemoteException::msg("inner"))
                .with_aggregated(vec![RemoteException::msg("a"), RemoteException::msg("b")]),
        ),
    ];

    for value in values {
        assert_eq!(roundtrip(&marshal, &value), value);
    }
}

#[test]
fn test_char_roundtrip_keeps_whitespace() {
    let marshal = LoopbackMarshal::default();
    for c in [' ', '\n', '\t', 'a', '<', '&', 'é'] {
        assert_eq!(roundtrip(&marshal, &Value::Char(c)), Value::Char(c), "{:?}", c);
    }

    let serializer = XmlSerializer::new(&marshal);
    let padded = Element::parse("<Value Type=\"i32\"> 7 </Value>").unwrap();
    assert_eq!(serializer.read_value(&padded).unwrap(), Value::I32(7));
}

#[test]
fn test_struct_carries_type_chain() {
    let marshal = LoopbackMarshal::default();
    let serializer = XmlSerializer::new(&marshal);

    let point = Value::Struct(StructValue::new("demo::Point").field("x", 1));
    let xml = serializer.write_value(&point).unwrap().to_xml();
    assert!(xml.starts_with("<Struct><Type FullName=\"demo::Point\"/>"), "{}", xml);
}

struct Widget;

#[test]
fn test_object_and_callback_roundtrip() {
    let marshal = LoopbackMarshal::default();
    let class = RemoteClass::builder::<Widget>("demo::Widget").build();
    let widget = Exposed::new(Widget, class);

    match roundtrip(&marshal, &Value::from(widget.clone())) {
        Value::Object(ObjectRef::Exposed(exposed)) => assert!(exposed.ptr_eq(&widget)),
        other => panic!("unexpected value {other:?}"),
    }

    let callback = Callback::new(|_| {});
    assert_eq!(
        roundtrip(&marshal, &Value::Callback(callback.clone())),
        Value::Callback(callback)
    );
}

#[test]
fn test_type_element_lists_parents() {
    let marshal = LoopbackMarshal::default();
    let serializer = XmlSerializer::new(&marshal);

    let descriptor = TypeDescriptor::new(["demo::Dog", "demo::Animal", "demo::Object"]);
    let element = serializer.write_type(&descriptor);
    assert_eq!(
        element.to_xml(),
        "<Type FullName=\"demo::Dog\"><Parent FullName=\"demo::Animal\"/><Parent FullName=\"demo::Object\"/></Type>"
    );
    assert_eq!(serializer.read_type(&element).unwrap(), descriptor);
}

#[test]
fn test_call_document() {
    let marshal = LoopbackMarshal::default();
    let serializer = XmlSerializer::new(&marshal);

    let body = serializer.encode_call("Add", &args![2, "x", ()]).unwrap();
    assert!(body.starts_with("<Call Method=\"Add\"><Parameter Type=\"i32\">"));

    let call = serializer.decode_call(&body).unwrap();
    assert_eq!(call.method, "Add");
    assert_eq!(call.args, args![2, "x", ()]);
    let names: Vec<_> = call.signature.iter().map(|d| d.name().to_string()).collect();
    assert_eq!(names, ["i32", "string", "null"]);
}

#[test]
fn test_response_document() {
    let marshal = LoopbackMarshal::default();
    let serializer = XmlSerializer::new(&marshal);

    let reply = Reply::new("done").with_out(1, 42);
    let body = serializer.encode_response(&reply).unwrap();
    assert_eq!(
        body,
        "<Response><Result><Value Type=\"string\">done</Value></Result><Parameter Index=\"1\"><Value Type=\"i32\">42</Value></Parameter></Response>"
    );
    assert_eq!(serializer.decode_response(&body).unwrap(), reply);
}

#[test]
fn test_exception_document_maps_error_kind() {
    let marshal = LoopbackMarshal::default();
    let serializer = XmlSerializer::new(&marshal);

    let body = serializer.encode_exception(&RemotingError::AccessDenied("Secret".into()).to_exception());
    assert!(matches!(
        serializer.decode_response(&body),
        Err(RemotingError::AccessDenied(msg)) if msg.contains("Secret")
    ));

    let body = serializer.encode_exception(&RemoteException::msg("boom"));
    assert!(matches!(
        serializer.decode_get_result(&body),
        Err(RemotingError::Remote(e)) if e.message == "boom"
    ));
}

#[test]
fn test_invocations_document() {
    let marshal = LoopbackMarshal::default();
    let serializer = XmlSerializer::new(&marshal);

    let batch = vec![args![1, "one"], args![], args![3]];
    let body = serializer.encode_invocations(&batch).unwrap();
    assert_eq!(serializer.decode_invocations(&body).unwrap(), batch);
    assert!(serializer.decode_invocations("<Result/>").unwrap().is_empty());
}

#[test]
fn test_malformed_values() {
    let marshal = LoopbackMarshal::default();
    let serializer = XmlSerializer::new(&marshal);

    for xml in [
        "<Value Type=\"i32\">five</Value>",
        "<Value>1</Value>",
        "<Array Type=\"i32\" Length=\"2\"><Null/></Array>",
        "<Buffer>!!!</Buffer>",
        "<Widget/>",
        "<RemoteObject Id=\"1\"/>",
    ] {
        let element = Element::parse(xml).unwrap();
        assert!(serializer.read_value(&element).is_err(), "{xml} should fail");
    }

    assert!(serializer.decode_call("<Result/>").is_err());
}
