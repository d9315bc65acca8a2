use super::*;
use crate::args;
use crate::callback::Callback;
use crate::marshal::testing::LoopbackMarshal;
use crate::object::{Exposed, ObjectRef, RemoteClass};
use bytes::Bytes;
use proptest::prelude::*;
use remoting_proto::BufferSource;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

async fn roundtrip(marshal: &LoopbackMarshal, value: &Value) -> Value {
    let serializer = BinarySerializer::new(marshal);
    let mut w = WireWriter::new();
    serializer.write_value(&mut w, value).unwrap();

    let mut r = BufferSource::new(w.freeze());
    let read = serializer.read_value(&mut r).await.unwrap();
    assert_eq!(r.remaining(), 0);
    read
}

#[tokio::test]
async fn test_null_and_string_layout() {
    let marshal = LoopbackMarshal::default();
    let serializer = BinarySerializer::new(&marshal);

    let mut w = WireWriter::new();
    serializer.write_value(&mut w, &Value::Null).unwrap();
    serializer.write_value(&mut w, &Value::from("hi")).unwrap();
    assert_eq!(w.as_slice(), &[0, 2, 2, b'h', b'i']);
}

#[tokio::test]
async fn test_primitive_layout() {
    let marshal = LoopbackMarshal::default();
    let serializer = BinarySerializer::new(&marshal);

    let mut w = WireWriter::new();
    serializer.write_value(&mut w, &Value::I32(5)).unwrap();
    assert_eq!(w.as_slice(), &[1, 1, 0, 0, 0, 3, b'i', b'3', b'2', 1, b'5']);
}

#[tokio::test]
async fn test_array_layout_puts_type_before_length() {
    let marshal = LoopbackMarshal::default();
    let serializer = BinarySerializer::new(&marshal);

    let mut w = WireWriter::new();
    serializer.write_value(&mut w, &Value::array("u8", [7u8])).unwrap();
    assert_eq!(
        w.as_slice(),
        &[6, 1, 0, 0, 0, 4, b'[', b'u', b'8', b']', 1, 0, 0, 0, 1, 1, 0, 0, 0, 2, b'u', b'8', 1, b'7']
    );
}

#[tokio::test]
async fn test_composite_roundtrip() {
    let marshal = LoopbackMarshal::default();
    let values = [
        Value::Buffer(Bytes::from_static(b"\x00\x01\xff")),
        Value::array("string", ["a", "b"]),
        Value::Array {
            element: "[i32]".into(),
            items: vec![Value::array("i32", [1, 2]), Value::array("i32", Vec::<i32>::new())],
        },
        Value::Struct(
            StructValue::new("demo::Point")
                .field("x", 1.5f64)
                .field("label", Value::Null),
        ),
    ];

    for value in values {
        assert_eq!(roundtrip(&marshal, &value).await, value);
    }
}

#[tokio::test]
async fn test_exception_roundtrip() {
    let marshal = LoopbackMarshal::default();
    let exception = RemoteException::new("demo::Aggregate", "several")
        .with_stack_trace("at demo::run")
        .with_aggregated(vec![RemoteException::msg("one"), RemoteException::msg("two")])
        .with_inner(RemoteException::new("demo::Io", "disk").with_inner(RemoteException::msg("boom")));

    let value = Value::Exception(exception);
    assert_eq!(roundtrip(&marshal, &value).await, value);
}

struct Widget;

#[tokio::test]
async fn test_object_roundtrip_uses_marshal() {
    let marshal = LoopbackMarshal::default();
    let class = RemoteClass::builder::<Widget>("demo::Widget").build();
    let widget = Exposed::new(Widget, class);

    let read = roundtrip(&marshal, &Value::from(widget.clone())).await;
    match read {
        Value::Object(ObjectRef::Exposed(exposed)) => assert!(exposed.ptr_eq(&widget)),
        other => panic!("unexpected value {other:?}"),
    }
    assert_eq!(marshal.registry.len(), 1);
}

#[tokio::test]
async fn test_callback_roundtrip_uses_marshal() {
    let marshal = LoopbackMarshal::default();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let callback = Callback::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let read = roundtrip(&marshal, &Value::Callback(callback.clone())).await;
    assert_eq!(read, Value::Callback(callback));
    assert_eq!(marshal.relay.exported_count(), 1);
}

#[tokio::test]
async fn test_invalid_value_tag() {
    let marshal = LoopbackMarshal::default();
    let serializer = BinarySerializer::new(&marshal);

    let mut r = BufferSource::new(vec![99u8]);
    let err = serializer.read_value(&mut r).await.unwrap_err();
    assert!(matches!(
        err,
        RemotingError::Protocol(ProtocolError::InvalidTag { tag: 99, .. })
    ));
}

#[tokio::test]
async fn test_unparseable_primitive() {
    let marshal = LoopbackMarshal::default();
    let serializer = BinarySerializer::new(&marshal);

    let mut w = WireWriter::new();
    w.put_u8(ValueTag::Value as u8);
    serializer.write_type(&mut w, &TypeDescriptor::named("i32")).unwrap();
    w.put_string("five");

    let mut r = BufferSource::new(w.freeze());
    assert!(serializer.read_value(&mut r).await.is_err());

    let mut w = WireWriter::new();
    w.put_u8(ValueTag::Value as u8);
    serializer.write_type(&mut w, &TypeDescriptor::named("demo::Unknown")).unwrap();
    w.put_string("1");

    let mut r = BufferSource::new(w.freeze());
    assert!(matches!(
        serializer.read_value(&mut r).await,
        Err(RemotingError::Protocol(ProtocolError::Unsupported(_)))
    ));
}

#[tokio::test]
async fn test_call_message_roundtrip() {
    let marshal = LoopbackMarshal::default();
    let serializer = BinarySerializer::new(&marshal);

    let w = serializer.encode_call(3, "Add", &args![2, "x"]).unwrap();
    let bytes = w.freeze();
    assert_eq!(bytes[0], Command::Call as u8);

    let mut r = BufferSource::new(bytes.slice(1..));
    let call = serializer.decode_call(&mut r).await.unwrap();
    assert_eq!(call.target, 3);
    assert_eq!(call.method, "Add");
    assert_eq!(call.signature[0].name(), "i32");
    assert_eq!(call.signature[1].name(), "string");
    assert_eq!(call.args, args![2, "x"]);
}

#[tokio::test]
async fn test_call_with_unknown_object_is_fully_consumed() {
    let sender = LoopbackMarshal::default();
    let receiver = LoopbackMarshal::default();
    let class = RemoteClass::builder::<()>("demo::Thing").build();
    let thing = Exposed::new((), class);

    let w = BinarySerializer::new(&sender)
        .encode_call(1, "Use", &args![thing, 7])
        .unwrap();
    let bytes = w.freeze();

    let mut r = BufferSource::new(bytes.slice(1..));
    let err = BinarySerializer::new(&receiver).decode_call(&mut r).await.unwrap_err();
    assert!(matches!(err, RemotingError::Dispatch(_)));
    assert_eq!(r.remaining(), 0);
}

#[tokio::test]
async fn test_nested_unknown_object_is_fully_consumed() {
    let sender = LoopbackMarshal::default();
    let receiver = LoopbackMarshal::default();
    let class = RemoteClass::builder::<()>("demo::Thing").build();
    let thing = Exposed::new((), class);

    let pair = Value::Struct(StructValue {
        descriptor: TypeDescriptor::named("demo::Pair"),
        fields: vec![
            ("thing".to_string(), Value::from(thing.clone())),
            ("count".to_string(), Value::I32(2)),
        ],
    });
    let things = Value::array("demo::Thing", vec![thing.clone(), thing]);

    let w = BinarySerializer::new(&sender)
        .encode_call(1, "Use", &args![pair, things, 7])
        .unwrap();
    let bytes = w.freeze();

    let mut r = BufferSource::new(bytes.slice(1..));
    let err = BinarySerializer::new(&receiver).decode_call(&mut r).await.unwrap_err();
    assert!(matches!(err, RemotingError::Dispatch(_)));
    assert_eq!(r.remaining(), 0);
}

#[tokio::test]
async fn test_call_result_with_out_params() {
    let marshal = LoopbackMarshal::default();
    let serializer = BinarySerializer::new(&marshal);

    let reply = Reply::new(true).with_out(1, 42);
    let w = serializer.encode_call_result(&reply).unwrap();

    let mut r = BufferSource::new(w.freeze());
    assert_eq!(serializer.decode_call_result(&mut r).await.unwrap(), reply);
}

#[tokio::test]
async fn test_exception_response_maps_error_kind() {
    let marshal = LoopbackMarshal::default();
    let serializer = BinarySerializer::new(&marshal);

    let exception = RemotingError::dispatch("no object named 'missing'").to_exception();
    let w = serializer.encode_exception(&exception).unwrap();

    let mut r = BufferSource::new(w.freeze());
    assert!(matches!(
        serializer.decode_get_result(&mut r).await,
        Err(RemotingError::Dispatch(msg)) if msg.contains("missing")
    ));

    let w = serializer.encode_exception(&RemoteException::msg("boom")).unwrap();
    let mut r = BufferSource::new(w.freeze());
    assert!(matches!(
        serializer.decode_call_result(&mut r).await,
        Err(RemotingError::Remote(e)) if e.message == "boom"
    ));
}

#[tokio::test]
async fn test_event_layout() {
    let marshal = LoopbackMarshal::default();
    let serializer = BinarySerializer::new(&marshal);

    let w = serializer.encode_event(9, &args![3, 4]).unwrap();
    let bytes = w.freeze();
    assert_eq!(&bytes[..9], &[4, 9, 0, 0, 0, 2, 0, 0, 0]);

    let mut r = BufferSource::new(bytes.slice(1..));
    let (id, args) = serializer.decode_event(&mut r).await.unwrap();
    assert_eq!(id, 9);
    assert_eq!(args, args![3, 4]);
}

proptest! {
    #[test]
    fn test_integer_roundtrip(a in any::<i64>(), b in any::<u32>(), c in any::<i8>()) {
        tokio_test::block_on(async {
            let marshal = LoopbackMarshal::default();
            for value in [Value::I64(a), Value::U32(b), Value::I8(c)] {
                prop_assert_eq!(roundtrip(&marshal, &value).await, value);
            }
            Ok(())
        })?;
    }

    #[test]
    fn test_float_roundtrip(x in any::<f64>().prop_filter("finite", |x| x.is_finite())) {
        tokio_test::block_on(async {
            let marshal = LoopbackMarshal::default();
            let value = Value::F64(x);
            prop_assert_eq!(roundtrip(&marshal, &value).await, value);
            Ok(())
        })?;
    }

    #[test]
    fn test_string_and_buffer_roundtrip(s in ".{0,64}", bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        tokio_test::block_on(async {
            let marshal = LoopbackMarshal::default();
            for value in [Value::String(s.clone()), Value::Buffer(Bytes::from(bytes.clone()))] {
                prop_assert_eq!(roundtrip(&marshal, &value).await, value);
            }
            Ok(())
        })?;
    }
}
