//! End-to-end calls over every transport

#![cfg(feature = "http")]

mod common;

use anyhow::Result;
use common::{registry, Fixture, Transport, TRANSPORTS};
use remoting::{args, Callback, Proxy, RemotingError, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[tokio::test]
async fn test_echo() -> Result<()> {
    for transport in TRANSPORTS {
        let fixture = Fixture::connect(transport, registry()).await?;
        let calc = fixture.dispatcher.get_object("calc").await?;

        assert_eq!(calc.descriptor().name(), "demo::Calculator", "{:?}", transport);
        assert_eq!(calc.type_name(), remoting::proto::names::REMOTE_OBJECT);
        assert_eq!(calc.invoke("Echo", args![5]).await?, Value::I32(5), "{:?}", transport);
        assert_eq!(calc.call::<i32>("Add", args![2, 3]).await?, 5);

        fixture.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_remote_failure() -> Result<()> {
    for transport in TRANSPORTS {
        let fixture = Fixture::connect(transport, registry()).await?;
        let calc = fixture.dispatcher.get_object("calc").await?;

        match calc.invoke("Fail", args![]).await {
            Err(RemotingError::Remote(exception)) => {
                assert!(exception.mentions("boom"), "{:?}: {:?}", transport, exception)
            }
            other => panic!("{:?}: expected remote failure, got {:?}", transport, other),
        }

        // The connection survives the failure
        assert_eq!(calc.call::<i32>("Echo", args![1]).await?, 1);
        fixture.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_panicking_method_fails_only_its_call() -> Result<()> {
    for transport in TRANSPORTS {
        let fixture = Fixture::connect(transport, registry()).await?;
        let calc = fixture.dispatcher.get_object("calc").await?;

        match calc.invoke("Divide", args![1, 0]).await {
            Err(RemotingError::Remote(exception)) => {
                assert!(exception.mentions("panicked"), "{:?}: {:?}", transport, exception)
            }
            other => panic!("{:?}: expected remote failure, got {:?}", transport, other),
        }

        assert_eq!(calc.call::<i32>("Divide", args![9, 3]).await?, 3, "{:?}", transport);
        assert_eq!(calc.call::<i32>("Add", args![1, 2]).await?, 3);
        fixture.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_abandoned_call_keeps_replies_in_order() -> Result<()> {
    for transport in TRANSPORTS {
        let fixture = Fixture::connect(transport, registry()).await?;
        let calc = fixture.dispatcher.get_object("calc").await?;

        let abandoned = timeout(Duration::from_millis(50), calc.invoke("Slow", args![300])).await;
        assert!(abandoned.is_err(), "{:?}: slow call finished early", transport);

        assert_eq!(calc.call::<i32>("Echo", args![5]).await?, 5, "{:?}", transport);
        assert_eq!(calc.call::<i32>("Echo", args![6]).await?, 6, "{:?}", transport);
        assert_eq!(calc.call::<i32>("Slow", args![0]).await?, 111);
        fixture.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_callback_invoked_once() -> Result<()> {
    for transport in TRANSPORTS {
        let fixture = Fixture::connect(transport, registry()).await?;
        let calc = fixture.dispatcher.get_object("calc").await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback = Callback::new(move |args| {
            let _ = tx.send(args);
        });
        calc.invoke("Notify", args![callback]).await?;

        let received = timeout(Duration::from_secs(5), rx.recv())
            .await?
            .expect("callback sender dropped");
        assert_eq!(received, args![3, 4], "{:?}", transport);
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        fixture.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_callback_reused_across_calls() -> Result<()> {
    for transport in TRANSPORTS {
        let fixture = Fixture::connect(transport, registry()).await?;
        let calc = fixture.dispatcher.get_object("calc").await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback = Callback::new(move |args| {
            let _ = tx.send(args);
        });
        calc.invoke("Notify", args![callback.clone()]).await?;
        calc.invoke("Notify", args![callback]).await?;

        for _ in 0..2 {
            let received = timeout(Duration::from_secs(5), rx.recv()).await?;
            assert_eq!(received, Some(args![3, 4]), "{:?}", transport);
        }
        fixture.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_missing_object() -> Result<()> {
    for transport in TRANSPORTS {
        let fixture = Fixture::connect(transport, registry()).await?;

        match fixture.dispatcher.get_object("missing").await {
            Err(RemotingError::Dispatch(msg)) => assert!(msg.contains("missing"), "{}", msg),
            other => panic!("{:?}: expected dispatch error, got {:?}", transport, other),
        }
        fixture.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_unknown_method() -> Result<()> {
    for transport in TRANSPORTS {
        let fixture = Fixture::connect(transport, registry()).await?;
        let calc = fixture.dispatcher.get_object("calc").await?;

        let err = calc.invoke("Echo", args!["five"]).await.unwrap_err();
        assert!(matches!(err, RemotingError::Dispatch(_)), "{:?}: {:?}", transport, err);

        let err = calc.invoke("Nothing", args![]).await.unwrap_err();
        assert!(matches!(err, RemotingError::Dispatch(_)), "{:?}: {:?}", transport, err);

        assert_eq!(calc.call::<i32>("Echo", args![9]).await?, 9);
        fixture.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_get_object_is_idempotent() -> Result<()> {
    for transport in TRANSPORTS {
        let fixture = Fixture::connect(transport, registry()).await?;

        let first = fixture.dispatcher.get_object("calc").await?;
        let second = fixture.dispatcher.get_object("calc").await?;
        assert!(first.ptr_eq(&second), "{:?}", transport);
        assert_eq!(first.id(), second.id());

        let other = fixture.dispatcher.get_object("locked").await?;
        assert_ne!(first.id(), other.id());
        fixture.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_access_denied() -> Result<()> {
    for transport in TRANSPORTS {
        let fixture = Fixture::connect(transport, registry()).await?;
        let locked = fixture.dispatcher.get_object("locked").await?;

        match locked.invoke("Add", args![1, 2]).await {
            Err(RemotingError::AccessDenied(member)) => assert_eq!(member, "Add"),
            other => panic!("{:?}: expected access denied, got {:?}", transport, other),
        }
        assert_eq!(locked.call::<i32>("Echo", args![4]).await?, 4, "{:?}", transport);
        fixture.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_type_fallback_and_object_arguments() -> Result<()> {
    for transport in TRANSPORTS {
        let fixture = Fixture::connect(transport, registry()).await?;
        fixture.dispatcher.universe().register("demo::Child");
        let calc = fixture.dispatcher.get_object("calc").await?;

        let child: Proxy = calc.call("CreateChild", args!["ada"]).await?;
        assert_eq!(child.descriptor().name(), "demo::SpecialChild");
        assert_eq!(child.type_name(), "demo::Child", "{:?}", transport);
        assert_eq!(child.call::<String>("Name", args![]).await?, "special ada");
        assert_eq!(child.call::<String>("GetType", args![]).await?, "demo::Child");

        let described: String = calc.call("Describe", args![child.clone()]).await?;
        assert_eq!(described, "demo::SpecialChild", "{:?}", transport);
        fixture.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_out_parameters() -> Result<()> {
    for transport in TRANSPORTS {
        let fixture = Fixture::connect(transport, registry()).await?;
        let calc = fixture.dispatcher.get_object("calc").await?;

        let mut slots = [Value::I32(1), Value::I32(2)];
        let result = calc.invoke_mut("Swap", &mut slots).await?;
        assert_eq!(result, Value::Null);
        assert_eq!(slots, [Value::I32(2), Value::I32(1)], "{:?}", transport);
        fixture.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_replies() -> Result<()> {
    for transport in TRANSPORTS {
        let fixture = Fixture::connect(transport, registry()).await?;
        let calc = fixture.dispatcher.get_object("calc").await?;

        let mut tasks = Vec::new();
        for i in 0..20 {
            let calc = calc.clone();
            tasks.push(tokio::spawn(async move { calc.call::<i32>("Echo", args![i]).await }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await??, i as i32, "{:?}", transport);
        }
        fixture.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_leases_outlive_connection_by_default() -> Result<()> {
    let registry = registry();
    let fixture = Fixture::connect(Transport::Duplex, registry.clone()).await?;
    fixture.dispatcher.get_object("calc").await?;
    let leased = registry.len();
    assert!(leased >= 1);

    fixture.shutdown().await;
    assert_eq!(registry.len(), leased);
    Ok(())
}

#[tokio::test]
async fn test_release_leases_on_disconnect() -> Result<()> {
    let registry = registry();
    let before = registry.len();
    let config = common::server_config().with_release_leases_on_disconnect(true);

    let fixture = Fixture::connect_with(Transport::Duplex, registry.clone(), config).await?;
    let calc = fixture.dispatcher.get_object("calc").await?;
    let _child: Proxy = calc.call("CreateChild", args!["tmp"]).await?;
    assert_eq!(registry.len(), before + 2);

    fixture.shutdown().await;
    assert_eq!(registry.len(), before);
    Ok(())
}

#[tokio::test]
async fn test_closed_connection_fails_calls() -> Result<()> {
    let fixture = Fixture::connect(Transport::Duplex, registry()).await?;
    let calc = fixture.dispatcher.get_object("calc").await?;
    let client = fixture.binary_client().cloned().expect("binary transport");

    client.close().await;
    assert!(client.is_closed());
    assert!(calc.invoke("Echo", args![1]).await.is_err());
    Ok(())
}
