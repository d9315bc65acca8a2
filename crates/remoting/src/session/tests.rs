use super::*;
use crate::args;
use crate::callback::Callback;
use crate::object::ObjectRef;
use crate::types::TypeUniverse;
use crate::RemotingError;
use remoting_proto::{MuxConfig, TypeDescriptor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Marshal that only knows callbacks
struct CallbackMarshal {
    relay: Arc<CallbackRelay>,
    sink: Weak<dyn EventSink>,
    universe: TypeUniverse,
}

impl Marshal for CallbackMarshal {
    fn export_object(&self, _object: &ObjectRef) -> Result<(i32, TypeDescriptor)> {
        Err(RemotingError::dispatch("no objects here"))
    }

    fn import_object(&self, _id: i32, _descriptor: TypeDescriptor) -> Result<ObjectRef> {
        Err(RemotingError::dispatch("no objects here"))
    }

    fn export_callback(&self, callback: &Callback) -> Result<i32> {
        self.relay.export(callback)
    }

    fn import_callback(&self, id: i32, descriptor: TypeDescriptor) -> Result<Callback> {
        Ok(self.relay.stub(id, descriptor, self.sink.clone()))
    }

    fn universe(&self) -> &TypeUniverse {
        &self.universe
    }
}

async fn open_session<R, W>(reader: R, writer: W, marker: &str) -> Arc<Session>
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
    W: tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let mux = Multiplexer::new(reader, writer, MuxConfig::default().with_marker(marker));
    let channels = SessionChannels::open(mux).await.unwrap();
    let session = Session::new(channels, |ctx| {
        Box::new(CallbackMarshal {
            relay: ctx.relay,
            sink: ctx.sink,
            universe: TypeUniverse::new(),
        })
    });
    session.start();
    session
}

async fn session_pair() -> (Arc<Session>, Arc<Session>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    let (left, right) = tokio::join!(open_session(ar, aw, "left"), open_session(br, bw, "right"));
    (left, right)
}

#[tokio::test]
async fn test_stub_invocation_runs_peer_function() {
    let (left, right) = session_pair().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback = Callback::new(move |args: Args| {
        let _ = tx.send((args.get::<i32>(0).unwrap(), args.get::<i32>(1).unwrap()));
    });
    let id = left.relay().export(&callback).unwrap();

    let stub = right.marshal().import_callback(id, callback.descriptor().clone()).unwrap();
    assert!(!stub.is_local());
    stub.invoke(args![3, 4]).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(received, Some((3, 4)));
}

#[tokio::test]
async fn test_events_keep_order() {
    let (left, right) = session_pair().await;

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback = Callback::new(move |args: Args| {
        sink.lock().unwrap().push(args.get::<i32>(0).unwrap());
    });
    let id = right.relay().export(&callback).unwrap();
    let stub = left.marshal().import_callback(id, callback.descriptor().clone()).unwrap();

    for i in 0..50 {
        stub.invoke(args![i]).await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while seen.lock().unwrap().len() < 50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_unknown_event_is_ignored() {
    let (left, right) = session_pair().await;

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let callback = Callback::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let id = right.relay().export(&callback).unwrap();

    left.send_event(id + 100, args![]).await.unwrap();
    left.send_event(id, args![]).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while hits.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_stub_fails_after_session_drops() {
    let (left, right) = session_pair().await;

    let callback = Callback::new(|_| {});
    let id = left.relay().export(&callback).unwrap();
    let stub = right.marshal().import_callback(id, callback.descriptor().clone()).unwrap();

    drop(right);
    assert!(matches!(
        stub.invoke(args![]).await,
        Err(RemotingError::ConnectionClosed)
    ));

    tokio::time::timeout(Duration::from_secs(5), left.closed()).await.unwrap();
    assert!(left.is_closed());
}
