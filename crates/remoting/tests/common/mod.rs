//! Shared fixtures for the end-to-end tests
//!
//! Publishes a small calculator object and connects a client to it over an
//! in-memory stream, a TCP socket, or HTTP.

#![allow(dead_code)]

use anyhow::Result;
use remoting::proto::names;
use remoting::{
    AllowList, BinaryClient, Callback, Dispatcher, Exposed, HttpClient, HttpServer, RemoteClass,
    RemoteException, Reply, ServerConfig, ServerConnection, TcpServer, Value,
};
use remoting::{args, Registry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const NO_PARAMS: [&str; 0] = [];

pub struct Calculator {
    pub calls: AtomicUsize,
}

pub struct Child {
    name: String,
}

pub fn child_classes() -> (Arc<RemoteClass>, Arc<RemoteClass>) {
    let base = RemoteClass::builder::<Child>("demo::Child")
        .method("Name", NO_PARAMS, "string", |child, _| Ok(child.name.clone()))
        .build();
    let special = RemoteClass::builder::<Child>("demo::SpecialChild")
        .extends(&base)
        .method("Name", NO_PARAMS, "string", |child, _| {
            Ok(format!("special {}", child.name))
        })
        .build();
    (base, special)
}

pub fn calculator_class() -> Arc<RemoteClass> {
    let (_, special) = child_classes();

    RemoteClass::builder::<Calculator>("demo::Calculator")
        .method("Echo", ["i32"], "i32", |calc, args| {
            calc.calls.fetch_add(1, Ordering::SeqCst);
            args.get::<i32>(0).map_err(RemoteException::from)
        })
        .method("Add", ["i32", "i32"], "i32", |_, args| {
            Ok(args.get::<i32>(0)? + args.get::<i32>(1)?)
        })
        .method("Fail", NO_PARAMS, "null", |_, _| {
            Err::<(), _>(RemoteException::msg("boom"))
        })
        .method("Divide", ["i32", "i32"], "i32", |_, args| {
            Ok(args.get::<i32>(0)? / args.get::<i32>(1)?)
        })
        .async_method("Slow", ["i32"], "i32", |_, args| async move {
            let millis: i32 = args.get(0)?;
            tokio::time::sleep(Duration::from_millis(millis.max(0) as u64)).await;
            Ok::<_, RemoteException>(Reply::new(111))
        })
        .method("Swap", ["&mut i32", "&mut i32"], "null", |_, args| {
            let a: i32 = args.get(0)?;
            let b: i32 = args.get(1)?;
            args.set(0, b)?;
            args.set(1, a)?;
            Ok(())
        })
        .method("CreateChild", ["string"], "demo::Child", move |_, args| {
            let name: String = args.get(0)?;
            Ok(Exposed::new(Child { name }, Arc::clone(&special)))
        })
        .method("Describe", ["demo::Child"], "string", |_, args| {
            Ok(args.value(0).map(Value::type_name).unwrap_or_default())
        })
        .async_method("Notify", [names::CALLBACK], "null", |_, args| async move {
            let callback: Callback = args.get(0)?;
            callback.invoke(args![3, 4]).await?;
            Ok::<_, RemoteException>(Reply::new(()))
        })
        .build()
}

pub fn calculator() -> Exposed {
    Exposed::new(
        Calculator {
            calls: AtomicUsize::new(0),
        },
        calculator_class(),
    )
}

/// Registry publishing `calc` freely and `locked` behind an allow list
pub fn registry() -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    registry.add_object("calc", calculator());

    let locked = calculator();
    registry.register(&locked, Arc::new(AllowList::new(["Echo"])));
    registry.add_object("locked", locked);
    registry
}

pub fn server_config() -> ServerConfig {
    ServerConfig::default()
        .with_tcp_port(0)
        .with_http_port(0)
        .with_callback_wait(Duration::from_secs(2))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Duplex,
    Tcp,
    Http,
}

pub const TRANSPORTS: [Transport; 3] = [Transport::Duplex, Transport::Tcp, Transport::Http];

enum Guard {
    Duplex(BinaryClient, JoinHandle<remoting::Result<()>>),
    Tcp(BinaryClient, TcpServer),
    Http(HttpClient, HttpServer),
}

/// A connected client and whatever keeps its server alive
pub struct Fixture {
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<dyn Dispatcher>,
    guard: Guard,
}

impl Fixture {
    pub async fn connect(transport: Transport, registry: Arc<Registry>) -> Result<Self> {
        Self::connect_with(transport, registry, server_config()).await
    }

    pub async fn connect_with(
        transport: Transport,
        registry: Arc<Registry>,
        config: ServerConfig,
    ) -> Result<Self> {
        let guard = match transport {
            Transport::Duplex => {
                let (client, server) = duplex_pair(Arc::clone(&registry), &config).await?;
                Guard::Duplex(client, server)
            }
            Transport::Tcp => {
                let server = TcpServer::bind(config, Arc::clone(&registry)).await?;
                server.start();
                let client = BinaryClient::connect(server.local_addr()).await?;
                Guard::Tcp(client, server)
            }
            Transport::Http => {
                let server = HttpServer::bind(config, Arc::clone(&registry)).await?;
                server.start();
                let client = HttpClient::new(server.url())?;
                Guard::Http(client, server)
            }
        };

        let dispatcher = match &guard {
            Guard::Duplex(client, _) | Guard::Tcp(client, _) => client.dispatcher(),
            Guard::Http(client, _) => client.dispatcher(),
        };

        Ok(Self {
            registry,
            dispatcher,
            guard,
        })
    }

    pub fn binary_client(&self) -> Option<&BinaryClient> {
        match &self.guard {
            Guard::Duplex(client, _) | Guard::Tcp(client, _) => Some(client),
            Guard::Http(..) => None,
        }
    }

    pub async fn shutdown(self) {
        match self.guard {
            Guard::Duplex(client, server) => {
                client.close().await;
                let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
            }
            Guard::Tcp(client, server) => {
                client.close().await;
                server.stop().await;
            }
            Guard::Http(client, server) => {
                client.close();
                server.stop().await;
            }
        }
    }
}

/// Client and served connection over an in-memory stream
pub async fn duplex_pair(
    registry: Arc<Registry>,
    config: &ServerConfig,
) -> Result<(BinaryClient, JoinHandle<remoting::Result<()>>)> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);

    let (client, connection) = tokio::join!(
        BinaryClient::new(client_read, client_write),
        ServerConnection::accept(server_read, server_write, registry, config),
    );
    let server = tokio::spawn(connection?.run());
    Ok((client?, server))
}
