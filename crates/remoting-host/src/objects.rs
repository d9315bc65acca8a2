//! Demo objects published by the host

use remoting::proto::names;
use remoting::{args, Callback, Exposed, Registry, RemoteClass, RemoteException, Reply};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Names of every demo object, in publishing order
pub const DEMO_OBJECTS: &[&str] = &["echo", "calculator", "notifier"];

const NO_PARAMS: [&str; 0] = [];

/// Returns whatever it is sent
pub struct EchoService;

fn echo_class() -> Arc<RemoteClass> {
    let mut builder = RemoteClass::builder::<EchoService>("demo::EchoService");
    for type_name in ["i32", "i64", "f64", "bool", "string", "[u8]"] {
        builder = builder.method("Echo", [type_name], type_name, |_, args| {
            Ok(args.value(0).cloned().unwrap_or_default())
        });
    }
    builder
        .method("Reverse", ["string"], "string", |_, args| {
            Ok(args.get::<String>(0)?.chars().rev().collect::<String>())
        })
        .build()
}

/// Running total with a few arithmetic helpers
pub struct Calculator {
    total: AtomicI64,
}

fn calculator_class() -> Arc<RemoteClass> {
    RemoteClass::builder::<Calculator>("demo::Calculator")
        .method("Add", ["i32", "i32"], "i32", |_, args| {
            let a: i32 = args.get(0)?;
            let b: i32 = args.get(1)?;
            a.checked_add(b)
                .ok_or_else(|| RemoteException::new("demo::Overflow", format!("{} + {} overflows", a, b)))
        })
        .method("Divide", ["i32", "i32", "&mut i32"], "i32", |_, args| {
            let a: i32 = args.get(0)?;
            let b: i32 = args.get(1)?;
            if b == 0 {
                return Err(RemoteException::new("demo::DivideByZero", "division by zero"));
            }
            let overflow = || RemoteException::new("demo::Overflow", format!("{} / {} overflows", a, b));
            let quotient = a.checked_div(b).ok_or_else(overflow)?;
            let remainder = a.checked_rem(b).ok_or_else(overflow)?;
            args.set(2, remainder)?;
            Ok(quotient)
        })
        .method("Accumulate", ["i64"], "i64", |calc, args| {
            let delta: i64 = args.get(0)?;
            Ok(calc.total.fetch_add(delta, Ordering::SeqCst) + delta)
        })
        .method("Total", NO_PARAMS, "i64", |calc, _| Ok(calc.total.load(Ordering::SeqCst)))
        .build()
}

/// Forwards published messages to every subscribed callback
pub struct Notifier {
    subscribers: Mutex<Vec<Callback>>,
}

impl Notifier {
    fn snapshot(&self) -> Vec<Callback> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn retain(&self, dead: &[Callback]) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| !dead.iter().any(|d| d.ptr_eq(subscriber)));
    }
}

fn notifier_class() -> Arc<RemoteClass> {
    RemoteClass::builder::<Notifier>("demo::Notifier")
        .method("Subscribe", [names::CALLBACK], "i32", |notifier, args| {
            let callback: Callback = args.get(0)?;
            let mut subscribers = notifier.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            if !subscribers.iter().any(|s| s.ptr_eq(&callback)) {
                subscribers.push(callback);
            }
            debug!(count = subscribers.len(), "Subscriber added");
            Ok(subscribers.len() as i32)
        })
        .async_method("Publish", ["string"], "i32", |notifier, args| async move {
            let message: String = args.get(0)?;
            let mut delivered = 0;
            let mut dead = Vec::new();

            for subscriber in notifier.snapshot() {
                match subscriber.invoke(args![message.clone()]).await {
                    Ok(()) => delivered += 1,
                    Err(e) if e.is_disconnect() => dead.push(subscriber),
                    Err(e) => warn!("Subscriber failed: {}", e),
                }
            }
            if !dead.is_empty() {
                info!(count = dead.len(), "Dropping disconnected subscribers");
                notifier.retain(&dead);
            }
            Ok::<_, RemoteException>(Reply::new(delivered))
        })
        .build()
}

/// Build the demo object published under `name`
pub fn demo_object(name: &str) -> Option<Exposed> {
    let object = match name {
        "echo" => Exposed::new(EchoService, echo_class()),
        "calculator" => Exposed::new(
            Calculator {
                total: AtomicI64::new(0),
            },
            calculator_class(),
        ),
        "notifier" => Exposed::new(
            Notifier {
                subscribers: Mutex::new(Vec::new()),
            },
            notifier_class(),
        ),
        _ => return None,
    };
    Some(object)
}

/// Publish the named demo objects, skipping unknown names
pub fn publish(registry: &Registry, names: &[String]) -> usize {
    let mut published = 0;
    for name in names {
        match demo_object(name) {
            Some(object) => {
                registry.add_object(name.as_str(), object);
                published += 1;
            }
            None => warn!(name = %name, "No demo object with this name"),
        }
    }
    published
}
