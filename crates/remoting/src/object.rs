//! Exposed objects and their method tables

use crate::client::Proxy;
use crate::value::{Args, RemoteException, Value};
use futures::future::BoxFuture;
use futures::FutureExt;
use remoting_proto::{names, TypeDescriptor};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, warn};

/// Type-erased object behind an [`Exposed`] handle
pub type AnyObject = Arc<dyn Any + Send + Sync>;

/// Future returned by a method invoker
pub type MethodFuture = BoxFuture<'static, Result<Reply, RemoteException>>;

type Invoker = Arc<dyn Fn(AnyObject, Args) -> MethodFuture + Send + Sync>;

/// Outcome of a successful call: the return value and by-reference parameters
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reply {
    /// Return value
    pub value: Value,
    /// Final values of by-reference parameters, by argument index
    pub out: Vec<(usize, Value)>,
}

impl Reply {
    /// Reply with a return value and no out parameters
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            out: Vec::new(),
        }
    }

    /// Add an out parameter
    pub fn with_out(mut self, index: usize, value: impl Into<Value>) -> Self {
        self.out.push((index, value.into()));
        self
    }
}

/// Declared method parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Declared type name
    pub type_name: String,
    /// Whether the final value is sent back to the caller
    pub by_ref: bool,
}

impl From<&str> for Param {
    /// `"i32"` declares a value parameter, `"&mut i32"` a by-reference one
    fn from(spec: &str) -> Self {
        match spec.strip_prefix("&mut ") {
            Some(type_name) => Self {
                type_name: type_name.trim().to_string(),
                by_ref: true,
            },
            None => Self {
                type_name: spec.trim().to_string(),
                by_ref: false,
            },
        }
    }
}

/// One entry of a method table
pub struct Method {
    name: String,
    params: Vec<Param>,
    returns: String,
    invoker: Invoker,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .finish()
    }
}

impl Method {
    /// Method name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameters
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Declared return type name
    pub fn returns(&self) -> &str {
        &self.returns
    }

    /// Parameter type names
    pub fn signature(&self) -> Vec<String> {
        self.params.iter().map(|p| p.type_name.clone()).collect()
    }

    /// Whether arguments of the given types can be passed to this method.
    ///
    /// A `null` argument fits any non-primitive parameter, an object fits a
    /// parameter naming any type in its chain.
    pub fn accepts(&self, arg_types: &[TypeDescriptor]) -> bool {
        self.params.len() == arg_types.len()
            && self
                .params
                .iter()
                .zip(arg_types)
                .all(|(param, arg)| param_accepts(&param.type_name, arg))
    }

    /// Invoke the method on `target`.
    ///
    /// A panic inside the method surfaces as a failed call.
    pub fn invoke(&self, target: &Exposed, args: Args) -> MethodFuture {
        let invoker = Arc::clone(&self.invoker);
        let object = Arc::clone(&target.object);
        let name = self.name.clone();

        Box::pin(async move {
            match AssertUnwindSafe(async move { invoker(object, args).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(panic_exception(&name, panic)),
            }
        })
    }
}

fn panic_exception(method: &str, panic: Box<dyn Any + Send>) -> RemoteException {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(method, %detail, "Method panicked");
    RemoteException::new(names::EXCEPTION, format!("{} panicked: {}", method, detail))
}

fn param_accepts(param: &str, arg: &TypeDescriptor) -> bool {
    let arg_name = arg.name();
    if arg_name == param || arg.is(param) {
        return true;
    }
    if arg_name == names::NULL {
        return !names::is_primitive(param);
    }
    param == names::REMOTE_OBJECT
        && !names::is_primitive(arg_name)
        && arg_name != names::STRING
        && names::element_of(arg_name).is_none()
        && arg_name != names::BUFFER
}

/// Method table and type chain of an exposed type.
///
/// Replaces runtime reflection: every remotely callable method is declared
/// with its parameter type names and an invoker closure.
pub struct RemoteClass {
    descriptor: TypeDescriptor,
    type_id: TypeId,
    methods: Vec<Arc<Method>>,
    index: HashMap<(String, Vec<String>), usize>,
}

impl fmt::Debug for RemoteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClass")
            .field("descriptor", &self.descriptor)
            .field("methods", &self.methods.len())
            .finish()
    }
}

impl RemoteClass {
    /// Start declaring a class for objects of type `T`
    pub fn builder<T: Send + Sync + 'static>(name: impl Into<String>) -> ClassBuilder<T> {
        ClassBuilder {
            class: RemoteClass {
                descriptor: TypeDescriptor::named(name),
                type_id: TypeId::of::<T>(),
                methods: Vec::new(),
                index: HashMap::new(),
            },
            _marker: PhantomData,
        }
    }

    /// Type chain, most-derived first
    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    /// Most-derived type name
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// Declared methods
    pub fn methods(&self) -> &[Arc<Method>] {
        &self.methods
    }

    /// Find a method by name and argument types.
    ///
    /// An exact signature match wins, otherwise the first compatible
    /// overload in declaration order.
    pub fn find_method(&self, name: &str, arg_types: &[TypeDescriptor]) -> Option<Arc<Method>> {
        let key = (
            name.to_string(),
            arg_types.iter().map(|d| d.name().to_string()).collect::<Vec<_>>(),
        );
        if let Some(&idx) = self.index.get(&key) {
            return self.methods.get(idx).cloned();
        }

        self.methods
            .iter()
            .find(|m| m.name == name && m.accepts(arg_types))
            .cloned()
    }
}

/// Builder for a [`RemoteClass`]
pub struct ClassBuilder<T> {
    class: RemoteClass,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ClassBuilder<T> {
    /// Append the chain of a base class.
    ///
    /// Only the type names are inherited; methods callable on `T` are
    /// declared on this builder.
    pub fn extends(mut self, parent: &RemoteClass) -> Self {
        let mut chain = self.class.descriptor.names().to_vec();
        chain.extend(parent.descriptor.names().iter().cloned());
        self.class.descriptor = TypeDescriptor::new(chain);
        self
    }

    /// Append an interface or base type name
    pub fn implements(mut self, name: impl Into<String>) -> Self {
        let mut chain = self.class.descriptor.names().to_vec();
        chain.push(name.into());
        self.class.descriptor = TypeDescriptor::new(chain);
        self
    }

    /// Declare a synchronous method.
    ///
    /// By-reference parameters (declared as `"&mut T"`) are sent back with
    /// whatever value the closure left in `args`.
    pub fn method<P, F, R>(self, name: &str, params: P, returns: &str, f: F) -> Self
    where
        P: IntoIterator,
        P::Item: Into<Param>,
        F: Fn(&T, &mut Args) -> Result<R, RemoteException> + Send + Sync + 'static,
        R: Into<Value>,
    {
        let params: Vec<Param> = params.into_iter().map(Into::into).collect();
        let out_params: Vec<usize> = params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.by_ref)
            .map(|(i, _)| i)
            .collect();
        let class_name = self.class.name().to_string();

        let invoker: Invoker = Arc::new(move |object: AnyObject, mut args: Args| {
            let result = match object.downcast::<T>() {
                Ok(target) => f(target.as_ref(), &mut args).map(|value| {
                    let mut reply = Reply::new(value);
                    for &idx in &out_params {
                        reply.out.push((idx, args.value(idx).cloned().unwrap_or_default()));
                    }
                    reply
                }),
                Err(_) => Err(class_mismatch(&class_name)),
            };
            Box::pin(futures::future::ready(result)) as MethodFuture
        });

        self.push(name, params, returns, invoker)
    }

    /// Declare an asynchronous method
    pub fn async_method<P, F, Fut>(self, name: &str, params: P, returns: &str, f: F) -> Self
    where
        P: IntoIterator,
        P::Item: Into<Param>,
        F: Fn(Arc<T>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, RemoteException>> + Send + 'static,
    {
        let params: Vec<Param> = params.into_iter().map(Into::into).collect();
        let class_name = self.class.name().to_string();
        let f = Arc::new(f);

        let invoker: Invoker = Arc::new(move |object: AnyObject, args: Args| {
            match object.downcast::<T>() {
                Ok(target) => Box::pin(f(target, args)) as MethodFuture,
                Err(_) => Box::pin(futures::future::ready(Err(class_mismatch(&class_name)))) as MethodFuture,
            }
        });

        self.push(name, params, returns, invoker)
    }

    fn push(mut self, name: &str, params: Vec<Param>, returns: &str, invoker: Invoker) -> Self {
        let method = Method {
            name: name.to_string(),
            params,
            returns: returns.to_string(),
            invoker,
        };

        let key = (method.name.clone(), method.signature());
        if self.class.index.contains_key(&key) {
            warn!(class = %self.class.name(), method = name, "Replacing method with identical signature");
        }
        self.class.index.insert(key, self.class.methods.len());
        self.class.methods.push(Arc::new(method));
        self
    }

    /// Finish the class
    pub fn build(self) -> Arc<RemoteClass> {
        Arc::new(self.class)
    }
}

fn class_mismatch(class_name: &str) -> RemoteException {
    RemoteException::new(
        names::DISPATCH_ERROR,
        format!("object is not an instance of {}", class_name),
    )
}

/// A local object published for remote use
#[derive(Clone)]
pub struct Exposed {
    object: AnyObject,
    class: Arc<RemoteClass>,
}

impl fmt::Debug for Exposed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exposed")
            .field("class", &self.class.name())
            .field("identity", &format_args!("{:#x}", self.identity()))
            .finish()
    }
}

impl Exposed {
    /// Expose a new object
    pub fn new<T: Send + Sync + 'static>(object: T, class: Arc<RemoteClass>) -> Self {
        Self::from_arc(Arc::new(object), class)
    }

    /// Expose an object that is already shared
    pub fn from_arc<T: Send + Sync + 'static>(object: Arc<T>, class: Arc<RemoteClass>) -> Self {
        if class.type_id != TypeId::of::<T>() {
            warn!(class = %class.name(), "Exposing object whose type does not match its class");
        }
        Self { object, class }
    }

    /// Identity of the underlying object
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.object) as *const () as usize
    }

    /// Whether both handles refer to the same object
    pub fn ptr_eq(&self, other: &Exposed) -> bool {
        self.identity() == other.identity()
    }

    /// Method table of the object
    pub fn class(&self) -> &Arc<RemoteClass> {
        &self.class
    }

    /// Type chain of the object
    pub fn descriptor(&self) -> &TypeDescriptor {
        self.class.descriptor()
    }

    /// Borrow the object as its concrete type
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.object.downcast_ref::<T>()
    }
}

/// Reference to a live object, local or remote
#[derive(Clone)]
pub enum ObjectRef {
    /// Local object served to peers
    Exposed(Exposed),
    /// Stand-in for an object served by a peer
    Proxy(Proxy),
}

impl ObjectRef {
    /// Type chain of the referenced object
    pub fn descriptor(&self) -> TypeDescriptor {
        match self {
            Self::Exposed(exposed) => exposed.descriptor().clone(),
            Self::Proxy(proxy) => proxy.descriptor().clone(),
        }
    }

    /// Whether both references point at the same object
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        match (self, other) {
            (Self::Exposed(a), Self::Exposed(b)) => a.ptr_eq(b),
            (Self::Proxy(a), Self::Proxy(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exposed(exposed) => exposed.fmt(f),
            Self::Proxy(proxy) => proxy.fmt(f),
        }
    }
}

impl From<Exposed> for ObjectRef {
    fn from(exposed: Exposed) -> Self {
        Self::Exposed(exposed)
    }
}

impl From<Exposed> for Value {
    fn from(exposed: Exposed) -> Self {
        Value::Object(ObjectRef::Exposed(exposed))
    }
}
