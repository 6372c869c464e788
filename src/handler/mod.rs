//! Handler registry: the `service.method` dispatch table.
//!
//! Application code exposes business logic as components. Each component
//! declares its methods with the fixed handler shape
//! `Fn(&Self, &SessionHandle, Bytes)`, so the signature check happens at compile
//! time. Registration derives the service name from the component's type name,
//! validates service and method names, and freezes everything into
//! `MethodEntry` values that the dispatcher calls by `(service, method)`.
//!
//! Registration happens at startup; after that the registry is shared behind
//! an `Arc` and only read.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::session::SessionHandle;
use crate::types::{Error, Result};
use crate::validation::is_exported;

/// A stored handler with the receiver already bound.
pub type MethodFn = Arc<dyn Fn(&SessionHandle, Bytes) + Send + Sync>;

type UnboundMethod<T> = Box<dyn Fn(&T, &SessionHandle, Bytes) + Send + Sync>;

/// A handler object registered as one service.
pub trait Component: Send + Sync + 'static {
    /// One-time setup, run before the methods are indexed.
    fn setup(&mut self) {}

    /// Declare the methods this component serves.
    fn methods(table: &mut MethodTable<Self>)
    where
        Self: Sized;
}

/// Method declarations collected from a component.
pub struct MethodTable<T> {
    entries: Vec<(String, UnboundMethod<T>)>,
}

impl<T> MethodTable<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Declare `name` as a handler method.
    pub fn method<F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(&T, &SessionHandle, Bytes) + Send + Sync + 'static,
    {
        self.entries.push((name.to_string(), Box::new(handler)));
        self
    }
}

impl<T> fmt::Debug for MethodTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, _)| name))
            .finish()
    }
}

/// One callable `service.method`.
pub struct MethodEntry {
    name: String,
    func: MethodFn,
    calls: AtomicU64,
}

impl MethodEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the handler.
    pub fn call(&self, session: &SessionHandle, body: Bytes) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        (self.func)(session, body);
    }

    /// Times this method has been invoked.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodEntry")
            .field("name", &self.name)
            .field("calls", &self.calls())
            .finish()
    }
}

/// A registered component and its methods.
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: HashMap<String, MethodEntry>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&MethodEntry> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Index of services available for local dispatch.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    services: HashMap<String, Service>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component under its type name (`my_app::Room` → `Room`).
    ///
    /// Rejections are logged and returned; the registry is unchanged by them.
    pub fn register<T: Component>(&mut self, component: T) -> Result<()> {
        self.register_as(&service_name::<T>(), component)
    }

    /// Register a component under an explicit service name.
    pub fn register_as<T: Component>(&mut self, name: &str, mut component: T) -> Result<()> {
        component.setup();
        self.install(name, component).map_err(|e| {
            tracing::warn!("handler.register: {}", e);
            e
        })
    }

    fn install<T: Component>(&mut self, name: &str, component: T) -> Result<()> {
        if name.is_empty() {
            return Err(Error::registration(format!(
                "no service name for type {}",
                std::any::type_name::<T>()
            )));
        }
        if !is_exported(name) {
            return Err(Error::registration(format!(
                "type {} is not exported",
                name
            )));
        }
        if self.services.contains_key(name) {
            return Err(Error::registration(format!(
                "service already defined: {}",
                name
            )));
        }

        let mut table = MethodTable::new();
        T::methods(&mut table);
        let receiver = Arc::new(component);

        let mut methods = HashMap::new();
        let mut unexported = 0usize;
        for (method_name, handler) in table.entries {
            if !is_exported(&method_name) {
                tracing::warn!(
                    "handler.register: method {:?} of {} is not exported, skipped",
                    method_name,
                    name
                );
                unexported += 1;
                continue;
            }
            if methods.contains_key(&method_name) {
                tracing::warn!(
                    "handler.register: method {} of {} declared twice, keeping the first",
                    method_name,
                    name
                );
                continue;
            }
            let receiver = receiver.clone();
            let func: MethodFn =
                Arc::new(move |session: &SessionHandle, body: Bytes| handler(&receiver, session, body));
            methods.insert(
                method_name.clone(),
                MethodEntry {
                    name: method_name,
                    func,
                    calls: AtomicU64::new(0),
                },
            );
        }

        if methods.is_empty() {
            if unexported > 0 {
                tracing::warn!(
                    "handler.register: type {} has no exported methods of suitable type (hint: {} declared method(s) have unexported names)",
                    name,
                    unexported
                );
            } else {
                tracing::warn!(
                    "handler.register: type {} has no exported methods of suitable type",
                    name
                );
            }
        }

        self.services.insert(
            name.to_string(),
            Service {
                name: name.to_string(),
                methods,
            },
        );
        self.dump();
        Ok(())
    }

    /// Find the handler for `service.method`.
    pub fn lookup(&self, service: &str, method: &str) -> Option<&MethodEntry> {
        self.services.get(service)?.method(method)
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Every registered `service.method`, sorted.
    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self
            .services
            .values()
            .flat_map(|s| s.methods.keys().map(move |m| format!("{}.{}", s.name, m)))
            .collect();
        routes.sort();
        routes
    }

    pub fn dump(&self) {
        for route in self.routes() {
            tracing::info!("registered service: {}", route);
        }
    }
}

/// Last path segment of the type name, generics stripped.
fn service_name<T>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
