//! Callables the worker can construct by module reference.
//!
//! A module reference is an opaque registry key. LOAD looks the key up, runs its
//! [`Constructor`] with the init argument and stores the resulting [`Callable`] in
//! the handle table; INVOKE calls it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::bridge::protocol::CallError;

/// An async function of one JSON argument.
#[async_trait::async_trait]
pub trait Callable: Send + Sync + 'static {
    async fn call(&self, argument: Value) -> Result<Value, CallError>;
}

/// Builds a [`Callable`] from an init argument. Runs once per LOAD.
#[async_trait::async_trait]
pub trait Constructor: Send + Sync + 'static {
    async fn construct(&self, argument: Value) -> Result<Arc<dyn Callable>, CallError>;
}

/// [`Callable`] backed by a closure returning a future.
pub struct FnCallable<F>(F);

#[async_trait::async_trait]
impl<F, Fut> Callable for FnCallable<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
{
    async fn call(&self, argument: Value) -> Result<Value, CallError> {
        (self.0)(argument).await
    }
}

/// Wrap an async closure as a shareable callable.
pub fn callable_fn<F, Fut>(f: F) -> Arc<dyn Callable>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
{
    Arc::new(FnCallable(f))
}

/// [`Constructor`] backed by a closure returning a future.
pub struct FnConstructor<F>(F);

#[async_trait::async_trait]
impl<F, Fut> Constructor for FnConstructor<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arc<dyn Callable>, CallError>> + Send + 'static,
{
    async fn construct(&self, argument: Value) -> Result<Arc<dyn Callable>, CallError> {
        (self.0)(argument).await
    }
}

pub fn constructor_fn<F, Fut>(f: F) -> Arc<dyn Constructor>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arc<dyn Callable>, CallError>> + Send + 'static,
{
    Arc::new(FnConstructor(f))
}

/// Module reference to constructor map.
#[derive(Clone, Default)]
pub struct Registry {
    constructors: HashMap<String, Arc<dyn Constructor>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.constructors.keys().collect();
        keys.sort();
        f.debug_struct("Registry").field("modules", &keys).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor, replacing any previous one under the same key.
    pub fn register(&mut self, module_ref: impl Into<String>, constructor: Arc<dyn Constructor>) {
        let module_ref = module_ref.into();
        if self
            .constructors
            .insert(module_ref.clone(), constructor)
            .is_some()
        {
            tracing::debug!(%module_ref, "Replaced registered constructor");
        }
    }

    pub fn register_fn<F, Fut>(&mut self, module_ref: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Callable>, CallError>> + Send + 'static,
    {
        self.register(module_ref, constructor_fn(f));
    }

    /// Builder form of [`register_fn`](Self::register_fn).
    pub fn with<F, Fut>(mut self, module_ref: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Callable>, CallError>> + Send + 'static,
    {
        self.register_fn(module_ref, f);
        self
    }

    pub fn get(&self, module_ref: &str) -> Option<Arc<dyn Constructor>> {
        self.constructors.get(module_ref).cloned()
    }

    pub fn contains(&self, module_ref: &str) -> bool {
        self.constructors.contains_key(module_ref)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}
