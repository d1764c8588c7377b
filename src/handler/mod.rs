//! Handlers and the registry that binds them to command kinds.
//!
//! A handler is written against one payload type and registered through
//! [`HandlerRegistryBuilder::register`], which files it under that
//! payload's [`CommandKind`]. The registry is built once at startup and
//! is read-only afterwards; share it behind an `Arc`.

pub mod builtin;

use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::command::{Command, CommandKind, CommandPayload};

/// Business logic for one command kind.
///
/// Handlers may be redelivered the same command (the queue is
/// at-least-once), so their effects must be idempotent.
#[async_trait]
pub trait Handler<C: CommandPayload>: Send + Sync + 'static {
    async fn handle(&self, command: &C) -> anyhow::Result<()>;
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn call(&self, command: &Command) -> anyhow::Result<()>;
}

struct Typed<C, H> {
    handler: H,
    _payload: PhantomData<fn() -> C>,
}

#[async_trait]
impl<C, H> ErasedHandler for Typed<C, H>
where
    C: CommandPayload,
    H: Handler<C>,
{
    async fn call(&self, command: &Command) -> anyhow::Result<()> {
        match C::from_command(command) {
            Some(payload) => self.handler.handle(payload).await,
            None => anyhow::bail!(
                "handler bound to {} received a {} command",
                C::KIND,
                command.kind()
            ),
        }
    }
}

/// A handler as stored in the registry, erased over its payload type.
#[derive(Clone)]
pub struct BoundHandler {
    name: &'static str,
    inner: Arc<dyn ErasedHandler>,
}

impl BoundHandler {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn handle(&self, command: &Command) -> anyhow::Result<()> {
        self.inner.call(command).await
    }
}

impl std::fmt::Debug for BoundHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundHandler").field("name", &self.name).finish()
    }
}

/// Immutable `CommandKind -> [handler]` mapping. Order is call order.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<CommandKind, Vec<BoundHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Create an empty registry with no handlers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Handlers for `kind`, in registration order. Empty when none.
    pub fn handlers_for(&self, kind: CommandKind) -> &[BoundHandler] {
        self.handlers.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Kinds with at least one handler.
    pub fn kinds(&self) -> impl Iterator<Item = CommandKind> + '_ {
        self.handlers
            .iter()
            .filter(|(_, handlers)| !handlers.is_empty())
            .map(|(kind, _)| *kind)
    }
}

/// Collects handler bindings, then freezes them into a [`HandlerRegistry`].
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<CommandKind, Vec<BoundHandler>>,
}

impl HandlerRegistryBuilder {
    /// Append `handler` to the chain for `C::KIND`.
    pub fn register<C, H>(self, handler: H) -> Self
    where
        C: CommandPayload,
        H: Handler<C>,
    {
        self.register_named::<C, H>(short_type_name::<H>(), handler)
    }

    /// Like [`register`](Self::register), with an explicit name for logs.
    pub fn register_named<C, H>(mut self, name: &'static str, handler: H) -> Self
    where
        C: CommandPayload,
        H: Handler<C>,
    {
        let bound = BoundHandler {
            name,
            inner: Arc::new(Typed::<C, H> {
                handler,
                _payload: PhantomData,
            }),
        };
        self.handlers.entry(C::KIND).or_default().push(bound);
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    // Drop the module path but keep generic arguments intact.
    let base_end = full.find('<').unwrap_or(full.len());
    match full[..base_end].rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
