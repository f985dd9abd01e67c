//! Unary call interceptors.
//!
//! A chain is an ordered slice of interceptors and a terminal [`Invoker`].
//! Each interceptor receives a [`Next`] holding the slice and the position of
//! the following step; calling [`Next::run`] advances, returning without
//! calling it short-circuits the rest of the chain.
//!
//! Instances always build their chains as
//! `[Recovery, observer, user interceptors..., bridge]`.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};

use async_trait::async_trait;
use futures::FutureExt;

use super::context::CallContext;
use super::error::CallError;
use super::status::{BusinessCode, Status};
use crate::error::ChainError;

/// Most user interceptors an instance accepts.
pub const MAX_INTERCEPTORS: usize = 62;

/// Upper bound of a captured panic stack, in bytes.
const STACK_LIMIT: usize = 64 << 10;

pub type CallResult = Result<Payload, CallError>;

/// Values that may be written into call logs.
pub trait LogBody {
    fn log_body(&self) -> String;
}

impl<T: prost::Message> LogBody for T {
    fn log_body(&self) -> String {
        format!("{self:?}")
    }
}

/// Type-erased request or reply body.
///
/// A payload only renders into logs when it was created with
/// [`Payload::loggable`]; otherwise the body is omitted.
pub struct Payload {
    value: Box<dyn Any + Send>,
    render: Option<fn(&dyn Any) -> Option<String>>,
}

fn render<T: LogBody + 'static>(value: &dyn Any) -> Option<String> {
    value.downcast_ref::<T>().map(LogBody::log_body)
}

impl Payload {
    /// Opaque payload, never logged.
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self {
            value: Box::new(value),
            render: None,
        }
    }

    pub fn loggable<T: Any + Send + LogBody>(value: T) -> Self {
        Self {
            value: Box::new(value),
            render: Some(render::<T>),
        }
    }

    /// Log rendering of the body, if the payload supports it.
    pub fn log_body(&self) -> Option<String> {
        let value: &dyn Any = self.value.as_ref();
        self.render.and_then(|render| render(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Take the body out, or get the payload back on a type mismatch.
    pub fn downcast<T: Any>(self) -> Result<T, Payload> {
        let render = self.render;
        match self.value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Payload { value, render }),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("loggable", &self.render.is_some())
            .finish()
    }
}

/// A unary call travelling through the chain.
#[derive(Debug)]
pub struct UnaryRequest {
    pub ctx: CallContext,
    pub body: Payload,
}

impl UnaryRequest {
    pub fn new(ctx: CallContext, body: Payload) -> Self {
        Self { ctx, body }
    }
}

/// Per-call cross-cutting behaviour with access to the rest of the chain.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, request: UnaryRequest, next: Next<'_>) -> CallResult;
}

/// Terminal step of a chain: the transport call or the service handler.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, request: UnaryRequest) -> CallResult;
}

/// Remainder of the chain, as seen by one interceptor.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    cursor: usize,
    invoker: &'a dyn Invoker,
}

impl<'a> Next<'a> {
    /// Invoke the following interceptor, or the terminal invoker at the end.
    pub async fn run(self, request: UnaryRequest) -> CallResult {
        match self.interceptors.get(self.cursor) {
            Some(interceptor) => {
                let next = Next {
                    cursor: self.cursor + 1,
                    ..self
                };
                interceptor.intercept(request, next).await
            }
            None => self.invoker.invoke(request).await,
        }
    }

    /// Index of the step `run` will execute.
    pub fn position(&self) -> usize {
        self.cursor
    }
}

/// Ordered interceptors composed into one callable unit.
#[derive(Clone)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("count", &self.interceptors.len())
            .finish()
    }
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run `request` through every interceptor, then `invoker`.
    pub async fn call(&self, request: UnaryRequest, invoker: &dyn Invoker) -> CallResult {
        let next = Next {
            interceptors: &self.interceptors,
            cursor: 0,
            invoker,
        };
        next.run(request).await
    }
}

/// Reject registrations beyond [`MAX_INTERCEPTORS`].
pub fn check_bound(count: usize) -> Result<(), ChainError> {
    if count > MAX_INTERCEPTORS {
        return Err(ChainError::TooMany {
            count,
            max: MAX_INTERCEPTORS,
        });
    }
    Ok(())
}

thread_local! {
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain the process panic hook with one that records the stack of the
/// panicking thread while it is still intact.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let stack = Backtrace::force_capture().to_string();
            let _ = PANIC_STACK.try_with(|slot| *slot.borrow_mut() = Some(stack));
            previous(info);
        }));
    });
}

/// First interceptor of every chain: turns a panic anywhere after it into a
/// `ServerErr` result.
#[derive(Debug, Default, Clone, Copy)]
pub struct Recovery;

#[async_trait]
impl Interceptor for Recovery {
    async fn intercept(&self, request: UnaryRequest, next: Next<'_>) -> CallResult {
        install_panic_hook();
        let method = request.ctx.method.clone();
        match AssertUnwindSafe(next.run(request)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                tracing::error!(
                    method = %method,
                    panic = %panic_message(panic.as_ref()),
                    stack = %panic_stack(),
                    "rpc call panicked"
                );
                Err(CallError::Status(Status::new(BusinessCode::ServerErr)))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Stack recorded by the hook for the panic just caught, bounded to
/// [`STACK_LIMIT`]. Both run on the thread that polled the panicking future.
fn panic_stack() -> String {
    let mut stack = PANIC_STACK
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| "stack unavailable".to_string());
    if stack.len() > STACK_LIMIT {
        let mut end = STACK_LIMIT;
        while !stack.is_char_boundary(end) {
            end -= 1;
        }
        stack.truncate(end);
    }
    stack
}
