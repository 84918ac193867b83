//! The dispatch loop: the primary completion queue, the handler registry,
//! and the server lifecycle.
//!
//! One thread per [`Server`] blocks in [`Server::run`] on the primary queue.
//! Each event's tag is a handler identity; a successful event means that
//! handler's pending accept completed and it should activate, a failed one
//! means the transport is done with the handler (listener shut down) and it
//! is removed and torn down. Removal from the registry happens-before the
//! handler's own teardown, under the registry monitor, so the two never
//! race.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cqmux_core::{CallStatus, CompletionQueue, Error, Guarded, Result, TagId, Transport};

use crate::server::config::ServerConfig;
use crate::server::handler::Handler;
use crate::server::streaming::{OnConnectFn, StreamHandle, StreamingHandler};
use crate::server::unary::{UnaryFn, UnaryHandler};

struct HandlerRegistry {
    handlers: HashMap<TagId, Arc<dyn Handler>>,
    stopped: bool,
    /// Deadline handed to each handler's teardown; overridden by
    /// [`Server::shutdown_deadline`].
    drain: Duration,
}

/// Multiplexes every registered method over one primary completion queue.
pub struct Server {
    primary: Arc<CompletionQueue>,
    registry: Guarded<HandlerRegistry>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            primary: Arc::new(CompletionQueue::new()),
            registry: Guarded::new(HandlerRegistry {
                handlers: HashMap::new(),
                stopped: false,
                drain: config.drain_timeout,
            }),
        }
    }

    /// Registers a unary method. `handler_fn` runs synchronously on the
    /// dispatch loop thread, so it must not block for long: every method
    /// sharing this server stalls while it runs.
    ///
    /// `Response: Default` supplies the body finished alongside an error
    /// status when `handler_fn` panics.
    pub fn register_unary<T, F>(&self, method: &str, transport: T, handler_fn: F) -> Result<()>
    where
        T: Transport,
        T::Response: Default,
        F: Fn(&T::Request) -> (T::Response, CallStatus) + Send + Sync + 'static,
    {
        let accept_tag = TagId::next();
        let handler = Arc::new(UnaryHandler::new(
            method,
            transport,
            Arc::clone(&self.primary),
            accept_tag,
            Box::new(handler_fn) as Box<UnaryFn<T::Request, T::Response>>,
        ));
        self.insert(accept_tag, Arc::clone(&handler) as Arc<dyn Handler>)?;
        // Arm only once the handler is routable, so an immediate accept
        // completion cannot beat the registry insert.
        handler.rearm();
        #[cfg(feature = "tracing")]
        tracing::info!(method, "registered unary method");
        Ok(())
    }

    /// Registers a server-streaming method. `on_connect` runs on the
    /// dispatch loop thread with each new client's initial request. The
    /// returned [`StreamHandle`] broadcasts to every connected client.
    pub fn register_streaming<T, F>(
        &self,
        method: &str,
        transport: T,
        on_connect: F,
    ) -> Result<StreamHandle<T::Response>>
    where
        T: Transport,
        T::Response: Clone,
        F: Fn(&T::Request) + Send + Sync + 'static,
    {
        let accept_tag = TagId::next();
        let handler = Arc::new(StreamingHandler::new(
            method,
            transport,
            Arc::clone(&self.primary),
            accept_tag,
            Box::new(on_connect) as Box<OnConnectFn<T::Request>>,
        ));
        self.insert(accept_tag, Arc::clone(&handler) as Arc<dyn Handler>)?;
        StreamingHandler::start(&handler);
        #[cfg(feature = "tracing")]
        tracing::info!(method, "registered streaming method");
        Ok(StreamHandle::new(handler))
    }

    fn insert(&self, accept_tag: TagId, handler: Arc<dyn Handler>) -> Result<()> {
        self.registry.with(|r| {
            if r.stopped {
                return Err(Error::ServerStopped);
            }
            r.handlers.insert(accept_tag, handler);
            Ok(())
        })
    }

    /// Blocks the calling thread, routing primary-queue events to handlers,
    /// until [`shutdown`](Self::shutdown) is invoked from another thread.
    /// After the queue closes, every handler still registered is torn down
    /// before this returns.
    pub fn run(&self) {
        #[cfg(feature = "tracing")]
        tracing::info!("dispatch loop started");

        while let Some((tag, ok)) = self.primary.next() {
            if ok {
                let handler = self.registry.with(|r| r.handlers.get(&tag).cloned());
                match handler {
                    Some(handler) => handler.activate_next(),
                    None => {
                        // An accept resolved after its handler was removed.
                        #[cfg(feature = "tracing")]
                        tracing::trace!(%tag, "event for unregistered handler ignored");
                    }
                }
            } else {
                let removed = self.registry.with(|r| r.handlers.remove(&tag));
                if let Some(handler) = removed {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(method = handler.method(), "handler removed by transport");
                    let drain = self.registry.with(|r| r.drain);
                    handler.teardown(drain);
                }
            }
        }

        // Queue shut down: drain the registry and tear everything down.
        let (remaining, drain) = self.registry.with(|r| {
            r.stopped = true;
            let remaining: Vec<_> = r.handlers.drain().map(|(_, handler)| handler).collect();
            (remaining, r.drain)
        });
        for handler in remaining {
            handler.teardown(drain);
        }

        #[cfg(feature = "tracing")]
        tracing::info!("dispatch loop stopped");
    }

    /// Begins an immediate shutdown: in-flight deliveries are not waited
    /// for. Equivalent to `shutdown_deadline(Duration::ZERO)`.
    pub fn shutdown(&self) {
        self.shutdown_deadline(Duration::ZERO);
    }

    /// Begins a graceful shutdown from any thread. New registrations and
    /// broadcasts fail with [`Error::ServerStopped`] immediately; in-flight
    /// deliveries are given until `deadline` before their calls are
    /// forcibly cancelled. [`run`](Self::run) drains and returns.
    pub fn shutdown_deadline(&self, deadline: Duration) {
        let handlers = self.registry.with(|r| {
            if r.stopped {
                return Vec::new();
            }
            r.stopped = true;
            r.drain = deadline;
            r.handlers.values().cloned().collect::<Vec<_>>()
        });
        // Refuse new work before closing the queue, mirroring on every
        // handler what the registry flag does for registrations.
        for handler in &handlers {
            handler.halt();
        }
        self.primary.shutdown();
        #[cfg(feature = "tracing")]
        tracing::info!(handlers = handlers.len(), "shutdown initiated");
    }
}
