//! The process-wide event loop that every remote call suspends on.
//!
//! [`SharedServerBuilder`] allocates the event queue exactly once and the
//! [`Reactor`] takes ownership of it. Components never reach for the global
//! themselves: they receive a [`ReactorHandle`] at construction time.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ServingConfig;
use crate::errors::ServingError;

/// Completion queue backing the reactor.
///
/// Only obtainable from [`SharedServerBuilder::add_completion_queue`].
pub struct EventQueue {
    runtime: Runtime,
}

pub struct SharedServerBuilder {
    worker_threads: usize,
    thread_name: String,
    queue_allocated: AtomicBool,
}

static SHARED_SERVER_BUILDER: Lazy<Result<SharedServerBuilder, String>> = Lazy::new(|| {
    ServingConfig::from_env()
        .map(|config| SharedServerBuilder::from_config(&config))
        .map_err(|e| e.to_string())
});

static REACTOR: OnceCell<Arc<Reactor>> = OnceCell::new();

impl SharedServerBuilder {
    pub fn new(worker_threads: usize, thread_name: &str) -> Self {
        SharedServerBuilder {
            worker_threads,
            thread_name: thread_name.to_string(),
            queue_allocated: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &ServingConfig) -> Self {
        SharedServerBuilder::new(config.worker_threads, &config.thread_name)
    }

    /// Process-wide builder configured from the environment.
    pub fn get_instance() -> Result<&'static SharedServerBuilder, ServingError> {
        SHARED_SERVER_BUILDER
            .as_ref()
            .map_err(|msg| ServingError::ConstructionError { msg: msg.clone() })
    }

    /// Allocates the event queue. A builder hands out at most one queue; a
    /// failed allocation does not use it up.
    pub fn add_completion_queue(&self) -> Result<EventQueue, ServingError> {
        if self.worker_threads == 0 {
            return Err(ServingError::ConstructionError {
                msg: "worker_threads must be positive".to_string(),
            });
        }
        if self.queue_allocated.swap(true, Ordering::SeqCst) {
            return Err(ServingError::ConstructionError {
                msg: "completion queue already allocated".to_string(),
            });
        }
        match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.worker_threads)
            .thread_name(self.thread_name.clone())
            .enable_all()
            .build()
        {
            Ok(runtime) => Ok(EventQueue { runtime }),
            Err(e) => {
                self.queue_allocated.store(false, Ordering::SeqCst);
                Err(ServingError::ConstructionError {
                    msg: format!("failed to build event queue: {}", e),
                })
            }
        }
    }
}

pub struct Reactor {
    queue: EventQueue,
}

impl Reactor {
    pub fn new(builder: &SharedServerBuilder) -> Result<Self, ServingError> {
        let queue = builder.add_completion_queue()?;
        info!(
            "reactor constructed, worker_threads: {}, thread_name: {}",
            builder.worker_threads, builder.thread_name
        );
        Ok(Reactor { queue })
    }

    /// Returns the process-wide reactor, constructing it on first access.
    ///
    /// # Panics
    ///
    /// Panics when the event queue cannot be allocated. That is a process
    /// start fault; use [`Reactor::try_get_instance`] to observe it instead.
    pub fn get_instance() -> Arc<Reactor> {
        match Reactor::try_get_instance() {
            Ok(reactor) => reactor,
            Err(e) => panic!("{}", e),
        }
    }

    pub fn try_get_instance() -> Result<Arc<Reactor>, ServingError> {
        REACTOR
            .get_or_try_init(|| {
                let builder = SharedServerBuilder::get_instance()?;
                Reactor::new(builder).map(Arc::new)
            })
            .map(Arc::clone)
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            handle: self.queue.runtime.handle().clone(),
        }
    }

    /// Drives `future` to completion from a thread outside the reactor.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.queue.runtime.block_on(future)
    }
}

/// Clonable handle to the reactor, injected into every component that spawns work.
#[derive(Clone, Debug)]
pub struct ReactorHandle {
    handle: Handle,
}

impl ReactorHandle {
    /// Adopts the runtime the caller is already running on.
    pub fn current() -> Result<Self, ServingError> {
        Handle::try_current()
            .map(|handle| ReactorHandle { handle })
            .map_err(|e| ServingError::ConstructionError {
                msg: format!("no reactor running on this thread: {}", e),
            })
    }

    pub fn tokio_handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}
