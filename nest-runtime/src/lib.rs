//! Nest: a lightweight, single-process, multi-threaded actor runtime.
//!
//! Thousands of isolated services exchange asynchronous messages,
//! driven by a fixed pool of worker threads and a single event-driven
//! I/O thread. Each service processes one message at a time; no service
//! ever blocks a worker on a kernel wait.
//!
//! # Architecture
//!
//! ```text
//! Layer 0: message, env, log, monitor, timer, poll (no internal deps)
//! Layer 1: handle, mq, module
//! Layer 2: service, harbor, error, command
//! Layer 3: scheduler, socket_server, socket
//! Layer 4: runtime (thread assembly, bootstrap)
//! ```
//!
//! Entry points: build a [`runtime::RuntimeCore`], register modules in
//! its [`module::ModuleRegistry`], run [`runtime::bootstrap`], then
//! [`runtime::start`] and [`runtime::Runtime::join`].

pub mod command;
pub mod env;
pub mod error;
pub mod handle;
pub mod harbor;
pub mod log;
pub mod message;
pub mod module;
pub mod monitor;
pub mod mq;
pub mod poll;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod socket;
pub mod socket_server;
pub mod timer;

pub use message::{
    Handle, Message, Payload, PTYPE_CLIENT, PTYPE_ERROR, PTYPE_HARBOR, PTYPE_RESPONSE,
    PTYPE_SOCKET, PTYPE_SYSTEM, PTYPE_TEXT,
};
pub use module::{ModuleRegistry, ServiceModule};
pub use runtime::{bootstrap, start, BootError, Config, Runtime, RuntimeCore};
pub use service::{current_handle, SendError, ServiceContext};
