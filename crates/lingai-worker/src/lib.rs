//! Model worker core.
//!
//! A [`WorkerSession`] receives request frames, runs each one as its own task
//! and answers through a [`Transport`]:
//! - [`LifecycleManager`] owns the model state and serializes load/unload
//! - [`CorrelationRegistry`] tracks in-flight ids and gates terminal responses
//! - [`Dispatcher`] validates and routes requests
//! - [`StreamEmitter`] turns engine fragments into ordered stream chunks

pub mod dispatcher;
pub mod emitter;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod session;
pub mod transport;

pub use dispatcher::Dispatcher;
pub use emitter::{StreamEmitter, StreamOutcome};
pub use error::WorkerError;
pub use lifecycle::{LifecycleManager, ModelLease, ModelState};
pub use registry::{CorrelationRegistry, CorrelationToken};
pub use session::WorkerSession;
pub use transport::{ChannelTransport, SendError, Transport};
