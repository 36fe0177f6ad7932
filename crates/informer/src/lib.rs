//! Tether informer: keeps a [`tether_store::Store`] in sync with a remote
//! collection through list + watch and fans changes out to handlers.
//!
//! One [`Informer`] per watched resource type and selector. Its reflector loop
//! is the only writer of the store; handlers run on their own delivery tasks.

#![forbid(unsafe_code)]

mod config;
mod dispatcher;
mod fake;
mod handler;
mod informer;
mod reflector;

pub use backoff::ExponentialBackoff;
pub use config::InformerConfig;
pub use dispatcher::HandlerId;
pub use fake::FakeInformer;
pub use handler::{HandlerFuncs, ResourceEventHandler, TransformFn, WatchErrorHandler};
pub use informer::{Informer, Phase, SharedIndexInformer, SyncStatus};
pub use tokio_util::sync::CancellationToken;
