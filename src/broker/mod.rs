//! The broker: resolution, replication pipeline, append FSM, and the
//! framed RPC surface.

pub mod append;
pub mod client;
pub mod frame;
pub mod index;
pub mod pipeline;
pub mod proto;
pub mod read;
pub mod reconcile;
pub mod replica;
pub mod resolver;
pub mod server;
pub mod service;
pub mod spool;

pub use append::{AppendError, AppendOutcome};
pub use frame::{FrameError, FrameReader, FrameWriter};
pub use index::FragmentIndex;
pub use pipeline::Pipeline;
pub use proto::{Header, Message, Status};
pub use replica::Replica;
pub use resolver::{Resolution, Resolver};
pub use service::{Broker, BrokerCore};
pub use spool::Spool;
