//! Network-facing plumbing for a Boreal shard node: topic naming, the
//! wire codec, the bounded-concurrency message router, the retrying
//! broadcaster, and the block-sync sub-protocol.
//!
//! The overlay itself (peer discovery, gossip mesh, connection
//! management) is an external collaborator reached through the
//! [`broadcast::Overlay`] and [`sync::StreamOpener`] capabilities.

pub mod broadcast;
pub mod codec;
pub mod error;
pub mod router;
pub mod sync;
pub mod topics;

pub use broadcast::{Broadcaster, Overlay};
pub use codec::{NodeMessage, Routed};
pub use error::{NetworkError, NetworkResult};
pub use router::{spawn_topic_receiver, TopicInlet, TopicMessage};
