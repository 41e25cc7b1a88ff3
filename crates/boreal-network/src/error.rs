use boreal_primitives::wire::WireError;
use boreal_primitives::BlockNumber;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("channel closed")]
    ChannelClosed,

    #[error("publish to topic {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// The peer reset the stream mid-interaction. Silent at the round
    /// level; the handle is invalidated.
    #[error("stream reset by peer")]
    StreamReset,

    #[error("request timed out")]
    Timeout,

    /// The responding peer does not have the requested block.
    #[error("peer does not have block {requested}, its tip is {latest}")]
    DoNotHaveBlock { requested: BlockNumber, latest: BlockNumber },

    /// The response on a stream does not match the request counter.
    #[error("response id {got} does not match request id {expected}")]
    RequestIdMismatch { expected: u64, got: u64 },

    #[error("no usable stream handle for peer: {0}")]
    Handle(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type NetworkResult<T> = Result<T, NetworkError>;
