use thiserror::Error;

/// Errors that can occur across the capsule lifecycle protocol.
#[derive(Debug, Error)]
pub enum CapsuleError {
    /// The backing store was unreachable or a command failed.
    #[error("Store transport error: {0}")]
    Transport(String),

    /// The transport framing of a member string is not valid base64.
    #[error("Malformed capsule framing: {0}")]
    Malformed(#[from] base64::DecodeError),

    /// The envelope inside a member string does not parse.
    ///
    /// A popped entry that fails to decode is a poison pill: it is never
    /// reinserted into the store, since its content cannot be trusted to
    /// round-trip.
    #[error("Capsule decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// The payload could not be serialized into an envelope.
    #[error("Capsule encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Every attempt to reinsert a prematurely popped entry failed.
    /// The entry is lost from the store; logging is the primary mitigation.
    #[error("Requeue exhausted after {attempts} attempts: {last}")]
    RequeueExhausted {
        attempts: u32,
        last: Box<CapsuleError>,
    },
}

pub type Result<T> = std::result::Result<T, CapsuleError>;
