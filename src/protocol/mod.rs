//! JSON text protocol spoken with the detection service.

mod payload;
mod messages;

pub use payload::EncodedImage;
pub use messages::{
    ClientMessage, Command, FaceDetection, InboundMessage, ReferenceBox, ServiceEvent,
};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode outbound message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed inbound message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("inbound message is not a JSON object")]
    NotAnObject,
    #[error("image payload is empty")]
    EmptyImage,
    #[error("invalid image payload: {0}")]
    InvalidImage(String),
}
