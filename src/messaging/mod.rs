//! Provider/consumer messaging
//!
//! Everything that moves between a publisher, a file reader, a play engine
//! and a client connection goes through a [`Pipe`]:
//!
//! ```text
//!   [Broadcast stream] ──push──► Pipe ──push──► [Play engine] ──push──► Pipe ──► [Connection]
//!   [File provider]   ◄──pull── Pipe ◄──pull── [Play engine]
//! ```
//!
//! Control requests that do not belong in the media flow (seek, pending
//! counts, chunk size) travel as out-of-band messages in the opposite
//! direction.

pub mod message;
pub mod oob;
pub mod pipe;
pub mod status;

pub use message::{EventBody, Ping, PingKind, PipeMessage, PlayStatus, RtmpEvent};
pub use oob::{OobControlMessage, OobResult, OobService, OobTarget};
pub use pipe::{
    Consumer, EndpointId, MessageComponent, Pipe, PipeConnectionEvent, PipeConnectionListener,
    PipeKind, Provider,
};
pub use status::{Status, StatusCode, StatusLevel};
