//! tether-protocol: Wire protocol between the broker and remote agents
//!
//! This crate defines the binary protocol spoken over the reverse SSH
//! tunnels that agents keep open toward the broker. Frames carry a
//! request id so many remote operations can be in flight on one tunnel.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod metrics;
pub mod request;

pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{FileEntry, Message, MessageType, Operation, ResponsePayload};
pub use metrics::{MetricsFull, MetricsReport, MetricsSummary};
pub use request::RequestId;
