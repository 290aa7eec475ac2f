//! Network Layer
//!
//! Everything that talks to the remote service: the envelope codec, the
//! handshake, request correlation, and the supervisor that keeps one
//! authenticated socket alive.

pub mod auth;
pub mod channels;
pub mod client;
pub mod events;
pub mod protocol;
pub mod session;
pub mod signer;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{Allowance, AuthConfig, AuthPolicy, HandshakeError};
pub use channels::{check_channels, ChannelCheck, ChannelDirectory, ChannelInfo};
pub use client::{ClientConfig, ClientError, ReconnectPolicy, SessionClient, TransportError};
pub use events::{Broadcaster, Subscription};
pub use protocol::{ChallengeError, ChallengeToken, FrameError, Inbound, RpcError, RpcRequest, RpcResponse};
pub use session::{RequestError, Status, StatusEvent, StatusSnapshot};
pub use signer::{LocalSigner, SignError, SignPayload, Signature, Signer, TypedPayload};
