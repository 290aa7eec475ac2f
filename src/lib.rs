//! # Tictac Channel
//!
//! Authenticated, auto-reconnecting RPC session client for the payment
//! channel service behind the tic-tac-toe game.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TICTAC CHANNEL CLIENT                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Shared primitives                         │
//! │  └── hash.rs     - Signing digests, canonical JSON           │
//! │                                                              │
//! │  network/        - Session layer                             │
//! │  ├── protocol.rs - Envelope codec, challenge parsing         │
//! │  ├── signer.rs   - Signing capability (ed25519)              │
//! │  ├── auth.rs     - Challenge-response handshake             │
//! │  ├── session.rs  - Status and request correlation            │
//! │  ├── events.rs   - Observer fan-out                          │
//! │  ├── client.rs   - Supervisor, transport, reconnects         │
//! │  └── channels.rs - Channel directory lookup                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Session Guarantees
//!
//! - Every request sent while connected settles exactly once
//! - Responses are matched by request id, never by arrival order
//! - Nothing from a superseded connection reaches the current one
//! - `close()` cancels every timer and retry in one step

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;

// Re-export commonly used types
pub use network::channels::{check_channels, ChannelCheck, ChannelDirectory, ChannelInfo};
pub use network::client::{ClientConfig, ClientError, ReconnectPolicy, SessionClient};
pub use network::session::{RequestError, Status, StatusEvent};
pub use network::signer::{LocalSigner, SignPayload, Signature, Signer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
