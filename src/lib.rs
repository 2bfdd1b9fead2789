//! `netstack-icmpv6`: the blocking ICMPv6 `sendto` path of a poll-driven
//! network stack.
//!
//! # Architecture
//!
//! ```text
//!  caller thread                               poll driver
//!  ┌──────────────┐                            ┌──────────────┐
//!  │ Icmpv6Socket │                            │ NetStack::   │
//!  │   send_to    │                            │   poll(dev)  │
//!  └──────┬───────┘                            └──────┬───────┘
//!         │ resolve neighbor                          │
//!         │ register handler ─────▶ ┌─────────────┐ ◀─┘ once per cycle
//!         │ locked_wait             │ CallbackTable│──▶ sendto_eventhandler
//!         │   (lock released)       └─────────────┘        │
//!         │                                                │ claim TxBuffer,
//!         │ ◀──────────── semaphore posted ────────────────┘ build packet
//!         │ free slot, return verdict
//!  ┌──────▼───────┐                            ┌──────────────┐
//!  │ Icmpv6Conn   │ ◀──── NetStack::input ──── │ link driver  │
//!  │ (affinity +  │     matching echo replies  │ take_tx_frame│
//!  │  read-ahead) │                            └──────────────┘
//!  └──────────────┘
//! ```
//!
//! Everything in the boxes above lives behind one stack lock
//! ([`net::NetStack`]).  The caller's only suspension point is the wait for
//! its handler's verdict, during which the lock is released.
//!
//! Each module has a single responsibility:
//! - [`packet`]    — IPv6/ICMPv6 layout, checksum, echo header parsing
//! - [`device`]    — interfaces and their single-slot transmit buffers
//! - [`devif`]     — poll-bus callback table
//! - [`net`]       — the stack lock, routing, inbound delivery, interruption
//! - [`neighbor`]  — neighbor resolution and cache
//! - [`conn`]      — per-socket affinity and flush policy
//! - [`readahead`] — buffered replies and the shared buffer pool
//! - `sendto`      — the send coordinator and its poll handler
//! - [`socket`]    — user-facing socket handle
//! - [`clock`]     — time sources
//! - [`config`]    — stack and socket tunables
//! - [`stats`]     — protocol counters
//! - [`error`]     — crate-wide error type

pub mod clock;
pub mod config;
pub mod conn;
pub mod device;
pub mod devif;
pub mod error;
pub mod neighbor;
pub mod net;
pub mod packet;
pub mod readahead;
mod sendto;
pub mod socket;
pub mod stats;

pub use config::{SocketOptions, StackConfig};
pub use device::{DeviceId, NetDevice};
pub use error::{Error, Result};
pub use net::{Interrupter, NetStack};
pub use socket::Icmpv6Socket;
