//! Modbus-TCP Proxy Library (mbproxy)
//!
//! A transparent proxy that lets many Modbus-TCP clients share one connection
//! to a server which only accepts a single client at a time.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────┐   ┌─────────────────┐   ┌──────────┐
//! │ Client A │──►│ ClientSession  │──►│                 │   │          │
//! └──────────┘   └────────────────┘   │  request queue  │──►│ Upstream │
//! ┌──────────┐   ┌────────────────┐   │   (bounded)     │   │ Manager  │──► server
//! │ Client B │──►│ ClientSession  │──►│                 │   │          │
//! └──────────┘   └────────────────┘   └─────────────────┘   └──────────┘
//!       ▲                ▲                                       │
//!       └── reply queue ─┴──────── TransactionTable ◄────────────┘
//! ```
//!
//! Every request is renumbered with a proxy-owned transaction identifier before
//! it is written upstream. The [`TransactionTable`] maps that identifier back to
//! the client's own identifier and reply queue so the response can be returned
//! to the right connection unchanged.
//!
//! # Modules
//!
//! - **`codec`**: MBAP framing
//! - **`transaction_table`**: upstream id to client routing
//! - **`upstream`**: upstream connection, forwarding and response loops
//! - **`session`**: per-client reader and writer
//! - **`listener`**: accept loop
//! - **`runtime`**: startup, eviction sweep and shutdown

pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod error;
pub mod listener;
pub mod reconnect;
pub mod runtime;
pub mod session;
pub mod stats;
pub mod transaction_table;
pub mod upstream;

pub use codec::{Frame, FramingError, MbapCodec};
pub use config::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use runtime::{start_proxy, ProxyRuntime};
pub use stats::{ProxyStats, StatsSnapshot};
pub use transaction_table::TransactionTable;
