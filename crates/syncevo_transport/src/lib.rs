//! # SyncEvolution Transport
//!
//! Message transports for SyncML sessions.
//!
//! This crate provides:
//! - The [`TransportAgent`] contract: one message in flight, explicit
//!   `send()`/`wait()`/`get_reply()` cycle, cancel and timeout handling
//! - HTTP(S) transport with proxy and TLS settings
//! - OBEX transport over Bluetooth or TCP links
//! - Local transport talking to a child running the peer's side
//! - A scripted mock agent for tests
//!
//! ## Threading
//!
//! Agents are driven from one thread. Each agent owns a small I/O runtime
//! that only runs while `wait()` (or `shutdown()`) is executing. Other
//! threads interact with a transfer only through its [`CancelHandle`].
//!
//! ## Status Machine
//!
//! ```text
//! Inactive ─send()─▶ Active ─wait()─▶ GotReply | Failed | TimeOut | Canceled
//!                                        │
//!                           send() ◀─────┘            shutdown() ─▶ Closed
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod agent;
mod error;
mod http;
pub mod local;
mod mock;
pub mod obex;
mod ui;

pub use agent::{content_type, CancelHandle, TransportAgent, TransportMessage, TransportStatus};
pub use error::{TransportError, TransportResult};
pub use http::{
    HttpClient, HttpRequest, HttpResponse, HttpTransportAgent, LoopbackClient, LoopbackServer,
    ProxyConfig, ReqwestClient, SslConfig, USER_AGENT,
};
pub use local::LocalTransportAgent;
pub use mock::{MockResponse, MockTransportAgent};
pub use obex::ObexTransportAgent;
pub use ui::{NoUserInterface, PasswordKey, UserInterface};
