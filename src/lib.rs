//! Event socket engine for controlling and observing a telephony switch
//!
//! This crate implements the FreeSWITCH event socket wire protocol:
//! line-oriented frames (a header block plus an optional length-delimited
//! content block) over a persistent TCP connection, with commands answered
//! strictly in send order and asynchronous events interleaved on the same
//! stream.
//!
//! # Architecture
//!
//! - [`Frame`] / [`FrameParser`] — turn the byte stream into typed frames
//!   and classify them ([`FrameKind`]), including the secondary parsing of
//!   header-shaped and tabular content.
//! - [`EventSocket`] (Clone + Send) — one live session. Commands suspend
//!   the calling task and are correlated positionally (FIFO) with their
//!   replies by a background reader task; event frames never consume a
//!   reply waiter and are routed to observers instead.
//! - [`EventRouter`] — ordered observer registrations by event name or
//!   wildcard, with per-observer failure isolation.
//! - [`Supervisor`] — explicit [`Config`], dial-out connection or dial-in
//!   accept loop, termination-signal handling, and orderly shutdown.
//!
//! # Dial-out mode
//!
//! The application dials the switch and authenticates:
//!
//! ```rust,no_run
//! use switchboard::{Config, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), switchboard::Error> {
//!     let supervisor = Supervisor::new(Config::dial_out("localhost", "ClueCon"));
//!
//!     supervisor.router().subscribe("CHANNEL_HANGUP", |frame| {
//!         println!("hangup: {:?}", frame.content_field("hangup_cause"));
//!         Ok(())
//!     });
//!
//!     let socket = supervisor.connect().await?;
//!     let status = socket.api("status").await?;
//!     println!("{}", status.raw_content());
//!     Ok(())
//! }
//! ```
//!
//! # Dial-in mode
//!
//! The switch dials the application, one connection per call. The engine
//! sends `connect` before anything else and keeps the returned channel
//! context on the session:
//!
//! ```rust,no_run
//! use switchboard::{Config, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), switchboard::Error> {
//!     let supervisor = Supervisor::new(Config::dial_in("0.0.0.0"));
//!     supervisor.install_signal_handlers();
//!
//!     supervisor
//!         .serve(|socket| async move {
//!             if let Some(context) = socket.context() {
//!                 println!("call from {:?}", context.header("caller_caller_id_number"));
//!             }
//!             let reason = socket.closed().await;
//!             println!("session ended: {reason}");
//!         })
//!         .await
//! }
//! ```
//!
//! # Command builders
//!
//! The [`commands`] module formats common API command strings; the engine
//! writes whatever string it is handed, verbatim:
//!
//! ```rust
//! use switchboard::commands::Originate;
//!
//! let cmd = Originate::new("sofia/user/coltrane").extension("1234");
//! assert_eq!(cmd.to_string(), "api originate sofia/user/coltrane 1234");
//! ```

pub mod commands;
pub mod connection;
pub mod constants;
pub mod error;
pub mod frame;
pub mod parser;
pub mod router;
pub mod supervisor;

pub(crate) mod reply;

pub use connection::{DisconnectReason, EventSocket, SessionState, SocketMode};
pub use constants::{DEFAULT_DIAL_IN_PORT, DEFAULT_DIAL_OUT_PORT};
pub use error::{Error, Result};
pub use frame::{Content, Frame, FrameKind, HeaderMap, ReplyStatus};
pub use parser::{parse_frame, FrameParser};
pub use router::{EventRouter, ObserverId, WILDCARD};
pub use supervisor::{Config, Supervisor};
