//! # etp-session
//!
//! Session engine for the Energistics Transfer Protocol (ETP) 1.1 and 1.2.
//!
//! One [`Session`] drives one connection: it negotiates the protocols both
//! endpoints will use, assigns message ids, encodes frames (with optional
//! gzip body compression), dispatches inbound messages to the registered
//! protocol handlers and reassembles blobs sent as Chunk messages.
//!
//! ## Architecture
//!
//! - **Codec**: Avro header + body framing, gzip per the compression policy
//! - **Version adapters**: everything that differs between 1.1 and 1.2
//! - **Handlers**: one per (protocol, role), with typed message tables and
//!   subscriber lists for application code
//! - **Transport**: frame sink/source traits; the connection itself is
//!   supplied by the caller
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//!
//! use etp_session::transport::memory_pair;
//! use etp_session::v12::store::{StoreCustomerHandler, StoreHandler};
//! use etp_session::{EtpVersion, Session};
//!
//! #[tokio::main]
//! async fn main() -> etp_session::Result<()> {
//!     let (client_end, server_end) = memory_pair(64);
//!
//!     let (sink, source) = server_end.split();
//!     let server = Session::builder()
//!         .server()
//!         .register(StoreHandler::new())
//!         .connect(sink, source)?;
//!
//!     let (sink, source) = client_end.split();
//!     let client = Session::builder()
//!         .version(EtpVersion::V12)
//!         .register(StoreCustomerHandler::new())
//!         .connect(sink, source)?;
//!
//!     client.open(Duration::from_secs(5)).await?;
//!     server.open(Duration::from_secs(5)).await?;
//!
//!     let store = client.handler::<StoreCustomerHandler>().unwrap();
//!     store.get_data_objects(vec!["eml:///witsml20.Well(1)".into()], "xml").await?;
//!     client.close("done").await
//! }
//! ```

pub mod adapter;
pub mod codec;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod v11;
pub mod v12;

mod writer;

pub use adapter::{EtpVersion, VersionAdapter};
pub use error::{error_codes, EtpError, Result};
pub use handler::{EventSubscribers, HandlerBase, HandlerRegistry, ProtocolEvent, ProtocolHandler};
pub use protocol::{flags, MessageHeader, SupportedProtocol};
pub use session::{
    send_status, Blob, Completion, PendingResponse, Session, SessionBuilder, SessionConfig,
    SessionState,
};
