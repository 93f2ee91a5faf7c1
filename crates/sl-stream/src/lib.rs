//! sl-stream - Incremental streaming cache synchronizer
//!
//! Keeps an ordered, keyed window of records mirrored from a server-side
//! table. A subscription asks the server for a window, the server answers
//! with the range it actually materialized, and add/modify/delete events then
//! keep the client's copy current. When the connection drops and comes back,
//! every subscription resumes from the window it had reached.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ConnectionSupervisor                        │
//! │  link state, session registry, alerts, dispatch loop         │
//! │                                                             │
//! │  ┌──────────────────┐  ┌──────────────────┐                 │
//! │  │ StreamSession    │  │ StreamSession    │   ...           │
//! │  │ query + cache    │  │ query + cache    │                 │
//! │  │ (WindowCache)    │  │ (WindowCache)    │                 │
//! │  └──────────────────┘  └──────────────────┘                 │
//! │                          │                                  │
//! │                 ┌────────┴────────┐                         │
//! │                 │    Transport    │                         │
//! │                 │ (named events)  │                         │
//! │                 └─────────────────┘                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sl_stream::testing::{numbered_records, SimulatedTable};
//! use sl_stream::{ClientConfig, ConnectionSupervisor, MockTransport, StreamQuery, StreamUpdate};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(MockTransport::default());
//!     let table = SimulatedTable::attach("nodes", "id", transport.clone());
//!     table.seed(numbered_records("id", 1..=100));
//!
//!     let supervisor = ConnectionSupervisor::new(transport, ClientConfig::default());
//!     let _dispatch = supervisor.spawn();
//!
//!     let query = StreamQuery::table("nodes", "id").with_count(10);
//!     let session = supervisor
//!         .open_session(query, |update: &StreamUpdate| {
//!             println!("{:?} {}", update.change.kind, update.change.key);
//!         })
//!         .await?;
//!
//!     println!("window: {:?}", session.query().window);
//!     supervisor.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod alert;
pub mod cache;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod supervisor;
pub mod testing;
pub mod transport;

pub use alert::{Alert, AlertLevel};
pub use cache::{CacheChange, ChangeKind, Record, RecordKey, WindowBounds, WindowCache};
pub use config::{ClientConfig, EvictionPolicy};
pub use error::{StreamError, StreamResult};
pub use protocol::{StreamAck, StreamEvent, StreamQuery, StreamSource};
pub use session::{ChangeListener, SessionStatus, StreamSession, StreamUpdate};
pub use supervisor::{ConnectionSupervisor, LinkState, SupervisorHandle};
pub use transport::{MockTransport, MockTransportConfig, Transport, TransportError, TransportEvent};
