//! Stanza counting, ACK exchange, ENABLE/RESUME negotiation and reset policy for XML streams.
//!
//! This crate layers XEP-0198 stream management over an already-framed XML
//! element stream. The core is synchronous: [`StreamManagement`] consumes
//! transport events and negotiation responses and hands back the elements to
//! write. [`ManagedStream`] wraps a [`Transport`] and drives that core with
//! async round trips and timeouts.
//!
//! ## Features
//!
//! - **Counters**: inbound/outbound counts of countable stanzas with wrapping
//! - **Ack exchange**: `<r/>` after outbound stanzas, `<a h=../>` on request
//! - **Negotiation**: resume a held session, otherwise enable after binding
//! - **Reset policy**: counters cleared on every new stream, session id kept
//! - **Feature pipeline**: PreBind, Bind and PostBind handlers run in order
//! - **Resume store**: in-memory and JSON-file persistence of resumable sessions
//!
//! ## Example
//!
//! ```rust,no_run
//! use sm_session::{FeaturePipeline, ManagedStream, MemoryTransport, SmConfig, StreamManagement};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (transport, _peer) = MemoryTransport::pair();
//! let mut stream = ManagedStream::new(transport, StreamManagement::new(SmConfig::default()));
//! let mut pipeline = FeaturePipeline::with_stream_management();
//!
//! // New stream: reset, then resume or enable
//! stream.online()?;
//! stream.negotiate(&mut pipeline).await?;
//!
//! while let Some(stanza) = stream.recv().await? {
//!     println!("Received <{}/>", stanza.name());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod exchange;
pub mod features;
pub mod manager;
pub mod negotiator;
pub mod state;
pub mod store;
pub mod stream;
pub mod transport;

pub use config::SmConfig;
pub use error::{SmError, StoreError, TransportError};
pub use exchange::AckExchange;
pub use features::{EnableFeature, Feature, FeaturePipeline, Flow, Negotiated, Phase, ResumeFeature};
pub use manager::{StreamEvent, StreamManagement};
pub use negotiator::{NegotiationState, Negotiator};
pub use state::SessionState;
pub use store::{FileStore, MemoryStore, ResumeRecord, ResumeStore};
pub use stream::{is_enable_response, is_negotiation_response, is_resume_response, ManagedStream};
pub use transport::{MemoryTransport, Transport};
