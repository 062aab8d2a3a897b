//! Seccam Publisher
//!
//! Durable upload pipeline for an unattended security-camera recorder. A
//! producer thread cuts the encoded camera stream into time-bounded chunks;
//! a single-threaded event loop uploads every chunk, in order, to a
//! dedicated folder of a Dropbox-style storage API.
//!
//! ## Features
//!
//! - **Ordered, lossless hand-off**: chunks cross from the producer thread to
//!   the event loop through an in-process queue or a Unix socket pair
//! - **Remote bookkeeping**: the app folder is created or enumerated at
//!   startup, and the total bytes stored remotely is tracked exactly
//! - **Bounded retries**: failed uploads are retried with linearly growing
//!   delays; exhaustion is fatal and loud
//! - **Clean termination**: the final chunk ends the session exactly once
//!
//! ## Architecture
//!
//! ```text
//! Capture source           Producer thread           Event loop (current_thread)
//! ┌──────────────┐        ┌──────────────┐          ┌──────────────────────┐
//! │ stdin / FIFO │───────▶│ Segmenter    │          │ Publisher            │
//! └──────────────┘        └──────────────┘          │   state machine      │
//!                                │                  │   retry timer        │
//!                                ▼                  └──────────────────────┘
//!                         ┌──────────────┐                │         │
//!                         │ Chunk        │───────────────▶│         │ events
//!                         │ channel      │                │         ▼
//!                         └──────────────┘                │   ┌────────────┐
//!                                                         │   │ Controller │
//!                                       ┌─────────────────┘   └────────────┘
//!                                       ▼
//!                         ┌──────────────┐  ┌──────────────┐
//!                         │ api host     │  │ content host │
//!                         │ (metadata)   │  │ (uploads)    │
//!                         └──────────────┘  └──────────────┘
//! ```

pub mod api;
pub mod channel;
pub mod chunk;
pub mod config;
pub mod publisher;
pub mod remote;
pub mod retry;
pub mod segmenter;
pub mod state;
pub mod transport;

pub use channel::{ChannelError, ChunkReceiver, ChunkSink};
pub use chunk::{Chunk, ChunkBuilder};
pub use config::PublisherConfig;
pub use publisher::{Publisher, PublisherError, PublisherEvent, PublisherSettings, PublisherStats};
pub use remote::{RemoteFile, RemoteFileSet};
pub use retry::{RetryPolicy, RetryTimer};
pub use segmenter::{Segmenter, SegmenterSettings, StopHandle};
pub use state::PublisherState;
pub use transport::{Endpoint, HttpTransport, Transport, TransportError};
