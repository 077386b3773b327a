//! JSON-RPC 2.0 over a child process's stdio
//!
//! ## Components
//!
//! - [`types`]: envelope builders and typed messages
//! - [`classify`]: validation of decoded JSON into one of the four message kinds
//! - [`id`]: correlation ids and their cyclic allocator
//! - [`work`]: two-phase (consume/produce) timeout lifecycle of one outbound message
//! - [`table`]: correlation tables of open work items
//! - [`session`]: [`RpcChild`], the actor-backed façade tying them together
//!
//! ## Example
//!
//! ```rust,no_run
//! use rpcchild::jsonrpc::{RpcChild, SessionEvent};
//! use rpcchild::SessionConfig;
//! use std::time::Duration;
//! use tokio::process::Command;
//!
//! # async fn example() -> rpcchild::jsonrpc::RpcResult<()> {
//! let (child, mut events) = RpcChild::spawn(Command::new("worker"), SessionConfig::default())?;
//!
//! let id = child
//!     .request(Some(Duration::from_secs(1)), Some(Duration::from_secs(5)), "ping", None)
//!     .await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::Result(response) => println!("{} -> {}", id, response.result),
//!         SessionEvent::ProduceTimeout { .. } | SessionEvent::Exit(_) => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod error;
pub mod id;
pub mod session;
pub mod table;
pub mod types;
pub mod work;

// Re-export main types for convenience
pub use classify::{classify, Rejection};
pub use error::{RpcError, RpcResult};
pub use id::{CorrelationId, IdAllocator, ID_BOUNDARY};
pub use session::{Lane, Pending, RpcChild, SessionEvent, SessionEvents};
pub use table::CorrelationTable;
pub use types::{
    Envelope, ErrorCode, ErrorObject, ErrorResponse, MessageKind, Notification, Request, Response,
};
pub use work::{Deadline, Phase, WorkItem, WorkSignal};
