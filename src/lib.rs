pub mod config;
pub mod jsonrpc;
pub mod process;

// 公開API
pub use config::SessionConfig;
pub use jsonrpc::{RpcChild, RpcError, RpcResult, SessionEvent, SessionEvents};
pub use process::{ChildProcess, ExitReport};
