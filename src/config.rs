//! Session configuration

use std::time::Duration;

use crate::jsonrpc::error::{RpcError, RpcResult};

/// Default upper bound for a consume or produce deadline.
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(60);

/// How long stdout may keep delivering lines after the child exited.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Label used in log lines and diagnostic events
    pub name: String,
    /// Strip unknown top-level members from inbound messages before classifying
    pub sanitize: bool,
    /// Largest accepted consume/produce deadline
    pub max_timeout: Duration,
    /// Wait this long for stdout to reach EOF once the child has exited
    pub exit_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "child".to_string(),
            sanitize: true,
            max_timeout: DEFAULT_MAX_TIMEOUT,
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }
}

impl SessionConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_sanitize(mut self, sanitize: bool) -> Self {
        self.sanitize = sanitize;
        self
    }

    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = max_timeout;
        self
    }

    pub fn with_exit_grace(mut self, exit_grace: Duration) -> Self {
        self.exit_grace = exit_grace;
        self
    }

    pub(crate) fn check_timeout(&self, what: &str, timeout: Option<Duration>) -> RpcResult<()> {
        match timeout {
            Some(timeout) if timeout.is_zero() => Err(RpcError::InvalidArgument(format!(
                "\"{}\" must be greater than zero",
                what
            ))),
            Some(timeout) if timeout > self.max_timeout => Err(RpcError::InvalidArgument(format!(
                "\"{}\" out of range ({:?} > {:?})",
                what, timeout, self.max_timeout
            ))),
            _ => Ok(()),
        }
    }
}
