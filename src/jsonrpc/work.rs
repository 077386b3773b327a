//! Two-phase timeout lifecycle of one outbound message.
//!
//! A work item watches up to two phases:
//! - consume: the write of the envelope is acknowledged by the transport
//! - produce: a correlated result or error arrives
//!
//! Every method returns the signals the transition produced. `Finish` is
//! signalled exactly once per item, and by then no deadline is armed.

use super::error::{RpcError, RpcResult};
use super::id::CorrelationId;

/// A cancelable scheduled callback.
pub trait Deadline: Send {
    fn cancel(&mut self);
}

impl Deadline for tokio::task::JoinHandle<()> {
    fn cancel(&mut self) {
        self.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Consume,
    Produce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkSignal {
    Timeout(Phase),
    Finish,
}

pub struct WorkItem {
    id: CorrelationId,
    ticket: u64,
    consume: Option<Box<dyn Deadline>>,
    produce: Option<Box<dyn Deadline>>,
    consume_pending: bool,
    produce_pending: bool,
    acknowledged: bool,
    finished: bool,
}

impl WorkItem {
    /// Register a work item. At least one phase must be watched.
    ///
    /// `ticket` distinguishes this item from earlier items that used the
    /// same id, so expiries of already finished items can be told apart.
    pub fn register(
        id: CorrelationId,
        ticket: u64,
        consume: Option<Box<dyn Deadline>>,
        produce: Option<Box<dyn Deadline>>,
    ) -> RpcResult<Self> {
        if consume.is_none() && produce.is_none() {
            return Err(RpcError::InvalidArgument(
                "at least one of \"consume\" or \"produce\" must be present".to_string(),
            ));
        }
        Ok(Self {
            id,
            ticket,
            consume_pending: consume.is_some(),
            produce_pending: produce.is_some(),
            consume,
            produce,
            acknowledged: false,
            finished: false,
        })
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of deadlines still armed.
    pub fn armed(&self) -> usize {
        self.consume.is_some() as usize + self.produce.is_some() as usize
    }

    /// The transport accepted the bytes.
    pub fn on_write_acknowledged(&mut self) -> Vec<WorkSignal> {
        if self.finished || self.acknowledged {
            return Vec::new();
        }
        self.acknowledged = true;
        disarm(&mut self.consume);

        if !self.consume_pending {
            // consume phase was either not watched or already reported as failed
            return Vec::new();
        }
        self.consume_pending = false;

        if self.produce_pending {
            Vec::new()
        } else {
            self.complete(Vec::new())
        }
    }

    /// The consume deadline expired before the write was acknowledged.
    pub fn on_consume_timeout(&mut self) -> Vec<WorkSignal> {
        if self.finished || self.acknowledged || !self.consume_pending {
            return Vec::new();
        }
        self.consume_pending = false;
        disarm(&mut self.consume);

        let signals = vec![WorkSignal::Timeout(Phase::Consume)];
        if self.produce_pending {
            signals
        } else {
            self.complete(signals)
        }
    }

    /// The produce deadline expired before a reply arrived. Always terminal.
    pub fn on_produce_timeout(&mut self) -> Vec<WorkSignal> {
        if self.finished || !self.produce_pending {
            return Vec::new();
        }
        self.produce_pending = false;
        self.complete(vec![WorkSignal::Timeout(Phase::Produce)])
    }

    /// A correlated reply arrived, or the session is draining.
    pub fn finish(&mut self) -> Vec<WorkSignal> {
        if self.finished {
            return Vec::new();
        }
        self.complete(Vec::new())
    }

    fn complete(&mut self, mut signals: Vec<WorkSignal>) -> Vec<WorkSignal> {
        disarm(&mut self.consume);
        disarm(&mut self.produce);
        self.consume_pending = false;
        self.produce_pending = false;
        self.finished = true;
        signals.push(WorkSignal::Finish);
        signals
    }
}

fn disarm(slot: &mut Option<Box<dyn Deadline>>) {
    if let Some(mut deadline) = slot.take() {
        deadline.cancel();
    }
}

impl Drop for WorkItem {
    fn drop(&mut self) {
        disarm(&mut self.consume);
        disarm(&mut self.produce);
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("ticket", &self.ticket)
            .field("consume_armed", &self.consume.is_some())
            .field("produce_armed", &self.produce.is_some())
            .field("acknowledged", &self.acknowledged)
            .field("finished", &self.finished)
            .finish()
    }
}
