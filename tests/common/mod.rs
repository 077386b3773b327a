//! テスト用の共通ヘルパー
//!
//! 偽プロセスとメモリ上のパイプでセッションを駆動する
#![allow(dead_code)]

use async_trait::async_trait;
use rpcchild::jsonrpc::{RpcChild, SessionEvent, SessionEvents};
use rpcchild::{ChildProcess, ExitReport, SessionConfig};
use serde_json::Value;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::mpsc;

pub fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// Process handle whose exit is scripted by the test.
pub struct FakeProcess {
    exit_rx: mpsc::UnboundedReceiver<ExitReport>,
    exit_tx: mpsc::UnboundedSender<ExitReport>,
}

impl FakeProcess {
    pub fn new() -> (Self, mpsc::UnboundedSender<ExitReport>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (
            Self {
                exit_rx,
                exit_tx: exit_tx.clone(),
            },
            exit_tx,
        )
    }
}

#[async_trait]
impl ChildProcess for FakeProcess {
    async fn wait(&mut self) -> io::Result<ExitReport> {
        match self.exit_rx.recv().await {
            Some(report) => Ok(report),
            // we hold a sender ourselves, so this never ends
            None => std::future::pending().await,
        }
    }

    fn kill(&mut self, signal: Option<i32>) -> io::Result<()> {
        let _ = self.exit_tx.send(ExitReport {
            code: None,
            signal: Some(signal.unwrap_or(9)),
        });
        Ok(())
    }
}

/// The child's side of a session running over duplex pipes.
pub struct Harness {
    pub child: RpcChild,
    pub events: SessionEvents,
    /// What the session wrote to the child's stdin
    pub stdin: Lines<BufReader<DuplexStream>>,
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
    pub exit: mpsc::UnboundedSender<ExitReport>,
}

impl Harness {
    pub fn start(config: SessionConfig) -> Self {
        Self::with_stdin_capacity(config, 64 * 1024)
    }

    /// A small stdin capacity makes writes block until the test reads them.
    pub fn with_stdin_capacity(config: SessionConfig, capacity: usize) -> Self {
        let (session_stdin, child_stdin) = tokio::io::duplex(capacity);
        let (child_stdout, session_stdout) = tokio::io::duplex(64 * 1024);
        let (child_stderr, session_stderr) = tokio::io::duplex(64 * 1024);
        let (process, exit) = FakeProcess::new();

        let (child, events) = RpcChild::with_transport(
            session_stdin,
            session_stdout,
            session_stderr,
            process,
            config,
        );

        Self {
            child,
            events,
            stdin: BufReader::new(child_stdin).lines(),
            stdout: child_stdout,
            stderr: child_stderr,
            exit,
        }
    }

    /// Next line the session wrote, decoded.
    pub async fn read_stdin(&mut self) -> Value {
        let line = self
            .stdin
            .next_line()
            .await
            .expect("stdin read failed")
            .expect("stdin closed");
        serde_json::from_str(&line).expect("session wrote invalid JSON")
    }

    pub async fn write_stdout(&mut self, line: &str) {
        self.stdout.write_all(line.as_bytes()).await.unwrap();
        self.stdout.write_all(b"\n").await.unwrap();
    }

    pub async fn write_stderr(&mut self, line: &str) {
        self.stderr.write_all(line.as_bytes()).await.unwrap();
        self.stderr.write_all(b"\n").await.unwrap();
    }

    pub fn exit_with(&self, code: i32) {
        self.exit
            .send(ExitReport {
                code: Some(code),
                signal: None,
            })
            .unwrap();
    }

    pub async fn next_event(&mut self) -> SessionEvent {
        next_event(&mut self.events).await
    }
}

pub async fn next_event(events: &mut SessionEvents) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(120), events.recv())
        .await
        .expect("no event within 120s")
        .expect("event stream closed")
}
