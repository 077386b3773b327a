//! rpcchild - send one JSON-RPC request to a child process and print what comes back
//!
//! Command-line usage:
//!   rpcchild [--consume-ms N] [--produce-ms N] [--wait-ms N] [--params JSON] <method> -- <program> [args...]

use anyhow::{bail, Context, Result};
use clap::Parser;
use rpcchild::jsonrpc::{CorrelationId, SessionEvent};
use rpcchild::{RpcChild, SessionConfig};
use serde_json::Value;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Parser, Debug)]
#[command(name = "rpcchild", about = "Talk JSON-RPC 2.0 to a child process over stdio")]
struct Cli {
    /// Deadline for the child to accept the request, in milliseconds
    #[arg(long, default_value_t = 1000)]
    consume_ms: u64,

    /// Deadline for the child to answer, in milliseconds
    #[arg(long, default_value_t = 5000)]
    produce_ms: u64,

    /// Give up waiting for events after this many milliseconds
    #[arg(long, default_value_t = 10000)]
    wait_ms: u64,

    /// Request params as a JSON object or array
    #[arg(long)]
    params: Option<String>,

    /// Method to call
    method: String,

    /// Program and arguments to run
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let params = cli
        .params
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("--params is not valid JSON")?;

    let Some((program, args)) = cli.command.split_first() else {
        bail!("missing program to run");
    };
    let mut command = Command::new(program);
    command.args(args);

    let config = SessionConfig::default().with_name(program.as_str());
    let (child, mut events) = RpcChild::spawn(command, config)
        .with_context(|| format!("failed to start {}", program))?;

    let id = child
        .request(
            Some(Duration::from_millis(cli.consume_ms)),
            Some(Duration::from_millis(cli.produce_ms)),
            &cli.method,
            params,
        )
        .await?;

    let wait = Duration::from_millis(cli.wait_ms);
    let mut answered = false;
    let outcome = timeout(wait, async {
        while let Some(event) = events.recv().await {
            println!("{}", describe(&event));
            match &event {
                SessionEvent::Result(response) if is_reply_to(&response.id, id) => {
                    answered = true;
                    return true;
                }
                SessionEvent::Error(response) if is_reply_to(&response.id, id) => return true,
                SessionEvent::ProduceTimeout { id: expired } if *expired == id => return true,
                SessionEvent::Exit(_) => return false,
                _ => {}
            }
        }
        false
    })
    .await;

    if matches!(outcome, Ok(true)) || outcome.is_err() {
        if outcome.is_err() {
            eprintln!("no answer within {:?}", wait);
        }
        let _ = child.kill(None).await;
        while let Ok(Some(event)) = timeout(Duration::from_secs(1), events.recv()).await {
            let exited = matches!(event, SessionEvent::Exit(_));
            println!("{}", describe(&event));
            if exited {
                break;
            }
        }
    }

    println!("sent={} received={}", child.sent(), child.received());
    std::process::exit(if answered { 0 } else { 1 });
}

fn is_reply_to(value: &Value, id: CorrelationId) -> bool {
    CorrelationId::from_value(value) == Some(id)
}

fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Notify(notification) => format!(
            "notify {} {}",
            notification.method,
            notification.params.clone().unwrap_or(Value::Null)
        ),
        SessionEvent::Request(request) => format!(
            "request {} {} {}",
            request.id,
            request.method,
            request.params.clone().unwrap_or(Value::Null)
        ),
        SessionEvent::Result(response) => format!("result {} {}", response.id, response.result),
        SessionEvent::Error(response) => format!(
            "error {} {} {}",
            response.id, response.error.code, response.error.message
        ),
        SessionEvent::ParseError { line, reason } => format!("parse-error {}: {}", reason, line),
        SessionEvent::Unexpected(envelope) => match serde_json::to_string(envelope) {
            Ok(json) => format!("unexpected {}", json),
            Err(_) => format!("unexpected {:?}", envelope.kind()),
        },
        SessionEvent::Diagnostic { name, line } => format!("diagnostic [{}] {}", name, line),
        SessionEvent::ConsumeTimeout { lane, id } => format!("consume-timeout {} ({:?})", id, lane),
        SessionEvent::ProduceTimeout { id } => format!("produce-timeout {}", id),
        SessionEvent::Exit(report) => format!("exit {}", report),
    }
}
