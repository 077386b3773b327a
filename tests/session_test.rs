//! セッションの統合テスト
//!
//! 時間を止めたランタイムでタイムアウトと相関処理を検証する

mod common;

use common::{init_logger, Harness};
use rpcchild::jsonrpc::{
    CorrelationId, Envelope, ErrorCode, ErrorObject, ErrorResponse, Lane, Notification, Rejection,
    Request, Response, RpcError, SessionEvent,
};
use rpcchild::{ExitReport, SessionConfig};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;

fn config() -> SessionConfig {
    SessionConfig::default().with_name("worker")
}

fn id(raw: u32) -> CorrelationId {
    CorrelationId::new(raw).unwrap()
}

/// Let every task run until the runtime is idle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_request_written_as_single_line() {
    init_logger();
    let mut harness = Harness::start(config());

    let first = harness
        .child
        .request(None, Some(Duration::from_secs(5)), "subtract", Some(json!([42, 23])))
        .await
        .unwrap();
    let second = harness
        .child
        .request(Some(Duration::from_secs(1)), None, "ping", None)
        .await
        .unwrap();

    assert_eq!(first, id(1));
    assert_eq!(second, id(2));
    assert_eq!(
        harness.read_stdin().await,
        json!({"jsonrpc": "2.0", "id": 1, "method": "subtract", "params": [42, 23]})
    );
    assert_eq!(
        harness.read_stdin().await,
        json!({"jsonrpc": "2.0", "id": 2, "method": "ping"})
    );
}

#[tokio::test(start_paused = true)]
async fn test_produce_timeout_then_late_reply_is_unexpected() {
    init_logger();
    let mut harness = Harness::start(config());
    let started = Instant::now();

    let request = harness
        .child
        .request(
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(5)),
            "ping",
            None,
        )
        .await
        .unwrap();
    harness.read_stdin().await;

    // 書き込みは即座に完了するので consume タイムアウトは発生しない
    let event = harness.next_event().await;
    assert_eq!(event, SessionEvent::ProduceTimeout { id: request });
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(harness.child.pending().await.unwrap().is_empty());

    harness
        .write_stdout(r#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#)
        .await;
    let event = harness.next_event().await;
    assert_eq!(
        event,
        SessionEvent::Unexpected(Envelope::Result(Response {
            id: json!(1),
            result: json!("pong"),
        }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_deadline_counts_from_registration() {
    init_logger();
    let mut harness = Harness::start(config());
    let started = Instant::now();

    let request = harness
        .child
        .request(None, Some(Duration::from_secs(5)), "ping", None)
        .await
        .unwrap();
    // 時計だけ進めても期限は登録時点から数える
    tokio::time::advance(Duration::from_secs(3)).await;

    assert_eq!(
        harness.next_event().await,
        SessionEvent::ProduceTimeout { id: request }
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_millis(5001));
}

#[tokio::test(start_paused = true)]
async fn test_integral_float_reply_is_correlated() {
    init_logger();
    let mut harness = Harness::start(config());

    for method in ["first", "second"] {
        harness
            .child
            .request(None, Some(Duration::from_secs(5)), method, None)
            .await
            .unwrap();
    }

    harness
        .write_stdout(r#"{"jsonrpc":"2.0","id":1.0,"result":"pong"}"#)
        .await;
    assert_eq!(
        harness.next_event().await,
        SessionEvent::Result(Response {
            id: json!(1),
            result: json!("pong"),
        })
    );

    harness
        .write_stdout(r#"{"jsonrpc":"2.0","id":2.0,"error":{"code":-32601.0,"message":"Method not found"}}"#)
        .await;
    assert_eq!(
        harness.next_event().await,
        SessionEvent::Error(ErrorResponse {
            id: json!(2),
            error: ErrorObject::new(ErrorCode::MethodNotFound, None),
        })
    );

    // どちらも解決済みなので produce タイムアウトは来ない
    assert!(harness.child.pending().await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(harness.events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_consume_timeout_keeps_produce_phase_open() {
    init_logger();
    // stdin を読まない限り書き込みが終わらない
    let mut harness = Harness::with_stdin_capacity(config(), 8);
    let started = Instant::now();

    let request = harness
        .child
        .request(
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(5)),
            "ping",
            None,
        )
        .await
        .unwrap();

    let event = harness.next_event().await;
    assert_eq!(
        event,
        SessionEvent::ConsumeTimeout {
            lane: Lane::Client,
            id: request
        }
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(5));
    assert_eq!(harness.child.pending().await.unwrap().client, vec![request]);

    // 遅れて届いた応答はまだ相関できる
    assert_eq!(harness.read_stdin().await["method"], "ping");
    harness
        .write_stdout(r#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#)
        .await;
    let event = harness.next_event().await;
    assert_eq!(
        event,
        SessionEvent::Result(Response {
            id: json!(1),
            result: json!("pong"),
        })
    );
    assert!(harness.child.pending().await.unwrap().is_empty());

    // produce タイマーは解除済み
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(harness.events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_consume_only_request_times_out_once() {
    init_logger();
    let mut harness = Harness::with_stdin_capacity(config(), 8);

    let request = harness
        .child
        .request(Some(Duration::from_secs(1)), None, "ping", None)
        .await
        .unwrap();

    let event = harness.next_event().await;
    assert_eq!(
        event,
        SessionEvent::ConsumeTimeout {
            lane: Lane::Client,
            id: request
        }
    );
    assert!(harness.child.pending().await.unwrap().is_empty());

    // 書き込みが遅れて完了しても何も起きない
    harness.read_stdin().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(harness.events.try_recv().is_err());
    assert_eq!(harness.child.sent(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_notify_finishes_on_write() {
    init_logger();
    let mut harness = Harness::start(config());

    harness
        .child
        .notify(Duration::from_secs(2), "log", Some(json!({"msg": "hi"})))
        .await
        .unwrap();
    assert_eq!(
        harness.read_stdin().await,
        json!({"jsonrpc": "2.0", "method": "log", "params": {"msg": "hi"}})
    );

    settle().await;
    assert!(harness.child.pending().await.unwrap().is_empty());
    assert_eq!(harness.child.sent(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(harness.events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_null_result_is_rejected_false_result_is_not() {
    init_logger();
    let mut harness = Harness::start(config());

    let request = harness
        .child
        .request(None, Some(Duration::from_secs(5)), "check", None)
        .await
        .unwrap();
    assert_eq!(request, id(1));

    harness
        .write_stdout(r#"{"jsonrpc":"2.0","id":1,"result":null}"#)
        .await;
    let event = harness.next_event().await;
    assert_eq!(
        event,
        SessionEvent::ParseError {
            line: r#"{"jsonrpc":"2.0","id":1,"result":null}"#.to_string(),
            reason: Rejection::NullResult.to_string(),
        }
    );
    // 不正な行ではエントリは閉じない
    assert_eq!(harness.child.pending().await.unwrap().client, vec![request]);

    harness
        .write_stdout(r#"{"jsonrpc":"2.0","id":1,"result":false}"#)
        .await;
    let event = harness.next_event().await;
    assert_eq!(
        event,
        SessionEvent::Result(Response {
            id: json!(1),
            result: json!(false),
        })
    );
    assert!(harness.child.pending().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_error_reply_and_duplicate_reply() {
    init_logger();
    let mut harness = Harness::start(config());

    harness
        .child
        .request(None, Some(Duration::from_secs(5)), "missing", None)
        .await
        .unwrap();

    let line = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}"#;
    harness.write_stdout(line).await;
    let expected = ErrorResponse {
        id: json!(1),
        error: ErrorObject::new(ErrorCode::MethodNotFound, None),
    };
    assert_eq!(harness.next_event().await, SessionEvent::Error(expected.clone()));

    // 同じ応答がもう一度来ても二重処理しない
    harness.write_stdout(line).await;
    assert_eq!(
        harness.next_event().await,
        SessionEvent::Unexpected(Envelope::Error(expected))
    );
}

#[tokio::test(start_paused = true)]
async fn test_inbound_messages_are_emitted_directly() {
    init_logger();
    let mut harness = Harness::start(config());

    harness
        .write_stdout(r#"{"jsonrpc":"2.0","method":"progress","params":{"done":3},"extra":1}"#)
        .await;
    harness
        .write_stdout(r#"{"jsonrpc":"2.0","id":"abc","method":"ask","params":[1]}"#)
        .await;

    assert_eq!(
        harness.next_event().await,
        SessionEvent::Notify(Notification {
            method: "progress".to_string(),
            params: Some(json!({"done": 3})),
        })
    );
    assert_eq!(
        harness.next_event().await,
        SessionEvent::Request(Request {
            id: json!("abc"),
            method: "ask".to_string(),
            params: Some(json!([1])),
        })
    );
    assert!(harness.child.pending().await.unwrap().is_empty());
    assert_eq!(harness.child.received(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reply_to_child_request() {
    init_logger();
    let mut harness = Harness::start(config());

    harness
        .write_stdout(r#"{"jsonrpc":"2.0","id":42,"method":"ask"}"#)
        .await;
    let SessionEvent::Request(request) = harness.next_event().await else {
        panic!("expected a request");
    };
    let reply_id = CorrelationId::from_value(&request.id).unwrap();

    let returned = harness
        .child
        .result(Duration::from_secs(1), reply_id, json!({"answer": 42}))
        .await
        .unwrap();
    assert_eq!(returned, id(42));
    assert_eq!(
        harness.read_stdin().await,
        json!({"jsonrpc": "2.0", "id": 42, "result": {"answer": 42}})
    );

    harness
        .child
        .error(
            Duration::from_secs(1),
            id(43),
            ErrorCode::InvalidParams.code(),
            ErrorCode::InvalidParams.message(),
            Some(json!("bad")),
        )
        .await
        .unwrap();
    assert_eq!(
        harness.read_stdin().await,
        json!({"jsonrpc": "2.0", "id": 43, "error": {"code": -32602, "message": "Invalid params", "data": "bad"}})
    );

    settle().await;
    assert!(harness.child.pending().await.unwrap().is_empty());
    assert_eq!(harness.child.sent(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_open_reply_is_refused() {
    init_logger();
    let mut harness = Harness::with_stdin_capacity(config(), 8);

    harness
        .child
        .result(Duration::from_secs(1), id(7), json!("first"))
        .await
        .unwrap();
    let err = harness
        .child
        .result(Duration::from_secs(1), id(7), json!("second"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::DuplicateId(dup) if dup == id(7)));
    assert_eq!(harness.child.pending().await.unwrap().server, vec![id(7)]);

    // 最初の書き込みが終われば同じ id を再び使える
    assert_eq!(harness.read_stdin().await["result"], "first");
    settle().await;
    assert!(harness.child.pending().await.unwrap().is_empty());
    harness
        .child
        .result(Duration::from_secs(1), id(7), json!("again"))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_invalid_arguments_are_rejected() {
    init_logger();
    let harness = Harness::start(config().with_max_timeout(Duration::from_secs(10)));

    let cases = [
        harness.child.request(None, None, "ping", None).await,
        harness
            .child
            .request(Some(Duration::ZERO), None, "ping", None)
            .await,
        harness
            .child
            .request(None, Some(Duration::from_secs(11)), "ping", None)
            .await,
        harness
            .child
            .request(Some(Duration::from_secs(1)), None, "ping", Some(json!(5)))
            .await,
        harness
            .child
            .notify(Duration::from_secs(1), "log", Some(json!("text")))
            .await,
    ];
    for result in cases {
        assert!(matches!(result, Err(RpcError::InvalidArgument(_))), "{:?}", result);
    }

    // 呼び出しの失敗はセッションを壊さない
    assert!(harness.child.pending().await.unwrap().is_empty());
    harness
        .child
        .notify(Duration::from_secs(1), "log", None)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_parse_errors_do_not_stop_session() {
    init_logger();
    let mut harness = Harness::start(config());

    harness.write_stdout("starting up").await;
    harness.write_stdout(r#"{"jsonrpc":"2.0","#).await;
    harness
        .write_stdout(r#"{"jsonrpc":"2.0","id":1,"method":"a","result":1}"#)
        .await;
    harness.write_stdout(r#"{"jsonrpc":"1.0","method":"a"}"#).await;
    harness.write_stdout(r#"{"jsonrpc":"2.0","id":1}"#).await;
    harness
        .write_stdout(r#"{"jsonrpc":"2.0","method":"ready"}"#)
        .await;

    let mut reasons = Vec::new();
    for _ in 0..5 {
        match harness.next_event().await {
            SessionEvent::ParseError { reason, .. } => reasons.push(reason),
            other => panic!("expected a parse error, got {:?}", other),
        }
    }
    assert_eq!(reasons[0], "Not a JSON object");
    assert_eq!(reasons[2], Rejection::Ambiguous.to_string());
    assert_eq!(reasons[3], Rejection::InvalidVersion.to_string());
    assert_eq!(reasons[4], Rejection::NoKeyword.to_string());

    assert!(matches!(
        harness.next_event().await,
        SessionEvent::Notify(Notification { ref method, .. }) if method == "ready"
    ));
    assert_eq!(harness.child.received(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_stderr_lines_are_diagnostics() {
    init_logger();
    let mut harness = Harness::start(config());

    harness.write_stderr("warming up").await;
    harness.write_stderr(r#"{"jsonrpc":"2.0","method":"not-protocol"}"#).await;

    assert_eq!(
        harness.next_event().await,
        SessionEvent::Diagnostic {
            name: "worker".to_string(),
            line: "warming up".to_string(),
        }
    );
    assert!(matches!(
        harness.next_event().await,
        SessionEvent::Diagnostic { ref line, .. } if line.contains("not-protocol")
    ));
    assert_eq!(harness.child.received(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_exit_drains_pending_requests() {
    init_logger();
    let mut harness = Harness::start(config());

    for method in ["first", "second"] {
        harness
            .child
            .request(None, Some(Duration::from_secs(30)), method, None)
            .await
            .unwrap();
    }
    assert_eq!(
        harness.child.pending().await.unwrap().client,
        vec![id(1), id(2)]
    );

    harness.exit_with(1);
    assert_eq!(
        harness.next_event().await,
        SessionEvent::Exit(ExitReport {
            code: Some(1),
            signal: None,
        })
    );

    // ドレイン後はイベント送信も終わる
    // (タイマーの解除はセッション内部のテストで確認している)
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.events.recv().await, None);

    assert!(matches!(
        harness.child.request(None, Some(Duration::from_secs(1)), "late", None).await,
        Err(RpcError::ProcessTerminated)
    ));
    assert!(matches!(
        harness.child.pending().await,
        Err(RpcError::ProcessTerminated)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_replies_buffered_before_exit_are_delivered() {
    init_logger();
    let mut harness = Harness::start(config());

    harness
        .child
        .request(None, Some(Duration::from_secs(30)), "last-words", None)
        .await
        .unwrap();

    harness.exit_with(0);
    harness
        .write_stdout(r#"{"jsonrpc":"2.0","id":1,"result":"bye"}"#)
        .await;
    assert_eq!(
        harness.next_event().await,
        SessionEvent::Result(Response {
            id: json!(1),
            result: json!("bye"),
        })
    );

    // stdout が閉じたら猶予を待たずに終了する
    drop(harness.stdout);
    let started = Instant::now();
    assert_eq!(
        next_exit(&mut harness.events).await,
        ExitReport {
            code: Some(0),
            signal: None,
        }
    );
    assert!(started.elapsed() < SessionConfig::default().exit_grace);
}

#[tokio::test(start_paused = true)]
async fn test_kill_and_dropping_handles() {
    init_logger();
    let mut harness = Harness::start(config());

    harness.child.kill(None).await.unwrap();
    assert_eq!(
        harness.next_event().await,
        SessionEvent::Exit(ExitReport {
            code: None,
            signal: Some(9),
        })
    );
    assert!(matches!(
        harness.child.kill(None).await,
        Err(RpcError::ProcessTerminated)
    ));

    let mut harness = Harness::start(config());
    assert!(matches!(
        harness.child.kill(Some(0)).await,
        Err(RpcError::InvalidArgument(_))
    ));
    harness.child.kill(Some(15)).await.unwrap();
    assert_eq!(
        harness.next_event().await,
        SessionEvent::Exit(ExitReport {
            code: None,
            signal: Some(15),
        })
    );

    let mut harness = Harness::start(config());
    harness
        .child
        .request(None, Some(Duration::from_secs(30)), "ping", None)
        .await
        .unwrap();
    let Harness { child, mut events, .. } = harness;
    drop(child);
    assert_eq!(
        next_exit(&mut events).await,
        ExitReport {
            code: None,
            signal: Some(9),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_ids_are_allocated_per_session() {
    init_logger();
    let first = Harness::start(config());
    let second = Harness::start(config());

    let a = first
        .child
        .notify(Duration::from_secs(1), "a", None)
        .await
        .unwrap();
    let b = first
        .child
        .notify(Duration::from_secs(1), "b", None)
        .await
        .unwrap();
    let c = second
        .child
        .notify(Duration::from_secs(1), "c", None)
        .await
        .unwrap();

    assert_eq!((a, b, c), (id(1), id(2), id(1)));
    assert_eq!(first.child.name(), "worker");
}

async fn next_exit(events: &mut rpcchild::SessionEvents) -> ExitReport {
    loop {
        if let SessionEvent::Exit(report) = common::next_event(events).await {
            return report;
        }
    }
}
