//! Command handler tests. These shell out to `sh`.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use workpool::engine::{CommandHandler, WorkHandler};
use workpool::model::{WorkId, WorkRecord};

fn record(reference_id: &str, payload: Value) -> WorkRecord<Value> {
    let now = Utc::now();
    WorkRecord {
        id: WorkId::new(),
        reference_id: reference_id.to_string(),
        acquired: true,
        next_time: now,
        acquiring_time: Some(now),
        payload,
        created_at: now,
        updated_at: now,
    }
}

fn script(body: &str) -> CommandHandler {
    CommandHandler::new("mail", "sh").args(["-c", body])
}

#[tokio::test]
async fn zero_exit_means_done() {
    let outcome = script("exit 0").handle(&record("job-1", json!({}))).await;
    assert!(outcome.done);
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn nonzero_exit_means_retry_with_error() {
    let outcome = script("echo nope >&2; exit 3")
        .handle(&record("job-1", json!({})))
        .await;
    assert!(!outcome.done);
    assert!(outcome.next_time.is_none());
    let error = outcome.error.unwrap();
    assert!(error.contains("status 3"), "got {error}");
    assert!(error.contains("nope"), "got {error}");
}

#[tokio::test]
async fn record_is_passed_through_the_environment() {
    let body = r#"test "$WORKPOOL_WORK_TYPE" = mail \
        && test "$WORKPOOL_REFERENCE_ID" = job-7 \
        && test "$WORKPOOL_PAYLOAD" = '{"to":"a@b"}'"#;
    let outcome = script(body)
        .handle(&record("job-7", json!({"to": "a@b"})))
        .await;
    assert!(outcome.done, "{:?}", outcome.error);
}

#[tokio::test]
async fn stdout_verdict_overrides_exit_status() {
    let outcome = script(r#"echo '{"done": false, "next_time": "2030-01-01T00:00:00Z"}'"#)
        .handle(&record("job-1", json!({})))
        .await;
    assert!(!outcome.done);
    let expected: DateTime<Utc> = "2030-01-01T00:00:00Z".parse().unwrap();
    assert_eq!(outcome.next_time, Some(expected));
}

#[tokio::test]
async fn missing_executable_is_a_retry() {
    let outcome = CommandHandler::new("mail", "/nonexistent/handler")
        .handle(&record("job-1", json!({})))
        .await;
    assert!(!outcome.done);
    assert!(outcome.error.unwrap().contains("cannot run"));
}
