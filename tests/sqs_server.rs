use std::sync::Arc;

use aws_sqs_local::sqs::server::create_router;
use aws_sqs_local::sqs::types::{
    CreateQueueResponse, IdBatchResponse, ReceiveMessageResponse, SendMessageBatchResponse,
    SendMessageResponse,
};
use aws_sqs_local::sqs::{EngineConfig, SqsState};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> Router {
    create_router(Arc::new(SqsState::new(EngineConfig::default())))
}

async fn call(app: &Router, action: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/x-amz-json-1.0")
        .header("x-amz-target", format!("AmazonSQS.{action}"))
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn create(app: &Router, name: &str, attributes: Value) -> String {
    let (status, body) = call(
        app,
        "CreateQueue",
        json!({"QueueName": name, "Attributes": attributes}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let created: CreateQueueResponse = serde_json::from_value(body).unwrap();
    created.queue_url
}

#[tokio::test]
async fn send_receive_delete_over_json_protocol() {
    let app = app();
    let url = create(&app, "orders", json!({})).await;
    assert!(url.ends_with("/000000000000/orders"));

    let (status, body) = call(
        &app,
        "SendMessage",
        json!({
            "QueueUrl": url,
            "MessageBody": "hello",
            "MessageAttributes": {"kind": {"DataType": "String", "StringValue": "greeting"}},
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let sent: SendMessageResponse = serde_json::from_value(body).unwrap();
    assert_eq!(sent.md5_of_message_body, "5d41402abc4b2a76b9719d911017c592");
    assert!(sent.md5_of_message_attributes.is_some());

    let (_, body) = call(
        &app,
        "ReceiveMessage",
        json!({
            "QueueUrl": url,
            "AttributeNames": ["All"],
            "MessageAttributeNames": ["kind"],
        }),
    )
    .await;
    let received: ReceiveMessageResponse = serde_json::from_value(body).unwrap();
    let messages = received.messages.unwrap();
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.message_id, sent.message_id);
    assert_eq!(message.body, "hello");
    let attributes = message.attributes.as_ref().unwrap();
    assert_eq!(attributes["ApproximateReceiveCount"], "1");
    let message_attributes = message.message_attributes.as_ref().unwrap();
    assert_eq!(
        message_attributes["kind"].string_value.as_deref(),
        Some("greeting")
    );

    let (status, _) = call(
        &app,
        "DeleteMessage",
        json!({"QueueUrl": url, "ReceiptHandle": message.receipt_handle}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&app, "ReceiveMessage", json!({"QueueUrl": url})).await;
    let received: ReceiveMessageResponse = serde_json::from_value(body).unwrap();
    assert!(received.messages.is_none());
}

#[tokio::test]
async fn receive_omits_attributes_unless_requested() {
    let app = app();
    let url = create(&app, "plain", json!({})).await;
    call(
        &app,
        "SendMessage",
        json!({
            "QueueUrl": url,
            "MessageBody": "x",
            "MessageAttributes": {"trace.id": {"DataType": "String", "StringValue": "1"}},
        }),
    )
    .await;

    let (_, body) = call(&app, "ReceiveMessage", json!({"QueueUrl": url, "VisibilityTimeout": 0})).await;
    let received: ReceiveMessageResponse = serde_json::from_value(body).unwrap();
    let message = &received.messages.unwrap()[0];
    assert!(message.attributes.is_none());
    assert!(message.message_attributes.is_none());

    let (_, body) = call(
        &app,
        "ReceiveMessage",
        json!({"QueueUrl": url, "MessageAttributeNames": ["trace.*"]}),
    )
    .await;
    let received: ReceiveMessageResponse = serde_json::from_value(body).unwrap();
    let message = &received.messages.unwrap()[0];
    assert!(message.message_attributes.as_ref().unwrap().contains_key("trace.id"));
}

#[tokio::test]
async fn missing_queue_maps_to_non_existent_queue_error() {
    let app = app();
    let (status, body) = call(
        &app,
        "SendMessageBatch",
        json!({
            "QueueUrl": "http://localhost:9324/000000000000/missing",
            "Entries": [{"Id": "a", "MessageBody": "x"}],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["__type"], "AWS.SimpleQueueService.NonExistentQueue");

    let (_, body) = call(&app, "ListQueues", json!({})).await;
    assert_eq!(body["QueueUrls"], json!([]));
}

#[tokio::test]
async fn batch_send_splits_successes_and_failures() {
    let app = app();
    let url = create(&app, "jobs.fifo", json!({"FifoQueue": "true"})).await;
    let (status, body) = call(
        &app,
        "SendMessageBatch",
        json!({
            "QueueUrl": url,
            "Entries": [
                {"Id": "ok", "MessageBody": "a", "MessageGroupId": "g"},
                {"Id": "nogroup", "MessageBody": "b"},
                {"Id": "negative", "MessageBody": "c", "MessageGroupId": "g", "DelaySeconds": -1},
            ],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let batch: SendMessageBatchResponse = serde_json::from_value(body).unwrap();
    assert_eq!(batch.successful.len(), 1);
    assert_eq!(batch.successful[0].id, "ok");
    assert!(batch.successful[0].sequence_number.is_some());

    let mut failed: Vec<(&str, &str)> = batch
        .failed
        .iter()
        .map(|f| (f.id.as_str(), f.code.as_str()))
        .collect();
    failed.sort();
    assert_eq!(
        failed,
        vec![("negative", "InvalidParameterValue"), ("nogroup", "MissingParameter")]
    );
}

#[tokio::test]
async fn oversized_batch_is_rejected_whole() {
    let app = app();
    let url = create(&app, "bulk", json!({})).await;
    let entries: Vec<Value> = (0..11)
        .map(|i| json!({"Id": format!("e{i}"), "MessageBody": "x"}))
        .collect();
    let (status, body) = call(
        &app,
        "SendMessageBatch",
        json!({"QueueUrl": url, "Entries": entries}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["__type"],
        "AWS.SimpleQueueService.TooManyEntriesInBatchRequest"
    );
}

#[tokio::test]
async fn delete_batch_reports_bad_handles() {
    let app = app();
    let url = create(&app, "q", json!({})).await;
    call(&app, "SendMessage", json!({"QueueUrl": url, "MessageBody": "x"})).await;
    let (_, body) = call(&app, "ReceiveMessage", json!({"QueueUrl": url})).await;
    let received: ReceiveMessageResponse = serde_json::from_value(body).unwrap();
    let handle = received.messages.unwrap()[0].receipt_handle.clone();

    let (status, body) = call(
        &app,
        "DeleteMessageBatch",
        json!({
            "QueueUrl": url,
            "Entries": [
                {"Id": "good", "ReceiptHandle": handle},
                {"Id": "bad", "ReceiptHandle": "not-a-handle"},
            ],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let result: IdBatchResponse = serde_json::from_value(body).unwrap();
    assert_eq!(result.successful.len(), 1);
    assert_eq!(result.successful[0].id, "good");
    assert_eq!(result.failed[0].id, "bad");
    assert_eq!(result.failed[0].code, "ReceiptHandleIsInvalid");
}

#[tokio::test]
async fn queue_admin_actions() {
    let app = app();
    let dlq = create(&app, "dead", json!({})).await;
    let src = create(
        &app,
        "source",
        json!({
            "RedrivePolicy": r#"{"deadLetterTargetArn":"arn:aws:sqs:us-east-1:000000000000:dead","maxReceiveCount":"5"}"#,
            "VisibilityTimeout": "10",
        }),
    )
    .await;

    let (_, body) = call(&app, "GetQueueUrl", json!({"QueueName": "source"})).await;
    assert_eq!(body["QueueUrl"], src);

    let (_, body) = call(
        &app,
        "GetQueueAttributes",
        json!({"QueueUrl": src, "AttributeNames": ["VisibilityTimeout", "QueueArn"]}),
    )
    .await;
    assert_eq!(body["Attributes"]["VisibilityTimeout"], "10");
    assert_eq!(
        body["Attributes"]["QueueArn"],
        "arn:aws:sqs:us-east-1:000000000000:source"
    );
    assert!(body["Attributes"].get("DelaySeconds").is_none());

    let (status, _) = call(
        &app,
        "SetQueueAttributes",
        json!({"QueueUrl": src, "Attributes": {"DelaySeconds": "5"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&app, "ListDeadLetterSourceQueues", json!({"QueueUrl": dlq})).await;
    assert_eq!(body["queueUrls"], json!([src.clone()]));

    let (status, _) = call(&app, "PurgeQueue", json!({"QueueUrl": src})).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&app, "PurgeQueue", json!({"QueueUrl": src})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["__type"], "AWS.SimpleQueueService.PurgeQueueInProgress");

    let (status, _) = call(&app, "DeleteQueue", json!({"QueueUrl": src})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = call(&app, "ListQueues", json!({})).await;
    assert_eq!(body["QueueUrls"], json!([dlq]));
}

#[tokio::test]
async fn unknown_action_is_rejected() {
    let app = app();
    let (status, body) = call(&app, "TagQueue", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["__type"], "InvalidAction");
}

#[tokio::test]
async fn undecodable_entries_still_count_toward_batch_limit() {
    let app = app();
    let url = create(&app, "bulk", json!({})).await;
    let mut entries: Vec<Value> = (0..10)
        .map(|i| json!({"Id": format!("e{i}"), "MessageBody": "x"}))
        .collect();
    entries.push(json!({"Id": "e10", "MessageBody": "x", "DelaySeconds": -1}));

    let (status, body) = call(
        &app,
        "SendMessageBatch",
        json!({"QueueUrl": url, "Entries": entries}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["__type"],
        "AWS.SimpleQueueService.TooManyEntriesInBatchRequest"
    );

    let (_, body) = call(
        &app,
        "GetQueueAttributes",
        json!({"QueueUrl": url, "AttributeNames": ["ApproximateNumberOfMessages"]}),
    )
    .await;
    assert_eq!(body["Attributes"]["ApproximateNumberOfMessages"], "0");
}

#[tokio::test]
async fn undecodable_entry_with_repeated_id_fails_whole_batch() {
    let app = app();
    let url = create(&app, "dups", json!({})).await;
    let (status, body) = call(
        &app,
        "SendMessageBatch",
        json!({
            "QueueUrl": url,
            "Entries": [
                {"Id": "a", "MessageBody": "x"},
                {"Id": "a", "MessageBody": "y", "DelaySeconds": -1},
            ],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["__type"], "AWS.SimpleQueueService.BatchEntryIdsNotDistinct");

    let (status, body) = call(
        &app,
        "ChangeMessageVisibilityBatch",
        json!({
            "QueueUrl": url,
            "Entries": [
                {"Id": "a", "ReceiptHandle": "h", "VisibilityTimeout": 5},
                {"Id": "a", "ReceiptHandle": "h", "VisibilityTimeout": -5},
            ],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["__type"], "AWS.SimpleQueueService.BatchEntryIdsNotDistinct");
}

#[tokio::test]
async fn lone_undecodable_entry_is_reported_per_entry() {
    let app = app();
    let url = create(&app, "single", json!({})).await;
    let (status, body) = call(
        &app,
        "SendMessageBatch",
        json!({
            "QueueUrl": url,
            "Entries": [{"Id": "only", "MessageBody": "x", "DelaySeconds": -1}],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let batch: SendMessageBatchResponse = serde_json::from_value(body).unwrap();
    assert!(batch.successful.is_empty());
    assert_eq!(batch.failed.len(), 1);
    assert_eq!(batch.failed[0].id, "only");
    assert_eq!(batch.failed[0].code, "InvalidParameterValue");
}
