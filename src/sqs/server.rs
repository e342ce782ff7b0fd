//! JSON-protocol front end (`X-Amz-Target: AmazonSQS.<Action>`).

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};

use super::error::SqsError;
use super::queue::{NewMessage, ReceivedMessage};
use super::state::{BatchEntry, BatchFailure, ReceiveOptions, SqsState};
use super::types::*;

macro_rules! dispatch {
    ($state:expr, $body:expr, $req_type:ty, $handler:ident) => {{
        let req: $req_type = serde_json::from_slice(&$body)
            .map_err(|e| SqsError::InvalidParameterValue(e.to_string()))?;
        let resp = $handler(&$state, req).await?;
        Ok(Json(resp).into_response())
    }};
}

macro_rules! dispatch_empty {
    ($state:expr, $body:expr, $req_type:ty, $handler:ident) => {{
        let req: $req_type = serde_json::from_slice(&$body)
            .map_err(|e| SqsError::InvalidParameterValue(e.to_string()))?;
        $handler(&$state, req).await?;
        Ok(Json(serde_json::json!({})).into_response())
    }};
}

/// Queue URLs end in the queue name.
fn resolve_queue_name(queue_url: &str) -> Result<&str, SqsError> {
    queue_url
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(SqsError::queue_does_not_exist)
}

fn non_negative(field: &str, value: Option<i32>) -> Result<Option<u32>, SqsError> {
    value
        .map(|v| {
            u32::try_from(v).map_err(|_| {
                SqsError::InvalidParameterValue(format!("{field} must not be negative"))
            })
        })
        .transpose()
}

fn failure_entry(failure: BatchFailure) -> BatchResultErrorEntry {
    BatchResultErrorEntry {
        id: failure.id,
        code: failure.error.error_code().to_string(),
        message: failure.error.to_string(),
        sender_fault: true,
    }
}

fn new_message(
    body: String,
    delay_seconds: Option<i32>,
    attributes: Option<HashMap<String, MessageAttributeValue>>,
    dedup_id: Option<String>,
    group_id: Option<String>,
) -> Result<NewMessage, SqsError> {
    Ok(NewMessage {
        body,
        message_attributes: attributes.unwrap_or_default(),
        message_group_id: group_id,
        dedup_id,
        delay_seconds: non_negative("DelaySeconds", delay_seconds)?,
    })
}

async fn create_queue(
    state: &SqsState,
    req: CreateQueueRequest,
) -> Result<CreateQueueResponse, SqsError> {
    let queue_url = state
        .create_queue(&req.queue_name, &req.attributes.unwrap_or_default())
        .await?;
    Ok(CreateQueueResponse { queue_url })
}

async fn delete_queue(state: &SqsState, req: QueueUrlRequest) -> Result<(), SqsError> {
    state.delete_queue(resolve_queue_name(&req.queue_url)?).await
}

async fn purge_queue(state: &SqsState, req: QueueUrlRequest) -> Result<(), SqsError> {
    state.purge_queue(resolve_queue_name(&req.queue_url)?).await
}

async fn get_queue_url(
    state: &SqsState,
    req: GetQueueUrlRequest,
) -> Result<GetQueueUrlResponse, SqsError> {
    let queue_url = state.get_queue_url(&req.queue_name).await?;
    Ok(GetQueueUrlResponse { queue_url })
}

async fn list_queues(
    state: &SqsState,
    req: ListQueuesRequest,
) -> Result<ListQueuesResponse, SqsError> {
    let queue_urls = state.list_queues(req.queue_name_prefix.as_deref()).await;
    Ok(ListQueuesResponse { queue_urls })
}

async fn get_queue_attributes(
    state: &SqsState,
    req: GetQueueAttributesRequest,
) -> Result<GetQueueAttributesResponse, SqsError> {
    let name = resolve_queue_name(&req.queue_url)?;
    let attributes = state
        .get_queue_attributes(name, &req.attribute_names.unwrap_or_default())
        .await?;
    Ok(GetQueueAttributesResponse { attributes })
}

async fn set_queue_attributes(
    state: &SqsState,
    req: SetQueueAttributesRequest,
) -> Result<(), SqsError> {
    let name = resolve_queue_name(&req.queue_url)?;
    state.set_queue_attributes(name, &req.attributes).await
}

async fn send_message(
    state: &SqsState,
    req: SendMessageRequest,
) -> Result<SendMessageResponse, SqsError> {
    let name = resolve_queue_name(&req.queue_url)?;
    let message = new_message(
        req.message_body,
        req.delay_seconds,
        req.message_attributes,
        req.message_deduplication_id,
        req.message_group_id,
    )?;
    let out = state.send_message(name, message).await?;
    Ok(SendMessageResponse {
        message_id: out.message_id,
        md5_of_message_body: out.md5_of_message_body,
        md5_of_message_attributes: out.md5_of_message_attributes,
        sequence_number: out.sequence_number,
    })
}

async fn send_message_batch(
    state: &SqsState,
    req: SendMessageBatchRequest,
) -> Result<SendMessageBatchResponse, SqsError> {
    let name = resolve_queue_name(&req.queue_url)?;
    let entries = req
        .entries
        .into_iter()
        .map(|e| {
            let message = new_message(
                e.message_body,
                e.delay_seconds,
                e.message_attributes,
                e.message_deduplication_id,
                e.message_group_id,
            );
            match message {
                Ok(message) => BatchEntry::new(e.id, message),
                Err(error) => BatchEntry::rejected(e.id, error),
            }
        })
        .collect();

    let outcome = state.send_message_batch(name, entries).await?;
    let successful = outcome
        .successful
        .into_iter()
        .map(|s| SendMessageBatchResultEntry {
            id: s.id,
            message_id: s.result.message_id,
            md5_of_message_body: s.result.md5_of_message_body,
            md5_of_message_attributes: s.result.md5_of_message_attributes,
            sequence_number: s.result.sequence_number,
        })
        .collect();
    let failed = outcome.failed.into_iter().map(failure_entry).collect();
    Ok(SendMessageBatchResponse { successful, failed })
}

async fn receive_message(
    state: &SqsState,
    req: ReceiveMessageRequest,
) -> Result<ReceiveMessageResponse, SqsError> {
    let name = resolve_queue_name(&req.queue_url)?;
    let options = ReceiveOptions {
        max_messages: non_negative("MaxNumberOfMessages", req.max_number_of_messages)?
            .map(|n| n as usize),
        visibility_timeout: non_negative("VisibilityTimeout", req.visibility_timeout)?,
        wait_time_seconds: non_negative("WaitTimeSeconds", req.wait_time_seconds)?,
    };
    let received = state.receive_message(name, options).await?;
    if received.is_empty() {
        return Ok(ReceiveMessageResponse { messages: None });
    }
    let messages = received
        .into_iter()
        .map(|m| to_result(m, &req.attribute_names, &req.message_attribute_names))
        .collect();
    Ok(ReceiveMessageResponse {
        messages: Some(messages),
    })
}

async fn delete_message(state: &SqsState, req: DeleteMessageRequest) -> Result<(), SqsError> {
    let name = resolve_queue_name(&req.queue_url)?;
    state.delete_message(name, &req.receipt_handle).await
}

async fn delete_message_batch(
    state: &SqsState,
    req: DeleteMessageBatchRequest,
) -> Result<IdBatchResponse, SqsError> {
    let name = resolve_queue_name(&req.queue_url)?;
    let entries = req
        .entries
        .into_iter()
        .map(|e| BatchEntry::new(e.id, e.receipt_handle))
        .collect();
    let outcome = state.delete_message_batch(name, entries).await?;
    Ok(IdBatchResponse {
        successful: outcome
            .successful
            .into_iter()
            .map(|s| IdBatchResultEntry { id: s.id })
            .collect(),
        failed: outcome.failed.into_iter().map(failure_entry).collect(),
    })
}

async fn change_message_visibility(
    state: &SqsState,
    req: ChangeMessageVisibilityRequest,
) -> Result<(), SqsError> {
    let name = resolve_queue_name(&req.queue_url)?;
    let timeout = non_negative("VisibilityTimeout", Some(req.visibility_timeout))?.unwrap_or(0);
    state
        .change_message_visibility(name, &req.receipt_handle, timeout)
        .await
}

async fn change_message_visibility_batch(
    state: &SqsState,
    req: ChangeMessageVisibilityBatchRequest,
) -> Result<IdBatchResponse, SqsError> {
    let name = resolve_queue_name(&req.queue_url)?;
    let entries = req
        .entries
        .into_iter()
        .map(
            |e| match non_negative("VisibilityTimeout", Some(e.visibility_timeout)) {
                Ok(timeout) => BatchEntry::new(e.id, (e.receipt_handle, timeout.unwrap_or(0))),
                Err(error) => BatchEntry::rejected(e.id, error),
            },
        )
        .collect();
    let outcome = state.change_message_visibility_batch(name, entries).await?;
    Ok(IdBatchResponse {
        successful: outcome
            .successful
            .into_iter()
            .map(|s| IdBatchResultEntry { id: s.id })
            .collect(),
        failed: outcome.failed.into_iter().map(failure_entry).collect(),
    })
}

async fn list_dead_letter_source_queues(
    state: &SqsState,
    req: QueueUrlRequest,
) -> Result<ListDeadLetterSourceQueuesResponse, SqsError> {
    let name = resolve_queue_name(&req.queue_url)?;
    let queue_urls = state.list_dead_letter_source_queues(name).await?;
    Ok(ListDeadLetterSourceQueuesResponse { queue_urls })
}

/// Keeps only the system and message attributes the caller asked for.
fn to_result(
    m: ReceivedMessage,
    attr_names: &Option<Vec<String>>,
    msg_attr_names: &Option<Vec<String>>,
) -> ReceiveMessageResult {
    let attributes = attr_names.as_ref().and_then(|names| {
        let all = names.iter().any(|n| n == "All");
        let filtered: HashMap<String, String> = m
            .attributes
            .iter()
            .filter(|(k, _)| all || names.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        (!filtered.is_empty()).then_some(filtered)
    });

    let message_attributes = msg_attr_names.as_ref().and_then(|names| {
        let filtered: HashMap<String, MessageAttributeValue> = m
            .message_attributes
            .iter()
            .filter(|(k, _)| {
                names.iter().any(|n| {
                    n == "All"
                        || n == ".*"
                        || n == *k
                        || n.strip_suffix(".*").is_some_and(|prefix| k.starts_with(prefix))
                })
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        (!filtered.is_empty()).then_some(filtered)
    });

    ReceiveMessageResult {
        message_id: m.message_id,
        receipt_handle: m.receipt_handle,
        body: m.body,
        md5_of_body: m.md5_of_body,
        md5_of_message_attributes: m.md5_of_message_attributes,
        attributes,
        message_attributes,
    }
}

async fn handle_request(
    State(state): State<Arc<SqsState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, SqsError> {
    let target = headers
        .get("x-amz-target")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| SqsError::InvalidAction("Missing X-Amz-Target header".into()))?;

    let action = target
        .strip_prefix("AmazonSQS.")
        .ok_or_else(|| SqsError::InvalidAction(format!("Invalid target: {target}")))?;

    match action {
        "CreateQueue" => dispatch!(state, body, CreateQueueRequest, create_queue),
        "DeleteQueue" => dispatch_empty!(state, body, QueueUrlRequest, delete_queue),
        "GetQueueUrl" => dispatch!(state, body, GetQueueUrlRequest, get_queue_url),
        "ListQueues" => dispatch!(state, body, ListQueuesRequest, list_queues),
        "GetQueueAttributes" => {
            dispatch!(state, body, GetQueueAttributesRequest, get_queue_attributes)
        }
        "SetQueueAttributes" => {
            dispatch_empty!(state, body, SetQueueAttributesRequest, set_queue_attributes)
        }
        "PurgeQueue" => dispatch_empty!(state, body, QueueUrlRequest, purge_queue),
        "SendMessage" => dispatch!(state, body, SendMessageRequest, send_message),
        "SendMessageBatch" => {
            dispatch!(state, body, SendMessageBatchRequest, send_message_batch)
        }
        "ReceiveMessage" => {
            dispatch!(state, body, ReceiveMessageRequest, receive_message)
        }
        "DeleteMessage" => {
            dispatch_empty!(state, body, DeleteMessageRequest, delete_message)
        }
        "DeleteMessageBatch" => {
            dispatch!(state, body, DeleteMessageBatchRequest, delete_message_batch)
        }
        "ChangeMessageVisibility" => {
            dispatch_empty!(
                state,
                body,
                ChangeMessageVisibilityRequest,
                change_message_visibility
            )
        }
        "ChangeMessageVisibilityBatch" => {
            dispatch!(
                state,
                body,
                ChangeMessageVisibilityBatchRequest,
                change_message_visibility_batch
            )
        }
        "ListDeadLetterSourceQueues" => {
            dispatch!(state, body, QueueUrlRequest, list_dead_letter_source_queues)
        }
        _ => Err(SqsError::InvalidAction(format!("Unknown action: {action}"))),
    }
}

pub fn create_router(state: Arc<SqsState>) -> Router {
    Router::new()
        .route("/", post(handle_request))
        .with_state(state)
}
