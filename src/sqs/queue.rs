use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error};
use uuid::Uuid;

use super::error::SqsError;
use super::message::{compute_md5_of_attributes, md5_hex, sha256_hex, Message, MessageAttributeValue};
use super::receipt::ReceiptHandle;

pub const MAX_VISIBILITY_TIMEOUT: u32 = 43_200;
pub const MAX_DELAY_SECONDS: u32 = 900;
const PURGE_COOLDOWN: Duration = Duration::from_secs(60);

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrivePolicy {
    pub dead_letter_target_arn: String,
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    pub fn from_json(s: &str) -> Result<Self, SqsError> {
        let v: serde_json::Value = serde_json::from_str(s)
            .map_err(|e| SqsError::InvalidAttributeValue(format!("Invalid RedrivePolicy JSON: {e}")))?;
        let arn = v
            .get("deadLetterTargetArn")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                SqsError::InvalidAttributeValue(
                    "RedrivePolicy must contain deadLetterTargetArn".into(),
                )
            })?
            .to_string();
        let max_count = v
            .get("maxReceiveCount")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| {
                SqsError::InvalidAttributeValue(
                    "RedrivePolicy must contain maxReceiveCount".into(),
                )
            })?;
        if !(1..=1000).contains(&max_count) {
            return Err(SqsError::InvalidAttributeValue(
                "maxReceiveCount must be between 1 and 1000".into(),
            ));
        }
        Ok(RedrivePolicy {
            dead_letter_target_arn: arn,
            max_receive_count: max_count as u32,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "deadLetterTargetArn": self.dead_letter_target_arn,
            "maxReceiveCount": self.max_receive_count,
        })
        .to_string()
    }

    /// The target queue name is the last segment of the ARN.
    pub fn dead_letter_queue_name(&self) -> &str {
        self.dead_letter_target_arn
            .rsplit(':')
            .next()
            .unwrap_or(&self.dead_letter_target_arn)
    }
}

#[derive(Debug, Clone)]
pub struct QueueAttributes {
    pub visibility_timeout: u32,
    pub message_retention_period: u32,
    pub delay_seconds: u32,
    pub maximum_message_size: u32,
    pub receive_message_wait_time_seconds: u32,
    pub redrive_policy: Option<RedrivePolicy>,
    pub fifo_queue: bool,
    pub content_based_deduplication: bool,
    /// Drop sends whose deduplication id was already seen inside the window.
    pub deduplication_enabled: bool,
}

impl Default for QueueAttributes {
    fn default() -> Self {
        QueueAttributes {
            visibility_timeout: 30,
            message_retention_period: 345600,
            delay_seconds: 0,
            maximum_message_size: 262144,
            receive_message_wait_time_seconds: 0,
            redrive_policy: None,
            fifo_queue: false,
            content_based_deduplication: false,
            deduplication_enabled: false,
        }
    }
}

fn parse_bounded(key: &str, value: &str, min: u32, max: u32) -> Result<u32, SqsError> {
    let v: u32 = value
        .parse()
        .map_err(|_| SqsError::InvalidAttributeValue(format!("Invalid {key}: {value}")))?;
    if !(min..=max).contains(&v) {
        return Err(SqsError::InvalidAttributeValue(format!(
            "{key} must be between {min} and {max}"
        )));
    }
    Ok(v)
}

pub(crate) fn parse_flag(key: &str, value: &str) -> Result<bool, SqsError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(SqsError::InvalidAttributeValue(format!(
            "{key} must be true or false"
        ))),
    }
}

impl QueueAttributes {
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("VisibilityTimeout".into(), self.visibility_timeout.to_string());
        m.insert("MessageRetentionPeriod".into(), self.message_retention_period.to_string());
        m.insert("DelaySeconds".into(), self.delay_seconds.to_string());
        m.insert("MaximumMessageSize".into(), self.maximum_message_size.to_string());
        m.insert(
            "ReceiveMessageWaitTimeSeconds".into(),
            self.receive_message_wait_time_seconds.to_string(),
        );
        if let Some(ref rp) = self.redrive_policy {
            m.insert("RedrivePolicy".into(), rp.to_json());
        }
        m.insert("FifoQueue".into(), self.fifo_queue.to_string());
        m.insert(
            "ContentBasedDeduplication".into(),
            self.content_based_deduplication.to_string(),
        );
        m.insert("DeduplicationEnabled".into(), self.deduplication_enabled.to_string());
        m
    }

    pub fn apply(&mut self, attrs: &HashMap<String, String>) -> Result<(), SqsError> {
        for (key, value) in attrs {
            match key.as_str() {
                "VisibilityTimeout" => {
                    self.visibility_timeout = parse_bounded(key, value, 0, MAX_VISIBILITY_TIMEOUT)?;
                }
                "MessageRetentionPeriod" => {
                    self.message_retention_period = parse_bounded(key, value, 60, 1_209_600)?;
                }
                "DelaySeconds" => {
                    self.delay_seconds = parse_bounded(key, value, 0, MAX_DELAY_SECONDS)?;
                }
                "MaximumMessageSize" => {
                    self.maximum_message_size = parse_bounded(key, value, 1024, 262_144)?;
                }
                "ReceiveMessageWaitTimeSeconds" => {
                    self.receive_message_wait_time_seconds = parse_bounded(key, value, 0, 20)?;
                }
                "RedrivePolicy" => {
                    self.redrive_policy = if value.is_empty() {
                        None
                    } else {
                        Some(RedrivePolicy::from_json(value)?)
                    };
                }
                "FifoQueue" => {
                    self.fifo_queue = parse_flag(key, value)?;
                }
                "ContentBasedDeduplication" => {
                    self.content_based_deduplication = parse_flag(key, value)?;
                }
                "DeduplicationEnabled" => {
                    self.deduplication_enabled = parse_flag(key, value)?;
                }
                _ => {
                    return Err(SqsError::InvalidAttributeName(format!(
                        "Unknown attribute: {key}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Content-based deduplication implies enforcement.
    pub fn deduplication_enforced(&self) -> bool {
        self.deduplication_enabled || self.content_based_deduplication
    }
}

/// A message as submitted by a producer.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub body: String,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
    pub message_group_id: Option<String>,
    pub dedup_id: Option<String>,
    pub delay_seconds: Option<u32>,
}

impl NewMessage {
    pub fn new(body: impl Into<String>) -> Self {
        NewMessage {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.message_group_id = Some(group_id.into());
        self
    }

    pub fn dedup_id(mut self, dedup_id: impl Into<String>) -> Self {
        self.dedup_id = Some(dedup_id.into());
        self
    }

    pub fn delay(mut self, seconds: u32) -> Self {
        self.delay_seconds = Some(seconds);
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: MessageAttributeValue) -> Self {
        self.message_attributes.insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub message_id: String,
    pub md5_of_message_body: String,
    pub md5_of_message_attributes: Option<String>,
    pub sequence_number: Option<String>,
    /// The send matched a recent deduplication id and nothing was stored.
    pub duplicate: bool,
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub md5_of_body: String,
    pub md5_of_message_attributes: Option<String>,
    pub attributes: HashMap<String, String>,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
}

impl ReceivedMessage {
    fn from_delivery(msg: &Message, receipt_handle: String) -> Self {
        ReceivedMessage {
            message_id: msg.message_id.clone(),
            receipt_handle,
            body: msg.body.clone(),
            md5_of_body: msg.md5_of_body.clone(),
            md5_of_message_attributes: msg.md5_of_message_attributes.clone(),
            attributes: msg.system_attributes(),
            message_attributes: msg.message_attributes.clone(),
        }
    }
}

/// A message removed from its queue that must be appended to a dead-letter
/// queue by whoever holds the registry.
#[derive(Debug)]
pub struct DlqRedrive {
    pub message: Message,
    pub dlq_name: String,
}

pub struct Queue {
    pub name: String,
    pub arn: String,
    pub url: String,
    pub attributes: QueueAttributes,
    pub created_at: i64,
    pub last_modified: i64,
    messages: VecDeque<Message>,
    /// group id -> id of the one in-flight message of that group
    group_locks: HashMap<String, String>,
    dedup_cache: HashMap<String, (String, Instant)>,
    dedup_window: Duration,
    sequence_counter: u64,
    last_purge: Option<Instant>,
}

impl Queue {
    pub fn new(
        name: String,
        arn: String,
        url: String,
        attributes: QueueAttributes,
        dedup_window: Duration,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Queue {
            name,
            arn,
            url,
            attributes,
            created_at: now,
            last_modified: now,
            messages: VecDeque::new(),
            group_locks: HashMap::new(),
            dedup_cache: HashMap::new(),
            dedup_window,
            sequence_counter: 0,
            last_purge: None,
        }
    }

    pub fn is_fifo(&self) -> bool {
        self.attributes.fifo_queue
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Id of the in-flight message currently holding `group_id`.
    pub fn group_lock(&self, group_id: &str) -> Option<&str> {
        self.group_locks.get(group_id).map(String::as_str)
    }

    pub fn locked_group_count(&self) -> usize {
        self.group_locks.len()
    }

    pub fn send_message(&mut self, new: NewMessage) -> Result<SendOutcome, SqsError> {
        if new.body.is_empty() {
            return Err(SqsError::InvalidMessageContents(
                "Message body must not be empty".into(),
            ));
        }
        if new.body.len() > self.attributes.maximum_message_size as usize {
            return Err(SqsError::InvalidMessageContents(format!(
                "Message body must be shorter than {} bytes",
                self.attributes.maximum_message_size
            )));
        }
        let delay = new.delay_seconds.unwrap_or(self.attributes.delay_seconds);
        if delay > MAX_DELAY_SECONDS {
            return Err(SqsError::InvalidParameterValue(format!(
                "DelaySeconds must be between 0 and {MAX_DELAY_SECONDS}"
            )));
        }

        let group_id = if self.is_fifo() {
            match new.message_group_id {
                Some(gid) if !gid.is_empty() => Some(gid),
                _ => {
                    return Err(SqsError::MissingParameter(
                        "The request must contain the parameter MessageGroupId.".into(),
                    ))
                }
            }
        } else {
            None
        };

        let md5_of_body = md5_hex(new.body.as_bytes());
        let md5_of_msg_attrs = compute_md5_of_attributes(&new.message_attributes);
        let dedup_id = new.dedup_id.or_else(|| {
            self.attributes
                .content_based_deduplication
                .then(|| sha256_hex(new.body.as_bytes()))
        });

        let now = Instant::now();
        self.clean_dedup_cache(now);
        if self.attributes.deduplication_enforced() {
            if let Some((prev_id, _)) = dedup_id.as_ref().and_then(|did| self.dedup_cache.get(did)) {
                debug!(queue = %self.name, message_id = %prev_id, "Dropped duplicate send");
                return Ok(SendOutcome {
                    message_id: prev_id.clone(),
                    md5_of_message_body: md5_of_body,
                    md5_of_message_attributes: md5_of_msg_attrs,
                    sequence_number: None,
                    duplicate: true,
                });
            }
        }

        let sequence_number = self.is_fifo().then(|| {
            self.sequence_counter += 1;
            format!("{:020}", self.sequence_counter)
        });
        let message_id = Uuid::new_v4().to_string();

        if let Some(ref did) = dedup_id {
            self.dedup_cache.insert(did.clone(), (message_id.clone(), now));
        }

        self.messages.push_back(Message {
            message_id: message_id.clone(),
            body: new.body,
            md5_of_body: md5_of_body.clone(),
            message_attributes: new.message_attributes,
            md5_of_message_attributes: md5_of_msg_attrs.clone(),
            sent_timestamp: now_millis(),
            first_receive_timestamp: None,
            visible_at: now + Duration::from_secs(u64::from(delay)),
            invisible_until: None,
            receive_count: 0,
            receipt_handle: None,
            message_group_id: group_id,
            dedup_id,
            sequence_number: sequence_number.clone(),
        });
        debug!(queue = %self.name, message_id = %message_id, delay, "Sent message");

        Ok(SendOutcome {
            message_id,
            md5_of_message_body: md5_of_body,
            md5_of_message_attributes: md5_of_msg_attrs,
            sequence_number,
            duplicate: false,
        })
    }

    /// Returns expired deliveries to circulation, or removes them for
    /// redrive when they have used up their receives.
    pub fn return_expired_inflight(&mut self) -> Vec<DlqRedrive> {
        let now = Instant::now();
        let mut redrives = Vec::new();
        let mut i = 0;
        while i < self.messages.len() {
            if !self.messages[i].is_expired(now) {
                i += 1;
                continue;
            }
            self.unlock_group_of(i);
            let count = self.messages[i].receive_count;
            if let Some(dlq_name) = self.redrive_target(count, |count, max| count >= max) {
                if let Some(msg) = self.messages.remove(i) {
                    redrives.push(DlqRedrive {
                        message: msg.into_dead_letter(now),
                        dlq_name,
                    });
                }
                continue;
            }
            let msg = &mut self.messages[i];
            msg.release();
            debug!(queue = %self.name, message_id = %msg.message_id, "Visibility timeout expired");
            i += 1;
        }
        self.repair_group_locks(now);
        redrives
    }

    /// Drops messages older than the retention period. In-flight messages are
    /// left for their receiver.
    pub fn drop_retention_expired(&mut self) -> usize {
        let now = Instant::now();
        let cutoff = now_millis() - i64::from(self.attributes.message_retention_period) * 1000;
        let before = self.messages.len();
        self.messages
            .retain(|m| m.sent_timestamp >= cutoff || m.is_in_flight(now));
        before - self.messages.len()
    }

    pub fn receive_messages(
        &mut self,
        max_count: usize,
        visibility_timeout: Option<u32>,
    ) -> Result<(Vec<ReceivedMessage>, Vec<DlqRedrive>), SqsError> {
        let vis_timeout = visibility_timeout.unwrap_or(self.attributes.visibility_timeout);
        if vis_timeout > MAX_VISIBILITY_TIMEOUT {
            return Err(SqsError::InvalidParameterValue(format!(
                "VisibilityTimeout must be between 0 and {MAX_VISIBILITY_TIMEOUT}"
            )));
        }

        let mut redrives = self.return_expired_inflight();
        let now = Instant::now();
        let now_ms = now_millis();
        let fifo = self.is_fifo();
        let mut results = Vec::new();
        // Groups whose head has already been looked at in this pass; later
        // messages of those groups must wait.
        let mut seen_groups: HashSet<String> = HashSet::new();

        let mut i = 0;
        while i < self.messages.len() && results.len() < max_count {
            let msg = &self.messages[i];
            if fifo {
                if let Some(ref gid) = msg.message_group_id {
                    if self.group_locks.contains_key(gid) || !seen_groups.insert(gid.clone()) {
                        i += 1;
                        continue;
                    }
                }
            }
            if !msg.is_visible(now) {
                i += 1;
                continue;
            }

            let count = msg.receive_count + 1;
            if let Some(dlq_name) = self.redrive_target(count, |count, max| count > max) {
                if let Some(mut msg) = self.messages.remove(i) {
                    msg.receive_count = count;
                    if let Some(ref gid) = msg.message_group_id {
                        seen_groups.remove(gid);
                    }
                    redrives.push(DlqRedrive {
                        message: msg.into_dead_letter(now),
                        dlq_name,
                    });
                }
                continue;
            }

            let queue_name = self.name.clone();
            let msg = &mut self.messages[i];
            msg.receive_count = count;
            msg.first_receive_timestamp.get_or_insert(now_ms);
            let handle = ReceiptHandle::issue(&queue_name, &msg.message_id);
            msg.receipt_handle = Some(handle.clone());
            if vis_timeout > 0 {
                msg.invisible_until = Some(now + Duration::from_secs(u64::from(vis_timeout)));
                if let Some(ref gid) = msg.message_group_id {
                    self.group_locks.insert(gid.clone(), msg.message_id.clone());
                }
            } else {
                msg.invisible_until = None;
            }
            debug!(
                queue = %queue_name,
                message_id = %msg.message_id,
                receive_count = msg.receive_count,
                "Delivered message"
            );
            results.push(ReceivedMessage::from_delivery(msg, handle.to_string()));
            i += 1;
        }

        Ok((results, redrives))
    }

    /// Removes the message currently delivered under `handle`. Returns false
    /// when the handle no longer refers to a live delivery.
    pub fn delete_message(&mut self, handle: &ReceiptHandle) -> bool {
        let Some(idx) = self.messages.iter().position(|m| m.holds_handle(handle)) else {
            debug!(queue = %self.name, message_id = %handle.message_id(), "Ignored stale receipt handle");
            return false;
        };
        self.unlock_group_of(idx);
        if let Some(msg) = self.messages.remove(idx) {
            debug!(queue = %self.name, message_id = %msg.message_id, "Deleted message");
        }
        true
    }

    pub fn change_message_visibility(
        &mut self,
        handle: &ReceiptHandle,
        timeout: u32,
    ) -> Result<(), SqsError> {
        if timeout > MAX_VISIBILITY_TIMEOUT {
            return Err(SqsError::InvalidParameterValue(format!(
                "VisibilityTimeout must be between 0 and {MAX_VISIBILITY_TIMEOUT}"
            )));
        }
        let now = Instant::now();
        let idx = self
            .messages
            .iter()
            .position(|m| m.holds_handle(handle) && m.is_in_flight(now))
            .ok_or_else(|| {
                SqsError::MessageNotInflight(format!(
                    "Message {} is not in flight",
                    handle.message_id()
                ))
            })?;

        if timeout == 0 {
            self.unlock_group_of(idx);
            self.messages[idx].invisible_until = None;
        } else {
            self.messages[idx].invisible_until =
                Some(now + Duration::from_secs(u64::from(timeout)));
        }
        debug!(queue = %self.name, message_id = %handle.message_id(), timeout, "Changed message visibility");
        Ok(())
    }

    /// Appends a message redriven from another queue.
    pub fn push_dead_letter(&mut self, message: Message) {
        self.messages.push_back(message);
    }

    /// Puts back a message whose dead-letter queue could not take it, ahead
    /// of anything sent after it.
    pub fn restore(&mut self, message: Message) {
        let key = (message.sent_timestamp, message.sequence_number.clone());
        let idx = self
            .messages
            .iter()
            .position(|m| (m.sent_timestamp, m.sequence_number.clone()) > key)
            .unwrap_or(self.messages.len());
        self.messages.insert(idx, message);
    }

    pub fn purge(&mut self) -> Result<(), SqsError> {
        if let Some(last) = self.last_purge {
            if last.elapsed() < PURGE_COOLDOWN {
                return Err(SqsError::PurgeQueueInProgress(format!(
                    "Only one PurgeQueue operation on {} is allowed every 60 seconds.",
                    self.name
                )));
            }
        }
        self.messages.clear();
        self.group_locks.clear();
        self.last_purge = Some(Instant::now());
        Ok(())
    }

    pub fn get_attributes(&self, names: &[String]) -> HashMap<String, String> {
        let all = names.is_empty() || names.iter().any(|n| n == "All");
        let include = |attr_name: &str| all || names.iter().any(|n| n == attr_name);

        let mut result: HashMap<String, String> = self
            .attributes
            .to_map()
            .into_iter()
            .filter(|(k, _)| include(k))
            .collect();

        let now = Instant::now();
        if include("QueueArn") {
            result.insert("QueueArn".into(), self.arn.clone());
        }
        if include("CreatedTimestamp") {
            result.insert("CreatedTimestamp".into(), self.created_at.to_string());
        }
        if include("LastModifiedTimestamp") {
            result.insert("LastModifiedTimestamp".into(), self.last_modified.to_string());
        }
        if include("ApproximateNumberOfMessages") {
            let visible = self.messages.iter().filter(|m| m.is_visible(now)).count();
            result.insert("ApproximateNumberOfMessages".into(), visible.to_string());
        }
        if include("ApproximateNumberOfMessagesNotVisible") {
            let inflight = self.messages.iter().filter(|m| m.is_in_flight(now)).count();
            result.insert(
                "ApproximateNumberOfMessagesNotVisible".into(),
                inflight.to_string(),
            );
        }
        if include("ApproximateNumberOfMessagesDelayed") {
            let delayed = self.messages.iter().filter(|m| m.visible_at > now).count();
            result.insert("ApproximateNumberOfMessagesDelayed".into(), delayed.to_string());
        }

        result
    }

    pub fn set_attributes(&mut self, attrs: &HashMap<String, String>) -> Result<(), SqsError> {
        if attrs.contains_key("FifoQueue") {
            return Err(SqsError::InvalidAttributeName(
                "FifoQueue cannot be changed after creation".into(),
            ));
        }
        // Validate against a copy so a bad entry leaves the queue untouched.
        let mut updated = self.attributes.clone();
        updated.apply(attrs)?;
        self.attributes = updated;
        self.last_modified = chrono::Utc::now().timestamp();
        Ok(())
    }

    /// Dead-letter queue name if a message at `count` receives is past the
    /// redrive threshold under `exceeds`.
    fn redrive_target(&self, count: u32, exceeds: impl Fn(u32, u32) -> bool) -> Option<String> {
        self.attributes
            .redrive_policy
            .as_ref()
            .filter(|rp| exceeds(count, rp.max_receive_count))
            .map(|rp| rp.dead_letter_queue_name().to_string())
    }

    fn unlock_group_of(&mut self, idx: usize) {
        let msg = &self.messages[idx];
        if let Some(ref gid) = msg.message_group_id {
            if self.group_locks.get(gid) == Some(&msg.message_id) {
                self.group_locks.remove(gid);
            }
        }
    }

    /// A lock must name a message that is still here and in flight. Anything
    /// else is a bookkeeping bug; drop the lock and report it.
    fn repair_group_locks(&mut self, now: Instant) {
        let messages = &self.messages;
        let queue = &self.name;
        self.group_locks.retain(|gid, message_id| {
            let held = messages
                .iter()
                .any(|m| &m.message_id == message_id && m.is_in_flight(now));
            if !held {
                error!(queue = %queue, group = %gid, message_id = %message_id, "Released orphaned group lock");
            }
            held
        });
    }

    fn clean_dedup_cache(&mut self, now: Instant) {
        let window = self.dedup_window;
        self.dedup_cache
            .retain(|_, (_, ts)| now.duration_since(*ts) < window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(fifo: bool) -> Queue {
        let attributes = QueueAttributes {
            fifo_queue: fifo,
            ..Default::default()
        };
        Queue::new(
            "q".into(),
            "arn:aws:sqs:us-east-1:000000000000:q".into(),
            "http://localhost:9324/000000000000/q".into(),
            attributes,
            Duration::from_secs(300),
        )
    }

    fn handle_of(received: &ReceivedMessage) -> ReceiptHandle {
        received.receipt_handle.parse().unwrap()
    }

    #[test]
    fn redrive_policy_parses_numeric_and_string_counts() {
        let rp = RedrivePolicy::from_json(
            r#"{"maxReceiveCount": "3", "deadLetterTargetArn":"arn:aws:sqs::000000000000:failed"}"#,
        )
        .unwrap();
        assert_eq!(rp.max_receive_count, 3);
        assert_eq!(rp.dead_letter_queue_name(), "failed");

        let err = RedrivePolicy::from_json(r#"{"maxReceiveCount": 0, "deadLetterTargetArn":"x"}"#)
            .unwrap_err();
        assert!(matches!(err, SqsError::InvalidAttributeValue(_)));
    }

    #[test]
    fn attributes_reject_out_of_range_and_unknown() {
        let mut attrs = QueueAttributes::default();
        let bad: HashMap<String, String> = [("VisibilityTimeout".to_string(), "43201".to_string())].into();
        assert!(matches!(attrs.apply(&bad), Err(SqsError::InvalidAttributeValue(_))));
        let unknown: HashMap<String, String> = [("Colour".to_string(), "blue".to_string())].into();
        assert!(matches!(attrs.apply(&unknown), Err(SqsError::InvalidAttributeName(_))));
    }

    #[test]
    fn set_attributes_is_all_or_nothing() {
        let mut q = queue(false);
        let attrs: HashMap<String, String> = [
            ("VisibilityTimeout".to_string(), "5".to_string()),
            ("DelaySeconds".to_string(), "901".to_string()),
        ]
        .into();
        assert!(q.set_attributes(&attrs).is_err());
        assert_eq!(q.attributes.visibility_timeout, 30);

        let fifo: HashMap<String, String> = [("FifoQueue".to_string(), "true".to_string())].into();
        assert!(matches!(q.set_attributes(&fifo), Err(SqsError::InvalidAttributeName(_))));
    }

    #[tokio::test]
    async fn send_rejects_empty_and_oversized_bodies() {
        let mut q = queue(false);
        assert!(matches!(
            q.send_message(NewMessage::new("")),
            Err(SqsError::InvalidMessageContents(_))
        ));
        let big = "x".repeat(262_145);
        assert!(matches!(
            q.send_message(NewMessage::new(big)),
            Err(SqsError::InvalidMessageContents(_))
        ));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn fifo_send_requires_group() {
        let mut q = queue(true);
        assert!(matches!(
            q.send_message(NewMessage::new("1")),
            Err(SqsError::MissingParameter(_))
        ));
        let out = q.send_message(NewMessage::new("1").group("g")).unwrap();
        assert_eq!(out.sequence_number.as_deref(), Some("00000000000000000001"));
    }

    #[tokio::test]
    async fn duplicate_send_keeps_first_payload() {
        let mut q = queue(true);
        q.attributes.deduplication_enabled = true;
        let first = q.send_message(NewMessage::new("Test1").group("g").dedup_id("123")).unwrap();
        let second = q.send_message(NewMessage::new("Test2").group("g").dedup_id("123")).unwrap();

        assert!(second.duplicate);
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.md5_of_message_body, md5_hex(b"Test2"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.messages().next().unwrap().body, "Test1");
    }

    #[tokio::test]
    async fn content_based_dedup_hashes_the_body() {
        let mut q = queue(true);
        q.attributes.content_based_deduplication = true;
        q.send_message(NewMessage::new("same").group("g")).unwrap();
        let again = q.send_message(NewMessage::new("same").group("g")).unwrap();
        q.send_message(NewMessage::new("other").group("g")).unwrap();

        assert!(again.duplicate);
        assert_eq!(q.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_window_expires() {
        let mut q = queue(false);
        q.attributes.deduplication_enabled = true;
        q.send_message(NewMessage::new("a").dedup_id("d")).unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        let out = q.send_message(NewMessage::new("a").dedup_id("d")).unwrap();
        assert!(!out.duplicate);
        assert_eq!(q.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_group_is_locked_while_in_flight() {
        let mut q = queue(true);
        q.send_message(NewMessage::new("1").group("G")).unwrap();
        q.send_message(NewMessage::new("2").group("G")).unwrap();
        q.send_message(NewMessage::new("x").group("H")).unwrap();

        let (got, _) = q.receive_messages(10, None).unwrap();
        let bodies: Vec<_> = got.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["1", "x"]);
        assert_eq!(q.locked_group_count(), 2);
        assert_eq!(q.group_lock("G"), Some(got[0].message_id.as_str()));

        let (again, _) = q.receive_messages(10, None).unwrap();
        assert!(again.is_empty());

        assert!(q.delete_message(&handle_of(&got[0])));
        assert_eq!(q.group_lock("G"), None);
        let (next, _) = q.receive_messages(10, None).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].body, "2");
    }

    #[tokio::test(start_paused = true)]
    async fn requeued_fifo_message_keeps_its_place() {
        let mut q = queue(true);
        q.attributes.visibility_timeout = 2;
        q.send_message(NewMessage::new("1").group("G")).unwrap();
        q.send_message(NewMessage::new("2").group("G")).unwrap();

        let (first, _) = q.receive_messages(1, None).unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        let (again, _) = q.receive_messages(1, None).unwrap();

        assert_eq!(again[0].body, "1");
        assert_eq!(again[0].attributes["ApproximateReceiveCount"], "2");
        assert_ne!(again[0].receipt_handle, first[0].receipt_handle);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_fifo_head_blocks_its_group() {
        let mut q = queue(true);
        q.send_message(NewMessage::new("1").group("G").delay(5)).unwrap();
        q.send_message(NewMessage::new("2").group("G")).unwrap();

        let (got, _) = q.receive_messages(10, None).unwrap();
        assert!(got.is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        let (got, _) = q.receive_messages(10, None).unwrap();
        assert_eq!(got[0].body, "1");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_handle_never_deletes_newer_delivery() {
        let mut q = queue(false);
        q.attributes.visibility_timeout = 1;
        q.send_message(NewMessage::new("1")).unwrap();

        let (first, _) = q.receive_messages(1, None).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        let (second, _) = q.receive_messages(1, None).unwrap();
        assert_eq!(second.len(), 1);

        assert!(!q.delete_message(&handle_of(&first[0])));
        assert_eq!(q.len(), 1);
        assert!(q.delete_message(&handle_of(&second[0])));
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn change_visibility_to_zero_releases_group() {
        let mut q = queue(true);
        q.send_message(NewMessage::new("1").group("G")).unwrap();
        let (got, _) = q.receive_messages(1, None).unwrap();
        let handle = handle_of(&got[0]);

        q.change_message_visibility(&handle, 0).unwrap();
        assert_eq!(q.locked_group_count(), 0);
        assert_eq!(q.messages().next().unwrap().receive_count, 1);

        let (again, _) = q.receive_messages(1, None).unwrap();
        assert_eq!(again[0].body, "1");
        assert!(matches!(
            q.change_message_visibility(&handle, 10),
            Err(SqsError::MessageNotInflight(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn change_visibility_extends_deadline() {
        let mut q = queue(false);
        q.attributes.visibility_timeout = 1;
        q.send_message(NewMessage::new("1")).unwrap();
        let (got, _) = q.receive_messages(1, None).unwrap();
        q.change_message_visibility(&handle_of(&got[0]), 10).unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        let (none, _) = q.receive_messages(1, None).unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_delivery_past_threshold_is_handed_off() {
        let mut q = queue(false);
        q.attributes.visibility_timeout = 1;
        q.attributes.redrive_policy = Some(RedrivePolicy {
            dead_letter_target_arn: "arn:aws:sqs:us-east-1:000000000000:dlq".into(),
            max_receive_count: 1,
        });
        q.send_message(NewMessage::new("1")).unwrap();
        q.receive_messages(1, None).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let redrives = q.return_expired_inflight();
        assert_eq!(redrives.len(), 1);
        assert_eq!(redrives[0].dlq_name, "dlq");
        assert_eq!(redrives[0].message.receive_count, 1);
        assert!(redrives[0].message.receipt_handle.is_none());
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn receive_redrives_when_count_would_exceed_threshold() {
        let mut q = queue(false);
        q.attributes.redrive_policy = Some(RedrivePolicy {
            dead_letter_target_arn: "arn:aws:sqs:us-east-1:000000000000:dlq".into(),
            max_receive_count: 1,
        });
        q.send_message(NewMessage::new("1")).unwrap();
        let (got, _) = q.receive_messages(1, Some(0)).unwrap();
        assert_eq!(got.len(), 1);

        let (got, redrives) = q.receive_messages(1, None).unwrap();
        assert!(got.is_empty());
        assert_eq!(redrives.len(), 1);
        assert_eq!(redrives[0].message.receive_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn orphaned_lock_is_released() {
        let mut q = queue(true);
        q.group_locks.insert("G".into(), "gone".into());
        q.send_message(NewMessage::new("1").group("G")).unwrap();
        let (got, _) = q.receive_messages(1, None).unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn retention_drops_old_messages() {
        let mut q = queue(false);
        q.send_message(NewMessage::new("old")).unwrap();
        q.send_message(NewMessage::new("new")).unwrap();
        q.messages[0].sent_timestamp -= i64::from(q.attributes.message_retention_period) * 1000 + 1;

        assert_eq!(q.drop_retention_expired(), 1);
        assert_eq!(q.messages().next().unwrap().body, "new");
    }

    #[tokio::test]
    async fn restored_message_goes_back_in_send_order() {
        let mut q = queue(true);
        q.attributes.redrive_policy = Some(RedrivePolicy {
            dead_letter_target_arn: "arn:aws:sqs:us-east-1:000000000000:dlq".into(),
            max_receive_count: 1,
        });
        for (body, group) in [("1", "A"), ("2", "B"), ("3", "C")] {
            q.send_message(NewMessage::new(body).group(group)).unwrap();
        }
        q.receive_messages(1, Some(0)).unwrap();
        let (got, mut redrives) = q.receive_messages(1, Some(0)).unwrap();
        assert_eq!(got[0].body, "2");
        assert_eq!(redrives.len(), 1);
        assert_eq!(q.len(), 2);

        q.restore(redrives.remove(0).message);
        let bodies: Vec<&str> = q.messages().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn purge_is_rate_limited() {
        let mut q = queue(false);
        q.send_message(NewMessage::new("1")).unwrap();
        q.purge().unwrap();
        assert!(q.is_empty());
        assert!(matches!(q.purge(), Err(SqsError::PurgeQueueInProgress(_))));
    }

    #[tokio::test]
    async fn attribute_counts() {
        let mut q = queue(false);
        q.send_message(NewMessage::new("1")).unwrap();
        q.send_message(NewMessage::new("2")).unwrap();
        q.send_message(NewMessage::new("3").delay(60)).unwrap();
        q.receive_messages(1, None).unwrap();

        let attrs = q.get_attributes(&["All".to_string()]);
        assert_eq!(attrs["ApproximateNumberOfMessages"], "1");
        assert_eq!(attrs["ApproximateNumberOfMessagesNotVisible"], "1");
        assert_eq!(attrs["ApproximateNumberOfMessagesDelayed"], "1");

        let only = q.get_attributes(&["VisibilityTimeout".to_string()]);
        assert_eq!(only.len(), 1);
    }
}
