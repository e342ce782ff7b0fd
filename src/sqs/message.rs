use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest as Md5Digest, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::time::Instant;

use super::receipt::ReceiptHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct MessageAttributeValue {
    pub data_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_value: Option<String>,
}

impl MessageAttributeValue {
    pub fn string(value: impl Into<String>) -> Self {
        MessageAttributeValue {
            data_type: "String".into(),
            string_value: Some(value.into()),
            binary_value: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: String,
    pub body: String,
    pub md5_of_body: String,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
    pub md5_of_message_attributes: Option<String>,
    /// Epoch millis.
    pub sent_timestamp: i64,
    pub first_receive_timestamp: Option<i64>,
    pub visible_at: Instant,
    /// Visibility deadline of the current delivery.
    pub invisible_until: Option<Instant>,
    pub receive_count: u32,
    pub receipt_handle: Option<ReceiptHandle>,
    pub message_group_id: Option<String>,
    pub dedup_id: Option<String>,
    pub sequence_number: Option<String>,
}

impl Message {
    pub fn is_in_flight(&self, now: Instant) -> bool {
        self.invisible_until.is_some_and(|deadline| deadline > now)
    }

    /// Delivery deadline has passed but the message has not been returned yet.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.invisible_until.is_some_and(|deadline| deadline <= now)
    }

    pub fn is_visible(&self, now: Instant) -> bool {
        self.visible_at <= now && !self.is_in_flight(now)
    }

    pub fn holds_handle(&self, handle: &ReceiptHandle) -> bool {
        self.receipt_handle.as_ref() == Some(handle)
    }

    /// Returns the message to circulation without touching its receive count.
    pub fn release(&mut self) {
        self.invisible_until = None;
        self.receipt_handle = None;
    }

    /// Detaches the message from this queue's delivery state before it is
    /// appended to another queue.
    pub fn into_dead_letter(mut self, now: Instant) -> Self {
        self.release();
        self.visible_at = now;
        self
    }

    pub fn system_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("SentTimestamp".into(), self.sent_timestamp.to_string());
        attrs.insert("ApproximateReceiveCount".into(), self.receive_count.to_string());
        if let Some(ts) = self.first_receive_timestamp {
            attrs.insert("ApproximateFirstReceiveTimestamp".into(), ts.to_string());
        }
        if let Some(ref gid) = self.message_group_id {
            attrs.insert("MessageGroupId".into(), gid.clone());
        }
        if let Some(ref did) = self.dedup_id {
            attrs.insert("MessageDeduplicationId".into(), did.clone());
        }
        if let Some(ref seq) = self.sequence_number {
            attrs.insert("SequenceNumber".into(), seq.clone());
        }
        attrs
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Digest of message attributes using the length-prefixed encoding SDKs
/// verify against `MD5OfMessageAttributes`.
pub fn compute_md5_of_attributes(attrs: &HashMap<String, MessageAttributeValue>) -> Option<String> {
    if attrs.is_empty() {
        return None;
    }
    let mut keys: Vec<&String> = attrs.keys().collect();
    keys.sort();

    let mut buf: Vec<u8> = Vec::new();
    for key in keys {
        let attr = &attrs[key];
        push_len_prefixed(&mut buf, key.as_bytes());
        push_len_prefixed(&mut buf, attr.data_type.as_bytes());

        // Transport type: 1 for String/Number, 2 for Binary
        if attr.data_type.starts_with("Binary") {
            buf.push(2);
            if let Some(ref bv) = attr.binary_value {
                let decoded = STANDARD.decode(bv).unwrap_or_default();
                push_len_prefixed(&mut buf, &decoded);
            }
        } else {
            buf.push(1);
            if let Some(ref sv) = attr.string_value {
                push_len_prefixed(&mut buf, sv.as_bytes());
            }
        }
    }

    Some(md5_hex(&buf))
}

fn push_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}
