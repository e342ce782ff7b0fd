//! The queue registry and every operation exposed to the transport.
//!
//! Locking: the registry map sits behind an `RwLock` that is only held long
//! enough to clone a queue's `Arc`. Each queue's contents sit behind their own
//! `Mutex`. A queue lock is never held while another lock is acquired; messages
//! bound for a dead-letter queue are taken out under the source lock and
//! appended after it is released.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::EngineConfig;
use super::error::SqsError;
use super::queue::{
    parse_flag, DlqRedrive, NewMessage, Queue, QueueAttributes, ReceivedMessage, RedrivePolicy,
    SendOutcome,
};
use super::receipt::ReceiptHandle;

pub const MAX_BATCH_ENTRIES: usize = 10;
pub const MAX_RECEIVE_MESSAGES: usize = 10;
pub const MAX_WAIT_TIME_SECONDS: u32 = 20;

struct QueueEntry {
    queue: Mutex<Queue>,
    notify: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    pub max_messages: Option<usize>,
    pub visibility_timeout: Option<u32>,
    pub wait_time_seconds: Option<u32>,
}

/// One entry of a batch request. An entry that could not be decoded still
/// takes part in the whole-batch checks and is then reported as failed.
#[derive(Debug, Clone)]
pub struct BatchEntry<T> {
    pub id: String,
    pub payload: Result<T, SqsError>,
}

impl<T> BatchEntry<T> {
    pub fn new(id: impl Into<String>, payload: T) -> Self {
        BatchEntry {
            id: id.into(),
            payload: Ok(payload),
        }
    }

    pub fn rejected(id: impl Into<String>, error: SqsError) -> Self {
        BatchEntry {
            id: id.into(),
            payload: Err(error),
        }
    }
}

#[derive(Debug)]
pub struct BatchSuccess<T> {
    pub id: String,
    pub result: T,
}

#[derive(Debug)]
pub struct BatchFailure {
    pub id: String,
    pub error: SqsError,
}

#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub successful: Vec<BatchSuccess<T>>,
    pub failed: Vec<BatchFailure>,
}

impl<T> BatchOutcome<T> {
    fn collect<P>(
        entries: Vec<BatchEntry<P>>,
        mut apply: impl FnMut(P) -> Result<T, SqsError>,
    ) -> Self {
        let mut successful = Vec::new();
        let mut failed = Vec::new();
        for entry in entries {
            match entry.payload.and_then(&mut apply) {
                Ok(result) => successful.push(BatchSuccess {
                    id: entry.id,
                    result,
                }),
                Err(error) => failed.push(BatchFailure {
                    id: entry.id,
                    error,
                }),
            }
        }
        BatchOutcome { successful, failed }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub redriven: usize,
    pub retention_dropped: usize,
}

pub struct SqsState {
    queues: RwLock<HashMap<String, Arc<QueueEntry>>>,
    config: EngineConfig,
}

impl SqsState {
    pub fn new(config: EngineConfig) -> Self {
        SqsState {
            queues: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn validate_queue_name(name: &str, is_fifo: bool) -> Result<(), SqsError> {
        if name.is_empty() || name.len() > 80 {
            return Err(SqsError::InvalidParameterValue(
                "Queue name must be 1-80 characters".into(),
            ));
        }
        let base = name.strip_suffix(".fifo").unwrap_or(name);
        let valid = !base.is_empty()
            && base
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SqsError::InvalidParameterValue(
                "Queue name can only contain alphanumeric characters, hyphens, and underscores"
                    .into(),
            ));
        }
        if is_fifo != name.ends_with(".fifo") {
            return Err(SqsError::InvalidParameterValue(
                "The name of a FIFO queue must end with the .fifo suffix".into(),
            ));
        }
        Ok(())
    }

    /// Whole-batch checks, run before any entry is applied.
    fn validate_batch_ids<T>(entries: &[BatchEntry<T>]) -> Result<(), SqsError> {
        if entries.is_empty() {
            return Err(SqsError::EmptyBatchRequest(
                "There should be at least one entry in the request.".into(),
            ));
        }
        let mut seen = HashSet::new();
        for entry in entries {
            if !seen.insert(entry.id.as_str()) {
                return Err(SqsError::BatchEntryIdsNotDistinct(format!(
                    "Id {} repeated.",
                    entry.id
                )));
            }
        }
        if entries.len() > MAX_BATCH_ENTRIES {
            return Err(SqsError::TooManyEntriesInBatchRequest(format!(
                "Maximum number of entries per request are {MAX_BATCH_ENTRIES}. You have sent {}.",
                entries.len()
            )));
        }
        for entry in entries {
            let id = &entry.id;
            if id.is_empty()
                || id.len() > 80
                || !id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(SqsError::InvalidBatchEntryId(format!(
                    "A batch entry id can only contain alphanumeric characters, hyphens and underscores. It can be at most 80 letters long. Got: {id}"
                )));
            }
        }
        Ok(())
    }

    /// A redrive policy may only name a queue that already exists.
    fn check_dead_letter_target(
        queues: &HashMap<String, Arc<QueueEntry>>,
        attributes: &HashMap<String, String>,
    ) -> Result<(), SqsError> {
        let Some(raw) = attributes.get("RedrivePolicy").filter(|v| !v.is_empty()) else {
            return Ok(());
        };
        let policy = RedrivePolicy::from_json(raw)?;
        if !queues.contains_key(policy.dead_letter_queue_name()) {
            return Err(SqsError::InvalidParameterValue(format!(
                "Dead-letter target {} does not exist",
                policy.dead_letter_target_arn
            )));
        }
        Ok(())
    }

    async fn entry(&self, name: &str) -> Result<Arc<QueueEntry>, SqsError> {
        self.queues
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(SqsError::queue_does_not_exist)
    }

    /// Appends redriven messages to their dead-letter queues. Must be called
    /// with no queue lock held.
    async fn deliver_redrives(&self, source: &str, redrives: Vec<DlqRedrive>) -> usize {
        let mut delivered = 0;
        for redrive in redrives {
            let message_id = redrive.message.message_id.clone();
            match self.entry(&redrive.dlq_name).await {
                Ok(dlq) => {
                    dlq.queue.lock().await.push_dead_letter(redrive.message);
                    dlq.notify.notify_waiters();
                    delivered += 1;
                    info!(
                        queue = %source,
                        dead_letter_queue = %redrive.dlq_name,
                        message_id = %message_id,
                        "Moved message to dead-letter queue"
                    );
                }
                Err(_) => {
                    warn!(
                        queue = %source,
                        dead_letter_queue = %redrive.dlq_name,
                        message_id = %message_id,
                        "Dead-letter queue does not exist; message kept in source queue"
                    );
                    match self.entry(source).await {
                        Ok(src) => {
                            src.queue.lock().await.restore(redrive.message);
                            src.notify.notify_waiters();
                        }
                        Err(_) => warn!(
                            queue = %source,
                            message_id = %message_id,
                            "Source queue is gone too; message dropped"
                        ),
                    }
                }
            }
        }
        delivered
    }

    pub async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String, SqsError> {
        let is_fifo = match attributes.get("FifoQueue") {
            Some(v) => parse_flag("FifoQueue", v)?,
            None => name.ends_with(".fifo"),
        };
        Self::validate_queue_name(name, is_fifo)?;

        let mut queues = self.queues.write().await;
        if queues.contains_key(name) {
            debug!(queue = %name, "Queue already exists");
            return Ok(self.config.queue_url(name));
        }

        Self::check_dead_letter_target(&queues, attributes)?;
        let mut attrs = QueueAttributes {
            fifo_queue: is_fifo,
            ..Default::default()
        };
        let mut requested = attributes.clone();
        requested.remove("FifoQueue");
        attrs.apply(&requested)?;

        let url = self.config.queue_url(name);
        let queue = Queue::new(
            name.to_string(),
            self.config.queue_arn(name),
            url.clone(),
            attrs,
            self.config.dedup_window,
        );
        queues.insert(
            name.to_string(),
            Arc::new(QueueEntry {
                queue: Mutex::new(queue),
                notify: Notify::new(),
            }),
        );
        info!(queue = %name, url = %url, fifo = is_fifo, "Created queue");
        Ok(url)
    }

    pub async fn delete_queue(&self, name: &str) -> Result<(), SqsError> {
        let removed = self.queues.write().await.remove(name);
        let entry = removed.ok_or_else(SqsError::queue_does_not_exist)?;
        // Wake long pollers so they notice the queue is gone.
        entry.notify.notify_waiters();
        info!(queue = %name, "Deleted queue");
        Ok(())
    }

    pub async fn get_queue_url(&self, name: &str) -> Result<String, SqsError> {
        let entry = self.entry(name).await?;
        let url = entry.queue.lock().await.url.clone();
        Ok(url)
    }

    pub async fn list_queues(&self, prefix: Option<&str>) -> Vec<String> {
        let queues = self.queues.read().await;
        let mut names: Vec<&String> = queues
            .keys()
            .filter(|n| prefix.map_or(true, |p| n.starts_with(p)))
            .collect();
        names.sort();
        names.into_iter().map(|n| self.config.queue_url(n)).collect()
    }

    pub async fn get_queue_attributes(
        &self,
        name: &str,
        attribute_names: &[String],
    ) -> Result<HashMap<String, String>, SqsError> {
        let entry = self.entry(name).await?;
        let queue = entry.queue.lock().await;
        Ok(queue.get_attributes(attribute_names))
    }

    pub async fn set_queue_attributes(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<(), SqsError> {
        let entry = {
            let queues = self.queues.read().await;
            let entry = queues
                .get(name)
                .cloned()
                .ok_or_else(SqsError::queue_does_not_exist)?;
            Self::check_dead_letter_target(&queues, attributes)?;
            entry
        };
        let mut queue = entry.queue.lock().await;
        queue.set_attributes(attributes)?;
        debug!(queue = %name, "Updated queue attributes");
        Ok(())
    }

    pub async fn purge_queue(&self, name: &str) -> Result<(), SqsError> {
        let entry = self.entry(name).await?;
        entry.queue.lock().await.purge()?;
        info!(queue = %name, "Purged queue");
        Ok(())
    }

    pub async fn send_message(&self, name: &str, message: NewMessage) -> Result<SendOutcome, SqsError> {
        let entry = self.entry(name).await?;
        let outcome = entry.queue.lock().await.send_message(message)?;
        if !outcome.duplicate {
            entry.notify.notify_waiters();
        }
        Ok(outcome)
    }

    pub async fn send_message_batch(
        &self,
        name: &str,
        entries: Vec<BatchEntry<NewMessage>>,
    ) -> Result<BatchOutcome<SendOutcome>, SqsError> {
        let entry = self.entry(name).await?;
        Self::validate_batch_ids(&entries)?;

        let outcome = {
            let mut queue = entry.queue.lock().await;
            BatchOutcome::collect(entries, |message| queue.send_message(message))
        };
        if outcome.successful.iter().any(|s| !s.result.duplicate) {
            entry.notify.notify_waiters();
        }
        Ok(outcome)
    }

    /// Receives up to `max_messages`, long polling for up to
    /// `wait_time_seconds` (or the queue default) when nothing is eligible.
    pub async fn receive_message(
        &self,
        name: &str,
        options: ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>, SqsError> {
        if options.wait_time_seconds.is_some_and(|w| w > MAX_WAIT_TIME_SECONDS) {
            return Err(SqsError::InvalidParameterValue(format!(
                "WaitTimeSeconds must be between 0 and {MAX_WAIT_TIME_SECONDS}"
            )));
        }
        let max_count = options
            .max_messages
            .unwrap_or(1)
            .clamp(1, MAX_RECEIVE_MESSAGES);
        let mut deadline: Option<Instant> = None;

        loop {
            // Looked up on every pass so a deleted queue surfaces as an error.
            let entry = self.entry(name).await?;
            let (received, redrives, wait) = {
                let mut queue = entry.queue.lock().await;
                let (received, redrives) =
                    queue.receive_messages(max_count, options.visibility_timeout)?;
                let wait = options
                    .wait_time_seconds
                    .unwrap_or(queue.attributes.receive_message_wait_time_seconds);
                (received, redrives, wait)
            };
            self.deliver_redrives(name, redrives).await;

            if !received.is_empty() {
                debug!(queue = %name, count = received.len(), "Received messages");
                return Ok(received);
            }

            let until = *deadline
                .get_or_insert_with(|| Instant::now() + Duration::from_secs(u64::from(wait)));
            let now = Instant::now();
            if now >= until {
                return Ok(Vec::new());
            }
            let step = (until - now).min(self.config.long_poll_step);
            let _ = tokio::time::timeout(step, entry.notify.notified()).await;
        }
    }

    /// Deleting with a handle that no longer names a live delivery succeeds
    /// without touching the queue.
    pub async fn delete_message(&self, name: &str, receipt_handle: &str) -> Result<(), SqsError> {
        let entry = self.entry(name).await?;
        let handle = Self::parse_handle(name, receipt_handle)?;
        entry.queue.lock().await.delete_message(&handle);
        Ok(())
    }

    pub async fn delete_message_batch(
        &self,
        name: &str,
        entries: Vec<BatchEntry<String>>,
    ) -> Result<BatchOutcome<()>, SqsError> {
        let entry = self.entry(name).await?;
        Self::validate_batch_ids(&entries)?;

        let mut queue = entry.queue.lock().await;
        Ok(BatchOutcome::collect(entries, |receipt_handle| {
            let handle = Self::parse_handle(name, &receipt_handle)?;
            queue.delete_message(&handle);
            Ok(())
        }))
    }

    pub async fn change_message_visibility(
        &self,
        name: &str,
        receipt_handle: &str,
        timeout: u32,
    ) -> Result<(), SqsError> {
        let entry = self.entry(name).await?;
        let handle = Self::parse_handle(name, receipt_handle)?;
        entry
            .queue
            .lock()
            .await
            .change_message_visibility(&handle, timeout)?;
        if timeout == 0 {
            entry.notify.notify_waiters();
        }
        Ok(())
    }

    pub async fn change_message_visibility_batch(
        &self,
        name: &str,
        entries: Vec<BatchEntry<(String, u32)>>,
    ) -> Result<BatchOutcome<()>, SqsError> {
        let entry = self.entry(name).await?;
        Self::validate_batch_ids(&entries)?;

        let outcome = {
            let mut queue = entry.queue.lock().await;
            BatchOutcome::collect(entries, |(receipt_handle, timeout)| {
                let handle = Self::parse_handle(name, &receipt_handle)?;
                queue.change_message_visibility(&handle, timeout)
            })
        };
        entry.notify.notify_waiters();
        Ok(outcome)
    }

    pub async fn list_dead_letter_source_queues(&self, name: &str) -> Result<Vec<String>, SqsError> {
        let queues = self.queues.read().await;
        if !queues.contains_key(name) {
            return Err(SqsError::queue_does_not_exist());
        }
        let mut sources = Vec::new();
        for (source, entry) in queues.iter() {
            let queue = entry.queue.lock().await;
            let targets_us = queue
                .attributes
                .redrive_policy
                .as_ref()
                .is_some_and(|rp| rp.dead_letter_queue_name() == name);
            if targets_us {
                sources.push((source.clone(), queue.url.clone()));
            }
        }
        sources.sort();
        Ok(sources.into_iter().map(|(_, url)| url).collect())
    }

    /// One pass of the visibility sweeper over every queue.
    pub async fn sweep(&self) -> SweepStats {
        let snapshot: Vec<(String, Arc<QueueEntry>)> = self
            .queues
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();

        let mut stats = SweepStats::default();
        for (name, entry) in snapshot {
            let redrives = {
                let mut queue = entry.queue.lock().await;
                let redrives = queue.return_expired_inflight();
                let dropped = queue.drop_retention_expired();
                if dropped > 0 {
                    info!(queue = %name, dropped, "Dropped messages past retention");
                }
                stats.retention_dropped += dropped;
                redrives
            };
            stats.redriven += self.deliver_redrives(&name, redrives).await;
        }
        stats
    }

    /// Runs `f` against the named queue under its lock.
    pub async fn inspect<R>(&self, name: &str, f: impl FnOnce(&Queue) -> R) -> Result<R, SqsError> {
        let entry = self.entry(name).await?;
        let queue = entry.queue.lock().await;
        Ok(f(&queue))
    }

    fn parse_handle(queue: &str, receipt_handle: &str) -> Result<ReceiptHandle, SqsError> {
        let handle: ReceiptHandle = receipt_handle.parse()?;
        if handle.queue() != queue {
            return Err(SqsError::ReceiptHandleIsInvalid(format!(
                "The receipt handle does not belong to queue {queue}."
            )));
        }
        Ok(handle)
    }
}
