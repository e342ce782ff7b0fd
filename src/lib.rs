//! In-memory emulation of a managed message queue service with standard and
//! FIFO queues, visibility timeouts, deduplication and dead-letter redrive.

pub mod sqs;
