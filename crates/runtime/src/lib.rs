//! Outreach runtime - the temporal coordination layer
//!
//! Two independent pieces live here:
//! - **Message buffer** (`buffer`) - per-conversation debounce that turns a
//!   burst of inbound messages into one flushed turn
//! - **Action poller** (`poller`) - polling loop that claims due scheduled
//!   actions from the store and hands them to an executor
//!
//! # Architecture
//!
//! ```text
//! inbound message → MessageBuffer ──flush──→ FlushHandler (conversation processor)
//!                                                  │ create / cancel
//!                                                  ↓
//!                    ActionPoller ──claim_due──→ ScheduledActionRepository
//!                         │
//!                         └──execute──→ ActionExecutor (chat channel)
//! ```
//!
//! Pollers share nothing in memory. Any number of replicas may run against
//! the same store; mutual exclusion comes from `claim_due` alone.

pub mod buffer;
pub mod poller;

pub use buffer::{BufferError, BufferSettings, FlushHandler, MessageBuffer};
pub use poller::{ActionExecutor, ActionPoller, CycleReport, PollerError, PollerSettings};
