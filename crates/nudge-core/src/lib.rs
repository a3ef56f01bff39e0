//! nudge-core library.
//!
//! Notification aggregation for a coaching app: many conversation streams
//! fan in to one ledger, read-state changes are applied optimistically and
//! confirmed against a store of record, and new notifications surface as
//! tones, platform pushes, and a bounded toast queue.
//!
//! Start with [`engine::Engine`] (or [`session::SessionHost`] when the
//! signed-in identity can change).
//!
//! # Conventions
//!
//! - **Errors**: [`error::EngineError`] for engine operations, `anyhow::Result`
//!   for configuration and startup.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod alerts;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod model;
pub mod platform;
pub mod reconcile;
pub mod session;
pub mod sqlite;
pub mod store;
pub mod stream;

pub use engine::{ChangeSubscription, Collaborators, Engine};
pub use error::{EngineError, ErrorCode};
pub use model::{Conversation, ConversationId, MessageEvent, NotificationId, NotificationRecord, OwnerId};
