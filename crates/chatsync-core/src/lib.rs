//! Conversation synchronization and streaming-message engine.
//!
//! The crate keeps a local persistent store, a reactive in-memory cache and a
//! remote source of truth consistent under optimistic writes, decodes streamed
//! model output into message records, and drives regeneration and branching.

pub mod cache;
pub mod controllers;
pub mod error;
pub mod models;
pub mod repositories;
pub mod services;
pub mod views;

pub use cache::{CacheEvent, CacheKey, ReactiveCache};
pub use controllers::{GenerationController, GenerationEvent, RegenerateOptions, SessionTicket};
pub use error::{SyncError, SyncResult};
pub use models::{
    Conversation, ConversationPatch, Message, MessageContent, MessagePatch, Role,
    SessionPhase, StreamingSession,
};
pub use services::{OptimisticWritePipeline, StreamDecoder, SyncService};
pub use views::ViewportAnchorController;
