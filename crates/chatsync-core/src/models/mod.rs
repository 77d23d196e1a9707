pub mod conversation;
pub mod message;
pub mod streaming_session;
pub mod token_usage;

pub use conversation::{Conversation, ConversationPatch};
pub use message::{
    ContentSegment, Message, MessageContent, MessageMeta, MessagePatch, ReasoningSegment,
    ReasoningState, Role,
};
pub use streaming_session::{SessionPhase, SessionRegistry, StreamingSession};
pub use token_usage::{FinishMetadata, TokenUsage};
