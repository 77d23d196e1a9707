pub mod generation_gateway;
pub mod reasoning_extractor;
pub mod reconciler;
pub mod stream_decoder;
pub mod write_pipeline;

pub use generation_gateway::{
    ByteStream, GenerationGateway, GenerationRequest, HttpGenerationGateway, PromptMessage,
    RegenerationDirective, RegenerationMode, ScriptedGateway,
};
pub use reasoning_extractor::{
    ReasoningExtraction, extract_reasoning, extract_streaming_reasoning,
};
pub use reconciler::{SyncService, reconcile_conversations, reconcile_messages};
pub use stream_decoder::{DecodedFrame, StreamDecoder, decode_stream};
pub use write_pipeline::OptimisticWritePipeline;
