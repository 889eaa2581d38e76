//! Core sample-generation logic for role-play chat-export training data.
//!
//! This crate converts group-chat transcripts (one JSON record per line,
//! `{"name": ..., "mes": ...}`) into supervised-fine-tuning samples,
//! injecting character and world knowledge retrieved from keyed entry
//! books. Two encodings are supported:
//!
//! - **Dialogue** (ChatML): one sample per consecutive utterance pair,
//!   with a monotonically growing transcript history.
//! - **Instruction** (Alpaca): one sample each time a designated target
//!   character speaks, with history reconstructed from a bounded rolling
//!   buffer of preceding turns.

mod conversation;
mod helpers;
mod knowledge;
pub mod pipeline;

pub use conversation::{
    active_speakers, build_dialogue_samples, build_instruction_samples, ChatMessage, ChatSample,
    ConversationBuffer, DialogueConfig, InstructionConfig, InstructionSample, Utterance,
};
pub use helpers::{bracket_speaker_line, normalize_message, strip_code_fences};
pub use knowledge::{
    build_dialogue_context, build_instruction_context, KnowledgeBook, KnowledgeEntry,
    WORLD_RULES_ID,
};
pub use pipeline::{
    discover_conversation_files, load_transcript, run_dialogue_pipeline, run_instruction_pipeline,
    write_samples, DialogueSummary, InstructionSummary, PipelineError, TargetSummary,
};

/// Buffer length that triggers truncation of the rolling history window.
pub const BUFFER_MAX_TURNS: usize = 20;

/// Number of most recent turns retained when the buffer is truncated.
pub const BUFFER_RETAIN_TURNS: usize = 10;

/// Default system prompt for the dialogue (ChatML) encoding.
pub const DIALOGUE_SYSTEM_PROMPT: &str = "You are an AI assistant capable of playing multiple characters in a group role-play. Your goal is to play one designated character and reply with high fidelity to that character's voice, mood, and point of view, grounded in the provided knowledge and conversation history. Strictly follow the communication rules laid out in the world rules.";

/// Default system prompt for the instruction (Alpaca) encoding.
pub const INSTRUCTION_SYSTEM_PROMPT: &str = "You are an AI assistant capable of playing multiple characters in a group role-play. Your goal is to play one designated character and reply with high fidelity to that character's voice, mood, and point of view, grounded in the provided knowledge and conversation history. Strictly follow the communication rules laid out in the world rules.\n--- Character profiles and world rules are injected into the SYSTEM field, see below ---";
