//! Sample builders: growing-history dialogue samples and bounded-buffer
//! instruction samples with speaker-triggered emission.

use std::collections::HashSet;

use serde::Serialize;

use crate::helpers::{bracket_speaker_line, labeled_history_line, normalize_message};
use crate::{
    BUFFER_MAX_TURNS, BUFFER_RETAIN_TURNS, DIALOGUE_SYSTEM_PROMPT, INSTRUCTION_SYSTEM_PROMPT,
};

/// One speaker-labeled message in a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub speaker: String,
    pub text: String,
}

impl Utterance {
    pub fn new(speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            text: text.into(),
        }
    }
}

/// Distinct speaker names observed in one transcript.
pub fn active_speakers(utterances: &[Utterance]) -> HashSet<&str> {
    utterances.iter().map(|u| u.speaker.as_str()).collect()
}

/// A single message in a ChatML sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A dialogue-encoding training sample: system, user, assistant.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSample {
    pub messages: Vec<ChatMessage>,
}

impl ChatSample {
    pub fn new(system: String, user: String, assistant: String) -> Self {
        Self {
            messages: vec![
                ChatMessage::system(system),
                ChatMessage::user(user),
                ChatMessage::assistant(assistant),
            ],
        }
    }
}

/// An instruction-encoding training sample. `history` serializes as
/// `[["[speaker]: text", "[speaker]: text"], ...]`.
#[derive(Debug, Clone, Serialize)]
pub struct InstructionSample {
    pub instruction: String,
    pub input: String,
    pub output: String,
    pub system: String,
    pub history: Vec<(String, String)>,
}

/// Configuration for the dialogue builder.
#[derive(Debug, Clone)]
pub struct DialogueConfig {
    pub system_prompt: String,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            system_prompt: DIALOGUE_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Configuration for the instruction builder.
#[derive(Debug, Clone)]
pub struct InstructionConfig {
    pub system_prompt: String,
    /// Buffer length that triggers truncation.
    pub buffer_max_turns: usize,
    /// Turns retained after truncation.
    pub buffer_retain_turns: usize,
}

impl Default for InstructionConfig {
    fn default() -> Self {
        Self {
            system_prompt: INSTRUCTION_SYSTEM_PROMPT.to_string(),
            buffer_max_turns: BUFFER_MAX_TURNS,
            buffer_retain_turns: BUFFER_RETAIN_TURNS,
        }
    }
}

/// Bounded rolling window of turns not yet consumed as prompt material.
///
/// Owned by a single instruction-builder invocation; never shared across
/// files or target characters. After every push, a buffer longer than
/// `max_turns` is replaced by its last `retain_turns` elements.
#[derive(Debug)]
pub struct ConversationBuffer {
    turns: Vec<Utterance>,
    max_turns: usize,
    retain_turns: usize,
}

impl ConversationBuffer {
    pub fn new(max_turns: usize, retain_turns: usize) -> Self {
        Self {
            turns: Vec::new(),
            max_turns,
            retain_turns,
        }
    }

    pub fn push(&mut self, turn: Utterance) {
        self.turns.push(turn);
        if self.turns.len() > self.max_turns {
            let cut = self.turns.len() - self.retain_turns;
            self.turns.drain(..cut);
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Most recent turn, the prompt candidate for the next emission.
    pub fn last(&self) -> Option<&Utterance> {
        self.turns.last()
    }

    /// Reconstruct instruction/response history pairs from the buffered
    /// turns, excluding the last element (it becomes the sample's input).
    /// Turns pair positionally, `(turns[2k], turns[2k+1])`; a trailing
    /// unpaired turn is dropped.
    pub fn history_pairs(&self) -> Vec<(String, String)> {
        let Some((_, preceding)) = self.turns.split_last() else {
            return Vec::new();
        };
        preceding
            .chunks_exact(2)
            .map(|pair| {
                (
                    bracket_speaker_line(&pair[0].speaker, &pair[0].text),
                    bracket_speaker_line(&pair[1].speaker, &pair[1].text),
                )
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn turns(&self) -> &[Utterance] {
        &self.turns
    }
}

fn system_block(prompt: &str, knowledge_context: &str) -> String {
    normalize_message(&format!(
        "{}\n\n### Retrieved Long-Term Memory\n---\n{}",
        prompt, knowledge_context
    ))
}

/// Build dialogue (ChatML) samples: one per consecutive utterance pair,
/// with a speaker-labeled transcript that grows without bound.
///
/// Produces exactly N-1 samples for N utterances, zero for N < 2.
pub fn build_dialogue_samples(
    utterances: &[Utterance],
    knowledge_context: &str,
    config: &DialogueConfig,
) -> Vec<ChatSample> {
    if utterances.len() < 2 {
        return Vec::new();
    }

    let system = system_block(&config.system_prompt, knowledge_context);

    let mut history = String::new();
    let mut samples = Vec::with_capacity(utterances.len() - 1);

    for window in utterances.windows(2) {
        let (previous, current) = (&window[0], &window[1]);
        history.push_str(&labeled_history_line(&previous.speaker, &previous.text));

        let user = format!(
            "\n### Conversation History\n---\n{}\n\n### Your Turn\n---\nNow reply as **{}**.\n",
            history, current.speaker
        );

        samples.push(ChatSample::new(
            system.clone(),
            normalize_message(&user),
            normalize_message(&current.text),
        ));
    }

    samples
}

/// Build instruction (Alpaca) samples for one target character.
///
/// Walks the transcript with a bounded rolling buffer. Each time the
/// target speaks while the buffer is non-empty, the buffer's last turn
/// becomes the sample's input, the rest of the buffer becomes paired
/// history, and the target's text becomes the output. The current turn is
/// buffered in every branch, so consecutive target turns prompt each
/// other.
pub fn build_instruction_samples(
    utterances: &[Utterance],
    knowledge_context: &str,
    target: &str,
    config: &InstructionConfig,
) -> Vec<InstructionSample> {
    if utterances.len() < 2 {
        return Vec::new();
    }

    let system = system_block(&config.system_prompt, knowledge_context);
    let instruction =
        normalize_message(&format!("Reply to the following message as [{}].", target));

    let mut buffer = ConversationBuffer::new(config.buffer_max_turns, config.buffer_retain_turns);
    let mut samples = Vec::new();

    for utterance in utterances {
        if utterance.speaker == target {
            if let Some(prompt_turn) = buffer.last() {
                samples.push(InstructionSample {
                    instruction: instruction.clone(),
                    input: bracket_speaker_line(&prompt_turn.speaker, &prompt_turn.text),
                    output: normalize_message(&utterance.text),
                    system: system.clone(),
                    history: buffer.history_pairs(),
                });
            }
        }
        buffer.push(utterance.clone());
    }

    samples
}
