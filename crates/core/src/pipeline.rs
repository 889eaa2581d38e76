//! Pipeline for converting chat-export transcripts into training-sample
//! JSONL files.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::conversation::{
    active_speakers, build_dialogue_samples, build_instruction_samples, DialogueConfig,
    InstructionConfig, Utterance,
};
use crate::knowledge::{build_dialogue_context, build_instruction_context, KnowledgeBook};

/// Errors surfaced by the pipeline. Each is local to one file or one
/// target character, except the two batch-level conditions
/// (`NoConversationFiles`, `NoTargetCharacters`).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed record at {}:{line}: {source}", path.display())]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
    #[error("failed to encode sample: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no .json or .jsonl conversation files found under {}", .0.display())]
    NoConversationFiles(PathBuf),
    #[error("character book defines no target characters")]
    NoTargetCharacters,
}

/// One line of a chat-export transcript.
#[derive(Debug, Deserialize)]
struct TranscriptRecord {
    name: Option<String>,
    mes: Option<String>,
    #[serde(default)]
    swipes: Vec<String>,
    #[serde(default)]
    is_system: bool,
}

impl TranscriptRecord {
    /// Whether the record is a system turn (flagged, or named so).
    fn is_system_turn(&self) -> bool {
        self.is_system || matches!(self.name.as_deref(), Some("system") | Some("System"))
    }

    /// Extract an utterance; `mes` falls back to the first swipe
    /// candidate. Records missing a speaker or usable text are dropped.
    fn into_utterance(self) -> Option<Utterance> {
        let speaker = self.name.filter(|name| !name.is_empty())?;
        let text = self
            .mes
            .filter(|mes| !mes.is_empty())
            .or_else(|| self.swipes.into_iter().next().filter(|s| !s.is_empty()))?;
        Some(Utterance::new(speaker, text))
    }
}

/// Discover all `.json`/`.jsonl` conversation files under a directory.
pub fn discover_conversation_files(root: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map_or(false, |ext| ext == "json" || ext == "jsonl")
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();
    paths
}

/// Load a transcript file into an ordered utterance sequence.
///
/// Blank lines are skipped; records without a speaker or usable text are
/// dropped. When `exclude_system` is set, system-flagged records are
/// dropped too (instruction pipeline only). A malformed line aborts the
/// whole file: the caller logs the error and the file contributes zero
/// utterances.
pub fn load_transcript(path: &Path, exclude_system: bool) -> Result<Vec<Utterance>, PipelineError> {
    let file = File::open(path).map_err(|source| PipelineError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);

    let mut utterances = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| PipelineError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: TranscriptRecord =
            serde_json::from_str(line).map_err(|source| PipelineError::MalformedRecord {
                path: path.to_path_buf(),
                line: index + 1,
                source,
            })?;

        if exclude_system && record.is_system_turn() {
            continue;
        }
        if let Some(utterance) = record.into_utterance() {
            utterances.push(utterance);
        }
    }

    Ok(utterances)
}

/// Write samples as line-delimited JSON, creating/truncating the file.
pub fn write_samples<T: Serialize>(path: &Path, samples: &[T]) -> Result<usize, PipelineError> {
    let file = File::create(path).map_err(|source| PipelineError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);

    for sample in samples {
        let json_line = serde_json::to_string(sample)?;
        writeln!(writer, "{}", json_line).map_err(|source| PipelineError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }

    writer.flush().map_err(|source| PipelineError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(samples.len())
}

/// Result of a dialogue-pipeline run.
#[derive(Debug, Serialize)]
pub struct DialogueSummary {
    pub files_discovered: usize,
    pub files_converted: usize,
    pub files_skipped: usize,
    pub samples_written: usize,
}

/// Result of an instruction-pipeline run.
#[derive(Debug, Serialize)]
pub struct InstructionSummary {
    pub targets: usize,
    pub files_discovered: usize,
    pub samples_written: usize,
    pub per_target: Vec<TargetSummary>,
}

/// Per-target-character result of an instruction-pipeline run.
#[derive(Debug, Serialize)]
pub struct TargetSummary {
    pub target: String,
    pub samples_written: usize,
    pub output_path: String,
}

/// Run the dialogue pipeline: one output file per conversation file,
/// processed in parallel. Files that fail to load or yield no samples are
/// skipped with a warning; only an empty input directory is fatal.
pub fn run_dialogue_pipeline(
    input_dir: &Path,
    output_dir: &Path,
    world: &KnowledgeBook,
    characters: &KnowledgeBook,
    config: &DialogueConfig,
) -> Result<DialogueSummary, PipelineError> {
    let files = discover_conversation_files(input_dir);
    if files.is_empty() {
        return Err(PipelineError::NoConversationFiles(input_dir.to_path_buf()));
    }
    std::fs::create_dir_all(output_dir).map_err(|source| PipelineError::Write {
        path: output_dir.to_path_buf(),
        source,
    })?;

    let total_files = files.len();
    let processed_count = AtomicUsize::new(0);
    let skipped_count = AtomicUsize::new(0);

    let written: Vec<usize> = files
        .par_iter()
        .filter_map(|path| {
            let result = convert_dialogue_file(path, output_dir, world, characters, config);
            let count = processed_count.fetch_add(1, Ordering::Relaxed) + 1;
            if count % 100 == 0 || count == total_files {
                eprintln!("Processed {}/{} conversation files...", count, total_files);
            }

            match result {
                Ok(Some(samples_written)) => Some(samples_written),
                Ok(None) => {
                    skipped_count.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Err(err) => {
                    skipped_count.fetch_add(1, Ordering::Relaxed);
                    eprintln!("Error processing {:?}: {}", path, err);
                    None
                }
            }
        })
        .collect();

    Ok(DialogueSummary {
        files_discovered: total_files,
        files_converted: written.len(),
        files_skipped: skipped_count.load(Ordering::Relaxed),
        samples_written: written.iter().sum(),
    })
}

/// Convert one conversation file. Returns the number of samples written,
/// or `None` when the file holds fewer than two usable utterances.
fn convert_dialogue_file(
    path: &Path,
    output_dir: &Path,
    world: &KnowledgeBook,
    characters: &KnowledgeBook,
    config: &DialogueConfig,
) -> Result<Option<usize>, PipelineError> {
    let utterances = load_transcript(path, false)?;
    if utterances.len() < 2 {
        return Ok(None);
    }

    let speakers = active_speakers(&utterances);
    let context = build_dialogue_context(world, characters, &speakers);
    let samples = build_dialogue_samples(&utterances, &context, config);
    if samples.is_empty() {
        return Ok(None);
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "conversation".to_string());
    let output_path = output_dir.join(format!("{}.jsonl", stem));
    let written = write_samples(&output_path, &samples)?;
    Ok(Some(written))
}

/// Run the instruction pipeline: every conversation file is re-walked
/// once per target character (targets in parallel, each owning its output
/// file). Target characters are the canonical names of the character
/// book's entries.
pub fn run_instruction_pipeline(
    input_dir: &Path,
    output_dir: &Path,
    world: &KnowledgeBook,
    characters: &KnowledgeBook,
    config: &InstructionConfig,
) -> Result<InstructionSummary, PipelineError> {
    let files = discover_conversation_files(input_dir);
    if files.is_empty() {
        return Err(PipelineError::NoConversationFiles(input_dir.to_path_buf()));
    }

    let targets = characters.target_names();
    if targets.is_empty() {
        return Err(PipelineError::NoTargetCharacters);
    }

    std::fs::create_dir_all(output_dir).map_err(|source| PipelineError::Write {
        path: output_dir.to_path_buf(),
        source,
    })?;

    let per_target: Vec<TargetSummary> = targets
        .par_iter()
        .filter_map(|target| {
            match convert_target(&files, output_dir, world, characters, target, config) {
                Ok(summary) => {
                    eprintln!(
                        "Generated {} samples for character {}",
                        summary.samples_written, target
                    );
                    Some(summary)
                }
                Err(err) => {
                    eprintln!("Error generating samples for {}: {}", target, err);
                    None
                }
            }
        })
        .collect();

    Ok(InstructionSummary {
        targets: targets.len(),
        files_discovered: files.len(),
        samples_written: per_target.iter().map(|t| t.samples_written).sum(),
        per_target,
    })
}

/// Accumulate instruction samples for one target character across every
/// conversation file, then write them to `alpaca_<target>.jsonl`. A stale
/// output from a previous run is removed first; no file is created when
/// the target yields zero samples.
fn convert_target(
    files: &[PathBuf],
    output_dir: &Path,
    world: &KnowledgeBook,
    characters: &KnowledgeBook,
    target: &str,
    config: &InstructionConfig,
) -> Result<TargetSummary, PipelineError> {
    let output_path = output_dir.join(format!("alpaca_{}.jsonl", target));
    if output_path.exists() {
        let _ = std::fs::remove_file(&output_path);
    }

    let mut samples = Vec::new();
    for path in files {
        let utterances = match load_transcript(path, true) {
            Ok(utterances) => utterances,
            Err(err) => {
                eprintln!("Error loading {:?}: {}", path, err);
                continue;
            }
        };
        if utterances.len() < 2 {
            continue;
        }

        let speakers = active_speakers(&utterances);
        let context = build_instruction_context(world, characters, &speakers, target);
        samples.extend(build_instruction_samples(&utterances, &context, target, config));
    }

    let samples_written = if samples.is_empty() {
        0
    } else {
        write_samples(&output_path, &samples)?
    };

    Ok(TargetSummary {
        target: target.to_string(),
        samples_written,
        output_path: output_path.to_string_lossy().into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn write_lines(path: &Path, lines: &[&str]) {
        let mut file = std::fs::File::create(path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
    }

    const WORLD_BOOK: &str = r#"{
        "entries": {
            "0": {"key": ["world"], "content": "Be kind."}
        }
    }"#;

    const CHARACTER_BOOK: &str = r#"{
        "entries": {
            "1": {"key": ["Abigail"], "content": "adventurous"},
            "2": {"key": ["Sebastian"], "content": "broody"}
        }
    }"#;

    #[test]
    fn test_discover_conversation_files() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("nested")).unwrap();
        std::fs::write(temp.path().join("b.jsonl"), "").unwrap();
        std::fs::write(temp.path().join("a.json"), "").unwrap();
        std::fs::write(temp.path().join("notes.txt"), "").unwrap();
        std::fs::write(temp.path().join("nested/c.jsonl"), "").unwrap();

        let files = discover_conversation_files(temp.path());
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, ["a.json", "b.jsonl", "c.jsonl"]);
    }

    #[test]
    fn test_load_transcript_basic_and_swipes_fallback() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("chat.jsonl");
        write_lines(
            &path,
            &[
                r#"{"name": "Abigail", "mes": "hi"}"#,
                "",
                r#"{"name": "Sebastian", "mes": "", "swipes": ["fallback line"]}"#,
                r#"{"name": "", "mes": "no speaker"}"#,
                r#"{"name": "Abigail"}"#,
            ],
        );

        let utterances = load_transcript(&path, false).unwrap();
        assert_eq!(utterances.len(), 2);
        assert_eq!(utterances[0], Utterance::new("Abigail", "hi"));
        assert_eq!(utterances[1], Utterance::new("Sebastian", "fallback line"));
    }

    #[test]
    fn test_load_transcript_system_exclusion_only_when_requested() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("chat.jsonl");
        write_lines(
            &path,
            &[
                r#"{"name": "System", "mes": "scene opens"}"#,
                r#"{"name": "Abigail", "mes": "hi", "is_system": true}"#,
                r#"{"name": "Abigail", "mes": "hello"}"#,
            ],
        );

        let kept = load_transcript(&path, false).unwrap();
        assert_eq!(kept.len(), 3);

        let filtered = load_transcript(&path, true).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].text, "hello");
    }

    #[test]
    fn test_load_transcript_malformed_line_aborts_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("chat.jsonl");
        write_lines(
            &path,
            &[
                r#"{"name": "Abigail", "mes": "hi"}"#,
                "not json at all",
                r#"{"name": "Sebastian", "mes": "hey"}"#,
            ],
        );

        let err = load_transcript(&path, false).unwrap_err();
        match err {
            PipelineError::MalformedRecord { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_dialogue_pipeline_end_to_end() {
        let temp = TempDir::new().unwrap();
        let input_dir = temp.path().join("input");
        let output_dir = temp.path().join("output");
        std::fs::create_dir_all(&input_dir).unwrap();
        write_lines(
            &input_dir.join("afternoon.jsonl"),
            &[
                r#"{"name": "Abigail", "mes": "hi"}"#,
                r#"{"name": "Sebastian", "mes": "hey"}"#,
                r#"{"name": "Abigail", "mes": "bye"}"#,
            ],
        );
        // Too short to yield samples: skipped, not fatal
        write_lines(&input_dir.join("short.jsonl"), &[r#"{"name": "A", "mes": "x"}"#]);

        let world = KnowledgeBook::from_json_str(WORLD_BOOK).unwrap();
        let characters = KnowledgeBook::from_json_str(CHARACTER_BOOK).unwrap();
        let summary = run_dialogue_pipeline(
            &input_dir,
            &output_dir,
            &world,
            &characters,
            &DialogueConfig::default(),
        )
        .unwrap();

        assert_eq!(summary.files_discovered, 2);
        assert_eq!(summary.files_converted, 1);
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.samples_written, 2);

        let raw = std::fs::read_to_string(output_dir.join("afternoon.jsonl")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        let messages = first["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["content"], "hey");
        assert!(messages[0]["content"]
            .as_str()
            .unwrap()
            .contains("Be kind."));
    }

    #[test]
    fn test_dialogue_pipeline_empty_input_is_fatal() {
        let temp = TempDir::new().unwrap();
        let input_dir = temp.path().join("empty");
        std::fs::create_dir_all(&input_dir).unwrap();

        let err = run_dialogue_pipeline(
            &input_dir,
            &temp.path().join("out"),
            &KnowledgeBook::default(),
            &KnowledgeBook::default(),
            &DialogueConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::NoConversationFiles(_)));
    }

    #[test]
    fn test_instruction_pipeline_end_to_end() {
        let temp = TempDir::new().unwrap();
        let input_dir = temp.path().join("input");
        let output_dir = temp.path().join("output");
        std::fs::create_dir_all(&input_dir).unwrap();
        write_lines(
            &input_dir.join("chat.jsonl"),
            &[
                r#"{"name": "Farmer", "mes": "hi"}"#,
                r#"{"name": "Abigail", "mes": "hello"}"#,
                r#"{"name": "Farmer", "mes": "bye"}"#,
            ],
        );

        let world = KnowledgeBook::from_json_str(WORLD_BOOK).unwrap();
        let characters = KnowledgeBook::from_json_str(CHARACTER_BOOK).unwrap();
        let summary = run_instruction_pipeline(
            &input_dir,
            &output_dir,
            &world,
            &characters,
            &InstructionConfig::default(),
        )
        .unwrap();

        assert_eq!(summary.targets, 2);
        assert_eq!(summary.samples_written, 1);

        let raw = std::fs::read_to_string(output_dir.join("alpaca_Abigail.jsonl")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 1);
        let sample: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(sample["input"], "[Farmer]: hi");
        assert_eq!(sample["output"], "hello");
        assert_eq!(sample["history"].as_array().unwrap().len(), 0);
        assert!(sample["system"]
            .as_str()
            .unwrap()
            .contains("[You are playing: Abigail]"));

        // Sebastian never speaks: no output file for him
        assert!(!output_dir.join("alpaca_Sebastian.jsonl").exists());
    }

    #[test]
    fn test_instruction_pipeline_requires_targets() {
        let temp = TempDir::new().unwrap();
        let input_dir = temp.path().join("input");
        std::fs::create_dir_all(&input_dir).unwrap();
        write_lines(&input_dir.join("chat.jsonl"), &[r#"{"name": "A", "mes": "x"}"#]);

        let err = run_instruction_pipeline(
            &input_dir,
            &temp.path().join("out"),
            &KnowledgeBook::default(),
            &KnowledgeBook::default(),
            &InstructionConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::NoTargetCharacters));
    }

    #[test]
    fn test_instruction_pipeline_removes_stale_output() {
        let temp = TempDir::new().unwrap();
        let input_dir = temp.path().join("input");
        let output_dir = temp.path().join("output");
        std::fs::create_dir_all(&input_dir).unwrap();
        std::fs::create_dir_all(&output_dir).unwrap();
        // Stale file for a target that yields no samples this run
        std::fs::write(output_dir.join("alpaca_Sebastian.jsonl"), "old data\n").unwrap();
        write_lines(
            &input_dir.join("chat.jsonl"),
            &[
                r#"{"name": "Farmer", "mes": "hi"}"#,
                r#"{"name": "Abigail", "mes": "hello"}"#,
            ],
        );

        let world = KnowledgeBook::from_json_str(WORLD_BOOK).unwrap();
        let characters = KnowledgeBook::from_json_str(CHARACTER_BOOK).unwrap();
        run_instruction_pipeline(
            &input_dir,
            &output_dir,
            &world,
            &characters,
            &InstructionConfig::default(),
        )
        .unwrap();

        assert!(!output_dir.join("alpaca_Sebastian.jsonl").exists());
        assert!(output_dir.join("alpaca_Abigail.jsonl").exists());
    }

    #[test]
    fn test_write_samples_round_trips_history_pairs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.jsonl");
        let sample = crate::conversation::InstructionSample {
            instruction: "i".to_string(),
            input: "in".to_string(),
            output: "out".to_string(),
            system: "sys".to_string(),
            history: vec![("[A]: x".to_string(), "[B]: y".to_string())],
        };
        write_samples(&path, &[sample]).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(raw.trim()).unwrap();
        assert_eq!(value["history"][0][0], "[A]: x");
        assert_eq!(value["history"][0][1], "[B]: y");
    }
}
