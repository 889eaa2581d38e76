//! CLI tool for converting role-play chat exports into SFT training data.
//!
//! Reads line-delimited chat-export transcripts plus world/character
//! knowledge books and emits JSONL training samples in one of two
//! encodings: growing-history ChatML (`dialogue`) or bounded-history
//! Alpaca (`instruction`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use roleplay_serializer_core::{
    run_dialogue_pipeline, run_instruction_pipeline, DialogueConfig, InstructionConfig,
    KnowledgeBook, BUFFER_MAX_TURNS, BUFFER_RETAIN_TURNS,
};

/// Convert role-play chat exports to JSONL SFT training samples.
#[derive(Parser, Debug)]
#[command(name = "roleplay-serialize")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory containing .json/.jsonl chat-export files
    #[arg(long)]
    input_dir: PathBuf,

    /// Output directory for JSONL training files
    #[arg(long)]
    output_dir: PathBuf,

    /// Path to the world book JSON file
    #[arg(long)]
    world_book: PathBuf,

    /// Path to the character book JSON file
    #[arg(long)]
    character_book: PathBuf,

    /// Custom system prompt (optional)
    #[arg(long)]
    system_prompt: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Emit growing-history ChatML samples, one output file per conversation
    Dialogue,
    /// Emit bounded-history Alpaca samples, one output file per target character
    Instruction {
        /// Buffer length that triggers truncation of the history window
        #[arg(long, default_value_t = BUFFER_MAX_TURNS)]
        buffer_max_turns: usize,

        /// Turns retained after truncation
        #[arg(long, default_value_t = BUFFER_RETAIN_TURNS)]
        buffer_retain_turns: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("Loading knowledge books...");
    let world = KnowledgeBook::load(&args.world_book);
    let characters = KnowledgeBook::load(&args.character_book);
    if world.is_empty() || characters.is_empty() {
        eprintln!("Warning: knowledge books incomplete; sample context may be missing.");
    }

    println!("Processing conversation files from {:?}...", args.input_dir);

    match args.command {
        Command::Dialogue => {
            let mut config = DialogueConfig::default();
            if let Some(prompt) = args.system_prompt {
                config.system_prompt = prompt;
            }

            let summary =
                run_dialogue_pipeline(&args.input_dir, &args.output_dir, &world, &characters, &config)?;

            let metadata_path = args.output_dir.join("metadata.json");
            let metadata = serde_json::json!({
                "config": {
                    "encoding": "dialogue",
                    "input_dir": args.input_dir.to_string_lossy(),
                    "output_dir": args.output_dir.to_string_lossy(),
                    "world_book": args.world_book.to_string_lossy(),
                    "character_book": args.character_book.to_string_lossy(),
                },
                "counts": {
                    "files_discovered": summary.files_discovered,
                    "files_converted": summary.files_converted,
                    "files_skipped": summary.files_skipped,
                    "samples_written": summary.samples_written,
                },
            });
            std::fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)?;

            println!("\n[summary]");
            println!("  Conversation files discovered: {}", summary.files_discovered);
            println!("  Files converted: {}", summary.files_converted);
            println!("  Files skipped: {}", summary.files_skipped);
            println!("  Samples written: {}", summary.samples_written);
            println!("  Output: {:?}/<conversation>.jsonl", args.output_dir);
            println!("  Metadata: {:?}", metadata_path);
        }
        Command::Instruction {
            buffer_max_turns,
            buffer_retain_turns,
        } => {
            let mut config = InstructionConfig {
                buffer_max_turns,
                buffer_retain_turns,
                ..InstructionConfig::default()
            };
            if let Some(prompt) = args.system_prompt {
                config.system_prompt = prompt;
            }

            let summary = run_instruction_pipeline(
                &args.input_dir,
                &args.output_dir,
                &world,
                &characters,
                &config,
            )?;

            let metadata_path = args.output_dir.join("metadata.json");
            let metadata = serde_json::json!({
                "config": {
                    "encoding": "instruction",
                    "input_dir": args.input_dir.to_string_lossy(),
                    "output_dir": args.output_dir.to_string_lossy(),
                    "world_book": args.world_book.to_string_lossy(),
                    "character_book": args.character_book.to_string_lossy(),
                    "buffer_max_turns": buffer_max_turns,
                    "buffer_retain_turns": buffer_retain_turns,
                },
                "counts": {
                    "target_characters": summary.targets,
                    "files_discovered": summary.files_discovered,
                    "samples_written": summary.samples_written,
                },
                "per_target": summary.per_target,
            });
            std::fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)?;

            println!("\n[summary]");
            println!("  Target characters: {}", summary.targets);
            println!("  Conversation files discovered: {}", summary.files_discovered);
            println!("  Samples written: {}", summary.samples_written);
            for target in &summary.per_target {
                println!("    {}: {} samples", target.target, target.samples_written);
            }
            println!("  Output: {:?}/alpaca_<character>.jsonl", args.output_dir);
            println!("  Metadata: {:?}", metadata_path);
        }
    }

    Ok(())
}
