//! Keyed knowledge books (world lore and character profiles) and the
//! assembly of retrieved context blocks for both sample encodings.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::helpers::strip_code_fences;

/// Entry id that denotes the world-rules entry in the dialogue encoding.
pub const WORLD_RULES_ID: &str = "0";

/// A keyed lore or character fact.
///
/// `keys` is order-significant: the first key is the entry's canonical
/// name. An entry with no keys never matches an active speaker set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeEntry {
    pub id: String,
    pub keys: Vec<String>,
    pub content: String,
}

impl KnowledgeEntry {
    /// First key, if any.
    pub fn canonical_name(&self) -> Option<&str> {
        self.keys.first().map(String::as_str)
    }

    /// Whether any key names an active speaker.
    pub fn matches_any(&self, speakers: &HashSet<&str>) -> bool {
        self.keys.iter().any(|key| speakers.contains(key.as_str()))
    }
}

/// Raw on-disk entry shape: `{"key": [...], "content": "..."}`.
#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    key: Vec<String>,
    #[serde(default)]
    content: String,
}

/// Raw on-disk book shape: `{"entries": {id: entry, ...}}`.
///
/// serde_json's `preserve_order` feature keeps the map in file order, so
/// downstream iteration follows the book's own entry order.
#[derive(Debug, Deserialize)]
struct RawBook {
    #[serde(default)]
    entries: serde_json::Map<String, serde_json::Value>,
}

/// An insertion-ordered collection of knowledge entries.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeBook {
    entries: Vec<KnowledgeEntry>,
}

impl KnowledgeBook {
    /// Load a book from a JSON file, degrading to an empty book on any
    /// failure. A missing or unparsable book is never fatal; context
    /// assembly proceeds with whatever is available.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => {
                eprintln!(
                    "Warning: knowledge file not found - {}. Using empty data.",
                    path.display()
                );
                return Self::default();
            }
        };
        match Self::from_json_str(&raw) {
            Ok(book) => book,
            Err(err) => {
                eprintln!(
                    "Error: could not parse knowledge file {}: {}",
                    path.display(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Parse a book from its JSON text. Entry values that are not objects
    /// are skipped.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        let raw_book: RawBook = serde_json::from_str(raw)?;
        let entries = raw_book
            .entries
            .into_iter()
            .filter_map(|(id, value)| {
                let entry: RawEntry = serde_json::from_value(value).ok()?;
                Some(KnowledgeEntry {
                    id,
                    keys: entry.key,
                    content: entry.content,
                })
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in book order.
    pub fn entries(&self) -> &[KnowledgeEntry] {
        &self.entries
    }

    /// Look up an entry by id.
    pub fn get(&self, id: &str) -> Option<&KnowledgeEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Canonical names of every entry that has one, in book order. These
    /// are the target characters of the instruction pipeline.
    pub fn target_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|entry| entry.canonical_name())
            .map(str::to_string)
            .collect()
    }
}

/// Assemble the retrieved-context block for the dialogue encoding.
///
/// The world-rules entry (id `"0"`) comes first, followed by the profile
/// of every character-book entry whose keys intersect the active speaker
/// set, in book order.
pub fn build_dialogue_context(
    world: &KnowledgeBook,
    characters: &KnowledgeBook,
    active_speakers: &HashSet<&str>,
) -> String {
    let mut parts = Vec::new();

    if let Some(rules) = world.get(WORLD_RULES_ID) {
        parts.push(format!("### World Rules\n{}\n", rules.content.trim()));
    }

    if !characters.is_empty() {
        parts.push("### Character Profiles".to_string());
        for entry in characters.entries() {
            if !entry.matches_any(active_speakers) {
                continue;
            }
            let Some(name) = entry.canonical_name() else {
                continue;
            };
            parts.push(format!(
                "* {} (id {}):\n{}\n",
                name,
                entry.id,
                entry.content.trim()
            ));
        }
        parts.push("\n".to_string());
    }

    parts.join("\n")
}

/// A character profile resolved for the instruction encoding.
#[derive(Debug)]
struct CharacterProfile {
    content: String,
    is_active: bool,
}

/// Assemble the retrieved-context block for the instruction encoding.
///
/// Profiles come from the character book, falling back to the world book
/// when the character book is empty. The target character's profile is
/// emitted first (or a warning placeholder when absent) and excluded from
/// the remainder; the other active characters follow in lexicographic
/// name order. Profile content is stripped of code-fence markers.
pub fn build_instruction_context(
    world: &KnowledgeBook,
    characters: &KnowledgeBook,
    active_speakers: &HashSet<&str>,
    target: &str,
) -> String {
    let source = if characters.is_empty() { world } else { characters };

    let mut profiles: BTreeMap<&str, CharacterProfile> = BTreeMap::new();
    for entry in source.entries() {
        let Some(name) = entry.canonical_name() else {
            continue;
        };
        if entry.content.trim().is_empty() {
            continue;
        }
        profiles.insert(
            name,
            CharacterProfile {
                content: strip_code_fences(&entry.content),
                is_active: entry.matches_any(active_speakers),
            },
        );
    }

    let mut parts = vec!["### Character Profiles (Long-Term Memory)".to_string()];

    match profiles.get(target) {
        Some(profile) => parts.push(format!(
            "[You are playing: {}]\n{}\n",
            target, profile.content
        )),
        None => parts.push(format!(
            "Warning: no profile found for target character [{}].",
            target
        )),
    }

    for (name, profile) in &profiles {
        if *name == target || !profile.is_active {
            continue;
        }
        parts.push(format!(
            "--- Active character: {} ---\n{}\n",
            name, profile.content
        ));
    }

    parts.push("\n".to_string());
    parts.join("\n")
}
