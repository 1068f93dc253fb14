//! Pass A: turn a raw Markdown/plain transcript into numbered, cleaned turns.

use pf_core::{canonical_speaker, QaRow, SessionKey, SPEAKER_CLIENT, SPEAKER_THERAPIST};
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanTurn {
    pub turn_id: i64,
    pub speaker: String,
    pub text_raw: String,
    pub text_clean: String,
}

impl CleanTurn {
    pub fn to_row(&self, key: &SessionKey) -> QaRow {
        QaRow::for_session(
            key,
            self.turn_id,
            self.speaker.clone(),
            self.text_raw.clone(),
            self.text_clean.clone(),
        )
    }
}

fn short_marker() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[*_\s]*([TtCc])(\d+)[*_]*\s*[:.)\-]?[*_\s]*(.*)$").expect("valid regex")
    })
}

fn labelled_marker() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[*_\s]*([A-Za-z][A-Za-z0-9 _()\-]{0,40}?)[*_\s]*:[*_\s]*(.*)$")
            .expect("valid regex")
    })
}

fn stage_note() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\([^)]*\)|\[[^\]]*\]").expect("valid regex"))
}

fn whitespace() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s+").expect("valid regex"))
}

fn space_before_punctuation() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s+([.,!?;:])").expect("valid regex"))
}

fn is_markdown_scaffolding(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.starts_with('#') {
        return true;
    }
    trimmed.len() >= 3
        && ['-', '*', '_', '=']
            .iter()
            .any(|mark| trimmed.chars().all(|ch| ch == *mark || ch == ' '))
}

fn speaker_line(line: &str) -> Option<(&'static str, String)> {
    if let Some(captures) = short_marker().captures(line) {
        let speaker = match captures.get(1).map(|m| m.as_str()) {
            Some("T") | Some("t") => SPEAKER_THERAPIST,
            _ => SPEAKER_CLIENT,
        };
        let rest = captures.get(3).map_or("", |m| m.as_str());
        return Some((speaker, rest.to_string()));
    }

    let captures = labelled_marker().captures(line)?;
    let label = captures.get(1)?.as_str();
    let speaker = canonical_speaker(label)?;
    let rest = captures.get(2).map_or("", |m| m.as_str());
    Some((speaker, rest.to_string()))
}

/// Drops parenthetical or bracketed stage notes and collapses whitespace.
pub fn clean_text(raw: &str) -> String {
    let without_notes = stage_note().replace_all(raw, " ");
    let collapsed = whitespace().replace_all(&without_notes, " ");
    space_before_punctuation()
        .replace_all(&collapsed, "$1")
        .trim()
        .trim_matches(|ch| ch == '*' || ch == '_')
        .trim()
        .to_string()
}

/// Recognises `T1:`/`C1:` markers and `Therapist:`/`Client:` style labels.
/// Lines before the first marker are ignored; later unlabelled lines extend
/// the current turn.
pub fn parse_transcript(text: &str) -> Vec<CleanTurn> {
    let mut turns: Vec<(&'static str, Vec<String>)> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() || is_markdown_scaffolding(line) {
            continue;
        }
        match speaker_line(line) {
            Some((speaker, rest)) => {
                let mut parts = Vec::new();
                if !rest.trim().is_empty() {
                    parts.push(rest.trim().to_string());
                }
                turns.push((speaker, parts));
            }
            None => {
                if let Some((_, parts)) = turns.last_mut() {
                    parts.push(line.trim().to_string());
                }
            }
        }
    }

    turns
        .into_iter()
        .enumerate()
        .map(|(index, (speaker, parts))| {
            let text_raw = parts.join(" ");
            CleanTurn {
                turn_id: index as i64 + 1,
                speaker: speaker.to_string(),
                text_clean: clean_text(&text_raw),
                text_raw,
            }
        })
        .collect()
}

pub fn chunk_turns(turns: Vec<CleanTurn>, chunk_size: usize) -> Vec<Vec<CleanTurn>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut current = Vec::with_capacity(chunk_size);
    for turn in turns {
        current.push(turn);
        if current.len() == chunk_size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(chunk_size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
