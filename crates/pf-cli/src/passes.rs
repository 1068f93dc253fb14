use crate::cypher::graph_to_cypher;
use crate::transcript::{chunk_turns, parse_transcript, CleanTurn};
use anyhow::{Context, Result};
use pf_core::export_contracts::ArtifactKind;
use pf_core::graph_contracts::{GraphDocument, Utterance};
use pf_core::QA_REQUIRED_COLUMNS;
use pf_export::qa_csv::CsvInput;
use pf_export::SessionExporter;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::info;

pub const DEFAULT_CHUNK_SIZE: usize = 50;
const AUDIT_ROWS: usize = 3;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PassFacts {
    pub csv_rows: usize,
    pub sqlite_upserts: usize,
    pub graph_nodes: usize,
}

/// CLEAN: parse and chunk the transcript, print an audit, write nothing.
pub fn pass_a(
    input_path: &Path,
    chunk_size: usize,
    out: &mut dyn Write,
) -> Result<Vec<Vec<CleanTurn>>> {
    let text = fs::read_to_string(input_path)
        .with_context(|| format!("Failed to read transcript {}", input_path.display()))?;
    let turns = parse_transcript(&text);

    writeln!(out, "turns: {}", turns.len())?;
    writeln!(out, "columns: {}", QA_REQUIRED_COLUMNS.join(","))?;
    for turn in turns.iter().take(AUDIT_ROWS) {
        writeln!(
            out,
            "  {} {}: {}",
            turn.turn_id, turn.speaker, turn.text_clean
        )?;
    }

    let chunks = chunk_turns(turns, chunk_size);
    writeln!(out, "chunks: {} (chunk_size {})", chunks.len(), chunk_size.max(1))?;
    info!(event = "pass_a_complete", chunks = chunks.len());
    Ok(chunks)
}

/// FILE: per chunk, allocate an id and persist CSV, SQLite rows and a
/// Graph-JSON document with empty annotations.
pub fn pass_b(
    exporter: &mut SessionExporter,
    chunks: &[Vec<CleanTurn>],
    out: &mut dyn Write,
) -> Result<PassFacts> {
    let mut facts = PassFacts::default();
    let key = exporter.session_key().clone();

    for chunk in chunks {
        let chunk_id = exporter.next_chunk()?;

        let records = chunk
            .iter()
            .map(|turn| csv_record(key.session_date(), key.session_type(), turn))
            .collect::<Vec<_>>();
        let csv = exporter.write_csv(
            Some(chunk_id),
            CsvInput::Records {
                records,
                columns: Some(QA_REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect()),
            },
        )?;
        let rows = csv.counts.rows.unwrap_or_default();
        facts.csv_rows += rows;

        let qa_rows = chunk.iter().map(|turn| turn.to_row(&key)).collect::<Vec<_>>();
        let upsert = exporter.upsert_rows(&qa_rows)?;
        facts.sqlite_upserts += upsert.counts.upserted.unwrap_or_default();

        let utterances = chunk
            .iter()
            .map(|turn| Utterance::new(turn.turn_id, turn.speaker.clone(), turn.text_clean.clone()))
            .collect();
        let graph = GraphDocument::for_chunk(&key, chunk_id, utterances);
        let graph = exporter.write_graph(Some(chunk_id), serde_json::to_value(&graph)?)?;
        facts.graph_nodes += graph.counts.utterances.unwrap_or_default();

        for summary in [&csv, &graph] {
            for artifact in &summary.artifacts {
                writeln!(out, "wrote {}", absolute(&artifact.primary_path).display())?;
            }
        }
        writeln!(out, "chunk {chunk_id}: {rows} rows")?;
        for warning in csv.warnings.iter().chain(&upsert.warnings).chain(&graph.warnings) {
            writeln!(out, "warning: {warning}")?;
        }
    }

    info!(event = "pass_b_complete", chunks = chunks.len(), csv_rows = facts.csv_rows);
    Ok(facts)
}

/// GRAPH: regenerate Cypher for every persisted graph chunk of the session.
pub fn pass_c(exporter: &mut SessionExporter, out: &mut dyn Write) -> Result<usize> {
    let chunk_ids = exporter.graph_chunks()?;
    for &chunk_id in &chunk_ids {
        let read = exporter.read_artifact(ArtifactKind::Graph, chunk_id)?;
        let graph: GraphDocument = serde_json::from_slice(&read.bytes)
            .with_context(|| format!("Failed to parse {}", read.path.display()))?;
        let summary = exporter.write_cypher(Some(chunk_id), &graph_to_cypher(&graph))?;

        if let Some(path) = summary.primary_path(ArtifactKind::Cypher) {
            writeln!(out, "wrote {}", absolute(path).display())?;
        }
        if let Some(preview) = &summary.preview {
            writeln!(out, "{preview}")?;
        }
    }
    info!(event = "pass_c_complete", chunks = chunk_ids.len());
    Ok(chunk_ids.len())
}

pub fn pipeline(
    exporter: &mut SessionExporter,
    input_path: &Path,
    chunk_size: usize,
    out: &mut dyn Write,
) -> Result<PassFacts> {
    let chunks = pass_a(input_path, chunk_size, out)?;
    let facts = pass_b(exporter, &chunks, out)?;
    pass_c(exporter, out)?;
    Ok(facts)
}

pub fn print_facts(facts: &PassFacts, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "{}", serde_json::to_string(facts)?)?;
    Ok(())
}

fn csv_record(session_date: &str, session_type: &str, turn: &CleanTurn) -> Map<String, Value> {
    let mut record = Map::new();
    record.insert("session_date".to_string(), json!(session_date));
    record.insert("session_type".to_string(), json!(session_type));
    record.insert("turn_id".to_string(), json!(turn.turn_id));
    record.insert("speaker".to_string(), json!(turn.speaker));
    record.insert("text_raw".to_string(), json!(turn.text_raw));
    record.insert("text_clean".to_string(), json!(turn.text_clean));
    record
}

fn absolute(path: &Path) -> std::path::PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
