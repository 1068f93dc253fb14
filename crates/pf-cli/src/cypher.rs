//! Graph-JSON to Cypher. Every node and relationship is written with MERGE so
//! replaying a chunk is idempotent. One statement per line.

use pf_core::graph_contracts::{GraphDocument, Utterance, UNKNOWN_CATEGORY};

pub const MAX_UTTERANCE_CHARS: usize = 800;

pub fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => {}
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn truncate_chars(value: &str, limit: usize) -> &str {
    match value.char_indices().nth(limit) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}

fn known(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(UNKNOWN_CATEGORY) {
        None
    } else {
        Some(trimmed)
    }
}

struct Scope {
    persona: String,
    session: String,
}

impl Scope {
    fn new(graph: &GraphDocument) -> Self {
        let patient = escape(&graph.patient_id);
        Self {
            persona: format!("(p:Persona {{id: '{patient}'}})"),
            session: format!(
                "(s:Session {{patient_id: '{patient}', date: '{}', type: '{}'}})",
                escape(&graph.session_date),
                escape(&graph.session_type)
            ),
        }
    }

    fn utterance(&self, graph: &GraphDocument, turn_id: i64) -> String {
        format!(
            "(u:Utterance {{patient_id: '{}', session_date: '{}', session_type: '{}', turn_id: {turn_id}}})",
            escape(&graph.patient_id),
            escape(&graph.session_date),
            escape(&graph.session_type)
        )
    }
}

pub fn graph_to_cypher(graph: &GraphDocument) -> String {
    let scope = Scope::new(graph);
    let mut lines = vec![
        format!("MERGE {};", scope.persona),
        format!("MERGE {};", scope.session),
        format!(
            "MERGE {} MERGE {} MERGE (p)-[:ATTENDS]->(s);",
            scope.persona, scope.session
        ),
    ];

    for utterance in &graph.utterances {
        utterance_statements(graph, &scope, utterance, &mut lines);
    }

    let mut text = lines.join("\n");
    text.push('\n');
    text
}

fn utterance_statements(
    graph: &GraphDocument,
    scope: &Scope,
    utterance: &Utterance,
    lines: &mut Vec<String>,
) {
    let node = scope.utterance(graph, utterance.turn_id);
    let text = escape(truncate_chars(&utterance.text, MAX_UTTERANCE_CHARS));
    lines.push(format!(
        "MERGE {} MERGE {node} SET u.speaker = '{}', u.text = '{text}' MERGE (s)-[:INCLUDES]->(u);",
        scope.session,
        escape(&utterance.speaker)
    ));

    let annotations = &utterance.annotations;
    let linked = |label: &str, property: &str, value: &str, relation: &str| {
        format!(
            "MERGE {node} MERGE (n:{label} {{{property}: '{}'}}) MERGE (u)-[:{relation}]->(n);",
            escape(value)
        )
    };

    for distortion in &annotations.distortions {
        lines.push(linked("Distortion", "type", distortion, "HAS_DISTORTION"));
    }
    for emotion in &annotations.emotions_primary {
        lines.push(linked("Emotion", "label", emotion, "TRIGGERS_EMOTION"));
    }
    if let Some(sentiment) = annotations.sentiment2d {
        let sentiment = sentiment.clamped();
        lines.push(format!(
            "MERGE {node} MERGE (n:Sentiment {{valence: {}, arousal: {}}}) MERGE (u)-[:HAS_SENTIMENT]->(n);",
            sentiment.valence, sentiment.arousal
        ));
    }
    if let Some(stage) = known(&annotations.erikson_stage) {
        lines.push(linked("Stage", "name", stage, "REFLECTS_STAGE"));
    }
    for schema in &annotations.schemas {
        lines.push(linked("Schema", "name", schema, "REFLECTS_SCHEMA"));
    }
    for defense in &annotations.defense_mechanisms {
        lines.push(linked("DefenseMechanism", "type", defense, "SHOWS_DEFENSE"));
    }

    if let Some(style) = known(&annotations.attachment_style) {
        lines.push(format!(
            "MERGE {} MERGE (n:AttachmentStyle {{style: '{}'}}) MERGE (p)-[:HAS_ATTACHMENT]->(n);",
            scope.persona,
            escape(style)
        ));
    }
    for (name, score) in &annotations.big5 {
        let Some(score) = score else {
            continue;
        };
        lines.push(format!(
            "MERGE {} MERGE (n:Trait {{name: '{}', score: {}}}) MERGE (p)-[:HAS_TRAIT]->(n);",
            scope.persona,
            escape(name),
            pf_core::graph_contracts::clamp_trait(*score)
        ));
    }
}
