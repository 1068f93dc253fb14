use crate::ExportFailure;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// JSON envelope handed back to the agent for every tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub message: String,
    #[serde(default)]
    pub detail: Value,
}

impl ToolResponse {
    pub fn success(message: impl Into<String>, detail: Value) -> Self {
        Self {
            ok: true,
            kind: None,
            message: message.into(),
            detail,
        }
    }

    pub fn failure(failure: &ExportFailure) -> Self {
        let mut detail = failure.error.detail();
        if let Value::Object(map) = &mut detail {
            if let Some(chunk_id) = failure.chunk_id {
                map.insert("chunk_id".to_string(), json!(chunk_id));
            }
            if let Some(stage) = failure.stage {
                map.insert("stage".to_string(), json!(stage));
            }
        }
        Self {
            ok: false,
            kind: Some(failure.error.kind().as_str().to_string()),
            message: failure.error.to_string(),
            detail,
        }
    }

    pub fn from_result<T: Serialize>(result: Result<T, ExportFailure>) -> Self {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(detail) => Self::success("ok", detail),
                Err(err) => Self {
                    ok: false,
                    kind: Some("serialization".to_string()),
                    message: err.to_string(),
                    detail: Value::Null,
                },
            },
            Err(failure) => Self::failure(&failure),
        }
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|err| {
            format!("{{\"ok\":false,\"kind\":\"serialization\",\"message\":{:?}}}", err.to_string())
        })
    }
}
