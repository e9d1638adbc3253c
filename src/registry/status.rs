//! Push status stream decoding
//!
//! The engine answers a push with line-delimited JSON progress records. A push only
//! counts as successful when an `aux` record names the pushed tag; any record with
//! a non-blank `error` fails it.

use crate::error::{PublishError, Result};
use crate::output::OutputManager;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAux {
    #[serde(rename = "Tag", alias = "tag", default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(rename = "Digest", alias = "digest", default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(rename = "Size", alias = "size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// One record of the push status stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushStatusRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_detail: Option<ProgressDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux: Option<PushAux>,
}

impl PushStatusRecord {
    /// Message for a fatal record, `None` when the record is not an error.
    pub fn failure(&self) -> Option<String> {
        let error = self.error.as_deref().filter(|e| !e.trim().is_empty())?;
        Some(match &self.error_detail {
            Some(detail) => format!(
                "Code: {}, Message: {}",
                detail.code.as_ref().map(render_code).unwrap_or_default(),
                detail.message.clone().unwrap_or_default()
            ),
            None => error.to_string(),
        })
    }

    pub fn confirms(&self, tag: &str) -> bool {
        self.aux
            .as_ref()
            .and_then(|aux| aux.tag.as_deref())
            .is_some_and(|confirmed| confirmed == tag)
    }
}

fn render_code(code: &serde_json::Value) -> String {
    match code {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Verdict for one pushed tag
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub tag: String,
    pub confirmed: bool,
    pub digest: Option<String>,
    pub size: Option<u64>,
    /// First fatal error reported by the stream
    pub error: Option<String>,
    pub records: usize,
}

impl PushOutcome {
    pub fn into_result(self) -> Result<Self> {
        if let Some(message) = &self.error {
            return Err(PublishError::Protocol(message.clone()));
        }
        if !self.confirmed {
            return Err(PublishError::UnconfirmedPush { tag: self.tag });
        }
        Ok(self)
    }
}

pub struct StatusDecoder {
    output: OutputManager,
}

impl StatusDecoder {
    pub fn new(output: OutputManager) -> Self {
        Self { output }
    }

    /// Decode a buffered status stream for `tag`.
    ///
    /// A malformed record stops decoding with a warning; the records seen so far
    /// still decide the verdict.
    pub fn decode(&self, stream: &[u8], tag: &str) -> PushOutcome {
        let mut outcome = PushOutcome {
            tag: tag.to_string(),
            ..PushOutcome::default()
        };

        let records = serde_json::Deserializer::from_slice(stream).into_iter::<PushStatusRecord>();
        for record in records {
            let record = match record {
                Ok(record) => record,
                Err(e) if e.is_eof() => break,
                Err(e) => {
                    self.output
                        .warning(&format!("Failed to decode push status stream: {}", e));
                    break;
                }
            };
            outcome.records += 1;

            if let Some(message) = record.failure() {
                self.output.error(&message);
                if outcome.error.is_none() {
                    outcome.error = Some(message);
                }
            }

            if record.confirms(tag) {
                if let Some(aux) = &record.aux {
                    outcome.digest = aux.digest.clone();
                    outcome.size = aux.size;
                }
                outcome.confirmed = true;
            }
        }

        self.output.fields(
            "Push status decoded",
            &[
                ("tag", tag.to_string()),
                ("records", outcome.records.to_string()),
                ("confirmed", outcome.confirmed.to_string()),
            ],
        );
        outcome
    }

    pub fn verify(&self, stream: &[u8], tag: &str) -> Result<PushOutcome> {
        self.decode(stream, tag).into_result()
    }
}
