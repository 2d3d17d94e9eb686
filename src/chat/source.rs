//! Source citations attached to assistant answers.
//!
//! The backend is loose about field names: the document label may arrive as
//! `source_file`, `source` or `filename`, and the relevance score may be a
//! fraction or a percentage. Everything is normalized here, once, at the
//! boundary; the rest of the crate only sees [`Source`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Label used when a record names no document at all.
const DEFAULT_LABEL: &str = "source";

/// A normalized citation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSource")]
pub struct Source {
    /// Document label (usually a file name).
    pub label: String,
    /// Relevance as a fraction in `0.0..=1.0`, if the backend sent one.
    pub score: Option<f64>,
    /// Excerpt of the retrieved passage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

impl Source {
    /// Build a source from already normalized parts.
    #[must_use]
    pub fn new(label: impl Into<String>, score: Option<f64>) -> Self {
        Self {
            label: label.into(),
            score: score.and_then(normalize_score),
            excerpt: None,
        }
    }

    /// Relevance as a rounded percentage, for display.
    #[must_use]
    // Clamped to 0..=1 by construction, so the product fits in u8.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn percent(&self) -> Option<u8> {
        self.score.map(|s| (s * 100.0).round() as u8)
    }
}

/// Wire shape of a source record, with every known alias.
#[derive(Debug, Default, Deserialize)]
struct RawSource {
    source_file: Option<String>,
    source: Option<String>,
    filename: Option<String>,
    label: Option<String>,
    score: Option<Value>,
    text_snippet: Option<String>,
    text: Option<String>,
    snippet: Option<String>,
    excerpt: Option<String>,
}

impl From<RawSource> for Source {
    fn from(raw: RawSource) -> Self {
        // Priority order matters: `source_file` is what the retrieval
        // pipeline writes; the others are legacy metadata keys.
        let label = first_non_empty([raw.source_file, raw.source, raw.filename, raw.label])
            .unwrap_or_else(|| DEFAULT_LABEL.to_string());
        let excerpt = first_non_empty([raw.text_snippet, raw.text, raw.snippet, raw.excerpt]);
        let score = raw.score.as_ref().and_then(Value::as_f64).and_then(normalize_score);
        Self {
            label,
            score,
            excerpt,
        }
    }
}

fn first_non_empty<const N: usize>(candidates: [Option<String>; N]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
}

/// Map a raw score to the canonical `0.0..=1.0` fraction.
///
/// Values above 1 are read as percentages.
fn normalize_score(raw: f64) -> Option<f64> {
    if !raw.is_finite() {
        return None;
    }
    let fraction = if raw > 1.0 { raw / 100.0 } else { raw };
    Some(fraction.clamp(0.0, 1.0))
}

/// Parse a `sources` event payload.
///
/// Returns `None` when the payload is not a JSON array of objects; the caller
/// leaves the message's sources untouched in that case.
#[must_use]
pub fn parse_sources(payload: &str) -> Option<Vec<Source>> {
    match serde_json::from_str::<Vec<Source>>(payload) {
        Ok(sources) => Some(sources),
        Err(err) => {
            tracing::debug!(%err, "ignoring unparsable sources payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_priority_chain() {
        let sources = parse_sources(
            r#"[
                {"source_file":"a.pdf","source":"b","filename":"c"},
                {"source":"b.pdf","filename":"c"},
                {"filename":"c.pdf"},
                {"source_file":"","filename":"d.pdf"},
                {}
            ]"#,
        )
        .unwrap();
        let labels: Vec<&str> = sources.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, ["a.pdf", "b.pdf", "c.pdf", "d.pdf", "source"]);
    }

    #[test]
    fn test_score_normalization() {
        let sources =
            parse_sources(r#"[{"score":0.9},{"score":87.5},{"score":"high"},{"score":-3},{}]"#)
                .unwrap();
        assert_eq!(sources[0].score, Some(0.9));
        assert_eq!(sources[1].score, Some(0.875));
        assert_eq!(sources[2].score, None);
        assert_eq!(sources[3].score, Some(0.0));
        assert_eq!(sources[4].score, None);
        assert_eq!(sources[1].percent(), Some(88));
    }

    #[test]
    fn test_excerpt_aliases() {
        let sources =
            parse_sources(r#"[{"source_file":"x","text_snippet":"Iron intake..."},{"snippet":"Folate"}]"#)
                .unwrap();
        assert_eq!(sources[0].excerpt.as_deref(), Some("Iron intake..."));
        assert_eq!(sources[1].excerpt.as_deref(), Some("Folate"));
    }

    #[test]
    fn test_unparsable_payload_is_none() {
        assert!(parse_sources("not json").is_none());
        assert!(parse_sources(r#"{"source_file":"a"}"#).is_none());
        assert_eq!(parse_sources("[]"), Some(Vec::new()));
    }

    #[test]
    fn test_serialized_form_reads_back() {
        let source = Source::new("guide.pdf", Some(42.0));
        let json = serde_json::to_string(&source).unwrap();
        let back: Source = serde_json::from_str(&json).unwrap();
        assert_eq!(back, source);
        assert_eq!(back.score, Some(0.42));
    }
}
