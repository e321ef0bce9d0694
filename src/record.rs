//! Core record types for the intake pipeline
//!
//! A `ParsedRecord` is one delimited row promoted to a sink document:
//! typed file metadata, named fields from header mapping and marker
//! extraction, and the aggregates produced by enrichment.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// ============================================================================
// Field Values
// ============================================================================

/// Value of one named record field
///
/// Fields are either plain text or a small list (multi-value columns split
/// on spaces, enrichment results split on newlines). Absence of a field is
/// absence of the map key, never a third variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// A single text value
    Text(String),
    /// A list of text values
    List(Vec<String>),
}

impl FieldValue {
    /// The text of a `Text` value, `None` for lists
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::List(_) => None,
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(values: Vec<String>) -> Self {
        FieldValue::List(values)
    }
}

/// Ordered map of named fields on a record
pub type FieldMap = IndexMap<String, FieldValue>;

// ============================================================================
// Records
// ============================================================================

/// One parsed row, as handed to the batch sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedRecord {
    /// Name of the originating file, without its directory
    pub file_name: String,
    /// 1-based record number within the file (the header row counts)
    pub line: u64,
    /// Tag parsed from the file name (empty when the name has no tag)
    pub tag: String,
    /// Timestamp segment parsed from the file name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Combined hit lines from enrichment results without a field name
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hits: Vec<String>,
    /// Recipe names of the enrichment results that carried one
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recipe_names: Vec<String>,
    /// Raw enrichment results without a field name
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub enrichments: Vec<EnrichmentResult>,
    /// Named fields from header mapping and marker extraction
    #[serde(flatten)]
    pub fields: FieldMap,
}

impl ParsedRecord {
    /// New record carrying only file metadata
    pub fn new(file_name: &str, line: u64, tag: &str, timestamp: Option<String>) -> Self {
        Self {
            file_name: file_name.to_string(),
            line,
            tag: tag.to_string(),
            timestamp,
            hits: Vec::new(),
            recipe_names: Vec::new(),
            enrichments: Vec::new(),
            fields: FieldMap::new(),
        }
    }
}

/// One malformed row, as appended to the parse-error side file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseErrorRecord {
    /// Full path of the originating file
    pub file: String,
    /// 1-based record number the error occurred on
    pub line: u64,
    /// 0-based field index of the offending field, when known
    pub column: u64,
    /// Error message from the row grammar
    pub message: String,
}

/// One result returned by the enrichment service
///
/// Wire field names are the service's contract and are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    /// Scored output text (HTML-entity-unescaped before use)
    #[serde(default)]
    pub result: String,
    /// Target field name; result becomes a named list field when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fieldname: Option<String>,
    /// Name of the recipe that produced the result
    #[serde(default, rename = "recipeName", skip_serializing_if = "Option::is_none")]
    pub recipe_name: Option<String>,
}

// ============================================================================
// Marker Extraction
// ============================================================================

/// A marker-based sub-field extraction rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRule {
    /// Field name the extracted text is stored under
    pub name: String,
    /// Start marker; the match ends just before the extracted text
    pub start: String,
    /// End marker; missing means extract to end of input
    pub end: String,
}

/// Apply every extraction rule to `capture`, inserting hits into `fields`
///
/// Each rule reads the original capture value, independent of other rules.
/// Text between the first occurrence of `start` (exclusive) and the next
/// occurrence of `end` after it (exclusive) is stored under the rule's name;
/// a missing end marker extracts through the end of the input, a missing
/// start marker contributes nothing.
pub fn apply_extractions(rules: &[ExtractionRule], capture: &str, fields: &mut FieldMap) {
    for rule in rules {
        if let Some(start_idx) = capture.find(&rule.start) {
            let after = start_idx + rule.start.len();
            let end_idx = match capture[after..].find(&rule.end) {
                Some(rel) => after + rel,
                None => capture.len(),
            };
            fields.insert(
                rule.name.clone(),
                FieldValue::Text(capture[after..end_idx].to_string()),
            );
        }
    }
}
