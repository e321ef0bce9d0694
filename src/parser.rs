//! Streaming row parser
//!
//! Turns raw delimited rows into [`ParsedRecord`]s: header-mapped named
//! fields, multi-value splitting for known address columns, the capture
//! value handed to the enricher, and marker extraction over that capture.
//!
//! The row grammar is deliberately forgiving: lenient quoting, flexible
//! field counts, trimmed fields. A row only fails when its bytes are not
//! valid UTF-8, and that failure is isolated to the row.

use crate::config::CsvConfig;
use crate::record::{apply_extractions, ExtractionRule, FieldValue, ParseErrorRecord, ParsedRecord};
use csv::StringRecord;

/// Header names whose values may hold several space-separated entries
const MULTI_VALUE_HEADERS: &[&str] = &["dest_ip", "dest_port", "src_ip"];

/// File-level context stamped onto every record of one file
#[derive(Debug, Clone)]
pub struct FileContext {
    /// Name of the file being parsed, without its directory
    pub file_name: String,
    /// Tag from the file-name convention
    pub tag: String,
    /// Timestamp from the file-name convention
    pub timestamp: Option<String>,
}

/// Disposition of a failed row read
#[derive(Debug)]
pub enum RowError {
    /// Captured for the parse-error side file; parsing continues
    Recorded(ParseErrorRecord),
    /// Tolerated row-shape variance; parsing continues
    Tolerated,
    /// The reader cannot make progress; the file loop stops
    Fatal,
}

/// Row-to-record parser for one file format configuration
pub struct RecordParser {
    first_row_header: bool,
    capture_column: usize,
    rules: Vec<ExtractionRule>,
}

impl RecordParser {
    pub fn new(csv: &CsvConfig, rules: &[ExtractionRule]) -> Self {
        Self {
            first_row_header: csv.first_row_header,
            capture_column: csv.capture_column,
            rules: rules.to_vec(),
        }
    }

    /// Whether the first row of each file names the fields
    pub fn first_row_header(&self) -> bool {
        self.first_row_header
    }

    /// Reader configured with the pipeline's row grammar
    pub fn reader<R: std::io::Read>(input: R) -> csv::Reader<R> {
        csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(input)
    }

    /// Parse one row into a record plus its capture value
    ///
    /// Named fields are assigned only when the header count matches the row's
    /// field count exactly; metadata and extraction apply regardless.
    pub fn parse_row(
        &self,
        ctx: &FileContext,
        line: u64,
        headers: &[String],
        row: &StringRecord,
    ) -> (ParsedRecord, String) {
        let mut record = ParsedRecord::new(&ctx.file_name, line, &ctx.tag, ctx.timestamp.clone());

        if !headers.is_empty() && headers.len() == row.len() {
            for (name, value) in headers.iter().zip(row.iter()) {
                let field = if MULTI_VALUE_HEADERS.contains(&name.as_str()) && value.contains(' ')
                {
                    FieldValue::List(value.split(' ').map(str::to_string).collect())
                } else {
                    FieldValue::Text(value.to_string())
                };
                record.fields.insert(name.clone(), field);
            }
        }

        let capture = self.capture_value(row);
        apply_extractions(&self.rules, &capture, &mut record.fields);
        (record, capture)
    }

    /// Capture value for a row: the configured column when strictly within
    /// the row's field count, the whole row joined by commas otherwise
    fn capture_value(&self, row: &StringRecord) -> String {
        match row.get(self.capture_column) {
            Some(value) => value.to_string(),
            None => row.iter().collect::<Vec<_>>().join(","),
        }
    }

    /// Classify a row read error
    pub fn classify_error(file: &str, line: u64, err: &csv::Error) -> RowError {
        match err.kind() {
            csv::ErrorKind::Utf8 { err: utf8, .. } => RowError::Recorded(ParseErrorRecord {
                file: file.to_string(),
                line,
                column: utf8.field() as u64,
                message: err.to_string(),
            }),
            // Flexible mode does not raise these; tolerate if one surfaces.
            csv::ErrorKind::UnequalLengths { .. } => RowError::Tolerated,
            _ => RowError::Fatal,
        }
    }
}
