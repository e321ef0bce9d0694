//! Per-file processing
//!
//! Every queued path runs the same gate sequence: stat, directory skip,
//! ignore list, empty-file removal, open. Surviving files are read row by
//! row, routed through the optional enricher, and handed to the batch sink.
//! A finished file moves to the done directory together with side files for
//! malformed rows and rows the enricher had nothing to say about.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use csv::StringRecord;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::enrich::EnrichClient;
use crate::parser::{FileContext, RecordParser, RowError};
use crate::pool::FileHandler;
use crate::record::{EnrichmentResult, FieldValue, ParseErrorRecord, ParsedRecord};
use crate::sink::BatchSink;

/// Counters and buffers accumulated over one file
#[derive(Debug, Default)]
struct FileOutcome {
    records: u64,
    unmatched: u64,
    parse_errors: Vec<ParseErrorRecord>,
    unmatched_rows: Vec<Vec<String>>,
}

/// Turns one queued file into sink records and side files
///
/// Processing never returns an error: every failure is logged and the file
/// is left where the next gate put it, so one bad file cannot stall the
/// worker that picked it up.
pub struct FileProcessor {
    config: Arc<Config>,
    parser: RecordParser,
    enricher: Option<EnrichClient>,
    sink: Arc<BatchSink>,
}

impl FileProcessor {
    pub fn new(config: Arc<Config>, enricher: Option<EnrichClient>, sink: Arc<BatchSink>) -> Self {
        let parser = RecordParser::new(&config.csv, &config.extractions);
        Self {
            config,
            parser,
            enricher,
            sink,
        }
    }

    /// Run one file through the gates, the row loop, and the finish steps
    pub async fn process(&self, path: &Path) {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not stat file");
                return;
            }
        };
        if meta.is_dir() {
            debug!(path = %path.display(), "skipping directory");
            return;
        }

        let fullpath = path.display().to_string();
        if self.config.is_ignored(&fullpath) {
            info!(path = %fullpath, "ignoring file");
            return;
        }
        if meta.len() == 0 {
            info!(path = %fullpath, "removing empty file");
            if let Err(err) = std::fs::remove_file(path) {
                warn!(path = %fullpath, error = %err, "could not remove empty file");
            }
            return;
        }

        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %fullpath, error = %err, "could not open file, leaving it in place");
                return;
            }
        };
        info!(path = %fullpath, "processing file");

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (tag, timestamp) = parse_file_name(&name);
        let ctx = FileContext {
            file_name: name.clone(),
            tag,
            timestamp,
        };

        // The reader owns the handle; it is closed before the move below.
        let outcome = self.parse_stream(&ctx, &fullpath, file).await;
        self.finish(path, &name, &outcome);
    }

    async fn parse_stream(&self, ctx: &FileContext, fullpath: &str, file: File) -> FileOutcome {
        let mut outcome = FileOutcome::default();
        let mut reader = RecordParser::reader(file);
        let mut row = StringRecord::new();
        let mut headers: Vec<String> = Vec::new();
        let mut line: u64 = 0;

        if self.parser.first_row_header() {
            line += 1;
            match reader.read_record(&mut row) {
                Ok(true) => headers = row.iter().map(str::to_string).collect(),
                Ok(false) => return outcome,
                // Rows still parse, they just get no named fields.
                Err(err) => {
                    warn!(file = %ctx.file_name, error = %err, "could not read header row");
                }
            }
        }

        loop {
            line += 1;
            match reader.read_record(&mut row) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    match RecordParser::classify_error(fullpath, line, &err) {
                        RowError::Recorded(parse_error) => outcome.parse_errors.push(parse_error),
                        RowError::Tolerated => {}
                        RowError::Fatal => {
                            warn!(
                                file = %ctx.file_name,
                                line,
                                error = %err,
                                "could not read record, abandoning file"
                            );
                            break;
                        }
                    }
                    continue;
                }
            }
            self.route_row(ctx, line, &headers, &row, &mut outcome).await;
        }

        outcome
    }

    /// Enrich one parsed row and decide where it goes
    async fn route_row(
        &self,
        ctx: &FileContext,
        line: u64,
        headers: &[String],
        row: &StringRecord,
        outcome: &mut FileOutcome,
    ) {
        let (mut record, capture) = self.parser.parse_row(ctx, line, headers, row);

        let Some(client) = &self.enricher else {
            outcome.records += 1;
            self.sink.submit(record).await;
            return;
        };

        // A failed request counts as zero results, not as a failed file.
        let results = match client.enrich(&capture).await {
            Ok(results) => results,
            Err(err) => {
                warn!(file = %ctx.file_name, line, error = %err, "enrichment request failed");
                Vec::new()
            }
        };

        if results.is_empty() {
            trace!(file = %ctx.file_name, line, "no enrichment results");
            outcome.unmatched += 1;
            if self.config.save_unmatched {
                outcome.unmatched_rows.push(row.iter().map(str::to_string).collect());
            }
            return;
        }

        merge_results(&mut record, results);
        outcome.records += 1;
        self.sink.submit(record).await;
    }

    /// Move the file and write its side files, then log the summary
    fn finish(&self, path: &Path, name: &str, outcome: &FileOutcome) {
        if self.config.move_after_processed {
            if name.is_empty() {
                warn!(path = %path.display(), "file has no name, leaving it in place");
            } else {
                let target = Path::new(&self.config.done_dir).join(name);
                debug!(src = %path.display(), dst = %target.display(), "moving file");
                if let Err(err) = std::fs::rename(path, &target) {
                    warn!(
                        src = %path.display(),
                        dst = %target.display(),
                        error = %err,
                        "could not move file"
                    );
                }
            }
        }

        if !outcome.parse_errors.is_empty() {
            self.write_parse_errors(&outcome.parse_errors);
        }
        if !outcome.unmatched_rows.is_empty() {
            self.write_unmatched(&outcome.unmatched_rows);
        }

        info!(
            path = %path.display(),
            records = outcome.records,
            parse_errors = outcome.parse_errors.len(),
            unmatched = outcome.unmatched,
            "file processing complete"
        );
    }

    /// Append malformed rows to the parse-error side file, one JSON per line
    fn write_parse_errors(&self, errors: &[ParseErrorRecord]) {
        let target = Path::new(&self.config.done_dir).join(self.config.parse_error_file_name());
        let mut lines = String::new();
        for error in errors {
            match serde_json::to_string(error) {
                Ok(json) => {
                    lines.push_str(&json);
                    lines.push('\n');
                }
                Err(err) => warn!(error = %err, "could not serialize parse error"),
            }
        }
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target)
            .and_then(|mut file| file.write_all(lines.as_bytes()));
        if let Err(err) = written {
            warn!(path = %target.display(), error = %err, "could not write parse error file");
        }
    }

    /// Append rows without enrichment results to the no-match side file
    fn write_unmatched(&self, rows: &[Vec<String>]) {
        let target = Path::new(&self.config.done_dir).join(self.config.unmatched_file_name());
        let file = match OpenOptions::new().create(true).append(true).open(&target) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %target.display(), error = %err, "could not open unmatched row file");
                return;
            }
        };
        let mut writer = csv::Writer::from_writer(file);
        for row in rows {
            if let Err(err) = writer.write_record(row) {
                warn!(path = %target.display(), error = %err, "could not write unmatched row");
                return;
            }
        }
        if let Err(err) = writer.flush() {
            warn!(path = %target.display(), error = %err, "could not flush unmatched row file");
        }
    }
}

#[async_trait]
impl FileHandler for FileProcessor {
    async fn handle(&self, path: PathBuf) {
        self.process(&path).await;
    }
}

/// Tag and timestamp from a `tag_timestamp.ext` file name
///
/// Without an underscore both stay absent. The timestamp is the text between
/// the first underscore and the next underscore or dot.
fn parse_file_name(name: &str) -> (String, Option<String>) {
    let Some((tag, rest)) = name.split_once('_') else {
        return (String::new(), None);
    };
    let stamp = rest.split(['_', '.']).next().unwrap_or_default();
    let timestamp = (!stamp.is_empty()).then(|| stamp.to_string());
    (tag.to_string(), timestamp)
}

/// Fold enrichment results into a record
///
/// A result naming a target field becomes a named list field, its value
/// split on newlines. Everything else lands in the aggregates: hit lines,
/// recipe names, and the raw results themselves.
fn merge_results(record: &mut ParsedRecord, results: Vec<EnrichmentResult>) {
    for result in results {
        match result.fieldname.as_deref() {
            Some(field) if !field.is_empty() => {
                let values = result.result.split('\n').map(str::to_string).collect();
                record.fields.insert(field.to_string(), FieldValue::List(values));
            }
            _ => {
                record.hits.extend(result.result.split('\n').map(str::to_string));
                if let Some(name) = result.recipe_name.as_deref() {
                    if !name.is_empty() {
                        record.recipe_names.push(name.to_string());
                    }
                }
                record.enrichments.push(result);
            }
        }
    }
}
