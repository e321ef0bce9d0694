//! Configuration for the intake pipeline
//!
//! Settings load once at startup from a TOML file and can then be overridden
//! field-by-field from the environment. Overrides are driven by an explicit
//! key table: every supported `INTAKE_*` variable is listed in
//! [`OVERRIDES`], and anything prefixed but unlisted (or unparsable) is
//! reported back to the caller instead of being silently dropped.

use crate::record::ExtractionRule;
use crate::{IntakeError, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::info;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "INTAKE_";

/// Main configuration for the intake service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// System name, used in alert subjects and the `$name$` macro
    #[serde(default = "default_name")]
    pub name: String,

    /// Directory watched for new files
    #[serde(default = "default_watch_dir")]
    pub watch_dir: String,

    /// Directory processed files and side files are written to
    #[serde(default = "default_done_dir")]
    pub done_dir: String,

    /// Maximum number of files processed concurrently
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,

    /// Move files to the done directory after processing
    #[serde(default = "default_move_after_processed")]
    pub move_after_processed: bool,

    /// Path substrings that exclude a file from processing
    #[serde(default)]
    pub ignore_list: Vec<String>,

    /// Seconds a new file settles before processing; also the sink's
    /// time-flush window
    #[serde(default = "default_wait_interval")]
    pub wait_interval_secs: u64,

    /// Keep rows whose enrichment produced no usable results
    #[serde(default)]
    pub save_unmatched: bool,

    /// File-name template for the no-match side file
    #[serde(default = "default_unmatched_file")]
    pub unmatched_file: String,

    /// File-name template for the parse-error side file
    #[serde(default = "default_parse_error_file")]
    pub parse_error_file: String,

    /// Skip TLS certificate verification on outbound HTTP
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Liveness alert for the input side (files arriving)
    #[serde(default = "default_input_alert")]
    pub input_alert: AlertConfig,

    /// Liveness alert for the output side (records flushed)
    #[serde(default)]
    pub output_alert: AlertConfig,

    /// Row-grammar options
    #[serde(default)]
    pub csv: CsvConfig,

    /// Enrichment service client
    #[serde(default)]
    pub enricher: EnricherConfig,

    /// Batch sink and bulk index endpoint
    #[serde(default)]
    pub sink: SinkConfig,

    /// Marker-based sub-field extraction rules
    #[serde(default)]
    pub extractions: Vec<ExtractionRule>,

    /// SMTP transport for alert mail
    #[serde(default)]
    pub mail: MailConfig,
}

/// One liveness watchdog's settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Idle seconds before an alert fires; zero or negative disables
    #[serde(default)]
    pub threshold_secs: i64,
    /// Alert recipient address
    #[serde(default)]
    pub recipient: String,
}

/// Row-grammar options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvConfig {
    /// Treat the first row as a header naming the fields
    #[serde(default)]
    pub first_row_header: bool,
    /// 0-based column sent to the enricher; out-of-range sends the whole row
    #[serde(default)]
    pub capture_column: usize,
}

/// Enrichment service client settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnricherConfig {
    /// Enrich records before sinking them
    #[serde(default)]
    pub enabled: bool,
    /// Service base URL
    #[serde(default)]
    pub url: String,
    /// Query string appended verbatim to the URL
    #[serde(default)]
    pub query: String,
}

/// Batch sink settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Hand batches to the bulk index endpoint
    #[serde(default)]
    pub enabled: bool,
    /// Index endpoint base URL
    #[serde(default)]
    pub url: String,
    /// Index name prefix; the write date is appended per `date_mask`
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
    /// chrono strftime mask rendering the write date into the index name
    #[serde(default = "default_date_mask")]
    pub date_mask: String,
    /// Basic-auth user; empty disables auth
    #[serde(default)]
    pub username: String,
    /// Basic-auth password
    #[serde(default)]
    pub password: String,
    /// Buffered records that trigger a size flush
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Seconds the flushing submit sleeps after a flush
    #[serde(default)]
    pub throttle_secs: u64,
}

/// SMTP settings for alert mail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailConfig {
    /// Sender address
    #[serde(default)]
    pub from: String,
    /// SMTP server host
    #[serde(default)]
    pub server: String,
    /// SMTP server port
    #[serde(default = "default_mail_port")]
    pub port: u16,
    /// SMTP user; empty disables authentication
    #[serde(default)]
    pub username: String,
    /// SMTP password
    #[serde(default)]
    pub password: String,
}

fn default_name() -> String {
    "intake".to_string()
}

fn default_watch_dir() -> String {
    "./watch".to_string()
}

fn default_done_dir() -> String {
    "./done".to_string()
}

fn default_max_concurrent_files() -> usize {
    3
}

fn default_move_after_processed() -> bool {
    true
}

fn default_wait_interval() -> u64 {
    30
}

fn default_unmatched_file() -> String {
    "unmatched_$date$.csv".to_string()
}

fn default_parse_error_file() -> String {
    "parse_errors_$date$.ndjson".to_string()
}

fn default_input_alert() -> AlertConfig {
    AlertConfig {
        threshold_secs: -1,
        recipient: String::new(),
    }
}

fn default_index_prefix() -> String {
    "intake-".to_string()
}

fn default_date_mask() -> String {
    "%Y%m%d".to_string()
}

fn default_queue_size() -> usize {
    100
}

fn default_mail_port() -> u16 {
    25
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            watch_dir: default_watch_dir(),
            done_dir: default_done_dir(),
            max_concurrent_files: default_max_concurrent_files(),
            move_after_processed: default_move_after_processed(),
            ignore_list: Vec::new(),
            wait_interval_secs: default_wait_interval(),
            save_unmatched: false,
            unmatched_file: default_unmatched_file(),
            parse_error_file: default_parse_error_file(),
            accept_invalid_certs: false,
            input_alert: default_input_alert(),
            output_alert: AlertConfig::default(),
            csv: CsvConfig::default(),
            enricher: EnricherConfig::default(),
            sink: SinkConfig::default(),
            extractions: Vec::new(),
            mail: MailConfig::default(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            index_prefix: default_index_prefix(),
            date_mask: default_date_mask(),
            username: String::new(),
            password: String::new(),
            queue_size: default_queue_size(),
            throttle_secs: 0,
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            from: String::new(),
            server: String::new(),
            port: default_mail_port(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| IntakeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, writing and returning defaults when the file is
    /// missing
    pub fn load_or_init(path: &Path) -> Result<Self> {
        match std::fs::metadata(path) {
            Ok(_) => Self::load(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Config::default();
                config.save(path)?;
                info!(path = %path.display(), "wrote default configuration");
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| IntakeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !mask_is_valid(&self.sink.date_mask) {
            return Err(IntakeError::Config(format!(
                "invalid sink date mask: {}",
                self.sink.date_mask
            )));
        }
        Ok(())
    }

    /// Whether a path matches any ignore-list substring (case-sensitive)
    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignore_list.iter().any(|needle| path.contains(needle.as_str()))
    }

    /// Expand `$date$`, `$time$` and `$name$` in a file-name template
    pub fn expand_name_template(&self, template: &str) -> String {
        let now = Local::now();
        template
            .replace("$date$", &now.format("%Y-%m-%d").to_string())
            .replace("$time$", &now.format("%H%M%S").to_string())
            .replace("$name$", &self.name)
    }

    /// Parse-error side file name for the current instant
    pub fn parse_error_file_name(&self) -> String {
        self.expand_name_template(&self.parse_error_file)
    }

    /// No-match side file name for the current instant
    pub fn unmatched_file_name(&self) -> String {
        self.expand_name_template(&self.unmatched_file)
    }
}

fn mask_is_valid(mask: &str) -> bool {
    StrftimeItems::new(mask).all(|item| !matches!(item, Item::Error))
}

// ============================================================================
// Environment Overrides
// ============================================================================

/// A rejected environment override
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideIssue {
    /// Key carries the prefix but names no known setting
    UnknownKey { key: String },
    /// Value failed to parse for the setting's type
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl fmt::Display for OverrideIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverrideIssue::UnknownKey { key } => write!(f, "unknown setting {key}"),
            OverrideIssue::InvalidValue { key, value, reason } => {
                write!(f, "invalid value {value:?} for {key}: {reason}")
            }
        }
    }
}

type Setter = fn(&mut Config, &str) -> std::result::Result<(), String>;

fn parse<T>(value: &str) -> std::result::Result<T, String>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| e.to_string())
}

fn parse_bool(value: &str) -> std::result::Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" => Ok(true),
        "0" | "false" | "f" | "no" => Ok(false),
        other => Err(format!("not a boolean: {other}")),
    }
}

/// Every supported override, one entry per settable field
static OVERRIDES: &[(&str, Setter)] = &[
    ("INTAKE_NAME", |c, v| {
        c.name = v.to_string();
        Ok(())
    }),
    ("INTAKE_WATCH_DIR", |c, v| {
        c.watch_dir = v.to_string();
        Ok(())
    }),
    ("INTAKE_DONE_DIR", |c, v| {
        c.done_dir = v.to_string();
        Ok(())
    }),
    ("INTAKE_MAX_CONCURRENT_FILES", |c, v| {
        c.max_concurrent_files = parse(v)?;
        Ok(())
    }),
    ("INTAKE_MOVE_AFTER_PROCESSED", |c, v| {
        c.move_after_processed = parse_bool(v)?;
        Ok(())
    }),
    ("INTAKE_IGNORE_LIST", |c, v| {
        c.ignore_list = v.split('|').map(str::to_string).collect();
        Ok(())
    }),
    ("INTAKE_WAIT_INTERVAL_SECS", |c, v| {
        c.wait_interval_secs = parse(v)?;
        Ok(())
    }),
    ("INTAKE_SAVE_UNMATCHED", |c, v| {
        c.save_unmatched = parse_bool(v)?;
        Ok(())
    }),
    ("INTAKE_UNMATCHED_FILE", |c, v| {
        c.unmatched_file = v.to_string();
        Ok(())
    }),
    ("INTAKE_PARSE_ERROR_FILE", |c, v| {
        c.parse_error_file = v.to_string();
        Ok(())
    }),
    ("INTAKE_ACCEPT_INVALID_CERTS", |c, v| {
        c.accept_invalid_certs = parse_bool(v)?;
        Ok(())
    }),
    ("INTAKE_INPUT_ALERT_THRESHOLD_SECS", |c, v| {
        c.input_alert.threshold_secs = parse(v)?;
        Ok(())
    }),
    ("INTAKE_INPUT_ALERT_RECIPIENT", |c, v| {
        c.input_alert.recipient = v.to_string();
        Ok(())
    }),
    ("INTAKE_OUTPUT_ALERT_THRESHOLD_SECS", |c, v| {
        c.output_alert.threshold_secs = parse(v)?;
        Ok(())
    }),
    ("INTAKE_OUTPUT_ALERT_RECIPIENT", |c, v| {
        c.output_alert.recipient = v.to_string();
        Ok(())
    }),
    ("INTAKE_CSV_FIRST_ROW_HEADER", |c, v| {
        c.csv.first_row_header = parse_bool(v)?;
        Ok(())
    }),
    ("INTAKE_CSV_CAPTURE_COLUMN", |c, v| {
        c.csv.capture_column = parse(v)?;
        Ok(())
    }),
    ("INTAKE_ENRICHER_ENABLED", |c, v| {
        c.enricher.enabled = parse_bool(v)?;
        Ok(())
    }),
    ("INTAKE_ENRICHER_URL", |c, v| {
        c.enricher.url = v.to_string();
        Ok(())
    }),
    ("INTAKE_ENRICHER_QUERY", |c, v| {
        c.enricher.query = v.to_string();
        Ok(())
    }),
    ("INTAKE_SINK_ENABLED", |c, v| {
        c.sink.enabled = parse_bool(v)?;
        Ok(())
    }),
    ("INTAKE_SINK_URL", |c, v| {
        c.sink.url = v.to_string();
        Ok(())
    }),
    ("INTAKE_SINK_INDEX_PREFIX", |c, v| {
        c.sink.index_prefix = v.to_string();
        Ok(())
    }),
    ("INTAKE_SINK_DATE_MASK", |c, v| {
        if !mask_is_valid(v) {
            return Err("not a valid strftime mask".to_string());
        }
        c.sink.date_mask = v.to_string();
        Ok(())
    }),
    ("INTAKE_SINK_USERNAME", |c, v| {
        c.sink.username = v.to_string();
        Ok(())
    }),
    ("INTAKE_SINK_PASSWORD", |c, v| {
        c.sink.password = v.to_string();
        Ok(())
    }),
    ("INTAKE_SINK_QUEUE_SIZE", |c, v| {
        c.sink.queue_size = parse(v)?;
        Ok(())
    }),
    ("INTAKE_SINK_THROTTLE_SECS", |c, v| {
        c.sink.throttle_secs = parse(v)?;
        Ok(())
    }),
    ("INTAKE_MAIL_FROM", |c, v| {
        c.mail.from = v.to_string();
        Ok(())
    }),
    ("INTAKE_MAIL_SERVER", |c, v| {
        c.mail.server = v.to_string();
        Ok(())
    }),
    ("INTAKE_MAIL_PORT", |c, v| {
        c.mail.port = parse(v)?;
        Ok(())
    }),
    ("INTAKE_MAIL_USERNAME", |c, v| {
        c.mail.username = v.to_string();
        Ok(())
    }),
    ("INTAKE_MAIL_PASSWORD", |c, v| {
        c.mail.password = v.to_string();
        Ok(())
    }),
];

/// Apply `INTAKE_*` overrides from the process environment
pub fn apply_env_overrides(config: &mut Config) -> Vec<OverrideIssue> {
    apply_overrides(config, std::env::vars())
}

/// Apply overrides from explicit key/value pairs
///
/// Keys without the prefix are skipped. Prefixed keys either match a table
/// entry (and are applied, empty values included) or come back as issues.
pub fn apply_overrides<I>(config: &mut Config, vars: I) -> Vec<OverrideIssue>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut issues = Vec::new();
    for (key, value) in vars {
        if !key.starts_with(ENV_PREFIX) {
            continue;
        }
        match OVERRIDES.iter().find(|(name, _)| *name == key) {
            Some((_, set)) => {
                if let Err(reason) = set(config, &value) {
                    issues.push(OverrideIssue::InvalidValue { key, value, reason });
                }
            }
            None => issues.push(OverrideIssue::UnknownKey { key }),
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_files, 3);
        assert_eq!(config.wait_interval_secs, 30);
        assert!(config.move_after_processed);
        assert_eq!(config.input_alert.threshold_secs, -1);
        assert_eq!(config.output_alert.threshold_secs, 0);
        assert_eq!(config.sink.queue_size, 100);
        assert_eq!(config.sink.date_mask, "%Y%m%d");
        assert!(!config.enricher.enabled);
    }

    #[test]
    fn test_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("intake.toml");

        let mut config = Config::default();
        config.name = "edge-7".to_string();
        config.watch_dir = "/srv/watch".to_string();
        config.ignore_list = vec!["tmp".to_string(), ".partial".to_string()];
        config.csv.first_row_header = true;
        config.csv.capture_column = 4;
        config.enricher = EnricherConfig {
            enabled: true,
            url: "https://scorer.local:7000".to_string(),
            query: "?all=true".to_string(),
        };
        config.sink.enabled = true;
        config.sink.url = "https://index.local:9200".to_string();
        config.sink.username = "writer".to_string();
        config.sink.queue_size = 250;
        config.extractions = vec![ExtractionRule {
            name: "session".to_string(),
            start: "sid=".to_string(),
            end: ";".to_string(),
        }];
        config.mail.server = "smtp.local".to_string();
        config.save(&path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_load_or_init_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("intake.toml");

        let config = Config::load_or_init(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
        // Second call round-trips the file it just wrote.
        assert_eq!(Config::load_or_init(&path).unwrap(), config);
    }

    #[test]
    fn test_env_override_precedence() {
        let mut config = Config::default();
        config.wait_interval_secs = 30;
        config.csv.capture_column = 2;
        config.enricher.query = "?stored=1".to_string();
        config.sink.password = "file-secret".to_string();

        let issues = apply_overrides(
            &mut config,
            pairs(&[
                ("INTAKE_WAIT_INTERVAL_SECS", "13"),
                ("INTAKE_CSV_CAPTURE_COLUMN", "10"),
                ("INTAKE_ENRICHER_QUERY", "?env=1"),
                ("INTAKE_SINK_PASSWORD", ""),
                ("HOME", "/root"),
            ]),
        );

        assert!(issues.is_empty());
        assert_eq!(config.wait_interval_secs, 13);
        assert_eq!(config.csv.capture_column, 10);
        assert_eq!(config.enricher.query, "?env=1");
        // Empty values still apply.
        assert_eq!(config.sink.password, "");
    }

    #[test]
    fn test_env_override_ignore_list_splits_on_pipe() {
        let mut config = Config::default();
        let issues = apply_overrides(
            &mut config,
            pairs(&[("INTAKE_IGNORE_LIST", "tmp|.partial|nightly")]),
        );
        assert!(issues.is_empty());
        assert_eq!(config.ignore_list, vec!["tmp", ".partial", "nightly"]);
    }

    #[test]
    fn test_env_override_unknown_key_reported() {
        let mut config = Config::default();
        let issues = apply_overrides(&mut config, pairs(&[("INTAKE_WAIT_INTERVAL", "5")]));
        assert_eq!(
            issues,
            vec![OverrideIssue::UnknownKey {
                key: "INTAKE_WAIT_INTERVAL".to_string()
            }]
        );
        // The near-miss did not touch the real setting.
        assert_eq!(config.wait_interval_secs, 30);
    }

    #[test]
    fn test_env_override_invalid_value_reported_and_skipped() {
        let mut config = Config::default();
        let issues = apply_overrides(
            &mut config,
            pairs(&[("INTAKE_MAX_CONCURRENT_FILES", "many")]),
        );
        assert_eq!(issues.len(), 1);
        assert!(matches!(
            &issues[0],
            OverrideIssue::InvalidValue { key, .. } if key == "INTAKE_MAX_CONCURRENT_FILES"
        ));
        assert_eq!(config.max_concurrent_files, 3);
    }

    #[test]
    fn test_env_override_rejects_bad_date_mask() {
        let mut config = Config::default();
        let issues = apply_overrides(&mut config, pairs(&[("INTAKE_SINK_DATE_MASK", "%Q%Q")]));
        assert_eq!(issues.len(), 1);
        assert_eq!(config.sink.date_mask, "%Y%m%d");
    }

    #[test]
    fn test_ignore_list_matching() {
        let mut config = Config::default();
        assert!(!config.is_ignored("/watch/anything.csv"));

        config.ignore_list = vec![
            "IgnoreMe".to_string(),
            " ".to_string(),
            "♬".to_string(),
        ];
        assert!(config.is_ignored("/watch/IgnoreMe_20190101.csv"));
        assert!(config.is_ignored("/watch/with space.csv"));
        assert!(config.is_ignored("/watch/♬-notes.csv"));
        // Substring match is case-sensitive.
        assert!(!config.is_ignored("/watch/ignoreme.csv"));
        assert!(!config.is_ignored("/watch/clean_20190101.csv"));
    }

    #[test]
    fn test_name_template_macros() {
        let mut config = Config::default();
        config.name = "edge-7".to_string();

        let before = Local::now();
        let expanded = config.expand_name_template("$name$_$date$_$time$.csv");
        let after = Local::now();

        let want_before = format!("edge-7_{}.csv", before.format("%Y-%m-%d_%H%M%S"));
        let want_after = format!("edge-7_{}.csv", after.format("%Y-%m-%d_%H%M%S"));
        assert!(expanded == want_before || expanded == want_after);

        // Templates without macros pass through untouched.
        assert_eq!(config.expand_name_template("plain.csv"), "plain.csv");
    }

    #[test]
    fn test_invalid_date_mask_fails_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("intake.toml");
        let mut config = Config::default();
        config.sink.date_mask = "%Q".to_string();
        config.save(&path).unwrap();

        assert!(Config::load(&path).is_err());
    }
}
