//! End-to-end tests for the intake pipeline
//!
//! These drive real files through the processor and watcher against mock
//! network endpoints: a canned enrichment service and a recording bulk
//! index. Only the SMTP side stays out; watchdog alerting is covered by
//! unit tests with a mock notifier.

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use tempfile::TempDir;

use intake::alert::ActivityTracker;
use intake::config::Config;
use intake::enrich::EnrichClient;
use intake::pool::WorkerPool;
use intake::processor::FileProcessor;
use intake::record::{FieldValue, ParsedRecord};
use intake::sink::{BatchSink, BulkIndexer, SinkWriter};
use intake::watcher::Watcher;

// ============================================================================
// Test Environment
// ============================================================================

/// Temp watch and done directories for one test
struct TestEnv {
    _temp: TempDir,
    watch_dir: PathBuf,
    done_dir: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let watch_dir = temp.path().join("watch");
        let done_dir = temp.path().join("done");
        fs::create_dir_all(&watch_dir).expect("Failed to create watch dir");
        fs::create_dir_all(&done_dir).expect("Failed to create done dir");
        Self {
            _temp: temp,
            watch_dir,
            done_dir,
        }
    }

    fn config(&self) -> Config {
        let mut config = Config::default();
        config.watch_dir = self.watch_dir.to_string_lossy().into_owned();
        config.done_dir = self.done_dir.to_string_lossy().into_owned();
        config.wait_interval_secs = 0;
        config
    }

    fn write_file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.watch_dir.join(name);
        fs::write(&path, content).expect("Failed to write file");
        path
    }
}

/// Sink writer that records every batch it is handed
#[derive(Default)]
struct RecordingWriter {
    batches: Mutex<Vec<Vec<ParsedRecord>>>,
}

impl RecordingWriter {
    fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|r| r.file_name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl SinkWriter for RecordingWriter {
    async fn write_batch(&self, _index: &str, records: &[ParsedRecord]) -> anyhow::Result<()> {
        self.batches.lock().unwrap().push(records.to_vec());
        Ok(())
    }
}

// ============================================================================
// Mock HTTP Server
// ============================================================================

/// Single-response HTTP server recording the request bodies it sees
struct MockServer {
    url: String,
    requests: Arc<Mutex<Vec<String>>>,
    shutdown: Arc<AtomicBool>,
}

impl MockServer {
    fn start(response_body: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}");

        let requests = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            response_body.len(),
            response_body
        );

        let requests_clone = Arc::clone(&requests);
        let shutdown_clone = Arc::clone(&shutdown);
        thread::spawn(move || {
            listener
                .set_nonblocking(true)
                .expect("Cannot set non-blocking");
            while !shutdown_clone.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        stream.set_nonblocking(false).ok();
                        if let Some(body) = read_request(&mut stream) {
                            requests_clone.lock().unwrap().push(body);
                        }
                        let _ = stream.write_all(response.as_bytes());
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            url,
            requests,
            shutdown,
        }
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Read one request off the stream, returning its body
fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut reader = BufReader::new(stream.try_clone().ok()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).ok()?;
        if header == "\r\n" || header.is_empty() {
            break;
        }
        if let Some(rest) = header.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = rest.trim().parse().unwrap_or(0);
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).ok()?;
    Some(String::from_utf8_lossy(&body).into_owned())
}

// ============================================================================
// Processor Tests
// ============================================================================

#[tokio::test]
async fn test_enriched_records_reach_the_bulk_endpoint() {
    let env = TestEnv::new();

    let enricher = MockServer::start(
        r#"[{"result":"10.0.0.1","recipeName":"ip-v4"},{"result":"","recipeName":"filtered-out"},{"result":"443","fieldname":"ports"}]"#,
    );
    let index = MockServer::start(r#"{"took":3,"errors":false}"#);

    let mut config = env.config();
    config.csv.first_row_header = true;
    config.csv.capture_column = 1;
    config.enricher.enabled = true;
    config.enricher.url = enricher.url.clone();
    config.enricher.query = "?all=1".to_string();
    config.sink.enabled = true;
    config.sink.url = index.url.clone();
    let config = Arc::new(config);

    let activity = Arc::new(ActivityTracker::new());
    let indexer = Arc::new(BulkIndexer::new(&config).unwrap());
    let sink = Arc::new(BatchSink::new(&config, indexer, Arc::clone(&activity)));
    let client = EnrichClient::new(&config.enricher, config.accept_invalid_certs).unwrap();
    let processor = FileProcessor::new(Arc::clone(&config), Some(client), Arc::clone(&sink));

    let path = env.write_file("web_20190102.csv", b"src,dst\n10.0.0.9,10.0.0.1\n");
    processor.process(&path).await;
    sink.flush().await;

    // The file moved to the done directory.
    assert!(!path.exists());
    assert!(env.done_dir.join("web_20190102.csv").exists());

    // The enricher saw the capture column.
    assert_eq!(enricher.requests(), vec!["10.0.0.1".to_string()]);

    // One record went out: an action line and a source line.
    let bulk = index.requests();
    assert_eq!(bulk.len(), 1);
    let lines: Vec<&str> = bulk[0].lines().collect();
    assert_eq!(lines.len(), 2);

    let action: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    let expected_index = format!("intake-{}", Local::now().format("%Y%m%d"));
    assert_eq!(action["index"]["_index"], expected_index.as_str());

    let source: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(source["file_name"], "web_20190102.csv");
    assert_eq!(source["line"], 2);
    assert_eq!(source["tag"], "web");
    assert_eq!(source["timestamp"], "20190102");
    assert_eq!(source["src"], "10.0.0.9");
    assert_eq!(source["dst"], "10.0.0.1");
    // Unnamed results feed the aggregates; named ones become fields.
    assert_eq!(source["hits"], serde_json::json!(["10.0.0.1"]));
    assert_eq!(source["recipe_names"], serde_json::json!(["ip-v4"]));
    assert_eq!(source["ports"], serde_json::json!(["443"]));
    assert_eq!(source["enrichments"][0]["recipeName"], "ip-v4");
}

#[tokio::test]
async fn test_malformed_rows_land_in_the_parse_error_file() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.csv.first_row_header = true;
    config.sink.enabled = true;
    config.sink.queue_size = 1;
    let config = Arc::new(config);

    let writer = Arc::new(RecordingWriter::default());
    let activity = Arc::new(ActivityTracker::new());
    let sink = Arc::new(BatchSink::new(
        &config,
        Arc::clone(&writer) as Arc<dyn SinkWriter>,
        activity,
    ));
    let processor = FileProcessor::new(Arc::clone(&config), None, sink);

    let path = env.write_file("fw_20190102.csv", b"ok,fine\n\xff\xfe,bad\nstill,good\n");
    let fullpath = path.display().to_string();
    processor.process(&path).await;

    assert!(env.done_dir.join("fw_20190102.csv").exists());

    let side = env.done_dir.join(config.parse_error_file_name());
    let content = fs::read_to_string(&side).expect("parse error file missing");
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1);

    let entry: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(entry["file"], fullpath.as_str());
    assert_eq!(entry["line"], 2);
    assert_eq!(entry["column"], 0);
    let message = entry["message"].as_str().unwrap().to_ascii_lowercase();
    assert!(message.contains("utf-8"));

    // The surviving data row still reached the sink.
    let batches = writer.batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0].line, 3);
    assert_eq!(batches[0][0].fields["ok"], FieldValue::Text("still".into()));
}

#[tokio::test]
async fn test_unmatched_rows_land_in_the_no_match_file() {
    let env = TestEnv::new();

    // An enricher with nothing to say about any row.
    let enricher = MockServer::start("[]");

    let mut config = env.config();
    config.save_unmatched = true;
    config.enricher.enabled = true;
    config.enricher.url = enricher.url.clone();
    let config = Arc::new(config);

    let writer = Arc::new(RecordingWriter::default());
    let activity = Arc::new(ActivityTracker::new());
    let sink = Arc::new(BatchSink::new(
        &config,
        Arc::clone(&writer) as Arc<dyn SinkWriter>,
        activity,
    ));
    let client = EnrichClient::new(&config.enricher, false).unwrap();
    let processor = FileProcessor::new(Arc::clone(&config), Some(client), Arc::clone(&sink));

    let path = env.write_file("dns_20190102.csv", b"a,b\nc,d\n");
    processor.process(&path).await;
    sink.flush().await;

    assert!(env.done_dir.join("dns_20190102.csv").exists());
    // Nothing matched, so nothing was sunk.
    assert!(writer.batches.lock().unwrap().is_empty());

    let side = env.done_dir.join(config.unmatched_file_name());
    let content = fs::read_to_string(&side).expect("unmatched file missing");
    assert_eq!(content, "a,b\nc,d\n");
}

#[tokio::test]
async fn test_unreachable_enricher_rows_land_in_the_no_match_file() {
    let env = TestEnv::new();

    // A port with no listener behind it: every request is refused.
    let dead_url = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        format!("http://{}", listener.local_addr().unwrap())
    };

    let mut config = env.config();
    config.save_unmatched = true;
    config.enricher.enabled = true;
    config.enricher.url = dead_url;
    let config = Arc::new(config);

    let writer = Arc::new(RecordingWriter::default());
    let activity = Arc::new(ActivityTracker::new());
    let sink = Arc::new(BatchSink::new(
        &config,
        Arc::clone(&writer) as Arc<dyn SinkWriter>,
        activity,
    ));
    let client = EnrichClient::new(&config.enricher, false).unwrap();
    let processor = FileProcessor::new(Arc::clone(&config), Some(client), Arc::clone(&sink));

    let path = env.write_file("dead_20190102.csv", b"a,b\n");
    processor.process(&path).await;
    sink.flush().await;

    // A refused request counts as zero results for its row, not a failed file.
    assert!(env.done_dir.join("dead_20190102.csv").exists());
    assert!(writer.batches.lock().unwrap().is_empty());

    let side = env.done_dir.join(config.unmatched_file_name());
    let content = fs::read_to_string(&side).expect("unmatched file missing");
    assert_eq!(content, "a,b\n");
}

// ============================================================================
// Pipeline Wiring Tests
// ============================================================================

#[tokio::test]
async fn test_sweep_feeds_existing_files_through_the_pool() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.sink.enabled = true;
    config.sink.queue_size = 100;
    let config = Arc::new(config);

    env.write_file("one_20190102.csv", b"a,b\n");
    env.write_file("two_20190102.csv", b"c,d\n");

    let writer = Arc::new(RecordingWriter::default());
    let activity = Arc::new(ActivityTracker::new());
    let sink = Arc::new(BatchSink::new(
        &config,
        Arc::clone(&writer) as Arc<dyn SinkWriter>,
        Arc::clone(&activity),
    ));
    let processor = Arc::new(FileProcessor::new(
        Arc::clone(&config),
        None,
        Arc::clone(&sink),
    ));
    let pool = WorkerPool::start(2, processor);

    let watcher = Watcher::new(
        Arc::clone(&config),
        pool.queue(),
        Arc::clone(&activity),
        Arc::clone(&sink),
    );
    watcher.initial_sweep().await;

    // Dropping the last sender lets shutdown drain the queue.
    drop(watcher);
    pool.shutdown().await;
    sink.flush().await;

    assert!(env.done_dir.join("one_20190102.csv").exists());
    assert!(env.done_dir.join("two_20190102.csv").exists());
    assert_eq!(
        writer.file_names(),
        vec!["one_20190102.csv".to_string(), "two_20190102.csv".to_string()]
    );
}

#[tokio::test]
async fn test_created_file_flows_from_event_to_done() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.sink.enabled = true;
    config.sink.queue_size = 1;
    let config = Arc::new(config);

    let writer = Arc::new(RecordingWriter::default());
    let activity = Arc::new(ActivityTracker::new());
    let sink = Arc::new(BatchSink::new(
        &config,
        Arc::clone(&writer) as Arc<dyn SinkWriter>,
        Arc::clone(&activity),
    ));
    let processor = Arc::new(FileProcessor::new(
        Arc::clone(&config),
        None,
        Arc::clone(&sink),
    ));
    let pool = WorkerPool::start(1, processor);

    let watcher = Watcher::new(
        Arc::clone(&config),
        pool.queue(),
        Arc::clone(&activity),
        Arc::clone(&sink),
    );
    let run = tokio::spawn(async move { watcher.run().await });

    // Give the watch a moment to attach before creating the file.
    tokio::time::sleep(Duration::from_millis(300)).await;
    env.write_file("live_20190102.csv", b"x,y\n");

    let target = env.done_dir.join("live_20190102.csv");
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !target.exists() && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(target.exists(), "file never reached the done directory");
    assert_eq!(writer.file_names(), vec!["live_20190102.csv".to_string()]);
    run.abort();
}
