//! Cycle tests driven entirely by in-memory fakes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use digest_common::clock::FixedClock;
use digest_common::error::DigestError;
use digest_common::types::{
    DeliveryReport, DeliveryStatus, Query, QueryJob, Record, ResultSet, RunStatus, Service,
    Subscriber,
};
use digest_common::value::Value;
use digest_engine::{ChangeDetector, CycleOutcome, DigestProcessor, DigestStore};
use digest_fetcher::ResultSource;
use digest_notifier::{Dispatcher, Mailer};

/// Ordered log of side effects shared by the fakes.
type Events = Arc<Mutex<Vec<String>>>;

struct MemoryStore {
    jobs: Mutex<HashMap<i64, QueryJob>>,
    subscribers: Vec<Subscriber>,
    deliveries: Mutex<Vec<(Uuid, DeliveryReport)>>,
    events: Events,
}

impl MemoryStore {
    fn new(job: QueryJob, subscribers: Vec<Subscriber>, events: Events) -> Self {
        let mut jobs = HashMap::new();
        jobs.insert(job.query.id, job);
        Self {
            jobs: Mutex::new(jobs),
            subscribers,
            deliveries: Mutex::new(Vec::new()),
            events,
        }
    }

    fn query(&self, id: i64) -> Query {
        self.jobs.lock().unwrap()[&id].query.clone()
    }

    fn job(&self, id: i64) -> QueryJob {
        self.jobs.lock().unwrap()[&id].clone()
    }
}

#[async_trait]
impl DigestStore for MemoryStore {
    async fn active_queries(&self) -> Result<Vec<QueryJob>, DigestError> {
        Ok(self.jobs.lock().unwrap().values().cloned().collect())
    }

    async fn load_query(&self, query_id: i64) -> Result<Option<QueryJob>, DigestError> {
        Ok(self.jobs.lock().unwrap().get(&query_id).cloned())
    }

    async fn subscribers(&self, query_id: i64) -> Result<Vec<Subscriber>, DigestError> {
        Ok(self
            .subscribers
            .iter()
            .filter(|s| s.query_id == query_id)
            .cloned()
            .collect())
    }

    async fn record_snapshot(
        &self,
        query_id: i64,
        expected_version: i64,
        snapshot: &ResultSet,
        status: RunStatus,
        error: Option<&str>,
        ran_at: DateTime<Utc>,
    ) -> Result<bool, DigestError> {
        let mut jobs = self.jobs.lock().unwrap();
        let query = &mut jobs.get_mut(&query_id).unwrap().query;
        if query.snapshot_version != expected_version {
            return Ok(false);
        }
        query.snapshot = Some(serde_json::to_value(snapshot).unwrap());
        query.snapshot_version += 1;
        query.last_run_at = Some(ran_at);
        query.last_status = Some(status);
        query.last_error = error.map(str::to_string);
        self.events.lock().unwrap().push(format!("snapshot:{}", status));
        Ok(true)
    }

    async fn record_failure(
        &self,
        query_id: i64,
        error: &DigestError,
        ran_at: DateTime<Utc>,
    ) -> Result<(), DigestError> {
        let mut jobs = self.jobs.lock().unwrap();
        let query = &mut jobs.get_mut(&query_id).unwrap().query;
        query.last_run_at = Some(ran_at);
        query.last_status = Some(RunStatus::from_error(error));
        query.last_error = Some(error.to_string());
        self.events.lock().unwrap().push("failure".to_string());
        Ok(())
    }

    async fn log_deliveries(
        &self,
        _query_id: i64,
        run_id: Uuid,
        report: &DeliveryReport,
        _at: DateTime<Utc>,
    ) -> Result<(), DigestError> {
        self.deliveries
            .lock()
            .unwrap()
            .push((run_id, report.clone()));
        self.events.lock().unwrap().push("deliveries".to_string());
        Ok(())
    }
}

/// Serves queued responses, repeating the last one if it is a result set.
struct ScriptedSource {
    responses: Mutex<VecDeque<Result<ResultSet, DigestError>>>,
    calls: Mutex<usize>,
}

impl ScriptedSource {
    fn new(responses: Vec<Result<ResultSet, DigestError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(0),
        }
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ResultSource for ScriptedSource {
    async fn fetch(
        &self,
        _service: &Service,
        _query: &Query,
        _now: DateTime<Utc>,
    ) -> Result<ResultSet, DigestError> {
        *self.calls.lock().unwrap() += 1;
        let mut responses = self.responses.lock().unwrap();
        if responses.len() == 1
            && let Some(Ok(rs)) = responses.front()
        {
            return Ok(rs.clone());
        }
        responses.pop_front().unwrap_or_else(|| {
            Err(DigestError::Fetch {
                status: None,
                message: "no response scripted".to_string(),
            })
        })
    }
}

struct RecordingMailer {
    failing: Vec<String>,
    events: Events,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(
        &self,
        recipient: &str,
        _subject: &str,
        _html_body: &str,
    ) -> Result<(), DigestError> {
        self.events.lock().unwrap().push(format!("send:{}", recipient));
        if self.failing.iter().any(|f| f == recipient) {
            return Err(DigestError::Delivery("rejected".to_string()));
        }
        Ok(())
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 10, 6, 0, 0).unwrap()
}

fn rows(codes: &[&str]) -> ResultSet {
    let records = codes
        .iter()
        .enumerate()
        .map(|(i, code)| {
            let mut r = Record::new();
            r.insert("cartodb_id".to_string(), Value::from(i as i64));
            r.insert("text_general_code".to_string(), Value::from(*code));
            r
        })
        .collect();
    ResultSet::new("rows", records)
}

fn job(snapshot: Option<&ResultSet>) -> QueryJob {
    QueryJob {
        service: Service {
            id: 1,
            name: "Crime incidents".to_string(),
            slug: "crime-incidents".to_string(),
            endpoint: r"https://phl\.carto\.com/api/v2/sql\?q=.+".to_string(),
            subject_template: "{{data.total_rows}} crimes".to_string(),
            body_template: "<ul>{{#each data.rows}}<li>{{text_general_code}}</li>{{/each}}</ul>"
                .to_string(),
        },
        query: Query {
            id: 42,
            service_id: 1,
            url: "https://phl.carto.com/api/v2/sql?q=SELECT 1".to_string(),
            snapshot: snapshot.map(|s| serde_json::to_value(s).unwrap()),
            snapshot_version: 0,
            last_run_at: None,
            last_status: None,
            last_error: None,
        },
    }
}

fn subscribers(emails: &[&str]) -> Vec<Subscriber> {
    emails
        .iter()
        .enumerate()
        .map(|(i, email)| Subscriber {
            id: i as i64 + 1,
            query_id: 42,
            email: email.to_string(),
        })
        .collect()
}

struct Harness {
    store: Arc<MemoryStore>,
    source: Arc<ScriptedSource>,
    processor: DigestProcessor,
    events: Events,
}

fn harness(
    job: QueryJob,
    subs: Vec<Subscriber>,
    responses: Vec<Result<ResultSet, DigestError>>,
    failing: &[&str],
) -> Harness {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(MemoryStore::new(job, subs, events.clone()));
    let source = Arc::new(ScriptedSource::new(responses));
    let mailer = Arc::new(RecordingMailer {
        failing: failing.iter().map(|s| s.to_string()).collect(),
        events: events.clone(),
    });
    let processor = DigestProcessor::new(
        store.clone(),
        source.clone(),
        Dispatcher::new(mailer, Duration::from_secs(1)),
        Arc::new(FixedClock::new(now())),
    );
    Harness {
        store,
        source,
        processor,
        events,
    }
}

fn sends(events: &Events) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.starts_with("send:"))
        .count()
}

#[tokio::test]
async fn test_identical_result_sends_nothing() {
    let current = rows(&["Thefts"]);
    let h = harness(
        job(Some(&current)),
        subscribers(&["a@example.com"]),
        vec![Ok(current.clone())],
        &[],
    );

    let outcome = h.processor.run_query(&h.store.job(42)).await.unwrap();

    assert_eq!(outcome, CycleOutcome::Unchanged);
    assert_eq!(sends(&h.events), 0);
    let query = h.store.query(42);
    assert_eq!(query.result_snapshot().unwrap(), Some(current));
    assert_eq!(query.last_status, Some(RunStatus::Unchanged));
}

#[tokio::test]
async fn test_first_run_with_empty_result_still_sends() {
    let h = harness(
        job(None),
        subscribers(&["a@example.com"]),
        vec![Ok(rows(&[]))],
        &[],
    );

    let outcome = h.processor.run_query(&h.store.job(42)).await.unwrap();

    match outcome {
        CycleOutcome::Delivered(report) => assert_eq!(report.sent_count(), 1),
        other => panic!("expected Delivered, got {:?}", other),
    }
    assert_eq!(h.store.query(42).result_snapshot().unwrap(), Some(rows(&[])));
}

#[tokio::test]
async fn test_two_subscribers_then_snapshot() {
    let h = harness(
        job(Some(&rows(&["Thefts"]))),
        subscribers(&["a@example.com", "b@example.com"]),
        vec![Ok(rows(&["Thefts", "Burglary"]))],
        &[],
    );

    let outcome = h.processor.run_query(&h.store.job(42)).await.unwrap();

    let CycleOutcome::Delivered(report) = outcome else {
        panic!("expected Delivered");
    };
    assert_eq!(report.len(), 2);
    assert!(report.entries.iter().all(|e| e.status == DeliveryStatus::Sent));

    let events = h.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "send:a@example.com",
            "send:b@example.com",
            "deliveries",
            "snapshot:delivered",
        ]
    );
    assert_eq!(h.store.deliveries.lock().unwrap().len(), 1);
    assert_eq!(h.store.query(42).snapshot_version, 1);
}

#[tokio::test]
async fn test_partial_delivery_is_recorded() {
    let h = harness(
        job(None),
        subscribers(&["a@example.com", "bounce@example.com", "c@example.com"]),
        vec![Ok(rows(&["Thefts"]))],
        &["bounce@example.com"],
    );

    let outcome = h.processor.run_query(&h.store.job(42)).await.unwrap();

    let CycleOutcome::Delivered(report) = outcome else {
        panic!("expected Delivered");
    };
    assert_eq!(report.sent_count(), 2);
    assert_eq!(report.failed_count(), 1);

    let query = h.store.query(42);
    assert_eq!(query.last_status, Some(RunStatus::PartiallyDelivered));
    assert_eq!(query.last_error.as_deref(), Some("1 of 3 deliveries failed"));
}

#[tokio::test]
async fn test_render_failure_drops_digest_but_stores_snapshot() {
    let mut broken = job(None);
    broken.service.body_template = "{{#each data.rows}}<li>{{nope}}</li>{{/each}}".to_string();
    let h = harness(
        broken,
        subscribers(&["a@example.com"]),
        vec![Ok(rows(&["Thefts"]))],
        &[],
    );

    let outcome = h.processor.run_query(&h.store.job(42)).await.unwrap();

    assert!(matches!(outcome, CycleOutcome::RenderFailed(_)));
    assert_eq!(sends(&h.events), 0);
    let query = h.store.query(42);
    assert_eq!(query.last_status, Some(RunStatus::RenderFailed));
    assert_eq!(query.result_snapshot().unwrap(), Some(rows(&["Thefts"])));
}

#[tokio::test]
async fn test_fetch_failure_leaves_snapshot_untouched() {
    let before = rows(&["Thefts"]);
    let h = harness(
        job(Some(&before)),
        subscribers(&["a@example.com"]),
        vec![Err(DigestError::Fetch {
            status: Some(502),
            message: "bad gateway".to_string(),
        })],
        &[],
    );

    let outcome = h.processor.run_query(&h.store.job(42)).await.unwrap();

    assert!(matches!(
        outcome,
        CycleOutcome::Failed {
            kind: "fetch_error",
            ..
        }
    ));
    let query = h.store.query(42);
    assert_eq!(query.snapshot_version, 0);
    assert_eq!(query.result_snapshot().unwrap(), Some(before));
    assert_eq!(query.last_status, Some(RunStatus::FetchError));
    assert!(!query.is_blocked());
    assert_eq!(sends(&h.events), 0);
}

#[tokio::test]
async fn test_failed_fetch_retries_and_delivers_next_time() {
    let h = harness(
        job(Some(&rows(&["Thefts"]))),
        subscribers(&["a@example.com"]),
        vec![
            Err(DigestError::Parse("not json".to_string())),
            Ok(rows(&["Robbery"])),
        ],
        &[],
    );

    let first = h.processor.run_query(&h.store.job(42)).await.unwrap();
    assert!(matches!(first, CycleOutcome::Failed { kind: "parse_error", .. }));

    let second = h.processor.run_query(&h.store.job(42)).await.unwrap();
    assert!(matches!(second, CycleOutcome::Delivered(_)));
    assert_eq!(h.source.calls(), 2);
    assert_eq!(sends(&h.events), 1);
}

#[tokio::test]
async fn test_stale_version_keeps_newer_snapshot() {
    let h = harness(
        job(None),
        subscribers(&["a@example.com"]),
        vec![Ok(rows(&["Thefts"]))],
        &[],
    );

    // Another writer moved the version on after this job was loaded.
    let stale = h.store.job(42);
    h.store
        .record_snapshot(42, 0, &rows(&["Newer"]), RunStatus::Delivered, None, now())
        .await
        .unwrap();

    h.processor.run_query(&stale).await.unwrap();

    let query = h.store.query(42);
    assert_eq!(query.snapshot_version, 1);
    assert_eq!(query.result_snapshot().unwrap(), Some(rows(&["Newer"])));
}

#[tokio::test]
async fn test_identity_fields_suppress_volatile_changes() {
    let mut before = rows(&["Thefts"]);
    before.records[0].insert("fetched_at".to_string(), Value::from("06:00"));
    let mut after = rows(&["Thefts"]);
    after.records[0].insert("fetched_at".to_string(), Value::from("06:15"));

    let h = harness(
        job(Some(&before)),
        subscribers(&["a@example.com"]),
        vec![Ok(after)],
        &[],
    );
    let processor = h.processor.with_change_detector(ChangeDetector::with_identity_fields(vec![
        "cartodb_id".to_string(),
        "text_general_code".to_string(),
    ]));

    let outcome = processor.run_query(&h.store.job(42)).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Unchanged);
    assert_eq!(sends(&h.events), 0);
}

#[tokio::test]
async fn test_run_query_id_unknown_query() {
    let h = harness(job(None), vec![], vec![Ok(rows(&[]))], &[]);
    assert_eq!(h.processor.run_query_id(999).await.unwrap(), None);
    assert_eq!(h.source.calls(), 0);
}
