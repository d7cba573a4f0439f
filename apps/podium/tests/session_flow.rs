//! End-to-end session scenarios: the full client driver running against the
//! in-memory store and a simulated control backend that mutates the store
//! the way the hosted backend does.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use podium_client_core::client::StudentClient;
use podium_client_core::config::Config;
use podium_client_core::session::machine::{UserIntent, View};
use podium_client_core::session::{
    AdvanceSessionRequest, AdvanceSessionResponse, ControlBackend, ReportViolationRequest,
    ReportViolationResponse, ResumeRequest, ResumeResponse, SessionConfig, SessionError,
    SessionManager, paths,
};
use podium_client_core::storage::{KeyValueStorage, MemoryStorage};
use podium_proto::{
    LiveSessionState, QuestionOption, ResultsVisibility, SessionKind, SessionStatus, StudentKey,
};
use serde_json::{Value, json};
use store_bus::{LocalSessionStore, SessionStore, StoreError, StoreEvent, StoreResult};
use tokio::sync::{broadcast, watch};
use url::Url;

const POLL: &str = "poll-e2e";
const EMAIL: &str = "jane@example.com";

/// Control backend that flips the student's status record in the store the
/// way the hosted callable functions do.
struct BackendSim {
    store: Arc<dyn SessionStore>,
    lock_version: Mutex<u64>,
    reports: Mutex<Vec<ReportViolationRequest>>,
}

impl BackendSim {
    fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            lock_version: Mutex::new(0),
            reports: Mutex::new(Vec::new()),
        }
    }

    fn report_count(&self) -> usize {
        self.reports.lock().len()
    }

    fn current_lock_version(&self) -> u64 {
        *self.lock_version.lock()
    }

    fn set_lock_version(&self, version: u64) {
        *self.lock_version.lock() = version;
    }
}

#[async_trait]
impl ControlBackend for BackendSim {
    async fn advance_session(
        &self,
        _base_url: &Url,
        _auth_token: Option<&str>,
        request: &AdvanceSessionRequest,
    ) -> Result<AdvanceSessionResponse, SessionError> {
        let _ = request;
        Ok(AdvanceSessionResponse {
            success: true,
            message: None,
        })
    }

    async fn report_violation(
        &self,
        _base_url: &Url,
        _auth_token: Option<&str>,
        request: &ReportViolationRequest,
    ) -> Result<ReportViolationResponse, SessionError> {
        self.reports.lock().push(request.clone());
        let version = {
            let mut version = self.lock_version.lock();
            *version += 1;
            *version
        };
        let key = StudentKey::derive(&request.poll_id, &request.student_email);
        let path = paths::student_status(&request.poll_id, &key);
        self.store
            .merge_update(
                &path,
                json!({
                    "status": "LOCKED",
                    "lockVersion": version,
                    "lastViolationReason": request.reason,
                }),
            )
            .await
            .map_err(|err| SessionError::Server(err.to_string()))?;
        Ok(ReportViolationResponse {
            success: true,
            lock_version: version,
            message: None,
        })
    }

    async fn confirm_fullscreen_resume(
        &self,
        _base_url: &Url,
        _auth_token: Option<&str>,
        request: &ResumeRequest,
    ) -> Result<ResumeResponse, SessionError> {
        let current = *self.lock_version.lock();
        if request.lock_version != current {
            return Ok(ResumeResponse {
                success: false,
                reason: Some("stale lock version".into()),
            });
        }
        let key = StudentKey::derive(&request.poll_id, &request.student_email);
        let path = paths::student_status(&request.poll_id, &key);
        self.store
            .merge_update(
                &path,
                json!({ "status": "ACTIVE", "lockVersion": current }),
            )
            .await
            .map_err(|err| SessionError::Server(err.to_string()))?;
        Ok(ResumeResponse {
            success: true,
            reason: None,
        })
    }
}

fn session(status: SessionStatus, index: u32, reset: i64, secure: bool) -> LiveSessionState {
    LiveSessionState {
        poll_id: POLL.into(),
        status,
        question_index: index,
        question_text: format!("Question {index}"),
        options: vec![
            QuestionOption::new("A"),
            QuestionOption::new("B"),
            QuestionOption::new("C"),
        ],
        session_kind: if secure {
            SessionKind::SecureAssessment
        } else {
            SessionKind::LivePoll
        },
        results_visibility: ResultsVisibility::Hidden,
        calculator_enabled: false,
        live_proctoring: secure,
        metacognition_enabled: false,
        reset_timestamp: reset,
        result_percentages: None,
        timestamp: 0,
    }
}

async fn push_session(store: &dyn SessionStore, state: &LiveSessionState) {
    store
        .replace(
            &paths::live_session(&state.poll_id),
            serde_json::to_value(state).expect("encode session"),
        )
        .await
        .expect("push session");
}

async fn wait_for_view(views: &mut watch::Receiver<View>, label: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if views.borrow_and_update().label() == label {
                return;
            }
            views.changed().await.expect("view channel open");
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "timed out waiting for view {label}, current {}",
            views.borrow().label()
        )
    });
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.sync_interval = Duration::from_millis(25);
    config.poll_interval_fast = Duration::from_millis(50);
    config.poll_interval_slow = Duration::from_millis(200);
    config.telemetry_flush_interval = Duration::from_millis(50);
    config
}

struct Harness {
    store: Arc<LocalSessionStore>,
    backend: Arc<BackendSim>,
    storage: Arc<dyn KeyValueStorage>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(LocalSessionStore::new());
        let backend = Arc::new(BackendSim::new(store.clone()));
        Self {
            store,
            backend,
            storage: Arc::new(MemoryStorage::new()),
        }
    }

    async fn start_client(&self) -> podium_client_core::client::ClientHandle {
        let control = SessionManager::with_backend(
            SessionConfig::new("http://control.test").expect("config"),
            self.backend.clone(),
        );
        let client = StudentClient::new(
            fast_config(),
            self.store.clone(),
            control,
            self.storage.clone(),
        );
        client.start(POLL, EMAIL).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_poll_join_answer_reveal() {
    let harness = Harness::new();
    push_session(
        harness.store.as_ref(),
        &session(SessionStatus::PreLive, 0, 1, false),
    )
    .await;

    let handle = harness.start_client().await;
    let mut views = handle.views();
    wait_for_view(&mut views, "lobby").await;

    // Teacher opens question 0.
    push_session(
        harness.store.as_ref(),
        &session(SessionStatus::Open, 0, 1, false),
    )
    .await;
    wait_for_view(&mut views, "question_active").await;
    if let View::QuestionActive(question) = views.borrow().clone() {
        assert_eq!(question.options.len(), 3);
    } else {
        panic!("expected question view");
    }

    // Student answers B; the view flips optimistically.
    handle.send_intent(UserIntent::SelectOption(1)).await;
    handle.send_intent(UserIntent::Submit).await;
    wait_for_view(&mut views, "awaiting_next").await;

    // Both halves of the dual write land: private record and public flag.
    let key = StudentKey::derive(POLL, EMAIL);
    let answer = wait_for_value(harness.store.as_ref(), &paths::answer(POLL, 0, &key)).await;
    assert_eq!(answer["answer"], "B");
    let status = wait_for_value(
        harness.store.as_ref(),
        &paths::student_status(POLL, &key),
    )
    .await;
    assert_eq!(status["status"], "SUBMITTED");

    // Teacher reveals results.
    let mut revealed = session(SessionStatus::ResultsRevealed, 0, 1, false);
    revealed.results_visibility = ResultsVisibility::Revealed;
    revealed.result_percentages = Some(
        [("A".to_string(), 20.0), ("B".to_string(), 50.0), ("C".to_string(), 30.0)]
            .into_iter()
            .collect(),
    );
    push_session(harness.store.as_ref(), &revealed).await;
    wait_for_view(&mut views, "results").await;
    if let View::Results(results) = views.borrow().clone() {
        let chosen = results
            .options
            .iter()
            .find(|option| option.chosen)
            .expect("chosen option");
        assert_eq!(chosen.text, "B");
        assert_eq!(chosen.percentage, Some(50.0));
    } else {
        panic!("expected results view");
    }

    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn secure_assessment_lock_and_resume() {
    let harness = Harness::new();
    push_session(
        harness.store.as_ref(),
        &session(SessionStatus::Open, 0, 1, true),
    )
    .await;

    let handle = harness.start_client().await;
    let mut views = handle.views();
    wait_for_view(&mut views, "fullscreen_gate").await;

    handle.send_intent(UserIntent::FullscreenEntered).await;
    wait_for_view(&mut views, "question_active").await;

    // Student leaves fullscreen mid-question: locked, reported once.
    handle.send_intent(UserIntent::FullscreenExited).await;
    wait_for_view(&mut views, "locked").await;
    wait_until(|| harness.backend.report_count() == 1).await;

    // A second violation while locked does not double-report.
    handle.send_intent(UserIntent::TabHidden).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.backend.report_count(), 1);

    // A duplicate question push racing in while locked is discarded.
    push_session(
        harness.store.as_ref(),
        &session(SessionStatus::Open, 0, 1, true),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(views.borrow().label(), "locked");

    // Teacher grants re-entry: status flips with a bumped lock version.
    let key = StudentKey::derive(POLL, EMAIL);
    let granted_version = harness.backend.current_lock_version() + 1;
    harness.backend.set_lock_version(granted_version);
    harness
        .store
        .merge_update(
            &paths::student_status(POLL, &key),
            json!({ "status": "AWAITING_FULLSCREEN", "lockVersion": granted_version }),
        )
        .await
        .expect("grant re-entry");
    wait_for_view(&mut views, "awaiting_fullscreen_resume").await;

    // Student re-enters fullscreen; the resume RPC carries the granted
    // version, the server flips to ACTIVE, and the same question returns.
    handle.send_intent(UserIntent::FullscreenEntered).await;
    wait_for_view(&mut views, "question_active").await;
    if let View::QuestionActive(question) = views.borrow().clone() {
        assert_eq!(question.question_index, 0);
    } else {
        panic!("expected question view");
    }

    handle.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poison_pill_survives_reload() {
    let harness = Harness::new();
    push_session(
        harness.store.as_ref(),
        &session(SessionStatus::Open, 0, 1, true),
    )
    .await;

    let handle = harness.start_client().await;
    let mut views = handle.views();
    wait_for_view(&mut views, "fullscreen_gate").await;
    handle.send_intent(UserIntent::FullscreenEntered).await;
    wait_for_view(&mut views, "question_active").await;
    handle.send_intent(UserIntent::FullscreenExited).await;
    wait_for_view(&mut views, "locked").await;
    handle.shutdown();
    drop(handle);

    // "Reload": a fresh client over the same per-tab storage. The pill is
    // re-applied before any push; the open question in the store must not
    // leak through.
    let reloaded = harness.start_client().await;
    let mut views = reloaded.views();
    wait_for_view(&mut views, "locked").await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(views.borrow().label(), "locked");
    reloaded.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submission_queued_while_offline_syncs_later() {
    let harness = Harness::new();
    let flaky = Arc::new(FlakyStore::new(harness.store.clone()));
    push_session(flaky.as_ref(), &session(SessionStatus::Open, 3, 1, false)).await;

    let control = SessionManager::with_backend(
        SessionConfig::new("http://control.test").expect("config"),
        harness.backend.clone(),
    );
    let client = StudentClient::new(
        fast_config(),
        flaky.clone(),
        control,
        harness.storage.clone(),
    );
    let handle = client.start(POLL, EMAIL).await;
    let mut views = handle.views();
    wait_for_view(&mut views, "question_active").await;

    // Network drops; the student answers anyway.
    flaky.set_writes_failing(true);
    handle.send_intent(UserIntent::SelectOption(2)).await;
    handle.send_intent(UserIntent::Submit).await;

    // Optimistic UI: the view moves on immediately and never reverts.
    wait_for_view(&mut views, "awaiting_next").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(views.borrow().label(), "awaiting_next");
    let key = StudentKey::derive(POLL, EMAIL);
    assert!(
        harness
            .store
            .read_once(&paths::answer(POLL, 3, &key))
            .await
            .expect("read")
            .is_none(),
        "answer must not have reached the store yet"
    );

    // Network recovers; the durable queue drains in the background.
    flaky.set_writes_failing(false);
    let answer = wait_for_value(harness.store.as_ref(), &paths::answer(POLL, 3, &key)).await;
    assert_eq!(answer["answer"], "C");

    handle.shutdown();
}

async fn wait_for_value(store: &dyn SessionStore, path: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(Some(value)) = store.read_once(path).await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for value at {path}"))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Store wrapper whose writes fail while the flag is set; reads stay live so
/// the session subscription keeps working during the outage.
struct FlakyStore {
    inner: Arc<LocalSessionStore>,
    writes_failing: std::sync::atomic::AtomicBool,
}

impl FlakyStore {
    fn new(inner: Arc<LocalSessionStore>) -> Self {
        Self {
            inner,
            writes_failing: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn set_writes_failing(&self, failing: bool) {
        self.writes_failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn writes_failing(&self) -> bool {
        self.writes_failing
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn read_once(&self, path: &str) -> StoreResult<Option<Value>> {
        self.inner.read_once(path).await
    }

    fn subscribe(&self, path: &str) -> broadcast::Receiver<StoreEvent> {
        self.inner.subscribe(path)
    }

    async fn merge_update(&self, path: &str, patch: Value) -> StoreResult<()> {
        if self.writes_failing() {
            return Err(StoreError::Transport("simulated outage".into()));
        }
        self.inner.merge_update(path, patch).await
    }

    async fn replace(&self, path: &str, value: Value) -> StoreResult<()> {
        if self.writes_failing() {
            return Err(StoreError::Transport("simulated outage".into()));
        }
        self.inner.replace(path, value).await
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        if self.writes_failing() {
            return Err(StoreError::Transport("simulated outage".into()));
        }
        self.inner.remove(path).await
    }

    async fn on_disconnect_merge(&self, path: &str, patch: Value) -> StoreResult<()> {
        self.inner.on_disconnect_merge(path, patch).await
    }
}
