//! Activity telemetry: rolling counters sampled into every answer
//! submission, plus a bounded audit buffer flushed to the remote audit
//! path. The buffer is capped so a failing flush degrades to dropped
//! events rather than unbounded memory growth.

use podium_proto::SubmissionTelemetry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

const DEFAULT_BUFFER_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    FocusGained,
    FocusLost,
    CalculatorOpened,
    CalculatorClosed,
    OptionSelected,
    QuestionShown,
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub kind: ActivityKind,
    pub at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

#[derive(Debug)]
struct TelemetryInner {
    focused: bool,
    calculator_open: bool,
    calculator_uses: u32,
    unfocused_since: Option<Instant>,
    idle_ms: u64,
    question_started: Option<Instant>,
    buffer: Vec<ActivityEvent>,
    dropped: u64,
}

impl TelemetryInner {
    fn new() -> Self {
        Self {
            focused: true,
            calculator_open: false,
            calculator_uses: 0,
            unfocused_since: None,
            idle_ms: 0,
            question_started: None,
            buffer: Vec::new(),
            dropped: 0,
        }
    }

    fn settle_focus(&mut self) {
        if let Some(since) = self.unfocused_since.take() {
            self.idle_ms = self
                .idle_ms
                .saturating_add(since.elapsed().as_millis() as u64);
        }
    }
}

#[derive(Debug)]
pub struct ActivityTelemetry {
    inner: parking_lot::Mutex<TelemetryInner>,
    buffer_cap: usize,
}

impl Default for ActivityTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTelemetry {
    pub fn new() -> Self {
        Self::with_buffer_cap(DEFAULT_BUFFER_CAP)
    }

    pub fn with_buffer_cap(buffer_cap: usize) -> Self {
        Self {
            inner: parking_lot::Mutex::new(TelemetryInner::new()),
            buffer_cap,
        }
    }

    pub fn record_activity(&self, kind: ActivityKind, at_ms: i64, detail: Option<Value>) {
        let mut inner = self.inner.lock();
        match kind {
            ActivityKind::FocusLost => {
                if inner.focused {
                    inner.focused = false;
                    inner.unfocused_since = Some(Instant::now());
                }
            }
            ActivityKind::FocusGained => {
                inner.settle_focus();
                inner.focused = true;
            }
            ActivityKind::CalculatorOpened => {
                inner.calculator_open = true;
                inner.calculator_uses = inner.calculator_uses.saturating_add(1);
            }
            ActivityKind::CalculatorClosed => {
                inner.calculator_open = false;
            }
            ActivityKind::QuestionShown => {
                inner.question_started = Some(Instant::now());
            }
            ActivityKind::OptionSelected | ActivityKind::Heartbeat => {}
        }

        if inner.buffer.len() >= self.buffer_cap {
            // Oldest-first drop keeps the tail of the audit trail intact.
            inner.buffer.remove(0);
            inner.dropped = inner.dropped.saturating_add(1);
        }
        inner.buffer.push(ActivityEvent { kind, at_ms, detail });
    }

    /// Counters attached to an answer at submission time.
    pub fn sample(&self, status: Option<String>) -> SubmissionTelemetry {
        let mut inner = self.inner.lock();
        inner.settle_focus();
        if !inner.focused {
            inner.unfocused_since = Some(Instant::now());
        }
        SubmissionTelemetry {
            time_on_question_ms: inner
                .question_started
                .map(|started| started.elapsed().as_millis() as u64)
                .unwrap_or(0),
            using_calculator: inner.calculator_open,
            status,
        }
    }

    pub fn calculator_in_use(&self) -> bool {
        self.inner.lock().calculator_open
    }

    pub fn idle_ms(&self) -> u64 {
        self.inner.lock().idle_ms
    }

    /// True once the buffer is at capacity; callers should force a flush.
    pub fn needs_flush(&self) -> bool {
        let inner = self.inner.lock();
        inner.buffer.len() >= self.buffer_cap
    }

    /// Takes the buffered events for one flush attempt. On flush failure the
    /// caller hands the batch back via [`ActivityTelemetry::requeue`].
    pub fn drain_batch(&self) -> Vec<ActivityEvent> {
        let mut inner = self.inner.lock();
        std::mem::take(&mut inner.buffer)
    }

    pub fn requeue(&self, mut batch: Vec<ActivityEvent>) {
        let mut inner = self.inner.lock();
        // Requeued events go back in front of anything recorded meanwhile,
        // trimmed to the cap from the oldest end.
        batch.append(&mut inner.buffer);
        if batch.len() > self.buffer_cap {
            let excess = batch.len() - self.buffer_cap;
            batch.drain(..excess);
            inner.dropped = inner.dropped.saturating_add(excess as u64);
        }
        inner.buffer = batch;
    }

    pub fn dropped_events(&self) -> u64 {
        self.inner.lock().dropped
    }
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }
        inner_init(config)?;
        INIT.set(()).ok();
        Ok(())
    }

    fn inner_init(config: &LogConfig) -> Result<(), InitError> {
        let env_filter = build_env_filter(config.level.to_filter());

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_level(true)
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(Some(guard));
        Ok(())
    }

    // HTTP-stack targets that flood trace output; kept at info unless the
    // caller overrides the whole filter.
    const NOISY_DEP_TARGETS: &[&str] = &["hyper", "reqwest", "rustls", "mio", "h2"];

    fn build_env_filter(level: LevelFilter) -> EnvFilter {
        if let Ok(filter) = std::env::var("PODIUM_LOG_FILTER") {
            return EnvFilter::new(filter);
        }
        let mut filter = match level {
            LevelFilter::TRACE => "info,podium_client_core=trace,podium=trace".to_owned(),
            LevelFilter::DEBUG => "info,podium_client_core=debug,podium=debug".to_owned(),
            LevelFilter::INFO => "info".to_owned(),
            LevelFilter::WARN => "warn".to_owned(),
            LevelFilter::ERROR => "error".to_owned(),
            LevelFilter::OFF => "off".to_owned(),
        };
        if level >= LevelFilter::DEBUG {
            for target in NOISY_DEP_TARGETS {
                filter.push(',');
                filter.push_str(target);
                filter.push_str("=info");
            }
        }
        EnvFilter::new(filter)
    }
}
