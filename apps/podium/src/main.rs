use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use podium_client_core::client::StudentClient;
use podium_client_core::config::Config;
use podium_client_core::session::machine::UserIntent;
use podium_client_core::session::{SessionConfig, SessionManager, paths};
use podium_client_core::storage::{FileStorage, KeyValueStorage, MemoryStorage};
use podium_client_core::telemetry::logging::{self, LogConfig, LogLevel};
use podium_proto::{LiveSessionState, QuestionOption, ResultsVisibility, SessionKind, SessionStatus};
use store_bus::{LocalSessionStore, SessionStore};

/// Headless student client harness. Runs the full session loop against an
/// in-process store with a scripted teacher, printing every view
/// transition; the production surfaces embed the same client core.
#[derive(Parser, Debug)]
#[command(name = "podium")]
struct Cli {
    #[arg(long, default_value = "demo-poll")]
    poll: String,

    #[arg(long, default_value = "student@example.com")]
    email: String,

    #[arg(long, help = "Control backend base url")]
    server: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[arg(long, help = "Durable storage directory (defaults to in-memory)")]
    storage_dir: Option<PathBuf>,

    #[arg(long, help = "Script a secure assessment instead of a live poll")]
    secure: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let mut config = Config::from_env();
    if let Some(dir) = &cli.storage_dir {
        config.storage_dir = Some(dir.clone());
    }
    config.sync_interval = Duration::from_millis(200);
    config.poll_interval_fast = Duration::from_millis(500);

    let storage: Arc<dyn KeyValueStorage> = match &config.storage_dir {
        Some(dir) => Arc::new(FileStorage::open(dir)?),
        None => Arc::new(MemoryStorage::new()),
    };

    let base = cli
        .server
        .clone()
        .unwrap_or_else(|| config.control_base_url.clone());
    let session_config = SessionConfig::new(base)?;
    let control = SessionManager::new(session_config)?;

    let store = Arc::new(LocalSessionStore::new());
    seed_session(store.as_ref(), &cli.poll, cli.secure).await?;

    let client = StudentClient::new(config, store.clone(), control, storage);
    let handle = client.start(&cli.poll, &cli.email).await;
    let mut views = handle.views();

    // Scripted teacher: open the first question shortly after join.
    let teacher_store = store.clone();
    let poll_id = cli.poll.clone();
    let secure = cli.secure;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        let _ = open_first_question(teacher_store.as_ref(), &poll_id, secure).await;
    });

    if cli.secure {
        // The harness stands in for the user gesture the gate requires.
        let handle_intents = handle.inputs();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(800)).await;
            let _ = handle_intents
                .send(podium_client_core::session::machine::MachineInput::Intent(
                    UserIntent::FullscreenEntered,
                ))
                .await;
        });
    }

    println!("joined poll {} as {}", cli.poll, cli.email);
    loop {
        if views.changed().await.is_err() {
            break;
        }
        let view = views.borrow().clone();
        println!("view: {}", view.label());
        if view.label() == "session_ended" {
            break;
        }
    }
    handle.shutdown();
    Ok(())
}

async fn seed_session(
    store: &dyn SessionStore,
    poll_id: &str,
    secure: bool,
) -> anyhow::Result<()> {
    let session = LiveSessionState {
        poll_id: poll_id.to_string(),
        status: SessionStatus::PreLive,
        question_index: 0,
        question_text: String::new(),
        options: Vec::new(),
        session_kind: if secure {
            SessionKind::SecureAssessment
        } else {
            SessionKind::LivePoll
        },
        results_visibility: ResultsVisibility::Hidden,
        calculator_enabled: false,
        live_proctoring: secure,
        metacognition_enabled: false,
        reset_timestamp: 1,
        result_percentages: None,
        timestamp: 0,
    };
    store
        .replace(
            &paths::live_session(poll_id),
            serde_json::to_value(&session)?,
        )
        .await?;
    Ok(())
}

async fn open_first_question(
    store: &dyn SessionStore,
    poll_id: &str,
    secure: bool,
) -> anyhow::Result<()> {
    let session = LiveSessionState {
        poll_id: poll_id.to_string(),
        status: SessionStatus::Open,
        question_index: 0,
        question_text: "Which planet is closest to the sun?".to_string(),
        options: vec![
            QuestionOption::new("Venus"),
            QuestionOption::new("Mercury").correct(true),
            QuestionOption::new("Mars"),
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
        reset_timestamp: 2,
        result_percentages: None,
        timestamp: 0,
    };
    store
        .replace(
            &paths::live_session(poll_id),
            serde_json::to_value(&session)?,
        )
        .await?;
    Ok(())
}
