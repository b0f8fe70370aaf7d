use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

use chatsync::backend::SseReplayBackend;
use chatsync::{
    ComposerInput, SettingsStore, StreamController, StreamOutcome, SyncError, SyncNotice,
    SyncSettings,
};
use chatsync_storage::{ChatStore, ConversationId, SqliteStore, StorageError};

const DEFAULT_PROMPT: &str = "replayed prompt";

#[derive(Debug, Clone, Default)]
struct ReplayArgs {
    settings_path: Option<PathBuf>,
    db_location: Option<String>,
    conversation_id: Option<String>,
    prompt: Option<String>,
    transcript: Option<PathBuf>,
}

#[derive(Debug, Snafu)]
enum ReplayError {
    #[snafu(display("missing transcript path"))]
    MissingTranscript { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("failed to read transcript at {path:?}: {source}"))]
    ReadTranscript {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("stream failed on `{stage}`: {source}"))]
    Stream {
        stage: &'static str,
        source: SyncError,
    },
}

type ReplayResult<T> = Result<T, ReplayError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        println!("replay_ok=false");
        eprintln!("replay_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> ReplayResult<()> {
    let args = parse_args(env::args().skip(1))?;
    let transcript = args.transcript.clone().context(MissingTranscriptSnafu {
        stage: "run-require-transcript",
    })?;

    let settings_store = args
        .settings_path
        .clone()
        .map_or_else(SettingsStore::load, SettingsStore::new);
    if let Some(db_location) = args.db_location.clone() {
        settings_store.override_in_memory(SyncSettings {
            database_location: db_location,
            ..(*settings_store.settings()).clone()
        });
    }
    let settings = settings_store.settings();
    init_tracing(&settings);

    let body = std::fs::read(&transcript).context(ReadTranscriptSnafu {
        stage: "run-read-transcript",
        path: transcript.clone(),
    })?;
    println!("transcript={}", transcript.display());
    println!("db_location={}", settings.database_location);

    let store = Arc::new(
        SqliteStore::open(&settings.database_location)
            .await
            .context(StorageSnafu {
                stage: "run-open-store",
            })?,
    );
    let backend = Arc::new(SseReplayBackend::new(body));
    let (mut controller, mut notices) =
        StreamController::new(store.clone(), backend, settings_store.shared());

    if let Some(raw) = args.conversation_id.as_deref() {
        let conversation_id = ConversationId::parse(raw).context(StorageSnafu {
            stage: "run-parse-conversation",
        })?;
        controller.set_active_conversation(Some(conversation_id));
    }

    let prompt = args.prompt.as_deref().unwrap_or(DEFAULT_PROMPT);
    let ticket = controller
        .start(ComposerInput::new(prompt))
        .await
        .context(StreamSnafu {
            stage: "run-start-stream",
        })?;
    println!("request_id={}", ticket.request_id);

    let outcome = controller.run().await.context(StreamSnafu {
        stage: "run-drive-stream",
    })?;

    while let Ok(notice) = notices.try_recv() {
        print_notice(&notice);
    }
    print_outcome(&outcome);

    let conversation_id = match &outcome {
        StreamOutcome::Completed {
            conversation_id, ..
        } => conversation_id.clone(),
        _ => controller.active_conversation().cloned(),
    };
    if let Some(conversation_id) = conversation_id {
        let messages = store
            .list_messages(conversation_id.clone())
            .await
            .context(StorageSnafu {
                stage: "run-list-messages",
            })?;
        println!("conversation_id={conversation_id}");
        for message in messages {
            println!(
                "message id={} role={} status={} chars={}",
                message.id,
                message.role.as_str(),
                message.status.as_str(),
                message.content.chars().count()
            );
        }
    }

    println!("replay_ok=true");
    Ok(())
}

fn init_tracing(settings: &SyncSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_filter.as_str()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_notice(notice: &SyncNotice) {
    match notice {
        SyncNotice::Progress { update, .. } => println!("notice=progress message={}", update.message),
        SyncNotice::NavigateTo(conversation_id) => {
            println!("notice=navigate conversation_id={conversation_id}");
        }
        SyncNotice::MainResponseComplete { .. } => println!("notice=main_response_complete"),
        SyncNotice::Failed { message, .. } => println!("notice=failed message={message}"),
        SyncNotice::RestoreInput(input) => println!("notice=restore_input text={}", input.text),
        SyncNotice::SalvageSaved {
            conversation_id, ..
        } => println!(
            "notice=salvage_saved conversation_id={}",
            conversation_id.as_ref().map_or("-", ConversationId::as_str)
        ),
        SyncNotice::Closed { outcome, .. } => println!("notice=closed outcome={}", outcome.kind()),
    }
}

fn print_outcome(outcome: &StreamOutcome) {
    println!("outcome={}", outcome.kind());
    match outcome {
        StreamOutcome::Completed {
            bot_message_id,
            content,
            ..
        } => {
            println!("bot_message_id={bot_message_id}");
            println!("content={content:?}");
        }
        StreamOutcome::Failed { message, .. } => println!("failure={message}"),
        StreamOutcome::Aborted { salvaged, content } => {
            println!("salvaged={salvaged}");
            println!("content={content:?}");
        }
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> ReplayResult<ReplayArgs> {
    let mut parsed = ReplayArgs::default();
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--settings" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-settings-value",
                    arg: "--settings",
                })?;
                parsed.settings_path = Some(PathBuf::from(value));
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                parsed.db_location = Some(value);
            }
            "--conversation" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-conversation-value",
                    arg: "--conversation",
                })?;
                parsed.conversation_id = Some(value);
            }
            "--prompt" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-prompt-value",
                    arg: "--prompt",
                })?;
                parsed.prompt = Some(value);
            }
            raw if raw.starts_with("--") || parsed.transcript.is_some() => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
            _ => parsed.transcript = Some(PathBuf::from(argument)),
        }
    }

    Ok(parsed)
}
