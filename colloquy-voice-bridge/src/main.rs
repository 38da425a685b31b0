mod audio;
mod protocol;
mod providers;

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use uuid::Uuid;

use colloquy_voice::{
    ContextSnapshot, EngineConfig, InterruptReason, PipelineEngine, SessionInfo, StaticContext,
};
use protocol::{
    BridgeErrorCode, ClientMessage, ErrorMessage, HelloMessage, OutboundEvent, MAX_LINE_BYTES,
};
use providers::{
    HttpGenerator, HttpMessageSink, HttpSynthesizer, HttpTranscriber, UnconfiguredTranscriber,
};

fn main() {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("[bridge] failed to start runtime: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = runtime.block_on(run()) {
        eprintln!("[bridge] fatal error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> io::Result<()> {
    // Correlation id carried on every log line for this connection
    let conn = Uuid::new_v4().simple().to_string();
    let conn = &conn[..8];

    let config = load_config(conn);
    let engine = build_engine(conn, config)?;
    engine.spawn_reaper();

    // Single writer task keeps stdout NDJSON-clean
    let (writer_tx, mut writer_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = writer_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut session: Option<SessionInfo> = None;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if line.len() > MAX_LINE_BYTES {
            send_error(
                &writer_tx,
                BridgeErrorCode::PayloadTooLarge,
                format!("Message exceeds max size ({} > {MAX_LINE_BYTES})", line.len()),
            )
            .await;
            continue;
        }

        let message: ClientMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                send_error(
                    &writer_tx,
                    BridgeErrorCode::ParseError,
                    format!("Invalid message: {err}"),
                )
                .await;
                continue;
            }
        };

        match message {
            ClientMessage::SessionStart { user_id } => {
                if session.is_some() {
                    send_error(
                        &writer_tx,
                        BridgeErrorCode::SessionAlreadyStarted,
                        "This connection already has a session",
                    )
                    .await;
                    continue;
                }
                let user_id = user_id.unwrap_or_else(|| "anonymous".to_string());
                match engine.create_session(&user_id).await {
                    Ok((info, mut events)) => {
                        eprintln!(
                            "[bridge {conn}] session {} started for '{user_id}'",
                            info.session_id
                        );
                        session = Some(info);

                        // Pump engine events to stdout for the connection's
                        // lifetime; back-pressure flows from here into the
                        // pipeline.
                        let event_tx = writer_tx.clone();
                        let pump_conn = conn.to_string();
                        tokio::spawn(async move {
                            while let Some(envelope) = events.next().await {
                                match serde_json::to_string(&OutboundEvent::new(
                                    envelope.session_id,
                                    envelope.seq,
                                    &envelope.event,
                                )) {
                                    Ok(line) => {
                                        if event_tx.send(line).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(err) => {
                                        eprintln!(
                                            "[bridge {pump_conn}] event serialization failed: {err}"
                                        );
                                    }
                                }
                            }
                            eprintln!("[bridge {pump_conn}] event stream closed");
                        });

                        send_json(
                            &writer_tx,
                            &HelloMessage::new(info.session_id, info.conversation_id),
                        )
                        .await;
                    }
                    Err(err) => {
                        send_error(&writer_tx, BridgeErrorCode::InternalError, err.to_string())
                            .await;
                    }
                }
            }

            ClientMessage::AudioChunk { audio } => {
                let Some(info) = session else {
                    send_error(&writer_tx, BridgeErrorCode::NoSession, "Send session.start first")
                        .await;
                    continue;
                };
                match audio::decode_frame(&audio, engine.config().audio_format()) {
                    Ok(pcm) => {
                        if let Err(err) = engine.on_audio_chunk(info.session_id, &pcm).await {
                            eprintln!("[bridge {conn}] audio chunk rejected: {err}");
                        }
                    }
                    Err(err) => send_error(&writer_tx, err.code, err.message).await,
                }
            }

            ClientMessage::AudioEnd => {
                let Some(info) = session else {
                    send_error(&writer_tx, BridgeErrorCode::NoSession, "Send session.start first")
                        .await;
                    continue;
                };
                if let Err(err) = engine.on_audio_end(info.session_id).await {
                    eprintln!("[bridge {conn}] audio end rejected: {err}");
                }
            }

            ClientMessage::Interrupt => {
                let Some(info) = session else {
                    send_error(&writer_tx, BridgeErrorCode::NoSession, "Send session.start first")
                        .await;
                    continue;
                };
                match engine.interrupt(info.session_id, InterruptReason::User).await {
                    Ok(fired) => {
                        eprintln!("[bridge {conn}] interrupt requested (fired={fired})")
                    }
                    Err(err) => eprintln!("[bridge {conn}] interrupt failed: {err}"),
                }
            }

            ClientMessage::Transcript { text, is_final } => {
                let Some(info) = session else {
                    send_error(&writer_tx, BridgeErrorCode::NoSession, "Send session.start first")
                        .await;
                    continue;
                };
                if let Err(err) = engine.on_transcript(info.session_id, &text, is_final).await {
                    eprintln!("[bridge {conn}] transcript rejected: {err}");
                }
            }

            ClientMessage::SessionEnd => {
                if let Some(info) = session.take() {
                    let _ = engine.end_session(info.session_id).await;
                    eprintln!("[bridge {conn}] session {} ended by client", info.session_id);
                }
                break;
            }
        }
    }

    if let Some(info) = session.take() {
        let _ = engine.end_session(info.session_id).await;
        eprintln!("[bridge {conn}] session {} ended on disconnect", info.session_id);
    }
    drop(writer_tx);
    let _ = writer.await;
    Ok(())
}

fn load_config(conn: &str) -> EngineConfig {
    let Ok(path) = std::env::var("COLLOQUY_CONFIG") else {
        return EngineConfig::default();
    };
    match std::fs::read_to_string(&path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(config) => {
                eprintln!("[bridge {conn}] config loaded from {path}");
                config
            }
            Err(err) => {
                eprintln!("[bridge {conn}] invalid config {path} ({err}), using defaults");
                EngineConfig::default()
            }
        },
        Err(err) => {
            eprintln!("[bridge {conn}] cannot read config {path} ({err}), using defaults");
            EngineConfig::default()
        }
    }
}

fn build_engine(conn: &str, config: EngineConfig) -> io::Result<PipelineEngine> {
    let llm_url = require_env("COLLOQUY_LLM_URL")?;
    let tts_url = require_env("COLLOQUY_TTS_URL")?;

    let transcriber: Arc<dyn colloquy_voice::Transcriber> =
        match std::env::var("COLLOQUY_STT_URL") {
            Ok(url) if !url.trim().is_empty() => Arc::new(HttpTranscriber::new(url)),
            _ => {
                eprintln!(
                    "[bridge {conn}] no COLLOQUY_STT_URL; relying on client-side transcripts"
                );
                Arc::new(UnconfiguredTranscriber)
            }
        };

    let context = load_context(conn);
    let engine = PipelineEngine::new(
        config,
        transcriber,
        Arc::new(HttpGenerator::new(llm_url)),
        Arc::new(HttpSynthesizer::new(tts_url)),
        Arc::new(StaticContext::new(context)),
    );

    Ok(match std::env::var("COLLOQUY_VECTOR_URL") {
        Ok(url) if !url.trim().is_empty() => {
            eprintln!("[bridge {conn}] mirroring conversation to {url}");
            engine.with_message_sink(Arc::new(HttpMessageSink::new(url)))
        }
        _ => engine,
    })
}

fn require_env(name: &str) -> io::Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{name} must be set to a provider endpoint"),
            )
        })
}

/// Optional JSON object of label -> value, served to the generator and the
/// verifier as the context snapshot.
fn load_context(conn: &str) -> ContextSnapshot {
    let Ok(path) = std::env::var("COLLOQUY_CONTEXT_FILE") else {
        return ContextSnapshot::default();
    };
    let data = match std::fs::read_to_string(&path) {
        Ok(data) => data,
        Err(err) => {
            eprintln!("[bridge {conn}] cannot read context {path} ({err})");
            return ContextSnapshot::default();
        }
    };
    match serde_json::from_str::<serde_json::Value>(&data) {
        Ok(serde_json::Value::Object(map)) => {
            let api_data: BTreeMap<String, serde_json::Value> = map.into_iter().collect();
            eprintln!(
                "[bridge {conn}] context loaded from {path} ({} entries)",
                api_data.len()
            );
            ContextSnapshot {
                api_data,
                ..Default::default()
            }
        }
        Ok(_) => {
            eprintln!("[bridge {conn}] context {path} is not a JSON object, ignoring");
            ContextSnapshot::default()
        }
        Err(err) => {
            eprintln!("[bridge {conn}] invalid context {path} ({err})");
            ContextSnapshot::default()
        }
    }
}

async fn send_json<T: serde::Serialize>(writer_tx: &mpsc::Sender<String>, message: &T) {
    match serde_json::to_string(message) {
        Ok(line) => {
            let _ = writer_tx.send(line).await;
        }
        Err(err) => eprintln!("[bridge] response serialization failed: {err}"),
    }
}

async fn send_error(
    writer_tx: &mpsc::Sender<String>,
    code: BridgeErrorCode,
    message: impl Into<String>,
) {
    send_json(writer_tx, &ErrorMessage::new(code, message)).await;
}
