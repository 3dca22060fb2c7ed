//! Ingress sources
//!
//! Operators hand messages to the fabric as JSON or YAML arrays over a
//! unix socket, a TCP listener or an HTTP POST. Each source parses the
//! batch, stamps `from_node` with the local node name and stages the
//! result on the ring buffer. The startup folder is different: its
//! messages are handled by direct local handler invocation and never touch
//! the broker.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StewardError};
use crate::message::{expand_to_nodes, Message, SubjectAndMessage};
use crate::process::{Process, ProcessKind};
use crate::requests;
use crate::server::Context;

/// Parse a JSON/YAML message batch, stamping every message with the local
/// node as sender.
///
/// Messages failing subject construction are dropped individually so one
/// bad entry does not sink the batch.
pub fn parse_messages(raw: &[u8], from_node: &str) -> Result<Vec<SubjectAndMessage>> {
    let mut messages = parse_raw(raw)?;
    for m in &mut messages {
        m.from_node = from_node.to_string();
    }
    Ok(into_sams(messages))
}

fn parse_raw(raw: &[u8]) -> Result<Vec<Message>> {
    let trimmed: Vec<u8> = raw.iter().copied().filter(|b| *b != 0).collect();
    serde_yaml::from_slice(&trimmed).map_err(|e| StewardError::MalformedMessage(e.to_string()))
}

fn into_sams(messages: Vec<Message>) -> Vec<SubjectAndMessage> {
    let mut sams = Vec::new();
    for m in expand_to_nodes(messages) {
        match SubjectAndMessage::new(m) {
            Ok(sam) => sams.push(sam),
            Err(e) => warn!(error = %e, "dropping message without valid subject"),
        }
    }
    sams
}

/// Accept message batches on `<socket-folder>/steward.sock`.
pub async fn run_unix_socket(ctx: Arc<Context>, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    tokio::fs::create_dir_all(&ctx.config.socket_folder).await?;
    let path = ctx.config.socket_folder.join("steward.sock");
    if path.exists() {
        tokio::fs::remove_file(&path).await?;
    }

    let listener = UnixListener::bind(&path)?;
    info!(path = %path.display(), "unix socket ingress listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((mut conn, _)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let mut raw = Vec::new();
                        if let Err(e) = conn.read_to_end(&mut raw).await {
                            error!(error = %e, "socket read failed");
                            return;
                        }
                        stage(&ctx, &raw, "socket").await;
                    });
                }
                Err(e) => error!(error = %e, "socket accept failed"),
            },
        }
    }

    Ok(())
}

/// Accept message batches on the configured TCP listener.
pub async fn run_tcp_listener(
    ctx: Arc<Context>,
    addr: String,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "tcp ingress listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((mut conn, peer)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let mut raw = Vec::new();
                        if let Err(e) = conn.read_to_end(&mut raw).await {
                            error!(error = %e, peer = %peer, "tcp read failed");
                            return;
                        }
                        stage(&ctx, &raw, "tcp").await;
                    });
                }
                Err(e) => error!(error = %e, "tcp accept failed"),
            },
        }
    }

    Ok(())
}

/// Accept message batches as HTTP POST bodies on `/`.
pub async fn run_http_listener(
    ctx: Arc<Context>,
    addr: String,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let app = Router::new().route("/", post(http_ingress)).with_state(ctx);

    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "http ingress listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
        .map_err(|e| StewardError::Internal(format!("http ingress: {e}")))?;

    Ok(())
}

async fn http_ingress(State(ctx): State<Arc<Context>>, body: Bytes) -> (StatusCode, String) {
    match parse_messages(&body, &ctx.config.node_name) {
        Ok(sams) => {
            let count = sams.len();
            match ctx.buffer.push(sams).await {
                Ok(()) => (StatusCode::OK, format!("staged {count} messages\n")),
                Err(e) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("staging failed: {e}\n"),
                ),
            }
        }
        Err(e) => (StatusCode::BAD_REQUEST, format!("malformed message: {e}\n")),
    }
}

async fn stage(ctx: &Arc<Context>, raw: &[u8], source: &str) {
    match parse_messages(raw, &ctx.config.node_name) {
        Ok(sams) => {
            debug!(count = sams.len(), source, "ingress batch parsed");
            if let Err(e) = ctx.buffer.push(sams).await {
                error!(error = %e, source, "ingress staging failed");
            }
        }
        Err(e) => {
            error!(error = %e, source, "malformed ingress batch");
        }
    }
}

/// Parse a startup-folder batch.
///
/// Startup messages must carry `from_node` themselves, it decides where
/// replies are routed; messages without one are rejected.
pub fn parse_startup_messages(raw: &[u8]) -> Result<Vec<SubjectAndMessage>> {
    let messages = parse_raw(raw)?;

    let mut sams = Vec::new();
    for m in expand_to_nodes(messages) {
        if m.from_node.is_empty() {
            warn!(method = %m.method, "startup message missing fromNode, rejected");
            continue;
        }
        match SubjectAndMessage::new(m) {
            Ok(sam) => sams.push(sam),
            Err(e) => warn!(error = %e, "invalid startup message"),
        }
    }
    Ok(sams)
}

/// Handle the startup folder: every message file is dispatched directly to
/// its local handler, bypassing the broker.
pub async fn read_startup_folder(ctx: &Arc<Context>) -> Result<()> {
    let folder: PathBuf = ctx.config.startup_folder.clone();
    tokio::fs::create_dir_all(&folder).await?;

    let mut entries = tokio::fs::read_dir(&folder).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }

        let path = entry.path();
        let raw = tokio::fs::read(&path).await?;

        let sams = match parse_startup_messages(&raw) {
            Ok(sams) => sams,
            Err(e) => {
                error!(file = %path.display(), error = %e, "malformed startup message file");
                continue;
            }
        };

        for sam in sams {
            info!(subject = %sam.subject, file = %path.display(), "handling startup message locally");

            let ctx = ctx.clone();
            tokio::spawn(async move {
                let process = Process {
                    subject: sam.subject.clone(),
                    kind: ProcessKind::Subscriber,
                    process_id: 0,
                    proc_tx: None,
                };
                if let Err(e) = requests::invoke(&ctx, &process, &sam.message).await {
                    error!(subject = %sam.subject, error = %e, "startup handler failed");
                }
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Method;

    #[test]
    fn test_parse_stamps_from_node() {
        let raw = br#"[{"toNode":"ship1","method":"REQPing","fromNode":"spoofed"}]"#;
        let sams = parse_messages(raw, "central").unwrap();
        assert_eq!(sams.len(), 1);
        assert_eq!(sams[0].message.from_node, "central");
    }

    #[test]
    fn test_parse_yaml_batch() {
        let raw = b"- toNode: ship1\n  method: REQPing\n- toNode: ship2\n  method: REQPing\n";
        let sams = parse_messages(raw, "central").unwrap();
        assert_eq!(sams.len(), 2);
        assert_eq!(sams[0].subject.to_node, "ship1");
        assert_eq!(sams[1].subject.to_node, "ship2");
    }

    #[test]
    fn test_parse_expands_fan_out() {
        let raw = br#"[{"toNodes":["a","b"],"method":"REQPing"}]"#;
        let sams = parse_messages(raw, "central").unwrap();
        assert_eq!(sams.len(), 2);
        assert!(sams.iter().all(|s| s.message.to_nodes.is_empty()));
        assert_eq!(sams[0].message.method, Method::Ping);
    }

    #[test]
    fn test_parse_drops_unaddressed() {
        let raw = br#"[{"method":"REQPing"},{"toNode":"ship1","method":"REQPing"}]"#;
        let sams = parse_messages(raw, "central").unwrap();
        assert_eq!(sams.len(), 1);
    }

    #[test]
    fn test_startup_requires_from_node() {
        let raw = br#"
          [ {"toNode":"self","method":"REQPing"},
            {"toNode":"self","method":"REQPing","fromNode":"ops"} ]"#;
        let sams = parse_startup_messages(raw).unwrap();
        assert_eq!(sams.len(), 1);
        assert_eq!(sams[0].message.from_node, "ops");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_messages(b"{{{{", "central").is_err());
    }

    #[test]
    fn test_nul_padding_trimmed() {
        let mut raw = br#"[{"toNode":"ship1","method":"REQPing"}]"#.to_vec();
        raw.extend_from_slice(&[0, 0, 0, 0]);
        let sams = parse_messages(&raw, "central").unwrap();
        assert_eq!(sams.len(), 1);
    }
}
