//! CLI command handlers

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{ack_text, method_timeout, new_reply_message};
use crate::error::{Result, StewardError};
use crate::message::Message;
use crate::server::Context;

/// Execute a command on the node and reply with its combined output.
///
/// The first argument is the program, the rest its arguments:
/// `["bash", "-c", "tree ./"]`.
pub async fn cli_command(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let (program, args) = split_command(m)?;

    debug!(program, "running cli command");
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| StewardError::HandlerFailure(format!("spawn {program}: {e}")))?;

    let mut out = output.stdout;
    if !output.status.success() {
        out.extend_from_slice(&output.stderr);
    }

    new_reply_message(ctx, m, out).await;
    Ok(ack_text(&ctx.config.node_name, m))
}

/// Execute a long-running command and stream its output back line by line
/// as it is produced, until the command finishes or the method deadline
/// passes.
pub async fn cli_command_cont(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let (program, args) = split_command(m)?;

    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| StewardError::HandlerFailure(format!("spawn {program}: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| StewardError::HandlerFailure("no stdout from child".into()))?;
    let mut lines = BufReader::new(stdout).lines();

    // Finish just inside the subscriber's outer deadline so the final ACK
    // still goes out from here.
    let deadline = tokio::time::Instant::now()
        + method_timeout(m).saturating_sub(Duration::from_millis(200));

    loop {
        let next = tokio::time::timeout_at(deadline, lines.next_line());
        match next.await {
            Ok(Ok(Some(line))) => {
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                new_reply_message(ctx, m, bytes).await;
            }
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                return Err(StewardError::HandlerFailure(format!("read stdout: {e}")));
            }
            Err(_) => {
                let _ = child.kill().await;
                break;
            }
        }
    }

    Ok(ack_text(&ctx.config.node_name, m))
}

fn split_command(m: &Message) -> Result<(&str, &[String])> {
    match m.method_args.split_first() {
        Some((program, args)) => Ok((program.as_str(), args)),
        None => Err(StewardError::HandlerFailure(
            "no command specified in method args".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Method;

    #[test]
    fn test_split_command() {
        let m = Message {
            method: Method::CliCommand,
            method_args: vec!["bash".into(), "-c".into(), "date".into()],
            ..Default::default()
        };
        let (program, args) = split_command(&m).unwrap();
        assert_eq!(program, "bash");
        assert_eq!(args, &["-c".to_string(), "date".to_string()]);

        let empty = Message::default();
        assert!(split_command(&empty).is_err());
    }
}
