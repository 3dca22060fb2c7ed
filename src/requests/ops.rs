//! Operational handlers: hello, ping/pong, process control, relay

use std::sync::Arc;
use tracing::{debug, warn};

use super::{ack_text, new_reply_message, new_reply_message_with_default};
use crate::error::{Result, StewardError};
use crate::ingress::parse_messages;
use crate::message::{Message, Method, Subject};
use crate::process::Process;
use crate::server::Context;

/// Forward a greeting into the subject's stateful actor, which owns the
/// set of greeted nodes.
pub async fn hello(_ctx: &Arc<Context>, proc: &Process, m: &Message) -> Result<Vec<u8>> {
    debug!(from = %m.from_node, "hello received");

    if let Some(proc_tx) = &proc.proc_tx {
        if proc_tx.send(m.clone()).await.is_err() {
            warn!(subject = %proc.subject, "hello actor gone, greeting dropped");
        }
    }

    Ok(Vec::new())
}

/// Answer a ping. The reply defaults to a Pong message back at the sender.
pub async fn ping(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let out = format!("pong from {}", ctx.config.node_name).into_bytes();
    new_reply_message_with_default(ctx, m, out, Method::Pong).await;
    Ok(ack_text(&ctx.config.node_name, m))
}

/// Record an answered ping on disk via the file naming policy.
pub async fn pong(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let mut m = m.clone();
    if m.file_name.is_empty() {
        m.file_name = "pong.log".to_string();
    }
    m.data.push(b'\n');
    super::file::to_file_append(ctx, &m).await
}

/// Reply with a snapshot of the processes running on this node.
pub async fn op_process_list(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let mut out = String::new();
    for info in ctx.registry.list() {
        out.push_str(&format!(
            "{}, kind: {}, toNode: {}, method: {}\n",
            info.name, info.kind, info.to_node, info.method
        ));
    }

    new_reply_message(ctx, m, out.into_bytes()).await;
    Ok(ack_text(&ctx.config.node_name, m))
}

/// Start a subscriber for a method on this node. Args: `[method]`.
pub async fn op_process_start(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let Some(method_name) = m.method_args.first() else {
        return Err(StewardError::HandlerFailure(
            "process start needs a method name".into(),
        ));
    };

    let method = Method::from_wire(method_name)?;
    let subject = Subject::new(method, &ctx.config.node_name);
    let handle = ctx
        .registry
        .spawn_subscriber(ctx, subject, vec!["*".to_string()], None);

    let out = format!("started process {}", handle.process.subject).into_bytes();
    new_reply_message(ctx, m, out).await;
    Ok(ack_text(&ctx.config.node_name, m))
}

/// Stop a process by its registry name. Args: `[process_name]`.
pub async fn op_process_stop(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let Some(name) = m.method_args.first() else {
        return Err(StewardError::HandlerFailure(
            "process stop needs a process name".into(),
        ));
    };

    let out = if ctx.registry.stop(name) {
        format!("stopping process {name}")
    } else {
        format!("no such process {name}")
    }
    .into_bytes();

    new_reply_message(ctx, m, out).await;
    Ok(ack_text(&ctx.config.node_name, m))
}

/// Re-ingress a carried message batch, so a reachable node can forward
/// traffic for one that is not directly addressable.
pub async fn relay(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let sams = parse_messages(&m.data, &ctx.config.node_name)?;
    let count = sams.len();

    ctx.buffer
        .push(sams)
        .await
        .map_err(|e| StewardError::HandlerFailure(format!("stage relayed messages: {e}")))?;

    debug!(count, from = %m.from_node, "relayed messages staged");
    Ok(ack_text(&ctx.config.node_name, m))
}

/// Echo the message data back, used by tests to observe delivery.
pub async fn test(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    new_reply_message(ctx, m, m.data.clone()).await;
    Ok(m.data.clone())
}
