//! Subscriber worker
//!
//! One worker per inbound subject. Each broker delivery is handled in its
//! own task so a long-running handler never stalls the subject. A delivery
//! passes the allowed-receivers gate, the ACL gate and the signature gate
//! before its handler runs; ACK subjects answer on the delivery's reply
//! subject with the handler output or a rejection payload.

use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::StewardError;
use crate::message::{decode_message, Event, Message, Method, Node};
use crate::process::Process;
use crate::requests;
use crate::server::Context;

pub(crate) async fn run(
    ctx: Arc<Context>,
    name: String,
    process: Process,
    allowed_receivers: Vec<Node>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let allowed: Arc<HashSet<Node>> = Arc::new(allowed_receivers.into_iter().collect());
    let subject_name = process.subject.name();

    // A lost subscription is retried until shutdown; the broker client
    // reconnects underneath us.
    let mut subscription = loop {
        if *shutdown_rx.borrow() {
            ctx.registry.remove(&name);
            return;
        }

        match ctx.client.subscribe(subject_name.clone()).await {
            Ok(sub) => break sub,
            Err(e) => {
                warn!(subject = %subject_name, error = %e, "subscribe failed, retrying");
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        ctx.registry.remove(&name);
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    };

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            maybe = subscription.next() => match maybe {
                Some(delivery) => {
                    let ctx = ctx.clone();
                    let name = name.clone();
                    let process = process.clone();
                    let allowed = allowed.clone();
                    tokio::spawn(async move {
                        handle_delivery(ctx, name, process, allowed, delivery).await;
                    });
                }
                None => {
                    warn!(subject = %subject_name, "subscription stream ended");
                    break;
                }
            },
        }
    }

    let _ = subscription.unsubscribe().await;
    ctx.registry.remove(&name);
}

async fn handle_delivery(
    ctx: Arc<Context>,
    name: String,
    process: Process,
    allowed: Arc<HashSet<Node>>,
    delivery: async_nats::Message,
) {
    // Undecodable input carries no sender to answer; log and drop.
    let m = match decode_message(&delivery.payload) {
        Ok(m) => m,
        Err(e) => {
            error!(subject = %process.subject, error = %e, "dropping undecodable delivery");
            return;
        }
    };

    let is_ack = process.subject.event == Event::Ack;
    let reply_to = delivery.reply.clone();

    if !allowed.contains("*") && !allowed.contains(&m.from_node) {
        let err = StewardError::NotAllowed(m.from_node.clone());
        warn!(subject = %process.subject, "sender not in allowed receivers: {err}");
        if is_ack {
            send_reply(&ctx, &reply_to, err.to_string().into_bytes()).await;
        }
        return;
    }

    if !acl_allows(&ctx, is_ack, &m).await {
        let err = StewardError::NotAllowed(m.from_node.clone());
        warn!(subject = %process.subject, "request rejected by acl: {err}");
        if is_ack {
            send_reply(&ctx, &reply_to, err.to_string().into_bytes()).await;
        }
        return;
    }

    if !ctx
        .auth
        .verify_signature(&m, ctx.config.enable_signature_check)
    {
        let err = StewardError::SignatureInvalid(m.from_node.clone());
        warn!(subject = %process.subject, "{err}");
        if is_ack {
            send_reply(&ctx, &reply_to, err.to_string().into_bytes()).await;
        }
        return;
    }

    debug!(subject = %process.subject, from = %m.from_node, id = m.id, "delivery accepted");

    match requests::invoke(&ctx, &process, &m).await {
        Ok(out) => {
            if is_ack {
                send_reply(&ctx, &reply_to, out).await;
            }
        }
        Err(e) => {
            ctx.error_kernel
                .err_send(&name, m.clone(), format!("handler failed: {e}"))
                .await;
            if is_ack {
                send_reply(&ctx, &reply_to, format!("error: {e}").into_bytes()).await;
            }
        }
    }
}

/// The ACL gates ACK-kind requests when enforcement is on. Replies and
/// error-log traffic pass, otherwise no reply could ever come home without
/// its own ACL entry.
async fn acl_allows(ctx: &Arc<Context>, is_ack: bool, m: &Message) -> bool {
    if !ctx.config.enable_acl_check || !is_ack || m.is_reply || m.method == Method::ErrorLog {
        return true;
    }

    ctx.node_acl
        .lock()
        .await
        .is_allowed(&m.from_node, &m.args_string())
}

async fn send_reply(ctx: &Arc<Context>, reply_to: &Option<async_nats::Subject>, payload: Vec<u8>) {
    let Some(reply) = reply_to else {
        debug!("ACK delivery without reply subject, nothing to answer");
        return;
    };

    if let Err(e) = ctx
        .client
        .publish(reply.clone(), Bytes::from(payload))
        .await
    {
        warn!(reply = %reply, error = %e, "reply publish failed");
    }
}
