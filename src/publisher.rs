//! Publisher worker
//!
//! One worker per outbound subject. Drains the subject channel, delivers
//! each message over the broker and, for ACK subjects, waits on a fresh
//! reply inbox subscribed *before* the publish so an immediate answer is
//! never lost. Retries are linear: the ACK wait itself is the pause
//! between attempts. Completion (delivered, or retries exhausted) releases
//! the record from the ring buffer.

use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StewardError;
use crate::message::{encode_message, Event, Message};
use crate::process::Process;
use crate::server::Context;

/// What the publisher does after an attempt got no ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    GiveUp,
}

/// Retry policy: `retries == 0` retries forever, otherwise the attempt
/// count is capped at `retries`.
pub fn retry_decision(retries: u32, attempts: u32) -> RetryDecision {
    if retries == 0 || attempts < retries {
        RetryDecision::Retry
    } else {
        RetryDecision::GiveUp
    }
}

enum Attempt {
    Delivered,
    NoAck,
    Cancelled,
}

pub(crate) async fn run(
    ctx: Arc<Context>,
    name: String,
    process: Process,
    mut message_rx: mpsc::Receiver<Message>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            maybe = message_rx.recv() => match maybe {
                Some(m) => deliver(&ctx, &name, &process, m, &mut shutdown_rx).await,
                None => break,
            },
        }
    }

    ctx.registry.remove(&name);
}

/// Deliver one message, honoring the retry policy.
///
/// A shutdown mid-flight returns without completing the record, leaving it
/// persisted for the next instance to retry.
async fn deliver(
    ctx: &Arc<Context>,
    name: &str,
    process: &Process,
    mut m: Message,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    if m.method.requires_signature() && m.arg_signature.is_empty() {
        m.arg_signature = ctx.auth.sign_args(&m.args_string());
    }

    let payload = match encode_message(&m) {
        Ok(p) => Bytes::from(p),
        Err(e) => {
            ctx.error_kernel
                .err_send(name, m.clone(), format!("message not encodable: {e}"))
                .await;
            complete(ctx, m.id);
            return;
        }
    };

    let subject_name = process.subject.name();
    let mut attempts: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        match attempt(ctx, process, &subject_name, &m, &payload, shutdown_rx).await {
            Attempt::Delivered => break,
            Attempt::Cancelled => return,
            Attempt::NoAck => {
                attempts += 1;
                match retry_decision(m.retries, attempts) {
                    RetryDecision::Retry => {
                        debug!(
                            subject = %subject_name,
                            id = m.id,
                            attempts,
                            retries = m.retries,
                            "no ACK, republishing"
                        );
                    }
                    RetryDecision::GiveUp => {
                        let err = StewardError::MaxRetries {
                            id: m.id,
                            subject: subject_name.clone(),
                        };
                        ctx.error_kernel
                            .err_send(name, m.clone(), format!("{err} after {attempts} attempts"))
                            .await;
                        break;
                    }
                }
            }
        }
    }

    complete(ctx, m.id);
}

/// One publish, and for ACK subjects one bounded reply wait.
async fn attempt(
    ctx: &Arc<Context>,
    process: &Process,
    subject_name: &str,
    m: &Message,
    payload: &Bytes,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Attempt {
    if process.subject.event == Event::Nack {
        return match ctx.client.publish(subject_name.to_string(), payload.clone()).await {
            Ok(()) => Attempt::Delivered,
            Err(e) => {
                warn!(subject = %subject_name, error = %e, "publish failed");
                Attempt::NoAck
            }
        };
    }

    let inbox = format!("reply.{}.{}", subject_name, Uuid::new_v4());

    let mut reply_sub = match ctx.client.subscribe(inbox.clone()).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(subject = %subject_name, error = %e, "reply subscribe failed");
            return Attempt::NoAck;
        }
    };

    if let Err(e) = ctx
        .client
        .publish_with_reply(subject_name.to_string(), inbox, payload.clone())
        .await
    {
        warn!(subject = %subject_name, error = %e, "publish failed");
        let _ = reply_sub.unsubscribe().await;
        return Attempt::NoAck;
    }

    let wait = Duration::from_secs(m.ack_timeout);
    let outcome = tokio::select! {
        _ = shutdown_rx.changed() => Attempt::Cancelled,
        reply = tokio::time::timeout(wait, reply_sub.next()) => match reply {
            Ok(Some(ack)) => {
                debug!(
                    subject = %subject_name,
                    id = m.id,
                    ack = %String::from_utf8_lossy(&ack.payload),
                    "ACK received"
                );
                Attempt::Delivered
            }
            Ok(None) | Err(_) => Attempt::NoAck,
        },
    };

    let _ = reply_sub.unsubscribe().await;
    outcome
}

fn complete(ctx: &Arc<Context>, id: u64) {
    if let Err(e) = ctx.buffer.mark_done(id) {
        warn!(id, error = %e, "could not remove completed record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_retries_exhaust() {
        // retries = 3: attempts 1 and 2 retry, attempt 3 gives up, so at
        // most 3 publishes happen.
        assert_eq!(retry_decision(3, 1), RetryDecision::Retry);
        assert_eq!(retry_decision(3, 2), RetryDecision::Retry);
        assert_eq!(retry_decision(3, 3), RetryDecision::GiveUp);
        assert_eq!(retry_decision(3, 4), RetryDecision::GiveUp);
    }

    #[test]
    fn test_zero_retries_means_unlimited() {
        for attempts in [1, 10, 1_000, 1_000_000] {
            assert_eq!(retry_decision(0, attempts), RetryDecision::Retry);
        }
    }

    #[test]
    fn test_single_retry() {
        assert_eq!(retry_decision(1, 1), RetryDecision::GiveUp);
    }
}
