//! Error kernel
//!
//! Single collector draining errors from every worker. The kernel decides
//! what to do about a failure; the worker only reports it and awaits the
//! verdict. Today the only verdict is `Continue`, but the protocol carries
//! the richer actions so policy can evolve without touching call sites.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::message::{Message, Method, SubjectAndMessage};
use crate::server::Context;

/// What a worker should do after reporting an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Continue,
    KillProcess,
    Restart,
}

/// An error report from a worker.
pub struct ErrProcess {
    pub info_text: String,
    pub process_name: String,
    pub message: Message,
    pub action_tx: oneshot::Sender<ErrorAction>,
}

/// Handle used by workers to report into the kernel.
#[derive(Clone)]
pub struct ErrorKernel {
    tx: mpsc::Sender<ErrProcess>,
}

impl ErrorKernel {
    pub fn new() -> (Self, mpsc::Receiver<ErrProcess>) {
        let (tx, rx) = mpsc::channel(64);
        (Self { tx }, rx)
    }

    /// Report an error and wait for the kernel's verdict.
    pub async fn err_send(
        &self,
        process_name: &str,
        message: Message,
        info_text: String,
    ) -> ErrorAction {
        let (action_tx, action_rx) = oneshot::channel();

        let report = ErrProcess {
            info_text,
            process_name: process_name.to_string(),
            message,
            action_tx,
        };

        if self.tx.send(report).await.is_err() {
            // Kernel gone during shutdown; nothing left to decide.
            return ErrorAction::Continue;
        }

        action_rx.await.unwrap_or(ErrorAction::Continue)
    }
}

/// Drain error reports until the channel closes.
///
/// Each report is logged with its delivery coordinates and forwarded as an
/// ErrorLog message toward the configured error-central node. Forwarding is
/// best effort: a stalled buffer must not wedge the kernel.
pub async fn run_collector(ctx: Arc<Context>, mut rx: mpsc::Receiver<ErrProcess>) {
    while let Some(report) = rx.recv().await {
        error!(
            node = %ctx.config.node_name,
            process = %report.process_name,
            method = %report.message.method,
            id = report.message.id,
            "{}",
            report.info_text
        );

        forward_to_central(&ctx, &report).await;

        let _ = report.action_tx.send(ErrorAction::Continue);
    }
}

async fn forward_to_central(ctx: &Arc<Context>, report: &ErrProcess) {
    // Errors about the error path itself stay local, otherwise a broken
    // central subject would loop forever.
    if report.message.method == Method::ErrorLog {
        return;
    }

    let m = Message {
        to_node: ctx.config.error_central_node.clone(),
        from_node: ctx.config.node_name.clone(),
        method: Method::ErrorLog,
        data: format!(
            "{}: process={} method={} id={}",
            report.info_text, report.process_name, report.message.method, report.message.id
        )
        .into_bytes(),
        directory: "errorLog".to_string(),
        file_name: format!("{}.log", ctx.config.node_name),
        ..Default::default()
    };

    let sam = match SubjectAndMessage::new(m) {
        Ok(sam) => sam,
        Err(e) => {
            warn!(error = %e, "could not build error-log message");
            return;
        }
    };

    let push = tokio::time::timeout(Duration::from_secs(1), ctx.buffer.push(vec![sam]));
    match push.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "error-log message not staged"),
        Err(_) => warn!("error-log staging timed out, dropping report"),
    }
}
