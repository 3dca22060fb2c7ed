//! Process model and registry
//!
//! A process is a worker owning exactly one subject in one direction:
//! publishers drain the subject's message channel into the broker,
//! subscribers drain broker deliveries into method handlers. The registry
//! maps `<subject>.<kind>` to the live worker and mediates dynamic
//! start/stop requested by operator messages.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::message::{Message, Method, Node, Subject};
use crate::server::Context;
use crate::{publisher, subscriber};

/// Capacity of a publisher's subject channel.
const SUBJECT_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Publisher,
    Subscriber,
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessKind::Publisher => write!(f, "publisher"),
            ProcessKind::Subscriber => write!(f, "subscriber"),
        }
    }
}

/// Registry key for a worker: `<subject-canonical>.<kind>`.
pub fn process_name(subject: &Subject, kind: ProcessKind) -> String {
    format!("{}.{}", subject.name(), kind)
}

/// The slice of process state a method handler sees.
#[derive(Clone)]
pub struct Process {
    pub subject: Subject,
    pub kind: ProcessKind,
    pub process_id: u64,
    /// Channel into the subject's stateful actor, when one is registered.
    pub proc_tx: Option<mpsc::Sender<Message>>,
}

/// A stateful actor owned by a subscriber process. Handlers enqueue into
/// it over the process channel; the actor owns its state across messages.
pub type ProcFunc = Box<
    dyn FnOnce(mpsc::Receiver<Message>, watch::Receiver<bool>) -> BoxFuture<'static, ()> + Send,
>;

/// Registry entry for a running worker.
pub struct ProcessHandle {
    pub process: Process,
    /// Inbound messages for publisher workers.
    pub message_tx: Option<mpsc::Sender<Message>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Snapshot row returned by [`ProcessRegistry::list`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub kind: String,
    pub to_node: Node,
    pub method: Method,
}

/// Map of all running processes on this node.
#[derive(Default)]
pub struct ProcessRegistry {
    processes: DashMap<String, Arc<ProcessHandle>>,
    next_process_id: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a publisher for a subject, or return the running one.
    ///
    /// Publishers are created lazily on the first outbound message for a
    /// `(to-node, method)` pair.
    pub fn spawn_publisher(&self, ctx: &Arc<Context>, subject: Subject) -> Arc<ProcessHandle> {
        let name = process_name(&subject, ProcessKind::Publisher);

        match self.processes.entry(name.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let (message_tx, message_rx) = mpsc::channel(SUBJECT_CHANNEL_SIZE);
                let (shutdown_tx, shutdown_rx) = watch::channel(false);

                let process = Process {
                    subject: subject.clone(),
                    kind: ProcessKind::Publisher,
                    process_id: self.next_process_id.fetch_add(1, Ordering::Relaxed) + 1,
                    proc_tx: None,
                };

                let handle = Arc::new(ProcessHandle {
                    process: process.clone(),
                    message_tx: Some(message_tx),
                    shutdown_tx,
                });
                entry.insert(handle.clone());

                info!(process = %name, "publisher started");
                tokio::spawn(publisher::run(
                    ctx.clone(),
                    name,
                    process,
                    message_rx,
                    shutdown_rx,
                ));

                handle
            }
        }
    }

    /// Start a subscriber for a subject, or return the running one.
    ///
    /// `allowed_receivers` gates which senders the worker accepts; `"*"`
    /// accepts all. An optional actor receives messages forwarded by the
    /// subject's handlers and owns per-subject state.
    pub fn spawn_subscriber(
        &self,
        ctx: &Arc<Context>,
        subject: Subject,
        allowed_receivers: Vec<Node>,
        proc_func: Option<ProcFunc>,
    ) -> Arc<ProcessHandle> {
        let name = process_name(&subject, ProcessKind::Subscriber);

        match self.processes.entry(name.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);

                let proc_tx = proc_func.map(|f| {
                    let (proc_tx, proc_rx) = mpsc::channel(SUBJECT_CHANNEL_SIZE);
                    tokio::spawn(f(proc_rx, shutdown_rx.clone()));
                    proc_tx
                });

                let process = Process {
                    subject: subject.clone(),
                    kind: ProcessKind::Subscriber,
                    process_id: self.next_process_id.fetch_add(1, Ordering::Relaxed) + 1,
                    proc_tx,
                };

                let handle = Arc::new(ProcessHandle {
                    process: process.clone(),
                    message_tx: None,
                    shutdown_tx,
                });
                entry.insert(handle.clone());

                info!(process = %name, "subscriber started");
                tokio::spawn(subscriber::run(
                    ctx.clone(),
                    name,
                    process,
                    allowed_receivers,
                    shutdown_rx,
                ));

                handle
            }
        }
    }

    /// Request a worker to stop. The worker unsubscribes its broker
    /// interest and removes itself from the registry on exit.
    pub fn stop(&self, name: &str) -> bool {
        match self.processes.get(name) {
            Some(handle) => {
                let _ = handle.shutdown_tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Signal every worker to stop, used at shutdown.
    pub fn stop_all(&self) {
        for entry in self.processes.iter() {
            let _ = entry.value().shutdown_tx.send(true);
        }
    }

    /// Called by workers when their loop exits.
    pub(crate) fn remove(&self, name: &str) {
        if self.processes.remove(name).is_some() {
            info!(process = %name, "process removed from registry");
        }
    }

    /// Snapshot of all running processes, sorted by name.
    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut rows: Vec<ProcessInfo> = self
            .processes
            .iter()
            .map(|entry| ProcessInfo {
                name: entry.key().clone(),
                kind: entry.value().process.kind.to_string(),
                to_node: entry.value().process.subject.to_node.clone(),
                method: entry.value().process.subject.method,
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Method;

    #[test]
    fn test_process_name_format() {
        let subject = Subject::new(Method::CliCommand, "ship1");
        assert_eq!(
            process_name(&subject, ProcessKind::Publisher),
            "ship1.REQCliCommand.EventACK.publisher"
        );
        assert_eq!(
            process_name(&subject, ProcessKind::Subscriber),
            "ship1.REQCliCommand.EventACK.subscriber"
        );
    }
}
