//! Server wiring
//!
//! Builds the collaborators every worker needs (broker client, ring
//! buffer, registry, error kernel, auth state) into one shared context,
//! routes staged messages to their publisher processes and starts the
//! default subscriber set for this node.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::auth::acl::{CentralAuth, NodeAcl};
use crate::auth::NodeAuth;
use crate::config::Config;
use crate::error::{Result, StewardError};
use crate::error_kernel::{self, ErrProcess, ErrorKernel};
use crate::ingress;
use crate::message::{Message, Method, Subject, SubjectAndMessage};
use crate::process::{ProcFunc, ProcessRegistry};
use crate::ringbuffer::{RingBuffer, SamDbValue};

/// The collaborators a worker needs, injected as one shared handle.
pub struct Context {
    pub config: Config,
    pub client: async_nats::Client,
    pub buffer: RingBuffer,
    pub registry: ProcessRegistry,
    pub error_kernel: ErrorKernel,
    pub auth: NodeAuth,
    /// Canonical ACL schema, present only on the central auth node.
    pub central: Option<Mutex<CentralAuth>>,
    /// Local copy of the ACL delivered from central.
    pub node_acl: Mutex<NodeAcl>,
}

/// One running steward node.
pub struct Server {
    ctx: Arc<Context>,
    buffer_rx: mpsc::Receiver<SamDbValue>,
    error_rx: mpsc::Receiver<ErrProcess>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Connect the broker, open the store and load the auth state.
    ///
    /// Failures here are fatal: a node without its broker, store or keys
    /// cannot participate.
    pub async fn new(config: Config) -> Result<Server> {
        let client = connect_broker(&config).await?;

        let (buffer, buffer_rx) = RingBuffer::open(
            &config.database_folder.join("store"),
            config.ring_buffer_size,
        )?;

        let auth = NodeAuth::new(&config)?;
        let node_acl = NodeAcl::load(&config.database_folder)?;
        let central = config.is_central_auth.then(|| Mutex::new(CentralAuth::new()));

        let (error_kernel, error_rx) = ErrorKernel::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = Arc::new(Context {
            config,
            client,
            buffer,
            registry: ProcessRegistry::new(),
            error_kernel,
            auth,
            central,
            node_acl: Mutex::new(node_acl),
        });

        Ok(Server {
            ctx,
            buffer_rx,
            error_rx,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Run the node until SIGINT/SIGTERM, then shut down cleanly.
    pub async fn run(self) -> Result<()> {
        let Server {
            ctx,
            buffer_rx,
            error_rx,
            shutdown_tx,
            shutdown_rx,
        } = self;

        info!(node = %ctx.config.node_name, "steward starting");

        tokio::spawn(error_kernel::run_collector(ctx.clone(), error_rx));
        tokio::spawn(route_messages(
            ctx.clone(),
            buffer_rx,
            shutdown_rx.clone(),
        ));

        start_subscribers(&ctx);

        // Replay persisted records before any ingress source can add new
        // ones, keeping crash leftovers ahead of fresh traffic.
        ctx.buffer.replay().await?;

        {
            let ctx = ctx.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = ingress::run_unix_socket(ctx, shutdown_rx).await {
                    error!(error = %e, "unix socket ingress failed");
                }
            });
        }
        if let Some(addr) = ctx.config.tcp_listener.clone() {
            let ctx = ctx.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = ingress::run_tcp_listener(ctx, addr, shutdown_rx).await {
                    error!(error = %e, "tcp ingress failed");
                }
            });
        }
        if let Some(addr) = ctx.config.http_listener.clone() {
            let ctx = ctx.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = ingress::run_http_listener(ctx, addr, shutdown_rx).await {
                    error!(error = %e, "http ingress failed");
                }
            });
        }

        ingress::read_startup_folder(&ctx).await?;

        start_periodic_tasks(&ctx, &shutdown_rx);

        wait_for_signal().await;
        info!("shutdown signal received");

        let _ = shutdown_tx.send(true);
        ctx.registry.stop_all();
        // Give workers a moment to unsubscribe before the store flush.
        tokio::time::sleep(Duration::from_millis(200)).await;
        ctx.buffer.flush().await?;
        let _ = ctx.client.flush().await;

        info!("steward stopped");
        Ok(())
    }
}

async fn connect_broker(config: &Config) -> Result<async_nats::Client> {
    info!(addr = %config.broker_address, "connecting to broker");

    let client = async_nats::ConnectOptions::new()
        .name(&config.node_name)
        .ping_interval(Duration::from_secs(120))
        .connection_timeout(Duration::from_secs(5))
        .connect(config.broker_address.as_str())
        .await
        .map_err(|e| StewardError::Broker(format!("connect {}: {e}", config.broker_address)))?;

    info!(addr = %config.broker_address, "broker connected");
    Ok(client)
}

/// Drain the ring buffer output and hand each record to the publisher
/// process owning its subject, creating the publisher on first use.
async fn route_messages(
    ctx: Arc<Context>,
    mut buffer_rx: mpsc::Receiver<SamDbValue>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            maybe = buffer_rx.recv() => match maybe {
                Some(record) => {
                    let handle = ctx
                        .registry
                        .spawn_publisher(&ctx, record.sam.subject.clone());

                    let Some(message_tx) = &handle.message_tx else {
                        continue;
                    };
                    if message_tx.send(record.sam.message).await.is_err() {
                        warn!(subject = %record.sam.subject, "publisher gone, message stays persisted");
                    }
                }
                None => break,
            },
        }
    }
}

/// The subscriber set this node serves at boot.
fn start_subscribers(ctx: &Arc<Context>) {
    let node = ctx.config.node_name.clone();

    let standard = [
        Method::CliCommand,
        Method::CliCommandCont,
        Method::ToFileAppend,
        Method::ToFile,
        Method::CopyFileFrom,
        Method::CopyFileTo,
        Method::Ping,
        Method::Pong,
        Method::HttpGet,
        Method::TailFile,
        Method::OpProcessList,
        Method::OpProcessStart,
        Method::OpProcessStop,
        Method::Relay,
        Method::Test,
        Method::PublicKey,
        Method::KeysDeliverUpdate,
        Method::AclDeliverUpdate,
    ];
    for method in standard {
        ctx.registry.spawn_subscriber(
            ctx,
            Subject::new(method, &node),
            vec!["*".to_string()],
            None,
        );
    }

    if node == ctx.config.central_node_name {
        ctx.registry.spawn_subscriber(
            ctx,
            Subject::new(Method::Hello, &node),
            vec!["*".to_string()],
            Some(hello_actor()),
        );
    }

    if node == ctx.config.error_central_node {
        ctx.registry.spawn_subscriber(
            ctx,
            Subject::new(Method::ErrorLog, &node),
            vec!["*".to_string()],
            None,
        );
    }

    if ctx.config.is_central_auth {
        let central_only = [
            Method::KeysRequestUpdate,
            Method::KeysAllow,
            Method::KeysDelete,
            Method::AclRequestUpdate,
            Method::AclAddCommand,
            Method::AclDeleteCommand,
            Method::AclDeleteSource,
            Method::AclGroupNodesAddNode,
            Method::AclGroupNodesDeleteNode,
            Method::AclGroupNodesDeleteGroup,
            Method::AclGroupCommandsAddCommand,
            Method::AclGroupCommandsDeleteCommand,
            Method::AclGroupCommandsDeleteGroup,
            Method::AclExport,
            Method::AclImport,
        ];
        for method in central_only {
            ctx.registry.spawn_subscriber(
                ctx,
                Subject::new(method, &node),
                vec!["*".to_string()],
                None,
            );
        }
    }
}

/// Stateful actor owning the set of nodes that have greeted central.
fn hello_actor() -> ProcFunc {
    Box::new(move |mut rx, mut shutdown_rx| {
        Box::pin(async move {
            let mut greeted: HashSet<String> = HashSet::new();
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    maybe = rx.recv() => match maybe {
                        Some(m) => {
                            if greeted.insert(m.from_node.clone()) {
                                info!(node = %m.from_node, total = greeted.len(), "new node said hello");
                            } else {
                                debug!(node = %m.from_node, "hello from known node");
                            }
                        }
                        None => break,
                    },
                }
            }
        })
    })
}

fn start_periodic_tasks(ctx: &Arc<Context>, shutdown_rx: &watch::Receiver<bool>) {
    if ctx.config.start_pub_hello_secs > 0 {
        let interval = Duration::from_secs(ctx.config.start_pub_hello_secs);
        spawn_ticker(ctx, shutdown_rx, interval, |ctx| Message {
            to_node: ctx.config.central_node_name.clone(),
            from_node: ctx.config.node_name.clone(),
            method: Method::Hello,
            data: format!("Hello from {}", ctx.config.node_name).into_bytes(),
            ..Default::default()
        });
    }

    let interval = Duration::from_secs(ctx.config.auth_update_interval_secs.max(1));

    if ctx.config.enable_acl_check {
        spawn_ticker(ctx, shutdown_rx, interval, |ctx| Message {
            to_node: ctx.config.central_node_name.clone(),
            from_node: ctx.config.node_name.clone(),
            method: Method::AclRequestUpdate,
            data: Vec::new(),
            ..Default::default()
        });
    }

    if ctx.config.enable_signature_check {
        spawn_ticker(ctx, shutdown_rx, interval, |ctx| Message {
            to_node: ctx.config.central_node_name.clone(),
            from_node: ctx.config.node_name.clone(),
            method: Method::KeysRequestUpdate,
            data: Vec::new(),
            ..Default::default()
        });
    }
}

/// Periodically stage a message built from current node state.
fn spawn_ticker(
    ctx: &Arc<Context>,
    shutdown_rx: &watch::Receiver<bool>,
    interval: Duration,
    build: impl Fn(&Arc<Context>) -> Message + Send + 'static,
) {
    let ctx = ctx.clone();
    let mut shutdown_rx = shutdown_rx.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    let mut m = build(&ctx);

                    // Update-request messages carry the current local hash.
                    match m.method {
                        Method::AclRequestUpdate => {
                            m.data = ctx.node_acl.lock().await.hash().to_vec();
                        }
                        Method::KeysRequestUpdate => {
                            m.data = ctx.auth.keys_and_hash().hash.to_vec();
                        }
                        _ => {}
                    }

                    let sam = match SubjectAndMessage::new(m) {
                        Ok(sam) => sam,
                        Err(e) => {
                            error!(error = %e, "periodic message invalid");
                            continue;
                        }
                    };
                    if let Err(e) = ctx.buffer.push(vec![sam]).await {
                        warn!(error = %e, "periodic message not staged");
                    }
                }
            }
        }
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "sigterm handler failed, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
