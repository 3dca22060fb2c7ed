//! ACL schema handlers
//!
//! Mutations run only where the central auth schema is enabled; every
//! mutation regenerates the per-host materialization. Distribution mirrors
//! the key protocol: nodes poll with their hash, central delivers the
//! payload when it differs.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ack_text, new_reply_message};
use crate::auth::acl::CentralAuth;
use crate::error::{Result, StewardError};
use crate::message::{Message, Method, SubjectAndMessage};
use crate::server::Context;

fn central(ctx: &Arc<Context>) -> Result<&Mutex<CentralAuth>> {
    ctx.central.as_ref().ok_or_else(|| {
        StewardError::HandlerFailure("acl schema not maintained on this node".into())
    })
}

fn three_args(m: &Message) -> Result<(&str, &str, &str)> {
    match m.method_args.as_slice() {
        [a, b, c] => Ok((a, b, c)),
        _ => Err(StewardError::HandlerFailure(format!(
            "{} needs three args, got {}",
            m.method,
            m.method_args.len()
        ))),
    }
}

fn two_args(m: &Message) -> Result<(&str, &str)> {
    match m.method_args.as_slice() {
        [a, b] => Ok((a, b)),
        _ => Err(StewardError::HandlerFailure(format!(
            "{} needs two args, got {}",
            m.method,
            m.method_args.len()
        ))),
    }
}

fn one_arg(m: &Message) -> Result<&str> {
    match m.method_args.as_slice() {
        [a] => Ok(a),
        _ => Err(StewardError::HandlerFailure(format!(
            "{} needs one arg, got {}",
            m.method,
            m.method_args.len()
        ))),
    }
}

async fn confirm(ctx: &Arc<Context>, m: &Message, text: String) -> Result<Vec<u8>> {
    new_reply_message(ctx, m, text.into_bytes()).await;
    Ok(ack_text(&ctx.config.node_name, m))
}

/// Args: `[host, source, command]`.
pub async fn acl_add_command(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let (host, source, command) = three_args(m)?;
    central(ctx)?.lock().await.acl_add_command(host, source, command);
    confirm(ctx, m, format!("acl added: {host} {source} {command}")).await
}

/// Args: `[host, source, command]`.
pub async fn acl_delete_command(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let (host, source, command) = three_args(m)?;
    central(ctx)?.lock().await.acl_delete_command(host, source, command);
    confirm(ctx, m, format!("acl deleted: {host} {source} {command}")).await
}

/// Args: `[host, source]`.
pub async fn acl_delete_source(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let (host, source) = two_args(m)?;
    central(ctx)?.lock().await.acl_delete_source(host, source);
    confirm(ctx, m, format!("acl source deleted: {host} {source}")).await
}

/// Args: `[group, node]`.
pub async fn group_nodes_add_node(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let (group, node) = two_args(m)?;
    central(ctx)?.lock().await.group_nodes_add_node(group, node);
    confirm(ctx, m, format!("node {node} added to {group}")).await
}

/// Args: `[group, node]`.
pub async fn group_nodes_delete_node(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let (group, node) = two_args(m)?;
    central(ctx)?.lock().await.group_nodes_delete_node(group, node);
    confirm(ctx, m, format!("node {node} deleted from {group}")).await
}

/// Args: `[group]`.
pub async fn group_nodes_delete_group(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let group = one_arg(m)?;
    central(ctx)?.lock().await.group_nodes_delete_group(group);
    confirm(ctx, m, format!("node group {group} deleted")).await
}

/// Args: `[group, command]`.
pub async fn group_commands_add_command(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let (group, command) = two_args(m)?;
    central(ctx)?.lock().await.group_commands_add_command(group, command);
    confirm(ctx, m, format!("command {command} added to {group}")).await
}

/// Args: `[group, command]`.
pub async fn group_commands_delete_command(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let (group, command) = two_args(m)?;
    central(ctx)?
        .lock()
        .await
        .group_commands_delete_command(group, command);
    confirm(ctx, m, format!("command {command} deleted from {group}")).await
}

/// Args: `[group]`.
pub async fn group_commands_delete_group(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let group = one_arg(m)?;
    central(ctx)?.lock().await.group_commands_delete_group(group);
    confirm(ctx, m, format!("command group {group} deleted")).await
}

/// Reply with the serialized source schema.
pub async fn acl_export(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let exported = central(ctx)?.lock().await.export()?;
    new_reply_message(ctx, m, exported).await;
    Ok(ack_text(&ctx.config.node_name, m))
}

/// Replace the source schema with the carried export and regenerate.
pub async fn acl_import(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    central(ctx)?.lock().await.import(&m.data)?;
    confirm(ctx, m, "acl schema imported".to_string()).await
}

/// Central-side: a node asks whether its ACL is stale. Data carries the
/// node's current hash.
pub async fn acl_request_update(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let central = central(ctx)?.lock().await;

    let Some(generated) = central.generated_for(&m.from_node) else {
        debug!(node = %m.from_node, "no acl generated for node");
        return Ok(Vec::new());
    };

    if m.data.as_slice() == generated.hash.as_slice() {
        debug!(node = %m.from_node, "node acl up to date");
        return Ok(Vec::new());
    }

    let update = Message {
        to_node: m.from_node.clone(),
        from_node: ctx.config.node_name.clone(),
        method: Method::AclDeliverUpdate,
        data: serde_cbor::to_vec(generated)?,
        ..Default::default()
    };
    drop(central);

    let sam = SubjectAndMessage::new(update)?;
    ctx.buffer
        .push(vec![sam])
        .await
        .map_err(|e| StewardError::HandlerFailure(format!("stage acl update: {e}")))?;

    info!(node = %m.from_node, "acl update staged");
    Ok(Vec::new())
}

/// Node-side: install the ACL delivered from central.
pub async fn acl_deliver_update(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    ctx.node_acl.lock().await.replace(&m.data)?;
    Ok(Vec::new())
}
