//! Public key distribution handlers
//!
//! Nodes announce their signing key with a PublicKey message; central
//! parks announced keys until an operator allows them. Nodes poll central
//! with their store hash (KeysRequestUpdate) and receive the full key set
//! (KeysDeliverUpdate) only when the hash differs.

use std::sync::Arc;
use tracing::{debug, info};

use super::{ack_text, new_reply_message_with_default};
use crate::auth::KeysAndHash;
use crate::error::{Result, StewardError};
use crate::message::{Message, Method, SubjectAndMessage};
use crate::server::Context;

/// Announce or request a node's public signing key.
///
/// With empty data this is a request: reply with our own key, itself a
/// PublicKey message, so the requester's handler registers it. With data
/// it is an announcement: park the carried key for operator approval.
pub async fn public_key(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    if m.data.is_empty() {
        let key = ctx.auth.public_key();
        new_reply_message_with_default(ctx, m, key, Method::PublicKey).await;
        return Ok(ack_text(&ctx.config.node_name, m));
    }

    ctx.auth
        .register_announced_key(&m.from_node, m.data.clone());
    info!(node = %m.from_node, "public key announced, awaiting allow");
    Ok(ack_text(&ctx.config.node_name, m))
}

/// Central-side: a node asks whether its key set is stale. Data carries
/// the node's current store hash.
pub async fn keys_request_update(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let current = ctx.auth.keys_and_hash();

    if m.data.as_slice() == current.hash.as_slice() {
        debug!(node = %m.from_node, "key store up to date");
        return Ok(Vec::new());
    }

    let update = Message {
        to_node: m.from_node.clone(),
        from_node: ctx.config.node_name.clone(),
        method: Method::KeysDeliverUpdate,
        data: serde_cbor::to_vec(&current)?,
        ..Default::default()
    };

    let sam = SubjectAndMessage::new(update)?;
    ctx.buffer
        .push(vec![sam])
        .await
        .map_err(|e| StewardError::HandlerFailure(format!("stage key update: {e}")))?;

    info!(node = %m.from_node, "key store update staged");
    Ok(Vec::new())
}

/// Node-side: install the key set delivered from central.
pub async fn keys_deliver_update(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let update: KeysAndHash = serde_cbor::from_slice(&m.data)?;
    ctx.auth.replace_keys(update)?;
    Ok(Vec::new())
}

/// Central-side: allow a previously announced key. Args: `[node]`.
pub async fn keys_allow(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let Some(node) = m.method_args.first() else {
        return Err(StewardError::HandlerFailure(
            "keys allow needs a node name".into(),
        ));
    };

    let out = if ctx.auth.allow_key(node)? {
        format!("key for {node} allowed")
    } else {
        format!("no pending key for {node}")
    };

    super::new_reply_message(ctx, m, out.clone().into_bytes()).await;
    Ok(out.into_bytes())
}

/// Central-side: delete a node's key from the trusted set. Args: `[node]`.
pub async fn keys_delete(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let Some(node) = m.method_args.first() else {
        return Err(StewardError::HandlerFailure(
            "keys delete needs a node name".into(),
        ));
    };

    let out = if ctx.auth.delete_key(node)? {
        format!("key for {node} deleted")
    } else {
        format!("no key stored for {node}")
    };

    super::new_reply_message(ctx, m, out.clone().into_bytes()).await;
    Ok(out.into_bytes())
}
