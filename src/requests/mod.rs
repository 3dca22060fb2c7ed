//! Method dispatch and reply routing
//!
//! Every subscriber delivery ends up here: the closed method enum maps to
//! its handler, the handler runs under the message's method timeout, and
//! handlers that produce output feed a reply message back into the local
//! ring buffer where it traverses the full publisher path home.

mod acl;
mod cli;
mod file;
mod keys;
mod net;
mod ops;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{Result, StewardError};
use crate::message::{Message, Method, SubjectAndMessage};
use crate::process::Process;
use crate::server::Context;

/// Sentinel for "no limit": far enough out that no test or deployment
/// ever reaches it.
const NO_TIMEOUT: Duration = Duration::from_secs(200 * 365 * 24 * 3600);

/// The handler deadline derived from the message.
pub fn method_timeout(m: &Message) -> Duration {
    if m.method_timeout < 0 {
        NO_TIMEOUT
    } else {
        Duration::from_secs(m.method_timeout as u64)
    }
}

/// Run the method handler for a message under its deadline.
pub async fn invoke(ctx: &Arc<Context>, proc: &Process, m: &Message) -> Result<Vec<u8>> {
    match tokio::time::timeout(method_timeout(m), dispatch(ctx, proc, m)).await {
        Ok(result) => result,
        Err(_) => Err(StewardError::HandlerFailure(format!(
            "method {} timed out after {}s",
            m.method, m.method_timeout
        ))),
    }
}

async fn dispatch(ctx: &Arc<Context>, proc: &Process, m: &Message) -> Result<Vec<u8>> {
    match m.method {
        Method::CliCommand => cli::cli_command(ctx, m).await,
        Method::CliCommandCont => cli::cli_command_cont(ctx, m).await,
        Method::ToFileAppend => file::to_file_append(ctx, m).await,
        Method::ToFile => file::to_file(ctx, m).await,
        Method::CopyFileFrom => file::copy_file_from(ctx, m).await,
        Method::CopyFileTo => file::copy_file_to(ctx, m).await,
        Method::TailFile => file::tail_file(ctx, m).await,
        Method::ErrorLog => file::error_log(ctx, m).await,
        Method::HttpGet => net::http_get(ctx, m).await,
        Method::Hello => ops::hello(ctx, proc, m).await,
        Method::Ping => ops::ping(ctx, m).await,
        Method::Pong => ops::pong(ctx, m).await,
        Method::OpProcessList => ops::op_process_list(ctx, m).await,
        Method::OpProcessStart => ops::op_process_start(ctx, m).await,
        Method::OpProcessStop => ops::op_process_stop(ctx, m).await,
        Method::Relay => ops::relay(ctx, m).await,
        Method::Test => ops::test(ctx, m).await,
        Method::None => Ok(Vec::new()),
        Method::PublicKey => keys::public_key(ctx, m).await,
        Method::KeysRequestUpdate => keys::keys_request_update(ctx, m).await,
        Method::KeysDeliverUpdate => keys::keys_deliver_update(ctx, m).await,
        Method::KeysAllow => keys::keys_allow(ctx, m).await,
        Method::KeysDelete => keys::keys_delete(ctx, m).await,
        Method::AclRequestUpdate => acl::acl_request_update(ctx, m).await,
        Method::AclDeliverUpdate => acl::acl_deliver_update(ctx, m).await,
        Method::AclAddCommand => acl::acl_add_command(ctx, m).await,
        Method::AclDeleteCommand => acl::acl_delete_command(ctx, m).await,
        Method::AclDeleteSource => acl::acl_delete_source(ctx, m).await,
        Method::AclGroupNodesAddNode => acl::group_nodes_add_node(ctx, m).await,
        Method::AclGroupNodesDeleteNode => acl::group_nodes_delete_node(ctx, m).await,
        Method::AclGroupNodesDeleteGroup => acl::group_nodes_delete_group(ctx, m).await,
        Method::AclGroupCommandsAddCommand => acl::group_commands_add_command(ctx, m).await,
        Method::AclGroupCommandsDeleteCommand => acl::group_commands_delete_command(ctx, m).await,
        Method::AclGroupCommandsDeleteGroup => acl::group_commands_delete_group(ctx, m).await,
        Method::AclExport => acl::acl_export(ctx, m).await,
        Method::AclImport => acl::acl_import(ctx, m).await,
    }
}

/// Standard ACK confirmation payload.
pub(crate) fn ack_text(node: &str, m: &Message) -> Vec<u8> {
    format!("confirmed from {}: {}", node, m.id).into_bytes()
}

/// Build the reply carrying handler output and stage it on the local ring
/// buffer, from where it traverses the full publisher path back.
///
/// The reply method defaults to `ToFileAppend`; `None` suppresses the
/// reply entirely. A data-stripped copy of the request rides along so the
/// receiving side can reconstruct file placement.
pub(crate) async fn new_reply_message(ctx: &Arc<Context>, m: &Message, out: Vec<u8>) {
    new_reply_message_with_default(ctx, m, out, Method::ToFileAppend).await;
}

pub(crate) async fn new_reply_message_with_default(
    ctx: &Arc<Context>,
    m: &Message,
    out: Vec<u8>,
    default_method: Method,
) {
    let reply_method = match m.reply_method {
        Some(Method::None) => return,
        Some(method) => method,
        None => default_method,
    };

    let reply = Message {
        to_node: m.from_node.clone(),
        from_node: m.to_node.clone(),
        data: out,
        method: reply_method,
        method_args: m.reply_method_args.clone(),
        method_timeout: m.reply_method_timeout,
        ack_timeout: m.reply_ack_timeout,
        retries: m.reply_retries,
        directory: m.directory.clone(),
        file_name: m.file_name.clone(),
        is_reply: true,
        previous_message: Some(Box::new(m.stripped())),
        ..Default::default()
    };

    let sam = match SubjectAndMessage::new(reply) {
        Ok(sam) => sam,
        Err(e) => {
            warn!(error = %e, method = %m.method, "could not build reply message");
            return;
        }
    };

    if let Err(e) = ctx.buffer.push(vec![sam]).await {
        warn!(error = %e, "reply message not staged");
    }
}

/// Resolve where a file-writing handler puts its output.
///
/// Replies carry the original request in `previous_message`; its fields
/// win so output lands under the folder of the node the request targeted.
pub fn select_file_naming(m: &Message, data_folder: &Path) -> (String, PathBuf) {
    match &m.previous_message {
        None => (
            m.file_name.clone(),
            data_folder.join(&m.directory).join(&m.to_node),
        ),
        Some(prev) if !prev.to_node.is_empty() => (
            prev.file_name.clone(),
            data_folder.join(&prev.directory).join(&prev.to_node),
        ),
        Some(prev) => (
            prev.file_name.clone(),
            data_folder.join(&prev.directory).join(&m.from_node),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_timeout_sentinel() {
        let mut m = Message {
            method_timeout: -1,
            ..Default::default()
        };
        assert_eq!(method_timeout(&m), NO_TIMEOUT);

        m.method_timeout = 10;
        assert_eq!(method_timeout(&m), Duration::from_secs(10));
    }

    #[test]
    fn test_file_naming_direct_request() {
        let m = Message {
            to_node: "ship1".into(),
            directory: "cmd_result".into(),
            file_name: "out.log".into(),
            ..Default::default()
        };
        let (name, folder) = select_file_naming(&m, Path::new("/data"));
        assert_eq!(name, "out.log");
        assert_eq!(folder, PathBuf::from("/data/cmd_result/ship1"));
    }

    #[test]
    fn test_file_naming_reply_uses_previous() {
        let prev = Message {
            to_node: "ship1".into(),
            directory: "foo".into(),
            file_name: "bar.log".into(),
            ..Default::default()
        };
        let m = Message {
            to_node: "central".into(),
            from_node: "ship1".into(),
            directory: "ignored".into(),
            file_name: "ignored.log".into(),
            is_reply: true,
            previous_message: Some(Box::new(prev)),
            ..Default::default()
        };
        let (name, folder) = select_file_naming(&m, Path::new("/data"));
        assert_eq!(name, "bar.log");
        assert_eq!(folder, PathBuf::from("/data/foo/ship1"));
    }

    #[test]
    fn test_file_naming_previous_without_to_node() {
        let prev = Message {
            directory: "foo".into(),
            file_name: "bar.log".into(),
            ..Default::default()
        };
        let m = Message {
            to_node: "central".into(),
            from_node: "ship1".into(),
            previous_message: Some(Box::new(prev)),
            ..Default::default()
        };
        let (name, folder) = select_file_naming(&m, Path::new("/data"));
        assert_eq!(name, "bar.log");
        assert_eq!(folder, PathBuf::from("/data/foo/ship1"));
    }
}
