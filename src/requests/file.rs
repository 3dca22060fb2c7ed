//! File handlers: reply output sinks, file copy and tailing

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::{ack_text, method_timeout, new_reply_message, select_file_naming};
use crate::error::{Result, StewardError};
use crate::message::{Message, Method, SubjectAndMessage};
use crate::server::Context;

/// Append the message data to the file resolved by the naming policy.
pub async fn to_file_append(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    write_data_file(ctx, m, true).await?;
    Ok(ack_text(&ctx.config.node_name, m))
}

/// Overwrite the file resolved by the naming policy with the message data.
pub async fn to_file(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    write_data_file(ctx, m, false).await?;
    Ok(ack_text(&ctx.config.node_name, m))
}

/// Sink for ErrorLog messages arriving at the error-central node.
pub async fn error_log(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let mut m = m.clone();
    if m.directory.is_empty() {
        m.directory = "errorLog".to_string();
    }
    if m.file_name.is_empty() {
        m.file_name = format!("{}.log", m.from_node);
    }
    write_data_file(ctx, &m, true).await?;
    Ok(ack_text(&ctx.config.node_name, &m))
}

async fn write_data_file(ctx: &Arc<Context>, m: &Message, append: bool) -> Result<()> {
    let (file_name, folder) = select_file_naming(m, &ctx.config.subscribers_data_folder);
    if file_name.is_empty() {
        return Err(StewardError::HandlerFailure(
            "no file name in message or previous message".into(),
        ));
    }

    tokio::fs::create_dir_all(&folder).await?;
    let path = folder.join(&file_name);

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(append)
        .write(true)
        .truncate(!append)
        .open(&path)
        .await?;
    file.write_all(&m.data).await?;
    file.flush().await?;

    debug!(path = %path.display(), bytes = m.data.len(), append, "wrote handler output");
    Ok(())
}

/// Read a file on this node and stage a CopyFileTo message that writes it
/// on the destination. Args: `[src_path, dst_node, dst_path]`.
pub async fn copy_file_from(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let [src, dst_node, dst_path] = m.method_args.as_slice() else {
        return Err(StewardError::HandlerFailure(
            "copy needs args [src_path, dst_node, dst_path]".into(),
        ));
    };

    let data = tokio::fs::read(src)
        .await
        .map_err(|e| StewardError::HandlerFailure(format!("read {src}: {e}")))?;

    let copy = Message {
        to_node: dst_node.clone(),
        from_node: m.to_node.clone(),
        method: Method::CopyFileTo,
        method_args: vec![dst_path.clone()],
        data,
        ack_timeout: m.ack_timeout,
        retries: m.retries,
        method_timeout: m.method_timeout,
        ..Default::default()
    };

    let sam = SubjectAndMessage::new(copy)?;
    ctx.buffer
        .push(vec![sam])
        .await
        .map_err(|e| StewardError::HandlerFailure(format!("stage copy message: {e}")))?;

    Ok(ack_text(&ctx.config.node_name, m))
}

/// Write the carried file data to the destination path. Args: `[dst_path]`.
pub async fn copy_file_to(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let Some(dst) = m.method_args.first() else {
        return Err(StewardError::HandlerFailure(
            "copy target path missing in method args".into(),
        ));
    };

    let path = PathBuf::from(dst);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, &m.data).await?;

    debug!(path = %path.display(), bytes = m.data.len(), "file copied in");
    Ok(ack_text(&ctx.config.node_name, m))
}

/// Follow a file and stream appended data back until the method deadline.
/// Args: `[path]`.
pub async fn tail_file(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let Some(path) = m.method_args.first() else {
        return Err(StewardError::HandlerFailure(
            "tail needs a file path in method args".into(),
        ));
    };

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| StewardError::HandlerFailure(format!("open {path}: {e}")))?;
    let mut pos = file.seek(SeekFrom::End(0)).await?;

    let deadline = tokio::time::Instant::now()
        + method_timeout(m).saturating_sub(Duration::from_millis(200));
    let mut poll = tokio::time::interval(Duration::from_millis(500));

    loop {
        if tokio::time::timeout_at(deadline, poll.tick()).await.is_err() {
            break;
        }

        let len = file.metadata().await?.len();
        if len < pos {
            // Truncated underneath us, start over from the top.
            pos = 0;
        }
        if len == pos {
            continue;
        }

        file.seek(SeekFrom::Start(pos)).await?;
        let mut chunk = vec![0u8; (len - pos) as usize];
        file.read_exact(&mut chunk).await?;
        pos = len;

        new_reply_message(ctx, m, chunk).await;
    }

    Ok(ack_text(&ctx.config.node_name, m))
}
