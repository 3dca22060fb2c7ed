//! Network handlers

use std::sync::Arc;
use tracing::debug;

use super::{ack_text, method_timeout, new_reply_message};
use crate::error::{Result, StewardError};
use crate::message::Message;
use crate::server::Context;

/// Fetch a URL and reply with the response body. Args: `[url]`.
pub async fn http_get(ctx: &Arc<Context>, m: &Message) -> Result<Vec<u8>> {
    let Some(url) = m.method_args.first() else {
        return Err(StewardError::HandlerFailure(
            "http get needs a url in method args".into(),
        ));
    };

    let client = reqwest::Client::builder()
        .timeout(method_timeout(m))
        .build()
        .map_err(|e| StewardError::HandlerFailure(format!("http client: {e}")))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| StewardError::HandlerFailure(format!("GET {url}: {e}")))?;

    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| StewardError::HandlerFailure(format!("read body from {url}: {e}")))?;

    debug!(url, status = %status, bytes = body.len(), "http get done");

    new_reply_message(ctx, m, body.to_vec()).await;
    Ok(ack_text(&ctx.config.node_name, m))
}
