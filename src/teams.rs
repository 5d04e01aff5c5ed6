use anyhow::Result;
use reqwest::Client;
use serde_json::{json, Value};

use crate::http::{self, HttpRequest, HttpResponse};

pub const ADAPTIVE_CARD_CONTENT_TYPE: &str = "application/vnd.microsoft.card.adaptive";

/// Wrap an Adaptive Card in the message envelope incoming webhooks expect.
pub fn card_message(card: Value) -> Value {
    json!({
        "type": "message",
        "attachments": [{
            "contentType": ADAPTIVE_CARD_CONTENT_TYPE,
            "contentUrl": null,
            "content": card,
        }],
    })
}

/// Wrap `json` in a fenced code block so Teams renders it verbatim.
pub fn json_code_block(json: &str) -> String {
    format!("```json\n{json}\n```")
}

/// POST a plain `{ "text": ... }` message.
pub async fn post_text(client: &Client, webhook_url: &str, text: &str) -> Result<HttpResponse> {
    tracing::info!(len = text.len(), "Posting text message to Teams");
    let request = HttpRequest::post(webhook_url).json_body(&json!({ "text": text }));
    http::send(client, request).await
}

/// POST an Adaptive Card attachment.
pub async fn post_card(client: &Client, webhook_url: &str, card: Value) -> Result<HttpResponse> {
    tracing::info!("Posting adaptive card to Teams");
    let request = HttpRequest::post(webhook_url).json_body(&card_message(card));
    http::send(client, request).await
}
