//! REST client for one gateway instance.

use crate::config::InstanceCredentials;
use crate::error::GatewayError;
use log::debug;
use serde_json::{Value, json};
use std::sync::Arc;
use whatsapp_console_core::net::{HttpClient, HttpRequest, HttpResponse};
use whatsapp_console_core::proto::{self, ProtoError, STREAM_EVENTS};
use whatsapp_console_core::types::{
    ChatSummary, IncomingMessage, MessageContent, ProfileInfo, SentReceipt,
};

pub const TOKEN_HEADER: &str = "token";

#[derive(Clone)]
pub struct GatewayClient {
    http: Arc<dyn HttpClient>,
    base_url: String,
    credentials: InstanceCredentials,
}

impl GatewayClient {
    pub fn new(
        http: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
        credentials: InstanceCredentials,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    pub fn credentials(&self) -> &InstanceCredentials {
        &self.credentials
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Request for the push-event stream, subscribed to every event kind the
    /// console consumes.
    pub fn stream_request(&self) -> HttpRequest {
        let url = format!(
            "{}/sse?token={}&events={}",
            self.base_url,
            urlencoding::encode(&self.credentials.token),
            urlencoding::encode(&STREAM_EVENTS.join(","))
        );
        HttpRequest::get(url)
            .with_header(TOKEN_HEADER, self.credentials.token.clone())
            .with_header("Accept", "text/event-stream")
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, GatewayError> {
        let method = request.method.clone();
        let url = request.url.clone();
        let request = request.with_header(TOKEN_HEADER, self.credentials.token.clone());
        let response = self.http.execute(request).await?;
        debug!(target: "Console/Gateway", "{method} {url} -> {}", response.status_code);
        if !response.is_success() {
            return Err(GatewayError::Status {
                status: response.status_code,
                body: response.body_text(),
            });
        }
        Ok(response)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, GatewayError> {
        let request = HttpRequest::post(self.url(path)).with_json(body)?;
        decode(self.execute(request).await?)
    }

    async fn get_json(&self, path: &str) -> Result<Value, GatewayError> {
        decode(self.execute(HttpRequest::get(self.url(path))).await?)
    }

    pub async fn send(
        &self,
        chat_id: &str,
        content: &MessageContent,
    ) -> Result<SentReceipt, GatewayError> {
        let (path, body) = proto::send_request(chat_id, content)?;
        let response = self.post_json(path, &body).await?;
        Ok(proto::parse_send_response(&response)?)
    }

    pub async fn find_chats(&self) -> Result<Vec<ChatSummary>, GatewayError> {
        let response = self.post_json("/chat/find", &json!({})).await?;
        Ok(proto::parse_chat_list(&response)?)
    }

    pub async fn find_messages(
        &self,
        chat_id: &str,
        limit: u32,
    ) -> Result<Vec<IncomingMessage>, GatewayError> {
        let response = self
            .post_json("/message/find", &json!({ "chatId": chat_id, "limit": limit }))
            .await?;
        Ok(proto::parse_message_list(&response, chat_id)?)
    }

    pub async fn fetch_profile(&self, number: &str) -> Result<ProfileInfo, GatewayError> {
        let response = self
            .post_json("/chat/profile", &json!({ "number": number }))
            .await?;
        Ok(proto::parse_profile(&response))
    }

    /// Out-of-band liveness check of the instance's WhatsApp session.
    pub async fn instance_connected(&self) -> Result<bool, GatewayError> {
        let response = self.get_json("/instance/status").await?;
        Ok(proto::parse_instance_connected(&response)?)
    }

    pub async fn mark_read(&self, chat_id: &str) -> Result<(), GatewayError> {
        let request =
            HttpRequest::post(self.url("/chat/read")).with_json(&json!({ "chatId": chat_id }))?;
        self.execute(request).await?;
        Ok(())
    }
}

fn decode(response: HttpResponse) -> Result<Value, GatewayError> {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    response
        .json()
        .map_err(|e| GatewayError::Decode(ProtoError::from(e)))
}
