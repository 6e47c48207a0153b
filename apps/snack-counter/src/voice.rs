use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::protocol::VoiceInfo;

const MEETING_TOKEN_URL: &str = "https://api.daily.co/v1/meeting-tokens";
const TOKEN_TTL_SECS: i64 = 30 * 60;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("room url carries no room name: {0}")]
    BadRoomUrl(String),
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider rejected token request: status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("provider response missing token")]
    MissingToken,
}

/// Voice-room provider adapter: issues short-lived meeting tokens for the
/// fixed room both sides join. Owns no orchestration state.
#[derive(Clone)]
pub struct VoiceClient {
    room_url: String,
    api_key: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct MeetingTokenResponse {
    token: Option<String>,
}

impl VoiceClient {
    pub fn new(room_url: String, api_key: String) -> Self {
        Self {
            room_url,
            api_key,
            client: Client::new(),
        }
    }

    /// The room name is the path component of the configured room URL.
    fn room_name(&self) -> Result<&str, VoiceError> {
        let rest = self
            .room_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.room_url);
        let name = rest
            .split_once('/')
            .map(|(_, path)| path.trim_matches('/'))
            .unwrap_or("");
        if name.is_empty() {
            return Err(VoiceError::BadRoomUrl(self.room_url.clone()));
        }
        Ok(name)
    }

    pub async fn issue_token(
        &self,
        user_name: &str,
        as_owner: bool,
    ) -> Result<VoiceInfo, VoiceError> {
        let room_name = self.room_name()?;
        let body = json!({
            "properties": {
                "room_name": room_name,
                "user_name": user_name,
                "is_owner": as_owner,
                "exp": Utc::now().timestamp() + TOKEN_TTL_SECS,
            }
        });

        let response = self
            .client
            .post(MEETING_TOKEN_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Api { status, body });
        }

        let parsed: MeetingTokenResponse = response.json().await?;
        let token = parsed.token.ok_or(VoiceError::MissingToken)?;
        Ok(VoiceInfo {
            room_url: self.room_url.clone(),
            token,
        })
    }
}
