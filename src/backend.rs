//! Typed wrappers over the remote chat service (spec §4.3).
//!
//! The teacher (`examples/not-wlan-discord-fuse`) wraps this concern with
//! `serenity::http::Http`. DCFS drops that dependency in favor of a direct
//! `reqwest` client: the spec's wire table pins an exact JSON contract
//! (literal `permission_overwrites` bodies, a `files[i]` multipart field
//! name, a fixed `/api/v9` base path) that a Discord-branded model crate
//! would reinterpret through its own builders rather than expose directly.
//! See DESIGN.md for the full rationale. The shape of the client — one
//! struct holding a shared `reqwest::Client` and carrying the token on every
//! request — mirrors the teacher's single shared `&Http` held for the
//! process lifetime.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::codec;
use crate::error::DcfsError;
use crate::snowflake::Snowflake;

/// Channel type code the backend uses for an ordinary text channel.
pub const CHANNEL_TYPE_GUILD_TEXT: u8 = 0;

#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub id: Snowflake,
    pub name: String,
    pub kind: u8,
    pub has_parent: bool,
}

impl ChannelRecord {
    /// Invariant 6: a channel is a listable directory iff it is a guild
    /// text channel with no parent category.
    pub fn is_listable(&self) -> bool {
        self.kind == CHANNEL_TYPE_GUILD_TEXT && !self.has_parent
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub encoded_filename: String,
    pub size: u64,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: Snowflake,
    pub attachments: Vec<AttachmentRecord>,
}

#[derive(Debug, Deserialize)]
struct ChannelJson {
    id: String,
    name: String,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    parent_id: Option<String>,
}

impl TryFrom<ChannelJson> for ChannelRecord {
    type Error = DcfsError;

    fn try_from(c: ChannelJson) -> Result<Self, Self::Error> {
        Ok(ChannelRecord {
            id: c.id.parse()?,
            name: c.name,
            kind: c.kind,
            has_parent: c.parent_id.is_some(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct AttachmentJson {
    filename: String,
    size: u64,
    url: String,
}

#[derive(Debug, Deserialize)]
struct MessageJson {
    id: String,
    #[serde(default)]
    attachments: Vec<AttachmentJson>,
}

impl TryFrom<MessageJson> for MessageRecord {
    type Error = DcfsError;

    fn try_from(m: MessageJson) -> Result<Self, Self::Error> {
        Ok(MessageRecord {
            id: m.id.parse()?,
            attachments: m
                .attachments
                .into_iter()
                .map(|a| AttachmentRecord {
                    encoded_filename: a.filename,
                    size: a.size,
                    url: a.url,
                })
                .collect(),
        })
    }
}

/// One (decoded-name, bytes) pair handed to `create_attachments`.
pub struct PendingAttachment {
    pub decoded_filename: Vec<u8>,
    pub bytes: Vec<u8>,
}

/// Backend operations DCFS needs, abstracted so the dispatcher and the
/// upload/download pipelines can be exercised against a mock in tests
/// without real HTTPS traffic (spec §2.1 "Test tooling").
#[async_trait]
pub trait Backend: Send + Sync {
    async fn list_channels(&self, guild: Snowflake) -> Result<Vec<ChannelRecord>, DcfsError>;
    async fn create_channel(&self, guild: Snowflake, name: &str) -> Result<ChannelRecord, DcfsError>;
    async fn rename_channel(&self, channel: Snowflake, new_name: &str) -> Result<(), DcfsError>;
    async fn delete_channel(&self, channel: Snowflake) -> Result<(), DcfsError>;
    /// Pages by `before = last.id` until a page of fewer than 100 returns,
    /// per spec §4.3.
    async fn list_messages(&self, channel: Snowflake) -> Result<Vec<MessageRecord>, DcfsError>;
    /// `parts` must contain between 1 and `BATCH_SIZE` pairs.
    async fn create_attachments(
        &self,
        channel: Snowflake,
        parts: Vec<PendingAttachment>,
    ) -> Result<MessageRecord, DcfsError>;
    async fn delete_message(&self, channel: Snowflake, message: Snowflake) -> Result<(), DcfsError>;
    /// Fetches an attachment's CDN URL. Not one of the named wire
    /// endpoints — the original treats these as opaque links
    /// (`examples/original_source/src/request.c`).
    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, DcfsError>;
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(token: &str, base_url: &str) -> Result<Self, DcfsError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(token).map_err(|_| DcfsError::Invalid)?,
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(DcfsError::Transport)?;
        Ok(HttpBackend {
            client,
            base_url: base_url.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn expect_status(resp: reqwest::Response) -> Result<reqwest::Response, DcfsError> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(DcfsError::Http(status.as_u16()))
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn list_channels(&self, guild: Snowflake) -> Result<Vec<ChannelRecord>, DcfsError> {
        let resp = self
            .client
            .get(self.url(&format!("/guilds/{guild}/channels")))
            .send()
            .await?;
        let resp = Self::expect_status(resp).await?;
        let channels: Vec<ChannelJson> = resp
            .json()
            .await
            .map_err(|e| DcfsError::Parse(e.to_string()))?;
        channels.into_iter().map(ChannelRecord::try_from).collect()
    }

    async fn create_channel(&self, guild: Snowflake, name: &str) -> Result<ChannelRecord, DcfsError> {
        let body = json!({
            "name": name,
            "type": CHANNEL_TYPE_GUILD_TEXT,
            "permission_overwrites": [
                {"id": guild.to_string(), "type": 0, "allow": "0", "deny": "1024"}
            ],
        });
        let resp = self
            .client
            .post(self.url(&format!("/guilds/{guild}/channels")))
            .json(&body)
            .send()
            .await?;
        let resp = Self::expect_status(resp).await?;
        let channel: ChannelJson = resp.json().await.map_err(|e| DcfsError::Parse(e.to_string()))?;
        channel.try_into()
    }

    async fn rename_channel(&self, channel: Snowflake, new_name: &str) -> Result<(), DcfsError> {
        let resp = self
            .client
            .patch(self.url(&format!("/channels/{channel}")))
            .json(&json!({ "name": new_name }))
            .send()
            .await?;
        Self::expect_status(resp).await?;
        Ok(())
    }

    async fn delete_channel(&self, channel: Snowflake) -> Result<(), DcfsError> {
        let resp = self
            .client
            .delete(self.url(&format!("/channels/{channel}")))
            .send()
            .await?;
        Self::expect_status(resp).await?;
        Ok(())
    }

    async fn list_messages(&self, channel: Snowflake) -> Result<Vec<MessageRecord>, DcfsError> {
        let mut all = Vec::new();
        let mut before: Option<Snowflake> = None;
        loop {
            let path = match before {
                Some(b) => format!("/channels/{channel}/messages?limit=100&before={b}"),
                None => format!("/channels/{channel}/messages?limit=100"),
            };
            let resp = self.client.get(self.url(&path)).send().await?;
            let resp = Self::expect_status(resp).await?;
            let page: Vec<MessageJson> =
                resp.json().await.map_err(|e| DcfsError::Parse(e.to_string()))?;
            let page_len = page.len();
            let mut records = page
                .into_iter()
                .map(MessageRecord::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            before = records.last().map(|m| m.id);
            all.append(&mut records);
            if page_len < 100 {
                break;
            }
        }
        Ok(all)
    }

    async fn create_attachments(
        &self,
        channel: Snowflake,
        parts: Vec<PendingAttachment>,
    ) -> Result<MessageRecord, DcfsError> {
        debug_assert!(!parts.is_empty() && parts.len() <= crate::config::BATCH_SIZE);
        let mut form = reqwest::multipart::Form::new();
        for (i, part) in parts.into_iter().enumerate() {
            let encoded_name = codec::encode(&part.decoded_filename);
            let file_part = reqwest::multipart::Part::bytes(part.bytes).file_name(encoded_name);
            form = form.part(format!("files[{i}]"), file_part);
        }
        let resp = self
            .client
            .post(self.url(&format!("/channels/{channel}/messages")))
            .multipart(form)
            .send()
            .await?;
        let resp = Self::expect_status(resp).await?;
        let message: MessageJson = resp.json().await.map_err(|e| DcfsError::Parse(e.to_string()))?;
        message.try_into()
    }

    async fn delete_message(&self, channel: Snowflake, message: Snowflake) -> Result<(), DcfsError> {
        let resp = self
            .client
            .delete(self.url(&format!("/channels/{channel}/messages/{message}")))
            .send()
            .await?;
        Self::expect_status(resp).await?;
        Ok(())
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, DcfsError> {
        let resp = self.client.get(url).send().await?;
        let resp = Self::expect_status(resp).await?;
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| DcfsError::Io(e.to_string()))
    }
}
