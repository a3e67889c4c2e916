//! End-to-end exercises of the namespace/upload/download pipeline against an
//! in-memory mock backend, standing in for the kernel-facing FUSE layer
//! (which cannot be driven in a unit test: `fuser::Request`/`Reply*` are
//! only constructible from a live kernel channel). These cover the same
//! ground the dispatcher would: create a channel, upload a file in one or
//! many parts, read it back, delete it, and refuse an oversized upload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use dcfs::backend::{AttachmentRecord, Backend, ChannelRecord, MessageRecord, PendingAttachment, CHANNEL_TYPE_GUILD_TEXT};
use dcfs::codec;
use dcfs::config::Limits;
use dcfs::download;
use dcfs::error::DcfsError;
use dcfs::namespace::Namespace;
use dcfs::snowflake::Snowflake;
use dcfs::upload;

/// A tiny in-memory stand-in for the remote chat service: channels keyed by
/// id, messages per channel, and a URL -> bytes map for attachment content.
struct MockBackend {
    next_id: AtomicU64,
    channels: Mutex<Vec<ChannelRecord>>,
    messages: Mutex<HashMap<u64, Vec<MessageRecord>>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockBackend {
    fn new() -> Self {
        MockBackend {
            next_id: AtomicU64::new(1),
            channels: Mutex::new(Vec::new()),
            messages: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
        }
    }

    fn mint(&self) -> Snowflake {
        Snowflake::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn list_channels(&self, _guild: Snowflake) -> Result<Vec<ChannelRecord>, DcfsError> {
        Ok(self.channels.lock().unwrap().clone())
    }

    async fn create_channel(&self, _guild: Snowflake, name: &str) -> Result<ChannelRecord, DcfsError> {
        let channel = ChannelRecord {
            id: self.mint(),
            name: name.to_string(),
            kind: CHANNEL_TYPE_GUILD_TEXT,
            has_parent: false,
        };
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn rename_channel(&self, channel: Snowflake, new_name: &str) -> Result<(), DcfsError> {
        let mut channels = self.channels.lock().unwrap();
        let c = channels.iter_mut().find(|c| c.id == channel).ok_or(DcfsError::NoEntry)?;
        c.name = new_name.to_string();
        Ok(())
    }

    async fn delete_channel(&self, channel: Snowflake) -> Result<(), DcfsError> {
        self.channels.lock().unwrap().retain(|c| c.id != channel);
        self.messages.lock().unwrap().remove(&channel.value());
        Ok(())
    }

    async fn list_messages(&self, channel: Snowflake) -> Result<Vec<MessageRecord>, DcfsError> {
        Ok(self.messages.lock().unwrap().get(&channel.value()).cloned().unwrap_or_default())
    }

    async fn create_attachments(
        &self,
        channel: Snowflake,
        parts: Vec<PendingAttachment>,
    ) -> Result<MessageRecord, DcfsError> {
        let message_id = self.mint();
        let mut attachments = Vec::with_capacity(parts.len());
        for part in parts {
            let encoded = codec::encode(&part.decoded_filename);
            let url = format!("https://cdn.example/{encoded}");
            self.blobs.lock().unwrap().insert(url.clone(), part.bytes.clone());
            attachments.push(AttachmentRecord {
                encoded_filename: encoded,
                size: part.bytes.len() as u64,
                url,
            });
        }
        let message = MessageRecord { id: message_id, attachments };
        self.messages
            .lock()
            .unwrap()
            .entry(channel.value())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn delete_message(&self, channel: Snowflake, message: Snowflake) -> Result<(), DcfsError> {
        if let Some(messages) = self.messages.lock().unwrap().get_mut(&channel.value()) {
            messages.retain(|m| m.id != message);
        }
        Ok(())
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, DcfsError> {
        self.blobs
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| DcfsError::Io(format!("no such blob: {url}")))
    }
}

fn limits(part_size: usize, max_parts: usize) -> Limits {
    Limits {
        part_size,
        batch_size: 10,
        max_parts,
    }
}

#[tokio::test]
async fn empty_file_uploads_as_a_single_zero_byte_part() {
    let backend = MockBackend::new();
    let channel = backend.create_channel(Snowflake::new(0), "general").await.unwrap();

    let parts = upload::upload(&backend, channel.id, b"empty.txt", b"", &limits(4096, 256))
        .await
        .unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].size, 0);

    let content = download::download(&backend, &parts).await.unwrap();
    assert!(content.is_empty());
}

#[tokio::test]
async fn single_part_upload_round_trips_through_read() {
    let backend = MockBackend::new();
    let channel = backend.create_channel(Snowflake::new(0), "general").await.unwrap();

    let parts = upload::upload(&backend, channel.id, b"hello.txt", b"hello, world!", &limits(4096, 256))
        .await
        .unwrap();
    let content = download::download(&backend, &parts).await.unwrap();
    assert_eq!(content, b"hello, world!");
}

#[tokio::test]
async fn multipart_upload_reassembles_across_a_fresh_mount() {
    let backend = MockBackend::new();
    let channel = backend.create_channel(Snowflake::new(0), "general").await.unwrap();

    let payload: Vec<u8> = (0..25u8).collect();
    upload::upload(&backend, channel.id, b"blob.bin", &payload, &limits(4, 256))
        .await
        .unwrap();

    // A fresh Namespace::prime (as a remount would do) must reconstruct the
    // same file purely from the channel's message history.
    let namespace = Namespace::prime(&backend, Snowflake::new(0), 501, 20).await.unwrap();
    let dir = namespace.find_dir("general").unwrap();
    dir.ensure_loaded(&backend).await.unwrap();
    let file = dir.find_file(b"blob.bin").unwrap();
    assert!(file.is_resident());
    assert_eq!(file.aggregate_size(), 25);

    let content = download::download(&backend, &file.parts).await.unwrap();
    assert_eq!(content, payload);
}

#[tokio::test]
async fn deleting_a_channel_removes_its_messages() {
    let backend = MockBackend::new();
    let channel = backend.create_channel(Snowflake::new(0), "temp").await.unwrap();
    upload::upload(&backend, channel.id, b"file.txt", b"data", &limits(4096, 256))
        .await
        .unwrap();

    backend.delete_channel(channel.id).await.unwrap();
    assert!(backend.list_channels(Snowflake::new(0)).await.unwrap().is_empty());
    assert!(backend.list_messages(channel.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn upload_exceeding_max_parts_is_refused_before_any_backend_call() {
    let backend = MockBackend::new();
    let channel = backend.create_channel(Snowflake::new(0), "general").await.unwrap();

    let payload = vec![0u8; 10];
    let err = upload::upload(&backend, channel.id, b"big.bin", &payload, &limits(1, 4))
        .await
        .unwrap_err();
    assert!(matches!(err, DcfsError::TooLarge));
    // No message should have been created for the refused upload.
    assert!(backend.list_messages(channel.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn unlisted_channels_are_primed_but_hidden_from_readdir() {
    let backend = MockBackend::new();
    backend.create_channel(Snowflake::new(0), "general").await.unwrap();
    let voice = ChannelRecord {
        id: backend.mint(),
        name: "voice-chat".to_string(),
        kind: 2,
        has_parent: false,
    };
    backend.channels.lock().unwrap().push(voice.clone());

    let namespace = Namespace::prime(&backend, Snowflake::new(0), 501, 20).await.unwrap();
    assert!(namespace.find_dir("voice-chat").is_some());
    assert!(namespace.visible_dirs().iter().all(|d| d.name() != "voice-chat"));
}
