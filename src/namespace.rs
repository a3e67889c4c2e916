//! In-memory tree: root → channel-dirs → file-entries (spec §3).
//!
//! The original keeps a parts array on each file plus back-references from
//! part to head (`examples/original_source/src/fs.h`). DCFS instead models
//! a part purely as a value living in the head's fixed-capacity slot array
//! — see Design Notes, "cyclic / weak back-references" — so there is no
//! separate collection of part entries to keep in sync.
//!
//! Locking follows spec §5: the directory list itself is one `RwLock`,
//! taken briefly and only for `mkdir`/`rmdir`; each directory's file
//! collection is a second, independent `RwLock` so that loading or
//! mutating one channel's files never blocks lookups in another.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::backend::{Backend, ChannelRecord, MessageRecord};
use crate::codec;
use crate::error::DcfsError;
use crate::snowflake::Snowflake;

pub const DEFAULT_FILE_MODE: u32 = 0o644;
pub const DEFAULT_DIR_MODE: u32 = 0o755;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One of up to `MAX_PARTS` ordered slices of a logical file.
#[derive(Debug, Clone)]
pub struct MessagePart {
    pub message_id: Snowflake,
    pub decoded_filename: Vec<u8>,
    pub size: u64,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub decoded_filename: Vec<u8>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub created_at: u64,
    /// Dense 0..N-1, slot 0 is the head. Empty iff the file is pending.
    pub parts: Vec<MessagePart>,
    /// Present while the file is being written, or after its first read.
    pub content: Option<Vec<u8>>,
}

impl FileEntry {
    pub fn pending(decoded_filename: Vec<u8>, mode: u32, uid: u32, gid: u32) -> Self {
        FileEntry {
            decoded_filename,
            mode,
            uid,
            gid,
            created_at: now_secs(),
            parts: Vec::new(),
            content: Some(Vec::new()),
        }
    }

    /// Invariant 2: resident iff slot 0 is populated.
    pub fn is_resident(&self) -> bool {
        !self.parts.is_empty()
    }

    /// Invariant 1: aggregate size is the sum of part sizes once resident,
    /// otherwise the length of the in-progress content buffer.
    pub fn aggregate_size(&self) -> u64 {
        if self.is_resident() {
            self.parts.iter().map(|p| p.size).sum()
        } else {
            self.content.as_ref().map(|c| c.len() as u64).unwrap_or(0)
        }
    }

    /// Every distinct backend message id across this file's parts (parts
    /// from the same upload batch share a snowflake).
    pub fn distinct_message_ids(&self) -> Vec<Snowflake> {
        let mut seen = Vec::new();
        for part in &self.parts {
            if !seen.contains(&part.message_id) {
                seen.push(part.message_id);
            }
        }
        seen
    }
}

pub struct DirectoryEntry {
    pub channel: RwLock<ChannelRecord>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub created_at: u64,
    /// `None` until the first `getattr`/`readdir` of this directory loads
    /// it from the backend (spec §3, "Lifecycles").
    pub files: RwLock<Option<Vec<FileEntry>>>,
}

impl DirectoryEntry {
    pub fn new(channel: ChannelRecord, uid: u32, gid: u32) -> Self {
        let created_at = channel.id.created_at_secs();
        DirectoryEntry {
            channel: RwLock::new(channel),
            mode: DEFAULT_DIR_MODE,
            uid,
            gid,
            created_at,
            files: RwLock::new(None),
        }
    }

    pub fn name(&self) -> String {
        self.channel.read().unwrap().name.clone()
    }

    pub fn id(&self) -> Snowflake {
        self.channel.read().unwrap().id
    }

    pub fn is_listable(&self) -> bool {
        self.channel.read().unwrap().is_listable()
    }

    /// Loads this directory's files from the backend if not already loaded.
    pub async fn ensure_loaded(&self, backend: &dyn Backend) -> Result<(), DcfsError> {
        if self.files.read().unwrap().is_some() {
            return Ok(());
        }
        let channel_id = self.id();
        let messages = backend.list_messages(channel_id).await?;
        let entries = group_messages_into_files(messages, self.uid, self.gid)?;
        *self.files.write().unwrap() = Some(entries);
        Ok(())
    }

    /// Marks the collection as loaded-but-empty, used by `mkdir` (a
    /// freshly created channel has no messages yet, so there is no need to
    /// round-trip to the backend to discover that).
    pub fn mark_loaded_empty(&self) {
        *self.files.write().unwrap() = Some(Vec::new());
    }

    pub fn with_files<R>(&self, f: impl FnOnce(&[FileEntry]) -> R) -> Option<R> {
        self.files.read().unwrap().as_ref().map(|files| f(files))
    }

    pub fn with_files_mut<R>(&self, f: impl FnOnce(&mut Vec<FileEntry>) -> R) -> Option<R> {
        self.files.write().unwrap().as_mut().map(f)
    }

    pub fn find_file(&self, name: &[u8]) -> Option<FileEntry> {
        self.with_files(|files| files.iter().find(|f| f.decoded_filename == name).cloned())
            .flatten()
    }
}

/// Two-pass classify-then-attach reconstruction, per Design Notes
/// "mutation during iteration": pass 1 walks every message's attachments
/// and classifies each as a head or a numbered part without mutating
/// anything; pass 2 groups by head name and builds the dense part arrays.
fn group_messages_into_files(
    messages: Vec<MessageRecord>,
    uid: u32,
    gid: u32,
) -> Result<Vec<FileEntry>, DcfsError> {
    struct Classified {
        message_id: Snowflake,
        head_name: Vec<u8>,
        slot: usize,
        decoded_filename: Vec<u8>,
        size: u64,
        url: String,
    }

    // Pass 1: classify.
    let mut classified = Vec::new();
    for message in &messages {
        for attachment in &message.attachments {
            let decoded = codec::decode(&attachment.encoded_filename)?;
            let (head_name, slot) = match codec::split_part_suffix(&decoded) {
                Some((head, k)) => (head.to_vec(), k),
                None => (decoded.clone(), 0),
            };
            classified.push(Classified {
                message_id: message.id,
                head_name,
                slot,
                decoded_filename: decoded,
                size: attachment.size,
                url: attachment.url.clone(),
            });
        }
    }

    // Pass 2: attach. Group by head name, then place each part in its slot.
    let mut by_head: HashMap<Vec<u8>, Vec<Option<MessagePart>>> = HashMap::new();
    for c in classified {
        let slots = by_head.entry(c.head_name).or_default();
        if slots.len() <= c.slot {
            slots.resize(c.slot + 1, None);
        }
        slots[c.slot] = Some(MessagePart {
            message_id: c.message_id,
            decoded_filename: c.decoded_filename,
            size: c.size,
            url: c.url,
        });
    }

    let mut files = Vec::with_capacity(by_head.len());
    for (head_name, slots) in by_head {
        // Invariant 3: dense from 0..N-1, no holes. A hole means a part
        // upload never completed; such a file cannot be reassembled and is
        // skipped rather than surfaced half-built.
        if slots.iter().any(Option::is_none) {
            log::warn!(
                "skipping {:?}: part slots are not dense",
                String::from_utf8_lossy(&head_name)
            );
            continue;
        }
        let parts: Vec<MessagePart> = slots.into_iter().flatten().collect();
        let created_at = parts[0].message_id.created_at_secs();
        files.push(FileEntry {
            decoded_filename: head_name,
            mode: DEFAULT_FILE_MODE,
            uid,
            gid,
            created_at,
            parts,
            content: None,
        });
    }
    Ok(files)
}

/// Root → channel-dirs (spec §3 "Namespace").
pub struct Namespace {
    pub root_created_at: u64,
    dirs: RwLock<Vec<Arc<DirectoryEntry>>>,
    uid: u32,
    gid: u32,
}

impl Namespace {
    /// Primes the namespace at mount time: lists every channel in the
    /// guild and retains all of them (even non-listable ones, so
    /// operations by snowflake still resolve), per invariant 6.
    pub async fn prime(
        backend: &dyn Backend,
        guild_id: Snowflake,
        uid: u32,
        gid: u32,
    ) -> Result<Self, DcfsError> {
        let channels = backend.list_channels(guild_id).await?;
        let dirs = channels
            .into_iter()
            .map(|c| Arc::new(DirectoryEntry::new(c, uid, gid)))
            .collect();
        Ok(Namespace {
            root_created_at: guild_id.created_at_secs(),
            dirs: RwLock::new(dirs),
            uid,
            gid,
        })
    }

    pub fn find_dir(&self, name: &str) -> Option<Arc<DirectoryEntry>> {
        self.dirs
            .read()
            .unwrap()
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    /// Channels listable per invariant 6, in no particular order.
    pub fn visible_dirs(&self) -> Vec<Arc<DirectoryEntry>> {
        self.dirs
            .read()
            .unwrap()
            .iter()
            .filter(|d| d.is_listable())
            .cloned()
            .collect()
    }

    pub fn insert_dir(&self, channel: ChannelRecord) -> Arc<DirectoryEntry> {
        let dir = Arc::new(DirectoryEntry::new(channel, self.uid, self.gid));
        dir.mark_loaded_empty();
        self.dirs.write().unwrap().push(dir.clone());
        dir
    }

    pub fn remove_dir(&self, name: &str) -> Option<Arc<DirectoryEntry>> {
        let mut dirs = self.dirs.write().unwrap();
        let idx = dirs.iter().position(|d| d.name() == name)?;
        Some(dirs.remove(idx))
    }
}
