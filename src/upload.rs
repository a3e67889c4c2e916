//! Buffers user writes, splits on close into fixed-size parts, posts them
//! in batches, installs the returned records into the namespace atomically
//! per batch (spec §4.5 — "the central algorithm").
//!
//! Grounded on `examples/original_source/src/dcfs.c`'s `upload_file`/
//! `process_files` (the `MAX_FILESIZE`/10-per-batch loop that builds a
//! `struct file files[10]` and calls `discord_create_attachments`), and on
//! the streaming multi-platform uploader in
//! `examples/other_examples/9198f5b3_ThanhGoodBoy-auto__src-tauri-src-upload.rs.rs`
//! for the general shape of "split into parts, dispatch each as its own
//! backend call, collect results".

use crate::backend::{Backend, PendingAttachment};
use crate::codec;
use crate::config::Limits;
use crate::error::DcfsError;
use crate::namespace::MessagePart;
use crate::snowflake::Snowflake;

/// Splits `content` into `ceil(len / part_size)` slices and uploads them as
/// one logical file named `filename`, in batches of `limits.batch_size`.
/// Returns the dense, ordered part array on full success; on any batch
/// failure, returns the error and installs nothing (earlier successful
/// batches' attachments are left orphaned on the backend, per spec).
pub async fn upload(
    backend: &dyn Backend,
    channel: Snowflake,
    filename: &[u8],
    content: &[u8],
    limits: &Limits,
) -> Result<Vec<MessagePart>, DcfsError> {
    let total = content.len();
    let part_count = total.div_ceil(limits.part_size).max(1);
    if part_count > limits.max_parts {
        return Err(DcfsError::TooLarge);
    }

    let slices: Vec<(Vec<u8>, &[u8])> = (0..part_count)
        .map(|k| {
            let name = if k == 0 {
                filename.to_vec()
            } else {
                let mut name = filename.to_vec();
                name.extend_from_slice(&codec::part_suffix(k));
                name
            };
            let start = k * limits.part_size;
            let end = ((k + 1) * limits.part_size).min(total);
            (name, &content[start..end])
        })
        .collect();

    let mut parts: Vec<Option<MessagePart>> = (0..part_count).map(|_| None).collect();

    for batch in slices.chunks(limits.batch_size) {
        let pending: Vec<PendingAttachment> = batch
            .iter()
            .map(|(name, bytes)| PendingAttachment {
                decoded_filename: name.clone(),
                bytes: bytes.to_vec(),
            })
            .collect();

        let message = backend.create_attachments(channel, pending).await?;
        install_batch(&mut parts, filename, message)?;
    }

    // Every slot must be filled; `create_attachments` is contracted to
    // return exactly one attachment per input pair.
    parts
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| DcfsError::Io("backend returned fewer attachments than requested".into()))
}

/// Installs one batch's returned attachments into their slots. The slot for
/// each returned attachment is derived from its own (decoded) filename
/// rather than assumed from request order, since the spec only guarantees
/// the response array is the same *length* as the request, not the same
/// order.
fn install_batch(
    parts: &mut [Option<MessagePart>],
    head_name: &[u8],
    message: crate::backend::MessageRecord,
) -> Result<(), DcfsError> {
    if message.attachments.is_empty() {
        return Err(DcfsError::Io("backend returned no attachments for batch".into()));
    }
    let message_id = message.id;
    for attachment in &message.attachments {
        let decoded = codec::decode(&attachment.encoded_filename)?;
        let slot = if decoded == head_name {
            0
        } else {
            match codec::split_part_suffix(&decoded) {
                Some((head, k)) if head == head_name => k,
                _ => {
                    return Err(DcfsError::Io(format!(
                        "attachment {:?} does not belong to file {:?}",
                        String::from_utf8_lossy(&decoded),
                        String::from_utf8_lossy(head_name)
                    )))
                }
            }
        };
        if slot >= parts.len() {
            return Err(DcfsError::Io(format!("part slot {slot} out of range")));
        }
        parts[slot] = Some(MessagePart {
            message_id,
            decoded_filename: decoded,
            size: attachment.size,
            url: attachment.url.clone(),
        });
    }
    Ok(())
}
