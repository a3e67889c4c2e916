//! On first read of a file, fetches the head message and every part in
//! order and concatenates into a single buffer used to serve further reads
//! (spec §4.6).

use crate::backend::Backend;
use crate::error::DcfsError;
use crate::namespace::MessagePart;

/// Fetches every part's URL in slot order and concatenates the results. Any
/// part fetch failure discards the partially filled buffer and is reported
/// as `io-error`.
pub async fn download(backend: &dyn Backend, parts: &[MessagePart]) -> Result<Vec<u8>, DcfsError> {
    let mut buffer = Vec::with_capacity(parts.iter().map(|p| p.size as usize).sum());
    for part in parts {
        let bytes = backend.fetch_url(&part.url).await?;
        buffer.extend_from_slice(&bytes);
    }
    Ok(buffer)
}
