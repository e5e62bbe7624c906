//! RPC message framing as specified in RFC 5531 §11 (Record Marking Standard).
//!
//! TCP is a byte stream, so RPC messages are delimited by prefixing each
//! fragment with a 4-byte header: the highest bit marks the last fragment of
//! a record and the low 31 bits carry the fragment length. This module
//! provides the async read and write halves of that framing for both the
//! forward path and the backchannel.

use anyhow::anyhow;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::protocol::rpc::MAX_RPC_RECORD_LENGTH;

/// Reads a single record-marked fragment from a stream.
///
/// Reads the 4-byte header, extracts the length and last-fragment flag, and
/// appends exactly that many bytes to `append_to`. Returns true if this was
/// the last fragment of the record. Oversized records are refused before any
/// allocation.
pub async fn read_fragment(
    socket: &mut (impl AsyncRead + Unpin),
    append_to: &mut Vec<u8>,
) -> Result<bool, anyhow::Error> {
    let mut header_buf = [0_u8; 4];
    socket.read_exact(&mut header_buf).await?;
    let fragment_header = u32::from_be_bytes(header_buf);
    let is_last = (fragment_header & (1 << 31)) > 0;
    let length = (fragment_header & ((1 << 31) - 1)) as usize;
    trace!("Reading fragment length:{}, last:{}", length, is_last);
    if append_to.len().saturating_add(length) > MAX_RPC_RECORD_LENGTH {
        return Err(anyhow!(
            "RPC record length {} exceeds max {}",
            length,
            MAX_RPC_RECORD_LENGTH
        ));
    }
    let start_offset = append_to.len();
    append_to.resize(append_to.len() + length, 0);
    socket.read_exact(&mut append_to[start_offset..]).await?;
    Ok(is_last)
}

/// Reads fragments until a full record is assembled and returns its bytes.
pub async fn read_record(
    socket: &mut (impl AsyncRead + Unpin),
) -> Result<Vec<u8>, anyhow::Error> {
    let mut record = Vec::new();
    while !read_fragment(socket, &mut record).await? {}
    Ok(record)
}

/// Writes data as record-marked fragments to a stream.
///
/// Splits large buffers into fragments of at most 2^31 - 1 bytes; the final
/// fragment carries the last-fragment bit so the receiver knows where the
/// record ends.
pub async fn write_record(
    socket: &mut (impl AsyncWrite + Unpin),
    buf: &[u8],
) -> Result<(), anyhow::Error> {
    const MAX_FRAGMENT_SIZE: usize = (1 << 31) - 1;

    let mut offset = 0;
    loop {
        let remaining = buf.len() - offset;
        let fragment_size = std::cmp::min(remaining, MAX_FRAGMENT_SIZE);
        let is_last = offset + fragment_size >= buf.len();

        let fragment_header =
            if is_last { fragment_size as u32 + (1 << 31) } else { fragment_size as u32 };

        socket.write_all(&u32::to_be_bytes(fragment_header)).await?;
        trace!("Writing fragment length:{}, last:{}", fragment_size, is_last);
        socket.write_all(&buf[offset..offset + fragment_size]).await?;

        offset += fragment_size;
        if is_last {
            break;
        }
    }
    socket.flush().await?;

    Ok(())
}
