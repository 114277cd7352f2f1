//! Framing: length-prefix (2 bytes BE) + opaque payload.

use tokio::io::{AsyncRead, AsyncReadExt};

const LEN_SIZE: usize = 2;
/// Largest packet a peer may send us. Replies are only bounded by the u16 prefix.
pub const MAX_PACKET_LEN: usize = 1000;

/// Encode a payload into a single packet: 2 bytes BE length + payload.
pub fn encode_packet(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error encoding a packet (payload does not fit the length prefix).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("packet too large")]
    TooLarge,
}

/// Decode one packet from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// Call with partial buffer; returns NeedMore if the header or payload is incomplete.
pub fn decode_packet(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = check_len(u16::from_be_bytes([bytes[0], bytes[1]]))?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Read exactly one packet off a stream. The header is validated before the payload is read.
pub async fn read_packet<R>(reader: &mut R) -> Result<Vec<u8>, FrameDecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = check_len(u16::from_be_bytes(len_buf))?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

fn check_len(declared: u16) -> Result<usize, FrameDecodeError> {
    let len = declared as usize;
    if len == 0 {
        return Err(FrameDecodeError::Empty);
    }
    if len > MAX_PACKET_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    Ok(len)
}

/// Error decoding a packet (need more bytes, suspicious length, or stream failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("packet header declares zero length")]
    Empty,
    #[error("suspicious packet header declaring len={0}")]
    TooLarge(usize),
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}
