//! Multiplexed exec output.
//!
//! Without a TTY the runtime sends every output stream over one connection
//! as frames:
//!
//! ```text
//! [tag u8][0 u8][0 u8][0 u8][len u32 big-endian][payload; len bytes]
//! ```

use hgr_types::{HangarError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTag {
    Stdin,
    Stdout,
    Stderr,
    /// Out-of-band error from the runtime itself.
    System,
}

impl StreamTag {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
            Self::System => 3,
        }
    }
}

impl TryFrom<u8> for StreamTag {
    type Error = HangarError;

    fn try_from(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::Stdin),
            1 => Ok(Self::Stdout),
            2 => Ok(Self::Stderr),
            3 => Ok(Self::System),
            other => Err(HangarError::Protocol(format!("unknown stream tag {other}"))),
        }
    }
}

/// Encode one frame.
pub fn encode_frame(tag: StreamTag, payload: &[u8]) -> Vec<u8> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&[tag.as_byte(), 0, 0, 0]);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload[..len as usize]);
    frame
}

/// Copy frames from `reader` to the matching sink until EOF.
///
/// Stdin echoes go to `stdout`. A system frame ends the copy with its payload
/// as a protocol error; so does an unknown tag or a frame cut short by EOF.
/// Both sinks are flushed before returning, on errors too. Returns the number
/// of payload bytes written.
pub async fn demux<R, O, E>(reader: &mut R, stdout: &mut O, stderr: &mut E) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    O: AsyncWrite + Unpin + ?Sized,
    E: AsyncWrite + Unpin + ?Sized,
{
    let copied = copy_frames(reader, stdout, stderr).await;
    let flushed_out = stdout.flush().await;
    let flushed_err = stderr.flush().await;
    let written = copied?;
    flushed_out?;
    flushed_err?;
    Ok(written)
}

async fn copy_frames<R, O, E>(reader: &mut R, stdout: &mut O, stderr: &mut E) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    O: AsyncWrite + Unpin + ?Sized,
    E: AsyncWrite + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    let mut payload = Vec::new();
    let mut written = 0u64;

    while read_header(reader, &mut header).await? {
        let tag = StreamTag::try_from(header[0])?;
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        payload.resize(len, 0);
        reader.read_exact(&mut payload).await.map_err(|e| {
            HangarError::Protocol(format!("truncated {len}-byte frame payload: {e}"))
        })?;

        match tag {
            StreamTag::Stdin | StreamTag::Stdout => stdout.write_all(&payload).await?,
            StreamTag::Stderr => stderr.write_all(&payload).await?,
            StreamTag::System => {
                return Err(HangarError::Protocol(
                    String::from_utf8_lossy(&payload).trim().to_string(),
                ));
            }
        }
        written += len as u64;
    }
    Ok(written)
}

/// Fill `header`. `Ok(false)` on a clean EOF before the first byte.
async fn read_header<R>(reader: &mut R, header: &mut [u8; HEADER_LEN]) -> Result<bool>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(HangarError::Protocol(format!(
                "truncated frame header ({filled} of {HEADER_LEN} bytes)"
            )));
        }
        filled += n;
    }
    Ok(true)
}
