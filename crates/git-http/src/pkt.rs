//! pkt-line encode/decode and the streaming chunk reader used by the pack
//! cache write-through path.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const PKT_FLUSH: &[u8] = b"0000";

pub const PKT_DELIM: &[u8] = b"0001";

/// Side-band channel carrying pack data.
pub const BAND_DATA: u8 = 1;
/// Side-band channel carrying progress messages.
pub const BAND_PROGRESS: u8 = 2;
/// Side-band channel carrying a fatal error message.
pub const BAND_ERROR: u8 = 3;

pub fn encode_pkt_line(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + data.len());
    let len = 4 + data.len();
    out.extend_from_slice(format!("{len:04x}").as_bytes());
    out.extend_from_slice(data);
    out
}

#[derive(Debug, Clone)]
pub enum Pkt {
    Data(Vec<u8>),
    Flush,
    Delim,
}

pub fn decode_pkt_lines(mut buf: &[u8]) -> anyhow::Result<Vec<Pkt>> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 4 {
            anyhow::bail!("truncated pkt-line length");
        }
        let len_hex = &buf[..4];
        let len = usize::from_str_radix(std::str::from_utf8(len_hex)?, 16)?;
        buf = &buf[4..];
        if len == 0 {
            out.push(Pkt::Flush);
            continue;
        }
        if len == 1 {
            out.push(Pkt::Delim);
            continue;
        }
        if len < 4 {
            anyhow::bail!("reserved pkt-line length {len}");
        }
        let data_len = len - 4;
        if buf.len() < data_len {
            anyhow::bail!("truncated pkt-line data");
        }
        let data = &buf[..data_len];
        out.push(Pkt::Data(data.to_vec()));
        buf = &buf[data_len..];
    }
    Ok(out)
}

/// Incremental pkt-line reader over an async byte source.
///
/// Yields successive raw frames (length prefix included) until a flush is
/// seen at a frame boundary, which ends the sequence normally. A non-hex
/// prefix, a reserved length, or EOF before the flush fail the sequence with
/// an `InvalidData` error; callers treat that as a cache-write abort.
pub struct PktChunkReader<R> {
    reader: R,
    done: bool,
}

impl<R: AsyncRead + Unpin> PktChunkReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }

    /// Next raw frame, or `None` once the terminating flush has been
    /// returned.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        let mut prefix = [0u8; 4];
        self.reader.read_exact(&mut prefix).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "upstream closed before pkt-line flush",
                )
            } else {
                err
            }
        })?;
        let len = std::str::from_utf8(&prefix)
            .ok()
            .and_then(|s| usize::from_str_radix(s, 16).ok())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "non-hex pkt-line prefix")
            })?;
        match len {
            0 => {
                self.done = true;
                Ok(Some(Bytes::from_static(PKT_FLUSH)))
            }
            1 => Ok(Some(Bytes::from_static(PKT_DELIM))),
            2 | 3 => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("reserved pkt-line length {len}"),
            )),
            _ => {
                let mut frame = BytesMut::with_capacity(len);
                frame.extend_from_slice(&prefix);
                frame.resize(len, 0);
                self.reader.read_exact(&mut frame[4..]).await.map_err(|err| {
                    if err.kind() == std::io::ErrorKind::UnexpectedEof {
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "pkt-line payload truncated",
                        )
                    } else {
                        err
                    }
                })?;
                Ok(Some(frame.freeze()))
            }
        }
    }
}
