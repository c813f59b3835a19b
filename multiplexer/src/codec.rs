//! Length-prefixed framing for worker streams.
//!
//! Each frame is a big-endian `u32` byte length followed by the bincode
//! encoding of one [`StreamCommand`].

use crate::envelope::StreamCommand;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        FrameReader {
            reader,
            max_frame_bytes,
        }
    }

    /// Reads the next frame. `Ok(None)` means the peer closed the stream on a
    /// frame boundary.
    pub async fn read_frame(&mut self) -> Result<Option<StreamCommand>, CodecError> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside a frame header",
                )
                .into());
            }
            filled += n;
        }
        let len = u32::from_be_bytes(header) as usize;

        if len > self.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: len,
            });
        }

        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;

        let (frame, _) = bincode::serde::decode_from_slice(&buf, bincode::config::standard())?;
        Ok(Some(frame))
    }
}

/// Size of the frame body `frame` encodes to, without allocating it.
pub fn encoded_len(frame: &StreamCommand) -> Result<usize, CodecError> {
    let len =
        bincode::serde::encode_into_std_write(frame, &mut io::sink(), bincode::config::standard())?;
    Ok(len)
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        FrameWriter {
            writer,
            max_frame_bytes,
        }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Writes one frame. A frame that fails to encode or exceeds the limit is
    /// rejected before any byte reaches the stream.
    pub async fn write_frame(&mut self, frame: &StreamCommand) -> Result<(), CodecError> {
        let body = bincode::serde::encode_to_vec(frame, bincode::config::standard())?;

        if body.len() > self.max_frame_bytes || body.len() > u32::MAX as usize {
            return Err(CodecError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: body.len(),
            });
        }

        self.writer.write_u32(body.len() as u32).await?;
        self.writer.write_all(&body).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    const MAX: usize = 1024 * 1024;

    #[tokio::test]
    async fn test_frames_over_pipe() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut writer = FrameWriter::new(client, MAX);
        let mut reader = FrameReader::new(server, MAX);

        let upload = StreamCommand::new(Command::UploadFile)
            .with_correlation_id(9)
            .with_payload(vec![0xAB; 4096])
            .with_trace_id("t-1");
        writer.write_frame(&upload).await.unwrap();
        writer
            .write_frame(&StreamCommand::new(Command::Unrecognized("88".into())))
            .await
            .unwrap();
        drop(writer);

        assert_eq!(reader.read_frame().await.unwrap(), Some(upload));
        let unknown = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(unknown.command(), &Command::Unrecognized("88".into()));
        // clean EOF
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frames_rejected() {
        let (client, server) = tokio::io::duplex(64 * 1024);

        let mut writer = FrameWriter::new(client, 16);
        let frame = StreamCommand::new(Command::CheckTx).with_params("x".repeat(64));
        assert!(matches!(
            writer.write_frame(&frame).await,
            Err(CodecError::FrameTooLarge { .. })
        ));

        let mut raw = FrameWriter::new(writer.writer, MAX);
        raw.write_frame(&frame).await.unwrap();

        let mut reader = FrameReader::new(server, 16);
        assert!(matches!(
            reader.read_frame().await,
            Err(CodecError::FrameTooLarge { got_bytes, .. }) if got_bytes > 16
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_u32(100).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, MAX);
        assert!(matches!(reader.read_frame().await, Err(CodecError::Io(_))));
    }

    #[tokio::test]
    async fn test_truncated_header_is_an_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, MAX);
        assert!(matches!(
            reader.read_frame().await,
            Err(CodecError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[test]
    fn test_encoded_len_matches_written_body() {
        let frame = StreamCommand::new(Command::UploadFile)
            .with_correlation_id(77)
            .with_payload(vec![7; 8192]);
        let body = bincode::serde::encode_to_vec(&frame, bincode::config::standard()).unwrap();
        assert_eq!(encoded_len(&frame).unwrap(), body.len());
    }
}
