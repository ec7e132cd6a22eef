//! Codec for the registration frame

use crate::messages::RegistrationHeader;
use crate::{LENGTH_PREFIX_SIZE, MAX_HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Truncated frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("Invalid registration header: {0}")]
    InvalidHeader(#[from] serde_json::Error),

    #[error("Registration header too large: {0} bytes")]
    HeaderTooLarge(usize),
}

/// Registration frame codec
pub struct RegistrationCodec;

impl RegistrationCodec {
    /// Encode a registration header
    ///
    /// Format: [length: u16 BE][payload: JSON header]
    pub fn encode(header: &RegistrationHeader) -> Result<Bytes, CodecError> {
        let payload = serde_json::to_vec(header)?;

        if payload.len() > MAX_HEADER_SIZE {
            return Err(CodecError::HeaderTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        buf.put_u16(payload.len() as u16);
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a registration header from a buffer
    ///
    /// Returns Ok(Some(header)) once a complete frame is buffered,
    /// Ok(None) if more data is needed. Bytes past the frame are left in `buf`.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<RegistrationHeader>, CodecError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < LENGTH_PREFIX_SIZE + length {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let payload = buf.split_to(length);

        Ok(Some(serde_json::from_slice(&payload)?))
    }

    /// Read exactly one registration frame from `reader`.
    ///
    /// Reads no further than the end of the frame, so the stream can be used
    /// as the raw control connection afterwards.
    pub async fn read_from<R>(reader: &mut R) -> Result<RegistrationHeader, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut length_bytes = [0u8; LENGTH_PREFIX_SIZE];
        read_full(reader, &mut length_bytes).await?;
        let length = u16::from_be_bytes(length_bytes) as usize;

        trace!("Registration frame announces {} header bytes", length);

        let mut payload = vec![0u8; length];
        read_full(reader, &mut payload).await?;

        Ok(serde_json::from_slice(&payload)?)
    }

    /// Write a registration frame to `writer`
    pub async fn write_to<W>(writer: &mut W, header: &RegistrationHeader) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = Self::encode(header)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Fill `buf` completely, reporting how far we got if the peer hung up early
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut received = 0;
    while received < buf.len() {
        let n = reader.read(&mut buf[received..]).await?;
        if n == 0 {
            return Err(CodecError::Truncated {
                expected: buf.len(),
                received,
            });
        }
        received += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let encoded = RegistrationCodec::encode(&RegistrationHeader::new("dev")).unwrap();
        let json = br#"{"name":"dev"}"#;

        assert_eq!(&encoded[..2], &(json.len() as u16).to_be_bytes());
        assert_eq!(&encoded[2..], json);
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = RegistrationCodec::encode(&RegistrationHeader::new("tablet")).unwrap();

        // Only the length prefix
        let mut buf = BytesMut::from(&encoded[..2]);
        assert_eq!(RegistrationCodec::decode(&mut buf).unwrap(), None);

        // Rest of the frame plus trailing relay bytes
        buf.extend_from_slice(&encoded[2..]);
        buf.extend_from_slice(b"raw");
        let header = RegistrationCodec::decode(&mut buf).unwrap();
        assert_eq!(header, Some(RegistrationHeader::new("tablet")));
        assert_eq!(&buf[..], b"raw");
    }

    #[test]
    fn test_decode_invalid_json() {
        let mut buf = BytesMut::from(&[0u8, 3, b'a', b'b', b'c'][..]);
        assert!(matches!(
            RegistrationCodec::decode(&mut buf),
            Err(CodecError::InvalidHeader(_))
        ));
    }

    #[tokio::test]
    async fn test_read_from_stops_at_frame_boundary() {
        let mut wire = RegistrationCodec::encode(&RegistrationHeader::new("phone"))
            .unwrap()
            .to_vec();
        wire.extend_from_slice(b"payload");

        let mut reader = &wire[..];
        let header = RegistrationCodec::read_from(&mut reader).await.unwrap();

        assert_eq!(header.name, "phone");
        assert_eq!(reader, b"payload");
    }

    #[tokio::test]
    async fn test_read_from_short_body() {
        let wire = [0u8, 5, b'{', b'}', b' '];
        let mut reader = &wire[..];

        match RegistrationCodec::read_from(&mut reader).await {
            Err(CodecError::Truncated { expected, received }) => {
                assert_eq!(expected, 5);
                assert_eq!(received, 3);
            }
            other => panic!("Expected truncated frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_from_short_length_prefix() {
        let wire = [0u8];
        let mut reader = &wire[..];

        assert!(matches!(
            RegistrationCodec::read_from(&mut reader).await,
            Err(CodecError::Truncated {
                expected: 2,
                received: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_read_from_empty_header_fails_to_parse() {
        let wire = [0u8, 0];
        let mut reader = &wire[..];

        assert!(matches!(
            RegistrationCodec::read_from(&mut reader).await,
            Err(CodecError::InvalidHeader(_))
        ));
    }

    #[tokio::test]
    async fn test_write_to() {
        let mut out = Vec::new();
        RegistrationCodec::write_to(&mut out, &RegistrationHeader::new("watch"))
            .await
            .unwrap();

        let mut reader = &out[..];
        let header = RegistrationCodec::read_from(&mut reader).await.unwrap();
        assert_eq!(header.name, "watch");
    }
}
