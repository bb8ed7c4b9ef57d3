//! Stream negotiation payload
//!
//! A client asks for a stream with a length-prefixed JSON object:
//! `{"format": "h264", "bitrate": 1000000, "resize": [640, 480]}`. Every key
//! besides `format` and `resize` is passed to the encoder as an option.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::{DEFAULT_FORMAT, LENGTH_PREFIX_SIZE, MAX_REQUEST_SIZE};
use super::framing::{read_length, write_length};
use crate::device::Resolution;
use crate::error::{ProtocolError, Result};
use crate::pool::StreamOptions;

fn default_format() -> String {
    DEFAULT_FORMAT.to_string()
}

/// Stream request sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Encoder format
    #[serde(default = "default_format")]
    pub format: String,

    /// Target bitrate in bits per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,

    /// Requested size, either `"WxH"` or `[w, h]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize: Option<Value>,

    /// Remaining encoder options
    #[serde(flatten)]
    pub options: StreamOptions,
}

impl StreamRequest {
    /// Create a request for `format` with no options
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            bitrate: None,
            resize: None,
            options: StreamOptions::new(),
        }
    }

    /// Request a bitrate
    pub fn bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    /// Request a frame size
    pub fn resize(mut self, resolution: Resolution) -> Self {
        self.resize = Some(Value::from(vec![resolution.width, resolution.height]));
        self
    }

    /// Add an arbitrary encoder option
    pub fn option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    /// Encoder options, with `bitrate` folded in when present
    pub fn encoder_options(&self) -> StreamOptions {
        let mut options = self.options.clone();
        if let Some(bitrate) = self.bitrate {
            options.insert("bitrate".to_string(), Value::from(bitrate));
        }
        options
    }

    /// Serialize with the 4-byte length prefix
    pub fn encode(&self) -> Result<Bytes> {
        let json = serde_json::to_vec(self)?;
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + json.len());
        buf.put_u32_le(json.len() as u32);
        buf.put_slice(&json);
        Ok(buf.freeze())
    }
}

/// Read and parse a negotiation payload
pub async fn read_request<R>(reader: &mut R) -> Result<StreamRequest>
where
    R: AsyncRead + Unpin,
{
    let len = read_length(reader).await?;
    if len == 0 || len > MAX_REQUEST_SIZE {
        return Err(ProtocolError::InvalidLength(len).into());
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Send a negotiation payload
pub async fn write_request<W>(writer: &mut W, request: &StreamRequest) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&request.encode()?).await?;
    writer.flush().await?;
    Ok(())
}

/// Tell the client its request cannot be served
pub async fn write_rejection<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_length(writer, 0).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;

    async fn parse(payload: &[u8]) -> Result<StreamRequest> {
        let mut wire = (payload.len() as u32).to_le_bytes().to_vec();
        wire.extend_from_slice(payload);
        let mut reader = &wire[..];
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn test_parse_full_request() {
        let request = parse(br#"{"format":"mjpeg","bitrate":1000000,"resize":[640,480],"quality":10}"#)
            .await
            .unwrap();
        assert_eq!(request.format, "mjpeg");
        assert_eq!(request.bitrate, Some(1_000_000));
        assert_eq!(request.resize, Some(json!([640, 480])));
        assert_eq!(request.options.get("quality"), Some(&json!(10)));

        let options = request.encoder_options();
        assert_eq!(options.get("bitrate"), Some(&json!(1_000_000)));
    }

    #[tokio::test]
    async fn test_format_defaults_to_h264() {
        let request = parse(b"{}").await.unwrap();
        assert_eq!(request.format, DEFAULT_FORMAT);
    }

    #[tokio::test]
    async fn test_malformed_payloads() {
        assert!(matches!(
            parse(b"{not json").await,
            Err(Error::Protocol(ProtocolError::InvalidPayload(_)))
        ));
        assert!(matches!(
            parse(br#"{"bitrate":"fast"}"#).await,
            Err(Error::Protocol(ProtocolError::InvalidPayload(_)))
        ));
        assert!(matches!(
            parse(&[0xFF, 0xFE]).await,
            Err(Error::Protocol(ProtocolError::InvalidPayload(_)))
        ));
    }

    #[tokio::test]
    async fn test_zero_and_oversized_length_rejected() {
        let wire = 0u32.to_le_bytes();
        let mut reader = &wire[..];
        assert!(matches!(
            read_request(&mut reader).await,
            Err(Error::Protocol(ProtocolError::InvalidLength(0)))
        ));

        let wire = (MAX_REQUEST_SIZE + 1).to_le_bytes();
        let mut reader = &wire[..];
        assert!(matches!(
            read_request(&mut reader).await,
            Err(Error::Protocol(ProtocolError::InvalidLength(_)))
        ));
    }

    #[tokio::test]
    async fn test_encode_omits_unset_fields() {
        let encoded = StreamRequest::new("h264").encode().unwrap();
        assert_eq!(&encoded[..4], &(17u32).to_le_bytes());
        assert_eq!(&encoded[4..], br#"{"format":"h264"}"#);

        let mut reader = &encoded[..];
        let decoded = read_request(&mut reader).await.unwrap();
        assert_eq!(decoded, StreamRequest::new("h264"));
    }
}
