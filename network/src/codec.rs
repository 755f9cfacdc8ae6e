use bytes::Bytes;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{Envelope, Result};

/// Largest envelope either side will read.
pub(crate) const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// 4-byte big-endian length prefix followed by a JSON envelope.
pub(crate) fn framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    let codec = LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    Framed::new(stream, codec)
}

pub(crate) fn encode(envelope: &Envelope) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(envelope)?))
}

pub(crate) fn decode(frame: &[u8]) -> Result<Envelope> {
    Ok(serde_json::from_slice(frame)?)
}
