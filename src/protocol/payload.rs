use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use super::ProtocolError;

const JPEG_DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// A still image carried on the wire as a `data:` URL.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedImage(String);

impl EncodedImage {
    pub fn from_data_url(data_url: impl Into<String>) -> Self {
        Self(data_url.into())
    }

    pub fn from_jpeg_bytes(bytes: &[u8]) -> Self {
        let mut url = String::with_capacity(JPEG_DATA_URL_PREFIX.len() + bytes.len() * 4 / 3 + 4);
        url.push_str(JPEG_DATA_URL_PREFIX);
        STANDARD.encode_string(bytes, &mut url);
        Self(url)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Media type declared by the URL header, e.g. `image/jpeg`.
    pub fn media_type(&self) -> Option<&str> {
        let header = self.0.strip_prefix("data:")?.split(',').next()?;
        header.split(';').next().filter(|media| !media.is_empty())
    }

    /// Decode the base64 body. A bare base64 string without a header is
    /// accepted as well, matching what the detection service tolerates.
    pub fn decode_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = self.0.rsplit(',').next().unwrap_or_default();
        if body.is_empty() {
            return Err(ProtocolError::EmptyImage);
        }
        STANDARD
            .decode(body)
            .map_err(|err| ProtocolError::InvalidImage(err.to_string()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Images are large; keep debug output readable.
impl fmt::Debug for EncodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EncodedImage({}, {} bytes)",
            self.media_type().unwrap_or("unknown"),
            self.0.len()
        )
    }
}
