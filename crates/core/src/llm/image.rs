use anyhow::{bail, ensure, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

const SUPPORTED_MEDIA_TYPES: [&str; 4] = ["image/png", "image/jpeg", "image/gif", "image/webp"];

/// A chart screenshot, kept base64-encoded as it travels to the model and into storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartImage {
    pub media_type: String,
    pub data_base64: String,
}

impl ChartImage {
    /// Parses `data:image/<type>;base64,<payload>`.
    pub fn from_data_uri(uri: &str) -> anyhow::Result<Self> {
        let rest = uri
            .trim()
            .strip_prefix("data:")
            .context("image must be a data URI")?;
        let (header, payload) = rest
            .split_once(',')
            .context("data URI is missing the ',' separator")?;
        let Some(media_type) = header.strip_suffix(";base64") else {
            bail!("data URI must be base64-encoded");
        };
        let media_type = media_type.to_ascii_lowercase();
        ensure!(
            SUPPORTED_MEDIA_TYPES.contains(&media_type.as_str()),
            "unsupported image type: {media_type}"
        );

        let decoded = STANDARD
            .decode(payload.trim())
            .context("data URI payload is not valid base64")?;
        ensure!(!decoded.is_empty(), "image is empty");
        ensure!(
            decoded.len() <= MAX_IMAGE_BYTES,
            "image exceeds {MAX_IMAGE_BYTES} bytes (got {})",
            decoded.len()
        );

        Ok(Self {
            media_type,
            data_base64: payload.trim().to_string(),
        })
    }

    pub fn from_bytes(media_type: &str, bytes: &[u8]) -> anyhow::Result<Self> {
        let media_type = media_type.to_ascii_lowercase();
        ensure!(
            SUPPORTED_MEDIA_TYPES.contains(&media_type.as_str()),
            "unsupported image type: {media_type}"
        );
        ensure!(!bytes.is_empty(), "image is empty");
        ensure!(
            bytes.len() <= MAX_IMAGE_BYTES,
            "image exceeds {MAX_IMAGE_BYTES} bytes (got {})",
            bytes.len()
        );
        Ok(Self {
            media_type,
            data_base64: STANDARD.encode(bytes),
        })
    }

    /// Guesses the media type from a file extension.
    pub fn media_type_for_path(path: &std::path::Path) -> Option<&'static str> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "png" => Some("image/png"),
            "jpg" | "jpeg" => Some("image/jpeg"),
            "gif" => Some("image/gif"),
            "webp" => Some("image/webp"),
            _ => None,
        }
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data_base64)
    }
}
