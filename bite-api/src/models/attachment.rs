use base64::Engine;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::io::Read;

use crate::error::{Error, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,

    pub filename: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip)]
    pub data: Option<Vec<u8>>,
}

impl Attachment {
    pub fn new(id: Option<u64>, filename: &str) -> Self {
        Self {
            id,
            filename: sanitize_filename(filename),
            ..Default::default()
        }
    }

    pub fn with_base64_data(mut self, encoded: &str) -> Result<Self> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::parsing(format!("invalid attachment data: {}", e)))?;
        self.size.get_or_insert(data.len() as u64);
        self.data = Some(data);
        Ok(self)
    }

    /// Returns the attachment content, gunzipping compressed payloads.
    pub fn read(&self) -> Result<Vec<u8>> {
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| Error::Usage(format!("no data for attachment: {}", self.filename)))?;

        if data.starts_with(&GZIP_MAGIC) {
            let mut decoded = Vec::new();
            GzDecoder::new(data.as_slice()).read_to_end(&mut decoded)?;
            Ok(decoded)
        } else {
            Ok(data.clone())
        }
    }
}

/// Strips directories and parent references from server-supplied names.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(name);
    let cleaned = base.replace("..", "");
    if cleaned.trim().is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\temp\\log.txt"), "log.txt");
        assert_eq!(sanitize_filename("..patch..diff"), "patchdiff");
        assert_eq!(sanitize_filename(".."), "attachment");
        assert_eq!(Attachment::new(Some(1), "dir/build.log").filename, "build.log");
    }

    #[test]
    fn test_read_gunzips_compressed_data() {
        // Given: gzip圧縮されたデータ
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compiler output").unwrap();
        let compressed = encoder.finish().unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&compressed);

        // When: base64から読み込み
        let attachment = Attachment::new(Some(3), "build.log.gz")
            .with_base64_data(&encoded)
            .unwrap();

        // Then: 展開された内容が返る
        assert_eq!(attachment.read().unwrap(), b"compiler output");
        assert_eq!(attachment.size, Some(compressed.len() as u64));
    }

    #[test]
    fn test_read_without_data_fails() {
        let attachment = Attachment::new(None, "a.txt");
        assert!(matches!(attachment.read(), Err(Error::Usage(_))));
    }
}
