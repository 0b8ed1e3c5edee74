//! Structural checks for downloaded page images.
//!
//! [`Validator::is_valid`] answers "can this local file be trusted without
//! re-downloading it?" It never returns an error: anything that cannot be
//! confirmed, including I/O failures, counts as invalid.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::model::ExpectedArtifact;

/// Bytes read from each end of a file for signature checks.
const PROBE_LEN: usize = 16;

/// Recognised binary formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageFormat {
    fn detect(head: &[u8]) -> Option<Self> {
        if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if head.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(Self::Png)
        } else if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
            Some(Self::Gif)
        } else if head.len() >= 12 && &head[0..4] == b"RIFF" && &head[8..12] == b"WEBP" {
            Some(Self::Webp)
        } else {
            None
        }
    }

    /// Checks the trailer (or declared length) against the file size.
    fn trailer_ok(self, head: &[u8], tail: &[u8], file_len: u64) -> bool {
        match self {
            // Some encoders pad after EOI; accept it anywhere in the tail.
            Self::Jpeg => tail.windows(2).any(|w| w == [0xFF, 0xD9]),
            // IEND chunk type followed by its CRC.
            Self::Png => tail.len() >= 8 && &tail[tail.len() - 8..tail.len() - 4] == b"IEND",
            Self::Gif => tail.last() == Some(&0x3B),
            Self::Webp => {
                let declared = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
                u64::from(declared) + 8 <= file_len
            }
        }
    }
}

/// Cheap validity checks for local artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator {
    /// When set, files without a recognised image signature are rejected.
    require_known_format: bool,
}

impl Validator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects files whose header matches no known image format.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            require_known_format: true,
        }
    }

    /// Returns true if `path` exists, is non-empty, matches any known
    /// size/digest, and passes a header/trailer sanity check for its format.
    #[must_use]
    pub fn is_valid(&self, path: &Path, expected: Option<&ExpectedArtifact>) -> bool {
        match self.check(path, expected) {
            Ok(valid) => valid,
            Err(error) => {
                debug!(path = %path.display(), error = %error, "validation I/O error");
                false
            }
        }
    }

    fn check(&self, path: &Path, expected: Option<&ExpectedArtifact>) -> std::io::Result<bool> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() || metadata.len() == 0 {
            trace!(path = %path.display(), "missing or empty");
            return Ok(false);
        }
        let file_len = metadata.len();

        if let Some(size) = expected.and_then(|e| e.size)
            && size != file_len
        {
            debug!(path = %path.display(), expected = size, actual = file_len, "size mismatch");
            return Ok(false);
        }

        let mut file = std::fs::File::open(path)?;
        let mut head = [0_u8; PROBE_LEN];
        let head_len = read_up_to(&mut file, &mut head)?;
        let head = &head[..head_len];

        match ImageFormat::detect(head) {
            Some(format) => {
                let tail_len = file_len.min(PROBE_LEN as u64);
                file.seek(SeekFrom::End(-i64::try_from(tail_len).unwrap_or(0)))?;
                let mut tail = [0_u8; PROBE_LEN];
                let read = read_up_to(&mut file, &mut tail)?;
                if !format.trailer_ok(head, &tail[..read], file_len) {
                    debug!(path = %path.display(), ?format, "truncated image");
                    return Ok(false);
                }
            }
            None if self.require_known_format => {
                debug!(path = %path.display(), "unrecognised format");
                return Ok(false);
            }
            None => {}
        }

        if let Some(expected_digest) = expected.and_then(|e| e.sha256.as_deref()) {
            let actual = sha256_hex(path)?;
            if !actual.eq_ignore_ascii_case(expected_digest) {
                debug!(path = %path.display(), expected = expected_digest, actual = %actual, "digest mismatch");
                return Ok(false);
            }
        }

        Ok(true)
    }
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// Lowercase hex SHA-256 of a file.
///
/// # Errors
///
/// Propagates I/O errors from reading the file.
pub fn sha256_hex(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDRdata\0\0\0\0IEND\xaeB`\x82";
    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3, 4, 5, 0xFF, 0xD9];

    fn write(dir: &TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_missing_file_is_invalid() {
        let dir = TempDir::new().unwrap();
        assert!(!Validator::new().is_valid(&dir.path().join("nope.png"), None));
    }

    #[test]
    fn test_empty_file_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "empty.png", b"");
        assert!(!Validator::new().is_valid(&path, None));
    }

    #[test]
    fn test_directory_is_invalid() {
        let dir = TempDir::new().unwrap();
        assert!(!Validator::new().is_valid(dir.path(), None));
    }

    #[test]
    fn test_complete_png_and_jpeg_are_valid() {
        let dir = TempDir::new().unwrap();
        assert!(Validator::new().is_valid(&write(&dir, "a.png", PNG), None));
        assert!(Validator::new().is_valid(&write(&dir, "a.jpg", JPEG), None));
    }

    #[test]
    fn test_truncated_png_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.png", &PNG[..PNG.len() - 10]);
        assert!(!Validator::new().is_valid(&path, None));
    }

    #[test]
    fn test_truncated_jpeg_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.jpg", &JPEG[..JPEG.len() - 2]);
        assert!(!Validator::new().is_valid(&path, None));
    }

    #[test]
    fn test_gif_requires_trailer() {
        let dir = TempDir::new().unwrap();
        let good = write(&dir, "good.gif", b"GIF89a\x01\x00\x01\x00;");
        let bad = write(&dir, "bad.gif", b"GIF89a\x01\x00\x01\x00");
        assert!(Validator::new().is_valid(&good, None));
        assert!(!Validator::new().is_valid(&bad, None));
    }

    #[test]
    fn test_webp_declared_length_checked() {
        let dir = TempDir::new().unwrap();
        let mut bytes = b"RIFF".to_vec();
        bytes.extend_from_slice(&12_u32.to_le_bytes());
        bytes.extend_from_slice(b"WEBPVP8 abcd");
        let good = write(&dir, "good.webp", &bytes);
        let bad = write(&dir, "bad.webp", &bytes[..bytes.len() - 2]);
        assert!(Validator::new().is_valid(&good, None));
        assert!(!Validator::new().is_valid(&bad, None));
    }

    #[test]
    fn test_unknown_format_depends_on_strictness() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.bin", b"plain bytes");
        assert!(Validator::new().is_valid(&path, None));
        assert!(!Validator::strict().is_valid(&path, None));
    }

    #[test]
    fn test_expected_size_mismatch_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.png", PNG);
        let expected = ExpectedArtifact {
            size: Some(PNG.len() as u64 + 1),
            sha256: None,
        };
        assert!(!Validator::new().is_valid(&path, Some(&expected)));
        let expected = ExpectedArtifact {
            size: Some(PNG.len() as u64),
            sha256: None,
        };
        assert!(Validator::new().is_valid(&path, Some(&expected)));
    }

    #[test]
    fn test_expected_digest_checked() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.jpg", JPEG);
        let digest = sha256_hex(&path).unwrap();
        let good = ExpectedArtifact {
            size: None,
            sha256: Some(digest.to_uppercase()),
        };
        let bad = ExpectedArtifact {
            size: None,
            sha256: Some("00".repeat(32)),
        };
        assert!(Validator::new().is_valid(&path, Some(&good)));
        assert!(!Validator::new().is_valid(&path, Some(&bad)));
    }
}
