//! Streams a page body to disk through a temporary `.part` file.
//!
//! The final path only ever appears via rename after the byte count has been
//! checked, so a reader of the final path sees a complete file or nothing.
//! The `.part` file is removed on every failure path, including task abort,
//! by a drop guard.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};

use super::FetchError;
use crate::source::UnitBody;

const PART_SUFFIX: &str = "part";

/// Temporary sibling path for `target` (`page.png` becomes `page.png.part`).
#[must_use]
pub fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".");
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// Removes the temporary file on drop unless it was committed.
#[derive(Debug)]
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "removed partial file"),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    debug!(path = %self.path.display(), error = %error, "could not remove partial file");
                }
            }
        }
    }
}

/// Writes `body` to `target`, returning the number of bytes written.
///
/// The size must match the advertised content length and `expected_size`
/// when either is known; an empty body is rejected.
///
/// # Errors
///
/// Returns [`FetchError::Stream`] if the body breaks off,
/// [`FetchError::Integrity`] on a length mismatch, [`FetchError::EmptyBody`]
/// for zero bytes and [`FetchError::Io`] for filesystem failures.
#[instrument(skip(body), fields(target = %target.display(), content_length = ?body.content_length))]
pub async fn write_body(
    target: &Path,
    url: &str,
    body: UnitBody,
    expected_size: Option<u64>,
) -> Result<u64, FetchError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| FetchError::io(parent, e))?;
    }

    let part_path = partial_path(target);
    let guard = PartialFile::new(part_path.clone());

    let file = File::create(&part_path)
        .await
        .map_err(|e| FetchError::io(&part_path, e))?;
    let bytes_written = stream_to_file(file, body.stream, &part_path).await?;

    if bytes_written == 0 {
        return Err(FetchError::EmptyBody {
            url: url.to_string(),
        });
    }
    for expected in [body.content_length, expected_size].into_iter().flatten() {
        if expected != bytes_written {
            return Err(FetchError::integrity(target, expected, bytes_written));
        }
    }

    tokio::fs::rename(&part_path, target)
        .await
        .map_err(|e| FetchError::io(target, e))?;
    guard.commit();

    debug!(bytes = bytes_written, "page written");
    Ok(bytes_written)
}

async fn stream_to_file(
    file: File,
    mut stream: futures_util::stream::BoxStream<'static, Result<Vec<u8>, FetchError>>,
    path: &Path,
) -> Result<u64, FetchError> {
    let mut writer = BufWriter::new(file);
    let mut bytes_written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| FetchError::io(path, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer.flush().await.map_err(|e| FetchError::io(path, e))?;
    writer
        .get_ref()
        .sync_all()
        .await
        .map_err(|e| FetchError::io(path, e))?;

    Ok(bytes_written)
}
