//! Plain-text directory listings, streamed without knowing their length.

use std::io;
use std::path::Path;

/// Where listing lines come from.
pub(crate) enum ListingSource {
    /// Entries of a directory inside a share, in directory order.
    Directory(tokio::fs::ReadDir),
    /// Public paths of all shares, for `/` when no share is mounted there.
    Shares(std::vec::IntoIter<String>),
}

impl ListingSource {
    pub(crate) async fn directory(path: &Path) -> io::Result<Self> {
        Ok(Self::Directory(tokio::fs::read_dir(path).await?))
    }

    pub(crate) fn shares(public_paths: Vec<String>) -> Self {
        Self::Shares(public_paths.into_iter())
    }

    /// Next listing line, without the trailing newline. Directories end in `/`.
    pub(crate) async fn next_line(&mut self) -> io::Result<Option<String>> {
        match self {
            ListingSource::Directory(entries) => {
                let Some(entry) = entries.next_entry().await? else {
                    return Ok(None);
                };
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    name.push('/');
                }
                Ok(Some(name))
            }
            ListingSource::Shares(paths) => Ok(paths.next().map(|p| format!("/{}", p))),
        }
    }
}

/// Batches listing lines into body chunks of roughly `chunk_size` bytes.
///
/// With `chunked` set, each batch is framed with HTTP chunked encoding and
/// [`ListingBody::finish`] appends the terminating zero-length chunk.
/// Otherwise the bytes are sent raw and the body ends when the connection
/// closes (HTTP/1.0 clients).
pub(crate) struct ListingBody {
    pending: Vec<u8>,
    chunk_size: usize,
    chunked: bool,
}

impl ListingBody {
    pub(crate) fn new(chunk_size: usize, chunked: bool) -> Self {
        Self {
            pending: Vec::with_capacity(chunk_size),
            chunk_size: chunk_size.max(1),
            chunked,
        }
    }

    /// Queue a line. Returns a frame to write once enough bytes are pending.
    pub(crate) fn push_line(&mut self, line: &str) -> Option<Vec<u8>> {
        self.pending.extend_from_slice(line.as_bytes());
        self.pending.push(b'\n');
        if self.pending.len() >= self.chunk_size {
            let data = std::mem::take(&mut self.pending);
            Some(self.frame(&data))
        } else {
            None
        }
    }

    /// Final bytes of the body.
    pub(crate) fn finish(self) -> Vec<u8> {
        let mut out = if self.pending.is_empty() {
            Vec::new()
        } else {
            self.frame(&self.pending)
        };
        if self.chunked {
            out.extend_from_slice(b"0\r\n\r\n");
        }
        out
    }

    fn frame(&self, data: &[u8]) -> Vec<u8> {
        if !self.chunked {
            return data.to_vec();
        }
        let mut out = format!("{:x}\r\n", data.len()).into_bytes();
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
        out
    }
}
