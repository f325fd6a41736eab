//! The per-connection request loop.

use std::io::{self, SeekFrom};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tokio::fs::File;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::listing::{ListingBody, ListingSource};
use super::{
    guarded, reached, ConnectionId, EngineContext, ShutdownPhase, Transfer, TransferError,
    TransferResult, TransferState,
};
use crate::http::{
    content_type, http_date, range, RangeRequest, Request, RequestError, ResponseHead,
    StatusCode, Version, MAX_HEAD_BYTES,
};
use crate::share::ResolveError;

/// What a request resolved to on disk.
enum Resource {
    File(PathBuf),
    Directory(PathBuf),
    /// `/` with no share mounted there: list the shares themselves.
    ShareIndex,
}

/// How a connection ended.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSummary {
    pub connection_id: ConnectionId,
    /// Requests read off the connection, including rejected ones.
    pub requests: u32,
    pub bytes_sent: u64,
    /// `Closed` for an orderly end, `Failed` otherwise.
    pub state: TransferState,
}

/// Serves requests from one connection until it closes.
pub struct TransferEngine<S> {
    io: BufReader<S>,
    ctx: Arc<EngineContext>,
    peer: SocketAddr,
    id: ConnectionId,
    shutdown: watch::Receiver<ShutdownPhase>,
}

impl<S> TransferEngine<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        ctx: Arc<EngineContext>,
        shutdown: watch::Receiver<ShutdownPhase>,
    ) -> Self {
        Self::with_id(ConnectionId::new(), stream, peer, ctx, shutdown)
    }

    pub fn with_id(
        id: ConnectionId,
        stream: S,
        peer: SocketAddr,
        ctx: Arc<EngineContext>,
        shutdown: watch::Receiver<ShutdownPhase>,
    ) -> Self {
        Self {
            io: BufReader::new(stream),
            ctx,
            peer,
            id,
            shutdown,
        }
    }

    /// Serve requests until the client closes, keep-alive ends, an error
    /// occurs, or shutdown says stop.
    pub async fn run(mut self) -> ConnectionSummary {
        let mut summary = ConnectionSummary {
            connection_id: self.id,
            requests: 0,
            bytes_sent: 0,
            state: TransferState::Reading,
        };

        loop {
            let first = summary.requests == 0;
            let request = match self.read_head(first).await {
                Ok(Some(head)) => Request::parse(&head).map_err(TransferError::from),
                Ok(None) => {
                    summary.state = TransferState::Closed;
                    break;
                }
                Err(e) => Err(e),
            };

            let request = match request {
                Ok(request) => request,
                Err(TransferError::Request(e)) => {
                    summary.requests += 1;
                    debug!(connection = %self.id, peer = %self.peer, error = %e, "Rejecting request");
                    let mut transfer = Transfer::new(self.id, "");
                    transfer.state = TransferState::Failed;
                    self.ctx.stats.record(&transfer);
                    let _ = self.send_error(e.status(), false, false).await;
                    summary.state = TransferState::Failed;
                    break;
                }
                Err(e) => {
                    debug!(connection = %self.id, peer = %self.peer, error = %e, "Connection ended while reading request");
                    summary.state = TransferState::Failed;
                    break;
                }
            };
            summary.requests += 1;

            let keep_alive =
                request.keep_alive() && *self.shutdown.borrow() == ShutdownPhase::Running;
            let mut transfer = Transfer::new(self.id, request.target.as_str());
            debug!(
                connection = %self.id,
                method = %request.method,
                path = %transfer.requested_path,
                "Request"
            );

            let result = self.exchange(&request, &mut transfer, keep_alive).await;
            summary.bytes_sent += transfer.bytes_sent;

            match result {
                Ok(keep_open) => {
                    self.ctx.stats.record(&transfer);
                    if !keep_open {
                        summary.state = TransferState::Closed;
                        break;
                    }
                }
                Err(e) => {
                    transfer.state = TransferState::Failed;
                    self.ctx.stats.record(&transfer);
                    match e {
                        TransferError::Cancelled => {
                            info!(connection = %self.id, path = %transfer.requested_path, bytes = transfer.bytes_sent, "Transfer cancelled")
                        }
                        TransferError::LocalRead(ref err) => {
                            warn!(connection = %self.id, class = %e.class(), path = %transfer.requested_path, error = %err, "Local read failed mid-transfer")
                        }
                        _ => {
                            debug!(connection = %self.id, class = %e.class(), path = %transfer.requested_path, error = %e, "Transfer failed")
                        }
                    }
                    summary.state = TransferState::Failed;
                    break;
                }
            }
        }

        if summary.state == TransferState::Closed {
            let _ = tokio::time::timeout(self.ctx.limits.write_timeout, self.io.shutdown()).await;
        }
        summary
    }

    /// Read one request head. `Ok(None)` means the connection ended cleanly
    /// before a new request started.
    async fn read_head(&mut self, first: bool) -> TransferResult<Option<String>> {
        let deadline = Instant::now() + self.ctx.limits.header_timeout;
        let mut head = String::new();

        loop {
            let remaining = MAX_HEAD_BYTES.saturating_sub(head.len());
            if remaining == 0 {
                return Err(RequestError::HeadTooLarge.into());
            }

            let idle = head.is_empty();
            let stop_at = if idle {
                ShutdownPhase::Draining
            } else {
                ShutdownPhase::Forced
            };

            let mut line = String::new();
            let mut limited = (&mut self.io).take(remaining as u64);
            let read = tokio::select! {
                r = tokio::time::timeout_at(deadline, limited.read_line(&mut line)) => r,
                _ = reached(&mut self.shutdown, stop_at) => {
                    return if idle { Ok(None) } else { Err(TransferError::Cancelled) };
                }
            };

            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    return Err(RequestError::MalformedRequestLine.into())
                }
                Ok(Err(e)) => return Err(e.into()),
                // An idle keep-alive connection timing out is a normal close.
                Err(_) if idle && !first => return Ok(None),
                Err(_) => return Err(TransferError::HeaderTimeout),
            };

            if n == 0 {
                return if idle {
                    Ok(None)
                } else {
                    Err(TransferError::ClientClosed)
                };
            }
            if !line.ends_with('\n') {
                return if line.len() >= remaining {
                    Err(RequestError::HeadTooLarge.into())
                } else {
                    Err(TransferError::ClientClosed)
                };
            }
            if line.trim_end_matches(['\r', '\n']).is_empty() {
                if idle {
                    continue;
                }
                return Ok(Some(head));
            }
            head.push_str(&line);
        }
    }

    /// Resolve and answer one request. Returns whether the connection stays
    /// open for another request.
    async fn exchange(
        &mut self,
        request: &Request,
        transfer: &mut Transfer,
        keep_alive: bool,
    ) -> TransferResult<bool> {
        transfer.state = TransferState::Resolving;

        let resource = match self.resolve(request).await {
            Ok(resource) => resource,
            Err(status) => return self.reject(status, request, transfer, keep_alive).await,
        };

        match resource {
            Resource::File(path) => self.serve_file(request, &path, transfer, keep_alive).await,
            Resource::Directory(path) => {
                if !self.ctx.limits.allow_listing {
                    return self
                        .reject(StatusCode::FORBIDDEN, request, transfer, keep_alive)
                        .await;
                }
                match ListingSource::directory(&path).await {
                    Ok(source) => {
                        self.serve_listing(request, source, transfer, keep_alive)
                            .await
                    }
                    Err(e) => {
                        let status = self.status_for_io(&e, &path);
                        self.reject(status, request, transfer, keep_alive).await
                    }
                }
            }
            Resource::ShareIndex => {
                let shares = self
                    .ctx
                    .registry
                    .entries()
                    .filter(|e| e.permits(self.peer.ip()))
                    .map(|e| e.public_path.clone())
                    .collect();
                self.serve_listing(request, ListingSource::shares(shares), transfer, keep_alive)
                    .await
            }
        }
    }

    async fn resolve(&self, request: &Request) -> Result<Resource, StatusCode> {
        let segments = request.target.segments();

        let resolution = match self.ctx.registry.resolve(segments, self.peer.ip()) {
            Ok(resolution) => resolution,
            Err(ResolveError::NotFound) if segments.is_empty() && self.ctx.limits.allow_listing => {
                return Ok(Resource::ShareIndex)
            }
            Err(e) => return Err(status_for_resolve(e)),
        };

        let path = resolution.confine().await.map_err(status_for_resolve)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| self.status_for_io(&e, &path))?;

        if metadata.is_dir() {
            Ok(Resource::Directory(path))
        } else {
            Ok(Resource::File(path))
        }
    }

    async fn serve_file(
        &mut self,
        request: &Request,
        path: &Path,
        transfer: &mut Transfer,
        keep_alive: bool,
    ) -> TransferResult<bool> {
        let opened = match File::open(path).await {
            Ok(file) => file.metadata().await.map(|m| (file, m)),
            Err(e) => Err(e),
        };
        let (mut file, metadata) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let status = self.status_for_io(&e, path);
                return self.reject(status, request, transfer, keep_alive).await;
            }
        };
        let len = metadata.len();
        let modified = metadata.modified().ok();

        if let (Some(since), Some(modified)) = (request.if_modified_since(), modified) {
            let modified_secs = modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            if modified_secs <= since.timestamp() {
                transfer.state = TransferState::Streaming;
                let head = ResponseHead::new(StatusCode::NOT_MODIFIED)
                    .header("Last-Modified", http_date(modified))
                    .connection(keep_alive);
                self.write(&head.to_bytes()).await?;
                return self.finish(transfer, keep_alive).await;
            }
        }

        let (status, start, count) = match range::evaluate(request.range(), len) {
            RangeRequest::Full => (StatusCode::OK, 0, len),
            RangeRequest::Partial(range) => {
                transfer.range = Some(range);
                (StatusCode::PARTIAL_CONTENT, range.start, range.len())
            }
            RangeRequest::Unsatisfiable => {
                transfer.state = TransferState::Failed;
                let (head, body) = ResponseHead::error(StatusCode::RANGE_NOT_SATISFIABLE);
                let head = head
                    .header("Content-Range", format!("bytes */{}", len))
                    .connection(keep_alive);
                self.write(&head.to_bytes()).await?;
                if !request.is_head() {
                    self.write(&body).await?;
                }
                self.flush().await?;
                return Ok(keep_alive);
            }
        };

        transfer.state = TransferState::Streaming;
        let mut head = ResponseHead::new(status)
            .header("Content-Type", content_type(path))
            .header("Accept-Ranges", "bytes")
            .content_length(count);
        if let Some(range) = transfer.range {
            head = head.header("Content-Range", range.content_range(len));
        }
        if let Some(modified) = modified {
            head = head.header("Last-Modified", http_date(modified));
        }
        self.write(&head.connection(keep_alive).to_bytes()).await?;

        if !request.is_head() && count > 0 {
            if start > 0 {
                file.seek(SeekFrom::Start(start))
                    .await
                    .map_err(TransferError::LocalRead)?;
            }
            self.stream_file(&mut file, count, transfer).await?;
        }
        drop(file);

        self.finish(transfer, keep_alive).await
    }

    /// Copy `count` bytes from `file` to the client, one chunk at a time. The
    /// next chunk is read only after the previous write has completed.
    async fn stream_file(
        &mut self,
        file: &mut File,
        count: u64,
        transfer: &mut Transfer,
    ) -> TransferResult<()> {
        let chunk = self.ctx.limits.chunk_size.max(1) as u64;
        let mut buf = vec![0u8; chunk.min(count) as usize];
        let mut remaining = count;

        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let read = tokio::select! {
                r = file.read(&mut buf[..want]) => r.map_err(TransferError::LocalRead)?,
                _ = reached(&mut self.shutdown, ShutdownPhase::Forced) => {
                    return Err(TransferError::Cancelled);
                }
            };
            if read == 0 {
                return Err(TransferError::LocalRead(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file shrank while streaming",
                )));
            }

            self.write(&buf[..read]).await?;
            remaining -= read as u64;
            transfer.bytes_sent += read as u64;
        }
        Ok(())
    }

    async fn serve_listing(
        &mut self,
        request: &Request,
        mut source: ListingSource,
        transfer: &mut Transfer,
        keep_alive: bool,
    ) -> TransferResult<bool> {
        // HTTP/1.0 has no chunked encoding; the body ends at connection close.
        let chunked = request.version != Version::HTTP_10;
        let keep_alive = keep_alive && chunked;

        transfer.state = TransferState::Streaming;
        let mut head =
            ResponseHead::new(StatusCode::OK).header("Content-Type", "text/plain; charset=utf-8");
        if chunked {
            head = head.chunked();
        }
        self.write(&head.connection(keep_alive).to_bytes()).await?;

        if request.is_head() {
            return self.finish(transfer, keep_alive).await;
        }

        let mut body = ListingBody::new(self.ctx.limits.chunk_size, chunked);
        loop {
            let line = tokio::select! {
                r = source.next_line() => r.map_err(TransferError::LocalRead)?,
                _ = reached(&mut self.shutdown, ShutdownPhase::Forced) => {
                    return Err(TransferError::Cancelled);
                }
            };
            let Some(line) = line else { break };
            if let Some(frame) = body.push_line(&line) {
                self.write(&frame).await?;
                transfer.bytes_sent += frame.len() as u64;
            }
        }
        let tail = body.finish();
        self.write(&tail).await?;
        transfer.bytes_sent += tail.len() as u64;

        self.finish(transfer, keep_alive).await
    }

    /// Answer with an error status; the transfer ends `Failed` but the
    /// connection may carry on.
    async fn reject(
        &mut self,
        status: StatusCode,
        request: &Request,
        transfer: &mut Transfer,
        keep_alive: bool,
    ) -> TransferResult<bool> {
        transfer.state = TransferState::Failed;
        debug!(connection = %self.id, path = %transfer.requested_path, status = status.as_u16(), "Request rejected");
        self.send_error(status, request.is_head(), keep_alive).await?;
        Ok(keep_alive)
    }

    async fn send_error(
        &mut self,
        status: StatusCode,
        head_only: bool,
        keep_alive: bool,
    ) -> TransferResult<()> {
        let (head, body) = ResponseHead::error(status);
        self.write(&head.connection(keep_alive).to_bytes()).await?;
        if !head_only {
            self.write(&body).await?;
        }
        self.flush().await
    }

    async fn finish(&mut self, transfer: &mut Transfer, keep_alive: bool) -> TransferResult<bool> {
        transfer.state = TransferState::Draining;
        self.flush().await?;
        transfer.state = TransferState::Closed;
        info!(
            connection = %self.id,
            peer = %self.peer,
            path = %transfer.requested_path,
            bytes = transfer.bytes_sent,
            "Transfer complete"
        );
        Ok(keep_alive)
    }

    async fn write(&mut self, bytes: &[u8]) -> TransferResult<()> {
        let deadline = Instant::now() + self.ctx.limits.write_timeout;
        guarded(
            &mut self.shutdown,
            deadline,
            TransferError::WriteTimeout,
            self.io.write_all(bytes),
        )
        .await
    }

    async fn flush(&mut self) -> TransferResult<()> {
        let deadline = Instant::now() + self.ctx.limits.write_timeout;
        guarded(
            &mut self.shutdown,
            deadline,
            TransferError::WriteTimeout,
            self.io.flush(),
        )
        .await
    }

    fn status_for_io(&self, error: &io::Error, path: &Path) -> StatusCode {
        match error.kind() {
            io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            _ => {
                warn!(connection = %self.id, path = %path.display(), error = %error, "Failed to open shared resource");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

fn status_for_resolve(error: ResolveError) -> StatusCode {
    match error {
        ResolveError::NotFound => StatusCode::NOT_FOUND,
        ResolveError::Forbidden => StatusCode::FORBIDDEN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::{ShareConfig, ShareRegistry};
    use crate::transfer::TransferLimits;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    const PEER: &str = "127.0.0.1:40000";

    struct Fixture {
        _dir: TempDir,
        ctx: Arc<EngineContext>,
    }

    fn fixture_with(limits: TransferLimits) -> Fixture {
        let dir = TempDir::new().unwrap();
        let docs = dir.path().join("docs");
        std::fs::create_dir(&docs).unwrap();
        std::fs::write(docs.join("hello.txt"), b"hello, world").unwrap();
        std::fs::create_dir(docs.join("nested")).unwrap();
        let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(docs.join("big.bin"), &big).unwrap();

        let registry =
            ShareRegistry::from_configs(&[ShareConfig::new("/docs", &docs)]).unwrap();
        Fixture {
            _dir: dir,
            ctx: Arc::new(EngineContext::new(Arc::new(registry), limits)),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(TransferLimits::default())
    }

    /// Send raw bytes, read until the server closes.
    async fn roundtrip(ctx: Arc<EngineContext>, raw: &[u8]) -> (ConnectionSummary, Vec<u8>) {
        let (mut client, server) = duplex(1 << 20);
        let (_tx, rx) = watch::channel(ShutdownPhase::Running);
        let engine = TransferEngine::new(server, PEER.parse().unwrap(), ctx, rx);
        let task = tokio::spawn(engine.run());

        client.write_all(raw).await.unwrap();
        client.shutdown().await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        (task.await.unwrap(), out)
    }

    /// Split one response off the front of `raw`: (status, head text, body).
    fn split_response(raw: &[u8]) -> (u16, String, Vec<u8>) {
        let end = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("complete head");
        let head = String::from_utf8(raw[..end].to_vec()).unwrap();
        let status = head[9..12].parse().unwrap();
        (status, head, raw[end + 4..].to_vec())
    }

    #[tokio::test]
    async fn test_get_full_file() {
        let f = fixture();
        let (summary, out) =
            roundtrip(f.ctx.clone(), b"GET /docs/hello.txt HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        let (status, head, body) = split_response(&out);

        assert_eq!(status, 200);
        assert!(head.contains("Content-Length: 12"));
        assert!(head.contains("Content-Type: text/plain"));
        assert!(head.contains("Accept-Ranges: bytes"));
        assert_eq!(body, b"hello, world");
        assert_eq!(summary.state, TransferState::Closed);
        assert_eq!(f.ctx.stats.snapshot().completed, 1);
    }

    #[tokio::test]
    async fn test_head_has_no_body() {
        let f = fixture();
        let (_, out) =
            roundtrip(f.ctx, b"HEAD /docs/hello.txt HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        let (status, head, body) = split_response(&out);
        assert_eq!(status, 200);
        assert!(head.contains("Content-Length: 12"));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_partial_range() {
        let f = fixture();
        let (_, out) = roundtrip(
            f.ctx,
            b"GET /docs/hello.txt HTTP/1.1\r\nRange: bytes=7-11\r\nConnection: close\r\n\r\n",
        )
        .await;
        let (status, head, body) = split_response(&out);
        assert_eq!(status, 206);
        assert!(head.contains("Content-Range: bytes 7-11/12"));
        assert_eq!(body, b"world");
    }

    #[tokio::test]
    async fn test_range_outside_file() {
        let f = fixture();
        let (_, out) = roundtrip(
            f.ctx,
            b"GET /docs/hello.txt HTTP/1.1\r\nRange: bytes=50-60\r\nConnection: close\r\n\r\n",
        )
        .await;
        let (status, head, _) = split_response(&out);
        assert_eq!(status, 416);
        assert!(head.contains("Content-Range: bytes */12"));
    }

    #[tokio::test]
    async fn test_unknown_path_is_404_without_details() {
        let f = fixture();
        let (_, out) =
            roundtrip(f.ctx, b"GET /nope/x.txt HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        let (status, _, body) = split_response(&out);
        assert_eq!(status, 404);
        assert_eq!(body, b"404 Not Found\n");
    }

    #[tokio::test]
    async fn test_missing_file_in_share_is_404() {
        let f = fixture();
        let (_, out) =
            roundtrip(f.ctx, b"GET /docs/missing.txt HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert_eq!(split_response(&out).0, 404);
    }

    #[tokio::test]
    async fn test_encoded_traversal_is_403() {
        let f = fixture();
        let (summary, out) =
            roundtrip(f.ctx.clone(), b"GET /docs/%2e%2e/secret HTTP/1.1\r\n\r\n").await;
        assert_eq!(split_response(&out).0, 403);
        assert_eq!(summary.state, TransferState::Failed);
        assert_eq!(f.ctx.stats.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_unsupported_method_is_400() {
        let f = fixture();
        let (summary, out) = roundtrip(f.ctx.clone(), b"DELETE /docs/hello.txt HTTP/1.1\r\n\r\n").await;
        assert_eq!(split_response(&out).0, 400);
        assert_eq!(summary.state, TransferState::Failed);
        assert_eq!(f.ctx.stats.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_not_modified() {
        let f = fixture();
        let (_, out) = roundtrip(
            f.ctx,
            b"GET /docs/hello.txt HTTP/1.1\r\nIf-Modified-Since: Fri, 01 Jan 2100 00:00:00 GMT\r\nConnection: close\r\n\r\n",
        )
        .await;
        let (status, head, body) = split_response(&out);
        assert_eq!(status, 304);
        assert!(head.contains("Last-Modified: "));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_keep_alive_serves_pipelined_requests() {
        let f = fixture();
        let (summary, out) = roundtrip(
            f.ctx,
            b"GET /docs/hello.txt HTTP/1.1\r\n\r\nGET /docs/hello.txt HTTP/1.1\r\nRange: bytes=0-4\r\nConnection: close\r\n\r\n",
        )
        .await;

        let (status, _, rest) = split_response(&out);
        assert_eq!(status, 200);
        assert!(rest.starts_with(b"hello, world"));
        let (status, _, body) = split_response(&rest[12..]);
        assert_eq!(status, 206);
        assert_eq!(body, b"hello");
        assert_eq!(summary.requests, 2);
        assert_eq!(summary.state, TransferState::Closed);
    }

    #[tokio::test]
    async fn test_multi_chunk_file_round_trip() {
        let f = fixture_with(TransferLimits {
            chunk_size: 4096,
            ..TransferLimits::default()
        });
        let expected: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (summary, out) =
            roundtrip(f.ctx, b"GET /docs/big.bin HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        let (status, _, body) = split_response(&out);
        assert_eq!(status, 200);
        assert_eq!(body, expected);
        assert_eq!(summary.bytes_sent, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_directory_listing_is_chunked() {
        let f = fixture();
        let (_, out) = roundtrip(f.ctx, b"GET /docs HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        let (status, head, body) = split_response(&out);
        assert_eq!(status, 200);
        assert!(head.contains("Transfer-Encoding: chunked"));
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("hello.txt\n"));
        assert!(body.contains("nested/\n"));
        assert!(body.ends_with("0\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_directory_listing_http10_is_raw() {
        let f = fixture();
        let (_, out) = roundtrip(f.ctx, b"GET /docs/ HTTP/1.0\r\n\r\n").await;
        let (status, head, body) = split_response(&out);
        assert_eq!(status, 200);
        assert!(!head.contains("Transfer-Encoding"));
        assert!(String::from_utf8(body).unwrap().contains("hello.txt\n"));
    }

    #[tokio::test]
    async fn test_listing_disabled_is_403() {
        let f = fixture_with(TransferLimits {
            allow_listing: false,
            ..TransferLimits::default()
        });
        let (_, out) = roundtrip(f.ctx, b"GET /docs HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert_eq!(split_response(&out).0, 403);
    }

    #[tokio::test]
    async fn test_root_lists_shares() {
        let f = fixture();
        let (_, out) = roundtrip(f.ctx, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        let (status, _, body) = split_response(&out);
        assert_eq!(status, 200);
        assert!(String::from_utf8(body).unwrap().contains("/docs\n"));
    }

    #[tokio::test]
    async fn test_oversized_head_is_400() {
        let f = fixture();
        let mut raw = b"GET /docs/hello.txt HTTP/1.1\r\nX-Filler: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES));
        raw.extend_from_slice(b"\r\n\r\n");
        let (summary, out) = roundtrip(f.ctx, &raw).await;
        assert_eq!(split_response(&out).0, 400);
        assert_eq!(summary.state, TransferState::Failed);
    }

    #[tokio::test]
    async fn test_client_eof_before_request_is_clean() {
        let f = fixture();
        let (summary, out) = roundtrip(f.ctx, b"").await;
        assert!(out.is_empty());
        assert_eq!(summary.state, TransferState::Closed);
        assert_eq!(summary.requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_times_out() {
        let f = fixture();
        let (_client, server) = duplex(1024);
        let (_tx, rx) = watch::channel(ShutdownPhase::Running);
        let engine = TransferEngine::new(server, PEER.parse().unwrap(), f.ctx, rx);

        let summary = engine.run().await;
        assert_eq!(summary.state, TransferState::Failed);
    }

    #[tokio::test]
    async fn test_draining_closes_idle_connection() {
        let f = fixture();
        let (_client, server) = duplex(1024);
        let (tx, rx) = watch::channel(ShutdownPhase::Running);
        let engine = TransferEngine::new(server, PEER.parse().unwrap(), f.ctx, rx);
        let task = tokio::spawn(engine.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(ShutdownPhase::Draining).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("engine should stop promptly")
            .unwrap();
        assert_eq!(summary.state, TransferState::Closed);
    }

    #[tokio::test]
    async fn test_forced_shutdown_cancels_stalled_transfer() {
        let f = fixture_with(TransferLimits {
            chunk_size: 1024,
            ..TransferLimits::default()
        });
        // Tiny pipe and a client that never reads: the engine stalls on write.
        let (mut client, server) = duplex(256);
        let (tx, rx) = watch::channel(ShutdownPhase::Running);
        let engine = TransferEngine::new(server, PEER.parse().unwrap(), f.ctx, rx);
        let task = tokio::spawn(engine.run());

        client
            .write_all(b"GET /docs/big.bin HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(ShutdownPhase::Forced).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("engine should stop promptly")
            .unwrap();
        assert_eq!(summary.state, TransferState::Failed);
        assert!(summary.bytes_sent < 200_000);
    }
}
