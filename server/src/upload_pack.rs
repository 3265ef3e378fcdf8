//! End-to-end upload-pack orchestration: one instance per request, gluing
//! the parsed negotiation, the repo mirror, the pack cache and the
//! `git-upload-pack` subprocess together.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use git_http::errors::GitHttpError;
use git_http::negotiation::UploadPackInput;
use git_http::pkt::encode_pkt_line;
use metrics::{counter, histogram};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _};
use tokio::process::Command;
use tokio::sync::{Semaphore, mpsc};

use crate::config::Config;
use crate::pack_cache::{PackCache, PackCacheCleaner};
use crate::repo_cache::RepoCache;
use crate::util::{ensure_proc_terminated, redact_auth};

/// A caching upload-pack is allowed to outlive its client so the entry
/// finishes; a direct one is useless once the client is gone.
const CACHING_REAP_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPackStatus {
    Pending,
    Hit,
    Miss,
    Direct,
    Error,
}

pub struct UploadPackHandler {
    path: String,
    auth: String,
    protocol_version: u8,
    writer: mpsc::Sender<Bytes>,
    sema: Option<Arc<Semaphore>>,
    config: Arc<Config>,
    cleaner: Arc<PackCacheCleaner>,
    pub rcache_hit: bool,
    pub pcache_hit: bool,
    pub status: UploadPackStatus,
}

impl UploadPackHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: &str,
        auth: &str,
        protocol_version: u8,
        writer: mpsc::Sender<Bytes>,
        sema: Option<Arc<Semaphore>>,
        config: Arc<Config>,
        cleaner: Arc<PackCacheCleaner>,
    ) -> Self {
        UploadPackHandler {
            path: path.to_string(),
            auth: auth.to_string(),
            protocol_version,
            writer,
            sema,
            config,
            cleaner,
            rcache_hit: false,
            pcache_hit: false,
            status: UploadPackStatus::Pending,
        }
    }

    /// Whole request: answer malformed or degenerate negotiations locally,
    /// route the rest through the pack cache when the fingerprint allows it.
    pub async fn run(&mut self, parsed: &UploadPackInput) -> Result<(), GitHttpError> {
        if parsed.parse_error {
            self.write_pack_error(&format!(
                "Wrong upload pack input: {}",
                String::from_utf8_lossy(parsed.input_prefix())
            ))
            .await;
            return Ok(());
        }
        if parsed.wants.is_empty() {
            tracing::warn!(path = %self.path, "request without wants");
            return Ok(());
        }
        if parsed.can_be_cached() {
            counter!("git_cdn.upload_pack_requests", "mode" => "cached").increment(1);
            self.run_with_cache(parsed).await
        } else {
            counter!("git_cdn.upload_pack_requests", "mode" => "direct").increment(1);
            self.status = UploadPackStatus::Direct;
            self.execute(parsed, None).await
        }
    }

    async fn run_with_cache(&mut self, parsed: &UploadPackInput) -> Result<(), GitHttpError> {
        let mut pcache = PackCache::new(&parsed.hash, &self.config)?;

        {
            let _lock = pcache.read_lock().await?;
            if pcache.exists() {
                self.pcache_hit = true;
                self.status = UploadPackStatus::Hit;
                pcache.send_pack(&self.writer).await?;
                return Ok(());
            }
        }

        {
            let _lock = pcache.write_lock().await?;
            // another worker may have filled the entry while we waited
            if !pcache.exists() {
                self.execute(parsed, Some(&mut pcache)).await?;
            }
        }

        {
            let _lock = pcache.read_lock().await?;
            if pcache.exists() {
                self.status = if pcache.hit {
                    UploadPackStatus::Hit
                } else {
                    UploadPackStatus::Miss
                };
                pcache.send_pack(&self.writer).await?;
                // keep the cache under budget, off the serving path
                self.cleaner.clean();
                return Ok(());
            }
        }

        // An upload-pack failure already reached the client through the
        // protocol (cache_pack flushed the error frames); anything else
        // means the entry vanished between write and read, e.g. an eviction
        // race. Look up the hash in the logs.
        if self.status != UploadPackStatus::Error {
            return Err(GitHttpError::internal("run with cache failed"));
        }
        Ok(())
    }

    async fn execute(
        &mut self,
        parsed: &UploadPackInput,
        pcache: Option<&mut PackCache>,
    ) -> Result<(), GitHttpError> {
        let rcache = RepoCache::new(&self.path, &self.auth, self.config.clone());
        self.rcache_hit = rcache.ensure_input_wants(&parsed.wants).await?;
        self.upload_pack(&rcache, parsed, pcache).await
    }

    async fn upload_pack(
        &mut self,
        rcache: &RepoCache,
        parsed: &UploadPackInput,
        pcache: Option<&mut PackCache>,
    ) -> Result<(), GitHttpError> {
        let _lock = rcache.read_lock().await?;
        if !rcache.exists() {
            return Ok(());
        }
        match self.sema.clone() {
            None => self.do_upload_pack(rcache, parsed, pcache).await,
            Some(sema) => {
                let wait_start = Instant::now();
                let _permit = sema
                    .acquire_owned()
                    .await
                    .map_err(|_| GitHttpError::internal("upload-pack semaphore closed"))?;
                histogram!("git_cdn.sema_wait_ms")
                    .record(wait_start.elapsed().as_millis() as f64);
                let started = Instant::now();
                let result = self.do_upload_pack(rcache, parsed, pcache).await;
                histogram!("git_cdn.upload_pack_ms")
                    .record(started.elapsed().as_millis() as f64);
                result
            }
        }
    }

    async fn do_upload_pack(
        &mut self,
        rcache: &RepoCache,
        parsed: &UploadPackInput,
        pcache: Option<&mut PackCache>,
    ) -> Result<(), GitHttpError> {
        let caching = pcache.is_some();
        let mut child = Command::new("git-upload-pack")
            .arg("--stateless-rpc")
            .arg(rcache.directory())
            .env(
                "GIT_PROTOCOL",
                format!("version={}", self.protocol_version),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                GitHttpError::internal(format!("failed to spawn git-upload-pack: {err}"))
            })?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GitHttpError::internal("missing upload-pack stdout"))?;

        let input = parsed.input.clone();
        let feed = async move {
            let Some(mut stdin) = stdin else { return };
            match stdin.write_all(&input).await {
                Ok(()) => {
                    let _ = stdin.shutdown().await;
                }
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                    // large input and an early protocol error such as
                    // "not our ref"; upload-pack reports it on stdout
                    tracing::warn!("broken pipe while writing to upload-pack stdin");
                }
                Err(err) => tracing::warn!(%err, "failed writing to upload-pack stdin"),
            }
        };

        let stream_result = match pcache {
            Some(pcache) => tokio::join!(feed, pcache.cache_pack(stdout, &self.writer)).1,
            None => {
                match tokio::join!(
                    feed,
                    Self::copy_to_writer(stdout, &self.writer, self.config.chunk_size)
                )
                .1
                {
                    Ok(()) => Ok(()),
                    Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => {
                        tracing::warn!("client disconnected during upload-pack");
                        Ok(())
                    }
                    Err(err) => Err(GitHttpError::from(err)),
                }
            }
        };

        let reap_timeout = if caching {
            CACHING_REAP_TIMEOUT
        } else {
            self.config.git_process_wait_timeout
        };
        let exit = ensure_proc_terminated(&mut child, "git upload-pack", reap_timeout).await;

        let code = exit.and_then(|status| status.code()).unwrap_or(-1);
        if code != 0 {
            let mut stderr_buf = Vec::new();
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_end(&mut stderr_buf).await;
            }
            let stderr_text =
                String::from_utf8_lossy(&redact_auth(&stderr_buf, &self.auth)).into_owned();
            self.status = UploadPackStatus::Error;
            tracing::warn!(
                returncode = code,
                reason = %stderr_text,
                "upload-pack exited with error"
            );
            self.write_pack_error(stderr_text.trim()).await;
        }
        tracing::debug!(path = %self.path, "upload pack done");
        stream_result
    }

    async fn copy_to_writer<R: AsyncRead + Unpin>(
        mut reader: R,
        writer: &mpsc::Sender<Bytes>,
        chunk_size: usize,
    ) -> std::io::Result<()> {
        let mut buf = vec![0u8; chunk_size];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            counter!("git_cdn.nocache_sent_bytes").increment(n as u64);
            writer
                .send(Bytes::copy_from_slice(&buf[..n]))
                .await
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::ConnectionReset, "client went away")
                })?;
        }
    }

    async fn write_pack_error(&self, error: &str) {
        tracing::error!(pack_error = error, "upload pack, sending error to client");
        let pkt = encode_pkt_line(format!("ERR {error}").as_bytes());
        let _ = self.writer.send(pkt.into()).await;
    }
}
