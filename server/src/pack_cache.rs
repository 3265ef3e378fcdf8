//! Content-addressed cache of upload-pack responses.
//!
//! Recompressing a pack is the expensive part of serving a clone, so the
//! exact byte stream produced by `git-upload-pack` is kept on disk keyed by
//! the negotiation fingerprint. An entry is valid iff it is non-empty and
//! ends with the pkt-line flush; its mtime is the LRU key for eviction.

use std::io::{Read as _, Seek as _, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use git_http::errors::GitHttpError;
use git_http::pkt::PktChunkReader;
use metrics::{counter, gauge, histogram};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::{Semaphore, mpsc};

use crate::config::Config;
use crate::lock::{FileLock, LockMode};

/// Minimum interval between cleaner runs across all workers.
const CLEAN_RATE_LIMIT: Duration = Duration::from_secs(60);

pub struct PackCache {
    hash: String,
    filename: PathBuf,
    chunk_size: usize,
    /// Starts true; flipped the first time `cache_pack` begins so the
    /// following send records a miss.
    pub hit: bool,
}

impl PackCache {
    pub fn new(hash: &str, config: &Config) -> std::io::Result<Self> {
        let filename = config.pack_entry_path(hash);
        if let Some(parent) = filename.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(PackCache {
            hash: hash.to_string(),
            filename,
            chunk_size: config.pack_cache_chunk_size,
            hit: true,
        })
    }

    pub async fn read_lock(&self) -> std::io::Result<FileLock> {
        FileLock::acquire(&self.filename, LockMode::Shared).await
    }

    pub async fn write_lock(&self) -> std::io::Result<FileLock> {
        FileLock::acquire(&self.filename, LockMode::Exclusive).await
    }

    pub fn size(&self) -> u64 {
        std::fs::metadata(&self.filename).map(|m| m.len()).unwrap_or(0)
    }

    /// Present and serveable: non-empty and terminated by the pkt-line
    /// flush. Anything else reads as absent so the next miss overwrites it.
    pub fn exists(&self) -> bool {
        let Ok(meta) = std::fs::metadata(&self.filename) else {
            return false;
        };
        if meta.len() >= 4 {
            let mut last = [0u8; 4];
            if let Ok(mut file) = std::fs::File::open(&self.filename)
                && file.seek(SeekFrom::End(-4)).is_ok()
                && file.read_exact(&mut last).is_ok()
                && last == *b"0000"
            {
                return true;
            }
        }
        if meta.len() > 0 {
            tracing::warn!(hash = %self.hash, "pack cache entry is corrupted");
        }
        false
    }

    /// Stream the entry to the client. A vanished client is not an error;
    /// the entry stays valid and its mtime is still bumped for LRU.
    pub async fn send_pack(&self, writer: &mpsc::Sender<Bytes>) -> Result<(), GitHttpError> {
        let status = if self.hit { "hit" } else { "miss" };
        let size = self.size();
        tracing::debug!(hash = %self.hash, pack_hit = self.hit, size, "serving from pack cache");

        let mut file = tokio::fs::File::open(&self.filename).await?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut sent: u64 = 0;
        let result: std::io::Result<()> = async {
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                if writer.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "client went away",
                    ));
                }
                sent += n as u64;
                counter!("git_cdn.pack_sent_bytes", "cache_status" => status)
                    .increment(n as u64);
            }
        }
        .await;

        match result {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => {
                tracing::warn!(hash = %self.hash, "connection reset while serving pack cache");
            }
            Err(err) => {
                if sent != size {
                    tracing::error!(hash = %self.hash, sent, size, %err, "unfinished pack cache read");
                }
                return Err(err.into());
            }
        }

        // LRU touch
        std::fs::File::open(&self.filename)?.set_modified(SystemTime::now())?;
        Ok(())
    }

    /// Miss path: copy upload-pack's stdout frame by frame into the entry.
    /// A decode failure aborts the write; whatever was already written is
    /// flushed to the client (upload-pack's early error frames live there)
    /// and the entry is unlinked.
    pub async fn cache_pack<R: AsyncRead + Unpin>(
        &mut self,
        reader: R,
        tee: &mpsc::Sender<Bytes>,
    ) -> Result<(), GitHttpError> {
        tracing::debug!(hash = %self.hash, "cache miss, creating new entry");
        self.hit = false;

        let mut file = tokio::fs::File::create(&self.filename).await?;
        let mut parser = PktChunkReader::new(reader);
        let result: std::io::Result<()> = async {
            while let Some(chunk) = parser.next_chunk().await? {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(err) = result {
            tracing::error!(hash = %self.hash, %err, "aborting pack cache write");
            if let Ok(partial) = tokio::fs::read(&self.filename).await
                && !partial.is_empty()
            {
                let _ = tee.send(partial.into()).await;
            }
            let _ = tokio::fs::remove_file(&self.filename).await;
        }
        Ok(())
    }
}

/// Keeps the pack cache under its size budget by evicting the oldest
/// entries, serialized across processes by a lock file in the cache root.
pub struct PackCacheCleaner {
    cache_dir: PathBuf,
    max_size: u64,
    lock_path: PathBuf,
    running: Arc<Semaphore>,
}

impl PackCacheCleaner {
    pub fn new(config: &Config) -> Self {
        let cache_dir = config.pack_cache_dir();
        PackCacheCleaner {
            lock_path: cache_dir.join("clean.lock"),
            cache_dir,
            max_size: config.pack_cache_max_size,
            running: Arc::new(Semaphore::new(1)),
        }
    }

    /// Background kick from the serving path. Never blocks, never fails the
    /// request: skips when a clean ran within the last minute or one is
    /// already in flight, otherwise dispatches to the blocking pool.
    pub fn clean(self: &Arc<Self>) {
        if let Some(mtime) = FileLock::mtime(&self.lock_path)
            && mtime.elapsed().map(|e| e < CLEAN_RATE_LIMIT).unwrap_or(true)
        {
            tracing::debug!("pack cache cleaned recently, skipping");
            return;
        }
        let Ok(permit) = self.running.clone().try_acquire_owned() else {
            return;
        };
        let cleaner = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            match cleaner.clean_task() {
                Ok(evicted) if evicted > 0 => {
                    tracing::info!(evicted, "pack cache cleaned");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(%err, "pack cache clean failed"),
            }
        });
    }

    /// One eviction pass under the cross-process lock. Returns the number
    /// of evicted entries.
    pub fn clean_task(&self) -> anyhow::Result<usize> {
        let lock = FileLock::acquire_blocking(&self.lock_path, LockMode::Exclusive)?;
        // Touch before scanning so workers racing on the first-ever clean
        // rate-limit against each other immediately.
        lock.touch()?;
        self.evict_lru()
    }

    fn evict_lru(&self) -> anyhow::Result<usize> {
        let mut files: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
        for shard in std::fs::read_dir(&self.cache_dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(shard.path())? {
                let entry = entry?;
                let meta = entry.metadata()?;
                if !meta.is_file() {
                    continue;
                }
                files.push((entry.path(), meta.len(), meta.modified()?));
            }
        }
        let total: u64 = files.iter().map(|(_, size, _)| *size).sum();
        gauge!("git_cdn.pack_cache_used_bytes").set(total as f64);
        tracing::debug!(
            size = total,
            max_size = self.max_size,
            entries = files.len(),
            "pack cache size"
        );
        if total < self.max_size {
            return Ok(0);
        }

        files.sort_by_key(|(_, _, mtime)| *mtime);
        let mut rm_size = 0u64;
        let mut victims = Vec::new();
        for file in &files {
            if total - rm_size < self.max_size {
                break;
            }
            rm_size += file.1;
            victims.push(file);
        }
        tracing::info!(
            size = total,
            max_size = self.max_size,
            rm_size,
            rm_files = victims.len(),
            "pack cache cleaning"
        );

        let mut removed = 0u64;
        let evicted = victims.len();
        for (path, size, _) in victims {
            let flock = FileLock::acquire_blocking(path, LockMode::Exclusive)?;
            tracing::debug!(entry = %path.display(), size, "evict");
            flock.delete()?;
            histogram!("git_cdn.pack_cache_evicted_bytes").record(*size as f64);
            removed += size;
            gauge!("git_cdn.pack_cache_used_bytes").set((total - removed) as f64);
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git_http::pkt::{PKT_FLUSH, encode_pkt_line};
    use url::Url;

    const HASH: &str = "00112233445566778899aabbccddeeff00112233";

    fn config(workdir: &std::path::Path) -> Config {
        Config::new(
            workdir.to_path_buf(),
            Url::parse("https://gitlab.example.com/").unwrap(),
        )
    }

    fn collector() -> (mpsc::Sender<Bytes>, tokio::task::JoinHandle<Vec<u8>>) {
        let (tx, mut rx) = mpsc::channel::<Bytes>(16);
        let handle = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Some(chunk) = rx.recv().await {
                out.extend_from_slice(&chunk);
            }
            out
        });
        (tx, handle)
    }

    fn wire(lines: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for line in lines {
            buf.extend_from_slice(&encode_pkt_line(line));
        }
        buf.extend_from_slice(PKT_FLUSH);
        buf
    }

    #[tokio::test]
    async fn exists_requires_trailing_flush() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let pcache = PackCache::new(HASH, &config).unwrap();
        assert!(!pcache.exists());

        std::fs::write(config.pack_entry_path(HASH), b"").unwrap();
        assert!(!pcache.exists());

        std::fs::write(config.pack_entry_path(HASH), b"0008data").unwrap();
        assert!(!pcache.exists());

        std::fs::write(config.pack_entry_path(HASH), b"0008data0000").unwrap();
        assert!(pcache.exists());
    }

    #[tokio::test]
    async fn cache_then_send_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut pcache = PackCache::new(HASH, &config).unwrap();

        let upstream = wire(&[b"NAK\n", &[1, b'P', b'A', b'C', b'K']]);
        let (tee, _sink) = collector();
        pcache.cache_pack(&upstream[..], &tee).await.unwrap();
        assert!(!pcache.hit);
        assert!(pcache.exists());

        let (tx, collected) = collector();
        pcache.send_pack(&tx).await.unwrap();
        drop(tx);
        assert_eq!(collected.await.unwrap(), upstream);
    }

    #[tokio::test]
    async fn cache_pack_abort_unlinks_and_flushes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut pcache = PackCache::new(HASH, &config).unwrap();

        // an error frame followed by EOF, no terminating flush
        let upstream = encode_pkt_line(b"ERR not our ref\n");
        let (tee, flushed) = collector();
        pcache.cache_pack(&upstream[..], &tee).await.unwrap();
        drop(tee);

        assert!(!config.pack_entry_path(HASH).exists());
        assert_eq!(flushed.await.unwrap(), upstream);
    }

    #[tokio::test]
    async fn send_pack_touches_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut pcache = PackCache::new(HASH, &config).unwrap();
        let (tee, _sink) = collector();
        pcache
            .cache_pack(&wire(&[b"NAK\n"])[..], &tee)
            .await
            .unwrap();

        let entry = config.pack_entry_path(HASH);
        let old = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::open(&entry).unwrap().set_modified(old).unwrap();

        let (tx, _collected) = collector();
        pcache.send_pack(&tx).await.unwrap();
        let touched = std::fs::metadata(&entry).unwrap().modified().unwrap();
        assert!(touched > old + Duration::from_secs(1800));
    }

    #[test]
    fn cleaner_evicts_oldest_until_under_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.pack_cache_max_size = 250;
        config.create_dirs().unwrap();

        let base = SystemTime::now() - Duration::from_secs(1000);
        let mut entries = Vec::new();
        for (i, shard) in ["aa", "bb", "cc", "dd"].iter().enumerate() {
            let hash = shard.repeat(20);
            let path = config.pack_entry_path(&hash);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, vec![0u8; 100]).unwrap();
            std::fs::File::open(&path)
                .unwrap()
                .set_modified(base + Duration::from_secs(i as u64 * 60))
                .unwrap();
            entries.push(path);
        }

        let cleaner = PackCacheCleaner::new(&config);
        let evicted = cleaner.clean_task().unwrap();
        assert_eq!(evicted, 2);
        // the two oldest are gone, the two newest survive
        assert!(!entries[0].exists());
        assert!(!entries[1].exists());
        assert!(entries[2].exists());
        assert!(entries[3].exists());
        // retained total is under the target
        assert!(200 < cleaner.max_size);

        // a second pass is a no-op
        assert_eq!(cleaner.clean_task().unwrap(), 0);
        // and the rate-limit marker is fresh
        let mtime = FileLock::mtime(&cleaner.lock_path).unwrap();
        assert!(mtime.elapsed().unwrap() < Duration::from_secs(60));
    }

    #[test]
    fn cleaner_noop_under_target() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        config.create_dirs().unwrap();
        let hash = "ee".repeat(20);
        let path = config.pack_entry_path(&hash);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"0000").unwrap();

        let cleaner = PackCacheCleaner::new(&config);
        assert_eq!(cleaner.clean_task().unwrap(), 0);
        assert!(path.exists());
    }
}
