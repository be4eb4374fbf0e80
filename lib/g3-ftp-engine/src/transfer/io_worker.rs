/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::fs::File;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::IoWorkerError;

/// Ring depth of in-flight buffers between the worker and the data socket.
const BUFFER_RING_DEPTH: usize = 2;

/// Names worker threads; real pooling is unnecessary since a session runs
/// at most one transfer at a time.
pub struct IoWorkerPool {
    next_id: AtomicUsize,
}

impl Default for IoWorkerPool {
    fn default() -> Self {
        IoWorkerPool {
            next_id: AtomicUsize::new(1),
        }
    }
}

impl IoWorkerPool {
    fn next_name(&self) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("ftp-io-{id}")
    }
}

/// Endpoints handed to the transfer socket. Exactly one side is populated,
/// matching the transfer direction.
pub struct IoWorkerHandle {
    /// Download: network bytes go here, the worker writes them to the file.
    pub to_file: Option<mpsc::Sender<Bytes>>,
    /// Upload: the worker reads the file and the socket drains this side.
    pub from_file: Option<mpsc::Receiver<Bytes>>,
}

/// Owner handle of the worker thread. The worker is the only reader/writer
/// of the local file after handoff; dropping the channel endpoints is the
/// graceful stop, `destroy` is the forced one.
pub struct IoWorker {
    handle: Option<JoinHandle<std::io::Result<u64>>>,
    stop: Arc<AtomicBool>,
}

impl IoWorker {
    /// Spawn a worker owning `file`. `write_to_file` selects the download
    /// direction; `binary` disables ASCII line-ending conversion.
    pub fn create(
        pool: &IoWorkerPool,
        file: File,
        write_to_file: bool,
        binary: bool,
        buffer_size: usize,
    ) -> Result<(IoWorker, IoWorkerHandle), IoWorkerError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);

        let builder = std::thread::Builder::new().name(pool.next_name());
        if write_to_file {
            let (tx, rx) = mpsc::channel::<Bytes>(BUFFER_RING_DEPTH);
            let handle = builder
                .spawn(move || write_loop(file, rx, binary, stop2))
                .map_err(IoWorkerError::SpawnFailed)?;
            Ok((
                IoWorker {
                    handle: Some(handle),
                    stop,
                },
                IoWorkerHandle {
                    to_file: Some(tx),
                    from_file: None,
                },
            ))
        } else {
            let (tx, rx) = mpsc::channel::<Bytes>(BUFFER_RING_DEPTH);
            let handle = builder
                .spawn(move || read_loop(file, tx, binary, buffer_size, stop2))
                .map_err(IoWorkerError::SpawnFailed)?;
            Ok((
                IoWorker {
                    handle: Some(handle),
                    stop,
                },
                IoWorkerHandle {
                    to_file: None,
                    from_file: Some(rx),
                },
            ))
        }
    }

    /// Force shutdown: stop the loop and join the thread, returning the
    /// byte count or the first file io error.
    pub fn destroy(&mut self) -> Option<std::io::Result<u64>> {
        let handle = self.handle.take()?;
        self.stop.store(true, Ordering::Relaxed);
        match handle.join() {
            Ok(r) => Some(r),
            Err(_) => Some(Err(std::io::Error::other("io worker panicked"))),
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        if let Some(Err(e)) = self.destroy() {
            log::debug!("io worker finished with error on drop: {e:?}");
        }
    }
}

fn write_loop(
    mut file: File,
    mut rx: mpsc::Receiver<Bytes>,
    binary: bool,
    stop: Arc<AtomicBool>,
) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut pending_cr = false;
    while let Some(chunk) = rx.blocking_recv() {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        total += chunk.len() as u64;
        if binary {
            file.write_all(&chunk)?;
        } else {
            // ASCII mode: the wire carries CRLF, store plain LF
            let mut out = Vec::with_capacity(chunk.len());
            for &b in chunk.iter() {
                if pending_cr {
                    pending_cr = false;
                    if b != b'\n' {
                        out.push(b'\r');
                    }
                }
                if b == b'\r' {
                    pending_cr = true;
                } else {
                    out.push(b);
                }
            }
            file.write_all(&out)?;
        }
    }
    if pending_cr {
        file.write_all(b"\r")?;
    }
    file.flush()?;
    Ok(total)
}

fn read_loop(
    mut file: File,
    tx: mpsc::Sender<Bytes>,
    binary: bool,
    buffer_size: usize,
    stop: Arc<AtomicBool>,
) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut prev = 0u8;
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        let chunk = if binary {
            Bytes::copy_from_slice(&buf[..n])
        } else {
            // ASCII mode: send CRLF line endings; a CRLF may span chunks
            let mut out = Vec::with_capacity(n + n / 16);
            for &b in &buf[..n] {
                if b == b'\n' && prev != b'\r' {
                    out.push(b'\r');
                }
                out.push(b);
                prev = b;
            }
            Bytes::from(out)
        };
        if tx.blocking_send(chunk).is_err() {
            // receiver gone, transfer was cut short
            break;
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;

    fn temp_file(content: &[u8]) -> File {
        let mut f = tempfile();
        f.write_all(content).unwrap();
        f.rewind().unwrap();
        f
    }

    fn tempfile() -> File {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let mut path = std::env::temp_dir();
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        path.push(format!("g3-ftp-engine-worker-{id}-{seq}"));
        let f = File::options()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        std::fs::remove_file(&path).unwrap();
        f
    }

    #[tokio::test]
    async fn upload_binary_chunks() {
        let pool = IoWorkerPool::default();
        let file = temp_file(b"0123456789");
        let (mut worker, mut handle) = IoWorker::create(&pool, file, false, true, 4).unwrap();

        let mut rx = handle.from_file.take().unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"0123456789");
        assert!(matches!(worker.destroy(), Some(Ok(10))));
    }

    #[tokio::test]
    async fn upload_ascii_converts_line_endings() {
        let pool = IoWorkerPool::default();
        let file = temp_file(b"a\nb\r\nc\n");
        let (_worker, mut handle) = IoWorker::create(&pool, file, false, false, 64).unwrap();

        let mut rx = handle.from_file.take().unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"a\r\nb\r\nc\r\n");
    }

    #[tokio::test]
    async fn download_writes_and_counts() {
        let pool = IoWorkerPool::default();
        let file = tempfile();
        let probe = file.try_clone().unwrap();
        let (mut worker, mut handle) = IoWorker::create(&pool, file, true, true, 64).unwrap();

        let tx = handle.to_file.take().unwrap();
        tx.send(Bytes::from_static(b"hello ")).await.unwrap();
        tx.send(Bytes::from_static(b"world")).await.unwrap();
        drop(tx);

        assert!(matches!(worker.destroy(), Some(Ok(11))));

        let mut file = probe;
        file.rewind().unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"hello world");
    }

    #[tokio::test]
    async fn download_ascii_strips_cr() {
        let pool = IoWorkerPool::default();
        let file = tempfile();
        let probe = file.try_clone().unwrap();
        let (mut worker, mut handle) = IoWorker::create(&pool, file, true, false, 64).unwrap();

        let tx = handle.to_file.take().unwrap();
        // CRLF split across chunks
        tx.send(Bytes::from_static(b"a\r")).await.unwrap();
        tx.send(Bytes::from_static(b"\nb\r\n")).await.unwrap();
        drop(tx);
        worker.destroy();

        let mut file = probe;
        file.rewind().unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"a\nb\n");
    }
}
