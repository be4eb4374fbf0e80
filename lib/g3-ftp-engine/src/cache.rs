/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::time::{Duration, Instant};

use crate::facts::FtpDirEntry;
use crate::notify::{EventSink, ListingNotification};
use crate::path::RemotePath;

/// Result of a directory-cache file lookup.
pub struct FileLookup {
    pub entry: Option<FtpDirEntry>,
    /// Whether the containing directory was in the cache at all.
    pub dir_was_cached: bool,
    /// Whether the entry name matched with exact case.
    pub case_matched: bool,
}

impl FileLookup {
    pub fn miss(dir_was_cached: bool) -> Self {
        FileLookup {
            entry: None,
            dir_was_cached,
            case_matched: false,
        }
    }
}

/// Listing cache kept by the embedder. The engine only drives coherence:
/// it consults entries before transfers and invalidates around mutations.
pub trait DirectoryCache: Send {
    fn lookup_file(&self, path: &RemotePath, name: &str) -> FileLookup;
    fn store_listing(&mut self, path: &RemotePath, entries: Vec<FtpDirEntry>);
    fn invalidate_file(&mut self, path: &RemotePath, name: &str);
    fn remove_file(&mut self, path: &RemotePath, name: &str);
    fn remove_dir(&mut self, path: &RemotePath, name: &str);
    /// Mark an entry's metadata as no longer trustworthy.
    fn update_file(&mut self, path: &RemotePath, name: &str);
    fn rename(
        &mut self,
        from_path: &RemotePath,
        from_name: &str,
        to_path: &RemotePath,
        to_name: &str,
    );
    fn invalidate_server(&mut self);
}

/// Maps `(parent, name)` to the real path a server resolved it to.
pub trait PathCache: Send {
    fn lookup(&self, parent: &RemotePath, name: &str) -> Option<RemotePath>;
    fn invalidate_path(&mut self, parent: &RemotePath, name: &str);
    fn invalidate_server(&mut self);
}

/// Cache-less stand-ins for embedders that do not keep listings.
pub struct NullDirectoryCache;

impl DirectoryCache for NullDirectoryCache {
    fn lookup_file(&self, _path: &RemotePath, _name: &str) -> FileLookup {
        FileLookup::miss(false)
    }
    fn store_listing(&mut self, _path: &RemotePath, _entries: Vec<FtpDirEntry>) {}
    fn invalidate_file(&mut self, _path: &RemotePath, _name: &str) {}
    fn remove_file(&mut self, _path: &RemotePath, _name: &str) {}
    fn remove_dir(&mut self, _path: &RemotePath, _name: &str) {}
    fn update_file(&mut self, _path: &RemotePath, _name: &str) {}
    fn rename(&mut self, _fp: &RemotePath, _fn_: &str, _tp: &RemotePath, _tn: &str) {}
    fn invalidate_server(&mut self) {}
}

pub struct NullPathCache;

impl PathCache for NullPathCache {
    fn lookup(&self, _parent: &RemotePath, _name: &str) -> Option<RemotePath> {
        None
    }
    fn invalidate_path(&mut self, _parent: &RemotePath, _name: &str) {}
    fn invalidate_server(&mut self) {}
}

const LISTING_NOTIFY_INTERVAL: Duration = Duration::from_secs(1);

/// Coalesces listing-change notifications during batched mutations so the
/// embedder sees at most one per second plus one at the end of the batch.
#[derive(Default)]
pub struct ListingChangeBatcher {
    last_sent: Option<Instant>,
    need_send: bool,
}

impl ListingChangeBatcher {
    pub fn changed(&mut self, sink: &dyn EventSink, path: &RemotePath) {
        let now = Instant::now();
        let due = match self.last_sent {
            Some(last) => now.duration_since(last) >= LISTING_NOTIFY_INTERVAL,
            None => true,
        };
        if due {
            sink.listing_changed(ListingNotification {
                path: path.clone(),
                modified: true,
                failed: false,
            });
            self.last_sent = Some(now);
            self.need_send = false;
        } else {
            self.need_send = true;
        }
    }

    pub fn flush(&mut self, sink: &dyn EventSink, path: &RemotePath) {
        if self.need_send {
            sink.listing_changed(ListingNotification {
                path: path.clone(),
                modified: true,
                failed: false,
            });
            self.need_send = false;
        }
    }

    #[inline]
    pub fn pending(&self) -> bool {
        self.need_send
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink(AtomicUsize);

    impl EventSink for CountingSink {
        fn listing_changed(&self, _n: ListingNotification) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
        fn request_file_exists(&self, _req: crate::notify::FileExistsRequest) {}
        fn request_interactive_login(&self, _challenge: &str) {}
        fn request_certificate_trust(&self, _cert: &crate::notify::CertificateInfo) {}
    }

    #[test]
    fn batcher_coalesces() {
        let sink = CountingSink::default();
        let path = RemotePath::new("/pub");
        let mut batcher = ListingChangeBatcher::default();

        batcher.changed(&sink, &path);
        assert_eq!(sink.0.load(Ordering::Relaxed), 1);

        // within the same second: deferred
        batcher.changed(&sink, &path);
        batcher.changed(&sink, &path);
        assert_eq!(sink.0.load(Ordering::Relaxed), 1);
        assert!(batcher.pending());

        batcher.flush(&sink, &path);
        assert_eq!(sink.0.load(Ordering::Relaxed), 2);
        assert!(!batcher.pending());

        batcher.flush(&sink, &path);
        assert_eq!(sink.0.load(Ordering::Relaxed), 2);
    }
}
