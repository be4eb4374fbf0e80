/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::fmt;

/// A remote directory path in the engine's neutral slash form.
///
/// Server-type-aware path grammar (VMS, DOS drive letters, ...) is the path
/// formatter collaborator's concern; the engine only needs joining and
/// filename formatting for command arguments.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn new(path: impl Into<String>) -> Self {
        let mut s: String = path.into();
        if s.is_empty() {
            s.push('/');
        }
        while s.len() > 1 && s.ends_with('/') {
            s.pop();
        }
        RemotePath(s)
    }

    pub fn root() -> Self {
        RemotePath("/".to_string())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    pub fn parent(&self) -> Option<RemotePath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(RemotePath::root()),
            Some(idx) => Some(RemotePath(self.0[..idx].to_string())),
            None => None,
        }
    }

    #[must_use]
    pub fn join(&self, name: &str) -> RemotePath {
        if self.is_root() {
            RemotePath(format!("/{name}"))
        } else {
            RemotePath(format!("{}/{name}", self.0))
        }
    }

    /// Format a filename for a command argument. With `omit_path` the bare
    /// name is used, relying on the current remote working directory.
    pub fn format_filename(&self, name: &str, omit_path: bool) -> String {
        if omit_path {
            name.to_string()
        } else {
            self.join(name).0
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize() {
        assert_eq!(RemotePath::new("").as_str(), "/");
        assert_eq!(RemotePath::new("/a/b/").as_str(), "/a/b");
        assert!(RemotePath::new("/").is_root());
    }

    #[test]
    fn join_and_parent() {
        let p = RemotePath::new("/home/x");
        assert_eq!(p.join("f.txt").as_str(), "/home/x/f.txt");
        assert_eq!(p.parent().unwrap().as_str(), "/home");
        assert_eq!(RemotePath::new("/home").parent().unwrap().as_str(), "/");
        assert!(RemotePath::root().parent().is_none());
    }

    #[test]
    fn format_filename() {
        let p = RemotePath::new("/pub");
        assert_eq!(p.format_filename("a.txt", true), "a.txt");
        assert_eq!(p.format_filename("a.txt", false), "/pub/a.txt");
    }

    #[test]
    fn segments() {
        let p = RemotePath::new("/a/b/c");
        let segs: Vec<&str> = p.segments().collect();
        assert_eq!(segs, ["a", "b", "c"]);
    }
}
