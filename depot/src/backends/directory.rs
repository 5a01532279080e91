//! A backend storing one file per key under a root directory.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    backend::{Backend, Capabilities},
    Error, Result,
};

/// Options for a [`DirectoryBackend`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct DirectoryOptions {
    /// Whether to create the root directory when it does not exist yet.
    ///
    /// Defaults to `true`.
    pub create_if_missing: bool,
    /// Whether writes are flushed to disk with `fsync` before they are
    /// reported as durable. `sync()` additionally flushes the root
    /// directory itself.
    ///
    /// Defaults to `false`; the operating system then decides when dirty
    /// pages reach the disk.
    pub fsync: bool,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            fsync: false,
        }
    }
}

/// Persistent backend mapping each key to a file below a root directory.
///
/// Key segments (separated by `/`) become path components; characters that
/// are not filesystem-safe are percent-escaped, so arbitrary index keys can
/// be stored without ambiguity. Values are written to a temporary file and
/// renamed into place, so readers never observe a half-written value.
///
/// Advertises [`Capabilities::FILES`] and [`Capabilities::FILESYSTEM`]; the
/// per-key path probe answers with the file that holds the value.
#[derive(Debug)]
pub struct DirectoryBackend {
    root: PathBuf,
    options: DirectoryOptions,
    // Serializes multi-file operations (`clear`, directory creation).
    lock: Mutex<()>,
}

const TMP_PREFIX: &str = ".tmp-";

impl DirectoryBackend {
    /// Opens the backend rooted at `root` with default options.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_options(root, DirectoryOptions::default())
    }

    /// Opens the backend rooted at `root`.
    pub fn with_options(root: impl Into<PathBuf>, options: DirectoryOptions) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            if options.create_if_missing {
                fs::create_dir_all(&root)
                    .map_err(|e| Error::backend(root.to_string_lossy(), e))?;
            } else {
                return Err(Error::backend(
                    root.to_string_lossy(),
                    anyhow::anyhow!("root directory does not exist"),
                ));
            }
        }
        Ok(Self {
            root,
            options,
            lock: Mutex::new(()),
        })
    }

    /// The root directory all keys live under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            path.push(escape_segment(segment));
        }
        path
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.key_path(key);
        let parent = path.parent().expect("key path has a parent");
        {
            let _guard = self.lock.lock();
            fs::create_dir_all(parent).map_err(|e| Error::backend(key, e))?;
        }
        let tmp = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4().to_simple()));
        let result = (|| {
            let mut file = File::create(&tmp)?;
            file.write_all(value)?;
            if self.options.fsync {
                file.sync_all()?;
            }
            fs::rename(&tmp, &path)?;
            if self.options.fsync {
                fsync_dir(parent)?;
            }
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result.map_err(|e: std::io::Error| Error::backend(key, e))
    }

    fn collect_keys(&self, dir: &Path, segments: &mut Vec<String>, out: &mut Vec<String>) -> std::io::Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(ref e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(TMP_PREFIX) {
                continue;
            }
            segments.push(unescape_segment(&name));
            if entry.file_type()?.is_dir() {
                self.collect_keys(&entry.path(), segments, out)?;
            } else {
                out.push(segments.join("/"));
            }
            segments.pop();
        }
        Ok(())
    }
}

impl Backend for DirectoryBackend {
    fn add(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.key_path(key).exists() {
            return Err(Error::AlreadyExists {
                key: key.to_owned(),
            });
        }
        self.write_file(key, value)
    }

    fn update(&self, key: &str, value: &[u8]) -> Result<()> {
        self.write_file(key, value)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.key_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::backend(key, e)),
        }
    }

    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.key_path(key).is_file())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::backend(key, e)),
        }
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.collect_keys(&self.root.clone(), &mut Vec::new(), &mut out)
            .map_err(|e| Error::backend(prefix, e))?;
        out.retain(|key| key.starts_with(prefix));
        out.sort();
        Ok(out)
    }

    fn sync(&self) -> Result<()> {
        if self.options.fsync {
            fsync_dir(&self.root).map_err(|e| Error::backend(self.root.to_string_lossy(), e))?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock();
        let entries =
            fs::read_dir(&self.root).map_err(|e| Error::backend(self.root.to_string_lossy(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::backend(self.root.to_string_lossy(), e))?;
            let path = entry.path();
            let result = if entry
                .file_type()
                .map_err(|e| Error::backend(self.root.to_string_lossy(), e))?
                .is_dir()
            {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|e| Error::backend(path.to_string_lossy(), e))?;
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FILES | Capabilities::FILESYSTEM
    }

    fn data_path(&self, key: &str) -> Option<PathBuf> {
        Some(self.key_path(key))
    }
}

fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    // Windows cannot open directories for syncing; rely on file-level fsync
    // there.
    #[cfg(unix)]
    OpenOptions::new().read(true).open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

fn is_safe(c: char, first: bool) -> bool {
    if first && c == '.' {
        // Leading dots are escaped so key files can never collide with
        // temporary files.
        return false;
    }
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@' | '+' | '=' | ',')
}

fn escape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for (i, c) in segment.chars().enumerate() {
        if is_safe(c, i == 0) {
            out.push(c);
        } else {
            let mut buf = [0_u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    out
}

fn unescape_segment(segment: &str) -> String {
    let mut bytes = Vec::with_capacity(segment.len());
    let mut chars = segment.bytes().peekable();
    while let Some(b) = chars.next() {
        if b == b'%' {
            let hi = chars.next();
            let lo = chars.next();
            if let (Some(hi), Some(lo)) = (hi, lo) {
                let hex = [hi, lo];
                if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(&hex).unwrap_or(""), 16) {
                    bytes.push(byte);
                    continue;
                }
            }
            bytes.push(b);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    use super::*;

    fn open(dir: &TempDir) -> DirectoryBackend {
        DirectoryBackend::open(dir.path()).unwrap()
    }

    #[test]
    fn values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let backend = open(&dir);
            backend.add("Account/1", b"alice").unwrap();
            backend.update("Account/2", b"bob").unwrap();
        }
        let backend = open(&dir);
        assert_eq!(backend.get("Account/1").unwrap(), Some(b"alice".to_vec()));
        assert_eq!(
            backend.keys("Account/").unwrap(),
            vec!["Account/1", "Account/2"]
        );
    }

    #[test]
    fn add_rejects_existing_keys() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        backend.add("a/1", b"x").unwrap();
        assert_matches!(backend.add("a/1", b"y"), Err(Error::AlreadyExists { .. }));
    }

    #[test]
    fn unsafe_key_characters_round_trip() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        let key = "Article/keyword/caf\u{e9} au lait%20";
        backend.update(key, b"v").unwrap();
        assert_eq!(backend.get(key).unwrap(), Some(b"v".to_vec()));
        assert_eq!(backend.keys("Article/keyword/").unwrap(), vec![key]);
    }

    #[test]
    fn clear_removes_everything() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        backend.update("a/1", b"x").unwrap();
        backend.update("b/c/2", b"y").unwrap();
        backend.clear().unwrap();
        assert_eq!(backend.keys("").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn path_probe_points_at_the_value() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        backend.update("Image/1.data", b"pixels").unwrap();
        assert!(backend.capabilities().contains(Capabilities::FILESYSTEM));
        let path = backend.data_path("Image/1.data").unwrap();
        assert_eq!(fs::read(path).unwrap(), b"pixels".to_vec());
    }
}
