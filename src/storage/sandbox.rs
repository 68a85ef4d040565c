//! Per-request sandboxed filesystem.
//!
//! Every request gets a sandbox rooted under a unique id, either fully
//! in-memory (small plain files) or on disk (large or compressed files).
//! All paths are interpreted relative to the sandbox root; traversal
//! segments are normalized away so nothing escapes it. Every write path
//! goes through an accounting writer that charges the owning factory
//! before bytes land, so the global quota holds no matter which component
//! does the writing.

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Callback charging bytes against the factory-wide quota. Failing the
/// charge fails the write without mutating any counter.
pub(crate) type UsageHook = Arc<dyn Fn(u64) -> io::Result<()> + Send + Sync>;

enum Backing {
    Memory {
        tree: RwLock<BTreeMap<String, Vec<u8>>>,
    },
    Disk {
        root: PathBuf,
    },
}

/// A rooted filesystem owning all downloaded and extracted bytes of one
/// scan request.
pub struct Sandbox {
    id: String,
    backing: Backing,
    usage_hook: UsageHook,
}

/// Read handle over a sandbox file. Seekable so random-access formats
/// (zip) can be read in place.
pub enum SandboxReader {
    Memory(Cursor<Vec<u8>>),
    Disk(fs::File),
}

impl Read for SandboxReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Memory(cursor) => cursor.read(buf),
            Self::Disk(file) => file.read(buf),
        }
    }
}

impl Seek for SandboxReader {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        match self {
            Self::Memory(cursor) => cursor.seek(pos),
            Self::Disk(file) => file.seek(pos),
        }
    }
}

/// Collapse a path to a normalized relative form inside the sandbox.
/// `..` never climbs above the root, so `../evil` lands at `evil`.
fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

impl Sandbox {
    pub(crate) fn new_memory(id: String, usage_hook: UsageHook) -> Self {
        Self {
            id,
            backing: Backing::Memory {
                tree: RwLock::new(BTreeMap::new()),
            },
            usage_hook,
        }
    }

    pub(crate) fn new_disk(id: String, root: PathBuf, usage_hook: UsageHook) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create sandbox root {}", root.display()))?;
        Ok(Self {
            id,
            backing: Backing::Disk { root },
            usage_hook,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_memory(&self) -> bool {
        matches!(self.backing, Backing::Memory { .. })
    }

    /// Create a file for writing, making parent directories as needed.
    /// The returned writer charges the quota on every write; a memory file
    /// becomes visible once the writer is dropped.
    pub fn create(&self, path: &str) -> Result<Box<dyn Write + Send + '_>> {
        let normalized = normalize(path);
        if normalized.is_empty() {
            bail!("refusing to create a file at the sandbox root");
        }

        match &self.backing {
            Backing::Memory { tree } => {
                tree.write().insert(normalized.clone(), Vec::new());
                Ok(Box::new(MemoryWriter {
                    path: normalized,
                    buf: Vec::new(),
                    tree,
                    usage_hook: self.usage_hook.clone(),
                }))
            }
            Backing::Disk { root } => {
                let full = root.join(&normalized);
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create parent directories for {normalized}")
                    })?;
                }
                let file = fs::File::create(&full)
                    .with_context(|| format!("failed to create {normalized}"))?;
                Ok(Box::new(DiskWriter {
                    file,
                    usage_hook: self.usage_hook.clone(),
                }))
            }
        }
    }

    pub fn open(&self, path: &str) -> Result<SandboxReader> {
        let normalized = normalize(path);
        match &self.backing {
            Backing::Memory { tree } => {
                let data = tree
                    .read()
                    .get(&normalized)
                    .cloned()
                    .with_context(|| format!("no such file in sandbox: {normalized}"))?;
                Ok(SandboxReader::Memory(Cursor::new(data)))
            }
            Backing::Disk { root } => {
                let file = fs::File::open(root.join(&normalized))
                    .with_context(|| format!("failed to open {normalized}"))?;
                Ok(SandboxReader::Disk(file))
            }
        }
    }

    /// Remove a file. Freed bytes are not refunded to the quota; only
    /// destroying the whole sandbox releases its usage.
    pub fn remove(&self, path: &str) -> Result<()> {
        let normalized = normalize(path);
        match &self.backing {
            Backing::Memory { tree } => {
                tree.write()
                    .remove(&normalized)
                    .with_context(|| format!("no such file in sandbox: {normalized}"))?;
                Ok(())
            }
            Backing::Disk { root } => fs::remove_file(root.join(&normalized))
                .with_context(|| format!("failed to remove {normalized}")),
        }
    }

    pub fn size(&self, path: &str) -> Result<u64> {
        let normalized = normalize(path);
        match &self.backing {
            Backing::Memory { tree } => Ok(tree
                .read()
                .get(&normalized)
                .with_context(|| format!("no such file in sandbox: {normalized}"))?
                .len() as u64),
            Backing::Disk { root } => Ok(fs::metadata(root.join(&normalized))
                .with_context(|| format!("failed to stat {normalized}"))?
                .len()),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        let normalized = normalize(path);
        match &self.backing {
            Backing::Memory { tree } => {
                let tree = tree.read();
                tree.contains_key(&normalized)
                    || tree
                        .keys()
                        .any(|key| key.starts_with(&format!("{normalized}/")))
            }
            Backing::Disk { root } => root.join(&normalized).exists(),
        }
    }

    pub fn is_regular(&self, path: &str) -> Result<bool> {
        let normalized = normalize(path);
        match &self.backing {
            Backing::Memory { tree } => {
                let tree = tree.read();
                if tree.contains_key(&normalized) {
                    Ok(true)
                } else if tree
                    .keys()
                    .any(|key| key.starts_with(&format!("{normalized}/")))
                {
                    Ok(false)
                } else {
                    bail!("no such file in sandbox: {normalized}")
                }
            }
            Backing::Disk { root } => {
                let meta = fs::metadata(root.join(&normalized))
                    .with_context(|| format!("failed to stat {normalized}"))?;
                Ok(meta.is_file())
            }
        }
    }

    /// Recursive listing of regular files, sorted.
    pub fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let normalized = normalize(prefix);
        match &self.backing {
            Backing::Memory { tree } => Ok(tree
                .read()
                .keys()
                .filter(|key| {
                    normalized.is_empty()
                        || key.as_str() == normalized
                        || key.starts_with(&format!("{normalized}/"))
                })
                .cloned()
                .collect()),
            Backing::Disk { root } => {
                let base = root.join(&normalized);
                if !base.exists() {
                    return Ok(Vec::new());
                }
                let mut files = Vec::new();
                for entry in WalkDir::new(&base) {
                    let entry = entry.context("failed to walk sandbox")?;
                    if entry.file_type().is_file() {
                        let relative = entry
                            .path()
                            .strip_prefix(root)
                            .context("walk left the sandbox root")?;
                        files.push(relative.to_string_lossy().replace('\\', "/"));
                    }
                }
                files.sort();
                Ok(files)
            }
        }
    }

    /// Copy the whole sandbox tree out to a plain directory, used to stage
    /// content for external tools that only speak the real filesystem.
    pub fn dump_to_disk(&self, target: &Path) -> Result<()> {
        for file in self.list_files("")? {
            let full = target.join(&file);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let mut reader = self.open(&file)?;
            let mut out = fs::File::create(&full)
                .with_context(|| format!("failed to create {}", full.display()))?;
            io::copy(&mut reader, &mut out)
                .with_context(|| format!("failed to dump {file} to disk"))?;
        }
        Ok(())
    }

    /// Re-hydrate the sandbox from a plain directory. Writes go through the
    /// accounting path, so the quota applies to restored bytes too.
    pub fn restore_from_disk(&self, source: &Path) -> Result<()> {
        for entry in WalkDir::new(source) {
            let entry = entry.context("failed to walk restore source")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(source)
                .context("walk left the restore source")?
                .to_string_lossy()
                .replace('\\', "/");

            let mut reader = fs::File::open(entry.path())
                .with_context(|| format!("failed to open {}", entry.path().display()))?;
            let mut writer = self.create(&relative)?;
            io::copy(&mut reader, &mut writer)
                .with_context(|| format!("failed to restore {relative}"))?;
        }
        Ok(())
    }

    /// Remove every file while keeping the sandbox itself alive and
    /// registered. Usage stays charged until the factory destroys it.
    pub fn destroy_contents(&self) -> Result<()> {
        match &self.backing {
            Backing::Memory { tree } => {
                tree.write().clear();
                Ok(())
            }
            Backing::Disk { root } => {
                match fs::remove_dir_all(root) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("failed to clear {}", root.display()))
                    }
                }
                fs::create_dir_all(root)
                    .with_context(|| format!("failed to recreate {}", root.display()))
            }
        }
    }

    pub(crate) fn remove_backing(&self) -> Result<()> {
        match &self.backing {
            Backing::Memory { tree } => {
                tree.write().clear();
                Ok(())
            }
            Backing::Disk { root } => match fs::remove_dir_all(root) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => {
                    Err(err).with_context(|| format!("failed to remove {}", root.display()))
                }
            },
        }
    }
}

struct MemoryWriter<'a> {
    path: String,
    buf: Vec<u8>,
    tree: &'a RwLock<BTreeMap<String, Vec<u8>>>,
    usage_hook: UsageHook,
}

impl Write for MemoryWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        (self.usage_hook)(data.len() as u64)?;
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MemoryWriter<'_> {
    fn drop(&mut self) {
        self.tree
            .write()
            .insert(std::mem::take(&mut self.path), std::mem::take(&mut self.buf));
    }
}

struct DiskWriter {
    file: fs::File,
    usage_hook: UsageHook,
}

impl Write for DiskWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        (self.usage_hook)(data.len() as u64)?;
        self.file.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
