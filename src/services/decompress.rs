//! Recursive archive extraction inside a sandbox.
//!
//! One pass walks the sandbox, extracts every recognized container into a
//! directory derived from its name, and removes the original. Passes repeat
//! until nothing extracts, so nested archives (a zip of a tar.gz of a file)
//! unfold completely. Everything writes through the sandbox, so the global
//! quota bounds extraction blow-up too.

use crate::filetype::{self, ArchiveKind};
use crate::storage::Sandbox;
use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::process::Command;
use uuid::Uuid;

pub struct DecompressService;

impl DecompressService {
    pub fn new() -> Self {
        Self
    }

    /// Extract until fixed point. `buffer` bounds the size of individual
    /// reads; decoders hand out data in limited chunks, so the copy loops
    /// below are required, not defensive.
    pub fn extract(&self, sandbox: &Sandbox, buffer: &mut [u8]) -> Result<()> {
        loop {
            let mut extracted_any = false;

            for path in sandbox.list_files("")? {
                let kind = {
                    let mut file = sandbox
                        .open(&path)
                        .with_context(|| format!("failed to open {path} during extraction"))?;
                    filetype::detect_archive_kind(&mut file)
                        .with_context(|| format!("failed to read header of {path}"))?
                };

                let Some(kind) = kind else {
                    continue;
                };

                extract_one(kind, &path, sandbox, buffer)
                    .with_context(|| format!("failed to extract {path}"))?;
                sandbox
                    .remove(&path)
                    .with_context(|| format!("failed to remove extracted {path}"))?;
                extracted_any = true;
            }

            if !extracted_any {
                return Ok(());
            }
        }
    }
}

impl Default for DecompressService {
    fn default() -> Self {
        Self::new()
    }
}

/// Directory name for extracted content: the base name with its known
/// suffix stripped, or a fresh UUID when the name does not carry one.
fn derived_name(filename: &str, extensions: &[&str]) -> String {
    for extension in extensions {
        if let Some(stripped) = filename.strip_suffix(&format!(".{extension}")) {
            return stripped.to_string();
        }
    }
    Uuid::new_v4().to_string()
}

fn extract_one(
    kind: ArchiveKind,
    path: &str,
    sandbox: &Sandbox,
    buffer: &mut [u8],
) -> Result<()> {
    match kind {
        ArchiveKind::Gz => extract_gz(path, sandbox, buffer),
        ArchiveKind::Lz4 => extract_lz4(path, sandbox, buffer),
        ArchiveKind::Zip => extract_zip(path, sandbox, buffer),
        ArchiveKind::Tar => extract_tar(path, sandbox, buffer),
        ArchiveKind::GitBundle => extract_git_bundle(path, sandbox),
    }
}

fn copy_bounded(reader: &mut dyn Read, writer: &mut dyn Write, buffer: &mut [u8]) -> Result<()> {
    loop {
        let n = reader.read(buffer).context("read during extraction failed")?;
        if n == 0 {
            return Ok(());
        }
        writer
            .write_all(&buffer[..n])
            .context("write during extraction failed")?;
    }
}

fn extract_gz(path: &str, sandbox: &Sandbox, buffer: &mut [u8]) -> Result<()> {
    let file = sandbox.open(path)?;
    let mut decoder = flate2::read::GzDecoder::new(file);

    let target = derived_name(path, &["gz", "tgz"]);
    let mut out = sandbox.create(&target)?;
    copy_bounded(&mut decoder, &mut out, buffer)
}

fn extract_lz4(path: &str, sandbox: &Sandbox, buffer: &mut [u8]) -> Result<()> {
    let file = sandbox.open(path)?;
    let mut decoder = lz4_flex::frame::FrameDecoder::new(file);

    let target = derived_name(path, &["lz4"]);
    let mut out = sandbox.create(&target)?;
    copy_bounded(&mut decoder, &mut out, buffer)
}

fn extract_zip(path: &str, sandbox: &Sandbox, buffer: &mut [u8]) -> Result<()> {
    let file = sandbox.open(path)?;
    let mut archive = zip::ZipArchive::new(file).context("failed to read zip directory")?;

    let dir = derived_name(path, &["zip"]);

    for index in 0..archive.len() {
        let mut member = archive
            .by_index(index)
            .with_context(|| format!("failed to open zip member {index}"))?;
        if member.is_dir() {
            continue;
        }

        // Members land flat under the derived directory by base name.
        let base = member
            .name()
            .rsplit('/')
            .next()
            .unwrap_or("member")
            .to_string();
        let mut out = sandbox.create(&format!("{dir}/{base}"))?;
        copy_bounded(&mut member, &mut out, buffer)?;
    }

    Ok(())
}

fn extract_tar(path: &str, sandbox: &Sandbox, buffer: &mut [u8]) -> Result<()> {
    let file = sandbox.open(path)?;
    let mut archive = tar::Archive::new(file);

    let dir = derived_name(path, &["tar"]);

    for entry in archive.entries().context("failed to read tar entries")? {
        let mut entry = entry.context("failed to read tar entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry
            .path()
            .context("tar entry has unreadable path")?
            .to_string_lossy()
            .replace('\\', "/");
        let mut out = sandbox.create(&format!("{dir}/{name}"))?;
        copy_bounded(&mut entry, &mut out, buffer)?;
    }

    Ok(())
}

/// Git refuses to operate on anything but a real directory tree, so the
/// sandbox is staged out to disk, cloned there, and loaded back into
/// whatever backing the sandbox had.
fn extract_git_bundle(path: &str, sandbox: &Sandbox) -> Result<()> {
    let staging = tempfile::tempdir().context("failed to create staging directory")?;

    sandbox
        .dump_to_disk(staging.path())
        .context("failed to stage sandbox for git")?;
    sandbox.destroy_contents()?;

    let bundle = staging.path().join(path);
    let target = staging.path().join(derived_name(path, &["bundle"]));

    let output = Command::new("git")
        .arg("clone")
        .arg(&bundle)
        .arg(&target)
        .output()
        .context("failed to run git")?;

    if !output.status.success() {
        anyhow::bail!(
            "git clone of bundle failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    sandbox
        .restore_from_disk(staging.path())
        .context("failed to restore sandbox after git clone")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SandboxFactory;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Cursor;
    use std::sync::Arc;

    fn memory_sandbox() -> (Arc<SandboxFactory>, Arc<Sandbox>) {
        let factory = Arc::new(SandboxFactory::new(64 * 1024 * 1024));
        let sandbox = factory.acquire(0, false).unwrap();
        (factory, sandbox)
    }

    fn write_file(sandbox: &Sandbox, path: &str, data: &[u8]) {
        let mut writer = sandbox.create(path).unwrap();
        writer.write_all(data).unwrap();
    }

    fn read_file(sandbox: &Sandbox, path: &str) -> Vec<u8> {
        let mut data = Vec::new();
        sandbox.open(path).unwrap().read_to_end(&mut data).unwrap();
        data
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn zip_single(name: &str, data: &[u8]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file(name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_derived_name_strips_known_suffix() {
        assert_eq!(derived_name("text.gz", &["gz", "tgz"]), "text");
        assert_eq!(derived_name("bundle.tar", &["tar"]), "bundle");
        // Unknown suffix gets a random name, not a panic.
        assert_eq!(derived_name("weird.bin", &["gz"]).len(), 36);
    }

    #[test]
    fn test_gz_extraction() {
        let (_factory, sandbox) = memory_sandbox();
        write_file(&sandbox, "text.gz", &gzip(b"hello gz"));

        let mut buffer = vec![0u8; 4096];
        DecompressService::new()
            .extract(&sandbox, &mut buffer)
            .unwrap();

        assert_eq!(read_file(&sandbox, "text"), b"hello gz");
        assert!(!sandbox.exists("text.gz"));
    }

    #[test]
    fn test_lz4_extraction() {
        let (_factory, sandbox) = memory_sandbox();
        let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
        encoder.write_all(b"hello lz4").unwrap();
        write_file(&sandbox, "text.lz4", &encoder.finish().unwrap());

        let mut buffer = vec![0u8; 4096];
        DecompressService::new()
            .extract(&sandbox, &mut buffer)
            .unwrap();

        assert_eq!(read_file(&sandbox, "text"), b"hello lz4");
    }

    #[test]
    fn test_tar_extraction_keeps_regular_entries_only() {
        let (_factory, sandbox) = memory_sandbox();

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_cksum();
        builder
            .append_data(&mut header, "inner/file.txt", &b"data"[..])
            .unwrap();
        write_file(&sandbox, "archive.tar", &builder.into_inner().unwrap());

        let mut buffer = vec![0u8; 4096];
        DecompressService::new()
            .extract(&sandbox, &mut buffer)
            .unwrap();

        assert_eq!(read_file(&sandbox, "archive/inner/file.txt"), b"data");
    }

    #[test]
    fn test_nested_zip_reaches_leaf_in_one_call() {
        let (_factory, sandbox) = memory_sandbox();

        // nested.zip -> text.gz -> "leaf content"
        let inner = gzip(b"leaf content");
        write_file(&sandbox, "nested.zip", &zip_single("text.gz", &inner));

        let mut buffer = vec![0u8; 4096];
        DecompressService::new()
            .extract(&sandbox, &mut buffer)
            .unwrap();

        assert_eq!(read_file(&sandbox, "nested/text"), b"leaf content");
        assert_eq!(sandbox.list_files("").unwrap().len(), 1);
    }

    #[test]
    fn test_extraction_is_idempotent_at_fixed_point() {
        let (_factory, sandbox) = memory_sandbox();
        write_file(&sandbox, "plain.txt", b"not an archive");

        let mut buffer = vec![0u8; 4096];
        let service = DecompressService::new();
        service.extract(&sandbox, &mut buffer).unwrap();
        let after_first = sandbox.list_files("").unwrap();

        service.extract(&sandbox, &mut buffer).unwrap();
        assert_eq!(sandbox.list_files("").unwrap(), after_first);
        assert_eq!(read_file(&sandbox, "plain.txt"), b"not an archive");
    }
}
