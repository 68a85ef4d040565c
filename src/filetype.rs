//! File-type detection by magic-byte prefix.
//!
//! Classifies a byte stream as multimedia, executable, compressed (with a
//! concrete archive sub-kind), or plain uncompressed data. Detection only
//! looks at the first [`MAX_HEADER`] bytes. The signature table is built
//! exactly once per process through [`std::sync::OnceLock`], which also
//! covers the non-standard entries (EICAR, git bundle, LZ4) that stock MIME
//! tables don't know about.

use std::io::Read;
use std::sync::OnceLock;

/// How many leading bytes participate in detection.
pub const MAX_HEADER: usize = 1024;

/// Broad classification used by the scan dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Uncompressed,
    Executable,
    Compressed,
    Multimedia,
}

/// Concrete container format of a compressed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    Gz,
    Lz4,
    GitBundle,
}

struct Signature {
    kind: FileKind,
    archive: Option<ArchiveKind>,
    matches: fn(&[u8]) -> bool,
}

static SIGNATURES: OnceLock<Vec<Signature>> = OnceLock::new();

fn has_prefix(head: &[u8], prefix: &[u8]) -> bool {
    head.len() >= prefix.len() && &head[..prefix.len()] == prefix
}

fn is_tar(head: &[u8]) -> bool {
    // The ustar magic sits past the 257-byte header name field.
    head.len() > 262 && &head[257..262] == b"ustar"
}

fn is_macho(head: &[u8]) -> bool {
    const MAGICS: [[u8; 4]; 6] = [
        [0xfe, 0xed, 0xfa, 0xce],
        [0xfe, 0xed, 0xfa, 0xcf],
        [0xce, 0xfa, 0xed, 0xfe],
        [0xcf, 0xfa, 0xed, 0xfe],
        [0xca, 0xfe, 0xba, 0xbe],
        [0xbe, 0xba, 0xfe, 0xca],
    ];
    head.len() >= 4 && MAGICS.iter().any(|m| &head[..4] == m)
}

fn is_mp4(head: &[u8]) -> bool {
    head.len() >= 12 && &head[4..8] == b"ftyp"
}

fn signatures() -> &'static [Signature] {
    SIGNATURES.get_or_init(|| {
        let mut table = Vec::new();

        // Archives first: an archive magic must win over anything that may
        // follow it in the stream.
        let archives: [(ArchiveKind, fn(&[u8]) -> bool); 7] = [
            (ArchiveKind::Zip, |h| has_prefix(h, b"PK\x03\x04")),
            (ArchiveKind::Zip, |h| has_prefix(h, b"PK\x05\x06")),
            (ArchiveKind::Zip, |h| has_prefix(h, b"PK\x07\x08")),
            (ArchiveKind::Tar, is_tar),
            (ArchiveKind::Gz, |h| has_prefix(h, &[0x1f, 0x8b])),
            (ArchiveKind::Lz4, |h| has_prefix(h, &[0x04, 0x22, 0x4d, 0x18])),
            (ArchiveKind::GitBundle, |h| {
                has_prefix(h, b"# v2 git bundle") || has_prefix(h, b"# v3 git bundle")
            }),
        ];
        for (archive, matches) in archives {
            table.push(Signature {
                kind: FileKind::Compressed,
                archive: Some(archive),
                matches,
            });
        }

        let executables: [fn(&[u8]) -> bool; 4] = [
            |h| has_prefix(h, b"\x7fELF"),
            |h| has_prefix(h, b"MZ"),
            is_macho,
            // EICAR test string, treated as a binary so it reaches every
            // scanner including the external one.
            |h| has_prefix(h, b"X5O!"),
        ];
        for matches in executables {
            table.push(Signature {
                kind: FileKind::Executable,
                archive: None,
                matches,
            });
        }

        let multimedia: [fn(&[u8]) -> bool; 10] = [
            |h| has_prefix(h, &[0xff, 0xd8, 0xff]),       // jpeg
            |h| has_prefix(h, &[0x89, 0x50, 0x4e, 0x47]), // png
            |h| has_prefix(h, b"GIF8"),
            |h| has_prefix(h, b"BM"),
            |h| has_prefix(h, b"RIFF"), // wav / avi / webp
            |h| has_prefix(h, b"ID3"),
            |h| has_prefix(h, b"OggS"),
            |h| has_prefix(h, b"fLaC"),
            |h| has_prefix(h, &[0x1a, 0x45, 0xdf, 0xa3]), // matroska / webm
            is_mp4,
        ];
        for matches in multimedia {
            table.push(Signature {
                kind: FileKind::Multimedia,
                archive: None,
                matches,
            });
        }

        table
    })
}

fn read_header(reader: &mut dyn Read) -> std::io::Result<Vec<u8>> {
    let mut head = vec![0u8; MAX_HEADER];
    let mut filled = 0;
    while filled < head.len() {
        let n = reader.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);
    Ok(head)
}

/// Classify a stream by its leading bytes. Unknown content is
/// [`FileKind::Uncompressed`].
pub fn detect_kind(reader: &mut dyn Read) -> std::io::Result<FileKind> {
    let head = read_header(reader)?;
    Ok(detect_kind_in(&head))
}

/// Classify an already-read header buffer.
pub fn detect_kind_in(head: &[u8]) -> FileKind {
    signatures()
        .iter()
        .find(|sig| (sig.matches)(head))
        .map_or(FileKind::Uncompressed, |sig| sig.kind)
}

/// Detect the archive sub-kind of a stream, or `None` when the content is
/// not a recognized container.
pub fn detect_archive_kind(reader: &mut dyn Read) -> std::io::Result<Option<ArchiveKind>> {
    let head = read_header(reader)?;
    Ok(signatures()
        .iter()
        .find(|sig| (sig.matches)(&head))
        .and_then(|sig| sig.archive))
}

/// Whether a stream holds an executable. Read errors count as "not".
pub fn is_executable(reader: &mut dyn Read) -> bool {
    matches!(detect_kind(reader), Ok(FileKind::Executable))
}

/// Cheap filename hint used for the memory-vs-disk sandbox decision before
/// any bytes have been downloaded.
pub fn is_compressed_filename(filename: &str) -> bool {
    const SUFFIXES: [&str; 7] = [".tar", ".tar.gz", ".gz", ".zip", ".lz4", ".lz", "tgz"];
    SUFFIXES.iter().any(|suffix| filename.ends_with(suffix))
}
