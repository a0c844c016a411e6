//! Reading, writing and combining Unix `ar` archives.
//!
//! Implements the System V variant as produced by GCC's static-library
//! packaging: an 8-byte global header, 60-byte member headers, bodies padded
//! to 2-byte alignment, and the GNU long-filename scheme where a member
//! named `//` holds a string table and other members reference it with
//! `/<decimal offset>` names.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

const GLOBAL_HEADER: &[u8] = b"!<arch>\n";
const HEADER_LEN: usize = 60;
const ENTRY_MAGIC: &[u8] = b"`\n";

#[derive(Debug, Error)]
pub enum ArError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
    #[error("invalid ar global header")]
    BadGlobalHeader,
    #[error("invalid ar header field {field}: {value:?}")]
    BadHeaderField { field: &'static str, value: String },
    #[error("invalid long-name reference {0:?}")]
    BadNameReference(String),
    #[error("member name {0:?} is too long for an ar header")]
    NameTooLong(String),
}

/// Parsed 60-byte member header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub mod_time: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub size: u64,
}

/// Sequential reader over the members of one archive.
///
/// Yields raw headers; `/`, `//` and `/N` names are surfaced as-is so the
/// caller decides how to treat the GCC index entries.
pub struct Reader<R: Read> {
    inner: R,
    started: bool,
}

impl<R: Read> Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            started: false,
        }
    }

    /// Reads the next member, or `None` at end of archive.
    pub fn next_entry(&mut self) -> Result<Option<(Header, Vec<u8>)>, ArError> {
        if !self.started {
            let mut magic = [0u8; GLOBAL_HEADER.len()];
            self.inner.read_exact(&mut magic)?;
            if magic != GLOBAL_HEADER {
                return Err(ArError::BadGlobalHeader);
            }
            self.started = true;
        }
        let mut raw = [0u8; HEADER_LEN];
        match self.inner.read_exact(&mut raw) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if &raw[58..60] != ENTRY_MAGIC {
            return Err(ArError::BadHeaderField {
                field: "magic",
                value: String::from_utf8_lossy(&raw[58..60]).into_owned(),
            });
        }
        let header = Header {
            name: field_str(&raw[0..16]).to_string(),
            mod_time: parse_decimal(&raw[16..28], "mod_time")?,
            uid: parse_decimal(&raw[28..34], "uid")? as u32,
            gid: parse_decimal(&raw[34..40], "gid")? as u32,
            mode: parse_octal(&raw[40..48], "mode")?,
            size: parse_decimal(&raw[48..58], "size")?,
        };
        let mut body = vec![0u8; header.size as usize];
        self.inner.read_exact(&mut body)?;
        if header.size % 2 == 1 {
            // Bodies are padded to even offsets with a single newline.
            let mut pad = [0u8; 1];
            self.inner.read_exact(&mut pad)?;
        }
        Ok(Some((header, body)))
    }
}

/// Sequential writer of archive members.
pub struct Writer<W: Write> {
    inner: W,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes the 8-byte archive magic. Must be called exactly once, first.
    pub fn write_global_header(&mut self) -> Result<(), ArError> {
        self.inner.write_all(GLOBAL_HEADER)?;
        Ok(())
    }

    /// Writes one member header followed by its body and alignment padding.
    pub fn write_entry(&mut self, header: &Header, body: &[u8]) -> Result<(), ArError> {
        if header.name.len() > 16 {
            return Err(ArError::NameTooLong(header.name.clone()));
        }
        let mut raw = Vec::with_capacity(HEADER_LEN);
        write!(
            raw,
            "{:<16}{:<12}{:<6}{:<6}{:<8o}{:<10}",
            header.name,
            header.mod_time,
            header.uid,
            header.gid,
            header.mode,
            body.len(),
        )?;
        raw.extend_from_slice(ENTRY_MAGIC);
        debug_assert_eq!(raw.len(), HEADER_LEN);
        self.inner.write_all(&raw)?;
        self.inner.write_all(body)?;
        if body.len() % 2 == 1 {
            self.inner.write_all(b"\n")?;
        }
        Ok(())
    }
}

/// Merges every ar archive under `in_dir` into a single archive at
/// `out_file`.
///
/// Inputs are selected by filename suffix: a file is taken when it ends with
/// any of `suffixes` and none of `exclude_suffixes`. GCC symbol indexes are
/// dropped (downstream tools regenerate them), long names are resolved
/// through each input's string table and re-emitted through one unified
/// table, and all modification times are zeroed, so output bytes depend only
/// on input bytes. Duplicate member names are preserved; that is valid ar.
pub fn combine_ar(
    out_file: &Path,
    in_dir: &Path,
    suffixes: &[String],
    exclude_suffixes: &[String],
) -> Result<(), ArError> {
    let out = fs::File::create(out_file)?;
    let mut writer = Writer::new(out);
    writer.write_global_header()?;

    // The long-name table has to precede the members it names, so buffer
    // everything first. Inputs could be streamed twice instead to save
    // memory, but the code this way is simpler.
    let mut entries: Vec<(Header, Vec<u8>)> = Vec::new();
    for entry in WalkDir::new(in_dir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path == out_file
            || !matches_suffix(path, suffixes)
            || matches_suffix(path, exclude_suffixes)
        {
            continue;
        }
        debug!("Adding {}", path.display());
        entries.extend(read_ar_file(path)?);
    }

    // Build the unified string table, rewriting every member name to a
    // stable byte offset into it.
    let mut table = Vec::new();
    for (header, _) in entries.iter_mut() {
        let offset = table.len();
        table.extend_from_slice(header.name.as_bytes());
        table.extend_from_slice(b"/\n");
        header.name = format!("/{offset}");
    }
    debug!("Writing file index ({} bytes)", table.len());
    writer.write_entry(
        &Header {
            name: "//".to_string(),
            ..Header::default()
        },
        &table,
    )?;
    for (header, body) in &entries {
        debug!("Writing {} ({} bytes)", header.name, body.len());
        writer.write_entry(header, body)?;
    }
    Ok(())
}

/// Reads one archive, resolving GCC index entries to plain named members.
pub fn read_ar_file(path: &Path) -> Result<Vec<(Header, Vec<u8>)>, ArError> {
    let file = fs::File::open(path)?;
    let mut reader = Reader::new(io::BufReader::new(file));
    let mut entries = Vec::new();
    let mut names: Vec<u8> = Vec::new();
    while let Some((mut header, body)) = reader.next_entry()? {
        if header.name == "/" {
            // Symbol index; regenerated downstream, so drop it.
            continue;
        } else if header.name == "//" {
            names = body;
            continue;
        }
        if let Some(digits) = header.name.strip_prefix('/') {
            // A reference into the long-name table.
            let offset: usize = digits
                .parse()
                .map_err(|_| ArError::BadNameReference(header.name.clone()))?;
            header.name = resolve_long_name(&names, offset)
                .ok_or_else(|| ArError::BadNameReference(header.name.clone()))?;
        } else if let Some(stripped) = header.name.strip_suffix('/') {
            // Plain names routinely carry one trailing slash; strip it.
            header.name = stripped.to_string();
        }
        header.mod_time = 0;
        entries.push((header, body));
    }
    Ok(entries)
}

/// Looks up the `/` or NUL terminated name starting at `offset`.
fn resolve_long_name(table: &[u8], offset: usize) -> Option<String> {
    let rest = table.get(offset..)?;
    let end = rest.iter().position(|&b| b == b'/' || b == 0)?;
    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

/// True if the path ends with any of the given suffixes. Empty suffixes
/// never match.
fn matches_suffix(path: &Path, suffixes: &[String]) -> bool {
    let path = path.to_string_lossy();
    suffixes
        .iter()
        .any(|suffix| !suffix.is_empty() && path.ends_with(suffix.as_str()))
}

fn field_str(raw: &[u8]) -> &str {
    std::str::from_utf8(raw)
        .unwrap_or("")
        .trim_end_matches(' ')
}

fn parse_decimal(raw: &[u8], field: &'static str) -> Result<u64, ArError> {
    let s = field_str(raw).trim();
    if s.is_empty() {
        return Ok(0);
    }
    s.parse().map_err(|_| ArError::BadHeaderField {
        field,
        value: s.to_string(),
    })
}

fn parse_octal(raw: &[u8], field: &'static str) -> Result<u32, ArError> {
    let s = field_str(raw).trim();
    if s.is_empty() {
        return Ok(0);
    }
    u32::from_str_radix(s, 8).map_err(|_| ArError::BadHeaderField {
        field,
        value: s.to_string(),
    })
}
