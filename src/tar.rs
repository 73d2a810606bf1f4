use chrono::DateTime;
use serde::{Deserialize, Serialize};

/// Size of one tar header or content block
pub const BLOCK_SIZE: usize = 512;

/// One filesystem entry parsed from a POSIX ustar header block. Metadata is
/// preserved verbatim as stored; display forms are synthesized on demand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TarEntry {
    pub name: String,
    pub size: u64,
    pub typeflag: char,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub linkname: String,
}

impl TarEntry {
    pub fn is_dir(&self) -> bool {
        self.typeflag == '5' || self.name.ends_with('/')
    }

    pub fn is_symlink(&self) -> bool {
        self.typeflag == '2'
    }

    pub fn is_hardlink(&self) -> bool {
        self.typeflag == '1'
    }

    pub fn is_file(&self) -> bool {
        self.typeflag == '0' || self.typeflag == '\0'
    }

    /// Number of 512-byte blocks the entry's content occupies. Directories,
    /// symlinks, and hardlinks store their payload in the header and occupy
    /// no content blocks regardless of the size field.
    pub fn content_blocks(&self) -> u64 {
        match self.typeflag {
            '1' | '2' | '5' => 0,
            _ => self.size.div_ceil(BLOCK_SIZE as u64),
        }
    }

    /// Ten-character `drwxr-xr-x` style mode string for display
    pub fn mode_string(&self) -> String {
        let kind = match self.typeflag {
            '5' => 'd',
            '2' => 'l',
            '1' => 'h',
            '3' => 'c',
            '4' => 'b',
            '6' => 'p',
            _ => '-',
        };
        let mut out = String::with_capacity(10);
        out.push(kind);
        for shift in [6u32, 3, 0] {
            let bits = (self.mode >> shift) & 0o7;
            out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        out
    }

    /// Modification time formatted for display, empty when out of range
    pub fn format_mtime(&self) -> String {
        DateTime::from_timestamp(self.mtime, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default()
    }
}

/// Null/whitespace-trimmed string out of a fixed-width header field
fn field_str(block: &[u8], start: usize, end: usize) -> String {
    let raw = &block[start..end];
    let trimmed = match raw.iter().position(|b| *b == 0) {
        Some(index) => &raw[..index],
        None => raw,
    };
    String::from_utf8_lossy(trimmed).into_owned()
}

/// Octal ASCII integer out of a fixed-width header field. Fields are padded
/// with nulls and spaces on either side; anything undecodable is zero.
fn field_octal(block: &[u8], start: usize, end: usize) -> u64 {
    let text = field_str(block, start, end);
    let text = text.trim_matches(|c: char| c == ' ' || c == '\0');
    if text.is_empty() {
        return 0;
    }
    u64::from_str_radix(text, 8).unwrap_or(0)
}

/// Decode one 512-byte ustar header at `offset`, returning the entry and the
/// byte offset of the next header. Returns `None` for an all-zero block (end
/// of archive) or when the buffer cannot hold a full block at `offset`.
///
/// Pure function over bytes; no I/O.
pub fn decode_header(buffer: &[u8], offset: usize) -> Option<(TarEntry, usize)> {
    let end = offset.checked_add(BLOCK_SIZE)?;
    if end > buffer.len() {
        return None;
    }
    let block = &buffer[offset..end];
    if block.iter().all(|b| *b == 0) {
        return None;
    }

    let entry = TarEntry {
        name: field_str(block, 0, 100),
        mode: field_octal(block, 100, 108) as u32,
        uid: field_octal(block, 108, 116),
        gid: field_octal(block, 116, 124),
        size: field_octal(block, 124, 136),
        mtime: field_octal(block, 136, 148) as i64,
        typeflag: match block[156] {
            0 => '0',
            flag => flag as char,
        },
        linkname: field_str(block, 157, 257),
    };

    let content = entry.content_blocks().checked_mul(BLOCK_SIZE as u64)?;
    let next = (offset as u64)
        .checked_add(BLOCK_SIZE as u64)?
        .checked_add(content)?;
    let next = usize::try_from(next).ok()?;
    Some((entry, next))
}

/// Normalize a path for target comparison by stripping any leading `./` and
/// `/` prefixes. Matching stays exact and case-sensitive beyond that.
pub(crate) fn normalize_path(path: &str) -> &str {
    let mut path = path;
    loop {
        if let Some(rest) = path.strip_prefix("./") {
            path = rest;
        } else if let Some(rest) = path.strip_prefix('/') {
            path = rest;
        } else {
            return path;
        }
    }
}

/// Location of a matched entry's content within the decompressed buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMatch {
    pub entry: TarEntry,
    pub content_offset: usize,
    pub content_len: usize,
}

/// Walks a growing decompressed buffer, decoding headers and remembering its
/// position across scans so that repeated feeds never re-emit an entry. A
/// scanner either collects every entry or searches for one target path.
#[derive(Debug)]
pub struct TarScanner {
    offset: usize,
    entries_scanned: usize,
    target: Option<String>,
}

impl TarScanner {
    /// Scanner that accumulates every entry it can decode
    pub fn collecting() -> Self {
        Self {
            offset: 0,
            entries_scanned: 0,
            target: None,
        }
    }

    /// Scanner that stops on the first entry matching `path`
    pub fn searching(path: &str) -> Self {
        Self {
            offset: 0,
            entries_scanned: 0,
            target: Some(normalize_path(path).to_string()),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn entries_scanned(&self) -> usize {
        self.entries_scanned
    }

    /// Decode the next entry at the saved offset and advance past it.
    /// `None` once the buffer stalls: end-of-archive, a partial trailing
    /// header, or a header whose next offset fails to advance.
    fn step(&mut self, buffer: &[u8]) -> Option<TarEntry> {
        let (entry, next) = decode_header(buffer, self.offset)?;
        if next <= self.offset {
            return None;
        }
        self.offset = next;
        self.entries_scanned += 1;
        Some(entry)
    }

    /// Collect entries into `out` until the buffer stalls. Entries whose
    /// headers are readable are emitted even when their content bytes lie
    /// beyond the end of the buffer.
    pub fn scan_into(&mut self, buffer: &[u8], out: &mut Vec<TarEntry>) {
        while let Some(entry) = self.step(buffer) {
            out.push(entry);
        }
    }

    /// Advance through the buffer until the target path matches or the
    /// buffer stalls. Returns the match location relative to the buffer.
    pub fn scan_for(&mut self, buffer: &[u8]) -> Option<TargetMatch> {
        let target = self.target.clone()?;
        loop {
            let header_offset = self.offset;
            let entry = self.step(buffer)?;
            if normalize_path(&entry.name) == target {
                return Some(TargetMatch {
                    content_offset: header_offset + BLOCK_SIZE,
                    content_len: entry.size as usize,
                    entry,
                });
            }
        }
    }
}
