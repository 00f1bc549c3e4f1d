//! Keep locators and collection manifest text.
//!
//! A manifest has one stream per line:
//!
//! ```text
//! ./sub/dir <locator> [<locator> ...] <pos>:<size>:<name> [...]
//! ```
//!
//! The bytes of a stream are its blocks concatenated in order, and each file
//! token names a byte range of that stream.

use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static LOCATOR_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{32}\+\d+").expect("valid regex"));

/// True if `s` starts like a Keep locator (`<32 hex>+<size>`).
pub fn looks_like_locator(s: &str) -> bool {
    LOCATOR_SHAPE.is_match(s)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest is not valid UTF-8")]
    NotUtf8,
    #[error("invalid locator: {0}")]
    BadLocator(String),
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// A parsed block locator. Hints after the size are kept but never
/// participate in equality of the rendered form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    hash: String,
    size: u64,
    hints: Vec<String>,
}

impl Locator {
    pub fn parse(s: &str) -> Result<Self, ManifestError> {
        let bad = || ManifestError::BadLocator(s.to_string());
        let mut parts = s.split('+');
        let hash = parts.next().ok_or_else(bad)?;
        if hash.len() != 32 || !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(bad());
        }
        let size_str = parts.next().ok_or_else(bad)?;
        if size_str.is_empty() || !size_str.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let size = size_str.parse().map_err(|_| bad())?;
        Ok(Self {
            hash: hash.to_string(),
            size,
            hints: parts.map(str::to_string).collect(),
        })
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hints(&self) -> &[String] {
        &self.hints
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.hash, self.size)
    }
}

/// A contiguous piece of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub locator: String,
    pub offset: u64,
    pub length: u64,
}

/// A file within a stream: one or more byte ranges of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    name: String,
    ranges: Vec<Range<u64>>,
}

impl FileEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    name: String,
    blocks: Vec<Locator>,
    files: Vec<FileEntry>,
}

impl Stream {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn blocks(&self) -> &[Locator] {
        &self.blocks
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn len(&self) -> u64 {
        self.blocks.iter().map(Locator::size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Map a file's stream ranges onto block segments, in file order.
    pub fn segments(&self, file: &FileEntry) -> Vec<Segment> {
        let mut segments = Vec::new();
        for range in &file.ranges {
            let mut block_start = 0u64;
            for block in &self.blocks {
                let block_end = block_start + block.size();
                if block_start < range.end && block_end > range.start {
                    let start = range.start.max(block_start);
                    let end = range.end.min(block_end);
                    segments.push(Segment {
                        locator: block.to_string(),
                        offset: start - block_start,
                        length: end - start,
                    });
                }
                if block_end >= range.end {
                    break;
                }
                block_start = block_end;
            }
        }
        segments
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    streams: Vec<Stream>,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut streams = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            streams.push(parse_stream(idx + 1, line)?);
        }
        Ok(Self { streams })
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }
}

fn parse_stream(line: usize, text: &str) -> Result<Stream, ManifestError> {
    let malformed = |reason: String| ManifestError::Malformed { line, reason };
    let mut tokens = text.split_whitespace().peekable();

    let name = unescape(tokens.next().unwrap_or_default());
    if !name.starts_with('.') {
        return Err(malformed(format!("stream name {name:?} must start with '.'")));
    }

    let mut blocks = Vec::new();
    while let Some(loc) = tokens.peek().and_then(|t| Locator::parse(t).ok()) {
        blocks.push(loc);
        tokens.next();
    }
    if blocks.is_empty() {
        return Err(malformed("stream has no block locators".into()));
    }
    let stream_len = blocks
        .iter()
        .try_fold(0u64, |total, block| total.checked_add(block.size()))
        .ok_or_else(|| malformed("block sizes overflow stream length".into()))?;

    let mut files: Vec<FileEntry> = Vec::new();
    for token in tokens {
        let mut parts = token.splitn(3, ':');
        let (Some(pos), Some(size), Some(fname)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed(format!("bad file token {token:?}")));
        };
        let pos: u64 = pos
            .parse()
            .map_err(|_| malformed(format!("bad file position in {token:?}")))?;
        let size: u64 = size
            .parse()
            .map_err(|_| malformed(format!("bad file size in {token:?}")))?;
        let end = pos
            .checked_add(size)
            .filter(|end| *end <= stream_len)
            .ok_or_else(|| malformed(format!("{token:?} runs past end of stream")))?;

        let fname = unescape(fname);
        match files.iter_mut().find(|f| f.name == fname) {
            Some(existing) => {
                if existing.size().checked_add(size).is_none() {
                    return Err(malformed(format!("file {fname:?} size overflows")));
                }
                existing.ranges.push(pos..end);
            }
            None => files.push(FileEntry {
                name: fname,
                ranges: vec![pos..end],
            }),
        }
    }
    if files.is_empty() {
        return Err(malformed("stream has no file tokens".into()));
    }

    Ok(Stream {
        name,
        blocks,
        files,
    })
}

/// Decode `\ooo` octal escapes.
fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal(&bytes[i + 1..i + 4]) {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(b) = u8::try_from(value) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal(digits: &[u8]) -> bool {
    digits.iter().all(|b| (b'0'..=b'7').contains(b))
}
