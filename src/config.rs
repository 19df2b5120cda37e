//! Reader for the bespoke `general`/`segment`/`mempool` config format (§6).
//!
//! Not JSON or TOML: a small dedicated grammar of indentation-free
//! `section { key: value }` blocks, one `general` section and any number of
//! repeated `segment` sections each nesting one or more `mempool` entries.
//! Kept independent of `serde` since the format is not one `serde` already
//! speaks.

use crate::error::ConfigError;
use crate::segment_manager::{MAX_POOLS_PER_SEGMENT, MAX_SEGMENTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MempoolEntry {
    pub chunk_size: usize,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConfigEntry {
    pub reader_group: String,
    pub writer_group: String,
    pub pools: Vec<MempoolEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub version: u32,
    pub domain_id: u16,
    pub segments: Vec<SegmentConfigEntry>,
}

const SUPPORTED_VERSION: u32 = 1;

impl Config {
    /// A single segment, current-process group for both reader and writer,
    /// one pool of `{size: 128, count: 10000}`: the scenario-1 default used
    /// when no `--config-file` is given.
    pub fn default_single_segment(domain_id: u16, group: &str) -> Self {
        Config {
            version: SUPPORTED_VERSION,
            domain_id,
            segments: vec![SegmentConfigEntry {
                reader_group: group.to_string(),
                writer_group: group.to_string(),
                pools: vec![MempoolEntry { chunk_size: 128, chunk_count: 10_000 }],
            }],
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != SUPPORTED_VERSION {
            return Err(ConfigError::UnsupportedVersion { found: self.version, expected: SUPPORTED_VERSION });
        }
        if self.segments.is_empty() {
            return Err(ConfigError::NoSegments);
        }
        if self.segments.len() > MAX_SEGMENTS {
            return Err(ConfigError::TooManySegments(self.segments.len(), MAX_SEGMENTS));
        }
        for (i, seg) in self.segments.iter().enumerate() {
            if seg.pools.is_empty() {
                return Err(ConfigError::NoMempoolInSegment(i));
            }
            if seg.pools.len() > MAX_POOLS_PER_SEGMENT {
                return Err(ConfigError::TooManyMempools(seg.pools.len(), MAX_POOLS_PER_SEGMENT));
            }
            for pool in &seg.pools {
                if pool.chunk_size == 0 {
                    return Err(ConfigError::ChunkSizeZero);
                }
                if pool.chunk_count == 0 {
                    return Err(ConfigError::InvalidChunkCount);
                }
            }
        }
        Ok(())
    }

    pub fn load(path: &std::path::Path, domain_id: u16) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config = parse(&text, domain_id)?;
        config.domain_id = domain_id;
        config.validate()?;
        Ok(config)
    }
}

/// One token of the reader's input: a key, a brace, or a colon-value.
struct Lines<'a> {
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str) -> Self {
        Lines { lines: text.lines().enumerate() }
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Parses the whole document. Grammar (informal):
/// ```text
/// general { version: 1 }
/// segment {
///     reader: groupname
///     writer: groupname
///     mempool { size: 128 count: 10000 }
/// }
/// ```
fn parse(text: &str, domain_id: u16) -> Result<Config, ConfigError> {
    let mut version = None;
    let mut segments = Vec::new();

    let mut iter = Lines::new(text);
    let mut current_segment: Option<(Option<String>, Option<String>, Vec<MempoolEntry>)> = None;
    let mut current_mempool: Option<(Option<usize>, Option<usize>)> = None;
    let mut in_general = false;

    while let Some((lineno, raw)) = iter.lines.next() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("general") {
            in_general = true;
            continue;
        }
        if line.starts_with("segment") {
            current_segment = Some((None, None, Vec::new()));
            continue;
        }
        if line.starts_with("mempool") {
            current_mempool = Some((None, None));
            continue;
        }
        if line == "}" {
            if current_mempool.is_some() {
                let (size, count) = current_mempool.take().unwrap();
                let size = size.ok_or_else(|| parse_err(lineno, "mempool missing size"))?;
                let count = count.ok_or_else(|| parse_err(lineno, "mempool missing count"))?;
                if let Some(seg) = current_segment.as_mut() {
                    seg.2.push(MempoolEntry { chunk_size: size, chunk_count: count });
                }
            } else if current_segment.is_some() {
                let (reader, writer, pools) = current_segment.take().unwrap();
                let reader = reader.ok_or_else(|| parse_err(lineno, "segment missing reader"))?;
                let writer = writer.ok_or_else(|| parse_err(lineno, "segment missing writer"))?;
                segments.push(SegmentConfigEntry { reader_group: reader, writer_group: writer, pools });
            } else {
                in_general = false;
            }
            continue;
        }

        let (key, value) = split_kv(line).ok_or_else(|| parse_err(lineno, "expected key: value"))?;
        match key {
            "version" if in_general => {
                version = Some(value.parse::<u32>().map_err(|_| parse_err(lineno, "version must be an integer"))?);
            }
            "reader" => {
                if let Some(seg) = current_segment.as_mut() {
                    seg.0 = Some(value.to_string());
                }
            }
            "writer" => {
                if let Some(seg) = current_segment.as_mut() {
                    seg.1 = Some(value.to_string());
                }
            }
            "size" => {
                if let Some(mp) = current_mempool.as_mut() {
                    mp.0 = Some(value.parse().map_err(|_| parse_err(lineno, "size must be an integer"))?);
                }
            }
            "count" => {
                if let Some(mp) = current_mempool.as_mut() {
                    mp.1 = Some(value.parse().map_err(|_| parse_err(lineno, "count must be an integer"))?);
                }
            }
            other => return Err(parse_err(lineno, &format!("unknown key '{other}'"))),
        }
    }

    Ok(Config {
        version: version.ok_or_else(|| parse_err(0, "missing general.version"))?,
        domain_id,
        segments,
    })
}

fn split_kv(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(':')?;
    let key = line[..idx].trim();
    let value = line[idx + 1..].trim().trim_end_matches(',');
    if key.is_empty() || value.is_empty() {
        None
    } else {
        Some((key, value))
    }
}

fn parse_err(line: usize, message: &str) -> ConfigError {
    ConfigError::Parse { line: line + 1, message: message.to_string() }
}
