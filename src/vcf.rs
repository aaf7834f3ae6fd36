// ========================================================================================
//
//                               Lazy VCF header and record reading
//
// ========================================================================================
//
// The VCF is read exactly once, front to back. The header is parsed eagerly to learn
// the sample columns; records are then handed out one line at a time so that
// multi-gigabyte (possibly gzipped) files never need to be held in memory.

use crate::files::{FileError, LineReader, TextReader, open_text};
use std::io::{self, BufRead};
use std::path::Path;
use thiserror::Error;

/// Prefix of meta-information lines preceding the header.
pub const META_PREFIX: &[u8] = b"##";
/// Prefix of the header line naming the columns.
pub const HEADER_PREFIX: &[u8] = b"#CHROM";
/// CHROM, POS, ID, REF, ALT, QUAL, FILTER, INFO and FORMAT precede the samples.
pub const FIRST_SAMPLE_COLUMN: usize = 9;

#[derive(Debug, Error)]
pub enum VcfError {
    #[error(transparent)]
    File(#[from] FileError),
    #[error("Error reading {source_name}: {error}")]
    Io {
        source_name: String,
        error: io::Error,
    },
    #[error("VCF header with sample names not found in {0}")]
    HeaderNotFound(String),
    #[error("`#CHROM` header did not contain sample names in {0}")]
    NoSamples(String),
    #[error("Line {line} of {source_name} is not valid UTF-8")]
    InvalidUtf8 { source_name: String, line: usize },
}

pub struct VcfReader<R> {
    source_name: String,
    lines: LineReader<R>,
    samples: Vec<String>,
}

impl VcfReader<TextReader> {
    pub fn open(path: &Path) -> Result<Self, VcfError> {
        Self::new(open_text(path)?, path.display().to_string())
    }
}

impl<R: BufRead> VcfReader<R> {
    /// Consumes meta lines and the `#CHROM` header from `reader`. `source_name`
    /// is only used in messages.
    pub fn new(reader: R, source_name: String) -> Result<Self, VcfError> {
        let mut lines = LineReader::new(reader);
        let samples;

        loop {
            let line = lines.next_line().map_err(|error| VcfError::Io {
                source_name: source_name.clone(),
                error,
            })?;

            match line {
                Some(line) if line.starts_with(META_PREFIX) => continue,
                Some(line) if line.starts_with(HEADER_PREFIX) => {
                    let names: Result<Vec<String>, _> = line
                        .split(|&byte| byte == b'\t')
                        .skip(FIRST_SAMPLE_COLUMN)
                        .map(|name| std::str::from_utf8(name).map(str::to_string))
                        .collect();
                    samples = names.map_err(|_| VcfError::InvalidUtf8 {
                        source_name: source_name.clone(),
                        line: lines.line_number(),
                    })?;
                    break;
                }
                _ => return Err(VcfError::HeaderNotFound(source_name)),
            }
        }

        if samples.is_empty() {
            return Err(VcfError::NoSamples(source_name));
        }

        Ok(Self {
            source_name,
            lines,
            samples,
        })
    }

    /// Sample names in the order of their columns.
    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    /// The remaining (body) lines, read on demand.
    pub fn records(self) -> Records<R> {
        Records {
            source_name: self.source_name,
            lines: self.lines,
        }
    }
}

/// Forward-only iterator over raw VCF records. Blank lines are skipped.
pub struct Records<R> {
    source_name: String,
    lines: LineReader<R>,
}

impl<R: BufRead> Iterator for Records<R> {
    type Item = Result<String, VcfError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(error) => {
                    return Some(Err(VcfError::Io {
                        source_name: self.source_name.clone(),
                        error,
                    }));
                }
            };

            if line.is_empty() {
                continue;
            }

            let decoded = std::str::from_utf8(line).map(str::to_string);
            return Some(decoded.map_err(|_| VcfError::InvalidUtf8 {
                source_name: self.source_name.clone(),
                line: self.lines.line_number(),
            }));
        }
    }
}
