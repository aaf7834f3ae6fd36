use flate2::read::MultiGzDecoder;
use log::debug;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A line-oriented reader over a local file that may or may not be compressed.
pub type TextReader = Box<dyn BufRead + Send>;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("{desc} is missing: {}", quote(.path))]
    Missing { desc: &'static str, path: PathBuf },
    #[error("{desc} is not a file: {}", quote(.path))]
    NotAFile { desc: &'static str, path: PathBuf },
    #[error("Opening {}: {source}", quote(.path))]
    Open { path: PathBuf, source: io::Error },
}

/// Quotes a path the way a POSIX shell would need it, so that messages can be
/// copy-pasted back into a terminal.
pub fn quote<P: AsRef<Path>>(path: P) -> String {
    let text = path.as_ref().to_string_lossy();
    let is_safe = |c: char| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c);
    if !text.is_empty() && text.chars().all(is_safe) {
        text.into_owned()
    } else {
        format!("'{}'", text.replace('\'', "'\"'\"'"))
    }
}

pub fn require_file(path: &Path, desc: &'static str) -> Result<(), FileError> {
    if !path.exists() {
        Err(FileError::Missing {
            desc,
            path: path.to_path_buf(),
        })
    } else if !path.is_file() {
        Err(FileError::NotAFile {
            desc,
            path: path.to_path_buf(),
        })
    } else {
        Ok(())
    }
}

fn is_gzip_magic(magic: &[u8]) -> bool {
    magic.len() >= 2 && magic[0] == 0x1F && magic[1] == 0x8B
}

/// Opens a file for reading, transparently decompressing gzip (and BGZF, which
/// is a series of gzip members) when the file starts with the gzip magic bytes.
pub fn open_text(path: &Path) -> Result<TextReader, FileError> {
    let open_error = |source| FileError::Open {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(open_error)?;
    let mut reader = BufReader::new(file);
    let compressed = is_gzip_magic(reader.fill_buf().map_err(open_error)?);

    if compressed {
        debug!("Decompressing {} as gzip", path.display());
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

/// Reads lines into a reused buffer, stripping `\n` and `\r\n` terminators.
pub struct LineReader<R> {
    reader: R,
    line: Vec<u8>,
    line_number: usize,
}

impl<R: BufRead> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::with_capacity(1024),
            line_number: 0,
        }
    }

    /// 1-based number of the line most recently returned by `next_line`.
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    pub fn next_line(&mut self) -> io::Result<Option<&[u8]>> {
        self.line.clear();
        if self.reader.read_until(b'\n', &mut self.line)? == 0 {
            return Ok(None);
        }
        self.line_number += 1;

        if self.line.last() == Some(&b'\n') {
            self.line.pop();
        }
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }

        Ok(Some(&self.line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::{Cursor, Read, Write};
    use tempfile::tempdir;

    #[test]
    fn quote_leaves_plain_paths_alone() {
        assert_eq!(quote("data/matrix.csv"), "data/matrix.csv");
        assert_eq!(quote("my file.csv"), "'my file.csv'");
        assert_eq!(quote("it's"), "'it'\"'\"'s'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn require_file_distinguishes_missing_and_directories() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.vcf");
        assert!(matches!(
            require_file(&missing, "VCF file"),
            Err(FileError::Missing { .. })
        ));
        assert!(matches!(
            require_file(dir.path(), "VCF file"),
            Err(FileError::NotAFile { .. })
        ));

        let present = dir.path().join("present.vcf");
        std::fs::write(&present, "x").unwrap();
        assert!(require_file(&present, "VCF file").is_ok());
    }

    #[test]
    fn open_text_detects_gzip_by_magic_bytes() {
        let dir = tempdir().unwrap();
        // Deliberately misleading extension: detection must rely on content.
        let path = dir.path().join("plain_name.txt");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello\nworld\n").unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        let mut text = String::new();
        open_text(&path).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello\nworld\n");
    }

    #[test]
    fn open_text_reads_plain_files_verbatim() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.vcf.gz");
        std::fs::write(&path, "not compressed\n").unwrap();

        let mut text = String::new();
        open_text(&path).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "not compressed\n");
    }

    #[test]
    fn line_reader_strips_terminators() {
        let mut reader = LineReader::new(Cursor::new(b"a\r\nb\n\nc".to_vec()));
        assert_eq!(reader.next_line().unwrap(), Some(&b"a"[..]));
        assert_eq!(reader.next_line().unwrap(), Some(&b"b"[..]));
        assert_eq!(reader.next_line().unwrap(), Some(&b""[..]));
        assert_eq!(reader.next_line().unwrap(), Some(&b"c"[..]));
        assert_eq!(reader.line_number(), 4);
        assert_eq!(reader.next_line().unwrap(), None);
    }
}
