//! Incremental line reader with a sticky, self-correcting encoding
//!
//! A [`LineReader`] is bound to one backing file for its whole life. The file
//! is typically still being appended to by a child process, so "end of
//! stream" here only ever means "no more bytes available right now".

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use encoding_rs::{Encoding, UTF_8};
use tracing::debug;

use crate::encoding::detect_bytes_encoding;
use crate::error::TextError;

/// Attempts per line before giving up on the detect-and-retry cycle. Guards
/// against a detector that keeps returning an encoding that still fails on a
/// pathological line.
const DECODE_ATTEMPTS: usize = 3;

/// Reads decoded text lines from a backing file, advancing a byte cursor.
///
/// The reader starts with a default encoding (UTF-8 unless overridden). The
/// first time a line fails to decode, the encoding oracle is consulted and
/// its guess becomes the *learned* encoding for every subsequent line: the
/// stream is assumed single-encoding from that point on.
#[derive(Debug)]
pub struct LineReader {
    path: PathBuf,
    default_encoding: &'static Encoding,
    learned: Option<&'static Encoding>,
    reader: BufReader<File>,
    cursor: u64,
}

impl LineReader {
    /// Open a reader over `path` with UTF-8 as the default encoding.
    ///
    /// The file is created empty if it does not exist yet; the writing side
    /// of a capture may not have touched it by the time the reader attaches.
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        Self::with_encoding(path, UTF_8)
    }

    /// Open a reader with an explicit default encoding.
    pub fn with_encoding(
        path: impl Into<PathBuf>,
        default_encoding: &'static Encoding,
    ) -> std::io::Result<Self> {
        let path = path.into();
        if !path.exists() {
            File::create(&path)?;
        }
        let reader = BufReader::new(File::open(&path)?);
        Ok(Self {
            path,
            default_encoding,
            learned: None,
            reader,
            cursor: 0,
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The encoding used when nothing has been learned yet.
    #[must_use]
    pub fn default_encoding(&self) -> &'static Encoding {
        self.default_encoding
    }

    /// The encoding learned from a mid-stream decode failure, if any. Once
    /// set it overrides the default for all subsequent lines.
    #[must_use]
    pub fn learned_encoding(&self) -> Option<&'static Encoding> {
        self.learned
    }

    /// Byte offset of the read cursor (bytes consumed so far).
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// True iff the cursor has caught up with the file's current on-disk
    /// size. The writer may still be alive, so this is not end-of-file.
    pub fn reach_end(&self) -> std::io::Result<bool> {
        Ok(self.cursor >= std::fs::metadata(&self.path)?.len())
    }

    /// Rewind to the start of the file, dropping any buffered readahead.
    ///
    /// Used by the capture size monitor after truncating the backing file.
    pub fn rewind(&mut self) -> std::io::Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        self.cursor = 0;
        Ok(())
    }

    /// Read up to `limit` decoded lines from the current cursor.
    ///
    /// * `limit` — maximum number of lines, `None` for unbounded.
    /// * `max_line_len` — raw lines longer than this many bytes are truncated
    ///   before decoding; `None` leaves lines whole. The returned byte count
    ///   always reflects the full raw length consumed from the file.
    /// * `strict` — when a line fails to decode and the oracle has no guess,
    ///   strict mode fails the whole read with [`TextError::Decode`];
    ///   non-strict mode substitutes replacement characters and keeps going.
    ///
    /// Stops early on an empty read: no bytes are available *right now*,
    /// which with a live writer is not the same as end-of-file. Line
    /// terminators (`\n`, `\r\n`) are stripped from the decoded lines.
    ///
    /// Returns the decoded lines and the total raw bytes consumed, so callers
    /// can account for capture size independent of decoded text length.
    pub fn read_lines(
        &mut self,
        limit: Option<usize>,
        max_line_len: Option<usize>,
        strict: bool,
    ) -> Result<(Vec<String>, u64), TextError> {
        let mut lines = Vec::new();
        let mut consumed: u64 = 0;
        // Once detection gives up on one line, the rest of this call decodes
        // lossily as well, mirroring a stream that is known to be dirty.
        let mut lossy = false;

        loop {
            if limit.is_some_and(|n| lines.len() >= n) {
                break;
            }

            let mut raw = Vec::new();
            let n = self.reader.read_until(b'\n', &mut raw)?;
            if n == 0 {
                break;
            }
            self.cursor += n as u64;
            consumed += n as u64;

            if let Some(cap) = max_line_len {
                raw.truncate(cap);
            }

            lines.push(self.decode_line(&raw, strict, &mut lossy)?);
        }

        Ok((lines, consumed))
    }

    fn decode_line(
        &mut self,
        raw: &[u8],
        strict: bool,
        lossy: &mut bool,
    ) -> Result<String, TextError> {
        let mut encoding = self.learned.unwrap_or(self.default_encoding);

        for _ in 0..DECODE_ATTEMPTS {
            let (text, had_errors) = encoding.decode_without_bom_handling(raw);
            if !had_errors || *lossy {
                return Ok(strip_line_terminator(&text).to_owned());
            }

            match detect_bytes_encoding(raw) {
                Some(guess) => {
                    debug!(
                        from = encoding.name(),
                        to = guess.name(),
                        "decode failed, switching to detected encoding"
                    );
                    self.learned = Some(guess);
                    encoding = guess;
                }
                None if strict => {
                    return Err(TextError::Decode {
                        bytes: raw.to_vec(),
                    });
                }
                None => {
                    *lossy = true;
                }
            }
        }

        // Retry budget exhausted: the detector kept suggesting an encoding
        // that still fails on this line.
        if strict {
            return Err(TextError::Decode {
                bytes: raw.to_vec(),
            });
        }
        let (text, _) = encoding.decode_without_bom_handling(raw);
        Ok(strip_line_terminator(&text).to_owned())
    }
}

fn strip_line_terminator(line: &str) -> &str {
    line.strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use encoding_rs::GB18030;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = dir.path().join(name);
        let mut file = File::create(&path)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(path)
    }

    #[test]
    fn test_read_all_lines() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_file(&dir, "plain.txt", b"one\ntwo\nthree\n")?;
        let mut reader = LineReader::new(&path)?;

        let (lines, size) = reader.read_lines(None, None, false)?;
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(size, 14);
        assert!(reader.reach_end()?);
        Ok(())
    }

    #[test]
    fn test_limit_and_cursor() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_file(&dir, "limit.txt", b"a\nb\nc\n")?;
        let mut reader = LineReader::new(&path)?;

        let (lines, size) = reader.read_lines(Some(2), None, false)?;
        assert_eq!(lines, vec!["a", "b"]);
        assert_eq!(size, 4);
        assert_eq!(reader.cursor(), 4);
        assert!(!reader.reach_end()?);

        // Remaining lines come out without re-reading consumed ones.
        let (rest, _) = reader.read_lines(None, None, false)?;
        assert_eq!(rest, vec!["c"]);
        assert!(reader.reach_end()?);
        Ok(())
    }

    #[test]
    fn test_zero_limit_does_not_advance() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_file(&dir, "zero.txt", b"a\nb\n")?;
        let mut reader = LineReader::new(&path)?;

        let (lines, size) = reader.read_lines(Some(0), None, false)?;
        assert!(lines.is_empty());
        assert_eq!(size, 0);
        assert_eq!(reader.cursor(), 0);
        Ok(())
    }

    #[test]
    fn test_max_line_len_truncates_after_counting() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_file(&dir, "long.txt", b"abcdefgh\n")?;
        let mut reader = LineReader::new(&path)?;

        let (lines, size) = reader.read_lines(None, Some(4), false)?;
        assert_eq!(lines, vec!["abcd"]);
        // Full raw length, including the truncated tail and terminator.
        assert_eq!(size, 9);
        Ok(())
    }

    #[test]
    fn test_crlf_terminator_stripped() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_file(&dir, "crlf.txt", b"windows line\r\n")?;
        let mut reader = LineReader::new(&path)?;

        let (lines, _) = reader.read_lines(None, None, false)?;
        assert_eq!(lines, vec!["windows line"]);
        Ok(())
    }

    #[test]
    fn test_learned_encoding_is_sticky() -> Result<()> {
        let dir = TempDir::new()?;
        // Two GBK lines: "你好" and "再见".
        let mut bytes = vec![0xC4, 0xE3, 0xBA, 0xC3, b'\n'];
        bytes.extend_from_slice(&[0xD4, 0xD9, 0xBC, 0xFB, b'\n']);
        let path = write_file(&dir, "gbk.txt", &bytes)?;
        let mut reader = LineReader::new(&path)?;
        assert!(reader.learned_encoding().is_none());

        let (lines, _) = reader.read_lines(None, None, false)?;
        assert_eq!(lines, vec!["你好", "再见"]);
        assert_eq!(reader.learned_encoding(), Some(GB18030));
        Ok(())
    }

    #[test]
    fn test_strict_mode_fails_on_undetectable_line() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_file(&dir, "binary.txt", &[0xFF, 0x00, 0xFF, b'\n'])?;
        let mut reader = LineReader::new(&path)?;

        let err = reader
            .read_lines(None, None, true)
            .expect_err("strict decode of binary junk must fail");
        match err {
            TextError::Decode { bytes } => assert_eq!(bytes, vec![0xFF, 0x00, 0xFF, b'\n']),
            other => panic!("expected Decode error, got {other}"),
        }
        Ok(())
    }

    #[test]
    fn test_non_strict_substitutes_replacement_chars() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_file(&dir, "mixed.txt", &[0xFF, 0x00, 0xFF, b'\n', b'o', b'k', b'\n'])?;
        let mut reader = LineReader::new(&path)?;

        let (lines, _) = reader.read_lines(None, None, false)?;
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains('\u{FFFD}'));
        assert_eq!(lines[1], "ok");
        Ok(())
    }

    #[test]
    fn test_reads_data_appended_after_catchup() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_file(&dir, "live.txt", b"first\n")?;
        let mut reader = LineReader::new(&path)?;

        let (lines, _) = reader.read_lines(None, None, false)?;
        assert_eq!(lines, vec!["first"]);
        assert!(reader.reach_end()?);

        let mut appender = std::fs::OpenOptions::new().append(true).open(&path)?;
        appender.write_all(b"second\n")?;
        appender.flush()?;

        assert!(!reader.reach_end()?);
        let (lines, _) = reader.read_lines(None, None, false)?;
        assert_eq!(lines, vec!["second"]);
        Ok(())
    }

    #[test]
    fn test_rewind_rereads_from_start() -> Result<()> {
        let dir = TempDir::new()?;
        let path = write_file(&dir, "rewind.txt", b"x\ny\n")?;
        let mut reader = LineReader::new(&path)?;

        let _ = reader.read_lines(None, None, false)?;
        reader.rewind()?;
        assert_eq!(reader.cursor(), 0);
        let (lines, _) = reader.read_lines(None, None, false)?;
        assert_eq!(lines, vec!["x", "y"]);
        Ok(())
    }

    #[test]
    fn test_creates_missing_backing_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("not-yet-written.txt");
        let mut reader = LineReader::new(&path)?;

        assert!(path.exists());
        let (lines, size) = reader.read_lines(None, None, false)?;
        assert!(lines.is_empty());
        assert_eq!(size, 0);
        Ok(())
    }
}
