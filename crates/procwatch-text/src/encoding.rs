//! Encoding detection for captured process output
//!
//! Child processes do not announce what encoding they write in, and build
//! tools on localized systems routinely mix UTF-8 with a legacy codepage in
//! the same stream. The functions here give a best-guess answer for a byte
//! buffer, with "no confident guess" as an explicit outcome rather than a
//! forced wrong answer.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use encoding_rs::{BIG5, EUC_KR, Encoding, GB18030, SHIFT_JIS, UTF_8};
use once_cell::sync::Lazy;
use tracing::{debug, error, warn};

/// Legacy multi-byte encodings tried, in order, when a buffer is not valid
/// UTF-8. Single-byte catch-alls (windows-1252 and friends) are deliberately
/// absent: they accept any byte sequence, which would make "no guess"
/// unreachable and strict-mode decoding meaningless.
const DETECTION_CANDIDATES: &[&Encoding] = &[GB18030, SHIFT_JIS, EUC_KR, BIG5];

/// Process-wide cache for whole-file detection results, keyed by path.
///
/// Capture backing files are uniquely named temp files, so a cached entry can
/// never alias a different file's bytes.
static FILE_ENCODING_CACHE: Lazy<Mutex<HashMap<PathBuf, Option<&'static Encoding>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Guess the text encoding of a byte buffer.
///
/// Detection order:
/// 1. BOM sniffing (UTF-8 / UTF-16 byte order marks are authoritative).
/// 2. UTF-8 validation. Pure ASCII input is a strict UTF-8 subset and comes
///    back as UTF-8, so callers never see a separate "ascii" label.
/// 3. The fixed legacy candidate list, accepting the first encoding that
///    decodes the whole buffer without errors.
///
/// Returns `None` when nothing decodes the buffer cleanly.
#[must_use]
pub fn detect_bytes_encoding(bytes: &[u8]) -> Option<&'static Encoding> {
    if bytes.is_empty() {
        return Some(UTF_8);
    }

    if let Some((encoding, _bom_len)) = Encoding::for_bom(bytes) {
        debug!(encoding = encoding.name(), "detected encoding from BOM");
        return Some(encoding);
    }

    if std::str::from_utf8(bytes).is_ok() {
        return Some(UTF_8);
    }

    for &candidate in DETECTION_CANDIDATES {
        let (_, had_errors) = candidate.decode_without_bom_handling(bytes);
        if !had_errors {
            debug!(encoding = candidate.name(), "detected legacy encoding");
            return Some(candidate);
        }
    }

    debug!(len = bytes.len(), "no encoding detected");
    None
}

/// Detect the encoding of a whole file, memoizing the result per path.
///
/// A missing or unreadable file logs an error and returns `None` without
/// poisoning the cache, so a transient read failure does not stick.
#[must_use]
pub fn detect_file_encoding(path: impl AsRef<Path>) -> Option<&'static Encoding> {
    let path = path.as_ref();

    {
        let cache = FILE_ENCODING_CACHE
            .lock()
            .expect("encoding cache mutex poisoned");
        if let Some(cached) = cache.get(path) {
            return *cached;
        }
    }

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to read file for encoding detection");
            return None;
        }
    };

    let detected = detect_bytes_encoding(&bytes);
    FILE_ENCODING_CACHE
        .lock()
        .expect("encoding cache mutex poisoned")
        .insert(path.to_path_buf(), detected);
    detected
}

/// Detect and decode a byte buffer to a UTF-8 `String`.
///
/// Returns `None` when no encoding can be detected at all. If the detected
/// encoding still trips on individual sequences, the bad bytes become
/// replacement characters rather than failing the whole conversion.
#[must_use]
pub fn decode_bytes_to_utf8(bytes: &[u8]) -> Option<String> {
    let encoding = detect_bytes_encoding(bytes)?;
    let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
    if had_errors {
        warn!(
            encoding = encoding.name(),
            "detected encoding still failed on some sequences, substituting replacement characters"
        );
    }
    Some(text.into_owned())
}

/// Re-encode a whole file to UTF-8, writing the result to `dst`.
///
/// The source encoding comes from [`detect_file_encoding`] and therefore
/// shares its cache. Returns `Ok(false)` without touching `dst` when no
/// encoding can be detected; sequences the detected encoding still rejects
/// become replacement characters rather than failing the conversion. A
/// leading BOM is consumed, not copied into the output.
pub fn convert_file_to_utf8(
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
) -> std::io::Result<bool> {
    let src = src.as_ref();
    let Some(encoding) = detect_file_encoding(src) else {
        warn!(path = %src.display(), "no encoding detected, refusing to convert");
        return Ok(false);
    };

    let bytes = fs::read(src)?;
    let (text, _, had_errors) = encoding.decode(&bytes);
    if had_errors {
        warn!(
            path = %src.display(),
            encoding = encoding.name(),
            "conversion substituted replacement characters for invalid sequences"
        );
    }
    fs::write(dst, text.as_bytes())?;
    Ok(true)
}

/// Read a range of decoded lines from a text file.
///
/// `start` is a 0-based line index, `end` is exclusive (`None` reads through
/// the last line); out-of-range indices clamp to what the file has. The
/// encoding comes from [`detect_file_encoding`], falling back to lossy UTF-8
/// for an undetectable file.
pub fn read_text_range(
    path: impl AsRef<Path>,
    start: usize,
    end: Option<usize>,
) -> std::io::Result<Vec<String>> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let text = match detect_file_encoding(path) {
        Some(encoding) => encoding.decode(&bytes).0,
        None => String::from_utf8_lossy(&bytes),
    };

    let lines = text.lines().skip(start);
    Ok(match end {
        Some(end) if end <= start => Vec::new(),
        Some(end) => lines.take(end - start).map(str::to_owned).collect(),
        None => lines.map(str::to_owned).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_ascii_normalizes_to_utf8() {
        assert_eq!(detect_bytes_encoding(b"plain ascii text"), Some(UTF_8));
    }

    #[test]
    fn test_multibyte_utf8() {
        assert_eq!(detect_bytes_encoding("héllo wörld 世界".as_bytes()), Some(UTF_8));
    }

    #[test]
    fn test_empty_buffer_is_utf8() {
        assert_eq!(detect_bytes_encoding(b""), Some(UTF_8));
    }

    #[test]
    fn test_utf16_bom() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "hi".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let detected = detect_bytes_encoding(&bytes).expect("BOM should be decisive");
        assert_eq!(detected.name(), "UTF-16LE");
    }

    #[test]
    fn test_gbk_bytes_detected_as_gb18030() {
        // "你好" in GBK
        let bytes = [0xC4, 0xE3, 0xBA, 0xC3];
        assert_eq!(detect_bytes_encoding(&bytes), Some(GB18030));
    }

    #[test]
    fn test_undetectable_bytes() {
        // 0xFF is not a valid lead byte in UTF-8 or any candidate encoding.
        // (0xFF 0xFE would be a UTF-16 BOM, hence the 0x00 separator.)
        assert_eq!(detect_bytes_encoding(&[0xFF, 0x00, 0xFF]), None);
    }

    #[test]
    fn test_detect_file_encoding_cached() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all("cached content 世界".as_bytes())?;
        file.flush()?;

        let first = detect_file_encoding(file.path());
        assert_eq!(first, Some(UTF_8));
        // Second call hits the cache and must agree.
        assert_eq!(detect_file_encoding(file.path()), first);
        Ok(())
    }

    #[test]
    fn test_detect_file_encoding_missing_file() {
        assert_eq!(
            detect_file_encoding("/nonexistent/path/for/procwatch/test"),
            None
        );
    }

    #[test]
    fn test_decode_bytes_to_utf8_from_gbk() {
        let bytes = [0xC4, 0xE3, 0xBA, 0xC3];
        assert_eq!(decode_bytes_to_utf8(&bytes).as_deref(), Some("你好"));
    }

    #[test]
    fn test_decode_bytes_to_utf8_undetectable() {
        assert_eq!(decode_bytes_to_utf8(&[0xFF, 0x00, 0xFF]), None);
    }

    #[test]
    fn test_convert_file_to_utf8_from_gbk() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let src = dir.path().join("gbk.txt");
        // "你好\n再见" in GBK.
        let mut bytes = vec![0xC4, 0xE3, 0xBA, 0xC3, b'\n'];
        bytes.extend_from_slice(&[0xD4, 0xD9, 0xBC, 0xFB]);
        std::fs::write(&src, &bytes)?;

        let dst = dir.path().join("utf8.txt");
        assert!(convert_file_to_utf8(&src, &dst)?);
        assert_eq!(std::fs::read_to_string(&dst)?, "你好\n再见");
        Ok(())
    }

    #[test]
    fn test_convert_file_to_utf8_undetectable_writes_nothing() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let src = dir.path().join("binary.bin");
        std::fs::write(&src, [0xFF, 0x00, 0xFF])?;

        let dst = dir.path().join("should-not-exist.txt");
        assert!(!convert_file_to_utf8(&src, &dst)?);
        assert!(!dst.exists());
        Ok(())
    }

    #[test]
    fn test_read_text_range_slices_lines() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"a\nb\nc\nd\n")?;
        file.flush()?;

        assert_eq!(read_text_range(file.path(), 1, Some(3))?, vec!["b", "c"]);
        assert_eq!(read_text_range(file.path(), 2, None)?, vec!["c", "d"]);
        assert_eq!(read_text_range(file.path(), 0, Some(0))?, Vec::<String>::new());
        // Indices past the end clamp instead of erroring.
        assert_eq!(read_text_range(file.path(), 10, None)?, Vec::<String>::new());
        assert_eq!(read_text_range(file.path(), 1, Some(100))?, vec!["b", "c", "d"]);
        Ok(())
    }

    #[test]
    fn test_read_text_range_decodes_gbk() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("gbk-lines.txt");
        let mut bytes = vec![0xC4, 0xE3, 0xBA, 0xC3, b'\n'];
        bytes.extend_from_slice(&[0xD4, 0xD9, 0xBC, 0xFB, b'\n']);
        std::fs::write(&path, &bytes)?;

        assert_eq!(read_text_range(&path, 1, None)?, vec!["再见"]);
        Ok(())
    }
}
