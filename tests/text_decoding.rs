//! Decoding behavior through the public surface: non-UTF-8 child output,
//! strict-mode failures, and never-panic properties over arbitrary bytes.

use anyhow::Result;
use procwatch::{LineReader, ManagedProcess, detect_bytes_encoding};
use proptest::prelude::*;
use std::io::Write;
use std::time::Duration;

#[test]
fn test_gbk_child_output_decodes() -> Result<()> {
    // printf the GBK encoding of "你好"; the reader must learn the encoding
    // mid-stream and hand back valid UTF-8.
    let mut proc = ManagedProcess::new("/bin/bash")
        .arg("-c")
        .arg("printf '\\xc4\\xe3\\xba\\xc3\\n'")
        .label("gbk");

    let result = proc.run(Some(Duration::from_secs(30)))?;
    assert_eq!(result.returncode, Some(0));
    assert_eq!(result.stdout, vec!["你好"]);
    Ok(())
}

#[test]
fn test_mixed_ascii_and_gbk_lines() -> Result<()> {
    let mut proc = ManagedProcess::new("/bin/bash")
        .arg("-c")
        .arg("echo plain; printf '\\xc4\\xe3\\xba\\xc3\\n'; echo after")
        .label("mixed");

    let result = proc.run(Some(Duration::from_secs(30)))?;
    assert_eq!(result.stdout, vec!["plain", "你好", "after"]);
    Ok(())
}

#[test]
fn test_strict_mode_surfaces_decode_failure() -> Result<()> {
    // Bytes no supported encoding accepts: strict picks must error while
    // lossy picks substitute replacement characters.
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(&[0xFF, 0x00, 0xFF, b'\n'])?;
    file.flush()?;

    let mut strict = LineReader::new(file.path())?;
    assert!(strict.read_lines(None, None, true).is_err());

    let mut lossy = LineReader::new(file.path())?;
    let (lines, consumed) = lossy.read_lines(None, None, false)?;
    assert_eq!(lines.len(), 1);
    assert_eq!(consumed, 4);
    assert!(lines[0].contains('\u{FFFD}'));
    Ok(())
}

proptest! {
    #[test]
    fn prop_detection_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = detect_bytes_encoding(&bytes);
    }

    #[test]
    fn prop_lossy_read_never_errors(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();

        let mut reader = LineReader::new(file.path()).unwrap();
        let (lines, consumed) = reader.read_lines(None, None, false).unwrap();
        // Lossy mode always consumes every complete line and yields UTF-8.
        prop_assert!(consumed <= bytes.len() as u64);
        for line in &lines {
            prop_assert!(!line.ends_with('\n'));
        }
    }
}
