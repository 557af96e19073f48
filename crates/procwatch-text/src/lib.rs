//! Line-oriented text reading over live byte streams
//!
//! A [`LineReader`] wraps a single backing file that some other party (for
//! procwatch, a child process) keeps appending to. It hands out decoded lines
//! on demand, advancing a byte cursor, and recovers from unknown or mixed
//! output encodings by consulting [`detect_bytes_encoding`] and sticking with
//! whatever that oracle learns mid-stream.

pub mod encoding;
pub mod error;
pub mod reader;

pub use encoding::{
    convert_file_to_utf8, decode_bytes_to_utf8, detect_bytes_encoding, detect_file_encoding,
    read_text_range,
};
pub use error::TextError;
pub use reader::LineReader;
