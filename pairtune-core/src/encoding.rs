use std::path::Path;

use anyhow::{Context, Result};
use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8};
use tracing::{info, warn};

/// Text that has been decoded from some (possibly non-UTF-8) encoding.
pub struct DecodedText {
    pub text: String,
    pub encoding: &'static Encoding,
}

/// Guesses the encoding of a blob of bytes. A byte order mark always wins,
/// otherwise we let chardetng take a look at the whole thing.
pub fn detect_encoding(bytes: &[u8]) -> &'static Encoding {
    if let Some((encoding, _bom_len)) = Encoding::for_bom(bytes) {
        return encoding;
    }
    if bytes.is_empty() {
        return UTF_8;
    }
    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    detector.guess(None, true)
}

pub fn decode_to_utf8(bytes: &[u8]) -> DecodedText {
    let encoding = detect_encoding(bytes);
    info!("Detected encoding: {}", encoding.name());

    // `decode` strips the BOM for us, if there is one.
    let (text, actual_encoding, had_errors) = encoding.decode(bytes);
    if had_errors {
        warn!(
            "Some bytes were not valid {}, they have been replaced.",
            actual_encoding.name()
        );
    }
    DecodedText {
        text: text.into_owned(),
        encoding: actual_encoding,
    }
}

pub fn read_to_utf8<P: AsRef<Path>>(path: P) -> Result<DecodedText> {
    let path = path.as_ref();
    let bytes =
        std::fs::read(path).with_context(|| format!("unable to read {}", path.display()))?;
    Ok(decode_to_utf8(&bytes))
}
