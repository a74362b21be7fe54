//! Wire codec between the tracer and the target binary.
//!
//! Inputs are handed to the target as two-hex-digit tokens (`"0a" "ff" ...`), the big-endian
//! encoding of the input block. The target answers on stdout with a line starting with the
//! [`OUTPUT_MARKER`] followed by the output block in the same token format.

use crate::error::TraceFailure;

/// Literal prefix of the stdout line carrying the output block.
pub const OUTPUT_MARKER: &str = "OUTPUT";

/// Serializes `value` as `2 * block_size` zero-padded hex digits split in byte tokens.
///
/// Only the `block_size` least significant bytes of `value` are kept.
///
/// # Panics
/// Panics if `block_size` is greater than 16.
pub fn encode_input(value: u128, block_size: usize) -> Vec<String> {
    assert!(block_size <= 16);

    encode_block(&value.to_be_bytes()[16 - block_size..])
}

/// Serializes a big-endian block in byte tokens.
pub fn encode_block(block: &[u8]) -> Vec<String> {
    block.iter().map(|byte| hex::encode([*byte])).collect()
}

/// Decodes byte tokens back to the integer they encode (big-endian).
pub fn decode_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<u128, TraceFailure> {
    if tokens.len() > 16 {
        return Err(TraceFailure::MalformedOutput(format!(
            "{} bytes do not fit a 128-bit block",
            tokens.len()
        )));
    }

    let mut value = 0u128;
    for token in tokens {
        let token = token.as_ref();
        let mut byte = [0u8; 1];
        if token.len() != 2 || hex::decode_to_slice(token, &mut byte).is_err() {
            return Err(TraceFailure::MalformedOutput(format!(
                "invalid byte token {token:?}"
            )));
        }
        value = (value << 8) | byte[0] as u128;
    }

    Ok(value)
}

/// Big-endian integer value of a block.
pub fn block_to_u128(block: &[u8]) -> u128 {
    block.iter().fold(0, |acc, &b| (acc << 8) | b as u128)
}

/// Extracts the output block from the target stdout.
///
/// Exactly one line must consist of [`OUTPUT_MARKER`], an optional `:`, and the tokens separated
/// by whitespace. Lines merely starting with the marker text (`OUTPUTS`, `OUTPUT_LEN`) are ignored
/// like all other lines.
pub fn parse_output(stdout: &str) -> Result<u128, TraceFailure> {
    let mut lines = stdout.lines().filter_map(|line| {
        let rest = line.strip_prefix(OUTPUT_MARKER)?;
        let rest = rest.strip_prefix(':').unwrap_or(rest);
        (rest.is_empty() || rest.starts_with(char::is_whitespace)).then_some(rest)
    });

    let Some(line) = lines.next() else {
        return Err(TraceFailure::MissingOutput);
    };
    if lines.next().is_some() {
        return Err(TraceFailure::MalformedOutput(
            "several OUTPUT lines".to_string(),
        ));
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(TraceFailure::MalformedOutput(
            "empty OUTPUT line".to_string(),
        ));
    }

    decode_tokens(&tokens)
}
