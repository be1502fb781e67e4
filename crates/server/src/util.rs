use blake3::Hasher;
use std::time::{SystemTime, UNIX_EPOCH};

/// Encodes raw bytes into hexadecimal representation.
pub fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter() {
        output.push(nibble(byte >> 4));
        output.push(nibble(byte & 0x0f));
    }
    output
}

/// Generates an opaque identifier from entropy and context.
pub fn generate_id(context: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(context.as_bytes());
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_le_bytes();
    hasher.update(&now);
    encode_hex(hasher.finalize().as_bytes())
}

fn nibble(value: u8) -> char {
    match value {
        0..=9 => char::from(b'0' + value),
        10..=15 => char::from(b'a' + (value - 10)),
        _ => '0',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encoding_is_lowercase() {
        assert_eq!(encode_hex(&[0x0f, 0xa0, 0xff]), "0fa0ff");
    }

    #[test]
    fn id_generation_differs() {
        let first = generate_id("context");
        let second = generate_id("context");
        assert_ne!(first, second);
    }
}
