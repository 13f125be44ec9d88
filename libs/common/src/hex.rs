//! Hex formatting for frame dumps in debug logs

use std::fmt::Write;

/// Space separated uppercase hex, truncated after `max_bytes`
/// Example: [0x03, 0x00, 0x2A] -> "03 00 2A"
pub fn format_hex_pretty(data: &[u8], max_bytes: usize) -> String {
    let shown = data.len().min(max_bytes);
    let mut result = String::with_capacity(shown * 3 + 8);
    for (i, byte) in data[..shown].iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        let _ = write!(&mut result, "{:02X}", byte);
    }
    if data.len() > shown {
        let _ = write!(&mut result, " ..(+{})", data.len() - shown);
    }
    result
}
