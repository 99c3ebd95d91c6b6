const BTIH_MARKER: &str = "xt=urn:btih:";

/// Largest index the player can represent exactly (2^53 - 1).
const MAX_INDEX: u64 = (1 << 53) - 1;

fn is_hex_40(s: &str) -> bool {
    s.len() == 40 && s.as_bytes().iter().all(|b| b.is_ascii_hexdigit())
}

/// Turns a magnet link or bare info hash into the key TorrServer expects.
///
/// Anything unrecognised is passed through trimmed; TorrServer gets the final say.
pub fn extract_hash(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if trimmed
        .get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("magnet:"))
    {
        let lower = trimmed.to_ascii_lowercase();
        if let Some(start) = lower.find(BTIH_MARKER) {
            let candidate = lower[start + BTIH_MARKER.len()..]
                .get(..40)
                .filter(|c| is_hex_40(c));
            if let Some(hash) = candidate {
                return hash.to_string();
            }
        }
    }

    if is_hex_40(trimmed) {
        return trimmed.to_ascii_lowercase();
    }

    trimmed.to_string()
}

/// Parses a file index: decimal digits only, no sign, at most 2^53 - 1.
pub fn parse_index(input: &str) -> Option<u64> {
    let s = input.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u64>().ok().filter(|&n| n <= MAX_INDEX)
}
