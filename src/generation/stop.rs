//! Stop-sequence matching and streaming hold-back on raw output bytes.

/// Earliest full stop-sequence match that could involve the newest token.
///
/// Only the tail of `text` is searched: a match must overlap the last
/// `last_token_len` bytes, so earlier text was already checked. Returns
/// `(byte offset, index into stops)`.
pub fn find_stop_string(text: &[u8], stops: &[String], last_token_len: usize) -> Option<(usize, usize)> {
    stops
        .iter()
        .enumerate()
        .filter_map(|(i, stop)| {
            let stop = stop.as_bytes();
            let from = text.len().saturating_sub(stop.len() + last_token_len);
            find_bytes(&text[from..], stop).map(|pos| (from + pos, i))
        })
        .min_by_key(|(pos, _)| *pos)
}

/// Start of the earliest suffix of `text` that is a proper prefix of some stop
/// sequence. Text from there on must not be streamed yet.
pub fn find_partial_stop(text: &[u8], stops: &[String]) -> Option<usize> {
    stops
        .iter()
        .filter_map(|stop| {
            let stop = stop.as_bytes();
            let longest = (stop.len().saturating_sub(1)).min(text.len());
            (1..=longest)
                .rev()
                .find(|&k| text.ends_with(&stop[..k]))
                .map(|k| text.len() - k)
        })
        .min()
}

/// Number of trailing bytes forming an unfinished UTF-8 sequence (0 if complete).
pub fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for i in 1..=bytes.len().min(4) {
        let b = bytes[bytes.len() - i];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = if b & 0xE0 == 0xC0 {
            2
        } else if b & 0xF0 == 0xE0 {
            3
        } else if b & 0xF8 == 0xF0 {
            4
        } else {
            1
        };
        return if needed > i { i } else { 0 };
    }
    0
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stops(s: &[&str]) -> Vec<String> {
        s.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_full_match_across_tokens() {
        // "EN" arrived as "E" then "ND"
        let text = b"hello END";
        assert_eq!(find_stop_string(text, &stops(&["END"]), 2), Some((6, 0)));
    }

    #[test]
    fn test_full_match_ignores_old_text() {
        let text = b"END and more text";
        assert_eq!(find_stop_string(text, &stops(&["END"]), 1), None);
    }

    #[test]
    fn test_earliest_stop_wins() {
        let text = b"a</s>b";
        let s = stops(&["b", "</s>"]);
        assert_eq!(find_stop_string(text, &s, 6), Some((1, 1)));
    }

    #[test]
    fn test_partial_stop() {
        let s = stops(&["###"]);
        assert_eq!(find_partial_stop(b"abc##", &s), Some(3));
        assert_eq!(find_partial_stop(b"abc", &s), None);
        assert_eq!(find_partial_stop(b"abc#", &s), Some(3));
    }

    #[test]
    fn test_incomplete_utf8() {
        let e_acute = "é".as_bytes();
        assert_eq!(incomplete_utf8_tail(&e_acute[..1]), 1);
        assert_eq!(incomplete_utf8_tail(e_acute), 0);
        let emoji = "😀".as_bytes();
        assert_eq!(incomplete_utf8_tail(&emoji[..3]), 3);
        assert_eq!(incomplete_utf8_tail(b"plain"), 0);
    }
}
