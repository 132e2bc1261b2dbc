// # Shared helpers
//
// Small time and formatting utilities used across the routing core. All
// persisted timestamps are integer nanoseconds since UNIX_EPOCH.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in nanoseconds since UNIX_EPOCH.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Nanosecond timestamp difference as a `Duration`, clamped at zero.
pub fn ns_elapsed(since_ns: i64, now_ns: i64) -> Duration {
    if now_ns <= since_ns {
        Duration::ZERO
    } else {
        Duration::from_nanos((now_ns - since_ns) as u64)
    }
}

/// Seconds to nanoseconds, saturating.
pub fn secs_to_ns(secs: u64) -> i64 {
    (secs as i64).saturating_mul(1_000_000_000)
}

/// Abbreviated node hash for logs and display tags of untagged nodes.
pub fn short_hash(hash: &str) -> &str {
    if hash.len() >= 12 {
        &hash[..12]
    } else {
        hash
    }
}

/// Percent-decode a single path segment. Returns `None` on malformed
/// encoding so callers can treat the segment as non-matching.
pub fn percent_decode(segment: &str) -> Option<String> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = *bytes.get(i + 1)?;
            let lo = *bytes.get(i + 2)?;
            let s = std::str::from_utf8(&[hi, lo]).ok()?.to_owned();
            let v = u8::from_str_radix(&s, 16).ok()?;
            out.push(v);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ns_is_monotonic_enough() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
        assert!(a > 1_500_000_000_000_000_000); // after 2017
    }

    #[test]
    fn test_ns_elapsed_clamps() {
        assert_eq!(ns_elapsed(100, 50), Duration::ZERO);
        assert_eq!(ns_elapsed(50, 150), Duration::from_nanos(100));
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash("abcdef0123456789"), "abcdef012345");
        assert_eq!(short_hash("abc"), "abc");
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("plain").as_deref(), Some("plain"));
        assert_eq!(percent_decode("a%20b").as_deref(), Some("a b"));
        assert_eq!(percent_decode("tok%3Aen").as_deref(), Some("tok:en"));
        assert_eq!(percent_decode("bad%zz"), None);
        assert_eq!(percent_decode("trunc%2"), None);
    }
}
