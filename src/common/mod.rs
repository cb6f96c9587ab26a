pub mod address;
pub mod codec;
pub mod crypto;
pub mod net;
pub mod pool;
pub mod rewind;

use std::future::Future;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};

pub use address::{Address, ConnType, Host, Metadata, Network};

/// Tolerant base64: url-safe alphabet, missing padding and stray whitespace are accepted.
pub fn decode_b64(s: &str) -> Option<Vec<u8>> {
    let cleaned: String = s
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect();
    let unpadded = cleaned.trim_end_matches('=');
    STANDARD_NO_PAD
        .decode(unpadded)
        .ok()
        .or_else(|| STANDARD.decode(&cleaned).ok())
}

/// Position of the first occurrence of `needle` in `haystack`.
pub fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub fn encode_b64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Retries `op` up to `attempts` times, doubling the delay from `base` after each failure.
pub async fn retry_with_backoff<T, E, F, Fut>(attempts: usize, base: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = base;
    let mut tries = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                tries += 1;
                if tries >= attempts.max(1) {
                    return Err(e);
                }
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn b64_variants() {
        assert_eq!(decode_b64("aGVsbG8=").unwrap(), b"hello");
        assert_eq!(decode_b64("aGVsbG8").unwrap(), b"hello");
        assert_eq!(decode_b64(" aGVs\nbG8= ").unwrap(), b"hello");
        assert_eq!(decode_b64("-_8").unwrap(), vec![0xfb, 0xff]);
        assert!(decode_b64("!!").is_none());
    }

    #[tokio::test]
    async fn backoff_stops_after_success() {
        let mut calls = 0;
        let r: Result<u32, &str> = retry_with_backoff(3, Duration::from_millis(1), || {
            calls += 1;
            let n = calls;
            async move { if n < 2 { Err("no") } else { Ok(n) } }
        })
        .await;
        assert_eq!(r, Ok(2));
        assert_eq!(calls, 2);
    }
}
