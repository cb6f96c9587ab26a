//! Bandwidth sampling: stream a large file through a dialer and report
//! how many body bytes arrive per tick.

mod fetch;
mod range;

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use hyper::body::HttpBody;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::Result;

pub use fetch::Fetcher;
pub use range::{CONTENT_LENGTH, Range, calc_range, download_range};

pub const DOWNLOAD_LINK: &str = "https://download.microsoft.com/download/2/0/E/20E90413-712F-438C-988E-FDAA79A8AC3D/dotnetfx35.exe";
pub const CLOUDFLARE_LINK_100: &str = "https://speed.cloudflare.com/__down?bytes=100000000";
pub const CACHEFLY_10: &str = "http://cachefly.cachefly.net/10mb.test";
pub const CACHEFLY_100: &str = "http://cachefly.cachefly.net/100mb.test";

pub const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DownloadOption {
    pub url: String,
    /// Upper bound on the whole body transfer.
    pub download_timeout: Duration,
    pub handshake_timeout: Duration,
    pub ranges: Vec<Range>,
}

impl DownloadOption {
    pub fn new(timeout: Duration) -> Self {
        DownloadOption {
            url: DOWNLOAD_LINK.to_string(),
            download_timeout: timeout,
            handshake_timeout: timeout,
            ranges: Vec::new(),
        }
    }
}

/// Events on a sampler's result channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    /// The response head arrived; throughput is measured from here.
    Started(Instant),
    /// Bytes received during one tick.
    Tick(i64),
    /// Stream ended or the download window closed. Nothing follows.
    Finished,
}

/// Byte counter shared between readers and the tick loop.
#[derive(Debug, Default)]
pub struct Counter(AtomicI64);

impl Counter {
    pub fn add(&self, n: i64) -> i64 {
        self.0.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns the count and resets it.
    pub fn take(&self) -> i64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// `1536` -> `1.5KB/s`.
pub fn byte_count_iec(b: i64) -> String {
    const UNIT: i64 = 1024;
    if b < UNIT {
        return format!("{} B/s", b);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = b / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = b"KMGTPE"[exp] as char;
    format!("{:.1}{}B/s", b as f64 / div as f64, suffix)
}

pub fn byte_count_iec_trim(b: i64) -> String {
    let s = byte_count_iec(b);
    s.strip_suffix("/s").map(str::to_string).unwrap_or(s)
}

fn send(samples: &mpsc::UnboundedSender<Sample>, sample: Sample) {
    // the receiver may have given up; the sampler still finishes its window
    let _ = samples.send(sample);
}

/// Single-stream sampler. Emits one [`Sample::Tick`] per elapsed [`TICK`]
/// and returns the largest one.
pub async fn download(
    fetcher: &Fetcher,
    option: &DownloadOption,
    samples: &mpsc::UnboundedSender<Sample>,
) -> Result<i64> {
    let deadline = Instant::now() + option.download_timeout;
    let mut body = fetcher.get(&option.url, None).await?.into_body();
    let start = Instant::now();
    send(samples, Sample::Started(start));

    let counter = Counter::default();
    let mut prev = start;
    let mut max = 0i64;
    loop {
        let finished = match tokio::time::timeout_at(deadline, body.data()).await {
            Ok(Some(Ok(chunk))) => {
                counter.add(chunk.len() as i64);
                false
            }
            Ok(Some(Err(e))) => {
                log::debug!("[Download] body read failed: {}", e);
                true
            }
            Ok(None) | Err(_) => true,
        };
        let now = Instant::now();
        if finished || now.duration_since(prev) >= TICK {
            prev = now;
            let total = counter.take();
            send(samples, Sample::Tick(total));
            max = max.max(total);
        }
        if finished {
            break;
        }
    }
    send(samples, Sample::Finished);
    Ok(max)
}
