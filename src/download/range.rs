use std::sync::OnceLock;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use hyper::body::HttpBody;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use super::fetch::hyper_error;
use super::{Counter, DownloadOption, Fetcher, Sample, TICK, send};
use crate::error::{Error, Result};

/// Size of the file behind [`DOWNLOAD_LINK`](super::DOWNLOAD_LINK).
pub const CONTENT_LENGTH: i64 = 242_743_296;

const PART_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub url: String,
    pub from: i64,
    pub to: i64,
}

impl Range {
    /// `bytes=from-to`, or the open-ended `bytes=from-` for the last part.
    pub fn header(&self, content_length: i64) -> String {
        if self.to != content_length {
            format!("bytes={}-{}", self.from, self.to)
        } else {
            format!("bytes={}-", self.from)
        }
    }
}

/// Splits `len` bytes into `part` contiguous ranges. The last one runs to the end.
pub fn calc_range(part: i64, len: i64, url: &str) -> Vec<Range> {
    let part = part.max(1);
    let size = len / part;
    (0..part)
        .map(|j| Range {
            url: url.to_string(),
            from: size * j,
            to: if j < part - 1 { size * (j + 1) - 1 } else { len },
        })
        .collect()
}

async fn fetch_part(
    fetcher: &Fetcher,
    url: &str,
    range: &Range,
    counter: &Counter,
    started: &OnceLock<Instant>,
) -> Result<()> {
    let mut body = fetcher
        .get(url, Some(&range.header(CONTENT_LENGTH)))
        .await?
        .into_body();
    started.get_or_init(Instant::now);
    while let Some(chunk) = body.data().await {
        counter.add(chunk.map_err(hyper_error)?.len() as i64);
    }
    Ok(())
}

/// Parallel sampler: one ranged GET per entry of `option.ranges`, all
/// feeding one counter. Partitions are polled every 100ms and summed into
/// one sample per [`TICK`]. A failing partition leaves the others running.
/// Returns the largest aggregate tick and the first error seen.
pub async fn download_range(
    fetcher: &Fetcher,
    option: &DownloadOption,
    samples: &mpsc::UnboundedSender<Sample>,
) -> (i64, Option<Error>) {
    let counter = Counter::default();
    let started = OnceLock::new();
    let mut parts: FuturesUnordered<_> = option
        .ranges
        .iter()
        .map(|range| fetch_part(fetcher, &option.url, range, &counter, &started))
        .collect();

    let deadline = tokio::time::sleep(option.download_timeout);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(PART_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut first_err = None;
    let mut prev: Option<Instant> = None;
    let mut sum = 0i64;
    let mut max = 0i64;
    loop {
        tokio::select! {
            part = parts.next() => match part {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    log::debug!("[Download] range part failed: {}", e);
                    first_err.get_or_insert(e);
                }
                None => break,
            },
            _ = ticker.tick() => {
                let last = match prev {
                    Some(last) => last,
                    None => match started.get() {
                        Some(&start) => {
                            send(samples, Sample::Started(start));
                            prev = Some(start);
                            start
                        }
                        None => continue,
                    },
                };
                sum += counter.take();
                let now = Instant::now();
                if now.duration_since(last) >= TICK {
                    prev = Some(now);
                    send(samples, Sample::Tick(sum));
                    max = max.max(sum);
                    sum = 0;
                }
            }
            _ = &mut deadline => break,
        }
    }
    drop(parts);

    if let Some(start) = started.get().copied() {
        if prev.is_none() {
            send(samples, Sample::Started(start));
        }
        sum += counter.take();
        send(samples, Sample::Tick(sum));
        max = max.max(sum);
    }
    send(samples, Sample::Finished);
    (max, first_err)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::download::testing::RateDialer;
    use crate::proxy::TlsSessionCache;

    #[test]
    fn ranges_cover_the_file() {
        let ranges = calc_range(3, 300, "u");
        assert_eq!(
            ranges.iter().map(|r| (r.from, r.to)).collect::<Vec<_>>(),
            vec![(0, 99), (100, 199), (200, 300)]
        );
        assert_eq!(ranges[0].header(300), "bytes=0-99");
        assert_eq!(ranges[2].header(300), "bytes=200-");
        assert_eq!(calc_range(0, 10, "u").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sums_parts_and_survives_a_failure() {
        let dialer = Arc::new(RateDialer::with_failure(
            5_000,
            30,
            Duration::from_millis(100),
            Some(1),
        ));
        let fetcher = Fetcher::new(dialer.clone(), &TlsSessionCache::default(), Duration::from_secs(5));
        let mut option = DownloadOption::new(Duration::from_secs(30));
        option.url = "http://speed.test/file".into();
        option.ranges = calc_range(3, CONTENT_LENGTH, &option.url);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (max, err) = download_range(&fetcher, &option, &tx).await;
        assert!(matches!(err, Some(Error::Protocol(_))));
        // two healthy parts at 50_000 B/s each
        assert!((80_000..=120_000).contains(&max), "max {}", max);

        let mut total = 0;
        while let Ok(sample) = rx.try_recv() {
            if let Sample::Tick(n) = sample {
                total += n;
            }
        }
        assert_eq!(total, 2 * 30 * 5_000);
        let mut seen = dialer.ranges.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|r| r.starts_with("bytes=")));
    }
}
