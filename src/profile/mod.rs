//! Batch benchmark: ping and speed-test many links under a concurrency
//! limit, streaming progress events and collecting one [`Node`] per link.

pub mod message;
pub mod node;
pub mod options;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::download::{self, Counter, DOWNLOAD_LINK, DownloadOption, Fetcher, Sample, byte_count_iec};
use crate::error::{Error, Result};
use crate::proxy::Registry;
use crate::proxy::link::link_info;
use crate::request::{self, PingOption};

pub use message::{ChannelWriter, EmptyWriter, Message, MessageWriter, StdoutWriter};
pub use node::{Node, sort_nodes};
pub use options::{OutputMode, ProfileTestOptions, SortMethod};

/// `1h 2m 3s`, or `2m 3s` under an hour.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else {
        format!("{}m {}s", m, s)
    }
}

/// Size of each `gotservers` batch.
fn servers_step(count: usize) -> usize {
    if count > 200 { (count / 20).min(50) } else { 9 }
}

/// Runs `task(0..count)` with at most `limit` in flight. A permit is taken
/// before a task starts and released when it finishes. Once `cancel`
/// fires no further task starts; running ones are awaited.
pub async fn run_guarded<F, Fut>(count: usize, limit: usize, cancel: &CancellationToken, mut task: F)
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let guard = Arc::new(Semaphore::new(limit.max(1)));
    let mut running = JoinSet::new();
    for i in 0..count {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = guard.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let fut = task(i);
        running.spawn(async move {
            fut.await;
            drop(permit);
        });
    }
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            log::error!("[Profile] test task failed: {}", e);
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonOutput<'a> {
    nodes: &'a [Node],
    options: &'a ProfileTestOptions,
    traffic: i64,
    duration: &'a str,
    success_count: usize,
    links_count: usize,
}

enum PingOutcome {
    Proceed(i64),
    Stop(i64),
}

#[derive(Default)]
struct SpeedStats {
    sum: i64,
    avg: i64,
    max: i64,
}

/// One benchmark batch.
pub struct ProfileTest {
    registry: Arc<Registry>,
    writer: Arc<dyn MessageWriter>,
    options: ProfileTestOptions,
    links: Vec<String>,
    ping_option: PingOption,
    download_url: String,
    output_dir: PathBuf,
    traffic: Counter,
}

impl ProfileTest {
    pub fn new(
        registry: Arc<Registry>,
        writer: Arc<dyn MessageWriter>,
        options: ProfileTestOptions,
        links: Vec<String>,
    ) -> Self {
        ProfileTest {
            registry,
            writer,
            options,
            links,
            ping_option: PingOption::default(),
            download_url: DOWNLOAD_LINK.to_string(),
            output_dir: PathBuf::from("."),
            traffic: Counter::default(),
        }
    }

    pub fn with_ping_option(mut self, ping_option: PingOption) -> Self {
        self.ping_option = ping_option;
        self
    }

    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = url.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn options(&self) -> &ProfileTestOptions {
        &self.options
    }

    /// Body bytes downloaded so far across the batch.
    pub fn traffic(&self) -> i64 {
        self.traffic.value()
    }

    fn write(&self, msg: &Message) {
        self.write_raw(&msg.to_bytes());
    }

    fn write_raw(&self, data: &[u8]) {
        if let Err(e) = self.writer.write_message(data) {
            log::debug!("[Profile] progress sink: {}", e);
        }
    }

    /// Tests every link and returns the nodes in the configured order.
    pub async fn test_all(self: &Arc<Self>, cancel: CancellationToken) -> Result<Vec<Node>> {
        let links_count = self.links.len();
        if links_count == 0 {
            self.write_raw(message::SPEEDTEST_ERROR_NONODES.as_bytes());
            return Err(Error::Config("no profile found".into()));
        }
        let start = Instant::now();
        self.write(&Message::new(-1, "started"));
        let step = servers_step(links_count);
        for (chunk, links) in self.links.chunks(step).enumerate() {
            self.write(&Message::gotservers(
                chunk * step,
                links,
                &self.options.group_name,
            ));
        }

        let (node_tx, mut node_rx) = mpsc::unbounded_channel();
        let retest = !self.options.test_ids.is_empty() && !self.options.links.is_empty();
        run_guarded(links_count, self.options.concurrency(), &cancel, |i| {
            let this = self.clone();
            let node_tx = node_tx.clone();
            let cancel = cancel.clone();
            async move {
                let (id, link) = match (retest, this.options.test_ids.get(i), this.options.links.get(i)) {
                    (true, Some(id), Some(link)) => (*id, link.clone()),
                    _ => (i, this.links[i].clone()),
                };
                let node = this.test_one(id, &link, &cancel).await;
                let _ = node_tx.send(node);
                this.write(&Message::new(id as i64, "endone"));
            }
        })
        .await;
        drop(node_tx);

        let duration = format_duration(start.elapsed());
        self.write(&Message::eof(&duration));

        let mut nodes = Vec::with_capacity(links_count);
        while let Some(node) = node_rx.recv().await {
            nodes.push(node);
        }
        nodes.sort_by_key(|n| n.id);
        let traffic: i64 = nodes.iter().map(|n| n.traffic).sum();
        let success_count = nodes.iter().filter(|n| n.is_ok).count();
        log::info!(
            "[Profile] {} of {} nodes ok, traffic {}, took {}",
            success_count,
            links_count,
            download::byte_count_iec_trim(traffic),
            duration
        );

        sort_nodes(&mut nodes, self.options.sort());
        match self.options.output() {
            OutputMode::PicNone => {}
            OutputMode::Json => {
                self.save_json(&nodes, traffic, &duration, success_count, links_count)
                    .await?
            }
            OutputMode::Text => self.save_text(&nodes).await?,
            OutputMode::PicBase64 | OutputMode::PicPath => {
                log::warn!("[Profile] picture output is not available, skipping");
            }
        }
        Ok(nodes)
    }

    async fn save_json(
        &self,
        nodes: &[Node],
        traffic: i64,
        duration: &str,
        success_count: usize,
        links_count: usize,
    ) -> Result<()> {
        let output = JsonOutput {
            nodes,
            options: &self.options,
            traffic,
            duration,
            success_count,
            links_count,
        };
        let data = serde_json::to_vec_pretty(&output)
            .map_err(|e| Error::Config(format!("encode output: {}", e)))?;
        tokio::fs::write(self.output_dir.join("output.json"), data).await?;
        Ok(())
    }

    /// Links of nodes that answered at all.
    async fn save_text(&self, nodes: &[Node]) -> Result<()> {
        let links: Vec<&str> = nodes
            .iter()
            .filter(|n| n.ping != 0 || n.avg_speed > 0 || n.max_speed > 0)
            .map(|n| n.link.as_str())
            .collect();
        tokio::fs::write(self.output_dir.join("output.txt"), links.join("\n")).await?;
        Ok(())
    }

    async fn test_one(&self, id: usize, link: &str, cancel: &CancellationToken) -> Node {
        let link = link.split('^').next().unwrap_or(link);
        let mut node = Node {
            id,
            group: self.options.group_name.clone(),
            remarks: format!("Profile {}", id),
            link: link.to_string(),
            ..Default::default()
        };
        match link_info(link) {
            Ok(info) => {
                if !info.remarks.is_empty() {
                    node.remarks = info.remarks;
                }
                node.protocol = message::protocol_label(&info.protocol, &info.net);
            }
            Err(e) => {
                log::warn!("[Profile] {} {}: {}", id, link, e);
                self.write(&Message::gotspeed(id as i64, -1, -1, 0));
                return node;
            }
        }

        let ping = match self.ping_link(id, link).await {
            PingOutcome::Proceed(ping) => ping,
            PingOutcome::Stop(ping) => {
                log::info!("[Profile] {} {} elapse: {}ms", id, node.remarks, ping);
                node.ping = ping;
                node.is_ok = ping > 0;
                return node;
            }
        };
        log::info!("[Profile] {} {} elapse: {}ms", id, node.remarks, ping);
        node.ping = ping;

        self.write(&Message::new(id as i64, "startspeed"));
        let stats = self.speed_test(id, link, &node.remarks, cancel).await;
        if stats.max < 1 {
            self.write(&Message::gotspeed(id as i64, -1, -1, 0));
        }
        node.avg_speed = stats.avg;
        node.max_speed = stats.max;
        node.traffic = stats.sum;
        node.is_ok = ping > 0 || stats.max > 0;
        node
    }

    async fn ping_link(&self, id: usize, link: &str) -> PingOutcome {
        if self.options.speed_only() {
            return PingOutcome::Proceed(0);
        }
        self.write(&Message::new(id as i64, "startping"));
        let elapse = match request::ping_link(&self.registry, link, self.ping_option).await {
            Ok(elapse) => elapse,
            Err(e) => {
                log::debug!("[Profile] {} ping failed: {}", id, e);
                0
            }
        };
        self.write(&Message::gotping(id as i64, elapse));
        if elapse < 1 {
            self.write(&Message::gotspeed(id as i64, -1, -1, 0));
            return PingOutcome::Stop(0);
        }
        if self.options.ping_only() {
            self.write(&Message::gotspeed(id as i64, -1, -1, 0));
            return PingOutcome::Stop(elapse);
        }
        PingOutcome::Proceed(elapse)
    }

    async fn speed_test(&self, id: usize, link: &str, remarks: &str, cancel: &CancellationToken) -> SpeedStats {
        let mut stats = SpeedStats::default();
        let dialer = match self.registry.create(link) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("[Profile] {} {}: {}", id, remarks, e);
                return stats;
            }
        };
        let fetcher = Fetcher::new(dialer, self.registry.sessions(), self.options.timeout);
        let option = DownloadOption {
            url: self.download_url.clone(),
            ..DownloadOption::new(self.options.timeout)
        };
        {
            let (tx, mut rx) = mpsc::unbounded_channel();

            let sample = async {
                let result = download::download(&fetcher, &option, &tx).await;
                drop(tx);
                if let Err(e) = result {
                    log::debug!("[Profile] {} download failed: {}", id, e);
                }
            };
            let consume = async {
                let mut start = Instant::now();
                while let Some(sample) = rx.recv().await {
                    match sample {
                        Sample::Started(at) => start = at,
                        Sample::Tick(speed) => {
                            stats.sum += speed;
                            let elapsed = start.elapsed().as_secs_f64();
                            stats.avg = if elapsed > 0.0 {
                                (stats.sum as f64 / elapsed) as i64
                            } else {
                                stats.sum
                            };
                            stats.max = stats.max.max(speed);
                            self.traffic.add(speed);
                            log::info!("[Profile] {} {} recv: {}", id, remarks, byte_count_iec(speed));
                            self.write(&Message::gotspeed(id as i64, stats.avg, stats.max, speed));
                        }
                        Sample::Finished => break,
                    }
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => log::info!("[Profile] index {} done!", id),
                _ = async { tokio::join!(sample, consume) } => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn durations() {
        assert_eq!(format_duration(Duration::from_secs(59)), "0m 59s");
        assert_eq!(format_duration(Duration::from_secs(3 * 3600 + 62)), "3h 1m 2s");
    }

    #[test]
    fn server_batches() {
        assert_eq!(servers_step(5), 9);
        assert_eq!(servers_step(200), 9);
        assert_eq!(servers_step(400), 20);
        assert_eq!(servers_step(5000), 50);
    }

    #[tokio::test]
    async fn guard_bounds_in_flight_tasks() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        run_guarded(12, 3, &cancel, |_| {
            let (in_flight, peak, done) = (in_flight.clone(), peak.clone(), done.clone());
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
        assert_eq!(done.load(Ordering::SeqCst), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn cancelled_batch_skips_queued_tasks() {
        let started = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();
        run_guarded(5, 1, &cancel, |_| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_batch_reports_nonodes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let test = Arc::new(ProfileTest::new(
            Arc::new(Registry::with_defaults()),
            Arc::new(ChannelWriter(tx)),
            ProfileTestOptions::default(),
            Vec::new(),
        ));
        assert!(test.test_all(CancellationToken::new()).await.is_err());
        assert_eq!(rx.recv().await.unwrap(), message::SPEEDTEST_ERROR_NONODES.as_bytes());
    }
}
