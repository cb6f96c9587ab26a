use std::sync::Arc;
use std::time::Duration;

use env_logger::Env;
use tokio_util::sync::CancellationToken;

use lite_rs::config::{Config, Mode};
use lite_rs::profile::{ProfileTest, StdoutWriter};
use lite_rs::proxy::Registry;
use lite_rs::tunnel::{Client, InboundServer, Proxy, Server};

#[tokio::main]
async fn main() {
    let path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".into());
    let config = match Config::load(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[Init] {}", e);
            std::process::exit(1);
        }
    };
    let level = config.log_level.clone().unwrap_or_else(|| "info".into());
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let registry = Arc::new(Registry::with_defaults());
    let result = match config.mode {
        Mode::Proxy => run_proxy(&config, registry).await,
        Mode::Test => run_test(&config, registry).await,
    };
    if let Err(e) = result {
        log::error!("[Init] {}", e);
        std::process::exit(1);
    }
}

async fn run_proxy(config: &Config, registry: Arc<Registry>) -> lite_rs::Result<()> {
    let dialer = registry.create(&config.proxy.link)?;
    log::info!(
        "[Init] upstream {} {}",
        dialer.protocol(),
        dialer.addr()
    );
    let client = Client::new(dialer, Duration::from_secs(config.proxy.dial_timeout));
    let inbound = InboundServer::bind(&config.proxy.listen).await?;
    let proxy = Arc::new(Proxy::new(vec![inbound as Arc<dyn Server>], client));

    let closer = proxy.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("[Init] shutting down");
        }
        closer.close();
    });
    proxy.run().await
}

async fn run_test(config: &Config, registry: Arc<Registry>) -> lite_rs::Result<()> {
    let links = config.test.links();
    let test = Arc::new(ProfileTest::new(
        registry,
        Arc::new(StdoutWriter::default()),
        config.test.options.clone(),
        links,
    ));
    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });
    let nodes = test.test_all(cancel).await?;
    for node in &nodes {
        log::info!(
            "[Profile] {:>3} {:<24} {:<12} ping {:>5}ms avg {} max {}",
            node.id,
            node.remarks,
            node.protocol,
            node.ping,
            lite_rs::download::byte_count_iec(node.avg_speed),
            lite_rs::download::byte_count_iec(node.max_speed)
        );
    }
    Ok(())
}
