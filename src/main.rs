use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vpu_bus::device::VpuDevice;

mod config;
mod feed;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("vpu_bus", log::LevelFilter::Debug)
        .filter_module("vpu_enc", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::config();
    let device = VpuDevice::new(config.device());
    log::info!("{}: {} session(s)", device, config.sessions().len());

    let cancel = CancellationToken::new();
    let mut jobs = tokio::task::JoinSet::new();
    for job in config.sessions() {
        let feeder = Arc::new(feed::Feeder::new(job.clone(), cancel.child_token()));
        let device = device.clone();
        jobs.spawn(async move {
            let result = feeder.run(&device).await;
            (feeder.id().to_string(), result)
        });
    }

    let mut failed = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
            joined = jobs.join_next() => match joined {
                Some(Ok((id, Ok(stats)))) => {
                    let stats = serde_json::to_string(&stats).unwrap_or_default();
                    log::info!("session {} finished: {}", id, stats);
                }
                Some(Ok((id, Err(e)))) => {
                    log::error!("session {} failed: {:#}", id, e);
                    failed = true;
                }
                Some(Err(e)) => {
                    log::error!("session task panicked: {}", e);
                    failed = true;
                }
                None => break,
            },
        }
    }

    std::process::exit(if failed { 1 } else { 0 });
}
