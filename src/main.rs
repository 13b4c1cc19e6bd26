use std::time::Duration;

use log::{error, info, warn};
use size::Size;

use tordl::engine::{Config, Engine};
use tordl::session::{SessionState, SessionStatus};
use tordl::torrent::DescriptorSource;

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

fn log_status(status: &SessionStatus) {
    let name = status
        .name
        .clone()
        .unwrap_or_else(|| status.info_hash.to_hex());
    match status.state {
        SessionState::MetadataPending => info!("{}: fetching metadata ({} peers)", name, status.peers),
        SessionState::Downloading => info!(
            "{}: {:.1}% of {}, down {} up {}, eta {}, {} peers ({} seeds)",
            name,
            status.progress(),
            Size::from_bytes(status.total_bytes.unwrap_or(0)),
            status.download_rate,
            status.upload_rate,
            status.eta(),
            status.peers,
            status.seeds
        ),
        SessionState::Seeding => info!("{}: completed, up {}", name, status.upload_rate),
        SessionState::Stopped => match &status.last_error {
            Some(err) => warn!("{}: stopped: {}", name, err),
            None => info!("{}: stopped", name),
        },
    }
}

fn is_done(status: &SessionStatus) -> bool {
    matches!(status.state, SessionState::Seeding | SessionState::Stopped)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    // Magnet links or torrent paths, as separate or comma separated arguments
    let sources: Vec<String> = std::env::args()
        .skip(1)
        .flat_map(|arg| {
            arg.split(',')
                .map(str::trim)
                .filter(|source| !source.is_empty())
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .collect();
    if sources.is_empty() {
        warn!("no torrents provided. usage: tordl <magnet link or .torrent path>...");
        return Ok(());
    }

    let config = Config::from_env();
    let download_path = config.download_path.clone();
    let engine = Engine::start(config).await?;

    let mut added = 0;
    for source in &sources {
        let result = match DescriptorSource::parse(source) {
            Ok(source) => engine.add_torrent(source).await.map_err(anyhow::Error::from),
            Err(err) => Err(err),
        };
        match result {
            Ok(handle) => {
                info!("added {}", handle.info_hash());
                added += 1;
            }
            Err(err) => error!("failed to add {}: {}", source, err),
        }
    }
    if added == 0 {
        error!("no valid torrents to download");
        engine.shutdown().await;
        return Ok(());
    }

    let mut ticks = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = ticks.tick() => {
                let statuses = engine.status();
                statuses.iter().for_each(log_status);
                if statuses.iter().all(is_done) {
                    info!("all torrents processed");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, stopping...");
                break;
            }
        }
    }

    engine.shutdown().await;
    info!("saved at {}", download_path.display());
    Ok(())
}
