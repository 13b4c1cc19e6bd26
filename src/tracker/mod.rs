mod request;
mod response;

use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::bencoding::Parser;
use crate::core::{PeerId, Sha1};
use crate::event::Event;

pub use request::*;
pub use response::*;

/// `left` announced while the descriptor of a magnet link is not known yet
pub const UNKNOWN_LEFT: u64 = 16384;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const STOPPED_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Transfer totals reported on each announce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub completed: bool,
}

/// HTTP announce client. Trackers are tried in order until one answers.
pub struct TrackerClient {
    http: reqwest::Client,
    trackers: Vec<Url>,
    info_hash: Sha1,
    peer_id: PeerId,
    port: u16,
    tracker_id: Option<String>,
}

impl TrackerClient {
    pub fn new(trackers: Vec<Url>, info_hash: Sha1, peer_id: PeerId, port: u16) -> Self {
        let trackers = trackers
            .into_iter()
            .filter(|tracker| match tracker.scheme() {
                "http" | "https" => true,
                scheme => {
                    debug!("skipping {} tracker {}", scheme, tracker);
                    false
                }
            })
            .collect();
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            trackers,
            info_hash,
            peer_id,
            port,
            tracker_id: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub async fn announce(
        &mut self,
        event: Option<AnnounceEvent>,
        progress: &Progress,
    ) -> Result<TrackerResponse> {
        let request = TrackerRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: progress.uploaded,
            downloaded: progress.downloaded,
            left: progress.left,
            event,
            tracker_id: self.tracker_id.clone(),
        };
        let mut last_error = anyhow!("no http tracker");
        for tracker in &self.trackers {
            match get(&self.http, request.url(tracker)).await {
                Ok(response) => {
                    debug!(
                        "{} returned {} peers, interval {:?}",
                        tracker,
                        response.peers.len(),
                        response.interval
                    );
                    if response.tracker_id.is_some() {
                        self.tracker_id = response.tracker_id.clone();
                    }
                    return Ok(response);
                }
                Err(err) => {
                    warn!("announce to {} failed: {}", tracker, err);
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }
}

async fn get(http: &reqwest::Client, url: Url) -> Result<TrackerResponse> {
    let mut response = http.get(url).send().await?;
    if !response.status().is_success() {
        return Err(anyhow!("server returned status {}", response.status()));
    }
    let value = {
        let mut parser = Parser::new();
        while let Some(chunk) = response.chunk().await? {
            parser.write_all(&chunk)?;
        }
        parser.result()?
    };
    TrackerResponse::try_from(value)
}

/// Announce task of one session: `started` first, then re-announces at the interval the tracker
/// asks for, `completed` once the download finishes and `stopped` on shutdown.
pub struct Tracker {
    progress: watch::Sender<Progress>,
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Tracker {
    pub fn spawn(client: TrackerClient, progress: Progress, events: Sender<Event>) -> Self {
        let (progress, progress_rx) = watch::channel(progress);
        let cancellation_token = CancellationToken::new();
        let handle = tokio::spawn(run(
            client,
            progress_rx,
            events,
            cancellation_token.clone(),
        ));
        Self {
            progress,
            cancellation_token,
            handle,
        }
    }

    /// Totals for the next announce. Does not trigger one.
    pub fn update_progress(&self, downloaded: u64, uploaded: u64, left: u64) {
        self.progress.send_if_modified(|progress| {
            progress.downloaded = downloaded;
            progress.uploaded = uploaded;
            progress.left = left;
            false
        });
    }

    /// Announces `completed` right away.
    pub fn completed(&self) {
        self.progress.send_modify(|progress| {
            progress.left = 0;
            progress.completed = true;
        });
    }

    pub async fn shutdown(self) -> Result<()> {
        self.cancellation_token.cancel();
        self.handle.await?;
        Ok(())
    }
}

async fn run(
    mut client: TrackerClient,
    mut progress: watch::Receiver<Progress>,
    events: Sender<Event>,
    cancellation_token: CancellationToken,
) {
    let mut event = Some(AnnounceEvent::Started);
    let mut announced = false;
    let mut completed_sent = false;
    let next_announce = sleep(Duration::ZERO);
    tokio::pin!(next_announce);

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => break,
            _ = &mut next_announce => {
                let snapshot = *progress.borrow();
                let result = tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    result = client.announce(event, &snapshot) => result,
                };
                let delay = match result {
                    Ok(response) => {
                        announced = true;
                        event = None;
                        discovered(&events, response.peers).await;
                        response.interval
                    }
                    Err(err) => {
                        warn!("announce failed, retrying in {:?}: {}", RETRY_INTERVAL, err);
                        RETRY_INTERVAL
                    }
                };
                next_announce.as_mut().reset(Instant::now() + delay);
            }
            Ok(()) = progress.changed(), if !completed_sent => {
                let snapshot = *progress.borrow_and_update();
                if !snapshot.completed {
                    continue;
                }
                completed_sent = true;
                info!("announcing completion");
                let result = tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    result = client.announce(Some(AnnounceEvent::Completed), &snapshot) => result,
                };
                match result {
                    Ok(response) => {
                        announced = true;
                        discovered(&events, response.peers).await;
                    }
                    Err(err) => warn!("completed announce failed: {}", err),
                }
            }
        }
    }

    if announced {
        let snapshot = *progress.borrow();
        match timeout(
            STOPPED_TIMEOUT,
            client.announce(Some(AnnounceEvent::Stopped), &snapshot),
        )
        .await
        {
            Ok(Ok(_)) => debug!("announced stop"),
            Ok(Err(err)) => warn!("stopped announce failed: {}", err),
            Err(_) => warn!("stopped announce timed out"),
        }
    }
}

async fn discovered(events: &Sender<Event>, peers: Vec<SocketAddr>) {
    if peers.is_empty() {
        return;
    }
    if events.send(Event::PeersDiscovered(peers)).await.is_err() {
        debug!("session closed, dropping tracker peers");
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::bencoding::Value;

    use super::*;

    fn compact_response(peers: &[u8]) -> ResponseTemplate {
        let body = Value::dictionary()
            .with_entry("interval", Value::Integer(1800))
            .with_entry("peers", Value::String(peers.to_vec()));
        ResponseTemplate::new(200).set_body_raw(body.to_bytes(), "text/plain")
    }

    fn client(trackers: Vec<Url>) -> TrackerClient {
        TrackerClient::new(trackers, Sha1([1; 20]), PeerId::random(), 6881)
    }

    #[tokio::test]
    async fn announce_to_first_working_tracker() {
        let _ = env_logger::try_init();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/announce"))
            .and(query_param("event", "started"))
            .and(query_param("compact", "1"))
            .and(query_param("left", "100"))
            .respond_with(compact_response(&[127, 0, 0, 1, 0x1a, 0xe1]))
            .expect(1)
            .mount(&server)
            .await;
        let mut client = client(vec![
            Url::parse("udp://tracker.example.com:80").unwrap(),
            Url::parse(&format!("{}/broken", server.uri())).unwrap(),
            Url::parse(&format!("{}/announce", server.uri())).unwrap(),
        ]);
        let progress = Progress {
            left: 100,
            ..Progress::default()
        };

        let response = client
            .announce(Some(AnnounceEvent::Started), &progress)
            .await
            .expect("failed to contact tracker");

        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(
            response.peers,
            vec!["127.0.0.1:6881".parse::<SocketAddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn udp_trackers_are_skipped() {
        let client = client(vec![Url::parse("udp://tracker.example.com:80").unwrap()]);

        assert!(client.is_empty());
    }

    #[tokio::test]
    async fn report_peers_then_announce_stop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/announce"))
            .and(query_param("event", "started"))
            .respond_with(compact_response(&[10, 0, 0, 1, 0x1a, 0xe1]))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/announce"))
            .and(query_param("event", "completed"))
            .respond_with(compact_response(&[]))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/announce"))
            .and(query_param("event", "stopped"))
            .respond_with(compact_response(&[]))
            .expect(1)
            .mount(&server)
            .await;
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let client = client(vec![
            Url::parse(&format!("{}/announce", server.uri())).unwrap(),
        ]);

        let tracker = Tracker::spawn(client, Progress::default(), events_tx);

        let event = events_rx.recv().await.expect("no peers reported");
        assert!(matches!(
            event,
            Event::PeersDiscovered(peers) if peers == vec!["10.0.0.1:6881".parse::<SocketAddr>().unwrap()]
        ));

        tracker.completed();
        // Wait for the completed announce to land before stopping
        for _ in 0..50 {
            let received = server.received_requests().await.unwrap_or_default();
            if received.len() == 2 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        tracker.shutdown().await.expect("tracker task failed");
    }
}
