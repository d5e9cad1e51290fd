//! Heartbeat client run by CLIENT and HYBRID nodes: registers with the
//! master once at startup (retrying on a fixed delay), then sends a
//! `Heartbeat` on a fixed interval, retrying within the same tick with
//! exponential backoff and jitter before declaring the master disconnected.
//!
//! Grounded on the teacher's `HeartbeatClient::run`/`send_heartbeat` loop
//! shape (`tokio::select!` between an interval tick and shutdown, with a
//! consecutive-failure counter); the within-tick retry budget and
//! connect/disconnect edge tracking are new, since the teacher always waits
//! for the next fixed tick rather than retrying immediately.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::types::Heartbeat;
use crate::node::info::build_node_info;
use crate::node::NodeShared;

const REGISTRATION_BASE_DELAY: Duration = Duration::from_secs(5);
const REGISTRATION_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub max_backoff: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_retries: 5,
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("no master address configured")]
    NoMaster,
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("master rejected request: {status} {body}")]
    Rejected { status: u16, body: String },
}

/// Register this node with the master. Retries on a 5 s delay up to
/// `REGISTRATION_MAX_RETRIES` times; exhausting the budget logs an error
/// and gives up, but never fails the caller: the heartbeat loop still
/// starts and a well-formed master may accept it via on-demand
/// registration on the first heartbeat.
pub async fn register_once(shared: &NodeShared) {
    let Some(master) = shared.master_address.clone() else {
        error!("registration subsystem started without a master address");
        return;
    };

    let info = build_node_info(shared).await;
    let url = format!("{master}/api/master/nodes/register");

    for attempt in 0..=REGISTRATION_MAX_RETRIES {
        match try_register(&shared.http_client, &url, &info, shared.heartbeat_settings.request_timeout).await {
            Ok(()) => {
                info!(node_id = %shared.id, master, "registered with master");
                return;
            }
            Err(e) => {
                warn!(node_id = %shared.id, attempt, error = %e, "registration attempt failed");
                if attempt < REGISTRATION_MAX_RETRIES {
                    tokio::time::sleep(REGISTRATION_BASE_DELAY).await;
                }
            }
        }
    }
    error!(node_id = %shared.id, "registration abandoned after exhausting retry budget");
}

async fn try_register(
    client: &reqwest::Client,
    url: &str,
    info: &crate::cluster::types::NodeInfo,
    request_timeout: Duration,
) -> Result<(), HeartbeatError> {
    let response = client.post(url).json(info).timeout(request_timeout).send().await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(HeartbeatError::Rejected { status, body });
    }
    Ok(())
}

/// Background loop: on each fixed tick, send a `Heartbeat`, retrying within
/// the same tick (exponential backoff, capped, jittered) up to
/// `max_retries` before treating the master as disconnected for this tick.
pub async fn run_heartbeat_loop(shared: Arc<NodeShared>, mut shutdown: watch::Receiver<bool>) {
    let Some(master) = shared.master_address.clone() else {
        error!("heartbeat subsystem started without a master address");
        return;
    };

    let client = Client::new();
    let url = format!("{master}/api/master/heartbeat");
    let settings = shared.heartbeat_settings;
    let mut ticker = tokio::time::interval(settings.interval);
    let mut sequence: u64 = 0;
    let mut connected = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("heartbeat loop shutting down");
                    return;
                }
                continue;
            }
        }

        sequence += 1;
        let mut last_error = None;
        let mut attempt = 0u32;

        loop {
            match send_heartbeat(&client, &url, &shared, sequence, settings.request_timeout).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    attempt += 1;
                    last_error = Some(e);
                    if attempt > settings.max_retries {
                        break;
                    }
                    let delay = backoff_delay(attempt, settings);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        }

        match last_error {
            None => {
                if !connected {
                    info!(node_id = %shared.id, "master connection established");
                }
                connected = true;
                debug!(node_id = %shared.id, sequence, "heartbeat sent");
            }
            Some(e) => {
                if connected {
                    warn!(node_id = %shared.id, error = %e, "master connection lost");
                }
                connected = false;
                error!(node_id = %shared.id, attempts = attempt, error = %e, "heartbeat failed after retry budget");
            }
        }
    }
}

async fn send_heartbeat(
    client: &Client,
    url: &str,
    shared: &NodeShared,
    sequence: u64,
    request_timeout: Duration,
) -> Result<(), HeartbeatError> {
    let resources = shared.resource_monitor.snapshot().await;
    let heartbeat = Heartbeat {
        node_id: shared.id.clone(),
        timestamp: chrono::Utc::now(),
        status: *shared.status.read().await,
        resources: Some(resources),
        sequence,
    };

    let response = client.post(url).json(&heartbeat).timeout(request_timeout).send().await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(HeartbeatError::Rejected { status, body });
    }
    Ok(())
}

/// `2^(attempt-1)` seconds, capped at `max_backoff`, with +/-25% jitter.
/// `attempt` is 1-based (the first retry after an initial failure).
fn backoff_delay(attempt: u32, settings: HeartbeatSettings) -> Duration {
    let exponent = attempt.clamp(1, 30);
    let base = Duration::from_secs(1u64.checked_shl(exponent - 1).unwrap_or(u64::MAX)).min(settings.max_backoff);

    let jitter_fraction = rand::thread_rng().gen_range(-0.25..=0.25);
    let jittered_millis = (base.as_millis() as f64) * (1.0 + jitter_fraction);
    Duration::from_millis(jittered_millis.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let settings = HeartbeatSettings::default();
        let delay = backoff_delay(10, settings);
        assert!(delay <= settings.max_backoff + Duration::from_millis(1));
    }

    #[test]
    fn backoff_stays_within_jitter_band() {
        let settings = HeartbeatSettings::default();
        for attempt in 1..6 {
            let delay = backoff_delay(attempt, settings);
            let base_secs = 1u64 << (attempt - 1);
            let base = Duration::from_secs(base_secs).min(settings.max_backoff);
            let lower = base.mul_f64(0.74);
            let upper = base.mul_f64(1.26);
            assert!(delay >= lower && delay <= upper, "attempt {attempt}: {delay:?} not in [{lower:?}, {upper:?}]");
        }
    }

    #[test]
    fn defaults_match_five_second_interval() {
        let settings = HeartbeatSettings::default();
        assert_eq!(settings.interval, Duration::from_secs(5));
        assert_eq!(settings.max_retries, 5);
    }
}
