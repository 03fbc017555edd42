//! Recovery probes
//!
//! Probing runs in its own task, fed by a bounded channel, so a dead
//! upstream with a slow timeout never blocks request serving. The probe task
//! replays a sanitized copy of the request that failed; a response outside
//! the route's retryable status codes counts as recovery and is reported
//! back over a second channel to the receiver task, which flips the registry
//! flag. Failed probes are silent.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::HealthRegistry;

/// Probe request timeout; probes race nobody, they just need to finish.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Channel depth. Dispatch is throttled per target, so this only needs to
/// absorb short bursts.
const PROBE_QUEUE: usize = 64;

/// A request to probe one upstream target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub target: String,
    pub retryable_status_codes: Vec<u16>,
    pub request_data: ProbeRequestData,
}

/// The sanitized request the probe replays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequestData {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Message posted back when a probe succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProbeOutcome {
    Recovered { target: String },
}

/// Handle held by the proxy state; dropping it releases the probe tasks.
#[derive(Clone)]
pub struct ProbeHandle {
    tx: mpsc::Sender<ProbeRequest>,
}

impl ProbeHandle {
    /// Enqueue a probe. Never blocks request serving: a full queue drops the
    /// probe (another will be dispatched after the throttle window).
    pub fn dispatch(&self, request: ProbeRequest) {
        if let Err(e) = self.tx.try_send(request) {
            tracing::debug!(error = %e, "probe queue full, dropping probe");
        }
    }
}

/// Spawn the probe worker and recovery receiver for this worker process.
pub fn spawn(registry: Arc<HealthRegistry>) -> ProbeHandle {
    let (request_tx, mut request_rx) = mpsc::channel::<ProbeRequest>(PROBE_QUEUE);
    let (outcome_tx, mut outcome_rx) = mpsc::channel::<ProbeOutcome>(PROBE_QUEUE);

    // Probe worker: issues probe requests, posts recoveries.
    tokio::spawn(async move {
        let client = match reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(error = %e, "failed to build probe client");
                return;
            }
        };

        while let Some(probe) = request_rx.recv().await {
            if let Some(outcome) = run_probe(&client, &probe).await {
                if outcome_tx.send(outcome).await.is_err() {
                    break;
                }
            }
        }
        tracing::debug!("probe worker released");
    });

    // Recovery receiver: applies outcomes to the registry.
    tokio::spawn(async move {
        while let Some(outcome) = outcome_rx.recv().await {
            match outcome {
                ProbeOutcome::Recovered { target } => registry.mark_recovered(&target),
            }
        }
    });

    ProbeHandle { tx: request_tx }
}

async fn run_probe(client: &reqwest::Client, probe: &ProbeRequest) -> Option<ProbeOutcome> {
    let method: reqwest::Method = probe.request_data.method.parse().ok()?;
    let mut request = client.request(method, &probe.request_data.url);

    for (name, value) in &probe.request_data.headers {
        request = request.header(name, value);
    }
    if let Some(body) = &probe.request_data.body {
        request = request.body(body.clone());
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            if probe.retryable_status_codes.contains(&status) {
                tracing::debug!(target = %probe.target, status, "probe still failing");
                None
            } else {
                Some(ProbeOutcome::Recovered {
                    target: probe.target.clone(),
                })
            }
        }
        Err(e) => {
            tracing::debug!(target = %probe.target, error = %e, "probe transport error");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_wire_format() {
        let outcome = ProbeOutcome::Recovered {
            target: "http://a.example.com".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "status": "recovered", "target": "http://a.example.com" })
        );
    }

    #[test]
    fn probe_request_round_trips() {
        let probe = ProbeRequest {
            target: "http://a.example.com".to_string(),
            retryable_status_codes: vec![500, 503],
            request_data: ProbeRequestData {
                url: "http://a.example.com/v1/messages".to_string(),
                method: "POST".to_string(),
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: Some("{}".to_string()),
            },
        };
        let json = serde_json::to_string(&probe).unwrap();
        let back: ProbeRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.target, probe.target);
        assert_eq!(back.request_data.headers.len(), 1);
    }
}
