use anyhow::{Context, Result};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::{form_urlencoded, Url};

use crate::packet::{FuzzOutcome, PacketMetadata, Protocol};

/// Token replaced by each escaped payload in a target template
pub const PLACEHOLDER: &str = "FUZZ";

/// User agent sent with every probe request
pub const USER_AGENT: &str = concat!("wirelens/", env!("CARGO_PKG_VERSION"));

/// SQL injection, path traversal and script injection markers
pub const DEFAULT_PAYLOADS: [&str; 3] = [
    "' OR 1=1 --",
    "../../../../etc/passwd",
    "<script>alert(1)</script>",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("invalid probe target: {0}")]
    InvalidTarget(String),

    #[error("probe request failed: {0}")]
    RequestFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status_code: u16,
    pub length: usize,
}

/// Issues a single probe request
pub trait ProbeClient: Send + Sync + 'static {
    fn get(&self, url: &str) -> impl Future<Output = Result<ProbeResponse, ProbeError>> + Send;
}

/// reqwest-backed probe client
pub struct HttpProbeClient {
    client: reqwest::Client,
}

impl HttpProbeClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build probe HTTP client")?;

        Ok(Self { client })
    }
}

impl ProbeClient for HttpProbeClient {
    async fn get(&self, url: &str) -> Result<ProbeResponse, ProbeError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_builder() {
                ProbeError::InvalidTarget(url.to_string())
            } else {
                ProbeError::RequestFailed(e.to_string())
            }
        })?;

        let status_code = response.status().as_u16();
        // A truncated body still counts as a response
        let length = match response.bytes().await {
            Ok(body) => body.len(),
            Err(e) => {
                debug!("Failed to read probe body from {}: {}", url, e);
                0
            }
        };

        Ok(ProbeResponse {
            status_code,
            length,
        })
    }
}

/// Probe engine settings
#[derive(Debug, Clone)]
pub struct FuzzConfig {
    pub payload_file: Option<PathBuf>,
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            payload_file: None,
            concurrency: 10,
            request_timeout: Duration::from_secs(10),
            queue_capacity: 1024,
        }
    }
}

/// Built-in payloads followed by every line of `payload_file`.
///
/// Lines are taken verbatim, so blank lines become empty payloads.
pub fn load_payloads(payload_file: Option<&Path>) -> Vec<String> {
    let mut payloads: Vec<String> = DEFAULT_PAYLOADS.iter().map(|p| p.to_string()).collect();

    if let Some(path) = payload_file {
        match std::fs::read(path) {
            Ok(data) => {
                let text = String::from_utf8_lossy(&data);
                let before = payloads.len();
                payloads.extend(text.split('\n').map(str::to_string));
                info!(
                    "Loaded {} custom payloads from {}",
                    payloads.len() - before,
                    path.display()
                );
            }
            Err(e) => warn!(
                "Failed to read payload file {}: {} (using built-in payloads)",
                path.display(),
                e
            ),
        }
    }

    payloads
}

/// Replace every placeholder in `template` with the query-escaped payload
pub fn substitute(template: &str, payload: &str) -> String {
    let escaped: String = form_urlencoded::byte_serialize(payload.as_bytes()).collect();
    template.replace(PLACEHOLDER, &escaped)
}

/// Probe template for a decoded HTTP request, `http://<dst_ip><path>FUZZ`.
///
/// Paths that already carry the placeholder are used as they are.
pub fn probe_target(meta: &PacketMetadata) -> Option<String> {
    if meta.protocol != Protocol::Http {
        return None;
    }
    let http = meta.http.as_ref()?;
    if !http.path.starts_with('/') {
        return None;
    }

    let mut target = format!("http://{}{}", meta.endpoints.dst_ip, http.path);
    if !target.contains(PLACEHOLDER) {
        target.push_str(PLACEHOLDER);
    }
    Some(target)
}

/// Picks which decoded HTTP requests start a probe run.
///
/// Requests sent with [`USER_AGENT`] are our own probes seen on the wire and
/// never trigger a run. Each template is probed at most once.
#[derive(Debug, Default)]
pub struct ProbeTrigger {
    probed: HashSet<String>,
}

impl ProbeTrigger {
    pub fn next_target(&mut self, meta: &PacketMetadata) -> Option<String> {
        if is_own_request(meta) {
            return None;
        }
        let target = probe_target(meta)?;
        self.probed.insert(target.clone()).then_some(target)
    }

    pub fn probed(&self) -> usize {
        self.probed.len()
    }
}

fn is_own_request(meta: &PacketMetadata) -> bool {
    meta.http.as_ref().is_some_and(|http| {
        http.headers
            .iter()
            .any(|(name, value)| name.eq_ignore_ascii_case("user-agent") && value == USER_AGENT)
    })
}

/// Outcomes left after [`Fuzzer::close`], in completion order
#[derive(Debug)]
pub struct FuzzResults {
    outcomes: std::vec::IntoIter<FuzzOutcome>,
}

impl Iterator for FuzzResults {
    type Item = FuzzOutcome;

    fn next(&mut self) -> Option<FuzzOutcome> {
        self.outcomes.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.outcomes.size_hint()
    }
}

impl ExactSizeIterator for FuzzResults {}

/// Bounded-concurrency HTTP prober.
///
/// Every run and every probe request is spawned on one task tracker; outcomes
/// go to a bounded queue that is only handed out by [`Fuzzer::close`].
pub struct Fuzzer<C = HttpProbeClient> {
    client: Arc<C>,
    payloads: Arc<[String]>,
    tracker: TaskTracker,
    results: mpsc::Sender<FuzzOutcome>,
    outcomes: mpsc::Receiver<FuzzOutcome>,
    queue_full_warned: Arc<AtomicBool>,
}

impl Fuzzer<HttpProbeClient> {
    pub fn from_config(config: &FuzzConfig) -> Result<Self> {
        let client = HttpProbeClient::new(config.request_timeout)?;
        let payloads = load_payloads(config.payload_file.as_deref());
        Ok(Self::new(client, payloads, config.queue_capacity))
    }
}

impl<C: ProbeClient> Fuzzer<C> {
    pub fn new(client: C, payloads: Vec<String>, queue_capacity: usize) -> Self {
        let (results, outcomes) = mpsc::channel(queue_capacity.max(1));

        Self {
            client: Arc::new(client),
            payloads: payloads.into(),
            tracker: TaskTracker::new(),
            results,
            outcomes,
            queue_full_warned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn payloads(&self) -> &[String] {
        &self.payloads
    }

    /// Launch one probe per payload against `template` in the background,
    /// with at most `concurrency` requests in flight for this run.
    pub fn fuzz_url(&self, template: &str, concurrency: usize) {
        let run = ProbeRun {
            client: self.client.clone(),
            payloads: self.payloads.clone(),
            tracker: self.tracker.clone(),
            results: self.results.clone(),
            queue_full_warned: self.queue_full_warned.clone(),
            template: template.to_string(),
            concurrency: concurrency.max(1),
        };

        debug!("Launching probe run against {}", template);
        self.tracker.spawn(run.execute());
    }

    /// Wait for every outstanding run and probe, then hand back all outcomes.
    ///
    /// Outcomes are pulled off the queue while waiting so producers blocked on
    /// a full queue can finish.
    pub async fn close(self) -> FuzzResults {
        let Self {
            tracker,
            results,
            mut outcomes,
            ..
        } = self;
        drop(results);
        tracker.close();

        if !tracker.is_empty() {
            info!("Waiting for {} outstanding probe tasks", tracker.len());
        }

        let mut collected = Vec::new();
        let wait = tracker.wait();
        tokio::pin!(wait);

        loop {
            tokio::select! {
                biased;
                _ = &mut wait => break,
                Some(outcome) = outcomes.recv() => collected.push(outcome),
            }
        }

        while let Ok(outcome) = outcomes.try_recv() {
            collected.push(outcome);
        }

        FuzzResults {
            outcomes: collected.into_iter(),
        }
    }
}

struct ProbeRun<C> {
    client: Arc<C>,
    payloads: Arc<[String]>,
    tracker: TaskTracker,
    results: mpsc::Sender<FuzzOutcome>,
    queue_full_warned: Arc<AtomicBool>,
    template: String,
    concurrency: usize,
}

impl<C: ProbeClient> ProbeRun<C> {
    async fn execute(self) {
        if let Err(e) = Url::parse(&self.template) {
            debug!("Skipping probe run for {}: {}", self.template, e);
            return;
        }

        let gate = Arc::new(Semaphore::new(self.concurrency));

        for payload in self.payloads.iter() {
            // The gate is never closed, so acquisition only waits
            let Ok(permit) = gate.clone().acquire_owned().await else {
                return;
            };

            let target = substitute(&self.template, payload);
            let payload = payload.clone();
            let client = self.client.clone();
            let results = self.results.clone();
            let queue_full_warned = self.queue_full_warned.clone();

            self.tracker.spawn(async move {
                let response = client.get(&target).await;
                drop(permit);

                match response {
                    Ok(response) => {
                        let outcome = FuzzOutcome::new(
                            target,
                            payload,
                            response.status_code,
                            response.length,
                        );
                        enqueue(&results, outcome, &queue_full_warned).await;
                    }
                    Err(e) => debug!("Probe dropped: {}", e),
                }
            });
        }
    }
}

async fn enqueue(results: &mpsc::Sender<FuzzOutcome>, outcome: FuzzOutcome, warned: &AtomicBool) {
    match results.try_send(outcome) {
        Ok(()) => {}
        Err(TrySendError::Full(outcome)) => {
            if !warned.swap(true, Ordering::Relaxed) {
                warn!("Probe result queue is full, probes will wait for it to drain");
            }
            let _ = results.send(outcome).await;
        }
        Err(TrySendError::Closed(_)) => {}
    }
}
