//! Server-push event listener
//!
//! Holds a long-lived event stream open against the control plane. Restart
//! events queue worker restarts on the reconciler; every other event schedules
//! one debounced config pull. Lost streams are retried with exponential
//! backoff until the agent shuts down.

use super::config_pull::PullTrigger;
use crate::health::{components, HealthRegistry};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::reconciler::Reconciler;
use anyhow::{bail, Context, Result};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Comma-separated topics the stream subscribes to
pub const TOPICS_HEADER: &str = "x-fleet-topics";

/// Event type that carries explicit restart requests
pub const RESTART_EVENT: &str = "restart";

#[derive(Debug, Clone)]
pub struct EventListenerConfig {
    /// Full URL of the event stream
    pub endpoint: String,
    pub token: Option<String>,
    /// Window in which config events collapse into one pull
    pub debounce: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub connect_timeout: Duration,
    /// Longest accepted line; a longer one drops the connection
    pub max_line_length: usize,
}

impl Default for EventListenerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/api/v1/events".to_string(),
            token: None,
            debounce: Duration::from_secs(2),
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            max_line_length: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Streaming,
}

/// Split a push stream into lines of at most `max_line_length` bytes
pub(crate) fn stream_lines<R: AsyncRead>(reader: R, max_line_length: usize) -> FramedRead<R, LinesCodec> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(max_line_length))
}

/// One flushed event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEvent {
    pub event_type: String,
    pub data: String,
}

/// Line-oriented event-stream parser.
///
/// `event:` sets the type, `data:` lines accumulate, a blank line flushes.
#[derive(Debug, Default)]
pub struct EventParser {
    event_type: Option<String>,
    data: Vec<String>,
}

impl EventParser {
    pub fn feed_line(&mut self, line: &str) -> Option<ServerEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn flush(&mut self) -> Option<ServerEvent> {
        let event_type = self.event_type.take();
        let data = std::mem::take(&mut self.data);
        if event_type.is_none() && data.is_empty() {
            return None;
        }
        Some(ServerEvent {
            event_type: event_type.unwrap_or_else(|| "message".to_string()),
            data: data.join("\n"),
        })
    }
}

/// Exponential reconnect delay, doubling from `min` up to `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: min,
        }
    }

    /// Delay to wait now; the following one doubles
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[derive(Deserialize)]
struct RestartPayload {
    #[serde(default)]
    worker_ids: Vec<String>,
}

/// Worker ids from a restart event: `{"worker_ids":[..]}`, a JSON array, or
/// a comma-separated list
pub fn parse_restart_ids(data: &str) -> Vec<String> {
    let trimmed = data.trim();
    let ids = if trimmed.starts_with('{') {
        serde_json::from_str::<RestartPayload>(trimmed)
            .map(|p| p.worker_ids)
            .unwrap_or_default()
    } else if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<String>>(trimmed).unwrap_or_default()
    } else {
        trimmed.split(',').map(str::to_string).collect()
    };

    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

pub struct EventListener {
    agent_id: String,
    config: EventListenerConfig,
    http: reqwest::Client,
    url: Url,
    reconciler: Arc<Reconciler>,
    pull_trigger: PullTrigger,
    state: watch::Sender<ListenerState>,
    pull_pending: Arc<AtomicBool>,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl EventListener {
    pub fn new(
        agent_id: impl Into<String>,
        config: EventListenerConfig,
        reconciler: Arc<Reconciler>,
        pull_trigger: PullTrigger,
        logger: StructuredLogger,
    ) -> Result<Self> {
        let url = Url::parse(&config.endpoint)
            .with_context(|| format!("Invalid event stream URL: {}", config.endpoint))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("API token is not a valid header value")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        // No overall timeout: the stream is meant to stay open
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .build()
            .context("Failed to build event stream client")?;

        let (state, _) = watch::channel(ListenerState::Disconnected);

        Ok(Self {
            agent_id: agent_id.into(),
            config,
            http,
            url,
            reconciler,
            pull_trigger,
            state,
            pull_pending: Arc::new(AtomicBool::new(false)),
            metrics: AgentMetrics::new(),
            logger,
            health: None,
        })
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// The agent's own topic plus its restart topic
    pub fn topics(&self) -> String {
        format!("{},{}", self.agent_id, self.restart_topic())
    }

    fn restart_topic(&self) -> String {
        format!("{}_vgpu_restart", self.agent_id)
    }

    fn is_restart_event(&self, event_type: &str) -> bool {
        event_type == RESTART_EVENT || event_type == self.restart_topic()
    }

    fn set_state(&self, state: ListenerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Event listener state changed");
        }
    }

    /// Route one event
    pub async fn handle_event(&self, event: ServerEvent, cancel: &CancellationToken) {
        if self.is_restart_event(&event.event_type) {
            let ids = parse_restart_ids(&event.data);
            if ids.is_empty() {
                warn!(data = %event.data, "Restart event without worker ids");
                return;
            }
            let queued = self
                .reconciler
                .request_worker_restarts(ids.iter().cloned())
                .await;
            self.metrics.inc_restart_requests(queued);
            self.logger.log_restart_requested(&ids, queued);
        } else {
            debug!(event_type = %event.event_type, "Config event received");
            self.schedule_pull(cancel);
        }
    }

    /// Arm the debounce timer unless one is already pending
    fn schedule_pull(&self, cancel: &CancellationToken) {
        if self.pull_pending.swap(true, Ordering::SeqCst) {
            debug!("Config pull already scheduled");
            return;
        }

        let pending = Arc::clone(&self.pull_pending);
        let trigger = self.pull_trigger.clone();
        let delay = self.config.debounce;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    pending.store(false, Ordering::SeqCst);
                }
                _ = tokio::time::sleep(delay) => {
                    pending.store(false, Ordering::SeqCst);
                    trigger.request();
                }
            }
        });
    }

    /// Connect once and consume the stream until it ends
    async fn stream_once(&self, backoff: &mut Backoff, cancel: &CancellationToken) -> Result<()> {
        self.set_state(ListenerState::Connecting);

        let response = self
            .http
            .get(self.url.clone())
            .header(TOPICS_HEADER, self.topics())
            .send()
            .await
            .context("Event stream connection failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("Event stream rejected with HTTP {}", status);
        }

        backoff.reset();
        self.set_state(ListenerState::Streaming);
        info!(url = %self.url, topics = %self.topics(), "Event stream connected");
        if let Some(health) = &self.health {
            health.set_healthy(components::EVENT_LISTENER).await;
        }

        let reader = tokio_util::io::StreamReader::new(
            response
                .bytes_stream()
                .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))),
        );
        let mut lines = stream_lines(reader, self.config.max_line_length);
        let mut parser = EventParser::default();

        while let Some(line) = lines.next().await {
            let line = line.context("Event stream read failed")?;
            if let Some(event) = parser.feed_line(&line) {
                self.handle_event(event, cancel).await;
            }
        }

        Ok(())
    }

    /// Keep the stream open until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.min_backoff, self.config.max_backoff);
        info!(url = %self.url, "Event listener started");

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.stream_once(&mut backoff, &cancel) => result,
            };
            self.set_state(ListenerState::Disconnected);

            let delay = backoff.next_delay();
            match &result {
                Ok(()) => info!(retry_ms = delay.as_millis() as u64, "Event stream closed by server"),
                Err(e) => warn!(error = %e, retry_ms = delay.as_millis() as u64, "Event stream lost"),
            }
            if let Some(health) = &self.health {
                health
                    .set_degraded(components::EVENT_LISTENER, "event stream disconnected")
                    .await;
            }
            self.metrics.inc_event_reconnects();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ListenerState::Disconnected);
        info!("Event listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_lines_caps_line_length() {
        let input: &[u8] = b"event: restart\r\ndata: ok\n\n";
        let lines: Vec<String> = stream_lines(input, 32)
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["event: restart", "data: ok", ""]);

        let long = format!("data: {}\n\n", "x".repeat(100));
        let mut lines = stream_lines(long.as_bytes(), 32);
        assert!(lines.next().await.unwrap().is_err());
    }

    #[test]
    fn test_parser_flushes_on_blank_line() {
        let mut parser = EventParser::default();
        assert_eq!(parser.feed_line("event: config_updated"), None);
        assert_eq!(parser.feed_line("data: {\"version\":"), None);
        assert_eq!(parser.feed_line("data: 4}"), None);
        assert_eq!(
            parser.feed_line(""),
            Some(ServerEvent {
                event_type: "config_updated".to_string(),
                data: "{\"version\":\n4}".to_string(),
            })
        );
        assert_eq!(parser.feed_line(""), None);
    }

    #[test]
    fn test_parser_ignores_comments_and_unknown_fields() {
        let mut parser = EventParser::default();
        assert_eq!(parser.feed_line(": keepalive"), None);
        assert_eq!(parser.feed_line("id: 17"), None);
        assert_eq!(parser.feed_line("data:x\r"), None);
        assert_eq!(
            parser.feed_line("\r"),
            Some(ServerEvent {
                event_type: "message".to_string(),
                data: "x".to_string(),
            })
        );
    }

    #[test]
    fn test_backoff_doubles_to_ceiling_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_restart_id_formats() {
        assert_eq!(
            parse_restart_ids(r#"{"worker_ids":["w1"," w2 "]}"#),
            vec!["w1", "w2"]
        );
        assert_eq!(parse_restart_ids(r#"["w3"]"#), vec!["w3"]);
        assert_eq!(parse_restart_ids("w1, w2,,"), vec!["w1", "w2"]);
        assert!(parse_restart_ids("").is_empty());
        assert!(parse_restart_ids("{broken").is_empty());
    }
}
