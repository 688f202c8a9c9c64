//! Integration tests for the event listener
//!
//! These tests verify:
//! - Restart events reach the reconciler's force-restart set
//! - Config events collapse into one debounced pull
//! - Stream handling against a live HTTP server, including reconnects
//! - Prompt cancellation while connecting or backing off

use super::*;
use crate::hypervisor::{DryRunHypervisor, Hypervisor, StaticDeviceSource};
use crate::observability::StructuredLogger;
use crate::reconciler::{Reconciler, ReconcilerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn reconciler() -> Arc<Reconciler> {
    let hv: Arc<dyn Hypervisor> =
        Arc::new(DryRunHypervisor::new(Arc::new(StaticDeviceSource::default())));
    Arc::new(Reconciler::new(hv, ReconcilerConfig::default()))
}

fn listener(
    endpoint: &str,
    reconciler: Arc<Reconciler>,
    min_backoff: Duration,
) -> (Arc<EventListener>, mpsc::Receiver<()>) {
    let (trigger, rx) = PullTrigger::channel();
    let config = EventListenerConfig {
        endpoint: endpoint.to_string(),
        token: Some("secret".to_string()),
        debounce: Duration::from_secs(2),
        min_backoff,
        max_backoff: Duration::from_secs(60),
        connect_timeout: Duration::from_secs(2),
        max_line_length: 1024,
    };
    let listener = EventListener::new(
        "agent-1",
        config,
        reconciler,
        trigger,
        StructuredLogger::new("agent-1", "node-1"),
    )
    .unwrap();
    (Arc::new(listener), rx)
}

fn event(event_type: &str, data: &str) -> ServerEvent {
    ServerEvent {
        event_type: event_type.to_string(),
        data: data.to_string(),
    }
}

mod routing_tests {
    use super::*;

    #[tokio::test]
    async fn test_restart_topic_queues_restarts() {
        let reconciler = reconciler();
        let (listener, mut pulls) = listener("http://127.0.0.1:9/events", reconciler.clone(), Duration::from_secs(1));
        let cancel = CancellationToken::new();

        listener
            .handle_event(event("agent-1_vgpu_restart", r#"{"worker_ids":["w1","w2"]}"#), &cancel)
            .await;
        listener.handle_event(event(RESTART_EVENT, "w2,w3"), &cancel).await;

        assert_eq!(reconciler.pending_restarts().await, 3);
        assert!(pulls.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_topics_include_restart_topic() {
        let (listener, _pulls) = listener("http://127.0.0.1:9/events", reconciler(), Duration::from_secs(1));
        assert_eq!(listener.topics(), "agent-1,agent-1_vgpu_restart");
        assert_eq!(listener.state(), ListenerState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_events_debounce_into_one_pull() {
        let (listener, mut pulls) = listener("http://127.0.0.1:9/events", reconciler(), Duration::from_secs(1));
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            listener.handle_event(event("config_updated", "{}"), &cancel).await;
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert!(pulls.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(pulls.try_recv().is_ok());
        assert!(pulls.try_recv().is_err());

        // A later event opens a new window
        listener.handle_event(event("config_updated", "{}"), &cancel).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(pulls.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_pull() {
        let (listener, mut pulls) = listener("http://127.0.0.1:9/events", reconciler(), Duration::from_secs(1));
        let cancel = CancellationToken::new();

        listener.handle_event(event("config_updated", ""), &cancel).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(pulls.try_recv().is_err());
    }
}

mod stream_tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_routes_events_and_reconnects() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/events")
            .match_header("authorization", "Bearer secret")
            .match_header("accept", "text/event-stream")
            .match_header(TOPICS_HEADER, "agent-1,agent-1_vgpu_restart")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(": hello\n\nevent: restart\ndata: {\"worker_ids\":[\"w1\"]}\n\nevent: config_updated\ndata: {}\n\n")
            .expect_at_least(2)
            .create_async()
            .await;

        let reconciler = reconciler();
        let (listener, mut pulls) = listener(
            &format!("{}/events", server.url()),
            reconciler.clone(),
            Duration::from_millis(20),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.clone().run(cancel.clone()));

        // The config event fires once the debounce window closes
        let pulled = tokio::time::timeout(Duration::from_secs(5), pulls.recv()).await;
        assert!(matches!(pulled, Ok(Some(()))));
        assert_eq!(reconciler.pending_restarts().await, 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listener.state(), ListenerState::Disconnected);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_oversized_line_drops_connection() {
        let mut server = mockito::Server::new_async().await;
        let body = format!(
            "event: restart\ndata: {{\"worker_ids\":[\"{}\"]}}\n\n",
            "w".repeat(4096)
        );
        let mock = server
            .mock("GET", "/events")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .expect_at_least(2)
            .create_async()
            .await;

        let reconciler = reconciler();
        let (listener, _pulls) = listener(
            &format!("{}/events", server.url()),
            reconciler.clone(),
            Duration::from_millis(20),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.clone().run(cancel.clone()));

        // The long line is rejected and the listener reconnects
        tokio::time::timeout(Duration::from_secs(5), async {
            while !mock.matched_async().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reconciler.pending_restarts().await, 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_stream_backs_off() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/events")
            .with_status(401)
            .create_async()
            .await;

        let (listener, _pulls) = listener(
            &format!("{}/events", server.url()),
            reconciler(),
            Duration::from_secs(60),
        );
        let mut states = listener.subscribe_state();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.clone().run(cancel.clone()));

        // Connecting, then back to disconnected for the long backoff
        states.changed().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while *states.borrow_and_update() != ListenerState::Disconnected {
                states.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
