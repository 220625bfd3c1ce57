//! Reconnecting client channel
//!
//! Client-side wrapper over an SSE endpoint: named-event dispatch plus
//! automatic reconnect with exponential backoff (doubling, capped,
//! reset to base after a successful open). A status callback reflects
//! connect/reconnect/disconnect transitions so a UI can drive its live
//! indicator. Manual close cancels any pending reconnect timer; no
//! callback fires after `close` returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header;
use tokio::sync::oneshot;
use tracing::debug;

use crate::backoff::Backoff;

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    pub event: String,
    pub data: String,
}

/// Incremental parser for `text/event-stream` framing: `event:` names
/// the frame, `data:` lines accumulate, a blank line dispatches.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk (possibly splitting lines) and collect any frames it
    /// completes.
    pub fn push(&mut self, chunk: &str) -> Vec<SseMessage> {
        self.buffer.push_str(chunk);
        let mut messages = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    messages.push(SseMessage {
                        event: self.event.take().unwrap_or_else(|| "message".to_string()),
                        data: self.data.join("\n"),
                    });
                }
                self.event = None;
                self.data.clear();
            } else if line.starts_with(':') {
                // comment / keep-alive
            } else if let Some(value) = line.strip_prefix("event:") {
                self.event = Some(value.strip_prefix(' ').unwrap_or(value).to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // id:/retry: fields are not used by the relay
        }
        messages
    }
}

/// Connection lifecycle as seen by the status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

type EventHandler = Box<dyn Fn(&str) + Send + Sync>;
type MessageHandler = Box<dyn Fn(&str, &str) + Send + Sync>;
type ErrorHandler = Box<dyn Fn(&str) + Send + Sync>;
type OpenHandler = Box<dyn Fn() + Send + Sync>;
type StatusHandler = Box<dyn Fn(ChannelStatus) + Send + Sync>;

#[derive(Default)]
struct ChannelHandlers {
    named: HashMap<String, EventHandler>,
    on_open: Option<OpenHandler>,
    on_message: Option<MessageHandler>,
    on_error: Option<ErrorHandler>,
    on_status: Option<StatusHandler>,
    // Set on close; the task's abort only lands at its next await point,
    // so every dispatch re-checks this before calling out.
    closed: AtomicBool,
}

impl ChannelHandlers {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn dispatch(&self, message: &SseMessage) {
        if self.is_closed() {
            return;
        }
        if let Some(handler) = self.named.get(&message.event) {
            handler(&message.data);
        } else if let Some(fallback) = &self.on_message {
            fallback(&message.event, &message.data);
        }
    }

    fn dispatch_open(&self) {
        if self.is_closed() {
            return;
        }
        if let Some(handler) = &self.on_open {
            handler();
        }
    }

    fn dispatch_error(&self, reason: &str) {
        if self.is_closed() {
            return;
        }
        if let Some(handler) = &self.on_error {
            handler(reason);
        }
    }

    fn dispatch_status(&self, status: ChannelStatus) {
        if self.is_closed() {
            return;
        }
        if let Some(handler) = &self.on_status {
            handler(status);
        }
    }
}

pub struct EventChannelBuilder {
    url: String,
    base_delay: Duration,
    max_delay: Duration,
    handlers: ChannelHandlers,
}

impl EventChannelBuilder {
    /// Register a handler for a named event (`new-charity`,
    /// `new-donation`, `time-update`, ...).
    pub fn on_event(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.handlers.named.insert(name.into(), Box::new(handler));
        self
    }

    pub fn on_open(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.handlers.on_open = Some(Box::new(handler));
        self
    }

    /// Fallback for events without a named handler.
    pub fn on_message(mut self, handler: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.handlers.on_message = Some(Box::new(handler));
        self
    }

    pub fn on_error(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.handlers.on_error = Some(Box::new(handler));
        self
    }

    pub fn on_status(mut self, handler: impl Fn(ChannelStatus) + Send + Sync + 'static) -> Self {
        self.handlers.on_status = Some(Box::new(handler));
        self
    }

    /// Reconnect schedule: `base`, doubling per failure, capped at `max`.
    pub fn reconnect(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Spawn the channel task and start connecting.
    pub fn connect(self) -> EventChannel {
        let handlers = Arc::new(self.handlers);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        // No overall request timeout: the stream is meant to live forever.
        let client = reqwest::Client::new();
        let task = tokio::spawn(run_loop(
            self.url,
            client,
            Arc::clone(&handlers),
            Backoff::new(self.base_delay, self.max_delay),
            shutdown_rx,
        ));
        EventChannel {
            shutdown: Some(shutdown_tx),
            task,
            handlers,
        }
    }
}

/// Handle to a live channel; dropping it tears the task down silently,
/// [`EventChannel::close`] additionally reports `Closed`.
pub struct EventChannel {
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
    handlers: Arc<ChannelHandlers>,
}

impl EventChannel {
    pub fn builder(url: impl Into<String>) -> EventChannelBuilder {
        EventChannelBuilder {
            url: url.into(),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            handlers: ChannelHandlers::default(),
        }
    }

    /// Cancel any pending reconnect and stop the channel. The final
    /// `Closed` status is the last callback to ever fire.
    pub fn close(mut self) {
        self.shutdown_now(true);
    }

    fn shutdown_now(&mut self, announce: bool) {
        // Raise the flag first: the task only observes the abort at its
        // next await point, and anything it dispatches in between must
        // already see the channel as closed.
        let was_closed = self.handlers.closed.swap(true, Ordering::SeqCst);
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.abort();
        if announce && !was_closed {
            if let Some(handler) = &self.handlers.on_status {
                handler(ChannelStatus::Closed);
            }
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.shutdown_now(false);
    }
}

async fn run_loop(
    url: String,
    client: reqwest::Client,
    handlers: Arc<ChannelHandlers>,
    mut backoff: Backoff,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        handlers.dispatch_status(ChannelStatus::Connecting);
        let attempt = async {
            client
                .get(&url)
                .header(header::ACCEPT, "text/event-stream")
                .send()
                .await?
                .error_for_status()
        };
        let response = tokio::select! {
            _ = &mut shutdown => return,
            response = attempt => response,
        };

        match response {
            Ok(response) => {
                backoff.reset();
                handlers.dispatch_status(ChannelStatus::Open);
                handlers.dispatch_open();

                let mut parser = SseParser::new();
                let mut body = response.bytes_stream();
                let disconnect_reason = loop {
                    tokio::select! {
                        _ = &mut shutdown => return,
                        chunk = body.next() => match chunk {
                            Some(Ok(bytes)) => {
                                for message in parser.push(&String::from_utf8_lossy(&bytes)) {
                                    debug!(event = %message.event, "channel event");
                                    handlers.dispatch(&message);
                                }
                            }
                            Some(Err(err)) => break err.to_string(),
                            None => break "stream ended".to_string(),
                        }
                    }
                };
                handlers.dispatch_error(&disconnect_reason);
            }
            Err(err) => handlers.dispatch_error(&err.to_string()),
        }

        handlers.dispatch_status(ChannelStatus::Reconnecting);
        let delay = backoff.next_delay();
        tokio::select! {
            _ = &mut shutdown => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn parser_handles_chunks_split_mid_line() {
        let mut parser = SseParser::new();
        assert!(parser.push("event: new-don").is_empty());
        assert!(parser.push("ation\ndata: {\"a\":1}\n").is_empty());
        let messages = parser.push("\n");
        assert_eq!(
            messages,
            vec![SseMessage {
                event: "new-donation".to_string(),
                data: "{\"a\":1}".to_string(),
            }]
        );
    }

    #[test]
    fn parser_joins_multi_line_data_and_defaults_the_event_name() {
        let mut parser = SseParser::new();
        let messages = parser.push("data: first\ndata: second\n\n");
        assert_eq!(
            messages,
            vec![SseMessage {
                event: "message".to_string(),
                data: "first\nsecond".to_string(),
            }]
        );
    }

    #[test]
    fn parser_ignores_comments_and_handles_crlf() {
        let mut parser = SseParser::new();
        let messages = parser.push(": keep-alive\r\nevent: time-update\r\ndata: It is now\r\n\r\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event, "time-update");
        assert_eq!(messages[0].data, "It is now");
    }

    #[tokio::test]
    async fn failed_connects_cycle_through_reconnecting_and_close_is_final() {
        let statuses: Arc<Mutex<Vec<ChannelStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&statuses);

        // Port 9 refuses immediately, so the channel loops through
        // Connecting -> Reconnecting on a short schedule.
        let channel = EventChannel::builder("http://127.0.0.1:9/sse/new-charities")
            .reconnect(Duration::from_millis(10), Duration::from_millis(40))
            .on_status(move |status| seen.lock().unwrap().push(status))
            .connect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        channel.close();

        let after_close = {
            let log = statuses.lock().unwrap();
            assert!(log.contains(&ChannelStatus::Connecting));
            assert!(log.contains(&ChannelStatus::Reconnecting));
            assert_eq!(log.last(), Some(&ChannelStatus::Closed));
            log.len()
        };

        // Nothing fires after close returns.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(statuses.lock().unwrap().len(), after_close);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_during_a_slow_handler_suppresses_later_callbacks() {
        let statuses: Arc<Mutex<Vec<ChannelStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&statuses);

        // The error handler blocks the task between await points, so the
        // close below lands while the task cannot yet observe its abort.
        let channel = EventChannel::builder("http://127.0.0.1:9/sse/new-charities")
            .reconnect(Duration::from_millis(10), Duration::from_millis(40))
            .on_error(|_| std::thread::sleep(Duration::from_millis(300)))
            .on_status(move |status| seen.lock().unwrap().push(status))
            .connect();

        // Let the first connect fail and enter the blocking error handler.
        tokio::time::sleep(Duration::from_millis(100)).await;
        channel.close();
        let after_close = statuses.lock().unwrap().len();

        // Once the handler unblocks, the task's Reconnecting transition
        // must be swallowed rather than delivered post-close.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let log = statuses.lock().unwrap();
        assert_eq!(log.len(), after_close);
        assert_eq!(log.last(), Some(&ChannelStatus::Closed));
        assert!(!log.contains(&ChannelStatus::Reconnecting));
    }
}
