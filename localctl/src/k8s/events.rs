use super::api::{ClusterApi, ClusterEvent, EventType};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use pod_logs::{AsyncLogScanner, Level};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Warnings seen this many times or fewer are not worth interrupting for.
pub const WARNING_COUNT_THRESHOLD: i32 = 5;
pub const RATE_LIMIT_NOTE: &str = "429 Too Many Requests";
const STARTED_REASON: &str = "Started";
const TAIL_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Watching,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    fn debug(message: String) -> Self {
        Self {
            severity: Severity::Debug,
            message,
        }
    }

    fn warning(message: String) -> Self {
        Self {
            severity: Severity::Warning,
            message,
        }
    }

    fn emit(&self) {
        match self.severity {
            Severity::Debug => debug!("{}", self.message),
            Severity::Warning => warn!("{}", self.message),
        }
    }
}

/// What an incoming event should turn into.
#[derive(Debug, PartialEq, Eq)]
enum Triage {
    Stale,
    Quiet,
    Backoff,
    BootloaderStarted,
    Escalate { fetch_logs: bool },
}

fn is_backoff(reason: &str) -> bool {
    reason.to_lowercase().contains("backoff")
}

/// Watches the install namespace for events and turns the interesting ones
/// into user-visible warnings.
pub struct EventMonitor {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    bootloader_pod: String,
    cutoff: DateTime<Utc>,
    state: MonitorState,
    tailing: Arc<AtomicBool>,
    tail_retry_delay: Duration,
    diagnostics: Option<mpsc::UnboundedSender<Diagnostic>>,
}

impl EventMonitor {
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: &str, bootloader_pod: &str) -> Self {
        Self {
            cluster,
            namespace: namespace.to_owned(),
            bootloader_pod: bootloader_pod.to_owned(),
            cutoff: Utc::now(),
            state: MonitorState::Idle,
            tailing: Default::default(),
            tail_retry_delay: TAIL_RETRY_DELAY,
            diagnostics: None,
        }
    }

    /// Every diagnostic is also sent to `tx`.
    #[cfg(test)]
    pub fn with_diagnostics(mut self, tx: mpsc::UnboundedSender<Diagnostic>) -> Self {
        self.diagnostics = Some(tx);
        self
    }

    #[cfg(test)]
    pub fn with_tail_retry_delay(mut self, delay: Duration) -> Self {
        self.tail_retry_delay = delay;
        self
    }

    /// Watches until the event stream closes (back to `Idle`) or `cancel`
    /// fires (`Stopped`). Never fails; a watch that cannot be established
    /// is logged and leaves the monitor idle.
    pub async fn run(mut self, cancel: CancellationToken) -> MonitorState {
        let span = tracing::debug_span!("event-monitor", namespace = %self.namespace);
        async {
            let mut events = select! {
                _ = cancel.cancelled() => return self.transition(MonitorState::Stopped),
                result = self.cluster.watch_events(&self.namespace) => match result {
                    Ok(events) => events,
                    Err(err) => {
                        debug!(?err, "unable to watch events");
                        return self.transition(MonitorState::Idle);
                    }
                },
            };
            self.transition(MonitorState::Watching);

            loop {
                select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("cancelled");
                        return self.transition(MonitorState::Stopped);
                    }
                    event = events.next() => match event {
                        Some(event) => {
                            // Handling may fetch logs, which can hang.
                            let diagnostic = select! {
                                biased;

                                _ = cancel.cancelled() => {
                                    debug!("cancelled while handling an event");
                                    return self.transition(MonitorState::Stopped);
                                }
                                diagnostic = self.handle(&event, &cancel) => diagnostic,
                            };
                            if let Some(diagnostic) = diagnostic {
                                self.report(diagnostic);
                            }
                        }
                        None => {
                            debug!("event stream closed");
                            return self.transition(MonitorState::Idle);
                        }
                    },
                }
            }
        }
        .instrument(span)
        .await
    }

    fn transition(&mut self, state: MonitorState) -> MonitorState {
        debug!(from = ?self.state, to = ?state, "monitor state");
        self.state = state;
        state
    }

    fn report(&self, diagnostic: Diagnostic) {
        diagnostic.emit();
        if let Some(tx) = &self.diagnostics {
            let _ = tx.send(diagnostic);
        }
    }

    fn triage(&self, event: &ClusterEvent) -> Triage {
        if event.last_timestamp < self.cutoff {
            return Triage::Stale;
        }
        match event.type_ {
            EventType::Normal if is_backoff(&event.reason) => Triage::Backoff,
            EventType::Normal
                if event.reason == STARTED_REASON
                    && event.subject_name == self.bootloader_pod =>
            {
                Triage::BootloaderStarted
            }
            EventType::Normal => Triage::Quiet,
            EventType::Warning
                if event.count > WARNING_COUNT_THRESHOLD
                    || event.note.contains(RATE_LIMIT_NOTE) =>
            {
                Triage::Escalate {
                    fetch_logs: is_backoff(&event.reason) && event.subject_kind == "Pod",
                }
            }
            EventType::Warning => Triage::Quiet,
        }
    }

    /// `None` means the event was discarded as stale.
    pub async fn handle(
        &self,
        event: &ClusterEvent,
        cancel: &CancellationToken,
    ) -> Option<Diagnostic> {
        let summary = format!(
            "{} {}/{}: {}",
            event.reason, event.subject_kind, event.subject_name, event.note
        );

        match self.triage(event) {
            Triage::Stale => None,
            Triage::Quiet => Some(Diagnostic::debug(format!(
                "{} event: {summary}",
                event.type_
            ))),
            Triage::Backoff => Some(Diagnostic::warning(format!("Waiting on {summary}"))),
            Triage::BootloaderStarted => {
                self.start_bootloader_tail(cancel);
                Some(Diagnostic::debug(format!("Normal event: {summary}")))
            }
            Triage::Escalate { fetch_logs: false } => Some(Diagnostic::warning(format!(
                "Encountered an issue deploying {}: {}",
                event.subject_name, event.note
            ))),
            Triage::Escalate { fetch_logs: true } => {
                let logs = match self
                    .cluster
                    .pod_logs(&event.subject_namespace_or(&self.namespace), &event.subject_name)
                    .await
                {
                    Ok(logs) => summarize_logs(&logs),
                    Err(err) => {
                        debug!(?err, pod = %event.subject_name, "log fetch failed");
                        "unable to retrieve logs".to_owned()
                    }
                };
                Some(Diagnostic::warning(format!(
                    "Encountered an issue deploying {}: {}\n  logs: {logs}",
                    event.subject_name, event.note
                )))
            }
        }
    }

    fn start_bootloader_tail(&self, cancel: &CancellationToken) {
        if self.tailing.swap(true, Ordering::SeqCst) {
            debug!("bootloader logs already being tailed");
            return;
        }
        let tailing = self.tailing.clone();
        let cluster = self.cluster.clone();
        let namespace = self.namespace.clone();
        let pod = self.bootloader_pod.clone();
        let retry_delay = self.tail_retry_delay;
        let cancel = cancel.clone();
        let span = tracing::debug_span!("bootloader-tail", %pod);
        tokio::spawn(
            async move {
                tail_pod_logs(cluster.as_ref(), &namespace, &pod, retry_delay, &cancel).await;
                tailing.store(false, Ordering::SeqCst);
            }
            .instrument(span),
        );
    }
}

impl ClusterEvent {
    fn subject_namespace_or(&self, default: &str) -> String {
        if self.subject_namespace.is_empty() {
            default.to_owned()
        } else {
            self.subject_namespace.clone()
        }
    }
}

fn summarize_logs(logs: &str) -> String {
    let last_error = pod_logs::last_error(logs.as_bytes());
    if last_error.is_empty() {
        "no errors found in logs".to_owned()
    } else {
        last_error
    }
}

/// Follows a pod's logs until the stream ends or a read fails. Attaching is
/// retried, since the container may not accept log requests yet.
pub async fn tail_pod_logs(
    cluster: &dyn ClusterApi,
    namespace: &str,
    pod: &str,
    retry_delay: Duration,
    cancel: &CancellationToken,
) {
    let stream = loop {
        select! {
            _ = cancel.cancelled() => return,
            result = cluster.pod_logs_follow(namespace, pod) => match result {
                Ok(stream) => break stream,
                Err(err) => debug!(?err, "unable to attach to logs, retrying"),
            },
        }
        select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(retry_delay) => {}
        }
    };

    let mut scanner = AsyncLogScanner::new(stream);
    loop {
        let entry = select! {
            _ = cancel.cancelled() => return,
            entry = scanner.next_entry() => entry,
        };
        match entry {
            Ok(Some(line)) => match line.level {
                Level::Error => warn!("{pod}: {}", line.full_message()),
                Level::Warn => info!("{pod}: {}", line.message),
                _ => debug!("{pod}: {}", line.message),
            },
            Ok(None) => {
                debug!("log stream ended");
                return;
            }
            Err(err) => {
                debug!(?err, "log stream failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;
    use chrono::Duration as ChronoDuration;

    const NAMESPACE: &str = "platform";
    const BOOTLOADER: &str = "platform-airbyte-bootloader";

    fn event(type_: EventType, reason: &str, count: i32, note: &str) -> ClusterEvent {
        ClusterEvent {
            type_,
            reason: reason.to_owned(),
            subject_kind: "Pod".to_owned(),
            subject_name: "platform-server-0".to_owned(),
            subject_namespace: NAMESPACE.to_owned(),
            note: note.to_owned(),
            count,
            last_timestamp: Utc::now() + ChronoDuration::seconds(1),
        }
    }

    fn monitor(cluster: Arc<FakeCluster>) -> EventMonitor {
        EventMonitor::new(cluster, NAMESPACE, BOOTLOADER)
    }

    #[tokio::test]
    async fn stale_events_are_discarded() {
        let cluster = Arc::new(FakeCluster::default());
        let monitor = monitor(cluster);
        let cancel = CancellationToken::new();
        for type_ in [EventType::Normal, EventType::Warning] {
            for reason in ["Started", "BackOff", "Pulled", "FailedScheduling"] {
                let mut old = event(type_, reason, 100, RATE_LIMIT_NOTE);
                old.last_timestamp = monitor.cutoff - ChronoDuration::milliseconds(1);
                assert_eq!(monitor.handle(&old, &cancel).await, None, "{type_} {reason}");
            }
        }
    }

    #[tokio::test]
    async fn event_at_cutoff_is_kept() {
        let monitor = monitor(Arc::new(FakeCluster::default()));
        let mut at_cutoff = event(EventType::Normal, "Pulled", 1, "pulled");
        at_cutoff.last_timestamp = monitor.cutoff;
        assert!(monitor
            .handle(&at_cutoff, &CancellationToken::new())
            .await
            .is_some());
    }

    #[tokio::test]
    async fn warnings_below_threshold_stay_quiet() {
        let monitor = monitor(Arc::new(FakeCluster::default()));
        let cancel = CancellationToken::new();
        for count in 0..=WARNING_COUNT_THRESHOLD {
            let warning = event(EventType::Warning, "FailedMount", count, "volume not ready");
            let diagnostic = monitor.handle(&warning, &cancel).await.unwrap();
            assert_eq!(diagnostic.severity, Severity::Debug);
        }
    }

    #[tokio::test]
    async fn frequent_or_rate_limited_warnings_escalate() {
        let monitor = monitor(Arc::new(FakeCluster::default()));
        let cancel = CancellationToken::new();

        let frequent = event(
            EventType::Warning,
            "FailedMount",
            WARNING_COUNT_THRESHOLD + 1,
            "volume not ready",
        );
        let diagnostic = monitor.handle(&frequent, &cancel).await.unwrap();
        assert_eq!(diagnostic.severity, Severity::Warning);
        assert!(diagnostic.message.contains("volume not ready"));

        let rate_limited = event(
            EventType::Warning,
            "Failed",
            1,
            "failed to pull image: 429 Too Many Requests - Server message: toomanyrequests",
        );
        let diagnostic = monitor.handle(&rate_limited, &cancel).await.unwrap();
        assert_eq!(diagnostic.severity, Severity::Warning);
    }

    #[tokio::test]
    async fn backoff_warning_includes_last_error() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.set_pod_logs(
            "platform-server-0",
            "{\"level\":\"INFO\",\"message\":\"starting\"}\n{\"level\":\"ERROR\",\"message\":\"database is unreachable\"}\n",
        );
        let monitor = monitor(cluster);
        let backoff = event(EventType::Warning, "BackOff", 8, "Back-off restarting failed container");
        let diagnostic = monitor
            .handle(&backoff, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(diagnostic.severity, Severity::Warning);
        assert!(diagnostic.message.ends_with("logs: database is unreachable"));
    }

    #[tokio::test]
    async fn backoff_warning_survives_log_failures() {
        let monitor = monitor(Arc::new(FakeCluster::default()));
        let backoff = event(EventType::Warning, "BackOff", 8, "Back-off restarting failed container");
        let diagnostic = monitor
            .handle(&backoff, &CancellationToken::new())
            .await
            .unwrap();
        assert!(diagnostic.message.ends_with("logs: unable to retrieve logs"));
    }

    #[tokio::test]
    async fn normal_backoff_is_a_warning() {
        let monitor = monitor(Arc::new(FakeCluster::default()));
        let backoff = event(EventType::Normal, "BackOff", 1, "Back-off pulling image");
        let diagnostic = monitor
            .handle(&backoff, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(diagnostic.severity, Severity::Warning);
    }

    #[tokio::test]
    async fn run_stops_on_cancel_and_idles_on_close() {
        let cluster = Arc::new(FakeCluster::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events_tx = cluster.event_sender();
        let watching = monitor(cluster.clone()).with_diagnostics(tx);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watching.run(cancel.clone()));

        events_tx
            .send(event(EventType::Warning, "FailedMount", 9, "still waiting"))
            .unwrap();
        let diagnostic = rx.recv().await.unwrap();
        assert_eq!(diagnostic.severity, Severity::Warning);

        cancel.cancel();
        assert_eq!(task.await.unwrap(), MonitorState::Stopped);

        let cluster = Arc::new(FakeCluster::default());
        let events_tx = cluster.event_sender();
        let task = tokio::spawn(monitor(cluster).run(CancellationToken::new()));
        drop(events_tx);
        assert_eq!(task.await.unwrap(), MonitorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn bootloader_start_tails_logs_with_retries() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.fail_log_follows(2);
        cluster.set_pod_logs(BOOTLOADER, "{\"level\":\"INFO\",\"message\":\"migrating\"}\n");
        let monitor = monitor(cluster.clone()).with_tail_retry_delay(Duration::from_millis(10));
        let mut started = event(EventType::Normal, STARTED_REASON, 1, "Started container");
        started.subject_name = BOOTLOADER.to_owned();

        let cancel = CancellationToken::new();
        let diagnostic = monitor.handle(&started, &cancel).await.unwrap();
        assert_eq!(diagnostic.severity, Severity::Debug);

        while monitor.tailing.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cluster.log_follow_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_a_hanging_log_fetch() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.stall_pod_logs();
        let events_tx = cluster.event_sender();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor(cluster).run(cancel.clone()));

        events_tx
            .send(event(EventType::Warning, "BackOff", 9, "Back-off restarting failed container"))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!task.is_finished());

        cancel.cancel();
        let state = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("monitor should stop once cancelled")
            .unwrap();
        assert_eq!(state, MonitorState::Stopped);
    }
}
