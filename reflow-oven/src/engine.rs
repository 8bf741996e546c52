//! State synchronisation between the device client and its observers.
//!
//! [`SyncEngine`] owns three published values: whether we are connected,
//! the latest [`OvenState`], and a bounded [`HistoryBuffer`] of
//! temperatures. Observers hold `watch::Receiver`s and never write.
//!
//! Each value also has its own channel, updated one after the other. An
//! observer that needs the snapshot and the history to agree should watch
//! [`Telemetry`] instead, which carries both and changes in one step.
//!
//! While connected, a single subscription task consumes the client's status
//! stream and publishes each snapshot. Lifecycle operations are serialised,
//! and any running subscription is cancelled and joined before the
//! underlying session is touched, so two pollers never publish at once and
//! none outlives its session.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::CommunicationService;
use crate::error::{self, TransportError};
use crate::tracing::prelude::*;
use crate::types::{DEFAULT_HISTORY_CAPACITY, HistoryBuffer, OvenState, ReflowProfile};

/// The latest snapshot together with the history it was appended to.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    pub oven_state: OvenState,
    pub history: HistoryBuffer,
}

/// The values observers can watch.
struct Published {
    connected: watch::Sender<bool>,
    oven_state: watch::Sender<OvenState>,
    history: watch::Sender<HistoryBuffer>,
    telemetry: watch::Sender<Telemetry>,
}

impl Published {
    fn new(history_capacity: usize) -> Self {
        Self {
            connected: watch::Sender::new(false),
            oven_state: watch::Sender::new(OvenState::default()),
            history: watch::Sender::new(HistoryBuffer::new(history_capacity)),
            telemetry: watch::Sender::new(Telemetry {
                oven_state: OvenState::default(),
                history: HistoryBuffer::new(history_capacity),
            }),
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }

    fn reset_oven_state(&self) {
        let changed = self.oven_state.send_if_modified(|current| {
            let changed = !current.is_idle();
            *current = OvenState::default();
            changed
        });
        if changed {
            self.telemetry
                .send_modify(|t| t.oven_state = OvenState::default());
        }
    }

    fn clear_history(&self) {
        let changed = self.history.send_if_modified(|history| {
            let changed = history.total_pushed() > 0;
            history.clear();
            changed
        });
        if changed {
            self.telemetry.send_modify(|t| t.history.clear());
        }
    }

    fn publish(&self, state: OvenState) {
        let temperature = state.current_temperature;
        self.telemetry.send_modify(|t| {
            t.oven_state = state.clone();
            t.history.push(temperature);
        });
        self.oven_state.send_replace(state);
        self.history.send_modify(|history| history.push(temperature));
    }
}

/// A running status subscription.
struct Subscription {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    fn spawn(states: BoxStream<'static, OvenState>, published: Arc<Published>) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_subscription(states, published, cancel.clone()));
        Self { cancel, handle }
    }

    /// Cancel and wait for the task to finish.
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                error!(error = %e, "Status subscription panicked");
            }
        }
    }
}

async fn run_subscription(
    mut states: BoxStream<'static, OvenState>,
    published: Arc<Published>,
    cancel: CancellationToken,
) {
    trace!("Status subscription started");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                trace!("Status subscription cancelled");
                return;
            }

            next = states.next() => match next {
                Some(state) => {
                    trace!(
                        temp_c = state.current_temperature,
                        target_c = state.target_temperature,
                        stage = %state.stage,
                        "Oven state"
                    );
                    published.publish(state);
                }
                None => {
                    info!("Oven status stream ended, marking disconnected");
                    published.set_connected(false);
                    return;
                }
            }
        }
    }
}

/// Keeps observable oven state in step with a [`CommunicationService`].
pub struct SyncEngine<S: CommunicationService> {
    service: S,
    published: Arc<Published>,

    /// The active subscription, if any. Also serialises connect and
    /// disconnect against each other.
    lifecycle: Mutex<Option<Subscription>>,
}

impl<S: CommunicationService> SyncEngine<S> {
    pub fn new(service: S) -> Self {
        Self::with_history_capacity(service, DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(service: S, history_capacity: usize) -> Self {
        Self {
            service,
            published: Arc::new(Published::new(history_capacity)),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Connect to an oven and start publishing its telemetry.
    ///
    /// Any existing subscription is stopped before the client opens the new
    /// session. On success the history restarts from zero and a fresh
    /// subscription begins; on failure nothing is left polling and
    /// `is_connected` is false.
    pub async fn connect(&self, host: &str, port: u16) -> bool {
        let mut active = self.lifecycle.lock().await;

        if let Some(previous) = active.take() {
            debug!("Stopping previous status subscription");
            previous.stop().await;
        }
        // The client drops any old session while connecting, and this
        // future may be abandoned before it reports back.
        self.published.set_connected(false);

        let mut results = self.service.connect(host, port);
        let mut connected = false;

        while let Some(ok) = results.next().await {
            connected = ok;
            if ok {
                self.published.clear_history();
                self.published.set_connected(true);
                *active = Some(Subscription::spawn(
                    self.service.oven_states(),
                    Arc::clone(&self.published),
                ));
                info!(host, port, "Oven connected, polling status");
            } else {
                self.published.set_connected(false);
                warn!(host, port, "Could not connect to oven");
            }
        }

        connected
    }

    /// Stop polling, close the session, and return to the idle state.
    ///
    /// Safe to call when already disconnected; nothing observable changes.
    pub async fn disconnect(&self) {
        let mut active = self.lifecycle.lock().await;

        // The subscription must be gone before the session is closed
        // underneath it.
        if let Some(subscription) = active.take() {
            subscription.stop().await;
        }
        self.service.disconnect().await;

        self.published.set_connected(false);
        self.published.reset_oven_state();
        self.published.clear_history();
    }

    /// Start a run. History is cleared first since this is a new process.
    pub async fn start_oven(&self, profile: &ReflowProfile) -> Result<(), TransportError> {
        self.published.clear_history();
        let result = self.service.start_oven(profile).await;
        match &result {
            Ok(()) => info!(profile = %profile.name, "Started oven"),
            Err(e) => warn!(profile = %profile.name, error = %e, "Failed to start oven"),
        }
        result
    }

    /// Validate `profile`, then start it. An invalid profile never reaches
    /// the oven and leaves the history untouched.
    pub async fn run_profile(&self, profile: &ReflowProfile) -> error::Result<()> {
        profile.validate()?;
        self.start_oven(profile).await?;
        Ok(())
    }

    pub async fn send_profile(&self, profile: &ReflowProfile) -> Result<(), TransportError> {
        let result = self.service.send_profile(profile).await;
        if let Err(e) = &result {
            warn!(profile = %profile.name, error = %e, "Failed to send profile");
        }
        result
    }

    pub async fn stop_oven(&self) -> Result<(), TransportError> {
        let result = self.service.stop_oven().await;
        match &result {
            Ok(()) => info!("Stopped oven"),
            Err(e) => warn!(error = %e, "Failed to stop oven"),
        }
        result
    }

    /// Whether a status subscription is currently running.
    pub async fn is_polling(&self) -> bool {
        self.lifecycle
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    pub fn is_connected(&self) -> bool {
        *self.published.connected.borrow()
    }

    pub fn oven_state(&self) -> OvenState {
        self.published.oven_state.borrow().clone()
    }

    pub fn history(&self) -> HistoryBuffer {
        self.published.history.borrow().clone()
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.published.connected.subscribe()
    }

    pub fn subscribe_oven_state(&self) -> watch::Receiver<OvenState> {
        self.published.oven_state.subscribe()
    }

    pub fn subscribe_history(&self) -> watch::Receiver<HistoryBuffer> {
        self.published.history.subscribe()
    }

    pub fn telemetry(&self) -> Telemetry {
        self.published.telemetry.borrow().clone()
    }

    pub fn subscribe_telemetry(&self) -> watch::Receiver<Telemetry> {
        self.published.telemetry.subscribe()
    }
}

impl<S: CommunicationService> Drop for SyncEngine<S> {
    fn drop(&mut self) {
        if let Some(subscription) = self.lifecycle.get_mut().take() {
            subscription.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream;
    use parking_lot::Mutex as SyncMutex;
    use tokio::sync::mpsc;
    use tokio::time;
    use tokio_stream::wrappers::{IntervalStream, UnboundedReceiverStream};

    use crate::types::ProfileStage;

    const WAIT: Duration = Duration::from_secs(30);

    /// Decrements the live-stream counter when a status stream is dropped.
    struct StreamGuard(Arc<AtomicUsize>);

    impl Drop for StreamGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeInner {
        connect_results: SyncMutex<VecDeque<bool>>,
        feeds: SyncMutex<Vec<mpsc::UnboundedSender<OvenState>>>,
        live_streams: Arc<AtomicUsize>,
        streams_created: AtomicUsize,
        calls: SyncMutex<Vec<String>>,
        live_streams_at_disconnect: SyncMutex<Vec<usize>>,
        ticking: SyncMutex<Option<Duration>>,
        hang_connects: AtomicBool,
    }

    /// Scripted service. Each status stream is fed by hand through
    /// [`emit`](Self::emit), or by the clock when ticking is enabled.
    #[derive(Clone, Default)]
    struct FakeService {
        inner: Arc<FakeInner>,
    }

    impl FakeService {
        fn failing_next_connect(&self) {
            self.inner.connect_results.lock().push_back(false);
        }

        /// Later connect attempts never report back.
        fn hanging_connects(&self) {
            self.inner.hang_connects.store(true, Ordering::SeqCst);
        }

        fn ticking(period: Duration) -> Self {
            let fake = Self::default();
            *fake.inner.ticking.lock() = Some(period);
            fake
        }

        /// Send a sample to every status stream created so far.
        fn emit(&self, temperature: f32) {
            for feed in self.inner.feeds.lock().iter() {
                let _ = feed.send(sample(temperature));
            }
        }

        /// End every status stream, as if the device went away.
        fn hang_up(&self) {
            self.inner.feeds.lock().clear();
        }

        fn live_streams(&self) -> usize {
            self.inner.live_streams.load(Ordering::SeqCst)
        }

        fn streams_created(&self) -> usize {
            self.inner.streams_created.load(Ordering::SeqCst)
        }

        fn calls(&self) -> Vec<String> {
            self.inner.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CommunicationService for FakeService {
        fn connect(&self, host: &str, port: u16) -> BoxStream<'static, bool> {
            self.inner.calls.lock().push(format!("connect {host}:{port}"));
            if self.inner.hang_connects.load(Ordering::SeqCst) {
                return stream::pending().boxed();
            }
            let ok = self.inner.connect_results.lock().pop_front().unwrap_or(true);
            stream::once(async move { ok }).boxed()
        }

        async fn disconnect(&self) {
            self.inner.calls.lock().push("disconnect".into());
            self.inner
                .live_streams_at_disconnect
                .lock()
                .push(self.live_streams());
        }

        async fn send_profile(&self, profile: &ReflowProfile) -> Result<(), TransportError> {
            self.inner.calls.lock().push(format!("profile {}", profile.name));
            Ok(())
        }

        async fn start_oven(&self, profile: &ReflowProfile) -> Result<(), TransportError> {
            self.inner.calls.lock().push(format!("start {}", profile.name));
            Ok(())
        }

        async fn stop_oven(&self) -> Result<(), TransportError> {
            self.inner.calls.lock().push("stop".into());
            Err(TransportError::NotConnected)
        }

        fn oven_states(&self) -> BoxStream<'static, OvenState> {
            self.inner.streams_created.fetch_add(1, Ordering::SeqCst);
            self.inner.live_streams.fetch_add(1, Ordering::SeqCst);
            let guard = StreamGuard(Arc::clone(&self.inner.live_streams));

            let states = match *self.inner.ticking.lock() {
                Some(period) => {
                    let mut temperature = 25.0;
                    IntervalStream::new(time::interval(period))
                        .map(move |_| {
                            temperature += 1.0;
                            sample(temperature)
                        })
                        .boxed()
                }
                None => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    self.inner.feeds.lock().push(tx);
                    UnboundedReceiverStream::new(rx).boxed()
                }
            };

            states
                .map(move |state| {
                    let _ = &guard;
                    state
                })
                .boxed()
        }
    }

    fn sample(temperature: f32) -> OvenState {
        OvenState {
            current_temperature: temperature,
            target_temperature: 150.0,
            stage: "HEATING".into(),
            time_elapsed: 0,
            status: "HEATING".into(),
        }
    }

    async fn wait_for_samples(engine: &SyncEngine<FakeService>, total: u32) {
        let mut history = engine.subscribe_history();
        time::timeout(WAIT, history.wait_for(|h| h.total_pushed() >= total))
            .await
            .expect("timed out waiting for samples")
            .expect("history channel closed");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_publishes_incoming_state() {
        let fake = FakeService::default();
        let engine = SyncEngine::new(fake.clone());

        assert!(engine.connect("1.2.3.4", 9999).await);
        assert!(engine.is_connected());

        fake.emit(150.5);
        wait_for_samples(&engine, 1).await;

        assert_eq!(engine.oven_state().current_temperature, 150.5);
        assert_eq!(engine.oven_state().status, "HEATING");
        assert_eq!(engine.history().len(), 1);
        assert_eq!(fake.calls(), vec!["connect 1.2.3.4:9999"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_leaves_nothing_polling() {
        let fake = FakeService::default();
        fake.failing_next_connect();
        let engine = SyncEngine::new(fake.clone());

        assert!(!engine.connect("192.168.1.50", 8080).await);
        assert!(!engine.is_connected());
        assert!(!engine.is_polling().await);
        assert_eq!(fake.streams_created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_stops_existing_subscription() {
        let fake = FakeService::default();
        let engine = SyncEngine::new(fake.clone());
        assert!(engine.connect("oven", 8080).await);

        fake.failing_next_connect();
        assert!(!engine.connect("oven", 8080).await);

        assert!(!engine.is_connected());
        assert!(!engine.is_polling().await);
        assert_eq!(fake.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn history_keeps_latest_samples() {
        let fake = FakeService::default();
        let engine = SyncEngine::new(fake.clone());
        assert!(engine.connect("oven", 8080).await);

        for i in 0..130 {
            fake.emit(i as f32);
        }
        wait_for_samples(&engine, 130).await;

        let history = engine.history();
        assert_eq!(history.len(), 120);
        let temps: Vec<f32> = history.iter().map(|p| p.temperature).collect();
        let expected: Vec<f32> = (10..130).map(|i| i as f32).collect();
        assert_eq!(temps, expected);
        assert_eq!(engine.oven_state().current_temperature, 129.0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_keeps_single_subscription() {
        let fake = FakeService::default();
        let engine = SyncEngine::new(fake.clone());

        assert!(engine.connect("oven", 8080).await);
        fake.emit(30.0);
        wait_for_samples(&engine, 1).await;

        assert!(engine.connect("oven", 8080).await);
        assert_eq!(fake.streams_created(), 2);
        assert_eq!(fake.live_streams(), 1);
        assert!(engine.history().is_empty(), "reconnect clears history");

        // Only the live stream is consumed, so each sample lands once.
        fake.emit(31.0);
        fake.emit(32.0);
        wait_for_samples(&engine, 2).await;

        let temps: Vec<f32> = engine.history().iter().map(|p| p.temperature).collect();
        assert_eq!(temps, vec![31.0, 32.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_reconnect_is_not_connected() {
        let fake = FakeService::default();
        let engine = SyncEngine::new(fake.clone());
        assert!(engine.connect("a", 1).await);
        assert!(engine.is_connected());

        fake.hanging_connects();
        let attempt = time::timeout(Duration::from_millis(50), engine.connect("b", 2)).await;
        assert!(attempt.is_err());

        assert!(!engine.is_connected());
        assert!(!engine.is_polling().await);
        assert_eq!(fake.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_pairs_state_with_its_history() {
        let fake = FakeService::default();
        let engine = SyncEngine::new(fake.clone());
        let mut telemetry = engine.subscribe_telemetry();
        assert!(engine.connect("oven", 8080).await);

        for i in 0..20 {
            fake.emit(100.0 + i as f32);
        }

        let mut seen = 0;
        while seen < 20 {
            time::timeout(WAIT, telemetry.changed())
                .await
                .expect("timed out waiting for telemetry")
                .unwrap();
            let current = telemetry.borrow_and_update();
            assert_eq!(
                current.history.latest().map(|p| p.temperature),
                Some(current.oven_state.current_temperature)
            );
            seen = current.history.total_pushed();
        }

        engine.disconnect().await;
        let cleared = engine.telemetry();
        assert!(cleared.history.is_empty());
        assert_eq!(cleared.oven_state, OvenState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn start_clears_history_before_forwarding() {
        let fake = FakeService::default();
        let engine = SyncEngine::new(fake.clone());
        assert!(engine.connect("192.168.1.50", 8080).await);

        fake.emit(25.0);
        fake.emit(30.0);
        wait_for_samples(&engine, 2).await;
        assert_eq!(engine.history().len(), 2);

        let profile = ReflowProfile::new("Test", vec![]);
        engine.start_oven(&profile).await.unwrap();

        assert!(engine.history().is_empty());
        assert_eq!(engine.history().total_pushed(), 0);
        assert_eq!(fake.calls().last().map(String::as_str), Some("start Test"));

        // The series restarts at index zero.
        fake.emit(35.0);
        wait_for_samples(&engine, 1).await;
        assert_eq!(engine.history().latest().unwrap().index, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_profile_is_not_started() {
        let fake = FakeService::default();
        let engine = SyncEngine::new(fake.clone());
        assert!(engine.connect("oven", 8080).await);
        fake.emit(40.0);
        wait_for_samples(&engine, 1).await;

        let empty = ReflowProfile::new("Nothing", vec![]);
        let result = engine.run_profile(&empty).await;

        assert!(matches!(result, Err(crate::error::Error::Profile(_))));
        assert_eq!(engine.history().len(), 1);
        assert_eq!(fake.calls(), vec!["connect oven:8080"]);

        engine.run_profile(&ReflowProfile::leaded()).await.unwrap();
        assert!(engine.history().is_empty());
        assert_eq!(fake.calls().last().map(String::as_str), Some("start Leaded"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_resets_everything() {
        let fake = FakeService::default();
        let engine = SyncEngine::new(fake.clone());
        assert!(engine.connect("oven", 8080).await);
        fake.emit(200.0);
        wait_for_samples(&engine, 1).await;

        engine.disconnect().await;

        assert!(!engine.is_connected());
        assert_eq!(engine.oven_state(), OvenState::default());
        assert!(engine.history().is_empty());
        assert!(!engine.is_polling().await);
        assert_eq!(fake.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_before_closing_session() {
        let fake = FakeService::default();
        let engine = SyncEngine::new(fake.clone());
        assert!(engine.connect("oven", 8080).await);
        assert_eq!(fake.live_streams(), 1);

        engine.disconnect().await;

        assert_eq!(*fake.inner.live_streams_at_disconnect.lock(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_when_idle_changes_nothing() {
        let fake = FakeService::default();
        let engine = SyncEngine::new(fake.clone());
        let mut connected = engine.subscribe_connected();
        let mut state = engine.subscribe_oven_state();
        let mut history = engine.subscribe_history();

        engine.disconnect().await;
        engine.disconnect().await;

        assert!(!connected.has_changed().unwrap());
        assert!(!state.has_changed().unwrap());
        assert!(!history.has_changed().unwrap());
        assert!(!*connected.borrow_and_update());
        assert_eq!(*state.borrow_and_update(), OvenState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_end_marks_disconnected_but_keeps_last_state() {
        let fake = FakeService::default();
        let engine = SyncEngine::new(fake.clone());
        let mut connected = engine.subscribe_connected();
        assert!(engine.connect("oven", 8080).await);

        fake.emit(180.0);
        wait_for_samples(&engine, 1).await;
        fake.hang_up();

        time::timeout(WAIT, connected.wait_for(|c| !*c))
            .await
            .expect("engine should notice the stream ending")
            .unwrap();
        assert_eq!(engine.oven_state().current_temperature, 180.0);
        assert_eq!(engine.history().len(), 1);
        assert!(!engine.is_polling().await);
    }

    #[tokio::test(start_paused = true)]
    async fn history_follows_virtual_clock() {
        let fake = FakeService::ticking(Duration::from_secs(1));
        let engine = SyncEngine::new(fake.clone());
        assert!(engine.connect("oven", 8080).await);

        // The first interval tick fires immediately.
        wait_for_samples(&engine, 1).await;
        assert_eq!(engine.history().len(), 1);

        time::advance(Duration::from_secs(9)).await;
        wait_for_samples(&engine, 10).await;

        let history = engine.history();
        assert_eq!(history.len(), 10);
        assert_eq!(history.latest().unwrap().temperature, 35.0);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_forward_without_touching_state() {
        let fake = FakeService::default();
        let engine = SyncEngine::new(fake.clone());
        assert!(engine.connect("oven", 8080).await);
        fake.emit(60.0);
        wait_for_samples(&engine, 1).await;

        let profile = ReflowProfile::new("Custom", vec![ProfileStage::new("Bake", 120.0, 600)]);
        engine.send_profile(&profile).await.unwrap();
        assert!(matches!(
            engine.stop_oven().await,
            Err(TransportError::NotConnected)
        ));

        assert_eq!(engine.history().len(), 1);
        assert_eq!(engine.oven_state().current_temperature, 60.0);
        assert_eq!(
            fake.calls(),
            vec!["connect oven:8080", "profile Custom", "stop"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_engine_stops_polling() {
        let fake = FakeService::default();
        let engine = SyncEngine::new(fake.clone());
        assert!(engine.connect("oven", 8080).await);
        assert_eq!(fake.live_streams(), 1);

        drop(engine);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fake.live_streams(), 0);
    }
}
