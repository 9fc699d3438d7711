//! Inference Dispatch
//!
//! Bridges decoded frames to the configured [`RecognitionProvider`] without
//! ever blocking the session loop. Each session gets its own [`DispatchLane`];
//! all lanes share the provider and a process-wide in-flight budget.
//!
//! Backpressure is drop-newest: a frame arriving while either the session or
//! the global budget is exhausted is rejected with
//! [`DispatchError::Overloaded`] instead of being queued.

use crate::{
    frame::Frame,
    provider::RecognitionProvider,
    reorder::{Release, ReorderBuffer},
    types::{Prediction, SessionId, TranslationResult},
};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, warn};

/// Which in-flight budget rejected a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverloadScope {
    Session,
    Global,
}

impl fmt::Display for OverloadScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverloadScope::Session => write!(f, "per-session"),
            OverloadScope::Global => write!(f, "global"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("{scope} in-flight limit of {limit} reached; frame dropped")]
    Overloaded { scope: OverloadScope, limit: usize },
    #[error("recognition provider failed: {0}")]
    ProviderFailure(String),
    #[error("dispatch lane is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimits {
    pub max_in_flight_per_session: usize,
    pub max_in_flight_global: usize,
    pub reorder_window: usize,
    pub inference_timeout: Duration,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            max_in_flight_per_session: 4,
            max_in_flight_global: 64,
            reorder_window: 16,
            inference_timeout: Duration::from_secs(5),
        }
    }
}

/// Process-wide owner of the recognition provider and the global budget.
pub struct InferenceDispatcher {
    provider: Arc<dyn RecognitionProvider>,
    limits: DispatchLimits,
    global_in_flight: Arc<AtomicUsize>,
}

impl InferenceDispatcher {
    pub fn new(provider: Arc<dyn RecognitionProvider>, limits: DispatchLimits) -> Self {
        Self {
            provider,
            limits,
            global_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn limits(&self) -> &DispatchLimits {
        &self.limits
    }

    /// Inference calls currently counted against the global budget.
    pub fn in_flight(&self) -> usize {
        self.global_in_flight.load(Ordering::Acquire)
    }

    /// Opens a lane for one session. Results for that session, and only that
    /// session, arrive on the returned receiver in submission order.
    pub fn open_lane(
        &self,
        session_id: SessionId,
    ) -> (DispatchLane, mpsc::UnboundedReceiver<TranslationResult>) {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let lane = DispatchLane {
            session_id,
            provider: Arc::clone(&self.provider),
            limits: self.limits,
            global_in_flight: Arc::clone(&self.global_in_flight),
            next_ticket: 0,
            state: Arc::new(Mutex::new(LaneState {
                closed: false,
                in_flight: 0,
                reorder: ReorderBuffer::new(self.limits.reorder_window),
                results: Some(results_tx),
            })),
            closed_tx: watch::channel(false).0,
        };
        (lane, results_rx)
    }
}

struct LaneState {
    closed: bool,
    in_flight: usize,
    reorder: ReorderBuffer<TranslationResult>,
    results: Option<mpsc::UnboundedSender<TranslationResult>>,
}

/// A session's handle on the dispatcher. Closing (or dropping) the lane
/// releases its share of the global budget immediately.
pub struct DispatchLane {
    session_id: SessionId,
    provider: Arc<dyn RecognitionProvider>,
    limits: DispatchLimits,
    global_in_flight: Arc<AtomicUsize>,
    next_ticket: u64,
    state: Arc<Mutex<LaneState>>,
    closed_tx: watch::Sender<bool>,
}

impl DispatchLane {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Inference calls this session currently has outstanding.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Hands `frame` to the provider on a background task.
    ///
    /// Returns as soon as the frame is accepted or rejected. Provider failures
    /// happen later and are only logged; the frame then produces no result.
    ///
    /// A call that exceeds the inference timeout gives up its result right
    /// away but keeps its slot until the provider actually returns, so a
    /// hung recognizer cannot be stacked up behind more work.
    pub fn submit(&mut self, frame: Frame) -> Result<(), DispatchError> {
        let slot = self.reserve()?;

        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let provider = Arc::clone(&self.provider);
        let state = Arc::clone(&self.state);
        let mut closed = self.closed_tx.subscribe();
        let timeout = self.limits.inference_timeout;
        let session_id = self.session_id;
        let sequence = frame.sequence_number;

        tokio::spawn(
            async move {
                let mut call = provider.predict(frame.pixels);
                match tokio::time::timeout(timeout, &mut call).await {
                    Ok(outcome) => {
                        drop(slot);
                        let outcome = outcome
                            .map_err(|e| DispatchError::ProviderFailure(format!("{e:#}")));
                        deliver(&state, provider.name(), session_id, ticket, sequence, outcome);
                    }
                    Err(_) => {
                        let failure = DispatchError::ProviderFailure(format!(
                            "timed out after {timeout:?}"
                        ));
                        deliver(&state, provider.name(), session_id, ticket, sequence, Err(failure));
                        tokio::select! {
                            _ = &mut call => {}
                            _ = lane_closed(&mut closed) => {}
                        }
                        debug!(%session_id, sequence, "Timed-out inference call settled; releasing its slot");
                        drop(slot);
                    }
                }
            }
            .in_current_span(),
        );

        Ok(())
    }

    /// Stops delivery for this session and returns its slots to the global
    /// budget. Calls still within their timeout run to completion but their
    /// results are discarded; calls that already timed out are abandoned.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let released = std::mem::take(&mut state.in_flight);
        self.global_in_flight.fetch_sub(released, Ordering::AcqRel);
        state.reorder.clear();
        state.results = None;
        drop(state);
        self.closed_tx.send_replace(true);
        debug!(session_id = %self.session_id, released, "Dispatch lane closed");
    }

    fn reserve(&self) -> Result<InFlightSlot, DispatchError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DispatchError::Closed);
        }
        if state.in_flight >= self.limits.max_in_flight_per_session {
            return Err(DispatchError::Overloaded {
                scope: OverloadScope::Session,
                limit: self.limits.max_in_flight_per_session,
            });
        }
        let limit = self.limits.max_in_flight_global;
        self.global_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| DispatchError::Overloaded {
                scope: OverloadScope::Global,
                limit,
            })?;
        state.in_flight += 1;
        drop(state);

        Ok(InFlightSlot {
            state: Arc::clone(&self.state),
            global_in_flight: Arc::clone(&self.global_in_flight),
        })
    }
}

impl Drop for DispatchLane {
    fn drop(&mut self) {
        self.close();
    }
}

/// One unit of a lane's budget, counted against both caps until dropped.
struct InFlightSlot {
    state: Arc<Mutex<LaneState>>,
    global_in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        // Closing the lane already returned every slot it had out.
        if state.closed {
            return;
        }
        state.in_flight = state.in_flight.saturating_sub(1);
        self.global_in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Resolves once the lane has been closed or dropped.
async fn lane_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Records the outcome of one inference call and forwards whatever the
/// reorder buffer releases.
fn deliver(
    state: &Mutex<LaneState>,
    provider: &str,
    session_id: SessionId,
    ticket: u64,
    sequence: u64,
    outcome: Result<Prediction, DispatchError>,
) {
    let mut state = state.lock();
    if state.closed {
        debug!(%session_id, sequence, "Discarding inference result for closed session");
        return;
    }

    let item = match outcome {
        Ok(prediction) => Some(TranslationResult::from_prediction(
            session_id, sequence, prediction,
        )),
        Err(e) => {
            warn!(%session_id, sequence, provider, error = %e, "Inference failed; frame produces no translation");
            None
        }
    };

    match state.reorder.push(ticket, item) {
        Release::Stale => {
            warn!(%session_id, sequence, ticket, "Discarding stale inference result behind the reorder window");
        }
        Release::Ready { ready, skipped } => {
            if skipped > 0 {
                warn!(%session_id, skipped, "Reorder window full; gave up waiting on slow inferences");
            }
            if let Some(results) = &state.results {
                for result in ready {
                    if results.send(result).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::PixelBuffer,
        provider::{BlockingProvider, ConstantProvider, MockRecognitionProvider, Recognizer},
    };
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    /// Sleeps `width * 10ms`, then labels the frame with its width.
    struct SlowProvider;

    #[async_trait]
    impl RecognitionProvider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn predict(&self, pixels: PixelBuffer) -> anyhow::Result<Prediction> {
            tokio::time::sleep(Duration::from_millis(pixels.width() as u64 * 10)).await;
            Ok(Prediction::new(format!("w{}", pixels.width()), 0.8))
        }
    }

    /// Never answers.
    struct StuckProvider;

    #[async_trait]
    impl RecognitionProvider for StuckProvider {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn predict(&self, _pixels: PixelBuffer) -> anyhow::Result<Prediction> {
            std::future::pending().await
        }
    }

    fn frame(session_id: SessionId, sequence_number: u64, width: u32) -> Frame {
        Frame {
            session_id,
            sequence_number,
            pixels: PixelBuffer::from_bgr(width, 1, vec![0; width as usize * 3]).unwrap(),
            captured_at: Utc::now(),
        }
    }

    fn limits(per_session: usize, global: usize) -> DispatchLimits {
        DispatchLimits {
            max_in_flight_per_session: per_session,
            max_in_flight_global: global,
            reorder_window: 16,
            inference_timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_follow_submission_order() {
        let dispatcher = InferenceDispatcher::new(Arc::new(SlowProvider), limits(8, 8));
        let id = Uuid::new_v4();
        let (mut lane, mut rx) = dispatcher.open_lane(id);

        // Later frames finish first.
        for (seq, width) in [(1, 5), (2, 3), (3, 1)] {
            lane.submit(frame(id, seq, width)).unwrap();
        }

        let mut sequences = Vec::new();
        for _ in 0..3 {
            let result = rx.recv().await.unwrap();
            assert_eq!(result.session_id, id);
            sequences.push(result.frame_sequence_number);
        }
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(lane.in_flight(), 0);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_session_cap_drops_newest() {
        let dispatcher = InferenceDispatcher::new(Arc::new(StuckProvider), limits(2, 10));
        let id = Uuid::new_v4();
        let (mut lane, _rx) = dispatcher.open_lane(id);

        lane.submit(frame(id, 1, 1)).unwrap();
        lane.submit(frame(id, 2, 1)).unwrap();
        let err = lane.submit(frame(id, 3, 1)).unwrap_err();

        assert_eq!(
            err,
            DispatchError::Overloaded {
                scope: OverloadScope::Session,
                limit: 2
            }
        );
        assert_eq!(lane.in_flight(), 2);
        assert_eq!(dispatcher.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_global_cap_spans_sessions() {
        let dispatcher = InferenceDispatcher::new(Arc::new(StuckProvider), limits(4, 3));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (mut lane_a, _rx_a) = dispatcher.open_lane(a);
        let (mut lane_b, _rx_b) = dispatcher.open_lane(b);

        lane_a.submit(frame(a, 1, 1)).unwrap();
        lane_a.submit(frame(a, 2, 1)).unwrap();
        lane_b.submit(frame(b, 1, 1)).unwrap();
        let err = lane_b.submit(frame(b, 2, 1)).unwrap_err();

        assert!(matches!(
            err,
            DispatchError::Overloaded {
                scope: OverloadScope::Global,
                ..
            }
        ));
        assert_eq!(dispatcher.in_flight(), 3);
        assert_eq!(lane_b.in_flight(), 1);

        // Closing one session frees its share for the other.
        lane_a.close();
        assert_eq!(dispatcher.in_flight(), 1);
        lane_b.submit(frame(b, 3, 1)).unwrap();
        assert_eq!(dispatcher.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_provider_failure_skips_only_that_frame() {
        let mut provider = MockRecognitionProvider::new();
        provider.expect_name().return_const("mock");
        provider.expect_predict().times(2).returning(|pixels| {
            if pixels.width() == 1 {
                Err(anyhow!("model exploded"))
            } else {
                Ok(Prediction::new("thanks", 0.6))
            }
        });
        let dispatcher = InferenceDispatcher::new(Arc::new(provider), limits(4, 4));
        let id = Uuid::new_v4();
        let (mut lane, mut rx) = dispatcher.open_lane(id);

        lane.submit(frame(id, 1, 1)).unwrap();
        lane.submit(frame(id, 2, 2)).unwrap();

        let result = rx.recv().await.unwrap();
        assert_eq!(result.frame_sequence_number, 2);
        assert_eq!(result.label, "thanks");
        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_gives_up_result_but_keeps_slot() {
        let dispatcher = InferenceDispatcher::new(
            Arc::new(SlowProvider),
            DispatchLimits {
                inference_timeout: Duration::from_millis(50),
                ..limits(2, 2)
            },
        );
        let id = Uuid::new_v4();
        let (mut lane, mut rx) = dispatcher.open_lane(id);

        // Width 10 takes 100ms and times out; width 1 takes 10ms.
        lane.submit(frame(id, 1, 10)).unwrap();
        lane.submit(frame(id, 2, 1)).unwrap();

        let result = rx.recv().await.unwrap();
        assert_eq!(result.frame_sequence_number, 2);
        assert_eq!(lane.in_flight(), 1);
        assert_eq!(dispatcher.in_flight(), 1);

        lane.submit(frame(id, 3, 1)).unwrap();
        assert_eq!(
            lane.submit(frame(id, 4, 1)),
            Err(DispatchError::Overloaded {
                scope: OverloadScope::Session,
                limit: 2
            })
        );

        let result = rx.recv().await.unwrap();
        assert_eq!(result.frame_sequence_number, 3);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lane.in_flight(), 0);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_holds_slot_until_close() {
        let dispatcher = InferenceDispatcher::new(
            Arc::new(StuckProvider),
            DispatchLimits {
                inference_timeout: Duration::from_millis(50),
                ..limits(1, 1)
            },
        );
        let id = Uuid::new_v4();
        let (mut lane, mut rx) = dispatcher.open_lane(id);

        lane.submit(frame(id, 1, 1)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.in_flight(), 1);
        assert!(matches!(
            lane.submit(frame(id, 2, 1)),
            Err(DispatchError::Overloaded { .. })
        ));

        lane.close();
        tokio::task::yield_now().await;
        assert_eq!(dispatcher.in_flight(), 0);
    }

    /// Sleeps on the blocking pool and records how many calls overlap.
    struct SleepyRecognizer {
        delay: Duration,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl SleepyRecognizer {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Recognizer for SleepyRecognizer {
        fn recognize(&self, _pixels: &PixelBuffer) -> anyhow::Result<Prediction> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Prediction::new("slow", 0.5))
        }
    }

    async fn wait_until_idle(dispatcher: &InferenceDispatcher, running: &AtomicUsize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.in_flight() > 0 || running.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_blocking_call_is_not_stacked() {
        let recognizer = SleepyRecognizer::new(Duration::from_millis(500));
        let (running, peak) = (Arc::clone(&recognizer.running), Arc::clone(&recognizer.peak));
        let dispatcher = InferenceDispatcher::new(
            Arc::new(BlockingProvider::new(recognizer, 1)),
            DispatchLimits {
                inference_timeout: Duration::from_millis(20),
                ..limits(1, 1)
            },
        );
        let id = Uuid::new_v4();
        let (mut lane, mut rx) = dispatcher.open_lane(id);

        let mut accepted = 0;
        for seq in 1..=10 {
            if lane.submit(frame(id, seq, 1)).is_ok() {
                accepted += 1;
            }
            assert!(dispatcher.in_flight() <= 1);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        assert_eq!(accepted, 1);
        assert!(rx.try_recv().is_err());

        wait_until_idle(&dispatcher, &running).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        lane.submit(frame(id, 11, 1)).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_recognizers_never_exceed_global_cap() {
        let recognizer = SleepyRecognizer::new(Duration::from_millis(150));
        let (running, peak) = (Arc::clone(&recognizer.running), Arc::clone(&recognizer.peak));
        let cap = 2;
        let dispatcher = InferenceDispatcher::new(
            Arc::new(BlockingProvider::new(recognizer, cap)),
            DispatchLimits {
                inference_timeout: Duration::from_millis(20),
                ..limits(cap, cap)
            },
        );
        let mut lanes: Vec<_> = (0..3)
            .map(|_| {
                let id = Uuid::new_v4();
                let (lane, rx) = dispatcher.open_lane(id);
                (id, lane, rx)
            })
            .collect();

        for seq in 1..=20 {
            // A closed lane hands its budget back while its recognizer may
            // still be running; the recognizer pool keeps the real count bounded.
            if seq == 8 {
                lanes[0].1.close();
            }
            for (id, lane, _) in lanes.iter_mut() {
                let _ = lane.submit(frame(*id, seq, 1));
            }
            assert!(dispatcher.in_flight() <= cap);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(lanes);
        wait_until_idle(&dispatcher, &running).await;
        assert!(peak.load(Ordering::SeqCst) <= cap);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_lane_discards_late_results() {
        let dispatcher = InferenceDispatcher::new(Arc::new(SlowProvider), limits(4, 4));
        let id = Uuid::new_v4();
        let (mut lane, mut rx) = dispatcher.open_lane(id);

        lane.submit(frame(id, 1, 5)).unwrap();
        assert_eq!(dispatcher.in_flight(), 1);

        lane.close();
        assert!(lane.is_closed());
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(lane.submit(frame(id, 2, 1)), Err(DispatchError::Closed));

        // Let the outstanding call finish; it must neither emit nor release twice.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.recv().await.is_none());
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dropping_lane_releases_budget() {
        let dispatcher = InferenceDispatcher::new(Arc::new(StuckProvider), limits(4, 4));
        let id = Uuid::new_v4();
        {
            let (mut lane, _rx) = dispatcher.open_lane(id);
            lane.submit(frame(id, 1, 1)).unwrap();
            lane.submit(frame(id, 2, 1)).unwrap();
            assert_eq!(dispatcher.in_flight(), 2);
        }
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_lanes_are_isolated() {
        let dispatcher =
            InferenceDispatcher::new(Arc::new(ConstantProvider::new("hello")), limits(4, 8));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (mut lane_a, mut rx_a) = dispatcher.open_lane(a);
        let (_lane_b, mut rx_b) = dispatcher.open_lane(b);

        lane_a.submit(frame(a, 1, 1)).unwrap();
        let result = rx_a.recv().await.unwrap();
        assert_eq!(result.session_id, a);
        assert_eq!(result.label, "hello");
        assert!(rx_b.try_recv().is_err());
    }
}
