//! A size/count/delay batcher for asynchronous uploads.
//!
//! Items are appended to the current bundle in O(1); a bundle is sealed
//! and handed to the handler when it reaches the count or byte
//! threshold, or when its oldest item has waited past the delay
//! threshold. Sealed bundles are dispatched in FIFO order, with handler
//! concurrency capped by `handler_limit`. At the buffered-byte ceiling
//! the caller picks the backpressure mode: [`Bundler::add`] fails fast,
//! [`Bundler::add_wait`] parks until an upload frees capacity.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use duration_str::deserialize_duration;
use serde::Deserialize;
use tokio::sync::{Notify, Semaphore, mpsc};

/// Thresholds controlling when pending items are cut into a bundle.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BundlerOptions {
    /// Flush a bundle once its oldest item has been pending this long.
    #[serde(deserialize_with = "deserialize_duration")]
    pub delay_threshold: Duration,

    /// Flush a bundle once it holds this many items.
    pub bundle_count_threshold: usize,

    /// Flush a bundle once it holds this many bytes.
    pub bundle_byte_threshold: usize,

    /// Hard cap on the bytes a single bundle may hold; zero means no
    /// cap. A cap of 1 makes every submission flush on its own.
    pub bundle_byte_limit: usize,

    /// Ceiling on bytes pending plus in flight. [`Bundler::add`] fails
    /// fast above it; [`Bundler::add_wait`] waits for capacity instead.
    pub buffered_byte_limit: usize,

    /// How many bundles may be handled concurrently.
    pub handler_limit: usize,
}

impl Default for BundlerOptions {
    fn default() -> Self {
        Self {
            delay_threshold: Duration::from_secs(1),
            bundle_count_threshold: 10,
            bundle_byte_threshold: 256 * 1024,
            bundle_byte_limit: 0,
            buffered_byte_limit: 1024 * 1024 * 1024,
            handler_limit: 1,
        }
    }
}

/// A sealed batch of items on its way to the handler.
#[derive(Debug)]
pub struct Bundle<T> {
    /// Monotonic sequence number; bundles are dispatched in order.
    pub seq: u64,
    /// Items in submission order.
    pub items: Vec<T>,
    /// Total size of the items as accounted at submission.
    pub size: usize,
}

/// Receives sealed bundles, one call per bundle.
#[async_trait]
pub trait BundleHandler<T>: Send + Sync + 'static {
    async fn handle(&self, bundle: Bundle<T>);
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A single item larger than the per-bundle cap can never ship.
    #[error("item of {size} bytes exceeds the bundle byte limit of {limit}")]
    Oversized { size: usize, limit: usize },

    /// The buffered-byte ceiling was reached.
    #[error("buffered byte limit of {limit} reached")]
    Overflow { limit: usize },
}

/// Concurrent batching front-end. Cheap to share through the owner; all
/// methods take `&self`.
pub struct Bundler<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    options: BundlerOptions,
    state: Mutex<State<T>>,
    queue: mpsc::UnboundedSender<Bundle<T>>,
    /// Signalled on every handled bundle; wakes `flush` waiters and
    /// `add_wait` callers parked on the buffered-byte ceiling.
    completed: Notify,
}

struct State<T> {
    items: Vec<T>,
    size: usize,
    /// Sequence number of the bundle currently being filled.
    seq: u64,
    /// Bytes pending plus in flight.
    buffered: usize,
    /// Sealed bundles not yet fully handled.
    outstanding: usize,
    timer: Option<tokio::task::JoinHandle<()>>,
}

impl<T: Send + 'static> Bundler<T> {
    /// Create a bundler dispatching sealed bundles to `handler`.
    ///
    /// Must be called within a tokio runtime: dispatch runs on a
    /// background task until the bundler is dropped.
    pub fn new(options: BundlerOptions, handler: impl BundleHandler<T>) -> Self {
        let handler_limit = options.handler_limit.max(1);
        let (queue, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            options,
            state: Mutex::new(State {
                items: Vec::new(),
                size: 0,
                seq: 0,
                buffered: 0,
                outstanding: 0,
                timer: None,
            }),
            queue,
            completed: Notify::new(),
        });
        tokio::spawn(dispatch(
            Arc::downgrade(&inner),
            rx,
            Arc::new(handler),
            handler_limit,
        ));
        Bundler { inner }
    }

    /// Submit one item of the given accounted size. O(1) and never
    /// blocks; fails fast with [`Error::Overflow`] above the
    /// buffered-byte ceiling. [`Bundler::add_wait`] waits instead.
    pub fn add(&self, item: T, size: usize) -> Result<(), Error> {
        self.inner.try_add(item, size).map_err(|(error, _item)| {
            log::warn!("rejecting a {size} byte item: {error}");
            error
        })
    }

    /// Submit one item, waiting for buffered capacity to free up
    /// instead of failing fast. Oversized items are still rejected
    /// immediately.
    pub async fn add_wait(&self, mut item: T, size: usize) -> Result<(), Error> {
        loop {
            let mut freed = std::pin::pin!(self.inner.completed.notified());
            // Register interest before trying so a completion racing
            // with the attempt cannot be missed.
            freed.as_mut().enable();
            match self.inner.try_add(item, size) {
                Ok(()) => return Ok(()),
                Err((Error::Overflow { .. }, returned)) => {
                    item = returned;
                    freed.await;
                }
                Err((error, _item)) => return Err(error),
            }
        }
    }

    /// Seal whatever is pending and wait until every sealed bundle has
    /// been handled.
    pub async fn flush(&self) {
        self.inner.seal();
        loop {
            let mut drained = std::pin::pin!(self.inner.completed.notified());
            // Register interest before the idle check so a completion
            // racing with it cannot be missed.
            drained.as_mut().enable();
            if self.inner.idle() {
                return;
            }
            drained.await;
        }
    }
}

impl<T: Send + 'static> Inner<T> {
    fn state(&self) -> MutexGuard<'_, State<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // Failures hand the item back so `add_wait` can retry it.
    fn try_add(self: &Arc<Self>, item: T, size: usize) -> Result<(), (Error, T)> {
        let options = &self.options;
        let mut state = self.state();

        if options.bundle_byte_limit > 0 && size > options.bundle_byte_limit {
            return Err((
                Error::Oversized {
                    size,
                    limit: options.bundle_byte_limit,
                },
                item,
            ));
        }
        if state.buffered + size > options.buffered_byte_limit {
            return Err((
                Error::Overflow {
                    limit: options.buffered_byte_limit,
                },
                item,
            ));
        }

        // The item would push the current bundle past its hard cap, so
        // that bundle goes out first.
        if options.bundle_byte_limit > 0
            && !state.items.is_empty()
            && state.size + size > options.bundle_byte_limit
        {
            self.seal_locked(&mut state);
        }

        let was_empty = state.items.is_empty();
        state.items.push(item);
        state.size += size;
        state.buffered += size;

        if state.items.len() >= options.bundle_count_threshold.max(1)
            || state.size >= options.bundle_byte_threshold
            || (options.bundle_byte_limit > 0 && state.size >= options.bundle_byte_limit)
        {
            self.seal_locked(&mut state);
        } else if was_empty {
            let seq = state.seq;
            let delay = options.delay_threshold;
            let weak = Arc::downgrade(self);
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    inner.seal_if_current(seq);
                }
            }));
        }
        Ok(())
    }

    fn seal(&self) {
        let mut state = self.state();
        self.seal_locked(&mut state);
    }

    // Fired by the delay timer; a bundle sealed early has already moved
    // the sequence number on.
    fn seal_if_current(&self, seq: u64) {
        let mut state = self.state();
        if state.seq == seq {
            self.seal_locked(&mut state);
        }
    }

    fn seal_locked(&self, state: &mut State<T>) {
        if state.items.is_empty() {
            return;
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let bundle = Bundle {
            seq: state.seq,
            items: std::mem::take(&mut state.items),
            size: std::mem::replace(&mut state.size, 0),
        };
        state.seq += 1;
        state.outstanding += 1;
        log::debug!(
            "sealed bundle #{} ({} items, {} bytes)",
            bundle.seq,
            bundle.items.len(),
            bundle.size
        );
        // The receiver lives as long as this `Inner`.
        let _ = self.queue.send(bundle);
    }

    fn idle(&self) -> bool {
        let state = self.state();
        state.outstanding == 0 && state.items.is_empty()
    }

    fn complete(&self, size: usize) {
        let mut state = self.state();
        state.buffered -= size;
        state.outstanding -= 1;
        drop(state);
        self.completed.notify_waiters();
    }
}

async fn dispatch<T: Send + 'static>(
    inner: Weak<Inner<T>>,
    mut queue: mpsc::UnboundedReceiver<Bundle<T>>,
    handler: Arc<dyn BundleHandler<T>>,
    handler_limit: usize,
) {
    let permits = Arc::new(Semaphore::new(handler_limit));
    while let Some(bundle) = queue.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            return;
        };
        let inner = inner.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let size = bundle.size;
            handler.handle(bundle).await;
            drop(permit);
            if let Some(inner) = inner.upgrade() {
                inner.complete(size);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Recorder {
        bundles: Arc<Mutex<Vec<Bundle<u32>>>>,
    }

    impl Recorder {
        fn seqs(&self) -> Vec<u64> {
            self.bundles.lock().unwrap().iter().map(|b| b.seq).collect()
        }

        fn counts(&self) -> Vec<usize> {
            self.bundles
                .lock()
                .unwrap()
                .iter()
                .map(|b| b.items.len())
                .collect()
        }
    }

    #[async_trait]
    impl BundleHandler<u32> for Recorder {
        async fn handle(&self, bundle: Bundle<u32>) {
            self.bundles.lock().unwrap().push(bundle);
        }
    }

    fn options() -> BundlerOptions {
        BundlerOptions::default()
    }

    #[tokio::test]
    async fn byte_limit_of_one_flushes_every_submission() {
        let recorder = Recorder::default();
        let bundler = Bundler::new(
            BundlerOptions {
                bundle_byte_limit: 1,
                ..options()
            },
            recorder.clone(),
        );

        for i in 0..5 {
            bundler.add(i, 1).unwrap();
        }
        bundler.flush().await;

        assert_eq!(recorder.seqs(), vec![0, 1, 2, 3, 4]);
        assert_eq!(recorder.counts(), vec![1, 1, 1, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn count_threshold_batches_and_delay_flushes_the_tail() {
        let recorder = Recorder::default();
        let bundler = Bundler::new(
            BundlerOptions {
                bundle_count_threshold: 10,
                delay_threshold: Duration::from_millis(500),
                ..options()
            },
            recorder.clone(),
        );

        for i in 0..35 {
            bundler.add(i, 1).unwrap();
        }
        // Three full bundles go out on their own; the tail sits waiting.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(recorder.counts(), vec![10, 10, 10]);

        // Only the delay threshold flushes the remaining five.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(recorder.counts(), vec![10, 10, 10, 5]);
        assert_eq!(recorder.seqs(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_threshold_flushes_a_lone_item() {
        let recorder = Recorder::default();
        let bundler = Bundler::new(
            BundlerOptions {
                bundle_count_threshold: 100,
                delay_threshold: Duration::from_secs(1),
                ..options()
            },
            recorder.clone(),
        );

        bundler.add(7, 3).unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let bundles = recorder.bundles.lock().unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].items, vec![7]);
        assert_eq!(bundles[0].size, 3);
    }

    #[tokio::test]
    async fn byte_threshold_seals_independently_of_count() {
        let recorder = Recorder::default();
        let bundler = Bundler::new(
            BundlerOptions {
                bundle_count_threshold: 100,
                bundle_byte_threshold: 10,
                ..options()
            },
            recorder.clone(),
        );

        bundler.add(1, 4).unwrap();
        bundler.add(2, 4).unwrap();
        bundler.add(3, 4).unwrap();
        bundler.flush().await;

        // 12 bytes crossed the threshold at the third item.
        assert_eq!(recorder.counts(), vec![3]);
    }

    #[tokio::test]
    async fn oversized_items_are_rejected() {
        let bundler = Bundler::new(
            BundlerOptions {
                bundle_byte_limit: 5,
                ..options()
            },
            Recorder::default(),
        );

        assert_eq!(
            bundler.add(1, 6),
            Err(Error::Oversized { size: 6, limit: 5 })
        );
        assert_eq!(bundler.add(2, 5), Ok(()));
    }

    #[tokio::test]
    async fn overflow_fails_fast() {
        let bundler = Bundler::new(
            BundlerOptions {
                bundle_count_threshold: 100,
                buffered_byte_limit: 10,
                ..options()
            },
            Recorder::default(),
        );

        bundler.add(1, 8).unwrap();
        assert_eq!(bundler.add(2, 8), Err(Error::Overflow { limit: 10 }));
        // Below the ceiling submissions still go through.
        assert_eq!(bundler.add(3, 2), Ok(()));
    }

    #[tokio::test]
    async fn add_wait_parks_until_capacity_frees() {
        struct Gated {
            release: Arc<Notify>,
            recorder: Recorder,
        }

        #[async_trait]
        impl BundleHandler<u32> for Gated {
            async fn handle(&self, bundle: Bundle<u32>) {
                self.release.notified().await;
                self.recorder.bundles.lock().unwrap().push(bundle);
            }
        }

        let release = Arc::new(Notify::new());
        let recorder = Recorder::default();
        let bundler = Arc::new(Bundler::new(
            BundlerOptions {
                bundle_byte_limit: 8,
                buffered_byte_limit: 8,
                ..options()
            },
            Gated {
                release: release.clone(),
                recorder: recorder.clone(),
            },
        ));

        // The first item fills the ceiling and sits in the gated
        // handler; fail-fast submission rejects, the waiting one parks.
        bundler.add(1, 8).unwrap();
        assert_eq!(bundler.add(2, 8), Err(Error::Overflow { limit: 8 }));

        let parked = tokio::spawn({
            let bundler = bundler.clone();
            async move { bundler.add_wait(2, 8).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!parked.is_finished());

        // Oversized items never fit, waiting or not.
        assert_eq!(
            bundler.add_wait(3, 9).await,
            Err(Error::Oversized { size: 9, limit: 8 })
        );

        release.notify_one();
        parked.await.unwrap().unwrap();

        release.notify_one();
        bundler.flush().await;
        assert_eq!(recorder.counts(), vec![1, 1]);
    }

    #[tokio::test]
    async fn buffered_bytes_are_released_after_handling() {
        let recorder = Recorder::default();
        let bundler = Bundler::new(
            BundlerOptions {
                bundle_byte_limit: 8,
                buffered_byte_limit: 8,
                ..options()
            },
            recorder.clone(),
        );

        bundler.add(1, 8).unwrap();
        bundler.flush().await;
        bundler.add(2, 8).unwrap();
        bundler.flush().await;

        assert_eq!(recorder.seqs(), vec![0, 1]);
    }

    #[tokio::test]
    async fn bundles_arrive_in_fifo_order() {
        let recorder = Recorder::default();
        let bundler = Bundler::new(
            BundlerOptions {
                bundle_byte_limit: 1,
                handler_limit: 1,
                ..options()
            },
            recorder.clone(),
        );

        for i in 0..16 {
            bundler.add(i, 1).unwrap();
        }
        bundler.flush().await;

        assert_eq!(recorder.seqs(), (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn flush_waits_for_in_flight_handlers() {
        struct Slow {
            recorder: Recorder,
        }

        #[async_trait]
        impl BundleHandler<u32> for Slow {
            async fn handle(&self, bundle: Bundle<u32>) {
                tokio::task::yield_now().await;
                self.recorder.bundles.lock().unwrap().push(bundle);
            }
        }

        let recorder = Recorder::default();
        let bundler = Bundler::new(
            options(),
            Slow {
                recorder: recorder.clone(),
            },
        );

        bundler.add(9, 2).unwrap();
        bundler.flush().await;

        assert_eq!(recorder.counts(), vec![1]);
    }

    #[test]
    fn options_deserialize_from_toml() {
        use indoc::indoc;

        let options: BundlerOptions = toml::from_str(indoc! {r#"
            delay_threshold = "250ms"
            bundle_count_threshold = 5
            buffered_byte_limit = 1024
        "#})
        .unwrap();

        assert_eq!(options.delay_threshold, Duration::from_millis(250));
        assert_eq!(options.bundle_count_threshold, 5);
        assert_eq!(options.buffered_byte_limit, 1024);
        // Unset fields keep their defaults.
        assert_eq!(options.handler_limit, 1);
        assert_eq!(options.bundle_byte_limit, 0);
    }

    #[test]
    fn unknown_option_fields_are_rejected() {
        let result: Result<BundlerOptions, _> = toml::from_str(r#"delay_treshold = "1s""#);
        assert!(result.is_err());
    }
}
