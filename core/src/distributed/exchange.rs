use super::backend::ExchangeTransport;
use super::cpu_backend::UniformTransport;
use super::peer::HierarchicalTransport;
use crate::error::{EmbeddingError, Result};
use crate::types::CommunicationStrategy;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Sizing of one all-to-all: every device sends `element_count_per_peer` values
/// to every device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangePlan {
    pub num_devices: usize,
    pub element_count_per_peer: usize,
}

impl ExchangePlan {
    pub fn new(num_devices: usize, element_count_per_peer: usize) -> Self {
        Self {
            num_devices,
            element_count_per_peer,
        }
    }

    /// Length of every device's source (and destination) buffer.
    pub fn buffer_len(&self) -> usize {
        self.num_devices * self.element_count_per_peer
    }
}

/// All-to-all redistribution of per-device buffers.
///
/// Source buffer `j` is cut into `num_devices` equal segments; segment `i` of
/// device `j` lands at position `j` of device `i`'s destination buffer.
///
/// Rounds issued on one exchange run in issue order: a round's workers start
/// only after every worker of the previous round has left the transport.
pub struct CollectiveExchange {
    plan: ExchangePlan,
    transport: Arc<dyn ExchangeTransport>,
    last_round: Mutex<Option<Arc<RoundGate>>>,
}

impl CollectiveExchange {
    /// Builds the transport for `strategy`. Hierarchical exchange needs peer access.
    pub fn init(
        plan: ExchangePlan,
        strategy: CommunicationStrategy,
        p2p_enabled: bool,
    ) -> Result<Self> {
        let transport: Arc<dyn ExchangeTransport> = match strategy {
            CommunicationStrategy::Uniform => Arc::new(UniformTransport::new(plan.num_devices)),
            CommunicationStrategy::Hierarchical => {
                if !p2p_enabled {
                    return Err(EmbeddingError::config(
                        "hierarchical exchange requires peer access between all devices",
                    ));
                }
                Arc::new(HierarchicalTransport::new(plan.num_devices))
            }
        };
        Self::with_transport(plan, transport)
    }

    pub fn with_transport(
        plan: ExchangePlan,
        transport: Arc<dyn ExchangeTransport>,
    ) -> Result<Self> {
        if plan.num_devices == 0 || transport.num_devices() != plan.num_devices {
            return Err(EmbeddingError::config(format!(
                "exchange plan for {} devices cannot run on a transport for {}",
                plan.num_devices,
                transport.num_devices()
            )));
        }
        Ok(Self {
            plan,
            transport,
            last_round: Mutex::new(None),
        })
    }

    pub fn plan(&self) -> ExchangePlan {
        self.plan
    }

    /// Starts the exchange on one worker per device and returns immediately.
    ///
    /// Destination buffers are only reachable through [`ExchangeHandle::wait`].
    pub fn exchange_async(&self, src_buffers: Vec<Vec<f32>>) -> Result<ExchangeHandle> {
        let n = self.plan.num_devices;
        if src_buffers.len() != n {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![n],
                got: vec![src_buffers.len()],
            });
        }
        if let Some(bad) = src_buffers
            .iter()
            .find(|b| b.len() != self.plan.buffer_len())
        {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![n, self.plan.element_count_per_peer],
                got: vec![bad.len()],
            });
        }

        let count = self.plan.element_count_per_peer;
        let outgoing = src_buffers
            .into_iter()
            .map(|buf| split_even(buf, n, count))
            .collect();
        debug!(devices = n, count, "issuing all-to-all");
        self.spawn_round(outgoing)
    }

    /// Blocking convenience around [`exchange_async`](Self::exchange_async).
    pub fn exchange(&self, src_buffers: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        self.exchange_async(src_buffers)?.wait()
    }

    /// Element-wise sum of equally sized buffers, one per device; every device
    /// gets the full result.
    ///
    /// Reduce-scatter through one exchange round, all-gather through a second.
    /// The buffer length is independent of the plan.
    pub fn all_reduce_sum(&self, buffers: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        let n = self.plan.num_devices;
        if buffers.len() != n {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![n],
                got: vec![buffers.len()],
            });
        }
        let len = buffers.first().map_or(0, Vec::len);
        if let Some(bad) = buffers.iter().find(|b| b.len() != len) {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![len],
                got: vec![bad.len()],
            });
        }
        debug!(devices = n, len, "all-reduce");

        let chunk = len.div_ceil(n);
        let scattered = self
            .spawn_round(
                buffers
                    .into_iter()
                    .map(|mut buf| {
                        buf.resize(chunk * n, 0.0);
                        split_even(buf, n, chunk)
                    })
                    .collect(),
            )?
            .wait_segments()?;

        let reduced: Vec<Vec<f32>> = scattered
            .into_iter()
            .map(|parts| {
                let mut sum = vec![0.0f32; chunk];
                for part in parts {
                    for (s, v) in sum.iter_mut().zip(part) {
                        *s += v;
                    }
                }
                sum
            })
            .collect();

        let gathered = self
            .spawn_round(reduced.into_iter().map(|sum| vec![sum; n]).collect())?
            .wait()?;
        Ok(gathered
            .into_iter()
            .map(|mut buf| {
                buf.truncate(len);
                buf
            })
            .collect())
    }

    /// Starts one worker per device. Workers of a round only touch the transport
    /// once every one of them exists and the previous round has fully drained.
    fn spawn_round(&self, outgoing: Vec<Vec<Vec<f32>>>) -> Result<ExchangeHandle> {
        let mut last = self
            .last_round
            .lock()
            .map_err(|_| EmbeddingError::transport("exchange round order poisoned"))?;
        let previous = last.clone();
        let gate = Arc::new(RoundGate::new(outgoing.len()));

        let mut workers = Vec::with_capacity(outgoing.len());
        for (device, segments) in outgoing.into_iter().enumerate() {
            let transport = Arc::clone(&self.transport);
            let (round, previous) = (Arc::clone(&gate), previous.clone());
            let spawned = thread::Builder::new()
                .name(format!("exchange-{device}"))
                .spawn(move || {
                    let _finished = Finished(Arc::clone(&round));
                    if !round.wait_released() {
                        return Err(EmbeddingError::transport(
                            "exchange round aborted before it started",
                        ));
                    }
                    if let Some(previous) = previous {
                        previous.wait_finished();
                    }
                    transport.exchange(device, segments)
                });
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    gate.release(false);
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(e.into());
                }
            }
        }

        gate.release(true);
        *last = Some(gate);
        Ok(ExchangeHandle { workers })
    }
}

/// Start signal and completion count of one exchange round.
struct RoundGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

struct GateState {
    /// `None` while workers are still being spawned, then whether they may run.
    released: Option<bool>,
    /// Workers that have not left the transport yet.
    pending: usize,
}

impl RoundGate {
    fn new(workers: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                released: None,
                pending: workers,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, run: bool) {
        let mut state = self.lock();
        state.released = Some(run);
        if !run {
            state.pending = 0;
        }
        self.changed.notify_all();
    }

    fn wait_released(&self) -> bool {
        let state = self
            .changed
            .wait_while(self.lock(), |s| s.released.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.released == Some(true)
    }

    fn wait_finished(&self) {
        let _state = self
            .changed
            .wait_while(self.lock(), |s| s.pending > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn finish_one(&self) {
        let mut state = self.lock();
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 {
            self.changed.notify_all();
        }
    }
}

/// Counts a worker out of its round, also when the transport panics.
struct Finished(Arc<RoundGate>);

impl Drop for Finished {
    fn drop(&mut self) {
        self.0.finish_one();
    }
}

fn split_even(buf: Vec<f32>, parts: usize, count: usize) -> Vec<Vec<f32>> {
    if count == 0 {
        return vec![Vec::new(); parts];
    }
    buf.chunks(count).map(<[f32]>::to_vec).collect()
}

/// An in-flight exchange. Waiting is the synchronisation point for every device.
///
/// If dropped without calling `wait()`, the workers are still joined so no
/// exchange outlives its handle.
pub struct ExchangeHandle {
    workers: Vec<JoinHandle<Result<Vec<Vec<f32>>>>>,
}

impl ExchangeHandle {
    /// Blocks until every device finished; returns one destination buffer per
    /// device, laid out `[src][element_count_per_peer]`.
    pub fn wait(self) -> Result<Vec<Vec<f32>>> {
        Ok(self
            .wait_segments()?
            .into_iter()
            .map(|segments| segments.concat())
            .collect())
    }

    fn wait_segments(mut self) -> Result<Vec<Vec<Vec<f32>>>> {
        let mut first_err = None;
        let mut results = Vec::with_capacity(self.workers.len());
        for (device, worker) in std::mem::take(&mut self.workers).into_iter().enumerate() {
            let outcome = worker.join().unwrap_or_else(|_| {
                Err(EmbeddingError::transport(format!(
                    "exchange worker for device {device} panicked"
                )))
            });
            match outcome {
                Ok(segments) => results.push(segments),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(JoinHandle::is_finished)
    }
}

impl Drop for ExchangeHandle {
    fn drop(&mut self) {
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Several exchanges issued together and waited on together.
#[derive(Default)]
pub struct ExchangeGroup {
    handles: Vec<ExchangeHandle>,
}

impl ExchangeGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: ExchangeHandle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every exchange, in push order.
    ///
    /// Returns the first error encountered, if any. All exchanges are joined
    /// regardless of errors.
    pub fn wait_all(self) -> Result<Vec<Vec<Vec<f32>>>> {
        let mut first_err = None;
        let mut results = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            match handle.wait() {
                Ok(buffers) => results.push(buffers),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers(n: usize, count: usize) -> Vec<Vec<f32>> {
        // Element k of device j is 100 * j + k.
        (0..n)
            .map(|j| (0..n * count).map(|k| (100 * j + k) as f32).collect())
            .collect()
    }

    #[test]
    fn test_uniform_segment_placement() {
        let plan = ExchangePlan::new(3, 2);
        let exchange =
            CollectiveExchange::init(plan, CommunicationStrategy::Uniform, false).unwrap();

        let dst = exchange.exchange(buffers(3, 2)).unwrap();

        // Device 1 receives segment 1 (elements 2..4) of every source, in source order.
        assert_eq!(dst[1], vec![2.0, 3.0, 102.0, 103.0, 202.0, 203.0]);
        assert_eq!(dst[0][..2], [0.0, 1.0]);
    }

    #[test]
    fn test_hierarchical_matches_uniform() {
        let plan = ExchangePlan::new(4, 3);
        let uniform = CollectiveExchange::init(plan, CommunicationStrategy::Uniform, true).unwrap();
        let hier =
            CollectiveExchange::init(plan, CommunicationStrategy::Hierarchical, true).unwrap();

        assert_eq!(
            uniform.exchange(buffers(4, 3)).unwrap(),
            hier.exchange(buffers(4, 3)).unwrap()
        );
    }

    #[test]
    fn test_hierarchical_requires_p2p() {
        let plan = ExchangePlan::new(2, 1);
        let result = CollectiveExchange::init(plan, CommunicationStrategy::Hierarchical, false);
        assert!(matches!(result, Err(EmbeddingError::Configuration(_))));
    }

    #[test]
    fn test_wrong_buffer_length() {
        let plan = ExchangePlan::new(2, 2);
        let exchange =
            CollectiveExchange::init(plan, CommunicationStrategy::Uniform, true).unwrap();
        let result = exchange.exchange_async(vec![vec![0.0; 4], vec![0.0; 3]]);
        assert!(matches!(result, Err(EmbeddingError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_all_reduce_sum_uneven_length() {
        let plan = ExchangePlan::new(3, 1);
        let exchange =
            CollectiveExchange::init(plan, CommunicationStrategy::Uniform, true).unwrap();
        let inputs: Vec<Vec<f32>> = (0..3).map(|d| vec![(d + 1) as f32; 5]).collect();

        let out = exchange.all_reduce_sum(inputs).unwrap();

        for buf in out {
            assert_eq!(buf, vec![6.0; 5]);
        }
    }

    #[test]
    fn test_group_waits_on_every_handle() {
        let plan = ExchangePlan::new(2, 1);
        let a = CollectiveExchange::init(plan, CommunicationStrategy::Uniform, true).unwrap();
        let b = CollectiveExchange::init(plan, CommunicationStrategy::Hierarchical, true).unwrap();

        let mut group = ExchangeGroup::new();
        let x = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let y = vec![vec![5.0, 6.0], vec![7.0, 8.0]];
        group.push(a.exchange_async(x).unwrap());
        group.push(b.exchange_async(y).unwrap());
        assert_eq!(group.len(), 2);

        let results = group.wait_all().unwrap();
        assert_eq!(results[0], vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
        assert_eq!(results[1], vec![vec![5.0, 7.0], vec![6.0, 8.0]]);
    }

    #[test]
    fn test_aborted_round_releases_waiters() {
        let gate = RoundGate::new(3);
        gate.release(false);
        assert!(!gate.wait_released());
        // Nothing is left pending, so a following round would not block on it.
        gate.wait_finished();
    }

    #[test]
    fn test_round_finishes_when_every_worker_left() {
        let gate = Arc::new(RoundGate::new(2));
        gate.release(true);
        assert!(gate.wait_released());

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || drop(Finished(gate)))
            })
            .collect();
        gate.wait_finished();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(gate.lock().pending, 0);
    }

    #[test]
    fn test_back_to_back_rounds_keep_their_payloads() {
        let plan = ExchangePlan::new(2, 1);
        let exchange =
            CollectiveExchange::init(plan, CommunicationStrategy::Uniform, true).unwrap();
        for _ in 0..50 {
            let x = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
            let y = vec![vec![5.0, 6.0], vec![7.0, 8.0]];
            let first = exchange.exchange_async(x).unwrap();
            let second = exchange.exchange_async(y).unwrap();
            assert_eq!(second.wait().unwrap(), vec![vec![5.0, 7.0], vec![6.0, 8.0]]);
            assert_eq!(first.wait().unwrap(), vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
        }
    }
}
