//! Asynchronous BCML1 weight compressor
//!
//! The compressor overlaps CPU-side block quantization with the device
//! thread's other work. One background worker runs the codec on host memory
//! only; the compressed words come back through a completed-job queue that
//! the device thread drains the next time it calls into the compressor, so
//! every device resource is created on the thread that owns the device.
//!
//! # Contract
//!
//! - At most one job is in flight. A second [`Compressor::bcml`] blocks on a
//!   condition variable until the first job finishes or fails.
//! - The first failure is sticky: every later call returns it until the
//!   compressor is discarded.
//! - Source and result buffers are recycled through two pools, which is why
//!   callers should take input buffers from [`Compressor::get_buffer`].

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::codec::{CpuFeatures, bcml1};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::tensor::{Tensor, TensorDesc};

/// Signature of the block codec run by the worker
pub(crate) type Codec =
    Arc<dyn Fn(&TensorDesc, DType, &[u16], &mut Vec<u32>, CpuFeatures) -> Result<()> + Send + Sync>;

/// Thread name of the compressor worker
pub const WORKER_THREAD_NAME: &str = "gpuml-compressor";

// ============================================================================
// Shared state
// ============================================================================

struct Completed<R: Runtime> {
    words: Vec<u32>,
    tensor: Tensor<R>,
}

struct State<R: Runtime> {
    /// A job has been handed to the worker and hasn't reported back yet
    pending: bool,
    inputs: Vec<Vec<u16>>,
    outputs: Vec<Vec<u32>>,
    completed: Vec<Completed<R>>,
    /// Jobs whose tensor will never be initialized
    lost: usize,
}

struct Shared<R: Runtime> {
    state: Mutex<State<R>>,
    idle: Condvar,
    /// First failure wins; `OnceLock::set` rejects later ones
    error: OnceLock<Error>,
}

impl<R: Runtime> Shared<R> {
    fn check(&self) -> Result<()> {
        match self.error.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn record(&self, err: Error) {
        if self.error.set(err).is_err() {
            debug!("compressor already poisoned, later failure dropped");
        }
    }
}

struct Job<R: Runtime> {
    desc: TensorDesc,
    source: DType,
    input: Vec<u16>,
    output: Vec<u32>,
    tensor: Tensor<R>,
}

// ============================================================================
// Compressor
// ============================================================================

/// Single-worker BCML1 compression pipeline
///
/// Owned by [`crate::Device`], created lazily on the first compressed upload
/// and discarded by [`crate::Device::wait_for_compressor`].
pub struct Compressor<R: Runtime> {
    client: R::Client,
    features: CpuFeatures,
    shared: Arc<Shared<R>>,
    pool: rayon::ThreadPool,
    codec: Codec,
}

impl<R: Runtime> Compressor<R> {
    /// Create a compressor backed by `threads` workers
    ///
    /// `threads` must be 1; the pipeline keeps a single job in flight.
    pub fn new(client: R::Client, features: CpuFeatures, threads: usize) -> Result<Self> {
        Self::with_codec(client, features, threads, Arc::new(bcml1::compress))
    }

    pub(crate) fn with_codec(
        client: R::Client,
        features: CpuFeatures,
        threads: usize,
        codec: Codec,
    ) -> Result<Self> {
        if threads != 1 {
            return Err(Error::invalid_argument(
                "threads",
                format!("the compressor runs exactly one worker, got {threads}"),
            ));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|_| WORKER_THREAD_NAME.to_string())
            .build()
            .map_err(|e| Error::Internal(format!("failed to create compressor pool: {e}")))?;

        Ok(Self {
            client,
            features,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    pending: false,
                    inputs: Vec::new(),
                    outputs: Vec::new(),
                    completed: Vec::new(),
                    lost: 0,
                }),
                idle: Condvar::new(),
                error: OnceLock::new(),
            }),
            pool,
            codec,
        })
    }

    /// The sticky error, if a job has failed
    pub fn error(&self) -> Option<Error> {
        self.shared.error.get().cloned()
    }

    /// Get a source buffer able to hold `len_bytes` bytes of half floats
    ///
    /// Finalizes completed jobs first. The buffer comes from the recycle pool
    /// when one is available.
    pub fn get_buffer(&self, len_bytes: usize) -> Result<Vec<u16>> {
        self.shared.check()?;
        if len_bytes % 2 != 0 {
            return Err(Error::invalid_argument(
                "len_bytes",
                format!("{len_bytes} is not a whole number of half floats"),
            ));
        }
        let len = len_bytes / 2;

        let mut state = self.shared.state.lock();
        self.drain(&mut state);
        let mut buffer = state.inputs.pop().unwrap_or_default();
        drop(state);

        buffer.clear();
        buffer
            .try_reserve_exact(len)
            .map_err(|_| Error::OutOfMemory { size: len_bytes })?;
        buffer.resize(len, 0);
        Ok(buffer)
    }

    /// Submit a dense half-float tensor for compression
    ///
    /// `desc` is the dense-input descriptor with `Layout::Bcml1`. Returns the
    /// uninitialized immutable tensor that receives the compressed words once
    /// the job has finished and a later call has drained it. Blocks while
    /// another job is in flight.
    pub fn bcml(&self, desc: &TensorDesc, input: Vec<u16>) -> Result<Tensor<R>> {
        self.shared.check()?;
        let compressed = bcml1::make_desc(desc, self.features)?;
        let count = desc.checked_element_count()?;
        if input.len() as u64 != count {
            return Err(Error::invalid_argument(
                "input",
                format!("expected {count} elements, got {}", input.len()),
            ));
        }
        let tensor = Tensor::uninitialized(&compressed)?;

        let mut state = self.shared.state.lock();
        self.drain(&mut state);
        while state.pending && self.shared.error.get().is_none() {
            self.shared.idle.wait(&mut state);
            self.drain(&mut state);
        }
        self.shared.check()?;

        state.pending = true;
        let output = state.outputs.pop().unwrap_or_default();
        drop(state);

        let job = Job {
            desc: compressed,
            source: desc.dtype,
            input,
            output,
            tensor: tensor.clone(),
        };
        let shared = self.shared.clone();
        let codec = self.codec.clone();
        let features = self.features;
        self.pool.spawn(move || run_job(&shared, &codec, features, job));

        debug!(tensor = %tensor.id(), elements = count, "submitted compression job");
        Ok(tensor)
    }

    /// Wait for the in-flight job, finalize completed jobs and report the
    /// sticky error
    pub fn join(&self) -> Result<()> {
        self.shared.check()?;
        let mut state = self.shared.state.lock();
        while state.pending {
            self.shared.idle.wait(&mut state);
        }
        self.drain(&mut state);
        drop(state);
        self.shared.check()
    }

    /// Create device resources for every completed job
    ///
    /// Runs on the caller's thread, which owns the device.
    fn drain(&self, state: &mut State<R>) {
        for Completed { mut words, tensor } in std::mem::take(&mut state.completed) {
            let bytes: &[u8] = bytemuck::cast_slice(&words);
            match tensor.create_immutable_raw(&self.client, bytes) {
                Ok(()) => debug!(tensor = %tensor.id(), bytes = bytes.len(), "finalized compressed tensor"),
                Err(err) => {
                    state.lost += 1;
                    self.shared.record(err);
                }
            }
            words.clear();
            state.outputs.push(words);
        }
    }
}

fn run_job<R: Runtime>(shared: &Shared<R>, codec: &Codec, features: CpuFeatures, job: Job<R>) {
    let Job {
        desc,
        source,
        input,
        mut output,
        tensor,
    } = job;
    let result = codec(&desc, source, &input, &mut output, features);

    let mut state = shared.state.lock();
    state.inputs.push(input);
    match result {
        Ok(()) => state.completed.push(Completed {
            words: output,
            tensor,
        }),
        Err(err) => {
            state.lost += 1;
            state.outputs.push(output);
            shared.record(err);
        }
    }
    state.pending = false;
    drop(state);
    shared.idle.notify_all();
}

impl<R: Runtime> Drop for Compressor<R> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        while state.pending {
            self.shared.idle.wait(&mut state);
        }
        self.drain(&mut state);
        if state.lost > 0 {
            warn!(
                jobs = state.lost,
                error = ?self.shared.error.get(),
                "compressor dropped with unfinalized jobs"
            );
        }
    }
}

impl<R: Runtime> fmt::Debug for Compressor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Compressor")
            .field("pending", &state.pending)
            .field("completed", &state.completed.len())
            .field("poisoned", &self.shared.error.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::cpu::{CpuClient, CpuRuntime};
    use crate::tensor::{Layout, TensorShape, Usage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn client() -> CpuClient {
        CpuRuntime::client(&CpuRuntime::default_device()).unwrap()
    }

    fn dense_input(width: u32) -> TensorDesc {
        let mut shape = TensorShape::vector(width);
        shape.stride[0] = 0;
        TensorDesc::new(shape, DType::F16, Usage::Immutable).with_layout(Layout::Bcml1)
    }

    fn compressor(codec: Codec) -> Compressor<CpuRuntime> {
        Compressor::with_codec(client(), CpuFeatures::all(), 1, codec).unwrap()
    }

    #[test]
    fn test_rejects_more_than_one_worker() {
        let err = Compressor::<CpuRuntime>::new(client(), CpuFeatures::all(), 2).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { arg: "threads", .. }));
    }

    #[test]
    fn test_second_submission_waits_for_first() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (r, p, f) = (running.clone(), peak.clone(), finished.clone());
        let codec: Codec = Arc::new(move |desc, source, input, out, features| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            let result = bcml1::compress(desc, source, input, out, features);
            r.fetch_sub(1, Ordering::SeqCst);
            f.fetch_add(1, Ordering::SeqCst);
            result
        });
        let c = compressor(codec);

        let desc = dense_input(32);
        let first = c.bcml(&desc, vec![0x3c00; 32]).unwrap();
        let second = c.bcml(&desc, vec![0x4000; 32]).unwrap();
        // The second submit only returns once the first job has reported back.
        assert!(finished.load(Ordering::SeqCst) >= 1);
        // ...and the drain on submit finalized it.
        assert!(first.is_initialized());

        c.join().unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(second.is_initialized());
    }

    #[test]
    fn test_first_error_is_sticky() {
        let calls = Arc::new(AtomicUsize::new(0));
        let n = calls.clone();
        let codec: Codec = Arc::new(move |_, _, _, _, _| {
            let call = n.fetch_add(1, Ordering::SeqCst);
            Err(Error::Internal(format!("codec failure {call}")))
        });
        let c = compressor(codec);

        let desc = dense_input(32);
        let tensor = c.bcml(&desc, vec![0; 32]).unwrap();
        let err = c.join().unwrap_err();
        assert_eq!(err.to_string(), "Internal error: codec failure 0");
        assert!(!tensor.is_initialized());

        let again = c.bcml(&desc, vec![0; 32]).unwrap_err();
        assert_eq!(again.to_string(), err.to_string());
        assert!(c.get_buffer(64).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocked_submission_sees_worker_failure() {
        let (open, gate) = std::sync::mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        let calls = Arc::new(AtomicUsize::new(0));
        let n = calls.clone();
        let codec: Codec = Arc::new(move |_, _, _, _, _| {
            n.fetch_add(1, Ordering::SeqCst);
            let _ = gate.lock().recv();
            Err(Error::Internal("codec failure".into()))
        });
        let c = compressor(codec);

        let desc = dense_input(32);
        let first = c.bcml(&desc, vec![0; 32]).unwrap();
        assert!(c.error().is_none());

        let opener = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            open.send(()).unwrap();
        });
        // Blocks on the in-flight job until the worker records its failure.
        let err = c.bcml(&desc, vec![0; 32]).unwrap_err();
        opener.join().unwrap();

        assert_eq!(err.to_string(), "Internal error: codec failure");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!first.is_initialized());
    }

    #[test]
    fn test_buffers_are_recycled() {
        let c = Compressor::<CpuRuntime>::new(client(), CpuFeatures::all(), 1).unwrap();
        let buffer = c.get_buffer(128).unwrap();
        assert_eq!(buffer.len(), 64);

        let desc = dense_input(64);
        c.bcml(&desc, buffer).unwrap();
        c.join().unwrap();

        let recycled = c.get_buffer(8).unwrap();
        assert_eq!(recycled.len(), 4);
        assert!(recycled.capacity() >= 64);
        assert!(recycled.iter().all(|&x| x == 0));
    }

    #[test]
    fn test_rejects_odd_buffer_length_and_short_input() {
        let c = Compressor::<CpuRuntime>::new(client(), CpuFeatures::all(), 1).unwrap();
        assert!(matches!(
            c.get_buffer(3),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            c.bcml(&dense_input(32), vec![0; 31]),
            Err(Error::InvalidArgument { .. })
        ));
        // Validation failures don't poison the pipeline.
        assert!(c.error().is_none());
    }

    #[test]
    fn test_missing_cpu_features_fail_before_submit() {
        let c = Compressor::<CpuRuntime>::new(client(), CpuFeatures::none(), 1).unwrap();
        assert!(matches!(
            c.bcml(&dense_input(32), vec![0; 32]),
            Err(Error::UnsupportedHardware { .. })
        ));
    }
}
