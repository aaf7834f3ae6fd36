// ========================================================================================
//
//                       THE WORKER POOL: ORDERED PARALLEL EVALUATION
//
// ========================================================================================
//
// The coordinator owns a fixed set of worker processes and feeds them sequence-numbered
// chunks of raw records. Workers finish out of order; every reply is parked in a
// `ReorderBuffer` and only released to the consumer once all earlier chunks have been
// released, so the consumer sees results in exactly the input order.
//
// ### Dispatch Rules ###
//
// 1.  **Bounded reading:** at most `MAX_CHUNKS_IN_FLIGHT` chunks are outstanding per
//     worker. The input iterator is only advanced when a worker has capacity, so the
//     number of buffered records never exceeds `workers * MAX_CHUNKS_IN_FLIGHT * chunk`.
// 2.  **Least busy first:** a new chunk goes to the worker with the fewest outstanding
//     chunks.
// 3.  **First fatal wins:** the first fatal outcome in input order ends the run.
//     Everything before it has already been delivered.
//
// Each worker has a writer thread draining a request queue into its stdin and a reader
// thread turning its stdout into `WorkerEvent`s on a single channel, which the dispatch
// loop `select!`s together with the interrupt channel. The loop itself never blocks on
// a worker's pipe.

use crate::files::quote;
use crate::protocol::{self, Outcome, ProtocolError, Reply, Request};
use crate::types::{GlobalState, ResultRecord};
use crate::vcf::VcfError;
use crate::worker::WORKER_ARG;
use crossbeam_channel::{Receiver, RecvError, Sender, select};
use log::debug;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Chunks never hold fewer records than this.
pub const MIN_CHUNK_SIZE: usize = 10;
/// Outstanding chunks per worker.
pub const MAX_CHUNKS_IN_FLIGHT: usize = 2;
/// How long to wait for a worker's last words after a failed write to it.
const FAILURE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to start worker process {}: {source}", quote(.program))]
    Spawn { program: PathBuf, source: io::Error },
    #[error("Failed to start pipe thread: {0}")]
    Thread(io::Error),
    #[error("Worker {worker} has no {pipe} pipe")]
    MissingPipe { worker: usize, pipe: &'static str },
    #[error("Failed to send work to worker {worker}: {source}")]
    Send { worker: usize, source: ProtocolError },
    #[error("Invalid reply from worker {worker}: {source}")]
    Protocol { worker: usize, source: ProtocolError },
    #[error("Worker {worker} exited unexpectedly")]
    WorkerExited { worker: usize },
    #[error("{message}")]
    WorkerFailed { worker: usize, message: String },
    #[error("Worker {worker} replied to unknown chunk {seq}")]
    UnknownChunk { worker: usize, seq: u64 },
    #[error("All workers disconnected")]
    Disconnected,
    #[error(transparent)]
    Input(#[from] VcfError),
    #[error(transparent)]
    Output(io::Error),
}

/// What was started as a worker.
#[derive(Clone, Debug)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    /// Re-executes the running binary in worker mode.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec![OsString::from(WORKER_ARG)],
        })
    }
}

/// One released item, in input order.
#[derive(Debug)]
pub enum Delivery {
    Site(ResultRecord),
    Dropped { id: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PoolOutcome {
    /// Every record was delivered.
    Exhausted,
    /// The consumer asked to stop.
    Stopped,
    /// A record was fatally rejected; the message names it.
    FatalSite(String),
    Interrupted,
}

pub fn chunk_size(workers: usize) -> usize {
    workers.max(MIN_CHUNK_SIZE)
}

/// Index of the worker with the fewest outstanding chunks, if any has capacity.
fn least_busy<I: IntoIterator<Item = usize>>(outstanding: I) -> Option<usize> {
    outstanding
        .into_iter()
        .enumerate()
        .filter(|&(_, chunks)| chunks < MAX_CHUNKS_IN_FLIGHT)
        .min_by_key(|&(_, chunks)| chunks)
        .map(|(index, _)| index)
}

/// Reads up to `size` records. A read error ends the chunk early and is parked in
/// `error`; nothing more is read after it.
fn next_chunk<I>(records: &mut I, size: usize, error: &mut Option<VcfError>) -> Vec<String>
where
    I: Iterator<Item = Result<String, VcfError>>,
{
    let mut chunk = Vec::with_capacity(size);
    if error.is_some() {
        return chunk;
    }

    for record in records.take(size) {
        match record {
            Ok(record) => chunk.push(record),
            Err(failure) => {
                *error = Some(failure);
                break;
            }
        }
    }
    chunk
}

/// Holds out-of-order items until every earlier sequence number has been released.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false, keeping the buffer unchanged, if `seq` was already seen.
    pub fn insert(&mut self, seq: u64, item: T) -> bool {
        if seq < self.next || self.pending.contains_key(&seq) {
            return false;
        }
        self.pending.insert(seq, item);
        true
    }

    /// The next item in sequence, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// An encoded request line, shared when the same message goes to every worker.
type RequestLine = Arc<[u8]>;

enum WorkerEvent {
    Reply { worker: usize, reply: Reply },
    Closed { worker: usize },
    Broken { worker: usize, error: ProtocolError },
    Unwritable { worker: usize, error: ProtocolError },
}

enum Wake {
    Event(Result<WorkerEvent, RecvError>),
    Interrupt(bool),
}

struct WorkerHandle {
    child: Child,
    /// Dropping this closes the worker's stdin once the queue is written.
    requests: Option<Sender<RequestLine>>,
    threads: Vec<JoinHandle<()>>,
    outstanding: usize,
}

fn forward_requests(
    worker: usize,
    stdin: ChildStdin,
    requests: Receiver<RequestLine>,
    events: Sender<WorkerEvent>,
) {
    let mut stdin = BufWriter::new(stdin);
    for line in requests {
        if let Err(error) = protocol::write_encoded(&mut stdin, &line) {
            let _ = events.send(WorkerEvent::Unwritable { worker, error });
            return;
        }
    }
}

fn forward_replies(worker: usize, stdout: ChildStdout, events: Sender<WorkerEvent>) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();

    loop {
        let event = match protocol::read_message::<_, Reply>(&mut reader, &mut line) {
            Ok(Some(reply)) => WorkerEvent::Reply { worker, reply },
            Ok(None) => WorkerEvent::Closed { worker },
            Err(error) => WorkerEvent::Broken { worker, error },
        };
        let last = !matches!(event, WorkerEvent::Reply { .. });

        if events.send(event).is_err() || last {
            break;
        }
    }
}

pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    events: Receiver<WorkerEvent>,
    /// Set once every chunk was answered, allowing workers to exit on their own.
    drained: bool,
}

impl WorkerPool {
    /// Starts `count` workers and sends each of them `state`.
    pub fn spawn(
        command: &WorkerCommand,
        count: usize,
        state: &GlobalState,
    ) -> Result<Self, PoolError> {
        let init: RequestLine = protocol::encode(&Request::Init(state.clone()))
            .map_err(|source| PoolError::Send { worker: 0, source })?
            .into();
        let (sender, events) = crossbeam_channel::unbounded();
        let mut pool = Self {
            workers: Vec::with_capacity(count),
            events,
            drained: false,
        };

        for worker in 0..count {
            let mut process = Command::new(&command.program);
            process
                .args(&command.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit());
            // Keeps terminal interrupts away from the workers and their engines.
            #[cfg(unix)]
            {
                use std::os::unix::process::CommandExt;
                process.process_group(0);
            }

            let mut child = process.spawn().map_err(|source| PoolError::Spawn {
                program: command.program.clone(),
                source,
            })?;
            let stdin = child.stdin.take();
            let stdout = child.stdout.take();
            pool.workers.push(WorkerHandle {
                child,
                requests: None,
                threads: Vec::with_capacity(2),
                outstanding: 0,
            });

            let stdin = stdin.ok_or(PoolError::MissingPipe {
                worker,
                pipe: "stdin",
            })?;
            let stdout = stdout.ok_or(PoolError::MissingPipe {
                worker,
                pipe: "stdout",
            })?;

            let (requests, queue) = crossbeam_channel::unbounded();
            let events = sender.clone();
            let writer = thread::Builder::new()
                .name(format!("worker-{worker}-stdin"))
                .spawn(move || forward_requests(worker, stdin, queue, events))
                .map_err(PoolError::Thread)?;
            pool.workers[worker].threads.push(writer);
            pool.workers[worker].requests = Some(requests);

            let events = sender.clone();
            let reader = thread::Builder::new()
                .name(format!("worker-{worker}-stdout"))
                .spawn(move || forward_replies(worker, stdout, events))
                .map_err(PoolError::Thread)?;
            pool.workers[worker].threads.push(reader);

            pool.send(worker, Arc::clone(&init))?;
            debug!("Started worker {worker} (PID {})", pool.workers[worker].child.id());
        }

        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Queues `line` for the worker's writer thread; never blocks.
    fn send(&mut self, worker: usize, line: RequestLine) -> Result<(), PoolError> {
        let requests = self.workers[worker]
            .requests
            .as_ref()
            .ok_or(PoolError::MissingPipe {
                worker,
                pipe: "stdin",
            })?;

        if requests.send(line).is_ok() {
            return Ok(());
        }
        // The writer thread has given up, so the worker is gone.
        let source = ProtocolError::Io(io::ErrorKind::BrokenPipe.into());
        Err(self.explain_send_failure(worker, source))
    }

    /// A write usually fails because the worker has already exited; if it managed
    /// to say why, that is the better error.
    fn explain_send_failure(&mut self, worker: usize, source: ProtocolError) -> PoolError {
        while let Ok(event) = self.events.recv_timeout(FAILURE_GRACE) {
            match event {
                WorkerEvent::Reply {
                    worker,
                    reply: Reply::Failed { message },
                } => return PoolError::WorkerFailed { worker, message },
                WorkerEvent::Closed { worker: closed }
                | WorkerEvent::Broken { worker: closed, .. }
                    if closed == worker =>
                {
                    break;
                }
                _ => {}
            }
        }

        PoolError::Send { worker, source }
    }

    fn dispatch(&mut self, worker: usize, seq: u64, records: Vec<String>) -> Result<(), PoolError> {
        let line = protocol::encode(&Request::Chunk { seq, records })
            .map_err(|source| PoolError::Send { worker, source })?;
        self.send(worker, line.into())?;
        self.workers[worker].outstanding += 1;
        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.workers.iter().map(|worker| worker.outstanding).sum()
    }

    /// Streams `records` through the workers, handing every outcome to `consume` in
    /// input order until the input is exhausted, `consume` stops, a site is fatally
    /// rejected, or an interrupt arrives on `interrupts`. A read error ends the input:
    /// every record read before it is still delivered before the error is returned.
    pub fn run<I, F>(
        &mut self,
        records: I,
        interrupts: &Receiver<()>,
        mut consume: F,
    ) -> Result<PoolOutcome, PoolError>
    where
        I: IntoIterator<Item = Result<String, VcfError>>,
        F: FnMut(Delivery) -> io::Result<Flow>,
    {
        let chunk_size = chunk_size(self.workers.len());
        let mut records = records.into_iter();
        let mut reorder = ReorderBuffer::new();
        let mut next_seq = 0u64;
        let mut exhausted = false;
        let mut input_error = None;
        let never = crossbeam_channel::never();
        let mut interrupts: &Receiver<()> = interrupts;

        loop {
            while !exhausted {
                let Some(worker) = least_busy(self.workers.iter().map(|w| w.outstanding)) else {
                    break;
                };

                let chunk = next_chunk(&mut records, chunk_size, &mut input_error);
                exhausted = chunk.len() < chunk_size;
                if chunk.is_empty() {
                    break;
                }

                self.dispatch(worker, next_seq, chunk)?;
                next_seq += 1;
            }

            if self.outstanding() == 0 {
                self.drained = true;
                return match input_error {
                    Some(error) => Err(PoolError::Input(error)),
                    None => Ok(PoolOutcome::Exhausted),
                };
            }

            let wake = select! {
                recv(self.events) -> event => Wake::Event(event),
                recv(interrupts) -> signal => Wake::Interrupt(signal.is_ok()),
            };

            let (worker, reply) = match wake {
                Wake::Interrupt(true) => return Ok(PoolOutcome::Interrupted),
                Wake::Interrupt(false) => {
                    // The sender is gone, so no interrupt can ever arrive.
                    interrupts = &never;
                    continue;
                }
                Wake::Event(Err(RecvError)) => return Err(PoolError::Disconnected),
                Wake::Event(Ok(WorkerEvent::Reply { worker, reply })) => (worker, reply),
                Wake::Event(Ok(WorkerEvent::Closed { worker })) => {
                    return Err(PoolError::WorkerExited { worker });
                }
                Wake::Event(Ok(WorkerEvent::Broken { worker, error })) => {
                    return Err(PoolError::Protocol {
                        worker,
                        source: error,
                    });
                }
                Wake::Event(Ok(WorkerEvent::Unwritable { worker, error })) => {
                    return Err(self.explain_send_failure(worker, error));
                }
            };

            let (seq, outcomes) = match reply {
                Reply::Chunk { seq, outcomes } => (seq, outcomes),
                Reply::Failed { message } => {
                    return Err(PoolError::WorkerFailed { worker, message });
                }
            };
            let handle = &mut self.workers[worker];
            if handle.outstanding == 0 || seq >= next_seq || !reorder.insert(seq, outcomes) {
                return Err(PoolError::UnknownChunk { worker, seq });
            }
            handle.outstanding -= 1;

            while let Some(outcomes) = reorder.pop_ready() {
                for outcome in outcomes {
                    let delivery = match outcome {
                        Outcome::Reported(record) => Delivery::Site(record),
                        Outcome::Dropped { id } => Delivery::Dropped { id },
                        Outcome::Fatal(message) => return Ok(PoolOutcome::FatalSite(message)),
                    };

                    if consume(delivery).map_err(PoolError::Output)? == Flow::Stop {
                        return Ok(PoolOutcome::Stopped);
                    }
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queues lets idle workers exit on their own once their stdin is
        // written out; busy ones are killed unless every chunk has been answered.
        for worker in &mut self.workers {
            worker.requests.take();
        }

        for (index, worker) in self.workers.iter_mut().enumerate() {
            if !self.drained {
                let _ = worker.child.kill();
            }
            match worker.child.wait() {
                Ok(status) => debug!("Worker {index} exited with {status}"),
                Err(error) => debug!("Failed to wait for worker {index}: {error}"),
            }
        }

        for worker in &mut self.workers {
            for thread in worker.threads.drain(..) {
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Sample, Settings};
    use rand::seq::SliceRandom;
    use rand::{SeedableRng, rngs::StdRng};
    use std::cell::Cell;

    fn state() -> GlobalState {
        let settings = Settings {
            permissive: false,
            min_r2: 0.4,
            min_maf: 0.01,
            script: PathBuf::from("DBF_test.R"),
            rscript: PathBuf::from("Rscript"),
        };
        let samples = vec![Sample {
            name: "a".into(),
            column: 9,
        }];
        GlobalState::new(settings, vec![0.0], samples)
    }

    fn unreadable(line: usize) -> VcfError {
        VcfError::InvalidUtf8 {
            source_name: "in.vcf".into(),
            line,
        }
    }

    #[test]
    fn chunks_scale_with_worker_count() {
        assert_eq!(chunk_size(1), 10);
        assert_eq!(chunk_size(10), 10);
        assert_eq!(chunk_size(32), 32);
    }

    #[test]
    fn least_busy_prefers_idle_workers() {
        assert_eq!(least_busy([1, 0, 1]), Some(1));
        assert_eq!(least_busy([1, 1]), Some(0));
        assert_eq!(least_busy([2, 1, 2]), Some(1));
        assert_eq!(least_busy([2, 2]), None);
        assert_eq!(least_busy(Vec::<usize>::new()), None);
    }

    #[test]
    fn reorder_buffer_releases_in_sequence() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.insert(2, "c"));
        assert!(buffer.insert(1, "b"));
        assert_eq!(buffer.pop_ready(), None);

        assert!(buffer.insert(0, "a"));
        assert_eq!(buffer.pop_ready(), Some("a"));
        assert_eq!(buffer.pop_ready(), Some("b"));
        assert_eq!(buffer.pop_ready(), Some("c"));
        assert_eq!(buffer.pop_ready(), None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn reorder_buffer_rejects_repeats() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.insert(0, 'a'));
        assert!(buffer.insert(3, 'd'));
        assert!(!buffer.insert(3, 'x'));
        assert_eq!(buffer.pop_ready(), Some('a'));
        assert!(!buffer.insert(0, 'y'));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn reorder_buffer_restores_any_arrival_order() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut arrivals: Vec<u64> = (0..200).collect();

        for _ in 0..20 {
            arrivals.shuffle(&mut rng);
            let mut buffer = ReorderBuffer::new();
            let mut released = Vec::new();
            for &seq in &arrivals {
                buffer.insert(seq, seq);
                while let Some(seq) = buffer.pop_ready() {
                    released.push(seq);
                }
            }
            assert_eq!(released, (0..200).collect::<Vec<_>>());
        }
    }

    #[test]
    fn read_errors_end_the_input_after_the_good_records() {
        let mut records = vec![Ok("r1".to_string()), Ok("r2".to_string()), Err(unreadable(3))]
            .into_iter()
            .chain(std::iter::once(Ok("r4".to_string())));
        let mut error = None;

        assert_eq!(next_chunk(&mut records, 10, &mut error), ["r1", "r2"]);
        assert!(matches!(error, Some(VcfError::InvalidUtf8 { line: 3, .. })));
        assert!(next_chunk(&mut records, 10, &mut error).is_empty());
        assert_eq!(records.next().map(Result::ok), Some(Some("r4".to_string())));
    }

    /// A stand-in worker that never answers.
    #[cfg(unix)]
    fn silent_worker() -> WorkerCommand {
        WorkerCommand {
            program: PathBuf::from("sleep"),
            args: vec![OsString::from("30")],
        }
    }

    #[cfg(unix)]
    #[test]
    fn interrupts_stop_the_run_without_reading_further() {
        let mut pool = WorkerPool::spawn(&silent_worker(), 1, &state()).unwrap();
        let (signal, interrupts) = crossbeam_channel::bounded(1);
        signal.send(()).unwrap();

        let pulled = Cell::new(0usize);
        let records = (0..1000).map(|index| {
            pulled.set(pulled.get() + 1);
            Ok(format!("record {index}"))
        });
        let mut delivered = 0;
        let outcome = pool
            .run(records, &interrupts, |_| {
                delivered += 1;
                Ok(Flow::Continue)
            })
            .unwrap();

        assert_eq!(outcome, PoolOutcome::Interrupted);
        assert_eq!(delivered, 0);
        assert_eq!(pulled.get(), MAX_CHUNKS_IN_FLIGHT * chunk_size(1));
    }

    #[cfg(unix)]
    #[test]
    fn dropping_an_unfinished_pool_stops_its_workers() {
        let pool = WorkerPool::spawn(&silent_worker(), 2, &state()).unwrap();
        assert_eq!(pool.len(), 2);

        let started = std::time::Instant::now();
        drop(pool);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
