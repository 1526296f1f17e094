use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::{adapter::Adapter, Result};

/// Queue capacity per area.
pub const MAX_NUM_TASKS: usize = 200;
/// Worker threads per area.
pub const MAX_NUM_WORKERS: usize = 20;

/// How long a worker blocks on the queue before checking the stop flag.
const POP_TIMEOUT: Duration = Duration::from_secs(2);
/// Idle pause after an empty pop.
const IDLE_BACKOFF: Duration = Duration::from_secs(1);

/// Work unit executed by a worker: `(job_key, adapter)`.
pub type Job = Arc<dyn Fn(&str, &dyn Adapter) -> Result<()> + Send + Sync>;

struct Task {
    job: Job,
    key: String,
    adapter: Arc<dyn Adapter>,
}

/// Tracks submitted-but-not-finished tasks so `drain` can wait for both the
/// queue and the workers' in-progress items.
#[derive(Default)]
struct Outstanding {
    count: Mutex<usize>,
    zero: Condvar,
}

impl Outstanding {
    fn incr(&self) {
        *self.count.lock() += 1;
    }

    fn decr(&self) {
        let mut count = self.count.lock();
        *count -= 1;

        if *count == 0 {
            self.zero.notify_all();
        }
    }

    fn wait_zero(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }
}

/// Fixed worker pool for one area, deduplicating in-flight jobs by key.
///
/// At most one task per job key is queued or running at any instant; a
/// submit for a key already in flight is dropped silently.
pub struct AreaProgramManager {
    name: String,
    adapter: Arc<dyn Adapter>,
    tasks: Sender<Task>,
    jobs: Arc<Mutex<HashSet<String>>>,
    outstanding: Arc<Outstanding>,
    stop: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl AreaProgramManager {
    /// Creates the pool and starts its workers.
    pub fn new(name: &str, adapter: Arc<dyn Adapter>, num_workers: usize) -> Self {
        let (tx, rx) = bounded::<Task>(MAX_NUM_TASKS);
        let jobs = Arc::new(Mutex::new(HashSet::new()));
        let outstanding = Arc::new(Outstanding::default());
        let stop = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let worker_name = format!("{name}{i}");
            let rx = rx.clone();
            let jobs = jobs.clone();
            let outstanding = outstanding.clone();
            let stop = stop.clone();

            workers.push(thread::spawn(move || {
                worker_loop(worker_name.as_str(), rx, jobs, outstanding, stop)
            }));
        }

        info!("AreaProgramManager({name}) created");

        Self {
            name: name.to_string(),
            adapter,
            tasks: tx,
            jobs,
            outstanding,
            stop,
            workers,
        }
    }

    /// Gets the area name.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Gets the number of jobs currently queued or running.
    pub fn in_flight(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Gets the number of live workers.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Enqueues `job` under `key` unless a task for `key` is already in
    /// flight. Blocks when the queue is full.
    pub fn submit(&self, job: Job, key: &str) {
        {
            // Check-and-insert is atomic under the set lock.
            let mut jobs = self.jobs.lock();
            if jobs.contains(key) {
                return;
            }

            debug!("{key} not in TODO job list");
            jobs.insert(key.to_string());
        }

        self.outstanding.incr();

        let task = Task {
            job,
            key: key.to_string(),
            adapter: self.adapter.clone(),
        };

        if self.tasks.send(task).is_err() {
            self.outstanding.decr();
            self.jobs.lock().remove(key);
            warn!("({}) job {key} dropped, pool is stopped", self.name);
            return;
        }

        info!("({}) job {key} added to queue", self.name);
    }

    /// Submits each key in turn.
    pub fn map<I, S>(&self, job: Job, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for key in keys {
            self.submit(job.clone(), key.as_ref());
        }
    }

    /// Blocks until the queue is empty and all in-progress tasks are done,
    /// then stops and joins the workers.
    pub fn drain(&mut self) {
        info!("({}) waiting for pending tasks to be completed", self.name);
        self.outstanding.wait_zero();
        info!("({}) pending tasks are done", self.name);

        self.stop.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }

        info!("({}) workers stopped", self.name);
    }
}

fn worker_loop(
    name: &str,
    tasks: Receiver<Task>,
    jobs: Arc<Mutex<HashSet<String>>>,
    outstanding: Arc<Outstanding>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::SeqCst) {
        let task = match tasks.recv_timeout(POP_TIMEOUT) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => {
                debug!("FgcWorker({name}): queue empty, nothing to do");
                thread::sleep(IDLE_BACKOFF);
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if let Err(e) = (task.job)(task.key.as_str(), task.adapter.as_ref()) {
            error!("FgcWorker({name}): failed to reprogram {}: {e}", task.key);
        }

        jobs.lock().remove(task.key.as_str());
        outstanding.decr();
        info!("FgcWorker({name}): job {} removed from tasks", task.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use crate::adapter::ExpectedInventory;
    use crate::slot_info::SlotInventory;

    /// Adapter stub for pool tests.
    struct NullAdapter;

    impl Adapter for NullAdapter {
        fn get_expected(&self, _converter: &str) -> Result<Option<ExpectedInventory>> {
            Ok(None)
        }

        fn record_detected(&self, _converter: &str, _detected: &SlotInventory) -> Result<()> {
            Ok(())
        }
    }

    fn pool(num_workers: usize) -> AreaProgramManager {
        AreaProgramManager::new("EHA1", Arc::new(NullAdapter), num_workers)
    }

    fn counting_job(counter: Arc<AtomicUsize>, delay: Duration) -> Job {
        Arc::new(move |_key, _adapter| {
            thread::sleep(delay);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_concurrent_submits_deduplicate() {
        let mut pool = pool(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let job = counting_job(counter.clone(), Duration::from_millis(500));

        // Both submits race for the same key; exactly one task runs.
        pool.submit(job.clone(), "CONV.A");
        pool.submit(job.clone(), "CONV.A");

        pool.drain();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_key_can_resubmit_after_completion() {
        let mut pool = pool(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let job = counting_job(counter.clone(), Duration::from_millis(10));

        pool.submit(job.clone(), "CONV.A");

        // Wait out the first run, then the key is free again.
        while pool.in_flight() > 0 {
            thread::sleep(Duration::from_millis(5));
        }
        pool.submit(job.clone(), "CONV.A");

        pool.drain();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drain_leaves_nothing_behind() {
        let mut pool = pool(3);
        let counter = Arc::new(AtomicUsize::new(0));
        let job = counting_job(counter.clone(), Duration::from_millis(20));

        pool.map(job, ["CONV.A", "CONV.B", "CONV.C", "CONV.D"]);
        pool.drain();

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.num_workers(), 0);
    }

    #[test]
    fn test_job_errors_do_not_kill_workers() {
        let mut pool = pool(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let failing: Job = Arc::new(|_key, _adapter| Err(crate::Error::rpc("boom")));
        let ok = counting_job(counter.clone(), Duration::from_millis(1));

        pool.submit(failing, "CONV.A");
        pool.submit(ok, "CONV.B");

        pool.drain();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_worker_count_is_stable_until_drain() {
        let mut pool = pool(5);
        assert_eq!(pool.num_workers(), 5);

        let counter = Arc::new(AtomicUsize::new(0));
        pool.submit(counting_job(counter, Duration::from_millis(1)), "CONV.A");
        assert_eq!(pool.num_workers(), 5);

        pool.drain();
        assert_eq!(pool.num_workers(), 0);
    }
}
