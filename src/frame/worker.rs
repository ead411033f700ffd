use {
    crate::RenderError,
    anyhow::Context,
    std::{
        sync::{
            mpsc::{self, Receiver, Sender},
            Arc, Condvar, Mutex,
        },
        thread::JoinHandle,
    },
};

type Job = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

/// A fixed set of threads which run CPU work for the loop: pipeline
/// compilation, command recording, update-after-bind descriptor writes and
/// draw plan construction.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
}

impl WorkerPool {
    /// Spawn `count` workers named `{name}-{index}`.
    pub fn new(count: usize, name: &str) -> Result<Self, RenderError> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let pending = Arc::new(Pending::default());
        let mut workers = Vec::with_capacity(count.max(1));
        for index in 0..count.max(1) {
            let receiver = receiver.clone();
            let pending = pending.clone();
            let worker = std::thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || run_worker(receiver, pending))
                .with_context(|| format!("Unable to spawn worker {}", index))?;
            workers.push(worker);
        }
        log::debug!("Started {} '{}' workers", workers.len(), name);
        Ok(Self {
            sender: Some(sender),
            workers,
            pending,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue `job` on the next free worker.
    pub fn perform(&self, job: impl FnOnce() + Send + 'static) {
        let Some(sender) = &self.sender else {
            return;
        };
        *self.pending.count.lock().unwrap() += 1;
        if sender.send(Box::new(job)).is_err() {
            log::error!("Worker pool is shut down, dropping a job");
            self.finish_job();
        }
    }

    /// Block until every queued job has run.
    pub fn wait_idle(&self) {
        let mut count = self.pending.count.lock().unwrap();
        while *count > 0 {
            count = self.pending.idle.wait(count).unwrap();
        }
    }

    fn finish_job(&self) {
        finish_job(&self.pending);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // closing the channel ends every worker once the queue is drained
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("A worker thread panicked");
            }
        }
    }
}

fn run_worker(receiver: Arc<Mutex<Receiver<Job>>>, pending: Arc<Pending>) {
    loop {
        let job = receiver.lock().unwrap().recv();
        match job {
            Ok(job) => {
                job();
                finish_job(&pending);
            }
            Err(_) => break,
        }
    }
}

fn finish_job(pending: &Pending) {
    let mut count = pending.count.lock().unwrap();
    *count = count.saturating_sub(1);
    if *count == 0 {
        pending.idle.notify_all();
    }
}
