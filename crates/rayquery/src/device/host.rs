use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{error, trace};

use super::{Event, HostEvent};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct HostDeviceSettings {
    /// Number of independent in-order queues
    pub queue_count: u32,
    /// Size of the data-parallel pool; defaults to the device's compute units
    pub threads: Option<usize>,
}

impl Default for HostDeviceSettings {
    fn default() -> Self {
        HostDeviceSettings {
            queue_count: 2,
            threads: None,
        }
    }
}

pub(crate) type HostJob = Box<dyn FnOnce(&ThreadPool) -> Result<()> + Send>;

struct QueuedJob {
    wait: Option<Event>,
    work: HostJob,
    done: Arc<HostEvent>,
}

struct HostQueue {
    sender: Option<Sender<QueuedJob>>,
    worker: Option<JoinHandle<()>>,
}

/// Each queue is a worker thread draining a channel in order; the work itself runs on a
/// rayon pool shared by all queues of the device.
pub(crate) struct HostBackend {
    name: Arc<str>,
    queues: Vec<HostQueue>,
    lost: Arc<AtomicBool>,
}

impl HostBackend {
    pub(crate) fn new(
        name: &str,
        queue_count: u32,
        threads: usize,
        lost: Arc<AtomicBool>,
    ) -> Result<HostBackend> {
        let name: Arc<str> = Arc::from(name);

        let pool_name = name.clone();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{}-worker-{}", pool_name, i))
            .build()
            .map_err(|e| Error::device_unavailable(&name, e))?;
        let pool = Arc::new(pool);

        let mut queues = Vec::with_capacity(queue_count as usize);
        for queue_idx in 0..queue_count {
            let (sender, receiver) = unbounded();
            let worker = {
                let queue_name = name.clone();
                let pool = pool.clone();
                let lost = lost.clone();
                thread::Builder::new()
                    .name(format!("{}-queue-{}", name, queue_idx))
                    .spawn(move || run_queue(queue_name, receiver, pool, lost))
                    .map_err(|e| Error::device_unavailable(&name, e))?
            };
            queues.push(HostQueue {
                sender: Some(sender),
                worker: Some(worker),
            });
        }

        Ok(HostBackend { name, queues, lost })
    }

    pub(crate) fn queue_count(&self) -> u32 {
        self.queues.len() as u32
    }

    pub(crate) fn submit(&self, queue: u32, wait: Option<&Event>, work: HostJob) -> Result<Event> {
        let unavailable = || Error::device_unavailable(&self.name, "device lost");
        if self.lost.load(Ordering::Acquire) {
            return Err(unavailable());
        }

        let sender = self
            .queues
            .get(queue as usize)
            .and_then(|q| q.sender.as_ref())
            .ok_or(Error::InvalidQueue {
                queue,
                count: self.queue_count(),
            })?;

        let done = HostEvent::new();
        let job = QueuedJob {
            wait: wait.cloned(),
            work,
            done: done.clone(),
        };
        sender.send(job).map_err(|_| unavailable())?;

        Ok(Event::from_host(done))
    }
}

impl Drop for HostBackend {
    fn drop(&mut self) {
        // closing the channels lets every worker drain what is queued and exit
        for queue in &mut self.queues {
            queue.sender.take();
        }
        for queue in &mut self.queues {
            if let Some(worker) = queue.worker.take() {
                let _ = worker.join();
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_owned()
    }
}

fn run_queue(
    name: Arc<str>,
    receiver: Receiver<QueuedJob>,
    pool: Arc<ThreadPool>,
    lost: Arc<AtomicBool>,
) {
    for job in receiver.iter() {
        if lost.load(Ordering::Acquire) {
            job.done.fail(Error::device_unavailable(&name, "device lost"));
            continue;
        }

        if let Some(dependency) = &job.wait {
            if let Err(e) = dependency.wait() {
                trace!("{}: dependency failed, skipping job", name);
                job.done.fail(e);
                continue;
            }
        }

        let work = job.work;
        match panic::catch_unwind(AssertUnwindSafe(|| work(&pool))) {
            Ok(Ok(())) => job.done.complete(),
            Ok(Err(e)) => {
                if e.is_fatal() {
                    lost.store(true, Ordering::Release);
                }
                job.done.fail(e);
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                lost.store(true, Ordering::Release);
                error!("device {} lost: {}", name, reason);
                job.done.fail(Error::device_unavailable(&name, reason));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn backend(queue_count: u32) -> HostBackend {
        HostBackend::new("test", queue_count, 2, Arc::new(AtomicBool::new(false))).unwrap()
    }

    #[test]
    fn test_jobs_run_in_submission_order() {
        let backend = backend(1);
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut last = None;
        for i in 0..16 {
            let log = log.clone();
            last = Some(
                backend
                    .submit(0, None, Box::new(move |_| {
                        log.lock().push(i);
                        Ok(())
                    }))
                    .unwrap(),
            );
        }
        last.unwrap().wait().unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_failed_dependency_propagates() {
        let backend = backend(2);
        let failing = backend
            .submit(0, None, Box::new(|_| Err(Error::EmptyScene)))
            .unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let dependent = backend
            .submit(1, Some(&failing), Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();

        assert_eq!(dependent.wait(), Err(Error::EmptyScene));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        // a failed dependency is not a device loss
        assert!(!backend.lost.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_job_marks_device_lost() {
        let backend = backend(1);
        let event = backend
            .submit(0, None, Box::new(|_| panic!("kernel fault")))
            .unwrap();

        match event.wait() {
            Err(Error::DeviceUnavailable { reason, .. }) => assert_eq!(reason, "kernel fault"),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(matches!(
            backend.submit(0, None, Box::new(|_| Ok(()))),
            Err(Error::DeviceUnavailable { .. })
        ));
    }
}
