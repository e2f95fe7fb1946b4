use std::{fmt, sync::Arc};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum EventStatus {
    Pending,
    Complete,
    Failed(Error),
}

/// Completion state shared between a host queue worker and every clone of its `Event`
pub(crate) struct HostEvent {
    status: Mutex<EventStatus>,
    signal: Condvar,
}

impl HostEvent {
    pub(crate) fn new() -> Arc<HostEvent> {
        Arc::new(HostEvent {
            status: Mutex::new(EventStatus::Pending),
            signal: Condvar::new(),
        })
    }

    pub(crate) fn complete(&self) {
        self.finish(EventStatus::Complete);
    }

    pub(crate) fn fail(&self, error: Error) {
        self.finish(EventStatus::Failed(error));
    }

    fn finish(&self, status: EventStatus) {
        let mut current = self.status.lock();
        *current = status;
        self.signal.notify_all();
    }

    fn wait(&self) -> Result<()> {
        let mut status = self.status.lock();
        loop {
            match &*status {
                EventStatus::Pending => self.signal.wait(&mut status),
                EventStatus::Complete => return Ok(()),
                EventStatus::Failed(error) => return Err(error.clone()),
            }
        }
    }

    fn is_complete(&self) -> bool {
        !matches!(&*self.status.lock(), EventStatus::Pending)
    }
}

#[derive(Clone)]
enum EventInner {
    Host(Arc<HostEvent>),
    #[cfg(feature = "opencl")]
    OpenCl(super::opencl::ClEvent),
}

/// Completion of a unit of work submitted to a device queue.
///
/// Events are cheap to clone. Pass one as the wait event of a later submission to order work
/// across queues or devices, or call `wait` to synchronize the host. A failure on the device
/// (including a failed dependency) is reported here rather than by the submitting call.
#[derive(Clone)]
pub struct Event {
    inner: EventInner,
}

impl Event {
    pub(crate) fn from_host(state: Arc<HostEvent>) -> Event {
        Event { inner: EventInner::Host(state) }
    }

    #[cfg(feature = "opencl")]
    pub(crate) fn from_opencl(event: super::opencl::ClEvent) -> Event {
        Event { inner: EventInner::OpenCl(event) }
    }

    #[cfg(feature = "opencl")]
    pub(crate) fn as_opencl(&self) -> Option<&super::opencl::ClEvent> {
        match &self.inner {
            EventInner::OpenCl(event) => Some(event),
            _ => None,
        }
    }

    /// An event that is already signalled
    pub fn completed() -> Event {
        let state = HostEvent::new();
        state.complete();
        Event::from_host(state)
    }

    #[cfg(feature = "opencl")]
    pub(crate) fn failed(error: Error) -> Event {
        let state = HostEvent::new();
        state.fail(error);
        Event::from_host(state)
    }

    /// Blocks until the work finishes; returns the device-side error if it failed
    pub fn wait(&self) -> Result<()> {
        match &self.inner {
            EventInner::Host(state) => state.wait(),
            #[cfg(feature = "opencl")]
            EventInner::OpenCl(event) => event.wait(),
        }
    }

    /// True once the work has finished, successfully or not
    pub fn is_complete(&self) -> bool {
        match &self.inner {
            EventInner::Host(state) => state.is_complete(),
            #[cfg(feature = "opencl")]
            EventInner::OpenCl(event) => event.is_complete(),
        }
    }

    /// Waits for every event, returning the first failure
    pub fn wait_all<'a>(events: impl IntoIterator<Item = &'a Event>) -> Result<()> {
        let mut first_error = None;
        for event in events {
            if let Err(error) = event.wait() {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("complete", &self.is_complete())
            .finish()
    }
}
