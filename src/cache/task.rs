//! Background Tasks
//!
//! Named worker threads driven by a crossbeam ticker and stopped through a
//! disconnecting channel.

use crate::error::Result;
use crossbeam::channel::{self, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// A periodic job running on its own thread
pub struct BackgroundTask {
    name: String,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Run `job` every `interval` until it returns false or the task is stopped
    pub fn spawn_periodic<F>(name: &str, interval: Duration, mut job: F) -> Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(interval.max(Duration::from_millis(1)));
        let task_name = name.to_string();

        let handle = thread::Builder::new()
            .name(task_name.clone())
            .spawn(move || {
                debug!(task = %task_name, "Background task started");
                loop {
                    crossbeam::select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if !job() {
                                break;
                            }
                        }
                    }
                }
                debug!(task = %task_name, "Background task finished");
            })?;

        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the task and wait for it to exit
    pub fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(task = %self.name, "Background task panicked");
            }
        }
    }

    /// Whether the task thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.stop();
    }
}
