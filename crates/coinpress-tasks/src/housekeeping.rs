//! Background maintenance threads (artifact sweep, stuck-task reaper).
//!
//! A [`Housekeeper`] runs a closure on a fixed interval on its own thread
//! until it is stopped or dropped. The first run happens one interval
//! after start, not immediately.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

/// Handle to a periodic background job. Dropping it stops the job.
#[derive(Debug)]
pub struct Housekeeper {
    name: &'static str,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Housekeeper {
    /// Spawn `job` every `interval` on a named thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn<F>(name: &'static str, interval: Duration, mut job: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(format!("coinpress-{name}"))
            .spawn(move || {
                info!(job = name, interval_ms = interval.as_millis(), "housekeeper starting");
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            debug!(job = name, "housekeeper tick");
                            job();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!(job = name, "housekeeper stopped");
            })?;
        Ok(Self {
            name,
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Stop the job and wait for its thread to exit.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.send(()).ok();
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!(job = self.name, "housekeeper thread panicked");
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;

    #[test]
    fn runs_periodically_until_dropped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let keeper = Housekeeper::spawn("test", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        drop(keeper);
        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 3);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut keeper = Housekeeper::spawn("idle", Duration::from_secs(3600), || {}).unwrap();
        keeper.stop();
        keeper.stop();
    }
}
