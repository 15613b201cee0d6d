// SPDX-License-Identifier: GPL-3.0-only
//! Thread lifecycle management for the capture loop
//!
//! The controller owns the capture thread. The loop runs while the shared
//! running flag is set; the exit closure always runs when the thread ends,
//! whether the loop was stopped, ended itself, or never got past init.

use crate::errors::{PipelineError, PipelineResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Action returned by one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Continue running the loop
    Continue,
    /// Stop the loop gracefully
    Stop,
}

/// How the loop ended, passed to the exit closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Initialization failed; the loop never ran
    InitFailed,
    /// The running flag was cleared
    Stopped,
    /// An iteration returned [`LoopAction::Stop`]
    Ended,
}

/// Controller for a capture loop running in a separate thread
pub struct CaptureLoopController {
    thread_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    name: String,
}

impl CaptureLoopController {
    /// Spawn the loop thread
    ///
    /// `init_fn` runs once on the new thread; `loop_fn` then runs while
    /// `running` is set; `exit_fn` receives the state (if init succeeded)
    /// and the reason the loop ended.
    pub fn start<S, I, F, X>(
        name: &str,
        running: Arc<AtomicBool>,
        init_fn: I,
        mut loop_fn: F,
        exit_fn: X,
    ) -> PipelineResult<Self>
    where
        S: Send + 'static,
        I: FnOnce() -> Result<S, String> + Send + 'static,
        F: FnMut(&mut S) -> LoopAction + Send + 'static,
        X: FnOnce(Option<S>, LoopExit) + Send + 'static,
    {
        let running_clone = Arc::clone(&running);
        let name_clone = name.to_string();

        info!(name = %name, "Starting capture loop");

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(name = %name_clone, "Capture loop thread started, initializing...");

                let mut state = match init_fn() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(name = %name_clone, error = %e, "Initialization failed");
                        exit_fn(None, LoopExit::InitFailed);
                        return;
                    }
                };

                let exit = loop {
                    if !running_clone.load(Ordering::SeqCst) {
                        debug!(name = %name_clone, "Stop signal received");
                        break LoopExit::Stopped;
                    }
                    if loop_fn(&mut state) == LoopAction::Stop {
                        debug!(name = %name_clone, "Loop requested stop");
                        break LoopExit::Ended;
                    }
                };

                exit_fn(Some(state), exit);
                info!(name = %name_clone, "Capture loop thread exiting");
            })
            .map_err(|e| PipelineError::from_io("spawn capture thread", &e))?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            running,
            name: name.to_string(),
        })
    }

    /// Check if the loop thread is still alive
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Clear the running flag and wait for the thread to finish
    ///
    /// Called from the loop thread itself this only clears the flag.
    pub fn stop(&mut self) {
        debug!(name = %self.name, "Requesting capture loop stop");
        self.running.store(false, Ordering::SeqCst);
        self.join();
    }

    /// Wait for the thread to finish without clearing the flag
    pub fn join(&mut self) {
        let Some(handle) = self.thread_handle.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            debug!(name = %self.name, "Stop requested from the loop thread, not joining");
            return;
        }
        debug!(name = %self.name, "Waiting for capture loop thread to finish");
        if let Err(e) = handle.join() {
            warn!(name = %self.name, "Capture loop thread panicked: {:?}", e);
        } else {
            debug!(name = %self.name, "Capture loop thread finished");
        }
    }
}

impl Drop for CaptureLoopController {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            debug!(name = %self.name, "CaptureLoopController dropped, stopping loop");
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    #[test]
    fn test_loop_ends_itself() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        let exit = Arc::new(Mutex::new(None));
        let exit_clone = Arc::clone(&exit);

        let mut controller = CaptureLoopController::start(
            "test-loop",
            flag(),
            || Ok(()),
            move |_| {
                if counter_clone.fetch_add(1, Ordering::SeqCst) >= 10 {
                    LoopAction::Stop
                } else {
                    LoopAction::Continue
                }
            },
            move |state, how| *exit_clone.lock().unwrap() = Some((state.is_some(), how)),
        )
        .unwrap();

        controller.join();
        assert_eq!(counter.load(Ordering::SeqCst), 11);
        assert_eq!(*exit.lock().unwrap(), Some((true, LoopExit::Ended)));
    }

    #[test]
    fn test_stop_clears_flag_and_runs_exit() {
        let running = flag();
        let exit = Arc::new(Mutex::new(None));
        let exit_clone = Arc::clone(&exit);

        let mut controller = CaptureLoopController::start(
            "test-stop",
            Arc::clone(&running),
            || Ok(0u32),
            |n| {
                *n += 1;
                thread::sleep(Duration::from_millis(5));
                LoopAction::Continue
            },
            move |state, how| *exit_clone.lock().unwrap() = Some((state, how)),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(30));
        controller.stop();
        assert!(!running.load(Ordering::SeqCst));
        let (state, how) = exit.lock().unwrap().take().unwrap();
        assert!(state.unwrap() > 0);
        assert_eq!(how, LoopExit::Stopped);
    }

    #[test]
    fn test_init_failure_skips_loop() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let exit = Arc::new(Mutex::new(None));
        let exit_clone = Arc::clone(&exit);

        let mut controller = CaptureLoopController::start(
            "test-fail-init",
            flag(),
            || Err::<(), _>("Init failed".to_string()),
            move |_: &mut ()| {
                ran_clone.store(true, Ordering::SeqCst);
                LoopAction::Stop
            },
            move |state, how| *exit_clone.lock().unwrap() = Some((state.is_some(), how)),
        )
        .unwrap();

        controller.join();
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(*exit.lock().unwrap(), Some((false, LoopExit::InitFailed)));
    }

    #[test]
    fn test_drop_stops_loop() {
        let running = flag();
        let controller = CaptureLoopController::start(
            "test-drop",
            Arc::clone(&running),
            || Ok(()),
            |_| {
                thread::sleep(Duration::from_millis(10));
                LoopAction::Continue
            },
            |_, _| {},
        )
        .unwrap();

        assert!(controller.is_running());
        drop(controller);
        assert!(!running.load(Ordering::SeqCst));
    }
}
