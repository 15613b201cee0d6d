// SPDX-License-Identifier: GPL-3.0-only

//! One iteration of the capture engine, shared by both drive modes

use super::{CaptureRequest, CapturedFrame, PipelineEvent, Shared, StreamState};
use crate::constants::timing;
use crate::errors::PipelineError;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Result of one engine step
#[derive(Debug)]
pub(crate) enum StepOutcome {
    /// A frame was delivered and re-queued
    Frame,
    /// Nothing arrived within the wait, or a frame was rejected
    Idle,
    /// The engine must stop; carries the error when it failed
    Stop(Option<PipelineError>),
}

fn fail(shared: &Shared, error: PipelineError) -> StepOutcome {
    shared.emit(PipelineEvent::Error(error.clone()));
    StepOutcome::Stop(Some(error))
}

/// Wait for one frame, dispatch it and hand the buffer back
pub(crate) fn step(shared: &Shared) -> StepOutcome {
    if !shared.running.load(Ordering::SeqCst) {
        return StepOutcome::Stop(None);
    }
    if shared.resize_pending.swap(false, Ordering::SeqCst) {
        if let Err(e) = apply_resize(shared) {
            return fail(shared, e);
        }
    }

    let device = {
        let inner = shared.lock();
        if inner.state != StreamState::Streaming {
            return fail(
                shared,
                PipelineError::InvalidState {
                    expected: StreamState::Streaming.name(),
                    actual: inner.state.name(),
                },
            );
        }
        match inner.device.clone() {
            Some(device) => device,
            None => return fail(shared, PipelineError::NotOpen),
        }
    };

    // Wait without the state lock so control-plane calls are not blocked
    match device.wait_for_frame(timing::FRAME_WAIT) {
        Ok(true) => {}
        Ok(false) => return StepOutcome::Idle,
        Err(e) => return fail(shared, e),
    }

    let mut guard = shared.lock();
    let inner = &mut *guard;
    if inner.state != StreamState::Streaming {
        return StepOutcome::Idle;
    }
    let (Some(memory), Some(active)) = (inner.buffers.memory(), inner.active) else {
        return StepOutcome::Idle;
    };

    let dequeued = match device.dequeue_buffer(memory) {
        Ok(buf) => buf,
        Err(PipelineError::DriverError { code, .. }) if code == libc::EAGAIN => {
            return StepOutcome::Idle;
        }
        Err(e) => return fail(shared, e),
    };

    let descriptor = active.descriptor();
    let delivered = match descriptor.validate(dequeued.bytes_used as usize) {
        Err(e) => {
            inner.stats.rejected += 1;
            warn!(
                index = dequeued.index,
                sequence = dequeued.sequence,
                error = %e,
                "Rejecting frame"
            );
            shared.emit(PipelineEvent::FrameRejected(e));
            false
        }
        Ok(()) => match inner.buffers.get(dequeued.index) {
            Some(buffer) => {
                let frame = CapturedFrame {
                    index: dequeued.index,
                    sequence: dequeued.sequence,
                    timestamp: dequeued.timestamp,
                    descriptor,
                    data: buffer.data(dequeued.bytes_used as usize),
                    backing: buffer.kind,
                    dmabuf_fd: buffer.dmabuf_fd(),
                };
                let mut callback = shared.callback.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(callback) = callback.as_mut() {
                    if let Err(e) = callback(&frame) {
                        inner.stats.callback_errors += 1;
                        debug!(sequence = frame.sequence, error = %e, "Frame callback failed");
                    }
                }
                true
            }
            None => {
                warn!(index = dequeued.index, "Driver returned an unknown buffer index");
                false
            }
        },
    };

    // Re-queue unconditionally
    let requeued = inner
        .buffers
        .slot(dequeued.index)
        .and_then(|slot| device.queue_buffer(&slot));
    if let Err(e) = requeued {
        drop(guard);
        return fail(shared, e);
    }

    if !delivered {
        return StepOutcome::Idle;
    }

    let stats = &mut inner.stats;
    stats.frames += 1;
    let window_start = *stats.window_start.get_or_insert_with(Instant::now);
    trace!(sequence = dequeued.sequence, bytes = dequeued.bytes_used, "Frame delivered");
    if stats.frames % timing::STATS_EVERY_N_FRAMES == 0 {
        let elapsed = window_start.elapsed().as_secs_f64();
        let fps = if elapsed > 0.0 {
            timing::STATS_EVERY_N_FRAMES as f64 / elapsed
        } else {
            0.0
        };
        info!(
            frames = stats.frames,
            rejected = stats.rejected,
            callback_errors = stats.callback_errors,
            fps = format!("{:.1}", fps),
            "Capture statistics"
        );
        stats.window_start = Some(Instant::now());
    }
    StepOutcome::Frame
}

/// Apply the most recent resize request between frames
///
/// On failure the previous parameters are restored and streaming resumes;
/// only a failed restore is returned as an error.
fn apply_resize(shared: &Shared) -> Result<(), PipelineError> {
    let Some(request) = shared
        .resize_slot
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
    else {
        return Ok(());
    };

    let mut inner = shared.lock();
    let previous_request = inner.request;
    let previous = inner.negotiated;

    if inner.active.is_some_and(|a| {
        a.width == request.width
            && a.height == request.height
            && request.format.is_none_or(|f| f == a.format)
    }) {
        debug!(width = request.width, height = request.height, "Resize is a no-op");
        return Ok(());
    }

    info!(
        width = request.width,
        height = request.height,
        format = ?request.format,
        "Applying resize"
    );
    shared.stop_streaming_locked(&mut inner);

    let next = CaptureRequest {
        width: request.width,
        height: request.height,
        format: request.format,
        fps: previous_request.fps,
    };
    let attempt = shared
        .negotiate_locked(&mut inner, next)
        .and_then(|_| shared.start_streaming_locked(&mut inner));

    match attempt {
        Ok(active) => {
            inner.request = next;
            info!(
                width = active.width,
                height = active.height,
                format = %active.format,
                "Resize applied"
            );
            shared.emit(PipelineEvent::Resized(active));
            Ok(())
        }
        Err(error) => {
            warn!(error = %error, "Resize failed, restoring previous format");
            inner.request = previous_request;
            if inner.state != StreamState::Open {
                shared.set_state(&mut inner, StreamState::Open);
            }
            let previous = previous.ok_or(PipelineError::NotSupported(
                "no previous format to restore".to_string(),
            ))?;
            shared.apply_locked(&mut inner, &previous)?;
            let restored = shared.start_streaming_locked(&mut inner)?;
            shared.emit(PipelineEvent::ResizeFailed { error, restored });
            Ok(())
        }
    }
}
