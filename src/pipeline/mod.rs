// SPDX-License-Identifier: GPL-3.0-only

//! Capture state machine
//!
//! ```text
//!  CLOSED ──open──▶ OPEN ──negotiate──▶ NEGOTIATED ──stream on──▶ STREAMING
//!    ▲                ▲                                              │
//!    │                └──────── startup failure / resize ────────────┤
//!    └────────────────────── stream off, release, close ─────────────┘
//! ```
//!
//! One [`CapturePipeline`] owns one device. Control-plane calls take the
//! state lock; the capture engine (a dedicated thread, or the caller via
//! [`CapturePipeline::poll_frame`]) waits for frames without it and only
//! takes it to dequeue, dispatch and re-queue.
//!
//! The frame callback runs with the state lock held. It may call
//! [`CapturePipeline::resize`], which only touches the request slot, but must
//! not call other pipeline methods.

pub mod buffers;
pub mod controls;
mod engine;
pub mod frame_loop;
pub mod negotiate;

pub use buffers::{BackingKind, BufferManager, CaptureBuffer};
pub use controls::{ControlDescriptor, MenuEntry};
pub use negotiate::{ActiveFormat, FormatNegotiator, NegotiatedFormat};

use crate::backends::device::{CaptureDevice, DeviceCapabilities, DeviceProvider};
use crate::backends::v4l2::V4l2Provider;
use crate::config::{DriveMode, FpsRange, PipelineConfig};
use crate::errors::{PipelineError, PipelineResult};
use crate::formats::{CanonicalFormat, FrameDescriptor};
use crate::report::CapabilityReport;
use frame_loop::{CaptureLoopController, LoopAction, LoopExit};
use serde::{Deserialize, Serialize};
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Capacity of the event channel; further events are dropped until drained
const EVENT_QUEUE_DEPTH: usize = 64;

/// Device lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    Closed,
    Open,
    Negotiated,
    Streaming,
}

impl StreamState {
    pub fn name(self) -> &'static str {
        match self {
            StreamState::Closed => "CLOSED",
            StreamState::Open => "OPEN",
            StreamState::Negotiated => "NEGOTIATED",
            StreamState::Streaming => "STREAMING",
        }
    }
}

/// Notifications from the capture engine
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StateChanged(StreamState),
    /// Streaming started with these parameters
    Streaming(ActiveFormat),
    Resized(ActiveFormat),
    /// A resize failed and the previous parameters are streaming again
    ResizeFailed {
        error: PipelineError,
        restored: ActiveFormat,
    },
    /// A delivered frame was dropped without reaching the callback
    FrameRejected(PipelineError),
    /// The engine hit an error it could not recover from
    Error(PipelineError),
    /// The engine stopped and the device is closed
    Stopped,
}

/// One filled buffer, valid for the duration of the callback
#[derive(Debug)]
pub struct CapturedFrame<'a> {
    pub index: u32,
    pub sequence: u32,
    pub timestamp: Duration,
    pub descriptor: FrameDescriptor,
    pub data: &'a [u8],
    pub backing: BackingKind,
    /// DMA-BUF descriptor of the slot, for zero-copy consumers
    pub dmabuf_fd: Option<BorrowedFd<'a>>,
}

impl CapturedFrame<'_> {
    pub fn bytes_used(&self) -> usize {
        self.data.len()
    }
}

/// Frame-ready callback; an `Err` is logged and the frame is still re-queued
pub type FrameCallback = Box<dyn FnMut(&CapturedFrame<'_>) -> Result<(), String> + Send>;

/// Size and format a resize asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeRequest {
    pub width: u32,
    pub height: u32,
    pub format: Option<CanonicalFormat>,
}

/// What the engine negotiates for
#[derive(Debug, Clone, Copy, PartialEq)]
struct CaptureRequest {
    width: u32,
    height: u32,
    format: Option<CanonicalFormat>,
    fps: FpsRange,
}

#[derive(Debug, Default)]
struct FrameStats {
    frames: u64,
    rejected: u64,
    callback_errors: u64,
    window_start: Option<Instant>,
}

/// Everything guarded by the state lock
struct Inner {
    device: Option<Arc<dyn CaptureDevice>>,
    caps: Option<DeviceCapabilities>,
    state: StreamState,
    request: CaptureRequest,
    negotiated: Option<NegotiatedFormat>,
    active: Option<ActiveFormat>,
    negotiator: FormatNegotiator,
    buffers: BufferManager,
    controls: Vec<ControlDescriptor>,
    stats: FrameStats,
}

/// State shared between the control plane and the capture engine
pub(crate) struct Shared {
    config: PipelineConfig,
    provider: Arc<dyn DeviceProvider>,
    inner: Mutex<Inner>,
    running: Arc<AtomicBool>,
    resize_pending: AtomicBool,
    resize_slot: Mutex<Option<ResizeRequest>>,
    callback: Mutex<Option<FrameCallback>>,
    events: SyncSender<PipelineEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: PipelineEvent) {
        if self.events.try_send(event).is_err() {
            debug!("Event queue full or closed, dropping event");
        }
    }

    fn set_state(&self, inner: &mut Inner, state: StreamState) {
        if inner.state != state {
            debug!(from = inner.state.name(), to = state.name(), "State transition");
            inner.state = state;
            self.emit(PipelineEvent::StateChanged(state));
        }
    }

    fn open_locked(&self, inner: &mut Inner) -> PipelineResult<()> {
        if inner.state != StreamState::Closed {
            return Err(PipelineError::InvalidState {
                expected: StreamState::Closed.name(),
                actual: inner.state.name(),
            });
        }
        let path = &self.config.device_path;
        let device = self.provider.open(path)?;
        let caps = device.capabilities()?;
        if !caps.video_capture || !caps.streaming {
            return Err(PipelineError::NotSupported(format!(
                "{} is not a streaming capture device",
                path.display()
            )));
        }
        inner.controls = controls::enumerate_controls(device.as_ref());
        info!(
            path = %path.display(),
            card = %caps.card,
            controls = inner.controls.len(),
            "Capture device open"
        );
        inner.device = Some(device);
        inner.caps = Some(caps);
        self.set_state(inner, StreamState::Open);
        Ok(())
    }

    /// OPEN -> NEGOTIATED for `request`
    fn negotiate_locked(
        &self,
        inner: &mut Inner,
        request: CaptureRequest,
    ) -> PipelineResult<ActiveFormat> {
        let device = inner.device.clone().ok_or(PipelineError::NotOpen)?;
        if inner.state != StreamState::Open {
            return Err(PipelineError::InvalidState {
                expected: StreamState::Open.name(),
                actual: inner.state.name(),
            });
        }
        let negotiated = inner.negotiator.find_format(
            device.as_ref(),
            request.width,
            request.height,
            request.format,
            request.fps,
        )?;
        self.apply_locked(inner, &negotiated)
    }

    fn apply_locked(
        &self,
        inner: &mut Inner,
        negotiated: &NegotiatedFormat,
    ) -> PipelineResult<ActiveFormat> {
        let device = inner.device.clone().ok_or(PipelineError::NotOpen)?;
        let active = negotiate::apply_format(device.as_ref(), negotiated)?;
        inner.negotiated = Some(*negotiated);
        inner.active = Some(active);
        self.set_state(inner, StreamState::Negotiated);
        Ok(active)
    }

    /// NEGOTIATED -> STREAMING; unwinds to OPEN on failure
    fn start_streaming_locked(&self, inner: &mut Inner) -> PipelineResult<ActiveFormat> {
        let device = inner.device.clone().ok_or(PipelineError::NotOpen)?;
        let active = match (inner.state, inner.active) {
            (StreamState::Negotiated, Some(active)) => active,
            (state, _) => {
                return Err(PipelineError::InvalidState {
                    expected: StreamState::Negotiated.name(),
                    actual: state.name(),
                });
            }
        };

        let result = (|| {
            let driver_size = device.get_format()?.size_image as usize;
            let frame_size = active
                .descriptor()
                .expected_size()
                .map_or(driver_size, |size| size.max(driver_size));
            inner.buffers.allocate(
                device.as_ref(),
                self.config.buffer_count,
                frame_size,
                self.config.dma_path.as_deref(),
            )?;
            inner.buffers.queue_all(device.as_ref())?;
            device.stream_on()
        })();

        match result {
            Ok(()) => {
                inner.stats = FrameStats::default();
                self.set_state(inner, StreamState::Streaming);
                info!(
                    width = active.width,
                    height = active.height,
                    format = %active.format,
                    fps = active.fps,
                    buffers = inner.buffers.len(),
                    "Streaming started"
                );
                self.emit(PipelineEvent::Streaming(active));
                Ok(active)
            }
            Err(e) => {
                warn!(error = %e, "Failed to start streaming, unwinding to OPEN");
                inner.buffers.release(device.as_ref());
                inner.active = None;
                self.set_state(inner, StreamState::Open);
                Err(e)
            }
        }
    }

    /// STREAMING -> OPEN: stream off and release buffers
    fn stop_streaming_locked(&self, inner: &mut Inner) {
        let Some(device) = inner.device.clone() else {
            return;
        };
        if inner.state == StreamState::Streaming {
            if let Err(e) = device.stream_off() {
                warn!(error = %e, "Stream off failed");
            }
        }
        inner.buffers.release(device.as_ref());
        if inner.state != StreamState::Closed {
            self.set_state(inner, StreamState::Open);
        }
    }

    /// Any state -> CLOSED: stream off, release, close
    fn teardown_locked(&self, inner: &mut Inner) {
        if inner.state == StreamState::Closed {
            return;
        }
        self.stop_streaming_locked(inner);
        inner.device = None;
        inner.caps = None;
        inner.controls.clear();
        inner.active = None;
        inner.negotiated = None;
        self.set_state(inner, StreamState::Closed);
        info!(
            frames = inner.stats.frames,
            rejected = inner.stats.rejected,
            "Capture device closed"
        );
    }

    /// Bring the device from any state up to STREAMING
    fn bring_up_locked(&self, inner: &mut Inner) -> PipelineResult<ActiveFormat> {
        if inner.state == StreamState::Streaming {
            if let Some(active) = inner.active {
                return Ok(active);
            }
        }
        if inner.state == StreamState::Closed {
            self.open_locked(inner)?;
        }
        if inner.state == StreamState::Negotiated {
            self.set_state(inner, StreamState::Open);
        }
        let request = inner.request;
        if let Err(e) = self.negotiate_locked(inner, request) {
            inner.active = None;
            self.set_state(inner, StreamState::Open);
            return Err(e);
        }
        self.start_streaming_locked(inner)
    }
}

/// V4L2 capture pipeline
///
/// ```no_run
/// use camera_pipeline::{CapturePipeline, PipelineConfig};
///
/// let pipeline = CapturePipeline::new(PipelineConfig::default())?;
/// pipeline.set_frame_callback(|frame| {
///     println!("{} bytes of {}", frame.bytes_used(), frame.descriptor);
///     Ok(())
/// });
/// pipeline.start()?;
/// pipeline.resize(1920, 1080, None)?;
/// pipeline.stop();
/// # Ok::<(), camera_pipeline::PipelineError>(())
/// ```
pub struct CapturePipeline {
    shared: Arc<Shared>,
    thread: Mutex<Option<CaptureLoopController>>,
    events: Mutex<Option<Receiver<PipelineEvent>>>,
}

impl CapturePipeline {
    /// Pipeline over real V4L2 devices
    pub fn new(config: PipelineConfig) -> PipelineResult<Self> {
        Self::with_provider(config, Arc::new(V4l2Provider))
    }

    /// Pipeline over devices opened by `provider`
    pub fn with_provider(
        config: PipelineConfig,
        provider: Arc<dyn DeviceProvider>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        let request = CaptureRequest {
            width: config.width,
            height: config.height,
            format: config.format,
            fps: config.fps,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                provider,
                inner: Mutex::new(Inner {
                    device: None,
                    caps: None,
                    state: StreamState::Closed,
                    request,
                    negotiated: None,
                    active: None,
                    negotiator: FormatNegotiator::new(),
                    buffers: BufferManager::new(),
                    controls: Vec::new(),
                    stats: FrameStats::default(),
                }),
                running: Arc::new(AtomicBool::new(false)),
                resize_pending: AtomicBool::new(false),
                resize_slot: Mutex::new(None),
                callback: Mutex::new(None),
                events: events_tx,
                config,
            }),
            thread: Mutex::new(None),
            events: Mutex::new(Some(events_rx)),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Take the event receiver; `None` after the first call
    pub fn events(&self) -> Option<Receiver<PipelineEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Install the frame-ready callback, replacing any previous one
    pub fn set_frame_callback<F>(&self, callback: F)
    where
        F: FnMut(&CapturedFrame<'_>) -> Result<(), String> + Send + 'static,
    {
        *self
            .shared
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Box::new(callback));
    }

    pub fn state(&self) -> StreamState {
        self.shared.lock().state
    }

    pub fn active_format(&self) -> Option<ActiveFormat> {
        self.shared.lock().active
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Open the configured device (CLOSED -> OPEN)
    pub fn open(&self) -> PipelineResult<()> {
        let mut inner = self.shared.lock();
        self.shared.open_locked(&mut inner)
    }

    /// Stop capture if running and close the device
    pub fn close(&self) {
        self.stop();
        let mut inner = self.shared.lock();
        self.shared.teardown_locked(&mut inner);
    }

    /// Device identity and buffer capabilities
    pub fn capabilities(&self) -> PipelineResult<DeviceCapabilities> {
        self.shared.lock().caps.clone().ok_or(PipelineError::NotOpen)
    }

    /// Search the open device for a matching format without applying it
    pub fn find_format(
        &self,
        width: u32,
        height: u32,
        format: Option<CanonicalFormat>,
        fps_min: f64,
        fps_max: f64,
    ) -> PipelineResult<NegotiatedFormat> {
        let mut inner = self.shared.lock();
        let device = inner.device.clone().ok_or(PipelineError::NotOpen)?;
        inner.negotiator.find_format(
            device.as_ref(),
            width,
            height,
            format,
            FpsRange::new(fps_min, fps_max),
        )
    }

    /// Format picked by the last unhinted search
    pub fn default_format(&self) -> Option<CanonicalFormat> {
        self.shared.lock().negotiator.default_format()
    }

    /// Negotiate the configured request on the open device (OPEN -> NEGOTIATED)
    pub fn negotiate(&self) -> PipelineResult<ActiveFormat> {
        let mut inner = self.shared.lock();
        let request = inner.request;
        self.shared.negotiate_locked(&mut inner, request)
    }

    /// Start capturing; idempotent
    ///
    /// The device is opened here if it is closed. In thread mode the capture
    /// thread negotiates and starts streaming, reporting failures as events;
    /// in polled mode this happens before returning.
    pub fn start(&self) -> PipelineResult<()> {
        let mut thread = self.thread.lock().unwrap_or_else(|e| e.into_inner());
        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Reap a loop that ended on its own
        if let Some(mut previous) = thread.take() {
            previous.join();
        }

        match self.shared.config.drive_mode {
            DriveMode::Thread => {
                {
                    let mut inner = self.shared.lock();
                    if inner.state == StreamState::Closed {
                        self.shared.open_locked(&mut inner)?;
                    }
                }
                self.shared.running.store(true, Ordering::SeqCst);

                let init_shared = Arc::clone(&self.shared);
                let loop_shared = Arc::clone(&self.shared);
                let exit_shared = Arc::clone(&self.shared);
                let controller = CaptureLoopController::start(
                    "camera-capture",
                    Arc::clone(&self.shared.running),
                    move || {
                        let mut inner = init_shared.lock();
                        init_shared.bring_up_locked(&mut inner).map_err(|e| {
                            init_shared.emit(PipelineEvent::Error(e.clone()));
                            e.to_string()
                        })
                    },
                    move |_active| engine::step(&loop_shared).into_action(),
                    move |_active, exit| {
                        exit_shared.running.store(false, Ordering::SeqCst);
                        if exit != LoopExit::InitFailed {
                            let mut inner = exit_shared.lock();
                            exit_shared.teardown_locked(&mut inner);
                            exit_shared.emit(PipelineEvent::Stopped);
                        }
                    },
                );
                match controller {
                    Ok(controller) => {
                        *thread = Some(controller);
                        Ok(())
                    }
                    Err(e) => {
                        self.shared.running.store(false, Ordering::SeqCst);
                        Err(e)
                    }
                }
            }
            DriveMode::Polled => {
                let mut inner = self.shared.lock();
                self.shared.bring_up_locked(&mut inner)?;
                self.shared.running.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Stop capturing and close the device; idempotent
    ///
    /// Must not be called from the frame callback.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let controller = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut controller) = controller {
            controller.stop();
        }
        let mut inner = self.shared.lock();
        if inner.state != StreamState::Closed {
            self.shared.teardown_locked(&mut inner);
        }
    }

    /// Ask for new capture parameters; returns immediately
    ///
    /// While capturing, the engine applies the most recent request between
    /// frames and restores the previous parameters if it cannot be met.
    /// Otherwise the request is used by the next start.
    pub fn resize(
        &self,
        width: u32,
        height: u32,
        format: Option<CanonicalFormat>,
    ) -> PipelineResult<()> {
        if width == 0 || height == 0 {
            return Err(PipelineError::Config(format!(
                "invalid size {}x{}",
                width, height
            )));
        }
        let request = ResizeRequest {
            width,
            height,
            format,
        };
        if self.shared.running.load(Ordering::SeqCst) {
            *self
                .shared
                .resize_slot
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(request);
            self.shared.resize_pending.store(true, Ordering::SeqCst);
            debug!(width, height, ?format, "Resize requested");
        } else {
            let mut inner = self.shared.lock();
            inner.request.width = width;
            inner.request.height = height;
            inner.request.format = format;
        }
        Ok(())
    }

    /// Run one engine iteration (polled mode)
    ///
    /// Waits up to the frame timeout; returns `true` when a frame was
    /// delivered to the callback.
    pub fn poll_frame(&self) -> PipelineResult<bool> {
        if self.shared.config.drive_mode != DriveMode::Polled {
            return Err(PipelineError::InvalidState {
                expected: "polled drive mode",
                actual: "thread drive mode",
            });
        }
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(PipelineError::InvalidState {
                expected: StreamState::Streaming.name(),
                actual: self.state().name(),
            });
        }
        match engine::step(&self.shared) {
            engine::StepOutcome::Frame => Ok(true),
            engine::StepOutcome::Idle => Ok(false),
            engine::StepOutcome::Stop(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                let mut inner = self.shared.lock();
                self.shared.teardown_locked(&mut inner);
                self.shared.emit(PipelineEvent::Stopped);
                match err {
                    Some(e) => Err(e),
                    None => Ok(false),
                }
            }
        }
    }

    /// Controls of the open device, in driver order
    pub fn controls(&self) -> PipelineResult<Vec<ControlDescriptor>> {
        let inner = self.shared.lock();
        if inner.device.is_none() {
            return Err(PipelineError::NotOpen);
        }
        Ok(inner.controls.clone())
    }

    fn control_target(
        inner: &Inner,
        id: u32,
    ) -> PipelineResult<(Arc<dyn CaptureDevice>, ControlDescriptor)> {
        let device = inner.device.clone().ok_or(PipelineError::NotOpen)?;
        let descriptor = inner
            .controls
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| PipelineError::NotSupported(format!("control {:#010x}", id)))?;
        Ok((device, descriptor))
    }

    pub fn get_control(&self, id: u32) -> PipelineResult<i32> {
        let inner = self.shared.lock();
        let (device, _) = Self::control_target(&inner, id)?;
        device.get_control(id)
    }

    /// Set a control; returns the value the driver kept
    pub fn set_control(&self, id: u32, value: i32) -> PipelineResult<i32> {
        let inner = self.shared.lock();
        let (device, descriptor) = Self::control_target(&inner, id)?;
        if descriptor.is_read_only() {
            return Err(PipelineError::NotSupported(format!(
                "control {} is read-only",
                descriptor.name
            )));
        }
        if descriptor.kind.has_menu() && !descriptor.menu.iter().any(|m| m.index as i32 == value) {
            return Err(PipelineError::NotSupported(format!(
                "{} has no menu entry {}",
                descriptor.name, value
            )));
        }
        let applied = device.set_control(id, value)?;
        debug!(control = %descriptor.name, requested = value, applied, "Control set");
        Ok(applied)
    }

    /// Formats, sizes and rates of the open device
    pub fn capability_report(&self) -> PipelineResult<CapabilityReport> {
        let inner = self.shared.lock();
        let device = inner.device.clone().ok_or(PipelineError::NotOpen)?;
        let caps = inner.caps.clone().ok_or(PipelineError::NotOpen)?;
        let controls = inner.controls.clone();
        drop(inner);
        CapabilityReport::collect(
            &self.shared.config.device_path,
            caps,
            device.as_ref(),
            controls,
        )
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl engine::StepOutcome {
    fn into_action(self) -> LoopAction {
        match self {
            engine::StepOutcome::Frame | engine::StepOutcome::Idle => LoopAction::Continue,
            engine::StepOutcome::Stop(err) => {
                if let Some(e) = err {
                    error!(error = %e, "Capture loop stopping on error");
                }
                LoopAction::Stop
            }
        }
    }
}
