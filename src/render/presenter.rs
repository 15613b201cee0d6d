// SPDX-License-Identifier: GPL-3.0-only

//! Glue between the capture callback and the renderer

use super::{RenderFrame, Renderer, Transform};
use crate::convert::{DecodeTarget, MjpegDecoder};
use crate::errors::RenderError;
use crate::formats::{CanonicalFormat, FrameDescriptor};
use crate::pipeline::{CapturedFrame, FrameCallback};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Decodes compressed frames and draws every frame with one transform
pub struct Presenter {
    renderer: Renderer,
    decoder: MjpegDecoder,
    transform: Transform,
    /// Descriptor of the last captured frame
    capture: Option<FrameDescriptor>,
    presented: u64,
}

impl Presenter {
    pub fn new(renderer: Renderer) -> Self {
        Self {
            renderer,
            decoder: MjpegDecoder::new(DecodeTarget::Any),
            transform: Transform::IDENTITY,
            capture: None,
            presented: 0,
        }
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn decoder(&self) -> &MjpegDecoder {
        &self.decoder
    }

    pub fn present(&mut self, frame: &CapturedFrame<'_>) -> Result<(), RenderError> {
        // A renegotiated stream may decode to a different layout
        if self.capture.is_some_and(|d| d != frame.descriptor) {
            debug!(descriptor = %frame.descriptor, "Capture format changed, resetting decoder");
            self.decoder.reset();
        }
        self.capture = Some(frame.descriptor);

        match frame.descriptor.format {
            CanonicalFormat::Mjpeg => {
                let decoded = self.decoder.decode(frame.data)?;
                if decoded.format_changed {
                    info!(descriptor = %decoded.descriptor, "Decoded format changed");
                }
                self.renderer
                    .draw(&RenderFrame::from(&decoded), self.transform)?;
            }
            CanonicalFormat::H264 => {
                return Err(RenderError::UnsupportedFormat(
                    CanonicalFormat::H264.to_string(),
                ));
            }
            _ => self.renderer.draw(&RenderFrame::from(frame), self.transform)?,
        }
        self.presented += 1;
        Ok(())
    }

    /// Frame callback that presents each captured frame
    pub fn into_callback(self) -> FrameCallback {
        Self::shared_callback(Arc::new(Mutex::new(self)))
    }

    /// Frame callback over a presenter the caller keeps a handle to
    pub fn shared_callback(presenter: Arc<Mutex<Presenter>>) -> FrameCallback {
        Box::new(move |frame: &CapturedFrame<'_>| {
            presenter
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .present(frame)
                .map_err(|e| e.to_string())
        })
    }
}
