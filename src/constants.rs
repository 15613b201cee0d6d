// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline-wide constants

/// Capture timing
pub mod timing {
    use std::time::Duration;

    /// Bounded wait for a filled capture buffer before the loop re-checks its flags
    pub const FRAME_WAIT: Duration = Duration::from_millis(100);

    /// Number of frames between periodic capture statistics log lines
    pub const STATS_EVERY_N_FRAMES: u64 = 300;
}

/// Capture buffer defaults
pub mod buffers {
    /// Buffers requested when the configuration does not say otherwise
    pub const DEFAULT_COUNT: u32 = 4;

    /// Upper bound accepted from configuration
    pub const MAX_COUNT: u32 = 32;
}

/// Default capture request
pub mod capture {
    /// Default device node
    pub const DEFAULT_DEVICE: &str = "/dev/video0";

    pub const DEFAULT_WIDTH: u32 = 1280;
    pub const DEFAULT_HEIGHT: u32 = 720;

    /// Lower bound of the default frame rate window (inclusive)
    pub const DEFAULT_FPS_MIN: f64 = 15.0;

    /// Upper bound of the default frame rate window (exclusive)
    pub const DEFAULT_FPS_MAX: f64 = 61.0;
}

/// GPU rendering
pub mod render {
    /// Clear color used once after the texture set is rebuilt
    pub const CLEAR_COLOR: wgpu::Color = wgpu::Color::BLACK;

    /// Output texture format presented to the application layer
    pub const OUTPUT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
}
