// SPDX-License-Identifier: GPL-3.0-only

//! Format negotiation
//!
//! Walks the device's advertised formats, then sizes, then frame intervals,
//! and takes the first combination that satisfies the request. Drivers with
//! broken enumeration are given the benefit of the doubt: when size or
//! interval enumeration fails on its very first entry the pair is accepted
//! and the driver gets the final say in `set_format`.

use crate::backends::device::{CaptureDevice, Fraction, FrameIntervalEntry, FrameSizeEntry};
use crate::config::FpsRange;
use crate::errors::{PipelineError, PipelineResult};
use crate::formats::{CanonicalFormat, FourCc, FrameDescriptor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Outcome of a successful search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegotiatedFormat {
    pub fourcc: FourCc,
    pub format: CanonicalFormat,
    pub width: u32,
    pub height: u32,
    pub interval: Fraction,
    /// Accepted without a confirming size or interval enumeration
    pub optimistic: bool,
}

/// The parameters the device is streaming with
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActiveFormat {
    pub width: u32,
    pub height: u32,
    pub format: CanonicalFormat,
    pub fps: f64,
}

impl ActiveFormat {
    pub fn descriptor(&self) -> FrameDescriptor {
        FrameDescriptor::new(self.width, self.height, self.format)
    }
}

/// Interval requested when the driver cannot enumerate rates: the highest
/// whole rate inside `range`, else its lower bound to a thousandth
fn fallback_interval(range: &FpsRange) -> Fraction {
    let whole = range.max.ceil() - 1.0;
    if whole >= range.min && whole >= 1.0 {
        return Fraction::from_fps(whole as u32);
    }
    let millis = (range.min * 1000.0).ceil().clamp(1.0, u32::MAX as f64) as u32;
    Fraction::new(1000, millis)
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// `base + k * step` as a reduced fraction
fn grid_point(base: Fraction, step: Fraction, k: u64) -> Option<Fraction> {
    let num = base.numerator as u64 * step.denominator as u64
        + k * step.numerator as u64 * base.denominator as u64;
    let den = base.denominator as u64 * step.denominator as u64;
    let g = gcd(num, den).max(1);
    Some(Fraction::new(
        u32::try_from(num / g).ok()?,
        u32::try_from(den / g).ok()?,
    ))
}

/// Highest rate inside `range` on a stepwise interval grid
///
/// Intervals run from `min` (fastest) to `max` in increments of `step`; the
/// chosen interval is the shortest grid point whose rate lies below the
/// exclusive upper bound, provided it still reaches the lower bound.
fn snap_stepwise(min: Fraction, max: Fraction, step: Fraction, range: &FpsRange) -> Option<Fraction> {
    let seconds = |f: Fraction| f.numerator as f64 / f.denominator.max(1) as f64;
    let (lo, hi) = if seconds(min) <= seconds(max) { (min, max) } else { (max, min) };
    let step_s = seconds(step);
    if step.numerator == 0 || step_s <= 0.0 {
        return range.contains(lo.fps()).then_some(lo);
    }

    // First grid point at or just past the interval of the upper bound
    let shortest = if range.max.is_finite() && range.max > 0.0 { 1.0 / range.max } else { 0.0 };
    let mut k = ((shortest - seconds(lo)) / step_s).floor().max(0.0) as u64;
    loop {
        let interval = grid_point(lo, step, k)?;
        if seconds(interval) > seconds(hi) + f64::EPSILON {
            return None;
        }
        let fps = interval.fps();
        if fps < range.max {
            return (fps >= range.min).then_some(interval);
        }
        k += 1;
    }
}

fn match_size(sizes: &[FrameSizeEntry], width: u32, height: u32) -> bool {
    sizes.iter().any(|s| s.matches(width, height))
}

fn match_interval(intervals: &[FrameIntervalEntry], range: &FpsRange) -> Option<Fraction> {
    intervals.iter().find_map(|entry| match *entry {
        FrameIntervalEntry::Discrete(frac) => range.contains(frac.fps()).then_some(frac),
        FrameIntervalEntry::Stepwise { min, max, step } => {
            let (lo, hi) = (max.fps().min(min.fps()), min.fps().max(max.fps()));
            if !range.intersects(lo, hi) {
                return None;
            }
            snap_stepwise(min, max, step, range)
        }
    })
}

/// Searches format/size/rate combinations and remembers the default format
#[derive(Debug, Default, Clone)]
pub struct FormatNegotiator {
    default_format: Option<CanonicalFormat>,
}

impl FormatNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Format chosen by the last search that had no format hint
    pub fn default_format(&self) -> Option<CanonicalFormat> {
        self.default_format
    }

    /// Find the first advertised combination matching the request
    ///
    /// With `format_hint` unset every mapped format is considered and the
    /// match becomes the new default format.
    pub fn find_format(
        &mut self,
        device: &dyn CaptureDevice,
        width: u32,
        height: u32,
        format_hint: Option<CanonicalFormat>,
        fps: FpsRange,
    ) -> PipelineResult<NegotiatedFormat> {
        if format_hint == Some(CanonicalFormat::Unknown) {
            return Err(PipelineError::NotSupported(
                "unmapped pixel format".to_string(),
            ));
        }

        for entry in device.enum_formats()? {
            let format = CanonicalFormat::from_fourcc(entry.fourcc);
            if format == CanonicalFormat::Unknown {
                debug!(fourcc = %entry.fourcc, "Skipping unmapped format");
                continue;
            }
            if format_hint.is_some_and(|hint| hint != format) {
                continue;
            }
            if !format.fits_subsampling(width, height) {
                debug!(format = %format, width, height, "Size splits chroma blocks, skipping");
                continue;
            }

            let mut optimistic = false;
            match device.enum_frame_sizes(entry.fourcc) {
                Ok(sizes) if !sizes.is_empty() => {
                    if !match_size(&sizes, width, height) {
                        continue;
                    }
                }
                Ok(_) | Err(_) => {
                    debug!(fourcc = %entry.fourcc, "Size enumeration unavailable, accepting size");
                    optimistic = true;
                }
            }

            let interval = match device.enum_frame_intervals(entry.fourcc, width, height) {
                Ok(intervals) if !intervals.is_empty() => match match_interval(&intervals, &fps) {
                    Some(interval) => interval,
                    None => continue,
                },
                Ok(_) | Err(_) => {
                    debug!(fourcc = %entry.fourcc, "Interval enumeration unavailable, accepting rate");
                    optimistic = true;
                    fallback_interval(&fps)
                }
            };

            let negotiated = NegotiatedFormat {
                fourcc: entry.fourcc,
                format,
                width,
                height,
                interval,
                optimistic,
            };
            if format_hint.is_none() {
                self.default_format = Some(format);
            }
            info!(
                format = %format,
                fourcc = %entry.fourcc,
                width,
                height,
                fps = interval.fps(),
                optimistic,
                "Negotiated capture format"
            );
            return Ok(negotiated);
        }

        Err(PipelineError::NotSupported(format!(
            "no format for {}x{} {} at [{}, {}) fps",
            width,
            height,
            format_hint.map(|f| f.name()).unwrap_or("(any)"),
            fps.min,
            fps.max
        )))
    }
}

/// Program the device with a negotiated format
///
/// A driver that adjusts the size or code is treated as a refusal. A refused
/// frame interval is tolerated; the driver's own rate is reported instead.
pub fn apply_format(
    device: &dyn CaptureDevice,
    negotiated: &NegotiatedFormat,
) -> PipelineResult<ActiveFormat> {
    let applied = device.set_format(negotiated.fourcc, negotiated.width, negotiated.height)?;
    if applied.width != negotiated.width
        || applied.height != negotiated.height
        || CanonicalFormat::from_fourcc(applied.fourcc) != negotiated.format
    {
        return Err(PipelineError::NotSupported(format!(
            "driver adjusted {}x{} {} to {}x{} {}",
            negotiated.width,
            negotiated.height,
            negotiated.fourcc,
            applied.width,
            applied.height,
            applied.fourcc
        )));
    }

    let fps = match device.set_frame_interval(negotiated.interval) {
        Ok(interval) => interval.fps(),
        Err(e) => {
            warn!(error = %e, "Driver refused frame interval, keeping its rate");
            negotiated.interval.fps()
        }
    };

    Ok(ActiveFormat {
        width: applied.width,
        height: applied.height,
        format: negotiated.format,
        fps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::virtual_device::{VirtualDevice, VirtualFormat};

    #[test]
    fn test_first_match_becomes_default() {
        let dev = VirtualDevice::new();
        let mut negotiator = FormatNegotiator::new();
        let found = negotiator
            .find_format(&dev, 1920, 1080, None, FpsRange::new(24.0, 31.0))
            .unwrap();
        assert_eq!(found.format, CanonicalFormat::Yuyv);
        assert_eq!(found.interval, Fraction::new(1, 30));
        assert_eq!(negotiator.default_format(), Some(CanonicalFormat::Yuyv));
    }

    #[test]
    fn test_hint_does_not_change_default() {
        let dev = VirtualDevice::new();
        let mut negotiator = FormatNegotiator::new();
        let found = negotiator
            .find_format(
                &dev,
                1280,
                720,
                Some(CanonicalFormat::Mjpeg),
                FpsRange::new(50.0, 61.0),
            )
            .unwrap();
        assert_eq!(found.format, CanonicalFormat::Mjpeg);
        assert_eq!(found.interval.fps(), 60.0);
        assert_eq!(negotiator.default_format(), None);
    }

    #[test]
    fn test_upper_bound_is_exclusive() {
        let dev = VirtualDevice::with_formats(vec![VirtualFormat::discrete(
            b"YUYV",
            &[(640, 480)],
            &[30],
        )]);
        let mut negotiator = FormatNegotiator::new();
        assert!(
            negotiator
                .find_format(&dev, 640, 480, None, FpsRange::new(15.0, 30.0))
                .is_err()
        );
        assert!(
            negotiator
                .find_format(&dev, 640, 480, None, FpsRange::new(30.0, 31.0))
                .is_ok()
        );
    }

    #[test]
    fn test_stepwise_size_and_rate() {
        let dev = VirtualDevice::new();
        let mut negotiator = FormatNegotiator::new();
        let found = negotiator
            .find_format(
                &dev,
                800,
                600,
                Some(CanonicalFormat::Nv12),
                FpsRange::new(20.0, 26.0),
            )
            .unwrap();
        assert_eq!(found.interval, Fraction::new(1, 25));
        assert!(!found.optimistic);

        // 801 is off the 16-pixel grid
        assert!(
            negotiator
                .find_format(
                    &dev,
                    801,
                    600,
                    Some(CanonicalFormat::Nv12),
                    FpsRange::new(20.0, 26.0)
                )
                .is_err()
        );
    }

    #[test]
    fn test_broken_enumeration_accepted_optimistically() {
        let dev = VirtualDevice::with_formats(vec![
            VirtualFormat::discrete(b"UYVY", &[(640, 480)], &[30])
                .with_failing_size_enum()
                .with_failing_interval_enum(),
        ]);
        let mut negotiator = FormatNegotiator::new();
        let found = negotiator
            .find_format(&dev, 1024, 768, None, FpsRange::new(15.0, 61.0))
            .unwrap();
        assert!(found.optimistic);
        assert_eq!(found.format, CanonicalFormat::Uyvy);
        assert_eq!(found.interval.fps(), 60.0);
    }

    fn stepwise_rates(step: Fraction) -> VirtualDevice {
        let mut format = VirtualFormat::discrete(b"NV12", &[(640, 480)], &[]);
        format.intervals = vec![FrameIntervalEntry::Stepwise {
            min: Fraction::new(1, 60),
            max: Fraction::new(1, 5),
            step,
        }];
        VirtualDevice::with_formats(vec![format])
    }

    #[test]
    fn test_stepwise_rate_lands_on_grid() {
        let mut negotiator = FormatNegotiator::new();

        // 1/60 + k/30000 reaches 29.97 fps at k = 501
        let dev = stepwise_rates(Fraction::new(1, 30000));
        let found = negotiator
            .find_format(&dev, 640, 480, None, FpsRange::new(29.97, 30.0))
            .unwrap();
        assert_eq!(found.interval, Fraction::new(1001, 30000));

        // On a 1/600 grid the nearest rates are 30 and 28.57
        let dev = stepwise_rates(Fraction::new(1, 600));
        assert!(
            negotiator
                .find_format(&dev, 640, 480, None, FpsRange::new(29.97, 30.0))
                .is_err()
        );
        let found = negotiator
            .find_format(&dev, 640, 480, None, FpsRange::new(20.0, 30.0))
            .unwrap();
        assert_eq!(found.interval, Fraction::new(7, 200));
    }

    #[test]
    fn test_fallback_interval_stays_in_range() {
        assert_eq!(fallback_interval(&FpsRange::new(15.0, 61.0)), Fraction::new(1, 60));
        let fractional = fallback_interval(&FpsRange::new(29.97, 30.0));
        assert!(FpsRange::new(29.97, 30.0).contains(fractional.fps()));
    }

    #[test]
    fn test_unhinted_search_ignores_previous_default() {
        let dev = VirtualDevice::new();
        let mut negotiator = FormatNegotiator::new();
        negotiator
            .find_format(&dev, 640, 480, None, FpsRange::default())
            .unwrap();
        assert_eq!(negotiator.default_format(), Some(CanonicalFormat::Yuyv));

        // Only the stepwise NV12 entry offers 800x600
        let found = negotiator
            .find_format(&dev, 800, 600, None, FpsRange::default())
            .unwrap();
        assert_eq!(found.format, CanonicalFormat::Nv12);
        assert_eq!(negotiator.default_format(), Some(CanonicalFormat::Nv12));
    }

    #[test]
    fn test_sizes_splitting_chroma_blocks_skipped() {
        let dev = VirtualDevice::with_formats(vec![
            VirtualFormat::discrete(b"NV12", &[(641, 480)], &[30]),
            VirtualFormat::discrete(b"RGB3", &[(641, 480)], &[30]),
        ]);
        let mut negotiator = FormatNegotiator::new();
        let found = negotiator
            .find_format(&dev, 641, 480, None, FpsRange::default())
            .unwrap();
        assert_eq!(found.format, CanonicalFormat::Rgb24);
    }

    #[test]
    fn test_unknown_formats_skipped() {
        let dev = VirtualDevice::with_formats(vec![
            VirtualFormat::discrete(b"ZZZZ", &[(640, 480)], &[30]),
            VirtualFormat::discrete(b"GREY", &[(640, 480)], &[30]),
        ]);
        let mut negotiator = FormatNegotiator::new();
        let found = negotiator
            .find_format(&dev, 640, 480, None, FpsRange::default())
            .unwrap();
        assert_eq!(found.format, CanonicalFormat::Gray8);
    }

    #[test]
    fn test_apply_rejects_adjusted_size() {
        let dev = VirtualDevice::new();
        let negotiated = NegotiatedFormat {
            fourcc: FourCc::new(b"YUYV"),
            format: CanonicalFormat::Yuyv,
            width: 1000,
            height: 1000,
            interval: Fraction::from_fps(30),
            optimistic: true,
        };
        assert!(matches!(
            apply_format(&dev, &negotiated),
            Err(PipelineError::NotSupported(_))
        ));

        let negotiated = NegotiatedFormat {
            width: 1280,
            height: 720,
            ..negotiated
        };
        let active = apply_format(&dev, &negotiated).unwrap();
        assert_eq!(active.descriptor().expected_size(), Some(1280 * 720 * 2));
        assert_eq!(active.fps, 30.0);
    }
}
