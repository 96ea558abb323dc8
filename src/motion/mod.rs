//! Frame-to-frame luma differencing: the comparator behind `vt-motion`.
//!
//! No teacher precedent for video motion analysis; the pipeline itself is
//! grounded on the original tool's `Comparator::apply`/`compareImp` (decode,
//! optional histogram-equalise over unmasked pixels, per-pixel `|new - old|`
//! against squelch, green/dim-red output image), while the surrounding
//! plumbing — config struct with sane defaults, a `Result`-returning
//! `process` entry point, inline tests exercising the "identical frames
//! produce no event" invariant — follows the crate's general module shape.

mod mask;

pub use mask::Mask;

use serde::Serialize;

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct MotionConfig {
    /// Minimum gap between comparisons, in milliseconds.
    pub interval_ms: u64,
    /// Integer subsample divisor applied before comparison.
    pub scale: u32,
    /// Per-pixel luma-delta threshold (0..255) below which a change is noise.
    pub squelch: u8,
    /// Per-frame changed-pixel count above which a `changes` event fires.
    pub threshold: u32,
    /// Lower threshold at which the event is logged but not published; `None`
    /// disables log-only reporting.
    pub log_threshold: Option<u32>,
    pub equalise: bool,
    pub mask_path: Option<std::path::PathBuf>,
    /// When true, masked pixels render plain black/grey instead of dim red.
    pub plain: bool,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            scale: 1,
            squelch: 10,
            threshold: 1,
            log_threshold: None,
            equalise: false,
            mask_path: None,
            plain: false,
        }
    }
}

/// The JSON event published on the event channel and logged, matching the
/// original tool's field set verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct MotionEvent {
    pub app: &'static str,
    pub version: u32,
    pub pid: u32,
    pub time: i64,
    pub event: &'static str,
    pub squelch: u8,
    pub threshold: u32,
    pub equalise: u8,
    pub mask: String,
    pub masktime: i64,
    pub dx: usize,
    pub dy: usize,
    pub count: u32,
    pub repeat: u32,
}

impl MotionEvent {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|_| Error::Protocol("failed to serialize motion event"))
    }
}

/// What one `process` call produced.
pub struct DiffOutcome {
    /// Unmasked-pixel count of `|new - old| > squelch`.
    pub count: u32,
    /// Unmasked-pixel count of `|new - old| <= squelch`.
    pub noise: u32,
    /// RGB output image (green highlight / dim red mask), `dx * dy * 3` bytes.
    pub overlay: Vec<u8>,
    /// `Some` when `count >= threshold`.
    pub event: Option<MotionEvent>,
    /// `true` when `count >= log_threshold` even if no event fired.
    pub should_log: bool,
}

/// One comparator instance per monitored stream; holds the previous frame,
/// the mask, and the histogram-equalisation state across calls.
pub struct MotionCore {
    config: MotionConfig,
    mask_path_str: String,
    previous: Option<Vec<u8>>,
    dx: usize,
    dy: usize,
    mask: Option<Mask>,
    last_event: Option<MotionEvent>,
}

impl MotionCore {
    pub fn new(config: MotionConfig) -> Self {
        let mask_path_str = config.mask_path.as_ref().map(|p| p.display().to_string()).unwrap_or_default();
        Self { config, mask_path_str, previous: None, dx: 0, dy: 0, mask: None, last_event: None }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Applies one input frame (already decoded to single-channel raw luma
    /// at `dx x dy`, i.e. post-[`crate::image`]-decode and post-scale).
    /// `now_epoch_s` timestamps any emitted event.
    pub fn process(&mut self, raw: &[u8], dx: usize, dy: usize, now_epoch_s: i64) -> Result<DiffOutcome> {
        if raw.len() != dx * dy {
            return Err(Error::Protocol("motion: raw buffer size does not match dx*dy"));
        }

        let first_or_resized = self.previous.is_none() || self.dx != dx || self.dy != dy;
        if first_or_resized {
            self.dx = dx;
            self.dy = dy;
            self.mask = Some(Mask::load(self.config.mask_path.as_deref(), dx, dy)?);
        } else if let Some(mask) = self.mask.as_mut() {
            mask.update()?;
        }
        let mask = self.mask.as_ref().expect("mask initialised above");

        let current = if self.config.equalise { equalise(raw, dx, dy, mask) } else { raw.to_vec() };

        if first_or_resized {
            self.previous = Some(current);
            return Ok(DiffOutcome { count: 0, noise: 0, overlay: vec![0; dx * dy * 3], event: None, should_log: false });
        }

        let old = self.previous.as_ref().expect("checked above");
        let (count, noise, overlay) = diff(old, &current, dx, dy, self.config.squelch, mask, self.config.plain);
        self.previous = Some(current);

        let event = if count >= self.config.threshold {
            let ev = self.build_event(now_epoch_s, mask.mtime_epoch(), dx, dy, count, 0);
            self.last_event = Some(ev.clone());
            Some(ev)
        } else {
            self.last_event = None;
            None
        };
        let should_log = matches!(self.config.log_threshold, Some(t) if count >= t);

        Ok(DiffOutcome { count, noise, overlay, event, should_log })
    }

    /// Re-emits the last event with an incremented `repeat` field, for a
    /// repeat timer to call periodically until a new frame arrives (which
    /// clears `last_event`). Returns `None` if there's nothing to repeat.
    pub fn repeat_event(&mut self, now_epoch_s: i64) -> Option<MotionEvent> {
        let prev = self.last_event.as_ref()?;
        let mut ev = prev.clone();
        ev.time = now_epoch_s;
        ev.repeat += 1;
        self.last_event = Some(ev.clone());
        Some(ev)
    }

    fn build_event(&self, now_epoch_s: i64, masktime: i64, dx: usize, dy: usize, count: u32, repeat: u32) -> MotionEvent {
        MotionEvent {
            app: "watcher",
            version: 1,
            pid: std::process::id(),
            time: now_epoch_s,
            event: "changes",
            squelch: self.config.squelch,
            threshold: self.config.threshold,
            equalise: self.config.equalise as u8,
            mask: self.mask_path_str.clone(),
            masktime,
            dx,
            dy,
            count,
            repeat,
        }
    }

    /// Applies `;`-separated live-tuning tokens (`squelch=N`, `threshold=N`,
    /// `equalise=on|off`). Unrecognised or malformed tokens are skipped with
    /// a warning; the whole command string is never rejected outright.
    pub fn apply_command(&mut self, command: &str) {
        for token in command.split(';') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let Some((key, value)) = token.split_once('=') else {
                log::warn!("motion: ignoring malformed command token {token:?}");
                continue;
            };
            match key.trim() {
                "squelch" => match value.trim().parse() {
                    Ok(v) => self.config.squelch = v,
                    Err(_) => log::warn!("motion: ignoring invalid squelch value {value:?}"),
                },
                "threshold" => match value.trim().parse() {
                    Ok(v) => self.config.threshold = v,
                    Err(_) => log::warn!("motion: ignoring invalid threshold value {value:?}"),
                },
                "equalise" => match value.trim() {
                    "on" => self.config.equalise = true,
                    "off" => self.config.equalise = false,
                    other => log::warn!("motion: ignoring invalid equalise value {other:?}"),
                },
                other => log::warn!("motion: ignoring unknown command key {other:?}"),
            }
        }
    }
}

/// Histogram equalisation over unmasked pixels: build a 256-bucket histogram,
/// accumulate its CDF, map each pixel (masked pixels pass through unchanged,
/// matching the original tool's `equalise` which only builds the histogram
/// from unmasked pixels but maps every pixel through it).
fn equalise(raw: &[u8], dx: usize, dy: usize, mask: &Mask) -> Vec<u8> {
    let mut histogram = [0u32; 256];
    let mut unmasked_count = 0u32;
    for y in 0..dy {
        for x in 0..dx {
            if !mask.masked(x, y) {
                histogram[raw[y * dx + x] as usize] += 1;
                unmasked_count += 1;
            }
        }
    }
    if unmasked_count == 0 {
        return raw.to_vec();
    }

    let mut cdf = [0u32; 256];
    let mut running = 0u32;
    for (bucket, count) in histogram.iter().enumerate() {
        running += count;
        cdf[bucket] = running;
    }
    let cdf_min = cdf.iter().copied().find(|&c| c > 0).unwrap_or(0);
    let denom = (unmasked_count - cdf_min).max(1);

    let map = |v: u8| -> u8 {
        let c = cdf[v as usize];
        (((c.saturating_sub(cdf_min)) as u64 * 255) / denom as u64) as u8
    };

    raw.iter().map(|&v| map(v)).collect()
}

/// Per-pixel `|new - old|` diff against `squelch`. Returns `(count, noise,
/// overlay)`: unmasked pixels render dim grey with bright green where
/// changed; masked pixels render dim red, or black/passthrough when `plain`.
fn diff(old: &[u8], new: &[u8], dx: usize, dy: usize, squelch: u8, mask: &Mask, plain: bool) -> (u32, u32, Vec<u8>) {
    let mut count = 0u32;
    let mut noise = 0u32;
    let mut overlay = vec![0u8; dx * dy * 3];

    for y in 0..dy {
        for x in 0..dx {
            let idx = y * dx + x;
            let o = old[idx];
            let n = new[idx];
            let dluma = o.abs_diff(n);
            let dimmed = n / 4;
            let masked = mask.masked(x, y);
            let out = &mut overlay[idx * 3..idx * 3 + 3];

            if plain && masked {
                out[0] = 0;
                out[1] = 0;
                out[2] = 0;
            } else if plain {
                out[0] = n;
                out[1] = n;
                out[2] = n;
            } else if masked {
                out[0] = dimmed;
                out[1] = 0;
                out[2] = 0;
            } else {
                out[0] = dimmed;
                out[1] = if dluma > squelch { 255 } else { dimmed };
                out[2] = dimmed;
            }

            if !masked {
                if dluma > squelch {
                    count += 1;
                } else {
                    noise += 1;
                }
            }
        }
    }

    (count, noise, overlay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_frames_never_trigger_regardless_of_tuning() {
        let frame = vec![128u8; 100 * 100];
        let mut core = MotionCore::new(MotionConfig { squelch: 10, threshold: 1, ..Default::default() });
        core.process(&frame, 100, 100, 0).unwrap(); // first frame: establishes baseline
        for t in 1..10 {
            let outcome = core.process(&frame, 100, 100, t).unwrap();
            assert_eq!(outcome.count, 0);
            assert!(outcome.event.is_none());
        }
    }

    #[test]
    fn single_pixel_change_above_squelch_crosses_threshold() {
        let mut frame = vec![100u8; 100 * 100];
        let mut core = MotionCore::new(MotionConfig { squelch: 10, threshold: 1, ..Default::default() });
        core.process(&frame, 100, 100, 0).unwrap();
        frame[0] = 120; // delta 20 > squelch 10
        let outcome = core.process(&frame, 100, 100, 1).unwrap();
        assert_eq!(outcome.count, 1);
        assert!(outcome.event.is_some());
        assert_eq!(outcome.event.unwrap().count, 1);
    }

    #[test]
    fn change_below_squelch_counts_as_noise_not_change() {
        let mut frame = vec![100u8; 10 * 10];
        let mut core = MotionCore::new(MotionConfig { squelch: 10, threshold: 1, ..Default::default() });
        core.process(&frame, 10, 10, 0).unwrap();
        frame[0] = 105; // delta 5 <= squelch 10
        let outcome = core.process(&frame, 10, 10, 1).unwrap();
        assert_eq!(outcome.count, 0);
        assert_eq!(outcome.noise, 1);
        assert!(outcome.event.is_none());
    }

    #[test]
    fn dimension_change_resets_baseline_without_diffing() {
        let small = vec![0u8; 10 * 10];
        let mut core = MotionCore::new(MotionConfig::default());
        core.process(&small, 10, 10, 0).unwrap();
        let bigger = vec![255u8; 20 * 20];
        let outcome = core.process(&bigger, 20, 20, 1).unwrap();
        assert_eq!(outcome.count, 0);
        assert!(outcome.event.is_none());
    }

    #[test]
    fn live_tuning_updates_squelch_and_threshold() {
        let mut core = MotionCore::new(MotionConfig::default());
        core.apply_command("squelch=42;threshold=7");
        assert_eq!(core.config().squelch, 42);
        assert_eq!(core.config().threshold, 7);
    }

    #[test]
    fn live_tuning_toggles_equalise_and_ignores_garbage() {
        let mut core = MotionCore::new(MotionConfig::default());
        core.apply_command("equalise=on;bogus;squelch=notanumber");
        assert!(core.config().equalise);
        assert_eq!(core.config().squelch, MotionConfig::default().squelch);
    }

    #[test]
    fn repeat_event_increments_and_clears_on_new_frame() {
        let mut frame = vec![100u8; 10 * 10];
        let mut core = MotionCore::new(MotionConfig { squelch: 10, threshold: 1, ..Default::default() });
        core.process(&frame, 10, 10, 0).unwrap();
        frame[0] = 255;
        core.process(&frame, 10, 10, 1).unwrap();
        let r1 = core.repeat_event(2).unwrap();
        assert_eq!(r1.repeat, 1);
        let r2 = core.repeat_event(3).unwrap();
        assert_eq!(r2.repeat, 2);

        core.process(&frame, 10, 10, 4).unwrap(); // identical to last; clears last_event
        assert!(core.repeat_event(5).is_none());
    }

    #[test]
    fn event_json_matches_stable_schema() {
        let mut frame = vec![100u8; 10 * 10];
        let mut core = MotionCore::new(MotionConfig { squelch: 10, threshold: 1, ..Default::default() });
        core.process(&frame, 10, 10, 0).unwrap();
        frame[0] = 255;
        let outcome = core.process(&frame, 10, 10, 1000).unwrap();
        let json = outcome.event.unwrap().to_json().unwrap();
        assert!(json.contains("\"app\":\"watcher\""));
        assert!(json.contains("\"event\":\"changes\""));
    }
}
