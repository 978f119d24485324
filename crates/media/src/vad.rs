//! Energy-based voice activity detection.
//!
//! Per-frame RMS energy against a rolling noise floor (20th percentile of
//! the last 2 s of silence frames). Hysteresis on both edges: `k_on`
//! consecutive speech frames to enter "speaking", `k_off` consecutive
//! silence frames to leave it. The first `calibration_frames` frames only
//! establish the floor; no events are emitted during calibration.
//!
//! The detector is pure: the same frame sequence always yields the same
//! event sequence.

use std::collections::VecDeque;

use vl_domain::config::VadConfig;

use crate::FRAME_MS;

/// Silence frames kept for the rolling floor (2 s at 50 fps).
const SILENCE_WINDOW: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    UtteranceBegin {
        t_ms: u64,
    },
    /// Telemetry only; may be dropped under back-pressure.
    SpeechFrame {
        t_ms: u64,
        energy: f32,
    },
    UtteranceEnd {
        t_ms: u64,
        duration_ms: u64,
    },
}

pub struct VoiceActivityDetector {
    threshold_ratio: f32,
    k_on: u32,
    k_off: u32,
    calibration_frames: u32,
    min_utterance_ms: u64,

    frames_seen: u32,
    calibration: Vec<f32>,
    silence_energies: VecDeque<f32>,
    noise_floor: f32,

    speaking: bool,
    speech_run: u32,
    silence_run: u32,
    utterance_start_ms: u64,
    last_speech_end_ms: u64,
}

impl VoiceActivityDetector {
    /// `k_off` is passed resolved so per-tenant hangover overrides apply.
    pub fn new(cfg: &VadConfig, k_off: u32) -> Self {
        Self {
            threshold_ratio: cfg.threshold_ratio,
            k_on: cfg.k_on.max(1),
            k_off: k_off.max(1),
            calibration_frames: cfg.calibration_frames,
            min_utterance_ms: cfg.min_utterance_ms,
            frames_seen: 0,
            calibration: Vec::with_capacity(cfg.calibration_frames as usize),
            silence_energies: VecDeque::with_capacity(SILENCE_WINDOW),
            noise_floor: 0.0,
            speaking: false,
            speech_run: 0,
            silence_run: 0,
            utterance_start_ms: 0,
            last_speech_end_ms: 0,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    /// Feed one 20 ms frame's RMS energy; returns the events it produced.
    pub fn push_frame(&mut self, t_ms: u64, energy: f32) -> Vec<VadEvent> {
        self.frames_seen += 1;

        // ── Calibration window ────────────────────────────────────
        if self.frames_seen <= self.calibration_frames {
            self.calibration.push(energy);
            if self.frames_seen == self.calibration_frames {
                self.finish_calibration();
            }
            return Vec::new();
        }

        let threshold = self.noise_floor.max(1.0) * self.threshold_ratio;
        let is_speech = energy > threshold;
        let mut events = Vec::new();

        if is_speech {
            self.silence_run = 0;
            self.speech_run += 1;
            self.last_speech_end_ms = t_ms + FRAME_MS;

            if self.speaking {
                events.push(VadEvent::SpeechFrame { t_ms, energy });
            } else if self.speech_run >= self.k_on {
                self.speaking = true;
                // The utterance started at the first frame of the run.
                self.utterance_start_ms =
                    t_ms.saturating_sub((self.k_on as u64 - 1) * FRAME_MS);
                events.push(VadEvent::UtteranceBegin {
                    t_ms: self.utterance_start_ms,
                });
                events.push(VadEvent::SpeechFrame { t_ms, energy });
            }
        } else {
            self.speech_run = 0;
            self.track_silence(energy);

            if self.speaking {
                self.silence_run += 1;
                if self.silence_run >= self.k_off {
                    self.speaking = false;
                    self.silence_run = 0;
                    let duration_ms = self
                        .last_speech_end_ms
                        .saturating_sub(self.utterance_start_ms);
                    if duration_ms >= self.min_utterance_ms {
                        events.push(VadEvent::UtteranceEnd {
                            t_ms: self.last_speech_end_ms,
                            duration_ms,
                        });
                    }
                    // Shorter spans are dropped as noise.
                }
            }
        }

        events
    }

    fn finish_calibration(&mut self) {
        let p20 = percentile(&self.calibration, 20.0);
        let p90 = percentile(&self.calibration, 90.0);
        // A wide spread means the caller was already talking while we
        // calibrated; clamp the floor down to the 10th percentile.
        self.noise_floor = if p90 > p20.max(1.0) * self.threshold_ratio {
            percentile(&self.calibration, 10.0)
        } else {
            p20
        };
        for &e in &self.calibration {
            if e <= self.noise_floor.max(1.0) * self.threshold_ratio {
                self.silence_energies.push_back(e);
            }
        }
        self.calibration.clear();
    }

    fn track_silence(&mut self, energy: f32) {
        if self.silence_energies.len() == SILENCE_WINDOW {
            self.silence_energies.pop_front();
        }
        self.silence_energies.push_back(energy);
        if self.silence_energies.len() >= 10 {
            let window: Vec<f32> = self.silence_energies.iter().copied().collect();
            self.noise_floor = percentile(&window, 20.0);
        }
    }
}

fn percentile(values: &[f32], p: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f32> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((p / 100.0) * (sorted.len() - 1) as f32).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> VoiceActivityDetector {
        VoiceActivityDetector::new(&VadConfig::default(), 25)
    }

    /// Feed `n` frames of constant energy starting at `t_ms`; returns all
    /// events and the timestamp after the last frame.
    fn feed(
        vad: &mut VoiceActivityDetector,
        t_ms: u64,
        n: u64,
        energy: f32,
    ) -> (Vec<VadEvent>, u64) {
        let mut events = Vec::new();
        for i in 0..n {
            events.extend(vad.push_frame(t_ms + i * 20, energy));
        }
        (events, t_ms + n * 20)
    }

    fn begins(events: &[VadEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                VadEvent::UtteranceBegin { t_ms } => Some(*t_ms),
                _ => None,
            })
            .collect()
    }

    fn ends(events: &[VadEvent]) -> Vec<(u64, u64)> {
        events
            .iter()
            .filter_map(|e| match e {
                VadEvent::UtteranceEnd { t_ms, duration_ms } => Some((*t_ms, *duration_ms)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn calibration_emits_nothing() {
        let mut vad = detector();
        let (events, _) = feed(&mut vad, 0, 50, 40.0);
        assert!(events.is_empty());
        assert!(vad.noise_floor() > 0.0);
    }

    #[test]
    fn utterance_begin_after_k_on_frames() {
        let mut vad = detector();
        let (_, t) = feed(&mut vad, 0, 50, 40.0); // calibrate at floor ~40

        // Two loud frames: not enough to trigger.
        let (events, t) = feed(&mut vad, t, 2, 4000.0);
        assert!(begins(&events).is_empty());

        // Third consecutive loud frame enters speaking, backdated to the
        // first frame of the run.
        let events = vad.push_frame(t, 4000.0);
        assert_eq!(begins(&events), vec![t - 40]);
        assert!(vad.is_speaking());
    }

    #[test]
    fn utterance_end_after_k_off_silence() {
        let mut vad = detector();
        let (_, t) = feed(&mut vad, 0, 50, 40.0);
        let (_, t) = feed(&mut vad, t, 20, 4000.0); // 400 ms of speech
        let (events, _) = feed(&mut vad, t, 25, 40.0); // 500 ms silence
        let ends = ends(&events);
        assert_eq!(ends.len(), 1);
        let (end_t, duration) = ends[0];
        assert_eq!(end_t, t); // speech ended where silence began
        assert_eq!(duration, 400); // begin is backdated to the first frame of the run
    }

    #[test]
    fn sub_100ms_blip_is_dropped() {
        let mut vad = detector();
        let (_, t) = feed(&mut vad, 0, 50, 40.0);
        // 3 loud frames (60 ms) then silence: begin fires, end does not.
        let (events, t) = feed(&mut vad, t, 3, 4000.0);
        assert_eq!(begins(&events).len(), 1);
        let (events, _) = feed(&mut vad, t, 30, 40.0);
        assert!(ends(&events).is_empty());
        assert!(!vad.is_speaking());
    }

    #[test]
    fn same_input_yields_identical_events() {
        let energies: Vec<f32> = (0..200)
            .map(|i| if (60..120).contains(&i) { 5000.0 } else { 35.0 })
            .collect();

        let run = |energies: &[f32]| {
            let mut vad = detector();
            let mut all = Vec::new();
            for (i, &e) in energies.iter().enumerate() {
                all.extend(vad.push_frame(i as u64 * 20, e));
            }
            all
        };

        assert_eq!(run(&energies), run(&energies));
    }

    #[test]
    fn speech_during_calibration_clamps_floor_down() {
        let mut quiet = detector();
        feed(&mut quiet, 0, 50, 40.0);

        let mut noisy = detector();
        // Caller talks through most of the calibration window.
        for i in 0..50u64 {
            let e = if i < 10 { 40.0 } else { 5000.0 };
            noisy.push_frame(i * 20, e);
        }
        // The clamped floor must stay near the quiet frames, not the speech.
        assert!(noisy.noise_floor() <= quiet.noise_floor() * 2.0 + 1.0);
        assert!(noisy.noise_floor() < 5000.0);
    }

    #[test]
    fn floor_tracks_rising_background_noise() {
        let mut vad = detector();
        let (_, t) = feed(&mut vad, 0, 50, 30.0);
        let initial = vad.noise_floor();
        feed(&mut vad, t, 100, 60.0);
        assert!(vad.noise_floor() > initial);
    }
}
