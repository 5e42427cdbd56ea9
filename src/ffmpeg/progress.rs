//! FFmpeg progress stream parsing
//!
//! With `-progress pipe:1` ffmpeg writes blocks of `key=value` lines to
//! stdout, terminated by a `progress=continue` (or, at end of stream,
//! `progress=end`) line. The parser accumulates keys and flushes one
//! record per `progress=` line.

use regex::Regex;

/// One flushed progress record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FfmpegProgress {
    /// Frames encoded so far
    pub frame: u64,
    /// Current encode rate in frames per second
    pub fps: f64,
    /// Encoder quality value of the first video stream
    pub quality: f64,
    /// Position in the output, in seconds
    pub out_time_secs: f64,
    /// Encode speed as a wall-clock ratio (1.0 = realtime)
    pub speed: f64,
    /// Bytes written to the output so far
    pub total_size: u64,
    /// Current output bitrate in kbit/s
    pub bitrate_kbps: f64,
    /// True for the final `progress=end` record
    pub end: bool,
}

/// Incremental parser over progress lines
pub struct ProgressParser {
    current: FfmpegProgress,
    speed_re: Regex,
    bitrate_re: Regex,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self {
            current: FfmpegProgress::default(),
            speed_re: Regex::new(r"^([0-9.]+)x$").expect("static regex"),
            bitrate_re: Regex::new(r"^([0-9.]+)\s*kbits/s$").expect("static regex"),
        }
    }

    /// Feed one line. Returns a record when the line completes a block.
    pub fn push_line(&mut self, line: &str) -> Option<FfmpegProgress> {
        let line = line.trim();
        let (key, value) = line.split_once('=')?;
        let value = value.trim();

        match key {
            "frame" => {
                if let Ok(v) = value.parse() {
                    self.current.frame = v;
                }
            }
            "fps" => {
                if let Ok(v) = value.parse() {
                    self.current.fps = v;
                }
            }
            // Quality of the first video stream; further streams ignored
            "stream_0_0_q" => {
                if let Ok(v) = value.parse() {
                    self.current.quality = v;
                }
            }
            "out_time_us" | "out_time_ms" => {
                // Both keys carry microseconds
                if let Ok(v) = value.parse::<i64>() {
                    self.current.out_time_secs = (v.max(0) as f64) / 1_000_000.0;
                }
            }
            "out_time" => {
                if let Some(secs) = parse_clock_time(value) {
                    self.current.out_time_secs = secs;
                }
            }
            "speed" => {
                if let Some(caps) = self.speed_re.captures(value) {
                    if let Ok(v) = caps[1].parse() {
                        self.current.speed = v;
                    }
                }
            }
            "total_size" => {
                if let Ok(v) = value.parse() {
                    self.current.total_size = v;
                }
            }
            "bitrate" => {
                if let Some(caps) = self.bitrate_re.captures(value) {
                    if let Ok(v) = caps[1].parse() {
                        self.current.bitrate_kbps = v;
                    }
                }
            }
            "progress" => {
                self.current.end = value == "end";
                return Some(self.current.clone());
            }
            _ => {}
        }
        None
    }
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse an `HH:MM:SS.micros` clock value into seconds
fn parse_clock_time(value: &str) -> Option<f64> {
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
