use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};

pub const HISTOGRAM_SIZE: usize = 10_000;

/// Samples `1..=head` are discarded, the next `body` are recorded.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Window {
    pub head: usize,
    pub body: usize,
}

impl Window {
    pub fn create(spec: &str) -> std::result::Result<Window, String> {
        let (head, body) = spec
            .split_once(':')
            .ok_or_else(|| format!("expected HEAD:BODY, got {:?}", spec))?;
        let head = head
            .parse()
            .map_err(|_| format!("bad histogram head {:?}", head))?;
        let body = body
            .parse()
            .map_err(|_| format!("bad histogram body {:?}", body))?;
        Ok(Window { head, body })
    }
}

pub struct Histogram {
    name: &'static str,
    window: Window,
    slots: Box<[u32]>,
    overflow: u32,
    sample_cnt: usize,
}

impl Histogram {
    pub fn new(name: &'static str, window: Window) -> Histogram {
        Histogram {
            name,
            window,
            slots: vec![0; HISTOGRAM_SIZE].into_boxed_slice(),
            overflow: 0,
            sample_cnt: 0,
        }
    }

    pub fn add_sample(&mut self, val: f64) {
        self.sample_cnt += 1;
        if self.sample_cnt <= self.window.head
            || self.sample_cnt > self.window.head + self.window.body
        {
            return;
        }
        let slot = val as usize;
        if slot < HISTOGRAM_SIZE {
            self.slots[slot] += 1;
        } else {
            self.overflow += 1;
        }
    }

    pub fn sample_cnt(&self) -> usize {
        self.sample_cnt
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let need = self.window.head + self.window.body;
        if self.sample_cnt < need {
            return Err(Error::NotEnoughSamples {
                name: self.name.to_string(),
                have: self.sample_cnt,
                need,
            });
        }
        let ctx = |e| Error::io(self.name, e);
        for count in self.slots.iter() {
            writeln!(out, "{}", count).map_err(ctx)?;
        }
        writeln!(out, "{}", self.overflow).map_err(ctx)?;
        Ok(())
    }

    pub fn dump(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|source| Error::Dump {
            path: path.to_path_buf(),
            source,
        })?;
        let mut out = BufWriter::new(file);
        self.write_to(&mut out)?;
        out.flush().map_err(|e| Error::io(self.name, e))
    }
}

/// Buckets `(new - old) / scale`.
pub struct TimeDiffHistogram {
    hist: Histogram,
    scale: f64,
}

impl TimeDiffHistogram {
    pub fn new(name: &'static str, window: Window, scale: f64) -> TimeDiffHistogram {
        TimeDiffHistogram {
            hist: Histogram::new(name, window),
            scale,
        }
    }

    pub fn add_sample(&mut self, new_time: f64, old_time: f64) -> Result<()> {
        if new_time < old_time {
            return Err(Error::TimeWentBackwards {
                name: self.hist.name.to_string(),
                new: new_time,
                old: old_time,
            });
        }
        self.hist.add_sample((new_time - old_time) / self.scale);
        Ok(())
    }

    pub fn histogram(&self) -> &Histogram {
        &self.hist
    }
}

/// Buckets the gaps between successive timestamps; the first one only sets
/// the reference.
pub struct IntervalHistogram {
    td_hist: TimeDiffHistogram,
    last_time: Option<f64>,
}

impl IntervalHistogram {
    pub fn new(name: &'static str, window: Window, scale: f64) -> IntervalHistogram {
        IntervalHistogram {
            td_hist: TimeDiffHistogram::new(name, window, scale),
            last_time: None,
        }
    }

    pub fn add_sample(&mut self, time: f64) -> Result<()> {
        if let Some(last) = self.last_time {
            self.td_hist.add_sample(time, last)?;
        }
        self.last_time = Some(time);
        Ok(())
    }

    pub fn histogram(&self) -> &Histogram {
        self.td_hist.histogram()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(h: &Histogram) -> Vec<u64> {
        let mut out = Vec::new();
        h.write_to(&mut out).unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| l.parse().unwrap())
            .collect()
    }

    #[test]
    fn parses_window() {
        assert_eq!(Window::create("10:200").unwrap(), Window { head: 10, body: 200 });
        assert!(Window::create("10").is_err());
        assert!(Window::create("a:1").is_err());
    }

    #[test]
    fn head_and_body_window() {
        let window = Window { head: 3, body: 5 };
        let mut h = Histogram::new("test", window);
        for i in 0..7 {
            h.add_sample(i as f64);
        }
        assert!(matches!(
            h.write_to(&mut Vec::new()),
            Err(Error::NotEnoughSamples { have: 7, need: 8, .. })
        ));

        h.add_sample(HISTOGRAM_SIZE as f64 + 5.0);
        // Past the body: ignored.
        h.add_sample(1.0);

        let counts = lines(&h);
        assert_eq!(counts.len(), HISTOGRAM_SIZE + 1);
        assert_eq!(counts.iter().sum::<u64>(), window.body as u64);
        assert_eq!(counts[0..3], [0, 0, 0]);
        assert_eq!(counts[3..7], [1, 1, 1, 1]);
        assert_eq!(counts[HISTOGRAM_SIZE], 1);
    }

    #[test]
    fn dumps_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Histogram::new("test", Window { head: 0, body: 2 });
        h.add_sample(1.5);
        h.add_sample(1.2);
        let path = dir.path().join("x.latency");
        h.dump(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), HISTOGRAM_SIZE + 1);
        assert_eq!(text.lines().nth(1), Some("2"));

        let missing = dir.path().join("no/such/dir/x.latency");
        assert!(matches!(h.dump(&missing), Err(Error::Dump { .. })));

        let short = Histogram::new("short", Window { head: 1, body: 2 });
        assert!(matches!(
            short.dump(&dir.path().join("short.latency")),
            Err(Error::NotEnoughSamples { have: 0, need: 3, .. })
        ));
    }

    #[test]
    fn time_diff_scales_and_rejects_backwards() {
        let mut h = TimeDiffHistogram::new("lat", Window { head: 0, body: 1 }, 1.0e3);
        assert!(matches!(
            h.add_sample(1.0, 2.0),
            Err(Error::TimeWentBackwards { .. })
        ));
        h.add_sample(5_500.0, 0.0).unwrap();
        assert_eq!(lines(h.histogram())[5], 1);
    }

    #[test]
    fn interval_drops_first_sample() {
        let mut h = IntervalHistogram::new("iv", Window { head: 0, body: 10 }, 1.0e4);
        h.add_sample(100_000.0).unwrap();
        assert_eq!(h.histogram().sample_cnt(), 0);
        h.add_sample(130_000.0).unwrap();
        h.add_sample(150_000.0).unwrap();
        assert_eq!(h.histogram().sample_cnt(), 2);
        let counts = lines(h.histogram());
        assert_eq!(counts[3], 1);
        assert_eq!(counts[2], 1);
    }
}
