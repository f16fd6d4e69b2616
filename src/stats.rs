//! Per-connection counters and the process-wide aggregation over them.

use std::ops::{Add, Sub};

use itertools::{Itertools, MinMaxResult};

/// Counters of one connection. Sums are cumulative for the process
/// lifetime; `max_latency` and `min_latency` cover the window since the
/// last snapshot.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Counters {
    pub sent_set: u64,
    pub sent_get: u64,
    pub replied_set: u64,
    pub replied_get: u64,
    pub hit_get: u64,
    pub good_qos: u64,
    /// ms
    pub latency_sum: f64,
    pub max_latency: f64,
    pub min_latency: f64,
    /// us
    pub send_delay_sum: f64,
    pub send_duration_sum: f64,
    pub udp_timeout: u64,
}

impl Default for Counters {
    fn default() -> Self {
        Counters {
            sent_set: 0,
            sent_get: 0,
            replied_set: 0,
            replied_get: 0,
            hit_get: 0,
            good_qos: 0,
            latency_sum: 0.0,
            max_latency: 0.0,
            min_latency: f64::INFINITY,
            send_delay_sum: 0.0,
            send_duration_sum: 0.0,
            udp_timeout: 0,
        }
    }
}

impl Counters {
    pub fn reset_latency_window(&mut self) {
        self.max_latency = 0.0;
        self.min_latency = f64::INFINITY;
    }

    pub fn sent(&self) -> u64 {
        self.sent_set + self.sent_get
    }

    pub fn replied(&self) -> u64 {
        self.replied_set + self.replied_get
    }

    pub fn retired(&self) -> u64 {
        self.replied() + self.udp_timeout
    }

    pub fn outstanding(&self) -> i64 {
        self.sent() as i64 - self.retired() as i64
    }
}

/// Sum of the cumulative fields of many snapshots, or the difference of two
/// such sums.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Totals {
    pub sent_set: i64,
    pub sent_get: i64,
    pub replied_set: i64,
    pub replied_get: i64,
    pub hit_get: i64,
    pub good_qos: i64,
    pub latency_sum: f64,
    pub send_delay_sum: f64,
    pub send_duration_sum: f64,
    pub udp_timeout: i64,
}

impl Totals {
    pub fn sum<'a, I>(snapshots: I) -> Totals
    where
        I: IntoIterator<Item = &'a Counters>,
    {
        snapshots
            .into_iter()
            .fold(Totals::default(), |acc, c| acc + Totals::from(c))
    }

    pub fn sent(&self) -> i64 {
        self.sent_set + self.sent_get
    }

    pub fn replied(&self) -> i64 {
        self.replied_set + self.replied_get
    }

    pub fn retired(&self) -> i64 {
        self.replied() + self.udp_timeout
    }

    pub fn outstanding(&self) -> i64 {
        self.sent() - self.retired()
    }
}

impl From<&Counters> for Totals {
    fn from(c: &Counters) -> Self {
        Totals {
            sent_set: c.sent_set as i64,
            sent_get: c.sent_get as i64,
            replied_set: c.replied_set as i64,
            replied_get: c.replied_get as i64,
            hit_get: c.hit_get as i64,
            good_qos: c.good_qos as i64,
            latency_sum: c.latency_sum,
            send_delay_sum: c.send_delay_sum,
            send_duration_sum: c.send_duration_sum,
            udp_timeout: c.udp_timeout as i64,
        }
    }
}

impl Add for Totals {
    type Output = Totals;

    fn add(self, o: Totals) -> Totals {
        Totals {
            sent_set: self.sent_set + o.sent_set,
            sent_get: self.sent_get + o.sent_get,
            replied_set: self.replied_set + o.replied_set,
            replied_get: self.replied_get + o.replied_get,
            hit_get: self.hit_get + o.hit_get,
            good_qos: self.good_qos + o.good_qos,
            latency_sum: self.latency_sum + o.latency_sum,
            send_delay_sum: self.send_delay_sum + o.send_delay_sum,
            send_duration_sum: self.send_duration_sum + o.send_duration_sum,
            udp_timeout: self.udp_timeout + o.udp_timeout,
        }
    }
}

impl Sub for Totals {
    type Output = Totals;

    fn sub(self, o: Totals) -> Totals {
        Totals {
            sent_set: self.sent_set - o.sent_set,
            sent_get: self.sent_get - o.sent_get,
            replied_set: self.replied_set - o.replied_set,
            replied_get: self.replied_get - o.replied_get,
            hit_get: self.hit_get - o.hit_get,
            good_qos: self.good_qos - o.good_qos,
            latency_sum: self.latency_sum - o.latency_sum,
            send_delay_sum: self.send_delay_sum - o.send_delay_sum,
            send_duration_sum: self.send_duration_sum - o.send_duration_sum,
            udp_timeout: self.udp_timeout - o.udp_timeout,
        }
    }
}

/// Outstanding-queue and latency extremes across connections, taken from the
/// latest snapshots.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Spread {
    pub os_sum: i64,
    pub os_max: i64,
    pub os_min: i64,
    pub os_avg: f64,
    pub max_latency: f64,
    pub min_latency: f64,
}

impl Spread {
    pub fn of(snapshots: &[Counters]) -> Spread {
        let os_sum: i64 = snapshots.iter().map(Counters::outstanding).sum();
        let (os_min, os_max) = match snapshots.iter().map(Counters::outstanding).minmax() {
            MinMaxResult::NoElements => (0, 0),
            MinMaxResult::OneElement(v) => (v, v),
            MinMaxResult::MinMax(min, max) => (min, max),
        };
        let max_latency = snapshots.iter().map(|c| c.max_latency).fold(0.0, f64::max);
        let min_latency = snapshots
            .iter()
            .map(|c| c.min_latency)
            .fold(f64::INFINITY, f64::min);
        Spread {
            os_sum,
            os_max,
            os_min,
            os_avg: os_sum as f64 / snapshots.len().max(1) as f64,
            max_latency,
            min_latency,
        }
    }
}
