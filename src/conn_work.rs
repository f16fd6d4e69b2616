//! One virtual connection's request stream and statistics.
//!
//! A `ConnWork` is shared by the connection's send thread, its receive
//! thread and the reporting thread. Counters and histograms sit behind one
//! lock, the miss-replay queue behind another so the rare miss path never
//! contends with the send path.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use rand::Rng;

use crate::config::{AppConfig, ServerAddr};
use crate::error::{Error, Result};
use crate::histogram::{IntervalHistogram, TimeDiffHistogram, Window};
use crate::memcached::{Command, Outcome, Request, Response};
use crate::memdb::MemDb;
use crate::stats::Counters;

const LATENCY_SCALE: f64 = 1.0e3;
const INTERVAL_SCALE: f64 = 1.0e4;

/// Per-connection knobs taken from the application configuration.
#[derive(Copy, Clone, Debug)]
pub struct WorkSettings {
    pub default_cmd: Command,
    pub set_ratio: f64,
    pub enumerate: bool,
    pub set_miss: bool,
    /// ms
    pub qos: f64,
    pub histogram: Window,
}

impl From<&AppConfig> for WorkSettings {
    fn from(c: &AppConfig) -> Self {
        WorkSettings {
            default_cmd: c.command,
            set_ratio: c.set_ratio,
            enumerate: c.enumerate,
            set_miss: c.set_miss,
            qos: c.qos,
            histogram: c.histogram,
        }
    }
}

impl WorkSettings {
    /// Whether any request of the run can be a SET.
    pub fn sends_sets(&self) -> bool {
        self.default_cmd == Command::Set || self.set_ratio > 0.0 || self.set_miss
    }
}

struct Core {
    counters: Counters,
    hist_latency: TimeDiffHistogram,
    hist_request_interval: IntervalHistogram,
    hist_response_interval: IntervalHistogram,
}

pub struct ConnWork {
    pub id: usize,
    pub db: Arc<MemDb>,
    pub saddr: ServerAddr,
    pub init_send_rate: f64,
    pub send_rate: f64,
    /// Rate increment per second.
    pub ramp_up_speed: f64,
    settings: WorkSettings,
    core: Mutex<Core>,
    published: Mutex<Counters>,
    missed_key_seeds: Mutex<VecDeque<u32>>,
    db_idx: AtomicUsize,
    client: OnceLock<SocketAddr>,
}

impl ConnWork {
    pub fn new(
        id: usize,
        db: Arc<MemDb>,
        saddr: ServerAddr,
        init_send_rate: f64,
        send_rate: f64,
        ramp_up_speed: f64,
        settings: WorkSettings,
    ) -> ConnWork {
        let window = settings.histogram;
        ConnWork {
            id,
            db,
            saddr,
            init_send_rate,
            send_rate,
            ramp_up_speed,
            settings,
            core: Mutex::new(Core {
                counters: Counters::default(),
                hist_latency: TimeDiffHistogram::new("hist_latency", window, LATENCY_SCALE),
                hist_request_interval: IntervalHistogram::new(
                    "hist_request_interval",
                    window,
                    INTERVAL_SCALE,
                ),
                hist_response_interval: IntervalHistogram::new(
                    "hist_response_interval",
                    window,
                    INTERVAL_SCALE,
                ),
            }),
            published: Mutex::new(Counters::default()),
            missed_key_seeds: Mutex::new(VecDeque::new()),
            db_idx: AtomicUsize::new(0),
            client: OnceLock::new(),
        }
    }

    pub fn make_request<R: Rng>(&self, rng: &mut R) -> Result<Request> {
        let mut r = Request::default();

        let mut entry_index = None;
        if self.settings.set_miss {
            if let Some(key_seed) = self.missed_key_seeds.lock().unwrap().pop_front() {
                r.cmd = Command::Set;
                entry_index = Some(self.db.key_seed_to_entry(key_seed)?);
            }
        }

        let entry_index = match entry_index {
            Some(index) => index,
            None => {
                r.cmd = self.settings.default_cmd;
                if self.settings.set_ratio != 0.0 && rng.gen::<f64>() < self.settings.set_ratio {
                    r.cmd = Command::Set;
                }
                if self.settings.enumerate {
                    // Only the send thread advances the cursor.
                    let index = self.db_idx.load(Ordering::Relaxed);
                    self.db_idx
                        .store((index + 1) % self.db.db_size(), Ordering::Relaxed);
                    index
                } else {
                    self.db.pick_entry(rng)
                }
            }
        };

        self.db.fill_request(&mut r, entry_index);
        Ok(r)
    }

    /// Requires `target_start <= start <= finish`.
    pub fn count_send_timing(&self, target_start: f64, start: f64, finish: f64) -> Result<()> {
        if start < target_start {
            return Err(Error::TimeWentBackwards {
                name: "send delay".to_string(),
                new: start,
                old: target_start,
            });
        }
        if finish < start {
            return Err(Error::TimeWentBackwards {
                name: "send duration".to_string(),
                new: finish,
                old: start,
            });
        }
        let mut core = self.core.lock().unwrap();
        core.counters.send_delay_sum += (start - target_start) / 1.0e3;
        core.counters.send_duration_sum += (finish - start) / 1.0e3;
        Ok(())
    }

    pub fn count_sent(&self, r: &Request) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        match r.cmd {
            Command::Set => core.counters.sent_set += 1,
            Command::Get => core.counters.sent_get += 1,
        }
        core.hist_request_interval.add_sample(r.send_time)
    }

    pub fn count_replied(&self, r: &Request, resp: &Response) -> Result<()> {
        {
            let mut core = self.core.lock().unwrap();
            match resp.outcome {
                Outcome::SetOk => core.counters.replied_set += 1,
                Outcome::GetFound => {
                    core.counters.replied_get += 1;
                    core.counters.hit_get += 1;
                }
                Outcome::GetNotFound => core.counters.replied_get += 1,
            }

            core.hist_response_interval.add_sample(resp.recv_time)?;
            core.hist_latency.add_sample(resp.recv_time, r.send_time)?;

            let latency = (resp.recv_time - r.send_time) / 1.0e6;
            if latency <= 0.0 {
                return Err(Error::NonPositiveLatency(latency));
            }

            let c = &mut core.counters;
            c.latency_sum += latency;
            if latency <= self.settings.qos {
                c.good_qos += 1;
            }
            if latency > c.max_latency {
                c.max_latency = latency;
            }
            if latency < c.min_latency {
                c.min_latency = latency;
            }
        }

        if resp.outcome == Outcome::GetNotFound && self.settings.set_miss {
            self.missed_key_seeds.lock().unwrap().push_back(r.key_seed);
        }
        Ok(())
    }

    pub fn count_udp_timeout(&self) {
        self.core.lock().unwrap().counters.udp_timeout += 1;
    }

    /// Publishes the live counters and opens a new max/min latency window.
    pub fn update_counters(&self) -> Counters {
        let snapshot = {
            let mut core = self.core.lock().unwrap();
            let snapshot = core.counters;
            core.counters.reset_latency_window();
            snapshot
        };
        *self.published.lock().unwrap() = snapshot;
        snapshot
    }

    /// Counters as of the last `update_counters`.
    pub fn counters(&self) -> Counters {
        *self.published.lock().unwrap()
    }

    pub fn set_client_addr(&self, addr: SocketAddr) {
        let _ = self.client.set(addr);
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client
            .get()
            .copied()
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    pub fn histogram_prefix(&self, directory: &Path) -> PathBuf {
        let client = self.client_addr();
        directory.join(format!(
            "sip-{}-sport-{}-cip-{}-cport-{}",
            self.saddr.host,
            self.saddr.port,
            client.ip(),
            client.port()
        ))
    }

    pub fn dump_histograms(&self, directory: &Path) -> Result<()> {
        let prefix = self.histogram_prefix(directory);
        let with_ext = |ext: &str| {
            let mut name = prefix.clone().into_os_string();
            name.push(ext);
            PathBuf::from(name)
        };
        let core = self.core.lock().unwrap();
        core.hist_latency.histogram().dump(&with_ext(".latency"))?;
        core.hist_request_interval
            .histogram()
            .dump(&with_ext(".request_interval"))?;
        core.hist_response_interval
            .histogram()
            .dump(&with_ext(".response_interval"))
    }
}
