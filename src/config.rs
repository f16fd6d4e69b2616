use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Arg, ArgAction, ArgMatches};
use serde::Serialize;

use crate::distribution::TrafficShape;
use crate::error::{Error, Result};
use crate::histogram::Window;
use crate::memcached::Command;

const DEFAULT_DB: &str = "-";
const DEFAULT_DB_SIZE: usize = 5000;
const DEFAULT_VCLIENTS: usize = 1;
const DEFAULT_LOAD: f64 = 100_000.0;
const DEFAULT_QOS_MS: f64 = 1.0;
const DEFAULT_UDP_TIMEOUT_MS: f64 = 10_000.0;
const DEFAULT_ROUND_INTERVAL_SECS: u64 = 5;
const PER_CONNECTION_WORK_INTERVAL_SECS: u64 = 2;
const DEFAULT_HISTOGRAM_DIR: &str = "histograms";
const DEFAULT_TRAFFIC_SHAPE: &str = "uniform:0.1";
const DEFAULT_RECEIVE_BURST: usize = 10;
const DEFAULT_CONNECT_SPEED: f64 = 50.0;
const DEFAULT_CONNECTION_INIT_LOAD: f64 = 10.0;
const DEFAULT_CONNECTION_RAMP_UP_SPEED: f64 = 100.0;
const DEFAULT_MTU: usize = 1500;
/// Smallest MTU that leaves room for a UDP segment header.
const MIN_MTU: usize = 109;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl FromStr for ServerAddr {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected HOST:PORT, got {:?}", s))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("empty host in {:?}", s));
        }
        let port = port
            .parse()
            .map_err(|_| format!("bad port in {:?}", s))?;
        Ok(ServerAddr {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One logical server: one shard, or one mirror. Connections to it are
/// spread round-robin over its addresses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerRecord {
    pub addrs: Vec<ServerAddr>,
}

impl FromStr for ServerRecord {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let addrs = s
            .split(',')
            .map(ServerAddr::from_str)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ServerRecord { addrs })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkRound {
    pub discrete: bool,
    pub accumulate: bool,
    /// 0 runs forever.
    pub iter_cnt: u64,
    /// Seconds between reports.
    pub interval: u64,
}

impl Default for WorkRound {
    fn default() -> Self {
        WorkRound {
            discrete: true,
            accumulate: false,
            iter_cnt: 0,
            interval: DEFAULT_ROUND_INTERVAL_SECS,
        }
    }
}

impl FromStr for WorkRound {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut tokens: Vec<&str> = s.split(':').collect();
        let (discrete, accumulate) = match tokens.first() {
            Some(&"acc") => (false, true),
            Some(&"all") => (true, true),
            _ => (true, false),
        };
        if accumulate {
            tokens.remove(0);
        }
        if tokens.len() != 2 {
            return Err(format!("expected [acc:|all:]ITERS:INTERVAL, got {:?}", s));
        }
        let iter_cnt = tokens[0]
            .parse()
            .map_err(|_| format!("bad iteration count {:?}", tokens[0]))?;
        let interval: u64 = tokens[1]
            .parse()
            .map_err(|_| format!("bad interval {:?}", tokens[1]))?;
        if interval == 0 {
            return Err("round interval must be positive".to_string());
        }
        Ok(WorkRound {
            discrete,
            accumulate,
            iter_cnt,
            interval,
        })
    }
}

fn parse_command(s: &str) -> std::result::Result<Command, String> {
    match s {
        "get" => Ok(Command::Get),
        "set" => Ok(Command::Set),
        _ => Err(format!("unknown command: {}", s)),
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AppConfig {
    pub db: String,
    pub db_size: usize,
    pub servers: Vec<ServerRecord>,
    pub mirror: bool,
    /// Per server when sharded, in total when mirrored.
    pub vclients: usize,
    pub load: f64,
    /// ms
    pub qos: f64,
    /// ms
    pub udp_timeout: f64,
    pub rounds: Vec<WorkRound>,
    pub udp: bool,
    pub nagles: bool,
    pub command: Command,
    pub enumerate: bool,
    pub set_miss: bool,
    pub preload: bool,
    pub base_port: u16,
    pub set_ratio: f64,
    pub per_connection_work: u64,
    pub histogram: Window,
    pub histogram_dir: PathBuf,
    pub traffic_shape: TrafficShape,
    pub busy_loop_receive: bool,
    pub receive_burst: usize,
    /// New connections per second, all workers together.
    pub connect_speed: f64,
    pub connection_init_load: f64,
    /// Per-connection rate increment per second.
    pub connection_ramp_up_speed: f64,
    pub mtu: usize,
}

pub fn command() -> clap::Command {
    clap::Command::new("memloader")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Precision load generator for memcached over TCP and UDP")
        .arg(
            Arg::new("db")
                .long("db")
                .value_name("FILE")
                .default_value(DEFAULT_DB)
                .help("Sample file of `key_size value_size weight` lines, - for stdin"),
        )
        .arg(
            Arg::new("db-size")
                .long("db-size")
                .value_parser(clap::value_parser!(usize))
                .help("Total number of keys"),
        )
        .arg(
            Arg::new("server")
                .long("server")
                .value_name("HOST:PORT[,HOST:PORT...]")
                .action(ArgAction::Append)
                .required(true)
                .value_parser(ServerRecord::from_str)
                .help("One server (shard or mirror); repeat for more"),
        )
        .arg(
            Arg::new("mirror")
                .long("mirror")
                .action(ArgAction::SetTrue)
                .help("Every server holds the whole db"),
        )
        .arg(
            Arg::new("vclients")
                .long("vclients")
                .value_parser(clap::value_parser!(usize))
                .help("Virtual clients (per server when sharded)"),
        )
        .arg(
            Arg::new("load")
                .long("load")
                .value_parser(clap::value_parser!(f64))
                .help("Total target requests per second"),
        )
        .arg(
            Arg::new("qos")
                .long("qos")
                .value_name("MS")
                .value_parser(clap::value_parser!(f64))
                .help("Latency threshold for the qos column"),
        )
        .arg(
            Arg::new("udp-timeout")
                .long("udp-timeout")
                .value_name("MS")
                .value_parser(clap::value_parser!(f64))
                .help("Age after which a UDP transaction is dropped"),
        )
        .arg(
            Arg::new("round")
                .long("round")
                .value_name("[acc:|all:]ITERS:INTERVAL")
                .action(ArgAction::Append)
                .value_parser(WorkRound::from_str)
                .help("Reporting round; ITERS 0 runs forever"),
        )
        .arg(
            Arg::new("udp")
                .long("udp")
                .action(ArgAction::SetTrue)
                .help("Use UDP instead of TCP"),
        )
        .arg(
            Arg::new("nagles")
                .long("nagles")
                .action(ArgAction::SetTrue)
                .help("Keep Nagle's algorithm on"),
        )
        .arg(
            Arg::new("command")
                .long("command")
                .value_name("get|set")
                .value_parser(parse_command)
                .help("Default request command"),
        )
        .arg(
            Arg::new("enum")
                .long("enum")
                .action(ArgAction::SetTrue)
                .help("Walk the keys in order instead of sampling"),
        )
        .arg(
            Arg::new("set-miss")
                .long("set-miss")
                .action(ArgAction::SetTrue)
                .help("Replay missed GETs as SETs"),
        )
        .arg(
            Arg::new("preload")
                .long("preload")
                .action(ArgAction::SetTrue)
                .help("SET every key once over TCP, then exit"),
        )
        .arg(
            Arg::new("base-port")
                .long("base-port")
                .value_parser(clap::value_parser!(u16))
                .help("Bind connection i to client port BASE+i"),
        )
        .arg(
            Arg::new("set-ratio")
                .long("set-ratio")
                .value_parser(clap::value_parser!(f64))
                .help("Probability of turning a request into a SET"),
        )
        .arg(
            Arg::new("per-connection-work")
                .long("per-connection-work")
                .value_parser(clap::value_parser!(u64))
                .help("Stop once every connection got this many replies"),
        )
        .arg(
            Arg::new("histogram")
                .long("histogram")
                .value_name("HEAD:BODY")
                .value_parser(Window::create)
                .help("Skip HEAD samples, then record BODY samples"),
        )
        .arg(
            Arg::new("histogram-dir")
                .long("histogram-dir")
                .value_name("DIR")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(DEFAULT_HISTOGRAM_DIR),
        )
        .arg(
            Arg::new("send-traffic-shape")
                .long("send-traffic-shape")
                .value_name("SHAPE:PARAM")
                .default_value(DEFAULT_TRAFFIC_SHAPE)
                .value_parser(TrafficShape::create)
                .help("uniform, normal, peaks, gamma or exponential"),
        )
        .arg(
            Arg::new("busy-loop-receive")
                .long("busy-loop-receive")
                .action(ArgAction::SetTrue)
                .help("Poll receive sockets without blocking"),
        )
        .arg(
            Arg::new("receive-burst")
                .long("receive-burst")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("connect-speed")
                .long("connect-speed")
                .value_parser(clap::value_parser!(f64))
                .help("New connections per second"),
        )
        .arg(
            Arg::new("connection-init-load")
                .long("connection-init-load")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("connection-ramp-up-speed")
                .long("connection-ramp-up-speed")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("mtu")
                .long("mtu")
                .value_parser(clap::value_parser!(usize)),
        )
}

impl AppConfig {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let flag = |name: &str| matches.get_flag(name);

        let mut config = AppConfig {
            db: matches
                .get_one::<String>("db")
                .cloned()
                .unwrap_or_else(|| DEFAULT_DB.to_string()),
            db_size: matches
                .get_one::<usize>("db-size")
                .copied()
                .unwrap_or(DEFAULT_DB_SIZE),
            servers: matches
                .get_many::<ServerRecord>("server")
                .unwrap_or_default()
                .cloned()
                .collect(),
            mirror: flag("mirror"),
            vclients: matches
                .get_one::<usize>("vclients")
                .copied()
                .unwrap_or(DEFAULT_VCLIENTS),
            load: matches.get_one::<f64>("load").copied().unwrap_or(DEFAULT_LOAD),
            qos: matches.get_one::<f64>("qos").copied().unwrap_or(DEFAULT_QOS_MS),
            udp_timeout: matches
                .get_one::<f64>("udp-timeout")
                .copied()
                .unwrap_or(DEFAULT_UDP_TIMEOUT_MS),
            rounds: matches
                .get_many::<WorkRound>("round")
                .unwrap_or_default()
                .copied()
                .collect(),
            udp: flag("udp"),
            nagles: flag("nagles"),
            command: matches
                .get_one::<Command>("command")
                .copied()
                .unwrap_or(Command::Get),
            enumerate: flag("enum"),
            set_miss: flag("set-miss"),
            preload: flag("preload"),
            base_port: matches.get_one::<u16>("base-port").copied().unwrap_or(0),
            set_ratio: matches.get_one::<f64>("set-ratio").copied().unwrap_or(0.0),
            per_connection_work: matches
                .get_one::<u64>("per-connection-work")
                .copied()
                .unwrap_or(0),
            histogram: matches
                .get_one::<Window>("histogram")
                .copied()
                .unwrap_or_default(),
            histogram_dir: matches
                .get_one::<PathBuf>("histogram-dir")
                .cloned()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HISTOGRAM_DIR)),
            traffic_shape: matches
                .get_one::<TrafficShape>("send-traffic-shape")
                .copied()
                .unwrap_or_default(),
            busy_loop_receive: flag("busy-loop-receive"),
            receive_burst: matches
                .get_one::<usize>("receive-burst")
                .copied()
                .unwrap_or(DEFAULT_RECEIVE_BURST),
            connect_speed: matches
                .get_one::<f64>("connect-speed")
                .copied()
                .unwrap_or(DEFAULT_CONNECT_SPEED),
            connection_init_load: matches
                .get_one::<f64>("connection-init-load")
                .copied()
                .unwrap_or(DEFAULT_CONNECTION_INIT_LOAD),
            connection_ramp_up_speed: matches
                .get_one::<f64>("connection-ramp-up-speed")
                .copied()
                .unwrap_or(DEFAULT_CONNECTION_RAMP_UP_SPEED),
            mtu: matches.get_one::<usize>("mtu").copied().unwrap_or(DEFAULT_MTU),
        };

        config.apply_modes();
        config.validate()?;
        Ok(config)
    }

    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = command()
            .try_get_matches_from(args)
            .map_err(|e| Error::config(e.to_string()))?;
        AppConfig::from_matches(&matches)
    }

    fn apply_modes(&mut self) {
        if self.preload {
            self.udp = false;
            self.command = Command::Set;
            self.enumerate = true;
            self.vclients = if self.mirror { self.servers.len() } else { 1 };
            self.rounds.clear();
            self.per_connection_work = 0;
            self.connection_init_load = self.avg_load();
        }

        if self.per_connection_work > 0 {
            self.rounds = vec![WorkRound {
                discrete: true,
                accumulate: true,
                iter_cnt: 0,
                interval: PER_CONNECTION_WORK_INTERVAL_SECS,
            }];
        }

        if self.rounds.is_empty() {
            self.rounds.push(WorkRound::default());
        }
    }

    fn validate(&self) -> Result<()> {
        let servers = self.servers.len();
        if servers == 0 {
            return Err(Error::config("at least one --server is required"));
        }
        if self.vclients == 0 {
            return Err(Error::config("vclients must be positive"));
        }
        if self.mirror {
            if self.vclients % servers != 0 {
                return Err(Error::config("can't divide clients evenly to mirror-servers"));
            }
        } else if self.db_size % servers != 0 {
            return Err(Error::config("can't divide db evenly to shard-servers"));
        }
        if !(self.load > 0.0) {
            return Err(Error::config(format!("load must be positive: {}", self.load)));
        }
        if !(self.connection_init_load > 0.0) {
            return Err(Error::config("connection init load must be positive"));
        }
        if self.avg_load() < self.connection_init_load {
            return Err(Error::config(format!(
                "per-connection load {} below connection init load {}",
                self.avg_load(),
                self.connection_init_load
            )));
        }
        if self.avg_load() > self.connection_init_load && !(self.connection_ramp_up_speed > 0.0) {
            return Err(Error::config("connection ramp-up speed must be positive"));
        }
        if !(self.connect_speed > 0.0) {
            return Err(Error::config("connect speed must be positive"));
        }
        if !(0.0..=1.0).contains(&self.set_ratio) {
            return Err(Error::config(format!("set ratio outside [0, 1]: {}", self.set_ratio)));
        }
        if !(self.udp_timeout > 0.0) {
            return Err(Error::config("udp timeout must be positive"));
        }
        if self.receive_burst < 1 {
            return Err(Error::config("receive burst must be at least 1"));
        }
        if self.mtu < MIN_MTU {
            return Err(Error::config(format!(
                "mtu {} too small, need at least {}",
                self.mtu, MIN_MTU
            )));
        }
        Ok(())
    }

    pub fn conn_cnt(&self) -> usize {
        if self.mirror {
            self.vclients
        } else {
            self.vclients * self.servers.len()
        }
    }

    pub fn avg_load(&self) -> f64 {
        self.load / self.conn_cnt() as f64
    }

    /// Keys held by each server.
    pub fn shard_size(&self) -> usize {
        if self.mirror {
            self.db_size
        } else {
            self.db_size / self.servers.len()
        }
    }
}
