use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use memloader::affinity::ThreadHosts;
use memloader::clock;
use memloader::config::{self, AppConfig, WorkRound};
use memloader::conn_work::{ConnWork, WorkSettings};
use memloader::control::StartupBarrier;
use memloader::memcached::Command;
use memloader::memdb::{MemDb, Sample};
use memloader::report;
use memloader::stats::{Counters, Spread, Totals};
use memloader::{udp, worker};

const RAMP_UP_POLL: Duration = Duration::from_secs(1);

/// Connection `cid` talks to server `cid % servers`; the addresses of one
/// server record are handed out in turn.
fn build_works(config: &AppConfig, sample: Arc<Sample>) -> anyhow::Result<Vec<Arc<ConnWork>>> {
    let settings = WorkSettings::from(config);
    if config.udp {
        let cmd = if settings.sends_sets() {
            Command::Set
        } else {
            Command::Get
        };
        udp::check_request_fits(config.mtu, sample.max_wire_size(cmd))?;
    }

    let servers = config.servers.len();
    let dbs: Vec<Arc<MemDb>> = if config.mirror {
        let db = Arc::new(MemDb::new(sample, config.db_size, 0)?);
        vec![db; servers]
    } else {
        let shard_size = config.shard_size();
        (0..servers)
            .map(|i| -> anyhow::Result<Arc<MemDb>> {
                let first_key_seed = u32::try_from(shard_size * i)
                    .with_context(|| format!("shard {} starts beyond the key seed space", i))?;
                Ok(Arc::new(MemDb::new(sample.clone(), shard_size, first_key_seed)?))
            })
            .collect::<anyhow::Result<_>>()?
    };

    let avg_load = config.avg_load();
    let mut picks = vec![0usize; servers];
    let works = (0..config.conn_cnt())
        .map(|cid| {
            let sid = cid % servers;
            let addrs = &config.servers[sid].addrs;
            let saddr = addrs[picks[sid] % addrs.len()].clone();
            picks[sid] += 1;
            Arc::new(ConnWork::new(
                cid,
                dbs[sid].clone(),
                saddr,
                config.connection_init_load,
                avg_load,
                config.connection_ramp_up_speed,
                settings,
            ))
        })
        .collect();
    Ok(works)
}

fn exit_on_error(role: &str, lid: usize, result: memloader::error::Result<()>) {
    if let Err(e) = result {
        error!(worker = lid, role, error = %e, "worker failed");
        process::exit(1);
    }
}

/// One send/receive pair per pair of thread hosts, at most one per
/// connection. Connection `cid` belongs to pair `cid % pairs`.
fn spawn_workers(
    config: &Arc<AppConfig>,
    barrier: &Arc<StartupBarrier>,
    works: &[Arc<ConnWork>],
) -> anyhow::Result<()> {
    let hosts = Arc::new(ThreadHosts::discover());
    let lists = works.len().min(hosts.pairs());
    let connect_speed = config.connect_speed / lists as f64;

    for lid in 0..lists {
        let list: Vec<Arc<ConnWork>> = works.iter().skip(lid).step_by(lists).cloned().collect();
        let (sender, receiver) =
            worker::pair(lid, config.clone(), barrier.clone(), list, connect_speed)?;

        let send_hosts = hosts.clone();
        thread::Builder::new()
            .name(format!("send-{}", lid))
            .spawn(move || {
                send_hosts.pin_current(lid * 2);
                exit_on_error("send", lid, sender.run());
            })
            .context("spawn send thread")?;

        let recv_hosts = hosts.clone();
        thread::Builder::new()
            .name(format!("recv-{}", lid))
            .spawn(move || {
                recv_hosts.pin_current(lid * 2 + 1);
                exit_on_error("receive", lid, receiver.run());
            })
            .context("spawn receive thread")?;
    }
    info!(workers = lists, thread_hosts = hosts.len(), "workers spawned");
    Ok(())
}

fn wait_for_ramp_up(barrier: &StartupBarrier) {
    let start = clock::now();
    println!("===ramp up started===");
    while !barrier.all_ramped_up() {
        thread::sleep(RAMP_UP_POLL);
    }
    println!(
        "===ramp up finished (time: {:.6}s)===",
        (clock::now() - start) / 1.0e9
    );
}

struct Snapshot {
    totals: Totals,
    spread: Spread,
    time: f64,
}

impl Snapshot {
    fn take(works: &[Arc<ConnWork>]) -> Snapshot {
        let counters: Vec<Counters> = works.iter().map(|w| w.update_counters()).collect();
        Snapshot {
            totals: Totals::sum(&counters),
            spread: Spread::of(&counters),
            time: clock::now(),
        }
    }
}

fn all_replied(works: &[Arc<ConnWork>], target: impl Fn(&ConnWork) -> u64) -> bool {
    works.iter().all(|w| w.counters().replied() >= target(&**w))
}

fn run_round(config: &AppConfig, round: &WorkRound, works: &[Arc<ConnWork>]) {
    let init = Snapshot::take(works);
    let mut iter = 0;
    while round.iter_cnt == 0 || iter < round.iter_cnt {
        iter += 1;
        let old = Snapshot::take(works);
        thread::sleep(Duration::from_secs(round.interval));
        let new = Snapshot::take(works);

        if round.discrete {
            let line = report::summary(
                &(new.totals - old.totals),
                config.load,
                new.time - old.time,
                &new.spread,
            );
            println!("D: {}", line);
        }
        if round.accumulate {
            let line = report::summary(
                &(new.totals - init.totals),
                config.load,
                new.time - init.time,
                &new.spread,
            );
            println!("A: {}", line);
        }

        if config.preload && all_replied(works, |w| w.db.db_size() as u64) {
            println!("===preload finished, break round===");
            return;
        }
        if config.per_connection_work > 0
            && all_replied(works, |_| config.per_connection_work)
        {
            println!("===per_connection_work finished, break round===");
            return;
        }
    }
}

fn run_rounds(config: &AppConfig, works: &[Arc<ConnWork>]) {
    println!("===work started===");
    for (rid, round) in config.rounds.iter().enumerate() {
        println!(
            "===round {} started[iterations={}, interval={}]===",
            rid, round.iter_cnt, round.interval
        );
        run_round(config, round, works);
        println!("===round {} finished===", rid);
    }
    println!("===work finished===");
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    clock::init();

    let matches = config::command().get_matches();
    let config = Arc::new(AppConfig::from_matches(&matches)?);
    info!(config = %serde_json::to_string(&*config)?, "configuration");
    println!("number of connections: {}", config.conn_cnt());

    let sample = Arc::new(Sample::load(&config.db)?);
    let works = build_works(&config, sample)?;
    let barrier = Arc::new(StartupBarrier::new(works.len()));
    spawn_workers(&config, &barrier, &works)?;

    barrier.start();
    wait_for_ramp_up(&barrier);
    run_rounds(&config, &works);

    if !config.preload && config.histogram.body > 0 {
        std::fs::create_dir_all(&config.histogram_dir)
            .with_context(|| format!("create {}", config.histogram_dir.display()))?;
        for work in &works {
            work.dump_histograms(&config.histogram_dir)?;
        }
        info!(dir = %config.histogram_dir.display(), "histograms dumped");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Arc<Sample> {
        Arc::new(Sample::from_reader("8 100 1\n8 50 1\n".as_bytes(), "test").unwrap())
    }

    fn config(args: &[&str]) -> AppConfig {
        AppConfig::from_args(std::iter::once("memloader").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn shards_split_the_key_space() {
        let c = config(&[
            "--server", "a:1,a:2", "--server", "b:1", "--vclients", "2", "--db-size", "8",
            "--load", "400",
        ]);
        let works = build_works(&c, sample()).unwrap();
        assert_eq!(works.len(), 4);
        let layout: Vec<(String, u32)> = works
            .iter()
            .map(|w| (w.saddr.to_string(), w.db.first_key_seed()))
            .collect();
        assert_eq!(
            layout,
            vec![
                ("a:1".to_string(), 0),
                ("b:1".to_string(), 4),
                ("a:2".to_string(), 0),
                ("b:1".to_string(), 4),
            ]
        );
        assert!(works.iter().all(|w| w.db.db_size() == 4));
        assert!(works.iter().all(|w| w.send_rate == 100.0));
    }

    #[test]
    fn oversized_udp_request_fails_before_any_worker() {
        let big = Arc::new(Sample::from_reader("8 1048576 1\n".as_bytes(), "test").unwrap());
        let args = ["--server", "127.0.0.1:11211", "--udp", "--mtu", "109", "--db-size", "4"];

        let mut with_sets = args.to_vec();
        with_sets.extend(["--set-ratio", "0.5"]);
        let c = config(&with_sets);
        let err = build_works(&c, big.clone()).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<memloader::error::Error>(),
            Some(memloader::error::Error::Config(_))
        ));

        // GETs of the same keys fit in one segment.
        assert!(build_works(&config(&args), big.clone()).is_ok());
        // TCP has no segment limit.
        let tcp = config(&["--server", "127.0.0.1:11211", "--set-ratio", "0.5", "--db-size", "4"]);
        assert!(build_works(&tcp, big).is_ok());
    }

    #[test]
    fn mirrors_share_one_db() {
        let c = config(&[
            "--server", "a:1", "--server", "b:1", "--mirror", "--vclients", "4", "--db-size",
            "8", "--load", "400",
        ]);
        let works = build_works(&c, sample()).unwrap();
        assert_eq!(works.len(), 4);
        assert!(Arc::ptr_eq(&works[0].db, &works[1].db));
        assert!(works.iter().all(|w| w.db.db_size() == 8));
        assert_eq!(works[1].saddr.host, "b");
    }
}
