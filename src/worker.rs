//! Worker pairs.
//!
//! A send thread walks its connections in earliest-deadline order, opening
//! each socket on first use and handing a clone of it to the paired receive
//! thread. The receive thread drains those sockets from a mio reactor and
//! retires every completed response against the connection's outstanding
//! requests.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};
use std::io;
use std::net::{TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use mio::{Events, Interest, Poll, Token, Waker};
use rand::Rng;
use rand_mt::Mt64;
use tracing::{debug, info};

use crate::clock;
use crate::config::AppConfig;
use crate::conn_work::ConnWork;
use crate::control::StartupBarrier;
use crate::error::{Error, Result};
use crate::memcached::Request;
use crate::net;
use crate::tcp::{retire_responses, RequestQueue, TcpRequestSender, TcpResponseReceiver};
use crate::transaction::{retire_segment, TransactionManager};
use crate::udp::{UdpRequestSender, UdpResponseReceiver};

const WAKE_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 1024;
/// ns from the start signal to the first request of a worker.
const FIRST_TARGET_DELAY: f64 = 1.0e6;

/// Linear send-rate ramp of one connection, from its initial rate towards
/// its target rate.
#[derive(Copy, Clone, Debug)]
pub struct RateRamp {
    init_rate: f64,
    max_rate: f64,
    /// Rate increment per second.
    speed: f64,
    start: f64,
    rate: f64,
    reached: bool,
}

impl RateRamp {
    pub fn new(init_rate: f64, max_rate: f64, speed: f64, start: f64) -> RateRamp {
        RateRamp {
            init_rate,
            max_rate,
            speed,
            start,
            rate: init_rate.min(max_rate),
            reached: false,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Nominal ns between two requests at the current rate.
    pub fn interval(&self) -> f64 {
        1.0e9 / self.rate
    }

    pub fn reached(&self) -> bool {
        self.reached
    }

    /// For connections that start at full rate. True exactly once.
    pub fn check_at_target(&mut self) -> bool {
        if !self.reached && self.rate >= self.max_rate {
            self.reached = true;
            return true;
        }
        false
    }

    /// Moves the rate to time `now`. True exactly once: on the call that
    /// first reaches the target rate.
    pub fn advance(&mut self, now: f64) -> bool {
        if self.reached {
            return false;
        }
        self.rate = self.init_rate + self.speed * (now - self.start) / 1.0e9;
        if self.rate >= self.max_rate {
            self.rate = self.max_rate;
            self.reached = true;
            return true;
        }
        false
    }
}

/// Send side of one connection's transport.
pub trait RequestPath {
    /// Encodes `r` and claims whatever the transport needs to match its
    /// reply.
    fn setup(&mut self, r: &Request, thread_tag: u64) -> Result<()>;

    /// `Ok(false)` on would-block; call again to resume.
    fn try_send(&mut self, send_time: &mut f64) -> Result<bool>;

    /// Makes the fully sent `r` visible to the receive thread.
    fn sent(&mut self, r: Request) -> Result<()>;
}

struct TcpPath {
    stream: TcpStream,
    sender: TcpRequestSender,
    outstanding: Arc<RequestQueue>,
}

impl RequestPath for TcpPath {
    fn setup(&mut self, r: &Request, thread_tag: u64) -> Result<()> {
        self.sender.setup(r, thread_tag)
    }

    fn try_send(&mut self, send_time: &mut f64) -> Result<bool> {
        self.sender.try_send(&mut self.stream, send_time)
    }

    fn sent(&mut self, r: Request) -> Result<()> {
        self.outstanding.push_back(r);
        Ok(())
    }
}

struct UdpPath {
    sock: UdpSocket,
    sender: UdpRequestSender,
    transactions: Arc<TransactionManager>,
    udp_id: u16,
}

impl RequestPath for UdpPath {
    fn setup(&mut self, r: &Request, thread_tag: u64) -> Result<()> {
        self.udp_id = loop {
            if let Some(id) = self.transactions.try_create_transaction(clock::now()) {
                break id;
            }
            std::hint::spin_loop();
        };
        self.sender.setup(self.udp_id, r, thread_tag)
    }

    fn try_send(&mut self, send_time: &mut f64) -> Result<bool> {
        self.sender.try_send(&mut self.sock, send_time)
    }

    fn sent(&mut self, r: Request) -> Result<()> {
        self.transactions.register_request(self.udp_id, &r)
    }
}

/// A newly connected socket, passed from a send thread to its receive thread.
pub enum Handoff {
    Tcp {
        work: Arc<ConnWork>,
        outstanding: Arc<RequestQueue>,
        stream: mio::net::TcpStream,
    },
    Udp {
        work: Arc<ConnWork>,
        transactions: Arc<TransactionManager>,
        sock: mio::net::UdpSocket,
    },
}

/// Heap entry of the send loop, ordered by target send time.
pub struct SendContext {
    work: Arc<ConnWork>,
    path: Option<Box<dyn RequestPath>>,
    ramp: RateRamp,
    /// ns
    target: f64,
}

impl SendContext {
    fn new(work: Arc<ConnWork>, target: f64) -> SendContext {
        let ramp = RateRamp::new(work.init_send_rate, work.send_rate, work.ramp_up_speed, target);
        SendContext {
            work,
            path: None,
            ramp,
            target,
        }
    }
}

impl Ord for SendContext {
    // Reversed: `BinaryHeap` pops the earliest target first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .target
            .total_cmp(&self.target)
            .then_with(|| other.work.id.cmp(&self.work.id))
    }
}

impl PartialOrd for SendContext {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SendContext {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SendContext {}

pub struct SendWorker {
    lid: usize,
    config: Arc<AppConfig>,
    barrier: Arc<StartupBarrier>,
    works: Vec<Arc<ConnWork>>,
    /// Connections per second opened by this worker.
    connect_speed: f64,
    handoff: Sender<Handoff>,
    waker: Arc<Waker>,
}

enum Listener {
    Tcp {
        work: Arc<ConnWork>,
        outstanding: Arc<RequestQueue>,
        stream: mio::net::TcpStream,
        receiver: TcpResponseReceiver,
    },
    Udp {
        transactions: Arc<TransactionManager>,
        sock: mio::net::UdpSocket,
        receiver: UdpResponseReceiver,
    },
}

impl Listener {
    /// Advances the connection at most `burst` times. True if it stopped on
    /// the limit rather than on an empty socket.
    fn receive_burst(&mut self, burst: usize) -> Result<bool> {
        for _ in 0..burst {
            if !self.receive_once()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn receive_once(&mut self) -> Result<bool> {
        match self {
            Listener::Tcp {
                work,
                outstanding,
                stream,
                receiver,
            } => {
                let responses = receiver.try_receive(stream)?;
                retire_responses(responses, outstanding, work)?;
                Ok(!receiver.drained())
            }
            Listener::Udp {
                transactions,
                sock,
                receiver,
            } => match receiver.try_receive(sock)? {
                Some(seg) => {
                    retire_segment(transactions, &seg)?;
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }
}

pub struct ReceiveWorker {
    lid: usize,
    poll: Poll,
    handoff: Receiver<Handoff>,
    listeners: Vec<Listener>,
    /// Connections to revisit before blocking again.
    pending: BTreeSet<Token>,
    busy_loop: bool,
    receive_burst: usize,
    mtu: usize,
}

/// Builds the send and receive halves of worker `lid`.
pub fn pair(
    lid: usize,
    config: Arc<AppConfig>,
    barrier: Arc<StartupBarrier>,
    works: Vec<Arc<ConnWork>>,
    connect_speed: f64,
) -> Result<(SendWorker, ReceiveWorker)> {
    let poll = Poll::new().map_err(|e| Error::io("create poll", e))?;
    let waker = Waker::new(poll.registry(), WAKE_TOKEN)
        .map_err(|e| Error::io("create waker", e))?;
    let (tx, rx) = crossbeam_channel::unbounded();

    let receiver = ReceiveWorker {
        lid,
        poll,
        handoff: rx,
        listeners: Vec::with_capacity(works.len()),
        pending: BTreeSet::new(),
        busy_loop: config.busy_loop_receive,
        receive_burst: config.receive_burst,
        mtu: config.mtu,
    };
    let sender = SendWorker {
        lid,
        config,
        barrier,
        works,
        connect_speed,
        handoff: tx,
        waker: Arc::new(waker),
    };
    Ok((sender, receiver))
}

impl SendWorker {
    pub fn run(self) -> Result<()> {
        let mut rng: Mt64 = Mt64::new(rand::thread_rng().gen::<u64>());
        self.barrier.wait_until_started();

        let mut heap = self.schedule_connections(clock::now(), &mut rng);
        info!(worker = self.lid, connections = heap.len(), "send thread started");
        while let Some(mut ctx) = heap.pop() {
            self.send_next(&mut ctx, &mut rng)?;
            heap.push(ctx);
        }
        Ok(())
    }

    /// First targets: 1 ms after `now`, then one jittered connect interval
    /// apart.
    fn schedule_connections<R: Rng>(&self, now: f64, rng: &mut R) -> BinaryHeap<SendContext> {
        let connect_interval = 1.0e9 / self.connect_speed;
        let mut target = now + FIRST_TARGET_DELAY;
        self.works
            .iter()
            .enumerate()
            .map(|(i, work)| {
                if i > 0 {
                    target += connect_interval * rng.gen_range(0.5..1.5);
                }
                SendContext::new(work.clone(), target)
            })
            .collect()
    }

    fn send_next<R: Rng>(&self, ctx: &mut SendContext, rng: &mut R) -> Result<()> {
        let path = match ctx.path {
            Some(ref mut path) => path,
            None => {
                let path = self.connect(&ctx.work)?;
                if ctx.ramp.check_at_target() {
                    self.barrier.mark_ramped_up();
                }
                ctx.path.insert(path)
            }
        };

        let mut r = ctx.work.make_request(rng)?;
        path.setup(&r, self.lid as u64)?;

        let start = clock::spin_until(ctx.target);
        let mut send_time = start;
        while !path.try_send(&mut send_time)? {
            std::hint::spin_loop();
        }
        let finish = clock::now();
        r.send_time = send_time;

        if ctx.ramp.advance(finish) {
            debug!(conn = ctx.work.id, rate = ctx.ramp.rate(), "ramped up");
            self.barrier.mark_ramped_up();
        }

        ctx.work.count_send_timing(ctx.target, start, finish)?;
        ctx.work.count_sent(&r)?;
        path.sent(r)?;

        ctx.target += ctx.ramp.interval() * self.config.traffic_shape.sample(rng);
        Ok(())
    }

    fn connect(&self, work: &Arc<ConnWork>) -> Result<Box<dyn RequestPath>> {
        let c = &self.config;
        let (path, handoff): (Box<dyn RequestPath>, Handoff) = if c.udp {
            let sock = net::open_udp_sock(work.id, &work.saddr, c.base_port)?;
            let local = sock
                .local_addr()
                .map_err(|e| Error::io("udp local_addr", e))?;
            work.set_client_addr(local);
            let recv_sock = sock
                .try_clone()
                .map_err(|e| Error::io("udp try_clone", e))?;
            let transactions = Arc::new(TransactionManager::new(work.clone(), c.udp_timeout));
            (
                Box::new(UdpPath {
                    sock,
                    sender: UdpRequestSender::new(c.mtu),
                    transactions: transactions.clone(),
                    udp_id: 0,
                }),
                Handoff::Udp {
                    work: work.clone(),
                    transactions,
                    sock: mio::net::UdpSocket::from_std(recv_sock),
                },
            )
        } else {
            let stream = net::open_stream_sock(work.id, &work.saddr, c.base_port, c.nagles)?;
            let local = stream
                .local_addr()
                .map_err(|e| Error::io("tcp local_addr", e))?;
            work.set_client_addr(local);
            let recv_stream = stream
                .try_clone()
                .map_err(|e| Error::io("tcp try_clone", e))?;
            let outstanding = Arc::new(RequestQueue::new());
            (
                Box::new(TcpPath {
                    stream,
                    sender: TcpRequestSender::new(),
                    outstanding: outstanding.clone(),
                }),
                Handoff::Tcp {
                    work: work.clone(),
                    outstanding,
                    stream: mio::net::TcpStream::from_std(recv_stream),
                },
            )
        };

        self.handoff
            .send(handoff)
            .map_err(|_| Error::ReceiverGone(self.lid))?;
        self.waker
            .wake()
            .map_err(|e| Error::io("wake receive thread", e))?;
        debug!(
            worker = self.lid,
            conn = work.id,
            server = %work.saddr,
            client = %work.client_addr(),
            "connected"
        );
        Ok(path)
    }
}

impl ReceiveWorker {
    pub fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        info!(worker = self.lid, busy_loop = self.busy_loop, "receive thread started");
        loop {
            self.poll_once(&mut events)?;
        }
    }

    /// Blocks only when nothing is left to revisit.
    fn poll_timeout(&self) -> Option<Duration> {
        if self.busy_loop || !self.pending.is_empty() {
            Some(Duration::ZERO)
        } else {
            None
        }
    }

    fn poll_once(&mut self, events: &mut Events) -> Result<()> {
        if let Err(e) = self.poll.poll(events, self.poll_timeout()) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(Error::io("poll", e));
        }

        for event in events.iter() {
            match event.token() {
                WAKE_TOKEN => self.accept_handoffs()?,
                token => {
                    self.pending.insert(token);
                }
            }
        }

        for token in std::mem::take(&mut self.pending) {
            if let Some(listener) = self.listeners.get_mut(token.0 - 1) {
                if listener.receive_burst(self.receive_burst)? {
                    self.pending.insert(token);
                }
            }
        }
        Ok(())
    }

    fn accept_handoffs(&mut self) -> Result<()> {
        loop {
            let handoff = match self.handoff.try_recv() {
                Ok(handoff) => handoff,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            };

            let token = Token(self.listeners.len() + 1);
            let registry = self.poll.registry();
            let (conn, listener) = match handoff {
                Handoff::Tcp {
                    work,
                    outstanding,
                    mut stream,
                } => {
                    registry
                        .register(&mut stream, token, Interest::READABLE)
                        .map_err(|e| Error::io("register tcp stream", e))?;
                    let receiver = TcpResponseReceiver::new(self.mtu, work.saddr.to_string());
                    (
                        work.id,
                        Listener::Tcp {
                            work,
                            outstanding,
                            stream,
                            receiver,
                        },
                    )
                }
                Handoff::Udp {
                    work,
                    transactions,
                    mut sock,
                } => {
                    registry
                        .register(&mut sock, token, Interest::READABLE)
                        .map_err(|e| Error::io("register udp socket", e))?;
                    (
                        work.id,
                        Listener::Udp {
                            transactions,
                            sock,
                            receiver: UdpResponseReceiver::new(),
                        },
                    )
                }
            };
            debug!(worker = self.lid, conn, token = token.0, "listening");
            self.listeners.push(listener);
            // Replies may have landed before the registration.
            self.pending.insert(token);
        }
    }
}
