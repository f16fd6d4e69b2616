//! TCP path: partial-send request sender, HEAD/BODY response framing and the
//! FIFO of requests awaiting a reply.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Mutex;

use crate::buffer::Buffer;
use crate::clock;
use crate::conn_work::ConnWork;
use crate::error::{Error, Result};
use crate::memcached::{
    self, parse_response_head, request_response_match, Outcome, Request, Response,
    MAX_REQUEST_SIZE, VALUE_TRAILER_SIZE,
};

/// Requests sent on one connection and not yet answered, oldest first.
///
/// Responses are matched by position. This holds only as long as the server
/// answers in request order.
#[derive(Default)]
pub struct RequestQueue {
    queue: Mutex<VecDeque<Request>>,
}

impl RequestQueue {
    pub fn new() -> RequestQueue {
        RequestQueue::default()
    }

    pub fn push_back(&self, r: Request) {
        self.queue.lock().unwrap().push_back(r);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// True once the request a response answers has been pushed.
    pub fn request_enqueued(&self) -> bool {
        !self.is_empty()
    }

    /// Pops the oldest request, spinning while the queue is empty.
    ///
    /// The sender pushes right after the syscall that carried the request, so
    /// the reply can only beat it by a few instructions.
    pub fn pop_front_wait(&self) -> Request {
        loop {
            if let Some(r) = self.queue.lock().unwrap().pop_front() {
                return r;
            }
            while !self.request_enqueued() {
                std::hint::spin_loop();
            }
        }
    }
}

pub struct TcpRequestSender {
    send_buf: Vec<u8>,
    progress: usize,
}

impl Default for TcpRequestSender {
    fn default() -> Self {
        TcpRequestSender::new()
    }
}

impl TcpRequestSender {
    pub fn new() -> TcpRequestSender {
        TcpRequestSender {
            send_buf: Vec::with_capacity(MAX_REQUEST_SIZE),
            progress: 0,
        }
    }

    pub fn setup(&mut self, r: &Request, thread_tag: u64) -> Result<()> {
        self.send_buf.clear();
        self.progress = 0;
        memcached::encode(r, thread_tag, clock::now() as u64, &mut self.send_buf)
    }

    pub fn pending(&self) -> &[u8] {
        &self.send_buf[self.progress..]
    }

    /// Writes until the request is out or the socket would block.
    ///
    /// `send_time` is stamped before every write, so on completion it holds
    /// the time of the write that carried the last bytes.
    pub fn try_send<W: Write>(&mut self, sock: &mut W, send_time: &mut f64) -> Result<bool> {
        while self.progress != self.send_buf.len() {
            *send_time = clock::now();
            match sock.write(&self.send_buf[self.progress..]) {
                Ok(0) => return Err(Error::io("tcp send", io::ErrorKind::WriteZero.into())),
                Ok(n) => self.progress += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io("tcp send", e)),
            }
        }
        Ok(true)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RecvState {
    Head,
    Body,
}

pub struct TcpResponseReceiver {
    peer: String,
    buf: Buffer,
    state: RecvState,
    skip_target: usize,
    cur_resp: Response,
    last_read: f64,
    drained: bool,
    responses: Vec<Response>,
}

impl TcpResponseReceiver {
    pub fn new(mtu: usize, peer: String) -> TcpResponseReceiver {
        TcpResponseReceiver {
            peer,
            buf: Buffer::with_capacity(mtu * 2),
            state: RecvState::Head,
            skip_target: 0,
            cur_resp: Response::default(),
            last_read: 0.0,
            drained: false,
            responses: Vec::new(),
        }
    }

    /// Reads once and returns every response completed by the bytes
    /// buffered so far. Empty when the socket has nothing to read.
    pub fn try_receive<R: Read>(&mut self, sock: &mut R) -> Result<&[Response]> {
        self.responses.clear();
        if self.recv_some(sock)? > 0 {
            self.run_state_machine()?;
        }
        Ok(&self.responses)
    }

    /// True if the last `try_receive` found the socket empty.
    pub fn drained(&self) -> bool {
        self.drained
    }

    fn recv_some<R: Read>(&mut self, sock: &mut R) -> Result<usize> {
        self.buf.try_shrink();
        self.drained = false;
        loop {
            match sock.read(self.buf.get_empty_buf()) {
                Ok(0) => return Err(Error::PeerClosed(self.peer.clone())),
                Ok(n) => {
                    self.buf.push_data(n);
                    self.last_read = clock::now();
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.drained = true;
                    return Ok(0);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io("tcp receive", e)),
            }
        }
    }

    fn run_state_machine(&mut self) -> Result<()> {
        loop {
            let done = match self.state {
                RecvState::Head => match self.handle_head()? {
                    None => return Ok(()),
                    Some(done) => done,
                },
                RecvState::Body => {
                    if !self.skip() {
                        return Ok(());
                    }
                    true
                }
            };
            if done {
                self.cur_resp.recv_time = self.last_read;
                self.responses.push(self.cur_resp);
                self.state = RecvState::Head;
            }
        }
    }

    /// `None` if no complete header line is buffered yet, otherwise whether
    /// the response is already complete.
    fn handle_head(&mut self) -> Result<Option<bool>> {
        let data = self.buf.get_data();
        let end = match data.iter().position(|&b| b == b'\n') {
            Some(end) => end,
            None => return Ok(None),
        };
        self.cur_resp = parse_response_head(&data[..end])?;
        self.buf.pull_data(end + 1);
        if self.cur_resp.outcome == Outcome::GetFound {
            self.skip_target = self.cur_resp.val_size + VALUE_TRAILER_SIZE;
            self.state = RecvState::Body;
            Ok(Some(false))
        } else {
            Ok(Some(true))
        }
    }

    fn skip(&mut self) -> bool {
        let avail = self.buf.data_size();
        if avail >= self.skip_target {
            self.buf.pull_data(self.skip_target);
            self.skip_target = 0;
            return true;
        }
        self.skip_target -= avail;
        self.buf.pull_data(avail);
        false
    }
}

/// Matches each response against the oldest outstanding request and counts
/// the round trip.
pub fn retire_responses(
    responses: &[Response],
    outstanding: &RequestQueue,
    work: &ConnWork,
) -> Result<()> {
    for resp in responses {
        let r = outstanding.pop_front_wait();
        request_response_match(&r, resp)?;
        work.count_replied(&r, resp)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn_work::tests::{settings, work_with};
    use crate::memcached::{decimal_len, server_reply, Command};
    use std::io::Cursor;

    /// Hands out its data in fixed-size pieces, then would-block.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Accepts `budget` bytes, then would-block.
    struct Choke {
        out: Vec<u8>,
        budget: usize,
    }

    impl Write for Choke {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget).min(7);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn request(cmd: Command, key_seed: u32, val_size: usize) -> Request {
        Request {
            key_seed,
            key_size: 10,
            val_size,
            vss_size: decimal_len(val_size),
            cmd,
            send_time: 0.0,
        }
    }

    fn drain(rx: &mut TcpResponseReceiver, sock: &mut Trickle) -> Vec<Response> {
        let mut all = Vec::new();
        while sock.pos < sock.data.len() {
            all.extend_from_slice(rx.try_receive(sock).unwrap());
        }
        all
    }

    #[test]
    fn sender_resumes_after_would_block() {
        let r = request(Command::Set, 42, 100);
        let mut tx = TcpRequestSender::new();
        tx.setup(&r, 3).unwrap();
        let total = tx.pending().len();
        assert_eq!(total, r.wire_size());

        let mut sock = Choke {
            out: Vec::new(),
            budget: 50,
        };
        let mut send_time = 0.0;
        assert!(!tx.try_send(&mut sock, &mut send_time).unwrap());
        assert_eq!(sock.out.len(), 50);
        assert!(send_time > 0.0);

        sock.budget = usize::MAX;
        assert!(tx.try_send(&mut sock, &mut send_time).unwrap());
        assert_eq!(sock.out.len(), total);
        assert!(sock.out.starts_with(b"set KK0000002A 0 0 100\r\n"));
    }

    #[test]
    fn frames_mixed_responses_across_reads() {
        let reqs = [
            request(Command::Get, 1, 1000),
            request(Command::Set, 2, 64),
            request(Command::Get, 3, 80),
            request(Command::Get, 4, 3000),
        ];
        let mut data = Vec::new();
        data.extend(server_reply(&reqs[0], true));
        data.extend(server_reply(&reqs[1], true));
        data.extend(server_reply(&reqs[2], false));
        data.extend(server_reply(&reqs[3], true));

        for chunk in [1, 5, 64, 4096] {
            let mut sock = Trickle {
                data: data.clone(),
                pos: 0,
                chunk,
            };
            let mut rx = TcpResponseReceiver::new(64, "test".to_string());
            let got = drain(&mut rx, &mut sock);
            let outcomes: Vec<Outcome> = got.iter().map(|r| r.outcome).collect();
            assert_eq!(
                outcomes,
                vec![
                    Outcome::GetFound,
                    Outcome::SetOk,
                    Outcome::GetNotFound,
                    Outcome::GetFound
                ],
                "chunk {}",
                chunk
            );
            for (r, resp) in reqs.iter().zip(&got) {
                request_response_match(r, resp).unwrap();
                assert!(resp.recv_time > 0.0);
            }
            assert_eq!(got[3].key_seed, 4);
            assert_eq!(got[3].val_size, 3000);
        }
    }

    #[test]
    fn would_block_yields_nothing() {
        let mut rx = TcpResponseReceiver::new(1500, "test".to_string());
        let mut sock = Trickle {
            data: Vec::new(),
            pos: 0,
            chunk: 1,
        };
        assert!(rx.try_receive(&mut sock).unwrap().is_empty());
        assert!(rx.drained());
    }

    #[test]
    fn peer_close_is_fatal() {
        let mut rx = TcpResponseReceiver::new(1500, "10.0.0.1:11211".to_string());
        let mut sock = Cursor::new(Vec::<u8>::new());
        assert!(matches!(
            rx.try_receive(&mut sock),
            Err(Error::PeerClosed(_))
        ));
    }

    #[test]
    fn unknown_response_is_fatal() {
        let mut rx = TcpResponseReceiver::new(1500, "test".to_string());
        let mut sock = Cursor::new(b"SERVER_ERROR busy\r\n".to_vec());
        assert!(matches!(
            rx.try_receive(&mut sock),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn encode_then_reply_round_trips() {
        for val_size in [44, 100, 5000] {
            let r = request(Command::Get, 0xBEEF, val_size);
            let mut tx = TcpRequestSender::new();
            tx.setup(&r, 0).unwrap();
            assert!(tx.pending().starts_with(b"get KK0000BEEF\r\n"));

            let mut sock = Cursor::new(server_reply(&r, true));
            let mut rx = TcpResponseReceiver::new(1500, "test".to_string());
            let mut got = Vec::new();
            while got.is_empty() {
                got.extend_from_slice(rx.try_receive(&mut sock).unwrap());
            }
            assert_eq!(got[0].key_seed, r.key_seed);
            assert_eq!(got[0].key_size, r.key_size);
            assert_eq!(got[0].val_size, r.val_size);
        }
    }

    #[test]
    fn retires_in_fifo_order() {
        let work = work_with(settings(), 4);
        let queue = RequestQueue::new();
        let mut a = request(Command::Get, 0, 100);
        a.key_size = 8;
        a.send_time = 1.0;
        let mut b = a;
        b.key_seed = 1;
        b.val_size = 50;
        b.send_time = 2.0;
        queue.push_back(a);
        queue.push_back(b);

        let miss = |t: f64| Response {
            recv_time: t,
            ..Default::default()
        };
        let hit_b = Response {
            key_seed: 1,
            key_size: 8,
            val_size: 50,
            outcome: Outcome::GetFound,
            recv_time: 10.0,
        };
        retire_responses(&[miss(5.0), hit_b], &queue, &work).unwrap();
        assert!(queue.is_empty());
        let c = work.update_counters();
        assert_eq!(c.replied_get, 2);
        assert_eq!(c.hit_get, 1);

        queue.push_back(a);
        assert!(matches!(
            retire_responses(&[hit_b], &queue, &work),
            Err(Error::WrongHit { .. })
        ));
    }
}
