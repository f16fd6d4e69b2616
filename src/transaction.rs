//! UDP transaction table: 16-bit id allocation, timeout eviction and
//! response reassembly for one connection.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::conn_work::ConnWork;
use crate::error::{Error, Result};
use crate::memcached::{request_response_match, Request, Response};
use crate::udp::ResponseSegment;

pub const ID_SPACE: usize = 1 << 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransactionState {
    /// Id allocated, request not registered yet.
    Empty,
    RequestSent,
    ResponseInProgress,
}

struct Transaction {
    id: u16,
    state: TransactionState,
    req: Request,
    resp: Response,
    missing_segments: BTreeSet<u16>,
}

struct Table {
    /// Keyed by creation order; the first entry is the oldest.
    time_queue: BTreeMap<u64, Transaction>,
    id_table: HashMap<u16, u64>,
    free_ids: VecDeque<u16>,
    next_seq: u64,
}

impl Table {
    fn new_tc(&mut self) -> Option<u16> {
        let id = self.free_ids.pop_front()?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.time_queue.insert(
            seq,
            Transaction {
                id,
                state: TransactionState::Empty,
                req: Request::default(),
                resp: Response::default(),
                missing_segments: BTreeSet::new(),
            },
        );
        self.id_table.insert(id, seq);
        Some(id)
    }

    fn delete_tc(&mut self, id: u16) {
        if let Some(seq) = self.id_table.remove(&id) {
            self.time_queue.remove(&seq);
            // Back of the queue: the longest possible distance before reuse.
            self.free_ids.push_back(id);
        }
    }

    fn get_mut(&mut self, id: u16) -> Option<&mut Transaction> {
        let seq = self.id_table.get(&id)?;
        self.time_queue.get_mut(seq)
    }
}

pub struct TransactionManager {
    work: Arc<ConnWork>,
    /// ns
    timeout: f64,
    table: Mutex<Table>,
}

impl TransactionManager {
    pub fn new(work: Arc<ConnWork>, timeout_ms: f64) -> TransactionManager {
        TransactionManager {
            work,
            timeout: timeout_ms * 1.0e6,
            table: Mutex::new(Table {
                time_queue: BTreeMap::new(),
                id_table: HashMap::new(),
                free_ids: (0..ID_SPACE).map(|id| id as u16).collect(),
                next_seq: 0,
            }),
        }
    }

    /// Evicts expired transactions, then allocates an id. `None` while the
    /// id space is exhausted; the caller retries.
    pub fn try_create_transaction(&self, now: f64) -> Option<u16> {
        let mut table = self.table.lock().unwrap();
        loop {
            let (state, send_time, id) = match table.time_queue.values().next() {
                Some(oldest) => (oldest.state, oldest.req.send_time, oldest.id),
                None => break,
            };
            if state == TransactionState::Empty || now - send_time < self.timeout {
                break;
            }
            debug!(conn = self.work.id, udp_id = id, "udp transaction timed out");
            self.work.count_udp_timeout();
            table.delete_tc(id);
        }
        table.new_tc()
    }

    pub fn register_request(&self, id: u16, r: &Request) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        let tc = table
            .get_mut(id)
            .ok_or_else(|| Error::UdpTimeoutTooSmall(format!("unallocated transaction {}", id)))?;
        tc.req = *r;
        tc.state = TransactionState::RequestSent;
        Ok(())
    }

    /// `Ok(false)` if the request for this id is not registered yet; the
    /// caller retries with the same segment.
    pub fn try_process_response_segment(&self, seg: &ResponseSegment) -> Result<bool> {
        let mut table = self.table.lock().unwrap();
        let tc = table
            .get_mut(seg.udp_id)
            .ok_or_else(|| Error::UdpTimeoutTooSmall("missing transaction".to_string()))?;

        match tc.state {
            TransactionState::Empty => return Ok(false),
            TransactionState::RequestSent => {
                tc.missing_segments = (0..seg.segment_cnt).collect();
                tc.state = TransactionState::ResponseInProgress;
                if seg.resp.recv_time <= tc.req.send_time {
                    return Err(Error::UdpTimeoutTooSmall(
                        "impossible latency (<= 0) occurred".to_string(),
                    ));
                }
            }
            TransactionState::ResponseInProgress => {}
        }

        if seg.cur_segment == 0 {
            tc.resp = seg.resp;
            request_response_match(&tc.req, &tc.resp).map_err(|e| {
                Error::UdpTimeoutTooSmall(format!("request response mismatch: {}", e))
            })?;
        } else {
            tc.resp.recv_time = seg.resp.recv_time;
        }

        if !tc.missing_segments.remove(&seg.cur_segment) {
            return Err(Error::UdpTimeoutTooSmall("extra segments".to_string()));
        }

        if tc.missing_segments.is_empty() {
            let (id, req, resp) = (tc.id, tc.req, tc.resp);
            self.work.count_replied(&req, &resp)?;
            table.delete_tc(id);
        }
        Ok(true)
    }

    pub fn live_count(&self) -> usize {
        self.table.lock().unwrap().time_queue.len()
    }

    pub fn free_count(&self) -> usize {
        self.table.lock().unwrap().free_ids.len()
    }

    pub fn state_of(&self, id: u16) -> Option<TransactionState> {
        self.table.lock().unwrap().get_mut(id).map(|tc| tc.state)
    }
}

/// Feeds one segment to the table, spinning while its request is still
/// being registered by the send thread.
pub fn retire_segment(transactions: &TransactionManager, seg: &ResponseSegment) -> Result<()> {
    while !transactions.try_process_response_segment(seg)? {
        std::hint::spin_loop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn_work::tests::{settings, work_with};
    use crate::memcached::{decimal_len, server_reply, Command, Outcome};
    use crate::udp::tests::fragment;
    use std::collections::HashSet;

    fn manager(timeout_ms: f64) -> (Arc<ConnWork>, TransactionManager) {
        let work = Arc::new(work_with(settings(), 4));
        let tm = TransactionManager::new(work.clone(), timeout_ms);
        (work, tm)
    }

    fn get(key_seed: u32, val_size: usize, send_time: f64) -> Request {
        Request {
            key_seed,
            key_size: 8,
            val_size,
            vss_size: decimal_len(val_size),
            cmd: Command::Get,
            send_time,
        }
    }

    fn segments(id: u16, r: &Request, hit: bool, times: &[f64]) -> Vec<ResponseSegment> {
        fragment(id, &server_reply(r, hit), 1400)
            .iter()
            .zip(times)
            .map(|(d, &t)| ResponseSegment::decode(d, t).unwrap())
            .collect()
    }

    #[test]
    fn ids_are_unique_across_many_cycles() {
        let (work, tm) = manager(10_000.0);
        let mut live = HashSet::new();
        let mut pending = VecDeque::new();
        let mut now = 1.0e6;
        for i in 0..(ID_SPACE * 2 + 500) {
            now += 10.0;
            let id = tm.try_create_transaction(now).unwrap();
            assert!(live.insert(id), "id {} handed out twice", id);
            let r = get(i as u32 % 4, 100, now);
            tm.register_request(id, &r).unwrap();
            pending.push_back((id, r));

            // Keep a few hundred in flight.
            if pending.len() > 300 {
                let (id, r) = pending.pop_front().unwrap();
                for seg in segments(id, &r, false, &[now + 5.0]) {
                    assert!(tm.try_process_response_segment(&seg).unwrap());
                }
                live.remove(&id);
            }
        }
        assert_eq!(tm.live_count(), pending.len());
        assert_eq!(tm.free_count() + tm.live_count(), ID_SPACE);
        assert_eq!(work.update_counters().udp_timeout, 0);
    }

    #[test]
    fn exhaustion_then_recovery() {
        let (_work, tm) = manager(10_000.0);
        let ids: Vec<u16> = (0..ID_SPACE)
            .map(|_| tm.try_create_transaction(1.0).unwrap())
            .collect();
        assert_eq!(ids.first(), Some(&0));
        assert_eq!(ids.last(), Some(&0xffff));
        assert_eq!(tm.try_create_transaction(1.0), None);
    }

    #[test]
    fn evicts_oldest_expired_and_stops_at_young() {
        let (work, tm) = manager(1.0);
        let a = tm.try_create_transaction(0.0).unwrap();
        tm.register_request(a, &get(0, 100, 0.0)).unwrap();
        let b = tm.try_create_transaction(0.0).unwrap();
        tm.register_request(b, &get(1, 100, 0.5e6)).unwrap();
        let c = tm.try_create_transaction(0.0).unwrap();
        tm.register_request(c, &get(2, 100, 3.0e6)).unwrap();

        // a is 1.2 ms old, b only 0.7 ms.
        let d = tm.try_create_transaction(1.2e6).unwrap();
        assert_eq!(tm.state_of(a), None);
        assert_eq!(tm.state_of(b), Some(TransactionState::RequestSent));
        assert_eq!(tm.live_count(), 3);
        assert_eq!(work.update_counters().udp_timeout, 1);

        // d is still Empty: nothing behind it is evicted.
        let _ = tm.try_create_transaction(100.0e6).unwrap();
        assert_eq!(tm.state_of(b), None);
        assert_eq!(tm.state_of(c), None);
        assert_eq!(tm.state_of(d), Some(TransactionState::Empty));
        assert_eq!(work.update_counters().udp_timeout, 3);

        // Freed ids go to the back of the free list.
        assert_ne!(d, a);
    }

    #[test]
    fn reassembles_out_of_order() {
        let (work, tm) = manager(10_000.0);
        let id = tm.try_create_transaction(0.0).unwrap();
        let r = get(3, 3000, 1.0e6);
        tm.register_request(id, &r).unwrap();

        let segs = segments(id, &r, true, &[2.0e6, 2.1e6, 2.2e6]);
        assert_eq!(segs.len(), 3);

        assert!(tm.try_process_response_segment(&segs[2]).unwrap());
        assert_eq!(tm.state_of(id), Some(TransactionState::ResponseInProgress));
        assert!(tm.try_process_response_segment(&segs[0]).unwrap());
        assert_eq!(tm.state_of(id), Some(TransactionState::ResponseInProgress));
        assert_eq!(work.update_counters().replied_get, 0);
        assert!(tm.try_process_response_segment(&segs[1]).unwrap());
        assert_eq!(tm.state_of(id), None);

        let c = work.update_counters();
        assert_eq!(c.replied_get, 1);
        assert_eq!(c.hit_get, 1);
        // Receive time of segment 1, the last one processed.
        assert!((c.latency_sum - 1.1).abs() < 1e-9);
    }

    #[test]
    fn early_response_waits_for_registration() {
        let (_work, tm) = manager(10_000.0);
        let id = tm.try_create_transaction(0.0).unwrap();
        let r = get(0, 100, 1.0);
        let seg = segments(id, &r, false, &[5.0])[0];
        assert!(!tm.try_process_response_segment(&seg).unwrap());
        tm.register_request(id, &r).unwrap();
        retire_segment(&tm, &seg).unwrap();
        assert_eq!(tm.live_count(), 0);
    }

    #[test]
    fn violations_are_fatal() {
        let (_work, tm) = manager(10_000.0);
        let r = get(0, 100, 10.0);
        let unknown = segments(9, &r, false, &[20.0])[0];
        assert!(matches!(
            tm.try_process_response_segment(&unknown),
            Err(Error::UdpTimeoutTooSmall(_))
        ));

        let id = tm.try_create_transaction(0.0).unwrap();
        tm.register_request(id, &r).unwrap();
        let early = segments(id, &r, false, &[5.0])[0];
        assert!(tm.try_process_response_segment(&early).is_err());

        let id = tm.try_create_transaction(0.0).unwrap();
        tm.register_request(id, &r).unwrap();
        let set_reply = Request {
            cmd: Command::Set,
            ..r
        };
        let wrong = segments(id, &set_reply, true, &[20.0])[0];
        assert_eq!(wrong.resp.outcome, Outcome::SetOk);
        assert!(tm.try_process_response_segment(&wrong).is_err());

        let id = tm.try_create_transaction(0.0).unwrap();
        let big = get(1, 3000, 10.0);
        tm.register_request(id, &big).unwrap();
        let segs = segments(id, &big, true, &[20.0, 21.0, 22.0]);
        assert!(tm.try_process_response_segment(&segs[1]).unwrap());
        assert!(matches!(
            tm.try_process_response_segment(&segs[1]),
            Err(Error::UdpTimeoutTooSmall(_))
        ));
    }
}
