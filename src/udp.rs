//! UDP path: memcached UDP framing, the fragmenting request sender and the
//! datagram receiver.

use std::io::{self, Read, Write};
use std::net::UdpSocket;

use arrayvec::ArrayVec;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::clock;
use crate::error::{Error, Result};
use crate::memcached::{self, parse_response_head, Request, Response, MAX_REQUEST_SIZE, MAX_RESPONSE_SIZE};

pub const UDP_HEADER_SIZE: usize = 8;
const MAX_IP_PACKET_SIZE: usize = (1 << 16) - 1;
/// Room left for the IP, UDP and memcached-UDP headers.
const HEADER_MARGIN: usize = 100;

/// `{id, seq, cnt, reserved}`, all big-endian u16.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentHeader {
    pub id: u16,
    pub seq: u16,
    pub cnt: u16,
}

impl SegmentHeader {
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u16::<BigEndian>(self.id)?;
        writer.write_u16::<BigEndian>(self.seq)?;
        writer.write_u16::<BigEndian>(self.cnt)?;
        writer.write_u16::<BigEndian>(0)?;
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> io::Result<SegmentHeader> {
        let header = SegmentHeader {
            id: reader.read_u16::<BigEndian>()?,
            seq: reader.read_u16::<BigEndian>()?,
            cnt: reader.read_u16::<BigEndian>()?,
        };
        reader.read_u16::<BigEndian>()?;
        Ok(header)
    }

    pub fn to_bytes(&self) -> ArrayVec<u8, UDP_HEADER_SIZE> {
        let mut out = ArrayVec::new();
        // Exactly UDP_HEADER_SIZE bytes are written.
        let _ = self.write(&mut out);
        out
    }
}

pub fn segment_size(mtu: usize) -> usize {
    mtu.min(MAX_IP_PACKET_SIZE) - HEADER_MARGIN
}

/// Fails if a request of `request_size` bytes needs more segments than the
/// header can count at this `mtu`.
pub fn check_request_fits(mtu: usize, request_size: usize) -> Result<usize> {
    let segment_sz = segment_size(mtu);
    let segment_cnt = (request_size + segment_sz - 1) / segment_sz;
    if segment_cnt > u16::MAX as usize {
        return Err(Error::config(format!(
            "request of {} bytes needs {} segments at mtu {}",
            request_size, segment_cnt, mtu
        )));
    }
    Ok(segment_cnt)
}

pub trait SendDatagram {
    fn send_datagram(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl SendDatagram for UdpSocket {
    fn send_datagram(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)
    }
}

pub trait RecvDatagram {
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl RecvDatagram for UdpSocket {
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }
}

impl RecvDatagram for mio::net::UdpSocket {
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }
}

/// Splits one request into datagrams of at most `segment_sz` payload bytes
/// and sends them in order, resuming at the blocked segment.
pub struct UdpRequestSender {
    request_buf: Vec<u8>,
    packet: Vec<u8>,
    mtu: usize,
    segment_sz: usize,
    udp_id: u16,
    segment_cnt: usize,
    cur_segment: usize,
}

impl UdpRequestSender {
    pub fn new(mtu: usize) -> UdpRequestSender {
        let segment_sz = segment_size(mtu);
        UdpRequestSender {
            request_buf: Vec::with_capacity(MAX_REQUEST_SIZE),
            packet: Vec::with_capacity(UDP_HEADER_SIZE + segment_sz),
            mtu,
            segment_sz,
            udp_id: 0,
            segment_cnt: 0,
            cur_segment: 0,
        }
    }

    pub fn setup(&mut self, udp_id: u16, r: &Request, thread_tag: u64) -> Result<()> {
        self.request_buf.clear();
        memcached::encode(r, thread_tag, clock::now() as u64, &mut self.request_buf)?;
        let segment_cnt = check_request_fits(self.mtu, self.request_buf.len())?;
        self.udp_id = udp_id;
        self.segment_cnt = segment_cnt;
        self.cur_segment = 0;
        Ok(())
    }

    pub fn segment_cnt(&self) -> usize {
        self.segment_cnt
    }

    pub fn try_send<S: SendDatagram>(&mut self, sock: &mut S, send_time: &mut f64) -> Result<bool> {
        while self.cur_segment < self.segment_cnt {
            let start = self.cur_segment * self.segment_sz;
            let end = (start + self.segment_sz).min(self.request_buf.len());
            let header = SegmentHeader {
                id: self.udp_id,
                seq: self.cur_segment as u16,
                cnt: self.segment_cnt as u16,
            };
            self.packet.clear();
            self.packet.extend_from_slice(&header.to_bytes());
            self.packet.extend_from_slice(&self.request_buf[start..end]);

            *send_time = clock::now();
            match sock.send_datagram(&self.packet) {
                Ok(n) if n == self.packet.len() => self.cur_segment += 1,
                Ok(n) => {
                    return Err(Error::protocol(format!(
                        "udp send incomplete: {} of {} bytes",
                        n,
                        self.packet.len()
                    )))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io("udp send", e)),
            }
        }
        Ok(true)
    }
}

/// One received datagram. `resp` carries the parsed header only for
/// segment 0; every segment carries its receive time.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ResponseSegment {
    pub udp_id: u16,
    pub cur_segment: u16,
    pub segment_cnt: u16,
    pub resp: Response,
}

impl ResponseSegment {
    pub fn decode(datagram: &[u8], recv_time: f64) -> Result<ResponseSegment> {
        if datagram.len() < UDP_HEADER_SIZE {
            return Err(Error::protocol(format!(
                "short datagram: {} bytes",
                datagram.len()
            )));
        }
        let mut cursor = datagram;
        let header = SegmentHeader::read(&mut cursor)
            .map_err(|e| Error::io("udp header", e))?;

        let mut resp = Response::default();
        if header.seq == 0 {
            let end = cursor
                .iter()
                .position(|&b| b == b'\n')
                .ok_or_else(|| Error::protocol("response header can't fit in first UDP datagram"))?;
            resp = parse_response_head(&cursor[..end])?;
        }
        resp.recv_time = recv_time;

        Ok(ResponseSegment {
            udp_id: header.id,
            cur_segment: header.seq,
            segment_cnt: header.cnt,
            resp,
        })
    }
}

pub struct UdpResponseReceiver {
    recv_buf: Vec<u8>,
}

impl Default for UdpResponseReceiver {
    fn default() -> Self {
        UdpResponseReceiver::new()
    }
}

impl UdpResponseReceiver {
    pub fn new() -> UdpResponseReceiver {
        UdpResponseReceiver {
            recv_buf: vec![0; UDP_HEADER_SIZE + MAX_RESPONSE_SIZE],
        }
    }

    /// `None` when no datagram is waiting.
    pub fn try_receive<S: RecvDatagram>(&mut self, sock: &mut S) -> Result<Option<ResponseSegment>> {
        loop {
            match sock.recv_datagram(&mut self.recv_buf) {
                Ok(n) => {
                    let recv_time = clock::now();
                    return ResponseSegment::decode(&self.recv_buf[..n], recv_time).map(Some);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io("udp receive", e)),
            }
        }
    }
}
