//! memcached ASCII protocol: request encoding, response header parsing and
//! request/response matching.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MAX_KEY_SIZE: usize = 250;
pub const MAX_VAL_SIZE: usize = 1 << 20;
pub const MAX_REQUEST_SIZE: usize = MAX_KEY_SIZE + MAX_VAL_SIZE + 100;
pub const MAX_RESPONSE_SIZE: usize = MAX_KEY_SIZE + MAX_VAL_SIZE + 100;

/// Hex digits of a key seed; also the smallest legal key.
pub const KEY_SEED_CHARS: usize = 8;
pub const MIN_KEY_SIZE: usize = KEY_SEED_CHARS;

// |thread|tsc|
const VAL_META_SIZE: usize = 1 + 16 + 1 + 16 + 1;
const VAL_CHUNK_SIZE: usize = KEY_SEED_CHARS + 1;
pub const MIN_VAL_SIZE: usize = VAL_META_SIZE + VAL_CHUNK_SIZE;

/// Bytes that follow a `VALUE` payload: `\r\nEND\r\n`.
pub const VALUE_TRAILER_SIZE: usize = 7;

static HEX: &[u8; 16] = b"0123456789ABCDEF";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Set,
    Get,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    SetOk,
    GetNotFound,
    GetFound,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Request {
    pub key_seed: u32,
    pub key_size: usize,
    pub val_size: usize,
    /// Length of `val_size` printed in decimal.
    pub vss_size: usize,
    pub cmd: Command,
    /// Nanoseconds, set by the sender when the first byte leaves.
    pub send_time: f64,
}

impl Default for Request {
    fn default() -> Self {
        Request {
            key_seed: 0,
            key_size: MIN_KEY_SIZE,
            val_size: MIN_VAL_SIZE,
            vss_size: decimal_len(MIN_VAL_SIZE),
            cmd: Command::Get,
            send_time: 0.0,
        }
    }
}

impl Request {
    /// Exact number of bytes `encode` appends.
    pub fn wire_size(&self) -> usize {
        match self.cmd {
            Command::Get => 4 + self.key_size + 2,
            Command::Set => 4 + self.key_size + 5 + self.vss_size + 2 + self.val_size + 2,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Response {
    pub key_seed: u32,
    pub key_size: usize,
    pub val_size: usize,
    pub outcome: Outcome,
    pub recv_time: f64,
}

impl Default for Response {
    fn default() -> Self {
        Response {
            key_seed: 0,
            key_size: 0,
            val_size: 0,
            outcome: Outcome::GetNotFound,
            recv_time: 0.0,
        }
    }
}

pub fn decimal_len(n: usize) -> usize {
    let mut len = 1;
    let mut n = n / 10;
    while n > 0 {
        len += 1;
        n /= 10;
    }
    len
}

#[inline(always)]
fn push_hex(buf: &mut Vec<u8>, number: u64, digits: usize) {
    for i in (0..digits).rev() {
        buf.push(HEX[((number >> (4 * i)) & 0xf) as usize]);
    }
}

#[inline(always)]
fn write_key(buf: &mut Vec<u8>, key_seed: u32, key_size: usize) {
    for _ in KEY_SEED_CHARS..key_size {
        buf.push(b'K');
    }
    push_hex(buf, key_seed as u64, KEY_SEED_CHARS);
}

fn write_value(buf: &mut Vec<u8>, key_seed: u32, val_size: usize, thread_tag: u64, stamp: u64) {
    buf.push(b'|');
    push_hex(buf, thread_tag, 16);
    buf.push(b'|');
    push_hex(buf, stamp, 16);
    buf.push(b'|');
    let pad_size = (val_size - VAL_META_SIZE) % VAL_CHUNK_SIZE;
    if pad_size > 0 {
        for _ in 1..pad_size {
            buf.push(b'V');
        }
        buf.push(b'|');
    }
    for _ in 0..(val_size - VAL_META_SIZE) / VAL_CHUNK_SIZE {
        push_hex(buf, key_seed as u64, KEY_SEED_CHARS);
        buf.push(b'|');
    }
}

/// Appends the wire form of `r` to `buf`.
///
/// `thread_tag` and `stamp` are embedded in SET values to make captures
/// readable; the server never interprets them.
pub fn encode(r: &Request, thread_tag: u64, stamp: u64, buf: &mut Vec<u8>) -> Result<()> {
    if r.key_size < MIN_KEY_SIZE || r.key_size > MAX_KEY_SIZE {
        return Err(Error::config(format!(
            "key size {} outside [{}, {}]",
            r.key_size, MIN_KEY_SIZE, MAX_KEY_SIZE
        )));
    }
    match r.cmd {
        Command::Set => {
            if r.val_size < MIN_VAL_SIZE || r.val_size > MAX_VAL_SIZE {
                return Err(Error::config(format!(
                    "value size {} outside [{}, {}]",
                    r.val_size, MIN_VAL_SIZE, MAX_VAL_SIZE
                )));
            }
            buf.extend_from_slice(b"set ");
            write_key(buf, r.key_seed, r.key_size);
            // Writing into a Vec cannot fail.
            let _ = write!(buf, " 0 0 {}\r\n", r.val_size);
            write_value(buf, r.key_seed, r.val_size, thread_tag, stamp);
            buf.extend_from_slice(b"\r\n");
        }
        Command::Get => {
            buf.extend_from_slice(b"get ");
            write_key(buf, r.key_seed, r.key_size);
            buf.extend_from_slice(b"\r\n");
        }
    }
    Ok(())
}

fn extract_key_seed(key: &str) -> Result<u32> {
    if key.len() < KEY_SEED_CHARS {
        return Err(Error::protocol(format!("key too short: {:?}", key)));
    }
    let digits = &key.as_bytes()[key.len() - KEY_SEED_CHARS..];
    std::str::from_utf8(digits)
        .ok()
        .and_then(|digits| u32::from_str_radix(digits, 16).ok())
        .ok_or_else(|| Error::protocol(format!("bad key seed in {:?}", key)))
}

/// Classifies one response header line (without the trailing `\n`).
///
/// The returned response carries no receive time; the caller stamps it.
pub fn parse_response_head(line: &[u8]) -> Result<Response> {
    let line = std::str::from_utf8(line)
        .map_err(|_| Error::protocol("response header is not ASCII"))?;
    let mut tokens = line.split(|c| c == ' ' || c == '\r').filter(|t| !t.is_empty());

    let mut resp = Response::default();
    match tokens.next() {
        Some("STORED") => resp.outcome = Outcome::SetOk,
        Some("END") => resp.outcome = Outcome::GetNotFound,
        Some("VALUE") => {
            resp.outcome = Outcome::GetFound;
            let key = tokens
                .next()
                .ok_or_else(|| Error::protocol("VALUE without key"))?;
            resp.key_size = key.len();
            resp.key_seed = extract_key_seed(key)?;
            tokens
                .next()
                .ok_or_else(|| Error::protocol("VALUE without flags"))?;
            let bytes = tokens
                .next()
                .ok_or_else(|| Error::protocol("VALUE without length"))?;
            resp.val_size = bytes
                .parse()
                .map_err(|_| Error::protocol(format!("bad VALUE length: {:?}", bytes)))?;
        }
        Some(other) => {
            return Err(Error::protocol(format!("unknown response type: {}", other)));
        }
        None => return Err(Error::protocol("empty response header")),
    }
    Ok(resp)
}

/// Checks that `resp` is a legal answer to `r`.
pub fn request_response_match(r: &Request, resp: &Response) -> Result<()> {
    match (r.cmd, resp.outcome) {
        (Command::Get, Outcome::GetFound) => {
            if r.key_seed != resp.key_seed
                || r.key_size != resp.key_size
                || r.val_size != resp.val_size
            {
                return Err(Error::WrongHit {
                    req_seed: r.key_seed,
                    req_key: r.key_size,
                    req_val: r.val_size,
                    resp_seed: resp.key_seed,
                    resp_key: resp.key_size,
                    resp_val: resp.val_size,
                });
            }
            Ok(())
        }
        (Command::Get, Outcome::GetNotFound) => Ok(()),
        (Command::Set, Outcome::SetOk) => Ok(()),
        (command, outcome) => Err(Error::WrongOutcome { command, outcome }),
    }
}

/// Builds the reply a conforming server sends for `r`, given whether the key
/// is present. Test support for the TCP and UDP paths.
#[cfg(test)]
pub fn server_reply(r: &Request, hit: bool) -> Vec<u8> {
    let mut out = Vec::new();
    match r.cmd {
        Command::Set => out.extend_from_slice(b"STORED\r\n"),
        Command::Get if !hit => out.extend_from_slice(b"END\r\n"),
        Command::Get => {
            out.extend_from_slice(b"VALUE ");
            write_key(&mut out, r.key_seed, r.key_size);
            let _ = write!(out, " 0 {}\r\n", r.val_size);
            write_value(&mut out, r.key_seed, r.val_size, 0, 0);
            out.extend_from_slice(b"\r\nEND\r\n");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(cmd: Command, key_seed: u32, key_size: usize, val_size: usize) -> Request {
        Request {
            key_seed,
            key_size,
            val_size,
            vss_size: decimal_len(val_size),
            cmd,
            send_time: 0.0,
        }
    }

    #[test]
    fn encodes_get() {
        let mut buf = Vec::new();
        let r = request(Command::Get, 0x1A2B, 12, 100);
        encode(&r, 0, 0, &mut buf).unwrap();
        assert_eq!(buf, b"get KKKK00001A2B\r\n");
        assert_eq!(buf.len(), r.wire_size());
    }

    #[test]
    fn encodes_set_with_exact_value_size() {
        for val_size in [MIN_VAL_SIZE, 50, 100, 1000, 4097] {
            let mut buf = Vec::new();
            let r = request(Command::Set, 7, 8, val_size);
            encode(&r, 0xAB, 0xCD, &mut buf).unwrap();
            assert_eq!(buf.len(), r.wire_size());

            let head = format!("set 00000007 0 0 {}\r\n", val_size);
            assert!(buf.starts_with(head.as_bytes()));
            let value = &buf[head.len()..buf.len() - 2];
            assert_eq!(value.len(), val_size);
            assert!(value.starts_with(b"|00000000000000AB|00000000000000CD|"));
            assert!(value.ends_with(b"00000007|"));
            assert!(buf.ends_with(b"\r\n"));
        }
    }

    #[test]
    fn rejects_undersized_key_and_value() {
        let mut buf = Vec::new();
        assert!(encode(&request(Command::Get, 1, 7, 100), 0, 0, &mut buf).is_err());
        assert!(encode(&request(Command::Set, 1, 8, MIN_VAL_SIZE - 1), 0, 0, &mut buf).is_err());
    }

    #[test]
    fn parses_response_heads() {
        assert_eq!(parse_response_head(b"STORED\r").unwrap().outcome, Outcome::SetOk);
        assert_eq!(parse_response_head(b"END\r").unwrap().outcome, Outcome::GetNotFound);

        let resp = parse_response_head(b"VALUE KKKK00ABCDEF 0 123\r").unwrap();
        assert_eq!(resp.outcome, Outcome::GetFound);
        assert_eq!(resp.key_seed, 0xABCDEF);
        assert_eq!(resp.key_size, 12);
        assert_eq!(resp.val_size, 123);

        assert!(parse_response_head(b"ERROR\r").is_err());
        assert!(parse_response_head(b"SERVER_ERROR out of memory\r").is_err());
        assert!(parse_response_head(b"VALUE KKKK00ABCDEF 0\r").is_err());
        assert!(parse_response_head(b"\r").is_err());
    }

    #[test]
    fn multibyte_key_is_a_protocol_error() {
        // The last 8 bytes start inside a two-byte character.
        let line = "VALUE ééééé1 0 100\r";
        assert!(matches!(
            parse_response_head(line.as_bytes()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn key_seed_round_trips_through_reply() {
        let r = request(Command::Get, 0xDEADBEEF, 20, 64);
        let reply = server_reply(&r, true);
        let end = reply.iter().position(|&b| b == b'\n').unwrap();
        let resp = parse_response_head(&reply[..end]).unwrap();
        assert_eq!(resp.key_seed, r.key_seed);
        assert_eq!(resp.key_size, r.key_size);
        assert_eq!(resp.val_size, r.val_size);
        request_response_match(&r, &resp).unwrap();
    }

    #[test]
    fn matching_rules() {
        let get = request(Command::Get, 5, 8, 100);
        let set = request(Command::Set, 5, 8, 100);
        let stored = Response {
            outcome: Outcome::SetOk,
            ..Default::default()
        };
        let miss = Response::default();
        let hit = Response {
            key_seed: 5,
            key_size: 8,
            val_size: 100,
            outcome: Outcome::GetFound,
            recv_time: 0.0,
        };

        request_response_match(&get, &miss).unwrap();
        request_response_match(&get, &hit).unwrap();
        request_response_match(&set, &stored).unwrap();

        assert!(matches!(
            request_response_match(&get, &stored),
            Err(Error::WrongOutcome { .. })
        ));
        assert!(matches!(
            request_response_match(&set, &miss),
            Err(Error::WrongOutcome { .. })
        ));
        let wrong = Response { val_size: 99, ..hit };
        assert!(matches!(
            request_response_match(&get, &wrong),
            Err(Error::WrongHit { .. })
        ));
    }
}
