//! Sample database: a weighted population of key/value size archetypes and
//! the key space laid out over it.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::sync::Arc;

use rand::Rng;
use tracing::info;

use crate::error::{Error, Result};
use crate::memcached::{
    decimal_len, Command, Request, MAX_KEY_SIZE, MAX_VAL_SIZE, MIN_KEY_SIZE, MIN_VAL_SIZE,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SampleEntry {
    /// Cumulative weight minus one. The entry owns `[prev.pop_tag + 1, pop_tag]`.
    pub pop_tag: i32,
    pub key_size: usize,
    pub val_size: usize,
    pub vss_size: usize,
}

#[derive(Debug)]
pub struct Sample {
    pub entries: Vec<SampleEntry>,
    pub max_pop_tag: i32,
}

impl Sample {
    /// Loads `<key_size> <value_size> <weight>` lines; `-` reads stdin.
    pub fn load(path: &str) -> Result<Sample> {
        let sample = if path == "-" {
            Sample::from_reader(io::stdin().lock(), path)?
        } else {
            let file = File::open(path).map_err(|e| Error::io(path, e))?;
            Sample::from_reader(file, path)?
        };
        info!(
            file = path,
            size = sample.entries.len(),
            max_pop_tag = sample.max_pop_tag,
            "loaded db sample"
        );
        Ok(sample)
    }

    pub fn from_reader<R: Read>(reader: R, name: &str) -> Result<Sample> {
        let bad = |line: usize, msg: String| Error::Sample {
            path: name.to_string(),
            line,
            msg,
        };

        let mut entries = Vec::new();
        let mut max_pop_tag: i32 = -1;
        for (i, line) in BufReader::new(reader).lines().enumerate() {
            let lineno = i + 1;
            let line = line.map_err(|e| Error::io(name, e))?;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() != 3 {
                return Err(bad(lineno, format!("expected 3 fields, got {:?}", line)));
            }
            let key_size: usize = fields[0]
                .parse()
                .map_err(|_| bad(lineno, format!("bad key size {:?}", fields[0])))?;
            let val_size: usize = fields[1]
                .parse()
                .map_err(|_| bad(lineno, format!("bad value size {:?}", fields[1])))?;
            let pop: i64 = fields[2]
                .parse()
                .map_err(|_| bad(lineno, format!("bad weight {:?}", fields[2])))?;

            if pop <= 0 {
                return Err(bad(lineno, format!("pop <= 0: {}", pop)));
            }
            if !(MIN_KEY_SIZE..=MAX_KEY_SIZE).contains(&key_size) {
                return Err(bad(
                    lineno,
                    format!("key size {} outside [{}, {}]", key_size, MIN_KEY_SIZE, MAX_KEY_SIZE),
                ));
            }
            if !(MIN_VAL_SIZE..=MAX_VAL_SIZE).contains(&val_size) {
                return Err(bad(
                    lineno,
                    format!("value size {} outside [{}, {}]", val_size, MIN_VAL_SIZE, MAX_VAL_SIZE),
                ));
            }

            max_pop_tag = i32::try_from(max_pop_tag as i64 + pop)
                .map_err(|_| bad(lineno, "max_pop_tag overflow".to_string()))?;
            entries.push(SampleEntry {
                pop_tag: max_pop_tag,
                key_size,
                val_size,
                vss_size: decimal_len(val_size),
            });
        }

        if entries.is_empty() {
            return Err(Error::Sample {
                path: name.to_string(),
                line: 0,
                msg: "empty sample".to_string(),
            });
        }
        Ok(Sample {
            entries,
            max_pop_tag,
        })
    }

    /// Wire size of the largest `cmd` request any entry can produce.
    pub fn max_wire_size(&self, cmd: Command) -> usize {
        self.entries
            .iter()
            .map(|e| {
                Request {
                    key_size: e.key_size,
                    val_size: e.val_size,
                    vss_size: e.vss_size,
                    cmd,
                    ..Request::default()
                }
                .wire_size()
            })
            .max()
            .unwrap_or(0)
    }
}

/// `row_count x column_count` key slots; one column per sample entry.
pub struct MemDb {
    sample: Arc<Sample>,
    db_size: usize,
    first_key_seed: u32,
    col_cnt: usize,
    row_cnt: usize,
}

impl MemDb {
    pub fn new(sample: Arc<Sample>, db_size: usize, first_key_seed: u32) -> Result<MemDb> {
        let col_cnt = sample.entries.len();
        if db_size == 0 || db_size % col_cnt != 0 {
            return Err(Error::config(format!(
                "db size {} is not a multiple of sample size {}",
                db_size, col_cnt
            )));
        }
        if first_key_seed as u64 + db_size as u64 > u32::MAX as u64 + 1 {
            return Err(Error::config(format!(
                "db size {} does not fit the key seed space",
                db_size
            )));
        }
        Ok(MemDb {
            sample,
            db_size,
            first_key_seed,
            col_cnt,
            row_cnt: db_size / col_cnt,
        })
    }

    pub fn db_size(&self) -> usize {
        self.db_size
    }

    pub fn first_key_seed(&self) -> u32 {
        self.first_key_seed
    }

    pub fn pick_entry<R: Rng>(&self, rng: &mut R) -> usize {
        let row = rng.gen_range(0..self.row_cnt);
        let point = rng.gen_range(0..=self.sample.max_pop_tag);
        row * self.col_cnt + self.pick_column(point)
    }

    fn pick_column(&self, point: i32) -> usize {
        let entries = &self.sample.entries;
        // Tags are strictly increasing, so the owning entry is the first one
        // whose tag is not below the point.
        let col = entries.partition_point(|e| e.pop_tag < point);
        debug_assert!(col < entries.len());
        col
    }

    /// Inverse of `fill_request` for seeds this db handed out.
    pub fn key_seed_to_entry(&self, key_seed: u32) -> Result<usize> {
        key_seed
            .checked_sub(self.first_key_seed)
            .map(|index| index as usize)
            .filter(|&index| index < self.db_size)
            .ok_or_else(|| {
                Error::protocol(format!(
                    "key seed {:08X} outside db [{:08X}, +{})",
                    key_seed, self.first_key_seed, self.db_size
                ))
            })
    }

    pub fn fill_request(&self, r: &mut Request, entry_index: usize) {
        let se = &self.sample.entries[entry_index % self.col_cnt];
        r.key_seed = self.first_key_seed + entry_index as u32;
        r.key_size = se.key_size;
        r.val_size = se.val_size;
        r.vss_size = se.vss_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_mt::Mt64;
    use std::io::Write;

    fn sample(text: &str) -> Result<Sample> {
        Sample::from_reader(text.as_bytes(), "test")
    }

    fn shared(text: &str) -> Arc<Sample> {
        Arc::new(sample(text).unwrap())
    }

    #[test]
    fn tags_are_cumulative_minus_one() {
        let s = sample("8 100 1\n8 50 1\n16 200 3\n").unwrap();
        let tags: Vec<i32> = s.entries.iter().map(|e| e.pop_tag).collect();
        assert_eq!(tags, vec![0, 1, 4]);
        assert_eq!(s.max_pop_tag, 4);
        assert_eq!(s.entries[2].vss_size, 3);
    }

    #[test]
    fn largest_request_per_command() {
        let s = sample("8 100 1
20 60 1
").unwrap();
        assert_eq!(s.max_wire_size(Command::Get), 4 + 20 + 2);
        assert_eq!(s.max_wire_size(Command::Set), 4 + 8 + 5 + 3 + 2 + 100 + 2);
    }

    #[test]
    fn rejects_bad_samples() {
        assert!(matches!(sample("8 100 0\n"), Err(Error::Sample { line: 1, .. })));
        assert!(matches!(sample("8 100 1\n7 100 1\n"), Err(Error::Sample { line: 2, .. })));
        assert!(sample("8 43 1\n").is_err());
        assert!(sample("251 100 1\n").is_err());
        assert!(sample("8 100\n").is_err());
        assert!(sample("8 100 x\n").is_err());
        assert!(sample("").is_err());
        assert!(sample("8 100 2147483647\n8 100 2\n").is_err());
    }

    #[test]
    fn skips_blank_lines() {
        let s = sample("\n8 100 1\n\n8 50 1\n").unwrap();
        assert_eq!(s.entries.len(), 2);
    }

    #[test]
    fn loads_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "8 100 1").unwrap();
        writeln!(f, "8 50 1").unwrap();
        let s = Sample::load(f.path().to_str().unwrap()).unwrap();
        assert_eq!(s.entries.len(), 2);
        assert!(Sample::load("/nonexistent/sample").is_err());
    }

    #[test]
    fn db_size_must_be_a_multiple() {
        let s = shared("8 100 1\n8 50 1\n");
        assert!(MemDb::new(s.clone(), 3, 0).is_err());
        assert!(MemDb::new(s.clone(), 0, 0).is_err());
        assert!(MemDb::new(s, 4, 0).is_ok());
    }

    #[test]
    fn two_by_two_layout() {
        let db = MemDb::new(shared("8 100 1\n8 50 1\n"), 4, 0).unwrap();
        let mut r = Request::default();
        db.fill_request(&mut r, 3);
        assert_eq!(r.key_seed, 3);
        assert_eq!(r.key_size, 8);
        assert_eq!(r.val_size, 50);
        assert_eq!(db.key_seed_to_entry(r.key_seed).unwrap(), 3);

        let mut rng = Mt64::new(11);
        let n = 100_000;
        let second = (0..n).filter(|_| db.pick_entry(&mut rng) % 2 == 1).count();
        assert!((48_000..52_000).contains(&second), "second {}", second);
    }

    #[test]
    fn weighted_pick_converges_to_weights() {
        let db = MemDb::new(shared("8 100 1\n8 100 2\n8 100 7\n"), 30, 1000).unwrap();
        let mut rng = Mt64::new(5);
        let n = 200_000;
        let mut counts = [0usize; 3];
        for _ in 0..n {
            let entry = db.pick_entry(&mut rng);
            assert!(entry < 30);
            counts[entry % 3] += 1;
        }
        for (count, weight) in counts.iter().zip([1.0, 2.0, 7.0]) {
            let share = *count as f64 / n as f64;
            assert!((share - weight / 10.0).abs() < 0.01, "{:?}", counts);
        }
    }

    #[test]
    fn shards_offset_key_seeds() {
        let db = MemDb::new(shared("8 100 1\n8 50 1\n"), 4, 8).unwrap();
        let mut r = Request::default();
        db.fill_request(&mut r, 1);
        assert_eq!(r.key_seed, 9);
        assert_eq!(db.key_seed_to_entry(9).unwrap(), 1);
        assert!(matches!(db.key_seed_to_entry(7), Err(Error::Protocol(_))));
        assert!(matches!(db.key_seed_to_entry(12), Err(Error::Protocol(_))));
    }
}
