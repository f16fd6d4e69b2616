//! Thread hosts: the cores this process may run on, in id order.

use core_affinity::CoreId;
use tracing::warn;

pub struct ThreadHosts {
    cores: Vec<CoreId>,
}

impl ThreadHosts {
    pub fn discover() -> ThreadHosts {
        let mut cores = core_affinity::get_core_ids().unwrap_or_default();
        cores.sort_by_key(|c| c.id);
        if cores.len() % 2 != 0 {
            warn!(
                thread_hosts = cores.len(),
                "odd number of thread hosts, the last one stays idle"
            );
        }
        ThreadHosts { cores }
    }

    #[cfg(test)]
    fn from_ids(ids: &[usize]) -> ThreadHosts {
        ThreadHosts {
            cores: ids.iter().map(|&id| CoreId { id }).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    /// Send/receive thread pairs that fit, never less than one.
    pub fn pairs(&self) -> usize {
        (self.cores.len() / 2).max(1)
    }

    /// Pins the calling thread to thread host `host_id`. Hosts beyond the
    /// available cores leave the thread unpinned.
    pub fn pin_current(&self, host_id: usize) {
        match self.cores.get(host_id) {
            Some(core) => {
                if !core_affinity::set_for_current(*core) {
                    warn!(host_id, cpu = core.id, "can't pin thread");
                }
            }
            None => warn!(host_id, "no core for thread host, running unpinned"),
        }
    }
}
