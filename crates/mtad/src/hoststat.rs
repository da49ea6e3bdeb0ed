use crate::ipc::QueueNotice;
use crate::sched::{Mta, HOSTSTAT_EXPIRE_DELAY};
use runq::UnixTime;
use std::collections::BTreeSet;

/// Per-hostname memory of the last delivery error and the envelopes it
/// deferred. Entries expire after four hours without an update.
pub struct HostStat {
    pub error: String,
    pub tm: UnixTime,
    pub deferred: BTreeSet<u64>,
}

impl Mta {
    /// Refresh the entry for `host` and rearm its expiry.
    pub(crate) fn hoststat_update(&mut self, host: &str, error: &str, now: UnixTime) {
        let name = host.to_ascii_lowercase();
        let stat = self.hoststat.entry(name.clone()).or_insert_with(|| HostStat {
            error: String::new(),
            tm: now,
            deferred: BTreeSet::new(),
        });
        stat.error = error.to_string();
        stat.tm = now;
        self.runq_hoststat.schedule(now + HOSTSTAT_EXPIRE_DELAY, name);
    }

    /// Remember an envelope deferred by this host so it can be replayed
    /// when the peer recovers.
    pub(crate) fn hoststat_cache(&mut self, host: &str, evpid: u64, now: UnixTime) {
        let name = host.to_ascii_lowercase();
        let created = !self.hoststat.contains_key(&name);
        let stat = self.hoststat.entry(name.clone()).or_insert_with(|| HostStat {
            error: String::new(),
            tm: now,
            deferred: BTreeSet::new(),
        });
        stat.deferred.insert(evpid);
        if created {
            self.runq_hoststat.schedule(now + HOSTSTAT_EXPIRE_DELAY, name);
        }
    }

    pub(crate) fn hoststat_uncache(&mut self, host: &str, evpid: u64) {
        if let Some(stat) = self.hoststat.get_mut(&host.to_ascii_lowercase()) {
            stat.deferred.remove(&evpid);
        }
    }

    /// Ask the queue to re-dispatch every envelope deferred by this
    /// host.
    pub(crate) fn hoststat_reschedule(&mut self, host: &str) {
        let name = host.to_ascii_lowercase();
        let Some(stat) = self.hoststat.get_mut(&name) else {
            return;
        };
        for evpid in std::mem::take(&mut stat.deferred) {
            self.peers.queue.send(QueueNotice::Schedule { evpid }).ok();
        }
    }

    /// Expiry timer fired: forget the entry entirely.
    pub(crate) fn hoststat_expire(&mut self, name: &str) {
        tracing::debug!("mta: ... timeout for hoststat {name}");
        self.hoststat.remove(name);
    }
}
