use crate::ipc::DnsStatus;
use crate::sched::Mta;
use runq::UnixTime;
use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;

/// Stable handle into one of the entity arenas.
pub trait EntityId: Copy + Eq + Hash {
    fn from_index(index: u32) -> Self;
}

macro_rules! entity_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl crate::entity::EntityId for $name {
            fn from_index(index: u32) -> Self {
                Self(index)
            }
        }
    };
}

entity_id!(DomainId);
entity_id!(HostId);
entity_id!(SourceId);
entity_id!(RelayId);
entity_id!(RouteId);

/// One arena per entity kind. Ids are never reused, so a stale id is a
/// programmer error and lookups panic.
pub struct Arena<I: EntityId, T> {
    slots: HashMap<I, T>,
    next: u32,
}

impl<I: EntityId, T> Default for Arena<I, T> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            next: 0,
        }
    }
}

impl<I: EntityId, T> Arena<I, T> {
    pub fn insert(&mut self, value: T) -> I {
        let id = I::from_index(self.next);
        self.next += 1;
        self.slots.insert(id, value);
        id
    }

    pub fn get(&self, id: I) -> &T {
        self.slots.get(&id).expect("live entity id")
    }

    pub fn get_mut(&mut self, id: I) -> &mut T {
        self.slots.get_mut(&id).expect("live entity id")
    }

    pub fn remove(&mut self, id: I) -> T {
        self.slots.remove(&id).expect("live entity id")
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = I> + '_ {
        self.slots.keys().copied()
    }
}

/// Domains are interned by `(name, mx_target)`: the same name used as a
/// normal MX-resolved destination and as an explicit relay host are two
/// distinct entities with distinct MX lists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DomainKey {
    pub name: String,
    pub mx_target: bool,
}

pub struct Domain {
    pub key: DomainKey,
    pub refcount: u32,
    pub mxs: Vec<Mx>,
    pub last_mx_query: Option<UnixTime>,
    pub mx_status: DnsStatus,
    pub nconn: usize,
    pub lastconn: UnixTime,
}

#[derive(Debug, Clone, Copy)]
pub struct Mx {
    pub host: HostId,
    pub preference: i32,
}

pub struct Host {
    pub addr: IpAddr,
    pub refcount: u32,
    pub ptrname: Option<String>,
    pub nconn: usize,
    pub lastconn: UnixTime,
    pub nerror: u32,
    pub ignore: bool,
}

/// A local address to bind before connecting; `addr == None` is the
/// shared "let the OS choose" source.
pub struct Source {
    pub addr: Option<IpAddr>,
    pub refcount: u32,
    pub nconn: usize,
    pub lastconn: UnixTime,
}

impl Mta {
    pub(crate) fn domain_intern(&mut self, name: &str, mx_target: bool) -> DomainId {
        let key = DomainKey {
            name: name.to_ascii_lowercase(),
            mx_target,
        };
        if let Some(&id) = self.domain_index.get(&key) {
            self.domains.get_mut(id).refcount += 1;
            return id;
        }
        let id = self.domains.insert(Domain {
            key: key.clone(),
            refcount: 1,
            mxs: vec![],
            last_mx_query: None,
            mx_status: DnsStatus::Ok,
            nconn: 0,
            lastconn: 0,
        });
        self.domain_index.insert(key, id);
        metrics::gauge!("mta.domain").increment(1.0);
        id
    }

    pub(crate) fn domain_unref(&mut self, id: DomainId) {
        let domain = self.domains.get_mut(id);
        domain.refcount -= 1;
        if domain.refcount > 0 {
            return;
        }
        let domain = self.domains.remove(id);
        for mx in &domain.mxs {
            self.host_unref(mx.host);
        }
        self.domain_index.remove(&domain.key);
        metrics::gauge!("mta.domain").decrement(1.0);
    }

    pub(crate) fn host_intern(&mut self, addr: IpAddr) -> HostId {
        if let Some(&id) = self.host_index.get(&addr) {
            self.hosts.get_mut(id).refcount += 1;
            return id;
        }
        let id = self.hosts.insert(Host {
            addr,
            refcount: 1,
            ptrname: None,
            nconn: 0,
            lastconn: 0,
            nerror: 0,
            ignore: false,
        });
        self.host_index.insert(addr, id);
        metrics::gauge!("mta.host").increment(1.0);
        id
    }

    pub(crate) fn host_ref(&mut self, id: HostId) {
        self.hosts.get_mut(id).refcount += 1;
    }

    pub(crate) fn host_unref(&mut self, id: HostId) {
        let host = self.hosts.get_mut(id);
        host.refcount -= 1;
        if host.refcount > 0 {
            return;
        }
        let host = self.hosts.remove(id);
        self.host_index.remove(&host.addr);
        metrics::gauge!("mta.host").decrement(1.0);
    }

    pub(crate) fn source_intern(&mut self, addr: Option<IpAddr>) -> SourceId {
        if let Some(&id) = self.source_index.get(&addr) {
            self.sources.get_mut(id).refcount += 1;
            return id;
        }
        let id = self.sources.insert(Source {
            addr,
            refcount: 1,
            nconn: 0,
            lastconn: 0,
        });
        self.source_index.insert(addr, id);
        metrics::gauge!("mta.source").increment(1.0);
        id
    }

    pub(crate) fn source_ref(&mut self, id: SourceId) {
        self.sources.get_mut(id).refcount += 1;
    }

    pub(crate) fn source_unref(&mut self, id: SourceId) {
        let source = self.sources.get_mut(id);
        source.refcount -= 1;
        if source.refcount > 0 {
            return;
        }
        let source = self.sources.remove(id);
        self.source_index.remove(&source.addr);
        metrics::gauge!("mta.source").decrement(1.0);
    }

    pub(crate) fn host_to_text(&self, id: HostId) -> String {
        let host = self.hosts.get(id);
        match &host.ptrname {
            Some(ptr) => format!("{} ({ptr})", host.addr),
            None => host.addr.to_string(),
        }
    }

    pub(crate) fn source_to_text(&self, id: SourceId) -> String {
        match self.sources.get(id).addr {
            Some(addr) => addr.to_string(),
            None => "[]".to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::sched::test_rig::rig;

    #[test]
    fn intern_is_idempotent() {
        let mut rig = rig();
        let a = rig.mta.domain_intern("Example.COM", false);
        let b = rig.mta.domain_intern("example.com", false);
        assert_eq!(a, b);
        assert_eq!(rig.mta.domains.get(a).refcount, 2);

        // The MX-target variant of the same name is a distinct entity.
        let c = rig.mta.domain_intern("example.com", true);
        assert_ne!(a, c);

        rig.mta.domain_unref(b);
        assert_eq!(rig.mta.domains.get(a).refcount, 1);
        rig.mta.domain_unref(a);
        rig.mta.domain_unref(c);
        assert_eq!(rig.mta.domains.len(), 0);
    }

    #[test]
    fn null_source_is_shared() {
        let mut rig = rig();
        let a = rig.mta.source_intern(None);
        let b = rig.mta.source_intern(None);
        assert_eq!(a, b);
        assert_eq!(rig.mta.source_to_text(a), "[]");
        rig.mta.source_unref(a);
        rig.mta.source_unref(b);
        assert_eq!(rig.mta.sources.len(), 0);
    }
}
