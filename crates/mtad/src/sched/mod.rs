use crate::delivery::Delivery;
use crate::entity::{Arena, Domain, DomainId, DomainKey, Host, HostId, RelayId, RouteId, Source, SourceId};
use crate::hoststat::HostStat;
use crate::ipc::{
    ControlRequest, DnsReply, LookupReply, MtaEvent, ParentMsg, Peers, QueueRequest,
    SessionCommand, SessionEvent,
};
use crate::limits::LimitsTable;
use crate::relay::{Relay, RelayKey, RelayStatus, ConnectorFlags};
use crate::route::{Route, RouteFlags};
use crate::waitq::WaitQ;
use runq::{RunQueue, UnixTime};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use tokio::sync::mpsc::UnboundedReceiver;

#[cfg(test)]
mod test;

pub(crate) const MAX_ERROR_PER_HOST: u32 = 4;

pub(crate) const DELAY_CHECK_SOURCE: UnixTime = 1;
pub(crate) const DELAY_CHECK_SOURCE_SLOW: UnixTime = 10;
pub(crate) const DELAY_CHECK_SOURCE_FAST: UnixTime = 0;
pub(crate) const DELAY_CHECK_LIMIT: UnixTime = 5;

pub(crate) const DELAY_ROUTE_BASE: UnixTime = 200;
pub(crate) const DELAY_ROUTE_MAX: UnixTime = 3600 * 4;

pub(crate) const HOSTSTAT_EXPIRE_DELAY: UnixTime = 4 * 3600;

/// Bookkeeping for one spawned session.
pub(crate) struct SessionSlot {
    pub relay: RelayId,
    pub route: RouteId,
    /// Connected and greeted, but not yet carrying a task.
    pub ready: bool,
}

/// The whole outbound transfer state machine. Owned by exactly one
/// task; every handler takes the current time from the event loop so
/// nothing in here consults the clock directly.
pub struct Mta {
    pub(crate) domains: Arena<DomainId, Domain>,
    pub(crate) domain_index: BTreeMap<DomainKey, DomainId>,
    pub(crate) hosts: Arena<HostId, Host>,
    pub(crate) host_index: BTreeMap<IpAddr, HostId>,
    pub(crate) sources: Arena<SourceId, Source>,
    pub(crate) source_index: BTreeMap<Option<IpAddr>, SourceId>,
    pub(crate) relays: Arena<RelayId, Relay>,
    pub(crate) relay_index: BTreeMap<RelayKey, RelayId>,
    pub(crate) routes: Arena<RouteId, Route>,
    pub(crate) route_index: BTreeMap<(SourceId, HostId), RouteId>,

    pub(crate) wait_mx: HashMap<u64, DomainId>,
    pub(crate) wait_secret: HashMap<u64, RelayId>,
    pub(crate) wait_preference: HashMap<u64, RelayId>,
    pub(crate) wait_source: HashMap<u64, RelayId>,
    pub(crate) mx_waiters: WaitQ<DomainId, RelayId>,

    pub(crate) runq_relay: RunQueue<RelayId>,
    pub(crate) runq_connector: RunQueue<(RelayId, SourceId)>,
    pub(crate) runq_route: RunQueue<RouteId>,
    pub(crate) runq_hoststat: RunQueue<String>,

    pub(crate) hoststat: BTreeMap<String, HostStat>,
    pub(crate) sessions: HashMap<u64, SessionSlot>,

    pub(crate) limits: LimitsTable,
    pub(crate) max_seen_conndelay_route: UnixTime,
    pub(crate) max_seen_discdelay_route: UnixTime,

    pub(crate) peers: Peers,
    uid: u64,
    pub(crate) route_seq: u64,

    pub(crate) profiling: u8,
    verbose_hook: Option<Box<dyn Fn(u8) + Send>>,
}

impl Mta {
    pub fn new(limits: LimitsTable, peers: Peers) -> Self {
        Self {
            domains: Arena::default(),
            domain_index: BTreeMap::new(),
            hosts: Arena::default(),
            host_index: BTreeMap::new(),
            sources: Arena::default(),
            source_index: BTreeMap::new(),
            relays: Arena::default(),
            relay_index: BTreeMap::new(),
            routes: Arena::default(),
            route_index: BTreeMap::new(),
            wait_mx: HashMap::new(),
            wait_secret: HashMap::new(),
            wait_preference: HashMap::new(),
            wait_source: HashMap::new(),
            mx_waiters: WaitQ::default(),
            runq_relay: RunQueue::new(),
            runq_connector: RunQueue::new(),
            runq_route: RunQueue::new(),
            runq_hoststat: RunQueue::new(),
            hoststat: BTreeMap::new(),
            sessions: HashMap::new(),
            limits,
            max_seen_conndelay_route: 0,
            max_seen_discdelay_route: 0,
            peers,
            uid: 0,
            route_seq: 0,
            profiling: 0,
            verbose_hook: None,
        }
    }

    /// Register a callback invoked when the parent adjusts log
    /// verbosity.
    pub fn set_verbose_hook(&mut self, hook: Box<dyn Fn(u8) + Send>) {
        self.verbose_hook = Some(hook);
    }

    pub(crate) fn next_uid(&mut self) -> u64 {
        self.uid += 1;
        self.uid
    }

    /// Handle one inbound peer message.
    pub fn dispatch(&mut self, event: MtaEvent, now: UnixTime) {
        match event {
            MtaEvent::Queue(QueueRequest::Transfer(req)) => self.on_transfer(*req, now),
            MtaEvent::Queue(QueueRequest::MessageFd { session, msgid, fd }) => {
                self.peers
                    .session
                    .send(SessionCommand::MessageFd { session, msgid, fd })
                    .ok();
            }

            MtaEvent::Dns(DnsReply::Host {
                reqid,
                addr,
                preference,
            }) => self.on_dns_host(reqid, addr, preference),
            MtaEvent::Dns(DnsReply::HostEnd { reqid, status }) => {
                self.on_dns_host_end(reqid, status, now)
            }
            MtaEvent::Dns(DnsReply::MxPreference {
                reqid,
                status,
                preference,
            }) => {
                let rid = self
                    .wait_preference
                    .remove(&reqid)
                    .expect("preference wait entry");
                self.on_preference(rid, status, preference, now);
            }
            MtaEvent::Dns(DnsReply::Ptr { session, name }) => {
                self.peers
                    .session
                    .send(SessionCommand::Ptr { session, name })
                    .ok();
            }

            MtaEvent::Lookup(LookupReply::Secret { reqid, secret }) => {
                let rid = self.wait_secret.remove(&reqid).expect("secret wait entry");
                self.on_secret(rid, secret, now);
            }
            MtaEvent::Lookup(LookupReply::Source { reqid, addr }) => {
                let rid = self.wait_source.remove(&reqid).expect("source wait entry");
                let source = addr.map(|ip| self.source_intern(Some(ip)));
                self.on_source(rid, source, now);
            }
            MtaEvent::Lookup(LookupReply::Helo { session, name }) => {
                self.peers
                    .session
                    .send(SessionCommand::Helo { session, name })
                    .ok();
            }
            MtaEvent::Lookup(LookupReply::SslInit { session }) => {
                self.peers
                    .session
                    .send(SessionCommand::SslInit { session })
                    .ok();
            }
            MtaEvent::Lookup(LookupReply::SslVerify { session, ok }) => {
                self.peers
                    .session
                    .send(SessionCommand::SslVerify { session, ok })
                    .ok();
            }

            MtaEvent::Session(event) => self.on_session_event(event, now),

            MtaEvent::Control(ControlRequest::ResumeRoute { id }) => self.resume_route(id, now),
            MtaEvent::Control(ControlRequest::ShowRoutes { reply }) => {
                self.show_routes(&reply, now)
            }
            MtaEvent::Control(ControlRequest::ShowHostStats { reply }) => {
                self.show_hoststats(&reply)
            }

            MtaEvent::Parent(ParentMsg::Verbose { level }) => {
                if let Some(hook) = &self.verbose_hook {
                    hook(level);
                }
            }
            MtaEvent::Parent(ParentMsg::Profile { level }) => {
                self.profiling = level;
            }
        }
    }

    fn on_session_event(&mut self, event: SessionEvent, now: UnixTime) {
        match event {
            SessionEvent::Ready { session } => {
                let Some(slot) = self.sessions.get_mut(&session) else {
                    return;
                };
                if !slot.ready {
                    slot.ready = true;
                    let relay = slot.relay;
                    self.relays.get_mut(relay).nconn_ready += 1;
                }
            }
            SessionEvent::NextTask { session } => {
                let relay = self.sessions.get(&session).map(|slot| slot.relay);
                let task = match relay {
                    Some(relay) => {
                        let task = self.next_task(relay, session);
                        if task.is_some() {
                            metrics::gauge!("mta.task").decrement(1.0);
                            let slot = self.sessions.get_mut(&session).expect("session slot");
                            if slot.ready {
                                slot.ready = false;
                                self.relays.get_mut(relay).nconn_ready -= 1;
                            }
                        }
                        task
                    }
                    None => None,
                };
                self.peers
                    .session
                    .send(SessionCommand::Task { session, task })
                    .ok();
            }
            SessionEvent::RouteOk { session } => self.route_ok(session, now),
            SessionEvent::RouteDown { session } => self.route_down(session, now),
            SessionEvent::RouteError { session, error } => self.route_error(session, &error),
            SessionEvent::SourceError { session, error } => self.source_error(session, &error),
            SessionEvent::Delivery {
                session,
                envelope,
                sender,
                delivery,
                status,
            } => {
                let (source, relay, penalty) = match self.sessions.get(&session) {
                    Some(&SessionSlot { relay, route, .. }) => (
                        Some(self.source_to_text(self.routes.get(route).src)),
                        self.domains
                            .get(self.relays.get(relay).key.domain)
                            .key
                            .name
                            .clone(),
                        self.routes.get(route).penalty,
                    ),
                    None => (None, "-".to_string(), 0),
                };
                self.delivery(
                    &envelope,
                    &sender,
                    source.as_deref(),
                    &relay,
                    delivery,
                    &status,
                    penalty,
                    now,
                );
                metrics::gauge!("mta.envelope").decrement(1.0);

                if let Some((_, domain)) = envelope.dest.split_once('@') {
                    let domain = domain.to_string();
                    match delivery {
                        Delivery::Ok => {
                            // The peer works again: replay whatever it
                            // had deferred.
                            self.hoststat_update(&domain, &status, now);
                            self.hoststat_uncache(&domain, envelope.id);
                            self.hoststat_reschedule(&domain);
                        }
                        Delivery::TempFail => self.hoststat_update(&domain, &status, now),
                        Delivery::PermFail => self.hoststat_uncache(&domain, envelope.id),
                        Delivery::Loop => {}
                    }
                }
            }
            SessionEvent::Collect { session } => self.route_collect(session, now),
        }
    }

    /// Fire every run-queue entry whose deadline has passed.
    pub fn tick(&mut self, now: UnixTime) {
        for rid in self.runq_relay.pop_due(now) {
            tracing::debug!("mta: ... timeout for {}", self.relay_to_text(rid));
            self.relays.get_mut(rid).status -= RelayStatus::WAIT_CONNECTOR;
            self.drain(rid, now);
            self.relay_unref(rid);
        }
        for (rid, sid) in self.runq_connector.pop_due(now) {
            tracing::debug!("mta: ... timeout for {}", self.connector_to_text(rid, sid));
            self.relays
                .get_mut(rid)
                .connectors
                .get_mut(&sid)
                .expect("connector exists while scheduled")
                .flags -= ConnectorFlags::WAIT;
            self.connect(rid, sid, now);
        }
        for route in self.runq_route.pop_due(now) {
            self.routes.get_mut(route).flags -= RouteFlags::RUNQ;
            self.route_enable(route, now);
            self.route_unref(route, now);
        }
        for name in self.runq_hoststat.pop_due(now) {
            self.hoststat_expire(&name);
        }
    }

    /// Earliest deadline over all four run-queues.
    pub fn next_deadline(&self) -> Option<UnixTime> {
        [
            self.runq_relay.next_deadline(),
            self.runq_connector.next_deadline(),
            self.runq_route.next_deadline(),
            self.runq_hoststat.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

pub fn unix_now() -> UnixTime {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock after epoch")
        .as_secs() as UnixTime
}

/// Event dispatch loop: one exclusive owner of the state machine,
/// woken by peer messages and run-queue deadlines.
pub async fn run(mut mta: Mta, mut events: UnboundedReceiver<MtaEvent>) {
    loop {
        let now = unix_now();
        mta.tick(now);

        let sleep = mta
            .next_deadline()
            .map(|deadline| std::time::Duration::from_secs((deadline - now).max(0) as u64));

        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => mta.dispatch(event, unix_now()),
                    None => break,
                }
            }
            _ = async {
                match sleep {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending().await,
                }
            } => {}
        }
    }
}

#[cfg(test)]
pub(crate) mod test_rig {
    use super::Mta;
    use crate::ipc::{
        peer_channels, DnsRequest, LookupRequest, MtaEvent, PeerEndpoints, QueueNotice,
        SessionCommand,
    };
    use crate::limits::LimitsTable;
    use tokio::sync::mpsc::UnboundedReceiver;

    pub(crate) struct Rig {
        pub mta: Mta,
        pub queue: UnboundedReceiver<QueueNotice>,
        pub dns: UnboundedReceiver<DnsRequest>,
        pub lookup: UnboundedReceiver<LookupRequest>,
        pub session: UnboundedReceiver<SessionCommand>,
        _events: tokio::sync::mpsc::UnboundedSender<MtaEvent>,
    }

    pub(crate) fn rig() -> Rig {
        rig_with(LimitsTable::default())
    }

    pub(crate) fn rig_with(limits: LimitsTable) -> Rig {
        let (peers, _event_rx, endpoints) = peer_channels();
        let PeerEndpoints {
            events,
            queue,
            dns,
            lookup,
            session,
        } = endpoints;
        Rig {
            mta: Mta::new(limits, peers),
            queue,
            dns,
            lookup,
            session,
            _events: events,
        }
    }
}
