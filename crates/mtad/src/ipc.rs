use crate::delivery::Delivery;
use crate::relay::{Envelope, RelayFlags, Task};
use runq::UnixTime;
use std::net::IpAddr;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Result of a DNS lookup, as reported by the resolver peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsStatus {
    Ok,
    Retry,
    Invalid,
    NoName,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAddr {
    pub user: String,
    pub domain: String,
}

impl MailAddr {
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.domain.is_empty()
    }
}

impl std::fmt::Display for MailAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.domain)
    }
}

/// How the queue asked us to reach the destination; interned into a
/// relay on receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelaySpec {
    pub hostname: Option<String>,
    pub port: u16,
    pub flags: RelayFlags,
    pub authtable: Option<String>,
    pub authlabel: Option<String>,
    pub sourcetable: Option<String>,
    pub helotable: Option<String>,
    pub cert: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub id: u64,
    pub creation: UnixTime,
    pub sender: MailAddr,
    pub dest: MailAddr,
    pub rcpt: MailAddr,
    pub relay: RelaySpec,
}

/// Queue -> core.
#[derive(Debug)]
pub enum QueueRequest {
    Transfer(Box<TransferRequest>),
    /// Open spool file for a message, requested earlier by a session.
    MessageFd { session: u64, msgid: u32, fd: i32 },
}

/// Core -> queue: the per-envelope verdicts, plus replay requests for
/// envelopes deferred by a suspended host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueNotice {
    Ok {
        evpid: u64,
    },
    TempFail {
        evpid: u64,
        penalty: u32,
        reason: String,
    },
    PermFail {
        evpid: u64,
        reason: String,
    },
    Loop {
        evpid: u64,
    },
    Schedule {
        evpid: u64,
    },
}

/// Core -> resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsRequest {
    QueryMx { reqid: u64, domain: String },
    QueryHost { reqid: u64, host: String },
    QueryMxPreference { reqid: u64, domain: String, mx: String },
}

/// Resolver -> core.
#[derive(Debug)]
pub enum DnsReply {
    /// One MX (or A/AAAA) record; repeated, then closed by `HostEnd`.
    Host {
        reqid: u64,
        addr: IpAddr,
        preference: i32,
    },
    HostEnd {
        reqid: u64,
        status: DnsStatus,
    },
    MxPreference {
        reqid: u64,
        status: DnsStatus,
        preference: i32,
    },
    /// PTR answer for a session; forwarded verbatim.
    Ptr {
        session: u64,
        name: Option<String>,
    },
}

/// Core -> lookup service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupRequest {
    Secret {
        reqid: u64,
        table: String,
        label: String,
    },
    Source {
        reqid: u64,
        table: String,
    },
}

/// Lookup service -> core.
#[derive(Debug)]
pub enum LookupReply {
    Secret {
        reqid: u64,
        secret: Option<String>,
    },
    Source {
        reqid: u64,
        addr: Option<IpAddr>,
    },
    Helo {
        session: u64,
        name: Option<String>,
    },
    SslInit {
        session: u64,
    },
    SslVerify {
        session: u64,
        ok: bool,
    },
}

/// Relay settings a session needs to conduct its dialog.
#[derive(Debug, Clone)]
pub struct SessionRelayInfo {
    pub name: String,
    pub port: u16,
    pub flags: RelayFlags,
    pub secret: Option<String>,
    pub cert: Option<String>,
    pub helotable: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionStart {
    pub session: u64,
    pub relay: SessionRelayInfo,
    pub source: Option<IpAddr>,
    pub destination: IpAddr,
}

/// Core -> session engine.
#[derive(Debug)]
pub enum SessionCommand {
    Start(Box<SessionStart>),
    /// Reply to `SessionEvent::NextTask`; `None` means no work is left.
    Task {
        session: u64,
        task: Option<Task>,
    },
    MessageFd {
        session: u64,
        msgid: u32,
        fd: i32,
    },
    Helo {
        session: u64,
        name: Option<String>,
    },
    SslInit {
        session: u64,
    },
    SslVerify {
        session: u64,
        ok: bool,
    },
    Ptr {
        session: u64,
        name: Option<String>,
    },
}

/// Session engine -> core.
#[derive(Debug)]
pub enum SessionEvent {
    /// The dialog is established and the session can take a task.
    Ready { session: u64 },
    NextTask { session: u64 },
    RouteOk { session: u64 },
    RouteDown { session: u64 },
    RouteError { session: u64, error: String },
    SourceError { session: u64, error: String },
    Delivery {
        session: u64,
        envelope: Envelope,
        sender: String,
        delivery: Delivery,
        status: String,
    },
    /// The session is gone; release its connection accounting.
    Collect { session: u64 },
}

/// Control -> core.
#[derive(Debug)]
pub enum ControlRequest {
    /// Re-enable one route by id, or every route when id is 0.
    ResumeRoute {
        id: u64,
    },
    ShowRoutes {
        reply: UnboundedSender<ControlReply>,
    },
    ShowHostStats {
        reply: UnboundedSender<ControlReply>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Line(String),
    End,
}

/// Parent -> core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentMsg {
    Verbose { level: u8 },
    Profile { level: u8 },
}

/// Everything the core can be woken up with.
#[derive(Debug)]
pub enum MtaEvent {
    Queue(QueueRequest),
    Dns(DnsReply),
    Lookup(LookupReply),
    Session(SessionEvent),
    Control(ControlRequest),
    Parent(ParentMsg),
}

/// Outbound handles to the peer processes. Sends are best-effort: a
/// closed peer channel only happens during shutdown.
pub struct Peers {
    pub queue: UnboundedSender<QueueNotice>,
    pub dns: UnboundedSender<DnsRequest>,
    pub lookup: UnboundedSender<LookupRequest>,
    pub session: UnboundedSender<SessionCommand>,
}

/// The far ends of the peer channels, for whoever embeds the core.
pub struct PeerEndpoints {
    pub events: UnboundedSender<MtaEvent>,
    pub queue: UnboundedReceiver<QueueNotice>,
    pub dns: UnboundedReceiver<DnsRequest>,
    pub lookup: UnboundedReceiver<LookupRequest>,
    pub session: UnboundedReceiver<SessionCommand>,
}

pub fn peer_channels() -> (Peers, UnboundedReceiver<MtaEvent>, PeerEndpoints) {
    let (event_tx, event_rx) = unbounded_channel();
    let (queue_tx, queue_rx) = unbounded_channel();
    let (dns_tx, dns_rx) = unbounded_channel();
    let (lookup_tx, lookup_rx) = unbounded_channel();
    let (session_tx, session_rx) = unbounded_channel();
    (
        Peers {
            queue: queue_tx,
            dns: dns_tx,
            lookup: lookup_tx,
            session: session_tx,
        },
        event_rx,
        PeerEndpoints {
            events: event_tx,
            queue: queue_rx,
            dns: dns_rx,
            lookup: lookup_rx,
            session: session_rx,
        },
    )
}
