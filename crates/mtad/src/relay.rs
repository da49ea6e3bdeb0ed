use crate::delivery::Delivery;
use crate::entity::{DomainId, Mx, SourceId};
use crate::ipc::{DnsRequest, DnsStatus, LookupRequest, TransferRequest};
use crate::limits::LimitProfile;
use crate::sched::{Mta, DELAY_CHECK_SOURCE, DELAY_CHECK_SOURCE_FAST, DELAY_CHECK_SOURCE_SLOW};
use runq::UnixTime;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

bitflags::bitflags! {
    /// How the queue asked us to conduct the dialog.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct RelayFlags: u32 {
        const STARTTLS = 0x01;
        const SMTPS = 0x02;
        const TLS_OPTIONAL = 0x04;
        const AUTH = 0x08;
        /// Destination is an explicit relay host, not an MX-resolved domain.
        const MX = 0x10;
        /// We are a backup MX for the destination domain.
        const BACKUP = 0x20;
    }

    /// Outstanding asynchronous queries gating the drain loop.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct RelayStatus: u8 {
        const WAIT_MX = 0x01;
        const WAIT_PREFERENCE = 0x02;
        const WAIT_SECRET = 0x04;
        const WAIT_SOURCE = 0x08;
        const WAIT_CONNECTOR = 0x10;
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ConnectorFlags: u16 {
        const NEW = 0x01;
        const WAIT = 0x02;

        const ERROR_FAMILY = 0x10;
        const ERROR_SOURCE = 0x20;
        const ERROR_MX = 0x40;
        const ERROR_ROUTE_NET = 0x80;
        const ERROR_ROUTE_SMTP = 0x100;
        const ERROR_ROUTE = 0x80 | 0x100;
        const ERROR = 0x10 | 0x20 | 0x40 | 0x80 | 0x100;
    }

    /// Which admission limit classes blocked a connection attempt.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct LimitMask: u8 {
        const DOMAIN = 0x01;
        const SOURCE = 0x02;
        const CONNECTOR = 0x04;
        const RELAY = 0x08;
        const ROUTE = 0x10;
        const HOST = 0x20;
    }
}

/// Relay identity. Comparison is null-sensitive on the optional table
/// names so that, say, an authenticated and an anonymous relay to the
/// same domain stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RelayKey {
    pub domain: DomainId,
    pub flags: RelayFlags,
    pub port: u16,
    pub authtable: Option<String>,
    pub authlabel: Option<String>,
    pub sourcetable: Option<String>,
    pub cert: Option<String>,
    pub backupname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: u64,
    pub creation: UnixTime,
    pub dest: String,
    /// Original recipient, when distinct from the destination.
    pub rcpt: Option<String>,
    /// Session the envelope was handed to; 0 until dispatched.
    pub session: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub msgid: u32,
    pub sender: String,
    pub envelopes: Vec<Envelope>,
}

/// Per-(relay, source) admission state.
pub struct Connector {
    pub source: SourceId,
    pub flags: ConnectorFlags,
    pub nconn: usize,
    pub lastconn: UnixTime,
}

pub struct Relay {
    /// Generation id; also the request id for this relay's lookups.
    pub id: u64,
    pub key: RelayKey,
    /// Not part of the identity; forwarded to sessions for HELO lookup.
    pub helotable: Option<String>,
    pub refcount: u32,
    pub status: RelayStatus,
    pub tasks: VecDeque<Task>,
    pub ntask: usize,
    pub secret: Option<String>,
    /// Our own preference in the destination's MX list; None until
    /// resolved for a backup relay.
    pub backuppref: Option<i32>,
    pub limits: Option<Arc<LimitProfile>>,
    pub connectors: BTreeMap<SourceId, Connector>,
    pub nconn: usize,
    pub nconn_ready: usize,
    pub lastconn: UnixTime,
    pub fail: Option<(Delivery, String)>,
    pub lastsource: UnixTime,
    pub nextsource: UnixTime,
    pub sourceloop: usize,
}

impl Mta {
    /// Intern the relay an envelope must be sent through. The returned
    /// id carries a held reference.
    pub(crate) fn relay_intern(&mut self, req: &TransferRequest) -> crate::entity::RelayId {
        let spec = &req.relay;
        let mut flags = spec.flags;
        let (domain, backupname) = if spec.flags.contains(RelayFlags::BACKUP) {
            (
                self.domain_intern(&req.dest.domain, false),
                spec.hostname.clone(),
            )
        } else if let Some(hostname) = &spec.hostname {
            flags |= RelayFlags::MX;
            (self.domain_intern(hostname, true), None)
        } else {
            flags |= RelayFlags::TLS_OPTIONAL;
            (self.domain_intern(&req.dest.domain, false), None)
        };

        let key = RelayKey {
            domain,
            flags,
            port: spec.port,
            authtable: spec.authtable.clone(),
            authlabel: spec.authlabel.clone(),
            sourcetable: spec.sourcetable.clone(),
            cert: spec.cert.clone(),
            backupname,
        };

        if let Some(&rid) = self.relay_index.get(&key) {
            // The relay already holds its domain reference.
            self.domain_unref(domain);
            self.relays.get_mut(rid).refcount += 1;
            return rid;
        }

        let id = self.next_uid();
        let rid = self.relays.insert(Relay {
            id,
            key: key.clone(),
            helotable: spec.helotable.clone(),
            refcount: 1,
            status: RelayStatus::empty(),
            tasks: VecDeque::new(),
            ntask: 0,
            secret: None,
            backuppref: None,
            limits: None,
            connectors: BTreeMap::new(),
            nconn: 0,
            nconn_ready: 0,
            lastconn: 0,
            fail: None,
            lastsource: 0,
            nextsource: 0,
            sourceloop: 0,
        });
        self.relay_index.insert(key, rid);
        metrics::gauge!("mta.relay").increment(1.0);
        rid
    }

    pub(crate) fn relay_ref(&mut self, rid: crate::entity::RelayId) {
        self.relays.get_mut(rid).refcount += 1;
    }

    pub(crate) fn relay_unref(&mut self, rid: crate::entity::RelayId) {
        let relay = self.relays.get_mut(rid);
        relay.refcount -= 1;
        if relay.refcount > 0 {
            return;
        }

        tracing::debug!("freeing {}", self.relay_to_text(rid));
        let relay = self.relays.remove(rid);
        for (sid, connector) in relay.connectors {
            if connector.flags.contains(ConnectorFlags::WAIT) {
                self.runq_connector.cancel(&(rid, sid));
            }
            self.source_unref(sid);
            metrics::gauge!("mta.connector").decrement(1.0);
        }
        self.relay_index.remove(&relay.key);
        self.domain_unref(relay.key.domain);
        metrics::gauge!("mta.relay").decrement(1.0);
    }

    pub(crate) fn relay_to_text(&self, rid: crate::entity::RelayId) -> String {
        let relay = self.relays.get(rid);
        let domain = self.domains.get(relay.key.domain);
        let mut text = format!("[relay:{}", domain.key.name);
        if relay.key.port != 0 {
            text.push_str(&format!(",port={}", relay.key.port));
        }
        if relay.key.flags.contains(RelayFlags::STARTTLS) {
            text.push_str(",starttls");
        }
        if relay.key.flags.contains(RelayFlags::SMTPS) {
            text.push_str(",smtps");
        }
        if relay.key.flags.contains(RelayFlags::AUTH) {
            text.push_str(&format!(
                ",auth={}:{}",
                relay.key.authtable.as_deref().unwrap_or(""),
                relay.key.authlabel.as_deref().unwrap_or(""),
            ));
        }
        if let Some(cert) = &relay.key.cert {
            text.push_str(&format!(",cert={cert}"));
        }
        if relay.key.flags.contains(RelayFlags::MX) {
            text.push_str(",mx");
        }
        if let Some(backup) = &relay.key.backupname {
            text.push_str(&format!(",backup={backup}"));
        }
        if let Some(table) = &relay.key.sourcetable {
            text.push_str(&format!(",sourcetable={table}"));
        }
        text.push(']');
        text
    }

    /// An envelope arrived from the queue.
    pub(crate) fn on_transfer(&mut self, req: TransferRequest, now: UnixTime) {
        let rid = self.relay_intern(&req);
        let msgid = (req.id >> 32) as u32;

        let dest = req.dest.to_string();
        let rcpt = Some(req.rcpt.to_string()).filter(|r| *r != dest);
        let sender = if req.sender.is_empty() {
            String::new()
        } else {
            req.sender.to_string()
        };

        let relay = self.relays.get_mut(rid);
        if !relay.tasks.iter().any(|task| task.msgid == msgid) {
            relay.tasks.push_back(Task {
                msgid,
                sender,
                envelopes: vec![],
            });
            relay.ntask += 1;
            metrics::gauge!("mta.task").increment(1.0);
        }
        let task = relay
            .tasks
            .iter_mut()
            .find(|task| task.msgid == msgid)
            .expect("task just ensured");
        tracing::debug!("mta: received evp:{:016x} for <{dest}>", req.id);
        task.envelopes.push(Envelope {
            id: req.id,
            creation: req.creation,
            dest,
            rcpt,
            session: 0,
        });
        metrics::gauge!("mta.envelope").increment(1.0);

        self.drain(rid, now);
        self.relay_unref(rid);
    }

    /// Advance the relay state machine: flush on terminal failure, fan
    /// out the queries whose preconditions hold, then either consume a
    /// source candidate or wait for the next slot.
    pub(crate) fn drain(&mut self, rid: crate::entity::RelayId, now: UnixTime) {
        {
            let relay = self.relays.get(rid);
            tracing::debug!(
                "mta: draining {} refcount={}, ntask={}, nconnector={}, nconn={}",
                self.relay_to_text(rid),
                relay.refcount,
                relay.ntask,
                relay.connectors.len(),
                relay.nconn,
            );
            if relay.ntask == 0 {
                tracing::debug!("mta: all done for {}", self.relay_to_text(rid));
                return;
            }
        }

        if let Some((kind, error)) = self.relays.get(rid).fail.clone() {
            self.flush(rid, kind, &error, now);
            return;
        }

        let needs_secret = {
            let relay = self.relays.get(rid);
            relay.key.flags.contains(RelayFlags::AUTH) && relay.secret.is_none()
        };
        if needs_secret {
            self.query_secret(rid);
        }

        let needs_preference = {
            let relay = self.relays.get(rid);
            relay.key.backupname.is_some() && relay.backuppref.is_none()
        };
        if needs_preference {
            self.query_preference(rid);
        }

        let needs_mx = {
            let relay = self.relays.get(rid);
            self.domains.get(relay.key.domain).last_mx_query.is_none()
        };
        if needs_mx {
            self.query_mx(rid);
        }

        if self.relays.get(rid).limits.is_none() {
            self.query_limits(rid);
        }

        let status = self.relays.get(rid).status;
        if !status.is_empty() {
            let mut waiting = String::new();
            if status.contains(RelayStatus::WAIT_MX) {
                waiting.push_str(" MX");
            }
            if status.contains(RelayStatus::WAIT_PREFERENCE) {
                waiting.push_str(" preference");
            }
            if status.contains(RelayStatus::WAIT_SECRET) {
                waiting.push_str(" secret");
            }
            if status.contains(RelayStatus::WAIT_SOURCE) {
                waiting.push_str(" source");
            }
            if status.contains(RelayStatus::WAIT_CONNECTOR) {
                waiting.push_str(" connector");
            }
            tracing::debug!("mta: {} waiting for{waiting}", self.relay_to_text(rid));
            return;
        }

        let nextsource = self.relays.get(rid).nextsource;
        if nextsource <= now {
            self.query_source(rid, now);
        } else {
            tracing::debug!(
                "mta: scheduling relay {} in {}s...",
                self.relay_to_text(rid),
                nextsource - now
            );
            self.runq_relay.schedule(nextsource, rid);
            self.relays.get_mut(rid).status |= RelayStatus::WAIT_CONNECTOR;
            self.relay_ref(rid);
        }
    }

    /// Report a terminal verdict for every pending envelope and drop
    /// the task list.
    pub(crate) fn flush(
        &mut self,
        rid: crate::entity::RelayId,
        kind: Delivery,
        error: &str,
        now: UnixTime,
    ) {
        tracing::debug!(
            "mta_flush({}, {kind:?}, \"{error}\")",
            self.relay_to_text(rid)
        );
        if !matches!(kind, Delivery::TempFail | Delivery::PermFail) {
            panic!("unexpected delivery status {kind:?}");
        }

        let relay_name = {
            let relay = self.relays.get(rid);
            self.domains.get(relay.key.domain).key.name.clone()
        };
        let all_connectors_route_error = {
            let relay = self.relays.get(rid);
            relay
                .connectors
                .values()
                .filter(|c| c.flags.intersects(ConnectorFlags::ERROR_ROUTE))
                .count()
                == relay.connectors.len()
        };

        let relay = self.relays.get_mut(rid);
        let tasks = std::mem::take(&mut relay.tasks);
        let ntask = relay.ntask;
        relay.ntask = 0;

        let mut nenvelope = 0usize;
        for task in tasks {
            for envelope in task.envelopes {
                let dest_domain = envelope
                    .dest
                    .split_once('@')
                    .map(|(_, domain)| domain.to_string());
                self.delivery(&envelope, &task.sender, None, &relay_name, kind, error, 0, now);
                if matches!(kind, Delivery::TempFail) && all_connectors_route_error {
                    // The whole destination is suspended; remember the
                    // envelope so it can be replayed when the peer
                    // recovers.
                    if let Some(domain) = dest_domain {
                        self.hoststat_cache(&domain, envelope.id, now);
                    }
                }
                nenvelope += 1;
            }
        }

        metrics::gauge!("mta.task").decrement(ntask as f64);
        metrics::gauge!("mta.envelope").decrement(nenvelope as f64);
    }

    fn query_mx(&mut self, rid: crate::entity::RelayId) {
        if self.relays.get(rid).status.contains(RelayStatus::WAIT_MX) {
            return;
        }
        tracing::debug!("mta: querying MX for {}...", self.relay_to_text(rid));

        let did = self.relays.get(rid).key.domain;
        if self.mx_waiters.wait(did, rid) {
            let reqid = self.next_uid();
            self.wait_mx.insert(reqid, did);
            let domain = self.domains.get(did);
            let request = if domain.key.mx_target {
                DnsRequest::QueryHost {
                    reqid,
                    host: domain.key.name.clone(),
                }
            } else {
                DnsRequest::QueryMx {
                    reqid,
                    domain: domain.key.name.clone(),
                }
            };
            self.peers.dns.send(request).ok();
        }
        self.relays.get_mut(rid).status |= RelayStatus::WAIT_MX;
        self.relay_ref(rid);
    }

    fn query_secret(&mut self, rid: crate::entity::RelayId) {
        if self
            .relays
            .get(rid)
            .status
            .contains(RelayStatus::WAIT_SECRET)
        {
            return;
        }
        tracing::debug!("mta: querying secret for {}...", self.relay_to_text(rid));

        let relay = self.relays.get(rid);
        let reqid = relay.id;
        let table = relay.key.authtable.clone().unwrap_or_default();
        let label = relay.key.authlabel.clone().unwrap_or_default();
        self.wait_secret.insert(reqid, rid);
        self.relays.get_mut(rid).status |= RelayStatus::WAIT_SECRET;
        self.peers
            .lookup
            .send(LookupRequest::Secret {
                reqid,
                table,
                label,
            })
            .ok();
        self.relay_ref(rid);
    }

    fn query_preference(&mut self, rid: crate::entity::RelayId) {
        if self
            .relays
            .get(rid)
            .status
            .contains(RelayStatus::WAIT_PREFERENCE)
        {
            return;
        }
        tracing::debug!(
            "mta: querying preference for {}...",
            self.relay_to_text(rid)
        );

        let relay = self.relays.get(rid);
        let reqid = relay.id;
        let domain = self.domains.get(relay.key.domain).key.name.clone();
        let mx = relay
            .key
            .backupname
            .clone()
            .expect("backup relay has a backup name");
        self.wait_preference.insert(reqid, rid);
        self.relays.get_mut(rid).status |= RelayStatus::WAIT_PREFERENCE;
        self.peers
            .dns
            .send(DnsRequest::QueryMxPreference { reqid, domain, mx })
            .ok();
        self.relay_ref(rid);
    }

    fn query_limits(&mut self, rid: crate::entity::RelayId) {
        let name = {
            let relay = self.relays.get(rid);
            self.domains.get(relay.key.domain).key.name.clone()
        };
        let profile = self.limits.lookup(&name);

        let conndelay = crate::limits::delay_secs(profile.conndelay_route);
        if conndelay > self.max_seen_conndelay_route {
            self.max_seen_conndelay_route = conndelay;
        }
        let discdelay = crate::limits::delay_secs(profile.discdelay_route);
        if discdelay > self.max_seen_discdelay_route {
            self.max_seen_discdelay_route = discdelay;
        }

        self.relays.get_mut(rid).limits = Some(profile);
    }

    fn query_source(&mut self, rid: crate::entity::RelayId, now: UnixTime) {
        tracing::debug!("mta: querying source for {}...", self.relay_to_text(rid));

        self.relays.get_mut(rid).sourceloop += 1;

        match self.relays.get(rid).key.sourcetable.clone() {
            None => {
                // No source table: synthesize the single OS-default
                // source and take the reply path inline. This recurses
                // into drain at most once since the next candidate is
                // never queried immediately.
                self.relay_ref(rid);
                let sid = self.source_intern(None);
                self.on_source(rid, Some(sid), now);
            }
            Some(table) => {
                let reqid = self.relays.get(rid).id;
                self.peers
                    .lookup
                    .send(LookupRequest::Source { reqid, table })
                    .ok();
                self.wait_source.insert(reqid, rid);
                self.relays.get_mut(rid).status |= RelayStatus::WAIT_SOURCE;
                self.relay_ref(rid);
            }
        }
    }

    /// A DNS host record arrived for an MX query: insert it into the
    /// domain's list, keeping preferences ascending.
    pub(crate) fn on_dns_host(&mut self, reqid: u64, addr: std::net::IpAddr, preference: i32) {
        let did = *self.wait_mx.get(&reqid).expect("mx wait entry");
        let host = self.host_intern(addr);
        let domain = self.domains.get_mut(did);
        match domain
            .mxs
            .iter()
            .position(|mx| mx.preference > preference)
        {
            Some(at) => domain.mxs.insert(at, Mx { host, preference }),
            None => domain.mxs.push(Mx { host, preference }),
        }
    }

    pub(crate) fn on_dns_host_end(&mut self, reqid: u64, status: DnsStatus, now: UnixTime) {
        let did = self.wait_mx.remove(&reqid).expect("mx wait entry");
        {
            let domain = self.domains.get_mut(did);
            domain.mx_status = status;
            domain.last_mx_query = Some(now);
        }
        let domain = self.domains.get(did);
        if status == DnsStatus::Ok {
            tracing::debug!("MXs for domain {}:", domain.key.name);
            for mx in &domain.mxs {
                tracing::debug!(
                    "	{} preference {}",
                    self.host_to_text(mx.host),
                    mx.preference
                );
            }
        } else {
            tracing::debug!("Failed MX query for {}:", domain.key.name);
        }

        for rid in self.mx_waiters.run(&did) {
            self.on_mx(rid, did, now);
        }
    }

    fn on_mx(&mut self, rid: crate::entity::RelayId, did: DomainId, now: UnixTime) {
        tracing::debug!(
            "mta: ... got mx ({}, {})",
            self.domains.get(did).key.name,
            self.relay_to_text(rid)
        );

        let fail = match self.domains.get(did).mx_status {
            DnsStatus::Ok => None,
            DnsStatus::Retry => Some((Delivery::TempFail, "Temporary failure in MX lookup")),
            DnsStatus::Invalid => Some((Delivery::PermFail, "Invalid domain name")),
            DnsStatus::NoName => Some((Delivery::PermFail, "Domain does not exist")),
            DnsStatus::NotFound => Some((Delivery::TempFail, "No MX found for domain")),
        };
        if let Some((kind, error)) = fail {
            tracing::info!(
                "smtp-out: Failed to resolve MX for {}: {error}",
                self.relay_to_text(rid)
            );
            self.relays.get_mut(rid).fail = Some((kind, error.to_string()));
        }

        self.relays.get_mut(rid).status -= RelayStatus::WAIT_MX;
        self.drain(rid, now);
        self.relay_unref(rid);
    }

    pub(crate) fn on_secret(
        &mut self,
        rid: crate::entity::RelayId,
        secret: Option<String>,
        now: UnixTime,
    ) {
        tracing::debug!("mta: ... got secret for {}", self.relay_to_text(rid));

        let relay = self.relays.get_mut(rid);
        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            relay.secret = Some(secret);
        }
        if relay.secret.is_none() {
            tracing::warn!(
                "Failed to retrieve secret for {}",
                self.relay_to_text(rid)
            );
            self.relays.get_mut(rid).fail = Some((
                Delivery::TempFail,
                "Could not retrieve credentials".to_string(),
            ));
        }

        self.relays.get_mut(rid).status -= RelayStatus::WAIT_SECRET;
        self.drain(rid, now);
        self.relay_unref(rid);
    }

    pub(crate) fn on_preference(
        &mut self,
        rid: crate::entity::RelayId,
        status: DnsStatus,
        preference: i32,
        now: UnixTime,
    ) {
        if status != DnsStatus::Ok {
            tracing::warn!(
                "Couldn't find backup preference for {}",
                self.relay_to_text(rid)
            );
            self.relays.get_mut(rid).backuppref = Some(i32::MAX);
        } else {
            tracing::debug!(
                "mta: ... got preference for {}: {preference}",
                self.relay_to_text(rid)
            );
            self.relays.get_mut(rid).backuppref = Some(preference);
        }

        self.relays.get_mut(rid).status -= RelayStatus::WAIT_PREFERENCE;
        self.drain(rid, now);
        self.relay_unref(rid);
    }

    /// A source candidate arrived (or the lookup failed). Feed it to
    /// the connector layer, then decide whether the relay has run out
    /// of usable sources.
    pub(crate) fn on_source(
        &mut self,
        rid: crate::entity::RelayId,
        source: Option<SourceId>,
        now: UnixTime,
    ) {
        tracing::debug!(
            "mta: ... got source for {}: {}",
            self.relay_to_text(rid),
            match source {
                Some(sid) => self.source_to_text(sid),
                None => "NULL".to_string(),
            }
        );

        self.relays.get_mut(rid).lastsource = now;
        let mut delay = DELAY_CHECK_SOURCE_SLOW;

        if let Some(sid) = source {
            self.connector(rid, sid);
            {
                let connector = self
                    .relays
                    .get_mut(rid)
                    .connectors
                    .get_mut(&sid)
                    .expect("connector just ensured");
                if connector.flags.contains(ConnectorFlags::NEW) {
                    connector.flags -= ConnectorFlags::NEW;
                    delay = DELAY_CHECK_SOURCE;
                }
            }
            self.connect(rid, sid, now);

            let flags = self
                .relays
                .get(rid)
                .connectors
                .get(&sid)
                .expect("connector outlives connect")
                .flags;
            if flags.intersects(ConnectorFlags::ERROR) {
                delay = DELAY_CHECK_SOURCE_FAST;
            } else {
                self.relays.get_mut(rid).sourceloop = 0;
            }
            self.source_unref(sid); // from the caller's intern
        } else {
            tracing::warn!(
                "Failed to get source address for {}",
                self.relay_to_text(rid)
            );
        }

        let (nconnector, sourceloop) = {
            let relay = self.relays.get(rid);
            (relay.connectors.len(), relay.sourceloop)
        };
        if nconnector == 0 {
            self.relays.get_mut(rid).fail = Some((
                Delivery::TempFail,
                "Could not retrieve source address".to_string(),
            ));
        }
        if nconnector < sourceloop {
            // Every distinct source has been tried without progress;
            // pick the most telling error accumulated on the connectors.
            let mut errmask = ConnectorFlags::empty();
            for connector in self.relays.get(rid).connectors.values() {
                errmask |= connector.flags;
            }
            let error = if errmask.intersects(ConnectorFlags::ERROR_ROUTE_SMTP) {
                "Destination seem to reject all mails"
            } else if errmask.intersects(ConnectorFlags::ERROR_ROUTE_NET) {
                "Network error on destination MXs"
            } else if errmask.intersects(ConnectorFlags::ERROR_MX) {
                "No MX found for destination"
            } else if errmask.intersects(ConnectorFlags::ERROR_FAMILY) {
                "Address family mismatch on destination MXs"
            } else {
                "No valid route to destination"
            };
            self.relays.get_mut(rid).fail = Some((Delivery::TempFail, error.to_string()));
        }

        let relay = self.relays.get_mut(rid);
        relay.nextsource = relay.lastsource + delay;
        relay.status -= RelayStatus::WAIT_SOURCE;
        self.drain(rid, now);
        self.relay_unref(rid);
    }

    /// Hand the next pending task to a session. Envelopes are stamped
    /// with the session id that owns them from here on.
    pub(crate) fn next_task(&mut self, rid: crate::entity::RelayId, session: u64) -> Option<Task> {
        let relay = self.relays.get_mut(rid);
        let mut task = relay.tasks.pop_front()?;
        relay.ntask -= 1;
        for envelope in &mut task.envelopes {
            envelope.session = session;
        }
        Some(task)
    }
}
