use crate::entity::{RelayId, RouteId, SourceId};
use crate::ipc::{SessionCommand, SessionRelayInfo, SessionStart};
use crate::limits::delay_secs;
use crate::relay::{Connector, ConnectorFlags, LimitMask};
use crate::route::RouteFlags;
use crate::sched::{Mta, SessionSlot, DELAY_CHECK_LIMIT};
use runq::UnixTime;

impl Mta {
    /// Get-or-create the admission state for `(relay, source)`. A new
    /// connector takes its own source reference.
    pub(crate) fn connector(&mut self, rid: RelayId, sid: SourceId) {
        if self.relays.get(rid).connectors.contains_key(&sid) {
            return;
        }
        self.source_ref(sid);
        self.relays.get_mut(rid).connectors.insert(
            sid,
            Connector {
                source: sid,
                flags: ConnectorFlags::NEW,
                nconn: 0,
                lastconn: 0,
            },
        );
        metrics::gauge!("mta.connector").increment(1.0);
        tracing::debug!("mta: new {}", self.connector_to_text(rid, sid));
    }

    pub(crate) fn connector_to_text(&self, rid: RelayId, sid: SourceId) -> String {
        let flags = self
            .relays
            .get(rid)
            .connectors
            .get(&sid)
            .map(|c| c.flags.bits())
            .unwrap_or(0);
        format!(
            "[connector:{}->{},0x{:x}]",
            self.source_to_text(sid),
            self.relay_to_text(rid),
            flags,
        )
    }

    /// Try to open connections for a connector, greedily spawning
    /// sessions until an admission gate closes. When nothing can be
    /// opened now, park the connector on its run-queue.
    pub(crate) fn connect(&mut self, rid: RelayId, sid: SourceId, now: UnixTime) {
        loop {
            tracing::debug!("mta: connecting with {}", self.connector_to_text(rid, sid));

            {
                let connector = self
                    .relays
                    .get(rid)
                    .connectors
                    .get(&sid)
                    .expect("connector exists");
                if connector.flags.intersects(ConnectorFlags::ERROR) {
                    tracing::debug!("mta: connector error");
                    return;
                }
                if connector.flags.contains(ConnectorFlags::WAIT) {
                    tracing::debug!("mta: canceling connector timeout");
                    self.runq_connector.cancel(&(rid, sid));
                    self.relays
                        .get_mut(rid)
                        .connectors
                        .get_mut(&sid)
                        .expect("connector exists")
                        .flags -= ConnectorFlags::WAIT;
                }
            }

            let relay = self.relays.get(rid);
            if relay.ntask == 0 {
                tracing::debug!("mta: no task for connector");
                return;
            }

            // Do not create more connections than necessary.
            if relay.nconn_ready >= relay.ntask
                || (relay.nconn > 2 && relay.nconn >= relay.ntask / 2)
            {
                tracing::debug!("mta: enough connections already");
                return;
            }

            let limits_profile = relay.limits.clone().expect("limits resolved before connect");
            let mut limits = LimitMask::empty();
            let mut nextconn = now;

            {
                let domain = self.domains.get(relay.key.domain);
                let gate = domain.lastconn + delay_secs(limits_profile.conndelay_domain);
                if gate > nextconn {
                    tracing::debug!(
                        "mta: cannot use domain {} before {}s",
                        domain.key.name,
                        gate - now
                    );
                    nextconn = gate;
                }
                if domain.nconn >= limits_profile.maxconn_per_domain {
                    tracing::debug!("mta: hit domain limit");
                    limits |= LimitMask::DOMAIN;
                }

                let source = self.sources.get(sid);
                let gate = source.lastconn + delay_secs(limits_profile.conndelay_source);
                if gate > nextconn {
                    tracing::debug!(
                        "mta: cannot use source {} before {}s",
                        self.source_to_text(sid),
                        gate - now
                    );
                    nextconn = gate;
                }
                if source.nconn >= limits_profile.maxconn_per_source {
                    tracing::debug!("mta: hit source limit");
                    limits |= LimitMask::SOURCE;
                }

                let connector = relay.connectors.get(&sid).expect("connector exists");
                let gate = connector.lastconn + delay_secs(limits_profile.conndelay_connector);
                if gate > nextconn {
                    tracing::debug!(
                        "mta: cannot use {} before {}s",
                        self.connector_to_text(rid, sid),
                        gate - now
                    );
                    nextconn = gate;
                }
                if connector.nconn >= limits_profile.maxconn_per_connector {
                    tracing::debug!("mta: hit connector limit");
                    limits |= LimitMask::CONNECTOR;
                }

                let gate = relay.lastconn + delay_secs(limits_profile.conndelay_relay);
                if gate > nextconn {
                    tracing::debug!(
                        "mta: cannot use {} before {}s",
                        self.relay_to_text(rid),
                        gate - now
                    );
                    nextconn = gate;
                }
                if relay.nconn >= limits_profile.maxconn_per_relay {
                    tracing::debug!("mta: hit relay limit");
                    limits |= LimitMask::RELAY;
                }
            }

            let route = if limits.is_empty() && nextconn <= now {
                self.find_route(rid, sid, now, &mut limits, &mut nextconn)
            } else {
                None
            };

            let Some(route) = route else {
                let connector_error = self
                    .relays
                    .get(rid)
                    .connectors
                    .get(&sid)
                    .expect("connector exists")
                    .flags
                    .intersects(ConnectorFlags::ERROR);
                if connector_error {
                    tracing::debug!(
                        "mta-routing: no route available for {}: errors on connector",
                        self.connector_to_text(rid, sid)
                    );
                    return;
                }
                if !limits.is_empty() {
                    tracing::debug!(
                        "mta-routing: no route available for {}: limits reached",
                        self.connector_to_text(rid, sid)
                    );
                    nextconn = now + DELAY_CHECK_LIMIT;
                } else {
                    tracing::debug!(
                        "mta-routing: no route available for {}: must wait a bit",
                        self.connector_to_text(rid, sid)
                    );
                }
                tracing::debug!(
                    "mta: retrying to connect on {} in {}s...",
                    self.connector_to_text(rid, sid),
                    nextconn - now
                );
                self.relays
                    .get_mut(rid)
                    .connectors
                    .get_mut(&sid)
                    .expect("connector exists")
                    .flags |= ConnectorFlags::WAIT;
                self.runq_connector.schedule(nextconn, (rid, sid));
                return;
            };

            tracing::debug!(
                "mta-routing: spawning new connection on {}",
                self.route_to_text(route)
            );

            {
                let connector = self
                    .relays
                    .get_mut(rid)
                    .connectors
                    .get_mut(&sid)
                    .expect("connector exists");
                connector.nconn += 1;
                connector.lastconn = now;
            }
            {
                let relay = self.relays.get_mut(rid);
                relay.nconn += 1;
                relay.lastconn = now;
            }
            let did = self.relays.get(rid).key.domain;
            {
                let domain = self.domains.get_mut(did);
                domain.nconn += 1;
                domain.lastconn = now;
            }
            let dst = {
                let r = self.routes.get_mut(route);
                r.nconn += 1;
                r.lastconn = now;
                r.dst
            };
            {
                let source = self.sources.get_mut(sid);
                source.nconn += 1;
                source.lastconn = now;
            }
            {
                let host = self.hosts.get_mut(dst);
                host.nconn += 1;
                host.lastconn = now;
            }

            self.spawn_session(rid, route);
            self.relay_ref(rid);
            // Go around again: one admission may fan out several
            // sessions before a gate closes.
        }
    }

    fn spawn_session(&mut self, rid: RelayId, route: RouteId) {
        let session = self.next_uid();
        let (src, dst) = {
            let r = self.routes.get(route);
            (r.src, r.dst)
        };
        self.sessions.insert(
            session,
            SessionSlot {
                relay: rid,
                route,
                ready: false,
            },
        );

        let relay = self.relays.get(rid);
        let start = SessionStart {
            session,
            relay: SessionRelayInfo {
                name: self.domains.get(relay.key.domain).key.name.clone(),
                port: relay.key.port,
                flags: relay.key.flags,
                secret: relay.secret.clone(),
                cert: relay.key.cert.clone(),
                helotable: relay.helotable.clone(),
            },
            source: self.sources.get(src).addr,
            destination: self.hosts.get(dst).addr,
        };
        self.peers
            .session
            .send(SessionCommand::Start(Box::new(start)))
            .ok();
    }

    /// Walk the destination's MX list in preference order and pick a
    /// route. On failure, record why: sticky error flags on the
    /// connector, a limit class, or the earliest time a retry might
    /// succeed.
    pub(crate) fn find_route(
        &mut self,
        rid: RelayId,
        sid: SourceId,
        now: UnixTime,
        limits: &mut LimitMask,
        nextconn: &mut UnixTime,
    ) -> Option<RouteId> {
        tracing::debug!(
            "mta-routing: searching new route for {}...",
            self.connector_to_text(rid, sid)
        );

        let profile = self
            .relays
            .get(rid)
            .limits
            .clone()
            .expect("limits resolved before find_route");
        let backuppref = self.relays.get(rid).backuppref;
        let mxs = self.domains.get(self.relays.get(rid).key.domain).mxs.clone();
        let source_addr = self.sources.get(sid).addr;

        let mut tm: UnixTime = 0;
        let mut limit_host = false;
        let mut limit_route = false;
        let mut suspended_route = RouteFlags::empty();
        let mut family_mismatch = false;
        let mut level = -1i32;
        let mut best: Option<RouteId> = None;
        let mut seen = 0usize;

        for mx in mxs {
            if mx.preference > level {
                // Use the current best MX if found.
                if best.is_some() {
                    break;
                }

                // No candidate, but this level had valid MXs that
                // reached a limit or cannot be used yet: do not skip
                // past them.
                if limit_host || limit_route || tm != 0 {
                    break;
                }

                // A backup MX never relays to MXs at or after its own
                // preference.
                if let Some(backuppref) = backuppref {
                    if mx.preference >= backuppref {
                        break;
                    }
                }

                level = mx.preference;
            }

            let (host_ignore, host_addr, host_nconn, host_lastconn) = {
                let host = self.hosts.get(mx.host);
                (host.ignore, host.addr, host.nconn, host.lastconn)
            };
            if host_ignore {
                continue;
            }

            // Found a possibly valid MX.
            seen += 1;

            let family_clash = match source_addr {
                Some(src) => src.is_ipv4() != host_addr.is_ipv4(),
                None => false,
            } || matches!(&profile.family, Some(family) if !family.matches(host_addr));
            if family_clash {
                tracing::debug!(
                    "mta-routing: skipping host {}: AF mismatch",
                    self.host_to_text(mx.host)
                );
                family_mismatch = true;
                continue;
            }

            if host_nconn >= profile.maxconn_per_host {
                tracing::debug!(
                    "mta-routing: skipping host {}: too many connections",
                    self.host_to_text(mx.host)
                );
                limit_host = true;
                continue;
            }

            let host_gate = host_lastconn + delay_secs(profile.conndelay_host);
            if host_gate > now {
                tracing::debug!(
                    "mta-routing: skipping host {}: cannot use before {}s",
                    self.host_to_text(mx.host),
                    host_gate - now
                );
                if tm == 0 || host_gate < tm {
                    tm = host_gate;
                }
                continue;
            }

            let route = self.route_intern(sid, mx.host);

            let (flags, nconn, lastconn, lastdisc) = {
                let r = self.routes.get(route);
                (r.flags, r.nconn, r.lastconn, r.lastdisc)
            };

            if flags.intersects(RouteFlags::DISABLED) {
                tracing::debug!(
                    "mta-routing: skipping route {}: suspend",
                    self.route_to_text(route)
                );
                suspended_route |= flags & RouteFlags::DISABLED;
                self.route_unref(route, now);
                continue;
            }

            if nconn > 0 && flags.contains(RouteFlags::NEW) {
                // A probing session is already validating this route.
                tracing::debug!(
                    "mta-routing: skipping route {}: not validated yet",
                    self.route_to_text(route)
                );
                limit_route = true;
                self.route_unref(route, now);
                continue;
            }

            if nconn >= profile.maxconn_per_route {
                tracing::debug!(
                    "mta-routing: skipping route {}: too many connections",
                    self.route_to_text(route)
                );
                limit_route = true;
                self.route_unref(route, now);
                continue;
            }

            let conn_gate = lastconn + delay_secs(profile.conndelay_route);
            if conn_gate > now {
                tracing::debug!(
                    "mta-routing: skipping route {}: cannot use before {}s (delay after connect)",
                    self.route_to_text(route),
                    conn_gate - now
                );
                if tm == 0 || conn_gate < tm {
                    tm = conn_gate;
                }
                self.route_unref(route, now);
                continue;
            }

            let disc_gate = lastdisc + delay_secs(profile.discdelay_route);
            if disc_gate > now {
                tracing::debug!(
                    "mta-routing: skipping route {}: cannot use before {}s (delay after disconnect)",
                    self.route_to_text(route),
                    disc_gate - now
                );
                if tm == 0 || disc_gate < tm {
                    tm = disc_gate;
                }
                self.route_unref(route, now);
                continue;
            }

            // Use the route with the lowest number of connections;
            // ties keep the earlier candidate.
            if let Some(current) = best {
                if nconn >= self.routes.get(current).nconn {
                    tracing::debug!(
                        "mta-routing: skipping route {}: current one is better",
                        self.route_to_text(route)
                    );
                    self.route_unref(route, now);
                    continue;
                }
                self.route_unref(current, now);
            }
            tracing::debug!(
                "mta-routing: selecting candidate route {}",
                self.route_to_text(route)
            );
            best = Some(route);
        }

        if best.is_some() {
            return best;
        }

        // Order is important.
        if seen == 0 {
            tracing::info!(
                "smtp-out: No MX found for {}",
                self.connector_to_text(rid, sid)
            );
            self.connector_flags_mut(rid, sid).insert(ConnectorFlags::ERROR_MX);
        } else if limit_route {
            tracing::debug!("mta: hit route limit");
            *limits |= LimitMask::ROUTE;
        } else if limit_host {
            tracing::debug!("mta: hit host limit");
            *limits |= LimitMask::HOST;
        } else if tm != 0 {
            if tm > *nextconn {
                *nextconn = tm;
            }
        } else if family_mismatch {
            tracing::info!(
                "smtp-out: Address family mismatch on {}",
                self.connector_to_text(rid, sid)
            );
            self.connector_flags_mut(rid, sid)
                .insert(ConnectorFlags::ERROR_FAMILY);
        } else if !suspended_route.is_empty() {
            tracing::info!(
                "smtp-out: No valid route for {}",
                self.connector_to_text(rid, sid)
            );
            if suspended_route.intersects(RouteFlags::DISABLED_NET) {
                self.connector_flags_mut(rid, sid)
                    .insert(ConnectorFlags::ERROR_ROUTE_NET);
            }
            if suspended_route.intersects(RouteFlags::DISABLED_SMTP) {
                self.connector_flags_mut(rid, sid)
                    .insert(ConnectorFlags::ERROR_ROUTE_SMTP);
            }
        }

        None
    }

    fn connector_flags_mut(&mut self, rid: RelayId, sid: SourceId) -> &mut ConnectorFlags {
        &mut self
            .relays
            .get_mut(rid)
            .connectors
            .get_mut(&sid)
            .expect("connector exists")
            .flags
    }
}
