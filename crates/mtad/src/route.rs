use crate::entity::{HostId, RouteId, SourceId};
use crate::relay::ConnectorFlags;
use crate::sched::{Mta, DELAY_ROUTE_BASE, DELAY_ROUTE_MAX, MAX_ERROR_PER_HOST};
use runq::UnixTime;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct RouteFlags: u8 {
        /// Never carried a successful session; the first connection
        /// probes it.
        const NEW = 0x01;
        const DISABLED_NET = 0x02;
        const DISABLED_SMTP = 0x04;
        const DISABLED = 0x02 | 0x04;
        /// Scheduled on the route run-queue.
        const RUNQ = 0x08;
        /// Already enjoyed its post-use keep-alive grace.
        const KEEPALIVE = 0x10;
    }
}

/// Per-(source, host) path state.
pub struct Route {
    pub id: u64,
    pub src: SourceId,
    pub dst: HostId,
    pub refcount: u32,
    pub flags: RouteFlags,
    pub nconn: usize,
    pub lastconn: UnixTime,
    pub lastdisc: UnixTime,
    pub penalty: u32,
    pub lastpenalty: UnixTime,
}

/// Suspension delay for a penalty count: quadratic, capped at four
/// hours.
pub(crate) fn route_delay(penalty: u32) -> UnixTime {
    (DELAY_ROUTE_BASE * penalty as UnixTime * penalty as UnixTime).min(DELAY_ROUTE_MAX)
}

impl Mta {
    /// Intern the `(source, host)` route, reviving it from keep-alive
    /// scheduling if needed. The returned id carries a held reference.
    pub(crate) fn route_intern(&mut self, src: SourceId, dst: HostId) -> RouteId {
        if let Some(&id) = self.route_index.get(&(src, dst)) {
            let flags = self.routes.get(id).flags;
            if flags.contains(RouteFlags::RUNQ) {
                tracing::debug!(
                    "mta: route_intern(): canceling runq for route {}",
                    self.route_to_text(id)
                );
                self.runq_route.cancel(&id);
                let route = self.routes.get_mut(id);
                route.flags -= RouteFlags::RUNQ | RouteFlags::KEEPALIVE;
                route.refcount -= 1; // the scheduling's reference
            }
            self.routes.get_mut(id).refcount += 1;
            return id;
        }

        self.route_seq += 1;
        let id = self.routes.insert(Route {
            id: self.route_seq,
            src,
            dst,
            refcount: 1,
            flags: RouteFlags::NEW,
            nconn: 0,
            lastconn: 0,
            lastdisc: 0,
            penalty: 0,
            lastpenalty: 0,
        });
        self.route_index.insert((src, dst), id);
        self.source_ref(src);
        self.host_ref(dst);
        metrics::gauge!("mta.route").increment(1.0);
        id
    }

    pub(crate) fn route_ref(&mut self, id: RouteId) {
        self.routes.get_mut(id).refcount += 1;
    }

    /// Drop a reference. A route that reaches zero is kept alive while
    /// it still carries penalty memory or while the imposed
    /// connect/disconnect delays have not yet expired, then discarded.
    pub(crate) fn route_unref(&mut self, id: RouteId, now: UnixTime) {
        {
            let route = self.routes.get_mut(id);
            route.refcount -= 1;
            if route.refcount > 0 {
                return;
            }
        }

        let route = self.routes.get(id);
        let mut sched: UnixTime = 0;
        let mut keepalive = false;
        if route.penalty > 0 {
            sched = route.lastpenalty + route_delay(route.penalty);
            tracing::debug!(
                "mta: route_unref(): keeping route {} alive for {}s (penalty {})",
                self.route_to_text(id),
                sched - now,
                route.penalty
            );
        } else if !route.flags.contains(RouteFlags::KEEPALIVE) {
            let conn_gate = route.lastconn + self.max_seen_conndelay_route;
            let disc_gate = route.lastdisc + self.max_seen_discdelay_route;
            sched = conn_gate.max(disc_gate);
            if sched > now {
                keepalive = true;
                tracing::debug!(
                    "mta: route_unref(): keeping route {} alive for {}s (imposed delay)",
                    self.route_to_text(id),
                    sched - now
                );
            }
        }

        if sched > now {
            let route = self.routes.get_mut(id);
            route.flags |= RouteFlags::RUNQ;
            if keepalive {
                route.flags |= RouteFlags::KEEPALIVE;
            }
            route.refcount += 1;
            self.runq_route.schedule(sched, id);
            return;
        }

        tracing::debug!(
            "mta: route_unref(): really discarding route {}",
            self.route_to_text(id)
        );
        let route = self.routes.remove(id);
        self.route_index.remove(&(route.src, route.dst));
        self.source_unref(route.src);
        self.host_unref(route.dst);
        metrics::gauge!("mta.route").decrement(1.0);
    }

    pub(crate) fn route_to_text(&self, id: RouteId) -> String {
        let route = self.routes.get(id);
        format!(
            "{} <-> {}",
            self.source_to_text(route.src),
            self.host_to_text(route.dst)
        )
    }

    /// Suspend a route: grow its penalty and park it on the route
    /// run-queue until the quadratic delay expires.
    pub(crate) fn route_disable(
        &mut self,
        id: RouteId,
        penalty: u32,
        reason: RouteFlags,
        now: UnixTime,
    ) {
        let delay = {
            let route = self.routes.get_mut(id);
            route.penalty += penalty;
            route.lastpenalty = now;
            route_delay(route.penalty)
        };

        tracing::info!(
            "smtp-out: Disabling route {} for {}s",
            self.route_to_text(id),
            delay
        );

        if self.routes.get(id).flags.intersects(RouteFlags::DISABLED) {
            // Only one pending suspension at a time.
            self.runq_route.cancel(&id);
            self.routes.get_mut(id).refcount -= 1;
        }
        self.routes.get_mut(id).flags |= reason & RouteFlags::DISABLED;
        self.runq_route.schedule(now + delay, id);
        self.route_ref(id);
    }

    /// Lift a suspension: the route goes back to probing state, and one
    /// penalty step decays.
    pub(crate) fn route_enable(&mut self, id: RouteId, now: UnixTime) {
        if self.routes.get(id).flags.intersects(RouteFlags::DISABLED) {
            tracing::info!("smtp-out: Enabling route {}", self.route_to_text(id));
            let route = self.routes.get_mut(id);
            route.flags -= RouteFlags::DISABLED;
            route.flags |= RouteFlags::NEW;
        }

        let route = self.routes.get_mut(id);
        if route.penalty > 0 {
            route.penalty -= 1;
            route.lastpenalty = now;
        }
    }

    /// The probing session validated the route; fan out more sessions.
    pub(crate) fn route_ok(&mut self, session: u64, now: UnixTime) {
        let Some(&crate::sched::SessionSlot { relay, route, .. }) = self.sessions.get(&session)
        else {
            return;
        };
        if !self.routes.get(route).flags.contains(RouteFlags::NEW) {
            return;
        }
        tracing::debug!(
            "mta-routing: route {} is now valid.",
            self.route_to_text(route)
        );
        self.routes.get_mut(route).flags -= RouteFlags::NEW;

        let src = self.routes.get(route).src;
        self.connector(relay, src);
        self.connect(relay, src, now);
    }

    /// The peer rejected the dialog; suspend the route on the SMTP
    /// failure class.
    pub(crate) fn route_down(&mut self, session: u64, now: UnixTime) {
        let Some(&crate::sched::SessionSlot { route, .. }) = self.sessions.get(&session) else {
            return;
        };
        self.route_disable(route, 2, RouteFlags::DISABLED_SMTP, now);
    }

    /// The session closed: release its connection accounting and let
    /// the connector reissue.
    pub(crate) fn route_collect(&mut self, session: u64, now: UnixTime) {
        let Some(slot) = self.sessions.remove(&session) else {
            return;
        };
        let crate::sched::SessionSlot {
            relay,
            route,
            ready,
        } = slot;
        tracing::debug!("mta_route_collect({})", self.route_to_text(route));

        let src = self.routes.get(route).src;
        let dst = self.routes.get(route).dst;
        {
            let r = self.relays.get_mut(relay);
            r.nconn -= 1;
            if ready {
                r.nconn_ready -= 1;
            }
        }
        let did = self.relays.get(relay).key.domain;
        self.domains.get_mut(did).nconn -= 1;
        {
            let r = self.routes.get_mut(route);
            r.nconn -= 1;
            r.lastdisc = now;
        }
        self.sources.get_mut(src).nconn -= 1;
        self.hosts.get_mut(dst).nconn -= 1;

        // First connection failed before validating the route.
        if self.routes.get(route).flags.contains(RouteFlags::NEW) {
            self.route_disable(route, 2, RouteFlags::DISABLED_NET, now);
        }

        self.connector(relay, src);
        {
            let connector = self
                .relays
                .get_mut(relay)
                .connectors
                .get_mut(&src)
                .expect("connector exists");
            connector.nconn -= 1;
        }
        self.connect(relay, src, now);
        self.route_unref(route, now); // from find_route()
        self.relay_unref(relay); // from connect()
    }

    /// Errors on the remote host itself: too many and the MX is
    /// ignored for the rest of its lifetime.
    pub(crate) fn route_error(&mut self, session: u64, error: &str) {
        let Some(&crate::sched::SessionSlot { route, .. }) = self.sessions.get(&session) else {
            return;
        };
        let dst = self.routes.get(route).dst;
        tracing::debug!("mta: error on route {}: {error}", self.route_to_text(route));
        let host = self.hosts.get_mut(dst);
        host.nerror += 1;
        if host.ignore {
            return;
        }
        if host.nerror > MAX_ERROR_PER_HOST {
            tracing::info!(
                "smtp-out: Too many errors on host {}: ignoring this MX",
                self.host_to_text(dst)
            );
            self.hosts.get_mut(dst).ignore = true;
        }
    }

    /// Local error binding the source: taint the connector so it stops
    /// producing sessions.
    pub(crate) fn source_error(&mut self, session: u64, error: &str) {
        let Some(&crate::sched::SessionSlot { relay, route, .. }) = self.sessions.get(&session)
        else {
            return;
        };
        let src = self.routes.get(route).src;
        self.connector(relay, src);
        let connector = self
            .relays
            .get(relay)
            .connectors
            .get(&src)
            .expect("connector exists");
        if !connector.flags.contains(ConnectorFlags::ERROR_SOURCE) {
            tracing::info!("smtp-out: Error on {}: {error}", self.route_to_text(route));
        }
        self.relays
            .get_mut(relay)
            .connectors
            .get_mut(&src)
            .expect("connector exists")
            .flags |= ConnectorFlags::ERROR_SOURCE;
    }
}
