use crate::ipc::ControlReply;
use crate::route::RouteFlags;
use crate::sched::Mta;
use runq::UnixTime;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

impl Mta {
    /// Lift the suspension on one route, or on every route when `id`
    /// is 0.
    pub(crate) fn resume_route(&mut self, id: u64, now: UnixTime) {
        if id != 0 {
            tracing::debug!("resuming route: {id}");
        } else {
            tracing::debug!("resuming all routes");
        }
        let matching: Vec<_> = self
            .routes
            .ids()
            .filter(|&rid| id == 0 || self.routes.get(rid).id == id)
            .collect();
        for rid in matching {
            self.route_enable(rid, now);
        }
    }

    pub(crate) fn show_routes(&self, reply: &UnboundedSender<ControlReply>, now: UnixTime) {
        let mut ids: Vec<_> = self.routes.ids().collect();
        ids.sort_by_key(|&rid| self.routes.get(rid).id);
        for rid in ids {
            let route = self.routes.get(rid);
            let timeout = match self.runq_route.pending(&rid) {
                Some(deadline) => humantime::format_duration(Duration::from_secs(
                    (deadline - now).max(0) as u64,
                ))
                .to_string(),
                None => "-".to_string(),
            };
            let flag = |bit, ch| if route.flags.intersects(bit) { ch } else { '-' };
            let line = format!(
                "{}. {} {}{}{}{} nconn={} penalty={} timeout={}",
                route.id,
                self.route_to_text(rid),
                flag(RouteFlags::NEW, 'N'),
                flag(RouteFlags::DISABLED, 'D'),
                flag(RouteFlags::RUNQ, 'Q'),
                flag(RouteFlags::KEEPALIVE, 'K'),
                route.nconn,
                route.penalty,
                timeout,
            );
            reply.send(ControlReply::Line(line)).ok();
        }
        reply.send(ControlReply::End).ok();
    }

    pub(crate) fn show_hoststats(&self, reply: &UnboundedSender<ControlReply>) {
        for (name, stat) in &self.hoststat {
            let line = format!("{name}|{}|{}", stat.tm, stat.error);
            reply.send(ControlReply::Line(line)).ok();
        }
        reply.send(ControlReply::End).ok();
    }
}
