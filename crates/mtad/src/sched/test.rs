use super::test_rig::{rig, rig_with, Rig};
use crate::delivery::Delivery;
use crate::ipc::{
    ControlReply, ControlRequest, DnsReply, DnsRequest, DnsStatus, MailAddr, MtaEvent,
    QueueNotice, QueueRequest, RelaySpec, SessionCommand, SessionEvent, SessionStart,
    TransferRequest,
};
use crate::limits::{LimitProfile, LimitsTable};
use crate::relay::{ConnectorFlags, LimitMask, RelayFlags, Task};
use crate::route::{route_delay, RouteFlags};
use runq::UnixTime;
use std::net::IpAddr;
use std::time::Duration;

fn transfer(rig: &mut Rig, evpid: u64, dest: &str, relay: RelaySpec, now: UnixTime) {
    let (user, domain) = dest.split_once('@').expect("dest is user@domain");
    rig.mta.dispatch(
        MtaEvent::Queue(QueueRequest::Transfer(Box::new(TransferRequest {
            id: evpid,
            creation: now - 30,
            sender: MailAddr {
                user: "sender".to_string(),
                domain: "origin.example".to_string(),
            },
            dest: MailAddr {
                user: user.to_string(),
                domain: domain.to_string(),
            },
            rcpt: MailAddr {
                user: user.to_string(),
                domain: domain.to_string(),
            },
            relay,
        }))),
        now,
    );
}

fn expect_mx_query(rig: &mut Rig) -> u64 {
    match rig.dns.try_recv() {
        Ok(DnsRequest::QueryMx { reqid, .. }) => reqid,
        other => panic!("expected an MX query, got {other:?}"),
    }
}

fn answer_mx(rig: &mut Rig, reqid: u64, hosts: &[(&str, i32)], now: UnixTime) {
    for (ip, preference) in hosts {
        rig.mta.dispatch(
            MtaEvent::Dns(DnsReply::Host {
                reqid,
                addr: ip.parse::<IpAddr>().expect("test address parses"),
                preference: *preference,
            }),
            now,
        );
    }
    rig.mta.dispatch(
        MtaEvent::Dns(DnsReply::HostEnd {
            reqid,
            status: DnsStatus::Ok,
        }),
        now,
    );
}

fn expect_session_start(rig: &mut Rig) -> SessionStart {
    match rig.session.try_recv() {
        Ok(SessionCommand::Start(start)) => *start,
        other => panic!("expected a session start, got {other:?}"),
    }
}

fn take_task(rig: &mut Rig, session: u64, now: UnixTime) -> Option<Task> {
    rig.mta
        .dispatch(MtaEvent::Session(SessionEvent::NextTask { session }), now);
    match rig.session.try_recv() {
        Ok(SessionCommand::Task { task, .. }) => task,
        other => panic!("expected a task reply, got {other:?}"),
    }
}

fn answer_source(rig: &mut Rig, addr: &str, now: UnixTime) {
    let reqid = match rig.lookup.try_recv() {
        Ok(crate::ipc::LookupRequest::Source { reqid, .. }) => reqid,
        other => panic!("expected a source lookup, got {other:?}"),
    };
    rig.mta.dispatch(
        MtaEvent::Lookup(crate::ipc::LookupReply::Source {
            reqid,
            addr: Some(addr.parse().expect("test address parses")),
        }),
        now,
    );
}

#[test]
fn clean_delivery() {
    let mut rig = rig();
    let evpid = 0x0000_0001_0000_0001u64;
    let now = 1000;

    transfer(&mut rig, evpid, "user@example.com", RelaySpec::default(), now);

    let reqid = expect_mx_query(&mut rig);
    answer_mx(&mut rig, reqid, &[("203.0.113.10", 10)], now);

    let start = expect_session_start(&mut rig);
    assert_eq!(start.destination, "203.0.113.10".parse::<IpAddr>().unwrap());
    assert_eq!(start.source, None);
    assert_eq!(start.relay.name, "example.com");
    assert!(start.relay.flags.contains(RelayFlags::TLS_OPTIONAL));

    rig.mta.dispatch(
        MtaEvent::Session(SessionEvent::Ready {
            session: start.session,
        }),
        now,
    );
    rig.mta.dispatch(
        MtaEvent::Session(SessionEvent::RouteOk {
            session: start.session,
        }),
        now,
    );
    // Validating the route must not fan out extra sessions while the
    // ready one covers the only task.
    assert!(rig.session.try_recv().is_err());

    let task = take_task(&mut rig, start.session, now).expect("one task pending");
    assert_eq!(task.envelopes.len(), 1);
    assert_eq!(task.envelopes[0].dest, "user@example.com");
    assert_eq!(task.envelopes[0].session, start.session);

    // With no tasks left, drain issues no further queries.
    let rid = rig.mta.relays.ids().next().expect("relay alive");
    rig.mta.drain(rid, now);
    assert!(rig.dns.try_recv().is_err());

    rig.mta.dispatch(
        MtaEvent::Session(SessionEvent::Delivery {
            session: start.session,
            envelope: task.envelopes[0].clone(),
            sender: task.sender.clone(),
            delivery: Delivery::Ok,
            status: "250 2.0.0 Ok".to_string(),
        }),
        now + 5,
    );
    assert_eq!(rig.queue.try_recv().unwrap(), QueueNotice::Ok { evpid });

    assert_eq!(take_task(&mut rig, start.session, now + 5), None);

    rig.mta.dispatch(
        MtaEvent::Session(SessionEvent::Collect {
            session: start.session,
        }),
        now + 10,
    );
    // No imposed route delays in the default profile: the route is
    // discarded as soon as the session is collected.
    assert_eq!(rig.mta.routes.len(), 0);

    rig.mta.tick(now + 11);
    assert_eq!(rig.mta.relays.len(), 0);
    assert_eq!(rig.mta.domains.len(), 0);
    assert_eq!(rig.mta.hosts.len(), 0);
    assert_eq!(rig.mta.sources.len(), 0);
    assert!(rig.queue.try_recv().is_err());
}

#[test]
fn route_kept_alive_for_imposed_disconnect_delay() {
    let mut rig = rig_with(LimitsTable::with_default(LimitProfile {
        discdelay_route: Duration::from_secs(7),
        ..LimitProfile::default()
    }));
    let now = 1000;

    transfer(&mut rig, 1 << 32, "user@example.com", RelaySpec::default(), now);
    let reqid = expect_mx_query(&mut rig);
    answer_mx(&mut rig, reqid, &[("203.0.113.10", 10)], now);
    let start = expect_session_start(&mut rig);

    rig.mta.dispatch(
        MtaEvent::Session(SessionEvent::Ready {
            session: start.session,
        }),
        now,
    );
    rig.mta.dispatch(
        MtaEvent::Session(SessionEvent::RouteOk {
            session: start.session,
        }),
        now,
    );
    let task = take_task(&mut rig, start.session, now).expect("one task pending");
    rig.mta.dispatch(
        MtaEvent::Session(SessionEvent::Delivery {
            session: start.session,
            envelope: task.envelopes[0].clone(),
            sender: task.sender.clone(),
            delivery: Delivery::Ok,
            status: "250 2.0.0 Ok".to_string(),
        }),
        now + 5,
    );
    rig.mta.dispatch(
        MtaEvent::Session(SessionEvent::Collect {
            session: start.session,
        }),
        now + 10,
    );

    // The route memory must survive until the disconnect delay has
    // elapsed so a reconnect cannot sidestep it.
    assert_eq!(rig.mta.routes.len(), 1);
    let route = rig.mta.routes.ids().next().unwrap();
    assert!(rig
        .mta
        .routes
        .get(route)
        .flags
        .contains(RouteFlags::RUNQ | RouteFlags::KEEPALIVE));
    assert_eq!(rig.mta.runq_route.pending(&route), Some(now + 17));

    rig.mta.tick(now + 17);
    assert_eq!(rig.mta.routes.len(), 0);
    rig.mta.tick(now + 18);
    assert_eq!(rig.mta.relays.len(), 0);
    assert_eq!(rig.mta.hosts.len(), 0);
}

#[test]
fn failed_probe_disables_and_reenables_route() {
    let mut rig = rig();
    let evp1 = 0x0000_0001_0000_0001u64;
    let evp2 = 0x0000_0002_0000_0001u64;
    let now = 2000;

    transfer(&mut rig, evp1, "user@example.com", RelaySpec::default(), now);
    let reqid = expect_mx_query(&mut rig);
    answer_mx(&mut rig, reqid, &[("203.0.113.10", 10)], now);
    let start = expect_session_start(&mut rig);

    // TCP connect failed: the session collects while the route is
    // still probing.
    rig.mta.dispatch(
        MtaEvent::Session(SessionEvent::Collect {
            session: start.session,
        }),
        now + 1,
    );

    let route = rig.mta.routes.ids().next().expect("route survives suspension");
    {
        let r = rig.mta.routes.get(route);
        assert!(r.flags.contains(RouteFlags::DISABLED_NET));
        assert_eq!(r.penalty, 2);
    }
    assert_eq!(rig.mta.runq_route.pending(&route), Some(now + 1 + 800));

    let (lines_tx, mut lines_rx) = tokio::sync::mpsc::unbounded_channel();
    rig.mta.dispatch(
        MtaEvent::Control(ControlRequest::ShowRoutes { reply: lines_tx }),
        now + 1,
    );
    k9::assert_equal!(
        lines_rx.try_recv().unwrap(),
        ControlReply::Line(
            "1. [] <-> 203.0.113.10 ND-- nconn=0 penalty=2 timeout=13m 20s".to_string()
        )
    );
    assert_eq!(lines_rx.try_recv().unwrap(), ControlReply::End);

    // The relay runs out of sources and fails the first envelope.
    rig.mta.tick(now + 1);
    match rig.queue.try_recv().unwrap() {
        QueueNotice::TempFail { evpid, reason, .. } => {
            assert_eq!(evpid, evp1);
            assert_eq!(reason, "Network error on destination MXs");
        }
        other => panic!("expected tempfail, got {other:?}"),
    }

    // A second envelope for the same domain is held as well; the
    // suspended route is never probed again before its timeout.
    transfer(&mut rig, evp2, "other@example.com", RelaySpec::default(), now + 100);
    let reqid = expect_mx_query(&mut rig);
    answer_mx(&mut rig, reqid, &[("203.0.113.10", 10)], now + 100);
    assert!(rig.session.try_recv().is_err());
    match rig.queue.try_recv().unwrap() {
        QueueNotice::TempFail { evpid, reason, .. } => {
            assert_eq!(evpid, evp2);
            assert_eq!(reason, "Network error on destination MXs");
        }
        other => panic!("expected tempfail, got {other:?}"),
    }

    // Both deferred envelopes are remembered for replay.
    let stat = rig.mta.hoststat.get("example.com").expect("hoststat entry");
    assert!(stat.deferred.contains(&evp1));
    assert!(stat.deferred.contains(&evp2));

    // Suspension delay elapses: the route goes back to probing state
    // with one penalty step decayed.
    rig.mta.tick(now + 1 + 800);
    let r = rig.mta.routes.get(route);
    assert!(!r.flags.intersects(RouteFlags::DISABLED));
    assert!(r.flags.contains(RouteFlags::NEW));
    assert_eq!(r.penalty, 1);

    // The remaining penalty decays on the next keep-alive cycle, then
    // the route is discarded.
    rig.mta.tick(now + 1 + 800 + 200);
    assert_eq!(rig.mta.routes.len(), 0);
    assert_eq!(rig.mta.hosts.len(), 0);
    assert_eq!(rig.mta.sources.len(), 0);
}

#[test]
fn backup_relay_stops_at_own_preference() {
    let mut rig = rig();
    let now = 3000;
    let spec = RelaySpec {
        hostname: Some("mx2.example.com".to_string()),
        flags: RelayFlags::BACKUP,
        ..RelaySpec::default()
    };

    transfer(&mut rig, 1 << 32, "user@example.com", spec, now);

    // A backup relay resolves its own preference alongside the MXs.
    let pref_reqid = match rig.dns.try_recv() {
        Ok(DnsRequest::QueryMxPreference { reqid, domain, mx }) => {
            assert_eq!(domain, "example.com");
            assert_eq!(mx, "mx2.example.com");
            reqid
        }
        other => panic!("expected a preference query, got {other:?}"),
    };
    let mx_reqid = expect_mx_query(&mut rig);

    rig.mta.dispatch(
        MtaEvent::Dns(DnsReply::MxPreference {
            reqid: pref_reqid,
            status: DnsStatus::Ok,
            preference: 20,
        }),
        now,
    );
    answer_mx(
        &mut rig,
        mx_reqid,
        &[("203.0.113.1", 10), ("203.0.113.2", 20), ("203.0.113.3", 30)],
        now,
    );

    // Only the strictly-lower preference MX is ever tried.
    let start = expect_session_start(&mut rig);
    assert_eq!(start.destination, "203.0.113.1".parse::<IpAddr>().unwrap());
    assert!(rig.session.try_recv().is_err());

    // Once the only eligible MX is gone, the selector refuses to relay
    // to our own preference level or beyond.
    let (rid, sid) = {
        let slot = rig.mta.sessions.values().next().expect("session slot");
        (slot.relay, rig.mta.routes.get(slot.route).src)
    };
    let h1 = *rig
        .mta
        .host_index
        .get(&"203.0.113.1".parse::<IpAddr>().unwrap())
        .unwrap();
    rig.mta.hosts.get_mut(h1).ignore = true;

    let mut limits = LimitMask::empty();
    let mut nextconn = now;
    let found = rig.mta.find_route(rid, sid, now, &mut limits, &mut nextconn);
    assert!(found.is_none());
    let connector = rig.mta.relays.get(rid).connectors.get(&sid).unwrap();
    assert!(connector.flags.contains(ConnectorFlags::ERROR_MX));
    assert_eq!(rig.mta.routes.len(), 1);
}

#[test]
fn source_exhaustion_defers_and_replays() {
    let mut rig = rig();
    let evpid = 0x0000_0007_0000_0001u64;
    let mut now = 0;
    let spec = RelaySpec {
        sourcetable: Some("mysrc".to_string()),
        ..RelaySpec::default()
    };

    transfer(&mut rig, evpid, "user@example.com", spec, now);
    let reqid = expect_mx_query(&mut rig);
    answer_mx(&mut rig, reqid, &[("203.0.113.50", 10)], now);

    // First source candidate probes and fails on the network.
    answer_source(&mut rig, "10.0.0.1", now);
    let start = expect_session_start(&mut rig);
    assert_eq!(start.source, Some("10.0.0.1".parse::<IpAddr>().unwrap()));
    now += 1;
    rig.mta.dispatch(
        MtaEvent::Session(SessionEvent::Collect {
            session: start.session,
        }),
        now,
    );

    // Second source candidate, same outcome.
    rig.mta.tick(now);
    answer_source(&mut rig, "10.0.0.2", now);
    let start = expect_session_start(&mut rig);
    assert_eq!(start.source, Some("10.0.0.2".parse::<IpAddr>().unwrap()));
    now += 1;
    rig.mta.dispatch(
        MtaEvent::Session(SessionEvent::Collect {
            session: start.session,
        }),
        now,
    );

    // The table starts cycling over known-broken connectors until the
    // relay concludes nothing is left to try.
    rig.mta.tick(now);
    answer_source(&mut rig, "10.0.0.1", now);
    while rig.mta.relays.len() > 0 {
        let addr = if rig.mta.relays.ids().next().map(|rid| {
            rig.mta.relays.get(rid).sourceloop % 2 == 0
        }) == Some(true)
        {
            "10.0.0.2"
        } else {
            "10.0.0.1"
        };
        answer_source(&mut rig, addr, now);
    }

    match rig.queue.try_recv().unwrap() {
        QueueNotice::TempFail { evpid: id, reason, .. } => {
            assert_eq!(id, evpid);
            assert_eq!(reason, "Network error on destination MXs");
        }
        other => panic!("expected tempfail, got {other:?}"),
    }

    // The envelope is deferred under the destination domain.
    let stat = rig.mta.hoststat.get("example.com").expect("hoststat entry");
    assert!(stat.deferred.contains(&evpid));

    // The peer recovers: every deferred envelope is handed back to the
    // queue for rescheduling.
    rig.mta.hoststat_update("Example.COM", "recovered", now);
    rig.mta.hoststat_reschedule("example.com");
    assert_eq!(
        rig.queue.try_recv().unwrap(),
        QueueNotice::Schedule { evpid }
    );
    assert!(rig
        .mta
        .hoststat
        .get("example.com")
        .unwrap()
        .deferred
        .is_empty());

    let (lines_tx, mut lines_rx) = tokio::sync::mpsc::unbounded_channel();
    rig.mta.dispatch(
        MtaEvent::Control(ControlRequest::ShowHostStats { reply: lines_tx }),
        now,
    );
    assert_eq!(
        lines_rx.try_recv().unwrap(),
        ControlReply::Line(format!("example.com|{now}|recovered"))
    );
    assert_eq!(lines_rx.try_recv().unwrap(), ControlReply::End);
}

#[test]
fn family_mismatch_fails_the_relay() {
    let mut rig = rig();
    let evpid = 0x0000_0009_0000_0001u64;
    let now = 100;
    let spec = RelaySpec {
        sourcetable: Some("mysrc".to_string()),
        ..RelaySpec::default()
    };

    transfer(&mut rig, evpid, "user@example.com", spec, now);
    let reqid = expect_mx_query(&mut rig);
    answer_mx(&mut rig, reqid, &[("203.0.113.77", 10)], now);

    // The only source is IPv6 and the only MX is IPv4.
    answer_source(&mut rig, "2001:db8::1", now);
    assert!(rig.session.try_recv().is_err());
    answer_source(&mut rig, "2001:db8::1", now);

    match rig.queue.try_recv().unwrap() {
        QueueNotice::TempFail { evpid: id, reason, .. } => {
            assert_eq!(id, evpid);
            assert_eq!(reason, "Address family mismatch on destination MXs");
        }
        other => panic!("expected tempfail, got {other:?}"),
    }
    // Family mismatches are not a destination suspension; nothing is
    // deferred for replay.
    assert!(rig.mta.hoststat.is_empty());
    assert_eq!(rig.mta.relays.len(), 0);
}

#[test]
fn mx_errors_map_to_verdicts() {
    for (status, reason, permanent) in [
        (DnsStatus::Retry, "Temporary failure in MX lookup", false),
        (DnsStatus::Invalid, "Invalid domain name", true),
        (DnsStatus::NoName, "Domain does not exist", true),
        (DnsStatus::NotFound, "No MX found for domain", false),
    ] {
        let mut rig = rig();
        let evpid = 0x0000_0042_0000_0001u64;
        transfer(&mut rig, evpid, "user@bad.example", RelaySpec::default(), 10);
        let reqid = expect_mx_query(&mut rig);
        rig.mta
            .dispatch(MtaEvent::Dns(DnsReply::HostEnd { reqid, status }), 10);

        match (permanent, rig.queue.try_recv().unwrap()) {
            (false, QueueNotice::TempFail { evpid: id, reason: got, .. })
            | (true, QueueNotice::PermFail { evpid: id, reason: got }) => {
                assert_eq!(id, evpid);
                assert_eq!(got, reason);
            }
            (_, other) => panic!("unexpected notice for {status:?}: {other:?}"),
        }
        assert_eq!(rig.mta.relays.len(), 0);
    }
}

#[test]
fn missing_secret_is_a_tempfail() {
    let mut rig = rig();
    let spec = RelaySpec {
        flags: RelayFlags::AUTH,
        authtable: Some("creds".to_string()),
        authlabel: Some("smarthost".to_string()),
        ..RelaySpec::default()
    };
    transfer(&mut rig, 7 << 32, "user@example.com", spec, 10);

    let reqid = match rig.lookup.try_recv() {
        Ok(crate::ipc::LookupRequest::Secret { reqid, table, label }) => {
            assert_eq!(table, "creds");
            assert_eq!(label, "smarthost");
            reqid
        }
        other => panic!("expected a secret lookup, got {other:?}"),
    };
    let mx_reqid = expect_mx_query(&mut rig);
    answer_mx(&mut rig, mx_reqid, &[("203.0.113.10", 10)], 10);

    rig.mta.dispatch(
        MtaEvent::Lookup(crate::ipc::LookupReply::Secret {
            reqid,
            secret: None,
        }),
        10,
    );
    match rig.queue.try_recv().unwrap() {
        QueueNotice::TempFail { reason, .. } => {
            assert_eq!(reason, "Could not retrieve credentials");
        }
        other => panic!("expected tempfail, got {other:?}"),
    }
}

#[test]
fn shared_mx_query_fans_in() {
    let mut rig = rig_with(LimitsTable::with_default(LimitProfile {
        maxconn_per_relay: 1,
        ..LimitProfile::default()
    }));
    // Two relays to the same domain on different ports, both draining
    // before the resolver answers: a single MX query serves both.
    transfer(&mut rig, 1 << 32, "a@example.com", RelaySpec::default(), 10);
    let reqid = expect_mx_query(&mut rig);
    let spec = RelaySpec {
        port: 2525,
        ..RelaySpec::default()
    };
    transfer(&mut rig, 2 << 32, "b@example.com", spec, 10);
    assert!(rig.dns.try_recv().is_err());
    assert_eq!(rig.mta.relays.len(), 2);

    answer_mx(&mut rig, reqid, &[("203.0.113.10", 10)], 10);

    // The first relay probes the shared route; the second holds back
    // until the probe validates it.
    let start = expect_session_start(&mut rig);
    assert_eq!(start.relay.port, 0);
    assert!(rig.session.try_recv().is_err());

    rig.mta.dispatch(
        MtaEvent::Session(SessionEvent::Ready {
            session: start.session,
        }),
        10,
    );
    rig.mta.dispatch(
        MtaEvent::Session(SessionEvent::RouteOk {
            session: start.session,
        }),
        10,
    );

    rig.mta.tick(15);
    let second = expect_session_start(&mut rig);
    assert_eq!(second.relay.port, 2525);
    assert!(rig.session.try_recv().is_err());
}

#[test]
fn explicit_relay_host_uses_host_query() {
    let mut rig = rig();
    let spec = RelaySpec {
        hostname: Some("smarthost.example.net".to_string()),
        port: 587,
        ..RelaySpec::default()
    };
    transfer(&mut rig, 3 << 32, "user@example.com", spec, 10);
    match rig.dns.try_recv() {
        Ok(DnsRequest::QueryHost { host, .. }) => {
            assert_eq!(host, "smarthost.example.net");
        }
        other => panic!("expected a host query, got {other:?}"),
    }
}

#[test]
fn drain_is_idempotent_while_waiting() {
    let mut rig = rig();
    transfer(&mut rig, 1 << 32, "user@example.com", RelaySpec::default(), 10);
    expect_mx_query(&mut rig);

    let rid = rig.mta.relays.ids().next().unwrap();
    let refcount = rig.mta.relays.get(rid).refcount;
    rig.mta.drain(rid, 10);
    rig.mta.drain(rid, 10);
    assert!(rig.dns.try_recv().is_err());
    assert_eq!(rig.mta.relays.get(rid).refcount, refcount);
}

#[test]
fn selector_ties_keep_the_first_candidate() {
    let mut rig = rig();
    transfer(&mut rig, 1 << 32, "user@example.com", RelaySpec::default(), 10);
    let reqid = expect_mx_query(&mut rig);
    answer_mx(
        &mut rig,
        reqid,
        &[("203.0.113.1", 10), ("203.0.113.2", 10)],
        10,
    );
    let start = expect_session_start(&mut rig);
    assert_eq!(start.destination, "203.0.113.1".parse::<IpAddr>().unwrap());
}

#[test]
fn selector_does_not_cross_a_blocked_preference_level() {
    let mut rig = rig();
    transfer(&mut rig, 1 << 32, "user@example.com", RelaySpec::default(), 10);
    let reqid = expect_mx_query(&mut rig);
    answer_mx(
        &mut rig,
        reqid,
        &[("203.0.113.1", 10), ("203.0.113.2", 20)],
        10,
    );
    let start = expect_session_start(&mut rig);
    assert_eq!(start.destination, "203.0.113.1".parse::<IpAddr>().unwrap());

    // Saturate the preferred host: selection must report the limit
    // instead of descending to the higher preference level.
    let h1 = *rig
        .mta
        .host_index
        .get(&"203.0.113.1".parse::<IpAddr>().unwrap())
        .unwrap();
    rig.mta.hosts.get_mut(h1).nconn = LimitProfile::default().maxconn_per_host;

    let (rid, sid) = {
        let slot = rig.mta.sessions.values().next().expect("session slot");
        (slot.relay, rig.mta.routes.get(slot.route).src)
    };
    let mut limits = LimitMask::empty();
    let mut nextconn = 10;
    let found = rig.mta.find_route(rid, sid, 10, &mut limits, &mut nextconn);
    assert!(found.is_none());
    assert!(limits.contains(LimitMask::HOST));
    // The second MX was never interned into a route.
    assert_eq!(rig.mta.routes.len(), 1);
}

#[test]
fn host_is_ignored_after_too_many_errors() {
    let mut rig = rig();
    transfer(&mut rig, 1 << 32, "user@example.com", RelaySpec::default(), 10);
    let reqid = expect_mx_query(&mut rig);
    answer_mx(&mut rig, reqid, &[("203.0.113.10", 10)], 10);
    let start = expect_session_start(&mut rig);

    let dst = *rig
        .mta
        .host_index
        .get(&"203.0.113.10".parse::<IpAddr>().unwrap())
        .unwrap();
    for _ in 0..4 {
        rig.mta.route_error(start.session, "451 try later");
    }
    assert!(!rig.mta.hosts.get(dst).ignore);
    rig.mta.route_error(start.session, "451 try later");
    assert!(rig.mta.hosts.get(dst).ignore);
}

#[test]
fn suspension_delay_is_quadratic_and_capped() {
    assert_eq!(route_delay(1), 200);
    assert_eq!(route_delay(2), 800);
    assert_eq!(route_delay(3), 1800);
    assert_eq!(route_delay(8), 12800);
    // 9^2 * 200 exceeds the four hour ceiling.
    assert_eq!(route_delay(9), 14400);
    assert_eq!(route_delay(100), 14400);
}

#[test]
fn hoststat_uncache_drops_single_envelopes() {
    let mut rig = rig();
    rig.mta.hoststat_cache("example.com", 1, 100);
    rig.mta.hoststat_cache("EXAMPLE.com", 2, 100);
    rig.mta.hoststat_uncache("example.com", 1);
    rig.mta.hoststat_reschedule("example.com");
    assert_eq!(rig.queue.try_recv().unwrap(), QueueNotice::Schedule { evpid: 2 });
    assert!(rig.queue.try_recv().is_err());
}

#[test]
fn hoststat_entries_expire_after_four_hours() {
    let mut rig = rig();
    rig.mta.hoststat_update("example.com", "451 greylisted", 100);
    rig.mta.tick(100 + 4 * 3600 - 1);
    assert!(rig.mta.hoststat.contains_key("example.com"));

    // Another update rearms the expiry timer.
    rig.mta.hoststat_update("example.com", "451 greylisted", 200);
    rig.mta.tick(100 + 4 * 3600);
    assert!(rig.mta.hoststat.contains_key("example.com"));

    rig.mta.tick(200 + 4 * 3600);
    assert!(rig.mta.hoststat.is_empty());
    assert_eq!(rig.mta.runq_hoststat.len(), 0);
}

#[test]
fn resume_route_reenables_immediately() {
    let mut rig = rig();
    transfer(&mut rig, 1 << 32, "user@example.com", RelaySpec::default(), 10);
    let reqid = expect_mx_query(&mut rig);
    answer_mx(&mut rig, reqid, &[("203.0.113.10", 10)], 10);
    let start = expect_session_start(&mut rig);
    rig.mta.dispatch(
        MtaEvent::Session(SessionEvent::Collect {
            session: start.session,
        }),
        11,
    );
    rig.mta.tick(11);

    let route = rig.mta.routes.ids().next().expect("suspended route");
    assert!(rig.mta.routes.get(route).flags.intersects(RouteFlags::DISABLED));

    rig.mta.dispatch(
        MtaEvent::Control(ControlRequest::ResumeRoute {
            id: rig.mta.routes.get(route).id,
        }),
        12,
    );
    let r = rig.mta.routes.get(route);
    assert!(!r.flags.intersects(RouteFlags::DISABLED));
    assert!(r.flags.contains(RouteFlags::NEW));
    assert_eq!(r.penalty, 1);
}
