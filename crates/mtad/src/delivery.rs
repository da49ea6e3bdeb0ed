use crate::ipc::QueueNotice;
use crate::relay::Envelope;
use crate::sched::Mta;
use runq::UnixTime;
use std::time::Duration;

/// Per-envelope verdict reported back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Ok,
    TempFail,
    PermFail,
    Loop,
}

fn duration_to_text(seconds: UnixTime) -> String {
    humantime::format_duration(Duration::from_secs(seconds.max(0) as u64)).to_string()
}

impl Mta {
    /// Log the delivery result and notify the queue.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn delivery(
        &mut self,
        envelope: &Envelope,
        sender: &str,
        source: Option<&str>,
        relay: &str,
        delivery: Delivery,
        status: &str,
        penalty: u32,
        now: UnixTime,
    ) {
        let (prefix, status) = match delivery {
            Delivery::Ok => ("Ok", status),
            Delivery::TempFail => ("TempFail", status),
            Delivery::PermFail => ("PermFail", status),
            Delivery::Loop => ("PermFail", "Loop detected"),
        };
        tracing::info!(
            "relay: {prefix} for {:016x}: session={:016x}, from=<{sender}>, to=<{}>, \
             rcpt=<{}>, source={}, relay={relay}, delay={}, stat={status}",
            envelope.id,
            envelope.session,
            envelope.dest,
            envelope.rcpt.as_deref().unwrap_or("-"),
            source.unwrap_or("-"),
            duration_to_text(now - envelope.creation),
        );

        let notice = match delivery {
            Delivery::Ok => QueueNotice::Ok { evpid: envelope.id },
            Delivery::TempFail => QueueNotice::TempFail {
                evpid: envelope.id,
                penalty,
                reason: status.to_string(),
            },
            Delivery::PermFail => QueueNotice::PermFail {
                evpid: envelope.id,
                reason: status.to_string(),
            },
            Delivery::Loop => QueueNotice::Loop { evpid: envelope.id },
        };
        self.peers.queue.send(notice).ok();
    }
}
