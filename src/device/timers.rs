//! Per-peer protocol timers
//!
//! Five logical timers drive the handshake and keepalive schedule:
//! retransmit-handshake, send-keepalive, new-handshake, zero-key-material
//! and persistent-keepalive. Deadlines are stored per peer and polled by
//! one device-wide maintenance task; event hooks on the data path arm and
//! disarm them.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::net::Bind;
use crate::tunnel::Tun;

use super::peer::Peer;
use super::{
    Device, KEEPALIVE_TIMEOUT, MAX_TIMER_HANDSHAKES, REJECT_AFTER_TIME, REKEY_TIMEOUT,
};

/// How often deadlines are polled
const TICK: Duration = Duration::from_millis(100);

/// Retransmits are jittered to keep racing initiators from
/// synchronizing
const JITTER_MAX: Duration = Duration::from_millis(334);

pub(crate) struct Timers {
    retransmit_handshake: Mutex<Option<Instant>>,
    send_keepalive: Mutex<Option<Instant>>,
    new_handshake: Mutex<Option<Instant>>,
    zero_key_material: Mutex<Option<Instant>>,
    persistent_keepalive: Mutex<Option<Instant>>,

    pub handshake_attempts: AtomicU32,
    need_another_keepalive: AtomicBool,
    pub sent_last_minute_handshake: AtomicBool,
    last_sent_handshake: Mutex<Option<Instant>>,
}

/// Deadlines that fired on one poll
#[derive(Default)]
pub(crate) struct Expired {
    pub retransmit_handshake: bool,
    pub send_keepalive: bool,
    pub new_handshake: bool,
    pub zero_key_material: bool,
    pub persistent_keepalive: bool,
}

fn arm(slot: &Mutex<Option<Instant>>, after: Duration) {
    *slot.lock().expect("timer lock") = Some(Instant::now() + after);
}

fn arm_if_idle(slot: &Mutex<Option<Instant>>, after: Duration) -> bool {
    let mut slot = slot.lock().expect("timer lock");
    if slot.is_none() {
        *slot = Some(Instant::now() + after);
        true
    } else {
        false
    }
}

fn disarm(slot: &Mutex<Option<Instant>>) {
    *slot.lock().expect("timer lock") = None;
}

fn fire_if_due(slot: &Mutex<Option<Instant>>, now: Instant) -> bool {
    let mut slot = slot.lock().expect("timer lock");
    if slot.is_some_and(|at| at <= now) {
        *slot = None;
        true
    } else {
        false
    }
}

impl Timers {
    pub fn new() -> Self {
        Self {
            retransmit_handshake: Mutex::new(None),
            send_keepalive: Mutex::new(None),
            new_handshake: Mutex::new(None),
            zero_key_material: Mutex::new(None),
            persistent_keepalive: Mutex::new(None),
            handshake_attempts: AtomicU32::new(0),
            need_another_keepalive: AtomicBool::new(false),
            sent_last_minute_handshake: AtomicBool::new(false),
            last_sent_handshake: Mutex::new(None),
        }
    }

    pub fn clear_all(&self) {
        disarm(&self.retransmit_handshake);
        disarm(&self.send_keepalive);
        disarm(&self.new_handshake);
        disarm(&self.zero_key_material);
        disarm(&self.persistent_keepalive);
        self.handshake_attempts.store(0, Ordering::Relaxed);
        self.need_another_keepalive.store(false, Ordering::Relaxed);
        self.sent_last_minute_handshake.store(false, Ordering::Relaxed);
    }

    /// A data packet was queued for sending: make sure a handshake will
    /// happen if the peer stays silent.
    pub fn data_sent(&self) {
        arm_if_idle(&self.new_handshake, KEEPALIVE_TIMEOUT + REKEY_TIMEOUT);
    }

    /// A data packet arrived: answer with a keepalive unless real traffic
    /// goes out first.
    pub fn data_received(&self) {
        if !arm_if_idle(&self.send_keepalive, KEEPALIVE_TIMEOUT) {
            self.need_another_keepalive.store(true, Ordering::Relaxed);
        }
    }

    pub fn any_authenticated_packet_sent(&self) {
        disarm(&self.send_keepalive);
    }

    pub fn any_authenticated_packet_received(&self) {
        disarm(&self.new_handshake);
    }

    /// Any authenticated traffic in either direction feeds the persistent
    /// keepalive schedule
    pub fn any_authenticated_packet_traversal(&self, keepalive_secs: u32) {
        if keepalive_secs > 0 {
            arm(
                &self.persistent_keepalive,
                Duration::from_secs(keepalive_secs as u64),
            );
        }
    }

    pub fn handshake_initiated(&self) {
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..JITTER_MAX);
        arm(&self.retransmit_handshake, REKEY_TIMEOUT + jitter);
    }

    pub fn handshake_complete(&self) {
        disarm(&self.retransmit_handshake);
        self.handshake_attempts.store(0, Ordering::Relaxed);
        self.sent_last_minute_handshake.store(false, Ordering::Relaxed);
    }

    /// Key material was derived: schedule its forced destruction
    pub fn session_derived(&self) {
        arm(&self.zero_key_material, REJECT_AFTER_TIME * 3);
    }

    /// Debounce for handshake initiations; true when a send is allowed
    pub fn start_handshake_send(&self) -> bool {
        let mut last = self.last_sent_handshake.lock().expect("timer lock");
        if last.is_some_and(|t| t.elapsed() < REKEY_TIMEOUT) {
            return false;
        }
        *last = Some(Instant::now());
        true
    }

    pub fn take_need_another_keepalive(&self) -> bool {
        self.need_another_keepalive.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn take_expired(&self, now: Instant) -> Expired {
        Expired {
            retransmit_handshake: fire_if_due(&self.retransmit_handshake, now),
            send_keepalive: fire_if_due(&self.send_keepalive, now),
            new_handshake: fire_if_due(&self.new_handshake, now),
            zero_key_material: fire_if_due(&self.zero_key_material, now),
            persistent_keepalive: fire_if_due(&self.persistent_keepalive, now),
        }
    }

    fn zero_key_material_armed(&self) -> bool {
        self.zero_key_material.lock().expect("timer lock").is_some()
    }
}

/// Device maintenance task: polls every peer's deadlines
pub(crate) async fn run_timer_loop<T: Tun, B: Bind>(device: Arc<Device<T, B>>) {
    let mut shutdown = device.subscribe_shutdown();
    let mut tick = tokio::time::interval(TICK);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return,
        }

        let now = Instant::now();
        for peer in device.peer_snapshot() {
            if !peer.is_running() {
                continue;
            }
            let expired = peer.timers.take_expired(now);

            if expired.retransmit_handshake {
                on_retransmit_expired(&device, &peer).await;
            }
            if expired.send_keepalive {
                device.send_keepalive(&peer).await;
                if peer.timers.take_need_another_keepalive() {
                    arm(&peer.timers.send_keepalive, KEEPALIVE_TIMEOUT);
                }
            }
            if expired.new_handshake {
                tracing::debug!("{peer:?}: retrying handshake (no response to data)");
                peer.clear_endpoint_src();
                let _ = device.send_handshake_initiation(&peer, false).await;
            }
            if expired.zero_key_material {
                tracing::debug!("{peer:?}: discarding expired key material");
                device.expire_peer_sessions(&peer);
            }
            if expired.persistent_keepalive
                && peer.persistent_keepalive.load(Ordering::Relaxed) > 0
            {
                device.send_keepalive(&peer).await;
            }
        }
    }
}

async fn on_retransmit_expired<T: Tun, B: Bind>(device: &Arc<Device<T, B>>, peer: &Arc<Peer>) {
    let attempts = peer.timers.handshake_attempts.load(Ordering::Relaxed);
    if attempts > MAX_TIMER_HANDSHAKES {
        tracing::debug!("{peer:?}: handshake did not complete, giving up");
        for frame in peer.flush_staged() {
            device.pool.put(frame);
        }
        // residue of the abandoned exchange still gets destroyed
        if !peer.timers.zero_key_material_armed() {
            peer.timers.session_derived();
        }
        return;
    }

    peer.timers.handshake_attempts.store(attempts + 1, Ordering::Relaxed);
    tracing::debug!(
        "{peer:?}: handshake attempt {} unanswered, retrying",
        attempts + 1
    );
    // routing may have changed; let the kernel pick a new source
    peer.clear_endpoint_src();
    let _ = device.send_handshake_initiation(peer, true).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_received_arms_keepalive_once() {
        let timers = Timers::new();
        timers.data_received();
        timers.data_received();
        assert!(timers.take_need_another_keepalive());
        assert!(!timers.take_need_another_keepalive());
    }

    #[test]
    fn authenticated_send_cancels_pending_keepalive() {
        let timers = Timers::new();
        timers.data_received();
        timers.any_authenticated_packet_sent();
        let expired = timers.take_expired(Instant::now() + KEEPALIVE_TIMEOUT * 2);
        assert!(!expired.send_keepalive);
    }

    #[test]
    fn new_handshake_fires_when_peer_stays_silent() {
        let timers = Timers::new();
        timers.data_sent();
        let not_yet = timers.take_expired(Instant::now());
        assert!(!not_yet.new_handshake);
        let later = timers.take_expired(Instant::now() + KEEPALIVE_TIMEOUT + REKEY_TIMEOUT * 2);
        assert!(later.new_handshake);
        // one-shot: already disarmed
        let again = timers.take_expired(Instant::now() + KEEPALIVE_TIMEOUT + REKEY_TIMEOUT * 2);
        assert!(!again.new_handshake);
    }

    #[test]
    fn receive_cancels_new_handshake() {
        let timers = Timers::new();
        timers.data_sent();
        timers.any_authenticated_packet_received();
        let expired = timers.take_expired(Instant::now() + KEEPALIVE_TIMEOUT + REKEY_TIMEOUT * 2);
        assert!(!expired.new_handshake);
    }

    #[test]
    fn handshake_send_debounces() {
        let timers = Timers::new();
        assert!(timers.start_handshake_send());
        assert!(!timers.start_handshake_send(), "within REKEY_TIMEOUT");
    }

    #[test]
    fn persistent_keepalive_only_when_configured() {
        let timers = Timers::new();
        timers.any_authenticated_packet_traversal(0);
        let expired = timers.take_expired(Instant::now() + Duration::from_secs(3600));
        assert!(!expired.persistent_keepalive);

        timers.any_authenticated_packet_traversal(25);
        let expired = timers.take_expired(Instant::now() + Duration::from_secs(26));
        assert!(expired.persistent_keepalive);
    }
}
