//! Event-subscription bookkeeping: SID/SEQ/timeout tracking per service,
//! renewal-by-callback dedup and consecutive-error eviction.
//!
//! Grounded in the reference renderer's `add_subscribe`/`renew_subscribe`/
//! `remove_subscribe` trio (per-client error counter, eviction past 10
//! consecutive failures) re-expressed with a single `RwLock<HashMap>`.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use anyhow::Context;
use parking_lot::RwLock;

use crate::{constants::MAX_SUBSCRIBER_CONSECUTIVE_ERRORS, registry::ServiceKind};

pub struct Subscription {
    pub service: ServiceKind,
    pub callback: url::Url,
    pub seq: u64,
    pub timeout: Duration,
    pub deadline: Instant,
    pub consecutive_errors: u32,
}

#[derive(Default)]
pub struct Subscriptions {
    subs: RwLock<HashMap<String, Subscription>>,
}

impl Subscriptions {
    /// Renews an existing (service, callback) subscriber if one exists,
    /// otherwise creates a fresh one. Returns `(sid, is_new)`.
    pub fn subscribe(
        &self,
        service: ServiceKind,
        callback: url::Url,
        timeout: Duration,
    ) -> (String, bool) {
        let mut g = self.subs.write();
        if let Some((sid, sub)) = g
            .iter_mut()
            .find(|(_, s)| s.service == service && s.callback == callback)
        {
            sub.timeout = timeout;
            sub.deadline = Instant::now() + timeout;
            return (sid.clone(), false);
        }
        let sid = format!("uuid:{}", uuid::Uuid::new_v4());
        g.insert(
            sid.clone(),
            Subscription {
                service,
                callback,
                seq: 0,
                timeout,
                deadline: Instant::now() + timeout,
                consecutive_errors: 0,
            },
        );
        (sid, true)
    }

    pub fn renew_by_sid(&self, sid: &str, timeout: Duration) -> anyhow::Result<()> {
        let mut g = self.subs.write();
        let s = g.get_mut(sid).context("no such subscription")?;
        s.timeout = timeout;
        s.deadline = Instant::now() + timeout;
        Ok(())
    }

    pub fn remove(&self, sid: &str) -> anyhow::Result<Subscription> {
        self.subs.write().remove(sid).context("no such subscription")
    }

    pub fn next_seq(&self, sid: &str) -> anyhow::Result<u64> {
        let mut g = self.subs.write();
        let s = g.get_mut(sid).context("no such subscription")?;
        let seq = s.seq;
        s.seq += 1;
        Ok(seq)
    }

    pub fn contains(&self, sid: &str) -> bool {
        self.subs.read().contains_key(sid)
    }

    pub fn timeout(&self, sid: &str) -> anyhow::Result<Duration> {
        Ok(self.subs.read().get(sid).context("no such subscription")?.timeout)
    }

    /// Snapshot of (sid, callback) for every live subscriber of `service`,
    /// used by the notifier tick to fan a batch of changes out.
    pub fn for_service(&self, service: ServiceKind) -> Vec<(String, url::Url)> {
        self.subs
            .read()
            .iter()
            .filter(|(_, s)| s.service == service)
            .map(|(sid, s)| (sid.clone(), s.callback.clone()))
            .collect()
    }

    /// Removes every subscriber whose deadline has passed; returns their sids.
    pub fn expire(&self) -> Vec<String> {
        let now = Instant::now();
        let mut g = self.subs.write();
        let expired: Vec<String> = g
            .iter()
            .filter(|(_, s)| s.deadline <= now)
            .map(|(sid, _)| sid.clone())
            .collect();
        for sid in &expired {
            g.remove(sid);
        }
        expired
    }

    /// Records a failed NOTIFY delivery; returns `true` if the subscriber
    /// crossed the consecutive-error threshold and was evicted.
    pub fn record_error(&self, sid: &str) -> bool {
        let mut g = self.subs.write();
        if let Some(s) = g.get_mut(sid) {
            s.consecutive_errors += 1;
            if s.consecutive_errors >= MAX_SUBSCRIBER_CONSECUTIVE_ERRORS {
                g.remove(sid);
                return true;
            }
        }
        false
    }

    pub fn reset_error(&self, sid: &str) {
        if let Some(s) = self.subs.write().get_mut(sid) {
            s.consecutive_errors = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cb(s: &str) -> url::Url {
        url::Url::parse(s).unwrap()
    }

    #[test]
    fn test_subscribe_then_resubscribe_same_callback_reuses_sid() {
        let subs = Subscriptions::default();
        let (sid1, is_new1) =
            subs.subscribe(ServiceKind::AvTransport, cb("http://1.2.3.4:9/e"), Duration::from_secs(60));
        assert!(is_new1);
        subs.next_seq(&sid1).unwrap();
        subs.next_seq(&sid1).unwrap();

        let (sid2, is_new2) =
            subs.subscribe(ServiceKind::AvTransport, cb("http://1.2.3.4:9/e"), Duration::from_secs(1800));
        assert!(!is_new2);
        assert_eq!(sid1, sid2);
        // SEQ did not reset on renewal.
        assert_eq!(subs.next_seq(&sid2).unwrap(), 2);
    }

    #[test]
    fn test_unsubscribe_then_subscribe_again_gets_new_sid() {
        let subs = Subscriptions::default();
        let (sid1, _) =
            subs.subscribe(ServiceKind::AvTransport, cb("http://1.2.3.4:9/e"), Duration::from_secs(60));
        subs.remove(&sid1).unwrap();

        let (sid2, is_new) =
            subs.subscribe(ServiceKind::AvTransport, cb("http://1.2.3.4:9/e"), Duration::from_secs(60));
        assert!(is_new);
        assert_ne!(sid1, sid2);
        assert_eq!(subs.next_seq(&sid2).unwrap(), 0);
    }

    #[test]
    fn test_seq_is_monotonic_per_subscriber() {
        let subs = Subscriptions::default();
        let (sid, _) =
            subs.subscribe(ServiceKind::RenderingControl, cb("http://1.2.3.4:9/e"), Duration::from_secs(60));
        for expected in 0..5u64 {
            assert_eq!(subs.next_seq(&sid).unwrap(), expected);
        }
    }

    #[test]
    fn test_error_eviction_at_threshold() {
        let subs = Subscriptions::default();
        let (sid, _) =
            subs.subscribe(ServiceKind::AvTransport, cb("http://1.2.3.4:9/e"), Duration::from_secs(60));
        for _ in 0..MAX_SUBSCRIBER_CONSECUTIVE_ERRORS - 1 {
            assert!(!subs.record_error(&sid));
        }
        assert!(subs.record_error(&sid));
        assert!(!subs.contains(&sid));
    }

    #[test]
    fn test_expire_removes_past_deadline() {
        let subs = Subscriptions::default();
        let (sid, _) =
            subs.subscribe(ServiceKind::AvTransport, cb("http://1.2.3.4:9/e"), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        let expired = subs.expire();
        assert_eq!(expired, vec![sid]);
    }
}
