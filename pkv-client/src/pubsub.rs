//! # Pub/Sub Subscription Registry
//!
//! Purpose: Track listener interest per channel and per pattern, and
//! deduplicate server-level (un)subscribe traffic so the wire sees one
//! command per registry transition, never one per listener.
//!
//! ## Design Principles
//! 1. **Transition-Driven Traffic**: A server command is issued only when a
//!    name goes from zero to one listeners, or back to zero.
//! 2. **Batched Settlement**: A multi-name request carries one future and
//!    one remaining-acks counter; counters move from settling to settled
//!    only when the whole batch is acknowledged.
//! 3. **Reconnect Survival**: Listener sets outlive the connection; only
//!    the server-side subscription state is rebuilt.

use std::collections::HashMap;
use std::sync::Arc;

/// Callback invoked with `(payload, channel)` for each delivered message.
pub type PubSubListener = Arc<dyn Fn(&[u8], &[u8]) + Send + Sync>;

/// Whether interest is keyed by exact channel name or by glob pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubSubKind {
    Channel,
    Pattern,
}

impl PubSubKind {
    pub(crate) fn subscribe_verb(self) -> &'static [u8] {
        match self {
            PubSubKind::Channel => b"SUBSCRIBE",
            PubSubKind::Pattern => b"PSUBSCRIBE",
        }
    }

    pub(crate) fn unsubscribe_verb(self) -> &'static [u8] {
        match self {
            PubSubKind::Channel => b"UNSUBSCRIBE",
            PubSubKind::Pattern => b"PUNSUBSCRIBE",
        }
    }
}

/// Direction of a settling batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SettleDir {
    Subscribe,
    Unsubscribe,
}

type ListenerMap = HashMap<Vec<u8>, Vec<PubSubListener>>;

/// Aggregate subscription state for one connection.
#[derive(Default)]
pub(crate) struct PubSubRegistry {
    subscribing: usize,
    subscribed: usize,
    unsubscribing: usize,
    channels: ListenerMap,
    patterns: ListenerMap,
}

impl PubSubRegistry {
    pub(crate) fn new() -> Self {
        PubSubRegistry::default()
    }

    /// True while any subscription is active or settling in either
    /// direction. Consulted by admission control and the demultiplexer.
    pub(crate) fn is_active(&self) -> bool {
        self.subscribed > 0 || self.subscribing > 0 || self.unsubscribing > 0
    }

    /// Records `listener` against each name and returns the names that
    /// actually need a server-level subscribe (the zero-to-one ones).
    pub(crate) fn plan_subscribe(
        &mut self,
        kind: PubSubKind,
        names: &[&[u8]],
        listener: &PubSubListener,
    ) -> Vec<Vec<u8>> {
        let map = self.map_mut(kind);
        let mut fresh = Vec::new();
        for name in names {
            match map.get_mut(*name) {
                Some(set) => {
                    if !set.iter().any(|known| Arc::ptr_eq(known, listener)) {
                        set.push(Arc::clone(listener));
                    }
                }
                None => {
                    map.insert(name.to_vec(), vec![Arc::clone(listener)]);
                    fresh.push(name.to_vec());
                }
            }
        }
        fresh
    }

    /// Drops `listener` (or, with `None`, every listener) from each name and
    /// returns the names that now need a server-level unsubscribe.
    pub(crate) fn plan_unsubscribe(
        &mut self,
        kind: PubSubKind,
        names: &[&[u8]],
        listener: Option<&PubSubListener>,
    ) -> Vec<Vec<u8>> {
        let map = self.map_mut(kind);
        let mut stale = Vec::new();
        for name in names {
            let Some(set) = map.get_mut(*name) else {
                continue;
            };

            let drop_name = match listener {
                Some(listener) => {
                    set.retain(|known| !Arc::ptr_eq(known, listener));
                    set.is_empty()
                }
                // Forced unsubscribe: clear regardless of remaining interest.
                None => true,
            };

            if drop_name {
                map.remove(*name);
                stale.push(name.to_vec());
            }
        }
        stale
    }

    /// Returns every registered name for a reconnect resubscribe, resetting
    /// the settling counters: the server-side state is assumed lost.
    pub(crate) fn reset_for_resubscribe(&mut self) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        self.subscribing = 0;
        self.subscribed = 0;
        self.unsubscribing = 0;
        (
            self.channels.keys().cloned().collect(),
            self.patterns.keys().cloned().collect(),
        )
    }

    pub(crate) fn has_interest(&self) -> bool {
        self.subscribed > 0 || self.subscribing > 0
    }

    pub(crate) fn begin(&mut self, dir: SettleDir, count: usize) {
        match dir {
            SettleDir::Subscribe => self.subscribing += count,
            SettleDir::Unsubscribe => self.unsubscribing += count,
        }
    }

    /// Batch fully acknowledged: move counts into (or out of) `settled`.
    pub(crate) fn commit(&mut self, dir: SettleDir, count: usize) {
        match dir {
            SettleDir::Subscribe => {
                self.subscribing = self.subscribing.saturating_sub(count);
                self.subscribed += count;
            }
            SettleDir::Unsubscribe => {
                self.unsubscribing = self.unsubscribing.saturating_sub(count);
                self.subscribed = self.subscribed.saturating_sub(count);
            }
        }
    }

    /// Batch failed before settling: only the in-progress counter unwinds.
    pub(crate) fn rollback(&mut self, dir: SettleDir, count: usize) {
        match dir {
            SettleDir::Subscribe => self.subscribing = self.subscribing.saturating_sub(count),
            SettleDir::Unsubscribe => self.unsubscribing = self.unsubscribing.saturating_sub(count),
        }
    }

    /// Snapshot of the listeners for an exact channel name.
    pub(crate) fn channel_listeners(&self, channel: &[u8]) -> Vec<PubSubListener> {
        self.channels.get(channel).cloned().unwrap_or_default()
    }

    /// Snapshot of the listeners for a matched pattern.
    pub(crate) fn pattern_listeners(&self, pattern: &[u8]) -> Vec<PubSubListener> {
        self.patterns.get(pattern).cloned().unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn counters(&self) -> (usize, usize, usize) {
        (self.subscribing, self.subscribed, self.unsubscribing)
    }

    fn map_mut(&mut self, kind: PubSubKind) -> &mut ListenerMap {
        match kind {
            PubSubKind::Channel => &mut self.channels,
            PubSubKind::Pattern => &mut self.patterns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener() -> PubSubListener {
        Arc::new(|_payload: &[u8], _channel: &[u8]| {})
    }

    #[test]
    fn second_listener_needs_no_server_command() {
        let mut registry = PubSubRegistry::new();
        let (first, second) = (listener(), listener());

        let fresh = registry.plan_subscribe(PubSubKind::Channel, &[b"news"], &first);
        assert_eq!(fresh, vec![b"news".to_vec()]);

        let fresh = registry.plan_subscribe(PubSubKind::Channel, &[b"news"], &second);
        assert!(fresh.is_empty());
        assert_eq!(registry.channel_listeners(b"news").len(), 2);
    }

    #[test]
    fn duplicate_listener_is_recorded_once() {
        let mut registry = PubSubRegistry::new();
        let one = listener();
        registry.plan_subscribe(PubSubKind::Channel, &[b"news"], &one);
        registry.plan_subscribe(PubSubKind::Channel, &[b"news"], &one);
        assert_eq!(registry.channel_listeners(b"news").len(), 1);
    }

    #[test]
    fn unsubscribe_fires_only_for_the_last_listener() {
        let mut registry = PubSubRegistry::new();
        let (first, second) = (listener(), listener());
        registry.plan_subscribe(PubSubKind::Channel, &[b"news"], &first);
        registry.plan_subscribe(PubSubKind::Channel, &[b"news"], &second);

        let stale = registry.plan_unsubscribe(PubSubKind::Channel, &[b"news"], Some(&first));
        assert!(stale.is_empty());

        let stale = registry.plan_unsubscribe(PubSubKind::Channel, &[b"news"], Some(&second));
        assert_eq!(stale, vec![b"news".to_vec()]);
        assert!(registry.channel_listeners(b"news").is_empty());
    }

    #[test]
    fn forced_unsubscribe_ignores_remaining_listeners() {
        let mut registry = PubSubRegistry::new();
        let (first, second) = (listener(), listener());
        registry.plan_subscribe(PubSubKind::Pattern, &[b"news.*"], &first);
        registry.plan_subscribe(PubSubKind::Pattern, &[b"news.*"], &second);

        let stale = registry.plan_unsubscribe(PubSubKind::Pattern, &[b"news.*"], None);
        assert_eq!(stale, vec![b"news.*".to_vec()]);
        assert!(registry.pattern_listeners(b"news.*").is_empty());
    }

    #[test]
    fn settlement_moves_counters() {
        let mut registry = PubSubRegistry::new();
        registry.begin(SettleDir::Subscribe, 2);
        assert!(registry.is_active());
        assert_eq!(registry.counters(), (2, 0, 0));

        registry.commit(SettleDir::Subscribe, 2);
        assert_eq!(registry.counters(), (0, 2, 0));

        registry.begin(SettleDir::Unsubscribe, 2);
        registry.commit(SettleDir::Unsubscribe, 2);
        assert_eq!(registry.counters(), (0, 0, 0));
        assert!(!registry.is_active());
    }

    #[test]
    fn rollback_keeps_settled_count() {
        let mut registry = PubSubRegistry::new();
        registry.begin(SettleDir::Subscribe, 1);
        registry.commit(SettleDir::Subscribe, 1);
        registry.begin(SettleDir::Unsubscribe, 1);
        registry.rollback(SettleDir::Unsubscribe, 1);
        assert_eq!(registry.counters(), (0, 1, 0));
    }

    #[test]
    fn resubscribe_resets_counters_and_keeps_listeners() {
        let mut registry = PubSubRegistry::new();
        let one = listener();
        registry.plan_subscribe(PubSubKind::Channel, &[b"a", b"b"], &one);
        registry.plan_subscribe(PubSubKind::Pattern, &[b"p.*"], &one);
        registry.begin(SettleDir::Subscribe, 3);
        registry.commit(SettleDir::Subscribe, 3);

        let (mut channels, patterns) = registry.reset_for_resubscribe();
        channels.sort();
        assert_eq!(channels, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(patterns, vec![b"p.*".to_vec()]);
        assert_eq!(registry.counters(), (0, 0, 0));
        assert_eq!(registry.channel_listeners(b"a").len(), 1);
    }
}
