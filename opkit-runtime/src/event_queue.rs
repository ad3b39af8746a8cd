//! The per-object event queue
//!
//! Pending reconcile intents, one slot per [`ObjectRef`], moving through
//! three phases:
//!
//! - **queued** — waiting for an eligibility deadline in a timer wheel.
//!   A second intent for the same object collapses into the existing slot,
//!   with the earlier deadline winning.
//! - **parked** — the deadline passed while the object was being reconciled.
//!   At most one parked intent exists per object; anything else arriving
//!   mid-flight only bumps its coalescing counter. This is what bounds
//!   follow-up work to a single reconcile no matter how many events landed
//!   during the attempt, which stays correct because the dispatched
//!   reconcile reads the newest object from the store, not an enqueued
//!   snapshot.
//! - **in flight** — the reconcile future produced by the dispatch callback
//!   is running. No second future for the same object is ever created while
//!   one exists; intents for one object therefore execute strictly in
//!   arrival order, while distinct objects proceed independently.
//!
//! The queue is a [`Stream`] of reconcile outcomes and terminates once its
//! intent source ends and every phase has drained.

use crate::controller::{ReconcileReason, ReconcileRequest};
use crate::reflector::ObjectRef;
use futures::{stream::Fuse, Future, FutureExt, Stream, StreamExt};
use hashbrown::{hash_map::Entry, HashMap};
use opkit_core::resource::Resource;
use pin_project::pin_project;
use std::{
    fmt::Debug,
    hash::Hash,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::time::delay_queue::{self, DelayQueue};

/// An intent to reconcile one object at (or after) `run_at`.
pub struct QueueRequest<K: Resource> {
    pub request: ReconcileRequest<K>,
    pub run_at: Instant,
}

impl<K: Resource> Debug for QueueRequest<K>
where
    K::DynamicType: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRequest")
            .field("request", &self.request)
            .field("run_at", &self.run_at)
            .finish()
    }
}

/// A queued intent waiting for its eligibility deadline.
struct QueuedIntent {
    reason: ReconcileReason,
    eligible_at: Instant,
    timer: delay_queue::Key,
}

/// An intent whose deadline passed while its object was in flight.
struct ParkedIntent {
    reason: ReconcileReason,
    /// How many further intents were folded into this one mid-flight
    coalesced: u32,
}

/// See the [module docs](self).
///
/// `run` is called with the deduplicated [`ReconcileRequest`] whenever an
/// object becomes eligible and is not already in flight; the returned future
/// is driven by the queue itself and its output becomes the stream item.
#[pin_project(project = EventQueueProj)]
pub struct EventQueue<K, R, F, MkF>
where
    K: Resource,
    K::DynamicType: Eq + Hash,
{
    /// Incoming intents; watch triggers and requeues multiplexed upstream.
    #[pin]
    requests: Fuse<R>,
    run: MkF,
    /// Timer wheel holding one entry per queued object.
    timers: DelayQueue<ObjectRef<K>>,
    queued: HashMap<ObjectRef<K>, QueuedIntent>,
    parked: HashMap<ObjectRef<K>, ParkedIntent>,
    in_flight: HashMap<ObjectRef<K>, F>,
    /// Settling time added to every deadline, so bursts of instantly
    /// eligible intents for one object collapse before dispatch.
    debounce: Duration,
}

impl<K, R, F, MkF> EventQueue<K, R, F, MkF>
where
    K: Resource,
    K::DynamicType: Eq + Hash,
    R: Stream<Item = QueueRequest<K>>,
    F: Future + Unpin,
    MkF: FnMut(ReconcileRequest<K>) -> F,
{
    pub fn new(requests: R, debounce: Duration, run: MkF) -> Self {
        Self {
            requests: requests.fuse(),
            run,
            timers: DelayQueue::new(),
            queued: HashMap::new(),
            parked: HashMap::new(),
            in_flight: HashMap::new(),
            debounce,
        }
    }
}

impl<K, R, F, MkF> EventQueueProj<'_, K, R, F, MkF>
where
    K: Resource,
    K::DynamicType: Eq + Hash + Clone,
    F: Future + Unpin,
    MkF: FnMut(ReconcileRequest<K>) -> F,
{
    /// Take in one intent, collapsing it into whatever slot its object
    /// already occupies.
    fn accept(&mut self, intent: QueueRequest<K>) {
        let QueueRequest { request, run_at } = intent;
        let ReconcileRequest { obj_ref: key, reason } = request;
        // in-flight objects accumulate at most one follow-up
        if self.in_flight.contains_key(&key) {
            self.park(key, reason);
            return;
        }
        match self.queued.entry(key) {
            // The slot is occupied but would run later than the newcomer
            // asks for (e.g. a watch event arriving under a long requeue):
            // expedite it, and let the newcomer's reason win.
            Entry::Occupied(mut slot) if slot.get().eligible_at >= run_at => {
                let eligible_at = run_at + *self.debounce;
                let queued = slot.get_mut();
                self.timers.reset_at(&queued.timer, eligible_at);
                queued.eligible_at = eligible_at;
                queued.reason = reason;
            }
            // The slot already runs sooner; the newcomer is redundant.
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                let eligible_at = run_at + *self.debounce;
                let timer = self.timers.insert_at(slot.key().clone(), eligible_at);
                slot.insert(QueuedIntent {
                    reason,
                    eligible_at,
                    timer,
                });
            }
        }
    }

    /// Hold an intent for an in-flight object; only the first one is kept.
    fn park(&mut self, key: ObjectRef<K>, reason: ReconcileReason) {
        match self.parked.entry(key) {
            Entry::Occupied(mut parked) => parked.get_mut().coalesced += 1,
            Entry::Vacant(slot) => {
                slot.insert(ParkedIntent { reason, coalesced: 0 });
            }
        }
    }

    /// Start the reconcile future for an eligible intent.
    ///
    /// Callers guarantee the object is not queued anymore; an in-flight
    /// object parks instead, preserving the one-at-a-time invariant.
    fn dispatch(&mut self, key: ObjectRef<K>, reason: ReconcileReason, cx: &mut Context<'_>) {
        if self.in_flight.contains_key(&key) {
            self.park(key, reason);
            return;
        }
        let fut = (self.run)(ReconcileRequest {
            obj_ref: key.clone(),
            reason,
        });
        self.in_flight.insert(key, fut);
        // the fresh future still needs its first poll
        cx.waker().wake_by_ref();
    }

    /// Move every expired timer entry towards execution.
    fn drain_timers(&mut self, cx: &mut Context<'_>) {
        while let Poll::Ready(Some(expired)) = self.timers.poll_expired(cx) {
            let key = expired.into_inner();
            let intent = self
                .queued
                .remove(&key)
                .expect("expired timer without a queued intent");
            self.dispatch(key, intent.reason, cx);
        }
    }

    /// Drive the running reconciles, returning the first finished outcome.
    ///
    /// Finishing an object frees its slot; a parked follow-up is dispatched
    /// on the spot rather than going back through the timer wheel, since its
    /// deadline already passed.
    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<F::Output> {
        let finished = self
            .in_flight
            .iter_mut()
            .find_map(|(key, fut)| match fut.poll_unpin(cx) {
                Poll::Ready(outcome) => Some((key.clone(), outcome)),
                Poll::Pending => None,
            });
        let Some((key, outcome)) = finished else {
            return Poll::Pending;
        };
        self.in_flight.remove(&key);
        if let Some(parked) = self.parked.remove(&key) {
            if parked.coalesced > 0 {
                tracing::trace!(
                    object = %key,
                    coalesced = parked.coalesced,
                    "dispatching coalesced follow-up reconcile"
                );
            }
            self.dispatch(key, parked.reason, cx);
        }
        // other reconciles may have finished in the meantime
        cx.waker().wake_by_ref();
        Poll::Ready(outcome)
    }
}

impl<K, R, F, MkF> Stream for EventQueue<K, R, F, MkF>
where
    K: Resource,
    K::DynamicType: Eq + Hash + Clone,
    R: Stream<Item = QueueRequest<K>>,
    F: Future + Unpin,
    MkF: FnMut(ReconcileRequest<K>) -> F,
{
    type Item = F::Output;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match this.requests.as_mut().poll_next(cx) {
                Poll::Ready(Some(intent)) => this.accept(intent),
                Poll::Ready(None) | Poll::Pending => break,
            }
        }
        this.drain_timers(cx);
        if let Poll::Ready(outcome) = this.poll_in_flight(cx) {
            return Poll::Ready(Some(outcome));
        }
        let drained = this.queued.is_empty() && this.parked.is_empty() && this.in_flight.is_empty();
        if this.requests.is_done() && drained {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}
