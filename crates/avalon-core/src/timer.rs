//! Timer grain: a deadline/interval driven event emitter.
//!
//! A timer is created from a [`TimerRequest`] and from then on lives on its
//! own, addressed only through the topics it publishes to. Each fire
//! publishes a [`TimerFired`] carrying the request payload to the reply
//! topic. When the repeat count is exhausted it publishes a
//! [`TimerStopped`] on [`topics::TIMER_STATUS`] and terminates.
//!
//! # Modes
//!
//! - **Building**: fires once at `start + interval`, immediately if that
//!   deadline has already passed, then terminates.
//! - **Generator**: fires once per interval already elapsed since `start`
//!   (catch-up), then on every interval forever.
//! - **Transformer**: like a generator, but every fire is preceded by a
//!   reservation of the payload's `cost` lines on the owning inventory. A
//!   failed reservation skips that tick; nothing is queued or retried.
//!
//! The schedule and the heartbeat run as separate tasks that post into the
//! timer's mailbox, so all state changes happen on the grain's own loop.

use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use avalon_types::{
    GrainKind, InventoryId, Payload, ResourceName, TimerFired, TimerId, TimerKind, TimerStopped,
    TransformerCost, UpdateKind, keys, topics,
};

use crate::bus::{EventBus, publish_logged};
use crate::config::LivenessConfig;
use crate::inventory::InventoryError;
use crate::liveness::{announce, spawn_ticker};

const MAILBOX_CAPACITY: usize = 32;

/// Errors raised when creating or addressing a timer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    /// The request cannot be scheduled.
    #[error("invalid timer request: {reason}")]
    InvalidRequest {
        /// Why the request was rejected.
        reason: String,
    },

    /// A timer with this id is already running.
    #[error("timer {0} already started")]
    AlreadyStarted(TimerId),

    /// The timer has terminated.
    #[error("timer {0} has terminated")]
    Terminated(TimerId),
}

/// Reserves transformer inputs on the owning inventory.
#[async_trait]
pub trait ReservationGate: Send + Sync + 'static {
    /// All-or-nothing reservation of `resources` on `inventory` for one
    /// tick of `timer_id`. The reservation is held until that tick's
    /// [`TimerFired`] is settled.
    async fn reserve(
        &self,
        timer_id: TimerId,
        inventory: InventoryId,
        resources: BTreeMap<ResourceName, u64>,
    ) -> Result<(), InventoryError>;
}

/// Everything a timer needs from its host node.
#[derive(Clone)]
pub struct TimerContext {
    /// Bus for fires, stop notices and liveness.
    pub bus: Arc<dyn EventBus>,
    /// Gate consulted before every transformer fire.
    pub gate: Arc<dyn ReservationGate>,
    /// Node address reported in liveness updates.
    pub address: String,
    /// Heartbeat timing.
    pub liveness: LivenessConfig,
}

impl core::fmt::Debug for TimerContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimerContext")
            .field("address", &self.address)
            .field("liveness", &self.liveness)
            .finish_non_exhaustive()
    }
}

/// Parameters of a new timer.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerRequest {
    /// Id of the new timer.
    pub timer_id: TimerId,
    /// Behavioral mode.
    pub kind: TimerKind,
    /// Inventory owning the timer.
    pub inventory_id: InventoryId,
    /// Topic receiving [`TimerFired`] events.
    pub reply_topic: String,
    /// Time between fires.
    pub interval: Duration,
    /// Additional fires after the first; negative repeats forever.
    pub repeat_count: i64,
    /// Echoed on every fire.
    pub payload: Payload,
    /// Schedule origin; defaults to now.
    pub start: Option<DateTime<Utc>>,
}

/// Acknowledgement returned once the timer is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerCreated {
    /// The running timer.
    pub timer_id: TimerId,
    /// When the first fire is due.
    pub deadline: DateTime<Utc>,
}

/// Read-only projection of a running timer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerView {
    /// Timer id.
    pub timer_id: TimerId,
    /// Behavioral mode.
    pub kind: TimerKind,
    /// Owning inventory.
    pub inventory_id: InventoryId,
    /// Reply topic.
    pub reply_topic: String,
    /// Schedule origin.
    pub start: DateTime<Utc>,
    /// Interval in milliseconds.
    pub interval_ms: u64,
    /// Configured repeat count.
    pub repeat_count: i64,
    /// Fires published so far.
    pub fired: u64,
    /// Transformer ticks skipped for lack of resources.
    pub skipped: u64,
    /// Payload echoed on every fire.
    pub payload: Payload,
}

#[derive(Debug)]
enum TimerMessage {
    Elapsed,
    Heartbeat,
    Describe(oneshot::Sender<TimerView>),
}

/// Cloneable address of a running timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    timer_id: TimerId,
    tx: mpsc::Sender<TimerMessage>,
    stop: Arc<Notify>,
}

impl TimerHandle {
    /// Id of the addressed timer.
    pub const fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Whether the timer loop has exited.
    pub fn is_terminated(&self) -> bool {
        self.tx.is_closed()
    }

    /// Read-only view of the timer.
    pub async fn describe(&self) -> Result<TimerView, TimerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TimerMessage::Describe(reply))
            .await
            .map_err(|_closed| TimerError::Terminated(self.timer_id))?;
        rx.await.map_err(|_closed| TimerError::Terminated(self.timer_id))
    }

    /// Ask the timer to exit. Never blocks on the timer's mailbox.
    pub fn stop(&self) {
        self.stop.notify_one();
    }
}

/// Validate `request`, start the timer and return its handle.
pub fn start(
    request: TimerRequest,
    ctx: TimerContext,
) -> Result<(TimerHandle, TimerCreated), TimerError> {
    if request.kind != TimerKind::Building && request.interval.is_zero() {
        return Err(TimerError::InvalidRequest {
            reason: format!("{} timer needs a non-zero interval", request.kind),
        });
    }
    if request.kind == TimerKind::Building && request.repeat_count != 0 {
        return Err(TimerError::InvalidRequest {
            reason: "building timers are one-shot".to_owned(),
        });
    }

    let start = request.start.unwrap_or_else(Utc::now);
    let interval = chrono::Duration::from_std(request.interval).map_err(|_range| {
        TimerError::InvalidRequest {
            reason: "interval out of range".to_owned(),
        }
    })?;
    let deadline = start
        .checked_add_signed(interval)
        .ok_or_else(|| TimerError::InvalidRequest {
            reason: "deadline out of range".to_owned(),
        })?;

    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let stop = Arc::new(Notify::new());
    let timer_id = request.timer_id;

    let schedule = tokio::spawn(schedule(tx.clone(), start, request.interval));
    let heartbeat = spawn_ticker(
        tx.downgrade(),
        ctx.liveness.heartbeat_interval(),
        || TimerMessage::Heartbeat,
    );

    let grain = TimerGrain {
        request,
        start,
        fired: 0,
        skipped: 0,
        ctx,
        tasks: vec![schedule, heartbeat],
    };
    tokio::spawn(grain.run(rx, Arc::clone(&stop)));

    debug!(%timer_id, %deadline, "timer started");
    Ok((
        TimerHandle { timer_id, tx, stop },
        TimerCreated { timer_id, deadline },
    ))
}

/// Post one `Elapsed` per interval already past `start`, then one per
/// interval from now on. A zero interval posts a single `Elapsed`.
async fn schedule(tx: mpsc::Sender<TimerMessage>, start: DateTime<Utc>, interval: Duration) {
    let elapsed = Utc::now()
        .signed_duration_since(start)
        .to_std()
        .unwrap_or(Duration::ZERO);

    if interval.is_zero() {
        let _ = tx.send(TimerMessage::Elapsed).await;
        return;
    }

    let period = interval.as_nanos();
    let passed = elapsed.as_nanos();
    let catch_up = passed.checked_div(period).unwrap_or(0);
    let into_current = passed.checked_rem(period).unwrap_or(0);

    let mut sent: u128 = 0;
    while sent < catch_up {
        if tx.send(TimerMessage::Elapsed).await.is_err() {
            return;
        }
        sent = sent.saturating_add(1);
    }

    let first = interval.saturating_sub(Duration::from_nanos(
        u64::try_from(into_current).unwrap_or(u64::MAX),
    ));
    tokio::time::sleep(first).await;
    loop {
        if tx.send(TimerMessage::Elapsed).await.is_err() {
            return;
        }
        tokio::time::sleep(interval).await;
    }
}

struct TimerGrain {
    request: TimerRequest,
    start: DateTime<Utc>,
    fired: u64,
    skipped: u64,
    ctx: TimerContext,
    tasks: Vec<JoinHandle<()>>,
}

impl TimerGrain {
    async fn run(mut self, mut rx: mpsc::Receiver<TimerMessage>, stop: Arc<Notify>) {
        self.announce(UpdateKind::Register).await;

        loop {
            let message = tokio::select! {
                biased;
                () = stop.notified() => {
                    debug!(timer_id = %self.request.timer_id, "timer stopped by owner");
                    break;
                }
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match message {
                TimerMessage::Elapsed => {
                    if self.on_elapsed().await {
                        self.publish_stopped().await;
                        break;
                    }
                }
                TimerMessage::Heartbeat => self.announce(UpdateKind::Heartbeat).await,
                TimerMessage::Describe(reply) => {
                    let _ = reply.send(self.view());
                }
            }
        }

        for task in &self.tasks {
            task.abort();
        }
        self.announce(UpdateKind::Deregister).await;
    }

    /// Handle one wake-up. Returns `true` once the timer is exhausted.
    async fn on_elapsed(&mut self) -> bool {
        let timer_id = self.request.timer_id;

        if self.request.kind == TimerKind::Transformer {
            let costs = transformer_costs(&self.request.payload);
            if !costs.is_empty() {
                if let Err(e) = self
                    .ctx
                    .gate
                    .reserve(timer_id, self.request.inventory_id, costs)
                    .await
                {
                    self.skipped = self.skipped.saturating_add(1);
                    warn!(
                        %timer_id,
                        inventory_id = %self.request.inventory_id,
                        skipped = self.skipped,
                        error = %e,
                        "transformer tick skipped"
                    );
                    return false;
                }
            }
        }

        self.fired = self.fired.saturating_add(1);
        let event = TimerFired {
            timer_id,
            sequence: self.fired,
            timestamp: Utc::now(),
            payload: self.request.payload.clone(),
        };
        publish_logged(self.ctx.bus.as_ref(), &self.request.reply_topic, &event).await;
        debug!(%timer_id, sequence = self.fired, kind = %self.request.kind, "timer fired");

        u64::try_from(self.request.repeat_count)
            .is_ok_and(|repeats| self.fired > repeats)
    }

    async fn publish_stopped(&self) {
        let event = TimerStopped {
            timer_id: self.request.timer_id,
            inventory_id: self.request.inventory_id,
            timestamp: Utc::now(),
        };
        publish_logged(self.ctx.bus.as_ref(), topics::TIMER_STATUS, &event).await;
        info!(timer_id = %self.request.timer_id, fired = self.fired, "timer exhausted");
    }

    async fn announce(&self, update_kind: UpdateKind) {
        announce(
            self.ctx.bus.as_ref(),
            update_kind,
            GrainKind::Timer,
            self.request.timer_id.into_inner(),
            &self.ctx.address,
            self.liveness_context(),
        )
        .await;
    }

    fn liveness_context(&self) -> BTreeMap<String, String> {
        let mut context = BTreeMap::from([
            ("timer_kind".to_owned(), self.request.kind.to_string()),
            ("inventory".to_owned(), self.request.inventory_id.to_string()),
            ("fired".to_owned(), self.fired.to_string()),
        ]);
        for key in [keys::BUILDING, keys::RESOURCE, keys::TRANSFORMER] {
            if let Some(value) = avalon_types::events::payload_str(&self.request.payload, key) {
                context.insert(key.to_owned(), value.to_owned());
            }
        }
        context
    }

    fn view(&self) -> TimerView {
        TimerView {
            timer_id: self.request.timer_id,
            kind: self.request.kind,
            inventory_id: self.request.inventory_id,
            reply_topic: self.request.reply_topic.clone(),
            start: self.start,
            interval_ms: u64::try_from(self.request.interval.as_millis()).unwrap_or(u64::MAX),
            repeat_count: self.request.repeat_count,
            fired: self.fired,
            skipped: self.skipped,
            payload: self.request.payload.clone(),
        }
    }
}

/// Sum the `cost` lines of a transformer payload per resource.
pub fn transformer_costs(payload: &Payload) -> BTreeMap<ResourceName, u64> {
    let lines: Vec<TransformerCost> = payload
        .get(keys::COST)
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default();

    let mut costs = BTreeMap::new();
    for line in lines {
        let total: &mut u64 = costs.entry(line.resource).or_default();
        *total = total.saturating_add(line.amount);
    }
    costs
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures::{FutureExt, StreamExt};
    use serde_json::Value;

    use super::*;
    use crate::bus::{InMemoryBus, decode_event};

    struct FixedGate(AtomicBool);

    #[async_trait]
    impl ReservationGate for FixedGate {
        async fn reserve(
            &self,
            _timer_id: TimerId,
            _inventory: InventoryId,
            _resources: BTreeMap<ResourceName, u64>,
        ) -> Result<(), InventoryError> {
            if self.0.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(InventoryError::Unavailable)
            }
        }
    }

    fn context(bus: Arc<InMemoryBus>, gate_open: bool) -> TimerContext {
        TimerContext {
            bus,
            gate: Arc::new(FixedGate(AtomicBool::new(gate_open))),
            address: "test".to_owned(),
            liveness: LivenessConfig::default(),
        }
    }

    fn request(kind: TimerKind, interval: Duration, repeat_count: i64) -> TimerRequest {
        TimerRequest {
            timer_id: TimerId::new(),
            kind,
            inventory_id: InventoryId::new(),
            reply_topic: "replies".to_owned(),
            interval,
            repeat_count,
            payload: Payload::new(),
            start: None,
        }
    }

    fn drain<T: serde::de::DeserializeOwned>(stream: &mut crate::bus::BusStream) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(Some(bytes)) = stream.next().now_or_never() {
            if let Some(event) = decode_event("test", &bytes) {
                out.push(event);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn building_timer_fires_once_and_terminates() {
        let bus = Arc::new(InMemoryBus::new());
        let mut replies = bus.subscribe("replies").await.unwrap();
        let mut status = bus.subscribe(topics::TIMER_STATUS).await.unwrap();

        let req = request(TimerKind::Building, Duration::from_secs(10), 0);
        let timer_id = req.timer_id;
        let (handle, created) = start(req, context(Arc::clone(&bus), true)).unwrap();
        assert!(created.deadline > Utc::now());

        tokio::time::sleep(Duration::from_secs(15)).await;

        let fired: Vec<TimerFired> = drain(&mut replies);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].sequence, 1);
        let stopped: Vec<TimerStopped> = drain(&mut status);
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].timer_id, timer_id);
        assert!(handle.is_terminated());
        assert_eq!(handle.describe().await, Err(TimerError::Terminated(timer_id)));
    }

    #[tokio::test(start_paused = true)]
    async fn building_timer_past_deadline_fires_immediately() {
        let bus = Arc::new(InMemoryBus::new());
        let mut replies = bus.subscribe("replies").await.unwrap();

        let mut req = request(TimerKind::Building, Duration::from_secs(10), 0);
        req.start = Some(Utc::now() - chrono::Duration::seconds(60));
        let (handle, _) = start(req, context(Arc::clone(&bus), true)).unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;

        let fired: Vec<TimerFired> = drain(&mut replies);
        assert_eq!(fired.len(), 1);
        assert!(handle.is_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn generator_catches_up_then_ticks() {
        let bus = Arc::new(InMemoryBus::new());
        let mut replies = bus.subscribe("replies").await.unwrap();

        let mut req = request(TimerKind::Generator, Duration::from_secs(10), -1);
        req.start = Some(Utc::now() - chrono::Duration::seconds(25));
        let (handle, _) = start(req, context(Arc::clone(&bus), true)).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let caught_up: Vec<TimerFired> = drain(&mut replies);
        assert_eq!(
            caught_up.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2]
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        let next: Vec<TimerFired> = drain(&mut replies);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].sequence, 3);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(drain::<TimerFired>(&mut replies).len(), 2);
        assert!(!handle.is_terminated());
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn transformer_skips_ticks_when_gate_refuses() {
        let bus = Arc::new(InMemoryBus::new());
        let mut replies = bus.subscribe("replies").await.unwrap();

        let mut req = request(TimerKind::Transformer, Duration::from_secs(5), -1);
        req.payload.insert(
            keys::COST.to_owned(),
            serde_json::json!([{"resource": "Wood", "amount": 2, "temporary": false}]),
        );
        let (handle, _) = start(req, context(Arc::clone(&bus), false)).unwrap();

        tokio::time::sleep(Duration::from_secs(16)).await;

        assert!(drain::<TimerFired>(&mut replies).is_empty());
        let view = handle.describe().await.unwrap();
        assert_eq!(view.fired, 0);
        assert_eq!(view.skipped, 3);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn transformer_fires_when_gate_allows() {
        let bus = Arc::new(InMemoryBus::new());
        let mut replies = bus.subscribe("replies").await.unwrap();

        let mut req = request(TimerKind::Transformer, Duration::from_secs(5), -1);
        req.payload.insert(
            keys::COST.to_owned(),
            serde_json::json!([{"resource": "Wood", "amount": 2, "temporary": false}]),
        );
        req.payload
            .insert(keys::TRANSFORMER.to_owned(), Value::from("planks"));
        let (handle, _) = start(req, context(Arc::clone(&bus), true)).unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;

        let fired: Vec<TimerFired> = drain(&mut replies);
        assert_eq!(fired.len(), 2);
        assert_eq!(
            avalon_types::events::payload_str(&fired[0].payload, keys::TRANSFORMER),
            Some("planks")
        );
        let view = handle.describe().await.unwrap();
        assert_eq!((view.fired, view.skipped), (2, 0));
        handle.stop();
    }

    #[tokio::test]
    async fn periodic_timer_needs_interval() {
        let bus = Arc::new(InMemoryBus::new());
        let err = start(
            request(TimerKind::Generator, Duration::ZERO, -1),
            context(bus, true),
        )
        .unwrap_err();
        assert!(matches!(err, TimerError::InvalidRequest { .. }));
    }

    #[test]
    fn transformer_costs_are_summed() {
        let mut payload = Payload::new();
        payload.insert(
            keys::COST.to_owned(),
            serde_json::json!([
                {"resource": "Wood", "amount": 2, "temporary": false},
                {"resource": "Wood", "amount": 3, "temporary": false},
                {"resource": "Population", "amount": 1, "temporary": true}
            ]),
        );
        let costs = transformer_costs(&payload);
        assert_eq!(costs.get(&ResourceName::from("Wood")), Some(&5));
        assert_eq!(costs.get(&ResourceName::from("Population")), Some(&1));
        assert!(transformer_costs(&Payload::new()).is_empty());
    }
}
