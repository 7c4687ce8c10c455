use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::{json, Value};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    realtime::Subscription,
    store::{self, KeyValueStore, StoreError},
    subscriptions::callback,
    types::now_millis,
    AppContext,
};

const LIVE_HISTORY: usize = 20;
const MAX_SIMULATED_EMERGENCIES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Commuter,
    CabDriver,
    Delivery,
    Emergency,
}

#[derive(thiserror::Error, Debug)]
#[error("unknown role {0:?}")]
pub struct UnknownRole(String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "commuter" | "commuters" => Ok(Self::Commuter),
            "cab_driver" | "cab" | "cab-drivers" => Ok(Self::CabDriver),
            "delivery" => Ok(Self::Delivery),
            "emergency" => Ok(Self::Emergency),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Commuter => "commuter",
            Self::CabDriver => "cab_driver",
            Self::Delivery => "delivery",
            Self::Emergency => "emergency",
        })
    }
}

impl Role {
    pub fn topic(self) -> &'static str {
        match self {
            Self::Commuter => "traffic",
            Self::CabDriver => "rides",
            Self::Delivery => "deliveries",
            Self::Emergency => "emergencies",
        }
    }

    pub fn storage_key(self) -> &'static str {
        match self {
            Self::Commuter => "smartroads_groups",
            Self::CabDriver => "smartroads_driver",
            Self::Delivery => "smartroads_deliveries",
            Self::Emergency => "smartroads_emergency",
        }
    }

    pub fn period(self) -> Duration {
        match self {
            Self::Commuter | Self::CabDriver => Duration::from_secs(60),
            Self::Delivery => Duration::from_secs(5),
            Self::Emergency => Duration::from_secs(30),
        }
    }

    fn seed_state(self) -> Value {
        match self {
            Self::Commuter => json!({ "prediction": PREDICTIONS[0], "updates": [], "live": [] }),
            Self::CabDriver => json!({
                "status": "online",
                "location": { "lat": BASE_LAT, "lng": BASE_LNG },
                "stats": { "onlineHours": 0.0 },
                "live": [],
            }),
            Self::Delivery => json!({
                "deliveries": [{
                    "id": "DEL-001",
                    "status": "in_transit",
                    "location": { "lat": BASE_LAT, "lng": BASE_LNG },
                    "routeProgress": 0.0,
                }],
                "live": [],
            }),
            Self::Emergency => json!({ "emergencies": [], "live": [] }),
        }
    }
}

#[async_trait]
pub trait DashboardModule: Send {
    fn role(&self) -> Role;
    async fn init(&mut self, ctx: &AppContext) -> Result<(), StoreError>;
    async fn teardown(&mut self);
    fn render_state(&self) -> Value;
}

const BASE_LAT: f64 = 20.5937;
const BASE_LNG: f64 = 78.9629;

const PREDICTIONS: [&str; 3] = [
    "Leave before 7:45 AM via Highway 101 (15-20 min delay)",
    "Leave at 8:15 AM via Main Street (25-30 min delay)",
    "Leave at 9:00 AM via Park Avenue (10-15 min delay)",
];

const GROUP_UPDATES: [&str; 5] = [
    "Traffic conditions improving. ETA updated to 8:40 AM",
    "New member joined the group",
    "Accident cleared ahead. Resume normal route",
    "Weather alert: Light rain expected. Drive safely",
    "Road construction completed on alternate route",
];

const CONDITIONS: [&str; 5] = [
    "Accident",
    "Heart Attack",
    "Stroke",
    "Breathing Difficulty",
    "Unconscious",
];

const SEVERITIES: [&str; 3] = ["critical", "serious", "moderate"];

fn jitter(rng: &mut impl Rng, spread: f64) -> f64 {
    rng.gen_range(-spread..spread)
}

fn push_capped(list: &mut Value, item: Value) {
    if !list.is_array() {
        *list = json!([]);
    }
    if let Some(items) = list.as_array_mut() {
        items.insert(0, item);
        items.truncate(LIVE_HISTORY);
    }
}

pub fn simulate_tick(role: Role, state: &mut Value, rng: &mut impl Rng) {
    match role {
        Role::Commuter => {
            state["prediction"] = json!(PREDICTIONS[rng.gen_range(0..PREDICTIONS.len())]);
            if rng.gen_bool(0.3) {
                let message = GROUP_UPDATES[rng.gen_range(0..GROUP_UPDATES.len())];
                push_capped(
                    &mut state["updates"],
                    json!({ "author": "System", "message": message, "timestamp": now_millis() }),
                );
            }
        }
        Role::CabDriver => {
            if state["status"] == "online" {
                let lat = state["location"]["lat"].as_f64().unwrap_or(BASE_LAT);
                let lng = state["location"]["lng"].as_f64().unwrap_or(BASE_LNG);
                state["location"] = json!({
                    "lat": lat + jitter(rng, 0.0005),
                    "lng": lng + jitter(rng, 0.0005),
                });
                let hours = state["stats"]["onlineHours"].as_f64().unwrap_or(0.0);
                state["stats"]["onlineHours"] = json!(hours + 1.0 / 60.0);
            }
        }
        Role::Delivery => {
            let Some(deliveries) = state["deliveries"].as_array_mut() else {
                return;
            };
            for delivery in deliveries {
                if !matches!(
                    delivery["status"].as_str(),
                    Some("in_transit" | "out_for_delivery")
                ) {
                    continue;
                }
                if let (Some(lat), Some(lng)) = (
                    delivery["location"]["lat"].as_f64(),
                    delivery["location"]["lng"].as_f64(),
                ) {
                    delivery["location"] = json!({
                        "lat": lat + jitter(rng, 0.00025),
                        "lng": lng + jitter(rng, 0.00025),
                    });
                }
                let progress = delivery["routeProgress"].as_f64().unwrap_or(0.0);
                if progress < 95.0 {
                    delivery["routeProgress"] = json!(progress + rng.gen_range(0.0..2.0));
                }
            }
        }
        Role::Emergency => {
            let active = state["emergencies"].as_array().map_or(0, Vec::len);
            if active < MAX_SIMULATED_EMERGENCIES && rng.gen_bool(0.3) {
                let id = format!("EMG-{:06}", now_millis() % 1_000_000);
                let emergency = json!({
                    "id": id,
                    "location": {
                        "lat": BASE_LAT + jitter(rng, 0.01),
                        "lng": BASE_LNG + jitter(rng, 0.01),
                    },
                    "condition": CONDITIONS[rng.gen_range(0..CONDITIONS.len())],
                    "severity": SEVERITIES[rng.gen_range(0..SEVERITIES.len())],
                    "status": "pending",
                });
                if !state["emergencies"].is_array() {
                    state["emergencies"] = json!([]);
                }
                if let Some(list) = state["emergencies"].as_array_mut() {
                    list.insert(0, emergency);
                }
            }
        }
    }
}

pub struct SimulatedFeed {
    role: Role,
    period: Duration,
    state: watch::Sender<Value>,
    store: Arc<dyn KeyValueStore>,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl SimulatedFeed {
    pub fn new(role: Role, state: watch::Sender<Value>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            role,
            period: role.period(),
            state,
            store,
            running: None,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn start(&mut self, parent: &CancellationToken) {
        if self.running.is_some() {
            return;
        }
        let token = parent.child_token();
        let task = tokio::spawn(run_feed(
            self.role,
            self.period,
            self.state.clone(),
            self.store.clone(),
            token.clone(),
        ));
        self.running = Some((token, task));
        debug!(role = %self.role, period_ms = self.period.as_millis() as u64, "feed started");
    }

    pub async fn stop(&mut self) {
        if let Some((token, task)) = self.running.take() {
            token.cancel();
            let _ = task.await;
            debug!(role = %self.role, "feed stopped");
        }
    }
}

async fn run_feed(
    role: Role,
    period: Duration,
    state: watch::Sender<Value>,
    store: Arc<dyn KeyValueStore>,
    token: CancellationToken,
) {
    let mut rng = StdRng::from_entropy();
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                state.send_modify(|s| simulate_tick(role, s, &mut rng));
                let snapshot = state.borrow().clone();
                if let Err(e) = store::save_json(store.as_ref(), role.storage_key(), &snapshot).await {
                    warn!(%role, error = %e, "failed to persist dashboard state");
                }
            }
        }
    }
}

pub struct RoleDashboard {
    role: Role,
    state: watch::Sender<Value>,
    feed: Option<SimulatedFeed>,
    subscription: Option<Subscription>,
    feed_period: Option<Duration>,
}

impl RoleDashboard {
    pub fn new(role: Role) -> Self {
        let (state, _) = watch::channel(role.seed_state());
        Self {
            role,
            state,
            feed: None,
            subscription: None,
            feed_period: None,
        }
    }

    pub fn with_feed_period(mut self, period: Duration) -> Self {
        self.feed_period = Some(period);
        self
    }

    pub fn watch(&self) -> watch::Receiver<Value> {
        self.state.subscribe()
    }
}

#[async_trait]
impl DashboardModule for RoleDashboard {
    fn role(&self) -> Role {
        self.role
    }

    async fn init(&mut self, ctx: &AppContext) -> Result<(), StoreError> {
        if let Some(saved) = store::load_json::<Value>(ctx.store.as_ref(), self.role.storage_key()).await? {
            self.state.send_replace(saved);
        }

        let state = self.state.clone();
        let subscription = ctx
            .realtime
            .subscribe(
                self.role.topic(),
                callback(move |payload: &Value| {
                    let payload = payload.clone();
                    state.send_modify(|s| {
                        push_capped(&mut s["live"], payload);
                        s["lastUpdate"] = json!(now_millis());
                    });
                }),
            )
            .await;
        if let Some(old) = self.subscription.replace(subscription) {
            old.unsubscribe().await;
        }

        let (role, period, state) = (self.role, self.feed_period, self.state.clone());
        let feed = self.feed.get_or_insert_with(|| {
            let feed = SimulatedFeed::new(role, state, ctx.store.clone());
            match period {
                Some(period) => feed.with_period(period),
                None => feed,
            }
        });
        feed.start(&ctx.shutdown);

        info!(role = %self.role, topic = self.role.topic(), "dashboard mounted");
        Ok(())
    }

    async fn teardown(&mut self) {
        if let Some(feed) = self.feed.as_mut() {
            feed.stop().await;
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe().await;
        }
        info!(role = %self.role, "dashboard unmounted");
    }

    fn render_state(&self) -> Value {
        self.state.borrow().clone()
    }
}
