/// Event orchestration for one connected process.
///
/// A `Tracker` owns the in-memory statistics and reacts to chat messages,
/// automation workflows and channel envelopes. Exactly one process, the
/// primary GM, writes durable statistics; every other process relays the
/// payloads it originates and mirrors the writer's snapshots.
///
/// State lives behind a synchronous mutex that is never held across an
/// `.await`. Persistence, snapshot broadcasts and view refreshes are
/// debounced so bursts of rolls cost a single write.
use anyhow::{bail, Result};
use chrono::Local;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregate;
use crate::channel::{Channel, Envelope, Subscription};
use crate::config::Settings;
use crate::debounce::Debouncer;
use crate::fake::{self, FakeSummary};
use crate::identity::{resolve_user_from_message, resolve_user_from_workflow, Identity};
use crate::latest::{LatestRollEntry, LatestRolls};
use crate::normalizer::{
    message_id, payloads_from_message, payloads_from_workflow, workflow_message_id, RollPayload,
    WorkflowMeta,
};
use crate::query::{self, SessionFilter, UserFilter};
use crate::stats::{GlobalStats, StatsRecord};
use crate::store::{load_global_stats, save_global_stats, SettingsStore};
use crate::timefmt::{now_millis, today_key};
use crate::visibility::{should_track, Eligibility, Observer, SkipReason};

pub const SAVE_DELAY: Duration = Duration::from_millis(1500);
pub const SNAPSHOT_DELAY: Duration = Duration::from_millis(1000);
pub const REFRESH_DELAY: Duration = Duration::from_millis(300);
/// Message ids remembered for duplicate suppression.
pub const MAX_PROCESSED_IDS: usize = 1000;

/// What happened to one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Payloads applied to the durable statistics.
    Recorded(usize),
    /// Payloads relayed to the writer.
    Forwarded(usize),
    /// Only the live latest roll was updated.
    DisplayOnly,
    Skipped(SkipReason),
    /// No dice results found.
    Empty,
}

/// Recently handled message ids, oldest evicted first.
#[derive(Default)]
struct ProcessedIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl ProcessedIds {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > MAX_PROCESSED_IDS {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

#[derive(Default)]
struct TrackerState {
    global: GlobalStats,
    settings: Settings,
    processed: ProcessedIds,
    latest: LatestRolls,
    /// Classification hints from workflows, by chat card id.
    workflow_meta: HashMap<String, WorkflowMeta>,
}

struct Inner {
    identity: Arc<dyn Identity>,
    store: Arc<dyn SettingsStore>,
    channel: Arc<dyn Channel>,
    state: Mutex<TrackerState>,
    save: Debouncer,
    snapshot: Debouncer,
    refresh: Debouncer,
    refresh_tx: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
}

fn debounced(delay: Duration, weak: &Weak<Inner>, action: fn(&Inner)) -> Debouncer {
    let weak = weak.clone();
    Debouncer::new(delay, move || {
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(inner) = weak.upgrade() {
                action(&inner);
            }
        })
    })
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_user(&self) -> Option<String> {
        self.identity.current_user()
    }

    fn is_writer(&self) -> bool {
        match (self.identity.current_user(), self.identity.primary_gm()) {
            (Some(current), Some(gm)) => current == gm,
            _ => false,
        }
    }

    fn persist(&self) {
        let global = self.lock().global.clone();
        match save_global_stats(self.store.as_ref(), &global) {
            Ok(()) => {
                debug!("Saved statistics ({} rolls)", global.aggregate.totals.rolls);
                if let Err(err) = self.channel.emit(Envelope::StatsUpdated) {
                    warn!("Failed to announce saved statistics: {err:#}");
                }
            }
            Err(err) => warn!("Failed to save statistics: {err:#}"),
        }
    }

    fn broadcast_snapshot(&self) {
        let data = self.lock().global.clone();
        let envelope = Envelope::StatsSnapshot {
            data,
            sender_id: self.current_user(),
        };
        if let Err(err) = self.channel.emit(envelope) {
            warn!("Failed to broadcast statistics snapshot: {err:#}");
        }
    }

    fn notify_refresh(&self) {
        self.refresh_tx.send_modify(|generation| *generation += 1);
    }
}

impl Tracker {
    /// Creates a tracker, loading settings and statistics from `store`.
    pub fn new(
        identity: Arc<dyn Identity>,
        store: Arc<dyn SettingsStore>,
        channel: Arc<dyn Channel>,
    ) -> Result<Self> {
        let settings = Settings::load(store.as_ref())?;
        let global = load_global_stats(store.as_ref())?;
        info!(
            "Loaded statistics: {} rolls from {} users",
            global.aggregate.totals.rolls,
            global.users.len()
        );
        let (refresh_tx, _) = watch::channel(0);
        let inner = Arc::new_cyclic(|weak| Inner {
            identity,
            store,
            channel,
            state: Mutex::new(TrackerState {
                global,
                settings,
                ..Default::default()
            }),
            save: debounced(SAVE_DELAY, weak, Inner::persist),
            snapshot: debounced(SNAPSHOT_DELAY, weak, Inner::broadcast_snapshot),
            refresh: debounced(REFRESH_DELAY, weak, Inner::notify_refresh),
            refresh_tx,
        });
        Ok(Tracker { inner })
    }

    pub fn is_writer(&self) -> bool {
        self.inner.is_writer()
    }

    pub fn global_stats(&self) -> GlobalStats {
        self.inner.lock().global.clone()
    }

    pub fn settings(&self) -> Settings {
        self.inner.lock().settings.clone()
    }

    pub fn latest(&self) -> LatestRolls {
        self.inner.lock().latest.clone()
    }

    /// Latest roll if the current user may see it.
    pub fn visible_latest(&self) -> Option<LatestRollEntry> {
        let state = self.inner.lock();
        let allow = state.settings.allow_players_see_gm_stats;
        state
            .latest
            .latest
            .clone()
            .filter(|entry| entry.is_visible_to(self.inner.identity.as_ref(), allow))
    }

    /// Bumped after every change worth redrawing.
    pub fn subscribe_refresh(&self) -> watch::Receiver<u64> {
        self.inner.refresh_tx.subscribe()
    }

    /// Record shown to the current user for a selection, hidden users excluded.
    pub fn view(&self, user: &UserFilter, session: &SessionFilter) -> StatsRecord {
        let state = self.inner.lock();
        let hidden = query::hidden_user_ids(&state.settings, self.inner.identity.as_ref());
        query::stats_for_session(&state.global, user, session, &hidden, &today_key())
    }

    /// Changes settings and persists them.
    pub fn update_settings(&self, change: impl FnOnce(&mut Settings)) -> Result<Settings> {
        let settings = {
            let mut state = self.inner.lock();
            change(&mut state.settings);
            state.settings.clone()
        };
        settings.save(self.inner.store.as_ref())?;
        self.inner.refresh.schedule();
        Ok(settings)
    }

    async fn processing_delay(&self) {
        let delay = self.inner.lock().settings.roll_processing_delay_ms;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// Handles a chat message created on this process's host.
    pub async fn handle_chat_message(&self, message: &Value, hook_user_id: Option<&str>) -> Outcome {
        self.processing_delay().await;
        let identity = self.inner.identity.as_ref();
        let current = identity.current_user();
        let primary_gm = identity.primary_gm();
        let observer = Observer {
            user_id: current.as_deref(),
            is_gm: identity.current_is_gm(),
            primary_gm: primary_gm.as_deref(),
        };

        let (eligibility, meta) = {
            let state = self.inner.lock();
            let eligibility = should_track(message, hook_user_id, &state.settings, &state.processed.ids, &observer);
            let meta = message_id(message).and_then(|id| state.workflow_meta.get(&id).cloned());
            (eligibility, meta)
        };
        let reason = match eligibility {
            Eligibility::Record => None,
            Eligibility::Skip(reason) if eligibility.allows_display() => Some(reason),
            Eligibility::Skip(reason) => {
                debug!("Ignoring message {:?}: {}", message_id(message), reason.as_str());
                return Outcome::Skipped(reason);
            }
        };

        let user_id = resolve_user_from_message(message, hook_user_id, identity);
        let payloads = payloads_from_message(message, user_id.as_deref(), meta.as_ref());
        if payloads.is_empty() {
            return Outcome::Empty;
        }
        self.show_latest(&payloads);

        if let Some(reason) = reason {
            debug!("Message {:?} not recorded: {}", message_id(message), reason.as_str());
            return Outcome::DisplayOnly;
        }
        if let Some(id) = message_id(message) {
            self.inner.lock().processed.insert(id);
        }
        self.record_or_forward(payloads)
    }

    /// Handles a completed automation workflow.
    pub async fn handle_workflow(&self, workflow: &Value) -> Outcome {
        self.processing_delay().await;
        if !self.inner.lock().settings.enabled {
            return Outcome::Skipped(SkipReason::Disabled);
        }
        let identity = self.inner.identity.as_ref();
        let user_id = resolve_user_from_workflow(workflow, identity);
        let originator_here = match user_id.as_deref() {
            Some(user) => identity.current_user().as_deref() == Some(user),
            None => self.is_writer(),
        };
        if !originator_here {
            return Outcome::Skipped(SkipReason::NotOriginator);
        }

        let card_id = workflow_message_id(workflow);
        let payloads = payloads_from_workflow(workflow, user_id.as_deref());
        {
            let mut state = self.inner.lock();
            if let Some(card) = &card_id {
                if state.processed.contains(card) {
                    return Outcome::Skipped(SkipReason::AlreadyProcessed);
                }
                if payloads.is_empty() {
                    state
                        .workflow_meta
                        .insert(card.clone(), WorkflowMeta::from_workflow(workflow));
                    return Outcome::Empty;
                }
                state.processed.insert(card.clone());
            }
        }
        if payloads.is_empty() {
            return Outcome::Empty;
        }
        self.show_latest(&payloads);
        self.record_or_forward(payloads)
    }

    fn show_latest(&self, payloads: &[RollPayload]) {
        let Some(entry) = LatestRollEntry::from_payloads(payloads, now_millis()) else {
            return;
        };
        let entry = entry.with_user_name(self.inner.identity.as_ref());
        self.inner.lock().latest.set(entry.clone());
        let envelope = Envelope::LatestRoll {
            data: entry,
            sender_id: self.inner.current_user(),
        };
        if let Err(err) = self.inner.channel.emit(envelope) {
            warn!("Failed to broadcast latest roll: {err:#}");
        }
        self.inner.refresh.schedule();
    }

    fn record_or_forward(&self, payloads: Vec<RollPayload>) -> Outcome {
        if self.is_writer() {
            return Outcome::Recorded(self.apply(&payloads));
        }
        let count = payloads.len();
        match self.inner.channel.emit(Envelope::Rolls { data: payloads }) {
            Ok(()) => Outcome::Forwarded(count),
            Err(err) => {
                warn!("Failed to relay rolls to the writer: {err:#}");
                Outcome::Empty
            }
        }
    }

    fn apply(&self, payloads: &[RollPayload]) -> usize {
        let applied = {
            let mut state = self.inner.lock();
            aggregate::apply_payloads(&mut state.global, payloads, &today_key(), now_millis())
        };
        if applied > 0 {
            self.inner.save.schedule();
            self.inner.snapshot.schedule();
            self.inner.refresh.schedule();
        }
        applied
    }

    /// Reacts to an envelope from another process.
    pub fn handle_envelope(&self, envelope: Envelope) {
        match envelope {
            Envelope::Rolls { data } => {
                if !self.is_writer() {
                    debug!("Ignoring relayed rolls: not the writer");
                    return;
                }
                let fresh: Vec<RollPayload> = {
                    let mut state = self.inner.lock();
                    let fresh: Vec<RollPayload> = data
                        .into_iter()
                        .filter(|payload| {
                            payload
                                .message_id
                                .as_ref()
                                .map_or(true, |id| !state.processed.contains(id))
                        })
                        .collect();
                    // Marked after filtering so every group of one message applies.
                    for id in fresh.iter().filter_map(|payload| payload.message_id.clone()) {
                        state.processed.insert(id);
                    }
                    fresh
                };
                let applied = self.apply(&fresh);
                debug!("Applied {} relayed payloads", applied);
            }
            Envelope::StatsSnapshot { data, sender_id } => {
                if sender_id.is_some() && sender_id == self.inner.current_user() {
                    return;
                }
                self.inner.lock().global = data;
                self.inner.refresh.schedule();
            }
            Envelope::StatsUpdated => match load_global_stats(self.inner.store.as_ref()) {
                Ok(global) => {
                    self.inner.lock().global = global;
                    self.inner.refresh.schedule();
                }
                Err(err) => warn!("Failed to reload statistics: {err:#}"),
            },
            Envelope::LatestRoll { mut data, sender_id } => {
                if sender_id.is_some() && sender_id == self.inner.current_user() {
                    return;
                }
                data.normalize(now_millis());
                let entry = data.with_user_name(self.inner.identity.as_ref());
                self.inner.lock().latest.set(entry);
                self.inner.refresh.schedule();
            }
        }
    }

    /// Feeds envelopes from a channel subscription until it closes.
    pub fn spawn_listener(&self, mut subscription: Subscription) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            while let Some(delivery) = subscription.recv().await {
                debug!("Received {} from {}", delivery.envelope.kind(), delivery.from);
                tracker.handle_envelope(delivery.envelope);
            }
        })
    }

    fn require_gm(&self, operation: &str) -> Result<()> {
        if !self.inner.identity.current_is_gm() {
            bail!("Only a game master can {operation}");
        }
        Ok(())
    }

    /// Saves now and pushes a snapshot, bypassing the debouncers.
    fn commit(&self) -> Result<()> {
        self.inner.save.cancel();
        self.inner.snapshot.cancel();
        let global = self.global_stats();
        save_global_stats(self.inner.store.as_ref(), &global)?;
        self.inner.channel.emit(Envelope::StatsSnapshot {
            data: global,
            sender_id: self.inner.current_user(),
        })?;
        self.inner.refresh.schedule();
        Ok(())
    }

    /// Drops one user's statistics. Returns false if there were none.
    pub fn reset_user(&self, user_id: &str) -> Result<bool> {
        self.require_gm("reset statistics")?;
        let removed = aggregate::reset_user(&mut self.inner.lock().global, user_id);
        if removed {
            self.commit()?;
        }
        Ok(removed)
    }

    pub fn reset_all(&self) -> Result<()> {
        self.require_gm("reset statistics")?;
        aggregate::reset_all(&mut self.inner.lock().global);
        self.commit()
    }

    /// Adds a generated demo history for `user_id`.
    pub fn generate_fake_data(&self, user_id: &str) -> Result<FakeSummary> {
        self.require_gm("generate demo data")?;
        if user_id.is_empty() {
            bail!("A user id is required to generate demo data");
        }
        let summary = {
            let mut state = self.inner.lock();
            fake::generate_for_user(
                &mut state.global,
                user_id,
                Local::now().date_naive(),
                now_millis(),
                &mut rand::thread_rng(),
            )
        };
        self.commit()?;
        Ok(summary)
    }

    /// Replaces all statistics, e.g. from an export file.
    pub fn import(&self, global: GlobalStats) -> Result<()> {
        self.require_gm("import statistics")?;
        self.inner.lock().global = global;
        self.commit()
    }

    /// Runs every pending debounced action now.
    pub async fn flush(&self) {
        self.inner.save.flush().await;
        self.inner.snapshot.flush().await;
        self.inner.refresh.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{LocalBus, NullChannel};
    use crate::identity::Directory;
    use crate::store::{MemoryStore, GLOBAL_STATS_KEY};
    use serde_json::json;

    fn roster() -> Directory {
        serde_json::from_value(json!({
            "users": [
                {"id": "gm", "name": "GM", "isGM": true, "active": true},
                {"id": "p1", "name": "Pat", "active": true, "character": "hero"}
            ],
            "actors": [{"id": "hero", "hasPlayerOwner": true, "ownership": {"p1": 3}}],
            "currentUser": "gm"
        }))
        .unwrap()
    }

    fn attack(id: &str, author: &str, face: i64) -> Value {
        json!({
            "id": id,
            "author": {"id": author},
            "rolls": [{
                "options": {"rollType": "attack"},
                "terms": [{"faces": 20, "results": [{"result": face, "active": true}]}]
            }]
        })
    }

    fn gm_tracker(store: Arc<MemoryStore>) -> Tracker {
        Tracker::new(Arc::new(roster()), store, Arc::new(NullChannel)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_records_and_saves_after_debounce() {
        let store = Arc::new(MemoryStore::new());
        let tracker = gm_tracker(store.clone());
        assert!(tracker.is_writer());

        assert_eq!(tracker.handle_chat_message(&attack("m1", "gm", 20), Some("gm")).await, Outcome::Recorded(1));
        assert_eq!(tracker.handle_chat_message(&attack("m2", "gm", 20), Some("gm")).await, Outcome::Recorded(1));
        assert_eq!(tracker.global_stats().aggregate.totals.rolls, 2);
        assert!(store.get(GLOBAL_STATS_KEY).unwrap().is_none());

        tokio::time::sleep(SAVE_DELAY + Duration::from_millis(10)).await;
        let saved = load_global_stats(store.as_ref()).unwrap();
        assert_eq!(saved.aggregate.totals.rolls, 2);
        assert_eq!(saved.aggregate.streaks["all|all"]["d20"].longest_max, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_message_ignored() {
        let tracker = gm_tracker(Arc::new(MemoryStore::new()));
        let message = attack("m1", "gm", 7);
        assert_eq!(tracker.handle_chat_message(&message, Some("gm")).await, Outcome::Recorded(1));
        assert_eq!(
            tracker.handle_chat_message(&message, Some("gm")).await,
            Outcome::Skipped(SkipReason::AlreadyProcessed)
        );
        assert_eq!(tracker.global_stats().aggregate.totals.rolls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_roll_suppressed_but_latest_updated() {
        let store = Arc::new(MemoryStore::new());
        let tracker = gm_tracker(store);
        tracker.update_settings(|s| s.record_self_rolls = false).unwrap();

        let mut message = attack("m1", "gm", 12);
        message["whisper"] = json!(["gm"]);
        assert_eq!(tracker.handle_chat_message(&message, Some("gm")).await, Outcome::DisplayOnly);
        assert_eq!(tracker.global_stats().aggregate.totals.rolls, 0);
        let latest = tracker.latest().latest.unwrap();
        assert_eq!(latest.sequence["d20"], vec![12]);
        assert_eq!(latest.user_name.as_deref(), Some("GM"));
        assert!(tracker.latest().latest_d20.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_users_messages_not_recorded_here() {
        let tracker = gm_tracker(Arc::new(MemoryStore::new()));
        assert_eq!(
            tracker.handle_chat_message(&attack("m1", "p1", 3), Some("p1")).await,
            Outcome::Skipped(SkipReason::NotOriginator)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_tracking() {
        let tracker = gm_tracker(Arc::new(MemoryStore::new()));
        tracker.update_settings(|s| s.enabled = false).unwrap();
        assert_eq!(
            tracker.handle_chat_message(&attack("m1", "gm", 3), Some("gm")).await,
            Outcome::Skipped(SkipReason::Disabled)
        );
        assert!(tracker.latest().latest.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_marks_card_processed() {
        let tracker = gm_tracker(Arc::new(MemoryStore::new()));
        let workflow = json!({
            "itemCardId": "card-1",
            "actor": {"id": "goblin"},
            "userId": "gm",
            "item": {"system": {"actionType": "mwak"}},
            "attackRoll": {"terms": [{"faces": 20, "results": [{"result": 14}]}]}
        });
        assert_eq!(tracker.handle_workflow(&workflow).await, Outcome::Recorded(1));
        assert_eq!(
            tracker.handle_workflow(&workflow).await,
            Outcome::Skipped(SkipReason::AlreadyProcessed)
        );
        let card = attack("card-1", "gm", 14);
        assert_eq!(
            tracker.handle_chat_message(&card, Some("gm")).await,
            Outcome::Skipped(SkipReason::AlreadyProcessed)
        );
        assert_eq!(tracker.global_stats().aggregate.actions["attack"].rolls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_is_logged_and_retried_on_next_change() {
        let store = Arc::new(MemoryStore::new());
        let tracker = gm_tracker(store.clone());
        store.set_fail_writes(true);
        tracker.handle_chat_message(&attack("m1", "gm", 5), Some("gm")).await;
        tokio::time::sleep(SAVE_DELAY * 2).await;
        assert!(store.get(GLOBAL_STATS_KEY).unwrap().is_none());

        store.set_fail_writes(false);
        tracker.handle_chat_message(&attack("m2", "gm", 6), Some("gm")).await;
        tracker.flush().await;
        assert_eq!(load_global_stats(store.as_ref()).unwrap().aggregate.totals.rolls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_requires_gm_and_commits() {
        let store = Arc::new(MemoryStore::new());
        let tracker = gm_tracker(store.clone());
        tracker.handle_chat_message(&attack("m1", "gm", 5), Some("gm")).await;
        assert!(tracker.reset_user("gm").unwrap());
        assert!(!tracker.reset_user("gm").unwrap());
        assert_eq!(load_global_stats(store.as_ref()).unwrap(), GlobalStats::new());

        let player = Tracker::new(Arc::new(roster().as_user("p1")), store, Arc::new(NullChannel)).unwrap();
        assert!(player.reset_all().is_err());
        assert!(player.generate_fake_data("p1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_notification() {
        let tracker = gm_tracker(Arc::new(MemoryStore::new()));
        let mut refresh = tracker.subscribe_refresh();
        tracker.handle_chat_message(&attack("m1", "gm", 5), Some("gm")).await;
        tokio::time::sleep(REFRESH_DELAY + Duration::from_millis(10)).await;
        assert!(refresh.has_changed().unwrap());
        assert_eq!(*refresh.borrow_and_update(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_player_relays_and_writer_applies() {
        let bus = LocalBus::default();
        let store = Arc::new(MemoryStore::new());
        let gm = Tracker::new(Arc::new(roster()), store.clone(), Arc::new(bus.endpoint("gm"))).unwrap();
        let player_endpoint = bus.endpoint("p1");
        let mut player_inbox = player_endpoint.subscribe();
        let player = Tracker::new(Arc::new(roster().as_user("p1")), store, Arc::new(player_endpoint)).unwrap();
        let gm_listener = gm.spawn_listener(bus.endpoint("gm").subscribe());

        let message = attack("m7", "p1", 20);
        assert_eq!(player.handle_chat_message(&message, Some("p1")).await, Outcome::Forwarded(1));
        assert_eq!(player.global_stats().aggregate.totals.rolls, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gm.global_stats().users["p1"].totals.rolls, 1);
        assert_eq!(gm.latest().latest.unwrap().user_id.as_deref(), Some("p1"));

        // The relayed message id is now known to the writer.
        gm.handle_envelope(Envelope::Rolls {
            data: payloads_from_message(&message, Some("p1"), None),
        });
        assert_eq!(gm.global_stats().aggregate.totals.rolls, 1);

        tokio::time::sleep(SNAPSHOT_DELAY + Duration::from_millis(10)).await;
        let mut snapshot = None;
        while let Ok(Some(delivery)) =
            tokio::time::timeout(Duration::from_millis(10), player_inbox.recv()).await
        {
            if let Envelope::StatsSnapshot { .. } = delivery.envelope {
                snapshot = Some(delivery.envelope);
            }
        }
        player.handle_envelope(snapshot.expect("writer broadcast a snapshot"));
        assert_eq!(player.global_stats().users["p1"].totals.rolls, 1);
        gm_listener.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_player_relay_attributed_to_author() {
        let bus = LocalBus::default();
        let store = Arc::new(MemoryStore::new());
        let gm = Tracker::new(Arc::new(roster()), store.clone(), Arc::new(bus.endpoint("gm"))).unwrap();
        let player = Tracker::new(Arc::new(roster().as_user("p1")), store, Arc::new(bus.endpoint("p1"))).unwrap();
        let gm_listener = gm.spawn_listener(bus.endpoint("gm").subscribe());

        assert_eq!(player.handle_chat_message(&attack("m1", "p1", 17), None).await, Outcome::Forwarded(1));
        let mut by_user_id = attack("m2", "p1", 3);
        by_user_id.as_object_mut().unwrap().remove("author");
        by_user_id["userId"] = json!("p1");
        assert_eq!(player.handle_chat_message(&by_user_id, None).await, Outcome::Forwarded(1));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let global = gm.global_stats();
        assert_eq!(global.users["p1"].totals.rolls, 2);
        assert_eq!(global.users["p1"].dice["d20"].sum, 20);
        assert!(!global.users.contains_key("gm"));
        gm_listener.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_relayed_impossible_faces_rejected() {
        let tracker = gm_tracker(Arc::new(MemoryStore::new()));
        let data = serde_json::from_value(json!([
            {"userId": "p1", "actionType": "attack", "rolls": 1, "results": {"d20": {"5000000000000000000": 2}}},
            {"userId": "p1", "actionType": "attack", "rolls": 1, "results": {"d20": {"20": 10_000_000_000u64}}}
        ]))
        .unwrap();
        tracker.handle_envelope(Envelope::Rolls { data });
        assert_eq!(tracker.global_stats().aggregate.totals.rolls, 0);
    }

    #[test]
    fn test_processed_ids_bounded() {
        let mut processed = ProcessedIds::default();
        for index in 0..MAX_PROCESSED_IDS + 10 {
            processed.insert(format!("m{index}"));
        }
        processed.insert("m20".to_string());
        assert_eq!(processed.ids.len(), MAX_PROCESSED_IDS);
        assert_eq!(processed.order.len(), MAX_PROCESSED_IDS);
        assert!(!processed.contains("m0"));
        assert!(!processed.contains("m9"));
        assert!(processed.contains("m10"));
        assert!(processed.contains(&format!("m{}", MAX_PROCESSED_IDS + 9)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_snapshot_ignored() {
        let tracker = gm_tracker(Arc::new(MemoryStore::new()));
        let mut foreign = GlobalStats::new();
        foreign.aggregate.totals.rolls = 9;
        tracker.handle_envelope(Envelope::StatsSnapshot {
            data: foreign.clone(),
            sender_id: Some("gm".into()),
        });
        assert_eq!(tracker.global_stats().aggregate.totals.rolls, 0);
        tracker.handle_envelope(Envelope::StatsSnapshot {
            data: foreign,
            sender_id: Some("other-gm".into()),
        });
        assert_eq!(tracker.global_stats().aggregate.totals.rolls, 9);
    }
}
