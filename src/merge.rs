//! Merge engine - one ordered transcript per live session view.
//!
//! Three inputs feed a view:
//! - bulk loads replace it (file truth, tagged `jsonl`)
//! - incremental fetches upsert by identity (tagged `jsonl`)
//! - live pushes upsert one message (tagged `sdk`), buffered until the first
//!   bulk load lands
//!
//! A `jsonl` copy of a message is never overwritten by an `sdk` copy.
//! Fetch results carry the generation of the view they were issued for, so
//! results for a detached or re-attached view are dropped.
//!
//! Views are shared: each `attach` takes a hold and each `detach` releases
//! one. The view closes when the last holder detaches.

use crate::events::{AgentStatus, SessionEvent};
use crate::sessions::{NormalizedMessage, Provider, SourceTag};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Issued by `begin_fetch`; results are only applied to the same view generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    session_id: String,
    generation: u64,
}

impl FetchTicket {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

struct View {
    provider: Provider,
    generation: u64,
    holders: usize,
    loaded: bool,
    messages: Vec<NormalizedMessage>,
    /// Pushes received before the first bulk load, in arrival order
    pending: Vec<NormalizedMessage>,
    status: AgentStatus,
    complete: bool,
}

impl View {
    fn settle(&mut self) {
        if self.provider.is_branching() {
            reorder_by_parent(&mut self.messages);
        }
    }
}

pub struct MergeEngine {
    views: DashMap<String, View>,
    next_generation: AtomicU64,
    active: AtomicBool,
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeEngine {
    pub fn new() -> Self {
        Self {
            views: DashMap::new(),
            next_generation: AtomicU64::new(1),
            active: AtomicBool::new(false),
        }
    }

    pub fn initialize(&self) {
        self.active.store(true, Ordering::SeqCst);
        info!("Merge engine ready");
    }

    /// Detach every view. Outstanding tickets become stale.
    pub fn dispose(&self) {
        self.active.store(false, Ordering::SeqCst);
        let count = self.views.len();
        self.views.clear();
        info!("Merge engine disposed ({} views dropped)", count);
    }

    /// Open a view for `session_id`, or take another hold on an open one.
    /// Returns false when the engine is not initialized.
    pub fn attach(&self, session_id: &str, provider: Provider) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            warn!("Attach to {} before merge engine initialize", session_id);
            return false;
        }
        let mut view = self.views.entry(session_id.to_string()).or_insert_with(|| {
            debug!("Attached view {} ({})", session_id, provider);
            View {
                provider,
                generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                holders: 0,
                loaded: false,
                messages: Vec::new(),
                pending: Vec::new(),
                status: AgentStatus::default(),
                complete: false,
            }
        });
        view.holders += 1;
        true
    }

    /// Release one hold. The view closes when no holders remain.
    pub fn detach(&self, session_id: &str) {
        if let Entry::Occupied(mut entry) = self.views.entry(session_id.to_string()) {
            let view = entry.get_mut();
            view.holders = view.holders.saturating_sub(1);
            if view.holders == 0 {
                entry.remove();
                debug!("Detached view {}", session_id);
            } else {
                debug!("Released view {} ({} holders left)", session_id, view.holders);
            }
        }
    }

    pub fn is_attached(&self, session_id: &str) -> bool {
        self.views.contains_key(session_id)
    }

    pub fn begin_fetch(&self, session_id: &str) -> Option<FetchTicket> {
        let view = self.views.get(session_id)?;
        Some(FetchTicket {
            session_id: session_id.to_string(),
            generation: view.generation,
        })
    }

    /// Replace the view with a full read, then replay buffered pushes.
    /// Returns false if the ticket is stale.
    pub fn complete_bulk_load(&self, ticket: &FetchTicket, messages: Vec<NormalizedMessage>) -> bool {
        let Some(mut view) = self.current(ticket) else {
            return false;
        };
        // Live copies from an earlier load replay like buffered pushes
        let mut pending: Vec<NormalizedMessage> = std::mem::take(&mut view.messages)
            .into_iter()
            .filter(|m| m.source == SourceTag::Sdk)
            .collect();
        pending.append(&mut view.pending);
        view.messages = messages
            .into_iter()
            .map(|mut m| {
                m.source = SourceTag::Jsonl;
                m
            })
            .collect();
        view.loaded = true;
        if !pending.is_empty() {
            debug!("Replaying {} buffered pushes for {}", pending.len(), ticket.session_id);
        }
        for msg in pending {
            merge_incoming(&mut view.messages, msg);
        }
        view.settle();
        true
    }

    /// Upsert a batch fetched after the last known id. Returns false if the ticket is stale.
    pub fn apply_incremental(&self, ticket: &FetchTicket, messages: Vec<NormalizedMessage>) -> bool {
        let Some(mut view) = self.current(ticket) else {
            return false;
        };
        if messages.is_empty() {
            return true;
        }
        for mut msg in messages {
            msg.source = SourceTag::Jsonl;
            merge_incoming(&mut view.messages, msg);
        }
        view.settle();
        true
    }

    /// Merge one live message. Returns false if no view is attached.
    pub fn push_live(&self, session_id: &str, mut message: NormalizedMessage) -> bool {
        let Some(mut view) = self.views.get_mut(session_id) else {
            return false;
        };
        message.source = SourceTag::Sdk;
        if !view.loaded {
            view.pending.push(message);
            return true;
        }
        merge_incoming(&mut view.messages, message);
        view.settle();
        true
    }

    /// Apply a push event to the view. Returns false if no view is attached.
    pub fn apply_event(&self, session_id: &str, event: &SessionEvent) -> bool {
        if let SessionEvent::Message(msg) = event {
            return self.push_live(session_id, msg.clone());
        }
        let Some(mut view) = self.views.get_mut(session_id) else {
            return false;
        };
        match event {
            SessionEvent::Connected {
                state,
                permission_mode,
                mode_version,
            } => {
                view.status = AgentStatus {
                    state: *state,
                    permission_mode: permission_mode.clone(),
                    mode_version: *mode_version,
                };
            }
            SessionEvent::Status { state, .. } => {
                view.status.state = *state;
                view.complete = false;
            }
            SessionEvent::ModeChange {
                permission_mode,
                mode_version,
            } => {
                if *mode_version >= view.status.mode_version {
                    view.status.permission_mode = permission_mode.clone();
                    view.status.mode_version = *mode_version;
                }
            }
            SessionEvent::Complete => view.complete = true,
            SessionEvent::Error { message } => {
                debug!("Agent error on {}: {}", session_id, message);
            }
            SessionEvent::Heartbeat { .. } | SessionEvent::Message(_) => {}
        }
        true
    }

    /// Snapshot of the view's transcript
    pub fn messages(&self, session_id: &str) -> Option<Vec<NormalizedMessage>> {
        self.views.get(session_id).map(|v| v.messages.clone())
    }

    pub fn status(&self, session_id: &str) -> Option<(AgentStatus, bool)> {
        self.views.get(session_id).map(|v| (v.status.clone(), v.complete))
    }

    /// Cursor for the next incremental fetch
    pub fn last_jsonl_id(&self, session_id: &str) -> Option<String> {
        let view = self.views.get(session_id)?;
        view.messages
            .iter()
            .rev()
            .find(|m| m.source == SourceTag::Jsonl)
            .map(|m| m.uuid.clone())
    }

    /// Lock the view a ticket was issued for, if it is still that generation.
    fn current(&self, ticket: &FetchTicket) -> Option<dashmap::mapref::one::RefMut<'_, String, View>> {
        match self.views.get_mut(&ticket.session_id) {
            Some(view) if view.generation == ticket.generation => Some(view),
            _ => {
                debug!("Discarding stale fetch for {}", ticket.session_id);
                None
            }
        }
    }
}

/// Upsert `incoming` by identity. A `jsonl` entry is never replaced by an `sdk` one.
pub fn merge_incoming(existing: &mut Vec<NormalizedMessage>, incoming: NormalizedMessage) {
    match existing.iter().position(|m| m.same_identity(&incoming)) {
        Some(pos) => {
            if existing[pos].source == SourceTag::Jsonl && incoming.source == SourceTag::Sdk {
                return;
            }
            existing[pos] = incoming;
        }
        None => existing.push(incoming),
    }
}

/// Move every message whose parent appears later so it directly follows that parent.
/// Messages with unknown parents keep their position.
pub fn reorder_by_parent(messages: &mut Vec<NormalizedMessage>) {
    let order: Vec<usize> = {
        let index: HashMap<&str, usize> = messages
            .iter()
            .enumerate()
            .map(|(i, m)| (m.uuid.as_str(), i))
            .collect();
        let n = messages.len();
        let mut placed = vec![false; n];
        let mut waiting: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut order = Vec::with_capacity(n);

        for (i, msg) in messages.iter().enumerate() {
            let parent = msg.parent_uuid.as_deref().and_then(|p| index.get(p)).copied();
            match parent {
                Some(p) if p != i && !placed[p] => waiting.entry(p).or_default().push(i),
                _ => place(i, &mut placed, &mut waiting, &mut order),
            }
        }
        // Parent cycles: fall back to arrival order
        for i in 0..n {
            if !placed[i] {
                place(i, &mut placed, &mut waiting, &mut order);
            }
        }
        order
    };

    if order.iter().enumerate().all(|(pos, &i)| pos == i) {
        return;
    }
    let mut slots: Vec<Option<NormalizedMessage>> = messages.drain(..).map(Some).collect();
    messages.extend(order.into_iter().filter_map(|i| slots[i].take()));
}

/// Place `i` and, depth first, every message that was waiting on it.
fn place(i: usize, placed: &mut [bool], waiting: &mut HashMap<usize, Vec<usize>>, order: &mut Vec<usize>) {
    let mut stack = vec![i];
    while let Some(j) = stack.pop() {
        if placed[j] {
            continue;
        }
        placed[j] = true;
        order.push(j);
        if let Some(children) = waiting.remove(&j) {
            stack.extend(children.into_iter().rev());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AgentState;
    use crate::sessions::ContentBlock;

    fn msg(id: &str, parent: Option<&str>, text: &str) -> NormalizedMessage {
        let mut m = NormalizedMessage::new(id, "assistant", "2026-02-01T10:00:00Z")
            .with_content(vec![ContentBlock::Text { text: text.to_string() }]);
        m.parent_uuid = parent.map(str::to_string);
        m
    }

    fn ids(messages: &[NormalizedMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.uuid.as_str()).collect()
    }

    fn engine() -> MergeEngine {
        let engine = MergeEngine::new();
        engine.initialize();
        engine
    }

    #[test]
    fn incremental_merge_is_idempotent() {
        let engine = engine();
        engine.attach("s", Provider::Codex);
        let ticket = engine.begin_fetch("s").unwrap();
        engine.complete_bulk_load(&ticket, vec![msg("a", None, "1")]);

        let batch = vec![msg("b", None, "2"), msg("a", None, "1 edited")];
        engine.apply_incremental(&ticket, batch.clone());
        let once = engine.messages("s").unwrap();
        engine.apply_incremental(&ticket, batch);
        assert_eq!(engine.messages("s").unwrap(), once);
        assert_eq!(ids(&once), vec!["a", "b"]);
        assert_eq!(once[0].text(), "1 edited");
    }

    #[test]
    fn file_copy_wins_over_live_copy() {
        let engine = engine();
        engine.attach("s", Provider::Codex);
        let ticket = engine.begin_fetch("s").unwrap();
        engine.complete_bulk_load(&ticket, vec![msg("a", None, "from file")]);

        engine.push_live("s", msg("a", None, "from push"));
        assert_eq!(engine.messages("s").unwrap()[0].text(), "from file");

        // sdk may overwrite sdk
        engine.push_live("s", msg("b", None, "draft"));
        engine.push_live("s", msg("b", None, "final"));
        let view = engine.messages("s").unwrap();
        assert_eq!(view[1].text(), "final");
        assert_eq!(view[1].source, SourceTag::Sdk);

        // jsonl always overwrites
        engine.apply_incremental(&ticket, vec![msg("b", None, "on disk")]);
        let view = engine.messages("s").unwrap();
        assert_eq!(view[1].text(), "on disk");
        assert_eq!(view[1].source, SourceTag::Jsonl);
        assert_eq!(engine.last_jsonl_id("s").as_deref(), Some("b"));
    }

    #[test]
    fn strong_id_decides_identity() {
        let mut existing = vec![msg("legacy-1", None, "old")];
        existing[0].message_id = Some("msg-1".to_string());
        let mut incoming = msg("legacy-2", None, "new");
        incoming.message_id = Some("msg-1".to_string());
        merge_incoming(&mut existing, incoming);
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].text(), "new");

        let mut other = msg("legacy-1", None, "different message");
        other.message_id = Some("msg-2".to_string());
        merge_incoming(&mut existing, other);
        assert_eq!(existing.len(), 2);
    }

    #[test]
    fn pushes_before_load_are_buffered_then_replayed() {
        let engine = engine();
        engine.attach("s", Provider::Claude);
        let ticket = engine.begin_fetch("s").unwrap();

        engine.push_live("s", msg("c", Some("b"), "child"));
        engine.push_live("s", msg("a", None, "live copy of a"));
        assert!(engine.messages("s").unwrap().is_empty());

        engine.complete_bulk_load(&ticket, vec![msg("a", None, "root"), msg("b", Some("a"), "parent")]);
        let view = engine.messages("s").unwrap();
        assert_eq!(ids(&view), vec!["a", "b", "c"]);
        assert_eq!(view[0].text(), "root");
        assert_eq!(view[2].source, SourceTag::Sdk);
    }

    #[test]
    fn branching_views_reorder_children_after_parents() {
        let engine = engine();
        engine.attach("s", Provider::Pi);
        let ticket = engine.begin_fetch("s").unwrap();
        engine.complete_bulk_load(&ticket, vec![msg("a", None, "root")]);

        // Child outruns its parent
        engine.push_live("s", msg("c", Some("b"), "child"));
        engine.push_live("s", msg("d", Some("a"), "sibling"));
        engine.apply_incremental(&ticket, vec![msg("b", Some("a"), "parent")]);
        assert_eq!(ids(&engine.messages("s").unwrap()), vec!["a", "d", "b", "c"]);
    }

    #[test]
    fn linear_views_keep_arrival_order() {
        let engine = engine();
        engine.attach("s", Provider::Codex);
        let ticket = engine.begin_fetch("s").unwrap();
        engine.complete_bulk_load(&ticket, vec![msg("a", None, "root")]);
        engine.push_live("s", msg("c", Some("b"), "child"));
        engine.apply_incremental(&ticket, vec![msg("b", Some("a"), "parent")]);
        assert_eq!(ids(&engine.messages("s").unwrap()), vec!["a", "c", "b"]);
    }

    #[test]
    fn results_after_detach_are_discarded() {
        let engine = engine();
        engine.attach("s", Provider::Claude);
        let stale = engine.begin_fetch("s").unwrap();
        engine.detach("s");
        assert!(!engine.complete_bulk_load(&stale, vec![msg("a", None, "late")]));
        assert!(!engine.push_live("s", msg("b", None, "late push")));

        // A fresh view does not accept the old ticket either
        engine.attach("s", Provider::Claude);
        assert!(!engine.apply_incremental(&stale, vec![msg("a", None, "late")]));
        assert!(engine.messages("s").unwrap().is_empty());
    }

    #[test]
    fn shared_view_closes_with_last_holder() {
        let engine = engine();
        engine.attach("s", Provider::Codex);
        let ticket = engine.begin_fetch("s").unwrap();
        engine.complete_bulk_load(&ticket, vec![msg("a", None, "root")]);

        engine.attach("s", Provider::Codex);
        engine.detach("s");
        assert!(engine.is_attached("s"));
        assert!(engine.apply_incremental(&ticket, vec![msg("b", None, "next")]));
        assert_eq!(ids(&engine.messages("s").unwrap()), vec!["a", "b"]);

        engine.detach("s");
        assert!(!engine.is_attached("s"));
    }

    #[test]
    fn reload_keeps_live_copies_not_yet_on_disk() {
        let engine = engine();
        engine.attach("s", Provider::Codex);
        let ticket = engine.begin_fetch("s").unwrap();
        engine.complete_bulk_load(&ticket, vec![msg("a", None, "root")]);
        engine.push_live("s", msg("b", None, "streaming"));

        engine.complete_bulk_load(&ticket, vec![msg("a", None, "root")]);
        let view = engine.messages("s").unwrap();
        assert_eq!(ids(&view), vec!["a", "b"]);
        assert_eq!(view[1].source, SourceTag::Sdk);
    }

    #[test]
    fn dispose_and_initialize_lifecycle() {
        let engine = MergeEngine::new();
        assert!(!engine.attach("s", Provider::Codex));
        engine.initialize();
        assert!(engine.attach("s", Provider::Codex));
        engine.dispose();
        assert!(!engine.is_attached("s"));
        assert!(!engine.attach("s", Provider::Codex));
    }

    #[test]
    fn events_update_view_status() {
        let engine = engine();
        engine.attach("s", Provider::Claude);
        engine.apply_event("s", &SessionEvent::Status { state: AgentState::Running, request: None });
        engine.apply_event(
            "s",
            &SessionEvent::ModeChange { permission_mode: "plan".into(), mode_version: 4 },
        );
        engine.apply_event("s", &SessionEvent::Complete);
        let (status, complete) = engine.status("s").unwrap();
        assert_eq!(status.state, AgentState::Running);
        assert_eq!(status.permission_mode, "plan");
        assert!(complete);
    }

    #[test]
    fn reorder_survives_parent_cycles() {
        let mut messages = vec![msg("x", Some("y"), ""), msg("y", Some("x"), ""), msg("z", None, "")];
        reorder_by_parent(&mut messages);
        assert_eq!(ids(&messages), vec!["z", "x", "y"]);
    }
}
