use super::ShuffleConfig;
use super::event::{FileOperationEvent, OperationKind, OperationOutcome};
use super::pattern::{MetadataPolicy, PatternTable, ShufflePattern, Slot, StepRole, StepTemplate};
use crate::path::RepoPath;
use crate::store::NodeId;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

pub const FALLBACK_PATTERN: &str = "fallback";

fn names_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b) || a.to_lowercase() == b.to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    Watching,
    /// Commit step seen; only cleanup steps remain.
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Idle,
    Watching,
}

/// A partially matched pattern.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub pattern: usize,
    pub next_step: usize,
    pub bindings: BTreeMap<Slot, String>,
    /// Node that occupied the target name before the shuffle.
    pub original: Option<NodeId>,
    /// Node that landed on the target name in the commit step.
    pub incoming: Option<NodeId>,
    pub state: CandidateState,
    pub last_seen: DateTime<Utc>,
}

impl Candidate {
    fn new(pattern: usize, at: DateTime<Utc>) -> Self {
        Self {
            pattern,
            next_step: 0,
            bindings: BTreeMap::new(),
            original: None,
            incoming: None,
            state: CandidateState::Watching,
            last_seen: at,
        }
    }

    fn same_progress(&self, other: &Candidate) -> bool {
        self.pattern == other.pattern
            && self.next_step == other.next_step
            && self.bindings.len() == other.bindings.len()
            && self
                .bindings
                .iter()
                .all(|(slot, name)| other.bindings.get(slot).is_some_and(|n| names_eq(n, name)))
    }

    fn binds_any(&self, names: &[&str]) -> bool {
        self.bindings
            .values()
            .any(|bound| names.iter().any(|n| names_eq(bound, n)))
    }

    fn shares_binding(&self, other: &Candidate) -> bool {
        let names: Vec<&str> = other.bindings.values().map(String::as_str).collect();
        self.binds_any(&names)
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub pattern: String,
    pub target: NodeId,
    pub final_path: RepoPath,
    pub at: DateTime<Utc>,
}

/// Rolling per-directory state: recent events, live candidates and resolved
/// candidates still waiting for their cleanup steps.
#[derive(Debug, Clone, Default)]
pub struct DirectoryWindow {
    events: VecDeque<FileOperationEvent>,
    live: Vec<Candidate>,
    resolved: Vec<Candidate>,
    resolutions: VecDeque<Resolution>,
    abandoned: u64,
}

impl DirectoryWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WindowState {
        if self.live.is_empty() && self.resolved.is_empty() {
            WindowState::Idle
        } else {
            WindowState::Watching
        }
    }

    pub fn events(&self) -> impl Iterator<Item = &FileOperationEvent> {
        self.events.iter()
    }

    pub fn live(&self) -> &[Candidate] {
        &self.live
    }

    pub fn resolved(&self) -> &[Candidate] {
        &self.resolved
    }

    pub fn resolutions(&self) -> impl Iterator<Item = &Resolution> {
        self.resolutions.iter()
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned
    }

    /// Time of the newest event, candidate step or resolution.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        let events = self.events.iter().map(|e| e.at);
        let candidates = self.live.iter().chain(&self.resolved).map(|c| c.last_seen);
        let resolutions = self.resolutions.iter().map(|r| r.at);
        events.chain(candidates).chain(resolutions).max()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.state() == WindowState::Idle && self.resolutions.is_empty()
    }

    fn push_event(&mut self, event: FileOperationEvent, limit: usize) {
        self.events.push_back(event);
        while self.events.len() > limit.max(1) {
            self.events.pop_front();
        }
    }

    fn forget_names(&mut self, names: &[&str]) {
        self.events
            .retain(|e| !e.names().iter().any(|n| names.iter().any(|m| names_eq(n, m))));
    }
}

/// The outcome of a completed shuffle: who survives and where.
#[derive(Debug, Clone, PartialEq)]
pub struct ShuffleMatch {
    pub pattern: String,
    pub policy: MetadataPolicy,
    pub original: NodeId,
    pub incoming: NodeId,
    pub final_path: RepoPath,
    pub bindings: BTreeMap<Slot, String>,
}

impl ShuffleMatch {
    pub fn is_fallback(&self) -> bool {
        self.pattern == FALLBACK_PATTERN
    }
}

pub struct ShuffleMatcher {
    table: PatternTable,
    config: ShuffleConfig,
}

impl ShuffleMatcher {
    pub fn new(table: PatternTable, config: ShuffleConfig) -> Self {
        Self { table, config }
    }

    pub fn table(&self) -> &PatternTable {
        &self.table
    }

    pub fn config(&self) -> &ShuffleConfig {
        &self.config
    }

    /// Feed one event into `window`. Returns the shuffle it completes, if any.
    ///
    /// Events must be observed in arrival order for their directory.
    pub fn observe(
        &self,
        window: &mut DirectoryWindow,
        event: &FileOperationEvent,
    ) -> Option<ShuffleMatch> {
        self.evict(window, event.at);
        window.push_event(event.clone(), self.config.window_size);

        if event.kind.is_transparent() {
            return None;
        }

        self.advance_resolved(window, event);

        let mut live = Vec::with_capacity(window.live.len());
        let mut completed = Vec::new();
        for candidate in std::mem::take(&mut window.live) {
            match self.try_advance(&candidate, event) {
                Some(advanced) if advanced.state == CandidateState::Resolved => {
                    completed.push(advanced)
                }
                Some(advanced) => live.push(advanced),
                None if self.touches(&candidate, event) => {
                    window.abandoned += 1;
                    debug!(
                        "abandoning {} candidate: {:?} {} broke the sequence",
                        self.pattern_name(candidate.pattern),
                        event.kind,
                        event.path
                    );
                }
                None => live.push(candidate),
            }
        }

        for index in 0..self.table.len() {
            let fresh = Candidate::new(index, event.at);
            let Some(started) = self.try_advance(&fresh, event) else {
                continue;
            };
            if live
                .iter()
                .chain(completed.iter())
                .any(|c| c.same_progress(&started))
            {
                continue;
            }
            if started.state == CandidateState::Resolved {
                completed.push(started);
            } else {
                live.push(started);
            }
        }

        while live.len() > self.config.window_size.max(1) {
            live.remove(0);
            window.abandoned += 1;
        }

        let winner = completed
            .into_iter()
            .filter(|c| c.original.is_some() && c.incoming.is_some())
            .max_by_key(|c| (c.next_step, self.score(c), Reverse(c.pattern)));

        let found = match winner {
            Some(winner) => {
                live.retain(|c| !c.shares_binding(&winner));
                let found = self.to_match(&winner, event);
                let steps = self
                    .table
                    .get(winner.pattern)
                    .map(|p| p.steps.len())
                    .unwrap_or(0);
                if found.is_some() && winner.next_step < steps {
                    window.resolved.push(winner);
                }
                found
            }
            None => self.fallback(window, event),
        };
        window.live = live;

        if let Some(found) = &found {
            debug!(
                "resolved {} shuffle at {} (original={}, incoming={})",
                found.pattern, found.final_path, found.original, found.incoming
            );
            let names: Vec<&str> = found.bindings.values().map(String::as_str).collect();
            window.forget_names(&names);
            window.resolutions.push_back(Resolution {
                pattern: found.pattern.clone(),
                target: found.original,
                final_path: found.final_path.clone(),
                at: event.at,
            });
            while window.resolutions.len() > self.config.window_size.max(1) {
                window.resolutions.pop_front();
            }
        }
        found
    }

    fn to_match(&self, winner: &Candidate, event: &FileOperationEvent) -> Option<ShuffleMatch> {
        let pattern = self.table.get(winner.pattern)?;
        Some(ShuffleMatch {
            pattern: pattern.name.clone(),
            policy: pattern.policy.clone(),
            original: winner.original?,
            incoming: winner.incoming?,
            final_path: event
                .directory()
                .join(winner.bindings.get(&Slot::Target)?),
            bindings: winner.bindings.clone(),
        })
    }

    fn pattern_name(&self, index: usize) -> &str {
        self.table
            .get(index)
            .map(|p| p.name.as_str())
            .unwrap_or("?")
    }

    /// Oldest instant still inside the rename timeout at `now`.
    pub fn horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let timeout = chrono::Duration::from_std(self.config.rename_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        now - timeout
    }

    /// True when nothing in `window` is younger than the rename timeout.
    pub fn is_stale(&self, window: &DirectoryWindow, now: DateTime<Utc>) -> bool {
        let horizon = self.horizon(now);
        window.last_activity().is_none_or(|at| at < horizon)
    }

    fn evict(&self, window: &mut DirectoryWindow, now: DateTime<Utc>) {
        let horizon = self.horizon(now);

        window.events.retain(|e| e.at >= horizon);
        let before = window.live.len();
        window.live.retain(|c| c.last_seen >= horizon);
        window.abandoned += (before - window.live.len()) as u64;
        window.resolved.retain(|c| c.last_seen >= horizon);
    }

    fn advance_resolved(&self, window: &mut DirectoryWindow, event: &FileOperationEvent) {
        let mut kept = Vec::with_capacity(window.resolved.len());
        for candidate in std::mem::take(&mut window.resolved) {
            let steps = self
                .table
                .get(candidate.pattern)
                .map(|p| p.steps.len())
                .unwrap_or(0);
            match self.try_advance(&candidate, event) {
                Some(advanced) if advanced.next_step < steps => kept.push(advanced),
                Some(_) => debug!(
                    "{} shuffle cleanup complete",
                    self.pattern_name(candidate.pattern)
                ),
                None if self.touches(&candidate, event) => {}
                None => kept.push(candidate),
            }
        }
        window.resolved = kept;
    }

    fn touches(&self, candidate: &Candidate, event: &FileOperationEvent) -> bool {
        event.succeeded() && !event.kind.is_transparent() && candidate.binds_any(&event.names())
    }

    fn score(&self, candidate: &Candidate) -> u32 {
        let Some(pattern) = self.table.get(candidate.pattern) else {
            return 0;
        };
        candidate
            .bindings
            .keys()
            .filter_map(|slot| pattern.predicate(*slot))
            .map(|p| p.specificity())
            .sum()
    }

    fn try_advance(&self, candidate: &Candidate, event: &FileOperationEvent) -> Option<Candidate> {
        let pattern = self.table.get(candidate.pattern)?;
        let step = pattern.steps.get(candidate.next_step)?;
        let mut next = candidate.clone();

        let matched = match step.template {
            StepTemplate::Create(slot) => {
                event.kind == OperationKind::Create
                    && event.succeeded()
                    && self.bind(pattern, &mut next, slot, event.name())
            }
            StepTemplate::Delete(slot) => {
                event.kind == OperationKind::Delete
                    && event.succeeded()
                    && self.bind(pattern, &mut next, slot, event.name())
            }
            StepTemplate::Rename { from, to } => {
                event.is_local_rename()
                    && event.succeeded()
                    && self.bind_pair(pattern, &mut next, from, to, event)
            }
            StepTemplate::RenameFailed { from, to } => {
                event.is_local_rename()
                    && event.outcome == OperationOutcome::NameCollision
                    && self.bind_pair(pattern, &mut next, from, to, event)
            }
        };
        if !matched || !self.derived_hold(pattern, &next) {
            return None;
        }

        match step.template {
            StepTemplate::Rename {
                from: Slot::Target,
                ..
            }
            | StepTemplate::Delete(Slot::Target)
                if next.original.is_none() =>
            {
                next.original = event.node;
            }
            _ => {}
        }
        if step.role == StepRole::Commit {
            next.incoming = event.node;
            next.state = CandidateState::Resolved;
        }
        next.next_step += 1;
        next.last_seen = event.at;
        Some(next)
    }

    fn bind_pair(
        &self,
        pattern: &ShufflePattern,
        candidate: &mut Candidate,
        from: Slot,
        to: Slot,
        event: &FileOperationEvent,
    ) -> bool {
        let Some(to_name) = event.to_name() else {
            return false;
        };
        !names_eq(event.name(), to_name)
            && self.bind(pattern, candidate, from, event.name())
            && self.bind(pattern, candidate, to, to_name)
    }

    fn bind(
        &self,
        pattern: &ShufflePattern,
        candidate: &mut Candidate,
        slot: Slot,
        name: &str,
    ) -> bool {
        if let Some(bound) = candidate.bindings.get(&slot) {
            return names_eq(bound, name);
        }
        if candidate
            .bindings
            .iter()
            .any(|(s, bound)| *s != slot && names_eq(bound, name))
        {
            return false;
        }
        let Some(predicate) = pattern.predicate(slot) else {
            return false;
        };
        let target = match slot {
            Slot::Target => Some(name),
            _ => candidate.bindings.get(&Slot::Target).map(String::as_str),
        };
        if !predicate.matches(name, target, &self.config.temp_suffixes) {
            return false;
        }
        candidate.bindings.insert(slot, name.to_string());
        true
    }

    /// Derived predicates accepted before the target was known must hold
    /// once it is.
    fn derived_hold(&self, pattern: &ShufflePattern, candidate: &Candidate) -> bool {
        let Some(target) = candidate.bindings.get(&Slot::Target) else {
            return true;
        };
        candidate.bindings.iter().all(|(slot, name)| {
            match pattern.predicate(*slot) {
                Some(predicate) if predicate.is_derived() => {
                    predicate.matches(name, Some(target), &self.config.temp_suffixes)
                }
                _ => true,
            }
        })
    }

    /// Generic single-rename policy: a name re-occupied shortly after its
    /// previous occupant moved away or was deleted keeps that occupant.
    fn fallback(
        &self,
        window: &DirectoryWindow,
        event: &FileOperationEvent,
    ) -> Option<ShuffleMatch> {
        if !event.succeeded() {
            return None;
        }
        let landing = match event.kind {
            OperationKind::Create => event.name(),
            OperationKind::Rename if event.is_local_rename() => event.to_name()?,
            _ => return None,
        };
        let incoming = event.node?;

        // the newest entry is `event` itself
        for prior in window.events.iter().rev().skip(1) {
            if !prior.succeeded() || prior.kind.is_transparent() {
                continue;
            }
            let from_here = names_eq(prior.name(), landing);
            let to_here = prior
                .to_name()
                .is_some_and(|to| prior.is_local_rename() && names_eq(to, landing));
            let vacated = match prior.kind {
                OperationKind::Delete => from_here,
                OperationKind::Rename => from_here && !to_here,
                _ => false,
            };
            let arrived = match prior.kind {
                OperationKind::Create => from_here,
                OperationKind::Rename => to_here && !from_here,
                _ => false,
            };
            if vacated {
                let original = prior.node?;
                if original == incoming {
                    return None;
                }
                let mut bindings = BTreeMap::new();
                bindings.insert(Slot::Target, landing.to_string());
                return Some(ShuffleMatch {
                    pattern: FALLBACK_PATTERN.to_string(),
                    policy: MetadataPolicy::default(),
                    original,
                    incoming,
                    final_path: event.directory().join(landing),
                    bindings,
                });
            }
            if arrived {
                return None;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::types::SessionId;
    use crate::shuffle::pattern::{
        NamePredicate, ShufflePattern, Slot::*, StepTemplate::*, builtin_patterns,
    };

    const SESSION: SessionId = SessionId(1);

    fn p(name: &str) -> RepoPath {
        RepoPath::parse(&format!("\\docs\\{name}")).unwrap()
    }

    fn create(name: &str, node: NodeId) -> FileOperationEvent {
        FileOperationEvent::new(OperationKind::Create, p(name), SESSION).with_node(node)
    }

    fn rename(from: &str, to: &str, node: NodeId) -> FileOperationEvent {
        FileOperationEvent::rename(p(from), p(to), SESSION).with_node(node)
    }

    fn delete(name: &str, node: NodeId) -> FileOperationEvent {
        FileOperationEvent::new(OperationKind::Delete, p(name), SESSION).with_node(node)
    }

    fn matcher() -> ShuffleMatcher {
        ShuffleMatcher::new(PatternTable::builtin(), ShuffleConfig::default())
    }

    fn replay(
        matcher: &ShuffleMatcher,
        window: &mut DirectoryWindow,
        events: Vec<FileOperationEvent>,
    ) -> Vec<ShuffleMatch> {
        events
            .iter()
            .filter_map(|e| matcher.observe(window, e))
            .collect()
    }

    #[test]
    fn test_word_2003_sequence() {
        let matcher = matcher();
        let mut window = DirectoryWindow::new();
        let found = replay(
            &matcher,
            &mut window,
            vec![
                create("~WRD0002.TMP", 20),
                rename("TEST.DOC", "~WRL0002.TMP", 10),
                rename("~WRD0002.TMP", "TEST.DOC", 20),
            ],
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pattern, "Word 2003");
        assert_eq!(found[0].original, 10);
        assert_eq!(found[0].incoming, 20);
        assert_eq!(found[0].final_path.to_string(), "\\docs\\TEST.DOC");

        assert_eq!(window.state(), WindowState::Watching);
        assert!(matcher
            .observe(&mut window, &delete("~WRL0002.TMP", 20))
            .is_none());
        assert!(window.resolved().is_empty());
    }

    #[test]
    fn test_word_2007_beats_generic_swap() {
        let matcher = matcher();
        let mut window = DirectoryWindow::new();
        let found = replay(
            &matcher,
            &mut window,
            vec![
                create("19ECA1A.tmp", 2),
                rename("TEST.DOCX", "788A1D3D.tmp", 1),
                rename("19ECA1A.tmp", "TEST.DOCX", 2),
            ],
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pattern, "Word 2007");
    }

    #[test]
    fn test_generic_swap_without_create() {
        let matcher = matcher();
        let mut window = DirectoryWindow::new();
        let found = replay(
            &matcher,
            &mut window,
            vec![
                rename("report.xls", "report.xls.tmp", 1),
                rename("~report.tmp", "report.xls", 2),
            ],
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pattern, "generic temp swap");
    }

    #[test]
    fn test_intervening_operation_abandons_candidate() {
        let matcher = matcher();
        let mut window = DirectoryWindow::new();
        let found = replay(
            &matcher,
            &mut window,
            vec![
                create("~WRD0002.TMP", 20),
                delete("~WRD0002.TMP", 20),
                rename("TEST.DOC", "~WRL0002.TMP", 10),
                create("~WRD0003.TMP", 21),
            ],
        );
        assert!(found.is_empty());
        assert!(window.abandoned() >= 1);
        assert!(window.live().iter().all(|c| {
            !c.bindings
                .values()
                .any(|n| n.eq_ignore_ascii_case("~WRD0002.TMP"))
        }));
    }

    #[test]
    fn test_transparent_events_do_not_break_sequence() {
        let matcher = matcher();
        let mut window = DirectoryWindow::new();
        let open = FileOperationEvent::new(OperationKind::Open, p("~WRD0002.TMP"), SESSION)
            .with_node(20);
        let close = FileOperationEvent::new(OperationKind::Close, p("~WRD0002.TMP"), SESSION)
            .with_node(20);
        let failed_delete = delete("TEST.DOC", 10).with_outcome(OperationOutcome::NotFound);
        let found = replay(
            &matcher,
            &mut window,
            vec![
                create("~WRD0002.TMP", 20),
                open,
                close,
                rename("TEST.DOC", "~WRL0002.TMP", 10),
                failed_delete,
                rename("~WRD0002.TMP", "TEST.DOC", 20),
            ],
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pattern, "Word 2003");
    }

    #[test]
    fn test_gedit_failed_rename_is_a_step() {
        let matcher = matcher();
        let mut window = DirectoryWindow::new();
        let failed = rename(".goutputstream-ABC", "notes.txt", 2)
            .with_outcome(OperationOutcome::NameCollision);
        let found = replay(
            &matcher,
            &mut window,
            vec![
                failed,
                delete("notes.txt", 1),
                rename(".goutputstream-ABC", "notes.txt", 2),
            ],
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pattern, "gedit");
        assert_eq!(found[0].original, 1);
        assert_eq!(found[0].incoming, 2);
    }

    #[test]
    fn test_disjoint_names_do_not_merge() {
        let matcher = matcher();
        let mut window = DirectoryWindow::new();
        let found = replay(
            &matcher,
            &mut window,
            vec![
                create("~WRD0002.TMP", 20),
                rename("A.DOC", "~WRL0002.TMP", 10),
                rename("~WRD0009.TMP", "B.DOC", 30),
            ],
        );
        assert!(found.is_empty());
    }

    #[test]
    fn test_fallback_preserves_previous_occupant() {
        let matcher = matcher();
        let mut window = DirectoryWindow::new();
        let found = replay(
            &matcher,
            &mut window,
            vec![delete("plain.txt", 1), create("plain.txt", 2)],
        );
        assert_eq!(found.len(), 1);
        assert!(found[0].is_fallback());
        assert_eq!(found[0].original, 1);
        assert_eq!(found[0].incoming, 2);
    }

    #[test]
    fn test_fallback_ignores_round_trip_rename() {
        let matcher = matcher();
        let mut window = DirectoryWindow::new();
        let found = replay(
            &matcher,
            &mut window,
            vec![rename("a.txt", "b.txt", 1), rename("b.txt", "a.txt", 1)],
        );
        assert!(found.is_empty());
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let twin = |name: &str| {
            ShufflePattern::new(name)
                .slot(Backup, NamePredicate::glob("*.bak"))
                .slot(Temp, NamePredicate::glob("*.new"))
                .setup(Rename {
                    from: Target,
                    to: Backup,
                })
                .commit(Rename {
                    from: Temp,
                    to: Target,
                })
        };
        let table = PatternTable::new(vec![twin("first"), twin("second")]).unwrap();
        let matcher = ShuffleMatcher::new(table, ShuffleConfig::default());

        for _ in 0..10 {
            let mut window = DirectoryWindow::new();
            let found = replay(
                &matcher,
                &mut window,
                vec![rename("x", "x.bak", 1), rename("x.new", "x", 2)],
            );
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].pattern, "first");
        }
    }

    #[test]
    fn test_vi_resolves_tilde_sequence_deterministically() {
        let matcher = matcher();
        for _ in 0..10 {
            let mut window = DirectoryWindow::new();
            let found = replay(
                &matcher,
                &mut window,
                vec![rename("viTest.txt", "viTest.txt~", 1), create("viTest.txt", 2)],
            );
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].pattern, "vi");
        }
    }

    #[test]
    fn test_window_age_bound_evicts_candidates() {
        let config = ShuffleConfig {
            rename_timeout: std::time::Duration::from_millis(100),
            ..ShuffleConfig::default()
        };
        let matcher = ShuffleMatcher::new(PatternTable::new(builtin_patterns()).unwrap(), config);
        let mut window = DirectoryWindow::new();
        let start = Utc::now();
        let later = start + chrono::Duration::seconds(10);

        matcher.observe(&mut window, &create("~WRD0002.TMP", 20).at(start));
        matcher.observe(&mut window, &rename("TEST.DOC", "~WRL0002.TMP", 10).at(later));
        let found = matcher.observe(&mut window, &rename("~WRD0002.TMP", "TEST.DOC", 20).at(later));

        // the Word candidate expired; the generic swap still matches the two
        // recent renames
        assert_eq!(found.map(|f| f.pattern), Some("generic temp swap".to_string()));
    }

    #[test]
    fn test_window_goes_stale_after_rename_timeout() {
        let config = ShuffleConfig {
            rename_timeout: std::time::Duration::from_millis(100),
            ..ShuffleConfig::default()
        };
        let matcher = ShuffleMatcher::new(PatternTable::builtin(), config);
        let mut window = DirectoryWindow::new();
        let start = Utc::now();

        assert!(window.is_empty());
        assert!(matcher.is_stale(&window, start));

        matcher.observe(&mut window, &rename("a.txt", "a.txt~", 1).at(start));
        assert_eq!(window.last_activity(), Some(start));
        assert!(!matcher.is_stale(&window, start + chrono::Duration::milliseconds(50)));
        assert!(matcher.is_stale(&window, start + chrono::Duration::milliseconds(150)));
    }

    #[test]
    fn test_idle_until_something_matches() {
        let matcher = matcher();
        let mut window = DirectoryWindow::new();
        assert_eq!(window.state(), WindowState::Idle);
        let open = FileOperationEvent::new(OperationKind::Open, p("a.txt"), SESSION);
        matcher.observe(&mut window, &open);
        assert_eq!(window.state(), WindowState::Idle);
        matcher.observe(&mut window, &rename("a.txt", "a.txt~", 1));
        assert_eq!(window.state(), WindowState::Watching);
    }
}
