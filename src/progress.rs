use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressState {
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub percent: u8,
    pub state: ProgressState,
}

type Listener = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// One element of the progress tree.
///
/// Leaves carry a settable percent and state; aggregates derive both from
/// their children with integer arithmetic:
/// `(sum(live percents) + 100 * completed) / (live + completed)`, so 100 is
/// reported iff every child reported 100. A completed child is detached from
/// the live set but counts permanently toward the denominator. Reported
/// percent is monotone non-decreasing.
pub struct ProgressNode {
    inner: Arc<Mutex<NodeInner>>,
}

impl Clone for ProgressNode {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct NodeInner {
    label: String,
    aggregate: bool,
    percent: u8,
    state: ProgressState,
    live: HashMap<u64, (u8, ProgressState)>,
    completed_children: u64,
    next_child_id: u64,
    parent: Option<(Weak<Mutex<NodeInner>>, u64)>,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
    adjusting: u32,
    dirty: bool,
    // Serializes listener invocations so delivered percents are monotone
    // even when worker threads race on updates.
    notify_gate: Arc<Mutex<()>>,
}

impl NodeInner {
    fn computed(&self) -> (u8, ProgressState) {
        let live = self.live.len() as u64;
        let total = live + self.completed_children;
        let percent = if total == 0 {
            0
        } else {
            let sum: u64 = self.live.values().map(|(p, _)| *p as u64).sum::<u64>()
                + 100 * self.completed_children;
            (sum / total) as u8
        };

        let any_error = self.live.values().any(|(_, s)| *s == ProgressState::Error);
        let any_running = self.live.values().any(|(_, s)| *s == ProgressState::Running);
        let state = if any_error {
            ProgressState::Error
        } else if live == 0 && self.completed_children > 0 {
            ProgressState::Completed
        } else if any_running || self.completed_children > 0 {
            ProgressState::Running
        } else {
            ProgressState::Pending
        };

        (percent, state)
    }

    /// Re-derive the outward value; returns the new event when it changed.
    fn refresh(&mut self) -> Option<ProgressEvent> {
        let (computed_percent, state) = self.computed();
        let percent = if state == ProgressState::Error {
            self.percent
        } else {
            computed_percent.max(self.percent)
        };

        if percent == self.percent && state == self.state {
            return None;
        }
        self.percent = percent;
        self.state = state;
        Some(ProgressEvent { percent, state })
    }
}

impl ProgressNode {
    pub fn new_root(label: impl Into<String>) -> Self {
        Self::new_node(label.into(), true, None)
    }

    fn new_node(
        label: String,
        aggregate: bool,
        parent: Option<(Weak<Mutex<NodeInner>>, u64)>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NodeInner {
                label,
                aggregate,
                percent: 0,
                state: ProgressState::Pending,
                live: HashMap::new(),
                completed_children: 0,
                next_child_id: 0,
                parent,
                listeners: Vec::new(),
                next_listener_id: 0,
                adjusting: 0,
                dirty: false,
                notify_gate: Arc::new(Mutex::new(())),
            })),
        }
    }

    pub fn add_leaf(&self, label: impl Into<String>) -> ProgressNode {
        self.add_child(label.into(), false)
    }

    pub fn add_aggregate(&self, label: impl Into<String>) -> ProgressNode {
        self.add_child(label.into(), true)
    }

    fn add_child(&self, label: String, aggregate: bool) -> ProgressNode {
        let (child, event) = {
            let mut inner = self.inner.lock();
            let id = inner.next_child_id;
            inner.next_child_id += 1;
            inner.live.insert(id, (0, ProgressState::Pending));
            let child =
                ProgressNode::new_node(label, aggregate, Some((Arc::downgrade(&self.inner), id)));
            let event = if inner.adjusting > 0 {
                if inner.refresh().is_some() {
                    inner.dirty = true;
                }
                None
            } else {
                inner.refresh()
            };
            (child, event)
        };
        if let Some(event) = event {
            self.emit(event);
            self.report_upward(event);
        }
        child
    }

    /// Leaf percent, clamped to 100. Ignored on aggregates and on leaves
    /// already in a terminal state.
    pub fn set_percent(&self, percent: u8) {
        let event = {
            let mut inner = self.inner.lock();
            if inner.aggregate {
                return;
            }
            if matches!(inner.state, ProgressState::Completed | ProgressState::Error) {
                return;
            }
            let percent = percent.min(100);
            if percent == inner.percent {
                return;
            }
            inner.percent = percent;
            if inner.state == ProgressState::Pending {
                inner.state = ProgressState::Running;
            }
            if inner.adjusting > 0 {
                inner.dirty = true;
                None
            } else {
                Some(ProgressEvent {
                    percent: inner.percent,
                    state: inner.state,
                })
            }
        };
        if let Some(event) = event {
            self.emit(event);
            self.report_upward(event);
        }
    }

    /// Leaf state transition. Completed forces percent to 100; terminal
    /// states are sticky.
    pub fn set_state(&self, state: ProgressState) {
        let event = {
            let mut inner = self.inner.lock();
            if inner.aggregate {
                return;
            }
            if matches!(inner.state, ProgressState::Completed | ProgressState::Error) {
                return;
            }
            if state == ProgressState::Completed {
                inner.percent = 100;
            }
            if state == inner.state {
                return;
            }
            inner.state = state;
            if inner.adjusting > 0 {
                inner.dirty = true;
                None
            } else {
                Some(ProgressEvent {
                    percent: inner.percent,
                    state,
                })
            }
        };
        if let Some(event) = event {
            self.emit(event);
            self.report_upward(event);
        }
    }

    /// Suppress outward notifications from this node until the matching
    /// `end_adjusting`, which emits at most one batched notification.
    pub fn begin_adjusting(&self) {
        self.inner.lock().adjusting += 1;
    }

    pub fn end_adjusting(&self) {
        let event = {
            let mut inner = self.inner.lock();
            if inner.adjusting > 0 {
                inner.adjusting -= 1;
            }
            if inner.adjusting == 0 && inner.dirty {
                inner.dirty = false;
                Some(ProgressEvent {
                    percent: inner.percent,
                    state: inner.state,
                })
            } else {
                None
            }
        };
        if let Some(event) = event {
            self.emit(event);
            self.report_upward(event);
        }
    }

    pub fn percent(&self) -> u8 {
        self.inner.lock().percent
    }

    pub fn state(&self) -> ProgressState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> ProgressEvent {
        let inner = self.inner.lock();
        ProgressEvent {
            percent: inner.percent,
            state: inner.state,
        }
    }

    pub fn label(&self) -> String {
        self.inner.lock().label.clone()
    }

    pub fn add_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(ProgressEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(listener_id, _)| *listener_id != id);
        inner.listeners.len() != before
    }

    /// Invoke this node's listeners with the current snapshot. A listener
    /// that panics is logged and deregistered; the tree is unaffected.
    fn emit(&self, _trigger: ProgressEvent) {
        let (gate, listeners): (Arc<Mutex<()>>, Vec<(u64, Listener)>) = {
            let inner = self.inner.lock();
            (
                Arc::clone(&inner.notify_gate),
                inner
                    .listeners
                    .iter()
                    .map(|(id, listener)| (*id, Arc::clone(listener)))
                    .collect(),
            )
        };
        if listeners.is_empty() {
            return;
        }

        let _serialized = gate.lock();
        let event = self.snapshot();
        let mut failed = Vec::new();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                eprintln!("Warning: progress listener panicked; deregistering it");
                failed.push(id);
            }
        }
        if !failed.is_empty() {
            self.inner
                .lock()
                .listeners
                .retain(|(id, _)| !failed.contains(id));
        }
    }

    /// Push a changed child value up the ancestor chain, one lock at a time.
    fn report_upward(&self, event: ProgressEvent) {
        let mut link = self.inner.lock().parent.clone();
        let mut report = event;

        while let Some((weak, id)) = link {
            let parent_arc = match weak.upgrade() {
                Some(arc) => arc,
                None => break,
            };
            let parent = ProgressNode { inner: parent_arc };

            let (next_link, changed, emit_allowed) = {
                let mut inner = parent.inner.lock();
                if report.state == ProgressState::Completed {
                    if inner.live.remove(&id).is_some() {
                        inner.completed_children += 1;
                    }
                } else if let Some(entry) = inner.live.get_mut(&id) {
                    *entry = (report.percent, report.state);
                } else {
                    // A detached aggregate child revived (new work attached
                    // under it after it had completed): put it back.
                    inner.live.insert(id, (report.percent, report.state));
                    inner.completed_children = inner.completed_children.saturating_sub(1);
                }
                let changed = inner.refresh();
                let emit_allowed = inner.adjusting == 0;
                if changed.is_some() && !emit_allowed {
                    inner.dirty = true;
                }
                (inner.parent.clone(), changed, emit_allowed)
            };

            match changed {
                Some(next_event) => {
                    if emit_allowed {
                        parent.emit(next_event);
                    }
                    report = next_event;
                    link = next_link;
                }
                None => break,
            }
        }
    }
}
