use std::collections::VecDeque;
use std::fmt::Debug;

type Guard<C> = Box<dyn Fn(&C) -> bool + Send + Sync>;
type Action<E, C> = Box<dyn FnMut(&C, &mut VecDeque<E>) + Send + Sync>;

/// One edge of the machine: `(from, event) -> to`, optionally gated by
/// a guard and carrying an action.
///
/// Guards are pure predicates over a caller-supplied context snapshot;
/// they must not take locks. Actions may push follow-up events into the
/// queue they are handed; those are processed after the action returns.
pub struct Transition<S, E, C> {
    from: S,
    event: E,
    to: S,
    guard: Option<Guard<C>>,
    action: Option<Action<E, C>>,
}

impl<S, E, C> Transition<S, E, C> {
    pub fn new(from: S, event: E, to: S) -> Self {
        Self {
            from,
            event,
            to,
            guard: None,
            action: None,
        }
    }

    pub fn guarded(mut self, guard: impl Fn(&C) -> bool + Send + Sync + 'static) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    pub fn with_action(mut self, action: impl FnMut(&C, &mut VecDeque<E>) + Send + Sync + 'static) -> Self {
        self.action = Some(Box::new(action));
        self
    }
}

/// Declarative finite state machine with guarded transitions and
/// per-state entry actions.
///
/// Transitions are evaluated in registration order: on an event, the
/// first transition out of the current state whose guard holds fires;
/// its action runs, then the entry action of the destination. An event
/// with no eligible transition is rejected. The machine itself is not
/// synchronized; drive it under the owner's mutex.
pub struct Fsm<S, E, C> {
    current: S,
    transitions: Vec<Transition<S, E, C>>,
    entries: Vec<(S, Action<E, C>)>,
    pending: VecDeque<E>,
}

impl<S, E, C> Fsm<S, E, C>
where
    S: Clone + PartialEq + Debug,
    E: Clone + PartialEq + Debug,
{
    pub fn new(initial: S) -> Self {
        Self {
            current: initial,
            transitions: Vec::new(),
            entries: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn add_transition(&mut self, transition: Transition<S, E, C>) {
        self.transitions.push(transition);
    }

    /// Register the entry action of `state`, replacing any previous one.
    pub fn set_entry(&mut self, state: S, action: impl FnMut(&C, &mut VecDeque<E>) + Send + Sync + 'static) {
        if let Some(slot) = self.entries.iter_mut().find(|(s, _)| *s == state) {
            slot.1 = Box::new(action);
        } else {
            self.entries.push((state, Box::new(action)));
        }
    }

    pub fn state(&self) -> &S {
        &self.current
    }

    /// Feed one event into the machine, then drain any events queued by
    /// actions along the way. Returns whether the *first* event fired a
    /// transition; queued follow-ups fire or are rejected on their own.
    pub fn handle_event(&mut self, event: E, ctx: &C) -> bool {
        let fired = self.step(event, ctx);
        while let Some(queued) = self.pending.pop_front() {
            self.step(queued, ctx);
        }
        fired
    }

    fn step(&mut self, event: E, ctx: &C) -> bool {
        let mut eligible = None;
        for (i, t) in self.transitions.iter().enumerate() {
            if t.from != self.current || t.event != event {
                continue;
            }
            if t.guard.as_ref().map(|g| g(ctx)).unwrap_or(true) {
                eligible = Some(i);
                break;
            }
        }

        let Some(i) = eligible else {
            tracing::trace!(
                "[Fsm] event {:?} rejected in state {:?}",
                event,
                self.current
            );
            return false;
        };

        let mut queued = VecDeque::new();
        let to = self.transitions[i].to.clone();
        if let Some(action) = self.transitions[i].action.as_mut() {
            action(ctx, &mut queued);
        }

        let from = std::mem::replace(&mut self.current, to);
        tracing::debug!("[Fsm] {:?} --{:?}--> {:?}", from, event, self.current);

        let current = self.current.clone();
        if let Some((_, entry)) = self.entries.iter_mut().find(|(s, _)| *s == current) {
            entry(ctx, &mut queued);
        }

        self.pending.append(&mut queued);
        true
    }
}
