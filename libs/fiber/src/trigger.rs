// Copyright 2026 Loam Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Append-only trigger lists hanging off every fiber.
//!
//! `on_yield` fires after every suspension, `on_stop` exactly once at
//! termination. Callbacks return a status instead of panicking; the runner
//! logs failures and drops them, so triggers can never leave a diagnostic
//! behind. A callback may add or remove triggers, including itself: entries
//! are taken out of their slot for the duration of the call and only put
//! back if the slot still exists.

use loam_error::Result;

/// Handle for removing a registered trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerId(u64);

pub(crate) type TriggerFn = Box<dyn FnMut() -> Result<()>>;

#[derive(Default)]
pub(crate) struct TriggerList {
    entries: Vec<(TriggerId, Option<TriggerFn>)>,
    next: u64,
}

// === impl TriggerList ===

impl TriggerList {
    pub(crate) fn add(&mut self, f: TriggerFn) -> TriggerId {
        let id = TriggerId(self.next);
        self.next += 1;
        self.entries.push((id, Some(f)));
        id
    }

    pub(crate) fn remove(&mut self, id: TriggerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(tid, _)| *tid != id);
        self.entries.len() != before
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn ids(&self, reverse: bool) -> Vec<TriggerId> {
        let mut ids: Vec<_> = self.entries.iter().map(|(id, _)| *id).collect();
        if reverse {
            ids.reverse();
        }
        ids
    }

    pub(crate) fn take(&mut self, id: TriggerId) -> Option<TriggerFn> {
        self.entries
            .iter_mut()
            .find(|(tid, _)| *tid == id)
            .and_then(|(_, slot)| slot.take())
    }

    /// Re-install a callback taken with [`take`](Self::take); dropped when
    /// the trigger removed itself meanwhile.
    pub(crate) fn put_back(&mut self, id: TriggerId, f: TriggerFn) {
        if let Some((_, slot)) = self.entries.iter_mut().find(|(tid, _)| *tid == id) {
            if slot.is_none() {
                *slot = Some(f);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn run_order_and_removal() {
        let mut list = TriggerList::default();
        let hits = Rc::new(Cell::new(0));

        let h = hits.clone();
        let a = list.add(Box::new(move || {
            h.set(h.get() + 1);
            Ok(())
        }));
        let h = hits.clone();
        let _b = list.add(Box::new(move || {
            h.set(h.get() + 10);
            Ok(())
        }));

        for id in list.ids(false) {
            let mut f = list.take(id).unwrap();
            f().unwrap();
            list.put_back(id, f);
        }
        assert_eq!(hits.get(), 11);

        assert!(list.remove(a));
        assert!(!list.remove(a));
        assert_eq!(list.ids(false).len(), 1);
    }

    #[test]
    fn reverse_ids() {
        let mut list = TriggerList::default();
        let a = list.add(Box::new(|| Ok(())));
        let b = list.add(Box::new(|| Ok(())));
        assert_eq!(list.ids(true), vec![b, a]);
    }

    #[test]
    fn self_removed_trigger_is_not_reinstalled() {
        let mut list = TriggerList::default();
        let id = list.add(Box::new(|| Ok(())));
        let f = list.take(id).unwrap();
        list.remove(id);
        list.put_back(id, f);
        assert!(list.ids(false).is_empty());
    }
}
