//! Named trigger edges.
//!
//! A trigger carrying `tag: t0` publishes its start and stop edges here;
//! peers listen for `t0.start` / `t0.stop`. Listening before the tag is
//! defined is allowed; [`TagRegistry::undefined_references`] reports
//! anything still unresolved once every report has been armed.

use super::expr::Edge;
use st_common::{Error, Result};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagListenerId(u64);

type Listener = Rc<dyn Fn()>;

#[derive(Default)]
struct TagState {
    defined: bool,
    fired_start: bool,
    fired_stop: bool,
    listeners: Vec<(TagListenerId, Edge, Listener)>,
}

#[derive(Default)]
struct TagTable {
    tags: BTreeMap<String, TagState>,
    next_id: u64,
}

/// Shared tag table; clones refer to the same registry.
#[derive(Clone, Default)]
pub struct TagRegistry {
    inner: Rc<RefCell<TagTable>>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `tag`. Each tag may be defined by one trigger only.
    pub fn define(&self, tag: &str) -> Result<()> {
        let mut table = self.inner.borrow_mut();
        let state = table.tags.entry(tag.to_string()).or_default();
        if state.defined {
            return Err(Error::trigger(format!("trigger tag '{}' is defined more than once", tag)));
        }
        state.defined = true;
        Ok(())
    }

    pub fn is_defined(&self, tag: &str) -> bool {
        self.inner.borrow().tags.get(tag).is_some_and(|s| s.defined)
    }

    pub fn has_fired(&self, tag: &str, edge: Edge) -> bool {
        self.inner.borrow().tags.get(tag).is_some_and(|s| match edge {
            Edge::Start => s.fired_start,
            Edge::Stop => s.fired_stop,
        })
    }

    /// Call `listener` each time `tag` reaches `edge` from now on.
    pub fn listen(&self, tag: &str, edge: Edge, listener: impl Fn() + 'static) -> TagListenerId {
        let mut table = self.inner.borrow_mut();
        let id = TagListenerId(table.next_id);
        table.next_id += 1;
        table
            .tags
            .entry(tag.to_string())
            .or_default()
            .listeners
            .push((id, edge, Rc::new(listener)));
        id
    }

    pub fn unlisten(&self, tag: &str, id: TagListenerId) -> bool {
        let mut table = self.inner.borrow_mut();
        let Some(state) = table.tags.get_mut(tag) else {
            return false;
        };
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _, _)| *lid != id);
        state.listeners.len() != before
    }

    pub fn listener_count(&self, tag: &str) -> usize {
        self.inner.borrow().tags.get(tag).map_or(0, |s| s.listeners.len())
    }

    /// Publish an edge. Listeners run after the table is released, so they
    /// may arm or cancel other listeners.
    pub fn fire(&self, tag: &str, edge: Edge) {
        let listeners: Vec<Listener> = {
            let mut table = self.inner.borrow_mut();
            let Some(state) = table.tags.get_mut(tag) else {
                return;
            };
            match edge {
                Edge::Start => state.fired_start = true,
                Edge::Stop => state.fired_stop = true,
            }
            state
                .listeners
                .iter()
                .filter(|(_, e, _)| *e == edge)
                .map(|(_, _, l)| Rc::clone(l))
                .collect()
        };
        trace!(tag, edge = %edge, listeners = listeners.len(), "Tag edge fired");
        for listener in listeners {
            listener();
        }
    }

    /// Tags that are listened to but never defined.
    pub fn undefined_references(&self) -> Vec<String> {
        self.inner
            .borrow()
            .tags
            .iter()
            .filter(|(_, s)| !s.defined && !s.listeners.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Check that every referenced tag has a definition.
    pub fn validate(&self) -> Result<()> {
        let missing = self.undefined_references();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::trigger(format!(
                "trigger references unknown tag(s): {}",
                missing.join(", ")
            )))
        }
    }
}

impl std::fmt::Debug for TagRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.inner.borrow();
        f.debug_struct("TagRegistry")
            .field("tags", &table.tags.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_forward_listen_then_define() {
        let tags = TagRegistry::new();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        tags.listen("t0", Edge::Stop, move || h.set(h.get() + 1));
        assert_eq!(tags.undefined_references(), vec!["t0".to_string()]);
        assert!(tags.validate().is_err());

        tags.define("t0").unwrap();
        assert!(tags.validate().is_ok());
        tags.fire("t0", Edge::Start);
        assert_eq!(hits.get(), 0);
        tags.fire("t0", Edge::Stop);
        assert_eq!(hits.get(), 1);
        assert!(tags.has_fired("t0", Edge::Stop));
    }

    #[test]
    fn test_duplicate_definition_rejected() {
        let tags = TagRegistry::new();
        tags.define("t0").unwrap();
        assert!(tags.define("t0").is_err());
    }

    #[test]
    fn test_listener_may_unlisten_itself() {
        let tags = TagRegistry::new();
        tags.define("t").unwrap();
        let slot: Rc<Cell<Option<TagListenerId>>> = Rc::new(Cell::new(None));
        let reg = tags.clone();
        let s = Rc::clone(&slot);
        let id = tags.listen("t", Edge::Start, move || {
            if let Some(id) = s.get() {
                reg.unlisten("t", id);
            }
        });
        slot.set(Some(id));
        tags.fire("t", Edge::Start);
        assert_eq!(tags.listener_count("t"), 0);
    }
}
