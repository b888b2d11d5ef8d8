//! Keyed figure collection with stable z-order.
//!
//! Lookup is by id through a hash index; iteration order is insertion
//! order, which is the z-order (later figures draw on top) and must
//! survive replication. The type itself is not synchronized — the
//! server serializes access through a single lock, the mirror owns its
//! copy outright.

use scribble_core::{Figure, FigureId};
use std::collections::HashMap;

/// The authoritative (or mirrored) collection of figures.
///
/// At most one figure per id. `add`/`update`/`remove` implement the
/// server-side semantics; `upsert` is the mirror's apply-remote-change
/// primitive.
#[derive(Debug, Default)]
pub struct FigureStore {
    by_id: HashMap<FigureId, Figure>,
    /// Insertion order of live ids (z-order).
    order: Vec<FigureId>,
}

impl FigureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a figure if no entry shares its id.
    ///
    /// Returns whether it was inserted. A duplicate id is silently
    /// absorbed — that is the de-duplication policy, not an error.
    pub fn add(&mut self, figure: Figure) -> bool {
        if self.by_id.contains_key(&figure.id) {
            return false;
        }
        self.order.push(figure.id);
        self.by_id.insert(figure.id, figure);
        true
    }

    /// Replace the entry with the same id.
    ///
    /// Returns false if no such entry exists; the store is unchanged
    /// in that case (a missing target is reported, never inserted).
    pub fn update(&mut self, figure: Figure) -> bool {
        match self.by_id.get_mut(&figure.id) {
            Some(slot) => {
                *slot = figure;
                true
            }
            None => false,
        }
    }

    /// Remove and return the entry with the given id, if present.
    pub fn remove(&mut self, id: FigureId) -> Option<Figure> {
        let removed = self.by_id.remove(&id)?;
        self.order.retain(|fid| *fid != id);
        Some(removed)
    }

    /// Replace the entry with the same id, or insert at the top of the
    /// z-order if absent. Returns true if an entry was replaced.
    ///
    /// This single operation applies remote `Added` and `Updated`
    /// changes uniformly on a mirror.
    pub fn upsert(&mut self, figure: Figure) -> bool {
        if self.update(figure.clone()) {
            true
        } else {
            self.add(figure);
            false
        }
    }

    /// Point-in-time copy, in insertion (z-) order.
    pub fn snapshot(&self) -> Vec<Figure> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect()
    }

    /// Replace the whole collection from a snapshot, preserving its
    /// order. Used when a mirror seeds from the server on connect.
    pub fn reset(&mut self, figures: Vec<Figure>) {
        self.by_id.clear();
        self.order.clear();
        for figure in figures {
            self.add(figure);
        }
    }

    pub fn get(&self, id: FigureId) -> Option<&Figure> {
        self.by_id.get(&id)
    }

    pub fn contains(&self, id: FigureId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
