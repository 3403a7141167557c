use indexmap::IndexMap;

use crate::muxbox::{MuxBox, Rect};
use crate::variables::{VariableMap, VariableScope};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    DuplicateBox(String),
    UnknownBox(String),
    UnknownParent { box_id: String, parent: String },
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayoutError::DuplicateBox(id) => write!(f, "duplicate box id `{id}`"),
            LayoutError::UnknownBox(id) => write!(f, "unknown box `{id}`"),
            LayoutError::UnknownParent { box_id, parent } => {
                write!(f, "box `{box_id}` refers to unknown parent `{parent}`")
            }
        }
    }
}

impl std::error::Error for LayoutError {}

/// A named tree of boxes stored as an arena keyed by box id. Children are
/// owned as id lists by their parent; the parent link is a plain id.
#[derive(Debug, Clone)]
pub struct Layout {
    pub id: String,
    pub title: Option<String>,
    boxes: IndexMap<String, MuxBox>,
    roots: Vec<String>,
}

impl Layout {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            boxes: IndexMap::new(),
            roots: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn contains(&self, box_id: &str) -> bool {
        self.boxes.contains_key(box_id)
    }

    pub fn get(&self, box_id: &str) -> Option<&MuxBox> {
        self.boxes.get(box_id)
    }

    pub fn get_mut(&mut self, box_id: &str) -> Option<&mut MuxBox> {
        self.boxes.get_mut(box_id)
    }

    /// Boxes in declaration order.
    pub fn boxes(&self) -> impl Iterator<Item = &MuxBox> {
        self.boxes.values()
    }

    pub fn boxes_mut(&mut self) -> impl Iterator<Item = &mut MuxBox> {
        self.boxes.values_mut()
    }

    pub fn box_ids(&self) -> Vec<String> {
        self.boxes.keys().cloned().collect()
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Adds `mux` under `parent`, or as a root when `parent` is `None`.
    pub fn insert(&mut self, mut mux: MuxBox, parent: Option<&str>) -> Result<(), LayoutError> {
        if self.boxes.contains_key(&mux.id) {
            return Err(LayoutError::DuplicateBox(mux.id));
        }
        match parent {
            Some(parent_id) => {
                let Some(parent) = self.boxes.get_mut(parent_id) else {
                    return Err(LayoutError::UnknownParent {
                        box_id: mux.id,
                        parent: parent_id.to_owned(),
                    });
                };
                parent.children.push(mux.id.clone());
                mux.parent = Some(parent_id.to_owned());
            }
            None => {
                self.roots.push(mux.id.clone());
                mux.parent = None;
            }
        }
        mux.children.clear();
        self.boxes.insert(mux.id.clone(), mux);
        Ok(())
    }

    /// Removes a box and its whole subtree, returning the removed boxes
    /// (parents before children) so their processes can be stopped.
    pub fn remove(&mut self, box_id: &str) -> Vec<MuxBox> {
        let Some(parent) = self.boxes.get(box_id).map(|mux| mux.parent.clone()) else {
            return Vec::new();
        };
        match parent {
            Some(parent_id) => {
                if let Some(parent) = self.boxes.get_mut(&parent_id) {
                    parent.children.retain(|child| child != box_id);
                }
            }
            None => self.roots.retain(|root| root != box_id),
        }

        let mut removed = Vec::new();
        let mut pending = vec![box_id.to_owned()];
        while let Some(id) = pending.pop() {
            if let Some(mux) = self.boxes.shift_remove(&id) {
                pending.extend(mux.children.iter().rev().cloned());
                removed.push(mux);
            }
        }
        removed
    }

    /// Ids of a box and all its descendants, parents before children.
    pub fn subtree(&self, box_id: &str) -> Vec<String> {
        let mut ids = Vec::new();
        let mut pending = vec![box_id.to_owned()];
        while let Some(id) = pending.pop() {
            if let Some(mux) = self.boxes.get(&id) {
                pending.extend(mux.children.iter().rev().cloned());
                ids.push(id);
            }
        }
        ids
    }

    /// Position of a box among its parent's children (or among the roots).
    pub fn sibling_index(&self, box_id: &str) -> Option<usize> {
        self.siblings(box_id)?
            .iter()
            .position(|sibling| sibling == box_id)
    }

    /// Moves a box to `index` among its siblings, clamped to the end.
    pub fn move_sibling(&mut self, box_id: &str, index: usize) {
        let parent = match self.boxes.get(box_id) {
            Some(mux) => mux.parent.clone(),
            None => return,
        };
        let siblings = match parent {
            Some(parent_id) => match self.boxes.get_mut(&parent_id) {
                Some(parent) => &mut parent.children,
                None => return,
            },
            None => &mut self.roots,
        };
        let Some(current) = siblings.iter().position(|sibling| sibling == box_id) else {
            return;
        };
        let id = siblings.remove(current);
        let index = index.min(siblings.len());
        siblings.insert(index, id);
    }

    /// Position of a box in declaration order.
    pub fn declaration_index(&self, box_id: &str) -> Option<usize> {
        self.boxes.get_index_of(box_id)
    }

    /// Moves a box and its descendants so they start at `index` in
    /// declaration order.
    pub fn move_declaration(&mut self, box_id: &str, index: usize) {
        let last = self.boxes.len().saturating_sub(1);
        for (offset, id) in self.subtree(box_id).iter().enumerate() {
            if let Some(from) = self.boxes.get_index_of(id) {
                self.boxes.move_index(from, (index + offset).min(last));
            }
        }
    }

    fn siblings(&self, box_id: &str) -> Option<&[String]> {
        match self.boxes.get(box_id)?.parent.as_deref() {
            Some(parent_id) => self.boxes.get(parent_id).map(|parent| parent.children.as_slice()),
            None => Some(&self.roots),
        }
    }

    /// Ancestors from the direct parent up to the root.
    pub fn ancestors(&self, box_id: &str) -> Vec<&MuxBox> {
        let mut chain = Vec::new();
        let mut next = self.boxes.get(box_id).and_then(|mux| mux.parent.as_deref());
        while let Some(parent_id) = next {
            let Some(parent) = self.boxes.get(parent_id) else {
                break;
            };
            // A corrupt parent link must not loop forever.
            if chain.len() > self.boxes.len() {
                break;
            }
            chain.push(parent);
            next = parent.parent.as_deref();
        }
        chain
    }

    /// Variable scope of a box: its own map, then every ancestor, then `app`.
    pub fn variable_scope<'a>(&'a self, box_id: &str, app: &'a VariableMap) -> VariableScope<'a> {
        let mut scope = VariableScope::new();
        if let Some(mux) = self.boxes.get(box_id) {
            scope = scope.with_layer(&mux.variables);
        }
        for ancestor in self.ancestors(box_id) {
            scope = scope.with_layer(&ancestor.variables);
        }
        scope.with_app(app)
    }

    /// Flattened variables visible to a box, as exported to its scripts.
    /// Nearer layers win over farther ones; `app` is the base.
    pub fn effective_variables(&self, box_id: &str, app: &VariableMap) -> VariableMap {
        let mut merged = app.clone();
        let mut chain = self.ancestors(box_id);
        chain.reverse();
        chain.extend(self.boxes.get(box_id));
        for mux in chain {
            for (name, value) in &mux.variables {
                merged.insert(name.clone(), value.clone());
            }
        }
        merged
    }

    /// Focusable boxes in traversal order: explicit `tab_order` first
    /// (ascending), then the rest in declaration order.
    pub fn focus_order(&self) -> Vec<String> {
        let mut focusable = self
            .boxes
            .values()
            .enumerate()
            .filter(|(_, mux)| mux.focusable)
            .map(|(seen, mux)| (mux.tab_order, seen, mux.id.clone()))
            .collect::<Vec<_>>();
        focusable.sort_by_key(|(tab_order, seen, _)| (tab_order.is_none(), *tab_order, *seen));
        focusable.into_iter().map(|(_, _, id)| id).collect()
    }

    pub fn next_focus(&self, current: Option<&str>) -> Option<String> {
        step_focus(&self.focus_order(), current, true)
    }

    pub fn previous_focus(&self, current: Option<&str>) -> Option<String> {
        step_focus(&self.focus_order(), current, false)
    }

    /// Resolved rectangle of a box on a screen of the given size.
    pub fn bounds(&self, box_id: &str, screen: Rect) -> Option<Rect> {
        let mux = self.boxes.get(box_id)?;
        let mut chain = self.ancestors(box_id);
        chain.reverse();
        let parent_rect = chain
            .into_iter()
            .fold(screen, |rect, ancestor| ancestor.position.resolve(rect));
        Some(mux.position.resolve(parent_rect))
    }
}

fn step_focus(order: &[String], current: Option<&str>, forward: bool) -> Option<String> {
    if order.is_empty() {
        return None;
    }
    let position = current.and_then(|id| order.iter().position(|candidate| candidate == id));
    let next = match (position, forward) {
        (None, true) => 0,
        (None, false) => order.len() - 1,
        (Some(index), true) => (index + 1) % order.len(),
        (Some(index), false) => (index + order.len() - 1) % order.len(),
    };
    order.get(next).cloned()
}

#[cfg(test)]
#[path = "tests/layout_tests.rs"]
mod tests;
