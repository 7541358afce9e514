use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::error::TreeError;
use crate::item::{MenuId, MenuItem};
use crate::value::{MenuState, MenuValue};

/// Direction for `MenuTree::move_item`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Up,
    Down,
}

/// Structural half of the tree: every definition plus the ordered children
/// of each submenu. Only ever touched with the structure lock held.
struct Structure {
    items: HashMap<MenuId, MenuItem>,
    children: HashMap<MenuId, Vec<MenuId>>,
}

impl Structure {
    fn descendants(&self, id: MenuId, out: &mut Vec<MenuId>) {
        if let Some(kids) = self.children.get(&id) {
            for kid in kids {
                out.push(*kid);
                self.descendants(*kid, out);
            }
        }
    }

    fn parent_of(&self, id: MenuId) -> Option<MenuId> {
        self.children
            .iter()
            .find(|(_, kids)| kids.contains(&id))
            .map(|(parent, _)| *parent)
    }

    fn walk(&self, parent: MenuId, skip_local: bool, out: &mut Vec<(MenuId, MenuItem)>) {
        let Some(kids) = self.children.get(&parent) else {
            return;
        };
        for kid in kids {
            let Some(item) = self.items.get(kid) else {
                continue;
            };
            if skip_local && item.local_only {
                continue;
            }
            out.push((parent, item.clone()));
            if item.is_sub_menu() {
                self.walk(*kid, skip_local, out);
            }
        }
    }
}

/// A hierarchical set of menu items and their current values.
///
/// Structural operations serialize on one lock. Values live in a concurrent
/// map, so reading or writing a value never waits on a structural change.
pub struct MenuTree {
    structure: Mutex<Structure>,
    states: DashMap<MenuId, MenuState>,
}

impl Default for MenuTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MenuTree {
    pub fn new() -> Self {
        let root = MenuItem::sub_menu(MenuId::ROOT, "Root");
        let mut items = HashMap::new();
        items.insert(MenuId::ROOT, root);
        let mut children = HashMap::new();
        children.insert(MenuId::ROOT, Vec::new());
        Self {
            structure: Mutex::new(Structure { items, children }),
            states: DashMap::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Structure> {
        self.structure.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `item` as the last child of `parent`.
    pub fn add_item(&self, parent: MenuId, item: MenuItem) -> Result<(), TreeError> {
        let mut s = self.lock();
        if s.items.contains_key(&item.id) {
            return Err(TreeError::DuplicateId(item.id));
        }
        let kids = s
            .children
            .get_mut(&parent)
            .ok_or(TreeError::ParentNotFound(parent))?;
        kids.push(item.id);
        if item.is_sub_menu() {
            s.children.insert(item.id, Vec::new());
        }
        debug!(item = %item.id, parent = %parent, kind = item.kind_name(), "added menu item");
        s.items.insert(item.id, item);
        Ok(())
    }

    /// Remove an item and, for a submenu, everything below it. Returns the
    /// ids removed, the item itself first.
    pub fn remove_item(&self, id: MenuId) -> Result<Vec<MenuId>, TreeError> {
        if id.is_root() {
            return Err(TreeError::RootImmutable);
        }
        let mut s = self.lock();
        if !s.items.contains_key(&id) {
            return Err(TreeError::ItemNotFound(id));
        }
        let parent = s.parent_of(id);
        if let Some(kids) = parent.and_then(|p| s.children.get_mut(&p)) {
            kids.retain(|k| *k != id);
        }
        let mut removed = vec![id];
        s.descendants(id, &mut removed);
        for gone in &removed {
            s.items.remove(gone);
            s.children.remove(gone);
            self.states.remove(gone);
        }
        debug!(item = %id, removed = removed.len(), "removed menu item");
        Ok(removed)
    }

    /// Swap `id` with its neighbour in `parent`'s child list. Moving past
    /// either end leaves the order unchanged.
    pub fn move_item(
        &self,
        parent: MenuId,
        id: MenuId,
        direction: MoveDirection,
    ) -> Result<(), TreeError> {
        let mut s = self.lock();
        let kids = s
            .children
            .get_mut(&parent)
            .ok_or(TreeError::ParentNotFound(parent))?;
        let pos = kids
            .iter()
            .position(|k| *k == id)
            .ok_or(TreeError::NotAChild { parent, item: id })?;
        match direction {
            MoveDirection::Up if pos > 0 => kids.swap(pos, pos - 1),
            MoveDirection::Down if pos + 1 < kids.len() => kids.swap(pos, pos + 1),
            _ => {}
        }
        Ok(())
    }

    /// Replace the definition stored under `item.id`, keeping its position.
    ///
    /// A submenu that stays a submenu keeps its children. An item that turns
    /// into a submenu starts with no children; a submenu that turns into
    /// something else loses its whole subtree.
    pub fn replace_item(&self, item: MenuItem) -> Result<(), TreeError> {
        if item.id.is_root() {
            return Err(TreeError::RootImmutable);
        }
        let mut s = self.lock();
        let was_sub_menu = match s.items.get(&item.id) {
            Some(old) => old.is_sub_menu(),
            None => return Err(TreeError::ItemNotFound(item.id)),
        };
        match (was_sub_menu, item.is_sub_menu()) {
            (false, true) => {
                s.children.insert(item.id, Vec::new());
            }
            (true, false) => {
                let mut dropped = Vec::new();
                s.descendants(item.id, &mut dropped);
                for gone in &dropped {
                    s.items.remove(gone);
                    s.children.remove(gone);
                    self.states.remove(gone);
                }
                s.children.remove(&item.id);
            }
            _ => {}
        }
        s.items.insert(item.id, item);
        Ok(())
    }

    /// Store a full state for `id`. Does not consult the structure.
    pub fn change_state(&self, id: MenuId, state: MenuState) {
        self.states.insert(id, state);
    }

    /// Store `value` for an existing item, flagged as changed.
    pub fn change_item(&self, id: MenuId, value: MenuValue) -> Result<(), TreeError> {
        if !self.contains(id) {
            return Err(TreeError::ItemNotFound(id));
        }
        self.states.insert(id, MenuState::changed(value));
        Ok(())
    }

    /// Compute and store a new value for `id` from its current one while
    /// holding that item's entry, so concurrent updates cannot interleave.
    /// Nothing is stored when `f` fails.
    pub fn update_item<E, F>(&self, id: MenuId, f: F) -> Result<MenuValue, E>
    where
        F: FnOnce(Option<&MenuValue>) -> Result<MenuValue, E>,
        E: From<TreeError>,
    {
        if !self.contains(id) {
            return Err(TreeError::ItemNotFound(id).into());
        }
        match self.states.entry(id) {
            Entry::Occupied(mut entry) => {
                let value = f(Some(&entry.get().value))?;
                entry.insert(MenuState::changed(value.clone()));
                Ok(value)
            }
            Entry::Vacant(entry) => {
                let value = f(None)?;
                entry.insert(MenuState::changed(value.clone()));
                Ok(value)
            }
        }
    }

    pub fn get_state(&self, id: MenuId) -> Option<MenuState> {
        self.states.get(&id).map(|s| s.value().clone())
    }

    /// False for items that never leave this process: local-only items and
    /// anything beneath a local-only submenu. Unknown ids are not visible.
    pub fn is_remote_visible(&self, id: MenuId) -> bool {
        let s = self.lock();
        let mut current = id;
        while !current.is_root() {
            match s.items.get(&current) {
                Some(item) if !item.local_only => {}
                _ => return false,
            }
            match s.parent_of(current) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
        true
    }

    /// Current value of `item`, or the kind's default when never set.
    pub fn value_or_default(&self, item: &MenuItem) -> MenuValue {
        self.get_state(item.id)
            .map(|s| s.value)
            .unwrap_or_else(|| item.default_value())
    }

    /// The submenu holding `id`. Scans every child list.
    pub fn find_parent(&self, id: MenuId) -> Option<MenuItem> {
        let s = self.lock();
        let parent = s.parent_of(id)?;
        s.items.get(&parent).cloned()
    }

    /// Children of a submenu in display order; empty for anything else.
    pub fn children_of(&self, id: MenuId) -> Vec<MenuItem> {
        let s = self.lock();
        s.children
            .get(&id)
            .map(|kids| kids.iter().filter_map(|k| s.items.get(k).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn get_item(&self, id: MenuId) -> Option<MenuItem> {
        self.lock().items.get(&id).cloned()
    }

    pub fn contains(&self, id: MenuId) -> bool {
        self.lock().items.contains_key(&id)
    }

    /// Number of items, not counting the root.
    pub fn len(&self) -> usize {
        self.lock().items.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every item below the root, depth first.
    pub fn all_items(&self) -> Vec<MenuItem> {
        let mut out = Vec::new();
        self.lock().walk(MenuId::ROOT, false, &mut out);
        out.into_iter().map(|(_, item)| item).collect()
    }

    /// `(parent, item)` pairs in boot order: depth first, every parent ahead
    /// of its children, local-only items and their subtrees left out.
    pub fn visible_depth_first(&self) -> Vec<(MenuId, MenuItem)> {
        let mut out = Vec::new();
        self.lock().walk(MenuId::ROOT, true, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::BooleanNaming;

    fn sample() -> MenuTree {
        let tree = MenuTree::new();
        tree.add_item(MenuId::ROOT, MenuItem::analog(MenuId(1), "Volume", 100))
            .unwrap();
        tree.add_item(MenuId::ROOT, MenuItem::sub_menu(MenuId(2), "Settings"))
            .unwrap();
        tree.add_item(
            MenuId(2),
            MenuItem::boolean(MenuId(3), "Power", BooleanNaming::OnOff),
        )
        .unwrap();
        tree.add_item(MenuId(2), MenuItem::sub_menu(MenuId(4), "Advanced"))
            .unwrap();
        tree.add_item(MenuId(4), MenuItem::text(MenuId(5), "Host", 20))
            .unwrap();
        tree
    }

    fn ids(items: &[MenuItem]) -> Vec<u32> {
        items.iter().map(|i| i.id.0).collect()
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let tree = sample();
        let err = tree
            .add_item(MenuId::ROOT, MenuItem::action(MenuId(3), "Again"))
            .unwrap_err();
        assert_eq!(err, TreeError::DuplicateId(MenuId(3)));
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn add_needs_an_existing_submenu() {
        let tree = sample();
        assert_eq!(
            tree.add_item(MenuId(99), MenuItem::action(MenuId(10), "Go")),
            Err(TreeError::ParentNotFound(MenuId(99)))
        );
        // an analog item is not a submenu
        assert_eq!(
            tree.add_item(MenuId(1), MenuItem::action(MenuId(10), "Go")),
            Err(TreeError::ParentNotFound(MenuId(1)))
        );
    }

    #[test]
    fn remove_submenu_takes_descendants_and_states() {
        let tree = sample();
        tree.change_item(MenuId(5), MenuValue::Text("x".into()))
            .unwrap();

        let removed = tree.remove_item(MenuId(2)).unwrap();
        assert_eq!(removed[0], MenuId(2));
        assert_eq!(removed.len(), 4);
        assert!(!tree.contains(MenuId(5)));
        assert!(tree.get_state(MenuId(5)).is_none());
        assert_eq!(ids(&tree.children_of(MenuId::ROOT)), vec![1]);
    }

    #[test]
    fn root_cannot_be_removed() {
        let tree = sample();
        assert_eq!(tree.remove_item(MenuId::ROOT), Err(TreeError::RootImmutable));
        assert_eq!(
            tree.remove_item(MenuId(77)),
            Err(TreeError::ItemNotFound(MenuId(77)))
        );
    }

    #[test]
    fn move_swaps_and_stops_at_edges() {
        let tree = sample();
        tree.move_item(MenuId::ROOT, MenuId(2), MoveDirection::Up)
            .unwrap();
        assert_eq!(ids(&tree.children_of(MenuId::ROOT)), vec![2, 1]);

        tree.move_item(MenuId::ROOT, MenuId(2), MoveDirection::Up)
            .unwrap();
        assert_eq!(ids(&tree.children_of(MenuId::ROOT)), vec![2, 1]);

        tree.move_item(MenuId::ROOT, MenuId(1), MoveDirection::Down)
            .unwrap();
        assert_eq!(ids(&tree.children_of(MenuId::ROOT)), vec![2, 1]);

        assert_eq!(
            tree.move_item(MenuId::ROOT, MenuId(3), MoveDirection::Up),
            Err(TreeError::NotAChild {
                parent: MenuId::ROOT,
                item: MenuId(3)
            })
        );
    }

    #[test]
    fn replace_keeps_position_and_children() {
        let tree = sample();
        tree.replace_item(MenuItem::sub_menu(MenuId(2), "Config"))
            .unwrap();
        assert_eq!(tree.get_item(MenuId(2)).unwrap().name, "Config");
        assert_eq!(ids(&tree.children_of(MenuId(2))), vec![3, 4]);
        assert_eq!(ids(&tree.children_of(MenuId::ROOT)), vec![1, 2]);
    }

    #[test]
    fn replace_migrates_child_lists() {
        let tree = sample();
        tree.replace_item(MenuItem::action(MenuId(4), "Flat"))
            .unwrap();
        assert!(!tree.contains(MenuId(5)));
        assert!(tree.children_of(MenuId(4)).is_empty());

        tree.replace_item(MenuItem::sub_menu(MenuId(1), "Now a menu"))
            .unwrap();
        tree.add_item(MenuId(1), MenuItem::action(MenuId(6), "Inner"))
            .unwrap();
        assert_eq!(tree.find_parent(MenuId(6)).unwrap().id, MenuId(1));
    }

    #[test]
    fn find_parent_of_top_level_is_root() {
        let tree = sample();
        assert_eq!(tree.find_parent(MenuId(1)).unwrap().id, MenuId::ROOT);
        assert_eq!(tree.find_parent(MenuId(5)).unwrap().id, MenuId(4));
        assert!(tree.find_parent(MenuId::ROOT).is_none());
    }

    #[test]
    fn value_defaults_until_set() {
        let tree = sample();
        let volume = tree.get_item(MenuId(1)).unwrap();
        assert!(tree.get_state(MenuId(1)).is_none());
        assert_eq!(tree.value_or_default(&volume), MenuValue::Int(0));

        tree.change_item(MenuId(1), MenuValue::Int(30)).unwrap();
        let state = tree.get_state(MenuId(1)).unwrap();
        assert!(state.changed);
        assert_eq!(tree.value_or_default(&volume), MenuValue::Int(30));

        assert_eq!(
            tree.change_item(MenuId(50), MenuValue::Int(1)),
            Err(TreeError::ItemNotFound(MenuId(50)))
        );
    }

    #[test]
    fn boot_order_skips_local_only_subtrees() {
        let tree = sample();
        tree.add_item(
            MenuId::ROOT,
            MenuItem::sub_menu(MenuId(7), "Hidden").with_local_only(true),
        )
        .unwrap();
        tree.add_item(MenuId(7), MenuItem::action(MenuId(8), "Secret"))
            .unwrap();

        let order: Vec<(u32, u32)> = tree
            .visible_depth_first()
            .iter()
            .map(|(p, i)| (p.0, i.id.0))
            .collect();
        assert_eq!(order, vec![(0, 1), (0, 2), (2, 3), (2, 4), (4, 5)]);
        assert_eq!(tree.all_items().len(), 7);

        assert!(!tree.is_remote_visible(MenuId(7)));
        assert!(!tree.is_remote_visible(MenuId(8)));
        assert!(tree.is_remote_visible(MenuId(5)));
        assert!(!tree.is_remote_visible(MenuId(99)));
    }

    #[test]
    fn update_item_sees_the_current_value() {
        let tree = sample();
        let bump = |v: Option<&MenuValue>| -> Result<MenuValue, TreeError> {
            Ok(MenuValue::Int(v.and_then(MenuValue::as_int).unwrap_or(0) + 1))
        };
        assert_eq!(tree.update_item(MenuId(1), bump), Ok(MenuValue::Int(1)));
        assert_eq!(tree.update_item(MenuId(1), bump), Ok(MenuValue::Int(2)));
        assert!(tree.get_state(MenuId(1)).unwrap().changed);

        let refused = tree.update_item(MenuId(1), |_| Err(TreeError::RootImmutable));
        assert_eq!(refused, Err(TreeError::RootImmutable));
        assert_eq!(tree.get_state(MenuId(1)).unwrap().value, MenuValue::Int(2));

        assert_eq!(
            tree.update_item(MenuId(50), bump),
            Err(TreeError::ItemNotFound(MenuId(50)))
        );
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let tree = std::sync::Arc::new(sample());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let tree = std::sync::Arc::clone(&tree);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tree.update_item(MenuId(1), |v| -> Result<MenuValue, TreeError> {
                            Ok(MenuValue::Int(v.and_then(MenuValue::as_int).unwrap_or(0) + 1))
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(tree.get_state(MenuId(1)).unwrap().value, MenuValue::Int(800));
    }
}
