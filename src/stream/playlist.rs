//! Playlists of play items
//!
//! A [`Playlist`] is plain data: items, a cursor and the repeat/rewind/random
//! flags. Moving the cursor is delegated to a [`PlaylistController`]; the
//! default [`SimplePlaylistController`] walks the items in order.
//!
//! The cursor is `None` once the playlist has run out of items.

use std::sync::Arc;

use rand::Rng;

use super::state::PlayItem;

/// Computes the next or previous cursor position
pub trait PlaylistController: Send + Sync {
    fn next_item(&self, playlist: &Playlist, index: Option<usize>) -> Option<usize>;

    fn previous_item(&self, playlist: &Playlist, index: Option<usize>) -> Option<usize>;
}

/// Sequential controller honouring the repeat, rewind and random flags
#[derive(Debug, Default, Clone, Copy)]
pub struct SimplePlaylistController;

impl SimplePlaylistController {
    fn random_other(len: usize, index: Option<usize>) -> Option<usize> {
        if len <= 1 {
            return index;
        }
        let mut rng = rand::thread_rng();
        loop {
            let pick = rng.gen_range(0..len);
            if Some(pick) != index {
                return Some(pick);
            }
        }
    }
}

impl PlaylistController for SimplePlaylistController {
    fn next_item(&self, playlist: &Playlist, index: Option<usize>) -> Option<usize> {
        let len = playlist.len();
        if playlist.is_repeat() {
            return index;
        }
        if playlist.is_random() {
            return Self::random_other(len, index);
        }
        let next = index.map(|i| i + 1).unwrap_or(0);
        if next < len {
            Some(next)
        } else if playlist.is_rewind() && len > 0 {
            Some(0)
        } else {
            None
        }
    }

    fn previous_item(&self, playlist: &Playlist, index: Option<usize>) -> Option<usize> {
        let len = playlist.len();
        if let Some(i) = index {
            if i > len {
                return len.checked_sub(1);
            }
        }
        if playlist.is_repeat() {
            return index;
        }
        if playlist.is_random() {
            return Self::random_other(len, index);
        }
        match index {
            Some(i) if i > 0 => Some(i - 1),
            _ if playlist.is_rewind() => len.checked_sub(1),
            _ => None,
        }
    }
}

/// Ordered play items with a cursor
#[derive(Clone)]
pub struct Playlist {
    items: Vec<PlayItem>,
    current: Option<usize>,
    random: bool,
    rewind: bool,
    repeat: bool,
    controller: Option<Arc<dyn PlaylistController>>,
}

impl Default for Playlist {
    fn default() -> Self {
        Self::new()
    }
}

impl Playlist {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            current: Some(0),
            random: false,
            rewind: false,
            repeat: false,
            controller: None,
        }
    }

    pub fn add_item(&mut self, item: PlayItem) {
        self.items.push(item);
    }

    /// Insert at `index`, appending when it is past the end
    pub fn add_item_at(&mut self, item: PlayItem, index: usize) {
        let index = index.min(self.items.len());
        self.items.insert(index, item);
    }

    /// Remove an item, keeping the cursor on the item it pointed at
    pub fn remove_item(&mut self, index: usize) -> Option<PlayItem> {
        if index >= self.items.len() {
            return None;
        }
        let original_len = self.items.len();
        let removed = self.items.remove(index);
        match self.current {
            Some(current) if current == index && index == original_len - 1 => {
                self.current = index.checked_sub(1);
            }
            Some(current) if index < current => {
                self.current = Some(current - 1);
            }
            _ => {}
        }
        Some(removed)
    }

    /// Drop every item and rewind the cursor
    pub fn clear(&mut self) {
        self.items.clear();
        self.current = Some(0);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item(&self, index: usize) -> Option<&PlayItem> {
        self.items.get(index)
    }

    pub fn items(&self) -> &[PlayItem] {
        &self.items
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn set_current_index(&mut self, index: Option<usize>) {
        self.current = index;
    }

    /// Item under the cursor
    pub fn current_item(&self) -> Option<&PlayItem> {
        self.current.and_then(|i| self.items.get(i))
    }

    /// Whether moving forward would find another item
    pub fn has_more_items(&self) -> bool {
        let next = self.current.map(|i| i + 1).unwrap_or(0);
        !(next >= self.items.len() && !self.repeat)
    }

    /// Advance the cursor and return it
    pub fn move_next(&mut self) -> Option<usize> {
        let index = self.clamped_current();
        self.current = self.controller().next_item(self, index);
        self.current
    }

    /// Step the cursor back and return it
    pub fn move_previous(&mut self) -> Option<usize> {
        let index = self.clamped_current();
        self.current = self.controller().previous_item(self, index);
        self.current
    }

    fn clamped_current(&self) -> Option<usize> {
        match self.current {
            Some(i) if i >= self.items.len() => self.items.len().checked_sub(1),
            other => other,
        }
    }

    fn controller(&self) -> Arc<dyn PlaylistController> {
        match &self.controller {
            Some(controller) => Arc::clone(controller),
            None => Arc::new(SimplePlaylistController),
        }
    }

    pub fn is_random(&self) -> bool {
        self.random
    }

    pub fn set_random(&mut self, random: bool) {
        self.random = random;
    }

    pub fn is_rewind(&self) -> bool {
        self.rewind
    }

    pub fn set_rewind(&mut self, rewind: bool) {
        self.rewind = rewind;
    }

    pub fn is_repeat(&self) -> bool {
        self.repeat
    }

    pub fn set_repeat(&mut self, repeat: bool) {
        self.repeat = repeat;
    }

    /// Replace the cursor controller, `None` restores the default
    pub fn set_controller(&mut self, controller: Option<Arc<dyn PlaylistController>>) {
        self.controller = controller;
    }
}

impl std::fmt::Debug for Playlist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Playlist")
            .field("items", &self.items)
            .field("current", &self.current)
            .field("random", &self.random)
            .field("rewind", &self.rewind)
            .field("repeat", &self.repeat)
            .finish()
    }
}
