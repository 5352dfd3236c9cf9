use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::AppResult;
use crate::modules::persistence::credential_db::Credential;
use crate::modules::persistence::store::Store;

struct CursorState {
    /// Identifier of the currently preferred credential, if any.
    cursor: Option<i64>,
    /// Snapshot of the available list, creation order.
    available: Vec<Credential>,
}

/// Process-wide cursor over the available credentials. The mutex is held only
/// for cursor moves and snapshot swaps; registry mutations that can affect
/// availability call `mark_dirty()` so the next read reloads the snapshot.
pub struct KeySelector {
    store: Store,
    state: Mutex<CursorState>,
    dirty: AtomicBool,
}

impl KeySelector {
    pub fn new(store: Store) -> AppResult<Self> {
        let available = store.list_available_credentials()?;
        Ok(Self {
            store,
            state: Mutex::new(CursorState {
                cursor: None,
                available,
            }),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Returns the preferred credential if it is still usable, otherwise
    /// advances to the next one.
    pub fn current(&self) -> AppResult<Option<Credential>> {
        let mut state = self.state.lock();
        self.ensure_fresh(&mut state)?;

        if let Some(cursor) = state.cursor {
            if let Some(cred) = state.available.iter().find(|c| c.id == cursor) {
                if cred.is_usable() {
                    return Ok(Some(cred.clone()));
                }
            }
        }
        Ok(Self::advance_locked(&mut state))
    }

    /// Moves the cursor to the next active credential after the current one,
    /// wrapping around the list at most once.
    pub fn advance(&self) -> AppResult<Option<Credential>> {
        let mut state = self.state.lock();
        self.ensure_fresh(&mut state)?;
        Ok(Self::advance_locked(&mut state))
    }

    /// Reloads the available list; a cursor pointing at a credential that is
    /// no longer listed is cleared.
    pub fn refresh(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        self.reload_locked(&mut state)
    }

    fn ensure_fresh(&self, state: &mut CursorState) -> AppResult<()> {
        if self.dirty.swap(false, Ordering::SeqCst) {
            self.reload_locked(state)?;
        }
        Ok(())
    }

    fn reload_locked(&self, state: &mut CursorState) -> AppResult<()> {
        state.available = self.store.list_available_credentials()?;
        if let Some(cursor) = state.cursor {
            if !state.available.iter().any(|c| c.id == cursor) {
                state.cursor = None;
            }
        }
        Ok(())
    }

    fn advance_locked(state: &mut CursorState) -> Option<Credential> {
        let len = state.available.len();
        if len == 0 {
            state.cursor = None;
            return None;
        }

        // One full lap starting just past the cursor position; no cursor
        // means the scan starts at the head.
        let start = match state.cursor {
            Some(cursor) => state
                .available
                .iter()
                .position(|c| c.id == cursor)
                .map(|pos| pos + 1)
                .unwrap_or(0),
            None => 0,
        };

        for offset in 0..len {
            let candidate = &state.available[(start + offset) % len];
            if candidate.is_usable() {
                state.cursor = Some(candidate.id);
                return Some(candidate.clone());
            }
        }

        state.cursor = None;
        None
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> Option<i64> {
        self.state.lock().cursor
    }
}
