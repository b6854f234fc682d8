#![forbid(unsafe_code)]

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

/// Reentrant single-writer role.
///
/// One thread at a time owns the role; the owner may acquire it again without
/// blocking and the role is released when every acquisition has been released.
#[derive(Default)]
pub struct WriteRole {
    state: Mutex<RoleState>,
    released: Condvar,
}

#[derive(Default, Debug)]
struct RoleState {
    owner: Option<ThreadId>,
    depth: u32,
}

/// Snapshot of the role for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSnapshot {
    /// Whether any thread holds the role.
    pub held: bool,
    /// Reentrancy depth of the holder.
    pub depth: u32,
}

/// Guard for one acquisition of a [`WriteRole`].
pub struct RoleGuard<'a> {
    role: &'a WriteRole,
}

impl WriteRole {
    /// A role nobody holds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the calling thread owns the role.
    pub fn enter(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                Some(_) => self.released.wait(&mut state),
            }
        }
    }

    /// Takes the role if it is free or already owned by the caller.
    pub fn try_enter(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
                true
            }
            Some(owner) if owner == me => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Releases one acquisition; returns true when the role became unowned.
    ///
    /// Calls from a thread that does not own the role are ignored.
    pub fn exit(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return false;
        }
        state.depth -= 1;
        if state.depth > 0 {
            return false;
        }
        state.owner = None;
        drop(state);
        self.released.notify_one();
        true
    }

    /// Blocking acquisition returning an RAII guard.
    pub fn acquire(&self) -> RoleGuard<'_> {
        self.enter();
        RoleGuard { role: self }
    }

    /// Non-blocking acquisition.
    pub fn try_acquire(&self) -> Option<RoleGuard<'_>> {
        self.try_enter().then_some(RoleGuard { role: self })
    }

    /// Whether the calling thread owns the role.
    pub fn held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Current owner state, for diagnostics.
    pub fn snapshot(&self) -> RoleSnapshot {
        let state = self.state.lock();
        RoleSnapshot {
            held: state.owner.is_some(),
            depth: state.depth,
        }
    }
}

impl Drop for RoleGuard<'_> {
    fn drop(&mut self) {
        self.role.exit();
    }
}
