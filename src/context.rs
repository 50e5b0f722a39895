//! Isolated execution environments and the per-thread active slot.
//!
//! A [`Context`] owns everything one guest execution environment needs: a
//! private heap arena, the root namespace handles the collector scans from,
//! the live CPU budget, and native stack bookkeeping. At most one context is
//! *loaded* (active) per OS thread; the rest of the runtime reads the active
//! context through [`active`] rather than caching handles, because the slot's
//! occupant changes under cooperative switching.
//!
//! Violating the load/store discipline is a scheduler bug, not a guest-code
//! fault: every such operation fails fast with a [`StateError`] before any
//! state is mutated. The original design busy-waited on a contended load;
//! that is deliberately not reproduced here.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::budget::CpuBudget;
use crate::config::Config;
use crate::types::NamespaceHandle;

/// Invariant violations in the context lifecycle. These indicate a bug in
/// the embedding host, never in guest code, and are never silently
/// recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("a context is already loaded on this thread")]
    AlreadyLoaded,
    #[error("context is not the currently loaded one")]
    NotLoaded,
    #[error("context is still loaded; store it before freeing")]
    StillLoaded,
}

/// Private heap region backing one context.
///
/// Object layout and collection inside the region belong to the garbage
/// collector, an external collaborator; the context only owns the bytes and
/// reports the bounds the collector initializes from.
pub struct Arena {
    region: Box<[u8]>,
}

impl Arena {
    fn with_capacity(bytes: usize) -> Self {
        Self {
            region: vec![0u8; bytes].into_boxed_slice(),
        }
    }

    pub fn start(&self) -> usize {
        self.region.as_ptr() as usize
    }

    pub fn end(&self) -> usize {
        self.start() + self.region.len()
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("start", &self.start())
            .field("len", &self.region.len())
            .finish()
    }
}

#[derive(Debug)]
struct ContextState {
    loaded: bool,
    arena: Option<Arena>,
    locals: NamespaceHandle,
    globals: NamespaceHandle,
    budget: CpuBudget,
    stack_base: Option<usize>,
    stack_reserve: usize,
}

thread_local! {
    static ACTIVE: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Handle to one isolated execution environment.
///
/// Cloning the handle does not clone the environment; all clones refer to
/// the same state block. The creator owns the context until it hands the
/// handle to whatever drives resumption.
#[derive(Clone)]
pub struct Context {
    id: Uuid,
    state: Rc<RefCell<ContextState>>,
}

impl Context {
    /// Allocate a fresh state block and heap arena. The context is not
    /// installed as active.
    pub fn create(config: &Config) -> Context {
        let context = Context {
            id: Uuid::new_v4(),
            state: Rc::new(RefCell::new(ContextState {
                loaded: false,
                arena: Some(Arena::with_capacity(config.arena_bytes)),
                locals: NamespaceHandle::new(),
                globals: NamespaceHandle::new(),
                budget: CpuBudget::new(config.max_check_interval),
                stack_base: None,
                stack_reserve: config.stack_reserve_bytes,
            })),
        };
        debug!(context = %context.id, arena_bytes = config.arena_bytes, "context created");
        context
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Install this context as the thread-visible active one.
    ///
    /// Fails with [`StateError::AlreadyLoaded`] if any context (including
    /// this one) is already loaded on this thread. On success the current
    /// native stack position is recorded as the baseline for relative
    /// stack-depth checks.
    pub fn load(&self) -> Result<(), StateError> {
        ACTIVE.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return Err(StateError::AlreadyLoaded);
            }
            {
                let mut state = self.state.borrow_mut();
                state.loaded = true;
                state.stack_base = Some(approximate_sp());
            }
            *slot = Some(self.clone());
            Ok(())
        })?;
        debug!(context = %self.id, "context loaded");
        Ok(())
    }

    /// Load this context, first storing whichever context currently occupies
    /// the slot. A no-op when this context is already the loaded one. For
    /// re-entrant callers that cannot guarantee a clean slate.
    pub fn force_load(&self) -> Result<(), StateError> {
        let occupant = active();
        if let Some(current) = occupant {
            if Rc::ptr_eq(&current.state, &self.state) {
                return Ok(());
            }
            current.store()?;
        }
        self.load()
    }

    /// Deactivate this context and clear the active slot.
    ///
    /// Fails with [`StateError::NotLoaded`] unless this context is the one
    /// currently loaded.
    pub fn store(&self) -> Result<(), StateError> {
        ACTIVE.with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_ref() {
                Some(current) if Rc::ptr_eq(&current.state, &self.state) => {}
                _ => return Err(StateError::NotLoaded),
            }
            {
                let mut state = self.state.borrow_mut();
                state.loaded = false;
                state.stack_base = None;
            }
            *slot = None;
            Ok(())
        })?;
        debug!(context = %self.id, "context stored");
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.state.borrow().loaded
    }

    /// Release the heap arena and state block.
    ///
    /// Fails with [`StateError::StillLoaded`] while the context is active.
    /// The arena is released immediately; the state block itself goes away
    /// when the last handle drops.
    pub fn free(self) -> Result<(), StateError> {
        if self.is_loaded() {
            return Err(StateError::StillLoaded);
        }
        self.state.borrow_mut().arena = None;
        debug!(context = %self.id, "context freed");
        Ok(())
    }

    /// Arena bounds as `(start, end)`, or `None` once freed.
    pub fn arena_bounds(&self) -> Option<(usize, usize)> {
        self.state
            .borrow()
            .arena
            .as_ref()
            .map(|arena| (arena.start(), arena.end()))
    }

    // ---- fields swapped by the resume protocol ----

    pub fn locals(&self) -> NamespaceHandle {
        self.state.borrow().locals.clone()
    }

    pub fn set_locals(&self, locals: NamespaceHandle) {
        self.state.borrow_mut().locals = locals;
    }

    pub fn globals(&self) -> NamespaceHandle {
        self.state.borrow().globals.clone()
    }

    pub fn set_globals(&self, globals: NamespaceHandle) {
        self.state.borrow_mut().globals = globals;
    }

    /// Copy of the live budget counters.
    pub fn budget(&self) -> CpuBudget {
        self.state.borrow().budget.clone()
    }

    pub fn set_budget(&self, budget: CpuBudget) {
        self.state.borrow_mut().budget = budget;
    }

    /// Mutate the live budget in place. The state borrow lasts only for
    /// the closure call.
    pub fn with_budget_mut<R>(&self, f: impl FnOnce(&mut CpuBudget) -> R) -> R {
        f(&mut self.state.borrow_mut().budget)
    }

    // ---- native stack bookkeeping ----

    /// Bytes of native stack consumed below the baseline recorded at load
    /// time. `None` while the context is not loaded.
    pub fn stack_usage(&self) -> Option<usize> {
        let base = self.state.borrow().stack_base?;
        Some(base.saturating_sub(approximate_sp()))
    }

    /// True when the native stack consumed since load exceeds the
    /// configured reserve.
    pub fn stack_exceeded(&self) -> bool {
        let reserve = self.state.borrow().stack_reserve;
        matches!(self.stack_usage(), Some(usage) if usage > reserve)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// The context currently loaded on this thread, if any.
pub fn active() -> Option<Context> {
    ACTIVE.with(|slot| slot.borrow().clone())
}

/// Approximate current stack position. Stacks grow downward on every
/// supported platform, so usage is `baseline - current`.
fn approximate_sp() -> usize {
    let marker = 0u8;
    &marker as *const u8 as usize
}
