//! The simulated kernel.
//!
//! The checks mirror what the real kernel enforces on each primitive, so a
//! library bug that the kernel would reject fails here too.

use crate::{EnvExit, SimEnv, console};
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    rc::Rc,
    sync::Once,
};
use ulib::{
    KernelError,
    addressing::{PAGE_SIZE, Pa, Va},
    env::{Env, EnvId, EnvStatus, LOG2NENV, NENV},
    mm::{
        UTOP, UXSTACKTOP,
        page_table::{Level, PteFlags},
    },
    pgfault::{FaultErrorCode, PgFaultHandler},
    syscall::SyscallNumber,
};

/// Physical address of frame 0.
const FRAME_BASE: usize = 0x10_0000;

/// One system call, as seen by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    /// The calling environment.
    pub caller: EnvId,
    /// The primitive.
    pub sysno: SyscallNumber,
    /// The environment acted upon (destination, for `page_map`), as passed.
    pub target: Option<EnvId>,
    /// The page acted upon (destination, for `page_map`).
    pub va: Option<Va>,
    /// The requested flags.
    pub perm: Option<PteFlags>,
}

impl Call {
    fn new(caller: EnvId, sysno: SyscallNumber) -> Self {
        Call {
            caller,
            sysno,
            target: None,
            va: None,
            perm: None,
        }
    }
}

struct Frame {
    data: Box<[u8; PAGE_SIZE]>,
    refs: usize,
}

#[derive(Clone, Copy)]
struct Mapping {
    frame: usize,
    perm: PteFlags,
}

pub(crate) struct EnvState {
    id: EnvId,
    parent_id: EnvId,
    status: EnvStatus,
    upcall: Option<Va>,
    pages: BTreeMap<usize, Mapping>,
    tables: BTreeSet<(Level, usize)>,
    pub(crate) handler: Option<PgFaultHandler<SimEnv>>,
    handler_slot: Option<Va>,
    in_fault: bool,
    resume_in_exofork: bool,
}

struct Injection {
    sysno: SyscallNumber,
    remaining: usize,
    error: KernelError,
}

struct State {
    envs: Vec<Option<EnvState>>,
    generations: Vec<u32>,
    frames: Vec<Option<Frame>>,
    calls: Vec<Call>,
    probes: Vec<(Level, Va)>,
    injections: Vec<Injection>,
    handlers: Vec<PgFaultHandler<SimEnv>>,
}

/// A simulated exokernel.
pub struct Machine {
    state: RefCell<State>,
}

static QUIET_EXITS: Once = Once::new();

impl Machine {
    /// Boots an empty machine.
    pub fn new() -> Rc<Machine> {
        console::install();
        QUIET_EXITS.call_once(|| {
            let default = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                if info.payload().downcast_ref::<EnvExit>().is_none() {
                    default(info)
                }
            }));
        });
        Rc::new(Machine {
            state: RefCell::new(State {
                envs: (0..NENV).map(|_| None).collect(),
                generations: vec![0; NENV],
                frames: Vec::new(),
                calls: Vec::new(),
                probes: Vec::new(),
                injections: Vec::new(),
                handlers: Vec::new(),
            }),
        })
    }

    /// Creates a runnable environment with an empty address space and no
    /// parent.
    pub fn spawn(self: &Rc<Self>) -> SimEnv {
        let mut state = self.state.borrow_mut();
        let id = state
            .alloc_env(EnvId::CURRENT, EnvStatus::Runnable, None, None)
            .unwrap_or_else(|e| panic!("spawn: {e}"));
        drop(state);
        self.env(id)
    }

    /// A handle on environment `id`, acting as that environment.
    pub fn env(self: &Rc<Self>, id: EnvId) -> SimEnv {
        SimEnv::new(self.clone(), id)
    }

    /// Every system call made so far.
    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    /// Forgets the recorded system calls.
    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Every page table entry probed through a `PageTableView` so far.
    pub fn probes(&self) -> Vec<(Level, Va)> {
        self.state.borrow().probes.clone()
    }

    /// Forgets the recorded probes.
    pub fn clear_probes(&self) {
        self.state.borrow_mut().probes.clear();
    }

    /// Makes the `n`-th next call of `sysno` (counting from 1) fail with
    /// `error`, without any effect.
    pub fn fail_nth(&self, sysno: SyscallNumber, n: usize, error: KernelError) {
        assert!(n > 0);
        self.state.borrow_mut().injections.push(Injection {
            sysno,
            remaining: n,
            error,
        });
    }

    /// Keeps the page fault handler of `id` in its own memory, in the eight
    /// bytes at `va`, like a program whose handler variable lives in its data
    /// segment. Environments it creates afterwards inherit the location.
    ///
    /// The page holding `va` must stay mapped and readable.
    pub fn keep_handler_at(&self, id: EnvId, va: Va) {
        self.with_env(id, |env| env.handler_slot = Some(va))
    }

    /// Maps a fresh frame at `va` in `id` that only the kernel may access
    /// (present and writable, without `US`).
    pub fn map_supervisor_page(&self, id: EnvId, va: Va) {
        let mut state = self.state.borrow_mut();
        if state.get(id).is_none() {
            panic!("environment {id} does not exist");
        }
        let frame = state.alloc_frame();
        let perm = PteFlags::P | PteFlags::RW;
        state.install(id.index(), va, Mapping { frame, perm });
    }

    /// Physical frame mapped at `va` in `id`.
    pub fn frame_of(&self, id: EnvId, va: Va) -> Option<Pa> {
        self.mapping(id, va)
            .and_then(|m| Pa::new(FRAME_BASE + m.frame * PAGE_SIZE))
    }

    /// Flags of the page mapped at `va` in `id`.
    pub fn perm_of(&self, id: EnvId, va: Va) -> Option<PteFlags> {
        self.mapping(id, va).map(|m| m.perm)
    }

    /// Scheduling status of `id`, or `None` if it does not exist.
    pub fn status_of(&self, id: EnvId) -> Option<EnvStatus> {
        let state = self.state.borrow();
        state.get(id).map(|env| env.status)
    }

    /// Registered page fault upcall of `id`.
    pub fn upcall_of(&self, id: EnvId) -> Option<Va> {
        let state = self.state.borrow();
        state.get(id).and_then(|env| env.upcall)
    }

    /// Whether `id` exists.
    pub fn is_alive(&self, id: EnvId) -> bool {
        self.state.borrow().get(id).is_some()
    }

    /// Number of allocated physical frames.
    pub fn live_frames(&self) -> usize {
        self.state.borrow().frames.iter().flatten().count()
    }

    fn mapping(&self, id: EnvId, va: Va) -> Option<Mapping> {
        let state = self.state.borrow();
        state
            .get(id)
            .and_then(|env| env.pages.get(&va.page_number()).copied())
    }

    pub(crate) fn with_env<R>(&self, id: EnvId, f: impl FnOnce(&mut EnvState) -> R) -> R {
        let mut state = self.state.borrow_mut();
        match state.get_mut(id) {
            Some(env) => f(env),
            None => panic!("environment {id} does not exist"),
        }
    }

    // Kernel primitives. `caller` is the environment issuing the call.

    pub(crate) fn sys_page_alloc(
        &self,
        caller: EnvId,
        target: EnvId,
        va: Va,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let mut state = self.state.borrow_mut();
        state.record(Call {
            target: Some(target),
            va: Some(va),
            perm: Some(perm),
            ..Call::new(caller, SyscallNumber::PageAlloc)
        })?;
        let slot = state.resolve(caller, target)?;
        check_va(va)?;
        check_perm(perm)?;
        let frame = state.alloc_frame();
        state.install(slot, va, Mapping { frame, perm });
        Ok(())
    }

    pub(crate) fn sys_page_map(
        &self,
        caller: EnvId,
        (src_env, src_va): (EnvId, Va),
        (dst_env, dst_va): (EnvId, Va),
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let mut state = self.state.borrow_mut();
        state.record(Call {
            target: Some(dst_env),
            va: Some(dst_va),
            perm: Some(perm),
            ..Call::new(caller, SyscallNumber::PageMap)
        })?;
        let src = state.resolve(caller, src_env)?;
        let dst = state.resolve(caller, dst_env)?;
        check_va(src_va)?;
        check_va(dst_va)?;
        check_perm(perm)?;
        let source = state.slot(src).pages.get(&src_va.page_number()).copied();
        match source {
            None => Err(KernelError::InvalidArgument),
            Some(m) if perm.contains(PteFlags::RW) && !m.perm.contains(PteFlags::RW) => {
                Err(KernelError::InvalidArgument)
            }
            Some(m) => {
                state.install(dst, dst_va, Mapping { frame: m.frame, perm });
                Ok(())
            }
        }
    }

    pub(crate) fn sys_page_unmap(
        &self,
        caller: EnvId,
        target: EnvId,
        va: Va,
    ) -> Result<(), KernelError> {
        let mut state = self.state.borrow_mut();
        state.record(Call {
            target: Some(target),
            va: Some(va),
            ..Call::new(caller, SyscallNumber::PageUnmap)
        })?;
        let slot = state.resolve(caller, target)?;
        check_va(va)?;
        state.uninstall(slot, va.page_number());
        Ok(())
    }

    pub(crate) fn sys_exofork(&self, caller: EnvId) -> Result<EnvId, KernelError> {
        let mut state = self.state.borrow_mut();
        state.record(Call::new(caller, SyscallNumber::Exofork))?;
        let slot = state.resolve(caller, EnvId::CURRENT)?;
        let parent = state.slot_mut(slot);
        if parent.resume_in_exofork {
            // The child returning from the parent's `exofork`.
            parent.resume_in_exofork = false;
            return Ok(EnvId::CURRENT);
        }
        let (handler, handler_slot) = (parent.handler, parent.handler_slot);
        state.alloc_env(caller, EnvStatus::NotRunnable, handler, handler_slot)
    }

    pub(crate) fn sys_env_set_status(
        &self,
        caller: EnvId,
        target: EnvId,
        status: EnvStatus,
    ) -> Result<(), KernelError> {
        let mut state = self.state.borrow_mut();
        state.record(Call {
            target: Some(target),
            ..Call::new(caller, SyscallNumber::EnvSetStatus)
        })?;
        let slot = state.resolve(caller, target)?;
        match status {
            EnvStatus::Runnable | EnvStatus::NotRunnable => {
                state.slot_mut(slot).status = status;
                Ok(())
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    pub(crate) fn sys_env_set_pgfault_upcall(
        &self,
        caller: EnvId,
        target: EnvId,
        upcall: Va,
    ) -> Result<(), KernelError> {
        let mut state = self.state.borrow_mut();
        state.record(Call {
            target: Some(target),
            va: Some(upcall),
            ..Call::new(caller, SyscallNumber::EnvSetPgfaultUpcall)
        })?;
        let slot = state.resolve(caller, target)?;
        state.slot_mut(slot).upcall = Some(upcall);
        Ok(())
    }

    pub(crate) fn sys_env_destroy(&self, caller: EnvId, target: EnvId) -> Result<(), KernelError> {
        let mut state = self.state.borrow_mut();
        state.record(Call {
            target: Some(target),
            ..Call::new(caller, SyscallNumber::EnvDestroy)
        })?;
        let slot = state.resolve(caller, target)?;
        state.destroy(slot);
        Ok(())
    }

    /// Terminates `id` from inside the kernel, without a system call.
    pub(crate) fn kill(&self, id: EnvId) {
        let mut state = self.state.borrow_mut();
        if state.get(id).is_some() {
            state.destroy(id.index());
        }
    }

    pub(crate) fn env_descriptor(&self, id: EnvId) -> Option<Env> {
        let state = self.state.borrow();
        state.get(id).map(|env| Env {
            id: env.id,
            parent_id: env.parent_id,
            status: env.status,
            pgfault_upcall: env.upcall,
        })
    }

    pub(crate) fn is_present(&self, id: EnvId, level: Level, va: Va) -> bool {
        let mut state = self.state.borrow_mut();
        state.probes.push((level, va));
        let env = match state.get(id) {
            Some(env) => env,
            None => panic!("environment {id} does not exist"),
        };
        match level {
            Level::Pt => env.pages.contains_key(&va.page_number()),
            level => env
                .tables
                .contains(&(level, va.into_usize() >> level.shift())),
        }
    }

    /// Translates a user-mode access, or returns the error code of the page
    /// fault it raises.
    pub(crate) fn translate(&self, id: EnvId, va: Va, write: bool) -> Result<usize, FaultErrorCode> {
        let mut err = FaultErrorCode::USER;
        if write {
            err |= FaultErrorCode::WRITE;
        }
        match self.mapping(id, va) {
            None => Err(err),
            Some(m) if !m.perm.contains(PteFlags::US) => Err(err | FaultErrorCode::PRESENT),
            Some(m) if write && !m.perm.contains(PteFlags::RW) => {
                Err(err | FaultErrorCode::PRESENT)
            }
            Some(m) => Ok(m.frame),
        }
    }

    /// Whether the kernel can push a trap frame for `id`: an upcall is
    /// registered and the exception stack is mapped writable.
    pub(crate) fn can_deliver_fault(&self, id: EnvId) -> bool {
        let uxstack = self.mapping(id, UXSTACKTOP - PAGE_SIZE);
        self.upcall_of(id).is_some()
            && uxstack.is_some_and(|m| m.perm.contains(PteFlags::USER_RW))
    }

    pub(crate) fn handler_slot(&self, id: EnvId) -> Option<Va> {
        self.with_env(id, |env| env.handler_slot)
    }

    /// Stores `handler` machine-wide, returning the token a handler slot in
    /// user memory holds for it. Token `0` means no handler.
    pub(crate) fn register_handler(&self, handler: PgFaultHandler<SimEnv>) -> u64 {
        let mut state = self.state.borrow_mut();
        state.handlers.push(handler);
        state.handlers.len() as u64
    }

    pub(crate) fn handler_by_token(&self, token: u64) -> Option<PgFaultHandler<SimEnv>> {
        let state = self.state.borrow();
        let index = usize::try_from(token).ok()?.checked_sub(1)?;
        state.handlers.get(index).copied()
    }

    /// Marks `id` as running its fault handler. Returns `false` if it already
    /// was.
    pub(crate) fn enter_fault(&self, id: EnvId) -> bool {
        self.with_env(id, |env| !std::mem::replace(&mut env.in_fault, true))
    }

    pub(crate) fn leave_fault(&self, id: EnvId) {
        let mut state = self.state.borrow_mut();
        if let Some(env) = state.get_mut(id) {
            env.in_fault = false;
        }
    }

    pub(crate) fn with_frame<R>(&self, frame: usize, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        let mut state = self.state.borrow_mut();
        match state.frames.get_mut(frame) {
            Some(Some(frame)) => f(&mut *frame.data),
            _ => panic!("frame {frame} is not allocated"),
        }
    }
}

fn check_va(va: Va) -> Result<(), KernelError> {
    if va < UTOP && va.is_page_aligned() {
        Ok(())
    } else {
        Err(KernelError::InvalidArgument)
    }
}

fn check_perm(perm: PteFlags) -> Result<(), KernelError> {
    if perm.contains(PteFlags::P | PteFlags::US) && PteFlags::SYSCALL.contains(perm) {
        Ok(())
    } else {
        Err(KernelError::InvalidArgument)
    }
}

impl State {
    /// Logs `call`, then fails it if an injected failure is due.
    fn record(&mut self, call: Call) -> Result<(), KernelError> {
        self.calls.push(call);
        let due = self
            .injections
            .iter_mut()
            .position(|injection| injection.sysno == call.sysno && {
                injection.remaining -= 1;
                injection.remaining == 0
            });
        match due {
            Some(index) => Err(self.injections.remove(index).error),
            None => Ok(()),
        }
    }

    fn get(&self, id: EnvId) -> Option<&EnvState> {
        self.envs[id.index()].as_ref().filter(|env| env.id == id)
    }

    fn get_mut(&mut self, id: EnvId) -> Option<&mut EnvState> {
        self.envs[id.index()].as_mut().filter(|env| env.id == id)
    }

    fn slot(&self, slot: usize) -> &EnvState {
        match &self.envs[slot] {
            Some(env) => env,
            None => panic!("slot {slot} is free"),
        }
    }

    fn slot_mut(&mut self, slot: usize) -> &mut EnvState {
        match &mut self.envs[slot] {
            Some(env) => env,
            None => panic!("slot {slot} is free"),
        }
    }

    /// Resolves `target` as passed by `caller`: the caller itself or one of
    /// its immediate children.
    fn resolve(&self, caller: EnvId, target: EnvId) -> Result<usize, KernelError> {
        let target = if target.is_current() { caller } else { target };
        match self.get(target) {
            Some(env) if env.id == caller || env.parent_id == caller => Ok(target.index()),
            _ => Err(KernelError::NoSuchEnv),
        }
    }

    fn alloc_env(
        &mut self,
        parent_id: EnvId,
        status: EnvStatus,
        handler: Option<PgFaultHandler<SimEnv>>,
        handler_slot: Option<Va>,
    ) -> Result<EnvId, KernelError> {
        let slot = self
            .envs
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::TryAgain)?;
        self.generations[slot] += 1;
        let id = EnvId((self.generations[slot] << LOG2NENV) | slot as u32);
        self.envs[slot] = Some(EnvState {
            id,
            parent_id,
            status,
            upcall: None,
            pages: BTreeMap::new(),
            tables: BTreeSet::new(),
            handler,
            handler_slot,
            in_fault: false,
            resume_in_exofork: !parent_id.is_current(),
        });
        Ok(id)
    }

    fn alloc_frame(&mut self) -> usize {
        self.frames.push(Some(Frame {
            data: Box::new([0; PAGE_SIZE]),
            refs: 0,
        }));
        self.frames.len() - 1
    }

    fn release(&mut self, frame: usize) {
        if let Some(Some(f)) = self.frames.get_mut(frame) {
            f.refs -= 1;
            if f.refs == 0 {
                self.frames[frame] = None;
            }
        }
    }

    fn install(&mut self, slot: usize, va: Va, mapping: Mapping) {
        if let Some(Some(frame)) = self.frames.get_mut(mapping.frame) {
            frame.refs += 1;
        }
        let env = self.slot_mut(slot);
        for level in [Level::Pml4, Level::Pdp, Level::Pd] {
            env.tables.insert((level, va.into_usize() >> level.shift()));
        }
        if let Some(old) = env.pages.insert(va.page_number(), mapping) {
            self.release(old.frame);
        }
    }

    fn uninstall(&mut self, slot: usize, vpn: usize) {
        if let Some(old) = self.slot_mut(slot).pages.remove(&vpn) {
            self.release(old.frame);
        }
    }

    fn destroy(&mut self, slot: usize) {
        if let Some(env) = self.envs[slot].take() {
            for mapping in env.pages.values() {
                self.release(mapping.frame);
            }
        }
    }
}
