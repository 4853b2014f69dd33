//! An environment running on the simulated kernel.

use crate::{EnvExit, Machine, console};
use std::rc::Rc;
use ulib::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    env::{Env, EnvId, EnvStatus, UserEnv},
    mm::{
        UTEXT, UserMemory,
        page_table::{Level, PageTableView, PteFlags},
    },
    pgfault::{FaultErrorCode, PgFaultHandler, UTrapframe, dispatch},
    println,
    syscall::Syscall,
    warning,
};

/// One environment of a [`Machine`], seen from the inside.
///
/// Every method acts as code running in this environment would: system calls
/// are issued as this environment, and memory accesses go through its page
/// table.
#[derive(Clone)]
pub struct SimEnv {
    machine: Rc<Machine>,
    id: EnvId,
}

impl SimEnv {
    pub(crate) fn new(machine: Rc<Machine>, id: EnvId) -> Self {
        SimEnv { machine, id }
    }

    /// The identifier of this environment.
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// The machine this environment runs on.
    pub fn machine(&self) -> &Rc<Machine> {
        &self.machine
    }

    /// Stores `data` at `va`, as a user-mode write.
    pub fn write(&self, va: Va, data: &[u8]) {
        let mut va = va;
        let mut data = data;
        while !data.is_empty() {
            let len = data.len().min(PAGE_SIZE - va.offset());
            let frame = self.access(va, true);
            let offset = va.offset();
            self.machine
                .with_frame(frame, |page| page[offset..offset + len].copy_from_slice(&data[..len]));
            data = &data[len..];
            va += len;
        }
    }

    /// Loads `len` bytes from `va`, as a user-mode read.
    pub fn read(&self, va: Va, len: usize) -> Vec<u8> {
        let mut va = va;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let chunk = (len - out.len()).min(PAGE_SIZE - va.offset());
            let frame = self.access(va, false);
            let offset = va.offset();
            self.machine
                .with_frame(frame, |page| out.extend_from_slice(&page[offset..offset + chunk]));
            va += chunk;
        }
        out
    }

    /// Stores a little-endian `u64` at `va`.
    pub fn write_u64(&self, va: Va, value: u64) {
        self.write(va, &value.to_le_bytes())
    }

    /// Loads a little-endian `u64` from `va`.
    pub fn read_u64(&self, va: Va) -> u64 {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(&self.read(va, 8));
        u64::from_le_bytes(bytes)
    }

    /// Translates an access, delivering at most one page fault on the way.
    fn access(&self, va: Va, write: bool) -> usize {
        match self.machine.translate(self.id, va, write) {
            Ok(frame) => frame,
            Err(err) => {
                self.deliver_fault(va, err);
                match self.machine.translate(self.id, va, write) {
                    Ok(frame) => frame,
                    Err(err) => panic!(
                        "[{}] fault at {} (err {:#x}) not resolved by the handler",
                        self.id,
                        va,
                        err.bits()
                    ),
                }
            }
        }
    }

    /// What the kernel does on a user-mode page fault.
    ///
    /// A fault raised while the environment is still running its handler is
    /// not delivered: the environment is killed instead of recursing.
    fn deliver_fault(&self, va: Va, err: FaultErrorCode) {
        let utf = UTrapframe {
            fault_va: va.into_usize(),
            err,
            rip: 0,
            rflags: 0,
            rsp: 0,
        };
        if !self.machine.can_deliver_fault(self.id) {
            println!("[{}] user fault va {:#x} ip {:#x}", self.id, utf.fault_va, utf.rip);
            self.machine.kill(self.id);
            std::panic::panic_any(EnvExit(self.id));
        }
        if !self.machine.enter_fault(self.id) {
            println!("[{}] fault in page fault handler va {:#x}", self.id, utf.fault_va);
            self.machine.kill(self.id);
            std::panic::panic_any(EnvExit(self.id));
        }
        let _handling = Handling(self);
        dispatch(self, &utf);
    }
}

/// Clears the in-handler mark when dispatch returns or unwinds.
struct Handling<'a>(&'a SimEnv);

impl Drop for Handling<'_> {
    fn drop(&mut self) {
        self.0.machine.leave_fault(self.0.id);
    }
}

impl Syscall for SimEnv {
    fn getenvid(&self) -> EnvId {
        self.id
    }

    fn cputs(&self, s: &str) {
        console::puts(s)
    }

    fn page_alloc(&self, env: EnvId, va: Va, perm: PteFlags) -> Result<(), KernelError> {
        self.machine.sys_page_alloc(self.id, env, va, perm)
    }

    fn page_map(
        &self,
        src_env: EnvId,
        src_va: Va,
        dst_env: EnvId,
        dst_va: Va,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        self.machine
            .sys_page_map(self.id, (src_env, src_va), (dst_env, dst_va), perm)
    }

    fn page_unmap(&self, env: EnvId, va: Va) -> Result<(), KernelError> {
        self.machine.sys_page_unmap(self.id, env, va)
    }

    fn exofork(&self) -> Result<EnvId, KernelError> {
        self.machine.sys_exofork(self.id)
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<(), KernelError> {
        self.machine.sys_env_set_status(self.id, env, status)
    }

    fn env_set_pgfault_upcall(&self, env: EnvId, upcall: Va) -> Result<(), KernelError> {
        self.machine.sys_env_set_pgfault_upcall(self.id, env, upcall)
    }

    fn env_destroy(&self, env: EnvId) -> Result<(), KernelError> {
        self.machine.sys_env_destroy(self.id, env)
    }

    fn exit(&self) -> ! {
        if let Err(e) = self.env_destroy(EnvId::CURRENT) {
            warning!("[{}] exit: cannot destroy self: {}", self.id, e);
        }
        std::panic::panic_any(EnvExit(self.id))
    }
}

impl PageTableView for SimEnv {
    fn is_present(&self, level: Level, va: Va) -> bool {
        self.machine.is_present(self.id, level, va)
    }

    fn permissions(&self, va: Va) -> PteFlags {
        self.machine
            .perm_of(self.id, va)
            .unwrap_or_else(PteFlags::empty)
    }
}

impl UserMemory for SimEnv {
    fn copy_page(&self, dst: Va, src: Va) {
        let src = match self.machine.translate(self.id, src, false) {
            Ok(frame) => frame,
            Err(_) => panic!("[{}] copy_page: {} is not readable", self.id, src),
        };
        let dst = match self.machine.translate(self.id, dst, true) {
            Ok(frame) => frame,
            Err(_) => panic!("[{}] copy_page: {} is not writable", self.id, dst),
        };
        let contents = self.machine.with_frame(src, |page| *page);
        self.machine.with_frame(dst, |page| *page = contents);
    }
}

impl UserEnv for SimEnv {
    fn upcall_entry(&self) -> Va {
        UTEXT + 0x20
    }

    fn pgfault_handler(&self) -> Option<PgFaultHandler<Self>> {
        match self.machine.handler_slot(self.id) {
            Some(slot) => self.machine.handler_by_token(self.read_u64(slot)),
            None => self.machine.with_env(self.id, |env| env.handler),
        }
    }

    fn store_pgfault_handler(&self, handler: PgFaultHandler<Self>) {
        match self.machine.handler_slot(self.id) {
            Some(slot) => {
                let token = self.machine.register_handler(handler);
                self.write_u64(slot, token)
            }
            None => self
                .machine
                .with_env(self.id, |env| env.handler = Some(handler)),
        }
    }

    fn env(&self, id: EnvId) -> Option<Env> {
        self.machine.env_descriptor(id)
    }
}
