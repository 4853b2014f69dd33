//! The x86_64 backend: real system calls, the real page table.
//!
//! [`NATIVE`] implements every interface of this crate for the environment
//! the code is running in. Its process-wide state (the page fault handler)
//! lives in a static, so there is only ever one of it.
//!
//! `fork` turns the data segment copy-on-write, statics included. The fault
//! path therefore only loads the handler slot; a store there would raise the
//! very fault it is handling.
//!
//! Before printing anything, an environment calls [`init`] to route the
//! print macros to `sys_cputs`.
//!
//! The fault trampoline `_pgfault_upcall` is assembly that is not part of
//! this crate. A native build links it in from the user runtime.

use super::{Syscall, SyscallNumber, decode};
use crate::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    env::{Env, EnvId, EnvStatus, NENV, UserEnv},
    mm::{
        UENVS, UserMemory,
        page_table::{Level, PageTableView, PteFlags, Uvpt},
    },
    pgfault::{PgFaultHandler, UTrapframe, dispatch},
};
use crossbeam_utils::atomic::AtomicCell;

unsafe extern "C" {
    /// The assembly trampoline the kernel enters on a user page fault. It
    /// calls [`ulib_pgfault_upcall`] and then resumes the faulting context.
    fn _pgfault_upcall();
}

/// Layout of one slot of the environment table at [`UENVS`].
#[repr(C)]
struct RawEnv {
    env_id: u32,
    env_parent_id: u32,
    env_status: u32,
    _pad: u32,
    env_pgfault_upcall: usize,
}

/// The environment this code runs in.
pub struct Native {
    uvpt: Uvpt,
    handler: AtomicCell<Option<PgFaultHandler<Native>>>,
}

/// The one [`Native`] backend of this environment.
pub static NATIVE: Native = Native {
    // SAFETY: the kernel installs the recursive mapping in every environment.
    uvpt: unsafe { Uvpt::new() },
    handler: AtomicCell::new(None),
};

/// Routes the print macros to `sys_cputs`.
pub fn init() {
    crate::kprint::set_console(console_puts);
}

fn console_puts(s: &str) {
    NATIVE.cputs(s)
}

/// Entry called by the fault trampoline with the trap frame it was given.
#[unsafe(no_mangle)]
pub extern "C" fn ulib_pgfault_upcall(utf: &UTrapframe) {
    dispatch(&NATIVE, utf)
}

impl Syscall for Native {
    fn getenvid(&self) -> EnvId {
        let ret = syscall!(SyscallNumber::Getenvid);
        EnvId(ret as u32)
    }

    fn cputs(&self, s: &str) {
        syscall!(SyscallNumber::Cputs, s.as_ptr(), s.len());
    }

    fn page_alloc(&self, env: EnvId, va: Va, perm: PteFlags) -> Result<(), KernelError> {
        decode(syscall!(
            SyscallNumber::PageAlloc,
            env.0 as usize,
            va.into_usize(),
            perm.bits()
        ))
        .map(|_| ())
    }

    fn page_map(
        &self,
        src_env: EnvId,
        src_va: Va,
        dst_env: EnvId,
        dst_va: Va,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        decode(syscall!(
            SyscallNumber::PageMap,
            src_env.0 as usize,
            src_va.into_usize(),
            dst_env.0 as usize,
            dst_va.into_usize(),
            perm.bits()
        ))
        .map(|_| ())
    }

    fn page_unmap(&self, env: EnvId, va: Va) -> Result<(), KernelError> {
        decode(syscall!(
            SyscallNumber::PageUnmap,
            env.0 as usize,
            va.into_usize()
        ))
        .map(|_| ())
    }

    fn exofork(&self) -> Result<EnvId, KernelError> {
        decode(syscall!(SyscallNumber::Exofork)).map(|id| EnvId(id as u32))
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<(), KernelError> {
        let status: u32 = status.into();
        decode(syscall!(
            SyscallNumber::EnvSetStatus,
            env.0 as usize,
            status as usize
        ))
        .map(|_| ())
    }

    fn env_set_pgfault_upcall(&self, env: EnvId, upcall: Va) -> Result<(), KernelError> {
        decode(syscall!(
            SyscallNumber::EnvSetPgfaultUpcall,
            env.0 as usize,
            upcall.into_usize()
        ))
        .map(|_| ())
    }

    fn env_destroy(&self, env: EnvId) -> Result<(), KernelError> {
        decode(syscall!(SyscallNumber::EnvDestroy, env.0 as usize)).map(|_| ())
    }

    fn exit(&self) -> ! {
        if let Err(e) = self.env_destroy(EnvId::CURRENT) {
            warning!("[{}] exit: cannot destroy self: {}", self.getenvid(), e);
        }
        loop {
            core::hint::spin_loop();
        }
    }
}

impl PageTableView for Native {
    fn is_present(&self, level: Level, va: Va) -> bool {
        self.uvpt.is_present(level, va)
    }

    fn permissions(&self, va: Va) -> PteFlags {
        self.uvpt.permissions(va)
    }
}

impl UserMemory for Native {
    fn copy_page(&self, dst: Va, src: Va) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.into_usize() as *const u8,
                dst.into_usize() as *mut u8,
                PAGE_SIZE,
            );
        }
    }
}

impl UserEnv for Native {
    fn upcall_entry(&self) -> Va {
        let entry = _pgfault_upcall as unsafe extern "C" fn() as usize;
        match Va::new(entry) {
            Some(va) => va,
            None => {
                println!("[{}] bad upcall address {:#x}", self.getenvid(), entry);
                self.exit()
            }
        }
    }

    fn pgfault_handler(&self) -> Option<PgFaultHandler<Self>> {
        self.handler.load()
    }

    fn store_pgfault_handler(&self, handler: PgFaultHandler<Self>) {
        self.handler.store(Some(handler));
    }

    fn env(&self, id: EnvId) -> Option<Env> {
        let table = UENVS.into_usize() as *const RawEnv;
        // SAFETY: the kernel maps NENV slots read-only at UENVS.
        let raw = unsafe { core::ptr::read_volatile(table.add(id.index() % NENV)) };
        if raw.env_id != id.0 {
            return None;
        }
        Some(Env {
            id,
            parent_id: EnvId(raw.env_parent_id),
            status: EnvStatus::try_from(raw.env_status).ok()?,
            pgfault_upcall: match raw.env_pgfault_upcall {
                0 => None,
                va => Va::new(va),
            },
        })
    }
}
