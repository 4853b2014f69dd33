use ufork::{
    ForkError,
    fault::{PageFaultReason, ScratchPage, handle_cow_fault, pgfault},
};
use ufork_grader::{EnvExit, Machine, SimEnv, console, run};
use ulib::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    env::EnvId,
    mm::{PFTEMP, UTEXT, page_table::PteFlags},
    pgfault::{FaultErrorCode, UTrapframe, set_pgfault_handler},
    syscall::{Syscall, SyscallNumber},
};

fn cow() -> PteFlags {
    PteFlags::P | PteFlags::US | PteFlags::COW
}

/// An environment with the COW handler installed and a COW page at `UTEXT`
/// holding `contents`.
fn env_with_cow_page(contents: &[u8]) -> SimEnv {
    let env = Machine::new().spawn();
    set_pgfault_handler(&env, pgfault::<SimEnv>).unwrap();
    env.page_alloc(EnvId::CURRENT, UTEXT, PteFlags::USER_RW).unwrap();
    env.write(UTEXT, contents);
    env.page_map(EnvId::CURRENT, UTEXT, EnvId::CURRENT, UTEXT, cow())
        .unwrap();
    env
}

fn trapframe(va: Va, err: FaultErrorCode) -> UTrapframe {
    UTrapframe {
        fault_va: va.into_usize(),
        err,
        rip: 0,
        rflags: 0,
        rsp: 0,
    }
}

#[test]
fn write_to_cow_page_gets_private_copy() {
    let env = env_with_cow_page(b"hello");
    let m = env.machine().clone();
    let shared = m.frame_of(env.id(), UTEXT);
    let frames = m.live_frames();
    m.clear_calls();

    env.write(UTEXT + 8, b"world");

    assert_eq!(m.perm_of(env.id(), UTEXT), Some(PteFlags::USER_RW));
    assert_ne!(m.frame_of(env.id(), UTEXT), shared);
    assert_eq!(env.read(UTEXT, 5), b"hello");
    assert_eq!(env.read(UTEXT + 8, 5), b"world");
    assert_eq!(m.perm_of(env.id(), PFTEMP), None);
    assert_eq!(m.live_frames(), frames);

    let calls = m.calls();
    let sysnos: Vec<_> = calls.iter().map(|c| c.sysno).collect();
    assert_eq!(
        sysnos,
        [
            SyscallNumber::PageAlloc,
            SyscallNumber::PageMap,
            SyscallNumber::PageUnmap
        ]
    );
    assert_eq!(calls[0].va, Some(PFTEMP));
    assert_eq!(calls[1].va, Some(UTEXT));
    assert_eq!(calls[1].perm, Some(PteFlags::USER_RW));
    assert_eq!(calls[2].va, Some(PFTEMP));
}

#[test]
fn fault_in_middle_of_page_copies_whole_page() {
    let mut contents = vec![0u8; PAGE_SIZE];
    contents.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
    let env = env_with_cow_page(&contents);

    env.write(UTEXT + 0x800, &[0xff]);

    let after = env.read(UTEXT, PAGE_SIZE);
    assert_eq!(after[..0x800], contents[..0x800]);
    assert_eq!(after[0x800], 0xff);
    assert_eq!(after[0x801..], contents[0x801..]);
}

#[test]
fn read_fault_is_fatal() {
    let env = Machine::new().spawn();
    let m = env.machine().clone();
    set_pgfault_handler(&env, pgfault::<SimEnv>).unwrap();
    m.clear_calls();
    console::take();

    assert_eq!(run(|| env.read(UTEXT, 1)), Err(EnvExit(env.id())));

    let output = console::take();
    assert!(output.contains(&format!("[{}] user panic: ", env.id())));
    assert!(output.contains("not a write to a COW page: va 0x800000 err 0x4 (unmapped)"));
    assert!(!m.is_alive(env.id()));
    let sysnos: Vec<_> = m.calls().iter().map(|c| c.sysno).collect();
    assert_eq!(sysnos, [SyscallNumber::EnvDestroy]);
}

#[test]
fn write_to_read_only_page_is_fatal() {
    let env = Machine::new().spawn();
    let m = env.machine().clone();
    set_pgfault_handler(&env, pgfault::<SimEnv>).unwrap();
    env.page_alloc(EnvId::CURRENT, UTEXT, PteFlags::P | PteFlags::US)
        .unwrap();
    m.clear_calls();
    console::take();

    assert_eq!(run(|| env.write(UTEXT, b"x")), Err(EnvExit(env.id())));

    let output = console::take();
    assert!(output.contains("user panic: not a write to a COW page: va 0x800000 err 0x7 perm 0x5"));
    assert!(
        m.calls()
            .iter()
            .all(|c| c.sysno == SyscallNumber::EnvDestroy)
    );
}

#[test]
fn read_of_cow_page_is_rejected_without_syscalls() {
    let env = env_with_cow_page(b"data");
    let m = env.machine().clone();
    m.clear_calls();

    let err = FaultErrorCode::PRESENT | FaultErrorCode::USER;
    assert_eq!(
        handle_cow_fault(&env, &trapframe(UTEXT + 3, err)),
        Err(ForkError::NotCopyOnWrite {
            fault_va: UTEXT.into_usize() + 3,
            err,
            perm: Some(cow()),
        })
    );
    assert!(m.calls().is_empty());
    assert_eq!(m.perm_of(env.id(), UTEXT), Some(cow()));
}

#[test]
fn fault_reason_classification() {
    let env = env_with_cow_page(b"data");
    let write = FaultErrorCode::PRESENT | FaultErrorCode::WRITE | FaultErrorCode::USER;

    let reason = PageFaultReason::probe(&trapframe(UTEXT + 0x10, write), &env);
    assert!(reason.is_cow_fault());
    assert_eq!(reason.page, Some(UTEXT));
    assert_eq!(reason.perm, Some(cow()));

    // A write to an unmapped page.
    let missing = UTEXT + 16 * PAGE_SIZE;
    let reason = PageFaultReason::probe(
        &trapframe(missing, FaultErrorCode::WRITE | FaultErrorCode::USER),
        &env,
    );
    assert!(!reason.is_cow_fault());
    assert_eq!(reason.perm, None);

    // The CPU claims a present page but the table disagrees.
    let reason = PageFaultReason::probe(&trapframe(missing, write), &env);
    assert!(!reason.is_cow_fault());

    // Non-canonical addresses never name a page.
    let reason = PageFaultReason::probe(
        &UTrapframe {
            fault_va: 0x0000_9000_0000_0000,
            ..trapframe(UTEXT, write)
        },
        &env,
    );
    assert_eq!(reason.page, None);
    assert!(!reason.is_cow_fault());
}

#[test]
fn scratch_page_is_unmapped_when_dropped() {
    let env = Machine::new().spawn();
    let m = env.machine().clone();
    env.page_alloc(EnvId::CURRENT, UTEXT, PteFlags::USER_RW).unwrap();
    env.write(UTEXT, b"abc");

    let scratch = ScratchPage::stage(&env, UTEXT).unwrap();
    assert_eq!(m.perm_of(env.id(), PFTEMP), Some(PteFlags::USER_RW));
    assert_eq!(env.read(PFTEMP, 3), b"abc");
    drop(scratch);

    assert_eq!(m.perm_of(env.id(), PFTEMP), None);
    assert_eq!(m.live_frames(), 1);
}

#[test]
fn failed_staging_leaves_page_shared() {
    let env = env_with_cow_page(b"data");
    let m = env.machine().clone();
    m.fail_nth(SyscallNumber::PageAlloc, 1, KernelError::NoMemory);

    let write = FaultErrorCode::PRESENT | FaultErrorCode::WRITE | FaultErrorCode::USER;
    assert_eq!(
        handle_cow_fault(&env, &trapframe(UTEXT, write)),
        Err(ForkError::Syscall {
            sysno: SyscallNumber::PageAlloc,
            va: Some(PFTEMP),
            error: KernelError::NoMemory,
        })
    );
    assert_eq!(m.perm_of(env.id(), UTEXT), Some(cow()));
    assert_eq!(m.perm_of(env.id(), PFTEMP), None);
}

#[test]
fn failed_copy_terminates_the_environment() {
    let env = env_with_cow_page(b"data");
    let m = env.machine().clone();
    m.fail_nth(SyscallNumber::PageMap, 1, KernelError::NoMemory);
    console::take();

    assert_eq!(run(|| env.write(UTEXT, b"x")), Err(EnvExit(env.id())));
    assert!(console::take().contains("user panic: sys_page_map at 0x800000: NoMemory (-12)"));
    assert!(!m.is_alive(env.id()));
}

#[test]
fn fault_without_upcall_is_killed_by_kernel() {
    let env = Machine::new().spawn();
    let m = env.machine().clone();
    console::take();

    assert_eq!(run(|| env.write(UTEXT, b"x")), Err(EnvExit(env.id())));
    assert!(console::take().contains(&format!("[{}] user fault va 0x800000", env.id())));
    assert!(!m.is_alive(env.id()));
}

fn write_to_cow_page(env: &SimEnv, _: &UTrapframe) {
    env.write(UTEXT, b"!");
}

#[test]
fn fault_inside_handler_kills_the_environment() {
    let env = env_with_cow_page(b"data");
    let m = env.machine().clone();
    set_pgfault_handler(&env, write_to_cow_page).unwrap();
    console::take();

    assert_eq!(run(|| env.write(UTEXT, b"x")), Err(EnvExit(env.id())));
    assert!(console::take().contains(&format!(
        "[{}] fault in page fault handler va 0x800000",
        env.id()
    )));
    assert!(!m.is_alive(env.id()));
}

#[test]
fn failed_scratch_release_is_reported() {
    let env = Machine::new().spawn();
    let m = env.machine().clone();
    env.page_alloc(EnvId::CURRENT, UTEXT, PteFlags::USER_RW).unwrap();
    let scratch = ScratchPage::stage(&env, UTEXT).unwrap();
    m.fail_nth(SyscallNumber::PageUnmap, 1, KernelError::NoMemory);
    console::take();

    drop(scratch);
    assert!(console::take().contains(
        "[WARN] pgfault: cannot release scratch page 0x3ff000: NoMemory (-12)"
    ));
    assert_eq!(m.perm_of(env.id(), PFTEMP), Some(PteFlags::USER_RW));
}
