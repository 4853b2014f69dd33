use std::rc::Rc;
use ufork::{
    ForkError, ForkResult, fault::pgfault, fork, sfork, try_fork, try_sfork, walk::PresentPages,
};
use ufork_grader::{EnvExit, Machine, SimEnv, console, run};
use ulib::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    env::{EnvId, EnvStatus, UserEnv},
    mm::{USTACKTOP, UTEXT, UXSTACKTOP, page_table::PteFlags},
    pgfault::set_pgfault_handler,
    syscall::{Syscall, SyscallNumber},
};

const TEXT: Va = UTEXT;

fn data() -> Va {
    UTEXT + 0x10 * PAGE_SIZE
}

fn stack() -> Va {
    USTACKTOP - PAGE_SIZE
}

fn uxstack() -> Va {
    UXSTACKTOP - PAGE_SIZE
}

fn cow() -> PteFlags {
    PteFlags::P | PteFlags::US | PteFlags::COW
}

/// Maps a page at `va` holding `contents`, with `perm`.
fn map(env: &SimEnv, va: Va, perm: PteFlags, contents: &[u8]) {
    env.page_alloc(EnvId::CURRENT, va, PteFlags::USER_RW).unwrap();
    env.write(va, contents);
    if perm != PteFlags::USER_RW {
        env.page_map(EnvId::CURRENT, va, EnvId::CURRENT, va, perm)
            .unwrap();
    }
}

/// A program with read-only text, writable data, and a stack.
fn program() -> (Rc<Machine>, SimEnv) {
    let m = Machine::new();
    let env = m.spawn();
    map(&env, TEXT, PteFlags::P | PteFlags::US, b"\x55\x48\x89\xe5");
    map(&env, data(), PteFlags::USER_RW, b"initialized data");
    map(&env, stack(), PteFlags::USER_RW, b"stack frame");
    m.clear_calls();
    (m, env)
}

fn forked(env: &SimEnv) -> EnvId {
    match try_fork(env) {
        Ok(ForkResult::Parent(child)) => child,
        r => panic!("unexpected fork result: {r:?}"),
    }
}

#[test]
fn child_maps_every_page_of_parent() {
    let (m, parent) = program();
    let child = forked(&parent);
    let child_env = m.env(child);

    for (va, len) in [(TEXT, 4), (data(), 16), (stack(), 11)] {
        assert_eq!(m.frame_of(child, va), m.frame_of(parent.id(), va));
        assert_eq!(child_env.read(va, len), parent.read(va, len));
    }
    assert_eq!(m.perm_of(child, TEXT), Some(PteFlags::P | PteFlags::US));
    assert_eq!(m.perm_of(parent.id(), TEXT), Some(PteFlags::P | PteFlags::US));
    for va in [data(), stack()] {
        assert_eq!(m.perm_of(child, va), Some(cow()));
        assert_eq!(m.perm_of(parent.id(), va), Some(cow()));
    }
}

#[test]
fn child_is_ready_to_run() {
    let (m, parent) = program();
    let child = forked(&parent);

    assert_eq!(m.status_of(child), Some(EnvStatus::Runnable));
    assert_eq!(m.upcall_of(child), Some(parent.upcall_entry()));
    assert_eq!(m.upcall_of(parent.id()), Some(parent.upcall_entry()));
    let descriptor = parent.env(child).unwrap();
    assert_eq!(descriptor.parent_id, parent.id());

    // Status is set last.
    let calls = m.calls();
    let last = calls.last().unwrap();
    assert_eq!(last.sysno, SyscallNumber::EnvSetStatus);
    assert_eq!(last.target, Some(child));
}

#[test]
fn exception_stacks_are_private() {
    let (m, parent) = program();
    let child = forked(&parent);
    let child_env = m.env(child);

    assert_eq!(m.perm_of(parent.id(), uxstack()), Some(PteFlags::USER_RW));
    assert_eq!(m.perm_of(child, uxstack()), Some(PteFlags::USER_RW));
    assert_ne!(m.frame_of(parent.id(), uxstack()), m.frame_of(child, uxstack()));

    child_env.write(uxstack(), b"child trap frame");
    assert_eq!(parent.read(uxstack(), 16), [0u8; 16]);
}

#[test]
fn writes_after_fork_are_private() {
    let (m, parent) = program();
    let x = 0x5858_5858;
    let y = 0x5959_5959;
    parent.write_u64(data(), x);
    let child = forked(&parent);
    let child_env = m.env(child);

    child_env.write_u64(data(), y);
    assert_eq!(child_env.read_u64(data()), y);
    assert_eq!(parent.read_u64(data()), x);
    assert_eq!(m.perm_of(child, data()), Some(PteFlags::USER_RW));
    assert_eq!(m.perm_of(parent.id(), data()), Some(cow()));

    parent.write_u64(data(), x + 1);
    assert_eq!(parent.read_u64(data()), x + 1);
    assert_eq!(child_env.read_u64(data()), y);
    assert_ne!(m.frame_of(parent.id(), data()), m.frame_of(child, data()));
}

#[test]
fn shared_pages_stay_shared() {
    let (m, parent) = program();
    let shared = UTEXT + 0x20 * PAGE_SIZE;
    let perm = PteFlags::USER_RW | PteFlags::SHARE;
    map(&parent, shared, perm, b"mailbox");
    let child = forked(&parent);

    assert_eq!(m.perm_of(parent.id(), shared), Some(perm));
    assert_eq!(m.perm_of(child, shared), Some(perm));
    m.env(child).write(shared, b"MAILBOX");
    assert_eq!(parent.read(shared, 7), b"MAILBOX");
}

#[test]
fn supervisor_pages_are_not_duplicated() {
    let (m, parent) = program();
    let kernel_page = UTEXT + 0x30 * PAGE_SIZE;
    m.map_supervisor_page(parent.id(), kernel_page);
    assert!(PresentPages::new(&parent, UTEXT, USTACKTOP).any(|va| va == kernel_page));
    let child = forked(&parent);

    assert!(
        m.calls()
            .iter()
            .all(|c| !(c.sysno == SyscallNumber::PageMap && c.va == Some(kernel_page)))
    );
    assert_eq!(m.perm_of(child, kernel_page), None);
    assert_eq!(
        m.perm_of(parent.id(), kernel_page),
        Some(PteFlags::P | PteFlags::RW)
    );
    assert_eq!(m.frame_of(child, data()), m.frame_of(parent.id(), data()));
}

#[test]
fn handler_slot_on_cow_page_is_only_read_when_faulting() {
    let (m, parent) = program();
    // The handler variable sits in the data segment, which fork shares
    // copy-on-write.
    m.keep_handler_at(parent.id(), data() + 0x100);
    let child = forked(&parent);
    let child_env = m.env(child);
    assert_eq!(m.perm_of(parent.id(), data()), Some(cow()));

    parent.write(stack(), b"parent");
    child_env.write(stack(), b"child!");
    assert_eq!(parent.read(stack(), 6), b"parent");
    assert_eq!(child_env.read(stack(), 6), b"child!");
    assert_eq!(m.perm_of(parent.id(), data()), Some(cow()));
    assert_eq!(m.perm_of(child, data()), Some(cow()));
    assert_eq!(m.frame_of(child, data()), m.frame_of(parent.id(), data()));

    // Forking again stores the handler, which copies the data page first.
    let second = forked(&parent);
    assert_ne!(m.frame_of(child, data()), m.frame_of(parent.id(), data()));
    assert_eq!(m.frame_of(second, data()), m.frame_of(parent.id(), data()));
    m.env(second).write(stack(), b"second");
    assert_eq!(m.env(second).read(data(), 16), b"initialized data");
    assert_eq!(parent.read(stack(), 6), b"parent");
}

#[test]
fn child_is_mapped_before_parent_is_downgraded() {
    let (m, parent) = program();
    let child = forked(&parent);

    let maps: Vec<_> = m
        .calls()
        .into_iter()
        .filter(|c| c.sysno == SyscallNumber::PageMap)
        .map(|c| (c.target, c.va))
        .collect();
    assert_eq!(
        maps,
        [
            (Some(child), Some(stack())),
            (Some(EnvId::CURRENT), Some(stack())),
            (Some(child), Some(data())),
            (Some(EnvId::CURRENT), Some(data())),
            (Some(child), Some(TEXT)),
        ]
    );
}

#[test]
fn handler_is_installed_once() {
    let (m, parent) = program();
    forked(&parent);
    forked(&parent);

    let uxstack_allocs = m
        .calls()
        .iter()
        .filter(|c| {
            c.sysno == SyscallNumber::PageAlloc
                && c.target == Some(EnvId::CURRENT)
                && c.va == Some(uxstack())
        })
        .count();
    assert_eq!(uxstack_allocs, 1);
}

#[test]
fn child_resumes_in_child_branch() {
    let (m, parent) = program();
    let child = forked(&parent);
    let child_env = m.env(child);
    m.clear_calls();

    match try_fork(&child_env) {
        Ok(ForkResult::Child(env)) => {
            assert_eq!(env.id, child);
            assert_eq!(env.parent_id, parent.id());
            assert_eq!(env.status, EnvStatus::Runnable);
        }
        r => panic!("unexpected fork result: {r:?}"),
    }
    // The handler came along with the child's memory; only exofork returned.
    let sysnos: Vec<_> = m.calls().iter().map(|c| c.sysno).collect();
    assert_eq!(sysnos, [SyscallNumber::Exofork]);

    // From there on, the child forks like any other environment.
    let grandchild = forked(&child_env);
    assert_eq!(child_env.env(grandchild).unwrap().parent_id, child);
    assert_eq!(m.env(grandchild).read(data(), 16), b"initialized data");
}

#[test]
fn failed_page_map_destroys_child() {
    let (m, parent) = program();
    set_pgfault_handler(&parent, pgfault::<SimEnv>).unwrap();
    let frames = m.live_frames();
    m.clear_calls();
    m.fail_nth(SyscallNumber::PageMap, 3, KernelError::NoMemory);

    assert_eq!(
        try_fork(&parent),
        Err(ForkError::Syscall {
            sysno: SyscallNumber::PageMap,
            va: Some(data()),
            error: KernelError::NoMemory,
        })
    );

    let destroyed: Vec<_> = m
        .calls()
        .into_iter()
        .filter(|c| c.sysno == SyscallNumber::EnvDestroy)
        .map(|c| c.target)
        .collect();
    assert_eq!(destroyed.len(), 1);
    let child = destroyed[0].unwrap();
    assert!(!m.is_alive(child));
    assert_eq!(m.live_frames(), frames);

    // The parent keeps working on its now copy-on-write stack.
    parent.write(stack(), b"still alive");
    assert_eq!(parent.read(stack(), 11), b"still alive");
}

#[test]
fn failed_exception_stack_destroys_child() {
    let (m, parent) = program();
    set_pgfault_handler(&parent, pgfault::<SimEnv>).unwrap();
    m.fail_nth(SyscallNumber::PageAlloc, 1, KernelError::NoMemory);

    assert_eq!(
        try_fork(&parent),
        Err(ForkError::Syscall {
            sysno: SyscallNumber::PageAlloc,
            va: Some(uxstack()),
            error: KernelError::NoMemory,
        })
    );
    let destroy = m
        .calls()
        .into_iter()
        .find(|c| c.sysno == SyscallNumber::EnvDestroy)
        .unwrap();
    assert!(!m.is_alive(destroy.target.unwrap()));
}

#[test]
fn failed_cleanup_keeps_original_error() {
    let (m, parent) = program();
    m.fail_nth(SyscallNumber::PageMap, 1, KernelError::NoMemory);
    m.fail_nth(SyscallNumber::EnvDestroy, 1, KernelError::NoSuchEnv);
    console::take();

    assert_eq!(
        try_fork(&parent),
        Err(ForkError::Syscall {
            sysno: SyscallNumber::PageMap,
            va: Some(stack()),
            error: KernelError::NoMemory,
        })
    );
    assert!(console::take().contains("[WARN] fork: cannot destroy child"));
}

#[test]
fn exofork_failure_creates_nothing() {
    let (m, parent) = program();
    m.fail_nth(SyscallNumber::Exofork, 1, KernelError::TryAgain);

    assert_eq!(
        try_fork(&parent),
        Err(ForkError::Syscall {
            sysno: SyscallNumber::Exofork,
            va: None,
            error: KernelError::TryAgain,
        })
    );
    assert!(
        m.calls()
            .iter()
            .all(|c| c.sysno != SyscallNumber::EnvDestroy)
    );
}

#[test]
fn handler_registration_failure_stops_fork() {
    let (m, parent) = program();
    m.fail_nth(SyscallNumber::PageAlloc, 1, KernelError::NoMemory);

    assert_eq!(
        try_fork(&parent),
        Err(ForkError::Syscall {
            sysno: SyscallNumber::PageAlloc,
            va: Some(uxstack()),
            error: KernelError::NoMemory,
        })
    );
    assert!(
        m.calls()
            .iter()
            .all(|c| c.sysno != SyscallNumber::Exofork)
    );
}

#[test]
fn fork_failure_is_fatal() {
    let (m, parent) = program();
    m.fail_nth(SyscallNumber::PageMap, 1, KernelError::NoMemory);
    console::take();

    assert_eq!(run(|| fork(&parent)), Err(EnvExit(parent.id())));
    let output = console::take();
    assert!(output.contains(&format!(
        "[{}] user panic: sys_page_map at {}: NoMemory (-12)",
        parent.id(),
        stack()
    )));
    assert!(!m.is_alive(parent.id()));
}

#[test]
fn sfork_is_unsupported() {
    let (m, parent) = program();

    assert_eq!(try_sfork(&parent), Err(ForkError::Unsupported));
    assert!(m.calls().is_empty());
    assert_eq!(
        KernelError::from(ForkError::Unsupported),
        KernelError::InvalidArgument
    );

    console::take();
    assert_eq!(run(|| sfork(&parent)), Err(EnvExit(parent.id())));
    assert!(console::take().contains("user panic: sfork is not supported"));
}
