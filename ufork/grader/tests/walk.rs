use ufork::walk::PresentPages;
use ufork_grader::{Machine, SimEnv};
use ulib::{
    addressing::{PAGE_SIZE, Va},
    env::EnvId,
    mm::{USTACKTOP, UTEXT, UXSTACKTOP, page_table::{Level, PteFlags}},
    syscall::Syscall,
};

const GIB: usize = 1 << 30;

fn env_with_pages(pages: &[Va]) -> SimEnv {
    let env = Machine::new().spawn();
    for va in pages {
        env.page_alloc(EnvId::CURRENT, *va, PteFlags::USER_RW).unwrap();
    }
    env.machine().clear_probes();
    env
}

#[test]
fn pages_are_visited_top_down() {
    let stack = USTACKTOP - PAGE_SIZE;
    let data = UTEXT + 3 * PAGE_SIZE;
    let env = env_with_pages(&[UTEXT, data, stack]);

    let pages: Vec<_> = PresentPages::new(&env, UTEXT, USTACKTOP).collect();
    assert_eq!(pages, [stack, data, UTEXT]);
}

#[test]
fn range_is_half_open() {
    let env = env_with_pages(&[
        UTEXT - PAGE_SIZE,
        UTEXT,
        USTACKTOP - PAGE_SIZE,
        USTACKTOP,
        UXSTACKTOP - PAGE_SIZE,
    ]);

    let pages: Vec<_> = PresentPages::new(&env, UTEXT, USTACKTOP).collect();
    assert_eq!(pages, [USTACKTOP - PAGE_SIZE, UTEXT]);

    let pages: Vec<_> = PresentPages::new(&env, UTEXT + PAGE_SIZE, USTACKTOP - PAGE_SIZE).collect();
    assert!(pages.is_empty());
}

#[test]
fn empty_address_space_costs_one_probe() {
    let env = env_with_pages(&[]);

    assert_eq!(PresentPages::new(&env, UTEXT, USTACKTOP).count(), 0);
    assert_eq!(
        env.machine().probes(),
        [(Level::Pml4, USTACKTOP - PAGE_SIZE)]
    );
}

#[test]
fn absent_directory_pointer_entries_are_skipped_whole() {
    // Only the first and the last GiB below the stack hold anything.
    let env = env_with_pages(&[UTEXT, USTACKTOP - PAGE_SIZE]);
    let hole = GIB..511 * GIB;

    let pages: Vec<_> = PresentPages::new(&env, UTEXT, USTACKTOP).collect();
    assert_eq!(pages, [USTACKTOP - PAGE_SIZE, UTEXT]);

    let in_hole: Vec<_> = env
        .machine()
        .probes()
        .into_iter()
        .filter(|(_, va)| hole.contains(&va.into_usize()))
        .collect();
    assert!(
        in_hole
            .iter()
            .all(|(level, _)| matches!(level, Level::Pml4 | Level::Pdp))
    );
    assert_eq!(
        in_hole
            .iter()
            .filter(|(level, _)| *level == Level::Pdp)
            .count(),
        510
    );
}

#[test]
fn absent_directory_entries_are_skipped_whole() {
    // Two pages 4 MiB apart: the 2 MiB region between them costs one probe
    // at the page directory level.
    let low = UTEXT;
    let high = UTEXT + 2 * 512 * PAGE_SIZE;
    let env = env_with_pages(&[low, high]);
    let gap = (low + 512 * PAGE_SIZE).into_usize()..high.into_usize();

    let pages: Vec<_> = PresentPages::new(&env, low, high + PAGE_SIZE).collect();
    assert_eq!(pages, [high, low]);

    let in_gap: Vec<_> = env
        .machine()
        .probes()
        .into_iter()
        .filter(|(_, va)| gap.contains(&va.into_usize()))
        .collect();
    assert!(in_gap.iter().all(|(level, _)| *level != Level::Pt));
    assert_eq!(
        in_gap.iter().filter(|(level, _)| *level == Level::Pd).count(),
        1
    );
}
