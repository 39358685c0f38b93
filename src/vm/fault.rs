//! Page-fault handling.
//!
//! Faults are triaged in order: kernel-range addresses are rejected
//! outright, a page with a descriptor is reloaded, an address inside the
//! permitted stack region within [`STACK_PUSH_WINDOW`] bytes below the
//! faulting stack pointer grows the stack by one zero-filled page, and
//! everything else terminates the process with exit code -1.

use super::{
    frame::FrameTable,
    page::{PageKind, UserPage},
    swap::SwapTable,
};
use crate::{KernelError, mm::Va, task::Process};

/// Top of user space; the user stack grows down from here.
pub const USER_TOP: Va = Va(0xC000_0000);

/// Size of the permitted stack region below [`USER_TOP`].
pub const STACK_LIMIT: usize = 8 * 1024 * 1024;

/// How far below the stack pointer a fault still counts as stack growth.
///
/// 32 bytes covers the furthest push the architecture performs before
/// moving the stack pointer.
pub const STACK_PUSH_WINDOW: usize = 32;

/// Whether a fault at `fault_addr` with user stack pointer `sp` is a
/// legitimate stack growth.
pub fn is_stack_growth(fault_addr: Va, sp: Va) -> bool {
    fault_addr.into_usize() + STACK_PUSH_WINDOW >= sp.into_usize()
        && fault_addr.into_usize() >= USER_TOP.into_usize() - STACK_LIMIT
        && fault_addr < USER_TOP
}

/// Resolves a user page fault for `process`.
///
/// On an unresolvable fault the process is marked exited with code -1 and
/// an error is returned; the embedder's trap loop reaps the thread.
pub fn handle_page_fault(
    process: &Process,
    frames: &FrameTable,
    swap: &SwapTable,
    fault_addr: Va,
    sp: Va,
    write: bool,
) -> Result<(), KernelError> {
    if fault_addr >= USER_TOP {
        return Err(process.kill());
    }
    let base = fault_addr.page_down();

    if let Some(page) = process.pages.check_out(base) {
        if write && !page.writable() {
            process.pages.check_in(&page);
            return Err(process.kill());
        }
        let result = UserPage::reload(&page, frames, swap);
        process.pages.check_in(&page);
        return result;
    }

    if !is_stack_growth(fault_addr, sp) {
        return Err(process.kill());
    }
    let page = process
        .pages
        .insert(base, PageKind::Zero, true, process.pagedir())?;
    let result = UserPage::reload(&page, frames, swap);
    process.pages.check_in(&page);
    result
}

#[cfg(test)]
mod tests {
    use super::{STACK_LIMIT, USER_TOP, is_stack_growth};
    use crate::mm::Va;

    #[test]
    fn stack_heuristic_window() {
        let sp = Va(USER_TOP.into_usize() - 0x2000);
        // Pushes just below the stack pointer qualify.
        assert!(is_stack_growth(Va(sp.into_usize() - 4), sp));
        assert!(is_stack_growth(Va(sp.into_usize() - 32), sp));
        // Further below does not.
        assert!(!is_stack_growth(Va(sp.into_usize() - 33), sp));
        // Above the stack pointer always qualifies while inside the region.
        assert!(is_stack_growth(Va(sp.into_usize() + 0x1000), sp));
    }

    #[test]
    fn stack_region_bounds() {
        let sp = Va(USER_TOP.into_usize() - 8);
        // Below the permitted region never qualifies, window or not.
        assert!(!is_stack_growth(
            Va(USER_TOP.into_usize() - STACK_LIMIT - 1),
            Va(USER_TOP.into_usize() - STACK_LIMIT - 1)
        ));
        assert!(!is_stack_growth(USER_TOP, sp));
    }
}
