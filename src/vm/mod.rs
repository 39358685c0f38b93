//! Demand-paged virtual memory.
//!
//! The pipeline, bottom up:
//!
//! - [`swap`] carves a dedicated block device into page-sized slots;
//! - [`frame`] tracks every user-pool frame and runs the clock eviction
//!   sweep once the pool is exhausted;
//! - [`page`] describes where each user page lives (file, zero-fill, swap)
//!   and moves pages between frames and their backing store;
//! - [`fault`] turns page faults into reloads, stack growth, or process
//!   termination;
//! - [`mmap`] binds whole files into user address space on top of the page
//!   table.
//!
//! ## Lock order
//!
//! The global acquisition order is: per-process page-table map, descriptor
//! check-out lock, frame-table map, per-frame lock, buffer-cache flow
//! protocol, per-cache-entry locks, block device. The eviction sweep
//! inverts "descriptor then frame" into "frame then descriptor"; that is
//! safe because it takes both with try-lock semantics and abandons the
//! victim on any contention.

pub mod fault;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod swap;

pub use fault::{STACK_LIMIT, STACK_PUSH_WINDOW, USER_TOP, handle_page_fault};
pub use frame::{Frame, FrameTable};
pub use mmap::{MapId, MappingTable};
pub use page::{FileMapping, PageKind, PageTable, UserPage};
pub use swap::{SLOT_SECTORS, SwapSlot, SwapTable};
