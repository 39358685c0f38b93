//! Thread services consumed by the core.
//!
//! The core spawns two background workers (buffer-cache write-behind and
//! read-ahead) and sleeps between write-behind rounds, but it does not own a
//! scheduler. The embedder supplies one through the [`Runtime`] trait and
//! hands it to whichever subsystem needs it as a constructor argument.
//!
//! The test suite implements [`Runtime`] on top of `std::thread`; a kernel
//! embedder implements it on its own thread builder and timer.

use alloc::boxed::Box;

/// Thread spawning and timed sleep, as provided by the surrounding kernel.
pub trait Runtime: Send + Sync {
    /// Spawns a detached kernel thread running `body`.
    ///
    /// `name` is a human-readable label for the thread (worker banners are
    /// logged with it).
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send + 'static>);

    /// Blocks the calling thread for the given number of scheduler ticks.
    fn sleep(&self, ticks: u64);
}
