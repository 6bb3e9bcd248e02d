#![forbid(unsafe_code)]

//! Stderr heartbeat for the dispatch worker.
//!
//! Set `FTUI_DEBUG_TRACE=1` to get one line per queue take, item and frame
//! transition, tagged with the work item being executed and its nesting
//! depth. Meant for a test that hangs before any tracing subscriber could
//! report why. When disabled, [`debug_trace!`](crate::debug_trace!) costs a
//! single bool load and the tag guard only touches a thread-local cell.
//!
//! ```text
//! [HEADLESS +    3ms idle ftui-headless] waiting for work item
//! [HEADLESS +    3ms item#7 d0] push frame depth=1
//! ```

use std::cell::Cell;
use std::fmt;
use std::sync::LazyLock;
use std::time::Instant;

static DEBUG_TRACE_ENABLED: LazyLock<bool> = LazyLock::new(|| {
    std::env::var("FTUI_DEBUG_TRACE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
});

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

thread_local! {
    static ACTIVE_ITEM: Cell<Option<ItemTag>> = const { Cell::new(None) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ItemTag {
    id: u64,
    depth: usize,
}

/// Whether `FTUI_DEBUG_TRACE` switched the heartbeat on.
#[inline]
pub fn is_enabled() -> bool {
    *DEBUG_TRACE_ENABLED
}

/// Marks the work item executing on this thread until dropped.
///
/// Guards nest the way re-entrant items do; dropping one restores the tag
/// of the item it interrupted.
pub(crate) struct ItemTrace {
    previous: Option<ItemTag>,
}

impl ItemTrace {
    pub(crate) fn enter(id: u64, depth: usize) -> Self {
        let previous = ACTIVE_ITEM.with(|active| active.replace(Some(ItemTag { id, depth })));
        Self { previous }
    }
}

impl Drop for ItemTrace {
    fn drop(&mut self) {
        ACTIVE_ITEM.with(|active| active.set(self.previous));
    }
}

/// Line prefix: time since the first trace, then the active item or the
/// thread name when the thread is between items.
struct Prefix {
    elapsed_ms: u128,
    item: Option<ItemTag>,
}

impl Prefix {
    fn current() -> Self {
        Self {
            elapsed_ms: EPOCH.elapsed().as_millis(),
            item: ACTIVE_ITEM.with(Cell::get),
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[HEADLESS +{:>5}ms ", self.elapsed_ms)?;
        match self.item {
            Some(ItemTag { id, depth }) => write!(f, "item#{id} d{depth}]"),
            None => {
                let thread = std::thread::current();
                write!(f, "idle {}]", thread.name().unwrap_or("?"))
            }
        }
    }
}

#[doc(hidden)]
pub fn emit(args: fmt::Arguments<'_>) {
    eprintln!("{} {}", Prefix::current(), args);
}

/// Print a heartbeat line to stderr when `FTUI_DEBUG_TRACE` is set.
#[macro_export]
macro_rules! debug_trace {
    ($($arg:tt)*) => {
        if $crate::debug_trace::is_enabled() {
            $crate::debug_trace::emit(format_args!($($arg)*));
        }
    };
}
