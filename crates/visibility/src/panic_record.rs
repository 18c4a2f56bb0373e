//! Panic details captured while the panicking frames still exist.
//!
//! By the time `catch_unwind` returns, or a destructor runs during unwinding,
//! the frames that panicked are gone. A chained panic hook stores the message,
//! location and backtrace of the latest panic on each thread.

use crate::span::panic_message;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic;
use std::sync::{Arc, OnceLock};

/// The latest panic seen on a thread.
#[derive(Debug, Clone)]
pub(crate) struct PanicRecord {
    pub message: String,
    pub location: Option<String>,
    pub backtrace: Arc<Backtrace>,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicRecord>> = const { RefCell::new(None) };
}

static HOOK: OnceLock<()> = OnceLock::new();

/// Put the recording hook in front of whatever hook is installed. Only the
/// first call per process installs anything; the previous hook still runs.
pub(crate) fn install_hook() {
    // set_hook panics on a panicking thread.
    if std::thread::panicking() {
        return;
    }
    HOOK.get_or_init(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let record = PanicRecord {
                message: panic_message(info.payload()),
                location: info
                    .location()
                    .map(|location| format!("{}:{}", location.file(), location.line())),
                backtrace: Arc::new(Backtrace::force_capture()),
            };
            let _ = LAST_PANIC.try_with(|last| {
                if let Ok(mut last) = last.try_borrow_mut() {
                    *last = Some(record);
                }
            });
            previous(info);
        }));
    });
}

/// The latest panic recorded on this thread, if any.
pub(crate) fn last() -> Option<PanicRecord> {
    LAST_PANIC
        .try_with(|last| last.try_borrow().ok().and_then(|last| last.clone()))
        .ok()
        .flatten()
}

/// The latest recorded panic, if it is the one that produced `payload`.
pub(crate) fn matching(payload: &(dyn Any + Send)) -> Option<PanicRecord> {
    let message = panic_message(payload);
    last().filter(|record| record.message == message)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[inline(never)]
    fn overflow_the_buffer() {
        panic!("buffer overflow");
    }

    #[test]
    fn test_hook_records_panicking_frames() {
        install_hook();

        let payload = catch_unwind(AssertUnwindSafe(overflow_the_buffer)).unwrap_err();

        let record = matching(payload.as_ref()).expect("panic recorded");
        assert_eq!(record.message, "buffer overflow");
        assert!(record.location.unwrap().contains("panic_record.rs"));
        let backtrace = record.backtrace.to_string();
        assert!(backtrace.contains("overflow_the_buffer"), "{backtrace}");
    }

    #[test]
    fn test_unrelated_payload_does_not_match() {
        install_hook();

        let _ = catch_unwind(|| panic!("first"));
        assert!(matching(&"second").is_none());
        assert_eq!(last().unwrap().message, "first");
    }
}
