//! Pending errors raised by generated code.
//!
//! Generated code never unwinds. A raising runtime function records the error
//! for the current thread and the generated code returns early. Whoever
//! invoked the generated code takes the error once control is back on the
//! host side.

use std::cell::RefCell;

use cobalt_error::DbError;
use tracing::trace;

thread_local! {
    static PENDING_ERROR: RefCell<Option<DbError>> = const { RefCell::new(None) };
}

/// Set the pending error for this thread.
///
/// The first error wins, later errors are dropped since they're usually a
/// consequence of the first.
pub fn set_pending_error(error: DbError) {
    PENDING_ERROR.with(|pending| {
        let mut pending = pending.borrow_mut();
        match pending.as_ref() {
            Some(existing) => {
                trace!(%existing, dropped = %error, "pending error already set");
            }
            None => *pending = Some(error),
        }
    })
}

pub fn take_pending_error() -> Option<DbError> {
    PENDING_ERROR.with(|pending| pending.borrow_mut().take())
}

pub fn has_pending_error() -> bool {
    PENDING_ERROR.with(|pending| pending.borrow().is_some())
}

pub extern "C" fn rt_throw_overflow() {
    set_pending_error(DbError::new("Numeric value out of range"));
}

pub extern "C" fn rt_throw_divide_by_zero() {
    set_pending_error(DbError::new("Division by zero"));
}

pub extern "C" fn rt_has_pending_error() -> u8 {
    has_pending_error() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        assert!(take_pending_error().is_none());

        rt_throw_divide_by_zero();
        rt_throw_overflow();
        assert_eq!(1, rt_has_pending_error());

        let err = take_pending_error().unwrap();
        assert_eq!("Division by zero", err.get_msg());
        assert_eq!(0, rt_has_pending_error());
    }
}
