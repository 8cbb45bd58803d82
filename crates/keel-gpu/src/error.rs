//! Fail-fast error policy.
//!
//! Resource creation on the render path does not return errors: a failed
//! allocation or an exhausted descriptor table leaves the renderer unusable,
//! so the failure is logged and the thread panics with the diagnostic.

use std::fmt::Display;

use crate::hal::HalResult;

/// Logs `what` at error level and panics with it.
#[track_caller]
pub fn fatal(what: impl Display) -> ! {
    log::error!("{what}");
    panic!("{what}");
}

/// Unwraps a backend result, treating failure as fatal.
pub(crate) trait OrFatal<T> {
    fn or_fatal(self, context: &str) -> T;
}

impl<T> OrFatal<T> for HalResult<T> {
    #[track_caller]
    fn or_fatal(self, context: &str) -> T {
        match self {
            Ok(value) => value,
            Err(e) => fatal(format_args!("{context}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::HalError;

    #[test]
    fn ok_passes_through() {
        let r: HalResult<u32> = Ok(3);
        assert_eq!(r.or_fatal("unused"), 3);
    }

    #[test]
    #[should_panic(expected = "creating heap: out of device memory allocating 64 bytes")]
    fn err_panics_with_context() {
        let r: HalResult<u32> = Err(HalError::OutOfMemory { size: 64 });
        r.or_fatal("creating heap");
    }
}
