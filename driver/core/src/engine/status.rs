//! Engine Status Codes
//!
//! The engine reports every command and every run request as a numeric code.
//! The upper bits carry annotations (keyboard interrupt, breakpoint, "message
//! already printed") that say nothing about the outcome, so they are masked
//! off with [`bare`] before a code is classified.

/// Raw numeric status returned by the engine
pub type StatusCode = i32;

/// Base of the engine's error range
pub const ERROR_BASE: StatusCode = 64;

/// Normal completion
pub const OK: StatusCode = 0;

/// The simulated machine executed a programmed stop
pub const PROGRAM_STOP: StatusCode = 1;

/// A bounded step request ran to completion without stopping
pub const STEP_EXPIRED: StatusCode = ERROR_BASE + 9;

/// Execution was halted on request
pub const STOP: StatusCode = ERROR_BASE + 13;

/// The engine left its command loop cleanly
pub const EXIT: StatusCode = ERROR_BASE + 14;

/// An `EXPECT` rule matched
pub const EXPECT_MET: StatusCode = ERROR_BASE + 44;

/// Keyboard interrupt annotation
pub const FLAG_KEYBOARD: StatusCode = 0x0001_0000;

/// Breakpoint annotation
pub const FLAG_BREAK: StatusCode = 0x0002_0000;

/// "Message already printed" annotation
pub const FLAG_NO_MESSAGE: StatusCode = 0x1000_0000;

const ANNOTATION_BITS: StatusCode = FLAG_KEYBOARD | FLAG_BREAK | FLAG_NO_MESSAGE;

/// Strip annotation bits from a raw code
#[must_use]
pub const fn bare(code: StatusCode) -> StatusCode {
    code & !ANNOTATION_BITS
}

/// Whether a command finishing with `code` completed normally
#[must_use]
pub const fn is_ok(code: StatusCode) -> bool {
    matches!(
        bare(code),
        OK | PROGRAM_STOP | STEP_EXPIRED | STOP | EXIT | EXPECT_MET
    )
}

/// Whether a run quantum finishing with `code` left the machine running
#[must_use]
pub const fn is_continuation(code: StatusCode) -> bool {
    matches!(bare(code), OK | STEP_EXPIRED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_masks_annotations() {
        assert_eq!(bare(STOP | FLAG_NO_MESSAGE), STOP);
        assert_eq!(bare(99 | FLAG_KEYBOARD | FLAG_BREAK), 99);
        assert_eq!(bare(OK), OK);
    }

    #[test]
    fn test_ok_set() {
        for code in [OK, PROGRAM_STOP, STEP_EXPIRED, STOP, EXIT, EXPECT_MET] {
            assert!(is_ok(code), "{code} should be ok");
        }
        assert!(is_ok(EXIT | FLAG_NO_MESSAGE));
        assert!(!is_ok(99));
        assert!(!is_ok(ERROR_BASE));
    }

    #[test]
    fn test_continuation_codes() {
        assert!(is_continuation(STEP_EXPIRED));
        assert!(is_continuation(OK | FLAG_BREAK));
        assert!(!is_continuation(PROGRAM_STOP));
        assert!(!is_continuation(STOP));
    }
}
