//! Debug-line register updates
//!
//! With tracing enabled the engine prints one line per executed instruction
//! and one per accumulator change:
//!
//! ```text
//! Exec 1000: 65 1001 1005
//! ACC: 0000000000 0000000042+ OV: 0
//! ```
//!
//! These are parsed into partial snapshot updates and coalesced, so a burst
//! of trace output turns into one merge per flush interval.

use super::StatePatch;

const ACC_PREFIX: &str = "ACC:";
const EXEC_PREFIX: &str = "Exec ";

fn digits(token: &str, len: usize) -> Option<&str> {
    (token.len() == len && token.bytes().all(|b| b.is_ascii_digit())).then_some(token)
}

fn parse_acc(rest: &str) -> Option<StatePatch> {
    let mut tokens = rest.split_whitespace();
    let upper = digits(tokens.next()?, 10)?;

    let lower_signed = tokens.next()?;
    let sign = lower_signed.chars().last().filter(|c| *c == '+' || *c == '-')?;
    let lower = digits(&lower_signed[..lower_signed.len() - 1], 10)?;

    let overflow = match (tokens.next(), tokens.next()) {
        (None, _) => None,
        (Some("OV:"), Some(flag)) => Some(digits(flag, 1)? != "0"),
        _ => return None,
    };

    Some(StatePatch {
        upper_accumulator: Some(format!("{upper}{sign}")),
        lower_accumulator: Some(format!("{lower}{sign}")),
        overflow,
        ..StatePatch::default()
    })
}

fn parse_exec(rest: &str) -> Option<StatePatch> {
    let (address, fields) = rest.split_once(':')?;
    let address = digits(address, 4)?;

    let mut tokens = fields.split_whitespace();
    let op = digits(tokens.next()?, 2)?;
    let data = digits(tokens.next()?, 4)?;
    let instruction = digits(tokens.next()?, 4)?;

    Some(StatePatch {
        address_register: Some(address.to_string()),
        program_register: Some(format!("{op}{data}{instruction}+")),
        ..StatePatch::default()
    })
}

/// Parse one engine output line into a register update
///
/// Returns `None` for lines that are not recognized trace output.
#[must_use]
pub fn parse_debug_line(line: &str) -> Option<StatePatch> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(ACC_PREFIX) {
        parse_acc(rest)
    } else if let Some(rest) = line.strip_prefix(EXEC_PREFIX) {
        parse_exec(rest)
    } else {
        None
    }
}

/// Accumulates debug-line updates between flushes
#[derive(Debug, Default)]
pub struct DebugLineCoalescer {
    pending: Option<StatePatch>,
}

impl DebugLineCoalescer {
    /// Create an empty coalescer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of output; returns how many lines were recognized
    pub fn push(&mut self, text: &str) -> usize {
        let mut recognized = 0;
        for patch in text.lines().filter_map(parse_debug_line) {
            recognized += 1;
            self.pending = Some(match self.pending.take() {
                Some(pending) => pending.merge(patch),
                None => patch,
            });
        }
        recognized
    }

    /// Whether a flush would produce anything
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the combined update, leaving the coalescer empty
    pub fn take(&mut self) -> Option<StatePatch> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_acc_line() {
        let patch = parse_debug_line("ACC: 0000000001 0000000042- OV: 1").unwrap();
        assert_eq!(patch.upper_accumulator.as_deref(), Some("0000000001-"));
        assert_eq!(patch.lower_accumulator.as_deref(), Some("0000000042-"));
        assert_eq!(patch.overflow, Some(true));
    }

    #[test]
    fn test_parse_acc_without_overflow() {
        let patch = parse_debug_line("  ACC: 0000000000 0000000007+").unwrap();
        assert_eq!(patch.lower_accumulator.as_deref(), Some("0000000007+"));
        assert_eq!(patch.overflow, None);
    }

    #[test]
    fn test_parse_exec_line() {
        let patch = parse_debug_line("Exec 1000: 65 1001 1005").unwrap();
        assert_eq!(patch.address_register.as_deref(), Some("1000"));
        assert_eq!(patch.program_register.as_deref(), Some("6510011005+"));
    }

    #[test]
    fn test_rejects_other_lines() {
        for line in [
            "Simulation stopped, AR: 1005",
            "ACC: 123 0000000042+",
            "ACC: 0000000000 0000000042",
            "ACC: 0000000000 0000000042+ OV:",
            "Exec 100: 65 1001 1005",
            "Exec 1000: 65 1001",
            "",
        ] {
            assert_eq!(parse_debug_line(line), None, "{line:?}");
        }
    }

    #[test]
    fn test_coalescer_keeps_latest_values() {
        let mut coalescer = DebugLineCoalescer::new();
        let recognized = coalescer.push(
            "Exec 1000: 65 1001 1005\nACC: 0000000000 0000000001+ OV: 0\nhello\nExec 1005: 15 1002 1006\n",
        );
        assert_eq!(recognized, 3);
        assert!(coalescer.has_pending());

        let patch = coalescer.take().unwrap();
        assert_eq!(patch.address_register.as_deref(), Some("1005"));
        assert_eq!(patch.program_register.as_deref(), Some("1510021006+"));
        assert_eq!(patch.lower_accumulator.as_deref(), Some("0000000001+"));
        assert_eq!(patch.overflow, Some(false));
        assert!(coalescer.take().is_none());
    }
}
