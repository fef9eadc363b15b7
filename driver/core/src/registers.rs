//! Engine-held Registers
//!
//! The named EXAMINE/DEPOSIT targets the driver reads and writes, and the
//! consolidated snapshot read in a single EXAMINE round trip.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DriverError;
use crate::word::{self, ValidationError, ZERO_ADDRESS, ZERO_WORD};

/// How a register's value is formatted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterKind {
    /// Four-digit drum address
    Address,
    /// Ten digits and a sign
    Word,
    /// `0` or `1`
    Flag,
}

/// Named registers and switches held by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Register {
    /// Address register (`AR`)
    Address,
    /// Program register (`PR`)
    Program,
    /// Distributor (`DIST`)
    Distributor,
    /// Lower half of the accumulator (`ACCLO`)
    LowerAccumulator,
    /// Upper half of the accumulator (`ACCUP`)
    UpperAccumulator,
    /// Console storage-entry switches (`CSW`)
    ConsoleSwitches,
    /// Programmed-stop switch (`CSWPS`)
    ProgrammedStop,
    /// Overflow-stop switch (`CSWOS`)
    OverflowStop,
    /// Half-cycle switch (`HALF`)
    HalfCycle,
    /// Overflow indicator (`OV`)
    Overflow,
}

impl Register {
    /// Every register, in snapshot order
    pub const ALL: [Register; 10] = [
        Register::Address,
        Register::Program,
        Register::Distributor,
        Register::LowerAccumulator,
        Register::UpperAccumulator,
        Register::ConsoleSwitches,
        Register::ProgrammedStop,
        Register::OverflowStop,
        Register::HalfCycle,
        Register::Overflow,
    ];

    /// The engine's name for this register
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Address => "AR",
            Self::Program => "PR",
            Self::Distributor => "DIST",
            Self::LowerAccumulator => "ACCLO",
            Self::UpperAccumulator => "ACCUP",
            Self::ConsoleSwitches => "CSW",
            Self::ProgrammedStop => "CSWPS",
            Self::OverflowStop => "CSWOS",
            Self::HalfCycle => "HALF",
            Self::Overflow => "OV",
        }
    }

    /// Look up a register by its engine name (case-insensitive)
    #[must_use]
    pub fn from_mnemonic(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|r| r.mnemonic().eq_ignore_ascii_case(name))
    }

    /// Value format of this register
    #[must_use]
    pub fn kind(self) -> RegisterKind {
        match self {
            Self::Address => RegisterKind::Address,
            Self::ProgrammedStop | Self::OverflowStop | Self::HalfCycle | Self::Overflow => {
                RegisterKind::Flag
            }
            _ => RegisterKind::Word,
        }
    }

    /// Validate and normalize a value for this register
    ///
    /// # Errors
    ///
    /// Returns the [`ValidationError`] for the register's format.
    pub fn normalize_value(self, value: &str) -> Result<String, ValidationError> {
        match self.kind() {
            RegisterKind::Address => word::normalize_address(value),
            RegisterKind::Word => word::normalize_word(value),
            RegisterKind::Flag => word::normalize_flag(value),
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Render a bool as the engine's flag text
#[must_use]
pub fn flag_text(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Every register value, read in one round trip
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSnapshot {
    /// Address register
    pub address_register: String,
    /// Program register
    pub program_register: String,
    /// Distributor
    pub distributor: String,
    /// Lower accumulator
    pub lower_accumulator: String,
    /// Upper accumulator
    pub upper_accumulator: String,
    /// Console switches
    pub console_switches: String,
    /// Programmed-stop switch
    pub programmed_stop: bool,
    /// Overflow-stop switch
    pub overflow_stop: bool,
    /// Half-cycle switch
    pub half_cycle: bool,
    /// Overflow indicator
    pub overflow: bool,
}

impl Default for RegisterSnapshot {
    fn default() -> Self {
        Self {
            address_register: ZERO_ADDRESS.to_string(),
            program_register: ZERO_WORD.to_string(),
            distributor: ZERO_WORD.to_string(),
            lower_accumulator: ZERO_WORD.to_string(),
            upper_accumulator: ZERO_WORD.to_string(),
            console_switches: ZERO_WORD.to_string(),
            programmed_stop: false,
            overflow_stop: false,
            half_cycle: false,
            overflow: false,
        }
    }
}

impl RegisterSnapshot {
    /// The EXAMINE target list that reads every register at once
    #[must_use]
    pub fn examine_target() -> String {
        Register::ALL
            .iter()
            .map(|r| r.mnemonic())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Build a snapshot from parsed EXAMINE output
    ///
    /// Values the engine reports in a non-canonical but valid form are
    /// normalized; anything else is kept as reported.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::MissingValue`] naming the first absent register.
    pub fn from_examine(values: &HashMap<String, String>) -> Result<Self, DriverError> {
        let get = |register: Register| -> Result<String, DriverError> {
            let raw = values
                .get(register.mnemonic())
                .ok_or_else(|| DriverError::MissingValue {
                    target: register.mnemonic().to_string(),
                })?;
            Ok(register
                .normalize_value(raw)
                .unwrap_or_else(|_| raw.trim().to_string()))
        };
        let flag = |register: Register| -> Result<bool, DriverError> {
            Ok(get(register)?.chars().any(|c| c.is_ascii_digit() && c != '0'))
        };

        Ok(Self {
            address_register: get(Register::Address)?,
            program_register: get(Register::Program)?,
            distributor: get(Register::Distributor)?,
            lower_accumulator: get(Register::LowerAccumulator)?,
            upper_accumulator: get(Register::UpperAccumulator)?,
            console_switches: get(Register::ConsoleSwitches)?,
            programmed_stop: flag(Register::ProgrammedStop)?,
            overflow_stop: flag(Register::OverflowStop)?,
            half_cycle: flag(Register::HalfCycle)?,
            overflow: flag(Register::Overflow)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn examine_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_mnemonic_roundtrip() {
        for register in Register::ALL {
            assert_eq!(Register::from_mnemonic(register.mnemonic()), Some(register));
        }
        assert_eq!(Register::from_mnemonic(" dist "), Some(Register::Distributor));
        assert_eq!(Register::from_mnemonic("XYZ"), None);
    }

    #[test]
    fn test_examine_target_lists_all() {
        assert_eq!(
            RegisterSnapshot::examine_target(),
            "AR,PR,DIST,ACCLO,ACCUP,CSW,CSWPS,CSWOS,HALF,OV"
        );
    }

    #[test]
    fn test_normalize_value_by_kind() {
        assert_eq!(Register::Address.normalize_value("12").unwrap(), "0012");
        assert_eq!(
            Register::Distributor.normalize_value("-0000000001").unwrap(),
            "0000000001-"
        );
        assert_eq!(Register::HalfCycle.normalize_value("1").unwrap(), "1");
        assert!(Register::ProgrammedStop.normalize_value("yes").is_err());
    }

    #[test]
    fn test_from_examine() {
        let values = examine_map(&[
            ("AR", "1000"),
            ("PR", "6510001005+"),
            ("DIST", "0000000042+"),
            ("ACCLO", "0000000007-"),
            ("ACCUP", "0000000000-"),
            ("CSW", "-0000000001"),
            ("CSWPS", "1"),
            ("CSWOS", "0"),
            ("HALF", "0"),
            ("OV", "1"),
        ]);

        let snapshot = RegisterSnapshot::from_examine(&values).unwrap();
        assert_eq!(snapshot.address_register, "1000");
        assert_eq!(snapshot.console_switches, "0000000001-");
        assert!(snapshot.programmed_stop);
        assert!(!snapshot.overflow_stop);
        assert!(snapshot.overflow);
    }

    #[test]
    fn test_from_examine_missing_register() {
        let values = examine_map(&[("AR", "1000")]);
        let err = RegisterSnapshot::from_examine(&values).unwrap_err();
        assert!(matches!(err, DriverError::MissingValue { target } if target == "PR"));
    }
}
