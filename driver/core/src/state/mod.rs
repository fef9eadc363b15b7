//! Emulator State
//!
//! The snapshot the presentation layer observes, the switch positions it is
//! built from, and the service that keeps it in step with the engine.
//!
//! # Derived fields
//!
//! `display_value` and `operation_code` are private and only ever written by
//! [`EmulatorState::derive`], which every merge runs. Subscribers therefore
//! never see a snapshot whose derived fields disagree with its inputs.

mod debug_lines;
mod preferences;
mod run_guard;
mod service;

use serde::{Deserialize, Serialize};

pub use debug_lines::{parse_debug_line, DebugLineCoalescer};
pub use preferences::{
    MemoryPreferences, PreferenceStore, Preferences, PreferencesError, TomlPreferences,
};
pub use run_guard::RunStateGuard;
pub use service::{is_run_command, normalize_yield_steps, EmulatorStateService, MAX_YIELD_STEPS};

use crate::registers::{Register, RegisterSnapshot};
use crate::word::{ZERO_ADDRESS, ZERO_WORD};

// ============================================================================
// Switch Positions
// ============================================================================

/// Which register the display lamps show
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplaySwitch {
    /// Lower accumulator
    LowerAccumulator,
    /// Upper accumulator
    UpperAccumulator,
    /// Distributor
    #[default]
    Distributor,
    /// Program register
    ProgramRegister,
    /// Manual drum read into the distributor
    ReadOut,
    /// Manual drum write from the console switches
    ReadIn,
}

/// Control switch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSwitch {
    /// Stop when the address register matches the address switches
    AddressStop,
    /// Normal program execution
    #[default]
    Run,
    /// Address and display switches drive drum transfers
    ManualOperation,
}

/// Error switch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSwitch {
    /// Stop on a machine error
    #[default]
    Stop,
    /// Light the lamp and continue
    Sense,
}

/// Programmed-stop switch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgrammedSwitch {
    /// Honor programmed stops
    Stop,
    /// Ignore programmed stops
    #[default]
    Run,
}

impl ProgrammedSwitch {
    /// Engine flag value for this position
    #[must_use]
    pub fn flag(self) -> bool {
        self == Self::Stop
    }
}

/// Half-cycle switch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HalfCycleSwitch {
    /// Stop after every half cycle
    Half,
    /// Run continuously
    #[default]
    Run,
}

impl HalfCycleSwitch {
    /// Engine flag value for this position
    #[must_use]
    pub fn flag(self) -> bool {
        self == Self::Half
    }
}

/// Overflow switch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowSwitch {
    /// Stop on overflow
    Stop,
    /// Set the indicator and continue
    #[default]
    Sense,
}

impl OverflowSwitch {
    /// Engine flag value for this position
    #[must_use]
    pub fn flag(self) -> bool {
        self == Self::Stop
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// The authoritative record of switches, registers and derived display fields
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EmulatorState {
    /// Initialization has completed
    pub initialized: bool,
    /// The machine is executing
    pub running: bool,
    /// Engine yield quantum (0 = unlimited)
    pub yield_steps: u32,

    /// Display switch position
    pub display_switch: DisplaySwitch,
    /// Control switch position
    pub control_switch: ControlSwitch,
    /// Error switch position
    pub error_switch: ErrorSwitch,
    /// Programmed-stop switch position
    pub programmed_switch: ProgrammedSwitch,
    /// Half-cycle switch position
    pub half_cycle_switch: HalfCycleSwitch,
    /// Overflow switch position
    pub overflow_switch: OverflowSwitch,
    /// Address switches (normalized address)
    pub address_switches: String,

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
    /// Console storage-entry switches
    pub console_switches: String,

    /// Programmed-stop flag held by the engine
    pub programmed_stop: bool,
    /// Overflow-stop flag held by the engine
    pub overflow_stop: bool,
    /// Half-cycle flag held by the engine
    pub half_cycle: bool,
    /// Overflow indicator
    pub overflow: bool,

    display_value: String,
    operation_code: String,
}

impl Default for EmulatorState {
    fn default() -> Self {
        Self::new(0)
    }
}

impl EmulatorState {
    /// Zeroed snapshot with the given yield quantum
    #[must_use]
    pub fn new(yield_steps: u32) -> Self {
        let mut state = Self {
            initialized: false,
            running: false,
            yield_steps,
            display_switch: DisplaySwitch::default(),
            control_switch: ControlSwitch::default(),
            error_switch: ErrorSwitch::default(),
            programmed_switch: ProgrammedSwitch::default(),
            half_cycle_switch: HalfCycleSwitch::default(),
            overflow_switch: OverflowSwitch::default(),
            address_switches: ZERO_ADDRESS.to_string(),
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
            display_value: String::new(),
            operation_code: String::new(),
        };
        state.derive();
        state
    }

    /// Value shown on the display lamps
    #[must_use]
    pub fn display_value(&self) -> &str {
        &self.display_value
    }

    /// Two-digit operation code decoded from the program register
    #[must_use]
    pub fn operation_code(&self) -> &str {
        &self.operation_code
    }

    fn derive(&mut self) {
        self.display_value = match self.display_switch {
            DisplaySwitch::LowerAccumulator => self.lower_accumulator.clone(),
            DisplaySwitch::UpperAccumulator => self.upper_accumulator.clone(),
            DisplaySwitch::ProgramRegister => self.program_register.clone(),
            DisplaySwitch::Distributor | DisplaySwitch::ReadOut | DisplaySwitch::ReadIn => {
                self.distributor.clone()
            }
        };
        self.operation_code = match self.program_register.get(..2) {
            Some(op) if op.bytes().all(|b| b.is_ascii_digit()) => op.to_string(),
            _ => "00".to_string(),
        };
    }
}

// ============================================================================
// Patches
// ============================================================================

/// A shallow partial update of the snapshot's input fields
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatePatch {
    /// See [`EmulatorState::initialized`]
    pub initialized: Option<bool>,
    /// See [`EmulatorState::running`]
    pub running: Option<bool>,
    /// See [`EmulatorState::yield_steps`]
    pub yield_steps: Option<u32>,
    /// See [`EmulatorState::display_switch`]
    pub display_switch: Option<DisplaySwitch>,
    /// See [`EmulatorState::control_switch`]
    pub control_switch: Option<ControlSwitch>,
    /// See [`EmulatorState::error_switch`]
    pub error_switch: Option<ErrorSwitch>,
    /// See [`EmulatorState::programmed_switch`]
    pub programmed_switch: Option<ProgrammedSwitch>,
    /// See [`EmulatorState::half_cycle_switch`]
    pub half_cycle_switch: Option<HalfCycleSwitch>,
    /// See [`EmulatorState::overflow_switch`]
    pub overflow_switch: Option<OverflowSwitch>,
    /// See [`EmulatorState::address_switches`]
    pub address_switches: Option<String>,
    /// See [`EmulatorState::address_register`]
    pub address_register: Option<String>,
    /// See [`EmulatorState::program_register`]
    pub program_register: Option<String>,
    /// See [`EmulatorState::distributor`]
    pub distributor: Option<String>,
    /// See [`EmulatorState::lower_accumulator`]
    pub lower_accumulator: Option<String>,
    /// See [`EmulatorState::upper_accumulator`]
    pub upper_accumulator: Option<String>,
    /// See [`EmulatorState::console_switches`]
    pub console_switches: Option<String>,
    /// See [`EmulatorState::programmed_stop`]
    pub programmed_stop: Option<bool>,
    /// See [`EmulatorState::overflow_stop`]
    pub overflow_stop: Option<bool>,
    /// See [`EmulatorState::half_cycle`]
    pub half_cycle: Option<bool>,
    /// See [`EmulatorState::overflow`]
    pub overflow: Option<bool>,
}

macro_rules! patch_fields {
    ($mac:ident) => {
        $mac!(
            initialized,
            running,
            yield_steps,
            display_switch,
            control_switch,
            error_switch,
            programmed_switch,
            half_cycle_switch,
            overflow_switch,
            address_switches,
            address_register,
            program_register,
            distributor,
            lower_accumulator,
            upper_accumulator,
            console_switches,
            programmed_stop,
            overflow_stop,
            half_cycle,
            overflow
        )
    };
}

impl StatePatch {
    /// Whether the patch changes nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Write every set field into `state` and recompute derived fields
    pub fn apply(self, state: &mut EmulatorState) {
        macro_rules! apply {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field {
                    state.$field = value;
                })*
            };
        }
        patch_fields!(apply);
        state.derive();
    }

    /// Combine two patches; fields set in `later` win
    #[must_use]
    pub fn merge(self, later: StatePatch) -> StatePatch {
        macro_rules! merge {
            ($($field:ident),*) => {
                StatePatch {
                    $($field: later.$field.or(self.$field),)*
                }
            };
        }
        patch_fields!(merge)
    }

    /// A patch touching the same fields as `self`, with values from `state`
    #[must_use]
    pub fn reverted(&self, state: &EmulatorState) -> StatePatch {
        macro_rules! revert {
            ($($field:ident),*) => {
                StatePatch {
                    $($field: self.$field.as_ref().map(|_| state.$field.clone()),)*
                }
            };
        }
        patch_fields!(revert)
    }

    /// Patch setting one register (flags take engine flag text)
    #[must_use]
    pub fn for_register(register: Register, value: &str) -> StatePatch {
        let flag = value.trim() == "1";
        let value = Some(value.to_string());
        match register {
            Register::Address => StatePatch {
                address_register: value,
                ..Self::default()
            },
            Register::Program => StatePatch {
                program_register: value,
                ..Self::default()
            },
            Register::Distributor => StatePatch {
                distributor: value,
                ..Self::default()
            },
            Register::LowerAccumulator => StatePatch {
                lower_accumulator: value,
                ..Self::default()
            },
            Register::UpperAccumulator => StatePatch {
                upper_accumulator: value,
                ..Self::default()
            },
            Register::ConsoleSwitches => StatePatch {
                console_switches: value,
                ..Self::default()
            },
            Register::ProgrammedStop => StatePatch {
                programmed_stop: Some(flag),
                ..Self::default()
            },
            Register::OverflowStop => StatePatch {
                overflow_stop: Some(flag),
                ..Self::default()
            },
            Register::HalfCycle => StatePatch {
                half_cycle: Some(flag),
                ..Self::default()
            },
            Register::Overflow => StatePatch {
                overflow: Some(flag),
                ..Self::default()
            },
        }
    }
}

impl From<&RegisterSnapshot> for StatePatch {
    fn from(snapshot: &RegisterSnapshot) -> Self {
        StatePatch {
            address_register: Some(snapshot.address_register.clone()),
            program_register: Some(snapshot.program_register.clone()),
            distributor: Some(snapshot.distributor.clone()),
            lower_accumulator: Some(snapshot.lower_accumulator.clone()),
            upper_accumulator: Some(snapshot.upper_accumulator.clone()),
            console_switches: Some(snapshot.console_switches.clone()),
            programmed_stop: Some(snapshot.programmed_stop),
            overflow_stop: Some(snapshot.overflow_stop),
            half_cycle: Some(snapshot.half_cycle),
            overflow: Some(snapshot.overflow),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_default_is_derived() {
        let state = EmulatorState::new(1000);
        assert_eq!(state.display_value(), ZERO_WORD);
        assert_eq!(state.operation_code(), "00");
        assert_eq!(state.yield_steps, 1000);
    }

    #[test]
    fn test_display_follows_switch() {
        let mut state = EmulatorState::default();
        StatePatch {
            lower_accumulator: Some("0000000007-".to_string()),
            upper_accumulator: Some("0000000003-".to_string()),
            distributor: Some("0000000042+".to_string()),
            ..StatePatch::default()
        }
        .apply(&mut state);

        let cases = [
            (DisplaySwitch::LowerAccumulator, "0000000007-"),
            (DisplaySwitch::UpperAccumulator, "0000000003-"),
            (DisplaySwitch::Distributor, "0000000042+"),
            (DisplaySwitch::ReadOut, "0000000042+"),
            (DisplaySwitch::ReadIn, "0000000042+"),
            (DisplaySwitch::ProgramRegister, ZERO_WORD),
        ];
        for (switch, expected) in cases {
            StatePatch {
                display_switch: Some(switch),
                ..StatePatch::default()
            }
            .apply(&mut state);
            assert_eq!(state.display_value(), expected, "{switch:?}");
        }
    }

    #[test]
    fn test_operation_code_from_program_register() {
        let mut state = EmulatorState::default();
        StatePatch::for_register(Register::Program, "6510001005+").apply(&mut state);
        assert_eq!(state.operation_code(), "65");
    }

    #[test]
    fn test_merge_later_wins() {
        let first = StatePatch {
            running: Some(true),
            distributor: Some("0000000001+".to_string()),
            ..StatePatch::default()
        };
        let second = StatePatch {
            distributor: Some("0000000002+".to_string()),
            ..StatePatch::default()
        };
        let merged = first.merge(second);
        assert_eq!(merged.running, Some(true));
        assert_eq!(merged.distributor.as_deref(), Some("0000000002+"));
    }

    #[test]
    fn test_reverted_touches_same_fields() {
        let previous = EmulatorState::default();
        let optimistic = StatePatch {
            programmed_switch: Some(ProgrammedSwitch::Stop),
            programmed_stop: Some(true),
            ..StatePatch::default()
        };
        let revert = optimistic.reverted(&previous);
        assert_eq!(revert.programmed_switch, Some(ProgrammedSwitch::Run));
        assert_eq!(revert.programmed_stop, Some(false));
        assert_eq!(revert.distributor, None);
    }

    #[test]
    fn test_flag_patch_from_text() {
        let patch = StatePatch::for_register(Register::HalfCycle, "1");
        assert_eq!(patch.half_cycle, Some(true));
        assert!(!patch.is_empty());
        assert!(StatePatch::default().is_empty());
    }
}
