use std::fmt;

use crate::sampler::ProbeError;

/// Label published for a device after evaluating its presence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    On,
    Off,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::On => "ON",
            Outcome::Off => "OFF",
        }
    }
}

impl From<bool> for Outcome {
    fn from(present: bool) -> Self {
        if present { Outcome::On } else { Outcome::Off }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one check. A failed check still carries a definite `present`.
#[derive(Debug)]
pub struct ProbeOutcome {
    pub present: bool,
    pub error: Option<ProbeError>,
}

impl ProbeOutcome {
    pub fn present() -> Self {
        ProbeOutcome {
            present: true,
            error: None,
        }
    }

    pub fn absent() -> Self {
        ProbeOutcome {
            present: false,
            error: None,
        }
    }

    pub fn failed(error: ProbeError) -> Self {
        ProbeOutcome {
            present: false,
            error: Some(error),
        }
    }
}
