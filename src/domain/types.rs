//! Shared domain enumerations aligned with persisted column values.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a render job in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Generating,
    Complete,
    TooComplex,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Generating,
        JobStatus::Complete,
        JobStatus::TooComplex,
        JobStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Generating => "generating",
            JobStatus::Complete => "complete",
            JobStatus::TooComplex => "too_complex",
            JobStatus::Failed => "failed",
        }
    }

    /// `complete` and `too_complex` never leave their state.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::TooComplex)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for JobStatus {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "generating" => Ok(JobStatus::Generating),
            "complete" => Ok(JobStatus::Complete),
            "too_complex" => Ok(JobStatus::TooComplex),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(()),
        }
    }
}

/// Palette applied to the smoothed iteration count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColourScheme {
    #[default]
    Rainbow,
    Greyscale,
    Fire,
    Default,
}

impl ColourScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            ColourScheme::Rainbow => "rainbow",
            ColourScheme::Greyscale => "greyscale",
            ColourScheme::Fire => "fire",
            ColourScheme::Default => "default",
        }
    }
}

impl Display for ColourScheme {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColourScheme {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rainbow" => Ok(Self::Rainbow),
            "greyscale" | "grayscale" => Ok(Self::Greyscale),
            "fire" => Ok(Self::Fire),
            "default" | "hsl" => Ok(Self::Default),
            _ => Err(()),
        }
    }
}

/// Role attached to a verified requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            _ => Err(()),
        }
    }
}
