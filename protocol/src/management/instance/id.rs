use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MIN_INSTANCE_ID: u8 = 1;
pub const MAX_INSTANCE_ID: u8 = 99;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InstanceIdError {
    #[error("Invalid server number: {0}")]
    OutOfRange(i64),
    #[error("Invalid server number: {0:?}")]
    NotANumber(String),
}

/// Instance number, always within `1..=99`.
///
/// Every path and port of an instance is derived from this number, so it is
/// validated once at the edge and passed around as this type afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct InstanceId(u8);

impl InstanceId {
    pub fn new(number: i64) -> Result<Self, InstanceIdError> {
        if number < MIN_INSTANCE_ID as i64 || number > MAX_INSTANCE_ID as i64 {
            return Err(InstanceIdError::OutOfRange(number));
        }
        Ok(Self(number as u8))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Two digit form used in directory names (`ds07`, `.wine07`).
    pub fn padded(self) -> String {
        format!("{:02}", self.0)
    }

    pub fn all() -> impl Iterator<Item = InstanceId> {
        (MIN_INSTANCE_ID..=MAX_INSTANCE_ID).map(InstanceId)
    }
}

impl TryFrom<i64> for InstanceId {
    type Error = InstanceIdError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<InstanceId> for u8 {
    fn from(value: InstanceId) -> Self {
        value.0
    }
}

impl FromStr for InstanceId {
    type Err = InstanceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number = s
            .trim()
            .parse::<i64>()
            .map_err(|_| InstanceIdError::NotANumber(s.to_string()))?;
        Self::new(number)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
