use std::io::{self, BufRead};
use std::path::Path;

use anyhow::Context;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::FleetError;

const SUPPORTED_VERSION: u32 = 1;
const BUILTIN: &str = include_str!("../../data/fatal_markers.json");

/// Log substrings that classify a startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalMarkers {
    pub version: u32,
    /// Line fragment announcing the game is ready.
    pub ready: String,
    pub fatal: Vec<String>,
    /// Known candidates kept on record but never matched.
    #[serde(default)]
    pub disabled: Vec<String>,
}

impl FatalMarkers {
    pub fn builtin() -> anyhow::Result<Self> {
        Self::parse(BUILTIN).context("built-in fatal markers are invalid")
    }

    /// Loads `path` when given, otherwise the built-in set.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Self::builtin();
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fatal markers {}", path.display()))?;
        let markers = Self::parse(&content)
            .with_context(|| format!("invalid fatal markers {}", path.display()))?;
        debug!(
            "loaded {} fatal markers from {}",
            markers.fatal.len(),
            path.display()
        );
        Ok(markers)
    }

    fn parse(content: &str) -> anyhow::Result<Self> {
        let markers: FatalMarkers = serde_json::from_str(content)?;
        if markers.version != SUPPORTED_VERSION {
            return Err(FleetError::validation(format!(
                "unsupported fatal marker version {} (expected {})",
                markers.version, SUPPORTED_VERSION
            ))
            .into());
        }
        Ok(markers)
    }

    pub fn is_ready(&self, log: &str) -> bool {
        log.contains(&self.ready)
    }

    /// Streams a log line by line until the ready line is found.
    pub fn scan_ready(&self, reader: impl BufRead) -> io::Result<bool> {
        for line in reader.split(b'\n') {
            if self.is_ready(&String::from_utf8_lossy(&line?)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// First fatal marker found in a log excerpt.
    pub fn find_fatal<'a>(&'a self, log: &str) -> Option<&'a str> {
        self.fatal
            .iter()
            .find(|marker| log.contains(marker.as_str()))
            .map(String::as_str)
    }
}
