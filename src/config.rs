// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Client configuration, loaded from TOML. Every field has a default, so an
//! empty file is a valid configuration.

use crate::TakePolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// How a session removes tuples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TakeMode {
    /// Two-phase reservation across every replica.
    Quorum,
    /// Totally ordered through a sequencer.
    Sequenced,
}

impl Default for TakeMode {
    fn default() -> Self {
        TakeMode::Quorum
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TakeConfig {
    /// Backoff retries before a take gives up.
    pub max_retries: u32,
    /// One backoff time slot, in milliseconds.
    pub slot_ms: u64,
    /// Fixed delay after a partial majority or an empty intersection.
    pub settle_delay_ms: u64,
    pub empty_intersection_consumes_budget: bool,
}

impl Default for TakeConfig {
    fn default() -> Self {
        TakeConfig {
            max_retries: 5,
            slot_ms: 1000,
            settle_delay_ms: 500,
            empty_intersection_consumes_budget: false,
        }
    }
}

impl TakeConfig {
    pub fn policy(&self) -> TakePolicy {
        TakePolicy {
            max_retries: self.max_retries,
            empty_intersection_consumes_budget: self.empty_intersection_consumes_budget,
        }
    }

    pub fn slot(&self) -> Duration {
        Duration::from_millis(self.slot_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name the replicas are registered under.
    pub service_name: String,
    /// Restricts lookup to replicas with this qualifier.
    pub qualifier: Option<String>,
    /// Times a command is retried with fresh descriptors after a
    /// transport failure.
    pub rpc_retries: u32,
    pub take_mode: TakeMode,
    pub first_sequence: u64,
    pub take: TakeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            service_name: "TupleSpaces".to_string(),
            qualifier: None,
            rpc_retries: 0,
            take_mode: TakeMode::default(),
            first_sequence: 1,
            take: TakeConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Config::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}
