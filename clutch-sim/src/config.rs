//! Simulation configuration and command-line parsing.

use std::fmt;
use std::str::FromStr;

use clutch_api::{Error, Result};

/// Built-in workload scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Interactive, default, and background groups plus one RT thread
    Mixed,
    /// A foreground band warping past backlogged background groups
    Warp,
    /// Heavy foreground load against a single background thread
    Starvation,
    /// Periodic real-time threads against a timeshare interloper
    Rt,
    /// A bound thread contending with unbound work on its processor
    Bound,
    /// The mixed workload scaled across several processors
    Smp,
}

impl Scenario {
    pub const ALL: [Scenario; 6] = [
        Scenario::Mixed,
        Scenario::Warp,
        Scenario::Starvation,
        Scenario::Rt,
        Scenario::Bound,
        Scenario::Smp,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::Mixed => "mixed",
            Scenario::Warp => "warp",
            Scenario::Starvation => "starvation",
            Scenario::Rt => "rt",
            Scenario::Bound => "bound",
            Scenario::Smp => "smp",
        }
    }
}

impl FromStr for Scenario {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Scenario::ALL
            .into_iter()
            .find(|sc| sc.name() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown scenario '{}'", s)))
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub scenario: Scenario,
    /// Simulated duration in microseconds
    pub duration_us: u64,
    pub cpus: usize,
    pub seed: u64,
    /// Print trace lines and raise the log level to trace
    pub trace: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            scenario: Scenario::Mixed,
            duration_us: 1_000_000,
            cpus: 1,
            seed: 1,
            trace: false,
        }
    }
}

impl SimConfig {
    /// Parse command-line arguments (without the program name).
    pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let mut config = SimConfig::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--scenario" => {
                    let value = args
                        .next()
                        .ok_or_else(|| Error::InvalidArgument("--scenario needs a value".into()))?;
                    config.scenario = value.parse()?;
                }
                "--duration" => {
                    config.duration_us = parse_number(&mut args, "--duration")?;
                }
                "--cpus" => {
                    config.cpus = parse_number(&mut args, "--cpus")? as usize;
                    if config.cpus == 0 {
                        return Err(Error::InvalidArgument("--cpus must be at least 1".into()));
                    }
                }
                "--seed" => {
                    config.seed = parse_number(&mut args, "--seed")?;
                }
                "--trace" => config.trace = true,
                other => {
                    return Err(Error::InvalidArgument(format!("unknown flag '{}'", other)));
                }
            }
        }
        Ok(config)
    }
}

fn parse_number<I: Iterator<Item = String>>(args: &mut I, flag: &str) -> Result<u64> {
    let value = args
        .next()
        .ok_or_else(|| Error::InvalidArgument(format!("{} needs a value", flag)))?;
    value
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("{}: '{}' is not a number", flag, value)))
}
