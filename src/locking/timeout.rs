// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wait budgets for contended keys and where they are configured.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// How long a caller is willing to wait for a contended key.
///
/// Written as `"250ms"`, `"5s"`, bare seconds (`"5"`) or `"infinite"` in
/// configuration files, environment variables and on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LockTimeoutValue {
    Finite(Duration),
    Infinite,
}

impl LockTimeoutValue {
    pub const ZERO: LockTimeoutValue = LockTimeoutValue::Finite(Duration::ZERO);

    pub const fn from_secs(seconds: u64) -> Self {
        Self::Finite(Duration::from_secs(seconds))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self::Finite(Duration::from_millis(millis))
    }

    /// `Duration::MAX` stands in for an infinite budget.
    pub fn as_duration(&self) -> Duration {
        match *self {
            Self::Finite(duration) => duration,
            Self::Infinite => Duration::MAX,
        }
    }

    pub fn is_infinite(&self) -> bool {
        *self == Self::Infinite
    }

    pub fn is_zero(&self) -> bool {
        self.as_duration().is_zero()
    }
}

impl From<Duration> for LockTimeoutValue {
    fn from(duration: Duration) -> Self {
        Self::Finite(duration)
    }
}

impl fmt::Display for LockTimeoutValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Infinite => f.write_str("infinite"),
            Self::Finite(duration) if duration.subsec_millis() == 0 => {
                write!(f, "{}s", duration.as_secs())
            }
            Self::Finite(duration) => write!(f, "{}ms", duration.as_millis()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Lock timeout value '{input}' is invalid. Use seconds ('5' or '5s'), milliseconds ('250ms') \
     or the word 'infinite'."
)]
pub struct LockTimeoutParseError {
    input: String,
}

impl FromStr for LockTimeoutValue {
    type Err = LockTimeoutParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let input = value.trim();
        let lowered = input.to_ascii_lowercase();
        if lowered == "infinite" {
            return Ok(Self::Infinite);
        }

        let (digits, to_value): (&str, fn(u64) -> Self) = match lowered.strip_suffix("ms") {
            Some(millis) => (millis, Self::from_millis),
            None => (lowered.strip_suffix('s').unwrap_or(&lowered), Self::from_secs),
        };

        digits
            .trim()
            .parse::<u64>()
            .map(to_value)
            .map_err(|_| LockTimeoutParseError {
                input: input.to_string(),
            })
    }
}

impl TryFrom<String> for LockTimeoutValue {
    type Error = LockTimeoutParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LockTimeoutValue> for String {
    fn from(value: LockTimeoutValue) -> Self {
        value.to_string()
    }
}

pub fn parse_timeout_override(value: &str) -> Result<LockTimeoutValue, LockTimeoutParseError> {
    value.parse()
}

/// Where the effective timeout came from, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockTimeoutSource {
    Cli,
    Environment,
    Config,
    #[default]
    Default,
}

impl fmt::Display for LockTimeoutSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cli => "CLI flag",
            Self::Environment => "environment variable",
            Self::Config => "configuration file",
            Self::Default => "built-in default",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeoutResolution {
    pub value: LockTimeoutValue,
    pub source: LockTimeoutSource,
}

/// Picks the timeout from the strongest source that sets one.
///
/// Textual overrides (CLI, then environment) are parsed and win over the
/// configured value. The configured value counts as coming from the
/// configuration only when it differs from the built-in default.
#[derive(Debug, Clone, Copy)]
pub struct LockTimeoutResolver<'a> {
    overrides: [(LockTimeoutSource, Option<&'a str>); 2],
    configured: LockTimeoutValue,
    builtin: LockTimeoutValue,
}

impl<'a> LockTimeoutResolver<'a> {
    pub fn new(
        cli_override: Option<&'a str>,
        env_override: Option<&'a str>,
        configured: LockTimeoutValue,
        builtin: LockTimeoutValue,
    ) -> Self {
        Self {
            overrides: [
                (LockTimeoutSource::Cli, cli_override),
                (LockTimeoutSource::Environment, env_override),
            ],
            configured,
            builtin,
        }
    }

    pub fn resolve(self) -> Result<LockTimeoutResolution, LockTimeoutParseError> {
        for (source, text) in self.overrides {
            if let Some(text) = text {
                return Ok(LockTimeoutResolution {
                    value: text.parse()?,
                    source,
                });
            }
        }

        Ok(LockTimeoutResolution {
            value: self.configured,
            source: if self.configured == self.builtin {
                LockTimeoutSource::Default
            } else {
                LockTimeoutSource::Config
            },
        })
    }
}
