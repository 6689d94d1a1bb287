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

use crate::config::KeylockConfig;
use crate::error::Result;
use crate::locking::LockTimeoutResolution;

pub struct ConfigCommand<'a> {
    config: &'a KeylockConfig,
    timeout: &'a LockTimeoutResolution,
}

impl<'a> ConfigCommand<'a> {
    pub fn new(config: &'a KeylockConfig, timeout: &'a LockTimeoutResolution) -> Result<Self> {
        Ok(Self { config, timeout })
    }

    pub fn execute(&self, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(self.config)?);
        } else {
            print!("{}", self.config.to_toml_string()?);
        }
        eprintln!(
            "# effective lock timeout: {} (from {})",
            self.timeout.value, self.timeout.source
        );
        Ok(())
    }
}
