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

use log::warn;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Shared flag a waiting acquisition checks after every wake-up.
///
/// Clones observe the same flag, so one clone can be handed to a waiter while
/// another is kept by whoever decides to interrupt it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

static TERMINATION_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

fn install_termination_flag() -> Arc<AtomicBool> {
    let raised = Arc::new(AtomicBool::new(false));
    for &signal in TERM_SIGNALS {
        if let Err(err) = flag::register(signal, Arc::clone(&raised)) {
            warn!("Could not watch signal {signal} for cancellation: {err}");
        }
    }
    raised
}

/// Token that flips once the process is asked to terminate.
///
/// Handlers are installed on first use and stay for the life of the process.
pub fn signal_token() -> CancellationToken {
    CancellationToken {
        flag: Arc::clone(TERMINATION_FLAG.get_or_init(install_termination_flag)),
    }
}
