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

use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use uuid::Uuid;

/// Identity of the execution context holding a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerId {
    Thread(ThreadId),
    Token(String),
}

impl OwnerId {
    pub fn current_thread() -> Self {
        OwnerId::Thread(thread::current().id())
    }

    pub fn token<S: Into<String>>(value: S) -> Self {
        OwnerId::Token(value.into())
    }

    /// A fresh token that no other caller can collide with.
    pub fn random() -> Self {
        OwnerId::Token(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerId::Thread(id) => write!(f, "{id:?}"),
            OwnerId::Token(token) => write!(f, "token:{token}"),
        }
    }
}

/// Computes the owner identity for requests that do not name one.
pub type OwnerResolver = Arc<dyn Fn() -> OwnerId + Send + Sync>;

pub fn thread_owner_resolver() -> OwnerResolver {
    Arc::new(OwnerId::current_thread)
}
