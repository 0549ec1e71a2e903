// Copyright (c) 2026 Driftsync
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Hybrid logical clock. One instance per node; physical time is supplied
//! by the caller so the clock itself stays deterministic and testable.

use crate::core::types::Hlc;

/// Node-local hybrid logical clock.
///
/// The clock never regresses: both `now` and `receive` produce timestamps
/// strictly greater than everything previously issued or accepted. Seed it
/// from persisted state on restart to keep that guarantee across runs.
#[derive(Clone, Debug, Default)]
pub struct HlcClock {
    current: Hlc,
}

impl HlcClock {
    /// Fresh clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a persisted timestamp.
    pub fn from_persisted(current: Hlc) -> Self {
        Self { current }
    }

    /// Last issued or accepted timestamp.
    pub fn current(&self) -> Hlc {
        self.current
    }

    /// Timestamp for a local event.
    pub fn now(&mut self, physical_now_ms: u64) -> Hlc {
        let p = self.current.physical_ms.max(physical_now_ms);
        let next = if p == self.current.physical_ms {
            Self::bump_logical(p, self.current.logical)
        } else {
            Hlc {
                physical_ms: p,
                logical: 0,
            }
        };
        self.current = next;
        next
    }

    /// Advance past a remote timestamp on accepting incoming entries.
    /// Subsequent local writes are causally after everything merged.
    pub fn receive(&mut self, remote: Hlc, physical_now_ms: u64) -> Hlc {
        let p = self
            .current
            .physical_ms
            .max(remote.physical_ms)
            .max(physical_now_ms);

        let next = if p == self.current.physical_ms && p == remote.physical_ms {
            Self::bump_logical(p, self.current.logical.max(remote.logical))
        } else if p == self.current.physical_ms {
            Self::bump_logical(p, self.current.logical)
        } else if p == remote.physical_ms {
            Self::bump_logical(p, remote.logical)
        } else {
            Hlc {
                physical_ms: p,
                logical: 0,
            }
        };
        self.current = next;
        next
    }

    // Logical counter is 16 bits; on exhaustion the physical component
    // absorbs the carry so the total order stays strict.
    fn bump_logical(physical_ms: u64, logical: u16) -> Hlc {
        match logical.checked_add(1) {
            Some(l) => Hlc {
                physical_ms,
                logical: l,
            },
            None => Hlc {
                physical_ms: physical_ms + 1,
                logical: 0,
            },
        }
    }
}
