// Copyright 2024 The Lattice Project Contributors
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

//! Common types and utilities shared by the lattice crates.

#![warn(missing_docs, missing_debug_implementations)]

mod failures_cache;
pub mod identifiers;

pub use failures_cache::FailuresCache;
pub use identifiers::{DeviceId, IdParseError, RoomId, ServerName, TransactionId, UserId};
