// Copyright 2022 Singularity Data
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire types for the `cellstore.v1` table data protocol.
//!
//! The message and stub definitions here mirror the service protos and are
//! consumed as-is by the client crate. Field numbering and naming follow the
//! wire contract; the client core never constructs RPCs without going through
//! these types.

pub mod v1;
