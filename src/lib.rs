// Copyright 2025 Google LLC
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

pub mod channel;
pub mod client;
pub mod endpoint;
pub mod error;
pub mod format;
pub mod handle;
pub mod logging;
pub mod prelude;
pub mod protocol;
pub mod ring;
pub mod session;
pub mod sink;
pub mod url;
pub mod wire;
