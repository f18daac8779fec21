// Copyright 2024 Red Hat, Inc.
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

pub mod bootloader;
pub mod compose;
pub mod config;
pub mod download;
pub mod error;
pub mod http;
pub mod ignition;
pub mod io;
pub mod iso;
pub mod iso9660;
pub mod karg;
pub mod pxe;
pub mod store;
pub mod template;
pub mod upstream;
pub mod util;

pub use error::{Result, ServiceError};
