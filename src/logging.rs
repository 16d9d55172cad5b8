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

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::Once;

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::prelude::*;

/// Log-level filter, read once at library init.
pub const LOG_ENV_VAR: &str = "DIGISTREAM_LOG";

fn default_log_file() -> Option<PathBuf> {
    home::home_dir().map(|dir| dir.join(".digistream.log"))
}

/// Initialize the process-wide subscriber: stderr at the level from
/// `DIGISTREAM_LOG` (default WARN), plus a DEBUG file sink under the home
/// directory when one can be created. Idempotent; a subscriber installed by
/// the embedding application wins.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
            .unwrap_or_else(|_| EnvFilter::new(Level::WARN.to_string()));

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        let file_layer = default_log_file()
            .and_then(|path| File::create(path).ok())
            .map(|file| {
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_thread_ids(true)
                    .with_writer(Mutex::new(file).with_max_level(Level::DEBUG))
                    .boxed()
            });

        let registry = tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer);
        let result = match file_layer {
            Some(layer) => registry.with(layer).try_init(),
            None => registry.try_init(),
        };
        // Failure means the application already installed a subscriber.
        drop(result);
    });
}
