/*
 * Copyright 2026 The quern project developers
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Chronological run traces.
//!
//! The parallel driver streams one complete-duration event per finished
//! group into the Chrome Trace Event Format, so a run can be dropped
//! straight into a flame-chart viewer.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;

#[derive(Serialize)]
struct TraceEvent<'a> {
    name: &'a str,
    cat: &'a str,
    ph: &'a str,
    ts: u64,
    dur: u64,
    pid: u32,
    tid: u32,
    args: Vec<&'a str>,
}

/// Streaming Chrome trace writer: opens with `[`, separates events with
/// `,\n`, closes with `]`.
pub(crate) struct ChromeProfile {
    file: BufWriter<File>,
    any_written: bool,
    tids: HashMap<String, u32>,
}

impl ChromeProfile {
    pub fn new(path: &Path) -> io::Result<ChromeProfile> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(b"[")?;
        Ok(ChromeProfile {
            file,
            any_written: false,
            tids: HashMap::new(),
        })
    }

    fn tid_of(&mut self, thread: &str) -> u32 {
        let next = self.tids.len() as u32 + 1;
        *self.tids.entry(thread.to_owned()).or_insert(next)
    }

    /// Records one complete-duration event. Trace output is best-effort;
    /// write errors are swallowed.
    pub fn log(&mut self, name: &str, ts: u64, dur: u64, thread: &str, cached: bool) {
        let tid = self.tid_of(thread);
        let event = TraceEvent {
            name,
            cat: "default",
            ph: "X",
            ts,
            dur,
            pid: 1,
            tid,
            args: vec![if cached { "cached" } else { "" }],
        };
        if self.any_written {
            let _ = self.file.write_all(b",\n");
        }
        self.any_written = true;
        let _ = serde_json::to_writer(&mut self.file, &event);
    }

    pub fn close(&mut self) {
        let _ = self.file.write_all(b"]");
        let _ = self.file.flush();
    }
}
