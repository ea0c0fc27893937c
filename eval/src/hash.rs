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

//! Stable fingerprints.
//!
//! Cache validity depends on these hashes agreeing across processes and
//! platforms for the same inputs, so everything routes through SipHash-2-4
//! with fixed keys and gets folded to the 32 bits the cache format stores.

use std::hash::Hasher;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use siphasher::sip::SipHasher24;

const KEY0: u64 = 0x7175_6572_6e20_6576;
const KEY1: u64 = 0x616c_7561_746f_7231;

fn fold(hash: u64) -> i32 {
    (hash ^ (hash >> 32)) as u32 as i32
}

/// Stable 32-bit hash of an i32 sequence, sensitive to both contents and
/// order.
pub fn ordered_hash<I: IntoIterator<Item = i32>>(items: I) -> i32 {
    let mut hasher = SipHasher24::new_with_keys(KEY0, KEY1);
    let mut len: u64 = 0;
    for item in items {
        hasher.write_i32(item);
        len += 1;
    }
    hasher.write_u64(len);
    fold(hasher.finish())
}

/// Structural hash of a serialized value. `serde_json` keeps object keys
/// sorted, so equal values serialize equally.
pub fn hash_json(value: &serde_json::Value) -> i32 {
    let mut hasher = SipHasher24::new_with_keys(KEY0, KEY1);
    hasher.write(value.to_string().as_bytes());
    fold(hasher.finish())
}

/// Serializes with the 4-space indentation all persisted JSON uses.
pub(crate) fn write_json_pretty<W: Write, T: Serialize>(
    writer: W,
    value: &T,
) -> serde_json::Result<()> {
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(writer, formatter);
    value.serialize(&mut ser)
}

/// Writes JSON to `path` via a sibling temp file and rename, so readers
/// never observe a half-written record.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    write_json_pretty(&mut buf, value)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &buf)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
