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

//! Gzip+cpio framing of a single-entry ignition payload.
//!
//! The teacher's `io/initrd.rs` builds a multi-entry, XZ-compressed `newc`
//! CPIO archive for the initramfs it embeds (`Initrd::to_bytes`). This
//! service's ignition payload is always exactly one file, `config.ign`, and
//! uses gzip rather than xz per spec.md §6, so this module is a narrower
//! sibling of that one rather than a reuse of `Initrd` itself.

use anyhow::{bail, Context, Result};
use cpio::{write_cpio, NewcBuilder, NewcReader};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Cursor, Read};

pub const IGNITION_ENTRY_NAME: &str = "config.ign";

/// Builds the gzip-compressed, single-entry `newc` CPIO archive this
/// service embeds as the ignition payload.
pub fn encode_ignition_payload(ignition_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    write_cpio(
        std::iter::once((
            NewcBuilder::new(IGNITION_ENTRY_NAME).mode(0o100_644),
            Cursor::new(ignition_bytes),
        )),
        &mut encoder,
    )
    .context("writing ignition CPIO archive")?;
    encoder.finish().context("closing gzip compressor")
}

/// Decodes a payload produced by [`encode_ignition_payload`] back to the raw
/// `config.ign` bytes, used by the round-trip test in spec.md §8 and
/// available to operational tooling that wants to inspect a built template.
pub fn decode_ignition_payload(payload: &[u8]) -> Result<Vec<u8>> {
    let mut decompressed = Vec::new();
    GzDecoder::new(payload)
        .read_to_end(&mut decompressed)
        .context("decompressing gzip ignition payload")?;
    let mut reader =
        NewcReader::new(Cursor::new(decompressed)).context("reading ignition CPIO entry")?;
    let entry = reader.entry();
    if entry.is_trailer() {
        bail!("ignition CPIO archive has no entries");
    }
    if entry.name() != IGNITION_ENTRY_NAME {
        bail!(
            "unexpected ignition CPIO entry name '{}', expected '{}'",
            entry.name(),
            IGNITION_ENTRY_NAME
        );
    }
    let mut contents = Vec::with_capacity(entry.file_size() as usize);
    reader
        .read_to_end(&mut contents)
        .context("reading ignition CPIO entry contents")?;
    Ok(contents)
}
