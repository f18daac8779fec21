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

//! Stream Composer: given a template file and per-request overlays,
//! produces a logical byte stream that is the template with overlays
//! spliced in at their recorded offsets, per spec.md §4.6.
//!
//! This generalizes the teacher's `live/embed.rs` `Region`/`Stream`
//! machinery (write modified byte regions in place, in offset order) from
//! "rewrite this file" to "never touch the file; answer reads, including
//! ranged reads, against a logical view of it with these regions spliced
//! in." `ComposedStream` precomputes the splice regions once per request;
//! `open_range` then answers any `[start, end)` sub-range of that logical
//! view by interleaving direct reads of the template file with the
//! in-memory splice bytes, without ever materializing the whole stream.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use bytes::Bytes;

use crate::config::{CpuArchitecture, ImageType};
use crate::error::{Result, ServiceError};
use crate::ignition::encode_ignition_payload;
use crate::karg::{self, format_karg_line};
use crate::template::Template;

/// Per-request customization, per spec.md §3. `ramdisk_bytes`/`extra_kargs`
/// are rejected upstream for s390x (spec.md §6); this module doesn't special
/// case the architecture itself, since by the time a `Template` exists for a
/// `VersionKey` the Image Store has already refused to build one for s390x.
#[derive(Debug, Clone, Default)]
pub struct Overlay {
    pub ignition_bytes: Vec<u8>,
    pub ramdisk_bytes: Option<Vec<u8>>,
    pub extra_kargs: Vec<String>,
}

/// One splice: `contents` replaces the template's own bytes over
/// `[offset, offset + contents.len())`. Regions must be non-overlapping and
/// sorted by `offset` before being handed to [`ComposedStream`].
#[derive(Debug, Clone)]
struct SpliceRegion {
    offset: u64,
    contents: Bytes,
}

/// The template file plus a resolved, sorted set of splice regions for one
/// request. Cheap to build (no file content is read except the small karg
/// config files); cheap to clone-free share across ranged sub-reads since
/// [`open_range`](ComposedStream::open_range) just opens a fresh file
/// descriptor, per spec.md §5's "fresh file descriptor per request" model
/// applied per Range sub-request too.
#[derive(Debug, Clone)]
pub struct ComposedStream {
    template_path: std::path::PathBuf,
    total_len: u64,
    regions: Vec<SpliceRegion>,
}

impl ComposedStream {
    /// Builds the composed view for one request: resolves the ignition and
    /// (for `minimal` responses) ramdisk splice regions from `template`, and
    /// the karg splice regions (if any) by scanning `template`'s file for
    /// [`karg::karg_files`] and locating each one's embed line.
    pub fn build(template: &Template, overlay: &Overlay, image_type: ImageType) -> Result<Self> {
        let total_len = fs::metadata(&template.path)
            .map_err(|e| ServiceError::Io(format!("statting template {}: {e}", template.path.display())))?
            .len();

        let mut regions = Vec::new();

        let ignition_payload = encode_ignition_payload(&overlay.ignition_bytes)
            .map_err(|e| ServiceError::Io(format!("encoding ignition payload: {e:#}")))?;
        if ignition_payload.len() as u64 > template.ignition_length {
            return Err(ServiceError::OverlayTooLarge(format!(
                "ignition payload is {} bytes, area holds {}",
                ignition_payload.len(),
                template.ignition_length
            )));
        }
        regions.push(SpliceRegion {
            offset: template.ignition_offset,
            contents: pad(ignition_payload, template.ignition_length),
        });

        if matches!(image_type, ImageType::Minimal) {
            let ramdisk_payload = overlay.ramdisk_bytes.clone().unwrap_or_default();
            if ramdisk_payload.len() as u64 > template.ramdisk_length {
                return Err(ServiceError::OverlayTooLarge(format!(
                    "ramdisk payload is {} bytes, area holds {}",
                    ramdisk_payload.len(),
                    template.ramdisk_length
                )));
            }
            regions.push(SpliceRegion {
                offset: template.ramdisk_offset,
                contents: pad(ramdisk_payload, template.ramdisk_length),
            });
        }

        if !overlay.extra_kargs.is_empty() {
            let karg_files = karg::karg_files(&template.path)
                .map_err(|e| ServiceError::Malformed(format!("scanning template for karg files: {e:#}")))?;
            let line = format_karg_line(&overlay.extra_kargs);
            for logical_path in karg_files {
                let (offset, length) = karg::karg_embed_region(&template.path, &logical_path)
                    .map_err(|e| ServiceError::Malformed(format!("locating karg area in {logical_path}: {e:#}")))?;
                if line.len() as u64 > length {
                    return Err(ServiceError::OverlayTooLarge(format!(
                        "kargs line is {} bytes, area in {logical_path} holds {}",
                        line.len(),
                        length
                    )));
                }
                regions.push(SpliceRegion {
                    offset,
                    contents: pad_front(line.clone().into_bytes(), length),
                });
            }
        }

        regions.sort_by_key(|r| r.offset);
        for pair in regions.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.offset + a.contents.len() as u64 > b.offset {
                return Err(ServiceError::Malformed(format!(
                    "overlapping splice regions at offsets {} and {}",
                    a.offset, b.offset
                )));
            }
        }

        Ok(Self {
            template_path: template.path.clone(),
            total_len,
            regions,
        })
    }

    /// Total length of the logical stream. Always equal to the template
    /// file's own length: splicing never changes the byte count, per
    /// spec.md §8's `len(response) == len(template)` invariant.
    pub fn len(&self) -> u64 {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    /// Opens a reader over `[start, end)` of the logical stream. Opens a
    /// fresh file descriptor onto the template, per spec.md §5's scoped
    /// per-request acquisition model; the descriptor is closed when the
    /// returned reader is dropped.
    pub fn open_range(&self, start: u64, end: u64) -> Result<ComposedReader> {
        if start > end || end > self.total_len {
            return Err(ServiceError::Io(format!(
                "invalid range [{start}, {end}) for stream of length {}",
                self.total_len
            )));
        }
        let file = fs::File::open(&self.template_path)
            .map_err(|e| ServiceError::Io(format!("opening template {}: {e}", self.template_path.display())))?;
        Ok(ComposedReader {
            file,
            chunks: build_chunks(&self.regions, start, end),
            active: None,
        })
    }
}

fn pad(mut bytes: Vec<u8>, length: u64) -> Bytes {
    bytes.resize(length as usize, 0);
    Bytes::from(bytes)
}

/// Right-aligns `bytes` within `length`, padding the front with zero bytes.
/// Used for the karg embed region so the replacement line's trailing `\n`
/// stays adjacent to the marker line, matching the on-disk layout where the
/// embed line immediately precedes `#### COREOS_KARG_EMBED_AREA`.
fn pad_front(bytes: Vec<u8>, length: u64) -> Bytes {
    let length = length as usize;
    if bytes.len() >= length {
        return Bytes::from(bytes);
    }
    let mut padded = vec![0u8; length - bytes.len()];
    padded.extend_from_slice(&bytes);
    Bytes::from(padded)
}

enum Chunk {
    File { offset: u64, len: u64 },
    Mem(Bytes),
}

/// Splits the window `[start, end)` into an ordered sequence of chunks,
/// alternating template-file byte ranges with in-memory splice bytes
/// wherever a region overlaps the window. `regions` must already be sorted
/// by offset and non-overlapping.
fn build_chunks(regions: &[SpliceRegion], start: u64, end: u64) -> VecDeque<Chunk> {
    let mut chunks = VecDeque::new();
    let mut cursor = start;
    for region in regions {
        let region_start = region.offset;
        let region_end = region.offset + region.contents.len() as u64;
        if region_end <= cursor || region_start >= end {
            continue;
        }
        if region_start > cursor {
            chunks.push_back(Chunk::File {
                offset: cursor,
                len: region_start - cursor,
            });
            cursor = region_start;
        }
        let overlap_start = cursor.max(region_start);
        let overlap_end = region_end.min(end);
        let rel_start = (overlap_start - region_start) as usize;
        let rel_end = (overlap_end - region_start) as usize;
        chunks.push_back(Chunk::Mem(region.contents.slice(rel_start..rel_end)));
        cursor = overlap_end;
    }
    if cursor < end {
        chunks.push_back(Chunk::File {
            offset: cursor,
            len: end - cursor,
        });
    }
    chunks
}

enum Active {
    File { remaining: u64 },
    Mem { data: Bytes, pos: usize },
}

/// A `Read` over one `[start, end)` window of a [`ComposedStream`]'s logical
/// view. Synchronous by design, like every other I/O path in the mutation
/// engine; the HTTP layer drives it from a blocking task, matching the
/// teacher's synchronous-core-under-an-async-shell shape.
pub struct ComposedReader {
    file: fs::File,
    chunks: VecDeque<Chunk>,
    active: Option<Active>,
}

impl Read for ComposedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.active.is_none() {
                match self.chunks.pop_front() {
                    None => return Ok(0),
                    Some(Chunk::File { offset, len }) => {
                        self.file.seek(SeekFrom::Start(offset))?;
                        self.active = Some(Active::File { remaining: len });
                    }
                    Some(Chunk::Mem(data)) => {
                        self.active = Some(Active::Mem { data, pos: 0 });
                    }
                }
            }
            match self.active.as_mut().expect("just set") {
                Active::File { remaining } => {
                    if *remaining == 0 {
                        self.active = None;
                        continue;
                    }
                    let want = (*remaining).min(buf.len() as u64) as usize;
                    let n = self.file.read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "template file ended before expected splice window",
                        ));
                    }
                    *remaining -= n as u64;
                    return Ok(n);
                }
                Active::Mem { data, pos } => {
                    if *pos >= data.len() {
                        self.active = None;
                        continue;
                    }
                    let n = (data.len() - *pos).min(buf.len());
                    buf[..n].copy_from_slice(&data[*pos..*pos + n]);
                    *pos += n;
                    return Ok(n);
                }
            }
        }
    }
}

/// Used by the Karg Encoder invariant and the PXE-initrd path: architectures
/// other than s390x support kargs and custom ramdisks; this lives here
/// rather than in `config` since it's only ever consulted on the splice
/// path.
pub fn rejects_overlay_extras(arch: CpuArchitecture) -> bool {
    arch.is_s390x()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IGNITION_PADDING, RAMDISK_PADDING};
    use crate::ignition::decode_ignition_payload;
    use crate::template::{FakeImageEngine, ImageEngine};

    fn build_fake_template(arch: CpuArchitecture) -> (tempfile::TempDir, Template) {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("template.iso");
        let template = FakeImageEngine
            .build_template(&dir.path().join("unused.iso"), &output, dir.path(), "http://example/rootfs.img", arch)
            .unwrap();
        (dir, template)
    }

    fn read_all(stream: &ComposedStream) -> Vec<u8> {
        let mut out = Vec::new();
        stream.open_range(0, stream.len()).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_ignition_splice_full_iso_preserves_length() {
        let (_dir, template) = build_fake_template(CpuArchitecture::X86_64);
        let overlay = Overlay {
            ignition_bytes: b"someignitioncontent".to_vec(),
            ramdisk_bytes: None,
            extra_kargs: Vec::new(),
        };
        let composed = ComposedStream::build(&template, &overlay, ImageType::Full).unwrap();
        assert_eq!(composed.len(), fs::metadata(&template.path).unwrap().len());

        let out = read_all(&composed);
        assert_eq!(out.len() as u64, composed.len());

        let ignition_area = &out[template.ignition_offset as usize
            ..(template.ignition_offset + template.ignition_length) as usize];
        let payload_len = encode_ignition_payload(b"someignitioncontent").unwrap().len();
        assert_eq!(
            decode_ignition_payload(&ignition_area[..payload_len]).unwrap(),
            b"someignitioncontent"
        );
        assert!(ignition_area[payload_len..].iter().all(|b| *b == 0));

        // full.iso never splices the ramdisk area.
        let ramdisk_area = &out[template.ramdisk_offset as usize
            ..(template.ramdisk_offset + template.ramdisk_length) as usize];
        assert!(ramdisk_area.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_ramdisk_splice_minimal_iso() {
        let (_dir, template) = build_fake_template(CpuArchitecture::X86_64);
        let overlay = Overlay {
            ignition_bytes: b"x".to_vec(),
            ramdisk_bytes: Some(b"someramdiskcontent".to_vec()),
            extra_kargs: Vec::new(),
        };
        let composed = ComposedStream::build(&template, &overlay, ImageType::Minimal).unwrap();
        let out = read_all(&composed);
        let ramdisk_area = &out[template.ramdisk_offset as usize
            ..(template.ramdisk_offset + template.ramdisk_length) as usize];
        let trimmed: Vec<u8> = ramdisk_area
            .iter()
            .rev()
            .skip_while(|b| **b == 0)
            .rev()
            .copied()
            .collect();
        assert_eq!(trimmed, b"someramdiskcontent");
    }

    #[test]
    fn test_empty_ramdisk_is_all_zero() {
        let (_dir, template) = build_fake_template(CpuArchitecture::X86_64);
        let overlay = Overlay {
            ignition_bytes: b"x".to_vec(),
            ramdisk_bytes: Some(Vec::new()),
            extra_kargs: Vec::new(),
        };
        let composed = ComposedStream::build(&template, &overlay, ImageType::Minimal).unwrap();
        let out = read_all(&composed);
        let ramdisk_area = &out[template.ramdisk_offset as usize
            ..(template.ramdisk_offset + template.ramdisk_length) as usize];
        assert!(ramdisk_area.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_overlay_too_large() {
        let (_dir, template) = build_fake_template(CpuArchitecture::X86_64);
        let overlay = Overlay {
            ignition_bytes: vec![0u8; IGNITION_PADDING as usize * 2],
            ramdisk_bytes: None,
            extra_kargs: Vec::new(),
        };
        let err = ComposedStream::build(&template, &overlay, ImageType::Full).unwrap_err();
        assert!(matches!(err, ServiceError::OverlayTooLarge(_)));
    }

    #[test]
    fn test_ramdisk_too_large() {
        let (_dir, template) = build_fake_template(CpuArchitecture::X86_64);
        let overlay = Overlay {
            ignition_bytes: b"x".to_vec(),
            ramdisk_bytes: Some(vec![0u8; RAMDISK_PADDING as usize + 1]),
            extra_kargs: Vec::new(),
        };
        let err = ComposedStream::build(&template, &overlay, ImageType::Minimal).unwrap_err();
        assert!(matches!(err, ServiceError::OverlayTooLarge(_)));
    }

    #[test]
    fn test_ranged_read_matches_full_read() {
        let (_dir, template) = build_fake_template(CpuArchitecture::X86_64);
        let overlay = Overlay {
            ignition_bytes: b"someignitioncontent".to_vec(),
            ramdisk_bytes: Some(b"someramdiskcontent".to_vec()),
            extra_kargs: Vec::new(),
        };
        let composed = ComposedStream::build(&template, &overlay, ImageType::Minimal).unwrap();
        let full = read_all(&composed);

        // A range squarely inside the ignition splice region.
        let start = template.ignition_offset + 5;
        let end = template.ignition_offset + 50;
        let mut ranged = Vec::new();
        composed.open_range(start, end).unwrap().read_to_end(&mut ranged).unwrap();
        assert_eq!(ranged, full[start as usize..end as usize]);

        // A range straddling the boundary between plain template bytes and
        // the ramdisk splice region.
        let start = template.ramdisk_offset - 10;
        let end = template.ramdisk_offset + 10;
        let mut ranged = Vec::new();
        composed.open_range(start, end).unwrap().read_to_end(&mut ranged).unwrap();
        assert_eq!(ranged, full[start as usize..end as usize]);
    }

    #[test]
    fn test_karg_splice() {
        let dir = tempfile::tempdir().unwrap();
        let base_iso = dir.path().join("base.iso");
        let cfg_contents = format!(
            "set timeout=5\n#### default kargs here                                       \n{}\nmenuentry ...\n",
            karg::KARG_EMBED_MARKER
        );
        let image = crate::iso9660::tests::build_synthetic_iso_tree(&[
            ("isolinux/isolinux.cfg", cfg_contents.as_bytes()),
            ("images/ignition.img", &vec![0u8; IGNITION_PADDING as usize]),
        ]);
        std::fs::write(&base_iso, &image).unwrap();

        // Build a template whose ignition/ramdisk offsets and lengths refer
        // into this synthetic tree, and whose karg file is the isolinux.cfg
        // entry above. FakeImageEngine doesn't model a karg area, so this
        // test builds the Template by hand against the synthetic ISO.
        let ignition_offset = crate::iso9660::get_file_location(&base_iso, "images/ignition.img").unwrap();
        let template = Template {
            path: base_iso.clone(),
            ignition_layout: crate::template::IgnitionLayout::Classical,
            ignition_offset,
            ignition_length: IGNITION_PADDING,
            ramdisk_offset: ignition_offset,
            ramdisk_length: 0,
        };

        let overlay = Overlay {
            ignition_bytes: b"x".to_vec(),
            ramdisk_bytes: None,
            extra_kargs: vec!["p1".into(), "p1".into(), "key=value".into()],
        };
        let composed = ComposedStream::build(&template, &overlay, ImageType::Full).unwrap();
        let out = read_all(&composed);
        let rewritten = String::from_utf8(out).unwrap();
        assert!(rewritten.contains(&format!(" p1 p1 key=value\n{}", karg::KARG_EMBED_MARKER)));
    }
}
