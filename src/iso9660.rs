// Copyright 2021 Red Hat, Inc.
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

//! Minimal ISO 9660 parser, extended with just enough of Rock Ridge and
//! Joliet to resolve the real, lowercase, long file names base images
//! actually carry. Full SUSP continuation areas (`CE` entries) are not
//! supported: a Rock Ridge `NM` entry is read as a single non-continued
//! field, which is sufficient for every base image this service handles.
//!
//! The official specification is not free. The primary reference used
//! for this module is https://wiki.osdev.org/ISO_9660.

// An initial version of this module used the zerocopy crate to try to deserialize directly from
// the on-disk ISO file in with zero copying. It works, but it's non-trivial and the performance
// difference from just copying stuff didn't justify it.

// Many magic numbers corresponding to offsets and lengths have not been const-ified. It should be
// straightforward to see to what they correspond using the reference linked above.

use std::fs;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};

use crate::io::*;

// technically the standard supports others, but this is the only one we support
const ISO9660_SECTOR_SIZE: usize = 2048;

/// Size of the system area at the start of every ISO 9660 image, reserved
/// by the format and repurposed here to carry `OffsetRecord`s.
pub const SYSTEM_AREA_SIZE: usize = 32 * 1024;

#[derive(Debug, Serialize)]
pub struct IsoFs {
    descriptors: Vec<VolumeDescriptor>,
    /// Present when a Joliet Supplementary Volume Descriptor was found.
    /// When present, all name resolution prefers this tree over the
    /// primary one, since it carries real-case long names without relying
    /// on Rock Ridge.
    joliet_root: Option<Directory>,
    #[serde(skip_serializing)]
    file: fs::File,
}

impl IsoFs {
    pub fn from_file(mut file: fs::File) -> Result<Self> {
        let length = file.metadata()?.len();
        let descriptors = get_volume_descriptors(&mut file)?;
        let joliet_root = descriptors.iter().find_map(|d| match d {
            VolumeDescriptor::Supplementary(svd) if svd.is_joliet() => Some(svd.root.clone()),
            _ => None,
        });
        let iso_fs = Self {
            descriptors,
            joliet_root,
            file,
        };
        let primary = iso_fs.get_primary_volume_descriptor()?;
        if primary.volume_space_size * ISO9660_SECTOR_SIZE as u64 > length {
            bail!("ISO image is incomplete");
        }

        Ok(iso_fs)
    }

    pub fn as_file(&mut self) -> Result<&mut fs::File> {
        self.file
            .seek(SeekFrom::Start(0))
            .context("seeking to start of ISO")?;
        Ok(&mut self.file)
    }

    fn use_joliet(&self) -> bool {
        self.joliet_root.is_some()
    }

    pub fn get_root_directory(&self) -> Result<Directory> {
        if let Some(root) = &self.joliet_root {
            return Ok(root.clone());
        }
        let primary = self
            .get_primary_volume_descriptor()
            .context("getting root directory")?;
        Ok(primary.root.clone())
    }

    pub fn walk(&mut self) -> Result<IsoFsWalkIterator> {
        let root_dir = self.get_root_directory()?;
        let joliet = self.use_joliet();
        let buf = IsoFsIterator::new(&mut self.file, &root_dir, joliet)?;
        Ok(IsoFsWalkIterator {
            iso: &mut self.file,
            joliet,
            parent_dirs: Vec::new(),
            current_dir: Some(buf),
            dirpath: PathBuf::new(),
        })
    }

    /// Returns an iterator over the records of a directory.
    pub fn list_dir(&mut self, dir: &Directory) -> Result<IsoFsIterator> {
        IsoFsIterator::new(&mut self.file, dir, self.use_joliet())
    }

    /// Returns the record for a specific path.
    pub fn get_path(&mut self, path: &str) -> Result<DirectoryRecord> {
        let mut dir = self.get_root_directory()?;
        let mut components = path_components(path);
        let filename = match components.pop() {
            Some(f) => f,
            None => return Ok(DirectoryRecord::Directory(dir)),
        };

        for c in &components {
            dir = self
                .get_dir_record(&dir, c)?
                .ok_or_else(|| NotFound(format!("intermediate directory {} does not exist", c)))?
                .try_into_dir()
                .map_err(|_| {
                    NotFound(format!(
                        "component {:?} in path {} is not a directory",
                        c, path
                    ))
                })?;
        }

        self.get_dir_record(&dir, filename)?.ok_or_else(|| {
            anyhow!(NotFound(format!(
                "no record for {} in directory {}",
                filename,
                components.join("/")
            )))
        })
    }

    /// Returns the record for a specific name in a directory if it exists.
    /// The comparison is case-insensitive when resolving against the
    /// plain/Rock Ridge tree, since callers pass real-case logical paths
    /// regardless of which tree actually answers the lookup.
    fn get_dir_record(&mut self, dir: &Directory, name: &str) -> Result<Option<DirectoryRecord>> {
        for record in self
            .list_dir(dir)
            .with_context(|| format!("listing directory {}", dir.name))?
        {
            let record = record?;
            let entry_name = match &record {
                DirectoryRecord::Directory(d) => &d.name,
                DirectoryRecord::File(f) => &f.name,
            };
            if entry_name.eq_ignore_ascii_case(name) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Returns a reader for a file record.
    pub fn read_file(&mut self, file: &File) -> Result<impl Read + '_> {
        self.file
            .seek(SeekFrom::Start(file.address.as_offset()))
            .with_context(|| format!("seeking to file {}", file.name))?;
        Ok(BufReader::with_capacity(
            BUFFER_SIZE,
            (&self.file).take(file.length as u64),
        ))
    }

    /// Returns a writer for a file record.
    pub fn overwrite_file(&mut self, file: &File) -> Result<impl Write + '_> {
        self.file
            .seek(SeekFrom::Start(file.address.as_offset()))
            .with_context(|| format!("seeking to file {}", file.name))?;
        Ok(LimitWriter::new(
            &mut self.file,
            file.length as u64,
            format!("end of file {}", file.name),
        ))
    }

    fn get_primary_volume_descriptor(&self) -> Result<&PrimaryVolumeDescriptor> {
        for d in &self.descriptors {
            if let VolumeDescriptor::Primary(p) = d {
                return Ok(p);
            }
        }
        Err(anyhow!("no primary volume descriptor found in ISO"))
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum VolumeDescriptor {
    Boot(BootVolumeDescriptor),
    Primary(PrimaryVolumeDescriptor),
    Supplementary(SupplementaryVolumeDescriptor),
    Unknown { type_id: u8 },
}

#[derive(Debug, Serialize)]
struct BootVolumeDescriptor {
    boot_system_id: String,
    boot_id: String,
}

#[derive(Debug, Serialize)]
struct PrimaryVolumeDescriptor {
    system_id: String,
    volume_id: String,
    volume_space_size: u64,
    root: Directory,
}

#[derive(Debug, Serialize)]
struct SupplementaryVolumeDescriptor {
    #[serde(skip_serializing)]
    escape_sequences: Vec<u8>,
    volume_id: String,
    root: Directory,
}

impl SupplementaryVolumeDescriptor {
    /// Joliet is identified by one of three standard UCS-2 escape
    /// sequences in the descriptor's Escape Sequences field.
    fn is_joliet(&self) -> bool {
        const LEVEL1: [u8; 3] = [0x25, 0x2F, 0x40];
        const LEVEL2: [u8; 3] = [0x25, 0x2F, 0x43];
        const LEVEL3: [u8; 3] = [0x25, 0x2F, 0x45];
        self.escape_sequences.starts_with(&LEVEL1)
            || self.escape_sequences.starts_with(&LEVEL2)
            || self.escape_sequences.starts_with(&LEVEL3)
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DirectoryRecord {
    Directory(Directory),
    File(File),
}

impl DirectoryRecord {
    pub fn try_into_dir(self) -> Result<Directory> {
        match self {
            Self::Directory(d) => Ok(d),
            Self::File(f) => Err(anyhow!("entry {} is a file", f.name)),
        }
    }

    pub fn try_into_file(self) -> Result<File> {
        match self {
            Self::Directory(f) => Err(anyhow!("entry {} is a directory", f.name)),
            Self::File(f) => Ok(f),
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct Directory {
    pub name: String,
    pub address: Address,
    pub length: u32,
}

#[derive(Debug, Serialize, Clone)]
pub struct File {
    pub name: String,
    pub address: Address,
    pub length: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Address(u32);

impl Address {
    pub fn as_offset(&self) -> u64 {
        self.0 as u64 * ISO9660_SECTOR_SIZE as u64
    }

    pub fn as_sector(&self) -> u32 {
        self.0
    }
}

/// Requested path was not found.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct NotFound(String);

/// Reads all the volume descriptors.
fn get_volume_descriptors(f: &mut fs::File) -> Result<Vec<VolumeDescriptor>> {
    const ISO9660_VOLUME_DESCRIPTORS: Address = Address(0x10);
    f.seek(SeekFrom::Start(ISO9660_VOLUME_DESCRIPTORS.as_offset()))
        .context("seeking to volume descriptors")?;

    let mut descriptors: Vec<VolumeDescriptor> = Vec::new();
    while let Some(d) = get_next_volume_descriptor(f)
        .with_context(|| format!("getting volume descriptor #{}", descriptors.len() + 1))?
    {
        descriptors.push(d);
    }

    Ok(descriptors)
}

/// Reads the volume descriptor at cursor and advances to the next one.
fn get_next_volume_descriptor(f: &mut fs::File) -> Result<Option<VolumeDescriptor>> {
    const TYPE_BOOT: u8 = 0;
    const TYPE_PRIMARY: u8 = 1;
    const TYPE_SUPPLEMENTARY: u8 = 2;
    const TYPE_TERMINATOR: u8 = 255;

    let mut buf = vec![0; ISO9660_SECTOR_SIZE];
    f.read_exact(&mut buf)
        .context("reading volume descriptor")?;
    let buf = &mut Bytes::from(buf);

    Ok(match buf.get_u8() {
        TYPE_BOOT => Some(VolumeDescriptor::Boot(BootVolumeDescriptor::parse(buf)?)),
        TYPE_PRIMARY => Some(VolumeDescriptor::Primary(PrimaryVolumeDescriptor::parse(
            buf,
        )?)),
        TYPE_SUPPLEMENTARY => Some(VolumeDescriptor::Supplementary(
            SupplementaryVolumeDescriptor::parse(buf)?,
        )),
        TYPE_TERMINATOR => None,
        t => Some(VolumeDescriptor::Unknown { type_id: t }),
    })
}

impl BootVolumeDescriptor {
    /// Parses boot descriptor at cursor after type field.
    fn parse(buf: &mut Bytes) -> Result<Self> {
        verify_descriptor_header(buf).context("parsing boot descriptor")?;
        Ok(Self {
            boot_system_id: parse_iso9660_string(buf, 32, IsoString::StrA)
                .context("parsing boot system ID")?,
            boot_id: parse_iso9660_string(buf, 32, IsoString::StrA).context("parsing boot ID")?,
        })
    }
}

impl PrimaryVolumeDescriptor {
    /// Parses primary descriptor at cursor after type field.
    fn parse(buf: &mut Bytes) -> Result<Self> {
        verify_descriptor_header(buf).context("parsing primary descriptor")?;
        let system_id =
            parse_iso9660_string(eat(buf, 1), 32, IsoString::StrA).context("parsing system id")?;
        let volume_id = // technically should be StrD, but non-compliance is common
            parse_iso9660_string(buf, 32, IsoString::StrA).context("parsing volume id")?;
        eat(buf, 8); // Unused field always 0x00
        let volume_space_size = buf.get_u32_le() as u64;
        let root = match get_next_directory_record(eat(buf, 156 - 84), 34, true)? {
            Some(DirectoryRecord::Directory(d)) => d,
            _ => bail!("failed to parse root directory record from primary descriptor"),
        };
        Ok(Self {
            system_id,
            volume_id,
            volume_space_size,
            root,
        })
    }
}

impl SupplementaryVolumeDescriptor {
    /// Parses a supplementary descriptor at cursor after type field. The
    /// byte layout mirrors `PrimaryVolumeDescriptor::parse` exactly, except
    /// the string fields are UCS-2BE and the "unused" area at absolute
    /// offset 88 instead carries the Escape Sequences field.
    fn parse(buf: &mut Bytes) -> Result<Self> {
        verify_descriptor_header(buf).context("parsing supplementary descriptor")?;
        eat(buf, 1); // volume flags
        eat(buf, 32); // system id (UCS-2BE), not needed
        let volume_id = parse_ucs2_string(buf, 32).context("parsing joliet volume id")?;
        eat(buf, 8); // unused
        eat(buf, 4); // volume space size, LE (unused; primary descriptor is authoritative)
        eat(buf, 4); // volume space size, BE
        let escape_sequences = buf.copy_to_bytes(32).to_vec();
        let root = match get_next_directory_record(eat(buf, 36), 34, true)? {
            Some(DirectoryRecord::Directory(d)) => d,
            _ => bail!("failed to parse root directory record from supplementary descriptor"),
        };
        Ok(Self {
            escape_sequences,
            volume_id,
            root,
        })
    }
}

/// Verifies descriptor header at cursor.
fn verify_descriptor_header(buf: &mut Bytes) -> Result<()> {
    const VOLUME_DESCRIPTOR_ID: &[u8] = b"CD001";
    const VOLUME_DESCRIPTOR_VERSION: u8 = 1;

    let id = buf.copy_to_bytes(5);
    if id != VOLUME_DESCRIPTOR_ID {
        bail!("unknown descriptor ID: {:?}", id);
    }

    let version = buf.get_u8();
    if version != VOLUME_DESCRIPTOR_VERSION {
        bail!("unknown descriptor version: {}", version);
    }

    Ok(())
}

pub struct IsoFsIterator {
    dir: Bytes,
    length: u32,
    joliet: bool,
}

impl IsoFsIterator {
    fn new(iso: &mut fs::File, dir: &Directory, joliet: bool) -> Result<Self> {
        iso.seek(SeekFrom::Start(dir.address.as_offset()))
            .with_context(|| format!("seeking to directory {}", dir.name))?;

        let mut buf = vec![0; dir.length as usize];
        iso.read_exact(&mut buf)
            .with_context(|| format!("reading directory {}", dir.name))?;

        Ok(Self {
            dir: Bytes::from(buf),
            length: dir.length,
            joliet,
        })
    }
}

impl Iterator for IsoFsIterator {
    type Item = Result<DirectoryRecord>;
    fn next(&mut self) -> Option<Self::Item> {
        let result = if self.joliet {
            get_next_directory_record_joliet(&mut self.dir, self.length, false)
        } else {
            get_next_directory_record(&mut self.dir, self.length, false)
        };
        result.context("reading next record").transpose()
    }
}

pub struct IsoFsWalkIterator<'a> {
    iso: &'a mut fs::File,
    joliet: bool,
    parent_dirs: Vec<IsoFsIterator>,
    current_dir: Option<IsoFsIterator>,
    dirpath: PathBuf,
}

impl<'a> Iterator for IsoFsWalkIterator<'a> {
    type Item = Result<(String, DirectoryRecord)>;
    fn next(&mut self) -> Option<Self::Item> {
        self.walk_iterator_next().transpose()
    }
}

impl<'a> IsoFsWalkIterator<'a> {
    // This is simply split out of next() above for easier error-handling
    fn walk_iterator_next(&mut self) -> Result<Option<(String, DirectoryRecord)>> {
        while let Some(ref mut current_dir) = self.current_dir {
            match current_dir.next() {
                Some(Ok(r)) => {
                    // ideally, we'd return a ref and avoid cloning, but there's no way for an
                    // iterator to return a reference to data within itself
                    let mut path = self.dirpath.clone();
                    match &r {
                        DirectoryRecord::Directory(d) => {
                            self.parent_dirs.push(self.current_dir.take().unwrap());
                            self.dirpath.push(&d.name);
                            self.current_dir = Some(IsoFsIterator::new(self.iso, d, self.joliet)?);
                            path.push(&d.name);
                        }
                        DirectoryRecord::File(f) => path.push(&f.name),
                    };
                    // paths are all UTF-8
                    return Ok(Some((path.into_os_string().into_string().unwrap(), r)));
                }
                Some(Err(e)) => return Err(e),
                None => {
                    self.current_dir = self.parent_dirs.pop();
                    self.dirpath.pop();
                }
            }
        }
        Ok(None)
    }
}

/// Reads the directory record at cursor and advances to the next one.
/// Also resolves a Rock Ridge `NM` alternate-name entry from the system use
/// area when present, preferring it over the plain 8.3 name.
fn get_next_directory_record(
    buf: &mut Bytes,
    length: u32,
    is_root: bool,
) -> Result<Option<DirectoryRecord>> {
    loop {
        if !buf.has_remaining() {
            return Ok(None);
        }

        let len = buf.get_u8() as usize;
        if len == 0 {
            let jump = {
                // calculate where we are we in the directory
                let pos = length as usize - buf.remaining();
                // get distance to next 2k-aligned address
                ((pos + ISO9660_SECTOR_SIZE) & !(ISO9660_SECTOR_SIZE - 1)) - pos
            };
            if jump >= buf.remaining() {
                return Ok(None);
            }
            buf.advance(jump);
            continue;
        } else if len > buf.remaining() + 1 {
            // + 1 because len includes the length of the length byte
            // itself, which we already read
            bail!("incomplete directory record; corrupt ISO?");
        }

        let address = Address(eat(buf, 1).get_u32_le());
        let length = eat(buf, 4).get_u32_le();
        let flags = eat(buf, 25 - 14).get_u8();
        let name_length = eat(buf, 32 - 26).get_u8() as usize;
        let name = if name_length == 1 && (buf[0] == 0 || buf[0] == 1) {
            let c = buf.get_u8();
            if is_root && c == 0 {
                // as a special case, allow "." when reading the root directory
                // record from the primary volume descriptor
                Some(".".into())
            } else {
                // "." or ".."
                None
            }
        } else {
            Some(
                parse_iso9660_string(buf, name_length, IsoString::File)
                    .context("parsing record name")?,
            )
        };

        // A padding byte follows the name field only when its length is even.
        let remaining_len = len - (33 + name_length);
        let mut system_use = buf.copy_to_bytes(remaining_len);
        if name_length % 2 == 0 && !system_use.is_empty() {
            system_use.advance(1);
        }
        let rr_name = parse_rock_ridge_name(&mut system_use);

        if let Some(mut name) = name {
            if let Some(rr_name) = rr_name {
                name = rr_name;
            }
            if flags & 2 > 0 {
                return Ok(Some(DirectoryRecord::Directory(Directory {
                    name,
                    address,
                    length,
                })));
            } else {
                return Ok(Some(DirectoryRecord::File(File {
                    name,
                    address,
                    length,
                })));
            }
        }
    }
}

/// Like `get_next_directory_record`, but for the Joliet tree: names are
/// UCS-2BE and there is no Rock Ridge system use area to consult.
fn get_next_directory_record_joliet(
    buf: &mut Bytes,
    length: u32,
    is_root: bool,
) -> Result<Option<DirectoryRecord>> {
    loop {
        if !buf.has_remaining() {
            return Ok(None);
        }

        let len = buf.get_u8() as usize;
        if len == 0 {
            let pos = length as usize - buf.remaining();
            let jump = ((pos + ISO9660_SECTOR_SIZE) & !(ISO9660_SECTOR_SIZE - 1)) - pos;
            if jump >= buf.remaining() {
                return Ok(None);
            }
            buf.advance(jump);
            continue;
        } else if len > buf.remaining() + 1 {
            bail!("incomplete directory record; corrupt ISO?");
        }

        let address = Address(eat(buf, 1).get_u32_le());
        let length = eat(buf, 4).get_u32_le();
        let flags = eat(buf, 25 - 14).get_u8();
        let name_length = eat(buf, 32 - 26).get_u8() as usize;
        let name = if name_length == 1 && (buf[0] == 0 || buf[0] == 1) {
            let c = buf.get_u8();
            if is_root && c == 0 {
                Some(".".into())
            } else {
                None
            }
        } else {
            Some(parse_ucs2_string(buf, name_length).context("parsing joliet record name")?)
        };
        eat(buf, len - (33 + name_length));

        if let Some(name) = name {
            if flags & 2 > 0 {
                return Ok(Some(DirectoryRecord::Directory(Directory {
                    name,
                    address,
                    length,
                })));
            } else {
                return Ok(Some(DirectoryRecord::File(File {
                    name,
                    address,
                    length,
                })));
            }
        }
    }
}

/// Scans a directory record's system use area for a SUSP `NM` (alternate
/// name) entry and returns its decoded content, if any. Only a single,
/// non-continued `NM` entry is supported (no `CE` continuation areas).
fn parse_rock_ridge_name(buf: &mut Bytes) -> Option<String> {
    let mut name: Option<String> = None;
    while buf.remaining() >= 4 {
        let sig = [buf[0], buf[1]];
        let entry_len = buf[2] as usize;
        if entry_len < 4 || entry_len > buf.remaining() {
            break;
        }
        if &sig == b"NM" && entry_len >= 5 {
            let content_len = entry_len - 5;
            let content = &buf[5..5 + content_len];
            if let Ok(s) = std::str::from_utf8(content) {
                match &mut name {
                    Some(existing) => existing.push_str(s),
                    None => name = Some(s.to_string()),
                }
            }
        }
        buf.advance(entry_len);
    }
    name
}

#[allow(unused)]
enum IsoString {
    StrA,
    StrD,
    File,
}

/// Reads an ISO9660 string.
fn parse_iso9660_string(buf: &mut Bytes, len: usize, kind: IsoString) -> Result<String> {
    // References:
    // https://wiki.osdev.org/ISO_9660#String_format
    // https://github.com/torvalds/linux/blob/ddf21bd8ab984ccaa924f090fc7f515bb6d51414/fs/isofs/dir.c#L17
    const FILE_CHARS: [u8; 17] = *b"!\"%&'()*+,-.:<=>?"; // full file chars set includes D-chars
    const A_CHARS: [u8; 2] = *b";/"; // full A-chars includes file chars set
    if len > buf.remaining() {
        bail!("incomplete string name; corrupt ISO?");
    }
    let mut s = String::with_capacity(len);
    let mut bytes = buf.copy_to_bytes(len);
    if matches!(kind, IsoString::File) {
        if bytes.ends_with(b";1") {
            bytes.truncate(bytes.len() - 2);
        }
        if bytes.ends_with(b".") {
            bytes.truncate(bytes.len() - 1);
        }
    }
    for byte in &bytes {
        #[allow(clippy::if_same_then_else)] // I find it easier to follow this way
        if byte.is_ascii_alphabetic() || byte.is_ascii_digit() || *byte == b'_' || *byte == b' ' {
            s.push(char::from(*byte));
        } else if FILE_CHARS.contains(byte) && matches!(kind, IsoString::File | IsoString::StrA) {
            s.push(char::from(*byte));
        } else if A_CHARS.contains(byte) && matches!(kind, IsoString::StrA) {
            s.push(char::from(*byte));
        } else if A_CHARS.contains(byte) && matches!(kind, IsoString::File) {
            s.push('.'); // this matches what the kernel does
        } else if *byte == 0 {
            break;
        } else {
            bail!("invalid string name {:?}", bytes);
        }
    }
    if matches!(kind, IsoString::StrA | IsoString::StrD) {
        s.truncate(s.trim_end_matches(' ').len());
    }
    Ok(s)
}

/// Decodes a UCS-2BE (Joliet) string field, stopping at the first NUL
/// codepoint, stripping a trailing ISO9660 `;1` version suffix, and
/// trimming trailing spaces the way `parse_iso9660_string` does for StrA/StrD.
fn parse_ucs2_string(buf: &mut Bytes, len: usize) -> Result<String> {
    if len > buf.remaining() {
        bail!("incomplete UCS-2 string; corrupt ISO?");
    }
    let bytes = buf.copy_to_bytes(len);
    let mut s = String::with_capacity(len / 2);
    for chunk in bytes.chunks_exact(2) {
        let codepoint = u16::from_be_bytes([chunk[0], chunk[1]]);
        if codepoint == 0 {
            break;
        }
        if let Some(c) = char::from_u32(codepoint as u32) {
            s.push(c);
        }
    }
    if let Some(stripped) = s.strip_suffix(";1") {
        s = stripped.to_string();
    }
    s.truncate(s.trim_end_matches(' ').len());
    Ok(s)
}

fn eat(buf: &mut Bytes, n: usize) -> &mut Bytes {
    buf.advance(n);
    buf
}

/// Parse path into a Vec<&str> with zero or more components.  Convert path
/// to relative and resolve all "." and ".." components.
fn path_components(s: &str) -> Vec<&str> {
    // empty paths are treated the same as "/" to allow round-tripping
    use std::path::Component::*;
    let mut ret = Vec::new();
    for c in Path::new(s).components() {
        match c {
            Prefix(_) | RootDir | CurDir => (),
            ParentDir => {
                ret.pop();
            }
            Normal(c) => {
                ret.push(c.to_str().unwrap()); // `s` is &str
            }
        }
    }
    ret
}

/// Returns the absolute byte offset of `logical_path`'s extent within the
/// ISO at `iso_path`.
pub fn get_file_location(iso_path: &Path, logical_path: &str) -> Result<u64> {
    let file = fs::File::open(iso_path)
        .with_context(|| format!("opening {}", iso_path.display()))?;
    let mut iso = IsoFs::from_file(file)?;
    let record = iso
        .get_path(logical_path)
        .with_context(|| format!("locating {logical_path}"))?;
    let file_record = record
        .try_into_file()
        .map_err(|_| anyhow!(NotFound(format!("{logical_path} is a directory"))))?;
    Ok(file_record.address.as_offset())
}

/// Returns the data length recorded for `logical_path` within the ISO at
/// `iso_path`.
pub fn get_file_size(iso_path: &Path, logical_path: &str) -> Result<u64> {
    let file = fs::File::open(iso_path)
        .with_context(|| format!("opening {}", iso_path.display()))?;
    let mut iso = IsoFs::from_file(file)?;
    let record = iso
        .get_path(logical_path)
        .with_context(|| format!("locating {logical_path}"))?;
    let file_record = record
        .try_into_file()
        .map_err(|_| anyhow!(NotFound(format!("{logical_path} is a directory"))))?;
    Ok(file_record.length as u64)
}

/// Returns the trimmed Primary Volume Descriptor volume identifier field.
pub fn volume_identifier(iso_path: &Path) -> Result<String> {
    let file = fs::File::open(iso_path)
        .with_context(|| format!("opening {}", iso_path.display()))?;
    let iso = IsoFs::from_file(file)?;
    Ok(iso.get_primary_volume_descriptor()?.volume_id.clone())
}

/// Reads the first `SYSTEM_AREA_SIZE` bytes of the ISO at `iso_path`.
pub fn read_system_area(iso_path: &Path) -> Result<[u8; SYSTEM_AREA_SIZE]> {
    let mut buf = [0u8; SYSTEM_AREA_SIZE];
    let mut file =
        fs::File::open(iso_path).with_context(|| format!("opening {}", iso_path.display()))?;
    file.read_exact(&mut buf)
        .context("reading system area")?;
    Ok(buf)
}

/// Writes `bytes` at `offset` within the system area, refusing to write
/// past `SYSTEM_AREA_SIZE`.
pub fn write_system_area_range(iso_path: &Path, offset: u64, bytes: &[u8]) -> Result<()> {
    if offset
        .checked_add(bytes.len() as u64)
        .map(|end| end > SYSTEM_AREA_SIZE as u64)
        .unwrap_or(true)
    {
        bail!(
            "write of {} bytes at offset {} would extend past the {}-byte system area",
            bytes.len(),
            offset,
            SYSTEM_AREA_SIZE
        );
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(iso_path)
        .with_context(|| format!("opening {}", iso_path.display()))?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes).context("writing system area range")?;
    Ok(())
}
