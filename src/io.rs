// Copyright 2019 CoreOS, Inc.
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

//! Small I/O building blocks shared across the ISO mutation engine.

use anyhow::Result;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

// The default BufReader/BufWriter buffer size is 8 KiB, which isn't large
// enough to fully amortize system call overhead.
// https://github.com/rust-lang/rust/issues/49921
pub const BUFFER_SIZE: usize = 256 * 1024;

/// A `Write` adapter that fails if more than `length` bytes are written to
/// it, used to guarantee a splice write never spills past its reserved area.
pub struct LimitWriter<W: Write> {
    sink: W,
    length: u64,
    remaining: u64,
    conflict: String,
}

impl<W: Write> LimitWriter<W> {
    pub fn new(sink: W, length: u64, conflict: String) -> Self {
        Self {
            sink,
            length,
            remaining: length,
            conflict,
        }
    }
}

impl<W: Write> Write for LimitWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let allowed = self.remaining.min(buf.len() as u64);
        if allowed == 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("collision with {} at offset {}", self.conflict, self.length),
            ));
        }
        let count = self.sink.write(&buf[..allowed as usize])?;
        self.remaining = self
            .remaining
            .checked_sub(count as u64)
            .expect("wrote more bytes than allowed");
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

/// An owned scratch directory, removed on drop even on early return or
/// panic unwinding. Generalizes the teacher's per-file use of
/// `tempfile::Builder`/`tempfile()` to whole directory trees, since template
/// building needs an extraction tree rather than a single scratch file.
pub struct ScratchDir {
    dir: tempfile::TempDir,
}

impl ScratchDir {
    pub fn new_in(parent: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(&parent)?;
        let dir = tempfile::Builder::new()
            .prefix(".image-service-scratch-")
            .tempdir_in(parent)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, p: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_writer() {
        let data: Vec<u8> = (0..100).collect();
        let mut outbuf: Vec<u8> = Vec::new();
        let mut lim = LimitWriter::new(&mut outbuf, 90, "foo".into());
        assert_eq!(
            lim.write_all(&data).unwrap_err().to_string(),
            "collision with foo at offset 90"
        );
    }

    #[test]
    fn test_scratch_dir_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let path = {
            let scratch = ScratchDir::new_in(parent.path()).unwrap();
            let p = scratch.path().to_path_buf();
            assert!(p.exists());
            p
        };
        assert!(!path.exists());
    }
}
