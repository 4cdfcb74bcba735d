// Copyright 2024 Kevin Ludwig
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

mod crypt;
mod file;
mod format;
mod header;
mod node;

use std::sync::Mutex;

use log::error;
use pika_ds::FlashStorage;
use pika_err::IoError;
use pika_fs::{Error, FileInfo, FileSystem, FsError, FsInfo, Result};

use crate::{
    crypt::RecordCipher,
    file::{display_name, File},
    format::{name_bytes, FileHeader, GRAIN, RECORD_HEADER_LEN, SECTOR_COUNT_MASK},
    node::NodeTree,
};

#[derive(Debug, Clone, Copy)]
pub struct MountParams {
    /// Byte offset of the region inside the device, sector-aligned.
    pub region_offset: u32,
    pub region_size: u32,
    /// Erase unit of the device; a multiple of the 32-byte header grain.
    pub sector_size: u32,
    /// Key for files allocated with encryption; opaque to the rest of the
    /// file system.
    pub encrypt_key: Option<[u8; 16]>,
}

/// Wear-leveled record file system for raw NOR flash. Stores fixed-size
/// time-series records in preallocated circular files and keeps the newest
/// records across power cuts.
///
/// Every operation is serialized under one lock and brackets its flash
/// traffic in a single power-on window.
pub struct FileSystemServer<DS: FlashStorage> {
    pub(crate) storage: DS,
    pub(crate) offset: u32,
    pub(crate) size: u32,
    pub(crate) sector_size: u32,
    pub(crate) cipher: Option<RecordCipher>,
    state: Mutex<Inner>,
}

pub(crate) struct Inner {
    /// Live header region, 0 or 1.
    pub live: u32,
    pub filecnt: u32,
    /// Next file generation number; seeded past every on-flash generation
    /// at mount so rewrites never reuse one.
    pub next_uid: u32,
    pub nodes: NodeTree,
}

struct PowerGuard<'ds, DS: FlashStorage> {
    storage: &'ds DS,
}

impl<DS: FlashStorage> Drop for PowerGuard<'_, DS> {
    fn drop(&mut self) {
        self.storage.power(false);
    }
}

impl<DS: FlashStorage> FileSystemServer<DS> {
    pub fn new(storage: DS, params: MountParams) -> Result<Self> {
        if params.sector_size < 2 * GRAIN || params.sector_size % GRAIN != 0 {
            error!(
                "Sector size ({}) shall be a multiple of the {GRAIN} byte grain",
                params.sector_size
            );
            return Err(FsError::Invalid.into());
        }
        if params.region_offset % params.sector_size != 0 {
            error!("Region offset ({}) shall be sector-aligned", params.region_offset);
            return Err(FsError::Invalid.into());
        }
        if params.region_size < 3 * params.sector_size {
            error!(
                "Region size ({}) shall hold two header sectors and data",
                params.region_size
            );
            return Err(FsError::Invalid.into());
        }

        let server = Self {
            storage,
            offset: params.region_offset,
            size: params.region_size,
            sector_size: params.sector_size,
            cipher: params.encrypt_key.map(RecordCipher::new),
            state: Mutex::new(Inner {
                live: 0,
                filecnt: 0,
                next_uid: 0,
                nodes: NodeTree::new(),
            }),
        };
        {
            let mut state = server.state.lock().unwrap();
            let _power = server.power_on();
            server.check_fs(&mut state)?;
            let next_uid = server.seed_uid(&state)?;
            state.next_uid = next_uid;
        }
        Ok(server)
    }

    fn seed_uid(&self, state: &Inner) -> Result<u32> {
        let mut next = 0;
        for index in 0..state.filecnt {
            let grain = self.read_file_grain(state.live, index)?;
            next = next.max(grain.uid.get() + 1);
        }
        Ok(next)
    }

    fn power_on(&self) -> PowerGuard<'_, DS> {
        self.storage.power(true);
        PowerGuard {
            storage: &self.storage,
        }
    }

    pub(crate) fn read_at(&self, offset: u32, buffer: &mut [u8]) -> Result<()> {
        let done = self
            .storage
            .read(self.offset as u64 + offset as u64, buffer)?;
        if done != buffer.len() {
            return Err(IoError::Incomplete.into());
        }
        Ok(())
    }

    pub(crate) fn write_at(&self, offset: u32, buffer: &[u8]) -> Result<()> {
        let done = self
            .storage
            .write(self.offset as u64 + offset as u64, buffer)?;
        if done != buffer.len() {
            return Err(IoError::Incomplete.into());
        }
        Ok(())
    }

    pub(crate) fn erase_at(&self, offset: u32) -> Result<()> {
        self.storage
            .erase_sector(self.offset as u64 + offset as u64)?;
        Ok(())
    }

    /// Sectors a file of this geometry needs: its records rounded up to
    /// whole sectors, plus one so the ring always has room to rotate.
    fn sectors_needed(&self, file_size: u32, record_size: u32) -> u32 {
        let records = (file_size / record_size) as u64;
        let bytes = records * (record_size as u64 + RECORD_HEADER_LEN as u64);
        bytes.div_ceil(self.sector_size as u64) as u32 + 1
    }

    /// Creates a file over `sectors` preallocated sectors placed right
    /// after the last file, erases them, and commits the new file header.
    pub fn allocate(
        &self,
        name: &str,
        sectors: u32,
        file_size: u32,
        record_size: u32,
        encrypted: bool,
    ) -> Result<()> {
        let Some(name) = name_bytes(name) else {
            error!("File name shall be 1 to 8 bytes with no '/'");
            return Err(FsError::Invalid.into());
        };
        if record_size == 0 || record_size > file_size {
            error!("Record size ({record_size}) shall be within [1, {file_size}]");
            return Err(FsError::Invalid.into());
        }
        if sectors < 2 || sectors > SECTOR_COUNT_MASK {
            error!("Sector count ({sectors}) shall be within [2, {SECTOR_COUNT_MASK}]");
            return Err(FsError::Invalid.into());
        }
        if self.sectors_needed(file_size, record_size) > sectors {
            error!("{sectors} sectors cannot hold {file_size} bytes of records");
            return Err(FsError::Invalid.into());
        }
        if encrypted && self.cipher.is_none() {
            error!("No key mounted for an encrypted file");
            return Err(FsError::Invalid.into());
        }

        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let _power = self.power_on();

        if self.find_file_grain(state, &name)?.is_some() {
            return Err(FsError::AlreadyExists.into());
        }
        if state.filecnt >= self.max_file_count() {
            return Err(FsError::NoSpace.into());
        }

        let sector = if state.filecnt > 0 {
            let last = self.read_file_grain(state.live, state.filecnt - 1)?;
            last.sector.get() + last.sector_count()
        } else {
            2 * self.header_size() / self.sector_size
        };
        if (sector + sectors) as u64 * self.sector_size as u64 > self.size as u64 {
            return Err(FsError::NoSpace.into());
        }

        for index in 0..sectors {
            self.erase_at((sector + index) * self.sector_size)?;
        }

        let grain = FileHeader::new(
            name,
            sector,
            sectors,
            file_size,
            record_size,
            state.next_uid,
            encrypted,
        );
        state.next_uid += 1;
        self.commit_update(state, None, Some(&grain))
    }

    /// Changes a file's geometry within its preallocated sectors. The
    /// content is lost: the data sectors are erased and the file starts a
    /// new generation.
    pub fn resize(&self, id: u32, file_size: u32, record_size: u32) -> Result<()> {
        if record_size == 0 || record_size > file_size {
            error!("Record size ({record_size}) shall be within [1, {file_size}]");
            return Err(FsError::Invalid.into());
        }

        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let name = match state.nodes.file(id) {
            Some(file) => file.header.name,
            None => return Err(FsError::NotFound.into()),
        };
        let _power = self.power_on();

        let Some((index, current)) = self.find_file_grain(state, &name)? else {
            return Err(FsError::NotFound.into());
        };
        if self.sectors_needed(file_size, record_size) > current.sector_count() {
            error!(
                "File {} cannot grow past its {} preallocated sectors",
                display_name(&name),
                current.sector_count()
            );
            return Err(FsError::Invalid.into());
        }

        for at in 0..current.sector_count() {
            self.erase_at((current.sector.get() + at) * self.sector_size)?;
        }

        let grain = FileHeader::new(
            name,
            current.sector.get(),
            current.sector_count(),
            file_size,
            record_size,
            state.next_uid,
            current.encrypted(),
        );
        state.next_uid += 1;
        self.commit_update(state, Some((index, &grain)), None)?;

        if let Some(file) = state.nodes.file_mut(id) {
            file.header = grain;
            self.scan_file(file)?;
        }
        Ok(())
    }

    pub fn info(&self, id: u32) -> Result<FileInfo> {
        let state = self.state.lock().unwrap();
        let file = state.nodes.file(id).ok_or(FsError::NotFound)?;
        Ok(FileInfo {
            sectors: file.header.sector_count(),
            file_size: file.header.file_size.get(),
            record_size: file.header.record_size.get(),
            record_count: file.recordcnt,
        })
    }

    pub fn fs_info(&self) -> FsInfo {
        let state = self.state.lock().unwrap();
        FsInfo {
            size: self.size,
            sector_size: self.sector_size,
            file_limit: self.max_file_count(),
            file_count: state.filecnt,
        }
    }

    /// Erases the whole region and reformats it empty. Refused while any
    /// descriptor is still open.
    pub fn chip_erase(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        if state.nodes.any_open() {
            error!("Chip erase refused, descriptors are still open");
            return Err(FsError::Busy.into());
        }
        let _power = self.power_on();
        for sector in 0..self.size / self.sector_size {
            self.erase_at(sector * self.sector_size)?;
        }
        state.nodes.clear_files();
        state.next_uid = 0;
        self.check_fs(state)
    }

    /// Binds a sub-mount name, handing out an id from the upper half of the
    /// id space. Host-OS integration hook; no flash is touched.
    pub fn bind_mount(&self, name: &str) -> Result<u32> {
        if name.is_empty() {
            return Err(FsError::Invalid.into());
        }
        let mut state = self.state.lock().unwrap();
        if state.nodes.find_mount(name).is_some() {
            return Err(FsError::AlreadyExists.into());
        }
        let id = state.nodes.insert_mount(name).ok_or(FsError::NoSpace)?;
        Ok(id)
    }

    pub fn mount_id(&self, name: &str) -> Result<u32> {
        let state = self.state.lock().unwrap();
        let id = state.nodes.find_mount(name).ok_or(FsError::NotFound)?;
        Ok(id)
    }
}

impl<DS: FlashStorage> FileSystem for FileSystemServer<DS> {
    /// Resolves a name to a descriptor id, scanning the file's record ring
    /// on first contact and caching the result.
    fn lookup(&self, name: &str) -> Result<u32> {
        let Some(name) = name_bytes(name) else {
            error!("File name shall be 1 to 8 bytes with no '/'");
            return Err(FsError::Invalid.into());
        };
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        if let Some(id) = state.nodes.find_file(&name) {
            return Ok(id);
        }

        let _power = self.power_on();
        let Some((_, header)) = self.find_file_grain(state, &name)? else {
            return Err(FsError::NotFound.into());
        };
        if !header.is_valid() {
            error!("File table entry for {} is inconsistent", display_name(&name));
            return Err(FsError::CorruptHeader.into());
        }
        let mut file = File::new(header);
        self.scan_file(&mut file)?;
        let id = state.nodes.insert_file(file).ok_or(FsError::NoSpace)?;
        Ok(id)
    }

    fn open(&self, id: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.nodes.acquire(id) {
            Ok(())
        } else {
            Err(FsError::NotFound.into())
        }
    }

    fn close(&self, id: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.nodes.refs(id) {
            None => Err(FsError::NotFound.into()),
            Some(0) => Err(FsError::Invalid.into()),
            Some(_) => {
                state.nodes.release(id);
                Ok(())
            }
        }
    }

    /// Byte-stream read across record boundaries: `offset` picks the
    /// logical record and the position inside it, then successive records
    /// are concatenated until the buffer is full or a record is missing.
    fn read(&self, id: u32, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        let state = self.state.lock().unwrap();
        let file = state.nodes.file(id).ok_or(FsError::NotFound)?;
        if file.header.encrypted() && self.cipher.is_none() {
            error!(
                "File {} is encrypted but no key is mounted",
                display_name(&file.header.name)
            );
            return Err(FsError::Invalid.into());
        }

        let record_size = file.header.record_size.get() as u64;
        let mut index = (offset / record_size) as u32;
        let mut skip = (offset % record_size) as u32;

        let _power = self.power_on();
        let mut done = 0;
        while done < buffer.len() {
            match self.read_record(file, index, skip, &mut buffer[done..]) {
                Ok(read) => {
                    done += read;
                    skip = 0;
                    index += 1;
                }
                // A missing or corrupt record ends the stream; reporting it
                // is only meaningful when nothing was read at all.
                Err(Error::Fs(FsError::NotFound | FsError::CorruptRecord)) if done > 0 => break,
                Err(err) => return Err(err),
            }
        }
        Ok(done)
    }

    /// Appends one record per call; input beyond the record size is
    /// truncated, shorter input leaves the tail of the record erased.
    fn write(&self, id: u32, buffer: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let file = state.nodes.file_mut(id).ok_or(FsError::NotFound)?;
        if file.header.encrypted() && self.cipher.is_none() {
            error!(
                "File {} is encrypted but no key is mounted",
                display_name(&file.header.name)
            );
            return Err(FsError::Invalid.into());
        }
        let _power = self.power_on();
        self.write_record(file, buffer)
    }
}
