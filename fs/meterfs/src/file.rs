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

use log::error;
use pika_ds::FlashStorage;
use pika_fs::{FsError, Result};
use zerocopy::{little_endian::U32, FromZeros, IntoBytes};

use crate::{
    format::{id_add, id_sub, FileHeader, Index, RecordHeader, RECORD_HEADER_LEN},
    FileSystemServer,
};

/// Records short enough for one combined header-and-payload read.
const COMBINED_READ: u32 = 32;

/// In-memory position state of an open file. `first*`/`last*` locate the
/// oldest and newest live records in the ring; they are rebuilt by
/// `scan_file` and kept current by `write_record`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct File {
    pub header: FileHeader,
    pub lastidx: Index,
    pub lastoff: u32,
    pub firstidx: Index,
    pub firstoff: u32,
    pub recordcnt: u32,
    /// The erase ahead of `lastoff` already happened (a previous append
    /// erased but failed to program), so a retry must not erase again.
    pub early_erased: bool,
}

impl File {
    pub fn new(header: FileHeader) -> Self {
        Self {
            header,
            lastidx: Index::ERASED,
            lastoff: 0,
            firstidx: Index::ERASED,
            firstoff: 0,
            recordcnt: 0,
            early_erased: false,
        }
    }
}

impl<DS: FlashStorage> FileSystemServer<DS> {
    fn read_index(&self, address: u32) -> Result<Index> {
        let mut index = Index::new_zeroed();
        self.read_at(address, index.as_mut_bytes())?;
        Ok(index)
    }

    /// Locates the oldest and newest live records by reading entry ids
    /// only, in O(log n) reads: one probe per sector to find any record,
    /// then two halving-interval searches around it.
    pub(crate) fn scan_file(&self, file: &mut File) -> Result<()> {
        let header = file.header;
        let stride = header.stride();
        let base = header.sector.get() * self.sector_size;
        let run = header.sector_count() * self.sector_size;
        let total = run / stride;
        let cap = header.capacity();

        file.lastidx = Index::ERASED;
        file.lastoff = 0;
        file.firstidx = Index::ERASED;
        file.firstoff = 0;
        file.recordcnt = 0;
        file.early_erased = false;

        if total == 0 || cap == 0 {
            return Ok(());
        }

        // Find any record as a starting point, one probe per sector,
        // backing off a slot where the probe would straddle a boundary.
        let step = (self.sector_size / stride + 1) * stride;
        let mut offset = 0u32;
        for _ in 0..header.sector_count() {
            if offset + stride > run {
                break;
            }
            let id = self.read_index(base + offset)?;
            if id.is_valid() && id.no() >= header.first_id.get() {
                file.lastidx = id;
                file.lastoff = offset;
                break;
            }
            offset += step;
            if offset % self.sector_size > stride {
                offset -= stride;
            }
        }

        file.firstidx = file.lastidx;
        file.firstoff = file.lastoff;

        if !file.lastidx.is_valid() {
            return Ok(());
        }

        // Newest record: stretch forward from the seed as far as the ids
        // stay contiguous, halving the reach on every miss.
        let max_record = cap - 1;
        let mut diff: i64 = 0;
        let mut interval = total - 1;
        while interval != 0 {
            let slot = (file.lastoff / stride + interval) % total;
            let probe = slot * stride;
            let id = self.read_index(base + probe)?;
            if id.is_valid()
                && id.no() >= header.first_id.get()
                && id.no() == id_add(file.lastidx.no(), interval)
            {
                file.lastidx = id;
                file.lastoff = probe;
                diff += interval as i64;
                if interval == 1 {
                    // Keep crawling slot by slot; halving would stop early.
                    continue;
                }
            }
            interval /= 2;
        }

        // The seed is more than two logical laps behind the newest record:
        // the ring rotated past it and only the newest position is certain.
        if diff > 2 * max_record as i64 {
            file.firstidx = file.lastidx;
            file.firstoff = file.lastoff;
            diff = 0;
        }
        diff -= max_record as i64;

        // Oldest record: the same search seeded at the other end, unless the
        // seed already carries the lowest id still belonging to the file.
        if file.firstidx.no() != header.first_id.get() {
            let mut interval = diff;
            while interval != 0 && diff != 0 {
                let slot = {
                    let raw = (file.firstoff / stride) as i64 + interval;
                    if raw < 0 {
                        raw + total as i64
                    } else {
                        raw % total as i64
                    }
                };
                let probe = slot as u32 * stride;
                let id = self.read_index(base + probe)?;
                let expected = if interval >= 0 {
                    id_add(file.firstidx.no(), interval as u32)
                } else {
                    id_sub(file.firstidx.no(), (-interval) as u32)
                };
                if id.is_valid() && id.no() >= header.first_id.get() && id.no() == expected {
                    file.firstidx = id;
                    file.firstoff = probe;
                    diff -= interval;
                    if interval == 1 || interval == -1 {
                        continue;
                    }
                }
                interval /= 2;
            }
        }

        let span = id_add(id_sub(file.lastidx.no(), file.firstidx.no()), 1);
        file.recordcnt = span.min(cap);
        Ok(())
    }

    /// Appends one record. The payload is programmed first and the entry
    /// header last, so a power cut in between leaves the slot erased and
    /// the previous newest record intact.
    pub(crate) fn write_record(&self, file: &mut File, data: &[u8]) -> Result<usize> {
        let header = file.header;
        let stride = header.stride();
        let base = header.sector.get() * self.sector_size;
        let run = header.sector_count() * self.sector_size;
        let cap = header.capacity();

        let mut offset = file.lastoff;
        if file.lastidx.is_valid() {
            offset += stride;
        }
        if offset + stride > run {
            offset = 0;
        }

        // Erase every sector this record enters at its first byte. This is
        // where the oldest records get consumed once the ring is full.
        let first_sector = offset / self.sector_size;
        let last_sector = (offset + stride - 1) / self.sector_size;
        let fresh_from = if offset % self.sector_size == 0 {
            first_sector
        } else {
            first_sector + 1
        };
        let erases_ahead = fresh_from <= last_sector;
        if erases_ahead && !file.early_erased {
            for sector in fresh_from..=last_sector {
                self.erase_at(base + sector * self.sector_size)?;
            }
        }

        let no = if file.lastidx.is_valid() {
            id_add(file.lastidx.no(), 1)
        } else {
            1
        };

        let record_size = header.record_size.get() as usize;
        let mut payload = vec![0xff; record_size];
        let copy = data.len().min(record_size);
        payload[..copy].copy_from_slice(&data[..copy]);

        let checksum = if header.encrypted() {
            let Some(cipher) = &self.cipher else {
                error!("File {} is encrypted but no key is mounted", display_name(&header.name));
                return Err(FsError::Invalid.into());
            };
            let tag = cipher.tag(&header, no, &payload);
            cipher.apply(&header, no, &mut payload);
            tag
        } else {
            crc32fast::hash(&payload)
        };
        let entry = RecordHeader {
            id: Index::new(no),
            checksum: U32::new(checksum),
        };

        let programmed = self
            .write_at(base + offset + RECORD_HEADER_LEN, &payload)
            .and_then(|()| self.write_at(base + offset, entry.as_bytes()));
        if let Err(err) = programmed {
            // Rebuild the position state; remember the erase so a retry does
            // not consume another sector's worth of old records.
            self.scan_file(file)?;
            file.early_erased = erases_ahead;
            return Err(err);
        }
        file.early_erased = false;

        file.lastidx = Index::new(no);
        file.lastoff = offset;
        if file.recordcnt < cap {
            file.recordcnt += 1;
            if !file.firstidx.is_valid() {
                file.firstidx = file.lastidx;
                file.firstoff = offset;
            }
        } else {
            file.firstidx = Index::new(id_add(file.firstidx.no(), 1));
            file.firstoff += stride;
            if file.firstoff + stride > run {
                file.firstoff = 0;
            }
        }
        Ok(record_size)
    }

    /// Reads up to `buffer.len()` bytes of the record at logical position
    /// `index`, starting `skip` bytes into its payload.
    pub(crate) fn read_record(
        &self,
        file: &File,
        index: u32,
        skip: u32,
        buffer: &mut [u8],
    ) -> Result<usize> {
        if !file.firstidx.is_valid() || index >= file.recordcnt {
            return Err(FsError::NotFound.into());
        }

        let header = &file.header;
        let stride = header.stride();
        let base = header.sector.get() * self.sector_size;
        let total = header.sector_count() * self.sector_size / stride;
        let record_size = header.record_size.get();

        let len = buffer.len().min(record_size.saturating_sub(skip) as usize);
        if len == 0 {
            return Ok(0);
        }

        let slot = (file.firstoff / stride + index) % total;
        let address = base + slot * stride;
        let expected = id_add(file.firstidx.no(), index);

        let accept = |entry: &RecordHeader| {
            entry.id.is_valid()
                && entry.id.no() == expected
                && entry.id.no() >= header.first_id.get()
        };

        if header.encrypted() {
            let mut record = vec![0u8; stride as usize];
            self.read_at(address, &mut record)?;
            let mut entry = RecordHeader::new_zeroed();
            entry
                .as_mut_bytes()
                .copy_from_slice(&record[..RECORD_HEADER_LEN as usize]);
            if !accept(&entry) {
                return Err(FsError::NotFound.into());
            }
            let Some(cipher) = &self.cipher else {
                return Err(FsError::Invalid.into());
            };
            let payload = &mut record[RECORD_HEADER_LEN as usize..];
            cipher.apply(header, entry.id.no(), payload);
            if cipher.tag(header, entry.id.no(), payload) != entry.checksum.get() {
                error!(
                    "Record {} of {} fails authentication",
                    entry.id.no(),
                    display_name(&header.name)
                );
                return Err(FsError::CorruptRecord.into());
            }
            buffer[..len].copy_from_slice(&payload[skip as usize..skip as usize + len]);
        } else if stride <= COMBINED_READ {
            let mut record = [0u8; COMBINED_READ as usize];
            let record = &mut record[..stride as usize];
            self.read_at(address, record)?;
            let mut entry = RecordHeader::new_zeroed();
            entry
                .as_mut_bytes()
                .copy_from_slice(&record[..RECORD_HEADER_LEN as usize]);
            if !accept(&entry) {
                return Err(FsError::NotFound.into());
            }
            let payload = &record[RECORD_HEADER_LEN as usize..];
            if crc32fast::hash(payload) != entry.checksum.get() {
                error!(
                    "Record {} of {} fails its checksum",
                    entry.id.no(),
                    display_name(&header.name)
                );
                return Err(FsError::CorruptRecord.into());
            }
            buffer[..len].copy_from_slice(&payload[skip as usize..skip as usize + len]);
        } else {
            let mut entry = RecordHeader::new_zeroed();
            self.read_at(address, entry.as_mut_bytes())?;
            if !accept(&entry) {
                return Err(FsError::NotFound.into());
            }
            self.read_at(address + RECORD_HEADER_LEN + skip, &mut buffer[..len])?;
        }
        Ok(len)
    }
}

pub(crate) fn display_name(name: &[u8; 8]) -> String {
    let end = name.iter().position(|&byte| byte == 0).unwrap_or(name.len());
    String::from_utf8_lossy(&name[..end]).into_owned()
}
