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

use log::{info, warn};
use pika_ds::FlashStorage;
use pika_fs::Result;
use zerocopy::{FromZeros, IntoBytes};

use crate::{
    format::{id_add, id_sub, FileHeader, Header, GRAIN},
    FileSystemServer, Inner,
};

impl<DS: FlashStorage> FileSystemServer<DS> {
    /// One header region spans exactly one sector.
    pub(crate) fn header_size(&self) -> u32 {
        self.sector_size
    }

    pub(crate) fn max_file_count(&self) -> u32 {
        self.header_size() / GRAIN - 1
    }

    fn region_address(&self, region: u32) -> u32 {
        region * self.header_size()
    }

    fn read_header(&self, region: u32) -> Result<Header> {
        let mut header = Header::new_zeroed();
        self.read_at(self.region_address(region), header.as_mut_bytes())?;
        Ok(header)
    }

    fn write_header(&self, region: u32, header: &Header) -> Result<()> {
        self.write_at(self.region_address(region), header.as_bytes())
    }

    pub(crate) fn read_file_grain(&self, region: u32, index: u32) -> Result<FileHeader> {
        let mut grain = FileHeader::new_zeroed();
        let address = self.region_address(region) + GRAIN + index * GRAIN;
        self.read_at(address, grain.as_mut_bytes())?;
        Ok(grain)
    }

    fn write_file_grain(&self, region: u32, index: u32, grain: &FileHeader) -> Result<()> {
        let address = self.region_address(region) + GRAIN + index * GRAIN;
        self.write_at(address, grain.as_bytes())
    }

    fn erase_header_region(&self, region: u32) -> Result<()> {
        self.erase_at(self.region_address(region))
    }

    /// Mounts the superblock: selects the live header region, repairs a
    /// damaged region from the valid one, or formats the device when
    /// neither region is valid.
    pub(crate) fn check_fs(&self, state: &mut Inner) -> Result<()> {
        let header0 = self.read_header(0)?;
        let header1 = self.read_header(1)?;

        match (header0.is_valid(), header1.is_valid()) {
            (false, false) => {
                info!("No file system found, formatting");
                self.erase_header_region(0)?;
                self.erase_header_region(1)?;
                let header = Header::new(0, 0);
                self.write_header(0, &header)?;
                self.write_header(1, &header)?;
                state.live = 0;
                state.filecnt = 0;
            }
            (true, true) => {
                let ahead = id_sub(header1.id.no(), header0.id.no());
                if ahead != 0 && ahead < 1 << 30 {
                    state.live = 1;
                    state.filecnt = header1.filecnt.get();
                } else {
                    state.live = 0;
                    state.filecnt = header0.filecnt.get();
                }
            }
            (valid0, _) => {
                let (live, dead) = if valid0 { (0, 1) } else { (1, 0) };
                let live_header = if valid0 { header0 } else { header1 };
                warn!("Header region {dead} is damaged, repairing");
                self.erase_header_region(dead)?;
                let filecnt = live_header.filecnt.get();
                for index in 0..filecnt {
                    let grain = self.read_file_grain(live, index)?;
                    self.write_file_grain(dead, index, &grain)?;
                }
                // One generation behind, so the repaired copy comes back as
                // the spare and the surviving region stays live.
                let spare = Header::new(id_sub(live_header.id.no(), 1), filecnt);
                self.write_header(dead, &spare)?;
                state.live = live;
                state.filecnt = filecnt;
            }
        }
        Ok(())
    }

    /// Commits a file-table change by rewriting the spare region and
    /// switching to it: file grains first, the `Header` grain last. Until
    /// that final grain is programmed the spare stays invalid, so a power
    /// cut at any byte falls back to the current live region on remount.
    pub(crate) fn commit_update(
        &self,
        state: &mut Inner,
        replace: Option<(u32, &FileHeader)>,
        append: Option<&FileHeader>,
    ) -> Result<()> {
        let live = state.live;
        let spare = 1 - live;
        self.erase_header_region(spare)?;
        for index in 0..state.filecnt {
            match replace {
                Some((at, grain)) if at == index => self.write_file_grain(spare, index, grain)?,
                _ => {
                    let grain = self.read_file_grain(live, index)?;
                    self.write_file_grain(spare, index, &grain)?;
                }
            }
        }
        let mut filecnt = state.filecnt;
        if let Some(grain) = append {
            self.write_file_grain(spare, filecnt, grain)?;
            filecnt += 1;
        }
        let live_header = self.read_header(live)?;
        let next = Header::new(id_add(live_header.id.no(), 1), filecnt);
        self.write_header(spare, &next)?;
        state.live = spare;
        state.filecnt = filecnt;
        Ok(())
    }

    pub(crate) fn find_file_grain(
        &self,
        state: &Inner,
        name: &[u8; 8],
    ) -> Result<Option<(u32, FileHeader)>> {
        for index in 0..state.filecnt {
            let grain = self.read_file_grain(state.live, index)?;
            if grain.name == *name {
                return Ok(Some((index, grain)));
            }
        }
        Ok(None)
    }
}
