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

use pika_ds_ram::FlashStorageServer;
use pika_fs::{Error, FileSystem, FsError};
use pika_fs_meterfs::{FileSystemServer, MountParams};
use proptest::prelude::*;

const SECTOR: u32 = 4096;
const MAGIC: [u8; 4] = [0xaa, 0x41, 0x4b, 0x55];

fn mount(flash: &FlashStorageServer) -> FileSystemServer<FlashStorageServer> {
    FileSystemServer::new(
        flash.clone(),
        MountParams {
            region_offset: 0,
            region_size: flash.len() as u32,
            sector_size: SECTOR,
            encrypt_key: None,
        },
    )
    .unwrap()
}

fn record(text: &str) -> [u8; 20] {
    let mut bytes = [0u8; 20];
    bytes[..text.len()].copy_from_slice(text.as_bytes());
    bytes
}

fn header_generation(image: &[u8], region: usize) -> Option<u32> {
    let at = region * SECTOR as usize;
    let grain = &image[at..at + 17];
    let id = u32::from_le_bytes([grain[0], grain[1], grain[2], grain[3]]);
    (id & 1 == 0 && grain[12..16] == MAGIC).then_some(id >> 1)
}

#[test]
fn empty_mount_formats_both_header_sectors() {
    let flash = FlashStorageServer::new(3, SECTOR as usize);
    let fs = mount(&flash);
    assert_eq!(fs.fs_info().file_count, 0);

    let image = flash.snapshot();
    assert_eq!(header_generation(&image, 0), Some(0));
    assert_eq!(header_generation(&image, 1), Some(0));
}

#[test]
fn ring_keeps_the_most_recent_records() {
    let flash = FlashStorageServer::new(8, SECTOR as usize);
    let fs = mount(&flash);
    fs.allocate("meter", 2, 200, 20, false).unwrap();
    let id = fs.lookup("meter").unwrap();

    for at in 0..11 {
        let written = fs.write(id, &record(&format!("r{at:02}"))).unwrap();
        assert_eq!(written, 20);
    }

    // Capacity is ten records; the first one has been consumed.
    let info = fs.info(id).unwrap();
    assert_eq!(info.record_count, 10);
    assert_eq!(info.sectors, 2);
    assert_eq!(info.file_size, 200);
    assert_eq!(info.record_size, 20);

    for at in 0..10 {
        let mut buffer = [0u8; 20];
        let read = fs.read(id, at as u64 * 20, &mut buffer).unwrap();
        assert_eq!(read, 20);
        assert_eq!(buffer, record(&format!("r{:02}", at + 1)));
    }
}

#[test]
fn reads_cross_record_boundaries() {
    let flash = FlashStorageServer::new(8, SECTOR as usize);
    let fs = mount(&flash);
    fs.allocate("meter", 2, 200, 20, false).unwrap();
    let id = fs.lookup("meter").unwrap();
    fs.write(id, &record("alpha")).unwrap();
    fs.write(id, &record("beta")).unwrap();

    // Half of the first record, all of the second.
    let mut buffer = [0u8; 30];
    assert_eq!(fs.read(id, 10, &mut buffer).unwrap(), 30);
    assert_eq!(&buffer[..10], &record("alpha")[10..]);
    assert_eq!(&buffer[10..], &record("beta")[..20]);

    // Reading past the last record returns the available tail.
    let mut buffer = [0u8; 60];
    assert_eq!(fs.read(id, 20, &mut buffer).unwrap(), 20);

    // Reading where no record exists at all is an error.
    assert_eq!(
        fs.read(id, 40, &mut buffer).err(),
        Some(Error::Fs(FsError::NotFound))
    );
}

#[test]
fn resize_clears_content() {
    let flash = FlashStorageServer::new(8, SECTOR as usize);
    let fs = mount(&flash);
    fs.allocate("meter", 2, 200, 20, false).unwrap();
    let id = fs.lookup("meter").unwrap();
    for at in 0..11 {
        fs.write(id, &record(&format!("r{at:02}"))).unwrap();
    }

    fs.resize(id, 40, 10).unwrap();
    let info = fs.info(id).unwrap();
    assert_eq!(info.record_count, 0);
    assert_eq!(info.file_size, 40);
    assert_eq!(info.record_size, 10);

    let mut buffer = [0u8; 10];
    assert_eq!(
        fs.read(id, 0, &mut buffer).err(),
        Some(Error::Fs(FsError::NotFound))
    );

    // Growth past the preallocated sectors is refused.
    assert_eq!(
        fs.resize(id, 20_000, 20).err(),
        Some(Error::Fs(FsError::Invalid))
    );
}

#[test]
fn duplicate_allocate_is_rejected() {
    let flash = FlashStorageServer::new(8, SECTOR as usize);
    let fs = mount(&flash);
    fs.allocate("meter", 2, 200, 20, false).unwrap();
    assert_eq!(
        fs.allocate("meter", 2, 100, 10, false).err(),
        Some(Error::Fs(FsError::AlreadyExists))
    );
}

#[test]
fn allocate_validates_geometry_and_space() {
    let flash = FlashStorageServer::new(8, SECTOR as usize);
    let fs = mount(&flash);

    assert_eq!(
        fs.allocate("a", 2, 100, 0, false).err(),
        Some(Error::Fs(FsError::Invalid))
    );
    assert_eq!(
        fs.allocate("a", 2, 10, 20, false).err(),
        Some(Error::Fs(FsError::Invalid))
    );
    assert_eq!(
        fs.allocate("a", 1, 100, 10, false).err(),
        Some(Error::Fs(FsError::Invalid))
    );
    assert_eq!(
        fs.allocate("bad/name", 2, 100, 10, false).err(),
        Some(Error::Fs(FsError::Invalid))
    );
    // Ten records of 5000 bytes cannot fit in two sectors.
    assert_eq!(
        fs.allocate("a", 2, 50_000, 5000, false).err(),
        Some(Error::Fs(FsError::Invalid))
    );
    // Six data sectors exist; a seven-sector file does not fit.
    assert_eq!(
        fs.allocate("a", 7, 200, 20, false).err(),
        Some(Error::Fs(FsError::NoSpace))
    );

    // Two three-sector files fill the data area exactly.
    fs.allocate("first", 3, 200, 20, false).unwrap();
    fs.allocate("second", 3, 200, 20, false).unwrap();
    assert_eq!(
        fs.allocate("third", 2, 200, 20, false).err(),
        Some(Error::Fs(FsError::NoSpace))
    );
}

#[test]
fn damaged_header_region_is_repaired_on_mount() {
    let flash = FlashStorageServer::new(8, SECTOR as usize);
    {
        let fs = mount(&flash);
        fs.allocate("meter", 2, 200, 20, false).unwrap();
        let id = fs.lookup("meter").unwrap();
        fs.write(id, &record("survives")).unwrap();
    }

    // Zero out region 0's magic; its checksum dies with it.
    flash.patch(12, &[0; 4]);

    let fs = mount(&flash);
    let id = fs.lookup("meter").unwrap();
    let mut buffer = [0u8; 20];
    fs.read(id, 0, &mut buffer).unwrap();
    assert_eq!(buffer, record("survives"));

    // Region 0 was rebuilt one generation behind the live region.
    let image = flash.snapshot();
    let generation0 = header_generation(&image, 0).unwrap();
    let generation1 = header_generation(&image, 1).unwrap();
    assert_eq!(generation0 + 1, generation1);
}

#[test]
fn garbage_in_both_header_regions_reformats_empty() {
    let flash = FlashStorageServer::new(8, SECTOR as usize);
    {
        let fs = mount(&flash);
        fs.allocate("meter", 2, 200, 20, false).unwrap();
    }
    flash.patch(12, &[0; 4]);
    flash.patch(SECTOR as usize + 12, &[0; 4]);

    // With no valid header region left the device counts as unformatted.
    let fs = mount(&flash);
    assert_eq!(fs.fs_info().file_count, 0);
    assert_eq!(fs.lookup("meter").err(), Some(Error::Fs(FsError::NotFound)));

    let image = flash.snapshot();
    assert_eq!(header_generation(&image, 0), Some(0));
    assert_eq!(header_generation(&image, 1), Some(0));
}

#[test]
fn chip_erase_resets_to_an_empty_file_system() {
    let flash = FlashStorageServer::new(8, SECTOR as usize);
    let fs = mount(&flash);
    fs.allocate("meter", 2, 200, 20, false).unwrap();
    let id = fs.lookup("meter").unwrap();
    fs.write(id, &record("gone")).unwrap();

    // Still referenced descriptors block the erase.
    fs.open(id).unwrap();
    assert_eq!(fs.chip_erase().err(), Some(Error::Fs(FsError::Busy)));
    fs.close(id).unwrap();

    fs.chip_erase().unwrap();
    assert_eq!(fs.fs_info().file_count, 0);
    assert_eq!(fs.info(id).err(), Some(Error::Fs(FsError::NotFound)));
    assert_eq!(fs.lookup("meter").err(), Some(Error::Fs(FsError::NotFound)));

    let image = flash.snapshot();
    assert_eq!(header_generation(&image, 0), Some(0));
    assert_eq!(header_generation(&image, 1), Some(0));

    // The region mounts empty again after a reboot.
    let fs = mount(&flash);
    assert_eq!(fs.fs_info().file_count, 0);
}

#[test]
fn power_cut_before_the_entry_header_keeps_the_old_newest_record() {
    let flash = FlashStorageServer::new(8, SECTOR as usize);
    let fs = mount(&flash);
    fs.allocate("meter", 2, 200, 20, false).unwrap();
    let id = fs.lookup("meter").unwrap();
    for at in 0..3 {
        fs.write(id, &record(&format!("r{at:02}"))).unwrap();
    }

    // The payload programs fully, the entry header does not start.
    flash.arm_fault(20);
    assert!(fs.write(id, &record("r03")).is_err());
    flash.disarm_fault();

    let fs = mount(&flash);
    let id = fs.lookup("meter").unwrap();
    assert_eq!(fs.info(id).unwrap().record_count, 3);
    let mut buffer = [0u8; 20];
    fs.read(id, 40, &mut buffer).unwrap();
    assert_eq!(buffer, record("r02"));
}

#[test]
fn failed_append_recovers_in_place_and_retries() {
    let flash = FlashStorageServer::new(8, SECTOR as usize);
    let fs = mount(&flash);
    fs.allocate("meter", 2, 200, 20, false).unwrap();
    let id = fs.lookup("meter").unwrap();

    // The first append erases its sector, then dies mid-payload.
    flash.arm_fault(SECTOR as usize + 10);
    assert!(fs.write(id, &record("r00")).is_err());
    flash.disarm_fault();
    assert_eq!(fs.info(id).unwrap().record_count, 0);

    // The retry goes through on the already-erased sector.
    fs.write(id, &record("r00")).unwrap();
    assert_eq!(fs.info(id).unwrap().record_count, 1);
    let mut buffer = [0u8; 20];
    fs.read(id, 0, &mut buffer).unwrap();
    assert_eq!(buffer, record("r00"));
}

#[test]
fn power_cut_during_header_switch_never_loses_both_regions() {
    let flash = FlashStorageServer::new(8, SECTOR as usize);
    {
        let fs = mount(&flash);
        fs.allocate("meter", 2, 200, 20, false).unwrap();
        let id = fs.lookup("meter").unwrap();
        fs.write(id, &record("keep")).unwrap();
    }
    let baseline = flash.snapshot();

    // The second allocation erases two data sectors, then rewrites the
    // spare header region: erase, one copied grain, one new grain, and the
    // header grain last. Cut the power at every byte of that sequence.
    let data_erases = 2 * SECTOR as usize;
    let commit = SECTOR as usize + 2 * 32 + 17;
    for budget in 0..=commit {
        flash.patch(0, &baseline);
        flash.arm_fault(data_erases + budget);

        let fs = mount(&flash);
        let outcome = fs.allocate("extra", 2, 100, 10, false);
        flash.disarm_fault();
        drop(fs);

        // Either the old or the new file table, never a broken mix.
        let fs = mount(&flash);
        let files = fs.fs_info().file_count;
        match files {
            1 => assert!(outcome.is_err()),
            2 => {
                fs.lookup("extra").unwrap();
            }
            _ => panic!("expected one or two files, found {files}"),
        }
        let id = fs.lookup("meter").unwrap();
        let mut buffer = [0u8; 20];
        fs.read(id, 0, &mut buffer).unwrap();
        assert_eq!(buffer, record("keep"));
    }
}

#[test]
fn descriptor_ids_are_recycled_smallest_first() {
    let flash = FlashStorageServer::new(16, SECTOR as usize);
    let fs = mount(&flash);
    for name in ["a", "b", "c", "d"] {
        fs.allocate(name, 2, 100, 10, false).unwrap();
    }
    let ids: Vec<u32> = ["a", "b", "c", "d"]
        .iter()
        .map(|name| fs.lookup(name).unwrap())
        .collect();
    assert_eq!(ids, [0, 1, 2, 3]);

    // Dropping "b" frees its id for the next lookup.
    fs.open(ids[1]).unwrap();
    fs.close(ids[1]).unwrap();
    assert_eq!(fs.lookup("b").unwrap(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Up to capacity, appended records read back verbatim; past capacity,
    /// the file holds exactly the most recent `capacity` records.
    #[test]
    fn ring_round_trips_the_most_recent_records(appends in 1u32..36, seed in 0u8..) {
        let flash = FlashStorageServer::new(8, SECTOR as usize);
        let fs = mount(&flash);
        fs.allocate("meter", 2, 200, 20, false).unwrap();
        let id = fs.lookup("meter").unwrap();

        let payload = |at: u32| {
            let mut bytes = [0u8; 20];
            for (position, byte) in bytes.iter_mut().enumerate() {
                *byte = seed ^ at as u8 ^ position as u8;
            }
            bytes
        };
        for at in 0..appends {
            fs.write(id, &payload(at)).unwrap();
        }

        let capacity = 10;
        let kept = appends.min(capacity);
        prop_assert_eq!(fs.info(id).unwrap().record_count, kept);

        for at in 0..kept {
            let mut buffer = [0u8; 20];
            fs.read(id, at as u64 * 20, &mut buffer).unwrap();
            prop_assert_eq!(buffer, payload(appends - kept + at));
        }
    }

    /// A remount rebuilds the same view of the ring the writer had.
    #[test]
    fn remount_scan_agrees_with_the_writer(appends in 0u32..36, seed in 0u8..) {
        let flash = FlashStorageServer::new(8, SECTOR as usize);
        {
            let fs = mount(&flash);
            fs.allocate("meter", 2, 200, 20, false).unwrap();
            let id = fs.lookup("meter").unwrap();
            for at in 0..appends {
                fs.write(id, &[seed ^ at as u8; 20]).unwrap();
            }
        }

        let fs = mount(&flash);
        let id = fs.lookup("meter").unwrap();
        let kept = appends.min(10);
        prop_assert_eq!(fs.info(id).unwrap().record_count, kept);
        if kept > 0 {
            let mut oldest = [0u8; 20];
            fs.read(id, 0, &mut oldest).unwrap();
            prop_assert_eq!(oldest, [seed ^ (appends - kept) as u8; 20]);

            let mut newest = [0u8; 20];
            fs.read(id, (kept as u64 - 1) * 20, &mut newest).unwrap();
            prop_assert_eq!(newest, [seed ^ (appends - 1) as u8; 20]);
        }
    }
}
