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

use std::sync::{Arc, Mutex};

use log::warn;
use pika_ds::{FlashStorage, Result};
use pika_err::IoError;

/// RAM-backed NOR flash with real NOR program/erase semantics: programming
/// can only clear bits, erasing sets a whole sector back to 0xFF.
///
/// The handle is cheap to clone; clones share the same memory, so a test can
/// keep a handle across a simulated reboot of whatever was mounted on top.
///
/// A program budget can be armed to simulate power loss: once the budget is
/// exhausted, further programming fails with a device error, leaving the
/// memory exactly as a real power cut would. Reads remain unaffected.
#[derive(Clone)]
pub struct FlashStorageServer {
    state: Arc<Mutex<State>>,
    sector_size: usize,
}

struct State {
    memory: Vec<u8>,
    /// Remaining program units (1 per programmed byte, `sector_size` per
    /// erase), or `None` when fault injection is disarmed.
    budget: Option<usize>,
    power_depth: i32,
    power_cycles: u32,
}

impl FlashStorageServer {
    pub fn new(sector_count: usize, sector_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                memory: vec![0xff; sector_count * sector_size],
                budget: None,
                power_depth: 0,
                power_cycles: 0,
            })),
            sector_size,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Arm the fault injector: allow `units` more program units, then fail.
    pub fn arm_fault(&self, units: usize) {
        self.state.lock().unwrap().budget = Some(units);
    }

    pub fn disarm_fault(&self) {
        self.state.lock().unwrap().budget = None;
    }

    /// Raw image snapshot, fault injection and NOR semantics bypassed.
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().unwrap().memory.clone()
    }

    /// Overwrite raw bytes, bypassing NOR semantics. Test-side corruption.
    pub fn patch(&self, offset: usize, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.memory[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn power_depth(&self) -> i32 {
        self.state.lock().unwrap().power_depth
    }

    pub fn power_cycles(&self) -> u32 {
        self.state.lock().unwrap().power_cycles
    }
}

impl FlashStorage for FlashStorageServer {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        let state = self.state.lock().unwrap();
        let offset = offset as usize;
        let end = offset
            .checked_add(buffer.len())
            .ok_or(IoError::OutOfRange)?;
        if end > state.memory.len() {
            return Err(IoError::OutOfRange);
        }
        buffer.copy_from_slice(&state.memory[offset..end]);
        Ok(buffer.len())
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let offset = offset as usize;
        let end = offset
            .checked_add(buffer.len())
            .ok_or(IoError::OutOfRange)?;
        if end > state.memory.len() {
            return Err(IoError::OutOfRange);
        }
        for (at, &byte) in buffer.iter().enumerate() {
            match state.budget {
                Some(0) => return Err(IoError::Device(-5)),
                Some(ref mut left) => *left -= 1,
                None => {}
            }
            state.memory[offset + at] &= byte;
        }
        Ok(buffer.len())
    }

    fn erase_sector(&self, offset: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let offset = offset as usize;
        if offset % self.sector_size != 0 {
            return Err(IoError::Unaligned);
        }
        let end = offset + self.sector_size;
        if end > state.memory.len() {
            return Err(IoError::OutOfRange);
        }
        match state.budget {
            Some(ref mut left) if *left < self.sector_size => {
                *left = 0;
                return Err(IoError::Device(-5));
            }
            Some(ref mut left) => *left -= self.sector_size,
            None => {}
        }
        state.memory[offset..end].fill(0xff);
        Ok(())
    }

    fn power(&self, state: bool) {
        let mut inner = self.state.lock().unwrap();
        if state {
            if inner.power_depth == 0 {
                inner.power_cycles += 1;
            }
            inner.power_depth += 1;
        } else {
            inner.power_depth -= 1;
            if inner.power_depth < 0 {
                warn!("Power released more often than requested");
                inner.power_depth = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_clears_bits_only() {
        let flash = FlashStorageServer::new(2, 64);
        flash.write(0, &[0x0f]).unwrap();
        flash.write(0, &[0xf3]).unwrap();

        let mut byte = [0u8];
        flash.read(0, &mut byte).unwrap();
        assert_eq!(byte[0], 0x03);
    }

    #[test]
    fn erase_restores_sector_to_ones() {
        let flash = FlashStorageServer::new(2, 64);
        flash.write(70, &[0x00; 8]).unwrap();
        flash.erase_sector(64).unwrap();

        let mut sector = [0u8; 64];
        flash.read(64, &mut sector).unwrap();
        assert!(sector.iter().all(|&byte| byte == 0xff));
    }

    #[test]
    fn erase_rejects_unaligned_offset() {
        let flash = FlashStorageServer::new(2, 64);
        assert_eq!(flash.erase_sector(3), Err(IoError::Unaligned));
    }

    #[test]
    fn fault_injection_programs_partially() {
        let flash = FlashStorageServer::new(1, 64);
        flash.arm_fault(2);
        assert_eq!(flash.write(0, &[0, 0, 0, 0]), Err(IoError::Device(-5)));

        flash.disarm_fault();
        let mut bytes = [0u8; 4];
        flash.read(0, &mut bytes).unwrap();
        assert_eq!(bytes, [0x00, 0x00, 0xff, 0xff]);
    }

    #[test]
    fn shared_handle_sees_writes() {
        let flash = FlashStorageServer::new(1, 64);
        let clone = flash.clone();
        flash.write(10, &[0xaa]).unwrap();

        let mut byte = [0u8];
        clone.read(10, &mut byte).unwrap();
        assert_eq!(byte[0], 0xaa);
    }
}
