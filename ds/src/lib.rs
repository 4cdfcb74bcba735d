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

pub use pika_err::IoError;

pub type Result<T> = core::result::Result<T, IoError>;

/// Capability set of a raw NOR flash device, or a partition of one.
///
/// Offsets are byte offsets from the start of the device. `write` is
/// program-only: it may clear bits (1 to 0) but can never set them; callers
/// must arrange their writes so they are safe even on devices that do not
/// enforce this. `erase_sector` is the only way to set bits back to 1 and
/// always affects a whole sector.
pub trait FlashStorage {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<usize>;

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<usize>;

    /// `offset` must be sector-aligned.
    fn erase_sector(&self, offset: u64) -> Result<()>;

    /// Power the device up (`true`) or down (`false`). Calls may nest; the
    /// device stays up until every `true` has been matched by a `false`.
    fn power(&self, state: bool);
}
