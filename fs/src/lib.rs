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

pub use pika_err::*;

/// Common surface of the on-device file system drivers. Names live in a
/// single flat namespace; `lookup` resolves a name to a descriptor id which
/// the remaining operations consume.
pub trait FileSystem {
    fn lookup(&self, name: &str) -> Result<u32>;

    fn open(&self, id: u32) -> Result<()>;

    fn close(&self, id: u32) -> Result<()>;

    fn read(&self, id: u32, offset: u64, buffer: &mut [u8]) -> Result<usize>;

    fn write(&self, id: u32, buffer: &[u8]) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub sectors: u32,
    pub file_size: u32,
    pub record_size: u32,
    pub record_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub size: u32,
    pub sector_size: u32,
    pub file_limit: u32,
    pub file_count: u32,
}
