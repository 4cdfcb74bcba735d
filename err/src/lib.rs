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

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] IoError),
    #[error("FS: {0}")]
    Fs(#[from] FsError),
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The device reported a failure with the given driver-specific code.
    #[error("Device failure ({0})")]
    Device(i32),
    #[error("Out of range")]
    OutOfRange,
    #[error("Unaligned")]
    Unaligned,
    /// Fewer bytes were transferred than requested.
    #[error("Incomplete transfer")]
    Incomplete,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// On-flash metadata failed validation, e.g. a file table entry with
    /// impossible geometry.
    #[error("Corrupt header")]
    CorruptHeader,
    /// A record failed its checksum or authentication tag.
    #[error("Corrupt record")]
    CorruptRecord,
    #[error("Not found")]
    NotFound,
    #[error("Already exists")]
    AlreadyExists,
    #[error("Invalid argument")]
    Invalid,
    #[error("No space")]
    NoSpace,
    #[error("Busy")]
    Busy,
}

pub type Result<T> = core::result::Result<T, Error>;
