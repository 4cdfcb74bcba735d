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

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::format::FileHeader;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Per-record encryption. The nonce concatenates the record number, the
/// file's first sector and the file's generation counter; `(sector, uid)`
/// pins one life of the file and record numbers are strictly monotonic
/// within it, so no nonce ever repeats under one key.
pub(crate) struct RecordCipher {
    key: [u8; 16],
}

impl RecordCipher {
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }

    fn nonce(header: &FileHeader, no: u32) -> [u8; 16] {
        let mut nonce = [0u8; 16];
        nonce[..4].copy_from_slice(&no.to_le_bytes());
        nonce[4..8].copy_from_slice(&header.sector.get().to_le_bytes());
        nonce[8..12].copy_from_slice(&header.uid.get().to_le_bytes());
        nonce
    }

    /// AES-128-CTR keystream; one call encrypts, the same call decrypts.
    pub fn apply(&self, header: &FileHeader, no: u32, payload: &mut [u8]) {
        let mut cipher = Aes128Ctr::new(&self.key.into(), &Self::nonce(header, no).into());
        cipher.apply_keystream(payload);
    }

    /// 32-bit authentication tag over the nonce and the plaintext payload,
    /// stored in the record checksum slot.
    pub fn tag(&self, header: &FileHeader, no: u32, plaintext: &[u8]) -> u32 {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(&Self::nonce(header, no));
        mac.update(plaintext);
        let digest = mac.finalize().into_bytes();
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}
