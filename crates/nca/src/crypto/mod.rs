use crate::hexstring::HexData;
use aes::Aes128;
use binrw::BinRead;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use digest::Digest;
use hex::FromHexError;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::str::FromStr;
use xts_mode::Xts128;

pub mod keyset;
mod signature;

pub use signature::verify_rsa2048_pss_sha256;

pub const AES_BLOCK_SIZE: usize = 0x10;
pub const SHA256_DIGEST_SIZE: usize = 0x20;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

#[derive(Snafu, Debug)]
pub enum KeyParseError {
    InvalidLength { expected: usize, actual: usize },
    InvalidChar { char: char, index: usize },
}

/// A key from the NCA key area, still encrypted with a key area key.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, BinRead)]
pub struct EncryptedAesKey(pub HexData<0x10>);

/// An encrypted title key, as stored in tickets and title key databases.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TitleKey(HexData<0x10>);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AesKey(HexData<0x10>);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AesXtsKey(HexData<0x20>);

fn parse_key(s: &str, result: &mut [u8]) -> Result<(), KeyParseError> {
    hex::decode_to_slice(s, result).map_err(|e| match e {
        FromHexError::InvalidHexCharacter { c, index } => {
            KeyParseError::InvalidChar { char: c, index }
        }
        FromHexError::OddLength | FromHexError::InvalidStringLength => {
            KeyParseError::InvalidLength {
                expected: result.len() * 2,
                actual: s.len(),
            }
        }
    })?;
    Ok(())
}

macro_rules! impl_key_from_str {
    ($ty:ident, $size:literal) => {
        impl FromStr for $ty {
            type Err = KeyParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut result = [0; $size];
                parse_key(s, &mut result).map(|_| $ty(HexData(result)))
            }
        }

        impl From<[u8; $size]> for $ty {
            fn from(value: [u8; $size]) -> Self {
                $ty(HexData(value))
            }
        }
    };
}

impl_key_from_str!(AesKey, 0x10);
impl_key_from_str!(AesXtsKey, 0x20);
impl_key_from_str!(TitleKey, 0x10);

impl From<[u8; 0x10]> for EncryptedAesKey {
    fn from(value: [u8; 0x10]) -> Self {
        EncryptedAesKey(HexData(value))
    }
}

impl EncryptedAesKey {
    pub fn as_bytes(&self) -> &[u8; 0x10] {
        &self.0 .0
    }
}

impl AesKey {
    pub fn as_bytes(&self) -> &[u8; 0x10] {
        &self.0 .0
    }

    #[inline]
    fn to_cipher(self) -> Aes128 {
        Aes128::new(GenericArray::from_slice(&self.0 .0))
    }

    fn decrypt_block(&self, mut block: [u8; 0x10]) -> [u8; 0x10] {
        self.to_cipher()
            .decrypt_block(GenericArray::from_mut_slice(&mut block));
        block
    }

    fn encrypt_block(&self, mut block: [u8; 0x10]) -> [u8; 0x10] {
        self.to_cipher()
            .encrypt_block(GenericArray::from_mut_slice(&mut block));
        block
    }

    /// Decrypts a key from the key area (AES-128-ECB, single block).
    pub fn decrypt_key(&self, key: EncryptedAesKey) -> AesKey {
        AesKey(HexData(self.decrypt_block(key.0 .0)))
    }

    pub fn encrypt_key(&self, key: AesKey) -> EncryptedAesKey {
        EncryptedAesKey(HexData(self.encrypt_block(key.0 .0)))
    }

    /// Applies the AES-128-CTR keystream to `data`.
    ///
    /// `counter` is the big-endian 128-bit counter of the first block in `data`.
    /// Encryption and decryption are the same operation.
    pub fn apply_ctr(&self, data: &mut [u8], counter: &[u8; 0x10]) {
        let mut cipher = Aes128Ctr::new(
            GenericArray::from_slice(&self.0 .0),
            GenericArray::from_slice(counter),
        );
        cipher.apply_keystream(data);
    }
}

impl TitleKey {
    pub fn decrypt(&self, title_kek: AesKey) -> AesKey {
        title_kek.decrypt_key(EncryptedAesKey(self.0))
    }
}

fn get_tweak(mut sector: u64) -> [u8; 0x10] {
    let mut tweak = [0; 0x10];
    for tweak in tweak.iter_mut().rev() {
        // Nintendo stores the sector index big-endian
        *tweak = (sector & 0xFF) as u8;
        sector >>= 8;
    }
    tweak
}

impl AesXtsKey {
    pub fn from_halves(data_key: AesKey, tweak_key: AesKey) -> Self {
        let mut key = [0; 0x20];
        key[..0x10].copy_from_slice(data_key.as_bytes());
        key[0x10..].copy_from_slice(tweak_key.as_bytes());
        AesXtsKey(HexData(key))
    }

    #[inline]
    fn to_crypter(self) -> Xts128<Aes128> {
        let key1 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x00..0x10]));
        let key2 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x10..0x20]));
        Xts128::<Aes128>::new(key1, key2)
    }

    /// Decrypts consecutive sectors in place, the first one having index `sector`.
    ///
    /// `data` must be a multiple of `sector_size` long.
    pub fn decrypt(&self, data: &mut [u8], sector: u64, sector_size: usize) {
        assert_eq!(
            data.len() % sector_size,
            0,
            "Length must be multiple of sectors!"
        );

        let crypter = self.to_crypter();
        for (i, chunk) in data.chunks_exact_mut(sector_size).enumerate() {
            crypter.decrypt_sector(chunk, get_tweak(sector + i as u64));
        }
    }

    pub fn encrypt(&self, data: &mut [u8], sector: u64, sector_size: usize) {
        assert_eq!(
            data.len() % sector_size,
            0,
            "Length must be multiple of sectors!"
        );

        let crypter = self.to_crypter();
        for (i, chunk) in data.chunks_exact_mut(sector_size).enumerate() {
            crypter.encrypt_sector(chunk, get_tweak(sector + i as u64));
        }
    }
}

pub fn sha256(data: &[u8]) -> [u8; SHA256_DIGEST_SIZE] {
    let mut hash = [0; SHA256_DIGEST_SIZE];
    hash.copy_from_slice(&sha2::Sha256::digest(data));
    hash
}
