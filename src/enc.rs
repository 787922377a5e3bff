//! Encrypted Advertising Data: AES-128-CCM sealing of GAP payloads and the
//! persistent key material behind it.
//!
//! Key material is 32 bytes, `key(16) ∥ iv(16)`, stored under the adapter
//! section. The CCM nonce is 13 bytes: the 5-byte randomizer reversed,
//! followed by the low 8 bytes of the IV reversed.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{Read, Result as IoResult, Write};

use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U13, U4};
use ccm::Ccm;
use log::{info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{json, Value};

use crate::gap_data::{data_types, GapData};

type Aes128Ccm = Ccm<aes::Aes128, U4, U13>;

pub const ENC_KEY_MATERIAL_LEN: usize = 32;
pub const RANDOMIZER_LEN: usize = 5;
pub const MIC_LEN: usize = 4;

/// Storage section and key of the encrypted-advertising key material.
pub const STORAGE_SECTION_ADAPTER: &str = "Adapter";
pub const BTIF_STORAGE_KEY_ENCR_DATA: &str = "EncKeyMaterial";

// Additional data over the CCM seal, fixed by the EAD spec.
const ENC_AD: [u8; 1] = [0xea];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncError {
    /// Key material missing or not 32 bytes.
    BadKeyMaterial,
    SealFailed,
    OpenFailed,
    /// Sealed blob too short to carry randomizer and MIC.
    MalformedSealedData,
}

impl Display for EncError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            EncError::BadKeyMaterial => write!(f, "bad encrypted-advertising key material"),
            EncError::SealFailed => write!(f, "AES-CCM seal failed"),
            EncError::OpenFailed => write!(f, "AES-CCM open failed"),
            EncError::MalformedSealedData => write!(f, "malformed sealed data"),
        }
    }
}

impl std::error::Error for EncError {}

/// Generates a fresh 5-byte randomizer. One per seal.
pub fn generate_randomizer() -> [u8; RANDOMIZER_LEN] {
    let mut randomizer = [0u8; RANDOMIZER_LEN];
    OsRng.fill_bytes(&mut randomizer);
    randomizer
}

fn build_nonce(key_iv: &[u8], randomizer: &[u8; RANDOMIZER_LEN]) -> [u8; 13] {
    let iv = &key_iv[16..];
    let mut nonce = [0u8; 13];
    for (i, b) in randomizer.iter().rev().enumerate() {
        nonce[i] = *b;
    }
    for (i, b) in iv[8..16].iter().rev().enumerate() {
        nonce[RANDOMIZER_LEN + i] = *b;
    }
    nonce
}

/// Seals GAP elements into an ENCRYPTED_ADVERTISING_DATA element:
/// `reverse(randomizer) ∥ ciphertext ∥ MIC`, ciphertext the same length as
/// the serialized plaintext and the MIC 4 bytes.
pub fn seal(
    key_iv: &[u8],
    randomizer: &[u8; RANDOMIZER_LEN],
    data: &[GapData],
) -> Result<GapData, EncError> {
    if key_iv.len() != ENC_KEY_MATERIAL_LEN {
        return Err(EncError::BadKeyMaterial);
    }
    let key = &key_iv[..16];
    let nonce = build_nonce(key_iv, randomizer);

    let mut plaintext = Vec::new();
    for element in data {
        element.serialize(&mut plaintext);
    }

    let cipher = Aes128Ccm::new_from_slice(key).map_err(|_| EncError::BadKeyMaterial)?;
    let sealed = cipher
        .encrypt(
            GenericArray::from_slice(&nonce),
            Payload { msg: &plaintext, aad: &ENC_AD },
        )
        .map_err(|_| EncError::SealFailed)?;

    let mut body = Vec::with_capacity(RANDOMIZER_LEN + sealed.len());
    body.extend(randomizer.iter().rev());
    body.extend_from_slice(&sealed);
    Ok(GapData::new(data_types::ENCRYPTED_ADVERTISING_DATA, body))
}

/// Opens a sealed element back into the serialized plaintext stream,
/// validating the MIC. The inverse of [`seal`].
pub fn open(key_iv: &[u8], sealed: &GapData) -> Result<Vec<u8>, EncError> {
    if key_iv.len() != ENC_KEY_MATERIAL_LEN {
        return Err(EncError::BadKeyMaterial);
    }
    if sealed.data_type != data_types::ENCRYPTED_ADVERTISING_DATA
        || sealed.data.len() < RANDOMIZER_LEN + MIC_LEN
    {
        return Err(EncError::MalformedSealedData);
    }
    let mut randomizer = [0u8; RANDOMIZER_LEN];
    for (i, b) in sealed.data[..RANDOMIZER_LEN].iter().rev().enumerate() {
        randomizer[i] = *b;
    }
    let nonce = build_nonce(key_iv, &randomizer);
    let cipher = Aes128Ccm::new_from_slice(&key_iv[..16]).map_err(|_| EncError::BadKeyMaterial)?;
    cipher
        .decrypt(
            GenericArray::from_slice(&nonce),
            Payload { msg: &sealed.data[RANDOMIZER_LEN..], aad: &ENC_AD },
        )
        .map_err(|_| EncError::OpenFailed)
}

/// Accumulates the three LE_RAND completions that assemble fresh key
/// material: iterations 1 and 2 fill the key, iteration 3 the IV.
#[derive(Default)]
pub struct KeyMaterialBuilder {
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl KeyMaterialBuilder {
    pub fn new() -> Self {
        KeyMaterialBuilder::default()
    }

    pub fn push_rand(&mut self, iteration: u8, random: u64) {
        let bytes = random.to_le_bytes();
        match iteration {
            1 => self.key = bytes.to_vec(),
            2 => self.key.extend_from_slice(&bytes),
            // One random quadword widened to the 16-byte IV slot; the EAD
            // nonce only consumes the low half of the IV.
            3 => self.iv = [bytes, bytes].concat(),
            _ => warn!("Unexpected key material iteration {}", iteration),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.key.len() + self.iv.len() == ENC_KEY_MATERIAL_LEN
    }

    pub fn into_bytes(self) -> Vec<u8> {
        [self.key, self.iv].concat()
    }
}

/// Persistent key/value storage under the adapter profile.
pub trait KeyStore {
    fn get_bin(&self, section: &str, key: &str) -> Option<Vec<u8>>;
    fn set_bin(&mut self, section: &str, key: &str, value: &[u8]) -> IoResult<()>;

    fn has_property(&self, section: &str, key: &str) -> bool {
        self.get_bin(section, key).is_some()
    }
}

/// In-memory store, used in tests and by embedders without persistence.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: HashMap<(String, String), Vec<u8>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        MemoryKeyStore::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn get_bin(&self, section: &str, key: &str) -> Option<Vec<u8>> {
        self.entries.get(&(section.to_string(), key.to_string())).cloned()
    }

    fn set_bin(&mut self, section: &str, key: &str, value: &[u8]) -> IoResult<()> {
        self.entries.insert((section.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }
}

/// JSON-file-backed store. Values are hex strings keyed by section and
/// property name.
pub struct FileKeyStore {
    path: String,
    cache: HashMap<(String, String), Vec<u8>>,
}

impl FileKeyStore {
    pub fn new(path: String) -> Self {
        let mut store = FileKeyStore { path, cache: HashMap::new() };
        if store.load().is_err() {
            warn!("Failed to load key store; starting empty");
        }
        store
    }

    fn load(&mut self) -> IoResult<()> {
        let mut file = File::open(&self.path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let json = serde_json::from_str::<Value>(contents.as_str())?;
        if let Some(sections) = json.as_object() {
            for (section, entries) in sections {
                if let Some(entries) = entries.as_object() {
                    for (key, value) in entries {
                        if let Some(bytes) = value.as_str().and_then(hex_decode) {
                            self.cache.insert((section.clone(), key.clone()), bytes);
                        }
                    }
                }
            }
            info!("Loaded key store from {}", self.path);
        }
        Ok(())
    }

    fn store(&self) -> IoResult<()> {
        let mut sections = serde_json::Map::new();
        for ((section, key), value) in &self.cache {
            sections
                .entry(section.clone())
                .or_insert_with(|| json!({}))
                .as_object_mut()
                .expect("section is an object")
                .insert(key.clone(), Value::String(hex_encode(value)));
        }
        let mut f = File::create(&self.path)?;
        f.write_all(Value::Object(sections).to_string().as_bytes())
    }
}

impl KeyStore for FileKeyStore {
    fn get_bin(&self, section: &str, key: &str) -> Option<Vec<u8>> {
        self.cache.get(&(section.to_string(), key.to_string())).cloned()
    }

    fn set_bin(&mut self, section: &str, key: &str, value: &[u8]) -> IoResult<()> {
        self.cache.insert((section.to_string(), key.to_string()), value.to_vec());
        self.store()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len()).step_by(2).map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok()).collect()
}
