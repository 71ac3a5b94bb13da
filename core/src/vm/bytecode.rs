//! file: core/src/vm/bytecode.rs
//! description: `.yakc` bytecode container.
//!
//! Layout of a blob:
//!
//! ```text
//! magic[2] | varint(len) | version | body
//! body = gzip(postcard(Program))                  magic YC
//! body = nonce[12] | sm4-gcm(gzip(postcard(..)))  magic YE
//! ```
//!
//! Decoding fails closed: any validation error returns `MarshalError` and
//! never a partially decoded program.

use std::io::{Read, Write};

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::AesGcm;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::warn;
use sm4::Sm4;

use crate::error::{MarshalError, VmError};
use crate::vm::op::{Instruction, Program};
use crate::vm::symbol::SymbolTable;

pub const MAGIC_PLAIN: [u8; 2] = [0x59, 0x43];
pub const MAGIC_ENCRYPTED: [u8; 2] = [0x59, 0x45];
pub const ENGINE_VERSION: &str = concat!("yakvm-", env!("CARGO_PKG_VERSION"));

const NONCE_LEN: usize = 12;

type Sm4Gcm = AesGcm<Sm4, U12>;

#[derive(Clone, Default)]
pub struct CodesMarshaller {
    key: Option<[u8; 16]>,
}

impl CodesMarshaller {
    pub fn new() -> Self {
        CodesMarshaller { key: None }
    }

    pub fn with_key(key: [u8; 16]) -> Self {
        CodesMarshaller { key: Some(key) }
    }

    pub fn key(&self) -> Option<&[u8; 16]> {
        self.key.as_ref()
    }

    /// Cheap sniff used before attempting a full decode.
    pub fn is_yakc(bytes: &[u8]) -> bool {
        bytes.len() >= 2 && (bytes[..2] == MAGIC_PLAIN || bytes[..2] == MAGIC_ENCRYPTED)
    }

    pub fn marshal(&self, symbols: &SymbolTable, code: &[Instruction]) -> Result<Vec<u8>, VmError> {
        let program = Program::new(symbols.clone(), code.to_vec());
        self.marshal_program(&program)
    }

    pub fn marshal_program(&self, program: &Program) -> Result<Vec<u8>, VmError> {
        let encoded = postcard::to_allocvec(program).map_err(|e| MarshalError::Encoding(e.to_string()))?;
        let compressed = gzip(&encoded)?;

        let mut out = Vec::with_capacity(compressed.len() + 32);
        match &self.key {
            Some(key) => {
                out.extend_from_slice(&MAGIC_ENCRYPTED);
                write_version(&mut out);
                let cipher = Sm4Gcm::new_from_slice(key).map_err(|_| MarshalError::MissingKey)?;
                let nonce = Sm4Gcm::generate_nonce(&mut OsRng);
                let sealed = cipher.encrypt(&nonce, compressed.as_slice()).map_err(|_| MarshalError::Decrypt)?;
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&sealed);
            }
            None => {
                out.extend_from_slice(&MAGIC_PLAIN);
                write_version(&mut out);
                out.extend_from_slice(&compressed);
            }
        }
        Ok(out)
    }

    pub fn unmarshal(&self, bytes: &[u8]) -> Result<Program, VmError> {
        if bytes.len() < 2 {
            return Err(MarshalError::Truncated.into());
        }
        let magic = [bytes[0], bytes[1]];
        let encrypted = match magic {
            MAGIC_PLAIN => false,
            MAGIC_ENCRYPTED => true,
            other => return Err(MarshalError::BadMagic(other).into()),
        };

        let (version, rest) = read_version(&bytes[2..])?;
        if version != ENGINE_VERSION {
            return Err(MarshalError::VersionMismatch { found: version, expected: ENGINE_VERSION.to_string() }.into());
        }

        let compressed = if encrypted {
            let key = self.key.as_ref().ok_or(MarshalError::MissingKey)?;
            if rest.len() < NONCE_LEN {
                return Err(MarshalError::Truncated.into());
            }
            let (nonce, sealed) = rest.split_at(NONCE_LEN);
            let cipher = Sm4Gcm::new_from_slice(key).map_err(|_| MarshalError::MissingKey)?;
            cipher
                .decrypt(GenericArray::from_slice(nonce), sealed)
                .map_err(|_| MarshalError::Decrypt)?
        } else {
            if self.key.is_some() {
                warn!("yakc blob is not encrypted; ignoring the supplied key");
            }
            rest.to_vec()
        };

        let encoded = gunzip(&compressed)?;
        let program = postcard::from_bytes::<Program>(&encoded).map_err(|e| MarshalError::Encoding(e.to_string()))?;
        Ok(program)
    }
}

impl std::fmt::Debug for CodesMarshaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodesMarshaller").field("encrypted", &self.key.is_some()).finish()
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, MarshalError> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).map_err(|e| MarshalError::Compression(e.to_string()))?;
    enc.finish().map_err(|e| MarshalError::Compression(e.to_string()))
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, MarshalError> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out).map_err(|e| MarshalError::Compression(e.to_string()))?;
    Ok(out)
}

fn write_version(out: &mut Vec<u8>) {
    write_uvarint(out, ENGINE_VERSION.len() as u64);
    out.extend_from_slice(ENGINE_VERSION.as_bytes());
}

fn read_version(bytes: &[u8]) -> Result<(String, &[u8]), MarshalError> {
    let (len, used) = read_uvarint(bytes)?;
    let len = usize::try_from(len).map_err(|_| MarshalError::Truncated)?;
    let rest = &bytes[used..];
    if rest.len() < len {
        return Err(MarshalError::Truncated);
    }
    let version = String::from_utf8(rest[..len].to_vec()).map_err(|e| MarshalError::Encoding(e.to_string()))?;
    Ok((version, &rest[len..]))
}

/// Unsigned LEB128.
pub(crate) fn write_uvarint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

pub(crate) fn read_uvarint(bytes: &[u8]) -> Result<(u64, usize), MarshalError> {
    let mut value = 0u64;
    for (i, b) in bytes.iter().enumerate().take(10) {
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(MarshalError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::builder::CodeBuilder;
    use crate::vm::op::BinaryOp;

    fn sample() -> Program {
        let mut b = CodeBuilder::new();
        b.push(40i64);
        b.push(2i64);
        b.binary(BinaryOp::Add);
        b.define("answer");
        b.finish()
    }

    #[test]
    fn varint_boundaries() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64] {
            let mut buf = Vec::new();
            write_uvarint(&mut buf, v);
            assert_eq!(read_uvarint(&buf).unwrap(), (v, buf.len()));
        }
        assert!(read_uvarint(&[0x80]).is_err());
    }

    #[test]
    fn plain_blob_header() {
        let program = sample();
        let blob = CodesMarshaller::new().marshal(&program.symbols, &program.code).unwrap();
        assert_eq!(&blob[..2], &MAGIC_PLAIN);
        assert_eq!(blob[2] as usize, ENGINE_VERSION.len());
        assert!(CodesMarshaller::is_yakc(&blob));
        assert_eq!(CodesMarshaller::new().unmarshal(&blob).unwrap(), program);
    }

    #[test]
    fn encrypted_blob_needs_the_right_key() {
        let program = sample();
        let blob = CodesMarshaller::with_key([7u8; 16]).marshal_program(&program).unwrap();
        assert_eq!(&blob[..2], &MAGIC_ENCRYPTED);

        let err = CodesMarshaller::new().unmarshal(&blob).unwrap_err();
        assert!(matches!(err, VmError::Marshal(MarshalError::MissingKey)));
        let err = CodesMarshaller::with_key([8u8; 16]).unmarshal(&blob).unwrap_err();
        assert!(matches!(err, VmError::Marshal(MarshalError::Decrypt)));
        assert_eq!(CodesMarshaller::with_key([7u8; 16]).unmarshal(&blob).unwrap(), program);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            CodesMarshaller::new().unmarshal(b"MZ\x00"),
            Err(VmError::Marshal(MarshalError::BadMagic([b'M', b'Z'])))
        ));
        assert!(matches!(CodesMarshaller::new().unmarshal(&[0x59]), Err(VmError::Marshal(MarshalError::Truncated))));

        let mut blob = CodesMarshaller::new().marshal_program(&sample()).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(CodesMarshaller::new().unmarshal(&blob).is_err());
    }

    #[test]
    fn version_mismatch_is_reported() {
        let mut blob = MAGIC_PLAIN.to_vec();
        write_uvarint(&mut blob, 9);
        blob.extend_from_slice(b"yakvm-0.0");
        let err = CodesMarshaller::new().unmarshal(&blob).unwrap_err();
        assert!(matches!(err, VmError::Marshal(MarshalError::VersionMismatch { .. })));
    }
}
