//! GGUF header parsing.
//!
//! Reads only the fixed header and the key/value metadata table that
//! precedes the tensor data section, never the tensor bodies themselves.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use thiserror::Error;

const GGUF_MAGIC: [u8; 4] = *b"GGUF";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not a GGUF file: bad magic bytes")]
    InvalidMagic,
    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),
    #[error("truncated GGUF header")]
    Truncated,
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl From<io::Error> for MetadataError {
    fn from(source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::UnexpectedEof => MetadataError::Truncated,
            _ => MetadataError::Io {
                path: String::new(),
                source,
            },
        }
    }
}

/// Typed fields extracted from a GGUF header, per the recognized keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelMetadata {
    pub architecture: Option<String>,
    pub context_length: Option<u64>,
    pub embedding_length: Option<u64>,
    pub quantization_descriptor: Option<String>,
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum GgufValue {
    UInt(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
}

impl GgufValue {
    fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self {
            GgufValue::UInt(v) => Some(*v),
            GgufValue::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }
}

/// Parse the GGUF header at `path`, reading only up to the end of the
/// key/value metadata table.
pub fn read_metadata(path: &Path) -> Result<ModelMetadata, MetadataError> {
    let file = File::open(path).map_err(|e| MetadataError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut reader = BufReader::new(file);
    parse(&mut reader)
}

fn parse<R: Read>(reader: &mut R) -> Result<ModelMetadata, MetadataError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != GGUF_MAGIC {
        return Err(MetadataError::InvalidMagic);
    }

    let version = read_u32(reader)?;
    if !(1..=3).contains(&version) {
        return Err(MetadataError::UnsupportedVersion(version));
    }

    let tensor_count = read_u64(reader)?;
    let kv_count = read_u64(reader)?;
    // Tensor descriptors are not read here; only the kv table that precedes
    // the tensor data section is parsed. `tensor_count` is consumed only to
    // validate the header shape (a sane file has a bounded count).
    if tensor_count > 10_000_000 {
        return Err(MetadataError::Truncated);
    }

    let mut kv = HashMap::with_capacity(kv_count.min(4096) as usize);
    for _ in 0..kv_count {
        let key = read_string(reader)?;
        let value = read_value(reader)?;
        kv.insert(key, value);
    }

    Ok(extract(&kv))
}

fn extract(kv: &HashMap<String, GgufValue>) -> ModelMetadata {
    let architecture = kv
        .get("general.architecture")
        .and_then(GgufValue::as_str)
        .map(str::to_string);

    let model_name = kv
        .get("general.name")
        .and_then(GgufValue::as_str)
        .map(str::to_string);

    let context_length = architecture
        .as_deref()
        .and_then(|arch| kv.get(&format!("{arch}.context_length")))
        .and_then(GgufValue::as_u64);

    let embedding_length = architecture
        .as_deref()
        .and_then(|arch| kv.get(&format!("{arch}.embedding_length")))
        .and_then(GgufValue::as_u64);

    let quantization_descriptor = kv
        .get("general.file_type")
        .and_then(GgufValue::as_u64)
        .map(describe_file_type)
        .or_else(|| {
            kv.get("general.quantization_version")
                .and_then(GgufValue::as_u64)
                .map(|v| format!("quant-v{v}"))
        });

    ModelMetadata {
        architecture,
        context_length,
        embedding_length,
        quantization_descriptor,
        model_name,
    }
}

/// Maps the `general.file_type` enum to the quantization naming llama.cpp
/// conventionally uses in filenames (best-effort; unknown codes pass through
/// as a numeric descriptor rather than failing the read).
fn describe_file_type(code: u64) -> String {
    match code {
        0 => "F32".to_string(),
        1 => "F16".to_string(),
        2 => "Q4_0".to_string(),
        3 => "Q4_1".to_string(),
        7 => "Q8_0".to_string(),
        8 => "Q5_0".to_string(),
        9 => "Q5_1".to_string(),
        10 => "Q2_K".to_string(),
        11 => "Q3_K_S".to_string(),
        12 => "Q3_K_M".to_string(),
        14 => "Q4_K_M".to_string(),
        16 => "Q5_K_M".to_string(),
        17 => "Q6_K".to_string(),
        other => format!("type-{other}"),
    }
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8, MetadataError> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, MetadataError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32, MetadataError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, MetadataError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64<R: Read>(reader: &mut R) -> Result<i64, MetadataError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R) -> Result<f32, MetadataError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_f64<R: Read>(reader: &mut R) -> Result<f64, MetadataError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, MetadataError> {
    let len = read_u64(reader)?;
    if len > 64 * 1024 * 1024 {
        return Err(MetadataError::Truncated);
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn read_value<R: Read>(reader: &mut R) -> Result<GgufValue, MetadataError> {
    let value_type = read_u32(reader)?;
    read_typed_value(reader, value_type)
}

fn read_typed_value<R: Read>(reader: &mut R, value_type: u32) -> Result<GgufValue, MetadataError> {
    match value_type {
        0 => Ok(GgufValue::UInt(read_u8(reader)? as u64)),
        1 => Ok(GgufValue::Int(read_u8(reader)? as i64)),
        2 => Ok(GgufValue::UInt(read_u32_as_u16(reader)? as u64)),
        3 => Ok(GgufValue::Int(read_i32_as_i16(reader)? as i64)),
        4 => Ok(GgufValue::UInt(read_u32(reader)? as u64)),
        5 => Ok(GgufValue::Int(read_i32(reader)? as i64)),
        6 => Ok(GgufValue::Float(read_f32(reader)? as f64)),
        7 => Ok(GgufValue::Bool(read_u8(reader)? != 0)),
        8 => Ok(GgufValue::String(read_string(reader)?)),
        9 => {
            let element_type = read_u32(reader)?;
            let count = read_u64(reader)?;
            if count > 1_000_000 {
                return Err(MetadataError::Truncated);
            }
            let mut items = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                items.push(read_typed_value(reader, element_type)?);
            }
            Ok(GgufValue::Array(items))
        }
        10 => Ok(GgufValue::UInt(read_u64(reader)?)),
        11 => Ok(GgufValue::Int(read_i64(reader)?)),
        12 => Ok(GgufValue::Float(read_f64(reader)?)),
        other => Err(MetadataError::Truncated.tap_unsupported(other)),
    }
}

// GGUF reserves 16-bit ints (types 2/3) but this crate only needs u64/i64
// scalars downstream, so widen rather than carrying two more enum arms.
fn read_u32_as_u16<R: Read>(reader: &mut R) -> Result<u16, MetadataError> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_i32_as_i16<R: Read>(reader: &mut R) -> Result<i16, MetadataError> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(i16::from_le_bytes(buf))
}

trait TapUnsupported {
    fn tap_unsupported(self, code: u32) -> Self;
}

impl TapUnsupported for MetadataError {
    fn tap_unsupported(self, code: u32) -> Self {
        tracing::warn!(code, "unrecognized GGUF value type");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_string(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    fn sample_header() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC);
        buf.extend_from_slice(&3u32.to_le_bytes()); // version
        buf.extend_from_slice(&0u64.to_le_bytes()); // tensor_count
        buf.extend_from_slice(&3u64.to_le_bytes()); // kv_count

        write_string(&mut buf, "general.architecture");
        buf.extend_from_slice(&8u32.to_le_bytes()); // STRING
        write_string(&mut buf, "llama");

        write_string(&mut buf, "general.name");
        buf.extend_from_slice(&8u32.to_le_bytes());
        write_string(&mut buf, "TestModel");

        write_string(&mut buf, "llama.context_length");
        buf.extend_from_slice(&4u32.to_le_bytes()); // UINT32
        buf.extend_from_slice(&4096u32.to_le_bytes());

        buf
    }

    #[test]
    fn parses_recognized_keys() {
        let data = sample_header();
        let metadata = parse(&mut Cursor::new(data)).unwrap();
        assert_eq!(metadata.architecture.as_deref(), Some("llama"));
        assert_eq!(metadata.model_name.as_deref(), Some("TestModel"));
        assert_eq!(metadata.context_length, Some(4096));
    }

    #[test]
    fn rejects_bad_magic() {
        let data = b"BAD!".to_vec();
        let err = parse(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(err, MetadataError::InvalidMagic));
    }

    #[test]
    fn rejects_truncated_header() {
        let data = GGUF_MAGIC.to_vec();
        let err = parse(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(err, MetadataError::Truncated));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC);
        buf.extend_from_slice(&99u32.to_le_bytes());
        let err = parse(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, MetadataError::UnsupportedVersion(99)));
    }
}
