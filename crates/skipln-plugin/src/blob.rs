//! Serialized operator image.
//!
//! Layout, all little-endian:
//!
//! | offset | size              | field                  |
//! |--------|-------------------|------------------------|
//! | 0      | 4                 | layer type tag (u32)   |
//! | 4      | 4                 | parameter type tag     |
//! | 8      | 8                 | `ld` (u64)             |
//! | 16     | 1                 | `has_bias` (0 or 1)    |
//! | 17     | `ld * param_size` | shift                  |
//! |        | `ld * param_size` | scale                  |
//! |        | `ld * param_size` | bias, when present     |
//!
//! Size computation and writing run the same [`PluginBlob::encode`] walk
//! against different sinks, so they cannot disagree.

use half::f16;
use skipln_common::{DataType, Result, SkipLnError};

pub const BLOB_HEADER_LEN: usize = 17;

/// Receives the encoded fields in order.
trait BlobSink {
    fn put(&mut self, bytes: &[u8]);
}

struct ByteCounter(usize);

impl BlobSink for ByteCounter {
    fn put(&mut self, bytes: &[u8]) {
        self.0 += bytes.len();
    }
}

struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl BlobSink for SliceWriter<'_> {
    fn put(&mut self, bytes: &[u8]) {
        let end = self.pos + bytes.len();
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
    }
}

/// Borrowed view of everything an operator persists.
#[derive(Debug, Clone, Copy)]
pub struct PluginBlob<'a> {
    pub layer_type: DataType,
    pub ld: usize,
    pub shift: &'a [f32],
    pub scale: &'a [f32],
    pub bias: Option<&'a [f32]>,
}

/// Owned result of [`PluginBlob::decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBlob {
    pub layer_type: DataType,
    pub param_type: DataType,
    pub ld: usize,
    pub shift: Vec<f32>,
    pub scale: Vec<f32>,
    pub bias: Option<Vec<f32>>,
}

fn param_type_of(layer_type: DataType) -> Result<DataType> {
    layer_type.param_type().ok_or_else(|| SkipLnError::UnsupportedFormat {
        reason: format!("{layer_type} operators cannot be serialized"),
    })
}

impl PluginBlob<'_> {
    fn encode(&self, param_type: DataType, sink: &mut impl BlobSink) {
        sink.put(&self.layer_type.tag().to_le_bytes());
        sink.put(&param_type.tag().to_le_bytes());
        sink.put(&(self.ld as u64).to_le_bytes());
        sink.put(&[u8::from(self.bias.is_some())]);
        for block in [Some(self.shift), Some(self.scale), self.bias].into_iter().flatten() {
            for &v in block {
                match param_type {
                    DataType::Half => sink.put(&f16::from_f32(v).to_le_bytes()),
                    _ => sink.put(&v.to_le_bytes()),
                }
            }
        }
    }

    /// Exact number of bytes [`Self::write_to`] produces.
    pub fn byte_len(&self) -> Result<usize> {
        let param_type = param_type_of(self.layer_type)?;
        let mut counter = ByteCounter(0);
        self.encode(param_type, &mut counter);
        Ok(counter.0)
    }

    /// Write the image into the front of `buf`, returning the bytes written.
    ///
    /// # Errors
    ///
    /// [`SkipLnError::OutOfRange`] when `buf` is too small.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<usize> {
        let param_type = param_type_of(self.layer_type)?;
        let need = self.byte_len()?;
        if buf.len() < need {
            return Err(SkipLnError::OutOfRange {
                what: "serialization buffer",
                index: need,
                limit: buf.len(),
            });
        }
        let mut writer = SliceWriter { buf, pos: 0 };
        self.encode(param_type, &mut writer);
        Ok(writer.pos)
    }

    /// Parse an image produced by [`Self::write_to`].
    ///
    /// # Errors
    ///
    /// [`SkipLnError::Deserialization`] for a short or oversized buffer, an
    /// unknown tag, a parameter type inconsistent with the layer type, a zero
    /// `ld` or a `has_bias` byte other than 0 or 1.
    pub fn decode(data: &[u8]) -> Result<DecodedBlob> {
        if data.len() < BLOB_HEADER_LEN {
            return Err(SkipLnError::deserialization(format!(
                "short header: read {} bytes, need {BLOB_HEADER_LEN}",
                data.len()
            )));
        }
        let malformed = |_| SkipLnError::deserialization("malformed header");
        let layer_tag = u32::from_le_bytes(data[0..4].try_into().map_err(malformed)?);
        let param_tag = u32::from_le_bytes(data[4..8].try_into().map_err(malformed)?);
        let ld = u64::from_le_bytes(data[8..16].try_into().map_err(malformed)?);
        let has_bias = match data[16] {
            0 => false,
            1 => true,
            other => {
                return Err(SkipLnError::deserialization(format!("has_bias byte {other}")));
            }
        };

        let layer_type =
            DataType::from_tag(layer_tag).filter(|t| t.is_compute_precision()).ok_or_else(|| {
                SkipLnError::deserialization(format!("unknown layer type {layer_tag}"))
            })?;
        let param_type = DataType::from_tag(param_tag).ok_or_else(|| {
            SkipLnError::deserialization(format!("unknown param type {param_tag}"))
        })?;
        if layer_type.param_type() != Some(param_type) {
            return Err(SkipLnError::deserialization(format!(
                "param type {param_type} inconsistent with layer type {layer_type}"
            )));
        }

        let ld = usize::try_from(ld)
            .ok()
            .filter(|&ld| ld > 0)
            .ok_or_else(|| SkipLnError::deserialization(format!("invalid ld {ld}")))?;
        let blocks = if has_bias { 3 } else { 2 };
        let expected = ld
            .checked_mul(param_type.size() * blocks)
            .and_then(|n| n.checked_add(BLOB_HEADER_LEN))
            .ok_or_else(|| SkipLnError::deserialization(format!("ld {ld} overflows")))?;
        if data.len() != expected {
            return Err(SkipLnError::deserialization(format!(
                "length mismatch: {} bytes, expected {expected}",
                data.len()
            )));
        }

        let width = param_type.size();
        let mut chunks = data[BLOB_HEADER_LEN..].chunks_exact(ld * width).map(|block| {
            block
                .chunks_exact(width)
                .map(|b| match param_type {
                    DataType::Half => f16::from_le_bytes([b[0], b[1]]).to_f32(),
                    _ => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                })
                .collect::<Vec<f32>>()
        });
        let mut next =
            || chunks.next().ok_or_else(|| SkipLnError::deserialization("truncated weights"));
        let shift = next()?;
        let scale = next()?;
        let bias = if has_bias { Some(next()?) } else { None };

        Ok(DecodedBlob { layer_type, param_type, ld, shift, scale, bias })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(layer_type: DataType, bias: Option<&[f32]>) -> Vec<u8> {
        let blob = PluginBlob {
            layer_type,
            ld: 2,
            shift: &[0.5, -0.5],
            scale: &[1.0, 2.0],
            bias,
        };
        let mut buf = vec![0u8; blob.byte_len().unwrap()];
        assert_eq!(blob.write_to(&mut buf).unwrap(), buf.len());
        buf
    }

    #[test]
    fn header_layout_is_fixed() {
        let buf = image(DataType::Int8, Some(&[0.25, 0.75]));
        assert_eq!(&buf[0..4], &2u32.to_le_bytes());
        assert_eq!(&buf[4..8], &1u32.to_le_bytes());
        assert_eq!(&buf[8..16], &2u64.to_le_bytes());
        assert_eq!(buf[16], 1);
        assert_eq!(buf.len(), BLOB_HEADER_LEN + 3 * 2 * 2);
        // shift comes first
        assert_eq!(&buf[17..19], &f16::from_f32(0.5).to_le_bytes());
    }

    #[test]
    fn decode_restores_fields() {
        let decoded = PluginBlob::decode(&image(DataType::Float, None)).unwrap();
        assert_eq!(decoded.layer_type, DataType::Float);
        assert_eq!(decoded.param_type, DataType::Float);
        assert_eq!(decoded.shift, vec![0.5, -0.5]);
        assert_eq!(decoded.scale, vec![1.0, 2.0]);
        assert_eq!(decoded.bias, None);
    }

    #[test]
    fn truncated_and_padded_images_fail() {
        let buf = image(DataType::Half, Some(&[1.0, 1.0]));
        for len in [0, 5, BLOB_HEADER_LEN, buf.len() - 1] {
            let err = PluginBlob::decode(&buf[..len]).unwrap_err();
            assert!(matches!(err, SkipLnError::Deserialization { .. }), "len {len}");
        }
        let mut longer = buf.clone();
        longer.push(0);
        assert!(PluginBlob::decode(&longer).unwrap_err().to_string().contains("length mismatch"));
    }

    #[test]
    fn corrupt_header_fields_fail() {
        let good = image(DataType::Float, None);

        let mut bad = good.clone();
        bad[0] = 9;
        assert!(PluginBlob::decode(&bad).unwrap_err().to_string().contains("unknown layer type"));

        let mut bad = good.clone();
        bad[4] = 1;
        assert!(PluginBlob::decode(&bad).unwrap_err().to_string().contains("inconsistent"));

        let mut bad = good.clone();
        bad[16] = 2;
        assert!(PluginBlob::decode(&bad).unwrap_err().to_string().contains("has_bias"));

        let mut bad = good;
        bad[8..16].copy_from_slice(&0u64.to_le_bytes());
        assert!(PluginBlob::decode(&bad).unwrap_err().to_string().contains("invalid ld"));
    }

    #[test]
    fn small_buffer_is_rejected() {
        let blob = PluginBlob {
            layer_type: DataType::Float,
            ld: 1,
            shift: &[0.0],
            scale: &[1.0],
            bias: None,
        };
        let mut buf = [0u8; 8];
        assert!(matches!(blob.write_to(&mut buf), Err(SkipLnError::OutOfRange { .. })));
    }
}
