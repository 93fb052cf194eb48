//! Load-time element transforms applied before upload

use half::{bf16, f16};

use super::CpuFeatures;
use crate::dtype::DType;
use crate::error::Result;

/// Conversion applied to a dense payload while it's being loaded
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum LoadTransform {
    /// Upload the payload as-is
    #[default]
    None,
    /// Convert BF16 elements to IEEE half floats
    Fp16MakeIeee,
    /// Convert FP32 elements to IEEE half floats, halving the payload
    Fp32DowncastIeee,
}

impl LoadTransform {
    /// Apply the transform in place
    ///
    /// A transform whose source type doesn't match `dtype` leaves everything
    /// untouched. On success `dtype` becomes `F16` and `data` holds the
    /// converted payload.
    pub fn apply(self, dtype: &mut DType, data: &mut Vec<u8>, features: CpuFeatures) -> Result<()> {
        match (self, *dtype) {
            (Self::Fp16MakeIeee, DType::BF16) => {
                features.require_codec()?;
                for pair in data.chunks_exact_mut(2) {
                    let v = bf16::from_le_bytes([pair[0], pair[1]]).to_f32();
                    pair.copy_from_slice(&f16::from_f32(v).to_le_bytes());
                }
                *dtype = DType::F16;
            }
            (Self::Fp32DowncastIeee, DType::F32) => {
                features.require_f16_conversion()?;
                let count = data.len() / 4;
                for i in 0..count {
                    let src = i * 4;
                    let v = f32::from_le_bytes([
                        data[src],
                        data[src + 1],
                        data[src + 2],
                        data[src + 3],
                    ]);
                    let dst = i * 2;
                    data[dst..dst + 2].copy_from_slice(&f16::from_f32(v).to_le_bytes());
                }
                data.truncate(count * 2);
                *dtype = DType::F16;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_bf16_to_ieee() {
        let src = [1.5f32, -2.0, 0.0, 100.0];
        let mut data: Vec<u8> = src
            .iter()
            .flat_map(|&v| bf16::from_f32(v).to_le_bytes())
            .collect();
        let mut dtype = DType::BF16;
        LoadTransform::Fp16MakeIeee
            .apply(&mut dtype, &mut data, CpuFeatures::all())
            .unwrap();
        assert_eq!(dtype, DType::F16);
        let out: Vec<f32> = data
            .chunks_exact(2)
            .map(|p| f16::from_le_bytes([p[0], p[1]]).to_f32())
            .collect();
        assert_eq!(out, src);
    }

    #[test]
    fn test_fp32_downcast_halves_payload() {
        let src = [0.25f32, 3.0, -7.5];
        let mut data: Vec<u8> = src.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut dtype = DType::F32;
        LoadTransform::Fp32DowncastIeee
            .apply(&mut dtype, &mut data, CpuFeatures::all())
            .unwrap();
        assert_eq!(dtype, DType::F16);
        assert_eq!(data.len(), 6);
        assert_eq!(f16::from_le_bytes([data[4], data[5]]).to_f32(), -7.5);
    }

    #[test]
    fn test_mismatched_source_is_noop() {
        let mut data = vec![1u8, 2, 3, 4];
        let mut dtype = DType::F16;
        LoadTransform::Fp32DowncastIeee
            .apply(&mut dtype, &mut data, CpuFeatures::none())
            .unwrap();
        assert_eq!(dtype, DType::F16);
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_missing_feature() {
        let mut data = vec![0u8; 4];
        let mut dtype = DType::BF16;
        let err = LoadTransform::Fp16MakeIeee
            .apply(&mut dtype, &mut data, CpuFeatures::none())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedHardware { .. }));
        assert_eq!(dtype, DType::BF16);
    }
}
