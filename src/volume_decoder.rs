use crate::volume::{DataType, Volume, VolumeHeader, VoxelData};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::bufread::MultiGzDecoder;
use ndarray::Array3;
use std::borrow::Cow;
use std::io::Read;
use thiserror::Error;

const HEADER_SIZE: usize = 348;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// NIfTI-1 header field byte offsets.
mod offsets {
    pub const DIM: usize = 40;
    pub const DATATYPE: usize = 70;
    pub const BITPIX: usize = 72;
    pub const PIXDIM: usize = 76;
    pub const VOX_OFFSET: usize = 108;
    pub const CAL_MAX: usize = 124;
    pub const CAL_MIN: usize = 128;
    pub const MAGIC: usize = 344;
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("gzip envelope could not be decompressed: {0}")]
    Decompression(String),

    #[error("buffer too short for a NIfTI-1 header ({0} bytes)")]
    HeaderTooShort(usize),

    #[error("not a NIfTI buffer (sizeof_hdr = {0})")]
    UnrecognizedHeader(i32),

    #[error("NIfTI-2 volumes are not supported")]
    UnsupportedVersion,

    #[error("invalid NIfTI magic {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported datatype code {0}")]
    UnsupportedDataType(i16),

    #[error("bitpix {bitpix} does not match datatype width {expected}")]
    BitpixMismatch { bitpix: i16, expected: i16 },

    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("voxel payload truncated: expected {expected} bytes, found {found}")]
    TruncatedPayload { expected: usize, found: usize },
}

pub struct NiftiDecoder;

impl NiftiDecoder {
    /// Decode a raw `.nii` / `.nii.gz` byte buffer into a [`Volume`].
    ///
    /// Pure transform: probes the gzip envelope, validates the magic
    /// signature, parses the fixed-offset header and reinterprets the voxel
    /// payload per the declared datatype. No slicing or windowing happens
    /// here.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`] if the buffer is not a recognizable NIfTI-1
    /// volume after decompression.
    pub fn decode(raw: &[u8]) -> Result<Volume, FormatError> {
        let bytes: Cow<'_, [u8]> = if raw.starts_with(&GZIP_MAGIC) {
            Cow::Owned(Self::decompress(raw)?)
        } else {
            Cow::Borrowed(raw)
        };

        let header = Self::parse_header(&bytes)?;
        let data = if header.little_endian {
            Self::decode_payload::<LittleEndian>(&bytes, &header)?
        } else {
            Self::decode_payload::<BigEndian>(&bytes, &header)?
        };

        Ok(Volume::new(header, data))
    }

    fn decompress(raw: &[u8]) -> Result<Vec<u8>, FormatError> {
        let mut decoder = MultiGzDecoder::new(raw);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|err| FormatError::Decompression(err.to_string()))?;
        Ok(decompressed)
    }

    fn parse_header(bytes: &[u8]) -> Result<VolumeHeader, FormatError> {
        if bytes.len() < 4 {
            return Err(FormatError::HeaderTooShort(bytes.len()));
        }

        // sizeof_hdr doubles as the endianness probe.
        let sizeof_le = LittleEndian::read_i32(&bytes[0..4]);
        let sizeof_be = BigEndian::read_i32(&bytes[0..4]);
        let little_endian = if sizeof_le == HEADER_SIZE as i32 {
            true
        } else if sizeof_be == HEADER_SIZE as i32 {
            false
        } else if sizeof_le == 540 || sizeof_be == 540 {
            return Err(FormatError::UnsupportedVersion);
        } else {
            return Err(FormatError::UnrecognizedHeader(sizeof_le));
        };

        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::HeaderTooShort(bytes.len()));
        }

        if little_endian {
            Self::parse_fields::<LittleEndian>(bytes, true)
        } else {
            Self::parse_fields::<BigEndian>(bytes, false)
        }
    }

    fn parse_fields<E: ByteOrder>(
        bytes: &[u8],
        little_endian: bool,
    ) -> Result<VolumeHeader, FormatError> {
        use offsets::*;

        let magic = [
            bytes[MAGIC],
            bytes[MAGIC + 1],
            bytes[MAGIC + 2],
            bytes[MAGIC + 3],
        ];
        if &magic != b"n+1\0" && &magic != b"ni1\0" {
            return Err(FormatError::InvalidMagic(magic));
        }

        let mut dim = [0u16; 8];
        for (i, value) in dim.iter_mut().enumerate() {
            let offset = DIM + i * 2;
            let raw = E::read_i16(&bytes[offset..offset + 2]);
            if raw < 0 {
                return Err(FormatError::InvalidDimensions(format!(
                    "dim[{i}] is negative ({raw})"
                )));
            }
            *value = raw as u16;
        }

        if !(3..=7).contains(&dim[0]) {
            return Err(FormatError::InvalidDimensions(format!(
                "rank must be 3..=7, got {}",
                dim[0]
            )));
        }
        if dim[1] == 0 || dim[2] == 0 || dim[3] == 0 {
            return Err(FormatError::InvalidDimensions(format!(
                "spatial extents must be positive, got {}x{}x{}",
                dim[1], dim[2], dim[3]
            )));
        }

        let code = E::read_i16(&bytes[DATATYPE..DATATYPE + 2]);
        let datatype =
            DataType::from_code(code).ok_or(FormatError::UnsupportedDataType(code))?;

        let bitpix = E::read_i16(&bytes[BITPIX..BITPIX + 2]);
        let expected = (datatype.byte_size() * 8) as i16;
        if bitpix != expected {
            return Err(FormatError::BitpixMismatch { bitpix, expected });
        }

        let mut pixdim = [0.0f32; 8];
        for (i, value) in pixdim.iter_mut().enumerate() {
            let offset = PIXDIM + i * 4;
            *value = E::read_f32(&bytes[offset..offset + 4]);
        }

        let vox_offset_raw = E::read_f32(&bytes[VOX_OFFSET..VOX_OFFSET + 4]);
        if !vox_offset_raw.is_finite() || vox_offset_raw < HEADER_SIZE as f32 {
            return Err(FormatError::InvalidDimensions(format!(
                "vox_offset must be at least {HEADER_SIZE}, got {vox_offset_raw}"
            )));
        }

        Ok(VolumeHeader {
            dim,
            pixdim,
            datatype,
            vox_offset: vox_offset_raw as usize,
            cal_min: E::read_f32(&bytes[CAL_MIN..CAL_MIN + 4]),
            cal_max: E::read_f32(&bytes[CAL_MAX..CAL_MAX + 4]),
            little_endian,
        })
    }

    fn decode_payload<E: ByteOrder>(
        bytes: &[u8],
        header: &VolumeHeader,
    ) -> Result<VoxelData, FormatError> {
        let (x, y, z) = header.shape();
        let voxel_count = header.voxel_count();
        let expected = voxel_count * header.datatype.byte_size();
        let found = bytes.len().saturating_sub(header.vox_offset);
        // 4-D files carry extra frames past the first volume; those are fine.
        if found < expected {
            return Err(FormatError::TruncatedPayload { expected, found });
        }

        let payload = &bytes[header.vox_offset..header.vox_offset + expected];
        let shape = (z, y, x);
        let native = header.little_endian == cfg!(target_endian = "little");

        let data = match header.datatype {
            DataType::UInt8 => VoxelData::UInt8(into_array(shape, payload.to_vec())?),
            DataType::Int16 => {
                let values = if native {
                    bytemuck::pod_collect_to_vec(payload)
                } else {
                    let mut values = vec![0i16; voxel_count];
                    E::read_i16_into(payload, &mut values);
                    values
                };
                VoxelData::Int16(into_array(shape, values)?)
            }
            DataType::Int32 => {
                let values = if native {
                    bytemuck::pod_collect_to_vec(payload)
                } else {
                    let mut values = vec![0i32; voxel_count];
                    E::read_i32_into(payload, &mut values);
                    values
                };
                VoxelData::Int32(into_array(shape, values)?)
            }
            DataType::Float32 => {
                let values = if native {
                    bytemuck::pod_collect_to_vec(payload)
                } else {
                    let mut values = vec![0.0f32; voxel_count];
                    E::read_f32_into(payload, &mut values);
                    values
                };
                VoxelData::Float32(into_array(shape, values)?)
            }
            DataType::Float64 => {
                let values = if native {
                    bytemuck::pod_collect_to_vec(payload)
                } else {
                    let mut values = vec![0.0f64; voxel_count];
                    E::read_f64_into(payload, &mut values);
                    values
                };
                VoxelData::Float64(into_array(shape, values)?)
            }
        };

        Ok(data)
    }
}

fn into_array<T>(
    shape: (usize, usize, usize),
    values: Vec<T>,
) -> Result<Array3<T>, FormatError> {
    Array3::from_shape_vec(shape, values)
        .map_err(|err| FormatError::InvalidDimensions(err.to_string()))
}
