use crate::enums::Orientation;

use ndarray::Array3;
use ndarray::parallel::prelude::*;
use ndarray::s;
use num_traits::AsPrimitive;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SliceError {
    #[error("slice index {index} out of range for {orientation:?} ({count} slices)")]
    OutOfRange {
        orientation: Orientation,
        index: usize,
        count: usize,
    },
}

/// NIfTI datatype codes supported by the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum DataType {
    UInt8 = 2,
    Int16 = 4,
    Int32 = 8,
    Float32 = 16,
    Float64 = 64,
}

impl DataType {
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            2 => Some(Self::UInt8),
            4 => Some(Self::Int16),
            8 => Some(Self::Int32),
            16 => Some(Self::Float32),
            64 => Some(Self::Float64),
            _ => None,
        }
    }

    /// Size of each voxel in bytes.
    pub const fn byte_size(self) -> usize {
        match self {
            Self::UInt8 => 1,
            Self::Int16 => 2,
            Self::Int32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }
}

/// Fixed-layout NIfTI-1 header fields consumed by the viewer.
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    /// `dim[0]` is the rank; `dim[1..=3]` are the spatial extents (X, Y, Z).
    pub dim: [u16; 8],
    /// `pixdim[1..=3]` are the voxel spacings for the spatial axes.
    pub pixdim: [f32; 8],
    pub datatype: DataType,
    /// Byte offset of the voxel payload within the (decompressed) file.
    pub vox_offset: usize,
    pub cal_min: f32,
    pub cal_max: f32,
    pub little_endian: bool,
}

impl VolumeHeader {
    /// Spatial extents as `(x, y, z)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        (
            self.dim[1] as usize,
            self.dim[2] as usize,
            self.dim[3] as usize,
        )
    }

    pub fn voxel_count(&self) -> usize {
        let (x, y, z) = self.shape();
        x * y * z
    }
}

/// Typed voxel buffer, shaped `(depth, height, width)` so the backing memory
/// is row-major with X fastest-varying (axial-slice-major).
pub enum VoxelData {
    UInt8(Array3<u8>),
    Int16(Array3<i16>),
    Int32(Array3<i32>),
    Float32(Array3<f32>),
    Float64(Array3<f64>),
}

impl VoxelData {
    pub fn len(&self) -> usize {
        match self {
            VoxelData::UInt8(a) => a.len(),
            VoxelData::Int16(a) => a.len(),
            VoxelData::Int32(a) => a.len(),
            VoxelData::Float32(a) => a.len(),
            VoxelData::Float64(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every `stride`-th voxel as f32, in memory order. Non-finite values are
    /// passed through; callers that care filter them out.
    pub fn sample_values(&self, stride: usize) -> Vec<f32> {
        let stride = stride.max(1);
        match self {
            VoxelData::UInt8(a) => sample_as_f32(a, stride),
            VoxelData::Int16(a) => sample_as_f32(a, stride),
            VoxelData::Int32(a) => sample_as_f32(a, stride),
            VoxelData::Float32(a) => sample_as_f32(a, stride),
            VoxelData::Float64(a) => sample_as_f32(a, stride),
        }
    }

    fn intensity_range(&self) -> (f32, f32) {
        match self {
            VoxelData::UInt8(a) => finite_range(a),
            VoxelData::Int16(a) => finite_range(a),
            VoxelData::Int32(a) => finite_range(a),
            VoxelData::Float32(a) => finite_range(a),
            VoxelData::Float64(a) => finite_range(a),
        }
    }
}

fn sample_as_f32<T>(data: &Array3<T>, stride: usize) -> Vec<f32>
where
    T: AsPrimitive<f32>,
{
    data.iter().step_by(stride).map(|&v| v.as_()).collect()
}

fn finite_range<T>(data: &Array3<T>) -> (f32, f32)
where
    T: AsPrimitive<f32> + Send + Sync,
{
    let (min, max) = data
        .into_par_iter()
        .fold(
            || (f32::INFINITY, f32::NEG_INFINITY),
            |(lo, hi), &v| {
                let v: f32 = v.as_();
                if v.is_finite() {
                    (lo.min(v), hi.max(v))
                } else {
                    (lo, hi)
                }
            },
        )
        .reduce(
            || (f32::INFINITY, f32::NEG_INFINITY),
            |a, b| (a.0.min(b.0), a.1.max(b.1)),
        );
    if min.is_finite() && max.is_finite() {
        (min, max)
    } else {
        (0.0, 0.0)
    }
}

/// One extracted 2-D slice. `samples` keeps the element type of the source
/// voxel buffer; windowing happens later.
pub struct SliceSamples {
    pub width: usize,
    pub height: usize,
    pub samples: SampleBuffer,
}

pub enum SampleBuffer {
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

impl SampleBuffer {
    pub fn len(&self) -> usize {
        match self {
            SampleBuffer::UInt8(v) => v.len(),
            SampleBuffer::Int16(v) => v.len(),
            SampleBuffer::Int32(v) => v.len(),
            SampleBuffer::Float32(v) => v.len(),
            SampleBuffer::Float64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Slice counts per orientation, as exposed to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxSlices {
    pub axial: usize,
    pub coronal: usize,
    pub sagittal: usize,
}

/// Header summary delivered once per successful volume load.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub dims: [usize; 3],
    pub pix_dims: [f32; 3],
    pub max_slices: MaxSlices,
    pub cal_min: f32,
    pub cal_max: f32,
    pub global_min: f32,
    pub global_max: f32,
}

pub struct Volume {
    header: VolumeHeader,
    data: VoxelData,
    global_min: f32,
    global_max: f32,
}

impl Volume {
    pub fn new(header: VolumeHeader, data: VoxelData) -> Self {
        let (global_min, global_max) = data.intensity_range();
        Self {
            header,
            data,
            global_min,
            global_max,
        }
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    pub fn voxels(&self) -> &VoxelData {
        &self.data
    }

    /// Spatial extents as `(x, y, z)`.
    pub fn dims(&self) -> (usize, usize, usize) {
        self.header.shape()
    }

    /// Finite intensity range of the whole volume.
    pub fn global_range(&self) -> (f32, f32) {
        (self.global_min, self.global_max)
    }

    /// Number of slices along the axis fixed by `orientation`.
    pub fn slice_count(&self, orientation: Orientation) -> usize {
        let (x, y, z) = self.dims();
        match orientation {
            Orientation::Axial => z,
            Orientation::Coronal => y,
            Orientation::Sagittal => x,
        }
    }

    pub fn info(&self) -> VolumeInfo {
        let (x, y, z) = self.dims();
        VolumeInfo {
            dims: [x, y, z],
            pix_dims: [
                self.header.pixdim[1],
                self.header.pixdim[2],
                self.header.pixdim[3],
            ],
            max_slices: MaxSlices {
                axial: z,
                coronal: y,
                sagittal: x,
            },
            cal_min: self.header.cal_min,
            cal_max: self.header.cal_max,
            global_min: self.global_min,
            global_max: self.global_max,
        }
    }

    /// Extract the 2-D slice at `index` along the axis fixed by `orientation`.
    ///
    /// Axial slices are a contiguous copy of the backing buffer; coronal and
    /// sagittal slices are gathered element-wise. Output dimensions are
    /// axial `X x Y`, coronal `X x Z`, sagittal `Y x Z`.
    pub fn extract_slice(
        &self,
        orientation: Orientation,
        index: usize,
    ) -> Result<SliceSamples, SliceError> {
        let count = self.slice_count(orientation);
        if index >= count {
            return Err(SliceError::OutOfRange {
                orientation,
                index,
                count,
            });
        }

        let (width, height, samples) = match &self.data {
            VoxelData::UInt8(a) => {
                let (w, h, v) = extract_plane(a, orientation, index);
                (w, h, SampleBuffer::UInt8(v))
            }
            VoxelData::Int16(a) => {
                let (w, h, v) = extract_plane(a, orientation, index);
                (w, h, SampleBuffer::Int16(v))
            }
            VoxelData::Int32(a) => {
                let (w, h, v) = extract_plane(a, orientation, index);
                (w, h, SampleBuffer::Int32(v))
            }
            VoxelData::Float32(a) => {
                let (w, h, v) = extract_plane(a, orientation, index);
                (w, h, SampleBuffer::Float32(v))
            }
            VoxelData::Float64(a) => {
                let (w, h, v) = extract_plane(a, orientation, index);
                (w, h, SampleBuffer::Float64(v))
            }
        };

        Ok(SliceSamples {
            width,
            height,
            samples,
        })
    }
}

fn extract_plane<T: Copy>(
    data: &Array3<T>,
    orientation: Orientation,
    index: usize,
) -> (usize, usize, Vec<T>) {
    let view = match orientation {
        Orientation::Axial => data.slice(s![index, .., ..]),
        Orientation::Coronal => data.slice(s![.., index, ..]),
        Orientation::Sagittal => data.slice(s![.., .., index]),
    };
    let (height, width) = view.dim();
    // Axial planes are contiguous in the source; the other two gather.
    let samples = view
        .as_slice()
        .map(<[T]>::to_vec)
        .unwrap_or_else(|| view.iter().copied().collect());
    (width, height, samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_volume() -> Volume {
        // X=4, Y=5, Z=6; voxel value equals its flat index.
        let values: Vec<i16> = (0..4 * 5 * 6).map(|v| v as i16).collect();
        let data = Array3::from_shape_vec((6, 5, 4), values).unwrap();
        let header = VolumeHeader {
            dim: [3, 4, 5, 6, 0, 0, 0, 0],
            pixdim: [0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            datatype: DataType::Int16,
            vox_offset: 352,
            cal_min: 0.0,
            cal_max: 0.0,
            little_endian: true,
        };
        Volume::new(header, VoxelData::Int16(data))
    }

    fn as_i16(samples: &SampleBuffer) -> &[i16] {
        match samples {
            SampleBuffer::Int16(v) => v,
            _ => panic!("expected i16 samples"),
        }
    }

    #[test]
    fn slice_counts_per_orientation() {
        let volume = counting_volume();
        assert_eq!(volume.slice_count(Orientation::Axial), 6);
        assert_eq!(volume.slice_count(Orientation::Coronal), 5);
        assert_eq!(volume.slice_count(Orientation::Sagittal), 4);
    }

    #[test]
    fn axial_slice_is_contiguous_subrange() {
        let volume = counting_volume();
        let (x, y, _) = volume.dims();
        for z in 0..volume.slice_count(Orientation::Axial) {
            let slice = volume.extract_slice(Orientation::Axial, z).unwrap();
            assert_eq!((slice.width, slice.height), (x, y));
            let expected: Vec<i16> = (z * x * y..(z + 1) * x * y).map(|v| v as i16).collect();
            assert_eq!(as_i16(&slice.samples), expected.as_slice());
        }
    }

    #[test]
    fn coronal_slice_gathers_fixed_y() {
        let volume = counting_volume();
        let (x, y_dim, z_dim) = volume.dims();
        for y in 0..volume.slice_count(Orientation::Coronal) {
            let slice = volume.extract_slice(Orientation::Coronal, y).unwrap();
            assert_eq!((slice.width, slice.height), (x, z_dim));
            let samples = as_i16(&slice.samples);
            for z in 0..z_dim {
                for xi in 0..x {
                    let flat = xi + y * x + z * x * y_dim;
                    assert_eq!(samples[xi + z * x], flat as i16);
                }
            }
        }
    }

    #[test]
    fn sagittal_slice_gathers_fixed_x() {
        let volume = counting_volume();
        let (x_dim, y_dim, z_dim) = volume.dims();
        for x in 0..volume.slice_count(Orientation::Sagittal) {
            let slice = volume.extract_slice(Orientation::Sagittal, x).unwrap();
            assert_eq!((slice.width, slice.height), (y_dim, z_dim));
            let samples = as_i16(&slice.samples);
            for z in 0..z_dim {
                for y in 0..y_dim {
                    let flat = x + y * x_dim + z * x_dim * y_dim;
                    assert_eq!(samples[y + z * y_dim], flat as i16);
                }
            }
        }
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let volume = counting_volume();
        let result = volume.extract_slice(Orientation::Sagittal, 4);
        assert_eq!(
            result.err(),
            Some(SliceError::OutOfRange {
                orientation: Orientation::Sagittal,
                index: 4,
                count: 4,
            })
        );
    }

    #[test]
    fn global_range_skips_non_finite() {
        let mut values = vec![1.0f32; 8];
        values[2] = f32::NAN;
        values[5] = f32::INFINITY;
        values[6] = -3.0;
        values[7] = 7.0;
        let data = Array3::from_shape_vec((2, 2, 2), values).unwrap();
        let header = VolumeHeader {
            dim: [3, 2, 2, 2, 0, 0, 0, 0],
            pixdim: [0.0; 8],
            datatype: DataType::Float32,
            vox_offset: 352,
            cal_min: 0.0,
            cal_max: 0.0,
            little_endian: true,
        };
        let volume = Volume::new(header, VoxelData::Float32(data));
        assert_eq!(volume.global_range(), (-3.0, 7.0));
    }
}
