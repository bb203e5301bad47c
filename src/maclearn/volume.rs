//! Scalar 3D volumes backed by NIfTI files.
//!
//! Voxel data is held as `[z, y, x]` in standard layout so that linear voxel
//! indices are identical for every volume on the same grid.

use std::borrow::Cow;
use std::path::Path;

use ndarray::{Array3, Ix3};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::core::errors::{LogisError, Result};

#[derive(Debug, Clone)]
pub struct Volume {
    data: Array3<f32>,
    /// Voxel size in mm, `[x, y, z]`
    spacing: [f64; 3],
    /// Physical position of voxel `[0, 0, 0]`, `[x, y, z]`
    origin: [f64; 3],
    header: Option<Box<NiftiHeader>>,
}

impl Volume {
    pub fn from_array(data: Array3<f32>, spacing: [f64; 3]) -> Self {
        Self {
            data,
            spacing,
            origin: [0.0; 3],
            header: None,
        }
    }

    pub fn with_origin(mut self, origin: [f64; 3]) -> Self {
        self.origin = origin;
        self
    }

    /// Open a `.nii` / `.nii.gz` file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let image_err = |e: nifti::NiftiError| LogisError::image(path, e.to_string());

        let obj = ReaderOptions::new().read_file(path).map_err(image_err)?;
        let header = Box::new(obj.header().clone());
        let data = obj.into_volume().into_ndarray::<f32>().map_err(image_err)?;

        // A trailing singleton time axis is tolerated.
        let data = match data.ndim() {
            3 => data,
            4 if data.shape()[3] == 1 => data.index_axis_move(ndarray::Axis(3), 0),
            n => {
                return Err(LogisError::image(
                    path,
                    format!("expected a 3D volume, found {n} dimensions"),
                ))
            }
        };
        // [x, y, z] -> [z, y, x]
        let data = data
            .into_dimensionality::<Ix3>()
            .map_err(|e| LogisError::image(path, e.to_string()))?
            .permuted_axes([2, 1, 0]);
        let data = data.as_standard_layout().into_owned();

        let [_, sx, sy, sz, ..] = header.pixdim;
        let origin = if header.sform_code > 0 {
            [header.srow_x[3], header.srow_y[3], header.srow_z[3]]
        } else {
            [header.quatern_x, header.quatern_y, header.quatern_z]
        };
        Ok(Self {
            data,
            spacing: [sx as f64, sy as f64, sz as f64],
            origin: origin.map(|v| v as f64),
            header: Some(header),
        })
    }

    /// Write as NIfTI, reusing the source header when there is one
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let header = self.output_header();
        // [z, y, x] -> [x, y, z]
        let data = self.data.view().permuted_axes([2, 1, 0]);
        nifti::writer::WriterOptions::new(path)
            .reference_header(&header)
            .write_nifti(&data)
            .map_err(|e| LogisError::image(path, e.to_string()))
    }

    fn output_header(&self) -> NiftiHeader {
        let mut header = self
            .header
            .as_deref()
            .cloned()
            .unwrap_or_default();
        let [z, y, x] = self.shape();
        header.dim = [3, x as u16, y as u16, z as u16, 1, 1, 1, 1];
        for (axis, spacing) in self.spacing.iter().enumerate() {
            header.pixdim[axis + 1] = *spacing as f32;
        }
        if header.sform_code > 0 {
            let rows = [&mut header.srow_x, &mut header.srow_y, &mut header.srow_z];
            for (axis, row) in rows.into_iter().enumerate() {
                let sign = if row[axis] < 0.0 { -1.0 } else { 1.0 };
                row[axis] = sign * self.spacing[axis] as f32;
                row[3] = self.origin[axis] as f32;
            }
        } else {
            header.quatern_x = self.origin[0] as f32;
            header.quatern_y = self.origin[1] as f32;
            header.quatern_z = self.origin[2] as f32;
        }
        header
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// `[z, y, x]`
    pub fn shape(&self) -> [usize; 3] {
        let (z, y, x) = self.data.dim();
        [z, y, x]
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Voxels in linear (z-major) order
    pub fn linear(&self) -> Cow<'_, [f32]> {
        match self.data.as_slice() {
            Some(slice) => Cow::Borrowed(slice),
            None => Cow::Owned(self.data.iter().copied().collect()),
        }
    }

    pub fn same_grid(&self, other: &Volume) -> bool {
        self.shape() == other.shape()
    }

    /// New volume on the same grid
    pub fn with_data(&self, data: Array3<f32>) -> Result<Volume> {
        if data.dim() != self.data.dim() {
            return Err(LogisError::alignment(
                "replacement data does not match the volume grid",
                self.len(),
                data.len(),
            ));
        }
        Ok(Volume {
            data,
            spacing: self.spacing,
            origin: self.origin,
            header: self.header.clone(),
        })
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Volume {
        Volume {
            data: self.data.mapv(f),
            spacing: self.spacing,
            origin: self.origin,
            header: self.header.clone(),
        }
    }

    /// Trilinear resampling onto a grid sharing this volume's origin
    pub fn resample_linear(&self, shape: [usize; 3], spacing: [f64; 3]) -> Volume {
        let [sz, sy, sx] = self.shape();
        let mut out = Array3::<f32>::zeros((shape[0], shape[1], shape[2]));
        if self.is_empty() {
            return Volume {
                data: out,
                spacing,
                origin: self.origin,
                header: self.header.clone(),
            };
        }

        let scale = [
            spacing[2] / self.spacing[2],
            spacing[1] / self.spacing[1],
            spacing[0] / self.spacing[0],
        ];
        let limits = [sz, sy, sx];
        for ((z, y, x), value) in out.indexed_iter_mut() {
            let position = [z as f64 * scale[0], y as f64 * scale[1], x as f64 * scale[2]];
            if position.iter().zip(limits).any(|(p, n)| *p > (n - 1) as f64 + 1e-6) {
                continue;
            }
            let mut lower = [0usize; 3];
            let mut frac = [0f64; 3];
            for axis in 0..3 {
                let p = position[axis].min((limits[axis] - 1) as f64);
                lower[axis] = p.floor() as usize;
                frac[axis] = p - lower[axis] as f64;
            }
            let mut acc = 0.0;
            for corner in 0..8 {
                let mut index = [0usize; 3];
                let mut weight = 1.0;
                for axis in 0..3 {
                    let upper = corner >> (2 - axis) & 1 == 1;
                    index[axis] = if upper {
                        (lower[axis] + 1).min(limits[axis] - 1)
                    } else {
                        lower[axis]
                    };
                    weight *= if upper { frac[axis] } else { 1.0 - frac[axis] };
                }
                acc += weight * self.data[index] as f64;
            }
            *value = acc as f32;
        }
        Volume {
            data: out,
            spacing,
            origin: self.origin,
            header: self.header.clone(),
        }
    }
}
