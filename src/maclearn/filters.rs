//! Image filters used to build per-voxel features.
//!
//! Arrays are `[z, y, x]`; spacing is given as `[x, y, z]` in mm. Every
//! filter replicates the edge voxel at the border, so results depend only
//! on the input.

use ndarray::{Array3, Axis, Zip};

/// Spacing of array axis `axis` given `[x, y, z]` spacing
fn axis_spacing(spacing: [f64; 3], axis: usize) -> f64 {
    spacing[2 - axis]
}

fn gaussian_kernel(sigma_voxels: f64) -> Vec<f32> {
    if sigma_voxels <= 0.0 {
        return vec![1.0];
    }
    let radius = (3.0 * sigma_voxels).ceil().max(1.0) as isize;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|i| (-(i * i) as f64 / (2.0 * sigma_voxels * sigma_voxels)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| (w / total) as f32).collect()
}

/// Correlate along one axis with an odd-length kernel
fn convolve_axis(data: &Array3<f32>, axis: usize, kernel: &[f32]) -> Array3<f32> {
    if data.is_empty() {
        return data.clone();
    }
    let radius = (kernel.len() / 2) as isize;
    let last = data.len_of(Axis(axis)) as isize - 1;
    let mut out = Array3::<f32>::zeros(data.raw_dim());
    for ((z, y, x), value) in out.indexed_iter_mut() {
        let centre = [z, y, x];
        let mut acc = 0.0;
        for (k, weight) in kernel.iter().enumerate() {
            let mut index = centre;
            index[axis] = (centre[axis] as isize + k as isize - radius).clamp(0, last) as usize;
            acc += weight * data[index];
        }
        *value = acc;
    }
    out
}

/// Separable Gaussian smoothing with `sigma` in mm
pub fn gaussian_smooth(data: &Array3<f32>, spacing: [f64; 3], sigma: f64) -> Array3<f32> {
    (0..3).fold(data.clone(), |acc, axis| {
        convolve_axis(&acc, axis, &gaussian_kernel(sigma / axis_spacing(spacing, axis)))
    })
}

/// Central-difference first derivative along array axis `axis`
pub fn derivative(data: &Array3<f32>, spacing: [f64; 3], axis: usize) -> Array3<f32> {
    let h = axis_spacing(spacing, axis) as f32;
    convolve_axis(data, axis, &[-0.5 / h, 0.0, 0.5 / h])
}

/// Gradient components ordered `[d/dx, d/dy, d/dz]`
pub fn gradient(data: &Array3<f32>, spacing: [f64; 3]) -> [Array3<f32>; 3] {
    [
        derivative(data, spacing, 2),
        derivative(data, spacing, 1),
        derivative(data, spacing, 0),
    ]
}

pub fn magnitude(components: &[Array3<f32>; 3]) -> Array3<f32> {
    let mut out = Array3::<f32>::zeros(components[0].raw_dim());
    Zip::from(&mut out)
        .and(&components[0])
        .and(&components[1])
        .and(&components[2])
        .for_each(|o, &a, &b, &c| *o = (a * a + b * b + c * c).sqrt());
    out
}

pub fn gradient_magnitude(data: &Array3<f32>, spacing: [f64; 3]) -> Array3<f32> {
    magnitude(&gradient(data, spacing))
}

/// Gradient magnitude of the image smoothed at `sigma` mm
pub fn gaussian_gradient_magnitude(data: &Array3<f32>, spacing: [f64; 3], sigma: f64) -> Array3<f32> {
    gradient_magnitude(&gaussian_smooth(data, spacing, sigma), spacing)
}

pub fn laplacian(data: &Array3<f32>, spacing: [f64; 3]) -> Array3<f32> {
    let mut out = Array3::<f32>::zeros(data.raw_dim());
    for axis in 0..3 {
        let h = axis_spacing(spacing, axis) as f32;
        let second = convolve_axis(data, axis, &[1.0 / (h * h), -2.0 / (h * h), 1.0 / (h * h)]);
        out += &second;
    }
    out
}

pub fn laplacian_of_gaussian(data: &Array3<f32>, spacing: [f64; 3], sigma: f64) -> Array3<f32> {
    laplacian(&gaussian_smooth(data, spacing, sigma), spacing)
}

/// Magnitude of the 3D Sobel operator
pub fn sobel_magnitude(data: &Array3<f32>) -> Array3<f32> {
    let edge = [-1.0, 0.0, 1.0];
    let smooth = [1.0, 2.0, 1.0];
    let component = |derivative_axis: usize| {
        (0..3).fold(data.clone(), |acc, axis| {
            let kernel: &[f32] = if axis == derivative_axis { &edge } else { &smooth };
            convolve_axis(&acc, axis, kernel)
        })
    };
    magnitude(&[component(2), component(1), component(0)])
}

/// Eigenvalues of a symmetric 3x3 matrix, largest first
pub fn symmetric_eigenvalues(m: [[f64; 3]; 3]) -> [f64; 3] {
    let p1 = m[0][1].powi(2) + m[0][2].powi(2) + m[1][2].powi(2);
    if p1 == 0.0 {
        let mut diagonal = [m[0][0], m[1][1], m[2][2]];
        diagonal.sort_by(|a, b| b.total_cmp(a));
        return diagonal;
    }
    let q = (m[0][0] + m[1][1] + m[2][2]) / 3.0;
    let p2 = (m[0][0] - q).powi(2) + (m[1][1] - q).powi(2) + (m[2][2] - q).powi(2) + 2.0 * p1;
    let p = (p2 / 6.0).sqrt();
    let mut b = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            let identity = if i == j { q } else { 0.0 };
            b[i][j] = (m[i][j] - identity) / p;
        }
    }
    let det = b[0][0] * (b[1][1] * b[2][2] - b[1][2] * b[2][1])
        - b[0][1] * (b[1][0] * b[2][2] - b[1][2] * b[2][0])
        + b[0][2] * (b[1][0] * b[2][1] - b[1][1] * b[2][0]);
    let r = (det / 2.0).clamp(-1.0, 1.0);
    let phi = r.acos() / 3.0;
    let largest = q + 2.0 * p * phi.cos();
    let smallest = q + 2.0 * p * (phi + 2.0 * std::f64::consts::PI / 3.0).cos();
    let middle = 3.0 * q - largest - smallest;
    [largest, middle, smallest]
}

/// Hessian eigenvalue images, largest first
pub fn hessian_eigenvalues(data: &Array3<f32>, spacing: [f64; 3]) -> [Array3<f32>; 3] {
    let first = gradient(data, spacing);
    // second[i][j] = d/dj (d/di f), coordinates ordered x, y, z
    let second: Vec<[Array3<f32>; 3]> = first.iter().map(|d| gradient(d, spacing)).collect();

    let mut eigen = [
        Array3::<f32>::zeros(data.raw_dim()),
        Array3::<f32>::zeros(data.raw_dim()),
        Array3::<f32>::zeros(data.raw_dim()),
    ];
    for (index, _) in data.indexed_iter() {
        let (z, y, x) = index;
        let mut hessian = [[0.0f64; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                let a = second[i][j][[z, y, x]] as f64;
                let b = second[j][i][[z, y, x]] as f64;
                hessian[i][j] = 0.5 * (a + b);
            }
        }
        let values = symmetric_eigenvalues(hessian);
        for (channel, value) in eigen.iter_mut().zip(values) {
            channel[[z, y, x]] = value as f32;
        }
    }
    eigen
}

fn ball_offsets(radius: usize) -> Vec<[isize; 3]> {
    let r = radius as isize;
    let mut offsets = Vec::new();
    for dz in -r..=r {
        for dy in -r..=r {
            for dx in -r..=r {
                if dz * dz + dy * dy + dx * dx <= r * r {
                    offsets.push([dz, dy, dx]);
                }
            }
        }
    }
    offsets
}

fn neighbour(index: [usize; 3], offset: [isize; 3], dim: [usize; 3]) -> Option<[usize; 3]> {
    let mut out = [0usize; 3];
    for axis in 0..3 {
        let value = index[axis] as isize + offset[axis];
        if value < 0 || value >= dim[axis] as isize {
            return None;
        }
        out[axis] = value as usize;
    }
    Some(out)
}

pub fn binary_dilate(mask: &Array3<bool>, radius: usize) -> Array3<bool> {
    let offsets = ball_offsets(radius);
    let (dz, dy, dx) = mask.dim();
    Array3::from_shape_fn(mask.raw_dim(), |(z, y, x)| {
        offsets.iter().any(|offset| {
            neighbour([z, y, x], *offset, [dz, dy, dx]).is_some_and(|n| mask[n])
        })
    })
}

/// Erosion with everything outside the volume treated as foreground
pub fn binary_erode(mask: &Array3<bool>, radius: usize) -> Array3<bool> {
    let offsets = ball_offsets(radius);
    let (dz, dy, dx) = mask.dim();
    Array3::from_shape_fn(mask.raw_dim(), |(z, y, x)| {
        offsets.iter().all(|offset| {
            neighbour([z, y, x], *offset, [dz, dy, dx]).map_or(true, |n| mask[n])
        })
    })
}

/// Morphological closing with a ball of `radius` voxels
pub fn binary_close(mask: &Array3<bool>, radius: usize) -> Array3<bool> {
    binary_erode(&binary_dilate(mask, radius), radius)
}

/// Label codes removed from the brain region
pub const EXCLUDED_LABELS: [i64; 4] = [5, 11, 12, 30];

/// Brain region from a label volume: positive labels outside the closed
/// exclusion mask of negative labels and [`EXCLUDED_LABELS`].
pub fn brain_mask(labels: &Array3<f32>) -> Array3<bool> {
    let exclude = labels.mapv(|v| {
        let label = v.round() as i64;
        label < 0 || EXCLUDED_LABELS.contains(&label)
    });
    let closed = binary_close(&exclude, 2);
    let mut brain = Array3::from_elem(labels.raw_dim(), false);
    Zip::from(&mut brain)
        .and(labels)
        .and(&closed)
        .for_each(|b, &label, &excluded| *b = !excluded && label > 0.0);
    brain
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: [f64; 3] = [1.0, 1.0, 1.0];

    #[test]
    fn test_gaussian_preserves_constant() {
        let data = Array3::from_elem((4, 5, 6), 3.0f32);
        let smoothed = gaussian_smooth(&data, UNIT, 1.0);
        assert!(smoothed.iter().all(|v| (v - 3.0).abs() < 1e-5));
    }

    #[test]
    fn test_gradient_of_ramp() {
        let data = Array3::from_shape_fn((3, 3, 5), |(_, _, x)| 2.0 * x as f32);
        let [gx, gy, gz] = gradient(&data, [2.0, 1.0, 1.0]);
        // 2 per voxel over 2 mm
        assert!((gx[[1, 1, 2]] - 1.0).abs() < 1e-6);
        assert_eq!(gy[[1, 1, 2]], 0.0);
        assert_eq!(gz[[1, 1, 2]], 0.0);
    }

    #[test]
    fn test_laplacian_of_quadratic() {
        let data = Array3::from_shape_fn((5, 5, 5), |(z, _, _)| (z * z) as f32);
        let lap = laplacian(&data, UNIT);
        assert!((lap[[2, 2, 2]] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_symmetric_eigenvalues() {
        let values = symmetric_eigenvalues([[2.0, 1.0, 0.0], [1.0, 2.0, 0.0], [0.0, 0.0, 5.0]]);
        let expected = [5.0, 3.0, 1.0];
        for (v, e) in values.iter().zip(expected) {
            assert!((v - e).abs() < 1e-9, "{values:?}");
        }
        assert_eq!(
            symmetric_eigenvalues([[1.0, 0.0, 0.0], [0.0, 3.0, 0.0], [0.0, 0.0, 2.0]]),
            [3.0, 2.0, 1.0]
        );
    }

    #[test]
    fn test_close_fills_gap() {
        let mut mask = Array3::from_elem((1, 1, 9), false);
        for x in [2, 3, 5, 6] {
            mask[[0, 0, x]] = true;
        }
        let closed = binary_close(&mask, 1);
        assert!(closed[[0, 0, 4]]);
        assert!(!closed[[0, 0, 1]]);
        assert!(!closed[[0, 0, 7]]);
    }

    #[test]
    fn test_brain_mask_excludes_codes() {
        let mut labels = Array3::from_elem((7, 7, 7), 1.0f32);
        labels[[0, 0, 0]] = 0.0;
        labels[[3, 3, 3]] = 11.0;
        let mask = brain_mask(&labels);
        assert!(!mask[[0, 0, 0]]);
        assert!(!mask[[3, 3, 3]]);
        assert!(mask[[6, 6, 6]]);
    }
}
