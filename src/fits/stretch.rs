//! ZScale contrast stretch.
//!
//! The IRAF `zscale` algorithm: sample the image, sort the samples, fit a line
//! through them with iterative k-sigma rejection and derive display limits
//! from the fitted slope around the median.

use super::hdu::ImagePlane;

/// Parameters of the zscale interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZScale {
    pub samples: usize,
    pub contrast: f64,
    pub max_reject: f64,
    pub min_pixels: usize,
    pub krej: f64,
    pub max_iterations: usize,
}

impl Default for ZScale {
    fn default() -> Self {
        Self {
            samples: 1000,
            contrast: 0.25,
            max_reject: 0.5,
            min_pixels: 5,
            krej: 2.5,
            max_iterations: 5,
        }
    }
}

impl ZScale {
    /// Display limits `(vmin, vmax)` for `data`. Non-finite values are ignored.
    pub fn limits(&self, data: &[f32]) -> (f64, f64) {
        let finite: Vec<f64> = data
            .iter()
            .filter(|v| v.is_finite())
            .map(|&v| v as f64)
            .collect();
        if finite.is_empty() {
            return (0.0, 0.0);
        }

        let stride = ((finite.len() as f64 / self.samples.max(1) as f64).max(1.0)) as usize;
        let mut samples: Vec<f64> = finite
            .iter()
            .step_by(stride)
            .take(self.samples)
            .copied()
            .collect();
        samples.sort_by(f64::total_cmp);

        let npix = samples.len();
        let mut vmin = samples[0];
        let mut vmax = samples[npix - 1];

        let min_pixels = self.min_pixels.max((npix as f64 * self.max_reject) as usize);
        let ngrow = ((npix as f64 * 0.01) as usize).max(1);

        let mut bad = vec![false; npix];
        let mut good = npix;
        let mut last_good = npix + 1;
        let mut slope = None;

        for _ in 0..self.max_iterations {
            if good >= last_good || good < min_pixels {
                break;
            }

            let Some((fit_slope, intercept)) = fit_line(&samples, &bad) else {
                break;
            };
            slope = Some(fit_slope);

            let flat: Vec<f64> = samples
                .iter()
                .enumerate()
                .map(|(i, v)| v - (intercept + fit_slope * i as f64))
                .collect();
            let threshold = self.krej * std_dev(&flat, &bad);

            for (flag, residual) in bad.iter_mut().zip(&flat) {
                if *residual < -threshold || *residual > threshold {
                    *flag = true;
                }
            }
            bad = dilate(&bad, ngrow);

            last_good = good;
            good = bad.iter().filter(|b| !**b).count();
        }

        if let Some(mut slope) = slope {
            if good >= min_pixels {
                if self.contrast > 0.0 {
                    slope /= self.contrast;
                }
                let center = (npix - 1) / 2;
                let median = median_of_sorted(&samples);
                vmin = vmin.max(median - (center as f64 - 1.0) * slope);
                vmax = vmax.min(median + (npix - center) as f64 * slope);
            }
        }

        (vmin, vmax)
    }

    /// Map `plane` through its zscale interval to 8-bit intensities.
    ///
    /// Values are clipped to `[0, 1]`, scaled by 255 and truncated. NaN maps
    /// to 0, as does everything when the interval is empty.
    pub fn to_u8(&self, plane: &ImagePlane) -> Vec<u8> {
        let (vmin, vmax) = self.limits(&plane.data);
        let range = vmax - vmin;

        plane
            .data
            .iter()
            .map(|&v| {
                let v = v as f64;
                if !v.is_finite() || range <= 0.0 {
                    return 0;
                }
                let scaled = ((v - vmin) / range).clamp(0.0, 1.0);
                (scaled * 255.0) as u8
            })
            .collect()
    }
}

/// Least-squares line through the unmasked samples, indexed by position.
fn fit_line(samples: &[f64], bad: &[bool]) -> Option<(f64, f64)> {
    let (mut n, mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (i, (&y, &masked)) in samples.iter().zip(bad).enumerate() {
        if masked {
            continue;
        }
        let x = i as f64;
        n += 1.0;
        sx += x;
        sy += y;
        sxx += x * x;
        sxy += x * y;
    }
    let denom = n * sxx - sx * sx;
    if n < 2.0 || denom == 0.0 {
        return None;
    }
    let slope = (n * sxy - sx * sy) / denom;
    let intercept = (sy - slope * sx) / n;
    Some((slope, intercept))
}

fn std_dev(values: &[f64], bad: &[bool]) -> f64 {
    let kept: Vec<f64> = values
        .iter()
        .zip(bad)
        .filter(|(_, masked)| !**masked)
        .map(|(v, _)| *v)
        .collect();
    if kept.is_empty() {
        return 0.0;
    }
    let mean = kept.iter().sum::<f64>() / kept.len() as f64;
    let variance = kept.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / kept.len() as f64;
    variance.sqrt()
}

/// Grow the mask with a box of width `ngrow`, aligned like a centered
/// "same"-mode convolution.
fn dilate(mask: &[bool], ngrow: usize) -> Vec<bool> {
    let len = mask.len() as isize;
    let k = ngrow as isize;
    let offset = (k - 1) / 2;
    (0..len)
        .map(|i| {
            let hi = i + offset;
            let lo = hi - k + 1;
            (lo.max(0)..=hi.min(len - 1)).any(|j| mask[j as usize])
        })
        .collect()
}

fn median_of_sorted(samples: &[f64]) -> f64 {
    let n = samples.len();
    if n % 2 == 1 {
        samples[n / 2]
    } else {
        0.5 * (samples[n / 2 - 1] + samples[n / 2])
    }
}
