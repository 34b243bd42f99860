//! Polar kernel densities used as a dispersion-free exposure model.
use std::f64::consts::PI;

use crate::model::KernelKind;
use crate::table::Receptor;

impl KernelKind {
    /// Normalizing weight (times 1/pi) so the kernel integrates to one over
    /// the unit disk in polar coordinates.
    pub fn polar_weight(&self) -> f64 {
        match self {
            KernelKind::Uniform => 1.0,
            KernelKind::Triangle => 3.0,
            KernelKind::Epanechnikov => 2.0,
            KernelKind::Triweight => 4.0,
        }
    }

    /// Unnormalized kernel shape at normalized radius `r` in `[0, 1]`.
    pub fn profile(&self, r: f64) -> f64 {
        match self {
            KernelKind::Uniform => 1.0,
            KernelKind::Triangle => 1.0 - r,
            KernelKind::Epanechnikov => 1.0 - r * r,
            KernelKind::Triweight => (1.0 - r * r).powi(3),
        }
    }
}

/// Density at `(x, y)` of a kernel centered at `center` with bandwidth `h`
/// (same units as the coordinates). Zero outside the bandwidth.
pub fn polar_kernel(x: f64, y: f64, h: f64, kind: KernelKind, center: (f64, f64)) -> f64 {
    let r = (x - center.0).hypot(y - center.1) / h;
    if r > 1.0 {
        return 0.0;
    }
    kind.profile(r) * kind.polar_weight() / PI / (h * h)
}

pub fn polar_density(
    receptors: &[Receptor],
    h: f64,
    kind: KernelKind,
    center: (f64, f64),
) -> Vec<f64> {
    receptors
        .iter()
        .map(|r| polar_kernel(r.utm_east, r.utm_north, h, kind, center))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Midpoint-rule integral over the square bounding the disk.
    fn integrate(kind: KernelKind, h: f64, steps: usize) -> f64 {
        let cell = 2.0 * h / steps as f64;
        let mut total = 0.0;
        for i in 0..steps {
            for j in 0..steps {
                let x = -h + (i as f64 + 0.5) * cell;
                let y = -h + (j as f64 + 0.5) * cell;
                total += polar_kernel(x, y, h, kind, (0.0, 0.0));
            }
        }
        total * cell * cell
    }

    #[test]
    fn uniform_peak() {
        let h = 5000.0;
        assert_relative_eq!(
            polar_kernel(0.0, 0.0, h, KernelKind::Uniform, (0.0, 0.0)),
            1.0 / (PI * h * h)
        );
    }

    #[test]
    fn peaks_follow_weights() {
        let h = 2.0;
        for kind in KernelKind::ALL {
            assert_relative_eq!(
                polar_kernel(10.0, 20.0, h, kind, (10.0, 20.0)),
                kind.polar_weight() / (PI * h * h)
            );
        }
    }

    #[test]
    fn zero_outside_bandwidth() {
        for kind in KernelKind::ALL {
            assert_eq!(polar_kernel(3.0, 4.0, 4.9, kind, (0.0, 0.0)), 0.0);
            assert!(polar_kernel(3.0, 4.0, 5.1, kind, (0.0, 0.0)) >= 0.0);
        }
    }

    #[test]
    fn kernels_integrate_to_one() {
        for kind in KernelKind::ALL {
            let total = integrate(kind, 3.0, 1200);
            assert_relative_eq!(total, 1.0, epsilon = 5e-3);
        }
    }

    #[test]
    fn density_for_receptors() {
        let receptors = [Receptor::new(0.0, 0.0), Receptor::new(1000.0, 0.0)];
        let d = polar_density(&receptors, 1000.0, KernelKind::Triangle, (0.0, 0.0));
        assert_relative_eq!(d[0], 3.0 / (PI * 1e6));
        assert_relative_eq!(d[1], 0.0);
    }
}
