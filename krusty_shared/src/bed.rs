// Bed plane fitted from probe samples.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbePoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum BedError {
    #[error("need at least 3 probe points, got {0}")]
    TooFewPoints(usize),
    #[error("probe points do not define a plane")]
    Degenerate,
}

/// z = a*x + b*y + c
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BedEquation {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

fn det3(m: [[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

impl BedEquation {
    pub const FLAT: BedEquation = BedEquation { a: 0.0, b: 0.0, c: 0.0 };

    /// Least-squares plane through the points (exact for three).
    pub fn fit(points: &[ProbePoint]) -> Result<Self, BedError> {
        if points.len() < 3 {
            return Err(BedError::TooFewPoints(points.len()));
        }
        let (mut sx, mut sy, mut sz) = (0.0, 0.0, 0.0);
        let (mut sxx, mut syy, mut sxy, mut sxz, mut syz) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for p in points {
            sx += p.x;
            sy += p.y;
            sz += p.z;
            sxx += p.x * p.x;
            syy += p.y * p.y;
            sxy += p.x * p.y;
            sxz += p.x * p.z;
            syz += p.y * p.z;
        }
        let n = points.len() as f64;
        let m = [[sxx, sxy, sx], [sxy, syy, sy], [sx, sy, n]];
        let rhs = [sxz, syz, sz];
        let det = det3(m);
        if det.abs() < 1e-6 {
            return Err(BedError::Degenerate);
        }
        // Cramer's rule
        let solve = |col: usize| {
            let mut mc = m;
            for (row, value) in rhs.iter().enumerate() {
                mc[row][col] = *value;
            }
            det3(mc) / det
        };
        Ok(BedEquation { a: solve(0), b: solve(1), c: solve(2) })
    }

    pub fn height_at(&self, x: f64, y: f64) -> f64 {
        self.a * x + self.b * y + self.c
    }
}

impl std::fmt::Display for BedEquation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Z = {:.5}*X + {:.5}*Y + {:.3}", self.a, self.b, self.c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: f64, y: f64, z: f64) -> ProbePoint {
        ProbePoint { x, y, z }
    }

    #[test]
    fn three_points_give_exact_plane() {
        let eq = BedEquation::fit(&[p(0.0, 0.0, 0.1), p(100.0, 0.0, 0.2), p(0.0, 100.0, 0.3)]).unwrap();
        assert!((eq.a - 0.001).abs() < 1e-9);
        assert!((eq.b - 0.002).abs() < 1e-9);
        assert!((eq.c - 0.1).abs() < 1e-9);
        assert!((eq.height_at(50.0, 50.0) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn four_points_average_out() {
        let eq = BedEquation::fit(&[
            p(0.0, 0.0, 0.0),
            p(100.0, 0.0, 0.0),
            p(0.0, 100.0, 0.0),
            p(100.0, 100.0, 0.4),
        ])
        .unwrap();
        assert!((eq.height_at(50.0, 50.0) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn rejects_too_few_and_collinear() {
        assert_eq!(BedEquation::fit(&[p(0.0, 0.0, 0.0)]), Err(BedError::TooFewPoints(1)));
        assert_eq!(
            BedEquation::fit(&[p(0.0, 0.0, 0.0), p(10.0, 10.0, 0.0), p(20.0, 20.0, 0.0)]),
            Err(BedError::Degenerate)
        );
    }
}
