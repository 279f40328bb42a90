//! Host reference math with f64 accumulation, used to validate device
//! results.

use crate::variant::Transpose;

/// `c = alpha * op(a) * op(b) + beta * c`, row-major, `ldc = n`.
///
/// # Panics
/// If a slice is shorter than its operand.
#[allow(clippy::too_many_arguments)]
pub fn ref_gemm(
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    b: &[f32],
    beta: f32,
    c: &mut [f32],
) {
    assert!(a.len() >= m * k && b.len() >= k * n && c.len() >= m * n);
    let a_at = |i: usize, p: usize| match trans_a {
        Transpose::NoTrans => a[i * k + p],
        Transpose::Trans => a[p * m + i],
    };
    let b_at = |p: usize, j: usize| match trans_b {
        Transpose::NoTrans => b[p * n + j],
        Transpose::Trans => b[j * k + p],
    };
    for i in 0..m {
        for j in 0..n {
            let acc: f64 = (0..k)
                .map(|p| f64::from(a_at(i, p)) * f64::from(b_at(p, j)))
                .sum();
            let out = &mut c[i * n + j];
            let prior = if beta == 0.0 { 0.0 } else { f64::from(beta) * f64::from(*out) };
            *out = (f64::from(alpha) * acc + prior) as f32;
        }
    }
}

/// `y = alpha * a * x + beta * y` for a row-major `rows × cols` matrix.
pub fn ref_gemv(rows: usize, cols: usize, alpha: f32, a: &[f32], x: &[f32], beta: f32, y: &mut [f32]) {
    assert!(a.len() >= rows * cols && x.len() >= cols && y.len() >= rows);
    for (r, out) in y.iter_mut().take(rows).enumerate() {
        let acc: f64 = a[r * cols..(r + 1) * cols]
            .iter()
            .zip(x)
            .map(|(&av, &xv)| f64::from(av) * f64::from(xv))
            .sum();
        let prior = if beta == 0.0 { 0.0 } else { f64::from(beta) * f64::from(*out) };
        *out = (f64::from(alpha) * acc + prior) as f32;
    }
}

/// Largest absolute difference between two equally long slices.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemm_transposes_agree() {
        // A = [[1, 2], [3, 4]], B = [[5, 6], [7, 8]]
        let a = [1.0, 2.0, 3.0, 4.0];
        let at = [1.0, 3.0, 2.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let bt = [5.0, 7.0, 6.0, 8.0];
        let expected = [19.0, 22.0, 43.0, 50.0];
        for (ta, a) in [(Transpose::NoTrans, &a), (Transpose::Trans, &at)] {
            for (tb, b) in [(Transpose::NoTrans, &b), (Transpose::Trans, &bt)] {
                let mut c = [0.0; 4];
                ref_gemm(ta, tb, 2, 2, 2, 1.0, a, b, 0.0, &mut c);
                assert_eq!(c, expected);
            }
        }
    }

    #[test]
    fn beta_zero_ignores_nan_in_c() {
        let mut c = [f32::NAN];
        ref_gemm(Transpose::NoTrans, Transpose::NoTrans, 1, 1, 1, 2.0, &[3.0], &[4.0], 0.0, &mut c);
        assert_eq!(c, [24.0]);
    }

    #[test]
    fn gemv_scales_existing_output() {
        let mut y = [1.0, 2.0];
        ref_gemv(2, 2, 1.0, &[1.0, 1.0, 2.0, 2.0], &[1.0, 2.0], 0.5, &mut y);
        assert_eq!(y, [3.5, 7.0]);
        assert_eq!(max_abs_diff(&y, &[3.0, 7.5]), 0.5);
    }
}
