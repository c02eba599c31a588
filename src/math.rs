use itertools::izip;
use multiversion::multiversion;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// Stable logistic function.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    let e = (-x.abs()).exp();
    let recip = 1.0 / (1.0 + e);
    if x >= 0.0 {
        recip
    } else {
        e * recip
    }
}

/// Stable `ln(sigmoid(x))`.
#[inline]
pub fn log_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    izip!(a, b).map(|(x, y)| x * y).sum()
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn multiply(x: &[f64], y: &[f64], out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| *out = x * y);
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(y.len() == x.len());
    izip!(x, y).for_each(|(x, y)| {
        *y = a.mul_add(*x, *y);
    });
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn axpy_out(x: &[f64], y: &[f64], a: f64, out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = a.mul_add(*x, *y);
    });
}

/// Returns `((a + b) . x, (a + b) . y)`.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn scalar_prods2(
    positive1: &[f64],
    positive2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = positive1.len();

    assert!(positive2.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, positive2, x, y).fold((0f64, 0f64), |(s1, s2), (a, b, x, y)| {
        (s1 + (a + b) * x, s2 + (a + b) * y)
    })
}

/// Returns `((a - b + c) . x, (a - b + c) . y)`.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn scalar_prods3(
    positive1: &[f64],
    negative1: &[f64],
    positive2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = positive1.len();

    assert!(negative1.len() == n);
    assert!(positive2.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, negative1, positive2, x, y).fold(
        (0f64, 0f64),
        |(s1, s2), (a, b, c, x, y)| (s1 + (a - b + c) * x, s2 + (a - b + c) * y),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn check_logaddexp(x in -10f64..10f64, y in -10f64..10f64) {
            let a = (x.exp() + y.exp()).ln();
            let b = logaddexp(x, y);
            let neginf = f64::NEG_INFINITY;
            let nan = f64::NAN;
            prop_assert!((a - b).abs() < 1e-10);
            prop_assert_eq!(b, logaddexp(y, x));
            prop_assert_eq!(x, logaddexp(x, neginf));
            prop_assert_eq!(logaddexp(neginf, neginf), neginf);
            prop_assert!(logaddexp(nan, x).is_nan());
        }

        #[test]
        fn check_log_sigmoid(x in -50f64..50f64) {
            prop_assert!((log_sigmoid(x) - sigmoid(x).ln()).abs() < 1e-10);
            prop_assert!((sigmoid(x) + sigmoid(-x) - 1.).abs() < 1e-12);
        }
    }

    #[test]
    fn check_neginf() {
        assert_eq!(logaddexp(f64::NEG_INFINITY, 2.), 2.);
        assert_eq!(logaddexp(2., f64::NEG_INFINITY), 2.);
    }

    #[test]
    fn check_sigmoid_extremes() {
        assert_eq!(sigmoid(0.), 0.5);
        assert!(sigmoid(-800.) >= 0.);
        assert!(sigmoid(800.) <= 1.);
        assert!(log_sigmoid(-800.).is_finite());
    }

    #[test]
    fn check_kernels() {
        let x = [1., 2., 3.];
        let y = [4., 5., 6.];
        assert_eq!(vector_dot(&x, &y), 32.);

        let mut out = [0.; 3];
        multiply(&x, &y, &mut out);
        assert_eq!(out, [4., 10., 18.]);

        axpy_out(&x, &y, 2., &mut out);
        assert_eq!(out, [6., 9., 12.]);

        let mut y2 = y;
        axpy(&x, &mut y2, -1.);
        assert_eq!(y2, [3., 3., 3.]);

        let (a, b) = scalar_prods2(&x, &x, &y, &x);
        assert_eq!((a, b), (64., 28.));

        let (a, b) = scalar_prods3(&x, &x, &y, &x, &y);
        assert_eq!((a, b), (32., 77.));
    }
}
