//! One-dimensional minimization: bracket a minimum by expansion and
//! contraction from an initial step, then shrink it with golden-section
//! steps accelerated by parabolic interpolation.

use crate::errors::{MorphoError, MorphoResult};

pub const CGOLD: f64 = 0.3819660;
pub const ZEPS: f64 = 1e-10;

/// A triple a < x < b with f(x) below both ends.
#[derive(Debug, Clone, Copy)]
pub struct Bracket {
    pub a: f64,
    pub x: f64,
    pub b: f64,
    pub fa: f64,
    pub fx: f64,
    pub fb: f64,
}

/// Brackets a minimum of `f` starting from the triple (0, step, 2·step),
/// halving or doubling the interior point up to `max_tries` times.
pub fn bracket<F>(f: &mut F, step: f64, max_tries: u32) -> MorphoResult<Bracket>
where
    F: FnMut(f64) -> MorphoResult<f64>,
{
    let mut s1 = step;
    let mut s2 = 2.0 * step;
    let e0 = f(0.0)?;
    let mut e1 = f(s1)?;
    let mut e2 = f(s2)?;
    for _ in 0..max_tries {
        if e1 < e0 && e1 < e2 {
            return Ok(Bracket { a: 0.0, x: s1, b: s2, fa: e0, fx: e1, fb: e2 });
        }
        if e1 >= e0 {
            // No descent yet: contract toward zero.
            s2 = s1;
            e2 = e1;
            s1 *= 0.5;
            e1 = f(s1)?;
        } else {
            // Still descending at the far end: expand.
            s1 = s2;
            e1 = e2;
            s2 *= 2.0;
            e2 = f(s2)?;
        }
    }
    Err(MorphoError::Bracketing(max_tries))
}

/// Brent's method on a bracketed minimum. Returns the abscissa and value of
/// the best point seen.
pub fn brent<F>(f: &mut F, bracket: &Bracket, tol: f64, max_iter: u32) -> MorphoResult<(f64, f64)>
where
    F: FnMut(f64) -> MorphoResult<f64>,
{
    let (mut a, mut b) = (bracket.a.min(bracket.b), bracket.a.max(bracket.b));
    let mut x = bracket.x;
    let mut w = x;
    let mut v = x;
    let mut fx = bracket.fx;
    let mut fw = fx;
    let mut fv = fx;
    let mut d: f64 = 0.0;
    let mut e: f64 = 0.0;

    for _ in 0..max_iter {
        let xm = 0.5 * (a + b);
        let tol1 = tol * x.abs() + ZEPS;
        let tol2 = 2.0 * tol1;
        if (x - xm).abs() <= tol2 - 0.5 * (b - a) {
            break;
        }
        let mut use_golden = true;
        if e.abs() > tol1 {
            // Try a parabola through x, w, v.
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let etemp = e;
            e = d;
            if p.abs() < (0.5 * q * etemp).abs() && p > q * (a - x) && p < q * (b - x) {
                d = p / q;
                let u = x + d;
                if u - a < tol2 || b - u < tol2 {
                    d = tol1.copysign(xm - x);
                }
                use_golden = false;
            }
        }
        if use_golden {
            e = if x >= xm { a - x } else { b - x };
            d = CGOLD * e;
        }
        let u = if d.abs() >= tol1 { x + d } else { x + tol1.copysign(d) };
        let fu = f(u)?;
        if fu <= fx {
            if u >= x {
                a = x;
            } else {
                b = x;
            }
            v = w;
            fv = fw;
            w = x;
            fw = fx;
            x = u;
            fx = fu;
        } else {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu <= fw || w == x {
                v = w;
                fv = fw;
                w = u;
                fw = fu;
            } else if fu <= fv || v == x || v == w {
                v = u;
                fv = fu;
            }
        }
    }
    Ok((x, fx))
}
