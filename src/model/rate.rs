//! Rate functions
//!
//! A rate function maps a reactant's population to a dimensionless
//! factor; the default H-function of a reaction is the product of its
//! reactants' rate functions. The set of variants is closed (adding one
//! means editing the enum), which keeps the propensity hot path
//! monomorphic.

use crate::Population;
use serde::{Deserialize, Serialize};

/// A rate function together with its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RateFunction {
    /// f(x) = 1
    Unit,
    /// f(x) = x
    Linear,
    /// f(x) = x! / (N!(x−N)!), the combinatorial factor of order N
    GilH { n: i32 },
    /// f(x) = x²
    Square,
    /// f(x) = x³
    Cube,
    /// f(x) = x^n
    Pow { n: f64 },
    /// f(x) = x^n / (a + x^n)
    Hill { a: f64, n: f64 },
    /// f(x) = a / (a + x^n)
    InvHill { a: f64, n: f64 },
    /// f(x) = min(a, x)
    Min { a: f64 },
    /// f(x) = max(a, x)
    Max { a: f64 },
    /// f(x) = v if x < thresh, else 1
    Step { thresh: Population, v: f64 },
    /// f(x) = 1 if x < thresh, else v
    Step2 { thresh: Population, v: f64 },
}

const PARAM_EPSILON: f64 = 0.00001;

impl RateFunction {
    /// Combinatorial factor of order `n`, reduced to `Unit`/`Linear` for
    /// the degenerate orders.
    pub fn gil_h(n: i32) -> Self {
        match n {
            0 => RateFunction::Unit,
            1 => RateFunction::Linear,
            _ => RateFunction::GilH { n },
        }
    }

    /// Power law, reduced to the specialised forms for n ≈ 0, 1, 2, 3.
    pub fn pow(n: f64) -> Self {
        if n.abs() < PARAM_EPSILON {
            RateFunction::Unit
        } else if (n - 1.0).abs() < PARAM_EPSILON {
            RateFunction::Linear
        } else if (n - 2.0).abs() < PARAM_EPSILON {
            RateFunction::Square
        } else if (n - 3.0).abs() < PARAM_EPSILON {
            RateFunction::Cube
        } else {
            RateFunction::Pow { n }
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, RateFunction::Unit)
    }

    /// Evaluate the function at population `x`.
    pub fn evaluate(&self, x: Population) -> f64 {
        let xf = x as f64;
        match *self {
            RateFunction::Unit => 1.0,
            RateFunction::Linear => xf,
            RateFunction::GilH { n } => match n {
                // abs so that -0 never becomes a −∞ firing time
                2 => (xf * (xf - 1.0) / 2.0).abs(),
                _ => {
                    let mut v = xf;
                    for i in 1..n {
                        v *= (xf - i as f64) / (i as f64 + 1.0);
                    }
                    v
                }
            },
            RateFunction::Square => xf * xf,
            RateFunction::Cube => xf * xf * xf,
            RateFunction::Pow { n } => xf.powf(n),
            RateFunction::Hill { a, n } => {
                let xn = xf.powf(n);
                xn / (xn + a)
            }
            RateFunction::InvHill { a, n } => {
                let xn = xf.powf(n);
                a / (xn + a)
            }
            RateFunction::Min { a } => a.min(xf),
            RateFunction::Max { a } => a.max(xf),
            RateFunction::Step { thresh, v } => {
                if x < thresh {
                    v
                } else {
                    1.0
                }
            }
            RateFunction::Step2 { thresh, v } => {
                if x < thresh {
                    1.0
                } else {
                    v
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gil_h_degenerate_orders() {
        assert_eq!(RateFunction::gil_h(0), RateFunction::Unit);
        assert_eq!(RateFunction::gil_h(1), RateFunction::Linear);
        assert_eq!(RateFunction::gil_h(2), RateFunction::GilH { n: 2 });
    }

    #[test]
    fn test_gil_h_2_is_choose_2() {
        let f = RateFunction::gil_h(2);
        assert_eq!(f.evaluate(0), 0.0);
        assert_eq!(f.evaluate(1), 0.0);
        assert_eq!(f.evaluate(2), 1.0);
        assert_eq!(f.evaluate(100), 4950.0);
    }

    #[test]
    fn test_gil_h_2_never_negative_zero() {
        let f = RateFunction::gil_h(2);
        let v = f.evaluate(1);
        assert!(v == 0.0 && v.is_sign_positive(), "must not return -0");
    }

    #[test]
    fn test_gil_h_3() {
        let f = RateFunction::gil_h(3);
        // x choose 3
        assert_eq!(f.evaluate(3), 1.0);
        assert_eq!(f.evaluate(5), 10.0);
    }

    #[test]
    fn test_pow_specialisation() {
        assert_eq!(RateFunction::pow(0.0), RateFunction::Unit);
        assert_eq!(RateFunction::pow(1.0), RateFunction::Linear);
        assert_eq!(RateFunction::pow(2.0), RateFunction::Square);
        assert_eq!(RateFunction::pow(3.0), RateFunction::Cube);
        assert_eq!(RateFunction::pow(2.5), RateFunction::Pow { n: 2.5 });
        assert_eq!(RateFunction::pow(2.0).evaluate(7), 49.0);
        assert_eq!(RateFunction::pow(3.0).evaluate(4), 64.0);
    }

    #[test]
    fn test_hill_and_invhill_sum_to_one() {
        let h = RateFunction::Hill { a: 10.0, n: 2.0 };
        let ih = RateFunction::InvHill { a: 10.0, n: 2.0 };
        for x in [0, 1, 5, 50] {
            let sum = h.evaluate(x) + ih.evaluate(x);
            assert!((sum - 1.0).abs() < 1e-12, "Hill + InvHill = {} at {}", sum, x);
        }
    }

    #[test]
    fn test_min_max_step() {
        assert_eq!(RateFunction::Min { a: 3.0 }.evaluate(10), 3.0);
        assert_eq!(RateFunction::Min { a: 3.0 }.evaluate(2), 2.0);
        assert_eq!(RateFunction::Max { a: 3.0 }.evaluate(10), 10.0);
        assert_eq!(RateFunction::Max { a: 3.0 }.evaluate(2), 3.0);
        let step = RateFunction::Step { thresh: 5, v: 0.25 };
        assert_eq!(step.evaluate(4), 0.25);
        assert_eq!(step.evaluate(5), 1.0);
        let step2 = RateFunction::Step2 { thresh: 5, v: 0.25 };
        assert_eq!(step2.evaluate(4), 1.0);
        assert_eq!(step2.evaluate(5), 0.25);
    }
}
