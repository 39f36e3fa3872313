//! Chi-squared independence testing for variant contingency tables.
//!
//! Self-contained: the statistic, the regularized incomplete gamma function
//! behind its p-value, and nothing else. Series and continued-fraction
//! evaluation follow the standard numerical recipes; both converge in well
//! under the iteration cap for the table sizes experiments produce.

/// Result of a contingency-table independence test.
#[derive(Debug, Clone, Copy)]
pub struct ChiSquared {
    pub statistic: f64,
    pub dof: usize,
    pub p_value: f64,
}

/// Test an r×2 success/failure contingency table for independence.
///
/// Each row is one variant's `(successes, failures)`. Returns `None` when
/// fewer than two rows are present or the table is empty. A table where one
/// column is entirely zero (all successes or all failures) carries no signal
/// and reports statistic 0.0 with p-value 1.0.
pub fn contingency_test(table: &[(u64, u64)]) -> Option<ChiSquared> {
    if table.len() < 2 {
        return None;
    }

    let success_total: u64 = table.iter().map(|(s, _)| s).sum();
    let failure_total: u64 = table.iter().map(|(_, f)| f).sum();
    let grand_total = success_total + failure_total;
    if grand_total == 0 {
        return None;
    }

    let dof = table.len() - 1;
    if success_total == 0 || failure_total == 0 {
        return Some(ChiSquared {
            statistic: 0.0,
            dof,
            p_value: 1.0,
        });
    }

    let grand = grand_total as f64;
    let mut statistic = 0.0;
    for &(successes, failures) in table {
        let row_total = (successes + failures) as f64;
        if row_total == 0.0 {
            continue;
        }
        let expected_success = row_total * success_total as f64 / grand;
        let expected_failure = row_total * failure_total as f64 / grand;
        statistic += (successes as f64 - expected_success).powi(2) / expected_success;
        statistic += (failures as f64 - expected_failure).powi(2) / expected_failure;
    }

    Some(ChiSquared {
        statistic,
        dof,
        p_value: chi_squared_p_value(statistic, dof),
    })
}

/// Upper tail probability P(X > statistic) for X ~ chi-squared(dof).
pub(crate) fn chi_squared_p_value(statistic: f64, dof: usize) -> f64 {
    if statistic <= 0.0 || dof == 0 {
        return 1.0;
    }
    gamma_q(dof as f64 / 2.0, statistic / 2.0)
}

/// Regularized upper incomplete gamma function Q(a, x).
fn gamma_q(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    if x < a + 1.0 {
        1.0 - gamma_p_series(a, x)
    } else {
        gamma_q_continued_fraction(a, x)
    }
}

/// P(a, x) by series expansion; converges fastest for x < a + 1.
fn gamma_p_series(a: f64, x: f64) -> f64 {
    let mut term = 1.0 / a;
    let mut sum = term;
    for n in 1..200 {
        term *= x / (a + n as f64);
        sum += term;
        if term.abs() < sum.abs() * 1e-14 {
            break;
        }
    }
    sum * (-x + a * x.ln() - ln_gamma(a)).exp()
}

/// Q(a, x) by modified Lentz continued fraction; converges fastest for
/// x >= a + 1.
fn gamma_q_continued_fraction(a: f64, x: f64) -> f64 {
    const TINY: f64 = 1e-300;
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / TINY;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..200 {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < TINY {
            d = TINY;
        }
        c = b + an / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < 1e-14 {
            break;
        }
    }
    (-x + a * x.ln() - ln_gamma(a)).exp() * h
}

/// Natural log of the gamma function, Lanczos approximation (g = 5, n = 6).
fn ln_gamma(x: f64) -> f64 {
    const COEFFICIENTS: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_77,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        0.120_865_097_386_617_9e-2,
        -0.539_523_938_495_3e-5,
    ];

    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut y = x;
    let mut series = 1.000_000_000_190_015;
    for coefficient in COEFFICIENTS {
        y += 1.0;
        series += coefficient / y;
    }
    -tmp + (2.506_628_274_631_000_5 * series / x).ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p_value_matches_known_quantiles() {
        // Textbook chi-squared critical values.
        assert!((chi_squared_p_value(3.841, 1) - 0.05).abs() < 1e-3);
        assert!((chi_squared_p_value(6.635, 1) - 0.01).abs() < 1e-3);
        assert!((chi_squared_p_value(5.991, 2) - 0.05).abs() < 1e-3);
        assert!((chi_squared_p_value(18.48, 7) - 0.01).abs() < 1e-2);
    }

    #[test]
    fn test_p_value_degenerate_inputs() {
        assert_eq!(chi_squared_p_value(0.0, 1), 1.0);
        assert_eq!(chi_squared_p_value(-1.0, 1), 1.0);
        assert!(chi_squared_p_value(100.0, 1) < 1e-10);
    }

    #[test]
    fn test_strong_split_is_significant() {
        // 90/100 vs 50/100: statistic ~38.1, wildly significant.
        let result = contingency_test(&[(90, 10), (50, 50)]).unwrap();
        assert_eq!(result.dof, 1);
        assert!((result.statistic - 38.095).abs() < 0.01);
        assert!(result.p_value < 1e-6);
    }

    #[test]
    fn test_weak_split_is_not_significant() {
        // 51/100 vs 49/100: statistic 0.08, p ~0.78.
        let result = contingency_test(&[(51, 49), (49, 51)]).unwrap();
        assert!((result.statistic - 0.08).abs() < 1e-9);
        assert!(result.p_value > 0.5);
    }

    #[test]
    fn test_single_row_returns_none() {
        assert!(contingency_test(&[(10, 5)]).is_none());
        assert!(contingency_test(&[]).is_none());
    }

    #[test]
    fn test_empty_table_returns_none() {
        assert!(contingency_test(&[(0, 0), (0, 0)]).is_none());
    }

    #[test]
    fn test_uniform_column_carries_no_signal() {
        let result = contingency_test(&[(10, 0), (7, 0)]).unwrap();
        assert_eq!(result.statistic, 0.0);
        assert_eq!(result.p_value, 1.0);
    }

    #[test]
    fn test_three_variant_table() {
        let result = contingency_test(&[(80, 20), (50, 50), (20, 80)]).unwrap();
        assert_eq!(result.dof, 2);
        assert!(result.p_value < 1e-6);
    }

    #[test]
    fn test_ln_gamma_known_values() {
        // Γ(1) = Γ(2) = 1, Γ(5) = 24.
        assert!(ln_gamma(1.0).abs() < 1e-10);
        assert!(ln_gamma(2.0).abs() < 1e-10);
        assert!((ln_gamma(5.0) - 24.0f64.ln()).abs() < 1e-10);
        // Γ(0.5) = sqrt(π).
        assert!((ln_gamma(0.5) - std::f64::consts::PI.sqrt().ln()).abs() < 1e-10);
    }
}
