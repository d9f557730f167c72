use std::f64::consts::SQRT_2;

/// Standard normal CDF.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

/// P(home wins) under a normal margin model: Φ(margin / sigma).
pub fn win_prob_from_margin(margin_home: f64, sigma: f64) -> f64 {
    if !margin_home.is_finite() {
        return 0.5;
    }
    if !(sigma.is_finite() && sigma > 0.0) {
        return if margin_home > 0.0 {
            1.0
        } else if margin_home < 0.0 {
            0.0
        } else {
            0.5
        };
    }
    normal_cdf(margin_home / sigma).clamp(0.0, 1.0)
}

// Chebyshev fit with fractional error below 1.2e-7 everywhere.
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let r = t * poly.exp();
    if x >= 0.0 { r } else { 2.0 - r }
}
