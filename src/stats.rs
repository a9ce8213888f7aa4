//! Robust statistics shared by the site update, the outlier filter and the
//! report. All order statistics sort a copy, so results never depend on the
//! order values were collected in.

/// Scale factor turning a median absolute deviation into a normal sigma.
pub const MAD_TO_SIGMA: f64 = 1.482_602_218_505_602;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let mu = mean(values)?;
    let var = values.iter().map(|v| (v - mu) * (v - mu)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut out = values.to_vec();
    out.sort_by(f64::total_cmp);
    out
}

fn median_of_sorted(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        Some(0.5 * (sorted[n / 2 - 1] + sorted[n / 2]))
    }
}

pub fn median(values: &[f64]) -> Option<f64> {
    median_of_sorted(&sorted(values))
}

/// Median and median absolute deviation.
pub fn median_abs_deviation(values: &[f64]) -> Option<(f64, f64)> {
    let med = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    let mad = median(&deviations)?;
    Some((med, mad))
}

/// Mean after dropping `fraction` of the values from each tail.
pub fn trimmed_mean(values: &[f64], fraction: f64) -> Option<f64> {
    let sorted = sorted(values);
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let cut = ((n as f64) * fraction.clamp(0.0, 0.5)).floor() as usize;
    let kept = if 2 * cut >= n {
        &sorted[n / 2..n / 2 + 1]
    } else {
        &sorted[cut..n - cut]
    };
    mean(kept)
}

/// Root-mean-square of a residual vector.
pub fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = values.iter().map(|&e| e * e).sum();
    (sum_sq / values.len() as f64).sqrt()
}
