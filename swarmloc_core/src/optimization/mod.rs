// swarmloc_core/src/optimization/mod.rs

pub mod graph;
pub mod lm;
pub mod params;
pub mod problem;
pub mod residuals;

/// Scale-free fit quality of a solve: the final cost per keyframe and per
/// residual, square-rooted and divided by `error_normalized`.
pub fn normalized_cost(final_cost: f64, window_size: usize, num_residuals: usize, error_normalized: f64) -> f64 {
    let mut c = final_cost / window_size.max(1) as f64;
    if num_residuals > 1 {
        c /= num_residuals as f64;
    }
    c.sqrt() / error_normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_normalized_cost() {
        assert_abs_diff_eq!(normalized_cost(200.0, 10, 5, 1.0), 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(normalized_cost(40.0, 10, 1, 2.0), 1.0, epsilon = 1e-12);
        assert_eq!(normalized_cost(0.0, 10, 5, 1.0), 0.0);
    }
}
