/// Calculate the window-spanning exponentially weighted average
///
/// The decay period equals the sample size: weight `w_i = exp(-1 + i/(n-1))`
/// for `i` in `0..n`, normalized to sum to 1 and applied oldest to newest,
/// so the newest price carries `e` times the weight of the oldest.
pub fn calculate_weighted_ema(prices: &[f64]) -> Option<f64> {
    match prices.len() {
        0 => None,
        1 => Some(prices[0]),
        n => {
            let span = (n - 1) as f64;
            let weights: Vec<f64> = (0..n).map(|i| (-1.0 + i as f64 / span).exp()).collect();
            let total: f64 = weights.iter().sum();

            let ema = prices
                .iter()
                .zip(&weights)
                .map(|(price, weight)| price * weight / total)
                .sum();
            Some(ema)
        }
    }
}

/// Calculate the population standard deviation
///
/// Needs at least two points; a single price has no dispersion to measure.
pub fn calculate_std_dev(prices: &[f64]) -> Option<f64> {
    if prices.len() < 2 {
        return None;
    }

    let n = prices.len() as f64;
    let mean = prices.iter().sum::<f64>() / n;
    let variance = prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt())
}
