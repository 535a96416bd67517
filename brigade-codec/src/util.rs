use std::thread::JoinHandle;

pub(crate) fn spawn_thread(
    name: impl Into<String>,
    f: impl FnOnce() + Send + 'static,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .expect("failed to spawn thread")
}

/// Converts a sample count between clocks, rounding to the nearest sample.
///
/// The clocks themselves cross rates through this exactly once, at each
/// pipeline's clock start; from then on they advance by exact integer sums.
/// The other callers use it for placeholder frame-snapping and
/// expected-length math, where the converted value describes one chunk
/// rather than accumulated clock state.
pub(crate) fn convert_rate(samples: i64, from_rate: u32, to_rate: u32) -> i64 {
    (samples as f64 * to_rate as f64 / from_rate as f64).round() as i64
}

#[cfg(test)]
mod tests {
    use super::convert_rate;

    #[test]
    fn convert_rate_rounds_to_nearest() {
        assert_eq!(convert_rate(2646, 44_100, 48_000), 2880);
        assert_eq!(convert_rate(2880, 48_000, 44_100), 2646);
        assert_eq!(convert_rate(2880, 48_000, 48_000), 2880);
        assert_eq!(convert_rate(1, 44_100, 48_000), 1);
    }
}
