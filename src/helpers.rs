//! Decimal helpers for order sizing and wire formatting

/// Slack applied before flooring so values like `0.999 * 1000.0 = 998.999..`
/// land on the intended tick. The relative part covers large tick counts.
const FLOOR_SLACK_ABS: f64 = 1e-9;
const FLOOR_SLACK_REL: f64 = 1e-14;

fn pow10(decimals: u32) -> f64 {
    10f64.powi(decimals as i32)
}

/// Truncate `float` to `decimals` places.
pub fn truncate_float(float: f64, decimals: u32) -> f64 {
    let scale = pow10(decimals);
    let raw = float * scale;
    (raw + raw.abs() * FLOOR_SLACK_REL + FLOOR_SLACK_ABS).floor() / scale
}

/// Round `float` half away from zero to `decimals` places.
pub fn round_float(float: f64, decimals: u32) -> f64 {
    let scale = pow10(decimals);
    (float * scale).round() / scale
}

/// Format a value with exactly `decimals` places, as the exchange expects it on the wire.
pub fn format_decimals(value: f64, decimals: u32) -> String {
    format!("{:.*}", decimals as usize, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_float() {
        assert_eq!(truncate_float(1.23456, 3), 1.234);
        assert_eq!(truncate_float(0.999, 3), 0.999);
        assert_eq!(truncate_float(1.0 - 0.001, 3), 0.999);
        assert_eq!(truncate_float(12.0, 0), 12.0);
    }

    #[test]
    fn test_round_float() {
        assert_eq!(round_float(99.96000000001, 2), 99.96);
        assert_eq!(round_float(98.94, 2), 98.94);
        assert_eq!(round_float(1.005001, 2), 1.01);
        assert_eq!(round_float(-1.5, 0), -2.0);
    }

    #[test]
    fn test_format_decimals() {
        assert_eq!(format_decimals(98.0, 2), "98.00");
        assert_eq!(format_decimals(0.999, 4), "0.9990");
    }
}
