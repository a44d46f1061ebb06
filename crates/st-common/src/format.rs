//! Canonical number rendering for text report formats.

/// Precision used when a report does not set `decimal_places`.
pub const DEFAULT_DECIMAL_PLACES: usize = 6;

/// Render a statistic value.
///
/// - NaN renders as `nan`, infinities as `inf` / `-inf`
/// - Integral values render as exact integers (`-3`, not `-3.000000`)
/// - Other values use `decimals` significant digits with scientific notation
///   allowed, or exactly `decimals` fractional digits when `allow_scinot` is
///   false
///
/// Never fails; every `f64` has a textual form.
pub fn format_number(val: f64, allow_scinot: bool, decimals: usize) -> String {
    if val.is_nan() {
        return "nan".to_string();
    }
    if val.is_infinite() {
        return if val > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if val.fract() == 0.0 {
        if val.abs() < 9.0e18 {
            return format!("{}", val as i64);
        }
        return format!("{:.0}", val);
    }
    if allow_scinot {
        format_general(val, decimals.max(1))
    } else {
        format!("{:.*}", decimals, val)
    }
}

/// `%g`-style formatting with `precision` significant digits.
fn format_general(val: f64, precision: usize) -> String {
    let sci = format!("{:.*e}", precision - 1, val);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => return sci,
    };

    if exp < -4 || exp >= precision as i32 {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_trailing_zeros(mantissa), sign, exp.abs())
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        trim_trailing_zeros(&format!("{:.*}", decimals, val))
    }
}

fn trim_trailing_zeros(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_special_values() {
        assert_eq!(format_number(f64::NAN, true, 6), "nan");
        assert_eq!(format_number(f64::INFINITY, true, 6), "inf");
        assert_eq!(format_number(f64::NEG_INFINITY, false, 2), "-inf");
    }

    #[test]
    fn test_integral_values_are_exact() {
        assert_eq!(format_number(5.0, true, 2), "5");
        assert_eq!(format_number(-3.0, false, 4), "-3");
        assert_eq!(format_number(0.0, true, 6), "0");
        assert_eq!(format_number(123456789.0, true, 2), "123456789");
    }

    #[test]
    fn test_general_precision() {
        assert_eq!(format_number(0.5, true, 6), "0.5");
        assert_eq!(format_number(3.14159265, true, 3), "3.14");
        assert_eq!(format_number(1234567.5, true, 6), "1.23457e+06");
        assert_eq!(format_number(0.00001234, true, 3), "1.23e-05");
    }

    #[test]
    fn test_fixed_point_forcing() {
        assert_eq!(format_number(3.14159265, false, 2), "3.14");
        assert_eq!(format_number(1234567.5, false, 1), "1234567.5");
        assert_eq!(format_number(0.25, false, 4), "0.2500");
    }

    proptest! {
        #[test]
        fn integral_values_parse_back(v in -1_000_000_000i64..1_000_000_000i64) {
            let rendered = format_number(v as f64, true, 3);
            prop_assert_eq!(rendered.parse::<i64>().unwrap(), v);
        }

        #[test]
        fn fixed_point_has_requested_decimals(v in -1.0e6..1.0e6f64, d in 1usize..8) {
            prop_assume!(v.fract() != 0.0);
            let rendered = format_number(v, false, d);
            let frac = rendered.split('.').nth(1).unwrap_or("");
            prop_assert_eq!(frac.len(), d);
        }
    }
}
