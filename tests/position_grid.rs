// Integration tests for position grid computation

#[cfg(test)]
mod tests {
    use scant_rs::ScanError;
    use scant_rs::motion::{AxisParameters, MAX_DIVISIONS, compute_positions};

    #[test]
    fn test_documented_examples() {
        assert_eq!(compute_positions(0, 100, 5).as_slice(), &[0, 25, 50, 75, 100]);
        assert_eq!(compute_positions(0, 100, 3).as_slice(), &[0, 50, 100]);
        // floor(10 / 3) = 3, so the last stop is 9, not 10.
        assert_eq!(compute_positions(0, 10, 4).as_slice(), &[0, 3, 6, 9]);
    }

    #[test]
    fn test_length_and_bounds_over_a_range_of_inputs() {
        for divisions in 0..40u32 {
            for (min, max) in [(0, 1), (-1000, 1000), (17, 18_000), (i32::MIN / 2, i32::MAX / 2)] {
                let positions = compute_positions(min, max, divisions);
                if divisions < 2 {
                    assert_eq!(positions.as_slice(), &[min, max]);
                    continue;
                }
                assert_eq!(positions.len(), divisions as usize);
                assert_eq!(positions.first(), Some(min));
                let last = positions.last().unwrap();
                assert!(last <= max, "{} > {} for {} divisions", last, max, divisions);
                assert!(i64::from(last) >= i64::from(max) - i64::from(divisions - 1));
                let steps: Vec<i64> = positions
                    .as_slice()
                    .windows(2)
                    .map(|w| i64::from(w[1]) - i64::from(w[0]))
                    .collect();
                assert!(steps.iter().all(|s| *s == steps[0] && *s >= 0));
            }
        }
    }

    #[test]
    fn test_empty_when_bounds_are_out_of_order() {
        assert!(compute_positions(5, 5, 3).is_empty());
        assert!(compute_positions(5, -5, 3).is_empty());
    }

    #[test]
    fn test_parameters_agree_with_compute_positions() {
        let parameters: AxisParameters = "-40:200:7".parse().unwrap();
        assert_eq!(parameters.positions().unwrap(), compute_positions(-40, 200, 7));
        assert!("10:0:3".parse::<AxisParameters>().unwrap().positions().is_err());
    }

    #[test]
    fn test_division_count_is_capped() {
        let largest = AxisParameters::new(-5, 5, MAX_DIVISIONS);
        assert_eq!(largest.positions().unwrap().len(), MAX_DIVISIONS as usize);
        assert!(matches!(
            AxisParameters::new(0, 100, MAX_DIVISIONS + 1).validate(),
            Err(ScanError::InvalidScanParameters(_))
        ));
        assert!(matches!(
            "0:100:4000000000".parse::<AxisParameters>().unwrap().positions(),
            Err(ScanError::InvalidScanParameters(_))
        ));
    }
}
