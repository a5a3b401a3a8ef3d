use chrono::{TimeZone, Utc};
use wxpipe_core::{CityTarget, TemperatureUnit};

use super::*;

fn reading(city: &str, temperature: Option<f64>, humidity: Option<f64>) -> RawReading {
    let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    RawReading {
        city: CityTarget::new(city, "US"),
        timestamp: Some(at),
        unit: TemperatureUnit::Celsius,
        temperature,
        feels_like: None,
        temp_min: None,
        temp_max: None,
        pressure: None,
        humidity,
        wind_speed: Some(5.0),
        wind_direction: None,
        condition: Some("Clear".to_owned()),
        description: None,
        fetched_at: at,
        raw_payload: serde_json::Value::Null,
    }
}

fn cleaner() -> Cleaner {
    Cleaner::new(CleaningConfig::default()).expect("default policy is valid")
}

#[test]
fn humidity_above_range_is_clamped_and_flagged() {
    let input = vec![reading("New York", Some(20.0), Some(150.0))];
    let (out, report) = cleaner().clean(&input).unwrap();

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].humidity, Some(100.0));
    assert!(out[0].is_outlier);
    assert_eq!(out[0].outlier_reason.as_deref(), Some(HUMIDITY_OUT_OF_RANGE));
    assert_eq!(
        report,
        CleaningReport {
            dropped: 0,
            flagged: 1
        }
    );
    // input untouched
    assert_eq!(input[0].humidity, Some(150.0));
}

#[test]
fn negative_humidity_is_clamped_to_zero() {
    let (out, _) = cleaner()
        .clean(&[reading("Lima", Some(18.0), Some(-4.0))])
        .unwrap();
    assert_eq!(out[0].humidity, Some(0.0));
    assert!(!out[0].derived.contains_key("dew_point"));
}

#[test]
fn missing_required_fields_are_dropped_and_counted() {
    let mut no_timestamp = reading("Oslo", Some(3.0), Some(60.0));
    no_timestamp.timestamp = None;
    let input = vec![
        reading("Lima", Some(18.0), Some(70.0)),
        reading("Rome", None, Some(40.0)),
        no_timestamp,
        reading("  ", Some(10.0), Some(40.0)),
        reading("Cairo", Some(f64::NAN), Some(20.0)),
    ];
    let (out, report) = cleaner().clean(&input).unwrap();

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].city.name, "Lima");
    assert_eq!(report.dropped, 4);
    assert_eq!(report.dropped + out.len(), input.len());
}

#[test]
fn implausible_temperature_is_flagged_not_altered() {
    let (out, report) = cleaner()
        .clean(&[reading("Death Valley", Some(75.0), Some(5.0))])
        .unwrap();
    assert_eq!(out[0].temperature, 75.0);
    assert_eq!(
        out[0].outlier_reason.as_deref(),
        Some(TEMPERATURE_OUT_OF_RANGE)
    );
    assert_eq!(report.dropped, 0);
}

#[test]
fn temperature_beyond_hard_limit_is_dropped() {
    let (out, report) = cleaner()
        .clean(&[
            reading("Nowhere", Some(-250.0), Some(50.0)),
            reading("Paris", Some(21.0), Some(50.0)),
        ])
        .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(report.dropped, 1);
}

#[test]
fn thresholds_apply_in_celsius_for_kelvin_readings() {
    let mut r = reading("Oslo", Some(290.0), Some(50.0));
    r.unit = TemperatureUnit::Kelvin;
    let (out, report) = cleaner().clean(&[r]).unwrap();
    assert_eq!(out.len(), 1);
    assert!(!out[0].is_outlier, "16.85 °C is plausible");
    assert_eq!(out[0].temperature, 290.0);
    assert_eq!(report.flagged, 0);
}

#[test]
fn zscore_pass_flags_deviant_values() {
    let policy = CleaningConfig {
        zscore_threshold: 1.5,
        ..CleaningConfig::default()
    };
    let input = vec![
        reading("A", Some(10.0), Some(50.0)),
        reading("B", Some(10.0), Some(50.0)),
        reading("C", Some(10.0), Some(50.0)),
        reading("D", Some(30.0), Some(50.0)),
    ];
    let (out, report) = Cleaner::new(policy).unwrap().clean(&input).unwrap();

    let flagged: Vec<_> = out.iter().filter(|r| r.is_outlier).collect();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].city.name, "D");
    assert_eq!(flagged[0].outlier_reason.as_deref(), Some("temperature_zscore"));
    assert_eq!(report.flagged, 1);
    assert_eq!(out.len(), 4, "statistical outliers are never dropped");
}

#[test]
fn range_reasons_precede_zscore_reasons() {
    let policy = CleaningConfig {
        zscore_threshold: 1.5,
        ..CleaningConfig::default()
    };
    let input = vec![
        reading("A", Some(10.0), Some(20.0)),
        reading("B", Some(10.0), Some(20.0)),
        reading("C", Some(10.0), Some(20.0)),
        reading("D", Some(10.0), Some(180.0)),
    ];
    let (out, _) = Cleaner::new(policy).unwrap().clean(&input).unwrap();
    assert_eq!(
        out[3].outlier_reason.as_deref(),
        Some("humidity_out_of_range,humidity_zscore")
    );
}

#[test]
fn uniform_batch_flags_nothing() {
    let input: Vec<_> = (0..12)
        .map(|i| reading(&format!("City{i}"), Some(15.0), Some(40.0)))
        .collect();
    let (out, report) = cleaner().clean(&input).unwrap();
    assert_eq!(out.len(), 12);
    assert_eq!(report.flagged, 0);
}

#[test]
fn cleaning_is_deterministic() {
    let input = vec![
        reading("A", Some(12.0), Some(130.0)),
        reading("B", Some(14.0), Some(40.0)),
        reading("C", None, Some(40.0)),
    ];
    let first = cleaner().clean(&input).unwrap();
    let second = cleaner().clean(&input).unwrap();
    assert_eq!(first, second);
}

#[test]
fn humidity_invariant_holds_for_arbitrary_values() {
    let values = [-1e9, -0.1, 0.0, 42.0, 100.0, 100.1, 1e12, f64::INFINITY];
    let input: Vec<_> = values
        .iter()
        .enumerate()
        .map(|(i, h)| reading(&format!("C{i}"), Some(20.0), Some(*h)))
        .collect();
    let (out, report) = cleaner().clean(&input).unwrap();
    assert_eq!(report.dropped + out.len(), input.len());
    for r in &out {
        if let Some(h) = r.humidity {
            assert!((0.0..=100.0).contains(&h), "humidity {h} escaped the range");
        }
    }
}

#[test]
fn missing_condition_becomes_unknown() {
    let mut r = reading("Oslo", Some(5.0), Some(50.0));
    r.condition = Some("   ".to_owned());
    let (out, _) = cleaner().clean(&[r]).unwrap();
    assert_eq!(out[0].condition, UNKNOWN_CONDITION);
}

#[test]
fn derived_metrics_are_computed() {
    let mut r = reading("Austin", Some(20.0), Some(65.0));
    r.temp_min = Some(17.0);
    r.temp_max = Some(23.5);
    let (out, _) = cleaner().clean(&[r]).unwrap();
    let derived = &out[0].derived;

    assert!((derived["heat_index"] - 19.75).abs() < 0.05, "{derived:?}");
    assert!((derived["dew_point"] - 13.2).abs() < 0.1, "{derived:?}");
    assert!((derived["temp_range"] - 6.5).abs() < 1e-9);
}

#[test]
fn heat_index_uses_regression_when_hot() {
    // 95 °F at 50 % is about 107 °F on the NWS chart.
    let hi = heat_index_c(35.0, 50.0);
    assert!((41.0..43.0).contains(&hi), "heat index {hi}");
}

#[test]
fn mixed_units_are_a_batch_error() {
    let mut kelvin = reading("Oslo", Some(280.0), Some(50.0));
    kelvin.unit = TemperatureUnit::Kelvin;
    let err = cleaner()
        .clean(&[reading("Lima", Some(18.0), Some(50.0)), kelvin])
        .unwrap_err();
    assert!(matches!(err, CleaningError::MixedUnits { .. }));
}

#[test]
fn invalid_policies_are_rejected() {
    let bad_threshold = CleaningConfig {
        zscore_threshold: 0.0,
        ..CleaningConfig::default()
    };
    assert!(matches!(
        Cleaner::new(bad_threshold),
        Err(CleaningError::InvalidPolicy(_))
    ));

    let empty_range = CleaningConfig {
        plausible_min: 10.0,
        plausible_max: 10.0,
        ..CleaningConfig::default()
    };
    assert!(Cleaner::new(empty_range).is_err());
}

#[test]
fn empty_batch_is_fine() {
    let (out, report) = cleaner().clean(&[]).unwrap();
    assert!(out.is_empty());
    assert_eq!(report, CleaningReport::default());
}
