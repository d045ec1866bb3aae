//! Cleaner behaviour: dedup, key handling, normalization, imputation,
//! outlier correction, and the errors that abort a source.

use chrono::{NaiveDate, NaiveDateTime};
use roadrisk_core::{
    cleaner::Cleaner,
    config::{CleaningConfig, OutlierPolicy},
    error::PipelineError,
    event::{DataQualityIssue, PipelineEvent},
    record::{CleanRecord, RawDataset, RawRecord, TrafficRecord, WeatherRecord},
    schema::SourceSchema,
    types::SourceKind,
};

const WEATHER_COLUMNS: [&str; 10] = [
    "date_time",
    "city",
    "temperature_c",
    "humidity",
    "rain_mm",
    "wind_speed_kmh",
    "visibility_m",
    "air_pressure_hpa",
    "season",
    "weather_condition",
];

const TRAFFIC_COLUMNS: [&str; 9] = [
    "date_time",
    "city",
    "vehicle_count",
    "avg_speed_kmh",
    "accident_count",
    "visibility_m",
    "area",
    "congestion_level",
    "road_condition",
];

fn weather_row(values: [&str; 10]) -> RawRecord {
    RawRecord::from_pairs(WEATHER_COLUMNS.into_iter().zip(values))
}

fn traffic_row(values: [&str; 9]) -> RawRecord {
    RawRecord::from_pairs(TRAFFIC_COLUMNS.into_iter().zip(values))
}

fn weather_dataset(rows: Vec<RawRecord>) -> RawDataset {
    let columns = WEATHER_COLUMNS.iter().map(|c| c.to_string()).collect();
    RawDataset::new(SourceKind::Weather, columns, rows)
}

fn traffic_dataset(rows: Vec<RawRecord>) -> RawDataset {
    let columns = TRAFFIC_COLUMNS.iter().map(|c| c.to_string()).collect();
    RawDataset::new(SourceKind::Traffic, columns, rows)
}

fn weather_cleaner() -> Cleaner {
    Cleaner::new(SourceSchema::weather(), CleaningConfig::default())
}

fn at(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

/// Twenty hourly London readings with one wind outlier, one missing
/// humidity, one thousands separator and one lower-case season.
fn messy_weather() -> RawDataset {
    let rows = (0..20u32)
        .map(|i| {
            let ts = format!("2024-01-01 {:02}:00", i);
            let temp = format!("{}", 5 + i % 5);
            let humidity = if i == 11 { String::new() } else { format!("{}", 70 + i % 7) };
            let rain = format!("{}", (i % 4) as f64 * 0.5);
            let wind = if i == 7 { "400".to_string() } else { format!("{}", 10 + (i % 6) * 2) };
            let vis = format!("{}", 6000 + (i % 5) * 500);
            let pressure = if i == 13 { "1,004".to_string() } else { format!("{}", 1000 + i % 9) };
            let season = if i == 3 { "winter" } else { "Winter" };
            weather_row([
                &ts, "London", &temp, &humidity, &rain, &wind, &vis, &pressure, season, "Cloudy",
            ])
        })
        .collect();
    weather_dataset(rows)
}

#[test]
fn duplicate_rows_collapse_and_invalid_visibility_is_clipped() {
    let reading = ["2024-01-01 08:00", "London", "4.5", "85", "1.2", "20", "8000", "1012", "Winter", "Rain"];
    let rows = vec![
        weather_row(reading),
        weather_row(reading),
        weather_row(["2024-01-01 09:00", "London", "4.5", "85", "1.2", "20", "-999", "1012", "Winter", "Rain"]),
    ];

    let out = weather_cleaner()
        .clean::<WeatherRecord>(&weather_dataset(rows))
        .expect("clean");

    assert_eq!(out.records.len(), 2);
    assert_eq!(out.report.duplicates_removed, 1);
    assert_eq!(
        out.records.iter().filter(|r| r.city == "London" && r.timestamp == at(8, 0)).count(),
        1
    );
    assert_eq!(out.report.values_clipped, 1);

    let nine = out.records.iter().find(|r| r.timestamp == at(9, 0)).expect("09:00 row");
    assert_eq!(nine.visibility_m, 0.0, "-999 clips to the nearest valid bound");

    let warnings = out.report.warnings();
    assert!(warnings.contains(&PipelineEvent::DataQualityWarning {
        source: SourceKind::Weather,
        issue: DataQualityIssue::DuplicateRemoved,
        count: 1,
    }));
}

#[test]
fn cleaning_clean_output_changes_nothing() {
    let schema = SourceSchema::weather();
    let cleaner = weather_cleaner();

    let first = cleaner.clean::<WeatherRecord>(&messy_weather()).expect("first pass");
    assert!(first.report.values_clipped >= 1);
    assert_eq!(first.report.values_imputed, 1);
    assert_eq!(first.report.values_coerced, 1);

    let again = RawDataset::from_clean(&schema, &first.records);
    let second = cleaner.clean::<WeatherRecord>(&again).expect("second pass");

    assert_eq!(second.records, first.records);
    assert!(
        second.report.is_untouched(),
        "second pass modified clean data: {:?}",
        second.report
    );
}

#[test]
fn no_two_clean_records_share_timestamp_and_city() {
    let out = weather_cleaner().clean::<WeatherRecord>(&messy_weather()).expect("clean");
    let mut keys: Vec<(NaiveDateTime, &str)> =
        out.records.iter().map(|r| (r.timestamp, r.city.as_str())).collect();
    let total = keys.len();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), total);
}

#[test]
fn every_numeric_value_lands_in_its_plausible_range() {
    let rows = vec![
        weather_row(["2024-01-01 08:00", "Leeds", "-80", "140", "-3", "900", "25000", "400", "Winter", "Snow"]),
        weather_row(["2024-01-01 09:00", "Leeds", "12", "60", "0.4", "15", "9000", "1015", "Winter", "Clear"]),
        weather_row(["2024-01-01 10:00", "Leeds", "75", "-5", "120", "-10", "-1", "1500", "Winter", "Clear"]),
    ];
    let schema = SourceSchema::weather();
    let out = weather_cleaner()
        .clean::<WeatherRecord>(&weather_dataset(rows))
        .expect("clean");

    assert_eq!(out.records.len(), 3);
    for record in &out.records {
        for (name, value) in WeatherRecord::NUMERIC_FIELDS.iter().zip(record.numeric_values()) {
            let field = schema.numeric_field(name).expect("schema field");
            assert!(
                value >= field.min && value <= field.max,
                "{name} = {value} outside [{}, {}]",
                field.min,
                field.max
            );
        }
    }
}

#[test]
fn drop_policy_discards_out_of_range_rows() {
    let rows = vec![
        weather_row(["2024-01-01 08:00", "York", "4", "80", "0", "12", "7000", "1010", "Winter", "Fog"]),
        weather_row(["2024-01-01 09:00", "York", "4", "80", "0", "12", "-999", "1010", "Winter", "Fog"]),
        weather_row(["2024-01-01 10:00", "York", "4", "80", "0", "12", "7000", "1010", "Winter", "Fog"]),
    ];
    let cleaner = Cleaner::new(
        SourceSchema::weather(),
        CleaningConfig {
            outlier_policy: OutlierPolicy::Drop,
            ..CleaningConfig::default()
        },
    );
    let out = cleaner.clean::<WeatherRecord>(&weather_dataset(rows)).expect("clean");

    assert_eq!(out.records.len(), 2);
    assert_eq!(out.report.outlier_dropped, 1);
    assert_eq!(out.report.values_clipped, 0);
    assert!(out.records.iter().all(|r| r.timestamp != at(9, 0)));
}

#[test]
fn rows_without_keys_or_with_bad_timestamps_are_dropped() {
    let rows = vec![
        weather_row(["2024-01-01 08:00", "Bath", "4", "80", "0", "12", "7000", "1010", "Winter", "Fog"]),
        weather_row(["2024-01-01 09:00", "", "4", "80", "0", "12", "7000", "1010", "Winter", "Fog"]),
        weather_row(["2024-13-45 99:00", "Bath", "4", "80", "0", "12", "7000", "1010", "Winter", "Fog"]),
        // Same key as the first row in another accepted format, other values differ.
        weather_row(["2024-01-01 08:00:00", "Bath", "6", "70", "0", "12", "7000", "1010", "Winter", "Fog"]),
    ];
    let out = weather_cleaner()
        .clean::<WeatherRecord>(&weather_dataset(rows))
        .expect("clean");

    assert_eq!(out.records.len(), 1);
    assert_eq!(out.report.missing_key_dropped, 1);
    assert_eq!(out.report.invalid_timestamp_dropped, 1);
    assert_eq!(out.report.key_conflicts, 1);
    assert_eq!(out.records[0].temperature_c, 4.0, "first occurrence wins");
    assert_eq!(out.report.discarded(), 3);
}

#[test]
fn accepted_formats_and_separators_are_normalized() {
    let rows = vec![
        weather_row(["01/01/2024 08:00", "Hull", "4", "80", "0", "12", "7,000", "1010", "Winter", "Fog"]),
        weather_row(["2024-01-01T09:00:00", "Hull", "4", "80", "0", "12 km/h", "7000", "1010", "Winter", "Fog"]),
        weather_row(["2024-01-01 10:00", "Hull", "4", "80", "0", "12", "7000", "1010", "Winter", "Fog"]),
    ];
    let out = weather_cleaner()
        .clean::<WeatherRecord>(&weather_dataset(rows))
        .expect("clean");

    assert_eq!(out.records.len(), 3);
    assert_eq!(out.report.values_coerced, 2);
    assert_eq!(out.records[0].timestamp, at(8, 0));
    assert_eq!(out.records[0].visibility_m, 7000.0);
    assert_eq!(out.records[1].timestamp, at(9, 0));
    assert_eq!(out.records[1].wind_speed_kmh, 12.0);
}

#[test]
fn missing_values_take_the_median_and_labels_the_mode() {
    let rows = vec![
        weather_row(["2024-01-01 08:00", "Ely", "4", "70", "0", "12", "7000", "1010", "Winter", "Rain"]),
        weather_row(["2024-01-01 09:00", "Ely", "4", "NA", "0", "12", "7000", "1010", "Winter", ""]),
        weather_row(["2024-01-01 10:00", "Ely", "4", "90", "0", "12", "7000", "1010", "Winter", "Rain"]),
    ];
    let out = weather_cleaner()
        .clean::<WeatherRecord>(&weather_dataset(rows))
        .expect("clean");

    let nine = out.records.iter().find(|r| r.timestamp == at(9, 0)).expect("09:00 row");
    assert_eq!(nine.humidity, 80.0);
    assert_eq!(nine.weather_condition, "Rain");
    assert_eq!(out.report.values_imputed, 1);
    assert_eq!(out.report.labels_imputed, 1);
}

#[test]
fn traffic_speed_sign_and_labels_are_corrected() {
    let rows = vec![
        traffic_row(["2024-01-01 08:00", "Leeds", "1200", "-45", "0", "8000", "Centre", "high", "Wet"]),
        traffic_row(["2024-01-01 09:00", "Leeds", "1100", "50", "1", "8000", "", "Medium", "Dry"]),
        traffic_row(["2024-01-01 10:00", "Leeds", "900", "55", "0", "8000", "Ring Road", "Low", "Dry"]),
    ];
    let cleaner = Cleaner::new(SourceSchema::traffic(), CleaningConfig::default());
    let out = cleaner.clean::<TrafficRecord>(&traffic_dataset(rows)).expect("clean");

    assert_eq!(out.records.len(), 3);
    assert_eq!(out.report.sign_corrected, 1);
    assert_eq!(out.records[0].avg_speed_kmh, 45.0);
    assert_eq!(out.records[0].congestion_level, "High");
    assert_eq!(out.records[1].area, "Unknown");
    assert_eq!(out.report.labels_imputed, 1);
}

#[test]
fn undeclared_schema_field_is_a_schema_error() {
    let columns: Vec<String> = WEATHER_COLUMNS
        .iter()
        .filter(|c| **c != "humidity")
        .map(|c| c.to_string())
        .collect();
    let rows = vec![weather_row([
        "2024-01-01 08:00", "Ely", "4", "70", "0", "12", "7000", "1010", "Winter", "Rain",
    ])];
    let err = weather_cleaner()
        .clean::<WeatherRecord>(&RawDataset::new(SourceKind::Weather, columns, rows))
        .expect_err("missing column must fail");

    match err {
        PipelineError::Schema { source_kind, reason } => {
            assert_eq!(source_kind, SourceKind::Weather);
            assert!(reason.contains("humidity"), "reason: {reason}");
        }
        other => panic!("expected schema error, got {other:?}"),
    }
}

#[test]
fn malformed_schema_is_rejected_before_any_row_is_read() {
    let mut schema = SourceSchema::weather();
    schema.numeric[0].min = 100.0;
    schema.numeric[0].max = -100.0;
    let err = Cleaner::new(schema, CleaningConfig::default())
        .clean::<WeatherRecord>(&messy_weather())
        .expect_err("inverted range must fail");
    assert!(matches!(err, PipelineError::Schema { .. }));
}

#[test]
fn empty_input_is_a_precondition_error() {
    let err = weather_cleaner()
        .clean::<WeatherRecord>(&weather_dataset(Vec::new()))
        .expect_err("empty input must fail");
    assert!(matches!(err, PipelineError::Precondition { stage: "cleaner", .. }));
}

#[test]
fn non_positive_fence_multiplier_is_a_schema_error() {
    let cleaner = Cleaner::new(
        SourceSchema::weather(),
        CleaningConfig {
            iqr_k: 0.0,
            ..CleaningConfig::default()
        },
    );
    let err = cleaner
        .clean::<WeatherRecord>(&messy_weather())
        .expect_err("k = 0 must fail");
    assert!(matches!(
        err,
        PipelineError::Schema {
            source_kind: SourceKind::Weather,
            ..
        }
    ));
}

fn clean_twice(rows: Vec<RawRecord>) -> (Vec<WeatherRecord>, Vec<WeatherRecord>, bool) {
    let cleaner = weather_cleaner();
    let first = cleaner
        .clean::<WeatherRecord>(&weather_dataset(rows))
        .expect("first pass");
    let again = RawDataset::from_clean(&SourceSchema::weather(), &first.records);
    let second = cleaner.clean::<WeatherRecord>(&again).expect("second pass");
    (first.records, second.records, second.report.is_untouched())
}

#[test]
fn four_readings_are_never_fenced_and_stay_put() {
    let rows = ["10", "10", "10", "100"]
        .into_iter()
        .enumerate()
        .map(|(i, wind)| {
            let ts = format!("2024-01-01 {:02}:00", i);
            weather_row([&ts, "Hull", "6", "80", "0.5", wind, "7000", "1010", "Winter", "Rain"])
        })
        .collect();

    let (first, second, untouched) = clean_twice(rows);

    let winds: Vec<f64> = first.iter().map(|r| r.wind_speed_kmh).collect();
    assert_eq!(winds, vec![10.0, 10.0, 10.0, 100.0]);
    assert_eq!(second, first);
    assert!(untouched);
}

#[test]
fn range_clamp_before_fences_reaches_a_fixed_point() {
    let rows = ["0", "60", "62", "64", "200", "200", "200", "200"]
        .into_iter()
        .enumerate()
        .map(|(i, humidity)| {
            let ts = format!("2024-01-01 {:02}:00", i);
            weather_row([&ts, "Hull", "6", humidity, "0.5", "12", "7000", "1010", "Winter", "Rain"])
        })
        .collect();

    let (first, second, untouched) = clean_twice(rows);

    let humidity: Vec<f64> = first.iter().map(|r| r.humidity).collect();
    assert_eq!(humidity, vec![3.75, 60.0, 62.0, 64.0, 100.0, 100.0, 100.0, 100.0]);
    assert_eq!(second, first);
    assert!(untouched);
}
