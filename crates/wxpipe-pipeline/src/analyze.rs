//! Cross-city descriptive statistics, correlations and temperature trends.
//!
//! [`analyze`] is a pure function of its batch: maps are ordered and sums run
//! in input order, so repeated calls produce identical summaries.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use wxpipe_core::{CleanedReading, Metric, TemperatureUnit};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl Stats {
    /// `None` for an empty slice.
    #[must_use]
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let (&first, rest) = values.split_first()?;
        let (mut min, mut max, mut sum) = (first, first, first);
        for &v in rest {
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        #[allow(clippy::cast_precision_loss)]
        let mean = sum / values.len() as f64;
        Some(Self {
            count: values.len(),
            mean,
            min,
            max,
        })
    }
}

/// Pearson coefficient, or a sentinel when it is undefined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Correlation {
    Coefficient(f64),
    /// Fewer than two paired observations, or one side has no variance.
    InsufficientData,
}

impl Correlation {
    #[must_use]
    pub fn coefficient(self) -> Option<f64> {
        match self {
            Correlation::Coefficient(r) => Some(r),
            Correlation::InsufficientData => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricCorrelation {
    pub a: Metric,
    pub b: Metric,
    pub correlation: Correlation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Warming,
    Cooling,
}

/// Day-over-day movement of a city's daily mean temperature, in °C.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trend {
    Computed {
        /// Distinct observation dates the changes were taken over.
        days: usize,
        avg_daily_change: f64,
        max_increase: f64,
        max_decrease: f64,
        /// `warming` when the changes sum to more than zero.
        direction: TrendDirection,
    },
    /// Fewer than two observation dates.
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitySummary {
    pub count: usize,
    pub stats: BTreeMap<Metric, Stats>,
    pub dominant_condition: Option<String>,
    pub correlations: Vec<MetricCorrelation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub record_count: usize,
    /// Unit of every temperature-valued statistic.
    pub unit: Option<TemperatureUnit>,
    pub first_observation: Option<DateTime<Utc>>,
    pub last_observation: Option<DateTime<Utc>>,
    pub overall: BTreeMap<Metric, Stats>,
    /// Keyed by `"name, country"`.
    pub per_city_stats: BTreeMap<String, CitySummary>,
    /// Batch-wide, one entry per unordered metric pair.
    pub correlations: Vec<MetricCorrelation>,
    pub warmest_city: Option<String>,
    pub coldest_city: Option<String>,
    pub condition_counts: BTreeMap<String, usize>,
    /// Per city, over this batch and the history it was analysed with.
    pub trends: BTreeMap<String, Trend>,
}

/// Summarises a cleaned batch. Never fails; an empty batch yields an empty
/// summary.
#[must_use]
pub fn analyze(batch: &[CleanedReading]) -> Summary {
    analyze_with_history(batch, &[])
}

/// Like [`analyze`], with earlier readings feeding the temperature trends.
/// Every other statistic covers `batch` alone. A history reading with the
/// same city and timestamp as one already seen is ignored.
#[must_use]
pub fn analyze_with_history(batch: &[CleanedReading], history: &[CleanedReading]) -> Summary {
    let mut seen = BTreeSet::new();
    let timeline: Vec<&CleanedReading> = batch
        .iter()
        .chain(history)
        .filter(|r| seen.insert((r.city.to_string(), r.timestamp)))
        .collect();

    let mut by_city: BTreeMap<String, Vec<&CleanedReading>> = BTreeMap::new();
    for reading in batch {
        by_city
            .entry(reading.city.to_string())
            .or_default()
            .push(reading);
    }

    let per_city_stats: BTreeMap<String, CitySummary> = by_city
        .into_iter()
        .map(|(city, readings)| {
            let summary = CitySummary {
                count: readings.len(),
                stats: metric_stats(&readings),
                dominant_condition: dominant(&condition_counts(&readings)),
                correlations: correlations(&readings),
            };
            (city, summary)
        })
        .collect();

    let mean_temps = per_city_stats.iter().filter_map(|(city, s)| {
        s.stats
            .get(&Metric::Temperature)
            .map(|t| (city.as_str(), t.mean))
    });
    let warmest_city = extreme(mean_temps.clone(), |a, b| a > b);
    let coldest_city = extreme(mean_temps, |a, b| a < b);

    let all: Vec<&CleanedReading> = batch.iter().collect();
    Summary {
        record_count: batch.len(),
        unit: batch.first().map(|r| r.unit),
        first_observation: batch.iter().map(|r| r.timestamp).min(),
        last_observation: batch.iter().map(|r| r.timestamp).max(),
        overall: metric_stats(&all),
        correlations: correlations(&all),
        warmest_city,
        coldest_city,
        condition_counts: condition_counts(&all),
        per_city_stats,
        trends: temperature_trends(&timeline),
    }
}

/// Groups readings by city and calendar date (UTC), then measures the change
/// between consecutive daily means.
#[must_use]
pub fn temperature_trends(readings: &[&CleanedReading]) -> BTreeMap<String, Trend> {
    let mut daily: BTreeMap<String, BTreeMap<NaiveDate, (f64, usize)>> = BTreeMap::new();
    for r in readings {
        let (sum, n) = daily
            .entry(r.city.to_string())
            .or_default()
            .entry(r.timestamp.date_naive())
            .or_insert((0.0, 0));
        *sum += r.temperature_celsius();
        *n += 1;
    }

    daily
        .into_iter()
        .map(|(city, days)| {
            #[allow(clippy::cast_precision_loss)]
            let means: Vec<f64> = days.values().map(|&(sum, n)| sum / n as f64).collect();
            (city, trend(&means))
        })
        .collect()
}

fn trend(daily_means: &[f64]) -> Trend {
    let changes: Vec<f64> = daily_means.windows(2).map(|w| w[1] - w[0]).collect();
    let Some(stats) = Stats::from_values(&changes) else {
        return Trend::InsufficientData;
    };
    Trend::Computed {
        days: daily_means.len(),
        avg_daily_change: stats.mean,
        max_increase: stats.max,
        max_decrease: stats.min,
        direction: if stats.mean > 0.0 {
            TrendDirection::Warming
        } else {
            TrendDirection::Cooling
        },
    }
}

/// Pearson correlation over the pairs where both values are present.
#[must_use]
pub fn pearson(pairs: &[(f64, f64)]) -> Correlation {
    if pairs.len() < 2 {
        return Correlation::InsufficientData;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;

    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for &(x, y) in pairs {
        let (dx, dy) = (x - mean_x, y - mean_y);
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return Correlation::InsufficientData;
    }
    let r = cov / (var_x.sqrt() * var_y.sqrt());
    if r.is_finite() {
        Correlation::Coefficient(r.clamp(-1.0, 1.0))
    } else {
        Correlation::InsufficientData
    }
}

fn metric_stats(readings: &[&CleanedReading]) -> BTreeMap<Metric, Stats> {
    Metric::ALL
        .into_iter()
        .filter_map(|metric| {
            let values: Vec<f64> = readings.iter().filter_map(|r| metric.value(r)).collect();
            Stats::from_values(&values).map(|s| (metric, s))
        })
        .collect()
}

fn correlations(readings: &[&CleanedReading]) -> Vec<MetricCorrelation> {
    let mut out = Vec::new();
    for (i, &a) in Metric::ALL.iter().enumerate() {
        for &b in &Metric::ALL[i + 1..] {
            let pairs: Vec<(f64, f64)> = readings
                .iter()
                .filter_map(|r| Some((a.value(r)?, b.value(r)?)))
                .collect();
            out.push(MetricCorrelation {
                a,
                b,
                correlation: pearson(&pairs),
            });
        }
    }
    out
}

fn condition_counts(readings: &[&CleanedReading]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for r in readings {
        *counts.entry(r.condition.clone()).or_insert(0) += 1;
    }
    counts
}

/// Most frequent key; ties go to the alphabetically first.
fn dominant(counts: &BTreeMap<String, usize>) -> Option<String> {
    let mut best: Option<(&String, usize)> = None;
    for (condition, &count) in counts {
        if best.is_none_or(|(_, c)| count > c) {
            best = Some((condition, count));
        }
    }
    best.map(|(c, _)| c.clone())
}

/// First city whose value beats every earlier one under `better`.
fn extreme<'a>(
    values: impl Iterator<Item = (&'a str, f64)>,
    better: impl Fn(f64, f64) -> bool,
) -> Option<String> {
    let mut best: Option<(&str, f64)> = None;
    for (city, v) in values {
        if best.is_none_or(|(_, b)| better(v, b)) {
            best = Some((city, v));
        }
    }
    best.map(|(c, _)| c.to_owned())
}

/// Plot-ready series for the external charting step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartData {
    pub unit: Option<TemperatureUnit>,
    pub mean_temperature_by_city: Vec<CategoryPoint>,
    pub mean_wind_speed_by_city: Vec<CategoryPoint>,
    pub temperature_vs_humidity: Vec<ScatterPoint>,
    pub condition_distribution: Vec<CategoryPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPoint {
    pub label: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScatterPoint {
    pub city: String,
    pub temperature: f64,
    pub humidity: f64,
}

impl ChartData {
    #[must_use]
    pub fn build(batch: &[CleanedReading], summary: &Summary) -> Self {
        let city_means = |metric: Metric| -> Vec<CategoryPoint> {
            summary
                .per_city_stats
                .iter()
                .filter_map(|(city, s)| {
                    s.stats.get(&metric).map(|st| CategoryPoint {
                        label: city.clone(),
                        value: st.mean,
                    })
                })
                .collect()
        };

        #[allow(clippy::cast_precision_loss)]
        let condition_distribution = summary
            .condition_counts
            .iter()
            .map(|(condition, &count)| CategoryPoint {
                label: condition.clone(),
                value: count as f64,
            })
            .collect();

        Self {
            unit: summary.unit,
            mean_temperature_by_city: city_means(Metric::Temperature),
            mean_wind_speed_by_city: city_means(Metric::WindSpeed),
            temperature_vs_humidity: batch
                .iter()
                .filter_map(|r| {
                    r.humidity.map(|humidity| ScatterPoint {
                        city: r.city.to_string(),
                        temperature: r.temperature,
                        humidity,
                    })
                })
                .collect(),
            condition_distribution,
        }
    }
}
