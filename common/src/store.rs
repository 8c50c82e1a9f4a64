use std::collections::VecDeque;

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};

use crate::types::{Reading, TemperatureSample, TimeOfDay, TIMESTAMP_FORMAT};

pub trait Timestamped {
    fn timestamp(&self) -> &str;
}

impl Timestamped for Reading {
    fn timestamp(&self) -> &str {
        &self.timestamp
    }
}

impl Timestamped for TemperatureSample {
    fn timestamp(&self) -> &str {
        &self.timestamp
    }
}

/// Parses the timestamp layouts devices and dashboards produce.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.naive_local())
        })
}

/// Append-only sequence that keeps at most `capacity` entries, evicting
/// the oldest first.
#[derive(Debug, Clone)]
pub struct BoundedSeries<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> BoundedSeries<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends `entry` and returns the evicted entry, if any.
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Arrival-ordered copy of everything retained.
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }
}

impl<T: Clone + Timestamped> BoundedSeries<T> {
    /// Removes entries stamped in `year`. Unparseable timestamps stay.
    pub fn clear_year(&mut self, year: i32) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| {
            parse_timestamp(entry.timestamp())
                .map(|ts| ts.year() != year)
                .unwrap_or(true)
        });
        before - self.entries.len()
    }

    pub fn filtered(&self, period: TimeOfDay) -> Vec<T> {
        if period == TimeOfDay::All {
            return self.snapshot();
        }

        self.entries
            .iter()
            .filter(|entry| {
                parse_timestamp(entry.timestamp())
                    .map(|ts| period.contains_hour(ts.hour()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn reading(timestamp: &str, temp: f64) -> Reading {
        Reading {
            timestamp: timestamp.to_string(),
            temp_dht11: temp,
            hum_dht11: 40.0,
            temp_ds18b20: temp,
            light_intensity: 300.0,
        }
    }

    #[test]
    fn retention_drops_oldest() {
        let mut series = BoundedSeries::new(3);
        for i in 0..3 {
            assert_eq!(series.push(reading("2024-01-01 00:00:00", i as f64)), None);
        }

        let evicted = series.push(reading("2024-01-01 00:00:00", 3.0));

        assert_eq!(evicted.map(|r| r.temp_dht11), Some(0.0));
        assert_eq!(series.len(), 3);
        let temps: Vec<f64> = series.iter().map(|r| r.temp_dht11).collect();
        assert_eq!(temps, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn zero_capacity_still_keeps_latest() {
        let mut series = BoundedSeries::new(0);
        series.push(reading("2024-01-01 00:00:00", 1.0));
        series.push(reading("2024-01-01 00:00:00", 2.0));
        assert_eq!(series.capacity(), 1);
        assert_eq!(series.snapshot(), vec![reading("2024-01-01 00:00:00", 2.0)]);
    }

    #[test]
    fn clear_year_only_touches_matching_year() {
        let mut series = BoundedSeries::new(10);
        series.push(reading("2023-12-31 23:59:59", 1.0));
        series.push(reading("2024-01-01 00:00:00", 2.0));
        series.push(reading("2024-06-01T08:30:00+02:00", 3.0));
        series.push(reading("not a time", 4.0));
        series.push(reading("2025-01-01 00:00:00", 5.0));

        let removed = series.clear_year(2024);

        assert_eq!(removed, 2);
        let temps: Vec<f64> = series.iter().map(|r| r.temp_dht11).collect();
        assert_eq!(temps, vec![1.0, 4.0, 5.0]);
    }

    #[test]
    fn clear_empties_series() {
        let mut series = BoundedSeries::new(10);
        series.push(reading("2024-01-01 00:00:00", 1.0));
        series.push(reading("2024-01-01 00:00:00", 2.0));
        assert_eq!(series.clear(), 2);
        assert!(series.is_empty());
    }

    #[test]
    fn filters_by_time_of_day() {
        let mut series = BoundedSeries::new(10);
        series.push(reading("2024-01-01 07:00:00", 1.0));
        series.push(reading("2024-01-01 13:00:00", 2.0));
        series.push(reading("2024-01-01 19:30:00", 3.0));
        series.push(reading("2024-01-01 23:15:00", 4.0));
        series.push(reading("2024-01-02 02:00:00", 5.0));
        series.push(reading("garbage", 6.0));

        let temps = |period| -> Vec<f64> {
            series
                .filtered(period)
                .iter()
                .map(|r| r.temp_dht11)
                .collect()
        };

        assert_eq!(temps(TimeOfDay::Morning), vec![1.0]);
        assert_eq!(temps(TimeOfDay::Afternoon), vec![2.0]);
        assert_eq!(temps(TimeOfDay::Evening), vec![3.0]);
        assert_eq!(temps(TimeOfDay::Night), vec![4.0, 5.0]);
        assert_eq!(temps(TimeOfDay::All).len(), 6);
    }

    #[test]
    fn parses_known_layouts() {
        assert!(parse_timestamp("2024-01-01 00:00:00").is_some());
        assert!(parse_timestamp("2024-01-01T00:00:00").is_some());
        assert!(parse_timestamp("2024-01-01T00:00:00Z").is_some());
        assert!(parse_timestamp("01/01/2024").is_none());
    }
}
