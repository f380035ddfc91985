use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::distance_meters;

/// Named auxiliary measurements attached to a point (`hr`, `cad`, ...), kept in
/// the order they were read.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionFields(Vec<(String, String)>);

impl ExtensionFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field; an existing key keeps its position and takes the new value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.0.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ExtensionFields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = ExtensionFields::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "ExtensionFields::is_empty")]
    pub extensions: ExtensionFields,
}

impl TrackPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            elevation: None,
            time: None,
            extensions: ExtensionFields::new(),
        }
    }

    pub fn with_elevation(mut self, elevation: f64) -> Self {
        self.elevation = Some(elevation);
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_extensions(mut self, extensions: ExtensionFields) -> Self {
        self.extensions = extensions;
        self
    }

    /// Copy of this point re-stamped at `time`; position, elevation and
    /// extensions are carried over unchanged.
    pub fn retimed(&self, time: DateTime<Utc>) -> Self {
        Self {
            time: Some(time),
            ..self.clone()
        }
    }

    pub fn distance_to(&self, other: &TrackPoint) -> f64 {
        distance_meters(self.lat, self.lon, other.lat, other.lon)
    }
}

/// One continuous recording: the first segment of the first track of a GPX file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub name: Option<String>,
    pub points: Vec<TrackPoint>,
}

impl Track {
    pub fn new(name: Option<String>, points: Vec<TrackPoint>) -> Self {
        Self { name, points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<&TrackPoint> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&TrackPoint> {
        self.points.last()
    }
}
