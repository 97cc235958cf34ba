//! Query points loaded from the input CSV.

/// A single query point. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    /// Opaque identifier; uniqueness is recommended but not enforced.
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    pub name: Option<String>,
}

impl Location {
    pub fn new(id: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            id: id.into(),
            lat,
            lon,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Ordered collection of query points, one per input row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationSet {
    locations: Vec<Location>,
}

impl LocationSet {
    pub fn new(locations: Vec<Location>) -> Self {
        Self { locations }
    }

    /// Keeps only the first `limit` locations (debug runs).
    pub fn truncated(mut self, limit: usize) -> Self {
        self.locations.truncate(limit);
        self
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Location> {
        self.locations.iter()
    }
}

impl<'a> IntoIterator for &'a LocationSet {
    type Item = &'a Location;
    type IntoIter = std::slice::Iter<'a, Location>;

    fn into_iter(self) -> Self::IntoIter {
        self.locations.iter()
    }
}
