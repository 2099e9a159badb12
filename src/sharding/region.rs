//! Regional partitions and region inference over document location fields

use crate::config::SchemaConfig;
use crate::storage::Document;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Geographic partition of the document set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Northeast,
    Southeast,
    Midwest,
    Southwest,
    West,
    /// Documents whose location cannot be mapped
    Unknown,
}

impl Region {
    /// Every partition, `Unknown` included
    pub const ALL: [Region; 6] = [
        Region::Northeast,
        Region::Southeast,
        Region::Midwest,
        Region::Southwest,
        Region::West,
        Region::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Northeast => "northeast",
            Region::Southeast => "southeast",
            Region::Midwest => "midwest",
            Region::Southwest => "southwest",
            Region::West => "west",
            Region::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = String;

    /// Case-insensitive; separators are ignored (`"North-East"` is accepted)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Region::ALL
            .into_iter()
            .find(|region| region.as_str() == normalized)
            .ok_or_else(|| format!("unknown region '{s}'"))
    }
}

/// (code, full name, region) for the fifty states and DC
const STATES: &[(&str, &str, Region)] = &[
    ("CT", "connecticut", Region::Northeast),
    ("ME", "maine", Region::Northeast),
    ("MA", "massachusetts", Region::Northeast),
    ("NH", "new hampshire", Region::Northeast),
    ("RI", "rhode island", Region::Northeast),
    ("VT", "vermont", Region::Northeast),
    ("NJ", "new jersey", Region::Northeast),
    ("NY", "new york", Region::Northeast),
    ("PA", "pennsylvania", Region::Northeast),
    ("DE", "delaware", Region::Northeast),
    ("MD", "maryland", Region::Northeast),
    ("DC", "district of columbia", Region::Northeast),
    ("AL", "alabama", Region::Southeast),
    ("AR", "arkansas", Region::Southeast),
    ("FL", "florida", Region::Southeast),
    ("GA", "georgia", Region::Southeast),
    ("KY", "kentucky", Region::Southeast),
    ("LA", "louisiana", Region::Southeast),
    ("MS", "mississippi", Region::Southeast),
    ("NC", "north carolina", Region::Southeast),
    ("SC", "south carolina", Region::Southeast),
    ("TN", "tennessee", Region::Southeast),
    ("VA", "virginia", Region::Southeast),
    ("WV", "west virginia", Region::Southeast),
    ("IL", "illinois", Region::Midwest),
    ("IN", "indiana", Region::Midwest),
    ("IA", "iowa", Region::Midwest),
    ("KS", "kansas", Region::Midwest),
    ("MI", "michigan", Region::Midwest),
    ("MN", "minnesota", Region::Midwest),
    ("MO", "missouri", Region::Midwest),
    ("NE", "nebraska", Region::Midwest),
    ("ND", "north dakota", Region::Midwest),
    ("OH", "ohio", Region::Midwest),
    ("SD", "south dakota", Region::Midwest),
    ("WI", "wisconsin", Region::Midwest),
    ("AZ", "arizona", Region::Southwest),
    ("NM", "new mexico", Region::Southwest),
    ("OK", "oklahoma", Region::Southwest),
    ("TX", "texas", Region::Southwest),
    ("AK", "alaska", Region::West),
    ("CA", "california", Region::West),
    ("CO", "colorado", Region::West),
    ("HI", "hawaii", Region::West),
    ("ID", "idaho", Region::West),
    ("MT", "montana", Region::West),
    ("NV", "nevada", Region::West),
    ("OR", "oregon", Region::West),
    ("UT", "utah", Region::West),
    ("WA", "washington", Region::West),
    ("WY", "wyoming", Region::West),
];

/// Region of a two-letter state code or a full state name
pub fn region_for_state(state: &str) -> Option<Region> {
    let state = state.trim();
    if state.len() == 2 {
        let code = state.to_ascii_uppercase();
        return STATES
            .iter()
            .find(|(c, _, _)| *c == code)
            .map(|(_, _, region)| *region);
    }
    let name = state
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    STATES
        .iter()
        .find(|(_, n, _)| *n == name)
        .map(|(_, _, region)| *region)
}

/// Deterministic document-to-partition mapping
///
/// Precedence: an explicit region field naming a real partition, then the
/// state field, then the trailing `", ST"` segment of the location field.
/// Anything else maps to [`Region::Unknown`].
#[derive(Debug, Clone)]
pub struct RegionInference {
    region_field: String,
    state_field: String,
    location_field: String,
}

impl RegionInference {
    pub fn new(schema: &SchemaConfig) -> Self {
        Self {
            region_field: schema.region_field.clone(),
            state_field: schema.state_field.clone(),
            location_field: schema.location_field.clone(),
        }
    }

    pub fn infer(&self, doc: &Document) -> Region {
        if let Some(region) = doc
            .str_field(&self.region_field)
            .and_then(|r| r.parse::<Region>().ok())
            .filter(|r| *r != Region::Unknown)
        {
            return region;
        }

        if let Some(region) = doc.str_field(&self.state_field).and_then(region_for_state) {
            return region;
        }

        doc.str_field(&self.location_field)
            .and_then(region_from_location)
            .unwrap_or(Region::Unknown)
    }
}

/// `"Albany, NY"`, `"Albany, NY 12207"` or `"Austin, Texas"`
fn region_from_location(location: &str) -> Option<Region> {
    let (_, tail) = location.rsplit_once(',')?;
    let tail = tail.trim();
    region_for_state(tail).or_else(|| tail.split_whitespace().next().and_then(region_for_state))
}
