//! Enabled-city records read from the city configuration store

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnabledCity {
    pub city: String,
    pub state: String,
    pub events_enabled: bool,
}

impl EnabledCity {
    pub fn new(city: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            state: state.into(),
            events_enabled: true,
        }
    }
}

impl fmt::Display for EnabledCity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.city, self.state)
    }
}

/// Location half of a provider search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationQuery {
    pub city: String,
    pub state: String,
    pub radius_miles: u32,
}

impl LocationQuery {
    pub fn for_city(city: &EnabledCity, radius_miles: u32) -> Self {
        Self {
            city: city.city.clone(),
            state: city.state.clone(),
            radius_miles,
        }
    }
}
