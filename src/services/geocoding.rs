//! Nominatim-compatible geocoder
//!
//! Free text and coordinates both resolve to a short street address plus
//! the region slug the complaint is addressed to.

use super::http_client;
use crate::appeal::Region;
use crate::runtime::{Geocoder, ServiceError};
use crate::state_machine::session::{Coordinates, ResolvedAddress};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new(base_url: &str) -> Result<Self, ServiceError> {
        Ok(Self {
            client: http_client(Duration::from_secs(15))?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<String, ServiceError> {
        let response = self
            .client
            .get(format!("{}/{path}", self.base_url))
            .query(&[
                ("format", "jsonv2"),
                ("addressdetails", "1"),
                ("accept-language", "en"),
            ])
            .query(query)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ServiceError::BadResponse(format!("HTTP {status}: {body}")));
        }
        Ok(body)
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn resolve_text(&self, query: &str) -> Result<Option<ResolvedAddress>, ServiceError> {
        let body = self
            .get(
                "search",
                &[
                    ("q", query.to_string()),
                    ("countrycodes", "by".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        let places: Vec<Place> = serde_json::from_str(&body)
            .map_err(|e| ServiceError::BadResponse(format!("search response: {e}")))?;
        Ok(places.into_iter().next().and_then(Place::resolve))
    }

    async fn resolve_location(
        &self,
        coordinates: Coordinates,
    ) -> Result<Option<ResolvedAddress>, ServiceError> {
        let body = self
            .get(
                "reverse",
                &[
                    ("lat", coordinates.lat.to_string()),
                    ("lon", coordinates.lon.to_string()),
                ],
            )
            .await?;
        // Nothing nearby is reported as {"error": "..."}
        let place: Option<Place> = serde_json::from_str(&body).ok();
        Ok(place.and_then(|p| {
            p.resolve().map(|mut resolved| {
                resolved.coordinates = Some(coordinates);
                resolved
            })
        }))
    }
}

#[derive(Debug, Deserialize)]
struct Place {
    lat: Option<String>,
    lon: Option<String>,
    display_name: Option<String>,
    #[serde(default)]
    address: PlaceAddress,
}

#[derive(Debug, Default, Deserialize)]
struct PlaceAddress {
    road: Option<String>,
    house_number: Option<String>,
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    state: Option<String>,
}

impl Place {
    fn resolve(self) -> Option<ResolvedAddress> {
        let coordinates = match (&self.lat, &self.lon) {
            (Some(lat), Some(lon)) => lat
                .parse()
                .ok()
                .zip(lon.parse().ok())
                .map(|(lat, lon)| Coordinates { lat, lon }),
            _ => None,
        };
        let region = region_slug(&self.address);
        let address = short_address(&self.address).or(self.display_name)?;
        Some(ResolvedAddress {
            address,
            region,
            coordinates,
        })
    }
}

/// "Locality, road house" when the road is known
fn short_address(address: &PlaceAddress) -> Option<String> {
    let road = address.road.as_ref()?;
    let locality = address
        .city
        .as_ref()
        .or(address.town.as_ref())
        .or(address.village.as_ref());

    let mut street = road.clone();
    if let Some(house) = &address.house_number {
        street.push(' ');
        street.push_str(house);
    }
    Some(match locality {
        Some(locality) => format!("{locality}, {street}"),
        None => street,
    })
}

/// Region slugs, matched on the English (and transliterated) state name
const REGIONS: &[(Region, &[&str])] = &[
    (Region::Brest, &["brest"]),
    (Region::Vitebsk, &["vitebsk", "viciebsk"]),
    (Region::Gomel, &["gomel", "homiel"]),
    (Region::Grodno, &["grodno", "hrodna"]),
    (Region::Mogilev, &["mogilev", "mahilyow", "mahiloŭ"]),
    (Region::MinskRegion, &["minsk region"]),
];

fn region_slug(address: &PlaceAddress) -> Option<String> {
    let is_minsk = |name: &Option<String>| {
        name.as_deref()
            .is_some_and(|n| n.trim().eq_ignore_ascii_case("minsk"))
    };
    // The capital is a region of its own
    if is_minsk(&address.city) || is_minsk(&address.state) {
        return Some(Region::Minsk.slug().to_string());
    }

    let state = address.state.as_deref()?.to_lowercase();
    REGIONS
        .iter()
        .find(|(_, names)| names.iter().any(|n| state.contains(n)))
        .map(|(region, _)| region.slug().to_string())
}
