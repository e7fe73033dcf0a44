use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::GeolocationConfig;
use crate::models::{Location, UNKNOWN_LOCATION};

/// Maps an address to an approximate region and country
#[async_trait]
pub trait Geolocator: Send + Sync {
    /// Look up `ip`. Callers treat errors as "location unknown".
    async fn locate(&self, ip: &str) -> Result<Location>;

    /// Pause the caller should observe after each lookup
    fn request_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn name(&self) -> &'static str;
}

/// Build the locator selected by the configuration
pub fn from_config(config: &GeolocationConfig) -> Result<Box<dyn Geolocator>> {
    if !config.enabled {
        info!("Geolocation disabled, locations will not be recorded");
        return Ok(Box::new(OfflineGeolocator));
    }

    Ok(Box::new(IpInfoDbGeolocator::new(config)?))
}

/// Debug/offline mode: never touches the network, always returns nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineGeolocator;

#[async_trait]
impl Geolocator for OfflineGeolocator {
    async fn locate(&self, _ip: &str) -> Result<Location> {
        Ok(Location::default())
    }

    fn name(&self) -> &'static str {
        "offline"
    }
}

/// ipinfodb.com ip-city lookups
pub struct IpInfoDbGeolocator {
    client: Client,
    api_url: String,
    api_key: String,
    delay: Duration,
}

impl IpInfoDbGeolocator {
    pub fn new(config: &GeolocationConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("crsentry/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone().unwrap_or_default(),
            delay: Duration::from_secs(config.request_delay_secs),
        })
    }
}

#[async_trait]
impl Geolocator for IpInfoDbGeolocator {
    async fn locate(&self, ip: &str) -> Result<Location> {
        debug!("Looking up location of {}", ip);

        let resp: IpInfoDbResponse = self
            .client
            .get(&self.api_url)
            .query(&[
                ("format", "json"),
                ("key", self.api_key.as_str()),
                ("ip", ip),
                ("timezone", "false"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Malformed geolocation response")?;

        let location = resp.into_location()?;
        info!(
            "Location of {}: {} {}",
            ip,
            location.region.as_deref().unwrap_or(UNKNOWN_LOCATION),
            location.country.as_deref().unwrap_or(UNKNOWN_LOCATION)
        );
        Ok(location)
    }

    fn request_delay(&self) -> Duration {
        self.delay
    }

    fn name(&self) -> &'static str {
        "ipinfodb"
    }
}

#[derive(Debug, Default, Deserialize)]
struct IpInfoDbResponse {
    #[serde(rename = "statusCode")]
    status_code: Option<String>,
    #[serde(rename = "statusMessage")]
    status_message: Option<String>,
    #[serde(rename = "cityName")]
    city_name: Option<String>,
    #[serde(rename = "regionName")]
    region_name: Option<String>,
    #[serde(rename = "countryName")]
    country_name: Option<String>,
}

impl IpInfoDbResponse {
    fn into_location(self) -> Result<Location> {
        if self.status_code.as_deref() == Some("ERROR") {
            anyhow::bail!(
                "Geolocation lookup failed: {}",
                self.status_message.unwrap_or_default()
            );
        }

        let region = match (known(self.city_name), known(self.region_name)) {
            (Some(city), Some(region)) => format!("{}, {}", city, region),
            (Some(city), None) => city,
            (None, Some(region)) => region,
            (None, None) => UNKNOWN_LOCATION.to_string(),
        };
        let country = known(self.country_name).unwrap_or_else(|| UNKNOWN_LOCATION.to_string());

        Ok(Location {
            region: Some(region),
            country: Some(country),
        })
    }
}

/// "-" and empty strings mean the service has no value
fn known(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty() && v != UNKNOWN_LOCATION)
}
