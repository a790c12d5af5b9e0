//! HTTP and filesystem collaborators of the session runtime

mod geocoding;
mod mail;
mod photos;

pub use geocoding::NominatimGeocoder;
pub use mail::HttpMailVerifier;
pub use photos::LocalPhotoStorage;

use crate::runtime::ServiceError;
use std::time::Duration;

const USER_AGENT: &str = concat!("parkun-bot/", env!("CARGO_PKG_VERSION"));

/// Shared HTTP client settings for collaborator services
fn http_client(timeout: Duration) -> Result<reqwest::Client, ServiceError> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?)
}
