//! IP to ISO country code lookup over a MaxMind database.

use std::net::IpAddr;
use std::path::Path;

use maxminddb::geoip2;

use crate::error::{Error, Result};

pub struct GeoIp {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl GeoIp {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = maxminddb::Reader::open_readfile(path.as_ref()).map_err(|e| {
            Error::ConfigInvalid(format!(
                "cannot open GeoIP database {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self { reader })
    }

    /// ISO 3166-1 alpha-2 code for the address, or None when the database
    /// has no entry for it.
    pub fn country(&self, ip: IpAddr) -> Option<String> {
        let country: geoip2::Country = self.reader.lookup(ip).ok()?;
        country
            .country
            .and_then(|c| c.iso_code)
            .map(|code| code.to_string())
    }
}

impl std::fmt::Debug for GeoIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoIp").finish()
    }
}
