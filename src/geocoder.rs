//! Address geocoding with retry
//!
//! Network providers are plugged in through the [`Geocoder`] trait; the
//! crate ships an offline address book backed by a CSV file.

use std::collections::HashMap;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::warn;

use crate::data::csv_loader::read_csv;
use crate::data::frame::{f64_values, text_values};
use crate::error::{PipelineError, Result};

/// Resolve a postal address to (latitude, longitude)
pub trait Geocoder: Send {
    /// `Ok(None)` when the address is unknown, `Err` on a failed lookup
    fn geocode(&self, address: &str) -> Result<Option<(f64, f64)>>;
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct GeocoderConfig {
    /// Base delay between attempts in milliseconds
    pub delay_ms: u64,
    /// Max attempts
    pub max_retries: u32,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            delay_ms: 500,
            max_retries: 3,
        }
    }
}

/// Wraps a geocoder and retries failed lookups with linear backoff
pub struct RetryingGeocoder<G> {
    inner: G,
    config: GeocoderConfig,
}

impl<G: Geocoder> RetryingGeocoder<G> {
    pub fn new(inner: G, config: GeocoderConfig) -> Self {
        Self { inner, config }
    }
}

impl<G: Geocoder> Geocoder for RetryingGeocoder<G> {
    fn geocode(&self, address: &str) -> Result<Option<(f64, f64)>> {
        let mut last_error = None;
        for attempt in 0..self.config.max_retries {
            match self.inner.geocode(address) {
                Ok(found) => return Ok(found),
                Err(e) => {
                    warn!(
                        "Geocoding failed (attempt {}/{}): {}",
                        attempt + 1,
                        self.config.max_retries,
                        e
                    );
                    last_error = Some(e);
                }
            }

            if attempt + 1 < self.config.max_retries {
                let backoff = Duration::from_millis(self.config.delay_ms * (attempt as u64 + 1));
                thread::sleep(backoff);
            }
        }

        Err(last_error.unwrap_or_else(|| {
            PipelineError::Validation(format!("no geocoding attempt made for '{}'", address))
        }))
    }
}

fn normalize_address(address: &str) -> String {
    address
        .to_lowercase()
        .replace(',', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Offline lookup table of known addresses
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    entries: HashMap<String, (f64, f64)>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: &str, coordinates: (f64, f64)) {
        self.entries.insert(normalize_address(address), coordinates);
    }

    /// Load from a CSV with `address`, `latitude` and `longitude` columns
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let df = read_csv(path)?;
        let addresses = text_values(&df, "address")?;
        let lat = f64_values(&df, "latitude")?;
        let lon = f64_values(&df, "longitude")?;

        let mut book = Self::new();
        for ((address, la), lo) in addresses.iter().zip(&lat).zip(&lon) {
            if let (Some(a), Some(la), Some(lo)) = (address, la, lo) {
                book.insert(a, (*la, *lo));
            }
        }
        Ok(book)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Geocoder for AddressBook {
    fn geocode(&self, address: &str) -> Result<Option<(f64, f64)>> {
        Ok(self.entries.get(&normalize_address(address)).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Geocoder for Flaky {
        fn geocode(&self, _address: &str) -> Result<Option<(f64, f64)>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(PipelineError::Validation("service unavailable".to_string()))
            } else {
                Ok(Some((48.86, 2.34)))
            }
        }
    }

    fn config() -> GeocoderConfig {
        GeocoderConfig {
            delay_ms: 1,
            max_retries: 3,
        }
    }

    #[test]
    fn test_retry_recovers() {
        let geocoder = RetryingGeocoder::new(
            Flaky {
                failures: 2,
                calls: AtomicU32::new(0),
            },
            config(),
        );
        assert_eq!(geocoder.geocode("x").unwrap(), Some((48.86, 2.34)));
        assert_eq!(geocoder.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_gives_up() {
        let geocoder = RetryingGeocoder::new(
            Flaky {
                failures: 5,
                calls: AtomicU32::new(0),
            },
            config(),
        );
        assert!(geocoder.geocode("x").is_err());
        assert_eq!(geocoder.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_address_book() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addresses.csv");
        std::fs::write(
            &path,
            "address,latitude,longitude\n\"11 Rue des Halles, 75001 Paris\",48.8595,2.3470\n",
        )
        .unwrap();
        let book = AddressBook::load(&path).unwrap();
        assert_eq!(book.len(), 1);
        assert_eq!(
            book.geocode("11 rue des halles 75001  PARIS").unwrap(),
            Some((48.8595, 2.3470))
        );
        assert_eq!(book.geocode("1 rue inconnue").unwrap(), None);
    }
}
