//! In-memory instrument registry loaded from a JSON file.

use std::path::Path;
use std::sync::Arc;

use ahash::AHashMap;
use anyhow::{Context, Result};
use tracing::info;
use vega_core::ports::InstrumentRegistry;
use vega_core::types::InstrumentMeta;

/// Registry backed by a fixed token → metadata map.
#[derive(Debug, Default)]
pub struct StaticInstrumentRegistry {
    by_token: AHashMap<u32, Arc<InstrumentMeta>>,
}

impl StaticInstrumentRegistry {
    pub fn new(instruments: impl IntoIterator<Item = InstrumentMeta>) -> Self {
        let by_token = instruments
            .into_iter()
            .map(|m| (m.instrument_token, Arc::new(m)))
            .collect();
        Self { by_token }
    }

    /// Load a JSON array of instrument records.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading instruments from {}", path.display()))?;
        let instruments: Vec<InstrumentMeta> = serde_json::from_str(&content)
            .with_context(|| format!("parsing instruments in {}", path.display()))?;
        let registry = Self::new(instruments);
        info!("[registry] loaded {} instruments from {}", registry.len(), path.display());
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

impl InstrumentRegistry for StaticInstrumentRegistry {
    fn fetch_metadata(&self, instrument_token: u32) -> Option<Arc<InstrumentMeta>> {
        self.by_token.get(&instrument_token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("vega-instruments-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"[
                {"instrument_token": 256265, "tradingsymbol": "NIFTY 50", "instrument_type": "INDEX"},
                {"instrument_token": 12345, "trading_symbol": "NIFTY24DEC24000CE",
                 "instrument_type": "CE", "strike": 24000.0, "expiry": "2024-12-26",
                 "underlying_token": 256265, "is_active": false}
            ]"#,
        )
        .unwrap();
        let registry = StaticInstrumentRegistry::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(registry.len(), 2);
        let option = registry.fetch_metadata(12345).unwrap();
        assert!(option.is_option());
        assert!(!option.is_active);
        assert_eq!(option.underlying_token, Some(256265));
        assert!(registry.fetch_metadata(256265).unwrap().is_active);
        assert!(registry.fetch_metadata(1).is_none());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(StaticInstrumentRegistry::load(Path::new("/nonexistent/instruments.json")).is_err());
    }
}
