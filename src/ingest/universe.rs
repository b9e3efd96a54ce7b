// =============================================================================
// Symbol universe — which perpetual contracts get ingested
// =============================================================================

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::binance::ExchangeInfo;
use crate::error::IngestError;
use crate::runtime_config::UniverseConfig;
use crate::types::SymbolUniverse;

/// Anything that can list the exchange's instruments.
#[async_trait]
pub trait InstrumentSource: Send + Sync {
    async fn list_instruments(&self) -> Result<ExchangeInfo, IngestError>;
}

/// Fetch the listing once and reduce it to the ingestible universe.
#[instrument(skip_all, name = "universe::resolve")]
pub async fn resolve(
    source: &dyn InstrumentSource,
    config: &UniverseConfig,
) -> Result<SymbolUniverse, IngestError> {
    let listing = source
        .list_instruments()
        .await
        .map_err(|e| IngestError::Discovery(format!("instrument listing failed: {e}")))?;

    if listing.symbols.is_empty() {
        return Err(IngestError::Discovery("instrument listing is empty".into()));
    }

    let universe = filter_universe(&listing, config);
    if universe.is_empty() {
        return Err(IngestError::Discovery(format!(
            "no {} {} instruments left after filtering {} listed",
            config.contract_type,
            config.quote_asset,
            listing.symbols.len()
        )));
    }

    info!(
        listed = listing.symbols.len(),
        selected = universe.len(),
        sample = ?&universe.symbols()[..universe.len().min(5)],
        "symbol universe resolved"
    );
    Ok(universe)
}

/// Keep perpetual, quote-matching, non-denylisted symbols.
pub fn filter_universe(listing: &ExchangeInfo, config: &UniverseConfig) -> SymbolUniverse {
    SymbolUniverse::new(
        listing
            .symbols
            .iter()
            .filter(|i| i.contract_type == config.contract_type)
            .filter(|i| i.symbol.ends_with(config.quote_asset.as_str()))
            .filter(|i| !config.denylist.iter().any(|d| d.eq_ignore_ascii_case(&i.symbol)))
            .map(|i| i.symbol.clone()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::client::InstrumentInfo;

    fn instrument(symbol: &str, contract_type: &str) -> InstrumentInfo {
        InstrumentInfo {
            symbol: symbol.into(),
            contract_type: contract_type.into(),
        }
    }

    fn listing() -> ExchangeInfo {
        ExchangeInfo {
            symbols: vec![
                instrument("ZECUSDT", "PERPETUAL"),
                instrument("BTCUSDT", "PERPETUAL"),
                instrument("AAVEUSDT", "PERPETUAL"),
                instrument("ETHUSDC", "PERPETUAL"),
                instrument("ETHUSDT_250627", "CURRENT_QUARTER"),
                instrument("DOGEUSDT", "PERPETUAL"),
                instrument("AAVEUSDT", "PERPETUAL"),
            ],
        }
    }

    struct StaticSource(Result<ExchangeInfo, ()>);

    #[async_trait]
    impl InstrumentSource for StaticSource {
        async fn list_instruments(&self) -> Result<ExchangeInfo, IngestError> {
            self.0
                .clone()
                .map_err(|_| IngestError::Transient("connection reset".into()))
        }
    }

    #[test]
    fn filter_excludes_denylist_and_non_perpetuals() {
        let universe = filter_universe(&listing(), &UniverseConfig::default());
        assert_eq!(universe.symbols(), ["AAVEUSDT", "ZECUSDT"]);
    }

    #[test]
    fn filter_never_admits_denylisted_or_wrong_quote() {
        let cfg = UniverseConfig::default();
        let universe = filter_universe(&listing(), &cfg);
        for sym in universe.symbols() {
            assert!(!cfg.denylist.contains(sym));
            assert!(sym.ends_with("USDT"));
        }
        assert!(!universe.symbols().iter().any(|s| s == "ETHUSDC"));
        assert!(!universe.symbols().iter().any(|s| s == "ETHUSDT_250627"));
    }

    #[test]
    fn denylist_matching_ignores_case() {
        let cfg = UniverseConfig {
            denylist: vec!["zecusdt".into()],
            ..UniverseConfig::default()
        };
        let universe = filter_universe(&listing(), &cfg);
        assert!(!universe.symbols().iter().any(|s| s == "ZECUSDT"));
        assert!(universe.symbols().iter().any(|s| s == "BTCUSDT"));
    }

    #[tokio::test]
    async fn resolve_fails_on_listing_error() {
        let source = StaticSource(Err(()));
        let err = resolve(&source, &UniverseConfig::default()).await.unwrap_err();
        assert!(matches!(err, IngestError::Discovery(_)));
    }

    #[tokio::test]
    async fn resolve_fails_on_empty_listing_or_universe() {
        let empty = StaticSource(Ok(ExchangeInfo { symbols: vec![] }));
        assert!(matches!(
            resolve(&empty, &UniverseConfig::default()).await,
            Err(IngestError::Discovery(_))
        ));

        let only_denied = StaticSource(Ok(ExchangeInfo {
            symbols: vec![instrument("BTCUSDT", "PERPETUAL")],
        }));
        assert!(matches!(
            resolve(&only_denied, &UniverseConfig::default()).await,
            Err(IngestError::Discovery(_))
        ));
    }

    #[tokio::test]
    async fn resolve_returns_filtered_universe() {
        let source = StaticSource(Ok(listing()));
        let universe = resolve(&source, &UniverseConfig::default()).await.unwrap();
        assert_eq!(universe.len(), 2);
    }
}
