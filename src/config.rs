use crate::api::RetryPolicy;
use crate::error::Error;
use crate::risk::RiskLimits;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;

const ENV_PREFIX: &str = "BREADBOT";
pub const DEFAULT_CONFIG_FILE: &str = "breadbot.toml";

/// A credential that never shows up in logs or debug output
#[derive(Clone, Default, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub private_key: Secret,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Binance,
}

fn default_requests_per_minute() -> u32 {
    600
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    pub kind: ExchangeKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Secret,
    #[serde(default)]
    pub api_secret: Secret,
    pub wallet_id: String,
    pub symbols: Vec<String>,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Route orders to an in-memory paper exchange fed by this exchange's prices.
    /// Needs no credentials.
    #[serde(default)]
    pub paper_trading: bool,
    /// Starting quote balance when paper trading
    #[serde(default)]
    pub paper_balance: f64,
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Orders with no fill or cancel confirmation after this long are expired
    pub order_timeout_secs: u64,
    pub order_type: OrderType,
    /// Limit orders are placed this far inside the mark, in basis points
    pub limit_offset_bps: f64,
    /// How many cycles a locally expired order is polled for late fills
    pub reconcile_polls: u32,
    /// Ticks kept per symbol for strategies
    pub tick_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            order_timeout_secs: 60,
            order_type: OrderType::Market,
            limit_offset_bps: 5.0,
            reconcile_polls: 10,
            tick_window: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BacktestConfig {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub initial_cash: f64,
    /// Percent of notional
    pub fee_pct: f64,
    pub exchange: String,
    pub wallet_id: String,
    pub symbol: Option<String>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            initial_cash: 10_000.0,
            fee_pct: 0.1,
            exchange: "backtest".to_string(),
            wallet_id: "backtest".to_string(),
            symbol: None,
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    60
}

/// Everything the engine reads at startup. Never written back.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub wallets: Vec<WalletConfig>,
    #[serde(default)]
    pub exchanges: Vec<ExchangeConfig>,
    #[serde(default)]
    pub risk: RiskLimits,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub backtest: BacktestConfig,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl AppConfig {
    /// Load from an optional TOML file, then `BREADBOT__*` environment overrides
    ///
    /// # Example
    /// `BREADBOT__RISK__STOP_LOSS_PCT=5` overrides `[risk] stop_loss_pct`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = path.unwrap_or(DEFAULT_CONFIG_FILE);
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app: AppConfig = settings.try_deserialize()?;
        app.validate()?;

        tracing::info!(
            "Loaded configuration: {} wallets, {} exchanges",
            app.wallets.len(),
            app.exchanges.len()
        );
        Ok(app)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        let app: AppConfig = settings.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        self.risk.validate().map_err(Error::Config)?;

        if self.poll_interval_secs == 0 {
            return Err(Error::Config("poll_interval_secs must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }

        for exchange in &self.exchanges {
            if self.wallet(&exchange.wallet_id).is_none() {
                return Err(Error::Config(format!(
                    "exchange {} references unknown wallet {}",
                    exchange.name, exchange.wallet_id
                )));
            }
            if exchange.symbols.is_empty() {
                return Err(Error::Config(format!(
                    "exchange {} has no symbols",
                    exchange.name
                )));
            }
            let needs_keys = exchange.kind == ExchangeKind::Binance && !exchange.paper_trading;
            if needs_keys && (exchange.api_key.is_empty() || exchange.api_secret.is_empty()) {
                return Err(Error::Config(format!(
                    "exchange {} needs api_key and api_secret for live trading",
                    exchange.name
                )));
            }
        }

        Ok(())
    }

    pub fn wallet(&self, id: &str) -> Option<&WalletConfig> {
        self.wallets.iter().find(|w| w.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        poll_interval_secs = 30

        [[wallets]]
        id = "main"
        address = "0xabc"

        [[exchanges]]
        name = "binance"
        kind = "binance"
        wallet_id = "main"
        symbols = ["BTCUSDT", "ETHUSDT"]
        api_key = "key"
        api_secret = "secret"

        [risk]
        max_position_size = 2.5
        stop_loss_pct = 5.0
        max_open_orders = 2
        trailing_stop_pct = 4.0

        [engine]
        order_timeout_secs = 15
        order_type = "limit"
    "#;

    #[test]
    fn test_parses_sample_config() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.exchanges[0].symbols.len(), 2);
        assert_eq!(config.exchanges[0].requests_per_minute, 600);
        assert_eq!(config.risk.max_position_size, 2.5);
        assert_eq!(config.risk.take_profit_pct, 12.0); // default kept
        assert_eq!(config.risk.trailing_stop_pct, 4.0);
        assert_eq!(config.risk.max_drawdown_pct, 0.0);
        assert_eq!(config.engine.order_type, OrderType::Limit);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_secrets_are_redacted() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        let debug = format!("{:?}", config.exchanges[0]);

        assert!(!debug.contains("secret\""));
        assert!(debug.contains("Secret(***)"));
        assert_eq!(config.exchanges[0].api_secret.expose(), "secret");
    }

    #[test]
    fn test_unknown_wallet_is_rejected() {
        let toml = SAMPLE.replace("wallet_id = \"main\"", "wallet_id = \"cold\"");
        let result = AppConfig::from_toml_str(&toml);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_live_binance_requires_keys() {
        let toml = SAMPLE.replace("api_secret = \"secret\"", "");
        let result = AppConfig::from_toml_str(&toml);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
