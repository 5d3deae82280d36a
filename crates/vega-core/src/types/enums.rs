//! Enumerations used throughout the vega runtime.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Tick detail level requested for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Last traded price only.
    Ltp,
    /// Price, volume, OI and best bid/ask.
    #[default]
    Quote,
    /// Quote plus five-level market depth.
    Full,
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ltp => "ltp",
            Self::Quote => "quote",
            Self::Full => "full",
        }
    }
}

impl std::fmt::Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publish category a snapshot is batched under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamCategory {
    Underlying,
    Option,
}

impl StreamCategory {
    pub const ALL: [StreamCategory; 2] = [StreamCategory::Underlying, StreamCategory::Option];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Underlying => "underlying",
            Self::Option => "option",
        }
    }
}

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// Instrument category as reported by the metadata registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentType {
    #[serde(rename = "EQ")]
    Equity,
    #[serde(rename = "INDEX")]
    Index,
    #[serde(rename = "FUT")]
    Future,
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
}

impl InstrumentType {
    /// Option side for `CE`/`PE`, `None` for everything else.
    pub fn option_kind(&self) -> Option<OptionKind> {
        match self {
            Self::Call => Some(OptionKind::Call),
            Self::Put => Some(OptionKind::Put),
            _ => None,
        }
    }

    pub fn is_option(&self) -> bool {
        self.option_kind().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Call,
    Put,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Brokerage operation carried by an order task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderOperation {
    Place,
    Modify,
    Cancel,
}

impl std::fmt::Display for OrderOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Place => write!(f, "place"),
            Self::Modify => write!(f, "modify"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

/// Lifecycle state of an order task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    DeadLetter,
}

impl TaskStatus {
    /// Terminal tasks are never picked up by a worker again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::DeadLetter)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Retrying => "RETRYING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::DeadLetter => "DEAD_LETTER",
        };
        f.write_str(s)
    }
}

/// Buy or sell direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

/// Order pricing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    /// Stop-loss limit.
    #[serde(rename = "SL")]
    StopLoss,
    /// Stop-loss market.
    #[serde(rename = "SL-M")]
    StopLossMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::StopLoss => "SL",
            Self::StopLossMarket => "SL-M",
        }
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// External endpoint group sharing one rate-limit bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointCategory {
    Orders,
    Quotes,
    Historical,
    Subscriptions,
}

impl std::fmt::Display for EndpointCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Orders => "orders",
            Self::Quotes => "quotes",
            Self::Historical => "historical",
            Self::Subscriptions => "subscriptions",
        };
        f.write_str(s)
    }
}
