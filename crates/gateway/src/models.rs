use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;
use std::time::Duration;

/// Identifier of the cloud-hosted terminal that proxies a broker login.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyId(pub String);

impl Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Gateway region a proxy lives in. Client API traffic must be sent to the
/// proxy's own region, so there is intentionally no `Default`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Region(pub String);

impl Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key sent as `transaction-id` so that re-polling an accepted creation
/// request refers to the same pending resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPlatformError(String);

impl Display for InvalidPlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid platform: {}", self.0)
    }
}

impl std::error::Error for InvalidPlatformError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Mt4,
    Mt5,
}

impl Platform {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mt4 => "mt4",
            Self::Mt5 => "mt5",
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Platform {
    type Err = InvalidPlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mt4" => Ok(Self::Mt4),
            "mt5" => Ok(Self::Mt5),
            _ => Err(InvalidPlatformError(s.to_string())),
        }
    }
}

/// Decrypted broker login used to provision a proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct AccountCredentials {
    pub login: String,
    pub password: String,
    pub server: String,
    pub platform: Platform,
}

impl fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("server", &self.server)
            .field("platform", &self.platform)
            .finish()
    }
}

/// Body of the provisioning API's create-account call.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRemoteAccount {
    pub name: String,
    #[serde(rename = "type")]
    pub account_type: String,
    pub login: String,
    pub password: String,
    pub server: String,
    pub platform: Platform,
    pub magic: u32,
}

impl From<&AccountCredentials> for NewRemoteAccount {
    fn from(credentials: &AccountCredentials) -> Self {
        Self {
            name: format!("{}@{}", credentials.login, credentials.server),
            account_type: "cloud-g2".to_string(),
            login: credentials.login.clone(),
            password: credentials.password.clone(),
            server: credentials.server.clone(),
            platform: credentials.platform,
            magic: 0,
        }
    }
}

impl fmt::Debug for NewRemoteAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewRemoteAccount")
            .field("name", &self.name)
            .field("login", &self.login)
            .field("server", &self.server)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateAccountResponse {
    Created(ProxyId),
    /// Accepted but still being set up on the remote side. Poll again with
    /// the same idempotency key.
    Processing { retry_after: Option<Duration> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployState {
    #[serde(alias = "CREATED")]
    NotDeployed,
    Deploying,
    Deployed,
    Undeploying,
    Undeployed,
    /// Failure and teardown states the sync never drives into.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connected,
    /// Covers `DISCONNECTED_FROM_BROKER` and any other not-yet-usable status.
    #[serde(other)]
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAccount {
    #[serde(rename = "_id", alias = "id")]
    pub id: ProxyId,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub region: Option<Region>,
    pub state: DeployState,
    #[serde(default = "disconnected")]
    pub connection_status: ConnectionStatus,
}

const fn disconnected() -> ConnectionStatus {
    ConnectionStatus::Disconnected
}

impl RemoteAccount {
    pub fn is_connected(&self) -> bool {
        self.state == DeployState::Deployed && self.connection_status == ConnectionStatus::Connected
    }

    pub fn matches_login(&self, login: &str, server: &str) -> bool {
        self.login == login && self.server.eq_ignore_ascii_case(server)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInformation {
    pub balance: f64,
    pub equity: f64,
    pub currency: String,
    #[serde(default)]
    pub leverage: Option<i64>,
}

/// What a deal did to the account, decided once when the wire record is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DealRole {
    Entry,
    Exit,
    Balance,
    Credit,
    Unknown,
}

impl DealRole {
    fn classify(deal_type: Option<&str>, entry_type: Option<&str>) -> Self {
        match deal_type {
            Some("DEAL_TYPE_BALANCE") => return Self::Balance,
            Some("DEAL_TYPE_CREDIT") => return Self::Credit,
            _ => {}
        }

        match entry_type {
            Some("DEAL_ENTRY_IN") => Self::Entry,
            Some("DEAL_ENTRY_OUT" | "DEAL_ENTRY_OUT_BY" | "DEAL_ENTRY_INOUT") => Self::Exit,
            _ => Self::Unknown,
        }
    }

    pub const fn is_cash_adjustment(self) -> bool {
        matches!(self, Self::Balance | Self::Credit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DealSide {
    Buy,
    Sell,
}

impl DealSide {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    fn from_deal_type(deal_type: Option<&str>) -> Option<Self> {
        match deal_type {
            Some("DEAL_TYPE_BUY") => Some(Self::Buy),
            Some("DEAL_TYPE_SELL") => Some(Self::Sell),
            _ => None,
        }
    }
}

impl Display for DealSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DealSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            _ => Err(s.to_string()),
        }
    }
}

/// One execution record emitted by the remote terminal.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "WireDeal")]
pub struct DealEvent {
    pub id: String,
    pub position_id: Option<String>,
    pub symbol: Option<String>,
    pub role: DealRole,
    pub side: Option<DealSide>,
    pub time: DateTime<Utc>,
    pub price: f64,
    pub volume: f64,
    pub profit: f64,
    pub swap: f64,
    pub commission: f64,
}

impl DealEvent {
    /// Realized cash effect of this fill.
    pub fn net_profit(&self) -> f64 {
        self.profit + self.swap + self.commission
    }
}

/// Deal as the client API returns it. Ids arrive either as strings or as
/// numbers depending on the terminal platform.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDeal {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    position_id: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(rename = "type", default)]
    deal_type: Option<String>,
    #[serde(default)]
    entry_type: Option<String>,
    time: DateTime<Utc>,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    volume: f64,
    #[serde(default)]
    profit: f64,
    #[serde(default)]
    swap: f64,
    #[serde(default)]
    commission: f64,
}

impl From<WireDeal> for DealEvent {
    fn from(wire: WireDeal) -> Self {
        let role = DealRole::classify(wire.deal_type.as_deref(), wire.entry_type.as_deref());
        let side = DealSide::from_deal_type(wire.deal_type.as_deref());

        Self {
            id: wire.id,
            position_id: wire.position_id.filter(|id| !id.is_empty()),
            symbol: wire.symbol,
            role,
            side,
            time: wire.time,
            price: wire.price,
            volume: wire.volume,
            profit: wire.profit,
            swap: wire.swap,
            commission: wire.commission,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Unsigned(u64),
    Signed(i64),
}

impl From<StringOrNumber> for String {
    fn from(value: StringOrNumber) -> Self {
        match value {
            StringOrNumber::String(s) => s,
            StringOrNumber::Unsigned(n) => n.to_string(),
            StringOrNumber::Signed(n) => n.to_string(),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    StringOrNumber::deserialize(deserializer).map(String::from)
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<StringOrNumber>::deserialize(deserializer)?;
    Ok(value.map(String::from))
}
