use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::SqlitePool;
use tradesync_gateway::{DealEvent, DealRole, DealSide, Platform};

use crate::account::NewAccountLink;
use crate::credentials::tests::test_cipher;
use crate::reconcile::ReconstructedTrade;

/// Centralized test database setup.
/// Creates an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
}

/// Builder for account links stored with the test cipher.
pub struct LinkBuilder {
    link: NewAccountLink,
}

impl LinkBuilder {
    pub fn new(owner: &str) -> Self {
        Self {
            link: NewAccountLink {
                owner: owner.to_string(),
                login: "1234".to_string(),
                server: "Broker-Live".to_string(),
                platform: Platform::Mt5,
                encrypted_password: test_cipher().encrypt("secret").unwrap(),
            },
        }
    }

    #[must_use]
    pub fn with_login(mut self, login: &str) -> Self {
        self.link.login = login.to_string();
        self
    }

    #[must_use]
    pub fn with_encrypted_password(mut self, encrypted_password: &str) -> Self {
        self.link.encrypted_password = encrypted_password.to_string();
        self
    }

    pub async fn insert(self, pool: &SqlitePool) -> i64 {
        self.link.insert(pool).await.unwrap()
    }
}

/// Builder for raw deals; sides default to buy-in/sell-out.
pub struct DealBuilder {
    deal: DealEvent,
}

impl DealBuilder {
    pub fn new(
        id: &str,
        position_id: &str,
        symbol: &str,
        role: DealRole,
        price: f64,
        time: DateTime<Utc>,
    ) -> Self {
        let side = match role {
            DealRole::Entry => Some(DealSide::Buy),
            DealRole::Exit => Some(DealSide::Sell),
            DealRole::Balance | DealRole::Credit | DealRole::Unknown => None,
        };

        Self {
            deal: DealEvent {
                id: id.to_string(),
                position_id: Some(position_id.to_string()).filter(|p| !p.is_empty()),
                symbol: Some(symbol.to_string()),
                role,
                side,
                time,
                price,
                volume: 0.1,
                profit: 0.0,
                swap: 0.0,
                commission: 0.0,
            },
        }
    }

    pub fn entry(id: &str, position_id: &str, symbol: &str, price: f64, time: DateTime<Utc>) -> Self {
        Self::new(id, position_id, symbol, DealRole::Entry, price, time)
    }

    pub fn exit(id: &str, position_id: &str, symbol: &str, price: f64, time: DateTime<Utc>) -> Self {
        Self::new(id, position_id, symbol, DealRole::Exit, price, time)
    }

    pub fn balance(id: &str, amount: f64, time: DateTime<Utc>) -> Self {
        Self::new(id, "", "", DealRole::Balance, 0.0, time)
            .with_profit(amount)
            .without_symbol()
    }

    pub fn credit(id: &str, amount: f64, time: DateTime<Utc>) -> Self {
        Self::new(id, "", "", DealRole::Credit, 0.0, time)
            .with_profit(amount)
            .without_symbol()
    }

    #[must_use]
    pub fn with_profit(mut self, profit: f64) -> Self {
        self.deal.profit = profit;
        self
    }

    #[must_use]
    pub fn with_swap(mut self, swap: f64) -> Self {
        self.deal.swap = swap;
        self
    }

    #[must_use]
    pub fn with_commission(mut self, commission: f64) -> Self {
        self.deal.commission = commission;
        self
    }

    #[must_use]
    pub fn with_side(mut self, side: DealSide) -> Self {
        self.deal.side = Some(side);
        self
    }

    #[must_use]
    pub fn without_position(mut self) -> Self {
        self.deal.position_id = None;
        self
    }

    #[must_use]
    pub fn without_symbol(mut self) -> Self {
        self.deal.symbol = None;
        self
    }

    pub fn build(self) -> DealEvent {
        self.deal
    }
}

/// Builder for already-reconstructed ledger rows.
pub struct TradeBuilder {
    trade: ReconstructedTrade,
}

impl TradeBuilder {
    pub fn new(ticket: &str) -> Self {
        let entry_time = base_time();

        Self {
            trade: ReconstructedTrade {
                ticket: ticket.to_string(),
                pair: "EURUSD".to_string(),
                direction: Some(DealSide::Buy),
                entry_price: 1.1,
                exit_price: 1.105,
                pips: 50.0,
                profit_dollar: 50.0,
                entry_time,
                exit_time: entry_time + Duration::minutes(30),
                duration_minutes: Some(30),
                is_win: true,
                is_open: false,
            },
        }
    }

    #[must_use]
    pub fn with_minutes_offset(mut self, minutes: i64) -> Self {
        self.trade.entry_time += Duration::minutes(minutes);
        self.trade.exit_time += Duration::minutes(minutes);
        self
    }

    #[must_use]
    pub fn with_direction(mut self, direction: Option<DealSide>) -> Self {
        self.trade.direction = direction;
        self
    }

    #[must_use]
    pub fn open(mut self) -> Self {
        self.trade.is_open = true;
        self.trade.duration_minutes = None;
        self
    }

    pub fn build(self) -> ReconstructedTrade {
        self.trade
    }
}
