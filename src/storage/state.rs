use chrono::NaiveDate;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

/// Daily risk counters persisted across restarts.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RiskDayState {
    pub daily_pnl: f64,
    pub current_exposure: f64,
}

/// Day-scoped risk state in Redis, keyed by `risk:{date}`.
///
/// A restart mid-day reloads today's P&L and exposure before trading begins,
/// so the daily-loss limit survives process bounces.
pub struct RedisRiskStore {
    conn: ConnectionManager,
}

impl RedisRiskStore {
    pub async fn new(client: redis::Client) -> anyhow::Result<Self> {
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn key(date: NaiveDate) -> String {
        format!("risk:{date}")
    }

    pub async fn save(&mut self, date: NaiveDate, state: &RiskDayState) -> anyhow::Result<()> {
        let key = Self::key(date);
        let val = serde_json::to_string(state)?;
        let _: () = self.conn.set(key, val).await?;
        Ok(())
    }

    pub async fn load(&mut self, date: NaiveDate) -> anyhow::Result<Option<RiskDayState>> {
        let key = Self::key(date);
        let v: Option<String> = self.conn.get(key).await?;
        match v {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&mut self, date: NaiveDate) -> anyhow::Result<()> {
        let key = Self::key(date);
        let _: () = self.conn.del(key).await?;
        Ok(())
    }
}
