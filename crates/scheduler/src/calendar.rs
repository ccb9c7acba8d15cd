use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};

use drummond_core::{DrummondError, ExchangeCalendarPort, TradingSession};

/// Static weekday calendar: Monday through Friday with a fixed session,
/// closed on weekends. Stands in when no vendor calendar is wired.
pub struct WeekdayCalendar {
    open: NaiveTime,
    close: NaiveTime,
}

impl WeekdayCalendar {
    pub fn new(open: NaiveTime, close: NaiveTime) -> Self {
        Self { open, close }
    }

    /// US cash-session hours, 09:30-16:00 exchange-local.
    pub fn us_equities() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

#[async_trait]
impl ExchangeCalendarPort for WeekdayCalendar {
    async fn session(
        &self,
        _exchange: &str,
        date: NaiveDate,
    ) -> Result<TradingSession, DrummondError> {
        let trading = !matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
        if !trading {
            return Ok(TradingSession::closed());
        }
        Ok(TradingSession {
            is_trading_day: true,
            open: Some(self.open),
            close: Some(self.close),
            half_day: false,
        })
    }
}
