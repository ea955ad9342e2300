use std::fmt;

/// Categorical rating label, stored and served with the exact spellings
/// the dashboards expect ("Strong Buy", "Buy", ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Rating {
    StrongBuy,
    Buy,
    Neutral,
    Sell,
    StrongSell,
    Unknown,
}

impl Rating {
    /// Live mapping of the scanner's `Recommend.All` summary value.
    ///
    ///   v >= 0.5          -> Strong Buy
    ///   v >= 0.1          -> Buy
    ///   v > -0.1          -> Neutral
    ///   v > -0.5          -> Sell
    ///   otherwise         -> Strong Sell
    pub fn live(value: Option<f64>) -> Rating {
        let Some(v) = value.filter(|v| v.is_finite()) else {
            return Rating::Unknown;
        };
        if v >= 0.5 {
            Rating::StrongBuy
        } else if v >= 0.1 {
            Rating::Buy
        } else if v > -0.1 {
            Rating::Neutral
        } else if v > -0.5 {
            Rating::Sell
        } else {
            Rating::StrongSell
        }
    }

    /// Snapshot mapping used for end-of-day history and accuracy scoring.
    /// There is no Neutral band:
    ///
    ///   v >= 0.5          -> Strong Buy
    ///   0 <= v < 0.5      -> Buy
    ///   -0.5 < v < 0      -> Sell
    ///   v <= -0.5         -> Strong Sell
    pub fn snapshot(value: Option<f64>) -> Rating {
        let Some(v) = value.filter(|v| v.is_finite()) else {
            return Rating::Unknown;
        };
        if v >= 0.5 {
            Rating::StrongBuy
        } else if v >= 0.0 {
            Rating::Buy
        } else if v > -0.5 {
            Rating::Sell
        } else {
            Rating::StrongSell
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Rating::StrongBuy => "Strong Buy",
            Rating::Buy => "Buy",
            Rating::Neutral => "Neutral",
            Rating::Sell => "Sell",
            Rating::StrongSell => "Strong Sell",
            Rating::Unknown => "Unknown",
        }
    }

    /// Case-insensitive parse of a stored label. Anything unrecognized
    /// (including NULL rendered as "") comes back as Unknown.
    pub fn parse(label: &str) -> Rating {
        match label.to_lowercase().as_str() {
            "strong buy" => Rating::StrongBuy,
            "buy" => Rating::Buy,
            "neutral" => Rating::Neutral,
            "sell" => Rating::Sell,
            "strong sell" => Rating::StrongSell,
            _ => Rating::Unknown,
        }
    }

    pub fn is_buy_side(self) -> bool {
        matches!(self, Rating::Buy | Rating::StrongBuy)
    }

    pub fn is_sell_side(self) -> bool {
        matches!(self, Rating::Sell | Rating::StrongSell)
    }

    /// Ordinal used by the dashboard's accuracy view: Strong Buy = 5 down
    /// to Strong Sell = 1, unknown/empty = 0.
    pub fn score(self) -> i32 {
        match self {
            Rating::StrongBuy => 5,
            Rating::Buy => 4,
            Rating::Neutral => 3,
            Rating::Sell => 2,
            Rating::StrongSell => 1,
            Rating::Unknown => 0,
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
